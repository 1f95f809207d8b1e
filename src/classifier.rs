//! Quality classification of decoded readings.
//!
//! A [`Classifier`] maps the four channel values of a reading onto a label
//! such as `"acceptable"`, `"bad"` or `"spoiled"`. Classification is optional:
//! with `kind = "none"` no classifier is built and predictions are absent.
//!
//! The bundled implementation, [`RangeClassifier`], walks an ordered list of
//! inclusive channel ranges and returns the label of the first rule that
//! matches every bound it sets.

use crate::config::{ClassifierConfig, ClassifierKind, RangeRule};
use crate::error::{AppResult, DaqError};
use crate::reading::Reading;
use std::sync::Arc;

/// Labels a reading from its channel values.
pub trait Classifier: Send + Sync {
    /// Label for one sample, given in `[ta, temp, ph, cond]` order.
    fn classify(&self, ta: f64, temp: f64, ph: f64, cond: f64) -> Result<String, DaqError>;

    /// Name used in logs and the status endpoint.
    fn name(&self) -> &str;

    /// Classify a decoded reading.
    fn classify_reading(&self, reading: &Reading) -> Result<String, DaqError> {
        let [ta, temp, ph, cond] = reading.channels();
        self.classify(ta, temp, ph, cond)
    }
}

/// Shared classifier handle.
pub type SharedClassifier = Arc<dyn Classifier>;

/// Build the configured classifier, if any.
pub fn from_config(config: &ClassifierConfig) -> AppResult<Option<SharedClassifier>> {
    validate_config(config)?;
    match config.kind {
        ClassifierKind::None => Ok(None),
        ClassifierKind::Range => Ok(Some(Arc::new(RangeClassifier::new(
            config.rules.clone(),
            config.default_label.clone(),
        )))),
    }
}

/// Check rule bounds and labels.
pub fn validate_config(config: &ClassifierConfig) -> AppResult<()> {
    if config.kind == ClassifierKind::None {
        return Ok(());
    }
    if config.rules.is_empty() {
        return Err(DaqError::Configuration(
            "classifier.kind = \"range\" requires at least one rule".to_string(),
        ));
    }
    if config.default_label.trim().is_empty() {
        return Err(DaqError::Configuration(
            "classifier.default_label must not be empty".to_string(),
        ));
    }

    for (index, rule) in config.rules.iter().enumerate() {
        if rule.label.trim().is_empty() {
            return Err(DaqError::Configuration(format!(
                "classifier rule #{index} has no label"
            )));
        }
        for (channel, bounds) in rule_bounds(rule) {
            if let Some([min, max]) = bounds {
                if !(min.is_finite() && max.is_finite()) || min > max {
                    return Err(DaqError::Configuration(format!(
                        "classifier rule '{}' has invalid {channel} range [{min}, {max}]",
                        rule.label
                    )));
                }
            }
        }
    }
    Ok(())
}

fn rule_bounds(rule: &RangeRule) -> [(&'static str, Option<[f64; 2]>); 4] {
    [
        ("ta", rule.ta),
        ("temp", rule.temp),
        ("ph", rule.ph),
        ("cond", rule.cond),
    ]
}

/// Ordered, first-match range rules with a fallback label.
#[derive(Debug, Clone)]
pub struct RangeClassifier {
    rules: Vec<RangeRule>,
    default_label: String,
}

impl RangeClassifier {
    /// Rules are tried in order; `default_label` applies when none matches.
    pub fn new(rules: Vec<RangeRule>, default_label: impl Into<String>) -> Self {
        Self {
            rules,
            default_label: default_label.into(),
        }
    }

    fn matches(rule: &RangeRule, values: [f64; 4]) -> bool {
        rule_bounds(rule)
            .iter()
            .zip(values)
            .all(|((_, bounds), value)| match bounds {
                Some([min, max]) => (*min..=*max).contains(&value),
                None => true,
            })
    }
}

impl Classifier for RangeClassifier {
    fn classify(&self, ta: f64, temp: f64, ph: f64, cond: f64) -> Result<String, DaqError> {
        let values = [ta, temp, ph, cond];
        if values.iter().any(|v| !v.is_finite()) {
            return Err(DaqError::Classifier(format!(
                "non-finite input {values:?}"
            )));
        }

        let label = self
            .rules
            .iter()
            .find(|rule| Self::matches(rule, values))
            .map_or(&self.default_label, |rule| &rule.label);
        Ok(label.clone())
    }

    fn name(&self) -> &str {
        "range"
    }
}
