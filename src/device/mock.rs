//! Scripted link for tests and dry runs.
//!
//! Each call to [`LinkOpener::open`] consumes the next scripted session: either
//! an open failure or a sequence of [`Step`]s the link plays back. A link with
//! no steps left stays idle. Once every session is used up, further opens fail.

use super::{LinkOpener, SerialLink};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io;
use std::sync::Arc;

/// One scripted link event.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    /// A line becomes available.
    Line(Vec<u8>),
    /// One poll finds nothing waiting.
    Idle,
    /// The next link call fails.
    Fail(io::ErrorKind),
    /// The stream ends mid-read.
    Eof,
}

impl Step {
    /// A [`Step::Line`] from text or bytes.
    pub fn line(text: impl Into<Vec<u8>>) -> Self {
        Step::Line(text.into())
    }
}

#[derive(Debug, Default)]
struct Script {
    sessions: VecDeque<Option<VecDeque<Step>>>,
    opens: usize,
}

/// Opener replaying scripted sessions. Clones share the same script.
#[derive(Debug, Clone, Default)]
pub struct ScriptedOpener {
    script: Arc<Mutex<Script>>,
}

impl ScriptedOpener {
    /// An opener with no sessions; every open fails.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a session that yields these lines, then idles.
    pub fn session<I, L>(self, lines: I) -> Self
    where
        I: IntoIterator<Item = L>,
        L: Into<Vec<u8>>,
    {
        self.steps(lines.into_iter().map(Step::line).collect())
    }

    /// Add a session that plays these steps, then idles.
    pub fn steps(self, steps: Vec<Step>) -> Self {
        self.script.lock().sessions.push_back(Some(steps.into()));
        self
    }

    /// Add an open attempt that fails.
    pub fn fail_open(self) -> Self {
        self.script.lock().sessions.push_back(None);
        self
    }

    /// Open attempts so far, failed ones included.
    pub fn opens(&self) -> usize {
        self.script.lock().opens
    }
}

impl LinkOpener for ScriptedOpener {
    type Link = ScriptedLink;

    fn open(&self) -> io::Result<ScriptedLink> {
        let mut script = self.script.lock();
        script.opens += 1;
        match script.sessions.pop_front() {
            Some(Some(steps)) => Ok(ScriptedLink { steps }),
            Some(None) => Err(io::Error::new(io::ErrorKind::NotFound, "scripted open failure")),
            None => Err(io::Error::new(io::ErrorKind::NotFound, "script exhausted")),
        }
    }

    fn describe(&self) -> String {
        "scripted".to_string()
    }
}

/// Link playing back one scripted session.
#[derive(Debug)]
pub struct ScriptedLink {
    steps: VecDeque<Step>,
}

impl SerialLink for ScriptedLink {
    fn bytes_available(&mut self) -> io::Result<u32> {
        match self.steps.front() {
            None => Ok(0),
            Some(Step::Idle) => {
                self.steps.pop_front();
                Ok(0)
            }
            Some(Step::Fail(kind)) => {
                let kind = *kind;
                self.steps.pop_front();
                Err(io::Error::new(kind, "scripted link failure"))
            }
            Some(Step::Line(bytes)) => Ok(u32::try_from(bytes.len()).unwrap_or(u32::MAX)),
            Some(Step::Eof) => Ok(1),
        }
    }

    fn read_line(&mut self) -> io::Result<Vec<u8>> {
        match self.steps.pop_front() {
            Some(Step::Line(bytes)) => Ok(bytes),
            Some(Step::Eof) => Err(io::Error::from(io::ErrorKind::UnexpectedEof)),
            Some(Step::Fail(kind)) => Err(io::Error::new(kind, "scripted link failure")),
            Some(Step::Idle) | None => Ok(Vec::new()),
        }
    }
}
