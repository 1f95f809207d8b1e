//! Serial port link backed by the `serialport` crate.

use super::{LinkOpener, SerialLink};
use crate::config::SerialConfig;
use serialport::{ClearBuffer, SerialPort};
use std::io::{self, BufRead, BufReader, Read};
use std::time::Duration;
use tracing::debug;

/// Opens the configured serial port.
#[derive(Debug, Clone)]
pub struct SerialPortOpener {
    port_name: String,
    baud_rate: u32,
    timeout: Duration,
}

impl SerialPortOpener {
    /// Opener for `port_name` at `baud_rate`; reads block for at most `timeout`.
    pub fn new(port_name: impl Into<String>, baud_rate: u32, timeout: Duration) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            timeout,
        }
    }

    /// Opener for the `[serial]` section.
    pub fn from_config(config: &SerialConfig) -> Self {
        Self::new(config.port.clone(), config.baud_rate, config.timeout)
    }
}

impl LinkOpener for SerialPortOpener {
    type Link = SerialPortLink;

    fn open(&self) -> io::Result<SerialPortLink> {
        let port = serialport::new(&self.port_name, self.baud_rate)
            .timeout(self.timeout)
            .open()?;
        port.clear(ClearBuffer::Input)?;

        debug!(
            port = %self.port_name,
            baud = self.baud_rate,
            "serial port opened, input cleared"
        );
        Ok(SerialPortLink {
            lines: LineAssembler::new(port),
        })
    }

    fn describe(&self) -> String {
        format!("{} @ {} baud", self.port_name, self.baud_rate)
    }
}

/// An open serial port with line buffering.
pub struct SerialPortLink {
    lines: LineAssembler<Box<dyn SerialPort>>,
}

impl SerialLink for SerialPortLink {
    fn bytes_available(&mut self) -> io::Result<u32> {
        let buffered = u32::try_from(self.lines.buffered()).unwrap_or(u32::MAX);
        if buffered > 0 {
            return Ok(buffered);
        }
        Ok(self.lines.get_ref().bytes_to_read()?)
    }

    fn read_line(&mut self) -> io::Result<Vec<u8>> {
        self.lines.read_line()
    }
}

/// Reassembles `\n`-terminated lines across read timeouts.
///
/// Bytes received before a timeout are kept and completed by the next call,
/// so a stall mid-line never yields a truncated line.
struct LineAssembler<R> {
    reader: BufReader<R>,
    partial: Vec<u8>,
}

impl<R: Read> LineAssembler<R> {
    fn new(inner: R) -> Self {
        Self {
            reader: BufReader::new(inner),
            partial: Vec::new(),
        }
    }

    fn get_ref(&self) -> &R {
        self.reader.get_ref()
    }

    /// Bytes already read from the port but not yet returned.
    fn buffered(&self) -> usize {
        self.reader.buffer().len() + self.partial.len()
    }

    /// Next complete line, or an empty vec when the port timed out first.
    ///
    /// At end of stream any unterminated tail is returned once, then
    /// [`io::ErrorKind::UnexpectedEof`].
    fn read_line(&mut self) -> io::Result<Vec<u8>> {
        match self.reader.read_until(b'\n', &mut self.partial) {
            Ok(0) if self.partial.is_empty() => Err(io::Error::from(io::ErrorKind::UnexpectedEof)),
            Ok(_) => Ok(std::mem::take(&mut self.partial)),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                if !self.partial.is_empty() {
                    debug!(pending = self.partial.len(), "read timed out mid-line");
                }
                Ok(Vec::new())
            }
            Err(e) => Err(e),
        }
    }
}
