//! Line-oriented transport
//!
//! The device session only needs two primitives: write some bytes and read
//! one terminated line with a timeout. Pausing releases the underlying port,
//! e.g. while a firmware upload owns it.

use serialport::SerialPort;
use std::io::{self, Read, Write};
use std::time::{Duration, Instant};

use super::serial::open_port;
use super::ProtocolError;

/// Line terminator ending every device reply
pub const LINE_TERMINATOR: u8 = b'\n';

/// Abstraction over the link to the rig controller
pub trait Transport: Send {
    /// Write bytes to the device
    fn write(&mut self, data: &[u8]) -> io::Result<()>;

    /// Read one line including its terminator, or `None` on timeout
    fn read_line(&mut self, timeout: Duration) -> io::Result<Option<String>>;

    /// Release the underlying port
    fn pause(&mut self) -> io::Result<()> {
        Ok(())
    }

    /// Reacquire the underlying port after [`Transport::pause`]
    fn resume(&mut self) -> io::Result<()> {
        Ok(())
    }

    /// Name of the underlying port
    fn port_name(&self) -> &str;
}

/// Serial port transport
pub struct SerialTransport {
    port: Option<Box<dyn SerialPort>>,
    name: String,
    baud_rate: u32,
    timeout: Duration,
    pending: Vec<u8>,
}

impl SerialTransport {
    /// Open `name` at `baud_rate`
    pub fn open(name: &str, baud_rate: u32, timeout: Duration) -> Result<Self, ProtocolError> {
        let port = open_port(name, baud_rate, timeout)?;
        Ok(Self {
            port: Some(port),
            name: name.to_string(),
            baud_rate,
            timeout,
            pending: Vec::new(),
        })
    }

    fn port(&mut self) -> io::Result<&mut Box<dyn SerialPort>> {
        self.port.as_mut().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotConnected, "serial port is paused")
        })
    }

    fn take_line(&mut self) -> Option<String> {
        let end = self.pending.iter().position(|b| *b == LINE_TERMINATOR)?;
        let line: Vec<u8> = self.pending.drain(..=end).collect();
        Some(String::from_utf8_lossy(&line).into_owned())
    }
}

impl Transport for SerialTransport {
    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        let port = self.port()?;
        port.write_all(data)?;
        port.flush()
    }

    fn read_line(&mut self, timeout: Duration) -> io::Result<Option<String>> {
        if let Some(line) = self.take_line() {
            return Ok(Some(line));
        }

        let deadline = Instant::now() + timeout;
        let mut buf = [0u8; 256];
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                // A partial line would misalign the next reply
                self.pending.clear();
                return Ok(None);
            }

            let port = self.port()?;
            port.set_timeout(remaining)?;
            match port.read(&mut buf) {
                Ok(n) => {
                    self.pending.extend_from_slice(&buf[..n]);
                    if let Some(line) = self.take_line() {
                        return Ok(Some(line));
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::TimedOut => {}
                Err(e) => return Err(e),
            }
        }
    }

    fn pause(&mut self) -> io::Result<()> {
        self.port = None;
        self.pending.clear();
        Ok(())
    }

    fn resume(&mut self) -> io::Result<()> {
        if self.port.is_none() {
            let port = open_port(&self.name, self.baud_rate, self.timeout)
                .map_err(|e| io::Error::new(io::ErrorKind::NotConnected, e.to_string()))?;
            self.port = Some(port);
        }
        Ok(())
    }

    fn port_name(&self) -> &str {
        &self.name
    }
}
