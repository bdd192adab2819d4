use serialport::SerialPort;
use std::io::{self, Read, Write};
use std::time::Instant;

/// Number of port timeouts tolerated while waiting for a fixed-size reply.
const READ_RETRIES: u32 = 10;

#[derive(Debug, thiserror::Error)]
pub enum TerminalError {
    #[error("Serial port error: {0}")]
    SerialPort(#[from] serialport::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Timeout error: expected {expected} bytes but got {received}")]
    Timeout { expected: usize, received: usize },

    #[error("UTF-8 conversion error: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// Duplex byte stream the analyzer talks through.
///
/// Implemented for real serial ports; tests substitute an in-memory script.
pub trait Transport {
    fn send(&mut self, data: &[u8]) -> Result<(), TerminalError>;

    /// Blocks until `buf` is completely filled.
    fn receive_exact(&mut self, buf: &mut [u8]) -> Result<(), TerminalError>;

    /// Number of bytes that can be read right now without blocking.
    fn bytes_available(&mut self) -> Result<usize, TerminalError>;

    /// Drop whatever is sitting in the input buffer.
    fn clear_input(&mut self) -> Result<(), TerminalError>;
}

impl Transport for Box<dyn SerialPort> {
    fn send(&mut self, data: &[u8]) -> Result<(), TerminalError> {
        Write::write_all(self, data)?;
        Write::flush(self)?;
        Ok(())
    }

    fn receive_exact(&mut self, buf: &mut [u8]) -> Result<(), TerminalError> {
        let limit = SerialPort::timeout(self.as_ref()) * READ_RETRIES;
        let started = Instant::now();
        let mut filled = 0;

        while filled < buf.len() {
            match Read::read(self, &mut buf[filled..]) {
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::TimedOut => {}
                Err(e) => return Err(e.into()),
            }
            if filled < buf.len() && started.elapsed() >= limit {
                return Err(TerminalError::Timeout {
                    expected: buf.len(),
                    received: filled,
                });
            }
        }
        Ok(())
    }

    fn bytes_available(&mut self) -> Result<usize, TerminalError> {
        Ok(SerialPort::bytes_to_read(self.as_ref())? as usize)
    }

    fn clear_input(&mut self) -> Result<(), TerminalError> {
        SerialPort::clear(self.as_ref(), serialport::ClearBuffer::Input)?;
        Ok(())
    }
}

/// Line and byte oriented helpers on top of a [`Transport`].
#[derive(Debug)]
pub struct PicoTerminal<T: Transport> {
    transport: T,
}

impl<T: Transport> PicoTerminal<T> {
    pub fn new(transport: T) -> Self {
        Self { transport }
    }

    /// Send a command followed by the newline terminator.
    pub fn command(&mut self, command: &str) -> Result<(), TerminalError> {
        log::trace!("-> {}", command);
        let command_with_newline = format!("{}\n", command);
        self.transport.send(command_with_newline.as_bytes())
    }

    pub fn write_raw(&mut self, data: &[u8]) -> Result<(), TerminalError> {
        self.transport.send(data)
    }

    pub fn read_exact(&mut self, len: usize) -> Result<Vec<u8>, TerminalError> {
        let mut response = vec![0u8; len];
        self.transport.receive_exact(&mut response)?;
        Ok(response)
    }

    pub fn read_byte(&mut self) -> Result<u8, TerminalError> {
        let mut byte = [0u8; 1];
        self.transport.receive_exact(&mut byte)?;
        Ok(byte[0])
    }

    /// Read up to and including `\n`, returning the line without its terminator.
    pub fn read_line(&mut self) -> Result<String, TerminalError> {
        let mut response = Vec::new();
        loop {
            match self.read_byte()? {
                b'\n' => break,
                byte => response.push(byte),
            }
        }
        let line = String::from_utf8(response)?;
        Ok(line.trim_end_matches('\r').to_string())
    }

    /// Take everything currently buffered without waiting for more.
    pub fn drain_available(&mut self) -> Result<Vec<u8>, TerminalError> {
        let available = self.transport.bytes_available()?;
        if available == 0 {
            return Ok(Vec::new());
        }
        self.read_exact(available)
    }

    pub fn bytes_available(&mut self) -> Result<usize, TerminalError> {
        self.transport.bytes_available()
    }

    pub fn reset_input(&mut self) -> Result<(), TerminalError> {
        self.transport.clear_input()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn into_inner(self) -> T {
        self.transport
    }
}
