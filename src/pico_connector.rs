use crate::pico_analyzer::{PicoAnalyzer, PicoError};
use crate::protocol::{identify, DeviceDescriptor, ProtocolError};
use crate::serial_terminal::{PicoTerminal, TerminalError, Transport};
use serialport::SerialPort;
use std::thread;
use std::time::Duration;

/// Serial and retry settings used when opening an analyzer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectOptions {
    pub baud_rate: u32,
    /// Per-read port timeout. Fixed-size replies may take up to ten of these.
    pub timeout: Duration,
    pub identify_attempts: u32,
    /// Pause before identifying again after a timeout.
    pub retry_delay: Duration,
    /// Abort streaming after this long without data. `None` waits forever.
    pub capture_idle_timeout: Option<Duration>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            baud_rate: 115_200,
            timeout: Duration::from_millis(100),
            identify_attempts: 3,
            retry_delay: Duration::from_millis(500),
            capture_idle_timeout: None,
        }
    }
}

pub struct PicoConnector;

impl PicoConnector {
    /// Open `port` and identify the analyzer behind it.
    pub fn connect(
        port: &str,
        options: &ConnectOptions,
    ) -> Result<PicoAnalyzer<Box<dyn SerialPort>>, PicoError> {
        log::debug!("Connecting to SRPICO on port {}", port);
        let serial = serialport::new(port, options.baud_rate)
            .timeout(options.timeout)
            .open()
            .map_err(TerminalError::from)?;

        let mut terminal = PicoTerminal::new(serial);
        let descriptor = Self::identify_with_retry(&mut terminal, options)?;
        let mut analyzer = PicoAnalyzer::from_parts(terminal, descriptor);
        analyzer.set_idle_timeout(options.capture_idle_timeout);
        Ok(analyzer)
    }

    /// Identify, resyncing after every timeout until the attempts run out.
    fn identify_with_retry<T: Transport>(
        terminal: &mut PicoTerminal<T>,
        options: &ConnectOptions,
    ) -> Result<DeviceDescriptor, ProtocolError> {
        let mut attempt = 1;
        loop {
            match identify(terminal) {
                Ok(descriptor) => break Ok(descriptor),
                Err(ProtocolError::Terminal(TerminalError::Timeout { .. }))
                    if attempt < options.identify_attempts =>
                {
                    log::debug!(
                        "Timeout during identify (attempt {}), sending resync and retrying",
                        attempt
                    );
                    if let Err(e) = terminal.write_raw(b"*") {
                        log::debug!("Resync write failed: {}", e);
                    }
                    thread::sleep(options.retry_delay);
                    attempt += 1;
                }
                Err(e) => break Err(e),
            }
        }
    }
}
