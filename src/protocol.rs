//! Identification and configuration exchange with the SRPICO firmware.
//!
//! Every configuration command is a newline-terminated ASCII line answered by
//! a single `*` byte. The identity reply is a fixed 17 byte record:
//!
//! ```text
//! SRPICO,A<aa><b>D<dd>,<vv>
//! ```

use crate::channel_config::{ChannelConfiguration, ConfigurationError};
use crate::serial_terminal::{PicoTerminal, TerminalError, Transport};

const IDENTITY_LEN: usize = 17;
const IDENTITY_PREFIX: &[u8] = b"SRPICO,A";
const ACK: u8 = b'*';
/// Protocol version that introduced the `b` board metadata command.
const BOARD_INFO_VERSION: u32 = 3;
/// One name per RP2040 GPIO.
pub const PIN_NAME_COUNT: usize = 30;
/// GPIO of the first digital channel.
pub const DIGITAL_PIN_OFFSET: usize = 2;
/// GPIO of the first analog channel.
pub const ANALOG_PIN_OFFSET: usize = 26;

const fn khz(v: u64) -> u64 {
    v * 1_000
}

const fn mhz_tenths(v: u64) -> u64 {
    v * 100_000
}

/// Sample rates in Hz the firmware accepts.
pub const SUPPORTED_SAMPLE_RATES: &[u64] = &[
    khz(5),
    khz(6),
    khz(8),
    khz(10),
    khz(20),
    khz(30),
    khz(40),
    khz(50),
    khz(60),
    khz(80),
    khz(100),
    khz(125),
    khz(150),
    khz(160),
    khz(200),
    khz(250),
    khz(300),
    khz(400),
    khz(500),
    khz(600),
    khz(800),
    mhz_tenths(10),
    mhz_tenths(12),
    mhz_tenths(15),
    mhz_tenths(20),
    mhz_tenths(24),
    mhz_tenths(30),
    mhz_tenths(40),
    mhz_tenths(50),
    mhz_tenths(60),
    mhz_tenths(80),
    mhz_tenths(100),
    mhz_tenths(150),
    mhz_tenths(200),
    mhz_tenths(300),
    mhz_tenths(400),
    mhz_tenths(600),
    mhz_tenths(800),
    mhz_tenths(1000),
    mhz_tenths(1200),
    mhz_tenths(1500),
    mhz_tenths(2000),
    mhz_tenths(2400),
];

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Serial terminal error: {0}")]
    Terminal(#[from] TerminalError),

    #[error("Device did not identify as SRPICO: {0:?}")]
    UnexpectedIdentity(String),

    #[error("Malformed identity record {0:?}")]
    MalformedIdentity(String),

    #[error("Command {command:?} answered with 0x{got:02x} instead of '*'")]
    UnexpectedAck { command: String, got: u8 },

    #[error("Expected 30 pin names, got {0}")]
    PinNameCount(usize),
}

/// What the device reported about itself during [`identify`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub analog_channels: u8,
    pub analog_bytes: u8,
    pub digital_channels: u8,
    pub version: u32,
    pub board_name: Option<String>,
    /// Indexed by GPIO; an empty entry means the firmware did not name it.
    pub pin_names: Vec<String>,
}

impl DeviceDescriptor {
    pub fn new(analog_channels: u8, analog_bytes: u8, digital_channels: u8, version: u32) -> Self {
        Self {
            analog_channels,
            analog_bytes,
            digital_channels,
            version,
            board_name: None,
            pin_names: Vec::new(),
        }
    }

    fn pin_name(&self, gpio: usize) -> Option<&str> {
        self.pin_names
            .get(gpio)
            .map(String::as_str)
            .filter(|name| !name.is_empty())
    }

    /// Names of the digital channels in device index order.
    pub fn digital_channel_names(&self) -> Vec<String> {
        (0..self.digital_channels as usize)
            .map(|i| {
                let gpio = i + DIGITAL_PIN_OFFSET;
                self.pin_name(gpio)
                    .map_or_else(|| format!("D{}", gpio), str::to_string)
            })
            .collect()
    }

    /// Names of the analog channels in device index order.
    pub fn analog_channel_names(&self) -> Vec<String> {
        (0..self.analog_channels as usize)
            .map(|n| {
                self.pin_name(n + ANALOG_PIN_OFFSET)
                    .map_or_else(|| format!("A{}", n), str::to_string)
            })
            .collect()
    }

    fn parse_identity(info: &[u8]) -> Result<Self, ProtocolError> {
        let text = String::from_utf8_lossy(info).into_owned();
        if !info.starts_with(IDENTITY_PREFIX) {
            return Err(ProtocolError::UnexpectedIdentity(text));
        }

        let malformed = || ProtocolError::MalformedIdentity(text.clone());
        let fields: Vec<&str> = text.trim().split(',').collect();
        let [_, channel_info, version] = fields[..] else {
            return Err(malformed());
        };

        // A<aa><b>D<dd>
        if !channel_info.is_ascii()
            || channel_info.len() != 7
            || channel_info.as_bytes()[4] != b'D'
        {
            return Err(malformed());
        }
        let number = |range: std::ops::Range<usize>| -> Result<u8, ProtocolError> {
            channel_info[range].parse().map_err(|_| malformed())
        };
        let analog_channels = number(1..3)?;
        let analog_bytes = number(3..4)?;
        let digital_channels = number(5..7)?;
        let version = version.trim().parse().map_err(|_| malformed())?;

        Ok(Self::new(
            analog_channels,
            analog_bytes,
            digital_channels,
            version,
        ))
    }
}

/// Wake the device and read back its identity and, on newer firmware, its
/// board and pin names.
pub fn identify<T: Transport>(
    terminal: &mut PicoTerminal<T>,
) -> Result<DeviceDescriptor, ProtocolError> {
    terminal.reset_input()?;
    terminal.write_raw(b"*")?;
    terminal.reset_input()?;

    log::debug!("Requesting identity");
    terminal.command("i")?;
    let info = terminal.read_exact(IDENTITY_LEN)?;
    let mut descriptor = DeviceDescriptor::parse_identity(&info)?;
    log::debug!(
        "Device reports {} analog ({} byte), {} digital channels, protocol v{}",
        descriptor.analog_channels,
        descriptor.analog_bytes,
        descriptor.digital_channels,
        descriptor.version
    );

    if descriptor.version >= BOARD_INFO_VERSION {
        terminal.command("b")?;
        let board_name = terminal.read_line()?;
        let pin_names: Vec<String> = terminal
            .read_line()?
            .split(',')
            .map(|name| name.trim().to_string())
            .collect();
        if pin_names.len() != PIN_NAME_COUNT {
            return Err(ProtocolError::PinNameCount(pin_names.len()));
        }
        log::debug!("Board: {}", board_name);
        descriptor.board_name = Some(board_name);
        descriptor.pin_names = pin_names;
    }

    Ok(descriptor)
}

/// Send a command and require the single-byte acknowledgment.
pub fn send_w_ack<T: Transport>(
    terminal: &mut PicoTerminal<T>,
    command: &str,
) -> Result<(), ProtocolError> {
    terminal.command(command)?;
    let got = terminal.read_byte()?;
    if got != ACK {
        return Err(ProtocolError::UnexpectedAck {
            command: command.to_string(),
            got,
        });
    }
    Ok(())
}

/// Checks that must pass before any configuration byte goes out.
pub fn validate_capture(
    descriptor: &DeviceDescriptor,
    config: &ChannelConfiguration,
    sample_count: u32,
    sample_rate: u64,
) -> Result<(), ConfigurationError> {
    if !SUPPORTED_SAMPLE_RATES.contains(&sample_rate) {
        return Err(ConfigurationError::UnsupportedSampleRate(sample_rate));
    }
    if sample_count == 0 {
        return Err(ConfigurationError::InvalidSampleCount);
    }
    if config.analog_count() > 0 && descriptor.analog_bytes != 1 {
        return Err(ConfigurationError::UnsupportedAnalogWidth(
            descriptor.analog_bytes,
        ));
    }
    Ok(())
}

/// Program pin enables, sample count and sample rate.
///
/// Callers run [`validate_capture`] first.
pub fn program<T: Transport>(
    terminal: &mut PicoTerminal<T>,
    config: &ChannelConfiguration,
    sample_count: u32,
    sample_rate: u64,
) -> Result<(), ProtocolError> {
    for (i, &enabled) in config.analog_enabled.iter().enumerate() {
        send_w_ack(terminal, &format!("A{}{:02}", u8::from(enabled), i))?;
    }
    for (i, &enabled) in config.digital_enabled.iter().enumerate() {
        send_w_ack(terminal, &format!("D{}{:02}", u8::from(enabled), i))?;
    }

    send_w_ack(terminal, &format!("L{}", sample_count))?;

    let command = format!("R{}", sample_rate);
    terminal.command(&command)?;
    let got = terminal.read_byte()?;
    if got != ACK {
        return Err(ProtocolError::UnexpectedAck { command, got });
    }
    let warning = terminal.drain_available()?;
    if !warning.is_empty() {
        log::warn!(
            "Device warning after sample rate: {}",
            String::from_utf8_lossy(&warning).trim()
        );
    }

    Ok(())
}
