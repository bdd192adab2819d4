use crate::protocol::DeviceDescriptor;

/// Widest digital sample the decoder can hold.
pub const MAX_DIGITAL_CHANNELS: usize = 32;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("Sample rate {0} Hz is not supported by the device")]
    UnsupportedSampleRate(u64),

    #[error("Sample count must be at least 1")]
    InvalidSampleCount,

    #[error("Channel list is empty; omit it to capture every channel")]
    NoChannelsRequested,

    #[error("Unknown channel '{0}'")]
    UnknownChannel(String),

    #[error("Channel '{0}' requested more than once")]
    DuplicateChannel(String),

    #[error("Digital pins must be continuous: '{disabled}' is disabled between enabled channels")]
    NonContiguousDigital { disabled: String },

    #[error("{0} digital channels requested, at most 32 supported")]
    TooManyDigitalChannels(usize),

    #[error("Analog samples of {0} bytes are not supported")]
    UnsupportedAnalogWidth(u8),

    #[error("No capture configured")]
    NotConfigured,
}

/// Permutation from wire bit position to output bit position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BitMapping {
    Identity,
    /// `targets[wire_bit]` is the output bit.
    Permutation(Vec<u8>),
}

impl BitMapping {
    pub fn apply(&self, wire_bits: u32) -> u32 {
        match self {
            BitMapping::Identity => wire_bits,
            BitMapping::Permutation(targets) => targets
                .iter()
                .enumerate()
                .filter(|(wire_bit, _)| wire_bits >> wire_bit & 1 == 1)
                .fold(0, |acc, (_, &target)| acc | 1 << target),
        }
    }

    pub fn is_identity(&self) -> bool {
        matches!(self, BitMapping::Identity)
    }
}

/// Channel selection for one acquisition, resolved against the device.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelConfiguration {
    /// Enable flag per analog device index.
    pub analog_enabled: Vec<bool>,
    /// Enable flag per digital device index.
    pub digital_enabled: Vec<bool>,
    /// Digital channel names in output bit order.
    pub digital_names: Vec<String>,
    /// Analog channel names in the order readings arrive.
    pub analog_names: Vec<String>,
    pub bit_mapping: BitMapping,
}

impl ChannelConfiguration {
    /// Resolve a channel list against the device.
    ///
    /// `None` selects every channel the device reports, in device order. An
    /// explicit list sets the output bit order of the digital channels.
    pub fn resolve(
        descriptor: &DeviceDescriptor,
        requested: Option<&[String]>,
    ) -> Result<Self, ConfigurationError> {
        let analog_all = descriptor.analog_channel_names();
        let digital_all = descriptor.digital_channel_names();

        let requested: Vec<String> = match requested {
            None => analog_all.iter().chain(digital_all.iter()).cloned().collect(),
            Some([]) => return Err(ConfigurationError::NoChannelsRequested),
            Some(list) => list.to_vec(),
        };

        let mut analog_enabled = vec![false; analog_all.len()];
        let mut digital_enabled = vec![false; digital_all.len()];
        let mut digital_order = Vec::new();

        for name in &requested {
            if let Some(index) = analog_all.iter().position(|n| n == name) {
                if analog_enabled[index] {
                    return Err(ConfigurationError::DuplicateChannel(name.clone()));
                }
                analog_enabled[index] = true;
            } else if let Some(index) = digital_all.iter().position(|n| n == name) {
                if digital_enabled[index] {
                    return Err(ConfigurationError::DuplicateChannel(name.clone()));
                }
                digital_enabled[index] = true;
                digital_order.push(index);
            } else {
                return Err(ConfigurationError::UnknownChannel(name.clone()));
            }
        }

        if digital_order.len() > MAX_DIGITAL_CHANNELS {
            return Err(ConfigurationError::TooManyDigitalChannels(
                digital_order.len(),
            ));
        }

        // The device packs enabled pins from the lowest one upwards, so any
        // hole in the selection would shift every bit above it.
        let first = digital_enabled.iter().position(|&e| e);
        let last = digital_enabled.iter().rposition(|&e| e);
        if let (Some(first), Some(last)) = (first, last) {
            if let Some(hole) = (first..=last).find(|&i| !digital_enabled[i]) {
                return Err(ConfigurationError::NonContiguousDigital {
                    disabled: digital_all[hole].clone(),
                });
            }
        }

        let bit_mapping = match first {
            Some(first) => {
                let targets: Vec<u8> = (0..digital_order.len())
                    .map(|wire_bit| {
                        let device_index = first + wire_bit;
                        digital_order
                            .iter()
                            .position(|&i| i == device_index)
                            .unwrap_or(wire_bit) as u8
                    })
                    .collect();
                if targets.iter().enumerate().all(|(w, &t)| w == t as usize) {
                    BitMapping::Identity
                } else {
                    BitMapping::Permutation(targets)
                }
            }
            None => BitMapping::Identity,
        };

        let digital_names = digital_order
            .iter()
            .map(|&i| digital_all[i].clone())
            .collect();
        let analog_names = analog_all
            .iter()
            .zip(&analog_enabled)
            .filter(|(_, enabled)| **enabled)
            .map(|(name, _)| name.clone())
            .collect();

        log::debug!(
            "Resolved channels: digital {:?}, analog {:?}, mapping {:?}",
            digital_names,
            analog_names,
            bit_mapping
        );

        Ok(Self {
            analog_enabled,
            digital_enabled,
            digital_names,
            analog_names,
            bit_mapping,
        })
    }

    pub fn digital_count(&self) -> usize {
        self.digital_names.len()
    }

    pub fn analog_count(&self) -> usize {
        self.analog_names.len()
    }

    /// Output bit carrying the named digital channel.
    pub fn bit_of(&self, name: &str) -> Option<u8> {
        self.digital_names
            .iter()
            .position(|n| n == name)
            .map(|bit| bit as u8)
    }
}
