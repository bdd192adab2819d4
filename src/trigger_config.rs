use crate::channel_config::{ChannelConfiguration, ConfigurationError};

/// What a single channel has to do for a condition to hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinCondition {
    High,
    Low,
    Rising,
    Falling,
    /// Any change.
    Edge,
    /// No change.
    Stable,
}

impl PinCondition {
    /// Edges never match the very first sample since there is nothing to
    /// compare against.
    pub fn matches(self, previous: Option<bool>, current: bool) -> bool {
        match (self, previous) {
            (PinCondition::High, _) => current,
            (PinCondition::Low, _) => !current,
            (PinCondition::Rising, Some(previous)) => !previous && current,
            (PinCondition::Falling, Some(previous)) => previous && !current,
            (PinCondition::Edge, Some(previous)) => previous != current,
            (PinCondition::Stable, Some(previous)) => previous == current,
            (_, None) => false,
        }
    }

    /// Whether an unchanged repeat of a sample with `level` satisfies this.
    pub fn matches_repeat(self, level: bool) -> bool {
        self.matches(Some(level), level)
    }
}

/// One alternative in a `wait` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerCondition {
    /// All listed output bits must satisfy their condition on the same
    /// sample. An empty list matches every sample.
    Pins(Vec<(u8, PinCondition)>),
    /// Satisfied once this many samples have gone by.
    Skip(u64),
}

fn bit_of(bits: u32, bit: u8) -> bool {
    bits.checked_shr(u32::from(bit)).unwrap_or(0) & 1 == 1
}

impl TriggerCondition {
    pub fn when() -> PinTriggerBuilder {
        PinTriggerBuilder::new()
    }

    pub fn skip(samples: u64) -> Self {
        TriggerCondition::Skip(samples)
    }

    pub fn skip_budget(&self) -> Option<u64> {
        match self {
            TriggerCondition::Skip(samples) => Some(*samples),
            TriggerCondition::Pins(_) => None,
        }
    }

    /// Evaluate pin conditions on a freshly decoded sample.
    pub fn matches(&self, previous: Option<u32>, current: u32) -> bool {
        match self {
            TriggerCondition::Pins(pins) => pins.iter().all(|&(bit, condition)| {
                condition.matches(previous.map(|p| bit_of(p, bit)), bit_of(current, bit))
            }),
            TriggerCondition::Skip(_) => false,
        }
    }

    /// Evaluate pin conditions on a repeat of `value`.
    pub fn matches_repeat(&self, value: u32) -> bool {
        match self {
            TriggerCondition::Pins(pins) => pins
                .iter()
                .all(|&(bit, condition)| condition.matches_repeat(bit_of(value, bit))),
            TriggerCondition::Skip(_) => false,
        }
    }
}

#[derive(Debug, Default)]
pub struct PinTriggerBuilder {
    pins: Vec<(u8, PinCondition)>,
}

impl PinTriggerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the condition for an output bit, replacing an earlier one.
    pub fn pin(mut self, bit: u8, condition: PinCondition) -> Self {
        self.pins.retain(|&(b, _)| b != bit);
        self.pins.push((bit, condition));
        self
    }

    /// Same as [`pin`](Self::pin) but addressed by channel name.
    pub fn channel(
        self,
        config: &ChannelConfiguration,
        name: &str,
        condition: PinCondition,
    ) -> Result<Self, ConfigurationError> {
        let bit = config
            .bit_of(name)
            .ok_or_else(|| ConfigurationError::UnknownChannel(name.to_string()))?;
        Ok(self.pin(bit, condition))
    }

    pub fn high(self, bit: u8) -> Self {
        self.pin(bit, PinCondition::High)
    }

    pub fn low(self, bit: u8) -> Self {
        self.pin(bit, PinCondition::Low)
    }

    pub fn rising(self, bit: u8) -> Self {
        self.pin(bit, PinCondition::Rising)
    }

    pub fn falling(self, bit: u8) -> Self {
        self.pin(bit, PinCondition::Falling)
    }

    pub fn edge(self, bit: u8) -> Self {
        self.pin(bit, PinCondition::Edge)
    }

    pub fn stable(self, bit: u8) -> Self {
        self.pin(bit, PinCondition::Stable)
    }

    pub fn build(self) -> TriggerCondition {
        TriggerCondition::Pins(self.pins)
    }
}
