//! Record timestamps
//!
//! Every committed record carries a timestamp and the mode it was produced
//! in (the 4-bit `timeconfig` field of the record ID). The engine only
//! requires timestamps to be non-decreasing within a bank; where they come
//! from is the job of a [`TimestampSource`].

/// How record timestamps are produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum TimestampMode {
    /// No timestamp configured
    #[default]
    Unset = 0,
    /// Monotonic commit counter
    BasicCount = 1,
    /// Seconds from a real-time clock
    RealTime = 2,
}

impl TimestampMode {
    /// Get the mode as its `timeconfig` bits
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Decode `timeconfig` bits
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(TimestampMode::Unset),
            1 => Some(TimestampMode::BasicCount),
            2 => Some(TimestampMode::RealTime),
            _ => None,
        }
    }
}

/// Timestamp state recovered from, or assigned to, a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TimestampConfig {
    /// Mode the timestamp was produced in
    pub mode: TimestampMode,
    /// Timestamp value
    pub value: u32,
}

/// Source of record timestamps
pub trait TimestampSource {
    /// Mode this source produces
    fn mode(&self) -> TimestampMode;

    /// Timestamp for the first record of an empty bank
    fn seed(&mut self) -> TimestampConfig;

    /// Timestamp following `current`, the newest one in the bank
    fn advance(&mut self, current: TimestampConfig) -> TimestampConfig;
}

/// Commit counter: 0 for the first record, +1 per commit
#[derive(Debug, Clone, Copy, Default)]
pub struct BasicCounter;

impl TimestampSource for BasicCounter {
    fn mode(&self) -> TimestampMode {
        TimestampMode::BasicCount
    }

    fn seed(&mut self) -> TimestampConfig {
        TimestampConfig {
            mode: TimestampMode::BasicCount,
            value: 0,
        }
    }

    fn advance(&mut self, current: TimestampConfig) -> TimestampConfig {
        TimestampConfig {
            mode: TimestampMode::BasicCount,
            value: current.value.wrapping_add(1),
        }
    }
}

/// Real-time clock source
///
/// Reads seconds from `now`. If the clock stalls or steps backwards, the
/// timestamp is bumped past the newest one in the bank so history ordering
/// still holds.
pub struct RealTimeClock<C> {
    now: C,
}

impl<C: FnMut() -> u32> RealTimeClock<C> {
    /// Create a source reading seconds from `now`
    pub fn new(now: C) -> Self {
        Self { now }
    }
}

impl<C: FnMut() -> u32> TimestampSource for RealTimeClock<C> {
    fn mode(&self) -> TimestampMode {
        TimestampMode::RealTime
    }

    fn seed(&mut self) -> TimestampConfig {
        TimestampConfig {
            mode: TimestampMode::RealTime,
            value: (self.now)(),
        }
    }

    fn advance(&mut self, current: TimestampConfig) -> TimestampConfig {
        let now = (self.now)();
        TimestampConfig {
            mode: TimestampMode::RealTime,
            value: now.max(current.value.saturating_add(1)),
        }
    }
}
