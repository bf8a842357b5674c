//! Link configuration
//!
//! All of the protocol timing constants live here rather than being
//! hard-coded, so they can be tuned to match the bus. Bit-time values are
//! counted in bit periods of the configured [Speed].

use embassy_time::Duration;

/// Default number of bit times of idle line required after any activity
/// before a node may consider the bus for sending (the "CD backoff").
pub const CD_BACKOFF_BITS: u8 = 20;

/// Number of bit times the line is held in the BREAK state after a
/// collision is detected.
pub const BREAK_BITS: u8 = 15;

/// Default maximum number of attempts to send a single frame
pub const MAX_ATTEMPTS: u8 = 25;

/// Default time to wait for the reply to a request
pub const REPLY_TIMEOUT: Duration = Duration::from_millis(500);

/// Default period of the "no carrier" notification
pub const CARRIER_LOSS_PERIOD: Duration = Duration::from_secs(5);

/// Bit rate selection.
///
/// The engine is ticked at a fixed rate, and samples each bit several
/// times. With the classic 15us tick, [Speed::Standard] gives the 60us
/// LocoNet bit time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
pub enum Speed {
    /// Four ticks per bit
    #[default]
    Standard,
    /// Two ticks per bit
    High,
}

impl Speed {
    /// Number of calls to `tick()` per bit on the line
    #[inline]
    pub const fn ticks_per_bit(&self) -> u8 {
        match self {
            Speed::Standard => 4,
            Speed::High => 2,
        }
    }
}

/// Priority class of an outgoing frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
pub enum Priority {
    /// Regular traffic
    #[default]
    Normal,
    /// Master or otherwise urgent traffic, waits a shorter time after
    /// the bus goes idle, and so tends to win arbitration.
    High,
}

/// Backoff durations, in bit times.
///
/// The bus is "busy" for `cd_backoff` bit times after any activity. A
/// sender then waits an additional delay depending on the situation:
///
/// * `priority_delay` for [Priority::High] frames
/// * `normal_delay` for [Priority::Normal] frames
/// * `collision_delay`, plus a random `0..=collision_jitter`, after a
///   collision or a BREAK has been seen on the line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BackoffTiers {
    /// Minimum inter-frame gap
    pub cd_backoff: u8,
    /// Extra delay for high priority frames
    pub priority_delay: u8,
    /// Extra delay for normal frames
    pub normal_delay: u8,
    /// Extra delay after a collision
    pub collision_delay: u8,
    /// Upper bound of the random part of the collision delay
    pub collision_jitter: u8,
}

impl Default for BackoffTiers {
    fn default() -> Self {
        Self {
            cd_backoff: CD_BACKOFF_BITS,
            priority_delay: 0,
            normal_delay: 6,
            collision_delay: 12,
            collision_jitter: 20,
        }
    }
}

/// Configuration of a single bus
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Config {
    /// Invert the logic level of the line, for both sending and receiving.
    ///
    /// Most LocoNet interface circuits invert, so this defaults to `true`.
    pub invert: bool,
    /// Bit rate
    pub speed: Speed,
    /// Arbitration delays
    pub backoff: BackoffTiers,
    /// How many times a frame is attempted before being dropped
    pub max_attempts: u8,
    /// Length of the BREAK sent after a collision, in bit times
    pub break_bits: u8,
    /// How long to wait for the reply to a request, in microseconds
    pub reply_timeout_us: u32,
    /// How long the bus may be silent before a carrier loss is
    /// reported, and how often it is repeated, in microseconds
    pub carrier_loss_us: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            invert: true,
            speed: Speed::Standard,
            backoff: BackoffTiers::default(),
            max_attempts: MAX_ATTEMPTS,
            break_bits: BREAK_BITS,
            reply_timeout_us: REPLY_TIMEOUT.as_micros() as u32,
            carrier_loss_us: CARRIER_LOSS_PERIOD.as_micros() as u32,
        }
    }
}

impl Config {
    /// The reply timeout as a [Duration]
    #[inline]
    pub fn reply_timeout(&self) -> Duration {
        Duration::from_micros(self.reply_timeout_us as u64)
    }

    /// The carrier loss period as a [Duration]
    #[inline]
    pub fn carrier_loss_period(&self) -> Duration {
        Duration::from_micros(self.carrier_loss_us as u64)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = Config::default();
        assert!(cfg.invert);
        assert_eq!(cfg.speed.ticks_per_bit(), 4);
        assert_eq!(cfg.reply_timeout(), Duration::from_millis(500));
        assert_eq!(cfg.carrier_loss_period(), Duration::from_secs(5));
        assert!(cfg.backoff.priority_delay < cfg.backoff.normal_delay);
        assert!(cfg.backoff.normal_delay < cfg.backoff.collision_delay);
    }

    #[test]
    fn high_speed_is_faster() {
        assert!(Speed::High.ticks_per_bit() < Speed::Standard.ticks_per_bit());
        assert_eq!(Speed::default(), Speed::Standard);
    }
}
