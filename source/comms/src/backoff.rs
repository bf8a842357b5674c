//! Backoff and Arbitration
//!
//! LocoNet has no arbiter. Every node listens to the line, and only starts
//! sending once the line has been idle for long enough. How long is "long
//! enough" depends on the priority of what we want to send, and on whether
//! we were recently involved in a collision.
//!
//! ```text
//!   idle bits:  0 ............ cd_backoff ........ + tier delay ........
//!               |    Busy      |   AwaitBackoff    |   NetAvailable
//! ```
//!
//! The [Scheduler] only decides. The idle time itself is counted by the
//! [UartEngine][crate::uart::UartEngine], and the link asks the scheduler
//! before releasing the next frame.

use embassy_time::{Duration, Instant};
use rand_core::RngCore;

use crate::config::{BackoffTiers, Priority};

/// Whether the bus may be used right now
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
pub enum BusAvailability {
    /// There was activity within the minimum inter-frame gap
    Busy,
    /// The minimum gap has passed, but our tier delay has not
    AwaitBackoff,
    /// We may start sending
    NetAvailable,
}

/// Which delay applies to the next send attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
pub enum BackoffTier {
    /// High priority traffic
    Priority,
    /// Regular traffic
    Normal,
    /// A collision or BREAK was seen since the last good frame
    Collision,
}

/// Decides when the bus may be used
#[derive(Debug, Clone)]
pub struct Scheduler {
    tiers: BackoffTiers,
    after_collision: bool,
    jitter: u8,
}

impl Scheduler {
    /// Create a new scheduler with the given delays
    pub fn new(tiers: BackoffTiers) -> Self {
        Self {
            tiers,
            after_collision: false,
            jitter: 0,
        }
    }

    /// Replace the delays. A pending collision tier is kept.
    pub fn set_tiers(&mut self, tiers: BackoffTiers) {
        self.tiers = tiers;
        self.jitter = self.jitter.min(tiers.collision_jitter);
    }

    /// The current delays
    pub fn tiers(&self) -> &BackoffTiers {
        &self.tiers
    }

    /// A collision happened, or a BREAK was heard on the line.
    ///
    /// Until the next good frame is seen, every sender uses the collision
    /// tier, with a fresh random jitter so that the colliding nodes are
    /// unlikely to pick the same moment again.
    pub fn collision<R: RngCore>(&mut self, rand: &mut R) {
        let range = u32::from(self.tiers.collision_jitter) + 1;
        self.jitter = (rand.next_u32() % range) as u8;
        self.after_collision = true;
    }

    /// A complete, valid frame was seen on the line (ours or anyone's)
    pub fn frame_observed(&mut self) {
        self.after_collision = false;
        self.jitter = 0;
    }

    /// The tier that applies to a frame of the given priority
    pub fn tier(&self, priority: Priority) -> BackoffTier {
        match (self.after_collision, priority) {
            (true, _) => BackoffTier::Collision,
            (false, Priority::High) => BackoffTier::Priority,
            (false, Priority::Normal) => BackoffTier::Normal,
        }
    }

    /// Number of idle bit times needed before a frame of the given
    /// priority may be sent
    pub fn required_idle(&self, priority: Priority) -> u32 {
        let t = &self.tiers;
        let extra = match self.tier(priority) {
            BackoffTier::Priority => u32::from(t.priority_delay),
            BackoffTier::Normal => u32::from(t.normal_delay),
            BackoffTier::Collision => u32::from(t.collision_delay) + u32::from(self.jitter),
        };
        u32::from(t.cd_backoff) + extra
    }

    /// Classify the bus, given the number of idle bits seen so far, and
    /// the priority of the frame we would like to send
    pub fn availability(&self, idle_bits: u32, priority: Priority) -> BusAvailability {
        if idle_bits < u32::from(self.tiers.cd_backoff) {
            BusAvailability::Busy
        } else if idle_bits < self.required_idle(priority) {
            BusAvailability::AwaitBackoff
        } else {
            BusAvailability::NetAvailable
        }
    }
}

/// Watches for a bus that has gone completely silent
///
/// Nothing on a healthy LocoNet stays quiet for long, so silence usually
/// means the node has been disconnected. This is only informational:
/// arbitration keeps treating a silent bus as available.
#[derive(Debug, Clone)]
pub struct CarrierMonitor {
    period: Duration,
    last_activity: Instant,
    last_notice: Option<Instant>,
}

impl CarrierMonitor {
    /// Create a new monitor, counting silence from `now`
    pub fn new(period: Duration, now: Instant) -> Self {
        Self {
            period,
            last_activity: now,
            last_notice: None,
        }
    }

    /// Change the notification period
    pub fn set_period(&mut self, period: Duration) {
        self.period = period;
    }

    /// Something was heard on the line
    pub fn activity(&mut self, now: Instant) {
        self.last_activity = now;
        self.last_notice = None;
    }

    /// How long the bus has been silent
    pub fn silent_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity)
    }

    /// Has the bus been heard within the last period?
    pub fn carrier_ok(&self, now: Instant) -> bool {
        self.silent_for(now) < self.period
    }

    /// Returns `Some(silence)` once per period while the bus is silent
    pub fn check(&mut self, now: Instant) -> Option<Duration> {
        if self.carrier_ok(now) {
            return None;
        }
        let due = match self.last_notice {
            None => true,
            Some(t) => now.saturating_duration_since(t) >= self.period,
        };
        if !due {
            return None;
        }
        self.last_notice = Some(now);
        Some(self.silent_for(now))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use rand_chacha::{rand_core::SeedableRng, ChaCha8Rng};

    #[test]
    fn tiers_gate_the_bus() {
        let sched = Scheduler::new(BackoffTiers::default());
        assert_eq!(sched.availability(0, Priority::High), BusAvailability::Busy);
        assert_eq!(sched.availability(19, Priority::High), BusAvailability::Busy);
        assert_eq!(
            sched.availability(20, Priority::High),
            BusAvailability::NetAvailable
        );
        assert_eq!(
            sched.availability(20, Priority::Normal),
            BusAvailability::AwaitBackoff
        );
        assert_eq!(
            sched.availability(26, Priority::Normal),
            BusAvailability::NetAvailable
        );
    }

    #[test]
    fn collision_tier_until_next_frame() {
        let mut rng = ChaCha8Rng::seed_from_u64(1234);
        let mut sched = Scheduler::new(BackoffTiers::default());
        sched.collision(&mut rng);

        assert_eq!(sched.tier(Priority::High), BackoffTier::Collision);
        let need = sched.required_idle(Priority::High);
        assert!((20 + 12..=20 + 12 + 20).contains(&need));
        assert_eq!(
            sched.availability(need - 1, Priority::High),
            BusAvailability::AwaitBackoff
        );
        assert_eq!(
            sched.availability(need, Priority::High),
            BusAvailability::NetAvailable
        );

        sched.frame_observed();
        assert_eq!(sched.tier(Priority::Normal), BackoffTier::Normal);
        assert_eq!(sched.required_idle(Priority::Normal), 26);
    }

    #[test]
    fn jitter_spreads_out() {
        let mut rng = ChaCha8Rng::seed_from_u64(42);
        let mut sched = Scheduler::new(BackoffTiers::default());
        let mut seen = std::collections::BTreeSet::new();
        for _ in 0..200 {
            sched.collision(&mut rng);
            seen.insert(sched.required_idle(Priority::Normal));
        }
        assert!(seen.len() > 10);
        assert!(seen.iter().all(|n| (32..=52).contains(n)));
    }

    #[test]
    fn no_jitter_configured() {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let mut sched = Scheduler::new(BackoffTiers {
            collision_jitter: 0,
            ..BackoffTiers::default()
        });
        sched.collision(&mut rng);
        assert_eq!(sched.required_idle(Priority::Normal), 32);
    }

    #[test]
    fn carrier_loss_repeats_every_period() {
        let start = Instant::from_secs(100);
        let mut mon = CarrierMonitor::new(Duration::from_secs(5), start);

        assert!(mon.carrier_ok(start + Duration::from_secs(4)));
        assert_eq!(mon.check(start + Duration::from_secs(4)), None);

        let t = start + Duration::from_secs(5);
        assert!(!mon.carrier_ok(t));
        assert_eq!(mon.check(t), Some(Duration::from_secs(5)));
        assert_eq!(mon.check(t + Duration::from_secs(1)), None);
        assert_eq!(
            mon.check(t + Duration::from_secs(5)),
            Some(Duration::from_secs(10))
        );

        mon.activity(t + Duration::from_secs(6));
        assert!(mon.carrier_ok(t + Duration::from_secs(7)));
        assert_eq!(mon.check(t + Duration::from_secs(7)), None);
    }
}
