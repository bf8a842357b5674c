//! Line Channels
//!
//! The storage shared between the timer context, which owns the
//! [UartEngine], and the polling context, which owns the [LocoNet] link.
//!
//! Everything in here has exactly one writer:
//!
//! * The engine is the only producer of [LineEvent]s, and the link the only
//!   consumer. This uses a [`heapless::spsc`] queue.
//! * The link is the only producer of outgoing bytes, and the engine the
//!   only consumer. Also an spsc queue.
//! * Each atomic in [Shared] is only ever stored to by one of the two sides,
//!   and only `load` and `store` are used, so targets without CAS atomics
//!   are supported.
//!
//! [UartEngine]: crate::uart::UartEngine
//! [LocoNet]: crate::link::LocoNet

use core::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicU8, Ordering};

use grounded::uninit::GroundedCell;
use heapless::spsc::Queue;

use crate::{
    config::Config,
    link::LocoNet,
    uart::{BusLine, LineState, UartEngine},
};

/// Size of the line event queue. Holds one less than this.
pub const EVENT_QUEUE_SIZE: usize = 64;

/// Size of the outgoing byte queue. Holds one less than this, which is
/// still enough for the largest message.
pub const TX_QUEUE_SIZE: usize = 64;

/// Something that happened on the line, reported by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
pub(crate) enum LineEvent {
    /// A byte was received with a valid stop bit. `echo` is set if this
    /// node was sending at the time.
    Byte { data: u8, echo: bool },
    /// A byte was received, but the stop bit was not at the idle level.
    /// A BREAK shows up as this, with `data == 0`.
    FramingError { data: u8 },
    /// The line did not match what we were driving. The rest of the frame
    /// was discarded, and a BREAK is being sent.
    Collision,
    /// The whole frame was sent
    TxComplete,
    /// Someone else started sending before we did. Nothing was sent.
    TxDeferred,
}

/// The atomics shared between the engine and the link
pub(crate) struct Shared {
    // Written by the engine
    idle_bits: AtomicU32,
    line_state: AtomicU8,
    tx_done: AtomicU8,
    overruns: AtomicU16,

    // Written by the link
    tx_requested: AtomicU8,
    invert: AtomicBool,
    ticks_per_bit: AtomicU8,
    break_bits: AtomicU8,
}

/// Increment a counter that only this side of the channel writes
#[inline]
fn bump_u8(a: &AtomicU8) {
    let v = a.load(Ordering::Relaxed);
    a.store(v.wrapping_add(1), Ordering::Release);
}

impl Shared {
    pub(crate) const fn new() -> Self {
        Self {
            idle_bits: AtomicU32::new(0),
            line_state: AtomicU8::new(LineState::Idle as u8),
            tx_done: AtomicU8::new(0),
            overruns: AtomicU16::new(0),
            tx_requested: AtomicU8::new(0),
            invert: AtomicBool::new(true),
            ticks_per_bit: AtomicU8::new(4),
            break_bits: AtomicU8::new(crate::config::BREAK_BITS),
        }
    }

    // Link side

    pub(crate) fn apply(&self, cfg: &Config) {
        self.invert.store(cfg.invert, Ordering::Relaxed);
        self.ticks_per_bit
            .store(cfg.speed.ticks_per_bit(), Ordering::Relaxed);
        self.break_bits.store(cfg.break_bits, Ordering::Relaxed);
    }

    /// Call AFTER all bytes of the frame are in the outgoing queue
    pub(crate) fn request_tx(&self) {
        bump_u8(&self.tx_requested);
    }

    pub(crate) fn idle_bits(&self) -> u32 {
        self.idle_bits.load(Ordering::Acquire)
    }

    pub(crate) fn line_state(&self) -> LineState {
        LineState::from_u8(self.line_state.load(Ordering::Acquire))
    }

    pub(crate) fn overruns(&self) -> u16 {
        self.overruns.load(Ordering::Acquire)
    }

    /// Has the engine not yet finished the last requested transmission?
    ///
    /// The engine queues every event of a transmission before it marks the
    /// transmission finished, so once this returns false those events can
    /// all be dequeued.
    pub(crate) fn engine_busy(&self) -> bool {
        self.tx_done.load(Ordering::Acquire) != self.tx_requested.load(Ordering::Relaxed)
    }

    // Engine side

    pub(crate) fn tx_pending(&self) -> bool {
        self.tx_requested.load(Ordering::Acquire) != self.tx_done.load(Ordering::Relaxed)
    }

    /// Call AFTER every event of the transmission has been queued
    pub(crate) fn finish_tx(&self) {
        bump_u8(&self.tx_done);
    }

    pub(crate) fn set_idle_bits(&self, bits: u32) {
        self.idle_bits.store(bits, Ordering::Release);
    }

    pub(crate) fn set_line_state(&self, state: LineState) {
        self.line_state.store(state as u8, Ordering::Release);
    }

    pub(crate) fn add_overrun(&self) {
        let v = self.overruns.load(Ordering::Relaxed);
        self.overruns.store(v.wrapping_add(1), Ordering::Release);
    }

    pub(crate) fn invert(&self) -> bool {
        self.invert.load(Ordering::Relaxed)
    }

    pub(crate) fn ticks_per_bit(&self) -> u8 {
        self.ticks_per_bit.load(Ordering::Relaxed)
    }

    pub(crate) fn break_bits(&self) -> u8 {
        self.break_bits.load(Ordering::Relaxed)
    }
}

/// The channels between one [UartEngine] and one [LocoNet]
///
/// One of these is needed per bus.
pub struct LineChannels {
    events: Queue<LineEvent, EVENT_QUEUE_SIZE>,
    outgoing: Queue<u8, TX_QUEUE_SIZE>,
    shared: Shared,
}

impl Default for LineChannels {
    fn default() -> Self {
        Self::new()
    }
}

impl LineChannels {
    /// Create a new set of channels
    pub const fn new() -> Self {
        Self {
            events: Queue::new(),
            outgoing: Queue::new(),
            shared: Shared::new(),
        }
    }

    /// Split the channels into the timer-context [UartEngine], and the
    /// polling-context [LocoNet].
    ///
    /// `config` is applied to both halves before they are returned.
    pub fn split<'d, L: BusLine>(
        &mut self,
        line: L,
        config: Config,
    ) -> (UartEngine<'_, L>, LocoNet<'_, 'd>) {
        let Self {
            events,
            outgoing,
            shared,
        } = self;
        let shared: &Shared = shared;
        shared.apply(&config);

        let (ev_prod, ev_cons) = events.split();
        let (tx_prod, tx_cons) = outgoing.split();

        let engine = UartEngine::new(line, shared, ev_prod, tx_cons);
        let link = LocoNet::new(shared, ev_cons, tx_prod, config);
        (engine, link)
    }
}

/// Static storage for exactly one set of [LineChannels]
///
/// ```rust
/// use loconet_comms::LineStorage;
///
/// static BUS: LineStorage = LineStorage::new();
///
/// let channels = BUS.take().unwrap();
/// assert!(BUS.take().is_none());
/// ```
pub struct LineStorage {
    channels: GroundedCell<LineChannels>,
    once: AtomicBool,
}

// SAFETY: the inner channels are only reachable through `take`, which hands
// out the single exclusive reference.
unsafe impl Sync for LineStorage {}

impl Default for LineStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl LineStorage {
    /// Create new, uninitialized, storage
    ///
    /// Intended for static usage.
    pub const fn new() -> Self {
        Self {
            channels: GroundedCell::uninit(),
            once: AtomicBool::new(false),
        }
    }

    /// Attempt to take the storage as [LineChannels]
    ///
    /// The first call will return Some, all later calls will
    /// return None. Uses a [critical section][critical_section::with]
    /// to ensure it only works once, even on targets without atomics
    pub fn take(&'static self) -> Option<&'static mut LineChannels> {
        let first = critical_section::with(|_| {
            let old = self.once.load(Ordering::Acquire);
            self.once.store(true, Ordering::Release);
            !old
        });
        if !first {
            return None;
        }
        let ptr = self.channels.get();
        // SAFETY: `once` guarantees this happens exactly once, so we are the
        // only ones with access to the (uninitialized) storage.
        unsafe {
            ptr.write(LineChannels::new());
            Some(&mut *ptr)
        }
    }
}
