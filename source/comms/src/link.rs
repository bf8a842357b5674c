//! Link Interface
//!
//! [LocoNet] is the polling-context half of a bus. It owns everything that
//! is not timing critical: the transmit queue, arbitration, assembly of
//! received bytes into frames, reply tracking, and delivery of frames to
//! the application.
//!
//! The application is expected to use it in two places:
//!
//! 1. Somewhere [LocoNet::process()] (or [LocoNet::poll()]) is called
//!    regularly, at least a few times per millisecond while the bus is
//!    busy, to drain line events and release queued frames.
//! 2. Wherever frames are produced, calling [LocoNet::submit()].
//!
//! Received frames are delivered synchronously from inside `process`, to
//! the [Dispatch] set with [LocoNet::set_dispatch()].

use embassy_time::Instant;
use heapless::spsc::{Consumer, Producer};
use rand_core::RngCore;

use crate::{
    assembler::{Assembler, RxError},
    backoff::{BusAvailability, CarrierMonitor, Scheduler},
    channels::{LineEvent, Shared, EVENT_QUEUE_SIZE, TX_QUEUE_SIZE},
    config::{Config, Priority},
    correlator::{Correlator, ReplyPolicy, SendStatus},
    dispatch::{Dispatch, Inbound},
    frame::Frame,
    queue::{FailureReason, Requeue, TransmitQueue, TransmitSlot, QUEUE_SIZE},
    uart::LineState,
};

/// An error when submitting a frame for sending
#[derive(Debug, PartialEq)]
#[non_exhaustive]
pub enum SubmitError {
    /// The transmit queue is full. The frame is handed back.
    QueueFull(Frame),
}

/// Counters kept by the link
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
pub struct LinkStats {
    /// Valid frames received, including our own echoes
    pub frames_received: u32,
    /// Frames completely sent
    pub frames_sent: u32,
    /// Frames discarded because of a bad CHECK byte
    pub checksum_errors: u32,
    /// Bad stop bits, BREAKs, and invalid COUNT bytes
    pub framing_errors: u32,
    /// Data bytes received outside of any frame
    pub noise_bytes: u32,
    /// Frames cut short by a new OPCODE
    pub truncated: u32,
    /// Collisions detected while sending
    pub collisions: u32,
    /// Frames dropped after too many collisions
    pub dropped: u32,
    /// Send attempts that were deferred because someone else started first
    pub deferred: u32,
    /// Line events lost because the link was not processing fast enough
    pub overruns: u16,
    /// Carrier loss notices raised
    pub carrier_losses: u32,
}

/// The polling-context half of a bus
///
/// Created by [`LineChannels::split()`][crate::LineChannels::split]. `'a` is
/// the lifetime of the channels, `'d` the lifetime of the [Dispatch] sink,
/// which may be shorter.
pub struct LocoNet<'a, 'd> {
    shared: &'a Shared,
    events: Consumer<'a, LineEvent, EVENT_QUEUE_SIZE>,
    outgoing: Producer<'a, u8, TX_QUEUE_SIZE>,
    config: Config,
    assembler: Assembler,
    scheduler: Scheduler,
    queue: TransmitQueue,
    correlator: Correlator,
    carrier: CarrierMonitor,
    in_flight: Option<TransmitSlot>,
    dispatch: Option<&'d mut dyn Dispatch>,
    stats: LinkStats,
    now: Instant,
    started: bool,
}

/// Instantiation and configuration methods
impl<'a, 'd> LocoNet<'a, 'd> {
    pub(crate) fn new(
        shared: &'a Shared,
        events: Consumer<'a, LineEvent, EVENT_QUEUE_SIZE>,
        outgoing: Producer<'a, u8, TX_QUEUE_SIZE>,
        config: Config,
    ) -> Self {
        let now = Instant::from_ticks(0);
        Self {
            shared,
            events,
            outgoing,
            config,
            assembler: Assembler::new(),
            scheduler: Scheduler::new(config.backoff),
            queue: TransmitQueue::new(),
            correlator: Correlator::new(config.reply_timeout()),
            carrier: CarrierMonitor::new(config.carrier_loss_period(), now),
            in_flight: None,
            dispatch: None,
            stats: LinkStats::default(),
            now,
            started: false,
        }
    }

    /// Register the consumer of received frames, replacing any previous one
    pub fn set_dispatch(&mut self, dispatch: &'d mut dyn Dispatch) {
        self.dispatch = Some(dispatch);
    }

    /// Remove the consumer. Frames are then discarded after validation.
    pub fn clear_dispatch(&mut self) {
        self.dispatch = None;
    }

    /// Use a custom reply policy for tracking request replies
    pub fn set_reply_policy(&mut self, policy: ReplyPolicy) {
        self.correlator.set_policy(policy);
    }

    /// The active configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Apply a new configuration.
    ///
    /// Line polarity, speed and BREAK length take effect on the engine's
    /// next tick. Timeouts take effect for the next request.
    pub fn reconfigure(&mut self, config: Config) {
        ln_info!("reconfiguring link");
        self.config = config;
        self.shared.apply(&config);
        self.scheduler.set_tiers(config.backoff);
        self.correlator.set_timeout(config.reply_timeout());
        self.carrier.set_period(config.carrier_loss_period());
    }
}

/// Sending methods
impl<'a, 'd> LocoNet<'a, 'd> {
    /// Queue a normal priority frame for sending, with request id 0
    pub fn submit(&mut self, frame: Frame) -> Result<(), SubmitError> {
        self.submit_with(frame, Priority::Normal, 0)
    }

    /// Queue a frame for sending.
    ///
    /// `request_id` is reported back in every [SendStatus] about this frame.
    ///
    /// A frame on the line keeps its place in the queue until it is known to
    /// be sent, so that it can always be put back after a collision. The
    /// queue holds [QUEUE_SIZE] frames including that one.
    pub fn submit_with(
        &mut self,
        frame: Frame,
        priority: Priority,
        request_id: u16,
    ) -> Result<(), SubmitError> {
        let reserved = usize::from(self.in_flight.is_some());
        if self.queue.len() + reserved >= QUEUE_SIZE {
            return Err(SubmitError::QueueFull(frame));
        }
        let slot = TransmitSlot::new(frame, priority, request_id, self.now);
        self.queue
            .enqueue(slot)
            .map_err(|slot| SubmitError::QueueFull(slot.frame))
    }

    /// Discard every queued frame, returning how many were dropped.
    ///
    /// A frame that is already on the line is not affected.
    pub fn flush(&mut self) -> usize {
        self.queue.flush()
    }

    /// Number of frames waiting in the queue
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }
}

/// Bus operation methods
impl<'a, 'd> LocoNet<'a, 'd> {
    /// Process everything that happened on the line since the last call,
    /// then send the next frame if the bus is available.
    ///
    /// `now` is used for timestamps and timeouts, and `rand` to pick the
    /// random part of the collision backoff. Both are passed in on every
    /// call, so the link itself needs no clock or RNG type parameters.
    pub fn process<R: RngCore>(&mut self, now: Instant, rand: &mut R) {
        self.now = now;
        if !self.started {
            self.started = true;
            self.carrier.activity(now);
        }

        // Read before draining: once the engine reports idle, every event
        // of the last transmission is already in the queue.
        let engine_idle = !self.shared.engine_busy();

        while let Some(ev) = self.events.dequeue() {
            self.handle_event(ev, rand);
        }

        if engine_idle {
            if let Some(slot) = self.in_flight.take() {
                ln_warn!("lost the outcome of a transmission");
                self.requeue(slot, FailureReason::Deferred);
            }
        }

        self.correlator.expire(now);

        if let Some(silent_for) = self.carrier.check(now) {
            ln_warn!("no carrier for {=u64}ms", silent_for.as_millis());
            self.stats.carrier_losses = self.stats.carrier_losses.wrapping_add(1);
            if let Some(d) = self.dispatch.as_mut() {
                d.carrier_lost(silent_for);
            }
        }

        self.try_send();
    }

    /// [process()][Self::process] using the current time
    pub fn poll<R: RngCore>(&mut self, rand: &mut R) {
        self.process(Instant::now(), rand)
    }

    fn handle_event<R: RngCore>(&mut self, ev: LineEvent, rand: &mut R) {
        match ev {
            LineEvent::Byte { data, echo } => {
                self.carrier.activity(self.now);
                match self.assembler.push(data) {
                    None => {}
                    Some(Ok(frame)) => self.received(frame, echo),
                    Some(Err(e)) => self.rx_error(e),
                }
            }
            LineEvent::FramingError { data } => {
                self.carrier.activity(self.now);
                self.stats.framing_errors = self.stats.framing_errors.wrapping_add(1);
                self.assembler.reset();
                if data == 0 {
                    ln_debug!("break on the line");
                    self.scheduler.collision(rand);
                }
            }
            LineEvent::Collision => {
                self.stats.collisions = self.stats.collisions.wrapping_add(1);
                self.assembler.reset();
                self.scheduler.collision(rand);
                if let Some(slot) = self.in_flight.take() {
                    self.requeue(slot, FailureReason::Collision);
                }
            }
            LineEvent::TxComplete => {
                self.stats.frames_sent = self.stats.frames_sent.wrapping_add(1);
                if let Some(slot) = self.in_flight.take() {
                    self.correlator.sent(&slot.frame, slot.request_id, self.now);
                }
            }
            LineEvent::TxDeferred => {
                self.stats.deferred = self.stats.deferred.wrapping_add(1);
                if let Some(slot) = self.in_flight.take() {
                    self.requeue(slot, FailureReason::Deferred);
                }
            }
        }
    }

    fn received(&mut self, frame: Frame, echo: bool) {
        ln_trace!("rx opcode {=u8:#x}, echo: {=bool}", frame.opcode(), echo);
        self.stats.frames_received = self.stats.frames_received.wrapping_add(1);
        self.scheduler.frame_observed();
        self.correlator.observe(&frame, echo);
        if let Some(d) = self.dispatch.as_mut() {
            d.on_frame(Inbound {
                frame,
                echo,
                received_at: self.now,
            });
        }
    }

    fn rx_error(&mut self, err: RxError) {
        let s = &mut self.stats;
        let ctr = match err {
            RxError::Noise => &mut s.noise_bytes,
            RxError::Truncated => &mut s.truncated,
            RxError::Checksum => &mut s.checksum_errors,
            RxError::Overflow | RxError::BadLength | RxError::Frame(_) => &mut s.framing_errors,
        };
        *ctr = ctr.wrapping_add(1);
    }

    fn requeue(&mut self, slot: TransmitSlot, reason: FailureReason) {
        let request_id = slot.request_id;
        let max = self.config.max_attempts;
        match self.queue.requeue(slot, reason, max) {
            Requeue::Queued(attempt) => {
                if reason == FailureReason::Collision {
                    ln_debug!("collision, attempt {=u8}", attempt);
                    self.correlator.report(SendStatus::CollidedRetrying {
                        request_id,
                        attempt,
                    });
                }
            }
            Requeue::Exhausted(_) | Requeue::Full(_) => {
                ln_warn!("dropping request {=u16}", request_id);
                self.stats.dropped = self.stats.dropped.wrapping_add(1);
                self.correlator
                    .report(SendStatus::CollidedDropped { request_id });
            }
        }
    }

    fn try_send(&mut self) {
        if self.in_flight.is_some() || self.shared.engine_busy() {
            return;
        }
        let Some(priority) = self.queue.head_priority() else {
            return;
        };
        if self.availability_for(priority) != BusAvailability::NetAvailable {
            return;
        }
        let Some(slot) = self.queue.drain_next() else {
            return;
        };

        let wire = slot.frame.encode();
        if self.outgoing.capacity() - self.outgoing.len() < wire.len() {
            // The engine still holds bytes it has not discarded yet
            self.requeue(slot, FailureReason::Deferred);
            return;
        }
        for b in wire {
            // Can't fail, the room was checked above
            let _ = self.outgoing.enqueue(b);
        }
        ln_trace!("tx opcode {=u8:#x}", slot.frame.opcode());
        self.in_flight = Some(slot);
        self.shared.request_tx();
    }

    fn availability_for(&self, priority: Priority) -> BusAvailability {
        self.scheduler.availability(self.shared.idle_bits(), priority)
    }
}

/// Status methods
impl<'a, 'd> LocoNet<'a, 'd> {
    /// What the engine is doing with the line
    pub fn line_state(&self) -> LineState {
        self.shared.line_state()
    }

    /// Whether the frame at the head of the queue (or a normal priority
    /// frame, if the queue is empty) could be sent right now
    pub fn availability(&self) -> BusAvailability {
        self.availability_for(self.queue.head_priority().unwrap_or_default())
    }

    /// Has anything been heard on the bus within the carrier loss period?
    pub fn carrier_ok(&self) -> bool {
        self.carrier.carrier_ok(self.now)
    }

    /// A snapshot of the link counters
    pub fn stats(&self) -> LinkStats {
        LinkStats {
            overruns: self.shared.overruns(),
            ..self.stats
        }
    }

    /// The most recent send status
    pub fn latest_status(&self) -> Option<SendStatus> {
        self.correlator.latest()
    }

    /// Take the most recent send status
    pub fn take_status(&mut self) -> Option<SendStatus> {
        self.correlator.take_latest()
    }

    /// Is a frame currently being sent?
    pub fn is_sending(&self) -> bool {
        self.in_flight.is_some()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        channels::{LineChannels, LineStorage},
        config::Speed,
        uart::{BusLine, Loopback, UartEngine},
    };
    use core::sync::atomic::{AtomicBool, Ordering};
    use embassy_time::Duration;
    use rand_chacha::{rand_core::SeedableRng, ChaCha8Rng};
    use std::{cell::RefCell, vec::Vec};

    fn cfg() -> Config {
        Config {
            invert: false,
            ..Config::default()
        }
    }

    fn frame(op: u8, payload: &[u8]) -> Frame {
        Frame::new(op, payload).unwrap()
    }

    #[test]
    fn send_and_hear_echo() {
        let mut chans = LineChannels::new();
        let (mut eng, mut link) = chans.split(Loopback::default(), cfg());
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let seen = RefCell::new(Vec::new());
        let mut sink = |i: Inbound| seen.borrow_mut().push(i);
        link.set_dispatch(&mut sink);

        link.submit(frame(0xB2, &[0x00, 0x00])).unwrap();
        let mut now = Instant::from_millis(1);
        for _ in 0..2000 {
            eng.tick().unwrap();
            now += Duration::from_micros(15);
            link.process(now, &mut rng);
        }

        let stats = link.stats();
        assert_eq!(stats.frames_sent, 1);
        assert_eq!(stats.frames_received, 1);
        assert_eq!(link.queue_len(), 0);
        assert_eq!(link.latest_status(), Some(SendStatus::Sent { request_id: 0 }));
        drop(link);
        let seen = seen.into_inner();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].echo);
        assert_eq!(seen[0].frame, frame(0xB2, &[0x00, 0x00]));
    }

    #[test]
    fn waits_for_backoff() {
        let mut chans = LineChannels::new();
        let (mut eng, mut link) = chans.split(Loopback::default(), cfg());
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let now = Instant::from_millis(1);

        link.submit(frame(0x83, &[])).unwrap();
        // Normal priority needs 20 + 6 idle bits, at 4 ticks per bit
        for _ in 0..(25 * 4) {
            eng.tick().unwrap();
            link.process(now, &mut rng);
        }
        assert_eq!(link.availability(), BusAvailability::AwaitBackoff);
        assert!(!link.is_sending());
        for _ in 0..4 {
            eng.tick().unwrap();
            link.process(now, &mut rng);
        }
        assert!(link.is_sending());
        assert_eq!(link.queue_len(), 0);
    }

    #[test]
    fn high_priority_goes_first_after_the_gap() {
        let mut chans = LineChannels::new();
        let (mut eng, mut link) = chans.split(Loopback::default(), cfg());
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let now = Instant::from_millis(1);

        link.submit_with(frame(0x83, &[]), Priority::High, 1).unwrap();
        for _ in 0..(20 * 4) {
            eng.tick().unwrap();
            link.process(now, &mut rng);
        }
        assert!(link.is_sending());
    }

    #[test]
    fn queue_full_hands_back_frame() {
        let mut chans = LineChannels::new();
        let (_eng, mut link) = chans.split(Loopback::default(), cfg());
        for i in 0..QUEUE_SIZE {
            link.submit_with(frame(0x83, &[]), Priority::Normal, i as u16)
                .unwrap();
        }
        let f = frame(0x85, &[]);
        assert_eq!(link.submit(f.clone()), Err(SubmitError::QueueFull(f)));
        assert_eq!(link.flush(), QUEUE_SIZE);
        assert_eq!(link.queue_len(), 0);
    }

    #[test]
    fn carrier_loss_is_reported() {
        struct Watch<'a>(&'a RefCell<Vec<Duration>>);
        impl Dispatch for Watch<'_> {
            fn on_frame(&mut self, _frame: Inbound) {}
            fn carrier_lost(&mut self, silent_for: Duration) {
                self.0.borrow_mut().push(silent_for);
            }
        }

        let mut chans = LineChannels::new();
        let (_eng, mut link) = chans.split(Loopback::default(), cfg());
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let lost = RefCell::new(Vec::new());
        let mut watch = Watch(&lost);
        link.set_dispatch(&mut watch);

        let start = Instant::from_secs(10);
        link.process(start, &mut rng);
        assert!(link.carrier_ok());
        link.process(start + Duration::from_secs(5), &mut rng);
        assert!(!link.carrier_ok());
        link.process(start + Duration::from_secs(7), &mut rng);
        link.process(start + Duration::from_secs(10), &mut rng);
        assert_eq!(link.stats().carrier_losses, 2);
        drop(link);
        assert_eq!(
            lost.into_inner(),
            [Duration::from_secs(5), Duration::from_secs(10)]
        );
    }

    /// Tick and process until the frame is sent, returning the tick count
    fn send_one(
        eng: &mut UartEngine<'_, Loopback>,
        link: &mut LocoNet<'_, '_>,
        rng: &mut ChaCha8Rng,
        f: Frame,
    ) -> usize {
        let sent = link.stats().frames_sent;
        link.submit(f).unwrap();
        let now = Instant::from_millis(1);
        for n in 1..5000 {
            eng.tick().unwrap();
            link.process(now, rng);
            if link.stats().frames_sent > sent {
                return n;
            }
        }
        panic!("frame was never sent");
    }

    #[test]
    fn reconfigure_between_frames() {
        let mut chans = LineChannels::new();
        let (mut eng, mut link) = chans.split(Loopback::default(), cfg());
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let seen = RefCell::new(Vec::new());
        let mut sink = |i: Inbound| seen.borrow_mut().push(i);
        link.set_dispatch(&mut sink);

        let slow = send_one(&mut eng, &mut link, &mut rng, frame(0xB2, &[0x01, 0x00]));
        assert!(eng.line_mut().level().unwrap());

        link.reconfigure(Config {
            invert: true,
            speed: Speed::High,
            max_attempts: 3,
            ..cfg()
        });
        assert_eq!(link.config().max_attempts, 3);

        let fast = send_one(&mut eng, &mut link, &mut rng, frame(0xB2, &[0x02, 0x00]));
        // Idle is now electrically low, and every bit takes half the ticks
        assert!(!eng.line_mut().level().unwrap());
        assert!(fast < slow, "{fast} vs {slow}");

        let stats = link.stats();
        assert_eq!(stats.framing_errors, 0);
        assert_eq!(stats.noise_bytes, 0);
        assert_eq!(stats.frames_received, 2);
        drop(link);
        let frames: Vec<Frame> = seen.into_inner().into_iter().map(|i| i.frame).collect();
        assert_eq!(
            frames,
            [frame(0xB2, &[0x01, 0x00]), frame(0xB2, &[0x02, 0x00])]
        );
    }

    #[test]
    fn frame_on_the_line_keeps_its_place() {
        let mut chans = LineChannels::new();
        let (mut eng, mut link) = chans.split(Loopback::default(), cfg());
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let now = Instant::from_millis(1);

        link.submit(frame(0x83, &[])).unwrap();
        while !link.is_sending() {
            eng.tick().unwrap();
            link.process(now, &mut rng);
        }
        assert_eq!(link.queue_len(), 0);

        for i in 1..QUEUE_SIZE {
            link.submit_with(frame(0x85, &[]), Priority::Normal, i as u16)
                .unwrap();
        }
        let f = frame(0x85, &[]);
        assert_eq!(link.submit(f.clone()), Err(SubmitError::QueueFull(f)));

        // Once it is sent, its place is free again
        while link.stats().frames_sent == 0 {
            eng.tick().unwrap();
            link.process(now, &mut rng);
        }
        assert!(!link.is_sending());
        assert_eq!(link.queue_len(), QUEUE_SIZE - 1);
        link.submit(frame(0x85, &[])).unwrap();
        assert_eq!(link.queue_len(), QUEUE_SIZE);
    }

    #[test]
    fn static_channels_with_a_local_sink() {
        static BUS: LineStorage = LineStorage::new();
        let chans = BUS.take().unwrap();
        let (mut eng, mut link): (UartEngine<'static, Loopback>, LocoNet<'static, '_>) =
            chans.split(Loopback::default(), cfg());
        let mut rng = ChaCha8Rng::seed_from_u64(1);

        // Only the channels need to be static, not the sink
        let mut heard = 0;
        let mut sink = |i: Inbound| {
            assert!(i.echo);
            heard += 1;
        };
        link.set_dispatch(&mut sink);
        send_one(&mut eng, &mut link, &mut rng, frame(0x83, &[]));
        drop(link);
        assert_eq!(heard, 1);
    }

    #[test]
    fn engine_on_another_thread_sends_each_frame_once() {
        let mut chans = LineChannels::new();
        let (mut eng, mut link) = chans.split(Loopback::default(), cfg());
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let seen = RefCell::new(Vec::new());
        let mut sink = |i: Inbound| seen.borrow_mut().push(i);
        link.set_dispatch(&mut sink);

        let frames: Vec<Frame> = (0..20u8).map(|i| frame(0xB2, &[i, 0x00])).collect();
        for f in frames.iter() {
            link.submit(f.clone()).unwrap();
        }

        let stop = AtomicBool::new(false);
        std::thread::scope(|s| {
            s.spawn(|| {
                while !stop.load(Ordering::Relaxed) {
                    eng.tick().unwrap();
                }
            });
            let deadline = std::time::Instant::now() + std::time::Duration::from_secs(30);
            let mut now = Instant::from_millis(1);
            while link.stats().frames_received < frames.len() as u32
                && std::time::Instant::now() < deadline
            {
                now += Duration::from_micros(15);
                link.process(now, &mut rng);
            }
            stop.store(true, Ordering::Relaxed);
        });

        let stats = link.stats();
        assert_eq!(stats.frames_sent, 20);
        assert_eq!(stats.frames_received, 20);
        assert_eq!(stats.deferred, 0);
        assert_eq!(link.queue_len(), 0);
        assert!(!link.is_sending());
        drop(link);
        let heard: Vec<Frame> = seen.into_inner().into_iter().map(|i| i.frame).collect();
        assert_eq!(heard, frames);
    }
}
