//! Transmit Queue
//!
//! A bounded FIFO of frames waiting for the bus. Frames leave the queue
//! when the bus becomes available, and come back to the tail if they
//! collide, until they run out of attempts.

use embassy_time::Instant;
use heapless::Deque;

use crate::{config::Priority, frame::Frame};

/// Number of frames the transmit queue can hold
pub const QUEUE_SIZE: usize = 50;

/// Why the last attempt to send a slot failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
pub enum FailureReason {
    /// The line did not match what was driven
    Collision,
    /// Someone else started sending first, nothing was sent
    Deferred,
}

/// A frame waiting to be sent, plus the bookkeeping that goes with it
#[derive(Debug, Clone, PartialEq)]
pub struct TransmitSlot {
    /// The frame to send
    pub frame: Frame,
    /// Backoff class
    pub priority: Priority,
    /// Caller chosen id, reported back in the send status
    pub request_id: u16,
    /// When the frame was submitted
    pub enqueued_at: Instant,
    /// Number of failed attempts so far
    pub attempts: u8,
    /// Why the most recent attempt failed, if any did
    pub last_failure: Option<FailureReason>,
}

impl TransmitSlot {
    /// Create a new slot, with no attempts made
    pub fn new(frame: Frame, priority: Priority, request_id: u16, now: Instant) -> Self {
        Self {
            frame,
            priority,
            request_id,
            enqueued_at: now,
            attempts: 0,
            last_failure: None,
        }
    }
}

/// Result of putting a failed slot back in the queue
#[derive(Debug, PartialEq)]
pub enum Requeue {
    /// The slot is back in the queue. Holds the attempt count.
    Queued(u8),
    /// The slot has used all of its attempts, and was dropped
    Exhausted(TransmitSlot),
    /// The queue had no room left, and the slot was dropped
    Full(TransmitSlot),
}

/// The bounded FIFO of outgoing frames
pub struct TransmitQueue {
    slots: Deque<TransmitSlot, QUEUE_SIZE>,
}

impl Default for TransmitQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl TransmitQueue {
    /// Create an empty queue
    pub const fn new() -> Self {
        Self {
            slots: Deque::new(),
        }
    }

    /// Add a slot to the tail of the queue. Never blocks.
    ///
    /// Hands the slot back if the queue is full.
    pub fn enqueue(&mut self, slot: TransmitSlot) -> Result<(), TransmitSlot> {
        self.slots.push_back(slot)
    }

    /// Take the oldest slot
    pub fn drain_next(&mut self) -> Option<TransmitSlot> {
        self.slots.pop_front()
    }

    /// Put a slot whose attempt failed back in the queue.
    ///
    /// After a collision the slot goes to the tail, and the attempt counts
    /// against `max_attempts`. A deferred slot was never sent, so it keeps
    /// its place at the head.
    pub fn requeue(
        &mut self,
        mut slot: TransmitSlot,
        reason: FailureReason,
        max_attempts: u8,
    ) -> Requeue {
        slot.last_failure = Some(reason);
        if reason == FailureReason::Collision {
            slot.attempts = slot.attempts.saturating_add(1);
            if slot.attempts >= max_attempts {
                return Requeue::Exhausted(slot);
            }
        }
        let attempts = slot.attempts;
        let res = match reason {
            FailureReason::Collision => self.slots.push_back(slot),
            FailureReason::Deferred => self.slots.push_front(slot),
        };
        match res {
            Ok(()) => Requeue::Queued(attempts),
            Err(slot) => Requeue::Full(slot),
        }
    }

    /// Discard everything in the queue, returning how many slots were dropped
    pub fn flush(&mut self) -> usize {
        let n = self.slots.len();
        self.slots.clear();
        n
    }

    /// The oldest slot, without removing it
    pub fn peek(&self) -> Option<&TransmitSlot> {
        self.slots.front()
    }

    /// Priority of the oldest slot
    pub fn head_priority(&self) -> Option<Priority> {
        self.peek().map(|s| s.priority)
    }

    /// Number of queued slots
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Is the queue empty?
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Is the queue full?
    pub fn is_full(&self) -> bool {
        self.slots.is_full()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn slot(id: u16) -> TransmitSlot {
        let frame = Frame::new(0xB2, &[(id & 0x7F) as u8, 0x00]).unwrap();
        TransmitSlot::new(frame, Priority::Normal, id, Instant::from_ticks(0))
    }

    #[test]
    fn fifo_order() {
        let mut q = TransmitQueue::new();
        for id in 0..5 {
            q.enqueue(slot(id)).unwrap();
        }
        let ids: std::vec::Vec<u16> = core::iter::from_fn(|| q.drain_next())
            .map(|s| s.request_id)
            .collect();
        assert_eq!(ids, [0, 1, 2, 3, 4]);
    }

    #[test]
    fn full_hands_back_the_slot() {
        let mut q = TransmitQueue::new();
        for id in 0..QUEUE_SIZE as u16 {
            q.enqueue(slot(id)).unwrap();
        }
        assert!(q.is_full());
        let rejected = q.enqueue(slot(999)).unwrap_err();
        assert_eq!(rejected.request_id, 999);
        assert_eq!(q.len(), QUEUE_SIZE);
        assert_eq!(q.peek().map(|s| s.request_id), Some(0));
    }

    #[test]
    fn requeue_goes_to_the_tail() {
        let mut q = TransmitQueue::new();
        q.enqueue(slot(1)).unwrap();
        q.enqueue(slot(2)).unwrap();

        let first = q.drain_next().unwrap();
        assert_eq!(q.requeue(first, FailureReason::Collision, 25), Requeue::Queued(1));

        let next = q.drain_next().unwrap();
        assert_eq!(next.request_id, 2);
        let again = q.drain_next().unwrap();
        assert_eq!(again.request_id, 1);
        assert_eq!(again.attempts, 1);
        assert_eq!(again.last_failure, Some(FailureReason::Collision));
    }

    #[test]
    fn deferral_is_not_an_attempt() {
        let mut q = TransmitQueue::new();
        q.enqueue(slot(1)).unwrap();
        q.enqueue(slot(2)).unwrap();
        let s = q.drain_next().unwrap();
        assert_eq!(q.requeue(s, FailureReason::Deferred, 1), Requeue::Queued(0));
        let head = q.peek().unwrap();
        assert_eq!(head.request_id, 1);
        assert_eq!(head.last_failure, Some(FailureReason::Deferred));
    }

    #[test]
    fn exhausted_after_max_attempts() {
        let mut q = TransmitQueue::new();
        let mut s = slot(7);
        for n in 1..3 {
            assert_eq!(q.requeue(s, FailureReason::Collision, 3), Requeue::Queued(n));
            s = q.drain_next().unwrap();
        }
        match q.requeue(s, FailureReason::Collision, 3) {
            Requeue::Exhausted(s) => assert_eq!(s.attempts, 3),
            other => panic!("{other:?}"),
        }
        assert!(q.is_empty());
    }

    #[test]
    fn flush_and_priority() {
        let mut q = TransmitQueue::new();
        assert_eq!(q.head_priority(), None);
        let mut s = slot(1);
        s.priority = Priority::High;
        q.enqueue(s).unwrap();
        q.enqueue(slot(2)).unwrap();
        assert_eq!(q.head_priority(), Some(Priority::High));
        assert_eq!(q.flush(), 2);
        assert!(q.is_empty());
    }
}
