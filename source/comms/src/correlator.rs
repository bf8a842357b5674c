//! Response Correlator
//!
//! Some LocoNet requests are answered by another node, for example a slot
//! read is answered with the slot data, and a switch request with a
//! "long acknowledge". The correlator remembers the last such request that
//! was sent, and matches it against what is heard afterwards.
//!
//! Only one request is tracked at a time.

use embassy_time::{Duration, Instant};

use crate::frame::Frame;

/// Long acknowledge
pub const OPC_LONG_ACK: u8 = 0xB4;
/// Slot data read reply
pub const OPC_SL_RD_DATA: u8 = 0xE7;

/// Given a request opcode, return the opcodes that answer it. An empty
/// slice means the request has no reply.
pub type ReplyPolicy = fn(u8) -> &'static [u8];

/// The reply policy for the standard LocoNet requests
pub fn default_reply_policy(opcode: u8) -> &'static [u8] {
    match opcode {
        // OPC_LOCO_ADR, OPC_MOVE_SLOTS, OPC_LINK_SLOTS, OPC_UNLINK_SLOTS,
        // OPC_RQ_SL_DATA
        0xBF | 0xBA | 0xB9 | 0xB8 | 0xBB => &[OPC_SL_RD_DATA, OPC_LONG_ACK],
        // OPC_SW_STATE, OPC_SW_ACK, OPC_WR_SL_DATA, OPC_IMM_PACKET
        0xBC | 0xBD | 0xEF | 0xED => &[OPC_LONG_ACK],
        _ => &[],
    }
}

/// The outcome of a send, as seen by the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
pub enum SendStatus {
    /// The frame was sent, and no reply is expected
    Sent {
        /// The id given at submission
        request_id: u16,
    },
    /// The frame collided, and will be tried again
    CollidedRetrying {
        /// The id given at submission
        request_id: u16,
        /// Number of failed attempts so far
        attempt: u8,
    },
    /// The frame collided too many times, and was dropped
    CollidedDropped {
        /// The id given at submission
        request_id: u16,
    },
    /// The frame was sent, and its reply was heard
    ReplyReceived {
        /// The id given at submission
        request_id: u16,
        /// Opcode of the reply
        opcode: u8,
    },
    /// The frame was sent, but no reply came in time
    ReplyTimeout {
        /// The id given at submission
        request_id: u16,
    },
}

impl SendStatus {
    /// The id of the request this status is about
    pub fn request_id(&self) -> u16 {
        match *self {
            SendStatus::Sent { request_id }
            | SendStatus::CollidedRetrying { request_id, .. }
            | SendStatus::CollidedDropped { request_id }
            | SendStatus::ReplyReceived { request_id, .. }
            | SendStatus::ReplyTimeout { request_id } => request_id,
        }
    }
}

/// A request that is waiting for its reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingResponse {
    /// Opcode of the request
    pub opcode: u8,
    /// The id given at submission
    pub request_id: u16,
    /// When the request finished sending
    pub sent_at: Instant,
    /// When we give up waiting
    pub deadline: Instant,
    expects: &'static [u8],
}

impl PendingResponse {
    fn matches(&self, frame: &Frame) -> bool {
        if !self.expects.contains(&frame.opcode()) {
            return false;
        }
        // A LACK carries the opcode it acknowledges, with the high bit cleared
        frame.opcode() != OPC_LONG_ACK || frame.payload().first() == Some(&(self.opcode & 0x7F))
    }
}

/// Matches sent requests with their replies
pub struct Correlator {
    policy: ReplyPolicy,
    timeout: Duration,
    pending: Option<PendingResponse>,
    latest: Option<SendStatus>,
}

impl Correlator {
    /// Create a correlator using [default_reply_policy]
    pub fn new(timeout: Duration) -> Self {
        Self::with_policy(timeout, default_reply_policy)
    }

    /// Create a correlator with a custom reply policy
    pub fn with_policy(timeout: Duration, policy: ReplyPolicy) -> Self {
        Self {
            policy,
            timeout,
            pending: None,
            latest: None,
        }
    }

    /// Change the reply policy. Does not affect a request already pending.
    pub fn set_policy(&mut self, policy: ReplyPolicy) {
        self.policy = policy;
    }

    /// Change the timeout. Does not affect a request already pending.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// A frame finished sending.
    ///
    /// If it expects a reply, it becomes the pending request, and any older
    /// pending request is reported as timed out. Otherwise it is reported
    /// as [SendStatus::Sent]. Returns the status that was reported, if any.
    pub fn sent(&mut self, frame: &Frame, request_id: u16, now: Instant) -> Option<SendStatus> {
        let expects = (self.policy)(frame.opcode());
        if expects.is_empty() {
            return Some(self.report(SendStatus::Sent { request_id }));
        }
        let old = self.pending.replace(PendingResponse {
            opcode: frame.opcode(),
            request_id,
            sent_at: now,
            deadline: now + self.timeout,
            expects,
        });
        let old = old?;
        ln_debug!("request {=u16} replaced before its reply", old.request_id);
        Some(self.report(SendStatus::ReplyTimeout {
            request_id: old.request_id,
        }))
    }

    /// A valid frame was received. Our own echoes never count as a reply.
    pub fn observe(&mut self, frame: &Frame, echo: bool) -> Option<SendStatus> {
        if echo {
            return None;
        }
        let pending = self.pending.as_ref()?;
        if !pending.matches(frame) {
            return None;
        }
        let request_id = pending.request_id;
        self.pending = None;
        Some(self.report(SendStatus::ReplyReceived {
            request_id,
            opcode: frame.opcode(),
        }))
    }

    /// Check the pending request against its deadline
    pub fn expire(&mut self, now: Instant) -> Option<SendStatus> {
        let pending = self.pending.as_ref()?;
        if now < pending.deadline {
            return None;
        }
        let request_id = pending.request_id;
        self.pending = None;
        ln_debug!("request {=u16} timed out", request_id);
        Some(self.report(SendStatus::ReplyTimeout { request_id }))
    }

    /// Record a status that happened elsewhere, such as a collision
    pub fn report(&mut self, status: SendStatus) -> SendStatus {
        self.latest = Some(status);
        status
    }

    /// The request currently waiting for a reply
    pub fn pending(&self) -> Option<&PendingResponse> {
        self.pending.as_ref()
    }

    /// The most recent status
    pub fn latest(&self) -> Option<SendStatus> {
        self.latest
    }

    /// Take the most recent status, leaving none
    pub fn take_latest(&mut self) -> Option<SendStatus> {
        self.latest.take()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn t(ms: u64) -> Instant {
        Instant::from_millis(ms)
    }

    fn frame(op: u8, payload: &[u8]) -> Frame {
        Frame::new(op, payload).unwrap()
    }

    #[test]
    fn plain_frames_are_just_sent() {
        let mut c = Correlator::new(Duration::from_millis(500));
        let st = SendStatus::Sent { request_id: 5 };
        assert_eq!(c.sent(&frame(0x83, &[]), 5, t(0)), Some(st));
        assert_eq!(c.latest(), Some(st));
        assert!(c.pending().is_none());
        assert_eq!(c.take_latest(), Some(st));
        assert_eq!(c.latest(), None);
    }

    #[test]
    fn reply_matches() {
        let mut c = Correlator::new(Duration::from_millis(500));
        assert_eq!(c.sent(&frame(0xBB, &[0x03, 0x00]), 9, t(0)), None);
        assert_eq!(c.pending().map(|p| p.request_id), Some(9));
        assert_eq!(c.latest(), None);

        // Unrelated traffic, and our own echo, are ignored
        assert_eq!(c.observe(&frame(0xB2, &[0, 0]), false), None);
        let reply = frame(OPC_SL_RD_DATA, &[0; 11]);
        assert_eq!(c.observe(&reply, true), None);

        assert_eq!(
            c.observe(&reply, false),
            Some(SendStatus::ReplyReceived {
                request_id: 9,
                opcode: OPC_SL_RD_DATA
            })
        );
        assert!(c.pending().is_none());
        assert_eq!(c.expire(t(10_000)), None);
    }

    #[test]
    fn lack_must_name_the_request() {
        let mut c = Correlator::new(Duration::from_millis(500));
        c.sent(&frame(0xBD, &[0x01, 0x20]), 1, t(0));
        assert_eq!(c.observe(&frame(OPC_LONG_ACK, &[0x3F, 0x00]), false), None);
        assert_eq!(
            c.observe(&frame(OPC_LONG_ACK, &[0x3D, 0x7F]), false),
            Some(SendStatus::ReplyReceived {
                request_id: 1,
                opcode: OPC_LONG_ACK
            })
        );
    }

    #[test]
    fn timeout() {
        let mut c = Correlator::new(Duration::from_millis(500));
        c.sent(&frame(0xBC, &[0x01, 0x00]), 3, t(1000));
        assert_eq!(c.expire(t(1499)), None);
        assert_eq!(
            c.expire(t(1500)),
            Some(SendStatus::ReplyTimeout { request_id: 3 })
        );
        assert!(c.pending().is_none());
        assert_eq!(c.latest(), Some(SendStatus::ReplyTimeout { request_id: 3 }));
    }

    #[test]
    fn new_request_replaces_pending() {
        let mut c = Correlator::new(Duration::from_millis(500));
        c.sent(&frame(0xBB, &[0x01, 0x00]), 1, t(0));
        let st = c.sent(&frame(0xBB, &[0x02, 0x00]), 2, t(100));
        assert_eq!(st, Some(SendStatus::ReplyTimeout { request_id: 1 }));
        assert_eq!(c.pending().map(|p| p.request_id), Some(2));
        assert_eq!(c.pending().map(|p| p.deadline), Some(t(600)));
    }

    #[test]
    fn custom_policy() {
        fn everything_acks(_op: u8) -> &'static [u8] {
            &[0x81]
        }
        let mut c = Correlator::with_policy(Duration::from_millis(10), everything_acks);
        c.sent(&frame(0x83, &[]), 4, t(0));
        assert_eq!(
            c.observe(&frame(0x81, &[]), false),
            Some(SendStatus::ReplyReceived {
                request_id: 4,
                opcode: 0x81
            })
        );
    }
}
