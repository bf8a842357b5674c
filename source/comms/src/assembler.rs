//! Receive Assembler
//!
//! Turns the stream of bytes heard on the line, in whatever chunks they
//! arrive, back into complete [Frame]s.
//!
//! Every OPCODE has its high bit set, and every other byte has it clear, so
//! the start of a message can always be found again after noise or a
//! partially heard message. This includes the CHECK byte: the high bit of
//! the OPCODE cancels the high bit of `0xFF`.

use heapless::Vec;

use crate::frame::{is_opcode, length_class, Frame, FrameError, LengthClass, MAX_MSG_SIZE};

/// The state of the [Assembler]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
pub enum AssemblyState {
    /// Nothing received yet, waiting for a byte with the high bit set
    WaitingForOpcode,
    /// Received the OPCODE of a variable length message, the next
    /// byte holds the total message length
    WaitingForLength,
    /// The total length is known, collecting bytes up to and including
    /// the CHECK byte
    WaitingForPayload,
}

/// A reason an incoming message was discarded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
#[non_exhaustive]
pub enum RxError {
    /// A data byte arrived while no message was in progress
    Noise,
    /// A new OPCODE arrived before the current message was complete.
    /// The new OPCODE starts a new message.
    Truncated,
    /// The COUNT byte declared a message larger than [MAX_MSG_SIZE]
    Overflow,
    /// The COUNT byte declared a message too short to be valid
    BadLength,
    /// The message was complete, but the XOR check failed
    Checksum,
    /// The message was complete, but malformed
    Frame(FrameError),
}

impl From<FrameError> for RxError {
    fn from(value: FrameError) -> Self {
        match value {
            FrameError::Checksum => RxError::Checksum,
            other => RxError::Frame(other),
        }
    }
}

/// Incremental message assembler
pub struct Assembler {
    buf: Vec<u8, MAX_MSG_SIZE>,
    expected: usize,
    state: AssemblyState,
}

impl Default for Assembler {
    fn default() -> Self {
        Self::new()
    }
}

impl Assembler {
    /// Create a new, idle, assembler
    pub const fn new() -> Self {
        Self {
            buf: Vec::new(),
            expected: 0,
            state: AssemblyState::WaitingForOpcode,
        }
    }

    /// The current state
    #[inline]
    pub fn state(&self) -> AssemblyState {
        self.state
    }

    /// Number of bytes of the current message received so far
    #[inline]
    pub fn position(&self) -> usize {
        self.buf.len()
    }

    /// Discard any partial message
    pub fn reset(&mut self) {
        self.buf.clear();
        self.expected = 0;
        self.state = AssemblyState::WaitingForOpcode;
    }

    /// Feed one byte into the assembler.
    ///
    /// Returns `None` while a message is still in progress (or a new one
    /// just started), `Some(Ok(frame))` when a complete and valid message
    /// has been received, and `Some(Err(_))` when bytes were discarded.
    pub fn push(&mut self, byte: u8) -> Option<Result<Frame, RxError>> {
        match self.state {
            AssemblyState::WaitingForOpcode => {
                if !is_opcode(byte) {
                    return Some(Err(RxError::Noise));
                }
                self.start(byte);
                None
            }
            AssemblyState::WaitingForLength => {
                if is_opcode(byte) {
                    self.start(byte);
                    return Some(Err(RxError::Truncated));
                }
                let count = byte as usize;
                if count > MAX_MSG_SIZE {
                    self.reset();
                    return Some(Err(RxError::Overflow));
                }
                if count < 3 {
                    self.reset();
                    return Some(Err(RxError::BadLength));
                }
                self.expected = count;
                self.state = AssemblyState::WaitingForPayload;
                self.store(byte)
            }
            AssemblyState::WaitingForPayload => {
                if is_opcode(byte) {
                    self.start(byte);
                    return Some(Err(RxError::Truncated));
                }
                if let Some(err) = self.store(byte) {
                    return Some(err);
                }
                if self.buf.len() < self.expected {
                    return None;
                }
                let res = Frame::decode(&self.buf).map_err(RxError::from);
                self.reset();
                Some(res)
            }
        }
    }

    fn start(&mut self, opcode: u8) {
        self.reset();
        // Cannot fail, the buffer was just cleared
        let _ = self.buf.push(opcode);
        match length_class(opcode) {
            LengthClass::Fixed(n) => {
                self.expected = n as usize;
                self.state = AssemblyState::WaitingForPayload;
            }
            LengthClass::Variable => {
                self.state = AssemblyState::WaitingForLength;
            }
        }
    }

    fn store(&mut self, byte: u8) -> Option<Result<Frame, RxError>> {
        if self.buf.push(byte).is_err() {
            self.reset();
            return Some(Err(RxError::Overflow));
        }
        None
    }
}
