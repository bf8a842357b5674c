//! Frame Codec
//!
//! A LocoNet message on the wire is laid out as:
//!
//! ```text
//! | OPCODE | [COUNT] | DATA ... | CHECK |
//! ```
//!
//! * The OPCODE always has its most significant bit set. Every other byte
//!   of the message, except CHECK, is 7-bit data.
//! * Bits 6 and 5 of the OPCODE select the length class of the message. See
//!   [`LengthClass`].
//! * Variable length messages carry a COUNT byte directly after the OPCODE,
//!   holding the TOTAL number of bytes in the message, including the OPCODE,
//!   COUNT and CHECK bytes.
//! * CHECK is chosen so that the XOR of every byte in the message, including
//!   CHECK itself, is `0xFF`.

use heapless::Vec;

/// Largest message, in bytes, that will be assembled or sent
pub const MAX_MSG_SIZE: usize = 48;

/// Largest payload a [Frame] can carry.
///
/// This is [MAX_MSG_SIZE] minus the OPCODE, COUNT, and CHECK bytes of a
/// variable length message.
pub const MAX_PAYLOAD_SIZE: usize = MAX_MSG_SIZE - 3;

/// The XOR of every byte of a valid message
pub const CHECK_RESULT: u8 = 0xFF;

/// Length class of a message, as encoded in the OPCODE
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
pub enum LengthClass {
    /// The message is always exactly this many bytes long, including
    /// the OPCODE and CHECK bytes.
    Fixed(u8),
    /// The total message length is carried in the byte after the OPCODE
    Variable,
}

impl LengthClass {
    /// Does this class need a COUNT byte on the wire?
    #[inline]
    pub fn has_count(&self) -> bool {
        matches!(self, LengthClass::Variable)
    }
}

/// Determine the length class of a message from its OPCODE.
///
/// | bits 6..5 | length       |
/// | :-------- | :----------- |
/// | `0b00`    | 2 bytes      |
/// | `0b01`    | 4 bytes      |
/// | `0b10`    | 6 bytes      |
/// | `0b11`    | COUNT byte   |
#[inline]
pub fn length_class(opcode: u8) -> LengthClass {
    match (opcode >> 5) & 0b11 {
        0b00 => LengthClass::Fixed(2),
        0b01 => LengthClass::Fixed(4),
        0b10 => LengthClass::Fixed(6),
        _ => LengthClass::Variable,
    }
}

/// Is this byte an OPCODE?
#[inline]
pub fn is_opcode(byte: u8) -> bool {
    byte & 0x80 != 0
}

/// Compute the CHECK byte for a message, given all bytes that come before it
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(CHECK_RESULT, |acc, b| acc ^ *b)
}

/// Does the XOR of all of these bytes, which includes the CHECK byte,
/// come out to [CHECK_RESULT]?
pub fn is_valid(msg: &[u8]) -> bool {
    msg.iter().fold(0, |acc, b| acc ^ *b) == CHECK_RESULT
}

/// Frame encoding and decoding error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
#[non_exhaustive]
pub enum FrameError {
    /// The first byte did not have its high bit set
    NotAnOpcode,
    /// The number of bytes does not match the opcode's length class,
    /// or the COUNT byte
    LengthMismatch,
    /// The payload is larger than [MAX_PAYLOAD_SIZE]
    PayloadTooLarge,
    /// A data byte had its high bit set
    DataHighBit,
    /// The XOR of the whole message was not [CHECK_RESULT]
    Checksum,
}

/// A single LocoNet message
///
/// The payload does NOT include the COUNT byte of variable length
/// messages, or the CHECK byte. Both are computed when encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    opcode: u8,
    payload: Vec<u8, MAX_PAYLOAD_SIZE>,
}

impl Frame {
    /// Create a new frame.
    ///
    /// The payload length must match the length class of the opcode, e.g.
    /// exactly 2 payload bytes for a 4 byte message. Variable length
    /// messages accept any payload up to [MAX_PAYLOAD_SIZE].
    pub fn new(opcode: u8, payload: &[u8]) -> Result<Self, FrameError> {
        if !is_opcode(opcode) {
            return Err(FrameError::NotAnOpcode);
        }
        match length_class(opcode) {
            LengthClass::Fixed(n) if payload.len() + 2 != n as usize => {
                return Err(FrameError::LengthMismatch);
            }
            _ => {}
        }
        if payload.iter().any(|b| is_opcode(*b)) {
            return Err(FrameError::DataHighBit);
        }
        let payload = Vec::from_slice(payload).map_err(|_| FrameError::PayloadTooLarge)?;
        Ok(Self { opcode, payload })
    }

    /// The OPCODE of this message
    #[inline]
    pub fn opcode(&self) -> u8 {
        self.opcode
    }

    /// Borrow the payload
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// The length class of this message
    #[inline]
    pub fn class(&self) -> LengthClass {
        length_class(self.opcode)
    }

    /// The total length of this message on the wire
    #[inline]
    pub fn wire_len(&self) -> usize {
        let count = if self.class().has_count() { 1 } else { 0 };
        2 + count + self.payload.len()
    }

    /// Encode the message, appending the CHECK byte
    pub fn encode(&self) -> Vec<u8, MAX_MSG_SIZE> {
        let mut out: Vec<u8, MAX_MSG_SIZE> = Vec::new();
        // The payload is bounded by MAX_PAYLOAD_SIZE, so none of these
        // pushes can overflow.
        let _ = out.push(self.opcode);
        if self.class().has_count() {
            let _ = out.push(self.wire_len() as u8);
        }
        let _ = out.extend_from_slice(&self.payload);
        let _ = out.push(checksum(&out));
        out
    }

    /// Decode a complete message, including its CHECK byte
    pub fn decode(msg: &[u8]) -> Result<Self, FrameError> {
        let (&opcode, rest) = msg.split_first().ok_or(FrameError::LengthMismatch)?;
        if !is_opcode(opcode) {
            return Err(FrameError::NotAnOpcode);
        }
        let class = length_class(opcode);
        let expected = match class {
            LengthClass::Fixed(n) => n as usize,
            LengthClass::Variable => *rest.first().ok_or(FrameError::LengthMismatch)? as usize,
        };
        let min_len = if class.has_count() { 3 } else { 2 };
        if expected < min_len || expected != msg.len() || msg.len() > MAX_MSG_SIZE {
            return Err(FrameError::LengthMismatch);
        }
        if !is_valid(msg) {
            return Err(FrameError::Checksum);
        }

        let skip = if class.has_count() { 2 } else { 1 };
        let payload = &msg[skip..msg.len() - 1];
        if payload.iter().any(|b| is_opcode(*b)) {
            return Err(FrameError::DataHighBit);
        }
        Ok(Self {
            opcode,
            payload: Vec::from_slice(payload).map_err(|_| FrameError::PayloadTooLarge)?,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn length_classes() {
        assert_eq!(length_class(0x81), LengthClass::Fixed(2));
        assert_eq!(length_class(0xB2), LengthClass::Fixed(4));
        assert_eq!(length_class(0xD0), LengthClass::Fixed(6));
        assert_eq!(length_class(0xE7), LengthClass::Variable);
    }

    #[test]
    fn checksum_makes_xor_ff() {
        let frame = Frame::new(0xB2, &[0x00, 0x00]).unwrap();
        let wire = frame.encode();
        assert_eq!(wire.as_slice(), &[0xB2, 0x00, 0x00, 0x4D]);
        assert!(is_valid(&wire));
    }

    #[test]
    fn variable_length_count() {
        let frame = Frame::new(0xE5, &[0x10, 0x7F, 0x01]).unwrap();
        let wire = frame.encode();
        assert_eq!(wire.len(), 6);
        assert_eq!(wire[1], 6);
        assert_eq!(Frame::decode(&wire), Ok(frame));
    }

    #[test]
    fn rejects_bad_frames() {
        assert_eq!(Frame::new(0x32, &[]), Err(FrameError::NotAnOpcode));
        assert_eq!(Frame::new(0xB2, &[0x01]), Err(FrameError::LengthMismatch));
        assert_eq!(Frame::new(0xB2, &[0x01, 0x80]), Err(FrameError::DataHighBit));
        assert_eq!(
            Frame::new(0xE7, &[0u8; MAX_PAYLOAD_SIZE + 1]),
            Err(FrameError::PayloadTooLarge)
        );
        assert_eq!(Frame::decode(&[0x83, 0x7C]), Ok(Frame::new(0x83, &[]).unwrap()));
        assert_eq!(Frame::decode(&[0x83, 0x7D]), Err(FrameError::Checksum));
        assert_eq!(Frame::decode(&[0x83]), Err(FrameError::LengthMismatch));
        assert_eq!(Frame::decode(&[0xE7, 0x09, 0x00]), Err(FrameError::LengthMismatch));
    }

    fn any_frame() -> impl Strategy<Value = Frame> {
        (0x80u8..=0xFF)
            .prop_flat_map(|op| {
                let len = match length_class(op) {
                    LengthClass::Fixed(n) => (n as usize - 2)..=(n as usize - 2),
                    LengthClass::Variable => 0..=MAX_PAYLOAD_SIZE,
                };
                (Just(op), prop::collection::vec(0u8..0x80, len))
            })
            .prop_map(|(op, data)| Frame::new(op, &data).unwrap())
    }

    proptest! {
        #[test]
        fn decode_inverts_encode(frame in any_frame()) {
            let wire = frame.encode();
            prop_assert_eq!(wire.len(), frame.wire_len());
            prop_assert!(is_valid(&wire));
            prop_assert_eq!(Frame::decode(&wire), Ok(frame));
        }

        #[test]
        fn single_byte_corruption_is_caught(
            frame in any_frame(),
            idx in any::<prop::sample::Index>(),
            flip in 1u8..=0xFF,
        ) {
            let mut wire = frame.encode();
            let i = idx.index(wire.len());
            wire[i] ^= flip;
            prop_assert!(!is_valid(&wire));
            prop_assert!(Frame::decode(&wire).is_err());
        }
    }
}
