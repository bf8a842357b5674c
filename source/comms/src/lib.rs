//! # LocoNet Comms
//!
//! This is the data-link layer for LocoNet, the multi-master serial bus used
//! to connect command stations, throttles, and detectors on a model railroad.
//!
//! LocoNet is a half-duplex, single wire bus, with no dedicated arbiter.
//! Every node listens before it talks, and watches what it is sending, to
//! notice when someone else started talking at the same time. A typical
//! hardware UART can do neither, so this crate implements the UART in
//! software, one bit at a time.
//!
//! ## Entities
//!
//! A bus is split into two halves, which are expected to live in two
//! separate execution contexts:
//!
//! 1. The [UartEngine], which owns the line, and must be
//!    [ticked][UartEngine::tick] at a fixed rate from a timer interrupt.
//!    It sends and receives bits, and detects collisions.
//! 2. The [LocoNet] link, which is [processed][LocoNet::process] from a
//!    regular task. It holds the transmit queue, decides when the bus may be
//!    used, reassembles received bytes into frames, and hands them to the
//!    application.
//!
//! The two halves are connected by [LineChannels]: two single-producer,
//! single-consumer queues and a small block of atomics, each written by only
//! one side. No locks are taken in the timer context.
//!
//! ```rust
//! use loconet_comms::{Config, Frame, LineStorage, Loopback};
//! use rand_chacha::{rand_core::SeedableRng, ChaCha8Rng};
//!
//! static BUS: LineStorage = LineStorage::new();
//!
//! let channels = BUS.take().unwrap();
//! let config = Config { invert: false, ..Config::default() };
//! let (mut engine, mut link) = channels.split(Loopback::default(), config);
//!
//! link.submit(Frame::new(0x83, &[]).unwrap()).unwrap();
//!
//! let mut rng = ChaCha8Rng::seed_from_u64(0);
//! for _ in 0..1000 {
//!     // In the timer interrupt
//!     engine.tick().unwrap();
//!     // In the polling task
//!     link.poll(&mut rng);
//! }
//! assert_eq!(link.stats().frames_sent, 1);
//! ```
//!
//! ## Message Framing
//!
//! Every message starts with an OPCODE byte with the most significant bit
//! set, and every following byte has it clear, including the final CHECK
//! byte. Bits 6 and 5 of the OPCODE give the length of the message, or
//! say that the next byte holds it. The CHECK byte makes the XOR of the whole
//! message `0xFF`. See the [frame] module for the details.
//!
//! ## Bus Access
//!
//! A node may only start sending after the line has been idle for a while.
//! The minimum gap is the same for everyone, after which each node adds a
//! delay that depends on the priority of what it wants to send. Nodes that
//! were just involved in a collision wait the longest, plus a random amount,
//! so that they don't collide again. See the [backoff] module.
//!
//! While sending, the engine samples every bit it drives. If the line does
//! not match, the rest of the frame is abandoned, and the line is held low
//! for a while (a BREAK), so that every node throws away the broken message.
//! The frame goes back to the end of the queue and is tried again, up to a
//! limit.
//!
//! ## Replies
//!
//! Some requests are answered by another node. The link remembers the last
//! such request, and reports whether its reply arrived in time. See
//! [SendStatus].

#![cfg_attr(not(any(test, feature = "std")), no_std)]
#![warn(missing_docs)]

#[macro_use]
mod macros;

pub mod assembler;
pub mod backoff;
pub mod channels;
pub mod config;
pub mod correlator;
pub mod dispatch;
pub mod frame;
pub mod link;
pub mod queue;
pub mod uart;

pub use crate::{
    backoff::BusAvailability,
    channels::{LineChannels, LineStorage},
    config::{Config, Priority, Speed},
    correlator::SendStatus,
    dispatch::{ChannelDispatch, Dispatch, Inbound},
    frame::Frame,
    link::{LinkStats, LocoNet, SubmitError},
    uart::{BusLine, LineState, Loopback, PinLine, UartEngine},
};

/// An error type for the [`BusLine`] trait
#[derive(Debug, PartialEq)]
#[non_exhaustive]
pub enum Error<E> {
    /// Some error with the underlying line hardware
    Line(E),
}

impl<E> From<E> for Error<E> {
    fn from(value: E) -> Self {
        Self::Line(value)
    }
}
