//! Dispatch Sink
//!
//! Validated frames are handed, synchronously and one at a time, to at most
//! one [Dispatch] consumer registered with the link.

use embassy_sync::{blocking_mutex::raw::RawMutex, channel::Sender};
use embassy_time::{Duration, Instant};

use crate::frame::Frame;

/// A frame that was received and validated
#[derive(Debug, Clone, PartialEq)]
pub struct Inbound {
    /// The frame
    pub frame: Frame,
    /// Set if this node sent the frame itself. The line is half-duplex,
    /// so every frame we send is also received.
    pub echo: bool,
    /// When the final byte was processed
    pub received_at: Instant,
}

/// A consumer of received frames
///
/// Implemented for any `FnMut(Inbound)` closure.
pub trait Dispatch {
    /// Called once for every valid frame heard on the line
    fn on_frame(&mut self, frame: Inbound);

    /// Called once per carrier loss period while the bus stays silent
    fn carrier_lost(&mut self, silent_for: Duration) {
        let _ = silent_for;
    }
}

impl<F: FnMut(Inbound)> Dispatch for F {
    fn on_frame(&mut self, frame: Inbound) {
        self(frame)
    }
}

/// A [Dispatch] that forwards frames into an `embassy-sync` channel, for
/// handling in an async task.
///
/// Delivery never waits: if the channel is full, the frame is dropped and
/// counted.
pub struct ChannelDispatch<'ch, M: RawMutex, const N: usize> {
    sender: Sender<'ch, M, Inbound, N>,
    echoes: bool,
    dropped: u32,
}

impl<'ch, M: RawMutex, const N: usize> ChannelDispatch<'ch, M, N> {
    /// Forward all frames, except our own echoes
    pub fn new(sender: Sender<'ch, M, Inbound, N>) -> Self {
        Self {
            sender,
            echoes: false,
            dropped: 0,
        }
    }

    /// Also forward the frames this node sent
    pub fn with_echoes(mut self) -> Self {
        self.echoes = true;
        self
    }

    /// Number of frames lost because the channel was full
    pub fn dropped(&self) -> u32 {
        self.dropped
    }
}

impl<'ch, M: RawMutex, const N: usize> Dispatch for ChannelDispatch<'ch, M, N> {
    fn on_frame(&mut self, frame: Inbound) {
        if frame.echo && !self.echoes {
            return;
        }
        if self.sender.try_send(frame).is_err() {
            ln_warn!("dispatch channel full, dropping frame");
            self.dropped = self.dropped.wrapping_add(1);
        }
    }
}
