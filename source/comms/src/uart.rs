//! Bit-Level UART Engine
//!
//! A software UART for the half-duplex LocoNet line. The engine owns the
//! line, and must be [ticked][UartEngine::tick] at a fixed rate by a timer,
//! at [`Speed::ticks_per_bit()`][crate::config::Speed::ticks_per_bit] ticks
//! per bit.
//!
//! Each tick:
//!
//! 1. The line is sampled once
//! 2. The transmit state machine advances, possibly driving the next bit.
//!    At the middle of every bit it sends, the engine compares the sample
//!    with what it is driving. Any difference means someone else is driving
//!    the line too, which is a collision.
//! 3. The receive state machine advances. It hears everything on the line,
//!    including our own bytes, which are flagged as echoes.
//!
//! On a collision, the rest of the frame is discarded, and the line is held
//! in the BREAK (space) state for a number of bit times, so that every node
//! on the bus, including the other sender, notices and drops the frame.
//!
//! `tick()` never blocks, and never allocates.

use core::convert::Infallible;

use embedded_hal::digital::{InputPin, OutputPin};
use heapless::spsc::{Consumer, Producer};

use crate::{
    channels::{LineEvent, Shared, EVENT_QUEUE_SIZE, TX_QUEUE_SIZE},
    Error,
};

/// A trait representing the physical LocoNet line
///
/// The line is half-duplex, so whatever is driven is also heard. `level()`
/// must return the level actually present on the bus, not the level we are
/// driving, or collisions can't be detected.
pub trait BusLine {
    /// The error type of the underlying hardware
    type LineError;

    /// Drive the physical line level. `true` is electrically high.
    fn set_level(&mut self, high: bool) -> Result<(), Self::LineError>;

    /// Sample the physical line level. `true` is electrically high.
    fn level(&mut self) -> Result<bool, Self::LineError>;
}

/// An error from one of the two pins of a [PinLine]
#[derive(Debug, PartialEq)]
pub enum PinError<T, R> {
    /// The output pin failed
    Tx(T),
    /// The input pin failed
    Rx(R),
}

/// A [BusLine] made from an `embedded-hal` output and input pin pair
///
/// The output pin drives the line transceiver, the input pin listens to
/// the transceiver's receive side.
pub struct PinLine<TX, RX> {
    tx: TX,
    rx: RX,
}

impl<TX: OutputPin, RX: InputPin> PinLine<TX, RX> {
    /// Create a new pin pair
    pub fn new(tx: TX, rx: RX) -> Self {
        Self { tx, rx }
    }

    /// Deconstruct the pin pair
    pub fn into_inner(self) -> (TX, RX) {
        (self.tx, self.rx)
    }
}

impl<TX: OutputPin, RX: InputPin> BusLine for PinLine<TX, RX> {
    type LineError = PinError<TX::Error, RX::Error>;

    fn set_level(&mut self, high: bool) -> Result<(), Self::LineError> {
        if high {
            self.tx.set_high()
        } else {
            self.tx.set_low()
        }
        .map_err(PinError::Tx)
    }

    fn level(&mut self) -> Result<bool, Self::LineError> {
        self.rx.is_high().map_err(PinError::Rx)
    }
}

/// What the engine is doing with the line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
#[repr(u8)]
pub enum LineState {
    /// Not sending, just listening
    Idle = 0,
    /// Sending a frame
    Transmitting = 1,
    /// A collision was detected, and a BREAK is being sent
    CollisionDetected = 2,
}

impl LineState {
    pub(crate) fn from_u8(val: u8) -> Self {
        match val {
            1 => LineState::Transmitting,
            2 => LineState::CollisionDetected,
            _ => LineState::Idle,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RxState {
    WaitStart,
    StartBit { countdown: u8 },
    DataBit { bit: u8, value: u8, countdown: u8 },
    StopBit { value: u8, countdown: u8 },
    // Bad stop bit, wait for the line to return to idle
    Resync,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxState {
    Idle,
    StartBit(u8),
    DataBit { byte: u8, bit: u8 },
    StopBit,
    Break,
}

/// The timer-context half of a bus
///
/// Created by [`LineChannels::split()`][crate::LineChannels::split].
pub struct UartEngine<'a, L: BusLine> {
    line: L,
    shared: &'a Shared,
    events: Producer<'a, LineEvent, EVENT_QUEUE_SIZE>,
    outgoing: Consumer<'a, u8, TX_QUEUE_SIZE>,
    state: LineState,
    rx: RxState,
    tx: TxState,
    // Ticks into the current bit while sending, or ticks left of a BREAK
    tx_phase: u16,
    invert: bool,
    // Logical level last driven, None until the first tick
    driven: Option<bool>,
    ticks_per_bit: u8,
    idle_ticks: u32,
}

impl<'a, L: BusLine> UartEngine<'a, L> {
    pub(crate) fn new(
        line: L,
        shared: &'a Shared,
        events: Producer<'a, LineEvent, EVENT_QUEUE_SIZE>,
        outgoing: Consumer<'a, u8, TX_QUEUE_SIZE>,
    ) -> Self {
        Self {
            line,
            shared,
            events,
            outgoing,
            state: LineState::Idle,
            rx: RxState::WaitStart,
            tx: TxState::Idle,
            tx_phase: 0,
            invert: shared.invert(),
            driven: None,
            ticks_per_bit: shared.ticks_per_bit(),
            idle_ticks: 0,
        }
    }

    /// The current state of the line
    #[inline]
    pub fn line_state(&self) -> LineState {
        self.state
    }

    /// Mutably borrow the line
    #[inline]
    pub fn line_mut(&mut self) -> &mut L {
        &mut self.line
    }

    /// Advance the engine by one tick.
    ///
    /// Must be called at a steady rate of `ticks_per_bit` times per bit
    /// period. Configuration changes made through the link take effect
    /// here. The first tick releases the line.
    pub fn tick(&mut self) -> Result<(), Error<L::LineError>> {
        let invert = self.shared.invert();
        let flipped = invert != self.invert;
        self.invert = invert;
        self.ticks_per_bit = self.shared.ticks_per_bit().max(2);
        match self.driven {
            None => self.drive(true)?,
            // Same level, other voltage
            Some(mark) if flipped => self.drive(mark)?,
            Some(_) => {}
        }

        let mark = self.sample()?;
        self.tick_tx(mark)?;
        self.tick_rx(mark);
        self.track_idle(mark);
        Ok(())
    }

    /// Sample the line, returning true for the idle (mark) level
    #[inline]
    fn sample(&mut self) -> Result<bool, L::LineError> {
        Ok(self.line.level()? != self.invert)
    }

    /// Drive the line, true for the idle (mark) level
    #[inline]
    fn drive(&mut self, mark: bool) -> Result<(), L::LineError> {
        self.driven = Some(mark);
        self.line.set_level(mark != self.invert)
    }

    fn set_state(&mut self, state: LineState) {
        self.state = state;
        self.shared.set_line_state(state);
    }

    fn emit(&mut self, event: LineEvent) {
        if self.events.enqueue(event).is_err() {
            self.shared.add_overrun();
        }
    }

    fn drain_outgoing(&mut self) {
        while self.outgoing.dequeue().is_some() {}
    }

    fn tick_tx(&mut self, mark: bool) -> Result<(), L::LineError> {
        let expected = match self.tx {
            TxState::Idle => return self.try_start(mark),
            TxState::Break => {
                self.tx_phase = self.tx_phase.saturating_sub(1);
                if self.tx_phase == 0 {
                    self.end_break()?;
                }
                return Ok(());
            }
            TxState::StartBit(_) => false,
            TxState::DataBit { byte, bit } => (byte >> bit) & 1 == 1,
            TxState::StopBit => true,
        };

        self.tx_phase += 1;
        if self.tx_phase == u16::from(self.ticks_per_bit / 2) && mark != expected {
            return self.collision();
        }
        if self.tx_phase >= u16::from(self.ticks_per_bit) {
            self.next_bit()?;
        }
        Ok(())
    }

    fn try_start(&mut self, mark: bool) -> Result<(), L::LineError> {
        if !self.shared.tx_pending() {
            return Ok(());
        }

        // Last moment carrier check: has someone else started already?
        if self.rx != RxState::WaitStart || !mark {
            ln_trace!("deferring tx, line busy");
            self.drain_outgoing();
            self.emit(LineEvent::TxDeferred);
            self.shared.finish_tx();
            return Ok(());
        }

        let Some(byte) = self.outgoing.dequeue() else {
            // A request with no data. Nothing to do.
            self.emit(LineEvent::TxComplete);
            self.shared.finish_tx();
            return Ok(());
        };
        self.set_state(LineState::Transmitting);
        self.tx = TxState::StartBit(byte);
        self.tx_phase = 0;
        self.drive(false)
    }

    fn next_bit(&mut self) -> Result<(), L::LineError> {
        self.tx_phase = 0;
        match self.tx {
            TxState::StartBit(byte) => {
                self.tx = TxState::DataBit { byte, bit: 0 };
                self.drive(byte & 1 == 1)
            }
            TxState::DataBit { bit: 7, .. } => {
                self.tx = TxState::StopBit;
                self.drive(true)
            }
            TxState::DataBit { byte, bit } => {
                let bit = bit + 1;
                self.tx = TxState::DataBit { byte, bit };
                self.drive((byte >> bit) & 1 == 1)
            }
            TxState::StopBit => match self.outgoing.dequeue() {
                Some(byte) => {
                    self.tx = TxState::StartBit(byte);
                    self.drive(false)
                }
                None => {
                    self.tx = TxState::Idle;
                    self.set_state(LineState::Idle);
                    self.emit(LineEvent::TxComplete);
                    self.shared.finish_tx();
                    Ok(())
                }
            },
            TxState::Idle | TxState::Break => Ok(()),
        }
    }

    fn collision(&mut self) -> Result<(), L::LineError> {
        ln_debug!("collision detected, sending break");
        self.drain_outgoing();
        self.set_state(LineState::CollisionDetected);
        self.tx = TxState::Break;
        self.tx_phase = u16::from(self.shared.break_bits()) * u16::from(self.ticks_per_bit);
        self.emit(LineEvent::Collision);
        self.drive(false)
    }

    fn end_break(&mut self) -> Result<(), L::LineError> {
        self.tx = TxState::Idle;
        self.set_state(LineState::Idle);
        self.shared.finish_tx();
        self.drive(true)
    }

    fn tick_rx(&mut self, mark: bool) {
        let tpb = self.ticks_per_bit;
        let half = tpb / 2;
        self.rx = match self.rx {
            RxState::WaitStart if mark => RxState::WaitStart,
            // Start edge. For two ticks per bit, this sample is already
            // the middle of the start bit.
            RxState::WaitStart if half <= 1 => self.verify_start(mark),
            RxState::WaitStart => RxState::StartBit {
                countdown: half - 1,
            },
            RxState::StartBit { countdown } => match countdown.saturating_sub(1) {
                0 => self.verify_start(mark),
                countdown => RxState::StartBit { countdown },
            },
            RxState::DataBit {
                bit,
                value,
                countdown,
            } => match countdown.saturating_sub(1) {
                0 => {
                    let value = value | (u8::from(mark) << bit);
                    if bit == 7 {
                        RxState::StopBit {
                            value,
                            countdown: tpb,
                        }
                    } else {
                        RxState::DataBit {
                            bit: bit + 1,
                            value,
                            countdown: tpb,
                        }
                    }
                }
                countdown => RxState::DataBit {
                    bit,
                    value,
                    countdown,
                },
            },
            RxState::StopBit { value, countdown } => match countdown.saturating_sub(1) {
                0 if mark => {
                    let echo = self.state != LineState::Idle;
                    self.emit(LineEvent::Byte { data: value, echo });
                    RxState::WaitStart
                }
                0 => {
                    ln_trace!("framing error {=u8}", value);
                    self.emit(LineEvent::FramingError { data: value });
                    RxState::Resync
                }
                countdown => RxState::StopBit { value, countdown },
            },
            RxState::Resync if mark => RxState::WaitStart,
            RxState::Resync => RxState::Resync,
        };
    }

    fn verify_start(&self, mark: bool) -> RxState {
        if mark {
            // Glitch, not a real start bit
            RxState::WaitStart
        } else {
            RxState::DataBit {
                bit: 0,
                value: 0,
                countdown: self.ticks_per_bit,
            }
        }
    }

    fn track_idle(&mut self, mark: bool) {
        let quiet = mark && self.rx == RxState::WaitStart && self.tx == TxState::Idle;
        self.idle_ticks = if quiet {
            self.idle_ticks.saturating_add(1)
        } else {
            0
        };
        self.shared
            .set_idle_bits(self.idle_ticks / u32::from(self.ticks_per_bit));
    }
}

/// A [BusLine] that hears exactly what it drives, with no errors
///
/// Useful for bring-up and testing without hardware.
#[derive(Debug, Default)]
pub struct Loopback {
    level: bool,
}

impl BusLine for Loopback {
    type LineError = Infallible;

    fn set_level(&mut self, high: bool) -> Result<(), Infallible> {
        self.level = high;
        Ok(())
    }

    fn level(&mut self) -> Result<bool, Infallible> {
        Ok(self.level)
    }
}
