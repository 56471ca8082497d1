//! TI MSPM0 Bootstrap Loader (BSL) programmer.
//!
//! Forces the target into its factory bootloader with the invoke and reset
//! lines, then connects, unlocks, mass erases, programs and starts it over a
//! UART link.

use core::fmt::Debug;
use core::marker::PhantomData;

#[macro_use]
extern crate log;

#[macro_use(block)]
extern crate nb;

extern crate embedded_hal;
use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::digital::v2::OutputPin;

#[cfg(feature = "structopt")]
extern crate structopt;

#[cfg(feature = "linux")]
extern crate linux_embedded_hal;

#[cfg(feature = "linux")]
pub mod linux;

pub mod checksum;
pub mod firmware;
pub mod protocol;
pub mod reset;
pub mod session;
pub mod transport;

pub use firmware::{FirmwareSource, ReaderSource};
pub use protocol::{Command, FrameError, Response};
pub use reset::ResetSequencer;
pub use session::BslSession;
pub use transport::Transport;

/// Session states, in the only order they may be reached
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum State {
    Idle,
    Connected,
    Identified,
    PasswordLoaded,
    Erased,
    Programmed,
    Started,
}

impl State {
    /// The single state reachable from this one
    pub fn next(self) -> Option<State> {
        use State::*;

        match self {
            Idle => Some(Connected),
            Connected => Some(Identified),
            Identified => Some(PasswordLoaded),
            PasswordLoaded => Some(Erased),
            Erased => Some(Programmed),
            Programmed => Some(Started),
            Started => None,
        }
    }
}

#[derive(Clone, PartialEq, Debug, thiserror::Error)]
pub enum Error<SerialError> {
    #[error("serial error: {0:?}")]
    Serial(SerialError),

    #[error("no response from bootloader")]
    NoResponse,

    #[error("bootloader returned error 0x{0:02x}")]
    NegativeAck(u8),

    #[error("firmware ended after {consumed} of {expected} bytes")]
    SourceExhausted { expected: usize, consumed: usize },

    #[error("firmware read failed: {0:?}")]
    Io(std::io::ErrorKind),

    #[error("gpio error: {0}")]
    Gpio(String),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("cannot move from {from:?} to {to:?}")]
    InvalidState { from: State, to: State },

    #[error("link still busy after discarding {discarded} stale bytes")]
    LineBusy { discarded: usize },

    #[error("firmware of {length} bytes exceeds the 32-bit address space")]
    ImageTooLarge { length: usize },

    #[error("session exceeded {limit_ms} ms waiting for the target")]
    SessionTimeout { limit_ms: u32 },
}

/// Terminal failure of a programming run
#[derive(Clone, PartialEq, Debug, thiserror::Error)]
#[error("programming failed at {stage:?}: {reason}")]
pub struct Failure<SerialError> {
    /// State the session was trying to reach
    pub stage: State,
    /// Firmware offset of the block being programmed, for `Programmed` failures
    pub block: Option<u32>,
    pub reason: Error<SerialError>,
}

/// Outcome of a successful programming run
#[derive(Clone, PartialEq, Debug)]
pub struct Summary {
    pub bytes: usize,
    pub blocks: usize,
    /// GetId bytes following the ack
    pub device_id: Vec<u8>,
}

pub type ProgrammingResult<E> = Result<Summary, Failure<E>>;

#[derive(Clone, PartialEq, Debug)]
#[cfg_attr(feature = "structopt", derive(structopt::StructOpt))]
pub struct Options {
    /// Do not drive the target into the bootloader, it is already there
    #[cfg_attr(feature = "structopt", structopt(long))]
    pub no_reset: bool,

    /// Enter the bootloader by sending the software invoke byte instead of toggling pins
    #[cfg_attr(feature = "structopt", structopt(long))]
    pub software_invoke: bool,

    /// Timeout to wait for each bootloader response
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "1000"))]
    pub response_timeout_ms: u32,

    /// Period to poll for bootloader responses
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "1"))]
    pub poll_delay_ms: u32,

    /// Idle period ending a response once bytes have arrived
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "20"))]
    pub idle_gap_ms: u32,

    /// Period to hold invoke before and after the reset pulse
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "500"))]
    pub invoke_hold_ms: u32,

    /// Length of the reset pulse
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "2"))]
    pub reset_pulse_ms: u32,

    /// Period to wait for the target to reboot after a software invoke
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "2000"))]
    pub software_invoke_wait_ms: u32,

    /// Total time to wait on the target across a session, 0 to disable
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "120000"))]
    pub session_timeout_ms: u32,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            no_reset: false,
            software_invoke: false,
            response_timeout_ms: 1000,
            poll_delay_ms: 1,
            idle_gap_ms: 20,
            invoke_hold_ms: 500,
            reset_pulse_ms: 2,
            software_invoke_wait_ms: 2000,
            session_timeout_ms: 120_000,
        }
    }
}

/// Drives a target from reset to a running application.
///
/// Owns the serial port for its lifetime and takes `&mut self` to program, so
/// only one session can ever be in flight.
pub struct Programmer<P, D, I, R, E> {
    options: Options,
    port: P,
    delay: D,
    reset: ResetSequencer<I, R>,
    _err: PhantomData<E>,
}

impl<P, D, I, R, E> Programmer<P, D, I, R, E>
where
    P: Transport<E>,
    D: DelayMs<u32>,
    I: OutputPin,
    R: OutputPin,
    I::Error: Debug,
    R::Error: Debug,
    E: Debug,
{
    /// Create a new programmer instance
    pub fn new(port: P, delay: D, reset: ResetSequencer<I, R>, options: Options) -> Self {
        Self {
            options,
            port,
            delay,
            reset,
            _err: PhantomData,
        }
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Put the target into bootloader mode as configured
    pub fn enter_bootloader(&mut self) -> Result<(), Error<E>> {
        if self.options.no_reset {
            debug!("Skipping bootloader entry");
            return Ok(());
        }

        if self.options.software_invoke {
            reset::software_invoke(&mut self.port, &mut self.delay, &self.options)
        } else {
            self.reset.enter_bootloader(&mut self.delay, &self.options)
        }
    }

    /// Program a firmware image
    pub fn program<F>(&mut self, firmware: &mut F) -> ProgrammingResult<E>
    where
        F: FirmwareSource,
    {
        self.program_with_progress(firmware, |_, _| ())
    }

    /// Program a firmware image, reporting acknowledged bytes as `(done, total)`
    pub fn program_with_progress<F, C>(&mut self, firmware: &mut F, progress: C) -> ProgrammingResult<E>
    where
        F: FirmwareSource,
        C: FnMut(usize, usize),
    {
        info!("Entering bootloader");
        if let Err(e) = self.enter_bootloader() {
            error!("Bootloader entry failed: {}", e);
            return Err(Failure {
                stage: State::Idle,
                block: None,
                reason: e,
            });
        }

        let mut session = BslSession::new(&mut self.port, &mut self.delay, &self.options);
        session.run(firmware, progress)?;

        let summary = Summary {
            bytes: session.offset(),
            blocks: session.blocks(),
            device_id: session.device_id().to_vec(),
        };

        info!(
            "Programmed {} bytes in {} blocks",
            summary.bytes, summary.blocks
        );

        Ok(summary)
    }

    /// Destroy the programmer, returning its resources
    pub fn release(self) -> (P, D, ResetSequencer<I, R>) {
        (self.port, self.delay, self.reset)
    }
}
