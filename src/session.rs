//! BSL command sequence.
//!
//! A session walks `Idle → Connected → Identified → PasswordLoaded → Erased →
//! Programmed → Started` strictly forwards. The first failed transition halts
//! the session; nothing is retried at this layer.

use core::marker::PhantomData;

use embedded_hal::blocking::delay::DelayMs;

use crate::firmware::FirmwareSource;
use crate::protocol::{
    encode, encode_program_data, Command, Frame, Response, ACK_SUCCESS, BLOCK_SIZE,
    DEFAULT_PASSWORD,
};
use crate::transport::{drain, receive, send, Received, Transport};
use crate::{Error, Failure, Options, State};

pub struct BslSession<'a, P, D, E> {
    port: &'a mut P,
    delay: &'a mut D,
    options: &'a Options,

    state: State,
    failed: Option<State>,

    /// Firmware bytes acknowledged by the target
    offset: usize,
    /// Target address of the next block
    address: u32,
    blocks: usize,
    device_id: Vec<u8>,
    waited_ms: u32,

    _err: PhantomData<E>,
}

impl<'a, P, D, E> BslSession<'a, P, D, E>
where
    P: Transport<E>,
    D: DelayMs<u32>,
    E: core::fmt::Debug,
{
    /// Create a session over a port already attached to a target in BSL mode
    pub fn new(port: &'a mut P, delay: &'a mut D, options: &'a Options) -> Self {
        Self {
            port,
            delay,
            options,
            state: State::Idle,
            failed: None,
            offset: 0,
            address: 0,
            blocks: 0,
            device_id: Vec::new(),
            waited_ms: 0,
            _err: PhantomData,
        }
    }

    /// Last state successfully reached
    pub fn state(&self) -> State {
        self.state
    }

    /// State whose transition failed, if any
    pub fn failed(&self) -> Option<State> {
        self.failed
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn address(&self) -> u32 {
        self.address
    }

    pub fn blocks(&self) -> usize {
        self.blocks
    }

    /// GetId bytes following the ack
    pub fn device_id(&self) -> &[u8] {
        &self.device_id
    }

    /// Run the full sequence, stopping at the first failure
    pub fn run<F, C>(&mut self, firmware: &mut F, progress: C) -> Result<(), Failure<E>>
    where
        F: FirmwareSource,
        C: FnMut(usize, usize),
    {
        self.connect().map_err(|e| self.failure(e))?;
        self.identify().map_err(|e| self.failure(e))?;
        self.unlock().map_err(|e| self.failure(e))?;
        self.mass_erase().map_err(|e| self.failure(e))?;
        self.program(firmware, progress).map_err(|e| self.failure(e))?;
        self.start().map_err(|e| self.failure(e))?;

        Ok(())
    }

    /// Idle → Connected
    pub fn connect(&mut self) -> Result<(), Error<E>> {
        self.transition(State::Connected, |s| {
            s.command(Command::Connection, &[]).map(|_| ())
        })
    }

    /// Connected → Identified, returning the number of bytes received.
    ///
    /// The target does not gate this on an ack, so an empty or short reply
    /// still advances the session.
    pub fn identify(&mut self) -> Result<usize, Error<E>> {
        self.transition(State::Identified, |s| {
            let frame = encode(Command::GetId, &[])?;
            let rx = s.exchange(&frame)?;

            info!("GetId response: {} bytes", rx.len());
            if let Response::Reply { extra, .. } = Response::decode(rx.bytes()) {
                s.device_id = extra;
            }

            Ok(rx.len())
        })
    }

    /// Identified → PasswordLoaded, using the default (unset) password
    pub fn unlock(&mut self) -> Result<(), Error<E>> {
        self.transition(State::PasswordLoaded, |s| {
            s.command(Command::LoadPassword, &DEFAULT_PASSWORD).map(|_| ())
        })
    }

    /// PasswordLoaded → Erased
    pub fn mass_erase(&mut self) -> Result<(), Error<E>> {
        self.transition(State::Erased, |s| {
            s.command(Command::MassErase, &[]).map(|_| ())
        })
    }

    /// Erased → Programmed, streaming the image in [`BLOCK_SIZE`] blocks.
    ///
    /// The address only advances once a block is acknowledged, and the first
    /// rejected block ends the session.
    pub fn program<F, C>(&mut self, firmware: &mut F, mut progress: C) -> Result<(), Error<E>>
    where
        F: FirmwareSource,
        C: FnMut(usize, usize),
    {
        self.transition(State::Programmed, |s| {
            let total = firmware.length();
            if total > u32::MAX as usize {
                return Err(Error::ImageTooLarge { length: total });
            }
            let mut block = [0u8; BLOCK_SIZE];

            debug!("Programming {} bytes", total);

            while s.offset < total {
                let want = (total - s.offset).min(BLOCK_SIZE);
                let n = firmware
                    .read_block(&mut block[..want])
                    .map_err(|e| Error::Io(e.kind()))?;

                if n == 0 {
                    return Err(Error::SourceExhausted {
                        expected: total,
                        consumed: s.offset,
                    });
                }

                let frame = encode_program_data(s.address, &block[..n])?;
                let rx = s.exchange(&frame)?;
                check(Response::decode(rx.bytes()))?;

                s.offset += n;
                s.address += n as u32;
                s.blocks += 1;

                progress(s.offset, total);
            }

            Ok(())
        })
    }

    /// Programmed → Started.
    ///
    /// The target resets as soon as it accepts the command, so no reply is
    /// awaited and the session ends here either way.
    pub fn start(&mut self) -> Result<(), Error<E>> {
        self.transition(State::Started, |s| {
            let frame = encode(Command::StartApplication, &[])?;
            trace!("Sending {:?}", frame);

            if let Err(e) = send(&mut *s.port, frame.as_bytes()) {
                warn!("Start application write failed: {}", e);
            }

            Ok(())
        })
    }

    fn transition<T, X>(&mut self, to: State, exec: X) -> Result<T, Error<E>>
    where
        X: FnOnce(&mut Self) -> Result<T, Error<E>>,
    {
        if self.failed.is_some() || self.state.next() != Some(to) {
            return Err(Error::InvalidState {
                from: self.state,
                to,
            });
        }

        match exec(self) {
            Ok(v) => {
                debug!("{:?} -> {:?}", self.state, to);
                self.state = to;
                Ok(v)
            }
            Err(e) => {
                error!("{:?} -> {:?} failed: {}", self.state, to, e);
                self.failed = Some(to);
                Err(e)
            }
        }
    }

    /// Send a command and require a success ack, returning any extra bytes
    fn command(&mut self, command: Command, payload: &[u8]) -> Result<Vec<u8>, Error<E>> {
        let frame = encode(command, payload)?;
        let rx = self.exchange(&frame)?;

        check(Response::decode(rx.bytes()))
    }

    fn exchange(&mut self, frame: &Frame) -> Result<Received, Error<E>> {
        self.check_deadline()?;

        let stale = drain(&mut *self.port, &mut *self.delay, self.options)?;
        self.waited_ms = self.waited_ms.saturating_add(stale.waited_ms);

        trace!("Sending {:?}", frame);
        send(&mut *self.port, frame.as_bytes())?;

        let rx = receive(&mut *self.port, &mut *self.delay, self.options)?;
        self.waited_ms = self.waited_ms.saturating_add(rx.waited_ms);

        self.check_deadline()?;

        Ok(rx)
    }

    fn check_deadline(&self) -> Result<(), Error<E>> {
        let limit_ms = self.options.session_timeout_ms;
        if limit_ms > 0 && self.waited_ms > limit_ms {
            return Err(Error::SessionTimeout { limit_ms });
        }
        Ok(())
    }

    fn failure(&self, reason: Error<E>) -> Failure<E> {
        let stage = self.failed.unwrap_or(self.state);
        let block = match stage {
            State::Programmed => Some(self.offset as u32),
            _ => None,
        };

        Failure {
            stage,
            block,
            reason,
        }
    }
}

fn check<E>(response: Response) -> Result<Vec<u8>, Error<E>> {
    match response {
        Response::NoResponse => Err(Error::NoResponse),
        Response::Reply { ack, extra } if ack == ACK_SUCCESS => Ok(extra),
        Response::Reply { ack, .. } => Err(Error::NegativeAck(ack)),
    }
}
