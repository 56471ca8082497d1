//! Serial link primitives.
//!
//! All reads poll the port and sleep `poll_delay_ms` between attempts, so every
//! wait is bounded by the configured timeouts rather than by the target.

use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::serial::{Read, Write};

use crate::protocol::MAX_FRAME;
use crate::{Error, Options};

/// Serial link to the target. Any embedded-hal serial port qualifies.
pub trait Transport<E>: Write<u8, Error = E> + Read<u8, Error = E> {}

impl<T, E> Transport<E> for T where T: Write<u8, Error = E> + Read<u8, Error = E> {}

/// Bytes collected from a single read window
#[derive(Clone)]
pub struct Received {
    buf: [u8; MAX_FRAME],
    len: usize,
    /// Milliseconds spent waiting within the window
    pub waited_ms: u32,
}

impl Received {
    pub fn bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Write all bytes and flush the port
pub fn send<P, E>(port: &mut P, data: &[u8]) -> Result<(), Error<E>>
where
    P: Transport<E>,
{
    for b in data {
        block!(port.write(*b)).map_err(Error::Serial)?;
    }
    block!(port.flush()).map_err(Error::Serial)?;

    Ok(())
}

/// Bytes discarded ahead of a command
#[derive(Clone, Copy, Debug, PartialEq, Default)]
pub struct Drained {
    pub bytes: usize,
    /// Milliseconds spent waiting for the link to go quiet
    pub waited_ms: u32,
}

/// Upper bound on stale bytes dropped before the link is declared busy
pub const DRAIN_LIMIT: usize = 16 * MAX_FRAME;

/// Discard anything already pending on the link.
///
/// Once stale bytes are seen the link must then stay quiet for `idle_gap_ms`
/// before a command may be sent. A link that keeps talking past
/// `response_timeout_ms` or [`DRAIN_LIMIT`] bytes fails with `LineBusy`, so
/// leftover bytes are never mistaken for a reply.
pub fn drain<P, D, E>(port: &mut P, delay: &mut D, options: &Options) -> Result<Drained, Error<E>>
where
    P: Transport<E>,
    D: DelayMs<u32>,
{
    let mut d = Drained::default();
    let mut quiet = 0;
    let poll = options.poll_delay_ms.max(1);

    loop {
        match port.read() {
            Ok(_) => {
                d.bytes += 1;
                quiet = 0;

                if d.bytes >= DRAIN_LIMIT {
                    return Err(Error::LineBusy { discarded: d.bytes });
                }
                continue;
            }
            Err(nb::Error::WouldBlock) => (),
            Err(nb::Error::Other(e)) => return Err(Error::Serial(e)),
        }

        if d.bytes == 0 || quiet >= options.idle_gap_ms {
            break;
        }

        if d.waited_ms >= options.response_timeout_ms {
            return Err(Error::LineBusy { discarded: d.bytes });
        }

        delay.delay_ms(poll);
        d.waited_ms += poll;
        quiet += poll;
    }

    if d.bytes > 0 {
        warn!("Discarded {} stale bytes", d.bytes);
    }

    Ok(d)
}

/// Collect a response.
///
/// Waits up to `response_timeout_ms` in total. Once bytes start arriving the
/// window closes early when the link stays idle for `idle_gap_ms` or the
/// frame buffer fills. An empty result means nothing arrived in time.
pub fn receive<P, D, E>(port: &mut P, delay: &mut D, options: &Options) -> Result<Received, Error<E>>
where
    P: Transport<E>,
    D: DelayMs<u32>,
{
    let mut rx = Received {
        buf: [0u8; MAX_FRAME],
        len: 0,
        waited_ms: 0,
    };
    let mut idle = 0;
    let poll = options.poll_delay_ms.max(1);

    loop {
        match port.read() {
            Ok(v) => {
                rx.buf[rx.len] = v;
                rx.len += 1;
                idle = 0;

                if rx.len == MAX_FRAME {
                    break;
                }
                continue;
            }
            Err(nb::Error::WouldBlock) => (),
            Err(nb::Error::Other(e)) => return Err(Error::Serial(e)),
        }

        if rx.len > 0 && idle >= options.idle_gap_ms {
            break;
        }

        if rx.waited_ms >= options.response_timeout_ms {
            if rx.len == 0 {
                debug!("Receive timeout after {} ms", rx.waited_ms);
            }
            break;
        }

        delay.delay_ms(poll);
        rx.waited_ms += poll;
        if rx.len > 0 {
            idle += poll;
        }
    }

    trace!("Received {:02x?}", rx.bytes());

    Ok(rx)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    use std::collections::VecDeque;

    use embedded_hal_mock::delay::MockNoop;
    use embedded_hal_mock::serial::{Mock as SerialMock, Transaction};

    use crate::protocol::{decode_frame, encode, Command, CRC_LEN};

    /// Delay that only counts the milliseconds requested
    #[derive(Default)]
    pub struct CountingDelay {
        pub total_ms: u32,
    }

    impl DelayMs<u32> for CountingDelay {
        fn delay_ms(&mut self, ms: u32) {
            self.total_ms += ms;
        }
    }

    /// Scripted target. Each complete frame written is recorded and answered
    /// with the next queued reply; `None` leaves the frame unanswered.
    #[derive(Default)]
    pub struct FakeTarget {
        pending: Vec<u8>,
        pub frames: Vec<Vec<u8>>,
        pub replies: VecDeque<Option<Vec<u8>>>,
        pub rx: VecDeque<u8>,
    }

    impl FakeTarget {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn reply(mut self, ack: u8) -> Self {
            self.replies.push_back(Some(ack_reply(ack, &[])));
            self
        }

        pub fn reply_with(mut self, ack: u8, extra: &[u8]) -> Self {
            self.replies.push_back(Some(ack_reply(ack, extra)));
            self
        }

        pub fn silent(mut self) -> Self {
            self.replies.push_back(None);
            self
        }

        /// Commands of every frame written so far
        pub fn commands(&self) -> Vec<Command> {
            self.frames
                .iter()
                .filter_map(|f| decode_frame(f).ok().map(|(c, _)| c))
                .collect()
        }

        /// Payloads of every ProgramData frame written so far
        pub fn program_payloads(&self) -> Vec<Vec<u8>> {
            self.frames
                .iter()
                .filter_map(|f| match decode_frame(f) {
                    Ok((Command::ProgramData, p)) => Some(p.to_vec()),
                    _ => None,
                })
                .collect()
        }
    }

    /// A BSL style reply with the ack at byte four
    pub fn ack_reply(ack: u8, extra: &[u8]) -> Vec<u8> {
        let mut r = vec![0x00, 0x08, 0x02, 0x00, ack];
        r.extend_from_slice(extra);
        r
    }

    impl Write<u8> for FakeTarget {
        type Error = ();

        fn write(&mut self, word: u8) -> nb::Result<(), ()> {
            self.pending.push(word);

            // Raw bytes ahead of a frame header (software invoke) are passed through
            if self.pending[0] != crate::protocol::HEADER {
                self.frames.push(self.pending.split_off(0));
                return Ok(());
            }

            if self.pending.len() >= 3 {
                let body = u16::from_le_bytes([self.pending[1], self.pending[2]]) as usize;
                if self.pending.len() == 3 + body + CRC_LEN {
                    let frame = self.pending.split_off(0);
                    self.frames.push(frame);
                    if let Some(Some(r)) = self.replies.pop_front() {
                        self.rx.extend(r);
                    }
                }
            }
            Ok(())
        }

        fn flush(&mut self) -> nb::Result<(), ()> {
            Ok(())
        }
    }

    impl Read<u8> for FakeTarget {
        type Error = ();

        fn read(&mut self) -> nb::Result<u8, ()> {
            self.rx.pop_front().ok_or(nb::Error::WouldBlock)
        }
    }

    #[test]
    fn send_writes_frame_bytes() {
        let f = encode(Command::Connection, &[]).unwrap();
        let expectations = [Transaction::write_many(f.as_bytes()), Transaction::flush()];
        let mut port = SerialMock::new(&expectations);

        send(&mut port, f.as_bytes()).unwrap();

        port.done();
    }

    #[test]
    fn drain_discards_pending_bytes() {
        let expectations = [
            Transaction::read_many(&[0x01, 0x02]),
            Transaction::read_error(nb::Error::WouldBlock),
            Transaction::read_error(nb::Error::WouldBlock),
        ];
        let mut port = SerialMock::new(&expectations);
        let options = Options {
            idle_gap_ms: 1,
            ..Options::default()
        };

        let d = drain(&mut port, &mut MockNoop::new(), &options).unwrap();
        assert_eq!(d, Drained { bytes: 2, waited_ms: 1 });

        port.done();
    }

    #[test]
    fn drain_empties_backlog_larger_than_a_frame() {
        let mut port = FakeTarget::new();
        port.rx.extend(std::iter::repeat(0x00).take(3 * MAX_FRAME));
        let mut delay = CountingDelay::default();
        let options = Options::default();

        let d = drain(&mut port, &mut delay, &options).unwrap();

        assert_eq!(d.bytes, 3 * MAX_FRAME);
        assert_eq!(d.waited_ms, options.idle_gap_ms);
        assert!(port.rx.is_empty());
    }

    #[test]
    fn drain_idle_link_does_not_wait() {
        let mut port = FakeTarget::new();
        let mut delay = CountingDelay::default();

        let d = drain(&mut port, &mut delay, &Options::default()).unwrap();

        assert_eq!(d, Drained::default());
        assert_eq!(delay.total_ms, 0);
    }

    /// Port that never stops producing bytes
    struct Chatter;

    impl Read<u8> for Chatter {
        type Error = ();

        fn read(&mut self) -> nb::Result<u8, ()> {
            Ok(0x00)
        }
    }

    impl Write<u8> for Chatter {
        type Error = ();

        fn write(&mut self, _word: u8) -> nb::Result<(), ()> {
            Ok(())
        }

        fn flush(&mut self) -> nb::Result<(), ()> {
            Ok(())
        }
    }

    /// Port producing one byte every other poll, never idle for long
    #[derive(Default)]
    struct Trickle {
        toggle: bool,
    }

    impl Read<u8> for Trickle {
        type Error = ();

        fn read(&mut self) -> nb::Result<u8, ()> {
            self.toggle = !self.toggle;
            if self.toggle {
                Ok(0x00)
            } else {
                Err(nb::Error::WouldBlock)
            }
        }
    }

    impl Write<u8> for Trickle {
        type Error = ();

        fn write(&mut self, _word: u8) -> nb::Result<(), ()> {
            Ok(())
        }

        fn flush(&mut self) -> nb::Result<(), ()> {
            Ok(())
        }
    }

    #[test]
    fn drain_rejects_endless_stream() {
        let r = drain(&mut Chatter, &mut CountingDelay::default(), &Options::default());
        assert_eq!(r, Err(Error::LineBusy { discarded: DRAIN_LIMIT }));
    }

    #[test]
    fn drain_rejects_link_that_never_goes_quiet() {
        let mut delay = CountingDelay::default();
        let options = Options::default();

        let r = drain(&mut Trickle::default(), &mut delay, &options);

        assert!(matches!(r, Err(Error::LineBusy { .. })));
        assert!(delay.total_ms <= options.response_timeout_ms);
    }

    #[test]
    fn receive_collects_reply() {
        let mut port = FakeTarget::new();
        port.rx.extend(ack_reply(0x00, &[0xAB, 0xCD]));
        let mut delay = MockNoop::new();

        let rx = receive(&mut port, &mut delay, &Options::default()).unwrap();

        assert_eq!(rx.bytes(), &[0x00, 0x08, 0x02, 0x00, 0x00, 0xAB, 0xCD]);
    }

    #[test]
    fn receive_times_out_when_link_is_silent() {
        let mut port = FakeTarget::new();
        let mut delay = CountingDelay::default();
        let options = Options::default();

        let rx = receive(&mut port, &mut delay, &options).unwrap();

        assert!(rx.is_empty());
        assert_eq!(rx.waited_ms, options.response_timeout_ms);
        assert_eq!(delay.total_ms, options.response_timeout_ms);
    }

    #[test]
    fn receive_stops_on_full_frame() {
        let mut port = FakeTarget::new();
        port.rx.extend(std::iter::repeat(0x55).take(MAX_FRAME + 10));
        let mut delay = CountingDelay::default();

        let rx = receive(&mut port, &mut delay, &Options::default()).unwrap();

        assert_eq!(rx.len(), MAX_FRAME);
        assert_eq!(delay.total_ms, 0);
    }

    #[test]
    fn receive_propagates_serial_errors() {
        let expectations = [Transaction::read_error(nb::Error::Other(
            embedded_hal_mock::MockError::Io(std::io::ErrorKind::BrokenPipe),
        ))];
        let mut port = SerialMock::new(&expectations);
        let mut delay = MockNoop::new();

        let r = receive(&mut port, &mut delay, &Options::default());
        assert!(matches!(r, Err(Error::Serial(_))));

        port.done();
    }
}
