//! Wire format of the SwiMux link
//!
//! ## Framing
//!
//! Frames are delimited SLIP style: an `END` byte opens and closes every
//! frame, and inside the frame `END` and `ESC` are replaced by two-byte
//! escape sequences:
//!
//! | byte   | on the wire        |
//! | :---   | :---               |
//! | `0xC0` | `0xDB 0xDC`        |
//! | `0xDB` | `0xDB 0xDD`        |
//!
//! Bytes received outside of a frame are line noise and are dropped. Two
//! back-to-back `END`s form an empty frame, which is ignored, so sending a
//! few `END`s is always a safe way to resynchronize the receiver.
//!
//! ## Payload
//!
//! Every payload starts with an [`Opcode`] followed by its bitwise
//! complement. A payload that fails this check is treated as a corrupted
//! frame, never as a message.
//!
//! ```text
//! [ opcode | !opcode | body... ]
//! ```

use embassy_time::{with_timeout, Duration, TimeoutError, Timer};
use futures::FutureExt;
use heapless::Vec;

use crate::{Error, SwiSerial};

/// Frame delimiter
pub const END: u8 = 0xC0;
/// Escape introducer
pub const ESC: u8 = 0xDB;
/// Escaped `END`
pub const ESC_END: u8 = 0xDC;
/// Escaped `ESC`
pub const ESC_ESC: u8 = 0xDD;

/// Largest decoded payload, opcode and complement included
pub const MAX_PAYLOAD: usize = 160;
/// Largest encoded frame: every byte escaped, plus both delimiters
pub const MAX_FRAME: usize = 2 * MAX_PAYLOAD + 2;

/// Number of `END` bytes sent to resynchronize the SwiMux receiver
const RESYNC_ENDS: usize = 4;
/// Time given to the SwiMux to settle after a resync
const RESYNC_DELAY: Duration = Duration::from_millis(2);

/// Message opcodes of the SwiMux protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
pub enum Opcode {
    /// Acknowledge. Body: `[acked opcode]`
    Ack,
    /// Negative acknowledge. Body: `[device error, rejected opcode]`
    Nack,
    /// Answer to [`Opcode::GetUid`]. Body: `[bus, uid (LE u64)]`
    HaveUid,
    /// Presence query, answered with a two byte bitmap of occupied buses
    GetPresence,
    /// Roll call, answered with the six bus UIDs as LE u64s
    RollCall,
    /// UID query for one bus. Body: `[bus]`
    GetUid,
    /// Wake the SwiMux, answered with an ACK
    Wakeup,
    /// Put the SwiMux to sleep, answered with an ACK
    Sleep,
    /// Read request `[bus, offset, len]`, answered by
    /// `[bus, offset, len, data...]` under the same opcode
    ReadBytes,
    /// Write request `[bus, offset, len, data...]`, answered with an ACK
    WriteBytes,
}

impl Opcode {
    const ACK: u8 = 0x06;
    const NACK: u8 = 0x15;
    const HAVE_UID: u8 = 0x48;
    const GET_PRESENCE: u8 = 0x50;
    const ROLL_CALL: u8 = 0x52;
    const GET_UID: u8 = 0x55;
    const WAKEUP: u8 = 0x57;
    const SLEEP: u8 = 0x5A;
    const READ_BYTES: u8 = 0x72;
    const WRITE_BYTES: u8 = 0x77;
}

impl TryFrom<u8> for Opcode {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            Self::ACK => Ok(Opcode::Ack),
            Self::NACK => Ok(Opcode::Nack),
            Self::HAVE_UID => Ok(Opcode::HaveUid),
            Self::GET_PRESENCE => Ok(Opcode::GetPresence),
            Self::ROLL_CALL => Ok(Opcode::RollCall),
            Self::GET_UID => Ok(Opcode::GetUid),
            Self::WAKEUP => Ok(Opcode::Wakeup),
            Self::SLEEP => Ok(Opcode::Sleep),
            Self::READ_BYTES => Ok(Opcode::ReadBytes),
            Self::WRITE_BYTES => Ok(Opcode::WriteBytes),
            _ => Err(WireError::UnknownOpcode),
        }
    }
}

impl From<Opcode> for u8 {
    fn from(val: Opcode) -> Self {
        match val {
            Opcode::Ack => Opcode::ACK,
            Opcode::Nack => Opcode::NACK,
            Opcode::HaveUid => Opcode::HAVE_UID,
            Opcode::GetPresence => Opcode::GET_PRESENCE,
            Opcode::RollCall => Opcode::ROLL_CALL,
            Opcode::GetUid => Opcode::GET_UID,
            Opcode::Wakeup => Opcode::WAKEUP,
            Opcode::Sleep => Opcode::SLEEP,
            Opcode::ReadBytes => Opcode::READ_BYTES,
            Opcode::WriteBytes => Opcode::WRITE_BYTES,
        }
    }
}

/// Frame level errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
#[non_exhaustive]
pub enum WireError {
    /// `ESC` followed by something other than `ESC_END` or `ESC_ESC`
    WrongEscape,
    /// The frame does not fit in [`MAX_PAYLOAD`]
    Overflow,
    /// The payload is shorter than opcode plus complement
    TooShort,
    /// The second payload byte is not the complement of the first
    BadComplement,
    /// The opcode is not part of the protocol
    UnknownOpcode,
}

/// A decoded, validated frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Frame<'a> {
    /// Opcode of the message
    pub opcode: Opcode,
    /// Everything after the opcode and its complement
    pub body: &'a [u8],
}

/// Encode one message into a complete frame, delimiters included.
pub fn encode(opcode: Opcode, body: &[u8], out: &mut Vec<u8, MAX_FRAME>) -> Result<(), WireError> {
    if body.len() + 2 > MAX_PAYLOAD {
        return Err(WireError::Overflow);
    }
    let op = u8::from(opcode);

    out.clear();
    out.push(END).map_err(|_| WireError::Overflow)?;
    for &b in [op, !op].iter().chain(body.iter()) {
        let res = match b {
            END => out.extend_from_slice(&[ESC, ESC_END]),
            ESC => out.extend_from_slice(&[ESC, ESC_ESC]),
            other => out.push(other).map_err(drop),
        };
        res.map_err(|_| WireError::Overflow)?;
    }
    out.push(END).map_err(|_| WireError::Overflow)
}

/// Result of feeding one byte to a [`FrameDecoder`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeStatus {
    /// More bytes are needed
    Pending,
    /// A complete, valid frame is available through [`FrameDecoder::frame`]
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Receiving,
    Escaped,
    Complete,
}

/// Streaming frame decoder, fed one byte at a time
pub struct FrameDecoder {
    state: State,
    buf: Vec<u8, MAX_PAYLOAD>,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    /// A decoder waiting for the start of a frame
    pub const fn new() -> Self {
        Self {
            state: State::Idle,
            buf: Vec::new(),
        }
    }

    /// Drop any partial frame and wait for the next `END`.
    pub fn reset(&mut self) {
        self.state = State::Idle;
        self.buf.clear();
    }

    /// Feed one received byte.
    ///
    /// After an error, the partial frame is dropped and decoding restarts by
    /// itself. After [`DecodeStatus::Done`], the frame stays available until
    /// the next call.
    pub fn push(&mut self, byte: u8) -> Result<DecodeStatus, WireError> {
        if self.state == State::Complete {
            // The closing END of a frame also opens the next one
            self.buf.clear();
            self.state = State::Receiving;
        }

        match (self.state, byte) {
            (State::Idle, END) => self.state = State::Receiving,
            (State::Idle, _) => {}
            (State::Receiving, END) if self.buf.is_empty() => {}
            (State::Receiving, END) => return self.complete(),
            (State::Receiving, ESC) => self.state = State::Escaped,
            (State::Receiving, b) => self.store(b)?,
            (State::Escaped, ESC_END) => {
                self.state = State::Receiving;
                self.store(END)?;
            }
            (State::Escaped, ESC_ESC) => {
                self.state = State::Receiving;
                self.store(ESC)?;
            }
            (State::Escaped, b) => {
                self.buf.clear();
                self.state = if b == END { State::Receiving } else { State::Idle };
                return Err(WireError::WrongEscape);
            }
            // Left by the reset above
            (State::Complete, _) => {}
        }
        Ok(DecodeStatus::Pending)
    }

    /// The last complete frame, if the last byte pushed completed one
    pub fn frame(&self) -> Option<Frame<'_>> {
        if self.state != State::Complete {
            return None;
        }
        let (op, rest) = self.buf.split_first()?;
        Some(Frame {
            opcode: Opcode::try_from(*op).ok()?,
            body: rest.get(1..)?,
        })
    }

    fn store(&mut self, byte: u8) -> Result<(), WireError> {
        self.buf.push(byte).map_err(|_| {
            self.buf.clear();
            self.state = State::Idle;
            WireError::Overflow
        })
    }

    fn complete(&mut self) -> Result<DecodeStatus, WireError> {
        let res = match self.buf.as_slice() {
            [] | [_] => Err(WireError::TooShort),
            [op, cpl, ..] if *cpl != !*op => Err(WireError::BadComplement),
            [op, ..] => Opcode::try_from(*op).map(|_| DecodeStatus::Done),
        };
        match res {
            Ok(_) => self.state = State::Complete,
            Err(_) => self.buf.clear(),
        }
        res
    }
}

/// A framed connection to the SwiMux
pub struct Link<S: SwiSerial> {
    serial: S,
    decoder: FrameDecoder,
}

impl<S: SwiSerial> Link<S> {
    /// Wrap a serial port
    pub fn new(serial: S) -> Self {
        Self {
            serial,
            decoder: FrameDecoder::new(),
        }
    }

    /// Give the serial port back
    pub fn into_inner(self) -> S {
        self.serial
    }

    /// Encode and send one message.
    pub async fn send(&mut self, opcode: Opcode, body: &[u8]) -> Result<(), Error<S::SerError>> {
        let mut out = Vec::new();
        encode(opcode, body, &mut out).map_err(Error::Framing)?;
        tank_trace!("tx {=u8:#x} len {=usize}", u8::from(opcode), body.len());
        self.serial.write_all(&out).await
    }

    /// Drop everything received so far, decoded or not.
    pub fn drain(&mut self) {
        self.serial.discard_input();
        while let Some(Ok(_)) = self.serial.read_byte().now_or_never() {}
        self.decoder.reset();
    }

    /// Put the SwiMux receiver back at a frame boundary, and our own decoder
    /// in a clean state.
    pub async fn resync(&mut self) -> Result<(), Error<S::SerError>> {
        self.serial.write_all(&[END; RESYNC_ENDS]).await?;
        Timer::after(RESYNC_DELAY).await;
        self.decoder.reset();
        Ok(())
    }

    /// Wait until a frame accepted by `accept` arrives, as an answer to
    /// `request`, for at most `timeout`.
    ///
    /// A NACK of `request` ends the wait with [`Error::Nack`]. Other frames
    /// are skipped. On timeout, the error reports what went wrong last:
    /// a framing error, an unexpected frame, or silence.
    pub async fn await_reply<F>(
        &mut self,
        request: Opcode,
        timeout: Duration,
        mut accept: F,
    ) -> Result<Frame<'_>, Error<S::SerError>>
    where
        F: FnMut(&Frame<'_>) -> bool,
    {
        let mut framing = None;
        let mut stray = false;
        let serial = &mut self.serial;
        let decoder = &mut self.decoder;

        let wait = async {
            loop {
                read_frame(serial, decoder, &mut framing).await?;
                let Some(frame) = decoder.frame() else {
                    continue;
                };
                if frame.opcode == Opcode::Nack {
                    if let [code, rejected, ..] = *frame.body {
                        if rejected == u8::from(request) {
                            return Err(Error::Nack(code));
                        }
                    }
                } else if accept(&frame) {
                    return Ok(());
                }
                tank_debug!("skipping stray frame {=u8:#x}", u8::from(frame.opcode));
                stray = true;
            }
        };

        let res = with_timeout(timeout, wait).await;
        match res {
            Ok(Ok(())) => self.decoder.frame().ok_or(Error::BadPayload),
            Ok(Err(e)) => Err(e),
            Err(TimeoutError) => Err(match (framing, stray) {
                (Some(e), _) => Error::Framing(e),
                (None, true) => Error::BadPayload,
                (None, false) => Error::TimedOut,
            }),
        }
    }

    /// Wait for the ACK of `opcode`.
    pub async fn wait_for_ack_to(&mut self, opcode: Opcode, timeout: Duration) -> Result<(), Error<S::SerError>> {
        let op = u8::from(opcode);
        self.await_reply(opcode, timeout, |f| {
            f.opcode == Opcode::Ack && f.body.first() == Some(&op)
        })
        .await
        .map(drop)
    }
}

/// Read bytes until the decoder completes a valid frame. Framing errors are
/// recorded in `framing`, and decoding goes on.
async fn read_frame<S: SwiSerial>(
    serial: &mut S,
    decoder: &mut FrameDecoder,
    framing: &mut Option<WireError>,
) -> Result<(), Error<S::SerError>> {
    loop {
        let byte = serial.read_byte().await?;
        match decoder.push(byte) {
            Ok(DecodeStatus::Done) => return Ok(()),
            Ok(DecodeStatus::Pending) => {}
            Err(e) => {
                tank_warn!("framing error: {}", e);
                *framing = Some(e);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use core::task::Poll;
    use embassy_futures::block_on;
    use std::collections::VecDeque;

    fn decode_all(dec: &mut FrameDecoder, bytes: &[u8]) -> std::vec::Vec<Result<DecodeStatus, WireError>> {
        bytes.iter().map(|b| dec.push(*b)).collect()
    }

    #[test]
    fn escaping() {
        let mut out = Vec::new();
        encode(Opcode::WriteBytes, &[1, END, 2, ESC, 3], &mut out).unwrap();
        assert_eq!(
            out.as_slice(),
            &[END, 0x77, 0x88, 1, ESC, ESC_END, 2, ESC, ESC_ESC, 3, END]
        );

        let mut dec = FrameDecoder::new();
        let res = decode_all(&mut dec, &out);
        assert_eq!(res.last(), Some(&Ok(DecodeStatus::Done)));
        assert_eq!(
            dec.frame(),
            Some(Frame {
                opcode: Opcode::WriteBytes,
                body: &[1, END, 2, ESC, 3]
            })
        );
        // Gone as soon as the next byte arrives
        dec.push(0x00).unwrap();
        assert_eq!(dec.frame(), None);
    }

    #[test]
    fn opcodes() {
        for raw in 0..=255u8 {
            if let Ok(op) = Opcode::try_from(raw) {
                assert_eq!(u8::from(op), raw);
            }
        }
        assert_eq!(Opcode::try_from(0x77), Ok(Opcode::WriteBytes));
        assert_eq!(Opcode::try_from(0x00), Err(WireError::UnknownOpcode));

        let mut out = Vec::new();
        encode(Opcode::Ack, &[], &mut out).unwrap();
        assert_eq!(out.as_slice(), &[END, 0x06, 0xF9, END]);
    }

    #[test]
    fn noise_and_empty_frames() {
        let mut dec = FrameDecoder::new();
        let stream = [0x12, 0x34, END, END, END, 0x57, 0xA8, END];
        let res = decode_all(&mut dec, &stream);
        assert!(res[..7].iter().all(|r| *r == Ok(DecodeStatus::Pending)));
        assert_eq!(res[7], Ok(DecodeStatus::Done));
        assert_eq!(dec.frame().map(|f| f.opcode), Some(Opcode::Wakeup));
    }

    #[test]
    fn back_to_back_frames_share_end() {
        let mut dec = FrameDecoder::new();
        let stream = [END, 0x06, 0xF9, 0x57, END, 0x50, 0xAF, 0x05, 0x00, END];
        let done: std::vec::Vec<usize> = decode_all(&mut dec, &stream)
            .iter()
            .enumerate()
            .filter(|(_, r)| **r == Ok(DecodeStatus::Done))
            .map(|(i, _)| i)
            .collect();
        assert_eq!(done, [4, 9]);
        let f = dec.frame().unwrap();
        assert_eq!(f.opcode, Opcode::GetPresence);
        assert_eq!(f.body, &[0x05, 0x00]);
    }

    #[test]
    fn decode_errors() {
        let mut dec = FrameDecoder::new();

        let res = decode_all(&mut dec, &[END, 0x06, ESC, 0x01]);
        assert_eq!(res[3], Err(WireError::WrongEscape));

        let res = decode_all(&mut dec, &[END, 0x06, 0x07, END]);
        assert_eq!(res[3], Err(WireError::BadComplement));

        let res = decode_all(&mut dec, &[END, 0x01, 0xFE, END]);
        assert_eq!(res[3], Err(WireError::UnknownOpcode));

        let res = decode_all(&mut dec, &[END, 0x06, END]);
        assert_eq!(res[2], Err(WireError::TooShort));

        let mut long = std::vec![END];
        long.extend(core::iter::repeat(0x11).take(MAX_PAYLOAD + 1));
        let res = decode_all(&mut dec, &long);
        assert_eq!(res.last(), Some(&Err(WireError::Overflow)));

        // And the decoder recovers on the next frame
        let res = decode_all(&mut dec, &[END, 0x57, 0xA8, END]);
        assert_eq!(res.last(), Some(&Ok(DecodeStatus::Done)));
    }

    #[test]
    fn oversized_body_is_rejected() {
        let mut out = Vec::new();
        let body = [0u8; MAX_PAYLOAD - 1];
        assert_eq!(encode(Opcode::WriteBytes, &body, &mut out), Err(WireError::Overflow));
        // Worst case, everything escaped, still fits
        let body = [END; MAX_PAYLOAD - 2];
        assert_eq!(encode(Opcode::WriteBytes, &body, &mut out), Ok(()));
    }

    /// Serial port replaying canned bytes, recording what is written
    #[derive(Default)]
    struct Script {
        rx: VecDeque<u8>,
        tx: std::vec::Vec<u8>,
    }

    impl SwiSerial for Script {
        type SerError = ();

        async fn write_all(&mut self, data: &[u8]) -> Result<(), Error<()>> {
            self.tx.extend_from_slice(data);
            Ok(())
        }

        async fn read_byte(&mut self) -> Result<u8, Error<()>> {
            core::future::poll_fn(|_| match self.rx.pop_front() {
                Some(b) => Poll::Ready(Ok(b)),
                None => Poll::Pending,
            })
            .await
        }

        fn discard_input(&mut self) {}
    }

    fn link_with(rx: &[u8]) -> Link<Script> {
        Link::new(Script {
            rx: rx.iter().copied().collect(),
            tx: std::vec::Vec::new(),
        })
    }

    const TIMEOUT: Duration = Duration::from_millis(20);

    #[test]
    fn ack_is_matched_to_its_opcode() {
        // A stale ACK of a wakeup, then the ACK we wait for
        let mut link = link_with(&[END, 0x06, 0xF9, 0x57, END, END, 0x06, 0xF9, 0x77, END]);
        assert_eq!(block_on(link.wait_for_ack_to(Opcode::WriteBytes, TIMEOUT)), Ok(()));
    }

    #[test]
    fn ack_failures() {
        let mut link = link_with(&[]);
        assert_eq!(
            block_on(link.wait_for_ack_to(Opcode::Wakeup, TIMEOUT)),
            Err(Error::TimedOut)
        );

        let mut link = link_with(&[END, 0x06, 0xF9, 0x57, END]);
        assert_eq!(
            block_on(link.wait_for_ack_to(Opcode::WriteBytes, TIMEOUT)),
            Err(Error::BadPayload)
        );

        let mut link = link_with(&[END, 0x06, 0x00, 0x77, END]);
        assert_eq!(
            block_on(link.wait_for_ack_to(Opcode::WriteBytes, TIMEOUT)),
            Err(Error::Framing(WireError::BadComplement))
        );

        let mut link = link_with(&[END, 0x15, 0xEA, 0x03, 0x77, END]);
        assert_eq!(
            block_on(link.wait_for_ack_to(Opcode::WriteBytes, TIMEOUT)),
            Err(Error::Nack(3))
        );
    }

    #[test]
    fn resync_and_drain() {
        let mut link = link_with(&[0x01, 0x02, 0x03]);
        link.decoder.push(END).unwrap();
        link.decoder.push(0x06).unwrap();
        link.drain();
        assert!(link.serial.rx.is_empty());
        assert_eq!(link.decoder.state, State::Idle);

        block_on(link.send(Opcode::Wakeup, &[])).unwrap();
        block_on(link.resync()).unwrap();
        let tx = link.into_inner().tx;
        assert_eq!(tx, [END, 0x57, 0xA8, END, END, END, END, END]);
    }
}
