//! SwiMux bus transport
//!
//! The SwiMux is a co-processor bridging our UART to six 1-Wire buses. It
//! sleeps when idle and must be woken up before each exchange, which
//! [`SwiMux::assert_awake`] takes care of. Every operation here wakes it up
//! first.
//!
//! Only the wake handshake retries internally. Any other failure is handed
//! to the caller, which decides about retrying.

use embassy_time::Duration;
use heapless::Vec;

use crate::wire::{Link, Opcode, MAX_PAYLOAD};
use crate::{Error, SwiSerial, ALL_BUSES, BUS_COUNT};

/// Number of wakeup requests sent before declaring the SwiMux absent
pub const WAKE_RETRIES: u8 = 3;

/// UID reported for an empty bus, once normalized
pub const NO_UID: u64 = 0;

/// Header of read and write bodies: bus, offset, length
const XFER_HEADER: usize = 3;

/// Largest single read or write
pub const MAX_XFER: usize = MAX_PAYLOAD - 2 - XFER_HEADER;

/// Bits per UART byte, 8N1
const BITS_PER_BYTE: u64 = 10;
/// One 1-Wire byte at standard speed: 8 slots of 65 us
const ONE_WIRE_BYTE_US: u64 = 520;
/// 1-Wire reset and presence detect
const ONE_WIRE_RESET_US: u64 = 960;
/// EEPROM programming time per page
const EEPROM_PAGE_PROG_US: u64 = 10_000;
/// EEPROM page size
const EEPROM_PAGE: usize = 8;
/// SwiMux firmware turnaround, on top of the computed transfer times
const TURNAROUND_US: u64 = 5_000;

/// Bitmap of the occupied buses, as seen by the SwiMux
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PresenceReport {
    /// One bit per bus, set if a device answered its reset pulse
    pub map: u8,
    /// Number of occupied buses
    pub count: u8,
}

impl PresenceReport {
    /// Build a report from a raw map. Bits above [`BUS_COUNT`] are dropped.
    pub fn from_map(map: u16) -> Self {
        let map = (map as u8) & ALL_BUSES;
        Self {
            map,
            count: map.count_ones() as u8,
        }
    }

    /// Is `bus` occupied?
    pub fn is_present(&self, bus: u8) -> bool {
        (bus as usize) < BUS_COUNT && (self.map & (1 << bus)) != 0
    }

    /// Buses whose occupancy differs between the two reports
    pub fn changed(&self, other: &PresenceReport) -> u8 {
        self.map ^ other.map
    }
}

/// Timeouts derived from the link baud rate
///
/// Each budget is the time needed to send the worst case (fully escaped)
/// request and response frames, plus the 1-Wire traffic the SwiMux performs
/// in between, plus a fixed turnaround.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    baud: u32,
}

impl Timing {
    /// Timing for a link at `baud` bits per second
    pub const fn new(baud: u32) -> Self {
        Self { baud }
    }

    /// Time on the wire of a frame carrying `body` bytes of body
    fn frame_us(&self, body: usize) -> u64 {
        let bytes = 2 * (body as u64 + 2) + 2;
        (bytes * BITS_PER_BYTE * 1_000_000).div_ceil(self.baud.max(1) as u64)
    }

    fn exchange(&self, req_body: usize, resp_body: usize, device_us: u64) -> Duration {
        Duration::from_micros(
            self.frame_us(req_body) + self.frame_us(resp_body) + device_us + TURNAROUND_US,
        )
    }

    /// Wakeup, sleep, or any other bare ACK exchange
    pub fn ack(&self) -> Duration {
        self.exchange(0, 1, 0)
    }

    /// Presence poll: one reset pulse per bus
    pub fn presence(&self) -> Duration {
        self.exchange(0, 2, BUS_COUNT as u64 * ONE_WIRE_RESET_US)
    }

    /// Roll call: a READ ROM on every bus
    pub fn roll_call(&self) -> Duration {
        let per_bus = ONE_WIRE_RESET_US + 9 * ONE_WIRE_BYTE_US;
        self.exchange(0, 8 * BUS_COUNT, BUS_COUNT as u64 * per_bus)
    }

    /// UID of a single bus
    pub fn get_uid(&self) -> Duration {
        self.exchange(1, 9, ONE_WIRE_RESET_US + 9 * ONE_WIRE_BYTE_US)
    }

    /// Read of `len` bytes
    pub fn read(&self, len: usize) -> Duration {
        let wire = ONE_WIRE_RESET_US + (XFER_HEADER + len) as u64 * ONE_WIRE_BYTE_US;
        self.exchange(XFER_HEADER, XFER_HEADER + len, wire)
    }

    /// Write of `len` bytes at `offset`, including page programming
    pub fn write(&self, offset: u8, len: usize) -> Duration {
        let first = offset as usize / EEPROM_PAGE;
        let last = (offset as usize + len.max(1) - 1) / EEPROM_PAGE;
        let pages = (last - first + 1) as u64;
        let wire = pages * (ONE_WIRE_RESET_US + (EEPROM_PAGE + XFER_HEADER) as u64 * ONE_WIRE_BYTE_US);
        self.exchange(XFER_HEADER + len, 1, wire + pages * EEPROM_PAGE_PROG_US)
    }
}

/// Client side of the SwiMux
pub struct SwiMux<S: SwiSerial> {
    link: Link<S>,
    timing: Timing,
}

impl<S: SwiSerial> SwiMux<S> {
    /// Create a SwiMux client over `serial`, running at `baud`
    pub fn new(serial: S, baud: u32) -> Self {
        Self {
            link: Link::new(serial),
            timing: Timing::new(baud),
        }
    }

    /// The timeouts matching this link
    pub fn timing(&self) -> Timing {
        self.timing
    }

    /// Give the serial port back
    pub fn into_inner(self) -> S {
        self.link.into_inner()
    }

    /// Make sure the SwiMux listens.
    ///
    /// Drops any pending input, resynchronizes the framing, then sends up to
    /// `retries` wakeups. Fails with [`Error::NoDevice`] if none is ACKed.
    pub async fn assert_awake(&mut self, retries: u8) -> Result<(), Error<S::SerError>> {
        self.link.drain();
        self.link.resync().await?;
        for attempt in 0..retries {
            self.link.send(Opcode::Wakeup, &[]).await?;
            match self.link.wait_for_ack_to(Opcode::Wakeup, self.timing.ack()).await {
                Ok(()) => return Ok(()),
                Err(Error::Serial(e)) => return Err(Error::Serial(e)),
                Err(_) => {
                    tank_debug!("wakeup {=u8} unanswered", attempt);
                }
            }
        }
        tank_warn!("SwiMux does not answer");
        Err(Error::NoDevice)
    }

    /// Ask the SwiMux to go to sleep.
    pub async fn sleep(&mut self) -> Result<(), Error<S::SerError>> {
        self.assert_awake(WAKE_RETRIES).await?;
        self.link.send(Opcode::Sleep, &[]).await?;
        self.link.wait_for_ack_to(Opcode::Sleep, self.timing.ack()).await
    }

    /// Which buses hold a device
    pub async fn get_presence(&mut self, timeout: Duration) -> Result<PresenceReport, Error<S::SerError>> {
        self.assert_awake(WAKE_RETRIES).await?;
        self.link.send(Opcode::GetPresence, &[]).await?;
        let frame = self
            .link
            .await_reply(Opcode::GetPresence, timeout, |f| {
                f.opcode == Opcode::GetPresence && f.body.len() == 2
            })
            .await?;
        let map = u16::from_le_bytes([frame.body[0], frame.body[1]]);
        Ok(PresenceReport::from_map(map))
    }

    /// UIDs of all buses at once. Empty buses report [`NO_UID`].
    pub async fn roll_call(&mut self, timeout: Duration) -> Result<[u64; BUS_COUNT], Error<S::SerError>> {
        self.assert_awake(WAKE_RETRIES).await?;
        self.link.send(Opcode::RollCall, &[]).await?;
        let frame = self
            .link
            .await_reply(Opcode::RollCall, timeout, |f| {
                f.opcode == Opcode::RollCall && f.body.len() == 8 * BUS_COUNT
            })
            .await?;

        let mut uids = [NO_UID; BUS_COUNT];
        for (uid, chunk) in uids.iter_mut().zip(frame.body.chunks_exact(8)) {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(chunk);
            *uid = normalize_uid(u64::from_le_bytes(raw));
        }
        Ok(uids)
    }

    /// UID of the device on `bus`, [`NO_UID`] if there is none.
    pub async fn get_uid(&mut self, bus: u8, timeout: Duration) -> Result<u64, Error<S::SerError>> {
        check_bus(bus)?;
        self.assert_awake(WAKE_RETRIES).await?;
        self.link.send(Opcode::GetUid, &[bus]).await?;
        let frame = self
            .link
            .await_reply(Opcode::GetUid, timeout, |f| {
                f.opcode == Opcode::HaveUid && f.body.len() == 9 && f.body[0] == bus
            })
            .await?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&frame.body[1..9]);
        Ok(normalize_uid(u64::from_le_bytes(raw)))
    }

    /// Fill `buf` from the memory of the device on `bus`, starting at `offset`.
    pub async fn read(
        &mut self,
        bus: u8,
        offset: u8,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<(), Error<S::SerError>> {
        check_bus(bus)?;
        let len = check_len(buf.len())?;
        self.assert_awake(WAKE_RETRIES).await?;

        let header = [bus, offset, len];
        let want = XFER_HEADER + buf.len();
        self.link.send(Opcode::ReadBytes, &header).await?;
        let frame = self
            .link
            .await_reply(Opcode::ReadBytes, timeout, |f| {
                f.opcode == Opcode::ReadBytes && f.body.len() == want && f.body[..XFER_HEADER] == header
            })
            .await?;
        buf.copy_from_slice(&frame.body[XFER_HEADER..]);
        Ok(())
    }

    /// Write `data` to the memory of the device on `bus`, starting at `offset`.
    ///
    /// Any failure after the request went out means the state of the memory
    /// is unknown, and is reported as [`Error::WriteNotAcknowledged`].
    pub async fn write(
        &mut self,
        bus: u8,
        offset: u8,
        data: &[u8],
        timeout: Duration,
    ) -> Result<(), Error<S::SerError>> {
        check_bus(bus)?;
        let len = check_len(data.len())?;
        self.assert_awake(WAKE_RETRIES).await?;

        let mut body: Vec<u8, { MAX_PAYLOAD - 2 }> = Vec::new();
        body.extend_from_slice(&[bus, offset, len])
            .and_then(|_| body.extend_from_slice(data))
            .map_err(|_| Error::InvalidBuffer)?;
        self.link.send(Opcode::WriteBytes, &body).await?;

        match self.link.wait_for_ack_to(Opcode::WriteBytes, timeout).await {
            Ok(()) => Ok(()),
            Err(e @ (Error::Serial(_) | Error::Nack(_))) => Err(e),
            Err(_) => {
                tank_warn!("write to bus {=u8} not acknowledged", bus);
                Err(Error::WriteNotAcknowledged)
            }
        }
    }
}

/// An absent device reads as all ones on the SwiMux side
fn normalize_uid(raw: u64) -> u64 {
    if raw == u64::MAX {
        NO_UID
    } else {
        raw
    }
}

fn check_bus<E>(bus: u8) -> Result<(), Error<E>> {
    if (bus as usize) < BUS_COUNT {
        Ok(())
    } else {
        Err(Error::BusIndexOutOfRange)
    }
}

fn check_len<E>(len: usize) -> Result<u8, Error<E>> {
    if len == 0 || len > MAX_XFER {
        Err(Error::InvalidBuffer)
    } else {
        Ok(len as u8)
    }
}
