//! # Kibble Tanks
//!
//! This is the tank subsystem of the kibble feeder. It identifies, reads,
//! writes and repairs the small EEPROMs embedded in the removable ingredient
//! containers ("tanks"), and arbitrates the pulse-width driver chip that is
//! shared between powering those EEPROMs and driving the dispensing servos.
//!
//! ## Hardware
//!
//! Each tank carries a 1-Wire EEPROM (128 bytes, 64-bit unique ID). Up to six
//! tanks are attached, one per bus, to a small co-processor called the
//! "SwiMux", which multiplexes the six 1-Wire buses and talks to us over a
//! plain asynchronous UART at a fixed baud rate (57 600 Bd by default).
//!
//! The 1-Wire buses are powered through their pull-ups by the outputs of a
//! 16-channel pulse-width driver. The very same outputs drive the auger
//! servos of the tanks (channels 0..=5) and the hopper servo (channel 6).
//! The driver can therefore be in exactly one of two modes:
//!
//! 1. **Bus power**: every channel is held fully on, the tank EEPROMs are
//!    powered and the SwiMux can talk to them.
//! 2. **Servo**: every channel outputs a 50 Hz servo pulse, the EEPROMs are
//!    unpowered and any bus transaction would fail or corrupt data.
//!
//! [`TankManager`] owns both the link and the driver behind a single mutex,
//! and switches modes automatically as a precondition of each operation.
//!
//! ## Layers
//!
//! From the leaves up:
//!
//! * [`gf256`]: GF(2^8) arithmetic over the `0x11D` primitive polynomial
//! * [`ecc`]: systematic Reed-Solomon codec, parameterized at compile time
//! * [`record`]: the fixed 128-byte tank record, parity protected
//! * [`wire`]: SLIP-style framing, opcode validation, ACK waiting, resync
//! * [`swimux`]: the per-bus operations offered by the SwiMux (presence,
//!   roll call, UID, read, write, sleep)
//! * [`tank`]: the in-memory [`TankInfo`] and its conversion from/to records
//! * [`actuator`]: the pulse-driver modes and servo primitives
//! * [`manager`]: the [`TankManager`] tying everything together
//!
//! ## Message Framing
//!
//! Every message on the link is framed by `END` (`0xC0`) bytes, with
//! `ESC` (`0xDB`) sequences replacing any `END` or `ESC` inside the payload.
//! The first two payload bytes are always an opcode and its bitwise
//! complement, which gives a cheap integrity check on every frame on top of
//! the framing itself. See [`wire`] for the details.
//!
//! ## Record integrity
//!
//! The tank record is protected by 32 bytes of Reed-Solomon parity, which
//! corrects up to 16 corrupted bytes anywhere in the record. A record that
//! cannot be corrected, or that decodes to out-of-range values, is never
//! exposed: it is reformatted to safe defaults and rewritten, and the tank
//! shows up as a fresh, unnamed tank instead of disappearing.

#![cfg_attr(not(any(test, feature = "std")), no_std)]
#![allow(async_fn_in_trait)]
#![warn(missing_docs)]

#[macro_use]
mod macros;

pub mod actuator;
pub mod ecc;
pub mod gf256;
pub mod manager;
pub mod record;
pub mod swimux;
pub mod tank;
pub mod wire;

#[cfg(test)]
mod sim;

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_time::Duration;

pub use crate::manager::TankManager;
pub use crate::tank::{HopperCalibration, TankInfo};

/// The number of 1-Wire buses handled by the SwiMux, one tank per bus.
pub const BUS_COUNT: usize = 6;

/// Mask with one bit set per existing bus.
pub const ALL_BUSES: u8 = (1 << BUS_COUNT) - 1;

/// The hopper servo channel. Auger servos use channels `0..BUS_COUNT`.
pub const HOPPER_CHANNEL: u8 = BUS_COUNT as u8;

/// The number of servo channels in use on the pulse driver.
pub const SERVO_COUNT: usize = BUS_COUNT + 1;

/// Transport error type, returned by the [`wire`] and [`swimux`] layers.
#[derive(Debug, PartialEq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
#[non_exhaustive]
pub enum Error<E> {
    /// Some error with the underlying hardware serial port
    Serial(E),
    /// A frame decoded, but its contents were not the expected answer
    BadPayload,
    /// The frame itself was corrupted (bad escape, overflow, bad complement)
    Framing(wire::WireError),
    /// The requested bus index is not in `0..BUS_COUNT`
    BusIndexOutOfRange,
    /// The SwiMux did not answer the wake handshake
    NoDevice,
    /// No (valid) answer arrived within the time budget
    TimedOut,
    /// A write was sent, but no ACK for it was received
    WriteNotAcknowledged,
    /// An empty or oversized buffer was handed to a transfer
    InvalidBuffer,
    /// The SwiMux refused the request with the given device error code
    Nack(u8),
}

impl<E> From<E> for Error<E> {
    fn from(value: E) -> Self {
        Self::Serial(value)
    }
}

/// A trait representing the UART connected to the SwiMux
pub trait SwiSerial {
    /// The error type of the underlying serial port
    type SerError;

    /// Send all of `data`.
    ///
    /// The future MUST not return until the data is completely done
    /// sending, e.g. all data is "flushed".
    async fn write_all(&mut self, data: &[u8]) -> Result<(), Error<Self::SerError>>;

    /// Receive a single byte, waiting until one is available.
    ///
    /// This function MUST be cancellation safe: it is regularly dropped
    /// when a timeout expires.
    async fn read_byte(&mut self) -> Result<u8, Error<Self::SerError>>;

    /// Drop any byte already received but not yet read.
    fn discard_input(&mut self);
}

/// A trait representing the 16-channel pulse-width driver shared by the
/// bus power and the servos, plus the servo power rail switch.
pub trait PulseDriver {
    /// The error type of the driver (typically an I2C error)
    type DrvError;

    /// Set the output frequency of all channels.
    async fn set_frequency(&mut self, hz: u16) -> Result<(), Self::DrvError>;

    /// Drive every channel fully on (`true`) or fully off (`false`).
    async fn set_all_full(&mut self, on: bool) -> Result<(), Self::DrvError>;

    /// Set one channel's pulse, as ticks of a 12-bit period counter.
    async fn set_pulse_ticks(&mut self, channel: u8, on: u16, off: u16)
        -> Result<(), Self::DrvError>;

    /// Enable or disable the servo power rail.
    fn set_servo_rail(&mut self, on: bool);
}

/// Metadata trait to contain relevant generics and timing constants
pub trait TankCfg {
    /// Mutex type used for the bus lock and the published tank list
    type Mutex: RawMutex + 'static;

    /// Serial interface to the SwiMux
    type Serial: SwiSerial;

    /// Pulse-width driver
    type Driver: PulseDriver;

    /// Baud rate of the SwiMux link. All transport timeouts derive from it.
    const BAUD_RATE: u32 = 57_600;

    /// Time for the tank EEPROMs to power up after entering bus power mode.
    const BUS_POWERUP_DELAY: Duration = Duration::from_millis(100);

    /// Time for the servos to physically stop after being set to neutral.
    const SERVO_SETTLE_DELAY: Duration = Duration::from_millis(100);

    /// Longest wait for the bus lock before giving up.
    const MUTEX_TIMEOUT: Duration = Duration::from_secs(2);

    /// Shortest background detection interval, used while changes occur.
    const DETECTION_INTERVAL_MIN: Duration = Duration::from_secs(1);

    /// Longest background detection interval, reached when the buses are quiet.
    const DETECTION_INTERVAL_MAX: Duration = Duration::from_secs(8);
}
