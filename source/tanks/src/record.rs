//! The on-tank record
//!
//! Every tank EEPROM holds exactly one 128-byte record, little endian:
//!
//! ```text
//! off  len  field
//!   0    6  MAC-48 of the last base the tank was attached to
//!   6    1  last bus index, 0xFF if never attached
//!   7    1  name length in bytes
//!   8   80  name, UTF-8, zero padded
//!  88    2  capacity in liters, Q3.13
//!  90    2  density in kg/L, Q2.14
//!  92    2  idle auger pulse width in microseconds
//!  94    2  remaining kibble in grams
//!  96   32  Reed-Solomon parity over bytes 0..96
//! ```
//!
//! A [`TankRecord`] is only ever built from bytes with [`TankRecord::from_bytes`]
//! and turned back into bytes with [`TankRecord::to_bytes`]. Neither checks
//! anything: a record coming from a tank must pass [`TankRecord::check`]
//! (or [`TankRecord::sanitize`]) before any of its fields are used.

use core::ops::RangeInclusive;

use crate::ecc::{ReedSolomon, Uncorrectable};

/// Size of the whole record, as stored on the tank
pub const RECORD_LEN: usize = 128;
/// Size of the parity protected part
pub const DATA_LEN: usize = 96;
/// Size of the parity trailer
pub const PARITY_LEN: usize = RECORD_LEN - DATA_LEN;
/// Largest name, in bytes
pub const NAME_CAPACITY: usize = 80;

/// Bus index stored for a tank that was never attached
pub const NO_BUS: u8 = 0xFF;
/// Name given to a freshly formatted tank
pub const DEFAULT_NAME: &str = "New tank";
/// Neutral pulse width, also the idle pulse width of a fresh tank
pub const DEFAULT_IDLE_PWM: u16 = 1500;
/// Idle pulse widths outside of this range could drive the auger into its end stops
pub const IDLE_PWM_RANGE: RangeInclusive<u16> = 500..=2500;

const CAPACITY_ONE: f32 = (1u32 << 13) as f32;
const DENSITY_ONE: f32 = (1u32 << 14) as f32;

/// The codec protecting records
pub type RecordCodec = ReedSolomon<DATA_LEN, PARITY_LEN>;

/// Why a record may not be trusted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
#[non_exhaustive]
pub enum RecordError {
    /// More corrupted bytes than the parity can repair
    Uncorrectable,
    /// The stored name length exceeds [`NAME_CAPACITY`]
    NameTooLong,
    /// The stored name is not UTF-8
    NameNotUtf8,
    /// The idle pulse width is outside of [`IDLE_PWM_RANGE`]
    IdlePwmOutOfRange,
}

impl From<Uncorrectable> for RecordError {
    fn from(_: Uncorrectable) -> Self {
        Self::Uncorrectable
    }
}

/// Typed view of one tank record, parity included
#[derive(Debug, Clone, PartialEq)]
pub struct TankRecord {
    /// MAC-48 of the last base this tank was attached to
    pub last_base_mac: [u8; 6],
    /// Last bus index this tank was attached to, [`NO_BUS`] if none
    pub last_bus: u8,
    name_len: u8,
    name: [u8; NAME_CAPACITY],
    /// Capacity in liters, Q3.13 fixed point
    pub capacity_q: u16,
    /// Density in kg/L, Q2.14 fixed point
    pub density_q: u16,
    /// Idle auger pulse width in microseconds
    pub idle_pwm: u16,
    /// Remaining kibble in grams
    pub remaining_grams: u16,
    parity: [u8; PARITY_LEN],
}

impl Default for TankRecord {
    fn default() -> Self {
        Self::formatted()
    }
}

impl TankRecord {
    /// A record holding safe defaults, parity included.
    pub fn formatted() -> Self {
        let mut rec = Self {
            last_base_mac: [0; 6],
            last_bus: NO_BUS,
            name_len: 0,
            name: [0; NAME_CAPACITY],
            capacity_q: 0,
            density_q: 0,
            idle_pwm: DEFAULT_IDLE_PWM,
            remaining_grams: 0,
            parity: [0; PARITY_LEN],
        };
        rec.set_name(DEFAULT_NAME);
        rec.finalize();
        rec
    }

    /// Reset every field to its default and recompute the parity.
    pub fn format(&mut self) {
        *self = Self::formatted();
    }

    /// Recompute the parity from the current field values.
    ///
    /// Must be called after any field change, before the record is written.
    pub fn finalize(&mut self) {
        let data = self.data_bytes();
        RecordCodec::new().encode(&data, &mut self.parity);
    }

    /// Repair the record in place and range check it.
    ///
    /// Returns the number of bytes corrected by the parity.
    pub fn check(&mut self) -> Result<usize, RecordError> {
        let mut data = self.data_bytes();
        let mut parity = self.parity;
        let corrected = RecordCodec::new().decode(&mut data, &mut parity)?;
        if corrected != 0 {
            *self = Self::from_parts(&data, &parity);
        }

        if self.name_len as usize > NAME_CAPACITY {
            return Err(RecordError::NameTooLong);
        }
        if self.name().is_none() {
            return Err(RecordError::NameNotUtf8);
        }
        if !IDLE_PWM_RANGE.contains(&self.idle_pwm) {
            return Err(RecordError::IdlePwmOutOfRange);
        }
        Ok(corrected)
    }

    /// Like [`TankRecord::check`], only reporting whether the record may be
    /// trusted. `false` always means "format and rewrite".
    pub fn sanitize(&mut self) -> bool {
        self.check().is_ok()
    }

    /// Parse the raw bytes, without any check.
    pub fn from_bytes(raw: &[u8; RECORD_LEN]) -> Self {
        let mut data = [0u8; DATA_LEN];
        let mut parity = [0u8; PARITY_LEN];
        data.copy_from_slice(&raw[..DATA_LEN]);
        parity.copy_from_slice(&raw[DATA_LEN..]);
        Self::from_parts(&data, &parity)
    }

    /// Serialize, parity as currently stored.
    pub fn to_bytes(&self) -> [u8; RECORD_LEN] {
        let mut out = [0u8; RECORD_LEN];
        out[..DATA_LEN].copy_from_slice(&self.data_bytes());
        out[DATA_LEN..].copy_from_slice(&self.parity);
        out
    }

    fn from_parts(data: &[u8; DATA_LEN], parity: &[u8; PARITY_LEN]) -> Self {
        let u16_at = |off: usize| u16::from_le_bytes([data[off], data[off + 1]]);

        let mut last_base_mac = [0u8; 6];
        last_base_mac.copy_from_slice(&data[0..6]);
        let mut name = [0u8; NAME_CAPACITY];
        name.copy_from_slice(&data[8..88]);

        Self {
            last_base_mac,
            last_bus: data[6],
            name_len: data[7],
            name,
            capacity_q: u16_at(88),
            density_q: u16_at(90),
            idle_pwm: u16_at(92),
            remaining_grams: u16_at(94),
            parity: *parity,
        }
    }

    fn data_bytes(&self) -> [u8; DATA_LEN] {
        let mut out = [0u8; DATA_LEN];
        out[0..6].copy_from_slice(&self.last_base_mac);
        out[6] = self.last_bus;
        out[7] = self.name_len;
        out[8..88].copy_from_slice(&self.name);
        out[88..90].copy_from_slice(&self.capacity_q.to_le_bytes());
        out[90..92].copy_from_slice(&self.density_q.to_le_bytes());
        out[92..94].copy_from_slice(&self.idle_pwm.to_le_bytes());
        out[94..96].copy_from_slice(&self.remaining_grams.to_le_bytes());
        out
    }

    /// The name, if its length and encoding are valid
    pub fn name(&self) -> Option<&str> {
        let bytes = self.name.get(..self.name_len as usize)?;
        core::str::from_utf8(bytes).ok()
    }

    /// Store `name`, truncated on a character boundary to [`NAME_CAPACITY`].
    pub fn set_name(&mut self, name: &str) {
        let mut len = name.len().min(NAME_CAPACITY);
        while !name.is_char_boundary(len) {
            len -= 1;
        }
        self.name = [0; NAME_CAPACITY];
        self.name[..len].copy_from_slice(&name.as_bytes()[..len]);
        self.name_len = len as u8;
    }

    /// Last bus index, `None` if never attached
    pub fn last_bus_index(&self) -> Option<u8> {
        (self.last_bus != NO_BUS).then_some(self.last_bus)
    }

    /// Capacity in liters
    pub fn capacity_liters(&self) -> f32 {
        self.capacity_q as f32 / CAPACITY_ONE
    }

    /// Set the capacity in liters, saturating to `0.0..8.0`.
    pub fn set_capacity_liters(&mut self, liters: f32) {
        self.capacity_q = to_fixed(liters, CAPACITY_ONE);
    }

    /// Density in kg/L
    pub fn density(&self) -> f32 {
        self.density_q as f32 / DENSITY_ONE
    }

    /// Set the density in kg/L, saturating to `0.0..4.0`.
    pub fn set_density(&mut self, kg_per_liter: f32) {
        self.density_q = to_fixed(kg_per_liter, DENSITY_ONE);
    }

    /// The stored parity trailer
    pub fn parity(&self) -> &[u8; PARITY_LEN] {
        &self.parity
    }
}

/// Rounds to the nearest fixed point step. Float to int `as` casts saturate,
/// and map NaN to zero.
fn to_fixed(value: f32, one: f32) -> u16 {
    (value * one + 0.5) as u16
}
