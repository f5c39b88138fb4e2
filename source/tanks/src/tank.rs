//! In-memory view of the tanks
//!
//! [`TankInfo`] is what collaborators see of a tank. It is decoupled from the
//! on-tank [`TankRecord`]: values are converted to engineering units when a
//! record is loaded, and converted back (and diffed) when a record is
//! committed.

use bitflags::bitflags;
use heapless::String;

use crate::record::{TankRecord, DEFAULT_IDLE_PWM, NAME_CAPACITY};

bitflags! {
    /// Groups of record fields that differ between a [`TankInfo`] and a record
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct ChangeMask: u8 {
        /// The name
        const NAME = 1 << 0;
        /// Capacity, density or idle pulse width
        const SPECS = 1 << 1;
        /// Last base MAC or last bus index
        const HISTORY = 1 << 2;
        /// Remaining kibble
        const REMAINING = 1 << 3;
    }
}

/// What is known about one tank
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TankInfo {
    uid: u64,
    /// MAC-48 of the last base the tank was attached to
    pub last_base_mac: [u8; 6],
    /// Human readable name
    pub name: String<NAME_CAPACITY>,
    /// Bus the tank is attached to, `-1` when absent
    pub bus_index: i8,
    /// `false` until the record was read and validated
    pub is_full_info: bool,
    /// Capacity in liters
    pub capacity_liters: f32,
    /// Kibble density in kg/L
    pub density: f32,
    /// Estimated remaining kibble in grams
    pub remaining_grams: u16,
    /// Pulse width holding the auger still, in microseconds
    pub idle_pwm: u16,
}

impl TankInfo {
    /// A tank just seen on `bus` during a roll call, its record not read yet
    pub fn discovered(uid: u64, bus: u8) -> Self {
        Self {
            uid,
            last_base_mac: [0; 6],
            name: String::new(),
            bus_index: bus as i8,
            is_full_info: false,
            capacity_liters: 0.0,
            density: 0.0,
            remaining_grams: 0,
            idle_pwm: DEFAULT_IDLE_PWM,
        }
    }

    /// The 64-bit unique ID of the tank EEPROM
    pub fn uid(&self) -> u64 {
        self.uid
    }

    /// The bus the tank is attached to, if any
    pub fn bus(&self) -> Option<u8> {
        u8::try_from(self.bus_index).ok()
    }

    /// Is the tank attached to a bus?
    pub fn is_present(&self) -> bool {
        self.bus_index >= 0
    }

    /// Take every record field over. `rec` must be validated.
    pub fn fill_from_record(&mut self, rec: &TankRecord) {
        self.last_base_mac = rec.last_base_mac;
        self.name.clear();
        // Both hold NAME_CAPACITY bytes at most
        let _ = self.name.push_str(rec.name().unwrap_or_default());
        self.capacity_liters = rec.capacity_liters();
        self.density = rec.density();
        self.remaining_grams = rec.remaining_grams;
        self.idle_pwm = rec.idle_pwm;
        self.is_full_info = true;
    }

    /// Take over the fields a collaborator may change, keeping identity and
    /// presence.
    pub(crate) fn update_from(&mut self, other: &TankInfo) {
        self.last_base_mac = other.last_base_mac;
        self.name.clone_from(&other.name);
        self.capacity_liters = other.capacity_liters;
        self.density = other.density;
        self.remaining_grams = other.remaining_grams;
        self.idle_pwm = other.idle_pwm;
    }

    /// Which field groups of `rec` differ from this tank.
    ///
    /// Numbers are compared after conversion to the record encoding, so that
    /// float rounding never shows up as a change.
    pub fn changes_against(&self, rec: &TankRecord) -> ChangeMask {
        let mut target = rec.clone();
        self.apply_to_record(&mut target, ChangeMask::all());

        let mut mask = ChangeMask::empty();
        mask.set(ChangeMask::NAME, target.name() != rec.name());
        mask.set(
            ChangeMask::SPECS,
            (target.capacity_q, target.density_q, target.idle_pwm)
                != (rec.capacity_q, rec.density_q, rec.idle_pwm),
        );
        mask.set(
            ChangeMask::HISTORY,
            (target.last_base_mac, target.last_bus) != (rec.last_base_mac, rec.last_bus),
        );
        mask.set(ChangeMask::REMAINING, target.remaining_grams != rec.remaining_grams);
        mask
    }

    /// Write the field groups in `mask` into `rec`. The parity is left
    /// stale, the caller finalizes.
    pub fn apply_to_record(&self, rec: &mut TankRecord, mask: ChangeMask) {
        if mask.contains(ChangeMask::NAME) {
            rec.set_name(&self.name);
        }
        if mask.contains(ChangeMask::SPECS) {
            rec.set_capacity_liters(self.capacity_liters);
            rec.set_density(self.density);
            rec.idle_pwm = self.idle_pwm;
        }
        if mask.contains(ChangeMask::HISTORY) {
            rec.last_base_mac = self.last_base_mac;
            // An absent tank keeps the last bus it was seen on
            if let Some(bus) = self.bus() {
                rec.last_bus = bus;
            }
        }
        if mask.contains(ChangeMask::REMAINING) {
            rec.remaining_grams = self.remaining_grams;
        }
    }
}

/// Pulse widths of the hopper servo, persisted by the configuration store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct HopperCalibration {
    /// Pulse width of the closed position, in microseconds
    pub closed_pwm: u16,
    /// Pulse width of the open position, in microseconds
    pub open_pwm: u16,
}

impl Default for HopperCalibration {
    fn default() -> Self {
        Self {
            closed_pwm: 1000,
            open_pwm: 2000,
        }
    }
}

#[cfg(feature = "serde")]
impl HopperCalibration {
    /// Serialize for the configuration store
    pub fn to_bytes<'a>(&self, buf: &'a mut [u8]) -> Result<&'a mut [u8], postcard::Error> {
        postcard::to_slice(self, buf)
    }

    /// Deserialize from the configuration store
    pub fn from_bytes(buf: &[u8]) -> Result<Self, postcard::Error> {
        postcard::from_bytes(buf)
    }
}
