//! The Tank Manager
//!
//! [`TankManager`] owns the SwiMux link and the pulse driver behind a single
//! lock, keeps the cache of known tanks in line with what the buses report,
//! and performs validated record reads and writes.
//!
//! ## Locking
//!
//! Public methods take the bus lock exactly once, bounded by
//! [`TankCfg::MUTEX_TIMEOUT`], and hand the locked state down to private
//! helpers. Nothing is ever called back while the lock is held.
//!
//! Collaborators read a published copy of the cache, guarded by its own
//! lock, which is only updated once an operation has completed. Lock order
//! is always bus lock, then published copy.
//!
//! ## Modes
//!
//! Every bus transfer first switches the driver to bus power mode, every
//! servo command first switches it to servo mode. Background detection is
//! the exception: it never switches, and skips its poll while the servos
//! are in use.

use core::cell::Cell;

use embassy_sync::blocking_mutex::Mutex as BlockingMutex;
use embassy_sync::mutex::{Mutex, MutexGuard};
use embassy_sync::signal::Signal;
use embassy_time::{with_timeout, Duration, Timer};
use heapless::Vec;

use crate::actuator::{speed_to_us, ActuatorError, Actuators, DriverMode, SERVO_STOP_US};
use crate::record::{TankRecord, RECORD_LEN};
use crate::swimux::{PresenceReport, SwiMux, NO_UID};
use crate::tank::{ChangeMask, HopperCalibration, TankInfo};
use crate::{Error, PulseDriver, SwiSerial, TankCfg, ALL_BUSES, BUS_COUNT, HOPPER_CHANNEL, SERVO_COUNT};

/// Attempts made for each transport operation before giving up
pub const TRANSPORT_RETRIES: usize = 3;

/// Tanks held in the cache. Room for a full set of detached tanks while
/// a full set of new ones is being attached.
pub const CACHE_CAPACITY: usize = 2 * BUS_COUNT;

/// Manager error type
#[derive(Debug, PartialEq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
#[non_exhaustive]
pub enum TankError<SE, DE> {
    /// The SwiMux transfer failed, after retries
    Bus(Error<SE>),
    /// The pulse driver failed
    Driver(DE),
    /// The bus lock was not acquired in time
    MutexNotAcquired,
    /// No known tank matches
    NotFound,
    /// The driver is not in the mode required, and the operation does not switch
    WrongMode,
    /// Not a servo channel
    InvalidChannel,
}

impl<SE, DE> From<Error<SE>> for TankError<SE, DE> {
    fn from(value: Error<SE>) -> Self {
        Self::Bus(value)
    }
}

impl<SE, DE> From<ActuatorError<DE>> for TankError<SE, DE> {
    fn from(value: ActuatorError<DE>) -> Self {
        match value {
            ActuatorError::Driver(e) => Self::Driver(e),
            ActuatorError::WrongMode => Self::WrongMode,
        }
    }
}

/// The [`TankError`] matching a configuration
pub type ManagerError<Cfg> = TankError<
    <<Cfg as TankCfg>::Serial as SwiSerial>::SerError,
    <<Cfg as TankCfg>::Driver as PulseDriver>::DrvError,
>;

/// Result of [`TankManager::verify_tank`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
pub enum VerifyOutcome {
    /// The record was intact
    Clean,
    /// This many bytes were corrected, and the record rewritten
    Corrected(usize),
    /// The record could not be trusted and was reformatted
    Reformatted,
}

/// State of the background detection, carried between two steps
#[derive(Debug, Clone)]
pub struct Detection {
    last: [u64; BUS_COUNT],
    interval: Duration,
}

impl Detection {
    /// Nothing seen yet, polling every `interval`
    pub const fn starting_at(interval: Duration) -> Self {
        Self {
            last: [NO_UID; BUS_COUNT],
            interval,
        }
    }

    /// Time to wait before the next step
    pub fn interval(&self) -> Duration {
        self.interval
    }
}

/// Retry a transport operation, up to [`TRANSPORT_RETRIES`] attempts in total
macro_rules! retry {
    ($op:expr) => {{
        let mut attempt = 1;
        loop {
            match $op {
                Err(TankError::Bus(ref e)) if attempt < TRANSPORT_RETRIES && is_transient(e) => {
                    tank_debug!("transfer failed, attempt {=usize}", attempt);
                    attempt += 1;
                }
                res => break res,
            }
        }
    }};
}

/// Failures that may go away by trying again
fn is_transient<E>(e: &Error<E>) -> bool {
    !matches!(
        e,
        Error::BusIndexOutOfRange | Error::InvalidBuffer | Error::NoDevice
    )
}

/// Everything behind the bus lock
struct Inner<Cfg: TankCfg> {
    mux: SwiMux<Cfg::Serial>,
    act: Actuators<Cfg::Driver>,
    cache: Vec<TankInfo, CACHE_CAPACITY>,
}

impl<Cfg: TankCfg> Inner<Cfg> {
    /// The link, after switching to bus power mode if needed
    async fn bus(&mut self) -> Result<&mut SwiMux<Cfg::Serial>, ManagerError<Cfg>> {
        self.act
            .enter_bus_power(Cfg::BUS_POWERUP_DELAY)
            .await
            .map_err(TankError::Driver)?;
        Ok(&mut self.mux)
    }

    /// The driver, after switching to servo mode if needed
    async fn servo(&mut self) -> Result<&mut Actuators<Cfg::Driver>, ManagerError<Cfg>> {
        let idle = self
            .cache
            .iter()
            .filter_map(|t| t.bus().map(|bus| (bus, t.idle_pwm)));
        self.act.enter_servo(idle).await.map_err(TankError::Driver)?;
        Ok(&mut self.act)
    }

    fn index_of(&self, uid: u64) -> Option<usize> {
        self.cache.iter().position(|t| t.uid() == uid)
    }

    fn index_on(&self, bus: u8) -> Option<usize> {
        self.cache.iter().position(|t| t.bus() == Some(bus))
    }

    /// Buses holding a tank whose record still has to be loaded
    fn incomplete(&self) -> u8 {
        self.cache
            .iter()
            .filter(|t| !t.is_full_info)
            .filter_map(TankInfo::bus)
            .fold(0, |m, bus| m | (1 << bus))
    }

    async fn roll_call(&mut self) -> Result<[u64; BUS_COUNT], ManagerError<Cfg>> {
        let timeout = self.mux.timing().roll_call();
        Ok(self.bus().await?.roll_call(timeout).await?)
    }

    /// Roll call, only if already in bus power mode
    async fn roll_call_in_place(&mut self) -> Result<[u64; BUS_COUNT], ManagerError<Cfg>> {
        if self.act.mode() != Some(DriverMode::BusPower) {
            return Err(TankError::WrongMode);
        }
        let timeout = self.mux.timing().roll_call();
        Ok(self.mux.roll_call(timeout).await?)
    }

    async fn get_uid(&mut self, bus: u8) -> Result<u64, ManagerError<Cfg>> {
        let timeout = self.mux.timing().get_uid();
        Ok(self.bus().await?.get_uid(bus, timeout).await?)
    }

    async fn presence(&mut self) -> Result<PresenceReport, ManagerError<Cfg>> {
        let timeout = self.mux.timing().presence();
        Ok(self.bus().await?.get_presence(timeout).await?)
    }

    async fn read_into(&mut self, bus: u8, offset: u8, buf: &mut [u8]) -> Result<(), ManagerError<Cfg>> {
        let timeout = self.mux.timing().read(buf.len());
        Ok(self.bus().await?.read(bus, offset, buf, timeout).await?)
    }

    async fn read_raw(&mut self, bus: u8) -> Result<[u8; RECORD_LEN], ManagerError<Cfg>> {
        let mut raw = [0u8; RECORD_LEN];
        self.read_into(bus, 0, &mut raw).await?;
        Ok(raw)
    }

    async fn write_raw(&mut self, bus: u8, rec: &TankRecord) -> Result<(), ManagerError<Cfg>> {
        let timeout = self.mux.timing().write(0, RECORD_LEN);
        let raw = rec.to_bytes();
        self.bus().await?.write(bus, 0, &raw, timeout).await?;
        Ok(())
    }

    /// Read and validate the record of the cached tank at `idx`.
    ///
    /// A record that cannot be trusted is reformatted and rewritten. If that
    /// rewrite fails, the tank shows the defaults but stays incomplete, to
    /// be retried later.
    async fn load_record(&mut self, idx: usize) -> Result<(), ManagerError<Cfg>> {
        let bus = self.cache[idx].bus().ok_or(TankError::NotFound)?;
        let raw = retry!(self.read_raw(bus).await)?;
        let mut rec = TankRecord::from_bytes(&raw);

        match rec.check() {
            Ok(0) => {}
            Ok(n) => tank_info!("bus {=u8}: corrected {=usize} record bytes", bus, n),
            Err(e) => {
                tank_warn!("bus {=u8}: record unusable ({}), reformatting", bus, e);
                rec.format();
                let written = retry!(self.write_raw(bus, &rec).await);
                self.cache[idx].fill_from_record(&rec);
                if written.is_err() {
                    self.cache[idx].is_full_info = false;
                }
                return written;
            }
        }
        self.cache[idx].fill_from_record(&rec);
        Ok(())
    }

    /// Read the record on `bus`, reformatting it in memory if it cannot be
    /// trusted. The flag tells if it was reformatted.
    async fn fetch_record(&mut self, bus: u8) -> Result<(TankRecord, bool), ManagerError<Cfg>> {
        let raw = retry!(self.read_raw(bus).await)?;
        let mut rec = TankRecord::from_bytes(&raw);
        if rec.sanitize() {
            Ok((rec, false))
        } else {
            tank_warn!("bus {=u8}: record unusable, reformatting", bus);
            rec.format();
            Ok((rec, true))
        }
    }
}

/// The Tank Manager
pub struct TankManager<Cfg: TankCfg> {
    inner: Mutex<Cfg::Mutex, Inner<Cfg>>,
    published: Mutex<Cfg::Mutex, Vec<TankInfo, CACHE_CAPACITY>>,
    calibration: BlockingMutex<Cfg::Mutex, Cell<HopperCalibration>>,
    changed: Signal<Cfg::Mutex, u8>,
}

impl<Cfg: TankCfg> TankManager<Cfg> {
    /// Create a manager. Nothing is sent until [`TankManager::begin`].
    pub fn new(serial: Cfg::Serial, driver: Cfg::Driver) -> Self {
        Self {
            inner: Mutex::new(Inner {
                mux: SwiMux::new(serial, Cfg::BAUD_RATE),
                act: Actuators::new(driver),
                cache: Vec::new(),
            }),
            published: Mutex::new(Vec::new()),
            calibration: BlockingMutex::new(Cell::new(HopperCalibration::default())),
            changed: Signal::new(),
        }
    }

    /// Put the driver in bus power mode, then discover every attached tank.
    pub async fn begin(&self, calibration: HopperCalibration) -> Result<(), ManagerError<Cfg>> {
        self.set_hopper_calibration(calibration);
        let mut inner = self.lock().await?;
        inner
            .act
            .enter_bus_power(Cfg::BUS_POWERUP_DELAY)
            .await
            .map_err(TankError::Driver)?;
        tank_info!("tank manager started");
        self.refresh_locked(&mut inner, ALL_BUSES).await.map(drop)
    }

    async fn lock(&self) -> Result<MutexGuard<'_, Cfg::Mutex, Inner<Cfg>>, ManagerError<Cfg>> {
        with_timeout(Cfg::MUTEX_TIMEOUT, self.inner.lock())
            .await
            .map_err(|_| {
                tank_warn!("bus lock not acquired");
                TankError::MutexNotAcquired
            })
    }

    async fn publish(&self, cache: &[TankInfo]) {
        let mut snap = self.published.lock().await;
        snap.clear();
        // Same capacity on both sides
        let _ = snap.extend_from_slice(cache);
    }

    fn notify(&self, buses: u8) {
        let pending = self.changed.try_take().unwrap_or(0);
        self.changed.signal(pending | buses);
    }

    /// Wait until tanks were attached to or detached from some buses, and
    /// return the bitmap of those buses.
    pub async fn wait_tanks_changed(&self) -> u8 {
        self.changed.wait().await
    }

    // ----------------------------------------------------------------------
    // Presence
    // ----------------------------------------------------------------------

    /// Bring the cache in line with the buses in `mask`.
    ///
    /// All buses at once are queried with one roll call, otherwise each bus
    /// is queried on its own. Returns the bitmap of buses whose tank changed.
    pub async fn refresh(&self, mask: u8) -> Result<u8, ManagerError<Cfg>> {
        let mut inner = self.lock().await?;
        self.refresh_locked(&mut inner, mask).await
    }

    async fn refresh_locked(&self, inner: &mut Inner<Cfg>, mask: u8) -> Result<u8, ManagerError<Cfg>> {
        let mask = mask & ALL_BUSES;
        if mask == 0 {
            return Ok(0);
        }

        let observed = if mask == ALL_BUSES {
            retry!(inner.roll_call().await)?
        } else {
            let mut observed = [NO_UID; BUS_COUNT];
            for bus in 0..BUS_COUNT as u8 {
                if mask & (1 << bus) != 0 {
                    observed[bus as usize] = retry!(inner.get_uid(bus).await)?;
                }
            }
            observed
        };

        Ok(self.reconcile(inner, mask, &observed).await)
    }

    /// Apply the UIDs `observed` on the buses in `mask` to the cache, load
    /// the records that need it, and publish.
    async fn reconcile(&self, inner: &mut Inner<Cfg>, mask: u8, observed: &[u64; BUS_COUNT]) -> u8 {
        let mut changed = 0u8;

        // Detach every tank no longer seen where we thought it was
        for tank in inner.cache.iter_mut() {
            let Some(bus) = tank.bus() else {
                continue;
            };
            if mask & (1 << bus) != 0 && observed[bus as usize] != tank.uid() {
                tank_info!("tank {=u64:#x} left bus {=u8}", tank.uid(), bus);
                tank.bus_index = -1;
                changed |= 1 << bus;
            }
        }

        // Attach what was seen, creating entries for new tanks
        for bus in 0..BUS_COUNT as u8 {
            let uid = observed[bus as usize];
            if mask & (1 << bus) == 0 || uid == NO_UID {
                continue;
            }

            let idx = match inner.index_of(uid) {
                Some(idx) => idx,
                None => {
                    if inner.cache.push(TankInfo::discovered(uid, bus)).is_err() {
                        tank_error!("tank cache full, ignoring {=u64:#x}", uid);
                        continue;
                    }
                    tank_info!("new tank {=u64:#x} on bus {=u8}", uid, bus);
                    changed |= 1 << bus;
                    inner.cache.len() - 1
                }
            };

            let tank = &mut inner.cache[idx];
            if tank.bus() != Some(bus) {
                if let Some(old) = tank.bus() {
                    changed |= 1 << old;
                }
                tank_info!("tank {=u64:#x} moved to bus {=u8}", uid, bus);
                tank.bus_index = bus as i8;
                tank.is_full_info = false;
                changed |= 1 << bus;
            }

            if !inner.cache[idx].is_full_info && inner.load_record(idx).await.is_err() {
                tank_error!("bus {=u8}: could not load the tank record", bus);
            }
        }

        inner.cache.retain(TankInfo::is_present);
        self.publish(&inner.cache).await;
        if changed != 0 {
            self.notify(changed);
        }
        changed
    }

    /// The bus `uid` is attached to.
    ///
    /// In bus power mode, the buses are refreshed first. In servo mode the
    /// buses are unreachable, and the cache is used as is.
    pub async fn bus_of_tank(&self, uid: u64) -> Result<u8, ManagerError<Cfg>> {
        let mut inner = self.lock().await?;
        if inner.act.mode() != Some(DriverMode::Servo) {
            self.refresh_locked(&mut inner, ALL_BUSES).await?;
        }
        inner
            .index_of(uid)
            .and_then(|idx| inner.cache[idx].bus())
            .ok_or(TankError::NotFound)
    }

    /// Query the occupancy of every bus, without touching the cache.
    pub async fn presence_report(&self) -> Result<PresenceReport, ManagerError<Cfg>> {
        let mut inner = self.lock().await?;
        retry!(inner.presence().await)
    }

    /// Put the SwiMux to sleep. Any later transfer wakes it up again.
    ///
    /// This only talks to the SwiMux itself, not to the tanks, so it is
    /// allowed in either driver mode and never switches.
    pub async fn disable_link(&self) -> Result<(), ManagerError<Cfg>> {
        let mut inner = self.lock().await?;
        Ok(inner.mux.sleep().await?)
    }

    /// Fill `buf` from the memory of the tank on `bus`, starting at `offset`,
    /// without any validation.
    pub async fn read_bytes(&self, bus: u8, offset: u8, buf: &mut [u8]) -> Result<(), ManagerError<Cfg>> {
        let mut inner = self.lock().await?;
        retry!(inner.read_into(bus, offset, buf).await)
    }

    // ----------------------------------------------------------------------
    // Lookups, on the published copy
    // ----------------------------------------------------------------------

    /// The tank with the given UID
    pub async fn known_tank_by_uid(&self, uid: u64) -> Option<TankInfo> {
        let snap = self.published.lock().await;
        snap.iter().find(|t| t.uid() == uid).cloned()
    }

    /// The tank attached to `bus`
    pub async fn known_tank_by_bus(&self, bus: u8) -> Option<TankInfo> {
        let snap = self.published.lock().await;
        snap.iter().find(|t| t.bus() == Some(bus)).cloned()
    }

    /// Every known tank
    pub async fn known_tanks(&self) -> Vec<TankInfo, CACHE_CAPACITY> {
        self.published.lock().await.clone()
    }

    // ----------------------------------------------------------------------
    // Records
    // ----------------------------------------------------------------------

    /// Re-read the record of `info`'s tank, and update `info` with it.
    pub async fn refresh_tank_info(&self, info: &mut TankInfo) -> Result<(), ManagerError<Cfg>> {
        let mut inner = self.lock().await?;
        let idx = inner.index_of(info.uid()).ok_or(TankError::NotFound)?;
        let res = inner.load_record(idx).await;
        self.publish(&inner.cache).await;
        res?;
        info.clone_from(&inner.cache[idx]);
        Ok(())
    }

    /// Write the collaborator editable fields of `info` to its tank.
    ///
    /// The record is read back first, and only rewritten if some field
    /// differs. Returns the groups of fields that changed. On error, the
    /// tank memory is in an unknown state and should be re-read.
    pub async fn commit_tank_info(&self, info: &TankInfo) -> Result<ChangeMask, ManagerError<Cfg>> {
        let mut inner = self.lock().await?;
        let idx = inner.index_of(info.uid()).ok_or(TankError::NotFound)?;
        let bus = inner.cache[idx].bus().ok_or(TankError::NotFound)?;

        let (mut rec, repaired) = inner.fetch_record(bus).await?;

        // Presence and identity come from the cache, not from the caller
        let mut target = inner.cache[idx].clone();
        target.update_from(info);

        let mask = target.changes_against(&rec);
        if mask.is_empty() && !repaired {
            tank_debug!("bus {=u8}: nothing to commit", bus);
            return Ok(mask);
        }

        target.apply_to_record(&mut rec, mask);
        rec.finalize();
        retry!(inner.write_raw(bus, &rec).await)?;

        target.is_full_info = true;
        inner.cache[idx] = target;
        self.publish(&inner.cache).await;
        tank_info!("bus {=u8}: committed changes {=u8:#x}", bus, mask.bits());
        Ok(mask)
    }

    /// Record the remaining kibble of a tank.
    ///
    /// The cache is updated right away and kept even if writing to the tank
    /// fails.
    pub async fn update_remaining_kibble(&self, uid: u64, grams: u16) -> Result<(), ManagerError<Cfg>> {
        let mut inner = self.lock().await?;
        let idx = inner.index_of(uid).ok_or(TankError::NotFound)?;
        inner.cache[idx].remaining_grams = grams;
        self.publish(&inner.cache).await;

        let bus = inner.cache[idx].bus().ok_or(TankError::NotFound)?;
        let (mut rec, repaired) = inner.fetch_record(bus).await?;
        if !repaired && rec.remaining_grams == grams {
            return Ok(());
        }
        // A reformatted record gets everything we know back
        let mask = if repaired {
            ChangeMask::all()
        } else {
            ChangeMask::REMAINING
        };
        inner.cache[idx].apply_to_record(&mut rec, mask);
        rec.finalize();
        retry!(inner.write_raw(bus, &rec).await)
    }

    /// Overwrite the record of the tank on `bus` with defaults.
    pub async fn format_tank(&self, bus: u8) -> Result<(), ManagerError<Cfg>> {
        if bus as usize >= BUS_COUNT {
            return Err(TankError::Bus(Error::BusIndexOutOfRange));
        }
        let mut inner = self.lock().await?;
        let rec = TankRecord::formatted();
        retry!(inner.write_raw(bus, &rec).await)?;
        tank_info!("bus {=u8}: tank formatted", bus);

        if let Some(idx) = inner.index_on(bus) {
            inner.cache[idx].fill_from_record(&rec);
            self.publish(&inner.cache).await;
        }
        Ok(())
    }

    /// Check the record on `bus`, and rewrite it if anything was corrected
    /// or if it had to be reformatted.
    pub async fn verify_tank(&self, bus: u8) -> Result<VerifyOutcome, ManagerError<Cfg>> {
        if bus as usize >= BUS_COUNT {
            return Err(TankError::Bus(Error::BusIndexOutOfRange));
        }
        let mut inner = self.lock().await?;
        let raw = retry!(inner.read_raw(bus).await)?;
        let mut rec = TankRecord::from_bytes(&raw);

        let outcome = match rec.check() {
            Ok(0) => return Ok(VerifyOutcome::Clean),
            Ok(n) => VerifyOutcome::Corrected(n),
            Err(_) => {
                rec.format();
                VerifyOutcome::Reformatted
            }
        };
        retry!(inner.write_raw(bus, &rec).await)?;
        tank_info!("bus {=u8}: record scrubbed, {}", bus, outcome);

        if let Some(idx) = inner.index_on(bus) {
            inner.cache[idx].fill_from_record(&rec);
            self.publish(&inner.cache).await;
        }
        Ok(outcome)
    }

    // ----------------------------------------------------------------------
    // Servos
    // ----------------------------------------------------------------------

    /// The current driver mode, `None` before [`TankManager::begin`]
    pub async fn driver_mode(&self) -> Result<Option<DriverMode>, ManagerError<Cfg>> {
        Ok(self.lock().await?.act.mode())
    }

    /// Switch to servo mode (`true`) or back to bus power mode (`false`).
    pub async fn set_servo_power(&self, on: bool) -> Result<(), ManagerError<Cfg>> {
        let mut inner = self.lock().await?;
        if on {
            inner.servo().await?;
        } else {
            inner.bus().await?;
        }
        Ok(())
    }

    /// Set the pulse width of a servo channel, switching to servo mode if needed.
    pub async fn set_servo_pwm(&self, channel: u8, us: u16) -> Result<(), ManagerError<Cfg>> {
        if channel as usize >= SERVO_COUNT {
            return Err(TankError::InvalidChannel);
        }
        let mut inner = self.lock().await?;
        inner
            .servo()
            .await?
            .set_pulse_us(channel, us)
            .await
            .map_err(TankError::from)
    }

    /// Run a continuous rotation servo at `speed`, from `-1.0` (full reverse)
    /// to `1.0` (full forward).
    pub async fn set_continuous_servo(&self, channel: u8, speed: f32) -> Result<(), ManagerError<Cfg>> {
        self.set_servo_pwm(channel, speed_to_us(speed)).await
    }

    /// Stop every servo, wait for them to settle, then cut their power and
    /// return to bus power mode.
    ///
    /// Every channel is attempted, the first failure is reported.
    pub async fn stop_all_servos(&self) -> Result<(), ManagerError<Cfg>> {
        let mut inner = self.lock().await?;
        let act = inner.servo().await?;

        let mut res = Ok(());
        for channel in 0..SERVO_COUNT as u8 {
            if let Err(e) = act.set_pulse_us(channel, SERVO_STOP_US).await {
                if res.is_ok() {
                    res = Err(TankError::from(e));
                }
            }
        }
        Timer::after(Cfg::SERVO_SETTLE_DELAY).await;
        inner.bus().await?;
        tank_warn!("all servos stopped and powered off");
        res
    }

    /// Replace the hopper calibration
    pub fn set_hopper_calibration(&self, calibration: HopperCalibration) {
        self.calibration.lock(|c| c.set(calibration));
    }

    /// The hopper calibration
    pub fn hopper_calibration(&self) -> HopperCalibration {
        self.calibration.lock(Cell::get)
    }

    /// Pulse width of the open hopper
    pub fn hopper_open_pwm(&self) -> u16 {
        self.hopper_calibration().open_pwm
    }

    /// Pulse width of the closed hopper
    pub fn hopper_closed_pwm(&self) -> u16 {
        self.hopper_calibration().closed_pwm
    }

    /// Move the hopper to its open position
    pub async fn open_hopper(&self) -> Result<(), ManagerError<Cfg>> {
        self.set_servo_pwm(HOPPER_CHANNEL, self.hopper_open_pwm()).await
    }

    /// Move the hopper to its closed position
    pub async fn close_hopper(&self) -> Result<(), ManagerError<Cfg>> {
        self.set_servo_pwm(HOPPER_CHANNEL, self.hopper_closed_pwm()).await
    }

    // ----------------------------------------------------------------------
    // Background detection
    // ----------------------------------------------------------------------

    /// One background poll.
    ///
    /// Sends a roll call, unless the driver is in servo mode, in which case
    /// [`TankError::WrongMode`] is returned and nothing is sent. Buses whose
    /// UID changed since the last step, or whose tank record is still
    /// missing, are reconciled. The polling interval is reset to its minimum
    /// when some UID changed, and doubled (up to its maximum) otherwise, so a
    /// record that keeps failing to load is retried on the backed off
    /// schedule.
    ///
    /// Returns the bitmap of buses whose tank changed.
    pub async fn detection_step(&self, det: &mut Detection) -> Result<u8, ManagerError<Cfg>> {
        let mut inner = self.lock().await?;
        let uids = retry!(inner.roll_call_in_place().await)?;

        let mut moved = 0u8;
        for (bus, (now, before)) in uids.iter().zip(det.last.iter()).enumerate() {
            if now != before {
                moved |= 1 << bus;
            }
        }
        det.last = uids;
        det.interval = if moved != 0 {
            Cfg::DETECTION_INTERVAL_MIN
        } else {
            (det.interval * 2).min(Cfg::DETECTION_INTERVAL_MAX)
        };

        let diff = moved | inner.incomplete();
        if diff == 0 {
            return Ok(0);
        }
        Ok(self.reconcile(&mut inner, diff, &uids).await)
    }

    /// Poll the buses forever. Meant to run as a low priority task.
    pub async fn run_detection(&self) {
        let mut det = Detection::starting_at(Cfg::DETECTION_INTERVAL_MIN);
        loop {
            match self.detection_step(&mut det).await {
                Ok(0) => {}
                Ok(changed) => tank_info!("tanks changed on buses {=u8:#x}", changed),
                // Servos in use, or a foreground operation holds the lock
                Err(TankError::WrongMode) | Err(TankError::MutexNotAcquired) => {}
                Err(_) => tank_warn!("tank detection failed"),
            }
            Timer::after(det.interval()).await;
        }
    }
}
