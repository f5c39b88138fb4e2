//! Pulse driver modes and servo primitives
//!
//! The same 16 driver outputs either power the 1-Wire buses (every channel
//! fully on) or drive the servos (50 Hz pulses). [`Actuators`] tracks which
//! one is active, and performs the switch sequences. It does not decide when
//! to switch, that is up to the [manager][crate::manager].

use embassy_time::{Duration, Timer};

use crate::PulseDriver;

/// Servo refresh rate
pub const SERVO_FREQUENCY_HZ: u16 = 50;
/// Servo period, at [`SERVO_FREQUENCY_HZ`]
pub const SERVO_PERIOD_US: u32 = 1_000_000 / SERVO_FREQUENCY_HZ as u32;
/// Resolution of the driver period counter
pub const TICKS_PER_PERIOD: u32 = 4096;

/// Pulse width stopping a continuous rotation servo
pub const SERVO_STOP_US: u16 = 1500;
/// Pulse width of a continuous rotation servo at full speed forward
pub const SERVO_FORWARD_US: u16 = 2000;
/// Pulse width of a continuous rotation servo at full speed in reverse
pub const SERVO_REVERSE_US: u16 = 1000;
/// Speeds closer to zero than this stop the servo
pub const SPEED_DEAD_BAND: f32 = 0.01;

/// Time for every servo to see at least one full pulse
const ONE_CYCLE: Duration = Duration::from_micros(SERVO_PERIOD_US as u64 + 1_000);

/// Current use of the driver outputs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
pub enum DriverMode {
    /// Every channel fully on, powering the 1-Wire buses
    BusPower,
    /// Servo pulses, the buses are unpowered
    Servo,
}

/// Error of a servo command
#[derive(Debug, PartialEq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
pub enum ActuatorError<E> {
    /// The driver failed
    Driver(E),
    /// The driver is not in servo mode
    WrongMode,
}

/// Convert a pulse width to driver ticks, saturating at one full period.
pub fn us_to_ticks(us: u16) -> u16 {
    let ticks = us as u32 * TICKS_PER_PERIOD / SERVO_PERIOD_US;
    ticks.min(TICKS_PER_PERIOD - 1) as u16
}

/// Map a continuous servo speed in `-1.0..=1.0` to a pulse width.
///
/// Out of range speeds are clamped, NaN stops the servo.
pub fn speed_to_us(speed: f32) -> u16 {
    if speed.is_nan() || (-SPEED_DEAD_BAND < speed && speed < SPEED_DEAD_BAND) {
        return SERVO_STOP_US;
    }
    let speed = speed.clamp(-1.0, 1.0);
    let (full, span) = if speed > 0.0 {
        (SERVO_FORWARD_US, speed)
    } else {
        (SERVO_REVERSE_US, -speed)
    };
    let delta = (full as f32 - SERVO_STOP_US as f32) * span;
    (SERVO_STOP_US as f32 + delta) as u16
}

/// The pulse driver, and the mode it is in
pub struct Actuators<D: PulseDriver> {
    driver: D,
    // `None` until the first switch, the power-on state of the driver is unknown
    mode: Option<DriverMode>,
}

impl<D: PulseDriver> Actuators<D> {
    /// Wrap a driver in an unknown state
    pub fn new(driver: D) -> Self {
        Self { driver, mode: None }
    }

    /// The current mode, `None` before the first switch
    pub fn mode(&self) -> Option<DriverMode> {
        self.mode
    }

    /// Cut the servo power, then drive every channel fully on, and wait for
    /// the tank EEPROMs to power up.
    ///
    /// Does nothing if already in bus power mode.
    pub async fn enter_bus_power(&mut self, powerup: Duration) -> Result<(), D::DrvError> {
        if self.mode == Some(DriverMode::BusPower) {
            return Ok(());
        }
        // The outputs are in an unknown state if anything below fails
        self.mode = None;
        self.driver.set_servo_rail(false);
        self.driver.set_frequency(SERVO_FREQUENCY_HZ).await?;
        self.driver.set_all_full(true).await?;
        Timer::after(powerup).await;
        self.mode = Some(DriverMode::BusPower);
        tank_info!("driver in bus power mode");
        Ok(())
    }

    /// Mute every channel, set the `idle` `(channel, pulse width)` pairs,
    /// power the servos, and hold for one full cycle.
    ///
    /// Does nothing if already in servo mode.
    pub async fn enter_servo<I>(&mut self, idle: I) -> Result<(), D::DrvError>
    where
        I: IntoIterator<Item = (u8, u16)>,
    {
        if self.mode == Some(DriverMode::Servo) {
            return Ok(());
        }
        self.mode = None;
        self.driver.set_frequency(SERVO_FREQUENCY_HZ).await?;
        self.driver.set_all_full(false).await?;
        for (channel, us) in idle {
            self.driver.set_pulse_ticks(channel, 0, us_to_ticks(us)).await?;
        }
        self.driver.set_servo_rail(true);
        Timer::after(ONE_CYCLE).await;
        self.mode = Some(DriverMode::Servo);
        tank_info!("driver in servo mode");
        Ok(())
    }

    /// Set the pulse width of one channel. Refused unless in servo mode,
    /// the outputs power the buses otherwise.
    pub async fn set_pulse_us(&mut self, channel: u8, us: u16) -> Result<(), ActuatorError<D::DrvError>> {
        if self.mode != Some(DriverMode::Servo) {
            tank_warn!("servo command on channel {=u8} outside servo mode", channel);
            return Err(ActuatorError::WrongMode);
        }
        self.driver
            .set_pulse_ticks(channel, 0, us_to_ticks(us))
            .await
            .map_err(ActuatorError::Driver)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::sim::SimSwiMux;
    use embassy_futures::block_on;

    const SETTLE: Duration = Duration::from_millis(1);

    #[test]
    fn pulses_only_in_servo_mode() {
        let sim = SimSwiMux::new();
        let mut act = Actuators::new(sim.driver());

        // Unknown state at power-on
        assert_eq!(block_on(act.set_pulse_us(0, 1500)), Err(ActuatorError::WrongMode));

        block_on(act.enter_bus_power(SETTLE)).unwrap();
        assert_eq!(act.mode(), Some(DriverMode::BusPower));
        assert_eq!(block_on(act.set_pulse_us(0, 1500)), Err(ActuatorError::WrongMode));
        assert_eq!(sim.pulse(0), None);
        assert!(sim.is_powered());

        block_on(act.enter_servo([(2, 1480)])).unwrap();
        assert_eq!(act.mode(), Some(DriverMode::Servo));
        assert_eq!(sim.pulse(2), Some(us_to_ticks(1480)));
        block_on(act.set_pulse_us(0, 1500)).unwrap();
        assert_eq!(sim.pulse(0), Some(us_to_ticks(1500)));

        block_on(act.enter_bus_power(SETTLE)).unwrap();
        assert_eq!(block_on(act.set_pulse_us(0, 2000)), Err(ActuatorError::WrongMode));
        assert!(sim.is_powered());
        assert!(!sim.rail());
        assert_eq!(sim.actuator_violations(), 0);
    }

    #[test]
    fn failed_switch_leaves_mode_unknown() {
        let sim = SimSwiMux::new();
        let mut act = Actuators::new(sim.driver());
        block_on(act.enter_bus_power(SETTLE)).unwrap();

        sim.fail_driver(true);
        assert_eq!(block_on(act.enter_servo(core::iter::empty())), Err(()));
        assert_eq!(act.mode(), None);
        sim.fail_driver(false);
        assert_eq!(block_on(act.set_pulse_us(0, 1500)), Err(ActuatorError::WrongMode));
    }

    #[test]
    fn ticks() {
        assert_eq!(us_to_ticks(0), 0);
        assert_eq!(us_to_ticks(1500), 307);
        assert_eq!(us_to_ticks(1000), 204);
        assert_eq!(us_to_ticks(2000), 409);
        assert_eq!(us_to_ticks(u16::MAX), 4095);
    }

    #[test]
    fn speeds() {
        assert_eq!(speed_to_us(0.0), SERVO_STOP_US);
        assert_eq!(speed_to_us(0.009), SERVO_STOP_US);
        assert_eq!(speed_to_us(-0.009), SERVO_STOP_US);
        assert_eq!(speed_to_us(f32::NAN), SERVO_STOP_US);
        assert_eq!(speed_to_us(1.0), SERVO_FORWARD_US);
        assert_eq!(speed_to_us(7.0), SERVO_FORWARD_US);
        assert_eq!(speed_to_us(-1.0), SERVO_REVERSE_US);
        assert_eq!(speed_to_us(f32::NEG_INFINITY), SERVO_REVERSE_US);
        assert_eq!(speed_to_us(0.5), 1750);
        assert_eq!(speed_to_us(-0.5), 1250);
    }
}
