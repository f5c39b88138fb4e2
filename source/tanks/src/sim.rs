//! Simulated hardware for tests
//!
//! [`SimSwiMux`] speaks the wire protocol on the device side and hosts the
//! memories of up to six tanks. The pulse driver shares its state, so that
//! the simulated buses are only powered while the driver holds every
//! channel fully on, like on the real board.

use core::task::Poll;
use std::{cell::RefCell, collections::VecDeque, rc::Rc, vec::Vec};

use embassy_sync::blocking_mutex::raw::NoopRawMutex;
use embassy_time::Duration;

use crate::record::RECORD_LEN;
use crate::wire::{self, DecodeStatus, FrameDecoder, Opcode};
use crate::{Error, PulseDriver, SwiSerial, TankCfg, BUS_COUNT};

/// NACK code: nothing answers on the bus
pub const NACK_NO_DEVICE: u8 = 0x01;
/// NACK code: malformed request
pub const NACK_BAD_REQUEST: u8 = 0x02;

/// Configuration used by the manager tests
pub struct TestCfg;

impl TankCfg for TestCfg {
    type Mutex = NoopRawMutex;
    type Serial = SimSerial;
    type Driver = SimDriver;

    const BUS_POWERUP_DELAY: Duration = Duration::from_millis(1);
    const SERVO_SETTLE_DELAY: Duration = Duration::from_millis(1);
    const MUTEX_TIMEOUT: Duration = Duration::from_millis(50);
    const DETECTION_INTERVAL_MIN: Duration = Duration::from_millis(1);
    const DETECTION_INTERVAL_MAX: Duration = Duration::from_millis(8);
}

/// A call received by the simulated driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverCall {
    Frequency(u16),
    AllFull(bool),
    Pulse(u8, u16),
    Rail(bool),
}

struct SimTank {
    uid: u64,
    mem: [u8; RECORD_LEN],
}

struct State {
    tanks: [Option<SimTank>; BUS_COUNT],
    decoder: FrameDecoder,
    rx: VecDeque<u8>,
    asleep: bool,
    silent: bool,
    drop_write_acks: usize,
    noise: Vec<u8>,
    wakeups: usize,
    requests: Vec<Opcode>,
    writes: [usize; BUS_COUNT],

    all_full: Option<bool>,
    rail: bool,
    fail_driver: bool,
    pulses: [Option<u16>; 16],
    driver_log: Vec<DriverCall>,
    unpowered_requests: usize,
    actuator_violations: usize,
}

impl State {
    fn powered(&self) -> bool {
        self.all_full == Some(true)
    }

    fn respond(&mut self, opcode: Opcode, body: &[u8]) {
        let noise = core::mem::take(&mut self.noise);
        self.rx.extend(noise);
        let mut out = heapless::Vec::new();
        if wire::encode(opcode, body, &mut out).is_ok() {
            self.rx.extend(out.iter().copied());
        }
    }

    fn nack(&mut self, code: u8, rejected: Opcode) {
        self.respond(Opcode::Nack, &[code, rejected.into()]);
    }

    fn uid_on(&self, bus: usize) -> u64 {
        match &self.tanks[bus] {
            Some(t) if self.powered() => t.uid,
            _ => u64::MAX,
        }
    }

    /// The tank on `bus`, if it is plugged and powered
    fn reachable(&mut self, bus: usize) -> Option<&mut SimTank> {
        if !self.powered() {
            return None;
        }
        self.tanks.get_mut(bus)?.as_mut()
    }

    fn handle(&mut self, opcode: Opcode, body: &[u8]) {
        if self.silent {
            if opcode == Opcode::Wakeup {
                self.wakeups += 1;
            }
            return;
        }
        if self.asleep && opcode != Opcode::Wakeup {
            return;
        }
        self.requests.push(opcode);

        let one_wire = matches!(
            opcode,
            Opcode::GetPresence | Opcode::RollCall | Opcode::GetUid | Opcode::ReadBytes | Opcode::WriteBytes
        );
        if one_wire && !self.powered() {
            self.unpowered_requests += 1;
        }

        match opcode {
            Opcode::Wakeup => {
                self.wakeups += 1;
                self.asleep = false;
                self.respond(Opcode::Ack, &[opcode.into()]);
            }
            Opcode::Sleep => {
                self.respond(Opcode::Ack, &[opcode.into()]);
                self.asleep = true;
            }
            Opcode::GetPresence => {
                let mut map = 0u16;
                for bus in 0..BUS_COUNT {
                    if self.uid_on(bus) != u64::MAX {
                        map |= 1 << bus;
                    }
                }
                self.respond(opcode, &map.to_le_bytes());
            }
            Opcode::RollCall => {
                let mut out = [0u8; 8 * BUS_COUNT];
                for (bus, chunk) in out.chunks_exact_mut(8).enumerate() {
                    chunk.copy_from_slice(&self.uid_on(bus).to_le_bytes());
                }
                self.respond(opcode, &out);
            }
            Opcode::GetUid => match *body {
                [bus] if (bus as usize) < BUS_COUNT => {
                    let mut out = [0u8; 9];
                    out[0] = bus;
                    out[1..].copy_from_slice(&self.uid_on(bus as usize).to_le_bytes());
                    self.respond(Opcode::HaveUid, &out);
                }
                _ => self.nack(NACK_BAD_REQUEST, opcode),
            },
            Opcode::ReadBytes => {
                let [bus, off, len] = *body else {
                    return self.nack(NACK_BAD_REQUEST, opcode);
                };
                let range = off as usize..off as usize + len as usize;
                if range.end > RECORD_LEN {
                    return self.nack(NACK_BAD_REQUEST, opcode);
                }
                let Some(tank) = self.reachable(bus as usize) else {
                    return self.nack(NACK_NO_DEVICE, opcode);
                };
                let mut out = Vec::from([bus, off, len]);
                out.extend_from_slice(&tank.mem[range]);
                self.respond(opcode, &out);
            }
            Opcode::WriteBytes => {
                let [bus, off, len, ref data @ ..] = *body else {
                    return self.nack(NACK_BAD_REQUEST, opcode);
                };
                let range = off as usize..off as usize + len as usize;
                if data.len() != len as usize || range.end > RECORD_LEN {
                    return self.nack(NACK_BAD_REQUEST, opcode);
                }
                let Some(tank) = self.reachable(bus as usize) else {
                    return self.nack(NACK_NO_DEVICE, opcode);
                };
                tank.mem[range].copy_from_slice(data);
                self.writes[bus as usize] += 1;
                if self.drop_write_acks > 0 {
                    self.drop_write_acks -= 1;
                } else {
                    self.respond(Opcode::Ack, &[opcode.into()]);
                }
            }
            Opcode::Ack | Opcode::Nack | Opcode::HaveUid => {}
        }
    }
}

/// Handle on the simulated hardware, cheap to clone
#[derive(Clone)]
pub struct SimSwiMux {
    state: Rc<RefCell<State>>,
}

impl SimSwiMux {
    /// Empty buses, powered, awake
    pub fn new() -> Self {
        let state = State {
            tanks: Default::default(),
            decoder: FrameDecoder::new(),
            rx: VecDeque::new(),
            asleep: false,
            silent: false,
            drop_write_acks: 0,
            noise: Vec::new(),
            wakeups: 0,
            requests: Vec::new(),
            writes: [0; BUS_COUNT],
            all_full: Some(true),
            rail: false,
            fail_driver: false,
            pulses: [None; 16],
            driver_log: Vec::new(),
            unpowered_requests: 0,
            actuator_violations: 0,
        };
        Self {
            state: Rc::new(RefCell::new(state)),
        }
    }

    pub fn serial(&self) -> SimSerial {
        SimSerial {
            state: self.state.clone(),
        }
    }

    pub fn driver(&self) -> SimDriver {
        SimDriver {
            state: self.state.clone(),
        }
    }

    /// Plug a blank (erased) tank on `bus`
    pub fn insert(&self, bus: usize, uid: u64) {
        self.insert_with(bus, uid, [0xFF; RECORD_LEN]);
    }

    /// Plug a tank with the given memory on `bus`
    pub fn insert_with(&self, bus: usize, uid: u64, mem: [u8; RECORD_LEN]) {
        self.state.borrow_mut().tanks[bus] = Some(SimTank { uid, mem });
    }

    /// Unplug the tank on `bus`, returning its UID and memory
    pub fn remove(&self, bus: usize) -> Option<(u64, [u8; RECORD_LEN])> {
        self.state.borrow_mut().tanks[bus].take().map(|t| (t.uid, t.mem))
    }

    pub fn memory(&self, bus: usize) -> [u8; RECORD_LEN] {
        self.state.borrow().tanks[bus].as_ref().map(|t| t.mem).unwrap_or([0; RECORD_LEN])
    }

    /// XOR `mask` into the byte at `offset` of the tank on `bus`
    pub fn corrupt(&self, bus: usize, offset: usize, mask: u8) {
        if let Some(t) = self.state.borrow_mut().tanks[bus].as_mut() {
            t.mem[offset] ^= mask;
        }
    }

    pub fn set_silent(&self, silent: bool) {
        self.state.borrow_mut().silent = silent;
    }

    /// Apply the next `n` writes, but do not ACK them
    pub fn drop_acks(&self, n: usize) {
        self.state.borrow_mut().drop_write_acks = n;
    }

    /// Bytes sent on the line ahead of the next response
    pub fn inject_noise(&self, noise: &[u8]) {
        self.state.borrow_mut().noise = noise.to_vec();
    }

    pub fn wakeups(&self) -> usize {
        self.state.borrow().wakeups
    }

    pub fn is_asleep(&self) -> bool {
        self.state.borrow().asleep
    }

    pub fn writes(&self, bus: usize) -> usize {
        self.state.borrow().writes[bus]
    }

    /// Count of requests of the given kind received so far
    pub fn requests(&self, opcode: Opcode) -> usize {
        self.state.borrow().requests.iter().filter(|o| **o == opcode).count()
    }

    pub fn is_powered(&self) -> bool {
        self.state.borrow().powered()
    }

    pub fn rail(&self) -> bool {
        self.state.borrow().rail
    }

    pub fn fail_driver(&self, fail: bool) {
        self.state.borrow_mut().fail_driver = fail;
    }

    /// Current pulse of `channel`, in ticks
    pub fn pulse(&self, channel: usize) -> Option<u16> {
        self.state.borrow().pulses[channel]
    }

    pub fn take_driver_log(&self) -> Vec<DriverCall> {
        core::mem::take(&mut self.state.borrow_mut().driver_log)
    }

    /// 1-Wire requests received while the buses were unpowered
    pub fn unpowered_requests(&self) -> usize {
        self.state.borrow().unpowered_requests
    }

    /// Servo commands received while the buses were powered
    pub fn actuator_violations(&self) -> usize {
        self.state.borrow().actuator_violations
    }
}

/// Host side UART of the simulated SwiMux
pub struct SimSerial {
    state: Rc<RefCell<State>>,
}

impl SwiSerial for SimSerial {
    type SerError = ();

    async fn write_all(&mut self, data: &[u8]) -> Result<(), Error<()>> {
        let mut st = self.state.borrow_mut();
        for &b in data {
            if let Ok(DecodeStatus::Done) = st.decoder.push(b) {
                let Some(frame) = st.decoder.frame() else {
                    continue;
                };
                let opcode = frame.opcode;
                let body = frame.body.to_vec();
                st.handle(opcode, &body);
            }
        }
        Ok(())
    }

    async fn read_byte(&mut self) -> Result<u8, Error<()>> {
        core::future::poll_fn(|_| match self.state.borrow_mut().rx.pop_front() {
            Some(b) => Poll::Ready(Ok(b)),
            None => Poll::Pending,
        })
        .await
    }

    fn discard_input(&mut self) {
        self.state.borrow_mut().rx.clear();
    }
}

/// Pulse driver sharing the simulated board state
pub struct SimDriver {
    state: Rc<RefCell<State>>,
}

impl SimDriver {
    fn call(&mut self, call: DriverCall) -> Result<(), ()> {
        let mut st = self.state.borrow_mut();
        if st.fail_driver {
            return Err(());
        }
        st.driver_log.push(call);
        Ok(())
    }
}

impl PulseDriver for SimDriver {
    type DrvError = ();

    async fn set_frequency(&mut self, hz: u16) -> Result<(), ()> {
        self.call(DriverCall::Frequency(hz))
    }

    async fn set_all_full(&mut self, on: bool) -> Result<(), ()> {
        self.call(DriverCall::AllFull(on))?;
        let mut st = self.state.borrow_mut();
        st.all_full = Some(on);
        st.pulses = [None; 16];
        Ok(())
    }

    async fn set_pulse_ticks(&mut self, channel: u8, on: u16, off: u16) -> Result<(), ()> {
        self.call(DriverCall::Pulse(channel, off - on))?;
        let mut st = self.state.borrow_mut();
        if st.powered() {
            st.actuator_violations += 1;
        }
        st.all_full = None;
        st.pulses[channel as usize] = Some(off - on);
        Ok(())
    }

    fn set_servo_rail(&mut self, on: bool) {
        let mut st = self.state.borrow_mut();
        st.driver_log.push(DriverCall::Rail(on));
        if on && st.powered() {
            st.actuator_violations += 1;
        }
        st.rail = on;
    }
}
