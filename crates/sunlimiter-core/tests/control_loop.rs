// Copyright (c) 2025 SOLARE S.R.O.
//
// This file is part of SunLimiter.
//
// Licensed under the Creative Commons Attribution-NonCommercial-NoDerivatives 4.0 International
// (CC BY-NC-ND 4.0). You may use and share this file for non-commercial purposes only and you may not
// create derivatives. See <https://creativecommons.org/licenses/by-nc-nd/4.0/>.
//
// This software is provided "AS IS", without warranty of any kind.
//
// For commercial licensing, please contact: info@solare.cz

//! Closed-loop regulation against a simulated household with one
//! battery-powered inverter and its battery.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use sunlimiter_core::{
    BatteryTelemetry, Collaborators, CommandState, CommandStatus, ControlLoop, InverterHandle,
    InverterRegistry, MpptGroup, PowerMeter, SolarChargerTelemetry, SolarClock, SystemControl,
    TickStatus, Timed,
};
use sunlimiter_types::{AppConfig, ChargerOperationMode, InverterConfig, InverterPowerSource};

const RATED_W: f32 = 800.0;
const COMMAND_LATENCY_MS: u64 = 500;

#[derive(Debug)]
struct HouseState {
    load_w: f32,
    limit_percent: f32,
    producing: bool,
    responsive: bool,
    pending_limit: Option<(f32, u64)>,
    limit_command: CommandState,
    statistics_ms: u64,
    meter_w: f32,
    meter_ms: u64,
    sent_limits: usize,
    restarts: u32,
    soc: Option<f32>,
    battery_voltage: f32,
    discharge_limit_a: Option<f32>,
    battery_ms: u64,
}

/// Household, inverter, battery and power meter in one
#[derive(Debug)]
struct House {
    state: Mutex<HouseState>,
}

impl House {
    fn new(load_w: f32) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(HouseState {
                load_w,
                limit_percent: 12.5,
                producing: true,
                responsive: true,
                pending_limit: None,
                limit_command: CommandState::default(),
                statistics_ms: 0,
                meter_w: 0.0,
                meter_ms: 0,
                sent_limits: 0,
                restarts: 0,
                soc: Some(90.0),
                battery_voltage: 52.0,
                discharge_limit_a: None,
                battery_ms: 0,
            }),
        })
    }

    fn output_w(s: &HouseState) -> f32 {
        if s.producing {
            s.limit_percent * RATED_W / 100.0
        } else {
            0.0
        }
    }

    /// Everything the devices do within one second
    fn step(&self, now_ms: u64) {
        let mut s = self.state.lock();
        if s.responsive
            && let Some((percent, sent_ms)) = s.pending_limit
            && now_ms.saturating_sub(sent_ms) >= COMMAND_LATENCY_MS
        {
            s.pending_limit = None;
            s.limit_percent = percent;
            s.limit_command = CommandState {
                status: CommandStatus::Ok,
                updated_ms: now_ms,
            };
        }
        if s.responsive {
            s.statistics_ms = now_ms;
        }
        s.meter_w = s.load_w - Self::output_w(&s);
        s.meter_ms = now_ms;
        s.battery_ms = now_ms;
    }

    fn meter_w(&self) -> f32 {
        self.state.lock().meter_w
    }

    fn output(&self) -> f32 {
        Self::output_w(&self.state.lock())
    }
}

impl InverterHandle for House {
    fn serial(&self) -> u64 {
        0x1161_2345_6789
    }

    fn is_reachable(&self) -> bool {
        true
    }

    fn is_producing(&self) -> bool {
        self.state.lock().producing
    }

    fn commands_enabled(&self) -> bool {
        true
    }

    fn supports_power_distribution_logic(&self) -> bool {
        false
    }

    fn rated_max_power_w(&self) -> Option<u16> {
        Some(RATED_W as u16)
    }

    fn current_limit_percent(&self) -> Option<f32> {
        Some(self.state.lock().limit_percent)
    }

    fn ac_output_w(&self) -> f32 {
        self.output()
    }

    fn efficiency_percent(&self) -> f32 {
        95.0
    }

    fn mppt_groups(&self) -> Vec<MpptGroup> {
        Vec::new()
    }

    fn last_limit_command(&self) -> CommandState {
        self.state.lock().limit_command
    }

    fn last_power_command(&self) -> CommandState {
        CommandState::default()
    }

    fn last_statistics_ms(&self) -> u64 {
        self.state.lock().statistics_ms
    }

    fn send_power_state(&self, on: bool) {
        self.state.lock().producing = on;
    }

    fn send_limit_percent(&self, percent: f32) {
        let mut s = self.state.lock();
        s.sent_limits += 1;
        // sent within the tick following the last step
        s.pending_limit = Some((percent, s.meter_ms));
        s.limit_command.status = CommandStatus::Pending;
    }

    fn send_restart(&self) {
        self.state.lock().restarts += 1;
    }
}

impl PowerMeter for House {
    fn power_total_w(&self) -> Option<f32> {
        Some(self.meter_w())
    }

    fn last_update_ms(&self) -> u64 {
        self.state.lock().meter_ms
    }
}

#[derive(Debug)]
struct Registry(Arc<House>);

impl InverterRegistry for Registry {
    fn by_serial(&self, serial: u64) -> Option<Arc<dyn InverterHandle>> {
        (serial == self.0.serial()).then(|| Arc::clone(&self.0) as Arc<dyn InverterHandle>)
    }
}

impl BatteryTelemetry for House {
    fn voltage(&self) -> Option<Timed<f32>> {
        let s = self.state.lock();
        Some(Timed::new(s.battery_voltage, s.battery_ms))
    }

    fn current(&self) -> Option<Timed<f32>> {
        None
    }

    fn state_of_charge(&self) -> Option<Timed<f32>> {
        let s = self.state.lock();
        s.soc.map(|soc| Timed::new(soc, s.battery_ms))
    }

    fn discharge_current_limit(&self) -> Option<Timed<f32>> {
        let s = self.state.lock();
        s.discharge_limit_a.map(|limit| Timed::new(limit, s.battery_ms))
    }

    fn immediate_charging_requested(&self) -> bool {
        false
    }
}

#[derive(Debug)]
struct Surroundings;

impl SolarChargerTelemetry for Surroundings {
    fn operation_mode(&self) -> Option<ChargerOperationMode> {
        Some(ChargerOperationMode::Bulk)
    }

    fn output_voltage(&self) -> Option<f32> {
        None
    }

    fn absorption_voltage(&self) -> Option<f32> {
        None
    }

    fn float_voltage(&self) -> Option<f32> {
        None
    }

    fn panel_power_w(&self) -> Option<f32> {
        None
    }
}

impl SolarClock for Surroundings {
    fn now(&self) -> Option<DateTime<Utc>> {
        Some(Utc::now())
    }

    fn minutes_to_sunset(&self) -> Option<i32> {
        Some(240)
    }

    fn is_day_period(&self) -> bool {
        true
    }
}

#[derive(Debug, Default)]
struct System {
    restarts: Mutex<u32>,
}

impl SystemControl for System {
    fn request_restart(&self) {
        *self.restarts.lock() += 1;
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("info")
        .try_init();
}

fn setup(load_w: f32) -> (Arc<House>, Arc<System>, ControlLoop) {
    init_tracing();

    let house = House::new(load_w);
    let system = Arc::new(System::default());
    let io = Collaborators {
        battery: house.clone(),
        charger: Arc::new(Surroundings),
        clock: Arc::new(Surroundings),
        meter: house.clone(),
        registry: Arc::new(Registry(house.clone())),
        system: system.clone(),
    };

    let mut config = AppConfig::default();
    config.inverters = vec![InverterConfig::new(
        house.serial(),
        InverterPowerSource::Battery,
    )];

    (house, system, ControlLoop::new(config, io))
}

/// Steps the house and the control loop once per second
fn run(house: &House, control: &mut ControlLoop, from_ms: u64, to_ms: u64) -> Vec<TickStatus> {
    (from_ms..to_ms)
        .step_by(1000)
        .map(|now_ms| {
            house.step(now_ms);
            control.tick(now_ms).status
        })
        .collect()
}

#[test]
fn test_regulates_to_zero_import() {
    let (house, _system, mut control) = setup(300.0);

    let statuses = run(&house, &mut control, 1000, 12_000);

    assert!(statuses.contains(&TickStatus::PowerMeterPending));
    assert!(statuses.contains(&TickStatus::Updated));
    assert_eq!(statuses.last(), Some(&TickStatus::Stable));
    assert!(house.meter_w().abs() < 1.0);
    assert_eq!(house.state.lock().sent_limits, 1);
}

#[test]
fn test_follows_load_changes() {
    let (house, _system, mut control) = setup(300.0);
    run(&house, &mut control, 1000, 12_000);

    house.state.lock().load_w = 500.0;
    run(&house, &mut control, 12_000, 24_000);
    assert!((house.output() - 500.0).abs() < 1.0);

    // within hysteresis nothing changes
    house.state.lock().load_w = 505.0;
    let statuses = run(&house, &mut control, 24_000, 30_000);
    assert!(!statuses.contains(&TickStatus::Updated));
    assert_eq!(house.state.lock().sent_limits, 2);

    house.state.lock().load_w = 120.0;
    run(&house, &mut control, 30_000, 42_000);
    assert!((house.output() - 120.0).abs() < 1.0);
}

#[test]
fn test_unresponsive_inverter_is_restarted() {
    let (house, system, mut control) = setup(300.0);
    house.state.lock().responsive = false;

    let statuses = run(&house, &mut control, 1000, 400_000);

    assert!(statuses.contains(&TickStatus::InverterCmdPending));
    assert_eq!(house.state.lock().restarts, 1);
    assert_eq!(*system.restarts.lock(), 0);
    assert!(control.max_update_timeouts() >= 10);
    assert_eq!(control.inverter_statuses()[0].update_timeouts, control.max_update_timeouts());
}

#[test]
fn test_empty_battery_stops_discharge() {
    let (house, _system, mut control) = setup(300.0);
    {
        let mut s = house.state.lock();
        s.soc = Some(0.0);
        s.battery_voltage = 44.0;
    }

    run(&house, &mut control, 1000, 12_000);

    assert!(!control.is_battery_discharge_enabled());
    assert!(house.output().abs() < f32::EPSILON);
    assert!((house.meter_w() - 300.0).abs() < 1.0);
}

#[test]
fn test_discharge_cycle_between_thresholds() {
    let (house, _system, mut control) = setup(300.0);
    run(&house, &mut control, 1000, 12_000);
    assert!((house.output() - 300.0).abs() < 1.0);

    house.state.lock().soc = Some(20.0);
    run(&house, &mut control, 12_000, 24_000);
    assert!(house.output().abs() < f32::EPSILON);

    // recharged, but not yet up to the start threshold
    house.state.lock().soc = Some(50.0);
    run(&house, &mut control, 24_000, 36_000);
    assert!(house.output().abs() < f32::EPSILON);

    house.state.lock().soc = Some(80.0);
    run(&house, &mut control, 36_000, 48_000);
    assert!(control.is_battery_discharge_enabled());
    assert!((house.output() - 300.0).abs() < 1.0);
}

#[test]
fn test_voltage_thresholds_without_soc() {
    let (house, _system, mut control) = setup(300.0);
    {
        let mut s = house.state.lock();
        s.soc = None;
        s.battery_voltage = 50.5;
    }
    run(&house, &mut control, 1000, 12_000);
    assert!((house.output() - 300.0).abs() < 1.0);

    // 48.5 V plus 0.3 V for the 300 W load
    house.state.lock().battery_voltage = 48.5;
    run(&house, &mut control, 12_000, 24_000);
    assert!(house.output().abs() < f32::EPSILON);
}

#[test]
fn test_bms_discharge_limit_caps_output() {
    let (house, _system, mut control) = setup(700.0);
    // 5 A at 52 V, 260 W DC
    house.state.lock().discharge_limit_a = Some(5.0);

    run(&house, &mut control, 1000, 12_000);

    assert!((house.output() - 239.0).abs() < 1.0);
    assert!((house.meter_w() - 461.0).abs() < 1.0);
}
