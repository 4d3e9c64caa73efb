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

//! Built-in plant simulation.
//!
//! A household with a LiFePO4 battery, an MPPT solar charger feeding the DC
//! bus, the configured inverters and a power meter at the grid connection.
//! The sun follows the configured sunrise and sunset in local time.

use anyhow::Result;
use bevy_ecs::prelude::*;
use chrono::{DateTime, Local, NaiveTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use sunlimiter_core::{
    BatteryTelemetry, Collaborators, CommandState, CommandStatus, InverterHandle,
    InverterRegistry, MonotonicClock, MpptGroup, PowerMeter, SolarChargerTelemetry, SolarClock,
    SystemControl, Timed,
};
use sunlimiter_types::{AppConfig, ChargerOperationMode, InverterConfig, InverterPowerSource};
use tracing::{debug, info, warn};

const COMMAND_LATENCY_MS: u64 = 800;
const STATS_INTERVAL_MS: u64 = 1000;
const METER_INTERVAL_MS: u64 = 1000;

const CELLS: f32 = 16.0;
const ABSORPTION_VOLTAGE: f32 = 56.8;
const FLOAT_VOLTAGE: f32 = 54.4;
const INTERNAL_RESISTANCE_OHM: f32 = 0.025;
const PANEL_PEAK_W: f32 = 2400.0;
const CHARGER_MAX_W: f32 = 1800.0;
const INVERTER_EFFICIENCY: f32 = 0.95;
/// BMS discharge limit, derated below 10 % SoC
const DISCHARGE_LIMIT_A: f32 = 25.0;

// ============= Sun clock =============

/// Day period between fixed local sunrise and sunset times
#[derive(Debug, Clone, Copy)]
pub struct FixedSunClock {
    sunrise: NaiveTime,
    sunset: NaiveTime,
}

impl FixedSunClock {
    pub fn new(sunrise: NaiveTime, sunset: NaiveTime) -> Self {
        Self { sunrise, sunset }
    }

    pub fn minutes_to_sunset_at(&self, time: NaiveTime) -> i32 {
        if time >= self.sunset {
            return 0;
        }
        (self.sunset - time).num_minutes() as i32
    }

    pub fn is_day_at(&self, time: NaiveTime) -> bool {
        time >= self.sunrise && time < self.sunset
    }

    /// Relative irradiance, a sine arc from sunrise to sunset
    pub fn irradiance_at(&self, time: NaiveTime) -> f32 {
        if !self.is_day_at(time) {
            return 0.0;
        }
        let day_s = (self.sunset - self.sunrise).num_seconds() as f32;
        let elapsed_s = (time - self.sunrise).num_seconds() as f32;
        (std::f32::consts::PI * elapsed_s / day_s).sin().max(0.0)
    }

    fn local_time() -> NaiveTime {
        Local::now().time()
    }
}

impl SolarClock for FixedSunClock {
    fn now(&self) -> Option<DateTime<Utc>> {
        Some(Utc::now())
    }

    fn minutes_to_sunset(&self) -> Option<i32> {
        Some(self.minutes_to_sunset_at(Self::local_time()))
    }

    fn is_day_period(&self) -> bool {
        self.is_day_at(Self::local_time())
    }
}

// ============= Inverters =============

#[derive(Debug)]
struct SimInverterState {
    producing: bool,
    limit_percent: f32,
    ac_output_w: f32,
    pending_limit: Option<(f32, u64)>,
    pending_power: Option<(bool, u64)>,
    limit_command: CommandState,
    power_command: CommandState,
    statistics_ms: u64,
    last_step_ms: u64,
    mppt_dc_w: Vec<f32>,
    mppt_voltage: Vec<f32>,
}

/// Micro inverter with one MPPT per entry in `shading`
#[derive(Debug)]
pub struct SimInverter {
    serial: u64,
    source: InverterPowerSource,
    rated_w: u16,
    /// Share of the irradiance reaching each MPPT
    shading: Vec<f32>,
    state: Mutex<SimInverterState>,
}

impl SimInverter {
    pub fn new(config: &InverterConfig) -> Self {
        // the second panel of solar-powered inverters is partially shaded
        let (rated_w, shading) = match config.power_source {
            InverterPowerSource::Battery => (800, vec![1.0]),
            InverterPowerSource::Solar | InverterPowerSource::SmartBuffer => {
                (1600, vec![1.0, 0.4])
            }
        };
        let mppts = shading.len();

        Self {
            serial: config.serial,
            source: config.power_source,
            rated_w,
            shading,
            state: Mutex::new(SimInverterState {
                producing: true,
                limit_percent: 100.0,
                ac_output_w: 0.0,
                pending_limit: None,
                pending_power: None,
                limit_command: CommandState::default(),
                power_command: CommandState::default(),
                statistics_ms: 0,
                last_step_ms: 0,
                mppt_dc_w: vec![0.0; mppts],
                mppt_voltage: vec![0.0; mppts],
            }),
        }
    }

    /// Advances the inverter, returns the DC power drawn from the battery bus
    pub fn step(&self, now_ms: u64, irradiance: f32, bus_voltage: f32) -> f32 {
        let mut s = self.state.lock();
        s.last_step_ms = now_ms;

        if let Some((percent, sent_ms)) = s.pending_limit
            && now_ms.saturating_sub(sent_ms) >= COMMAND_LATENCY_MS
        {
            s.pending_limit = None;
            s.limit_percent = percent;
            s.limit_command = CommandState {
                status: CommandStatus::Ok,
                updated_ms: now_ms,
            };
        }
        if let Some((on, sent_ms)) = s.pending_power
            && now_ms.saturating_sub(sent_ms) >= COMMAND_LATENCY_MS
        {
            s.pending_power = None;
            s.producing = on;
            s.power_command = CommandState {
                status: CommandStatus::Ok,
                updated_ms: now_ms,
            };
        }

        let rated = f32::from(self.rated_w);
        let mppts = self.shading.len() as f32;
        // without distribution logic each MPPT gets an even share of the limit
        let limit_per_mppt = s.limit_percent * rated / 100.0 / mppts;
        let from_panels = self.source == InverterPowerSource::Solar;

        let mut total_ac = 0.0;
        for (i, shading) in self.shading.iter().enumerate() {
            let available_dc = if from_panels {
                rated / mppts * 1.1 * irradiance * shading
            } else {
                rated / mppts / INVERTER_EFFICIENCY
            };
            let ac = if s.producing {
                (available_dc * INVERTER_EFFICIENCY).min(limit_per_mppt)
            } else {
                0.0
            };
            s.mppt_dc_w[i] = ac / INVERTER_EFFICIENCY;
            s.mppt_voltage[i] = if from_panels {
                if irradiance > 0.0 { 30.0 + 4.0 * irradiance } else { 0.0 }
            } else {
                bus_voltage
            };
            total_ac += ac;
        }
        s.ac_output_w = total_ac;

        if now_ms.saturating_sub(s.statistics_ms) >= STATS_INTERVAL_MS {
            s.statistics_ms = now_ms;
        }

        if from_panels { 0.0 } else { total_ac / INVERTER_EFFICIENCY }
    }

    pub fn ac_output(&self) -> f32 {
        self.state.lock().ac_output_w
    }
}

impl InverterHandle for SimInverter {
    fn serial(&self) -> u64 {
        self.serial
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
        Some(self.rated_w)
    }

    fn current_limit_percent(&self) -> Option<f32> {
        Some(self.state.lock().limit_percent)
    }

    fn ac_output_w(&self) -> f32 {
        self.ac_output()
    }

    fn efficiency_percent(&self) -> f32 {
        INVERTER_EFFICIENCY * 100.0
    }

    fn mppt_groups(&self) -> Vec<MpptGroup> {
        let s = self.state.lock();
        s.mppt_dc_w
            .iter()
            .zip(&s.mppt_voltage)
            .map(|(&dc, &v)| MpptGroup {
                channel_power_w: vec![dc],
                channel_voltage: vec![v],
            })
            .collect()
    }

    fn last_limit_command(&self) -> CommandState {
        self.state.lock().limit_command
    }

    fn last_power_command(&self) -> CommandState {
        self.state.lock().power_command
    }

    fn last_statistics_ms(&self) -> u64 {
        self.state.lock().statistics_ms
    }

    fn send_power_state(&self, on: bool) {
        let mut s = self.state.lock();
        s.pending_power = Some((on, s.last_step_ms));
        s.power_command.status = CommandStatus::Pending;
    }

    fn send_limit_percent(&self, percent: f32) {
        let mut s = self.state.lock();
        s.pending_limit = Some((percent.clamp(0.0, 100.0), s.last_step_ms));
        s.limit_command.status = CommandStatus::Pending;
    }

    fn send_restart(&self) {
        info!("[simulation] inverter {:012x} restarting", self.serial);
        let mut s = self.state.lock();
        s.pending_limit = None;
        s.pending_power = None;
        s.limit_command.status = CommandStatus::Ok;
        s.power_command.status = CommandStatus::Ok;
    }
}

#[derive(Debug)]
pub struct SimRegistry(Vec<Arc<SimInverter>>);

impl InverterRegistry for SimRegistry {
    fn by_serial(&self, serial: u64) -> Option<Arc<dyn InverterHandle>> {
        self.0
            .iter()
            .find(|inverter| inverter.serial == serial)
            .map(|inverter| Arc::clone(inverter) as Arc<dyn InverterHandle>)
    }
}

// ============= Battery, charger and power meter =============

#[derive(Debug)]
struct PlantState {
    soc: f32,
    voltage: f32,
    current: f32,
    battery_ms: u64,
    mode: Option<ChargerOperationMode>,
    charger_voltage: f32,
    panel_w: f32,
    meter_w: Option<f32>,
    meter_ms: u64,
    last_step_ms: Option<u64>,
    restart_requests: u32,
}

#[derive(Debug)]
pub struct Plant {
    capacity_wh: f32,
    state: Mutex<PlantState>,
}

/// What the inverters did during one step
#[derive(Debug, Clone, Copy, Default)]
pub struct InverterFlows {
    pub ac_output_w: f32,
    pub bus_draw_w: f32,
}

impl Plant {
    pub fn new(capacity_wh: u32, soc: f32) -> Self {
        Self {
            capacity_wh: capacity_wh.max(100) as f32,
            state: Mutex::new(PlantState {
                soc,
                voltage: open_circuit_voltage(soc),
                current: 0.0,
                battery_ms: 0,
                mode: None,
                charger_voltage: 0.0,
                panel_w: 0.0,
                meter_w: None,
                meter_ms: 0,
                last_step_ms: None,
                restart_requests: 0,
            }),
        }
    }

    pub fn step(&self, now_ms: u64, irradiance: f32, load_w: f32, flows: InverterFlows) {
        let mut s = self.state.lock();
        let elapsed_h = s
            .last_step_ms
            .map_or(0.0, |last| now_ms.saturating_sub(last) as f32 / 3_600_000.0);
        s.last_step_ms = Some(now_ms);

        s.panel_w = PANEL_PEAK_W * irradiance;
        let available_w = s.panel_w.min(CHARGER_MAX_W);

        s.mode = Some(if available_w <= 1.0 {
            ChargerOperationMode::Off
        } else if s.soc >= 99.5 || (s.mode == Some(ChargerOperationMode::Float) && s.soc >= 98.0) {
            ChargerOperationMode::Float
        } else if s.soc >= 95.0 {
            ChargerOperationMode::Absorption
        } else {
            ChargerOperationMode::Bulk
        });

        // charge acceptance tapers off once the voltage limit is reached
        let acceptance_w = match s.mode {
            Some(ChargerOperationMode::Bulk) => CHARGER_MAX_W,
            Some(ChargerOperationMode::Absorption) => CHARGER_MAX_W * (100.0 - s.soc) / 5.0,
            _ => 0.0,
        };
        let demand_w = acceptance_w + flows.bus_draw_w;
        let charger_w = available_w.min(demand_w);

        let target_voltage = match s.mode {
            Some(ChargerOperationMode::Absorption) => ABSORPTION_VOLTAGE,
            _ => FLOAT_VOLTAGE,
        };
        // the charger only holds its target voltage with power to spare
        s.charger_voltage = if available_w > demand_w {
            target_voltage
        } else {
            s.voltage
        };

        let net_w = charger_w - flows.bus_draw_w;
        s.current = net_w / s.voltage.max(1.0);
        s.voltage = open_circuit_voltage(s.soc) + s.current * INTERNAL_RESISTANCE_OHM;
        s.soc = (s.soc + net_w * elapsed_h / self.capacity_wh * 100.0).clamp(0.0, 100.0);
        s.battery_ms = now_ms;

        if now_ms.saturating_sub(s.meter_ms) >= METER_INTERVAL_MS || s.meter_w.is_none() {
            s.meter_w = Some(load_w - flows.ac_output_w);
            s.meter_ms = now_ms;
        }
    }

    pub fn restart_requests(&self) -> u32 {
        self.state.lock().restart_requests
    }
}

/// LiFePO4 plateau, 3.15 V to 3.35 V per cell
fn open_circuit_voltage(soc: f32) -> f32 {
    CELLS * (3.15 + 0.2 * soc / 100.0)
}

impl BatteryTelemetry for Plant {
    fn voltage(&self) -> Option<Timed<f32>> {
        let s = self.state.lock();
        Some(Timed::new(s.voltage, s.battery_ms))
    }

    fn current(&self) -> Option<Timed<f32>> {
        let s = self.state.lock();
        Some(Timed::new(s.current, s.battery_ms))
    }

    fn state_of_charge(&self) -> Option<Timed<f32>> {
        let s = self.state.lock();
        Some(Timed::new(s.soc, s.battery_ms))
    }

    fn discharge_current_limit(&self) -> Option<Timed<f32>> {
        let s = self.state.lock();
        let limit = if s.soc < 10.0 {
            DISCHARGE_LIMIT_A / 2.0
        } else {
            DISCHARGE_LIMIT_A
        };
        Some(Timed::new(limit, s.battery_ms))
    }

    fn immediate_charging_requested(&self) -> bool {
        self.state.lock().soc < 5.0
    }
}

impl SolarChargerTelemetry for Plant {
    fn operation_mode(&self) -> Option<ChargerOperationMode> {
        self.state.lock().mode
    }

    fn output_voltage(&self) -> Option<f32> {
        Some(self.state.lock().charger_voltage)
    }

    fn absorption_voltage(&self) -> Option<f32> {
        Some(ABSORPTION_VOLTAGE)
    }

    fn float_voltage(&self) -> Option<f32> {
        Some(FLOAT_VOLTAGE)
    }

    fn panel_power_w(&self) -> Option<f32> {
        Some(self.state.lock().panel_w)
    }
}

impl PowerMeter for Plant {
    fn power_total_w(&self) -> Option<f32> {
        self.state.lock().meter_w
    }

    fn last_update_ms(&self) -> u64 {
        self.state.lock().meter_ms
    }
}

impl SystemControl for Plant {
    fn request_restart(&self) {
        warn!("[simulation] system restart requested, the simulation keeps running");
        self.state.lock().restart_requests += 1;
    }
}

/// Base load with a fridge cycling every 20 minutes and a kettle every 7 minutes
pub fn household_load_w(now_ms: u64) -> f32 {
    let seconds = now_ms / 1000;
    let fridge = if seconds % 1200 < 480 { 90.0 } else { 0.0 };
    let kettle = if seconds % 420 < 90 { 1200.0 } else { 0.0 };
    180.0 + fridge + kettle
}

// ============= Simulation =============

/// Inverters used when the configuration names none
pub fn demo_inverters() -> Vec<InverterConfig> {
    let battery = InverterConfig::new(0x1141_2000_0001, InverterPowerSource::Battery);
    let mut solar = InverterConfig::new(0x1161_2000_0002, InverterPowerSource::Solar);
    solar.use_overscaling = true;
    solar.upper_power_limit_w = 1600;
    vec![battery, solar]
}

#[derive(Resource, Debug)]
pub struct Simulation {
    clock: Arc<FixedSunClock>,
    plant: Arc<Plant>,
    inverters: Vec<Arc<SimInverter>>,
}

impl Simulation {
    pub fn new(config: &AppConfig) -> Result<Self> {
        let clock = FixedSunClock::new(config.system.sunrise_time()?, config.system.sunset_time()?);
        // above the default discharge start threshold
        let plant = Plant::new(config.surplus.battery_capacity_wh, 85.0);
        let inverters = config
            .inverters
            .iter()
            .map(|inverter| Arc::new(SimInverter::new(inverter)))
            .collect::<Vec<_>>();

        info!(
            "[simulation] {} Wh battery, {} inverter(s), sun from {} to {}",
            config.surplus.battery_capacity_wh,
            inverters.len(),
            config.system.sunrise,
            config.system.sunset
        );

        Ok(Self {
            clock: Arc::new(clock),
            plant: Arc::new(plant),
            inverters,
        })
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            battery: self.plant.clone(),
            charger: self.plant.clone(),
            clock: self.clock.clone(),
            meter: self.plant.clone(),
            registry: Arc::new(SimRegistry(self.inverters.clone())),
            system: self.plant.clone(),
        }
    }

    pub fn step_at(&self, now_ms: u64, time: NaiveTime) {
        let irradiance = self.clock.irradiance_at(time);
        let bus_voltage = self.plant.state.lock().voltage;

        let mut flows = InverterFlows::default();
        for inverter in &self.inverters {
            flows.bus_draw_w += inverter.step(now_ms, irradiance, bus_voltage);
            flows.ac_output_w += inverter.ac_output();
        }

        let load_w = household_load_w(now_ms);
        self.plant.step(now_ms, irradiance, load_w, flows);

        debug!(
            "[simulation] load {:.0} W, inverters {:.0} W, irradiance {:.2}",
            load_w, flows.ac_output_w, irradiance
        );
    }
}

/// Advances the plant right before the control loop looks at it
pub fn simulation_step_system(clock: Res<MonotonicClock>, simulation: Res<Simulation>) {
    simulation.step_at(clock.now_ms(), FixedSunClock::local_time());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn time(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn clock() -> FixedSunClock {
        FixedSunClock::new(time(6, 30), time(19, 30))
    }

    #[test]
    fn test_sun_clock() {
        let clock = clock();
        assert_eq!(clock.minutes_to_sunset_at(time(18, 0)), 90);
        assert_eq!(clock.minutes_to_sunset_at(time(21, 0)), 0);
        assert!(clock.is_day_at(time(12, 0)));
        assert!(!clock.is_day_at(time(5, 0)));
        assert!((clock.irradiance_at(time(13, 0)) - 1.0).abs() < 0.001);
        assert!(clock.irradiance_at(time(23, 0)).abs() < f32::EPSILON);
    }

    #[test]
    fn test_limit_takes_effect_after_latency() {
        let config = InverterConfig::new(1, InverterPowerSource::Battery);
        let inverter = SimInverter::new(&config);
        inverter.step(1_000, 0.0, 52.0);
        assert!((inverter.ac_output() - 800.0).abs() < 0.1);

        inverter.send_limit_percent(25.0);
        assert_eq!(inverter.last_limit_command().status, CommandStatus::Pending);

        inverter.step(1_500, 0.0, 52.0);
        assert!((inverter.ac_output() - 800.0).abs() < 0.1);

        inverter.step(2_000, 0.0, 52.0);
        assert!((inverter.ac_output() - 200.0).abs() < 0.1);
        assert_eq!(
            inverter.last_limit_command(),
            CommandState {
                status: CommandStatus::Ok,
                updated_ms: 2_000,
            }
        );
    }

    #[test]
    fn test_shaded_mppt_limits_solar_output() {
        let config = InverterConfig::new(2, InverterPowerSource::Solar);
        let inverter = SimInverter::new(&config);

        let bus_draw = inverter.step(1_000, 1.0, 52.0);

        // 800 W share capped by the limit, 880 W * 0.4 shaded
        let expected = 800.0 + 880.0 * 0.4 * INVERTER_EFFICIENCY;
        assert!((inverter.ac_output() - expected).abs() < 0.5);
        assert!(bus_draw.abs() < f32::EPSILON);
        assert_eq!(inverter.mppt_groups().len(), 2);
    }

    #[test]
    fn test_charger_enters_absorption_near_full() {
        let plant = Plant::new(5000, 96.0);
        plant.step(0, 1.0, 200.0, InverterFlows::default());

        assert_eq!(plant.operation_mode(), Some(ChargerOperationMode::Absorption));
        assert!((plant.output_voltage().unwrap() - ABSORPTION_VOLTAGE).abs() < 0.01);

        plant.step(1_000, 0.0, 200.0, InverterFlows::default());
        assert_eq!(plant.operation_mode(), Some(ChargerOperationMode::Off));
    }

    #[test]
    fn test_battery_discharges_into_inverters() {
        let plant = Plant::new(1000, 50.0);
        let flows = InverterFlows {
            ac_output_w: 380.0,
            bus_draw_w: 400.0,
        };
        plant.step(0, 0.0, 500.0, flows);
        plant.step(3_600_000, 0.0, 500.0, flows);

        assert!((plant.state_of_charge().unwrap().value - 10.0).abs() < 0.1);
        assert!(plant.current().unwrap().value < 0.0);
        assert!((plant.power_total_w().unwrap() - 120.0).abs() < 0.1);
    }

    #[test]
    fn test_household_load_profile() {
        assert!((household_load_w(0) - 1470.0).abs() < 0.1);
        assert!((household_load_w(600_000) - 180.0).abs() < 0.1);
    }
}
