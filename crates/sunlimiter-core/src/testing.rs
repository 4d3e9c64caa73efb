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

//! Mock collaborators shared by the unit tests.

use crate::telemetry::{
    BatteryTelemetry, CommandState, CommandStatus, InverterHandle, InverterRegistry, MpptGroup,
    PowerMeter, SolarChargerTelemetry, SolarClock, SystemControl, Timed,
};
use sunlimiter_types::ChargerOperationMode;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct MockInverterState {
    pub reachable: bool,
    pub producing: bool,
    pub commands_enabled: bool,
    pub power_distribution_logic: bool,
    pub rated_max_power_w: Option<u16>,
    pub limit_percent: Option<f32>,
    pub ac_output_w: f32,
    pub efficiency_percent: f32,
    pub mppt_groups: Vec<MpptGroup>,
    pub limit_command: CommandState,
    pub power_command: CommandState,
    pub statistics_ms: u64,
    pub sent_limits: Vec<f32>,
    pub sent_power_states: Vec<bool>,
    pub restarts: u32,
    pending_limit: Option<f32>,
    pending_power: Option<bool>,
}

#[derive(Debug)]
pub struct MockInverter {
    serial: u64,
    pub state: Mutex<MockInverterState>,
}

impl MockInverter {
    /// Reachable, producing 200 W at a 25 % limit of 800 W, two MPPTs
    pub fn new(serial: u64) -> Arc<Self> {
        Arc::new(Self {
            serial,
            state: Mutex::new(MockInverterState {
                reachable: true,
                producing: true,
                commands_enabled: true,
                power_distribution_logic: false,
                rated_max_power_w: Some(800),
                limit_percent: Some(25.0),
                ac_output_w: 200.0,
                efficiency_percent: 95.0,
                mppt_groups: vec![mppt(110.0, 32.0), mppt(110.0, 32.0)],
                limit_command: CommandState::default(),
                power_command: CommandState::default(),
                statistics_ms: 0,
                sent_limits: Vec::new(),
                sent_power_states: Vec::new(),
                restarts: 0,
                pending_limit: None,
                pending_power: None,
            }),
        })
    }

    /// Answer all pending commands at `now_ms` and publish fresh statistics
    pub fn acknowledge(&self, now_ms: u64) {
        let mut s = self.state.lock();
        if let Some(percent) = s.pending_limit.take() {
            s.limit_percent = Some(percent);
            s.limit_command = CommandState {
                status: CommandStatus::Ok,
                updated_ms: now_ms,
            };
        }
        if let Some(on) = s.pending_power.take() {
            s.producing = on;
            s.power_command = CommandState {
                status: CommandStatus::Ok,
                updated_ms: now_ms,
            };
        }
        let rated = f32::from(s.rated_max_power_w.unwrap_or(0));
        s.ac_output_w = if s.producing {
            s.limit_percent.unwrap_or(0.0) * rated / 100.0
        } else {
            0.0
        };
        s.statistics_ms = now_ms;
    }

    /// Let the pending limit command fail at `now_ms`
    pub fn fail_limit_command(&self, now_ms: u64) {
        let mut s = self.state.lock();
        s.pending_limit = None;
        s.limit_command = CommandState {
            status: CommandStatus::Failed,
            updated_ms: now_ms,
        };
    }
}

pub fn mppt(dc_power_w: f32, voltage: f32) -> MpptGroup {
    MpptGroup {
        channel_power_w: vec![dc_power_w],
        channel_voltage: vec![voltage],
    }
}

impl InverterHandle for MockInverter {
    fn serial(&self) -> u64 {
        self.serial
    }

    fn is_reachable(&self) -> bool {
        self.state.lock().reachable
    }

    fn is_producing(&self) -> bool {
        self.state.lock().producing
    }

    fn commands_enabled(&self) -> bool {
        self.state.lock().commands_enabled
    }

    fn supports_power_distribution_logic(&self) -> bool {
        self.state.lock().power_distribution_logic
    }

    fn rated_max_power_w(&self) -> Option<u16> {
        self.state.lock().rated_max_power_w
    }

    fn current_limit_percent(&self) -> Option<f32> {
        self.state.lock().limit_percent
    }

    fn ac_output_w(&self) -> f32 {
        self.state.lock().ac_output_w
    }

    fn efficiency_percent(&self) -> f32 {
        self.state.lock().efficiency_percent
    }

    fn mppt_groups(&self) -> Vec<MpptGroup> {
        self.state.lock().mppt_groups.clone()
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
        s.sent_power_states.push(on);
        s.pending_power = Some(on);
        s.power_command.status = CommandStatus::Pending;
    }

    fn send_limit_percent(&self, percent: f32) {
        let mut s = self.state.lock();
        s.sent_limits.push(percent);
        s.pending_limit = Some(percent);
        s.limit_command.status = CommandStatus::Pending;
    }

    fn send_restart(&self) {
        self.state.lock().restarts += 1;
    }
}

#[derive(Debug, Default)]
pub struct MockRegistry {
    pub inverters: Mutex<Vec<Arc<MockInverter>>>,
}

impl MockRegistry {
    pub fn with(inverters: &[Arc<MockInverter>]) -> Arc<Self> {
        Arc::new(Self {
            inverters: Mutex::new(inverters.to_vec()),
        })
    }
}

impl InverterRegistry for MockRegistry {
    fn by_serial(&self, serial: u64) -> Option<Arc<dyn InverterHandle>> {
        self.inverters
            .lock()
            .iter()
            .find(|inverter| inverter.serial == serial)
            .map(|inverter| Arc::clone(inverter) as Arc<dyn InverterHandle>)
    }
}

#[derive(Debug, Default)]
pub struct MockSystem {
    pub restarts: Mutex<u32>,
}

impl SystemControl for MockSystem {
    fn request_restart(&self) {
        *self.restarts.lock() += 1;
    }
}

#[derive(Debug)]
pub struct MockClock {
    pub synced: Mutex<bool>,
    pub day: Mutex<bool>,
    pub minutes_to_sunset: Mutex<Option<i32>>,
}

impl Default for MockClock {
    fn default() -> Self {
        Self {
            synced: Mutex::new(true),
            day: Mutex::new(true),
            minutes_to_sunset: Mutex::new(Some(300)),
        }
    }
}

impl SolarClock for MockClock {
    fn now(&self) -> Option<DateTime<Utc>> {
        self.synced.lock().then(Utc::now)
    }

    fn minutes_to_sunset(&self) -> Option<i32> {
        *self.minutes_to_sunset.lock()
    }

    fn is_day_period(&self) -> bool {
        *self.day.lock()
    }
}

#[derive(Debug, Default)]
pub struct MockBattery {
    pub voltage: Mutex<Option<Timed<f32>>>,
    pub current: Mutex<Option<Timed<f32>>>,
    pub soc: Mutex<Option<Timed<f32>>>,
    pub discharge_limit: Mutex<Option<Timed<f32>>>,
    pub immediate_charging: Mutex<bool>,
}

impl MockBattery {
    pub fn publish(&self, soc: f32, voltage: f32, now_ms: u64) {
        *self.soc.lock() = Some(Timed::new(soc, now_ms));
        *self.voltage.lock() = Some(Timed::new(voltage, now_ms));
    }
}

impl BatteryTelemetry for MockBattery {
    fn voltage(&self) -> Option<Timed<f32>> {
        *self.voltage.lock()
    }

    fn current(&self) -> Option<Timed<f32>> {
        *self.current.lock()
    }

    fn state_of_charge(&self) -> Option<Timed<f32>> {
        *self.soc.lock()
    }

    fn discharge_current_limit(&self) -> Option<Timed<f32>> {
        *self.discharge_limit.lock()
    }

    fn immediate_charging_requested(&self) -> bool {
        *self.immediate_charging.lock()
    }
}

/// Charger reporting nothing but its mode and panel power
#[derive(Debug, Default)]
pub struct MockCharger {
    pub mode: Mutex<Option<ChargerOperationMode>>,
    pub panel_power_w: Mutex<Option<f32>>,
}

impl SolarChargerTelemetry for MockCharger {
    fn operation_mode(&self) -> Option<ChargerOperationMode> {
        *self.mode.lock()
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
        *self.panel_power_w.lock()
    }
}

#[derive(Debug, Default)]
pub struct MockMeter {
    pub power_w: Mutex<Option<f32>>,
    pub updated_ms: Mutex<u64>,
}

impl MockMeter {
    pub fn publish(&self, power_w: f32, now_ms: u64) {
        *self.power_w.lock() = Some(power_w);
        *self.updated_ms.lock() = now_ms;
    }
}

impl PowerMeter for MockMeter {
    fn power_total_w(&self) -> Option<f32> {
        *self.power_w.lock()
    }

    fn last_update_ms(&self) -> u64 {
        *self.updated_ms.lock()
    }
}
