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

//! Capabilities the control logic consumes.
//!
//! Device drivers (BMS, MPPT charger, inverter radio, power meter) live outside
//! this crate. They implement these traits and are expected to synchronise
//! their own state; every method here is a cheap read or a fire-and-forget
//! command. Timestamps are monotonic milliseconds on the same clock that is
//! passed to [`crate::ControlLoop::tick`].

use chrono::{DateTime, Utc};
use std::sync::Arc;
use sunlimiter_types::ChargerOperationMode;

/// A reading together with the time it was measured
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Timed<T> {
    pub value: T,
    pub timestamp_ms: u64,
}

impl<T> Timed<T> {
    pub fn new(value: T, timestamp_ms: u64) -> Self {
        Self {
            value,
            timestamp_ms,
        }
    }

    pub fn age_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.timestamp_ms)
    }
}

// ============= Battery and solar charger =============

pub trait BatteryTelemetry: Send + Sync {
    /// Battery voltage (V)
    fn voltage(&self) -> Option<Timed<f32>>;

    /// Battery current (A), positive = charging
    fn current(&self) -> Option<Timed<f32>>;

    /// State of charge (%)
    fn state_of_charge(&self) -> Option<Timed<f32>>;

    /// Maximum discharge current the BMS permits (A)
    fn discharge_current_limit(&self) -> Option<Timed<f32>>;

    /// The BMS asks to stop discharging and charge immediately
    fn immediate_charging_requested(&self) -> bool;
}

pub trait SolarChargerTelemetry: Send + Sync {
    fn operation_mode(&self) -> Option<ChargerOperationMode>;

    /// Charger output voltage (V), identical to what the charger regulates on
    fn output_voltage(&self) -> Option<f32>;

    fn absorption_voltage(&self) -> Option<f32>;

    fn float_voltage(&self) -> Option<f32>;

    /// Power delivered by the panels (W)
    fn panel_power_w(&self) -> Option<f32>;
}

/// Local time and sun position
pub trait SolarClock: Send + Sync {
    /// Wall clock, `None` until time is synchronised
    fn now(&self) -> Option<DateTime<Utc>>;

    /// Minutes from now to sunset, 0 after sunset, `None` if unknown
    fn minutes_to_sunset(&self) -> Option<i32>;

    fn is_day_period(&self) -> bool;
}

// ============= Inverter =============

/// Outcome of the last command of one kind sent to an inverter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommandStatus {
    #[default]
    Ok,
    Pending,
    Failed,
}

/// Last command of one kind together with the time the inverter answered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CommandState {
    pub status: CommandStatus,
    pub updated_ms: u64,
}

/// A group of DC inputs sharing one MPPT
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MpptGroup {
    /// Power of each DC channel in the group (W)
    pub channel_power_w: Vec<f32>,
    /// Voltage of each DC channel in the group (V)
    pub channel_voltage: Vec<f32>,
}

impl MpptGroup {
    pub fn dc_power_w(&self) -> f32 {
        self.channel_power_w.iter().sum()
    }

    pub fn max_voltage(&self) -> f32 {
        self.channel_voltage.iter().copied().fold(0.0, f32::max)
    }
}

/// Command interface and statistics of a single micro-inverter
pub trait InverterHandle: Send + Sync {
    fn serial(&self) -> u64;

    fn is_reachable(&self) -> bool;

    fn is_producing(&self) -> bool;

    fn commands_enabled(&self) -> bool;

    /// Inverter distributes its limit across DC inputs on its own
    fn supports_power_distribution_logic(&self) -> bool;

    /// Model dependent maximum AC output, unknown until device info arrived
    fn rated_max_power_w(&self) -> Option<u16>;

    /// Limit currently in effect (% of rated max), unknown after start-up
    fn current_limit_percent(&self) -> Option<f32>;

    fn ac_output_w(&self) -> f32;

    /// Conversion efficiency (%)
    fn efficiency_percent(&self) -> f32;

    /// DC inputs grouped by MPPT
    fn mppt_groups(&self) -> Vec<MpptGroup>;

    fn last_limit_command(&self) -> CommandState;

    fn last_power_command(&self) -> CommandState;

    /// Time the last statistics were received
    fn last_statistics_ms(&self) -> u64;

    fn send_power_state(&self, on: bool);

    fn send_limit_percent(&self, percent: f32);

    fn send_restart(&self);

    fn dc_channel_count(&self) -> usize {
        self.mppt_groups()
            .iter()
            .map(|g| g.channel_power_w.len())
            .sum()
    }
}

/// Resolves configured serials to live inverter handles
pub trait InverterRegistry: Send + Sync {
    fn by_serial(&self, serial: u64) -> Option<Arc<dyn InverterHandle>>;
}

// ============= Grid side and system =============

pub trait PowerMeter: Send + Sync {
    /// Household import (W, negative = export), `None` while stale
    fn power_total_w(&self) -> Option<f32>;

    fn last_update_ms(&self) -> u64;
}

pub trait SystemControl: Send + Sync {
    /// Restart the whole controller
    fn request_restart(&self);
}
