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

//! Diagnostic snapshots produced by the control components.
//!
//! These are plain serde DTOs so that a presentation layer (web API, MQTT, log
//! report) can consume them without depending on the control logic itself.

use crate::inverter::InverterPowerSource;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// State machine shared by both surplus regulation stages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SurplusState {
    #[default]
    Idle,
    TryMore,
    ReducePower,
    InTarget,
    MaximumPower,
    KeepLastPower,
    /// Stage I bookkeeping state, the battery reserve is being calculated
    BulkPower,
}

impl SurplusState {
    pub fn label(self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::TryMore => "Try more power",
            Self::ReducePower => "Reduce power",
            Self::InTarget => "In target range",
            Self::MaximumPower => "Maximum power",
            Self::KeepLastPower => "Keep last power",
            Self::BulkPower => "Reserve battery power",
        }
    }

    /// True for every state owned by the absorption/float stage
    pub fn is_stage_ii(self) -> bool {
        !matches!(self, Self::Idle | Self::BulkPower)
    }
}

impl fmt::Display for SurplusState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Stability of the stage II approximation, derived from the average number of
/// step polarity changes needed to reach the target voltage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RegulationQuality {
    #[default]
    NoData,
    Excellent,
    Good,
    Bad,
}

impl RegulationQuality {
    pub fn from_average(avg: f32) -> Self {
        if avg <= 0.0 {
            Self::NoData
        } else if avg <= 1.1 {
            Self::Excellent
        } else if avg <= 1.8 {
            Self::Good
        } else {
            Self::Bad
        }
    }
}

impl fmt::Display for RegulationQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoData => write!(f, "Insufficient data"),
            Self::Excellent => write!(f, "Excellent"),
            Self::Good => write!(f, "Good"),
            Self::Bad => write!(f, "Bad"),
        }
    }
}

/// Enable flags and the last active time range of one regulation stage
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageActivity {
    pub enabled: bool,
    pub temporarily_off: bool,
    pub active: bool,
    pub last_start: Option<DateTime<Utc>>,
    /// `None` while the stage is still running
    pub last_stop: Option<DateTime<Utc>>,
}

impl StageActivity {
    /// Human readable range, e.g. `19.10.2026 12:10 - 13:45` or `... - ongoing`
    pub fn range_text(&self) -> String {
        match (self.last_start, self.last_stop) {
            (None, _) => "never".to_owned(),
            (Some(start), _) if self.active => {
                format!("{} - ongoing", start.format("%d.%m.%Y %H:%M"))
            }
            (Some(start), Some(stop)) => format!(
                "{} - {}",
                start.format("%d.%m.%Y %H:%M"),
                stop.format("%H:%M")
            ),
            (Some(start), None) => start.format("%d.%m.%Y %H:%M").to_string(),
        }
    }
}

/// Error counters per fault kind since start-up
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SurplusFaultCounters {
    pub time: u32,
    pub charger: u32,
    pub battery: u32,
    pub solar_power: u32,
}

impl SurplusFaultCounters {
    pub fn total(&self) -> u32 {
        self.time + self.charger + self.battery + self.solar_power
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SurplusStatus {
    pub state: SurplusState,
    pub stage_i: StageActivity,
    pub stage_ii: StageActivity,
    pub surplus_power_w: i32,
    pub slope_power_w: i32,
    pub slope_mode_enabled: bool,
    /// `None` while no reserve was calculated yet
    pub battery_reserve_w: Option<i32>,
    pub solar_power_w: i32,
    /// Share of solar estimates taken from the charger vs. inverter + battery (%)
    pub solar_source_charger_percent: f32,
    pub solar_source_battery_percent: f32,
    pub target_voltage_min: Option<f32>,
    pub target_voltage_max: Option<f32>,
    pub power_step_w: i32,
    pub quality: RegulationQuality,
    pub quality_average: f32,
    pub quality_max: f32,
    pub quality_count: u32,
    pub errors: SurplusFaultCounters,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatteryGuardStatus {
    pub resolution_sufficient: bool,
    /// Resistance in use (calculated if available, else configured)
    pub resistance_mohm: Option<f32>,
    pub calculated_resistance_mohm: f32,
    pub calculated_resistance_min_mohm: f32,
    pub calculated_resistance_max_mohm: f32,
    pub calculation_count: u32,
    pub configured_resistance_mohm: f32,
    pub resistance_state: String,
    pub open_circuit_voltage: Option<f32>,
    pub battery_voltage: f32,
    pub voltage_resolution_mv: f32,
    pub current_resolution_ma: f32,
    pub measurement_period_ms: u32,
    pub vi_delay_ms: f32,
    pub ocv_not_available_count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InverterStatus {
    pub serial: String,
    pub power_source: InverterPowerSource,
    pub eligibility: String,
    pub reachable: bool,
    pub producing: bool,
    pub behind_power_meter: bool,
    pub current_output_w: u16,
    pub current_limit_w: Option<u16>,
    pub expected_output_w: u16,
    pub configured_max_w: u16,
    pub lower_limit_w: u16,
    pub max_reduction_w: u16,
    pub max_increase_w: u16,
    pub target_power_state: Option<bool>,
    pub target_limit_w: Option<u16>,
    pub update_timeouts: u32,
}
