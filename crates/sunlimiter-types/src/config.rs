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

//! Application configuration.
//!
//! Every field carries a serde default so that a partial `config.toml` is
//! enough to get going. Structural errors are rejected by [`AppConfig::validate`],
//! out-of-range tuning values are pulled back into their allowed range by
//! [`AppConfig::sanitize`].

use crate::error::{ConfigError, Result};
use crate::inverter::InverterConfig;
use bevy_ecs::prelude::*;
use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

/// Main application configuration
#[derive(Resource, Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct AppConfig {
    /// Dynamic power limiter settings
    #[serde(default)]
    pub limiter: LimiterConfig,

    /// Battery state estimation (internal resistance, open circuit voltage)
    #[serde(default)]
    pub battery_guard: BatteryGuardConfig,

    /// Surplus power regulation (stage I bulk, stage II absorption/float)
    #[serde(default)]
    pub surplus: SurplusConfig,

    /// Managed inverters
    #[serde(default)]
    pub inverters: Vec<InverterConfig>,

    /// Runtime settings
    #[serde(default)]
    pub system: SystemSettingsConfig,
}

/// Dynamic power limiter configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Sum of all inverter limits never exceeds this value (W)
    #[serde(default = "default_total_upper_power_limit")]
    pub total_upper_power_limit_w: u16,

    /// Power requested while the power meter is unavailable (W)
    #[serde(default = "default_base_load_limit")]
    pub base_load_limit_w: u16,

    /// Grid import the limiter aims for (W, negative means export)
    #[serde(default)]
    pub target_power_consumption_w: i32,

    /// Changes smaller than this are not sent to the inverters (W)
    #[serde(default = "default_hysteresis")]
    pub target_power_consumption_hysteresis_w: u16,

    /// Decide on voltage thresholds only, even if the BMS reports a SoC
    #[serde(default)]
    pub ignore_soc: bool,

    /// Battery discharge starts at or above this SoC (%), 0 = use voltage
    #[serde(default = "default_soc_start_threshold")]
    pub battery_soc_start_threshold: f32,

    /// Battery discharge stops at or below this SoC (%), 0 = use voltage
    #[serde(default = "default_soc_stop_threshold")]
    pub battery_soc_stop_threshold: f32,

    /// Battery discharge starts at or above this load-corrected voltage (V), 0 = off
    #[serde(default = "default_voltage_start_threshold")]
    pub voltage_start_threshold: f32,

    /// Battery discharge stops at or below this load-corrected voltage (V), 0 = off
    #[serde(default = "default_voltage_stop_threshold")]
    pub voltage_stop_threshold: f32,

    /// Voltage sag per watt of battery inverter output (V/W), used while
    /// the internal resistance of the battery is unknown
    #[serde(default = "default_voltage_load_correction_factor")]
    pub voltage_load_correction_factor: f32,

    /// Run one discharge cycle per night even below the start threshold
    #[serde(default)]
    pub battery_always_use_at_night: bool,

    /// Battery-powered inverters forward the solar charger output
    #[serde(default = "default_true")]
    pub solar_passthrough_enabled: bool,

    /// Full solar passthrough starts at or above this SoC (%), 0 = use voltage
    #[serde(default = "default_full_solar_passthrough_soc")]
    pub full_solar_passthrough_soc: f32,

    /// Full solar passthrough starts at or above this load-corrected voltage (V)
    #[serde(default = "default_full_solar_passthrough_voltage")]
    pub full_solar_passthrough_start_voltage: f32,

    /// Full solar passthrough ends below this load-corrected voltage (V)
    #[serde(default = "default_full_solar_passthrough_voltage")]
    pub full_solar_passthrough_stop_voltage: f32,

    /// DC cabling and conversion losses between battery and inverters (%)
    #[serde(default = "default_conduction_losses")]
    pub conduction_losses_percent: u8,

    /// Local hour for the daily restart of the non-solar inverters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inverter_restart_hour: Option<u8>,
}

fn default_total_upper_power_limit() -> u16 {
    800
}

fn default_base_load_limit() -> u16 {
    100
}

fn default_hysteresis() -> u16 {
    10
}

fn default_soc_start_threshold() -> f32 {
    80.0
}

fn default_soc_stop_threshold() -> f32 {
    20.0
}

fn default_voltage_start_threshold() -> f32 {
    50.0
}

fn default_voltage_stop_threshold() -> f32 {
    49.0
}

fn default_voltage_load_correction_factor() -> f32 {
    0.001
}

fn default_full_solar_passthrough_soc() -> f32 {
    100.0
}

fn default_full_solar_passthrough_voltage() -> f32 {
    100.0
}

fn default_conduction_losses() -> u8 {
    3
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            total_upper_power_limit_w: default_total_upper_power_limit(),
            base_load_limit_w: default_base_load_limit(),
            target_power_consumption_w: 0,
            target_power_consumption_hysteresis_w: default_hysteresis(),
            ignore_soc: false,
            battery_soc_start_threshold: default_soc_start_threshold(),
            battery_soc_stop_threshold: default_soc_stop_threshold(),
            voltage_start_threshold: default_voltage_start_threshold(),
            voltage_stop_threshold: default_voltage_stop_threshold(),
            voltage_load_correction_factor: default_voltage_load_correction_factor(),
            battery_always_use_at_night: false,
            solar_passthrough_enabled: true,
            full_solar_passthrough_soc: default_full_solar_passthrough_soc(),
            full_solar_passthrough_start_voltage: default_full_solar_passthrough_voltage(),
            full_solar_passthrough_stop_voltage: default_full_solar_passthrough_voltage(),
            conduction_losses_percent: default_conduction_losses(),
            inverter_restart_hour: None,
        }
    }
}

/// Battery state estimator configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatteryGuardConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Known internal resistance of the battery (Ohm), 0 = unknown
    #[serde(default)]
    pub internal_resistance_ohm: f32,
}

impl Default for BatteryGuardConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            internal_resistance_ohm: 0.0,
        }
    }
}

/// Surplus power regulation configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SurplusConfig {
    /// Stage I: share the solar surplus during bulk charging
    #[serde(default)]
    pub stage_i_enabled: bool,

    /// Stage II: approximate the charger voltage during absorption/float
    #[serde(default = "default_true")]
    pub stage_ii_enabled: bool,

    /// Stage I starts at this SoC (%)
    #[serde(default = "default_start_soc")]
    pub start_soc: f32,

    /// Usable battery capacity (Wh)
    #[serde(default = "default_battery_capacity")]
    pub battery_capacity_wh: u32,

    /// Extra battery reserve on top of the calculated one (%)
    #[serde(default = "default_battery_safety")]
    pub battery_safety_percent: f32,

    /// Absorption should start this long before sunset (minutes)
    #[serde(default = "default_absorption_lead")]
    pub absorption_lead_minutes: i32,

    /// Stage I upper power limit (W), 0 = total upper power limit
    #[serde(default)]
    pub stage_i_upper_power_limit_w: u16,

    /// Stage II upper power limit (W), 0 = total upper power limit
    #[serde(default)]
    pub stage_ii_upper_power_limit_w: u16,

    /// Slope mode: surplus power decays slowly instead of dropping to consumption
    #[serde(default)]
    pub slope_mode_enabled: bool,

    /// Added to the real consumption as lower bound of the slope (W)
    #[serde(default = "default_slope_add_power")]
    pub slope_add_power_w: u16,

    /// Slope power reduction (W per second)
    #[serde(default = "default_slope_factor")]
    pub slope_factor_w_per_s: u16,
}

fn default_start_soc() -> f32 {
    50.0
}

fn default_battery_capacity() -> u32 {
    5000
}

fn default_battery_safety() -> f32 {
    50.0
}

fn default_absorption_lead() -> i32 {
    60
}

fn default_slope_add_power() -> u16 {
    25
}

fn default_slope_factor() -> u16 {
    3
}

impl Default for SurplusConfig {
    fn default() -> Self {
        Self {
            stage_i_enabled: false,
            stage_ii_enabled: true,
            start_soc: default_start_soc(),
            battery_capacity_wh: default_battery_capacity(),
            battery_safety_percent: default_battery_safety(),
            absorption_lead_minutes: default_absorption_lead(),
            stage_i_upper_power_limit_w: 0,
            stage_ii_upper_power_limit_w: 0,
            slope_mode_enabled: false,
            slope_add_power_w: default_slope_add_power(),
            slope_factor_w_per_s: default_slope_factor(),
        }
    }
}

/// Runtime settings of the controller binary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemSettingsConfig {
    /// Control loop interval (ms)
    #[serde(default = "default_tick_interval")]
    pub tick_interval_ms: u64,

    /// Print the battery guard, surplus and inverter reports once a minute
    #[serde(default)]
    pub verbose_report: bool,

    /// Local sunrise used by the built-in sun clock ("HH:MM")
    #[serde(default = "default_sunrise")]
    pub sunrise: String,

    /// Local sunset used by the built-in sun clock ("HH:MM")
    #[serde(default = "default_sunset")]
    pub sunset: String,
}

fn default_tick_interval() -> u64 {
    1000
}

fn default_sunrise() -> String {
    "06:30".to_owned()
}

fn default_sunset() -> String {
    "19:30".to_owned()
}

fn default_true() -> bool {
    true
}

impl Default for SystemSettingsConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval(),
            verbose_report: false,
            sunrise: default_sunrise(),
            sunset: default_sunset(),
        }
    }
}

impl SystemSettingsConfig {
    pub fn sunrise_time(&self) -> Result<NaiveTime> {
        parse_clock_time("sunrise", &self.sunrise)
    }

    pub fn sunset_time(&self) -> Result<NaiveTime> {
        parse_clock_time("sunset", &self.sunset)
    }
}

fn parse_clock_time(field: &str, value: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(value, "%H:%M").map_err(|e| {
        ConfigError::Validation(format!("system.{field} '{value}' is not HH:MM: {e}"))
    })
}

impl AppConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        Ok(toml::from_str(s)?)
    }

    pub fn from_json_str(s: &str) -> Result<Self> {
        Ok(serde_json::from_str(s)?)
    }

    /// Load a TOML or JSON file, chosen by extension (TOML when unknown)
    pub fn from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_str(&content),
            _ => Self::from_toml_str(&content),
        }
    }

    pub fn to_toml_string(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Apply `SUNLIMITER_*` environment overrides
    pub fn apply_env_overrides(&mut self) {
        if let Ok(interval) = std::env::var("SUNLIMITER_TICK_MS")
            && let Ok(ms) = interval.parse::<u64>()
        {
            self.system.tick_interval_ms = ms;
        }

        if let Ok(verbose) = std::env::var("SUNLIMITER_VERBOSE")
            && let Ok(enabled) = verbose.parse::<bool>()
        {
            self.system.verbose_report = enabled;
        }
    }

    /// Reject configurations the controller cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.system.tick_interval_ms == 0 {
            return Err(ConfigError::Validation(
                "system.tick_interval_ms must be greater than 0".to_owned(),
            ));
        }
        self.system.sunrise_time()?;
        self.system.sunset_time()?;

        if self.battery_guard.internal_resistance_ohm < 0.0 {
            return Err(ConfigError::Validation(format!(
                "battery_guard.internal_resistance_ohm must not be negative, got {}",
                self.battery_guard.internal_resistance_ohm
            )));
        }

        let limiter = &self.limiter;
        // 0 disables a threshold
        if limiter.battery_soc_start_threshold > 0.0
            && limiter.battery_soc_stop_threshold > limiter.battery_soc_start_threshold
        {
            return Err(ConfigError::Validation(format!(
                "limiter.battery_soc_stop_threshold ({}) must not exceed the start threshold ({})",
                limiter.battery_soc_stop_threshold, limiter.battery_soc_start_threshold
            )));
        }
        if limiter.voltage_start_threshold > 0.0
            && limiter.voltage_stop_threshold > limiter.voltage_start_threshold
        {
            return Err(ConfigError::Validation(format!(
                "limiter.voltage_stop_threshold ({}) must not exceed the start threshold ({})",
                limiter.voltage_stop_threshold, limiter.voltage_start_threshold
            )));
        }
        if limiter.conduction_losses_percent > 100 {
            return Err(ConfigError::Validation(format!(
                "limiter.conduction_losses_percent must be at most 100, got {}",
                limiter.conduction_losses_percent
            )));
        }
        if let Some(hour) = limiter.inverter_restart_hour
            && hour > 23
        {
            return Err(ConfigError::Validation(format!(
                "limiter.inverter_restart_hour must be between 0 and 23, got {hour}"
            )));
        }

        let mut serials = HashSet::new();
        for inverter in &self.inverters {
            inverter.validate()?;
            if !serials.insert(inverter.serial) {
                return Err(ConfigError::Validation(format!(
                    "Duplicate inverter serial: {}",
                    inverter.serial_str()
                )));
            }
        }

        Ok(())
    }

    /// Clamp out-of-range tuning values to their fallbacks and resolve the
    /// "0 = total upper power limit" stage limits. Returns one note per change.
    pub fn sanitize(&mut self) -> Vec<String> {
        let mut notes = Vec::new();
        let total = self.limiter.total_upper_power_limit_w;
        let surplus = &mut self.surplus;

        if !(40.0..=100.0).contains(&surplus.start_soc) {
            notes.push(format!("surplus.start_soc {} out of range, using 70", surplus.start_soc));
            surplus.start_soc = 70.0;
        }
        if !(100..=40000).contains(&surplus.battery_capacity_wh) {
            notes.push(format!(
                "surplus.battery_capacity_wh {} out of range, using 2500",
                surplus.battery_capacity_wh
            ));
            surplus.battery_capacity_wh = 2500;
        }
        if !(0.0..=100.0).contains(&surplus.battery_safety_percent) {
            notes.push(format!(
                "surplus.battery_safety_percent {} out of range, using 50",
                surplus.battery_safety_percent
            ));
            surplus.battery_safety_percent = 50.0;
        }
        if !(0..=240).contains(&surplus.absorption_lead_minutes) {
            notes.push(format!(
                "surplus.absorption_lead_minutes {} out of range, using 60",
                surplus.absorption_lead_minutes
            ));
            surplus.absorption_lead_minutes = 60;
        }
        if surplus.stage_i_upper_power_limit_w == 0 {
            surplus.stage_i_upper_power_limit_w = total;
        }
        if surplus.stage_ii_upper_power_limit_w == 0 {
            surplus.stage_ii_upper_power_limit_w = total;
        }

        notes
    }

    pub fn governed_inverters(&self) -> impl Iterator<Item = &InverterConfig> {
        self.inverters.iter().filter(|i| i.is_governed)
    }
}
