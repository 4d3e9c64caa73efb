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

//! Battery discharge protection and solar passthrough.
//!
//! Battery-powered inverters may only draw from the battery after a start
//! threshold was reached and until a stop threshold is reached. Between the
//! two the last decision holds. Thresholds are tested against the state of
//! charge while the BMS reports a recent one, against the load-corrected
//! battery voltage otherwise.
//!
//! With solar passthrough the battery-powered inverters also forward the
//! solar charger output. Above the full passthrough threshold all of it is
//! forwarded, even if the house needs less.

use crate::telemetry::Timed;
use sunlimiter_types::LimiterConfig;
use tracing::{debug, info, warn};

/// A state of charge older than this is not trusted (ms)
const SOC_MAX_AGE_MS: u64 = 60 * 1000;
/// A BMS discharge current limit older than this is ignored (ms)
const DISCHARGE_LIMIT_MAX_AGE_MS: u64 = 60 * 1000;
/// Conservative fixed inverter efficiency, the efficiency at the new limit is unknown
const INVERTER_EFFICIENCY: f32 = 0.95;

/// Battery readings the thresholds are tested against
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BatteryReadings {
    /// State of charge (%), `None` if unknown or too old
    pub soc: Option<f32>,
    /// Battery voltage with the sag under load added back (V), 0 if unknown
    pub load_corrected_voltage: f32,
}

impl BatteryReadings {
    pub fn new(soc: Option<Timed<f32>>, load_corrected_voltage: f32, now_ms: u64) -> Self {
        Self {
            soc: soc
                .filter(|soc| soc.age_ms(now_ms) < SOC_MAX_AGE_MS)
                .map(|soc| soc.value),
            load_corrected_voltage,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Comparison {
    AtLeast,
    AtMost,
    Below,
}

impl Comparison {
    fn holds(self, value: f32, threshold: f32) -> bool {
        match self {
            Self::AtLeast => value >= threshold,
            Self::AtMost => value <= threshold,
            Self::Below => value < threshold,
        }
    }
}

/// What the power bus around the battery-powered inverters looks like
#[derive(Debug, Clone, Copy, Default)]
pub struct PowerBus {
    pub has_battery_inverters: bool,
    pub has_solar_charger: bool,
    pub is_day: bool,
}

#[derive(Debug)]
pub struct DischargeGate {
    config: LimiterConfig,
    readings: BatteryReadings,
    bus: PowerBus,

    discharge_enabled: bool,
    /// A discharge cycle was started at night below the start threshold,
    /// only one per night
    nighttime_discharging: bool,
    full_solar_passthrough: bool,
}

impl DischargeGate {
    pub fn new(config: &LimiterConfig) -> Self {
        Self {
            config: config.clone(),
            readings: BatteryReadings::default(),
            bus: PowerBus::default(),
            discharge_enabled: false,
            nighttime_discharging: false,
            full_solar_passthrough: false,
        }
    }

    pub fn update_config(&mut self, config: &LimiterConfig) {
        self.config = config.clone();
    }

    /// Re-evaluate battery discharge and full solar passthrough
    pub fn update(&mut self, readings: BatteryReadings, bus: PowerBus) {
        self.readings = readings;
        self.bus = bus;

        let discharge_enabled = self.evaluate_discharge();
        if discharge_enabled != self.discharge_enabled {
            info!(
                "[limiter] battery discharge {} at {} and {:.2} V (load-corrected)",
                if discharge_enabled { "allowed" } else { "restricted" },
                self.readings
                    .soc
                    .map_or_else(|| "unknown SoC".to_owned(), |soc| format!("{soc:.1} %")),
                self.readings.load_corrected_voltage
            );
            self.discharge_enabled = discharge_enabled;
        }

        let full_solar_passthrough = self.evaluate_full_solar_passthrough();
        if full_solar_passthrough != self.full_solar_passthrough {
            info!(
                "[limiter] full solar passthrough {}",
                if full_solar_passthrough { "active" } else { "dormant" }
            );
            self.full_solar_passthrough = full_solar_passthrough;
        }
    }

    fn evaluate_discharge(&mut self) -> bool {
        if !self.bus.has_battery_inverters {
            return false;
        }

        // a night cycle ends at sunrise
        if self.nighttime_discharging && self.bus.is_day {
            self.nighttime_discharging = false;
            return self.is_start_threshold_reached();
        }

        if self.is_stop_threshold_reached() {
            return false;
        }

        if self.is_start_threshold_reached() {
            return true;
        }

        if self.config.battery_always_use_at_night
            && !self.bus.is_day
            && !self.discharge_enabled
            && !self.nighttime_discharging
        {
            debug!("[limiter] starting nighttime discharge on a partially charged battery");
            self.nighttime_discharging = true;
            return true;
        }

        self.discharge_enabled
    }

    fn evaluate_full_solar_passthrough(&self) -> bool {
        if !self.is_solar_passthrough_enabled() {
            return false;
        }

        let config = &self.config;
        if self.test_threshold(
            config.full_solar_passthrough_soc,
            config.full_solar_passthrough_start_voltage,
            Comparison::AtLeast,
        ) {
            return true;
        }

        if self.test_threshold(
            config.full_solar_passthrough_soc,
            config.full_solar_passthrough_stop_voltage,
            Comparison::Below,
        ) {
            return false;
        }

        self.full_solar_passthrough
    }

    /// SoC first, unless ignored or unknown, the load-corrected voltage otherwise.
    /// A threshold of 0 disables it.
    fn test_threshold(&self, soc_threshold: f32, voltage_threshold: f32, cmp: Comparison) -> bool {
        if !self.config.ignore_soc
            && soc_threshold > 0.0
            && let Some(soc) = self.readings.soc
        {
            return cmp.holds(soc, soc_threshold);
        }

        if voltage_threshold <= 0.0 {
            return false;
        }

        cmp.holds(self.readings.load_corrected_voltage, voltage_threshold)
    }

    pub fn is_start_threshold_reached(&self) -> bool {
        self.test_threshold(
            self.config.battery_soc_start_threshold,
            self.config.voltage_start_threshold,
            Comparison::AtLeast,
        )
    }

    pub fn is_stop_threshold_reached(&self) -> bool {
        self.test_threshold(
            self.config.battery_soc_stop_threshold,
            self.config.voltage_stop_threshold,
            Comparison::AtMost,
        )
    }

    pub fn is_below_stop_threshold(&self) -> bool {
        self.test_threshold(
            self.config.battery_soc_stop_threshold,
            self.config.voltage_stop_threshold,
            Comparison::Below,
        )
    }

    pub fn is_solar_passthrough_enabled(&self) -> bool {
        self.bus.has_battery_inverters
            && self.bus.has_solar_charger
            && self.config.solar_passthrough_enabled
    }

    pub fn is_discharge_enabled(&self) -> bool {
        self.discharge_enabled
    }

    pub fn is_full_solar_passthrough_active(&self) -> bool {
        self.full_solar_passthrough
    }

    /// Solar charger output forwarded by the battery-powered inverters (W, DC)
    pub fn solar_passthrough_power_w(&self, charger_output_w: Option<f32>) -> f32 {
        if !self.is_solar_passthrough_enabled() || self.is_below_stop_threshold() {
            return 0.0;
        }

        // chargers reporting through third parties may send negative values
        charger_output_w.unwrap_or(0.0).max(0.0)
    }

    /// Power the battery may deliver (W, DC), `None` if the BMS sets no limit
    pub fn discharge_limit_w(
        &self,
        current_limit: Option<Timed<f32>>,
        voltage: f32,
        now_ms: u64,
    ) -> Option<f32> {
        if !self.discharge_enabled {
            return Some(0.0);
        }

        let current_limit = current_limit
            .filter(|limit| limit.age_ms(now_ms) <= DISCHARGE_LIMIT_MAX_AGE_MS)?
            .value
            .abs();

        if voltage <= 0.0 {
            warn!("[limiter] battery voltage unknown, cannot apply the discharge current limit");
            return Some(0.0);
        }

        Some(voltage * current_limit)
    }

    /// AC output the inverters produce from `dc_w` on the power bus
    pub fn dc_to_ac_w(&self, dc_w: f32) -> f32 {
        let losses = 1.0 - f32::from(self.config.conduction_losses_percent) / 100.0;
        INVERTER_EFFICIENCY * losses * dc_w
    }

    /// Output the battery-powered inverters may produce (W, AC).
    /// `solar_dc_w` is the passthrough power, `discharge_limit_dc_w` the
    /// result of [`Self::discharge_limit_w`].
    pub fn power_bus_usage(
        &self,
        requested_w: u16,
        solar_dc_w: f32,
        discharge_limit_dc_w: Option<f32>,
    ) -> u16 {
        let solar_ac_w = self.dc_to_ac_w(solar_dc_w);

        if self.full_solar_passthrough && solar_ac_w > f32::from(requested_w) {
            debug!("[limiter] full solar passthrough of {solar_ac_w:.0} W");
            return watts(solar_ac_w);
        }

        let Some(allowance) = self.allowance_w(solar_dc_w, discharge_limit_dc_w) else {
            return requested_w;
        };

        if allowance < requested_w {
            debug!(
                "[limiter] battery allowance {} W (incl. {:.0} W solar) below the requested {} W",
                allowance, solar_ac_w, requested_w
            );
        }
        requested_w.min(allowance)
    }

    /// Most the battery-powered inverters may produce from battery and
    /// passthrough together (W, AC), `None` without a discharge limit
    pub fn allowance_w(&self, solar_dc_w: f32, discharge_limit_dc_w: Option<f32>) -> Option<u16> {
        discharge_limit_dc_w.map(|limit_dc_w| watts(self.dc_to_ac_w(limit_dc_w + solar_dc_w)))
    }

    pub fn report(&self) {
        debug!(
            "[limiter] battery discharge {}, start {:.2} V or {:.0} %, stop {:.2} V or {:.0} %, SoC {}",
            if self.discharge_enabled { "allowed" } else { "restricted" },
            self.config.voltage_start_threshold,
            self.config.battery_soc_start_threshold,
            self.config.voltage_stop_threshold,
            self.config.battery_soc_stop_threshold,
            if self.config.ignore_soc { "ignored" } else { "used" }
        );
        if self.is_solar_passthrough_enabled() {
            debug!(
                "[limiter] full solar passthrough {}, start {:.2} V or {:.0} %, stop {:.2} V",
                if self.full_solar_passthrough { "active" } else { "dormant" },
                self.config.full_solar_passthrough_start_voltage,
                self.config.full_solar_passthrough_soc,
                self.config.full_solar_passthrough_stop_voltage
            );
        }
        debug!(
            "[limiter] use at night {}abled and {}, conduction losses {} %",
            if self.config.battery_always_use_at_night { "en" } else { "dis" },
            if self.nighttime_discharging { "active" } else { "dormant" },
            self.config.conduction_losses_percent
        );
    }
}

fn watts(value: f32) -> u16 {
    value.clamp(0.0, f32::from(u16::MAX)) as u16
}
