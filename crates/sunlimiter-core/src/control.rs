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

//! The control tick.
//!
//! One [`ControlLoop::tick`] per cycle: estimate the battery state, let the
//! inverters settle, compute the requested output from the power meter and
//! distribute it over solar, smart-buffer and battery-powered inverters. The
//! battery share is gated by the discharge thresholds and the BMS discharge
//! limit, then passes through the surplus regulator.

use crate::battery_guard::BatteryStateEstimator;
use crate::discharge::{BatteryReadings, DischargeGate, PowerBus};
use crate::limiter::PowerLimiter;
use crate::restart::RestartSchedule;
use crate::surplus::{SurplusPowerRegulator, Switch};
use crate::telemetry::{
    BatteryTelemetry, InverterRegistry, PowerMeter, SolarChargerTelemetry, SolarClock,
    SystemControl,
};
use chrono::Local;
use std::fmt;
use std::sync::Arc;
use sunlimiter_types::{
    AppConfig, BatteryGuardStatus, InverterPowerSource, InverterStatus, SurplusStatus,
};
use tracing::{debug, info};

/// Power meter readings arrive up to this long after the measurement (ms)
const POWER_METER_DELAY_MS: u64 = 2000;
const BACKOFF_DEFAULT_MS: u64 = 128;
const BACKOFF_MAX_MS: u64 = 1024;
const REPORT_INTERVAL_MS: u64 = 60 * 1000;

/// Outcome of one tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickStatus {
    WaitingForValidTimestamp,
    InverterInvalid,
    InverterCmdPending,
    InverterStatsPending,
    PowerMeterPending,
    /// Nothing changed, the last limits are still valid
    Stable,
    /// New limits were sent
    Updated,
}

impl fmt::Display for TickStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::WaitingForValidTimestamp => "waiting for valid date and time to be available",
            Self::InverterInvalid => "invalid inverter selection/configuration",
            Self::InverterCmdPending => {
                "waiting for a start/stop/restart/limit command to complete"
            }
            Self::InverterStatsPending => "waiting for sufficiently recent inverter data",
            Self::PowerMeterPending => "waiting for sufficiently recent power meter reading",
            Self::Stable => "the system is stable, the last power limit is still valid",
            Self::Updated => "new power limits were sent",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub status: TickStatus,
    /// Output requested from all governed inverters (W)
    pub requested_w: u16,
    pub covered_by_solar_w: u16,
    pub covered_by_smart_buffer_w: u16,
    pub covered_by_battery_w: u16,
    /// Power requested from the battery-powered inverters, surplus included (W)
    pub battery_request_w: u16,
}

impl TickReport {
    fn waiting(status: TickStatus) -> Self {
        Self {
            status,
            requested_w: 0,
            covered_by_solar_w: 0,
            covered_by_smart_buffer_w: 0,
            covered_by_battery_w: 0,
            battery_request_w: 0,
        }
    }

    pub fn expected_output_w(&self) -> u16 {
        self.covered_by_solar_w
            .saturating_add(self.covered_by_smart_buffer_w)
            .saturating_add(self.covered_by_battery_w)
    }
}

/// Everything the control loop reads from or commands
#[derive(Clone)]
pub struct Collaborators {
    pub battery: Arc<dyn BatteryTelemetry>,
    pub charger: Arc<dyn SolarChargerTelemetry>,
    pub clock: Arc<dyn SolarClock>,
    pub meter: Arc<dyn PowerMeter>,
    pub registry: Arc<dyn InverterRegistry>,
    pub system: Arc<dyn SystemControl>,
}

impl fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub struct ControlLoop {
    config: AppConfig,
    io: Collaborators,
    estimator: BatteryStateEstimator,
    surplus: SurplusPowerRegulator,
    limiter: PowerLimiter,
    gate: DischargeGate,
    restart: RestartSchedule,

    last_status: Option<TickStatus>,
    last_calculation_ms: Option<u64>,
    backoff_ms: u64,
    last_inverter_update_ms: u64,
    last_report_ms: Option<u64>,
    last_expected_output_w: u16,
}

impl ControlLoop {
    pub fn new(config: AppConfig, io: Collaborators) -> Self {
        let estimator = BatteryStateEstimator::new(&config.battery_guard);
        let surplus = SurplusPowerRegulator::new(
            &config.surplus,
            &config.limiter,
            Arc::clone(&io.battery),
            Arc::clone(&io.charger),
            Arc::clone(&io.clock),
        );
        let mut limiter =
            PowerLimiter::new(&config.limiter, Arc::clone(&io.clock), Arc::clone(&io.system));
        limiter.reload(&config.inverters, io.registry.as_ref());
        let gate = DischargeGate::new(&config.limiter);
        let restart = RestartSchedule::new(config.limiter.inverter_restart_hour);

        Self {
            config,
            io,
            estimator,
            surplus,
            limiter,
            gate,
            restart,
            last_status: None,
            last_calculation_ms: None,
            backoff_ms: BACKOFF_DEFAULT_MS,
            last_inverter_update_ms: 0,
            last_report_ms: None,
            last_expected_output_w: 0,
        }
    }

    /// Apply a new configuration. Inverter controllers are rebuilt.
    pub fn reload_config(&mut self, config: AppConfig) {
        self.estimator.update_config(&config.battery_guard);
        self.surplus.update_settings(&config.surplus, &config.limiter);
        self.limiter.update_config(&config.limiter);
        self.limiter.reload(&config.inverters, self.io.registry.as_ref());
        self.gate.update_config(&config.limiter);
        self.restart.update_config(config.limiter.inverter_restart_hour);
        self.config = config;
        self.last_calculation_ms = None;
    }

    pub fn tick(&mut self, now_ms: u64) -> TickReport {
        // estimation before regulation
        self.estimator.poll(self.io.battery.as_ref());

        self.maybe_report(now_ms);

        // inverters refuse commands until time is known
        if self.io.clock.now().is_none() {
            return self.announce(TickReport::waiting(TickStatus::WaitingForValidTimestamp));
        }

        // the last requested limits and power states have to be reached first
        if self.limiter.update_inverters(now_ms) {
            return self.announce(TickReport::waiting(TickStatus::InverterCmdPending));
        }

        if self.limiter.is_empty() {
            return self.announce(TickReport::waiting(TickStatus::InverterInvalid));
        }

        let Some(latest_stats_ms) = self.limiter.latest_inverter_stats_ms(now_ms) else {
            return self.announce(TickReport::waiting(TickStatus::InverterStatsPending));
        };

        // wait for a meter reading taken after the inverters reacted
        if self.io.meter.power_total_w().is_some()
            && self.io.meter.last_update_ms() <= latest_stats_ms + POWER_METER_DELAY_MS
        {
            return self.announce(TickReport::waiting(TickStatus::PowerMeterPending));
        }

        if let Some(last) = self.last_calculation_ms
            && now_ms.saturating_sub(last) < self.backoff_ms
        {
            return self.announce(TickReport::waiting(TickStatus::Stable));
        }

        self.auto_restart_inverters(now_ms);
        self.update_discharge_gate(now_ms);

        let total_limit = self.config.limiter.total_upper_power_limit_w;
        let requested_w = self.calc_target_output().min(total_limit);

        let covered_by_solar_w = self
            .limiter
            .update_inverter_limits(requested_w, InverterPowerSource::Solar);
        let remaining = requested_w.saturating_sub(covered_by_solar_w);

        let covered_by_smart_buffer_w = self
            .limiter
            .update_inverter_limits(remaining, InverterPowerSource::SmartBuffer);
        let remaining = remaining.saturating_sub(covered_by_smart_buffer_w);

        let battery_request_w = self.calc_power_bus_usage(remaining, now_ms);
        let covered_by_battery_w = self
            .limiter
            .update_inverter_limits(battery_request_w, InverterPowerSource::Battery);

        let report = TickReport {
            status: TickStatus::Updated,
            requested_w,
            covered_by_solar_w,
            covered_by_smart_buffer_w,
            covered_by_battery_w,
            battery_request_w,
        };
        self.last_expected_output_w = report.expected_output_w();

        // command execution after regulation, within the same tick
        let limits_updated = self.limiter.update_inverters(now_ms);
        self.last_calculation_ms = Some(now_ms);

        if !limits_updated {
            // poll less often while the system is stable
            self.backoff_ms = (self.backoff_ms * 2).min(BACKOFF_MAX_MS);
            return self.announce(TickReport {
                status: TickStatus::Stable,
                ..report
            });
        }

        self.backoff_ms = BACKOFF_DEFAULT_MS;
        self.last_inverter_update_ms = now_ms;
        self.announce(report)
    }

    /// Output all eligible inverters should produce together to reach the
    /// target consumption at the grid connection
    pub fn calc_target_output(&self) -> u16 {
        let limiter_config = &self.config.limiter;
        let target_consumption = limiter_config.target_power_consumption_w;
        let meter = self.io.meter.power_total_w();

        debug!(
            "[limiter] targeting {} W, base load is {} W, power meter reads {:.1} W ({})",
            target_consumption,
            limiter_config.base_load_limit_w,
            meter.unwrap_or(0.0),
            if meter.is_some() { "valid" } else { "stale" }
        );

        let Some(meter_w) = meter else {
            return limiter_config.base_load_limit_w;
        };

        let mut meter_value = meter_w.round() as i32;

        // output of inverters between the grid connection and our meter is
        // consumed as far as the meter is concerned, but never billed
        let day = self.io.clock.is_day_period();
        for controller in self.limiter.controllers() {
            if controller.is_behind_power_meter() {
                continue;
            }
            // unreachable solar inverters at night do not produce anything
            if controller.config().is_solar_powered() && !controller.is_reachable() && !day {
                continue;
            }
            // unreachable inverters are assumed to still produce what they reported last
            meter_value -= i32::from(controller.current_output_w());
        }

        let current_total_output: i32 = self
            .limiter
            .controllers()
            .iter()
            .filter(|c| c.is_eligible())
            .map(|c| i32::from(c.current_output_w()))
            .sum();

        let target = current_total_output + meter_value - target_consumption;
        target.clamp(0, i32::from(u16::MAX)) as u16
    }

    /// Power the battery-powered inverters may draw from the DC bus
    fn calc_power_bus_usage(&mut self, requested_w: u16, now_ms: u64) -> u16 {
        if self.io.battery.immediate_charging_requested() {
            debug!("[limiter] DC power bus usage blocked by immediate charging request");
            return 0;
        }

        if !self.limiter.has_power_source(InverterPowerSource::Battery) {
            return requested_w;
        }

        let solar_dc_w = self
            .gate
            .solar_passthrough_power_w(self.io.charger.panel_power_w());
        let limit_dc_w = self.gate.discharge_limit_w(
            self.io.battery.discharge_current_limit(),
            self.battery_voltage(),
            now_ms,
        );
        let allowed_w = self
            .gate
            .power_bus_usage(requested_w, solar_dc_w, limit_dc_w);

        // surplus power only while the battery may be discharged
        if !self.gate.is_discharge_enabled() {
            return allowed_w;
        }

        let current_w = self.limiter.output_w(InverterPowerSource::Battery);
        let power = self.surplus.calculate_surplus(
            allowed_w,
            current_w,
            self.last_inverter_update_ms,
            now_ms,
        );

        // the active surplus stage brings its own upper limit
        let upper = self
            .surplus
            .upper_power_limit()
            .unwrap_or(self.config.limiter.total_upper_power_limit_w);
        let allowance = self
            .gate
            .allowance_w(solar_dc_w, limit_dc_w)
            .unwrap_or(u16::MAX);
        power.min(upper).min(allowance)
    }

    fn battery_voltage(&self) -> f32 {
        self.io.battery.voltage().map_or(0.0, |voltage| voltage.value)
    }

    /// Battery voltage with the sag under load added back. With a known
    /// internal resistance the battery current tells the sag, otherwise the
    /// battery inverter output times the configured correction factor.
    fn load_corrected_voltage(&self) -> f32 {
        let voltage = self.battery_voltage();
        if voltage <= 0.0 {
            return 0.0;
        }

        if let Some(resistance) = self.estimator.internal_resistance()
            && let Some(current) = self.io.battery.current()
        {
            // discharge current is negative
            return voltage - current.value * resistance;
        }

        let output_w = f32::from(self.limiter.output_w(InverterPowerSource::Battery));
        voltage + output_w * self.config.limiter.voltage_load_correction_factor
    }

    fn update_discharge_gate(&mut self, now_ms: u64) {
        let readings = BatteryReadings::new(
            self.io.battery.state_of_charge(),
            self.load_corrected_voltage(),
            now_ms,
        );
        let bus = PowerBus {
            has_battery_inverters: self.limiter.has_power_source(InverterPowerSource::Battery),
            has_solar_charger: self.io.charger.operation_mode().is_some(),
            is_day: self.io.clock.is_day_period(),
        };
        self.gate.update(readings, bus);
    }

    /// Restarts the inverters drawing from the battery once a day
    fn auto_restart_inverters(&mut self, now_ms: u64) {
        let Some(now) = self.io.clock.now() else {
            return;
        };

        if self.restart.is_due(now_ms) {
            self.limiter.restart_inverters();
        } else if !self.restart.is_stale() {
            return;
        }

        let applies = self.limiter.has_power_source(InverterPowerSource::Battery)
            || self.limiter.has_power_source(InverterPowerSource::SmartBuffer);
        self.restart
            .plan(applies, now.with_timezone(&Local).time(), now_ms);
    }

    fn announce(&mut self, report: TickReport) -> TickReport {
        if self.last_status != Some(report.status) {
            info!("[limiter] {}", report.status);
            self.last_status = Some(report.status);
        }
        report
    }

    fn maybe_report(&mut self, now_ms: u64) {
        let due = self
            .last_report_ms
            .is_none_or(|last| now_ms.saturating_sub(last) >= REPORT_INTERVAL_MS);
        if !due {
            return;
        }
        self.last_report_ms = Some(now_ms);

        if !self.config.system.verbose_report {
            return;
        }

        self.estimator.report(now_ms);
        self.gate.report();
        self.surplus.report();
        self.limiter.debug_dump();
        debug!(
            "[limiter] expected output {} W, up to {} update timeouts in succession",
            self.last_expected_output_w,
            self.limiter.max_update_timeouts()
        );
    }

    // ============= Pass-through =============

    /// Temporarily switch a surplus stage, see [`SurplusPowerRegulator::switch_surplus`]
    pub fn switch_surplus(&mut self, switch: Switch) -> bool {
        self.surplus.switch_surplus(switch)
    }

    pub fn internal_resistance(&self) -> Option<f32> {
        self.estimator.internal_resistance()
    }

    pub fn open_circuit_voltage(&mut self, now_ms: u64) -> Option<f32> {
        self.estimator.open_circuit_voltage(now_ms)
    }

    pub fn battery_guard_status(&self, now_ms: u64) -> BatteryGuardStatus {
        self.estimator.status(now_ms)
    }

    pub fn is_battery_discharge_enabled(&self) -> bool {
        self.gate.is_discharge_enabled()
    }

    pub fn is_full_solar_passthrough_active(&self) -> bool {
        self.gate.is_full_solar_passthrough_active()
    }

    pub fn surplus_status(&self) -> SurplusStatus {
        self.surplus.status()
    }

    pub fn max_update_timeouts(&self) -> u32 {
        self.limiter.max_update_timeouts()
    }

    pub fn inverter_statuses(&self) -> Vec<InverterStatus> {
        self.limiter.inverter_statuses()
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }
}
