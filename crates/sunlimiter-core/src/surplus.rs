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

//! Surplus power regulation.
//!
//! Pushes more power into the battery-powered inverters than the zero export
//! regulation asks for, as long as the battery charging is not starved:
//!
//! * Stage I (bulk): the solar power minus a battery reserve, calculated from
//!   the remaining time until absorption should start, is handed over to the
//!   inverters.
//! * Stage II (absorption/float): the charger is voltage limited, so unused
//!   solar power shows up as a charger output voltage at the target. The
//!   surplus power is approximated in steps until the voltage drops just below
//!   the charger target voltage.
//!
//! The regulator never returns less than the requested power. On missing data
//! it falls back to the requested power and counts the fault.

use crate::statistic::WeightedAverage;
use crate::telemetry::{BatteryTelemetry, SolarChargerTelemetry, SolarClock};
use std::sync::Arc;
use sunlimiter_types::{
    ChargerOperationMode, LimiterConfig, RegulationQuality, StageActivity, SurplusConfig,
    SurplusFaultCounters, SurplusState, SurplusStatus,
};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Battery reserve meaning "no surplus at all" (W)
pub const RESERVE_POWER_MAX: i32 = 99_999;

const EFFICIENCY_MPPT: f32 = 0.97;
const EFFICIENCY_INVERTER: f32 = 0.94;
const EFFICIENCY_CABLE: f32 = 0.98;
/// SoC at which every charger should have switched to absorption
const ABSORPTION_SOC: f32 = 0.998;
/// Regulation target below the charger voltage (V)
const TARGET_RANGE: f32 = 0.100;
/// Stage I stops this far below the start SoC (%)
const SOC_RANGE: f32 = 2.0;

const STAGE_I_INTERVAL_MS: u64 = 10_000;
const STAGE_II_INTERVAL_MS: u64 = 5_000;
const INVERTER_SETTLE_MS: u64 = 2_000;
const SOC_MAX_AGE_MS: u64 = 10_000;
const RESERVE_INTERVAL_MS: u64 = 5 * 60 * 1000;
const IN_TARGET_RETRY_MS: u64 = 60 * 1000;
/// The reserve is frozen this close before absorption (minutes)
const RESERVE_FREEZE_MINUTES: i32 = 10;

/// Reasons for falling back to the requested power
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SurplusFault {
    #[error("Error, local time or sunset time not available")]
    Time,
    #[error("Error, solar charger data is not available")]
    Charger,
    #[error("Error, battery data is not available")]
    Battery,
    #[error("Error, solar power data is not available")]
    SolarPower,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Bulk,
    AbsorptionFloat,
}

impl Stage {
    fn tag(self) -> &'static str {
        match self {
            Self::Bulk => "[surplus I]",
            Self::AbsorptionFloat => "[surplus II]",
        }
    }
}

/// Temporary on/off switch for the two stages, e.g. while a forced full charge
/// or an AC charger is running
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Switch {
    StageIOn,
    StageIOff,
    StageIAsk,
    StageIIOn,
    StageIIOff,
    StageIIAsk,
}

#[derive(Debug, Clone, Default)]
struct StageFlags {
    enabled: bool,
    temporarily_off: bool,
    active: bool,
    last_start: Option<chrono::DateTime<chrono::Utc>>,
    last_stop: Option<chrono::DateTime<chrono::Utc>>,
}

impl StageFlags {
    fn usable(&self) -> bool {
        self.enabled && !self.temporarily_off
    }

    fn activity(&self) -> StageActivity {
        StageActivity {
            enabled: self.enabled,
            temporarily_off: self.temporarily_off,
            active: self.active,
            last_start: self.last_start,
            last_stop: self.last_stop,
        }
    }
}

pub struct SurplusPowerRegulator {
    battery: Arc<dyn BatteryTelemetry>,
    charger: Arc<dyn SolarChargerTelemetry>,
    clock: Arc<dyn SolarClock>,

    state: SurplusState,
    stage_i: StageFlags,
    stage_ii: StageFlags,
    upper_power_limit: Option<u16>,
    last_logged_power: u16,
    errors: SurplusFaultCounters,
    target_power_consumption_w: i32,

    // shared by both stages
    surplus_power_w: i32,
    last_calc_ms: u64,

    // stage II
    stage_ii_upper_limit_w: u16,
    power_step_w: i32,
    last_in_target_ms: u64,
    avg_mppt_voltage: WeightedAverage<f32>,
    target_voltage: Option<f32>,
    quality_counter: u8,
    quality_avg: WeightedAverage<f32>,
    last_add_power_w: i32,

    // stage I
    stage_i_upper_limit_w: u16,
    start_soc: f32,
    battery_capacity_wh: u32,
    battery_safety_percent: f32,
    absorption_lead_minutes: i32,
    minutes_to_absorption: i32,
    battery_reserve_w: i32,
    last_reserve_calc_ms: Option<u64>,
    solar_power_w: i32,
    /// (inverter + battery, charger panel power)
    solar_source_counter: (u32, u32),

    // slope mode
    slope_mode_enabled: bool,
    slope_add_power_w: i32,
    slope_factor_w_per_s: i32,
    slope_power_w: i32,
    last_slope_ms: u64,
}

impl std::fmt::Debug for SurplusPowerRegulator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SurplusPowerRegulator")
            .field("state", &self.state)
            .field("surplus_power_w", &self.surplus_power_w)
            .field("slope_power_w", &self.slope_power_w)
            .field("upper_power_limit", &self.upper_power_limit)
            .finish_non_exhaustive()
    }
}

impl SurplusPowerRegulator {
    pub fn new(
        config: &SurplusConfig,
        limiter: &LimiterConfig,
        battery: Arc<dyn BatteryTelemetry>,
        charger: Arc<dyn SolarChargerTelemetry>,
        clock: Arc<dyn SolarClock>,
    ) -> Self {
        let mut regulator = Self {
            battery,
            charger,
            clock,
            state: SurplusState::Idle,
            stage_i: StageFlags::default(),
            stage_ii: StageFlags::default(),
            upper_power_limit: None,
            last_logged_power: 0,
            errors: SurplusFaultCounters::default(),
            target_power_consumption_w: 0,
            surplus_power_w: 0,
            last_calc_ms: 0,
            stage_ii_upper_limit_w: 0,
            power_step_w: 0,
            last_in_target_ms: 0,
            avg_mppt_voltage: WeightedAverage::new(5),
            target_voltage: None,
            quality_counter: 0,
            quality_avg: WeightedAverage::new(20),
            last_add_power_w: 0,
            stage_i_upper_limit_w: 0,
            start_soc: 0.0,
            battery_capacity_wh: 0,
            battery_safety_percent: 0.0,
            absorption_lead_minutes: 0,
            minutes_to_absorption: 0,
            battery_reserve_w: RESERVE_POWER_MAX,
            last_reserve_calc_ms: None,
            solar_power_w: 0,
            solar_source_counter: (0, 0),
            slope_mode_enabled: false,
            slope_add_power_w: 0,
            slope_factor_w_per_s: 0,
            slope_power_w: 0,
            last_slope_ms: 0,
        };
        regulator.update_settings(config, limiter);
        regulator
    }

    /// Apply new settings. Out-of-range values fall back to safe defaults.
    pub fn update_settings(&mut self, config: &SurplusConfig, limiter: &LimiterConfig) {
        self.stage_i.enabled = config.stage_i_enabled;
        self.stage_ii.enabled = config.stage_ii_enabled;

        self.start_soc = if (40.0..=100.0).contains(&config.start_soc) {
            config.start_soc
        } else {
            70.0
        };
        self.battery_capacity_wh = if (100..=40_000).contains(&config.battery_capacity_wh) {
            config.battery_capacity_wh
        } else {
            2500
        };
        self.battery_safety_percent = if (0.0..=100.0).contains(&config.battery_safety_percent) {
            config.battery_safety_percent
        } else {
            50.0
        };
        self.absorption_lead_minutes = if (0..=240).contains(&config.absorption_lead_minutes) {
            config.absorption_lead_minutes
        } else {
            60
        };

        let total = limiter.total_upper_power_limit_w;
        self.stage_i_upper_limit_w = match config.stage_i_upper_power_limit_w {
            0 => total,
            limit => limit,
        };
        self.stage_ii_upper_limit_w = match config.stage_ii_upper_power_limit_w {
            0 => total,
            limit => limit,
        };

        self.slope_mode_enabled = config.slope_mode_enabled;
        self.slope_add_power_w = i32::from(config.slope_add_power_w);
        self.slope_factor_w_per_s = i32::from(config.slope_factor_w_per_s);
        self.target_power_consumption_w = limiter.target_power_consumption_w;

        // a step below the hysteresis would have no effect on the inverters
        self.power_step_w = (i32::from(self.stage_ii_upper_limit_w) / 40)
            .max(i32::from(limiter.target_power_consumption_hysteresis_w) + 1);
        self.battery_reserve_w = RESERVE_POWER_MAX;
    }

    pub fn is_enabled(&self) -> bool {
        self.stage_i.enabled || self.stage_ii.enabled
    }

    /// Upper power limit of the active stage, `None` while no stage is active
    pub fn upper_power_limit(&self) -> Option<u16> {
        self.upper_power_limit
    }

    pub fn state(&self) -> SurplusState {
        self.state
    }

    /// Returns the surplus power or the requested power, whichever is higher.
    ///
    /// * `requested_w`: power calculated by the zero export regulation
    /// * `current_w`: actual AC output of the battery-powered inverters
    /// * `last_inverter_update_ms`: time of the last inverter limit update
    pub fn calculate_surplus(
        &mut self,
        requested_w: u16,
        current_w: u16,
        last_inverter_update_ms: u64,
        now_ms: u64,
    ) -> u16 {
        if !self.is_enabled() {
            return requested_w;
        }

        let Some(mode) = self.charger.operation_mode() else {
            return self.exit_surplus(requested_w, Err(SurplusFault::Charger), Stage::AbsorptionFloat);
        };

        if self.stage_i.usable() && mode == ChargerOperationMode::Bulk {
            let result = self.calc_bulk_mode(requested_w, current_w, last_inverter_update_ms, now_ms);
            return self.exit_surplus(requested_w, result, Stage::Bulk);
        }

        if self.stage_ii.usable() && mode.is_voltage_limited() {
            let result =
                self.calc_absorption_float_mode(requested_w, mode, last_inverter_update_ms, now_ms);
            return self.exit_surplus(requested_w, result, Stage::AbsorptionFloat);
        }

        // charger in a mode we do not regulate on
        self.trigger_stage_state(false, false);
        requested_w
    }

    fn calc_absorption_float_mode(
        &mut self,
        requested_w: u16,
        mode: ChargerOperationMode,
        last_inverter_update_ms: u64,
        now_ms: u64,
    ) -> Result<u16, SurplusFault> {
        // the loop inverter -> charger -> panel -> measurement needs time
        if self.stage_ii.active
            && (now_ms.saturating_sub(self.last_calc_ms) < STAGE_II_INTERVAL_MS
                || now_ms.saturating_sub(last_inverter_update_ms) < INVERTER_SETTLE_MS)
        {
            return Ok(clamp_to_u16(self.surplus_power_w));
        }

        let (Some(absorption), Some(float)) =
            (self.charger.absorption_voltage(), self.charger.float_voltage())
        else {
            return Err(SurplusFault::Charger);
        };

        // about 2 mOhm charger resistance at 50 A
        let target_voltage = match mode {
            ChargerOperationMode::Absorption => absorption,
            _ => float,
        } - TARGET_RANGE;
        self.target_voltage = Some(target_voltage);

        let Some(mppt_voltage) = self.charger.output_voltage() else {
            return Err(SurplusFault::Charger);
        };
        self.avg_mppt_voltage.add(mppt_voltage);
        let avg_mppt_voltage = self.avg_mppt_voltage.average();
        let above_target = mppt_voltage >= target_voltage;

        let step = self.power_step_w;
        let mut add_power = 0;
        match self.state {
            SurplusState::Idle | SurplusState::BulkPower => {
                // coming from stage I we can start with the same power
                self.surplus_power_w = self.surplus_power_w.max(i32::from(requested_w));
                self.state = SurplusState::TryMore;
                self.slope_power_w = 0;
                self.quality_counter = 0;
                self.quality_avg.reset();
                self.trigger_stage_state(false, true);
            }
            SurplusState::KeepLastPower => {
                if above_target {
                    self.state = SurplusState::TryMore;
                    add_power = step;
                } else {
                    self.state = SurplusState::ReducePower;
                }
            }
            SurplusState::TryMore => {
                if above_target {
                    add_power = 2 * step;
                } else {
                    add_power = -step;
                    self.state = SurplusState::ReducePower;
                }
            }
            SurplusState::ReducePower => {
                if above_target {
                    self.last_in_target_ms = now_ms;
                    self.state = SurplusState::InTarget;
                } else {
                    add_power = -step;
                }
            }
            SurplusState::InTarget | SurplusState::MaximumPower => {
                if avg_mppt_voltage >= target_voltage || above_target {
                    // maybe more power is possible, try once a minute
                    if now_ms.saturating_sub(self.last_in_target_ms) > IN_TARGET_RETRY_MS {
                        add_power = step;
                        self.state = SurplusState::TryMore;
                    }
                    if self.quality_counter != 0 {
                        self.quality_avg.add(f32::from(self.quality_counter));
                    }
                    self.quality_counter = 0;
                } else {
                    add_power = -step;
                    self.state = SurplusState::ReducePower;
                }
            }
        }

        self.surplus_power_w = (self.surplus_power_w + add_power).max(0);
        let upper = i32::from(self.stage_ii_upper_limit_w);
        if self.surplus_power_w > upper {
            self.surplus_power_w = upper;
            self.state = SurplusState::MaximumPower;
        }

        let back_power = clamp_to_u16(self.surplus_power_w);
        if requested_w > back_power {
            self.quality_counter = 0;
            self.state = SurplusState::KeepLastPower;
        } else {
            self.record_step(add_power);
        }

        self.last_calc_ms = now_ms;
        Ok(back_power)
    }

    /// Count polarity changes of the power steps (regulation quality)
    fn record_step(&mut self, add_power: i32) {
        if (self.last_add_power_w < 0 && add_power > 0) || (self.last_add_power_w > 0 && add_power < 0) {
            self.quality_counter = self.quality_counter.saturating_add(1);
        }
        self.last_add_power_w = add_power;
    }

    fn calc_bulk_mode(
        &mut self,
        requested_w: u16,
        current_w: u16,
        last_inverter_update_ms: u64,
        now_ms: u64,
    ) -> Result<u16, SurplusFault> {
        // not in a hurry, wait 10 s between calculations and 2 s after an inverter update
        if self.stage_i.active
            && (now_ms.saturating_sub(self.last_calc_ms) < STAGE_I_INTERVAL_MS
                || now_ms.saturating_sub(last_inverter_update_ms) < INVERTER_SETTLE_MS)
        {
            let mut back_power = clamp_to_u16(self.surplus_power_w);
            if self.slope_mode_enabled {
                back_power = self.calc_slope_power(requested_w, self.surplus_power_w, now_ms);
            }
            return Ok(back_power);
        }

        let start_soc = self.start_soc;
        let stop_soc = self.start_soc - SOC_RANGE;

        let soc = match self.battery.state_of_charge() {
            Some(soc) if soc.age_ms(now_ms) <= SOC_MAX_AGE_MS => soc.value,
            _ => return Err(SurplusFault::Battery),
        };
        let Some(time_to_sunset) = self.clock.minutes_to_sunset() else {
            return Err(SurplusFault::Time);
        };
        let time_to_sunset = time_to_sunset.max(0);

        if soc <= stop_soc
            || (soc < start_soc && !self.stage_i.active)
            || time_to_sunset - self.absorption_lead_minutes <= 0
        {
            self.trigger_stage_state(false, false);
            return Ok(requested_w);
        }

        if self.state != SurplusState::BulkPower {
            self.battery_reserve_w = RESERVE_POWER_MAX;
            self.last_reserve_calc_ms = None;
            self.surplus_power_w = 0;
            self.slope_power_w = 0;
            self.solar_source_counter = (0, 0);
            self.trigger_stage_state(true, false);
            self.state = SurplusState::BulkPower;
        }

        // solar power from "inverter + battery" or from the charger panel power
        let battery_power = match (self.battery.current(), self.battery.voltage()) {
            (Some(current), Some(voltage)) => Some(current.value * voltage.value),
            _ => None,
        };
        let solar_batt_power = battery_power.map_or(0.0, |battery_power| {
            (f32::from(current_w) / EFFICIENCY_INVERTER / EFFICIENCY_CABLE + battery_power).max(0.0)
        });
        let solar_panel_power = self
            .charger
            .panel_power_w()
            .map_or(0.0, |p| (p * EFFICIENCY_MPPT).max(0.0));

        let solar_batt_power = solar_batt_power as i32;
        let solar_panel_power = solar_panel_power as i32;
        if solar_batt_power == 0 && solar_panel_power == 0 {
            return Err(SurplusFault::SolarPower);
        }
        if solar_batt_power > solar_panel_power {
            self.solar_power_w = solar_batt_power;
            self.solar_source_counter.0 += 1;
        } else {
            self.solar_power_w = solar_panel_power;
            self.solar_source_counter.1 += 1;
        }

        // the reserve does not change quickly, every 5 minutes is enough
        let reserve_due = self
            .last_reserve_calc_ms
            .is_none_or(|last| now_ms.saturating_sub(last) > RESERVE_INTERVAL_MS);
        if reserve_due {
            self.last_reserve_calc_ms = Some(now_ms);
            self.update_battery_reserve(soc, time_to_sunset);
        }

        let surplus = (self.solar_power_w - self.battery_reserve_w) as f32 * EFFICIENCY_INVERTER;
        self.surplus_power_w = (surplus as i32).clamp(0, i32::from(self.stage_i_upper_limit_w));

        let mut back_power = clamp_to_u16(self.surplus_power_w);
        if self.slope_mode_enabled {
            back_power = self.calc_slope_power(requested_w, self.surplus_power_w, now_ms);
        }

        self.last_calc_ms = now_ms;
        Ok(back_power)
    }

    /// Power to reserve for the battery so that it reaches absorption in time
    fn update_battery_reserve(&mut self, soc: f32, time_to_sunset: i32) {
        self.minutes_to_absorption = time_to_sunset - self.absorption_lead_minutes;

        if self.minutes_to_absorption <= 0 {
            // too late, the battery gets everything
            self.battery_reserve_w = RESERVE_POWER_MAX;
            self.minutes_to_absorption = 0;
            return;
        }

        // in the last minutes the reserve is kept constant
        if self.minutes_to_absorption > RESERVE_FREEZE_MINUTES && soc / 100.0 < ABSORPTION_SOC {
            let reserve = self.battery_capacity_wh as f32 * (ABSORPTION_SOC - soc / 100.0)
                / self.minutes_to_absorption as f32
                * 60.0
                * (1.0 + self.battery_safety_percent / 100.0);
            self.battery_reserve_w = (reserve as i32).max(0);
        }
    }

    /// The slope power decays by `slope_factor` W/s but never below the actual
    /// consumption plus `slope_add_power` and never above the surplus power
    fn calc_slope_power(&mut self, requested_w: u16, surplus_power_w: i32, now_ms: u64) -> u16 {
        let elapsed = now_ms.saturating_sub(self.last_slope_ms);
        if elapsed > 1000 {
            let decay = i64::from(self.slope_factor_w_per_s) * elapsed as i64 / 1000;
            self.slope_power_w = (i64::from(self.slope_power_w) - decay).max(0) as i32;
            self.last_slope_ms = now_ms;
        }

        let consumption = (i32::from(requested_w) - self.target_power_consumption_w).max(0);
        self.slope_power_w = self
            .slope_power_w
            .max(consumption + self.slope_add_power_w)
            .min(surplus_power_w);
        clamp_to_u16(self.slope_power_w)
    }

    /// Count faults and fall back to the requested power, otherwise never
    /// return less than requested
    fn exit_surplus(&mut self, requested_w: u16, result: Result<u16, SurplusFault>, stage: Stage) -> u16 {
        let power = match result {
            Ok(power) => power,
            Err(fault) => {
                let counter = match fault {
                    SurplusFault::Time => &mut self.errors.time,
                    SurplusFault::Charger => &mut self.errors.charger,
                    SurplusFault::Battery => &mut self.errors.battery,
                    SurplusFault::SolarPower => &mut self.errors.solar_power,
                };
                *counter = counter.saturating_add(1);
                warn!("[surplus] {}", fault);
                return requested_w;
            }
        };

        if power <= requested_w {
            return requested_w;
        }

        if power != self.last_logged_power {
            self.last_logged_power = power;
            match stage {
                Stage::Bulk => debug!(
                    "{} State: {}, Surplus power: {} W, Slope power: {} W, Requested power: {} W, Returned power: {} W",
                    stage.tag(),
                    self.state,
                    self.surplus_power_w,
                    self.slope_power_w,
                    requested_w,
                    power
                ),
                Stage::AbsorptionFloat => debug!(
                    "{} State: {}, Surplus power: {} W, Requested power: {} W, Returned power: {} W",
                    stage.tag(),
                    self.state,
                    self.surplus_power_w,
                    requested_w,
                    power
                ),
            }
        }
        power
    }

    /// Temporarily switch a stage off or on, or ask whether it is on
    pub fn switch_surplus(&mut self, switch: Switch) -> bool {
        match switch {
            Switch::StageIOn => {
                self.stage_i.temporarily_off = false;
                true
            }
            Switch::StageIIOn => {
                self.stage_ii.temporarily_off = false;
                true
            }
            Switch::StageIOff => {
                self.stage_i.temporarily_off = true;
                self.switch_off_reset();
                false
            }
            Switch::StageIIOff => {
                self.stage_ii.temporarily_off = true;
                self.switch_off_reset();
                false
            }
            Switch::StageIAsk => !self.stage_i.temporarily_off,
            Switch::StageIIAsk => !self.stage_ii.temporarily_off,
        }
    }

    fn switch_off_reset(&mut self) {
        self.surplus_power_w = 0;
        self.slope_power_w = 0;
        self.state = SurplusState::Idle;
    }

    fn trigger_stage_state(&mut self, stage_i: bool, stage_ii: bool) {
        let now = self.clock.now();

        if stage_i && !self.stage_i.active {
            self.stage_i.active = true;
            self.stage_i.last_start = now;
            self.stage_i.last_stop = None;
            self.upper_power_limit = Some(self.stage_i_upper_limit_w);
            info!("{} stage activated", Stage::Bulk.tag());
        }
        if !stage_i && self.stage_i.active {
            self.stage_i.active = false;
            self.stage_i.last_stop = now;
            info!("{} stage deactivated", Stage::Bulk.tag());
        }
        if stage_ii && !self.stage_ii.active {
            self.stage_ii.active = true;
            self.stage_ii.last_start = now;
            self.stage_ii.last_stop = None;
            self.upper_power_limit = Some(self.stage_ii_upper_limit_w);
            info!("{} stage activated", Stage::AbsorptionFloat.tag());
        }
        if !stage_ii && self.stage_ii.active {
            self.stage_ii.active = false;
            self.stage_ii.last_stop = now;
            info!("{} stage deactivated", Stage::AbsorptionFloat.tag());
        }
        if !self.stage_i.active && !self.stage_ii.active {
            self.state = SurplusState::Idle;
            self.surplus_power_w = 0;
            self.slope_power_w = 0;
            self.upper_power_limit = None;
        }
    }

    pub fn status(&self) -> SurplusStatus {
        let (from_battery, from_charger) = self.solar_source_counter;
        let sources = (from_battery + from_charger).max(1) as f32;

        SurplusStatus {
            state: self.state,
            stage_i: self.stage_i.activity(),
            stage_ii: self.stage_ii.activity(),
            surplus_power_w: self.surplus_power_w,
            slope_power_w: self.slope_power_w,
            slope_mode_enabled: self.slope_mode_enabled,
            battery_reserve_w: (self.battery_reserve_w != RESERVE_POWER_MAX)
                .then_some(self.battery_reserve_w),
            solar_power_w: self.solar_power_w,
            solar_source_charger_percent: from_charger as f32 * 100.0 / sources,
            solar_source_battery_percent: from_battery as f32 * 100.0 / sources,
            target_voltage_min: self.target_voltage,
            target_voltage_max: self.target_voltage.map(|v| v + TARGET_RANGE),
            power_step_w: self.power_step_w,
            quality: RegulationQuality::from_average(self.quality_avg.average()),
            quality_average: self.quality_avg.average(),
            quality_max: self.quality_avg.max(),
            quality_count: self.quality_avg.count(),
            errors: self.errors,
        }
    }

    /// Once-a-minute report at debug level
    pub fn report(&self) {
        if !self.is_enabled() {
            return;
        }
        let status = self.status();

        debug!("[surplus] ---------------- Surplus Report ----------------");
        debug!(
            "[surplus] State: {}, Surplus power: {} W (max: {} W)",
            status.state,
            status.surplus_power_w,
            self.upper_power_limit.unwrap_or(0)
        );
        if let Some(mode) = self.charger.operation_mode() {
            debug!("[surplus] Solar charger operation mode: {}", mode);
        }
        debug!(
            "[surplus] Errors since start-up, Time: {}, Solar charger: {}, Battery: {}, Solar power: {}",
            status.errors.time, status.errors.charger, status.errors.battery, status.errors.solar_power
        );

        debug!(
            "[surplus] 1) Stage-I (Bulk): {} / {}",
            if self.stage_i.usable() { "Enabled" } else { "Disabled" },
            if status.state == SurplusState::BulkPower { "Active" } else { "Not active" }
        );
        if self.stage_i.enabled {
            debug!(
                "[surplus] SoC Start: {:.1} %, SoC Stop: {:.1} %",
                self.start_soc,
                self.start_soc - SOC_RANGE
            );
            debug!(
                "[surplus] Slope Mode: {}, Slope Power: {} W (max: {} W)",
                if self.slope_mode_enabled { "Enabled" } else { "Disabled" },
                status.slope_power_w,
                status.surplus_power_w
            );
            debug!(
                "[surplus] Solar power: {} W, Battery reserved power: {} W",
                status.solar_power_w, self.battery_reserve_w
            );
            debug!(
                "[surplus] Time remaining from now to absorption mode: {:02}:{:02}",
                self.minutes_to_absorption / 60,
                self.minutes_to_absorption % 60
            );
            debug!(
                "[surplus] Use solar power information: Charger={:.1} %, Battery={:.1} %",
                status.solar_source_charger_percent, status.solar_source_battery_percent
            );
            debug!("[surplus] Last active time: {}", status.stage_i.range_text());
        }

        debug!(
            "[surplus] 2) Stage-II (Absorption/Float): {} / {}",
            if self.stage_ii.usable() { "Enabled" } else { "Disabled" },
            if status.state.is_stage_ii() { "Active" } else { "Not active" }
        );
        if self.stage_ii.enabled {
            if let (Some(min), Some(max)) = (status.target_voltage_min, status.target_voltage_max) {
                debug!("[surplus] Voltage regulation target range: {:.2} V - {:.2} V", min, max);
            }
            debug!("[surplus] Regulation power step size: {} W", status.power_step_w);
            debug!("[surplus] Regulation quality: {}", status.quality);
            debug!(
                "[surplus] Regulation quality: (Average: {:.2}, Max: {:.0}, Amount: {})",
                status.quality_average, status.quality_max, status.quality_count
            );
            debug!("[surplus] Last active time: {}", status.stage_ii.range_text());
        }
    }
}

fn clamp_to_u16(value: i32) -> u16 {
    value.clamp(0, i32::from(u16::MAX)) as u16
}
