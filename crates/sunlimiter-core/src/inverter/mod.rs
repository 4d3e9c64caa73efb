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

//! Per-inverter power control.
//!
//! An [`InverterController`] turns a requested change of AC output into a
//! target limit and power state and then walks the inverter there, one
//! command at a time. How much an inverter can give or take depends on what
//! powers it, see the `battery`, `solar` and `smart_buffer` strategies.

mod battery;
mod overscaling;
mod smart_buffer;
mod solar;

use crate::telemetry::{CommandStatus, InverterHandle, InverterRegistry, SolarClock, SystemControl};
use std::fmt;
use std::sync::Arc;
use sunlimiter_types::{InverterConfig, InverterPowerSource, InverterStatus};
use tracing::{debug, error, info, warn};

use battery::Battery;
use smart_buffer::SmartBuffer;
use solar::Solar;

/// An update cycle fails if the inverter did not reach its target within this time
const UPDATE_TIMEOUT_MS: u64 = 30 * 1000;
/// Consecutive failures after which the inverter is sent a restart command
const RESTART_INVERTER_AFTER: u32 = 10;
/// Consecutive failures after which the whole controller is restarted
const RESTART_SYSTEM_AFTER: u32 = 20;
/// Accepted deviation between requested and reported limit (%)
const LIMIT_MISMATCH_PERCENT: f32 = 2.0;

/// Whether an inverter can take part in the power regulation, and if not, why
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eligibility {
    Unreachable,
    SendingCommandsDisabled,
    MaxOutputUnknown,
    CurrentLimitUnknown,
    Eligible,
    Nighttime,
}

impl fmt::Display for Eligibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Eligible => "eligible",
            Self::Nighttime => "disqualified (nighttime)",
            Self::Unreachable => "disqualified (unreachable)",
            Self::SendingCommandsDisabled => "disqualified (sending commands disabled)",
            Self::MaxOutputUnknown => "disqualified (max output unknown)",
            Self::CurrentLimitUnknown => "disqualified (current limit unknown)",
        };
        f.write_str(text)
    }
}

// ============= Strategy contract =============

/// Power source specific behaviour. All amounts are AC watts.
trait PowerStrategy {
    /// Maximum reduction of the output, with or without going into standby
    fn max_reduction_w(ctl: &InverterController, allow_standby: bool) -> u16;

    /// Maximum increase of the output, possibly coming out of standby
    fn max_increase_w(ctl: &InverterController) -> u16;

    /// Returns the reduction in `[0, reduction]` that becomes effective once
    /// the update cycle completed
    fn apply_reduction(ctl: &mut InverterController, reduction: u16, allow_standby: bool) -> u16;

    /// Stop producing, returns the expected change of the output
    fn standby(ctl: &mut InverterController) -> u16;

    fn set_ac_output(ctl: &mut InverterController, expected_output_w: u16);
}

macro_rules! dispatch {
    ($ctl:ident, $method:ident $(, $arg:expr)*) => {
        match $ctl.config.power_source {
            InverterPowerSource::Battery => Battery::$method($ctl $(, $arg)*),
            InverterPowerSource::Solar => Solar::$method($ctl $(, $arg)*),
            InverterPowerSource::SmartBuffer => SmartBuffer::$method($ctl $(, $arg)*),
        }
    };
}

// ============= Controller =============

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LimitUpdate {
    Done,
    Pending,
    Failed,
}

pub struct InverterController {
    config: InverterConfig,
    handle: Arc<dyn InverterHandle>,
    clock: Arc<dyn SolarClock>,
    system: Arc<dyn SystemControl>,
    log_prefix: String,

    retired: bool,
    update_timeouts: u32,
    update_start_ms: Option<u64>,
    target_limit_w: Option<u16>,
    target_power_state: Option<bool>,
    stats_ms: Option<u64>,
    /// Expected AC output once the targets are reached, may differ from the target limit
    expected_output_w: u16,
}

impl fmt::Debug for InverterController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InverterController")
            .field("serial", &self.config.serial_str())
            .field("power_source", &self.config.power_source)
            .field("target_limit_w", &self.target_limit_w)
            .field("target_power_state", &self.target_power_state)
            .field("update_timeouts", &self.update_timeouts)
            .finish_non_exhaustive()
    }
}

impl InverterController {
    /// Returns `None` if the registry does not know the inverter
    pub fn create(
        config: &InverterConfig,
        registry: &dyn InverterRegistry,
        clock: Arc<dyn SolarClock>,
        system: Arc<dyn SystemControl>,
    ) -> Option<Self> {
        let handle = registry.by_serial(config.serial)?;

        Some(Self {
            log_prefix: format!("Inverter {}:", config.serial_str()),
            config: config.clone(),
            handle,
            clock,
            system,
            retired: false,
            update_timeouts: 0,
            update_start_ms: None,
            target_limit_w: None,
            target_power_state: None,
            stats_ms: None,
            expected_output_w: 0,
        })
    }

    /// Computed on every call, the inverter state changes underneath us
    pub fn eligibility(&self) -> Eligibility {
        // solar-powered inverters go to standby at dusk while still reachable
        if self.config.is_solar_powered() && !self.clock.is_day_period() {
            return Eligibility::Nighttime;
        }
        if !self.handle.is_reachable() {
            return Eligibility::Unreachable;
        }
        if !self.handle.commands_enabled() {
            return Eligibility::SendingCommandsDisabled;
        }
        if self.inverter_max_w() == 0 {
            return Eligibility::MaxOutputUnknown;
        }
        // the effective limit is only requested a while after start-up
        if self.current_limit_w().is_none_or(|limit| limit == 0) {
            return Eligibility::CurrentLimitUnknown;
        }
        Eligibility::Eligible
    }

    pub fn is_eligible(&self) -> bool {
        self.eligibility() == Eligibility::Eligible
    }

    /// Sends commands to reach the target state. Returns `true` while an
    /// update is pending.
    pub fn update(&mut self, now_ms: u64) -> bool {
        match self.eligibility() {
            Eligibility::Eligible => {}
            Eligibility::CurrentLimitUnknown => {
                // wakes up inverters whose limit was never fetched
                if self.target_limit_w.is_none() {
                    debug!("{} bootstrapping by setting lower power limit", self.log_prefix);
                    self.target_limit_w = Some(self.config.lower_power_limit_w);
                }
            }
            _ => return self.reset(),
        }

        // keep the timeout counter if nothing was requested
        if self.target_power_state.is_none() && self.target_limit_w.is_none() {
            return self.reset();
        }

        let start_ms = *self.update_start_ms.get_or_insert(now_ms);

        if now_ms.saturating_sub(start_ms) > UPDATE_TIMEOUT_MS {
            warn!(
                "{} timeout ({} in succession), state transition pending: {}, limit pending: {}",
                self.log_prefix,
                self.update_timeouts,
                if self.target_power_state.is_some() { "yes" } else { "no" },
                if self.target_limit_w.is_some() { "yes" } else { "no" }
            );
            return self.update_failure();
        }

        // switch off first, the limit does not matter once the inverter is off
        if self.switch_power_state(false) {
            return true;
        }

        match self.update_limit(start_ms) {
            LimitUpdate::Pending => return true,
            LimitUpdate::Failed => return self.update_failure(),
            LimitUpdate::Done => {}
        }

        // switch on only after the new limit is in place
        if self.switch_power_state(true) {
            return true;
        }

        self.update_timeouts = 0;
        self.reset()
    }

    fn reset(&mut self) -> bool {
        self.target_power_state = None;
        self.target_limit_w = None;
        self.update_start_ms = None;
        false
    }

    fn update_failure(&mut self) -> bool {
        self.update_timeouts += 1;

        // counts failed cycles, not time: no new cycle starts while the inverter is unreachable
        match self.update_timeouts {
            RESTART_SYSTEM_AFTER => {
                error!("{} restarting system since inverter is unresponsive", self.log_prefix);
                self.system.request_restart();
            }
            RESTART_INVERTER_AFTER => {
                warn!(
                    "{} issuing restart command after update timed out or failed {} times",
                    self.log_prefix, self.update_timeouts
                );
                self.handle.send_restart();
            }
            _ => {}
        }

        self.reset()
    }

    fn switch_power_state(&mut self, transition_on: bool) -> bool {
        let Some(target) = self.target_power_state else {
            return false;
        };
        if target != transition_on {
            return false;
        }

        let command = self.handle.last_power_command();
        if command.status == CommandStatus::Pending {
            return true;
        }

        // only statistics newer than the last power command tell whether it is producing
        if self.handle.last_statistics_ms() < command.updated_ms {
            return true;
        }

        if self.handle.is_producing() != target {
            info!(
                "{} {} inverter...",
                self.log_prefix,
                if target { "Starting" } else { "Stopping" }
            );
            self.handle.send_power_state(target);
            return true;
        }

        self.target_power_state = None;
        false
    }

    fn update_limit(&mut self, start_ms: u64) -> LimitUpdate {
        let Some(target) = self.target_limit_w else {
            return LimitUpdate::Done;
        };

        let command = self.handle.last_limit_command();
        if command.status == CommandStatus::Pending {
            return LimitUpdate::Pending;
        }

        let rated = f32::from(self.inverter_max_w().max(1));
        let new_percent = f32::from(target) * 100.0 / rated;
        let current_percent = self.handle.current_limit_percent().unwrap_or(0.0);

        // with exclusive control, a command answered after the cycle started is ours
        if command.updated_ms > start_ms {
            let ok = command.status == CommandStatus::Ok;
            debug!(
                "{} limit update {}, actual limit is {:.1} % ({:.0} W respectively), effective {} ms after update started, requested were {:.1} %",
                self.log_prefix,
                if ok { "succeeded" } else { "FAILED" },
                current_percent,
                current_percent * rated / 100.0,
                command.updated_ms - start_ms,
                new_percent
            );

            if ok && (new_percent - current_percent).abs() > LIMIT_MISMATCH_PERCENT {
                warn!(
                    "{} expected limit of {:.1} % and actual limit of {:.1} % mismatch by more than {} %, is anything else controlling the inverter?",
                    self.log_prefix, new_percent, current_percent, LIMIT_MISMATCH_PERCENT
                );
            }

            self.target_limit_w = None;

            // a failed limit is not retried, the next regulation cycle calculates a fresh one
            return if ok { LimitUpdate::Done } else { LimitUpdate::Failed };
        }

        info!(
            "{} sending limit of {:.1} % ({:.0} W respectively), max output is {} W",
            self.log_prefix,
            new_percent,
            new_percent * rated / 100.0,
            self.inverter_max_w()
        );
        self.handle.send_limit_percent(new_percent);
        LimitUpdate::Pending
    }

    /// Put the inverter into standby once, then keep driving [`Self::update`]
    pub fn retire(&mut self, now_ms: u64) -> bool {
        if !self.retired {
            self.standby();
        }
        self.retired = true;
        self.update(now_ms)
    }

    /// Timestamp of the oldest statistics received after the last completed
    /// command, `None` while such statistics are outstanding
    pub fn latest_stats_ms(&mut self, now_ms: u64) -> Option<u64> {
        // answers to limit and power commands
        let last_command_age = now_ms
            .saturating_sub(self.handle.last_limit_command().updated_ms)
            .min(now_ms.saturating_sub(self.handle.last_power_command().updated_ms));

        // keep the first stats after a command, newer stats must not hide a later command
        if let Some(stats_ms) = self.stats_ms
            && last_command_age < now_ms.saturating_sub(stats_ms)
        {
            self.stats_ms = None;
        }

        if self.stats_ms.is_none() {
            let last_stats_ms = self.handle.last_statistics_ms();
            if now_ms.saturating_sub(last_stats_ms) > last_command_age {
                return None;
            }
            self.stats_ms = Some(last_stats_ms);
        }

        self.stats_ms
    }

    // ============= Strategy entry points =============

    pub fn max_reduction_w(&self, allow_standby: bool) -> u16 {
        dispatch!(self, max_reduction_w, allow_standby)
    }

    pub fn max_increase_w(&self) -> u16 {
        dispatch!(self, max_increase_w)
    }

    pub fn apply_reduction(&mut self, reduction: u16, allow_standby: bool) -> u16 {
        dispatch!(self, apply_reduction, reduction, allow_standby)
    }

    /// Returns the increase in `[0, increase]` that becomes effective once
    /// the update cycle completed
    pub fn apply_increase(&mut self, increase: u16) -> u16 {
        if !self.is_eligible() || increase == 0 {
            return 0;
        }

        let producing = self.is_producing();

        // do not wake the inverter up if it would produce too much power
        if !producing && self.config.lower_power_limit_w > increase {
            return 0;
        }

        // a standby inverter can have any limit, it starts from zero.
        // an overscaled limit says nothing about the output.
        let baseline = if !producing {
            0
        } else if overscaling::is_enabled(self) {
            self.current_output_w()
        } else {
            self.limit_w()
        };

        let actual_increase = increase.min(self.max_increase_w());
        self.set_ac_output(baseline.saturating_add(actual_increase));
        actual_increase
    }

    pub fn standby(&mut self) -> u16 {
        dispatch!(self, standby)
    }

    fn set_ac_output(&mut self, expected_output_w: u16) {
        dispatch!(self, set_ac_output, expected_output_w);
    }

    /// Wake up and produce as much as the upper power limit permits
    pub fn set_max_output(&mut self) {
        self.target_power_state = Some(true);
        self.set_ac_output(self.configured_max_w());
    }

    pub fn restart(&self) {
        self.handle.send_restart();
    }

    // ============= Accessors =============

    pub fn config(&self) -> &InverterConfig {
        &self.config
    }

    pub fn serial(&self) -> u64 {
        self.config.serial
    }

    pub fn power_source(&self) -> InverterPowerSource {
        self.config.power_source
    }

    pub fn is_behind_power_meter(&self) -> bool {
        self.config.is_behind_power_meter
    }

    pub fn is_reachable(&self) -> bool {
        self.handle.is_reachable()
    }

    pub fn is_producing(&self) -> bool {
        self.handle.is_producing()
    }

    pub fn update_timeouts(&self) -> u32 {
        self.update_timeouts
    }

    /// Model dependent maximum output, 0 while unknown
    pub fn inverter_max_w(&self) -> u16 {
        self.handle.rated_max_power_w().unwrap_or(0)
    }

    /// Maximum output permitted by the upper power limit
    pub fn configured_max_w(&self) -> u16 {
        self.inverter_max_w().min(self.config.upper_power_limit_w)
    }

    pub fn current_output_w(&self) -> u16 {
        self.handle.ac_output_w().max(0.0) as u16
    }

    /// Differs from the current output while new targets are pending
    pub fn expected_output_w(&self) -> u16 {
        if self.target_limit_w.is_none() && self.target_power_state.is_none() {
            return self.current_output_w();
        }
        self.expected_output_w
    }

    pub fn current_limit_w(&self) -> Option<u16> {
        let percent = self.handle.current_limit_percent()?;
        Some((percent * f32::from(self.inverter_max_w()) / 100.0) as u16)
    }

    fn limit_w(&self) -> u16 {
        self.current_limit_w().unwrap_or(0)
    }

    fn lower_limit_w(&self) -> u16 {
        self.config.lower_power_limit_w
    }

    pub fn status(&self) -> InverterStatus {
        InverterStatus {
            serial: self.config.serial_str(),
            power_source: self.config.power_source,
            eligibility: self.eligibility().to_string(),
            reachable: self.is_reachable(),
            producing: self.is_producing(),
            behind_power_meter: self.is_behind_power_meter(),
            current_output_w: self.current_output_w(),
            current_limit_w: self.current_limit_w(),
            expected_output_w: self.expected_output_w(),
            configured_max_w: self.configured_max_w(),
            lower_limit_w: self.lower_limit_w(),
            max_reduction_w: self.max_reduction_w(false),
            max_increase_w: self.max_increase_w(),
            target_power_state: self.target_power_state,
            target_limit_w: self.target_limit_w,
            update_timeouts: self.update_timeouts,
        }
    }

    /// State details at debug level
    pub fn debug_dump(&self) {
        let source = match self.config.power_source {
            InverterPowerSource::SmartBuffer => "smart-buffer",
            InverterPowerSource::Solar => "solar",
            InverterPowerSource::Battery => "battery",
        };

        debug!("{} State Details", self.log_prefix);
        debug!(
            "    {}-powered, {} {} W, output {} power meter reading",
            source,
            if self.is_producing() { "producing" } else { "standing by at" },
            self.current_output_w(),
            if self.is_behind_power_meter() { "included in" } else { "excluded from" }
        );
        debug!(
            "    lower/current/upper limit: {}/{}/{} W, output capability: {} W",
            self.lower_limit_w(),
            self.limit_w(),
            self.config.upper_power_limit_w,
            self.inverter_max_w()
        );
        debug!(
            "    sending commands {}, {}, {}",
            if self.handle.commands_enabled() { "enabled" } else { "disabled" },
            if self.is_reachable() { "reachable" } else { "offline" },
            self.eligibility()
        );
        debug!(
            "    max reduction production/standby: {}/{} W, max increase: {} W",
            self.max_reduction_w(false),
            self.max_reduction_w(true),
            self.max_increase_w()
        );
        debug!(
            "    target limit/output/state: {} W ({})/{} W/{}, {} update timeouts",
            self.target_limit_w.map_or(-1, i32::from),
            if self.target_limit_w.is_some() { "update" } else { "unchanged" },
            self.expected_output_w(),
            match self.target_power_state {
                Some(true) => "production",
                Some(false) => "standby",
                None => "unchanged",
            },
            self.update_timeouts
        );

        let mut mppts = String::from("    MPPTs AC power/DC voltage:");
        for (index, group) in self.handle.mppt_groups().iter().enumerate() {
            let name = char::from(b'a' + (index.min(25) as u8));
            mppts.push_str(&format!(
                " {}: {:.0} W/{:.1} V",
                name,
                overscaling::mppt_power_ac(self, group),
                group.max_voltage()
            ));
        }
        debug!("{}", mppts);
    }
}
