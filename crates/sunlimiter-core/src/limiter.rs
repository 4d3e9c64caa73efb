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

//! Distribution of the requested output across the governed inverters.

use crate::inverter::InverterController;
use crate::telemetry::{InverterRegistry, SolarClock, SystemControl};
use std::cmp::Reverse;
use std::fmt;
use std::sync::Arc;
use sunlimiter_types::{InverterConfig, InverterPowerSource, InverterStatus, LimiterConfig};
use tracing::{debug, info, warn};

pub struct PowerLimiter {
    controllers: Vec<InverterController>,
    /// Inverters no longer governed, driven to standby before they are dropped
    retirees: Vec<InverterController>,
    hysteresis_w: u16,
    clock: Arc<dyn SolarClock>,
    system: Arc<dyn SystemControl>,
}

impl fmt::Debug for PowerLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PowerLimiter")
            .field("controllers", &self.controllers)
            .field("retirees", &self.retirees)
            .field("hysteresis_w", &self.hysteresis_w)
            .finish_non_exhaustive()
    }
}

impl PowerLimiter {
    pub fn new(config: &LimiterConfig, clock: Arc<dyn SolarClock>, system: Arc<dyn SystemControl>) -> Self {
        Self {
            controllers: Vec::new(),
            retirees: Vec::new(),
            hysteresis_w: config.target_power_consumption_hysteresis_w,
            clock,
            system,
        }
    }

    pub fn update_config(&mut self, config: &LimiterConfig) {
        self.hysteresis_w = config.target_power_consumption_hysteresis_w;
    }

    /// Rebuild the controllers from the inverter configuration
    pub fn reload(&mut self, inverters: &[InverterConfig], registry: &dyn InverterRegistry) {
        for controller in std::mem::take(&mut self.controllers) {
            let still_governed = inverters
                .iter()
                .any(|config| config.serial == controller.serial() && config.is_governed);

            if !still_governed {
                info!(
                    "[limiter] retiring inverter {}",
                    controller.config().serial_str()
                );
                self.retirees.push(controller);
            }
        }

        for config in inverters.iter().filter(|config| config.is_governed) {
            match InverterController::create(
                config,
                registry,
                Arc::clone(&self.clock),
                Arc::clone(&self.system),
            ) {
                Some(controller) => self.controllers.push(controller),
                None => warn!(
                    "[limiter] inverter {} is unknown, not governed",
                    config.serial_str()
                ),
            }
        }

        info!(
            "[limiter] governing {} inverter(s), {} retiring",
            self.controllers.len(),
            self.retirees.len()
        );
    }

    pub fn is_empty(&self) -> bool {
        self.controllers.is_empty()
    }

    pub fn controllers(&self) -> &[InverterController] {
        &self.controllers
    }

    pub fn has_power_source(&self, source: InverterPowerSource) -> bool {
        self.controllers.iter().any(|c| c.power_source() == source)
    }

    /// Assigns new limits to the eligible inverters of one power source.
    /// Returns the output these inverters are expected to produce afterwards.
    pub fn update_inverter_limits(&mut self, requested_w: u16, source: InverterPowerSource) -> u16 {
        let mut matching: Vec<usize> = self
            .controllers
            .iter()
            .enumerate()
            .filter(|(_, c)| c.power_source() == source && c.is_eligible())
            .map(|(index, _)| index)
            .collect();

        if matching.is_empty() {
            return 0;
        }

        let producing: u32 = matching
            .iter()
            .map(|&i| u32::from(self.controllers[i].current_output_w()))
            .sum();
        let diff = i64::from(requested_w) - i64::from(producing);

        // without hysteresis battery-powered inverters can reach standby
        let hysteresis = if requested_w == 0 { 0 } else { self.hysteresis_w };

        debug!(
            "[limiter] requesting {} W from {} {} inverter(s) currently producing {} W (diff {} W, hysteresis {} W)",
            requested_w,
            matching.len(),
            source,
            producing,
            diff,
            hysteresis
        );

        if diff.abs() < i64::from(hysteresis) {
            return saturate(producing);
        }

        let controllers = &mut self.controllers;
        let mut covered: u32 = 0;

        if diff < 0 {
            let mut reduction = saturate(diff.unsigned_abs());

            let total_max_reduction: u32 = matching
                .iter()
                .map(|&i| u32::from(controllers[i].max_reduction_w(false)))
                .sum();

            // standby only if the reduction cannot be reached otherwise
            let allow_standby = total_max_reduction < u32::from(reduction);

            matching.sort_by_key(|&i| Reverse(controllers[i].max_reduction_w(allow_standby)));

            for i in matching.iter().copied() {
                let controller = &mut controllers[i];
                if reduction >= hysteresis && controller.max_reduction_w(allow_standby) >= hysteresis {
                    let applied = controller.apply_reduction(reduction, allow_standby);
                    reduction = reduction.saturating_sub(applied);
                }
                covered += u32::from(controller.expected_output_w());
            }
        } else {
            let mut increase = saturate(diff.unsigned_abs());

            matching.sort_by_key(|&i| Reverse(controllers[i].max_increase_w()));

            for i in matching.iter().copied() {
                let controller = &mut controllers[i];
                if increase >= hysteresis && controller.max_increase_w() >= hysteresis {
                    let applied = controller.apply_increase(increase);
                    increase = increase.saturating_sub(applied);
                }
                covered += u32::from(controller.expected_output_w());
            }
        }

        debug!(
            "[limiter] will cover {} W using {} {} inverter(s)",
            covered,
            matching.len(),
            source
        );

        saturate(covered)
    }

    /// Drives all pending updates. Returns `true` while any inverter is busy.
    pub fn update_inverters(&mut self, now_ms: u64) -> bool {
        let mut busy = false;

        for controller in &mut self.controllers {
            if controller.update(now_ms) {
                busy = true;
            }
        }

        self.retirees.retain_mut(|retiree| {
            let pending = retiree.retire(now_ms);
            busy |= pending;
            pending
        });

        busy
    }

    /// Newest of the eligible inverters' stats timestamps, `None` while any of
    /// them still waits for stats after its last command
    pub fn latest_inverter_stats_ms(&mut self, now_ms: u64) -> Option<u64> {
        let mut latest = 0;

        // ineligible inverters are ignored throughout the regulation
        for controller in self.controllers.iter_mut().filter(|c| c.is_eligible()) {
            latest = latest.max(controller.latest_stats_ms(now_ms)?);
        }

        Some(latest)
    }

    /// Restart every inverter that is not solar-powered
    pub fn restart_inverters(&self) {
        for controller in self.controllers.iter().filter(|c| !c.config().is_solar_powered()) {
            info!(
                "[limiter] sending restart command to inverter {}",
                controller.config().serial_str()
            );
            controller.restart();
        }
    }

    /// Current AC output of all inverters of one power source
    pub fn output_w(&self, source: InverterPowerSource) -> u16 {
        saturate(
            self.controllers
                .iter()
                .filter(|c| c.power_source() == source)
                .map(|c| u32::from(c.current_output_w()))
                .sum::<u32>(),
        )
    }

    /// Most consecutive update failures of any inverter
    pub fn max_update_timeouts(&self) -> u32 {
        self.controllers
            .iter()
            .map(InverterController::update_timeouts)
            .max()
            .unwrap_or(0)
    }

    pub fn retiree_count(&self) -> usize {
        self.retirees.len()
    }

    pub fn inverter_statuses(&self) -> Vec<InverterStatus> {
        self.controllers.iter().map(InverterController::status).collect()
    }

    pub fn debug_dump(&self) {
        for controller in &self.controllers {
            controller.debug_dump();
        }
    }
}

fn saturate(value: impl Into<u64>) -> u16 {
    u16::try_from(value.into()).unwrap_or(u16::MAX)
}
