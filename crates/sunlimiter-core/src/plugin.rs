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

//! Bevy integration.
//!
//! [`SunLimiterCorePlugin`] owns the time base and runs the control loop
//! from the `Update` schedule, at most once per configured tick interval.
//! The binary inserts a [`ControlLoopResource`] at start-up; without one
//! the plugin stays idle.

use crate::control::{ControlLoop, TickReport};
use bevy_app::prelude::*;
use bevy_ecs::prelude::*;
use std::time::{Duration, Instant};
use tracing::info;

/// The control loop, driven by [`control_tick_system`]
#[derive(Resource, Debug)]
pub struct ControlLoopResource(pub ControlLoop);

/// Milliseconds since start-up, the time base of the whole regulation
#[derive(Resource, Debug, Clone, Copy)]
pub struct MonotonicClock {
    started: Instant,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self {
            started: Instant::now(),
        }
    }
}

impl MonotonicClock {
    pub fn now_ms(&self) -> u64 {
        u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}

/// Outcome of the most recent tick
#[derive(Resource, Debug, Default, Clone, Copy)]
pub struct LastTickReport(pub Option<TickReport>);

/// Core plugin that ticks the control loop. The [`ControlLoopResource`] is
/// inserted by the application.
#[derive(Debug)]
pub struct SunLimiterCorePlugin;

impl Plugin for SunLimiterCorePlugin {
    fn build(&self, app: &mut App) {
        app.init_resource::<MonotonicClock>()
            .init_resource::<LastTickReport>()
            .add_systems(Startup, control_startup_system)
            .add_systems(Update, control_tick_system);
    }
}

fn control_startup_system(control: Option<Res<ControlLoopResource>>) {
    let Some(control) = control else {
        tracing::error!("No control loop configured, nothing to regulate");
        return;
    };

    let config = control.0.config();
    info!(
        "Regulating {} inverter(s) every {} ms, total upper limit {} W",
        config.governed_inverters().count(),
        config.system.tick_interval_ms,
        config.limiter.total_upper_power_limit_w
    );
}

/// Runs one regulation cycle per configured tick interval
pub fn control_tick_system(
    clock: Res<MonotonicClock>,
    control: Option<ResMut<ControlLoopResource>>,
    mut last_report: ResMut<LastTickReport>,
    mut last_tick: Local<Option<Instant>>,
) {
    let Some(mut control) = control else {
        return;
    };

    let interval = Duration::from_millis(control.0.config().system.tick_interval_ms);
    let now = Instant::now();
    if let Some(last) = *last_tick
        && now.duration_since(last) < interval
    {
        return;
    }
    *last_tick = Some(now);

    last_report.0 = Some(control.0.tick(clock.now_ms()));
}
