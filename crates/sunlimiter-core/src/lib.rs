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

//! Battery state estimation, surplus regulation and inverter power limiting
//! for a DC-coupled solar battery system.

pub mod battery_guard;
pub mod control;
pub mod discharge;
pub mod inverter;
pub mod limiter;
pub mod plugin;
pub mod restart;
pub mod statistic;
pub mod surplus;
pub mod telemetry;

#[cfg(test)]
mod testing;

// Re-export common types for convenience
pub use battery_guard::{BatteryStateEstimator, ResistanceState};
pub use control::{Collaborators, ControlLoop, TickReport, TickStatus};
pub use discharge::{BatteryReadings, DischargeGate, PowerBus};
pub use inverter::{Eligibility, InverterController};
pub use limiter::PowerLimiter;
pub use plugin::{ControlLoopResource, LastTickReport, MonotonicClock, SunLimiterCorePlugin};
pub use restart::RestartSchedule;
pub use statistic::WeightedAverage;
pub use surplus::{SurplusFault, SurplusPowerRegulator, Switch};
pub use telemetry::{
    BatteryTelemetry, CommandState, CommandStatus, InverterHandle, InverterRegistry, MpptGroup,
    PowerMeter, SolarChargerTelemetry, SolarClock, SystemControl, Timed,
};
