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

pub mod charger;
pub mod config;
pub mod error;
pub mod inverter;
pub mod status;

// Re-export common types for convenience
pub use charger::ChargerOperationMode;
pub use config::{
    AppConfig, BatteryGuardConfig, LimiterConfig, SurplusConfig, SystemSettingsConfig,
};
pub use error::ConfigError;
pub use inverter::{InverterConfig, InverterPowerSource};
pub use status::{
    BatteryGuardStatus, InverterStatus, RegulationQuality, StageActivity, SurplusFaultCounters,
    SurplusState, SurplusStatus,
};
