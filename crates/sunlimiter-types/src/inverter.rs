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

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Where a governed inverter draws its DC power from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum InverterPowerSource {
    /// Fed from the battery bus; may be put into standby
    #[default]
    Battery,
    /// Fed directly by solar panels; never fully switched off during the day
    Solar,
    /// Fed by a battery with its own charge controller (e.g. Zendure, Anker)
    SmartBuffer,
}

impl InverterPowerSource {
    /// Get config string value (kebab-case)
    pub fn to_config_value(self) -> &'static str {
        match self {
            Self::Battery => "battery",
            Self::Solar => "solar",
            Self::SmartBuffer => "smart-buffer",
        }
    }

    /// List all supported power sources
    pub fn all() -> &'static [InverterPowerSource] {
        &[Self::Battery, Self::Solar, Self::SmartBuffer]
    }

    /// Whether the overscaling logic applies to this kind of inverter at all
    pub fn supports_overscaling(self) -> bool {
        matches!(self, Self::Solar | Self::SmartBuffer)
    }
}

impl fmt::Display for InverterPowerSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Battery => write!(f, "battery"),
            Self::Solar => write!(f, "solar"),
            Self::SmartBuffer => write!(f, "smart-buffer"),
        }
    }
}

impl FromStr for InverterPowerSource {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "battery" => Ok(Self::Battery),
            "solar" => Ok(Self::Solar),
            "smart-buffer" | "smartbuffer" => Ok(Self::SmartBuffer),
            _ => Err(ConfigError::Validation(format!(
                "Unknown power source: '{}'. Supported sources: {}",
                s,
                Self::all()
                    .iter()
                    .map(|p| p.to_config_value())
                    .collect::<Vec<_>>()
                    .join(", ")
            ))),
        }
    }
}

/// Configuration for a single inverter managed by the power limiter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InverterConfig {
    /// Inverter serial number
    pub serial: u64,

    /// Where the inverter draws its DC power from
    #[serde(default)]
    pub power_source: InverterPowerSource,

    /// Only governed inverters receive commands
    #[serde(default = "default_true")]
    pub is_governed: bool,

    /// The inverter's output is included in the power meter reading
    #[serde(default = "default_true")]
    pub is_behind_power_meter: bool,

    /// Raise the limit to compensate for shaded DC inputs (solar and smart-buffer only)
    #[serde(default)]
    pub use_overscaling: bool,

    /// Lowest limit ever sent while the inverter is producing (W)
    #[serde(default = "default_lower_power_limit")]
    pub lower_power_limit_w: u16,

    /// Highest AC output the inverter is allowed to produce (W)
    #[serde(default = "default_upper_power_limit")]
    pub upper_power_limit_w: u16,
}

fn default_true() -> bool {
    true
}

fn default_lower_power_limit() -> u16 {
    10
}

fn default_upper_power_limit() -> u16 {
    800
}

impl InverterConfig {
    /// Create a governed inverter config with default limits
    pub fn new(serial: u64, power_source: InverterPowerSource) -> Self {
        Self {
            serial,
            power_source,
            is_governed: true,
            is_behind_power_meter: true,
            use_overscaling: false,
            lower_power_limit_w: default_lower_power_limit(),
            upper_power_limit_w: default_upper_power_limit(),
        }
    }

    /// Serial formatted like the inverter label (hex, 12 digits)
    pub fn serial_str(&self) -> String {
        format!("{:012x}", self.serial)
    }

    pub fn is_battery_powered(&self) -> bool {
        self.power_source == InverterPowerSource::Battery
    }

    pub fn is_solar_powered(&self) -> bool {
        self.power_source == InverterPowerSource::Solar
    }

    pub fn is_smart_buffer_powered(&self) -> bool {
        self.power_source == InverterPowerSource::SmartBuffer
    }

    /// Validate the limit invariant
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.lower_power_limit_w > self.upper_power_limit_w {
            return Err(ConfigError::Validation(format!(
                "Inverter {} has lower power limit {} W above upper power limit {} W",
                self.serial_str(),
                self.lower_power_limit_w,
                self.upper_power_limit_w
            )));
        }
        Ok(())
    }
}
