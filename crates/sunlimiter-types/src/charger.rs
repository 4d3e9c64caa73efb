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

use serde::{Deserialize, Serialize};
use std::fmt;

/// Operating stage reported by the solar charge controller(s)
///
/// In bulk the charger behaves like a current source and reports reliable
/// panel power. In absorption and float it behaves like a voltage source with
/// a current limiter, so the available solar power has to be found by trial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChargerOperationMode {
    /// Charger off, faulted, or in a state we do not regulate on
    #[default]
    Off,
    Bulk,
    Absorption,
    Float,
}

impl ChargerOperationMode {
    /// True for the voltage-limited stages handled by surplus stage II
    pub fn is_voltage_limited(self) -> bool {
        matches!(self, Self::Absorption | Self::Float)
    }
}

impl fmt::Display for ChargerOperationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Off => write!(f, "Off"),
            Self::Bulk => write!(f, "Bulk"),
            Self::Absorption => write!(f, "Absorption"),
            Self::Float => write!(f, "Float"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_voltage_limited_modes() {
        assert!(!ChargerOperationMode::Off.is_voltage_limited());
        assert!(!ChargerOperationMode::Bulk.is_voltage_limited());
        assert!(ChargerOperationMode::Absorption.is_voltage_limited());
        assert!(ChargerOperationMode::Float.is_voltage_limited());
    }

    #[test]
    fn test_mode_serde_lowercase() {
        let json = serde_json::to_string(&ChargerOperationMode::Absorption).unwrap();
        assert_eq!(json, "\"absorption\"");
        let mode: ChargerOperationMode = serde_json::from_str("\"float\"").unwrap();
        assert_eq!(mode, ChargerOperationMode::Float);
    }
}
