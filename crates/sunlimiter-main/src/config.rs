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

//! Configuration loading for the controller binary.

use anyhow::{Context, Result};
use std::path::Path;
use sunlimiter_types::AppConfig;
use tracing::{info, warn};

const ADDON_OPTIONS_PATH: &str = "/data/options.json";

/// Loads the configuration from the first source available:
/// an explicitly given file, the add-on options, `config.toml`, `config.json`,
/// and finally defaults with `SUNLIMITER_*` environment overrides.
pub fn load_config(explicit: Option<&Path>) -> Result<AppConfig> {
    let mut config = if let Some(path) = explicit {
        let config = AppConfig::from_path(path)
            .with_context(|| format!("Failed to load {}", path.display()))?;
        info!("Loaded configuration from {}", path.display());
        config
    } else {
        load_from_search_path(Path::new("."))?
    };

    for note in config.sanitize() {
        warn!("Configuration: {note}");
    }
    config.validate().context("Invalid configuration")?;

    Ok(config)
}

fn load_from_search_path(dir: &Path) -> Result<AppConfig> {
    if let Ok(options_str) = std::fs::read_to_string(ADDON_OPTIONS_PATH) {
        let config = AppConfig::from_json_str(&options_str)
            .context("Failed to parse add-on options")?;
        info!("Loaded configuration from add-on options");
        return Ok(config);
    }

    load_from_dir(dir)
}

fn load_from_dir(dir: &Path) -> Result<AppConfig> {
    let toml_path = dir.join("config.toml");
    if let Ok(config_str) = std::fs::read_to_string(&toml_path) {
        let config = AppConfig::from_toml_str(&config_str).context("Failed to parse config.toml")?;
        info!("Loaded configuration from config.toml");
        return Ok(config);
    }

    let json_path = dir.join("config.json");
    if let Ok(config_str) = std::fs::read_to_string(&json_path) {
        let config = AppConfig::from_json_str(&config_str).context("Failed to parse config.json")?;
        info!("Loaded configuration from config.json");
        return Ok(config);
    }

    warn!("No configuration file found, using defaults with environment overrides");
    let mut config = AppConfig::default();
    config.apply_env_overrides();
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_toml_preferred_over_json() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.toml"),
            "[limiter]\ntotal_upper_power_limit_w = 600\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("config.json"),
            r#"{"limiter": {"total_upper_power_limit_w": 400}}"#,
        )
        .unwrap();

        let config = load_from_dir(dir.path()).unwrap();
        assert_eq!(config.limiter.total_upper_power_limit_w, 600);
    }

    #[test]
    fn test_json_fallback() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.json"),
            r#"{"limiter": {"base_load_limit_w": 150}}"#,
        )
        .unwrap();

        let config = load_from_dir(dir.path()).unwrap();
        assert_eq!(config.limiter.base_load_limit_w, 150);
    }

    #[test]
    fn test_defaults_without_files() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_from_dir(dir.path()).unwrap();
        assert_eq!(config.limiter, AppConfig::default().limiter);
    }

    #[test]
    fn test_broken_toml_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.toml"), "[limiter\n").unwrap();

        let err = load_from_dir(dir.path()).unwrap_err();
        assert!(err.to_string().contains("config.toml"));
    }

    #[test]
    fn test_explicit_file_is_sanitized() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[surplus]\nstart_soc = 20.0\nstage_ii_upper_power_limit_w = 0").unwrap();

        let config = load_config(Some(file.path())).unwrap();
        assert!((config.surplus.start_soc - 70.0).abs() < f32::EPSILON);
        assert_eq!(
            config.surplus.stage_ii_upper_power_limit_w,
            config.limiter.total_upper_power_limit_w
        );
    }

    #[test]
    fn test_explicit_file_is_validated() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[system]\nsunset = \"late\"").unwrap();

        assert!(load_config(Some(file.path())).is_err());
    }
}
