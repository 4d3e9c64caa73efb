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

//! Error types for configuration handling

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse TOML config: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("failed to serialize TOML config: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("failed to parse JSON config: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Validation(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;
