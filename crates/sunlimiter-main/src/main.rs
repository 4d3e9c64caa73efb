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

mod config;
mod simulation;

use anyhow::{Context, Result};
use bevy_app::{ScheduleRunnerPlugin, TaskPoolPlugin, prelude::*};
use bevy_ecs::prelude::*;
use std::path::PathBuf;
use std::time::Duration;
use sunlimiter_core::plugin::control_tick_system;
use sunlimiter_core::{ControlLoop, ControlLoopResource, SunLimiterCorePlugin};
use tracing::{info, warn};
use tracing_subscriber::FmtSubscriber;

use simulation::{Simulation, simulation_step_system};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// The run loop never sleeps longer than this, shorter tick intervals win
const MAX_RUN_LOOP_INTERVAL_MS: u64 = 100;

fn print_help() {
    println!("SunLimiter - solar battery power limiter");
    println!("Version: {VERSION}");
    println!();
    println!("Usage: sunlimiter [OPTIONS]");
    println!();
    println!("Options:");
    println!("  -c, --config <FILE>  Load configuration from FILE (TOML or JSON)");
    println!("  -h, --help           Print this help message");
    println!("  -v, --version        Print version");
}

fn main() -> Result<()> {
    let mut config_path: Option<PathBuf> = None;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--help" | "-h" => {
                print_help();
                return Ok(());
            }
            "--version" | "-v" => {
                println!("{VERSION}");
                return Ok(());
            }
            "--config" | "-c" => {
                let path = args.next().context("--config needs a file name")?;
                config_path = Some(PathBuf::from(path));
            }
            other => {
                eprintln!("Unknown argument: {other}");
                print_help();
                return Ok(());
            }
        }
    }

    // Respects RUST_LOG
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("setting default subscriber failed")?;

    let mut config = config::load_config(config_path.as_deref())?;
    if config.inverters.is_empty() {
        warn!("No inverters configured, simulating a battery-powered and a solar-powered one");
        config.inverters = simulation::demo_inverters();
    }

    info!("Starting SunLimiter {VERSION}");
    info!("Configuration Summary:");
    for inverter in &config.inverters {
        info!(
            "   Inverter {} ({}){}, limits {}-{} W",
            inverter.serial_str(),
            inverter.power_source,
            if inverter.is_governed { "" } else { " not governed" },
            inverter.lower_power_limit_w,
            inverter.upper_power_limit_w
        );
    }
    info!(
        "   Total upper limit: {} W, base load: {} W, target consumption: {} W (hysteresis {} W)",
        config.limiter.total_upper_power_limit_w,
        config.limiter.base_load_limit_w,
        config.limiter.target_power_consumption_w,
        config.limiter.target_power_consumption_hysteresis_w
    );
    info!(
        "   Surplus stage I: {}, stage II: {}",
        config.surplus.stage_i_enabled, config.surplus.stage_ii_enabled
    );
    info!("   Tick interval: {} ms", config.system.tick_interval_ms);

    let simulation = Simulation::new(&config)?;
    let control = ControlLoop::new(config.clone(), simulation.collaborators());
    let run_loop_interval =
        Duration::from_millis(config.system.tick_interval_ms.min(MAX_RUN_LOOP_INTERVAL_MS));

    let mut app = App::new();
    app.add_plugins(TaskPoolPlugin::default())
        .add_plugins(ScheduleRunnerPlugin::run_loop(run_loop_interval))
        .add_plugins(SunLimiterCorePlugin)
        .insert_resource(config)
        .insert_resource(ControlLoopResource(control))
        .insert_resource(simulation)
        .add_systems(Update, simulation_step_system.before(control_tick_system));

    info!("Starting main loop...");
    app.run();

    Ok(())
}
