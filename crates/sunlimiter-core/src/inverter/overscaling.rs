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

//! Overscaling for inverters with several MPPTs.
//!
//! Without power distribution logic an inverter splits its limit evenly across
//! its MPPTs. A shaded MPPT then wastes its share. Raising the limit lets the
//! other MPPTs deliver what the shaded one cannot.

use super::InverterController;
use crate::telemetry::MpptGroup;
use tracing::debug;

/// Minimum limit per DC channel to tell a shaded input from a throttled one (W)
const MIN_LIMIT_PER_CHANNEL_W: usize = 10;

/// Overscaling is off for inverters that distribute their limit on their own
pub(super) fn is_enabled(ctl: &InverterController) -> bool {
    ctl.config.power_source.supports_overscaling()
        && ctl.config.use_overscaling
        && !ctl.handle.supports_power_distribution_logic()
}

/// Share of the expected MPPT output an MPPT must deliver to count as not shaded
pub(super) fn required_output_threshold(ctl: &InverterController, limit_w: u16) -> f32 {
    // MPPTs are less efficient at low power
    if f32::from(limit_w) <= f32::from(ctl.inverter_max_w()) * 0.15 {
        0.8
    } else {
        0.97
    }
}

/// Estimated AC contribution of one MPPT
pub(super) fn mppt_power_ac(ctl: &InverterController, group: &MpptGroup) -> f32 {
    group.dc_power_w() * ctl.handle.efficiency_percent() / 100.0
}

/// Expected AC output per MPPT at the given limit
fn expected_mppt_power_ac(ctl: &InverterController, limit_w: u16, mppts: usize) -> f32 {
    f32::from(limit_w / mppts as u16) * required_output_threshold(ctl, limit_w)
}

/// Limit to command for the desired output, raised to compensate shaded MPPTs
pub(super) fn scale_limit(ctl: &InverterController, desired_output_w: u16) -> u16 {
    if !is_enabled(ctl) {
        return desired_output_w;
    }

    // idle inputs of a sleeping inverter would all look shaded
    if !ctl.is_producing() {
        return desired_output_w;
    }

    let groups = ctl.handle.mppt_groups();
    let total_mppts = groups.len();
    if total_mppts <= 1 {
        return desired_output_w;
    }

    let limit_w = ctl.limit_w();
    if usize::from(limit_w) < ctl.handle.dc_channel_count() * MIN_LIMIT_PER_CHANNEL_W {
        return desired_output_w;
    }

    let current_expected = expected_mppt_power_ac(ctl, limit_w, total_mppts);
    let new_expected = expected_mppt_power_ac(ctl, desired_output_w, total_mppts);

    debug!(
        "{} expected AC power per MPPT {:.0} W",
        ctl.log_prefix, current_expected
    );

    let mut current_shaded = 0usize;
    let mut current_shaded_ac = 0.0f32;
    let mut new_shaded = 0usize;
    let mut new_shaded_ac = 0.0f32;

    for group in &groups {
        let ac = mppt_power_ac(ctl, group);
        if ac < current_expected {
            current_shaded += 1;
            current_shaded_ac += ac;
        }
        if ac < new_expected {
            new_shaded += 1;
            new_shaded_ac += ac;
        }
    }

    if current_shaded == 0 || new_shaded == 0 {
        return desired_output_w;
    }

    let mut non_shaded = total_mppts - current_shaded;
    let mut shaded_ac = current_shaded_ac;

    if non_shaded == 0 {
        if desired_output_w >= limit_w {
            return desired_output_w;
        }

        // every MPPT is below its share and more output is wanted than
        // currently produced, nothing to gain
        if desired_output_w >= ctl.current_output_w() {
            return limit_w;
        }

        non_shaded = total_mppts - new_shaded;
        shaded_ac = new_shaded_ac;

        if non_shaded == 0 {
            return limit_w;
        }
    }

    let limit_per_mppt = ((f32::from(desired_output_w) - shaded_ac) / non_shaded as f32).max(0.0);
    let over_scaled = ((limit_per_mppt as u16).saturating_mul(total_mppts as u16))
        .min(ctl.inverter_max_w());

    if over_scaled <= desired_output_w {
        return desired_output_w;
    }

    debug!(
        "{} {}/{} mppts are not-producing/shaded, scaling {} W",
        ctl.log_prefix, current_shaded, total_mppts, over_scaled
    );

    over_scaled
}

/// Bounds the expected output and commands a possibly scaled limit
pub(super) fn set_ac_output(ctl: &mut InverterController, expected_output_w: u16) {
    let expected = expected_output_w
        .min(ctl.configured_max_w())
        .max(ctl.lower_limit_w());

    ctl.expected_output_w = expected;
    ctl.target_limit_w = Some(scale_limit(ctl, expected));
    ctl.target_power_state = Some(true);
}
