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

use super::battery::Battery;
use super::{InverterController, PowerStrategy, overscaling};

/// Inverter fed by a solar buffer: stands by like a battery inverter, but
/// may overscale like a solar inverter
pub(super) struct SmartBuffer;

impl PowerStrategy for SmartBuffer {
    fn max_reduction_w(ctl: &InverterController, allow_standby: bool) -> u16 {
        Battery::max_reduction_w(ctl, allow_standby)
    }

    fn max_increase_w(ctl: &InverterController) -> u16 {
        if !ctl.is_eligible() {
            return 0;
        }

        if !ctl.is_producing() {
            return ctl.configured_max_w();
        }

        let output = ctl.current_output_w();
        let limit = ctl.limit_w();
        let configured_max = ctl.configured_max_w();

        if output >= configured_max || limit >= ctl.inverter_max_w() {
            return 0;
        }

        // a scaled limit can exceed the configured max, bounded by the rated power
        if overscaling::is_enabled(ctl) {
            let max_output_increase = configured_max - output;
            let max_limit_increase = ctl.inverter_max_w() - limit;
            return max_output_increase.min(max_limit_increase);
        }

        // also covers a limit left over from overscaling or set by someone else
        configured_max.saturating_sub(limit)
    }

    fn apply_reduction(ctl: &mut InverterController, reduction: u16, allow_standby: bool) -> u16 {
        if !ctl.is_eligible() || reduction == 0 {
            return 0;
        }

        let lower = ctl.lower_limit_w();

        if ctl.limit_w().min(ctl.current_output_w()) <= lower {
            if allow_standby {
                Self::standby(ctl);
                return reduction.min(ctl.current_output_w());
            }
            return 0;
        }

        let baseline = if overscaling::is_enabled(ctl) {
            ctl.current_output_w()
        } else {
            ctl.limit_w()
        };

        if baseline.saturating_sub(lower) >= reduction {
            Self::set_ac_output(ctl, baseline - reduction);
            return reduction;
        }

        if allow_standby {
            Self::standby(ctl);
            return reduction.min(ctl.current_output_w());
        }

        Self::set_ac_output(ctl, lower);
        ctl.current_output_w().saturating_sub(lower)
    }

    fn standby(ctl: &mut InverterController) -> u16 {
        Battery::standby(ctl)
    }

    fn set_ac_output(ctl: &mut InverterController, expected_output_w: u16) {
        overscaling::set_ac_output(ctl, expected_output_w);
    }
}

#[cfg(test)]
mod tests {
    use crate::inverter::InverterController;
    use crate::testing::{MockClock, MockInverter, MockRegistry, MockSystem, mppt};
    use std::sync::Arc;
    use sunlimiter_types::{InverterConfig, InverterPowerSource};

    fn controller(inverter: &Arc<MockInverter>, use_overscaling: bool) -> InverterController {
        let registry = MockRegistry::with(&[inverter.clone()]);
        let mut config = InverterConfig::new(5, InverterPowerSource::SmartBuffer);
        config.upper_power_limit_w = 600;
        config.use_overscaling = use_overscaling;
        InverterController::create(
            &config,
            registry.as_ref(),
            Arc::new(MockClock::default()),
            Arc::new(MockSystem::default()),
        )
        .expect("inverter is registered")
    }

    #[test]
    fn test_scaled_limit_above_configured_max() {
        // 700 W limit already scaled above the 600 W upper limit
        let inverter = MockInverter::new(5);
        {
            let mut s = inverter.state.lock();
            s.limit_percent = Some(87.5);
            s.ac_output_w = 450.0;
        }

        assert_eq!(controller(&inverter, true).max_increase_w(), 100);
        assert_eq!(controller(&inverter, false).max_increase_w(), 0);
    }

    #[test]
    fn test_increase_scales_limit_for_shaded_input() {
        let inverter = MockInverter::new(5);
        {
            let mut s = inverter.state.lock();
            s.rated_max_power_w = Some(1600);
            s.limit_percent = Some(50.0);
            s.efficiency_percent = 100.0;
            s.mppt_groups = vec![mppt(0.0, 2.0), mppt(390.0, 38.0)];
            s.ac_output_w = 390.0;
        }
        let mut ctl = controller(&inverter, true);

        // baseline is the output, not the 800 W limit
        assert_eq!(ctl.apply_increase(100), 100);
        let status = ctl.status();
        assert_eq!(status.expected_output_w, 490);
        assert_eq!(status.target_limit_w, Some(980));
    }

    #[test]
    fn test_reduction_to_standby() {
        let inverter = MockInverter::new(5);
        let mut ctl = controller(&inverter, false);

        assert_eq!(ctl.max_reduction_w(true), 200);
        assert_eq!(ctl.apply_reduction(500, true), 200);
        assert_eq!(ctl.status().target_power_state, Some(false));
        assert_eq!(ctl.expected_output_w(), 0);
    }
}
