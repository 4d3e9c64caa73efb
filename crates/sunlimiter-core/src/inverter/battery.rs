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

use super::{InverterController, PowerStrategy};

/// Battery-powered inverter: may go to standby, never overscales
pub(super) struct Battery;

impl PowerStrategy for Battery {
    fn max_reduction_w(ctl: &InverterController, allow_standby: bool) -> u16 {
        if !ctl.is_eligible() || !ctl.is_producing() {
            return 0;
        }

        if allow_standby {
            return ctl.current_output_w();
        }

        ctl.current_output_w().saturating_sub(ctl.lower_limit_w())
    }

    fn max_increase_w(ctl: &InverterController) -> u16 {
        if !ctl.is_eligible() {
            return 0;
        }

        if !ctl.is_producing() {
            return ctl.configured_max_w();
        }

        // the inverter may produce more than its limit
        if ctl.current_output_w() >= ctl.configured_max_w() {
            return 0;
        }

        // the output can lag behind the limit, so the headroom is measured
        // against the limit, not against the output
        ctl.configured_max_w().saturating_sub(ctl.limit_w())
    }

    fn apply_reduction(ctl: &mut InverterController, reduction: u16, allow_standby: bool) -> u16 {
        if !ctl.is_eligible() || reduction == 0 {
            return 0;
        }

        let lower = ctl.lower_limit_w();
        let baseline = ctl.limit_w();

        if baseline.min(ctl.current_output_w()) <= lower {
            if allow_standby {
                Self::standby(ctl);
                return reduction.min(ctl.current_output_w());
            }
            return 0;
        }

        if baseline - lower >= reduction {
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
        ctl.target_power_state = Some(false);
        ctl.expected_output_w = 0;
        ctl.current_output_w()
    }

    fn set_ac_output(ctl: &mut InverterController, expected_output_w: u16) {
        let expected = expected_output_w
            .min(ctl.configured_max_w())
            .max(ctl.lower_limit_w());

        ctl.expected_output_w = expected;
        ctl.target_limit_w = Some(expected);
        ctl.target_power_state = Some(true);
    }
}

#[cfg(test)]
mod tests {
    use crate::inverter::InverterController;
    use crate::testing::{MockClock, MockInverter, MockRegistry, MockSystem};
    use std::sync::Arc;
    use sunlimiter_types::{InverterConfig, InverterPowerSource};

    fn controller(inverter: &Arc<MockInverter>) -> InverterController {
        let registry = MockRegistry::with(&[inverter.clone()]);
        let mut config = InverterConfig::new(1, InverterPowerSource::Battery);
        config.lower_power_limit_w = 50;
        config.use_overscaling = true;
        InverterController::create(
            &config,
            registry.as_ref(),
            Arc::new(MockClock::default()),
            Arc::new(MockSystem::default()),
        )
        .expect("inverter is registered")
    }

    #[test]
    fn test_reduction_capability() {
        let inverter = MockInverter::new(1);
        let ctl = controller(&inverter);

        assert_eq!(ctl.max_reduction_w(false), 150);
        assert_eq!(ctl.max_reduction_w(true), 200);

        inverter.state.lock().producing = false;
        assert_eq!(ctl.max_reduction_w(true), 0);
    }

    #[test]
    fn test_increase_capability() {
        let inverter = MockInverter::new(1);
        let ctl = controller(&inverter);

        // limit 200 W of 800 W
        assert_eq!(ctl.max_increase_w(), 600);

        inverter.state.lock().producing = false;
        assert_eq!(ctl.max_increase_w(), 800);

        {
            let mut s = inverter.state.lock();
            s.producing = true;
            s.ac_output_w = 800.0;
        }
        assert_eq!(ctl.max_increase_w(), 0);
    }

    #[test]
    fn test_reduction_below_lower_limit_needs_standby() {
        let inverter = MockInverter::new(1);
        let mut ctl = controller(&inverter);

        // 200 W -> lower limit 50 W, only 150 W without standby
        assert_eq!(ctl.apply_reduction(180, false), 150);
        assert_eq!(ctl.expected_output_w(), 50);

        let mut ctl = controller(&inverter);
        assert_eq!(ctl.apply_reduction(180, true), 180);
        assert_eq!(ctl.expected_output_w(), 0);
        assert_eq!(ctl.status().target_power_state, Some(false));
    }

    #[test]
    fn test_limit_is_never_scaled() {
        let inverter = MockInverter::new(1);
        inverter.state.lock().mppt_groups[0].channel_power_w[0] = 0.0;
        let mut ctl = controller(&inverter);

        assert_eq!(ctl.apply_increase(100), 100);
        assert_eq!(ctl.status().target_limit_w, Some(300));
    }
}
