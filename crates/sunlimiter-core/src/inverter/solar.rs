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

use super::{InverterController, PowerStrategy, overscaling};

/// Solar-powered inverter: never goes to standby, the lower power limit
/// keeps the MPPTs locked in
pub(super) struct Solar;

impl PowerStrategy for Solar {
    fn max_reduction_w(ctl: &InverterController, _allow_standby: bool) -> u16 {
        if !ctl.is_eligible() || !ctl.is_producing() {
            return 0;
        }

        let lower = ctl.lower_limit_w();
        if ctl.limit_w().min(ctl.current_output_w()) <= lower {
            return 0;
        }

        ctl.current_output_w().saturating_sub(lower)
    }

    fn max_increase_w(ctl: &InverterController) -> u16 {
        if !ctl.is_eligible() {
            return 0;
        }

        // probably early in the morning, the real headroom is unknown
        if !ctl.is_producing() {
            return ctl.lower_limit_w();
        }

        let output = ctl.current_output_w();
        let limit = ctl.limit_w();
        let rated = ctl.inverter_max_w();
        let configured_max = ctl.configured_max_w();

        if output >= configured_max || limit >= rated {
            return 0;
        }

        let overscaling = overscaling::is_enabled(ctl);
        if !overscaling && limit >= configured_max {
            return 0;
        }

        // with overscaling or distribution logic every MPPT may deliver its
        // full share of the rated power
        let power_distribution = ctl.handle.supports_power_distribution_logic();
        let max_limit = if overscaling || power_distribution {
            rated
        } else {
            configured_max
        };

        let groups = ctl.handle.mppt_groups();
        let total_mppts = groups.len();
        if total_mppts == 0 {
            return 0;
        }

        let threshold = overscaling::required_output_threshold(ctl, limit);
        let expected_per_mppt = f32::from(limit / total_mppts as u16) * threshold;
        let max_per_mppt = f32::from(max_limit / total_mppts as u16);

        let mut non_shaded_increase = 0.0f32;
        let mut non_limited_mppts = 0u16;
        for group in &groups {
            let ac = overscaling::mppt_power_ac(ctl, group);
            if ac >= expected_per_mppt && max_per_mppt > ac {
                non_shaded_increase += max_per_mppt - ac;
                non_limited_mppts += 1;
            }
        }

        // every MPPT is at its maximum or shaded
        if non_limited_mppts == 0 {
            return 0;
        }

        let max_output_increase = configured_max - output;
        let mut max_limit_increase = max_limit.saturating_sub(limit);

        // the limit is divided evenly across all MPPTs
        if !ctl.config.use_overscaling && !power_distribution {
            max_limit_increase = (max_limit_increase / total_mppts as u16) * non_limited_mppts;
        }

        max_output_increase
            .min(max_limit_increase)
            .min(non_shaded_increase as u16)
    }

    fn apply_reduction(ctl: &mut InverterController, reduction: u16, _allow_standby: bool) -> u16 {
        if !ctl.is_eligible() || reduction == 0 {
            return 0;
        }

        // an overscaled limit says nothing about the output
        let baseline = if overscaling::is_enabled(ctl) {
            ctl.current_output_w()
        } else {
            ctl.limit_w()
        };
        let lower = ctl.lower_limit_w();

        if baseline.saturating_sub(lower) >= reduction {
            Self::set_ac_output(ctl, baseline - reduction);
            return reduction;
        }

        Self::set_ac_output(ctl, lower);
        ctl.current_output_w().saturating_sub(lower)
    }

    fn standby(ctl: &mut InverterController) -> u16 {
        let lower = ctl.lower_limit_w();
        Self::set_ac_output(ctl, lower);
        ctl.current_output_w().saturating_sub(lower)
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
        let mut config = InverterConfig::new(3, InverterPowerSource::Solar);
        config.lower_power_limit_w = 40;
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
    fn test_standby_keeps_lower_limit() {
        let inverter = MockInverter::new(3);
        let mut ctl = controller(&inverter, false);

        assert_eq!(ctl.standby(), 160);
        let status = ctl.status();
        assert_eq!(status.target_power_state, Some(true));
        assert_eq!(status.target_limit_w, Some(40));
        assert_eq!(status.expected_output_w, 40);
    }

    #[test]
    fn test_not_producing_offers_lower_limit() {
        let inverter = MockInverter::new(3);
        inverter.state.lock().producing = false;
        let ctl = controller(&inverter, false);

        assert_eq!(ctl.max_increase_w(), 40);
        assert_eq!(ctl.max_reduction_w(true), 0);
    }

    #[test]
    fn test_increase_limited_by_weak_mppts() {
        // 200 W limit, both MPPTs deliver their 100 W share
        let inverter = MockInverter::new(3);
        {
            let mut s = inverter.state.lock();
            s.efficiency_percent = 100.0;
            s.mppt_groups = vec![mppt(100.0, 30.0), mppt(100.0, 30.0)];
        }
        let ctl = controller(&inverter, false);
        // headroom of 300 W per MPPT, the limit increase is split evenly
        assert_eq!(ctl.max_increase_w(), 600);

        // one MPPT is shaded, only the other one can add power
        inverter.state.lock().mppt_groups = vec![mppt(20.0, 30.0), mppt(180.0, 30.0)];
        let ctl = controller(&inverter, false);
        assert_eq!(ctl.max_increase_w(), 220);
    }

    #[test]
    fn test_increase_with_overscaling_uses_rated_power() {
        let inverter = MockInverter::new(3);
        {
            let mut s = inverter.state.lock();
            s.efficiency_percent = 100.0;
            s.mppt_groups = vec![mppt(20.0, 30.0), mppt(180.0, 30.0)];
        }
        let mut ctl = controller(&inverter, true);
        ctl.config.upper_power_limit_w = 500;

        // output headroom 300 W, MPPT headroom 400 - 180 = 220 W
        assert_eq!(ctl.max_increase_w(), 220);
    }

    #[test]
    fn test_reduction_with_overscaling_starts_from_output() {
        let inverter = MockInverter::new(3);
        {
            let mut s = inverter.state.lock();
            s.limit_percent = Some(50.0);
            s.ac_output_w = 250.0;
        }
        let mut ctl = controller(&inverter, true);

        assert_eq!(ctl.apply_reduction(100, false), 100);
        assert_eq!(ctl.expected_output_w(), 150);

        let mut ctl = controller(&inverter, false);
        assert_eq!(ctl.apply_reduction(100, false), 100);
        assert_eq!(ctl.expected_output_w(), 300);
    }

    #[test]
    fn test_nighttime_solar_inverter_is_left_alone() {
        let inverter = MockInverter::new(3);
        let registry = MockRegistry::with(&[inverter.clone()]);
        let clock = Arc::new(MockClock::default());
        *clock.day.lock() = false;
        let mut ctl = InverterController::create(
            &InverterConfig::new(3, InverterPowerSource::Solar),
            registry.as_ref(),
            clock,
            Arc::new(MockSystem::default()),
        )
        .expect("inverter is registered");

        assert_eq!(ctl.max_increase_w(), 0);
        assert_eq!(ctl.apply_increase(100), 0);
        assert!(!ctl.update(1000));
    }
}
