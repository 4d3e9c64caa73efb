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

//! Battery state estimation.
//!
//! Derives the internal resistance of the battery from voltage steps caused by
//! large current changes, and the open circuit voltage (`V - I * R`) from it.
//! Both only work with telemetry of sufficient resolution: the data source must
//! resolve at least 20 mV and 100 mA and deliver a sample at least every 4 s.

use crate::statistic::WeightedAverage;
use crate::telemetry::{BatteryTelemetry, Timed};
use std::fmt;
use sunlimiter_types::{BatteryGuardConfig, BatteryGuardStatus};
use tracing::{debug, info};

/// A calculated resistance is used once this many calculations were accepted
pub const MIN_RESISTANCE_CALCULATIONS: u32 = 5;

const MAX_VOLTAGE_RESOLUTION: f32 = 0.020;
const MAX_CURRENT_RESOLUTION: f32 = 0.100;
const MAX_MEASUREMENT_PERIOD_MS: u32 = 4000;
const MAX_VI_DELAY_MS: f32 = 1000.0;
const MIN_RESOLUTION_STEP: f32 = 0.001;

/// Current change that starts a resistance measurement (A)
const TRIGGER_CURRENT_DIFF: f32 = 3.5 / 3.0;
/// Two consecutive samples closer than this are considered stable
const PAIR_MAX_VOLTAGE_DIFF: f32 = 0.005;
const PAIR_MAX_CURRENT_DIFF: f32 = 0.2;
const EVALUATION_WINDOW_MS: u64 = 15_000;
const OCV_MAX_AGE_MS: u64 = 30_000;

/// Progress of the resistance calculation, ordered by how far it got
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum ResistanceState {
    #[default]
    Idle,
    Resolution,
    FirstPair,
    Trigger,
    SecondPair,
    DeltaPower,
    TooBad,
    Calculated,
}

impl fmt::Display for ResistanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Idle => "Idle",
            Self::Resolution => "Battery data insufficient",
            Self::FirstPair => "Start data available",
            Self::Trigger => "Trigger event",
            Self::SecondPair => "Collecting data after trigger",
            Self::DeltaPower => "Power difference not high enough",
            Self::TooBad => "Resistance out of safety range",
            Self::Calculated => "Resistance calculated",
        };
        f.write_str(text)
    }
}

/// Averaged voltage/current of two stable consecutive samples
#[derive(Debug, Clone, Copy, PartialEq)]
struct Pair {
    voltage: f32,
    current: f32,
}

impl Pair {
    fn is_close_to(&self, other: &Pair) -> bool {
        (self.voltage - other.voltage).abs() <= PAIR_MAX_VOLTAGE_DIFF
            && (self.current - other.current).abs() <= PAIR_MAX_CURRENT_DIFF
    }

    fn midpoint(&self, other: &Pair) -> Pair {
        Pair {
            voltage: (self.voltage + other.voltage) / 2.0,
            current: (self.current + other.current) / 2.0,
        }
    }
}

/// Min/max pairs are only meaningful while `trigger_ms` is set and the
/// evaluation window has not elapsed. Cleared after every attempt.
#[derive(Debug, Clone, Default)]
struct ResistanceEstimation {
    first: Option<Pair>,
    min: Option<Pair>,
    max: Option<Pair>,
    trigger_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Sample {
    voltage: f32,
    current: f32,
    timestamp_ms: u64,
}

#[derive(Debug, Clone)]
pub struct BatteryStateEstimator {
    enabled: bool,
    configured_resistance: f32,

    calculated_resistance: WeightedAverage<f32>,
    open_circuit_voltage: WeightedAverage<f32>,
    voltage_avg: WeightedAverage<f32>,
    period: WeightedAverage<u32>,
    vi_delay: WeightedAverage<f32>,
    resolution_v: f32,
    resolution_i: f32,

    last_sample: Option<Sample>,
    estimation: ResistanceEstimation,
    state: ResistanceState,
    state_last: ResistanceState,
    state_max: ResistanceState,
    not_available_count: u32,

    // raw telemetry seen by poll()
    prev_voltage: Option<Timed<f32>>,
    prev_voltage_unused: bool,
    prev_current: Option<Timed<f32>>,
}

impl BatteryStateEstimator {
    pub fn new(config: &BatteryGuardConfig) -> Self {
        let mut period = WeightedAverage::new(20);
        period.reset_to(10_000);

        Self {
            enabled: config.enabled,
            configured_resistance: config.internal_resistance_ohm,
            calculated_resistance: WeightedAverage::new(10),
            open_circuit_voltage: WeightedAverage::new(5),
            voltage_avg: WeightedAverage::new(5),
            period,
            vi_delay: WeightedAverage::new(20),
            resolution_v: 1.0,
            resolution_i: 1.0,
            last_sample: None,
            estimation: ResistanceEstimation::default(),
            state: ResistanceState::Idle,
            state_last: ResistanceState::Idle,
            state_max: ResistanceState::Idle,
            not_available_count: 0,
            prev_voltage: None,
            prev_voltage_unused: false,
            prev_current: None,
        }
    }

    pub fn update_config(&mut self, config: &BatteryGuardConfig) {
        self.enabled = config.enabled;
        self.configured_resistance = config.internal_resistance_ohm;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Fetch new voltage/current readings and feed them into the estimation.
    ///
    /// Readings already seen are ignored. If the provider timestamps voltage and
    /// current separately, the voltage is paired with the closer current reading
    /// and the older of both timestamps is used.
    pub fn poll(&mut self, battery: &dyn BatteryTelemetry) {
        if !self.enabled {
            return;
        }

        let (Some(u2), Some(i2)) = (battery.voltage(), battery.current()) else {
            return;
        };

        let same_voltage = self
            .prev_voltage
            .is_some_and(|u| u.timestamp_ms == u2.timestamp_ms);
        let same_current = self
            .prev_current
            .is_some_and(|i| i.timestamp_ms == i2.timestamp_ms);
        if same_voltage && same_current {
            return;
        }

        if u2.timestamp_ms == i2.timestamp_ms {
            self.prev_voltage = Some(u2);
            self.prev_voltage_unused = false;
            self.prev_current = Some(i2);
            self.vi_delay.add(0.0);
            self.ingest_sample(u2.value, i2.value, u2.timestamp_ms);
            return;
        }

        let mut consumed_new_voltage = false;
        if !same_current {
            let mut ux = self.prev_voltage.filter(|_| self.prev_voltage_unused);
            if !same_voltage && u2.timestamp_ms < i2.timestamp_ms {
                ux = Some(u2);
                consumed_new_voltage = true;
            }

            if let (Some(ux), Some(i1)) = (ux, self.prev_current) {
                let to_next = i2.timestamp_ms as i64 - ux.timestamp_ms as i64;
                let from_prev = ux.timestamp_ms as i64 - i1.timestamp_ms as i64;
                if to_next < from_prev {
                    self.vi_delay.add(to_next as f32);
                    self.ingest_sample(ux.value, i2.value, ux.timestamp_ms);
                } else {
                    self.vi_delay.add(-(from_prev as f32));
                    self.ingest_sample(ux.value, i1.value, i1.timestamp_ms);
                }
                self.prev_voltage_unused = false;
            } else {
                consumed_new_voltage = false;
            }

            self.prev_current = Some(i2);
        }

        if !same_voltage {
            self.prev_voltage = Some(u2);
            self.prev_voltage_unused = !consumed_new_voltage;
        }
    }

    /// Feed one voltage (V) / current (A, positive = charging) sample
    pub fn ingest_sample(&mut self, voltage: f32, current: f32, timestamp_ms: u64) {
        if !voltage.is_finite() || !current.is_finite() || voltage < 0.0 {
            return;
        }

        if let Some(last) = self.last_sample {
            if timestamp_ms > last.timestamp_ms {
                let delta = (timestamp_ms - last.timestamp_ms).min(u64::from(u32::MAX));
                self.period.add(delta as u32);
            }

            let dv = (voltage - last.voltage).abs();
            if dv >= MIN_RESOLUTION_STEP && dv < self.resolution_v {
                self.resolution_v = dv;
            }
            let di = (current - last.current).abs();
            if di >= MIN_RESOLUTION_STEP && di < self.resolution_i {
                self.resolution_i = di;
            }
        }

        self.last_sample = Some(Sample {
            voltage,
            current,
            timestamp_ms,
        });
        self.voltage_avg.add(voltage);

        self.calculate_internal_resistance(voltage, current, timestamp_ms);
        self.calculate_open_circuit_voltage(voltage, current);
    }

    /// Voltage resolution, current resolution, sample period and V-I delay are
    /// all good enough for the resistance calculation
    pub fn is_resolution_sufficient(&self) -> bool {
        self.resolution_v <= MAX_VOLTAGE_RESOLUTION
            && self.resolution_i <= MAX_CURRENT_RESOLUTION
            && self.period.average() <= MAX_MEASUREMENT_PERIOD_MS
            && (self.vi_delay.is_empty() || self.vi_delay.average().abs() <= MAX_VI_DELAY_MS)
    }

    fn calculate_internal_resistance(&mut self, voltage: f32, current: f32, now_ms: u64) {
        if !self.is_resolution_sufficient() {
            self.enter_state(ResistanceState::Resolution);
            return;
        }

        if self.estimation.min.is_none() {
            self.state = ResistanceState::Idle;
        }

        let est = &mut self.estimation;
        if est.trigger_ms.is_none()
            && let Some(min) = est.min
            && (current - min.current).abs() > TRIGGER_CURRENT_DIFF
        {
            est.trigger_ms = Some(now_ms);
            self.state = ResistanceState::Trigger;
        }

        let in_window = est
            .trigger_ms
            .is_none_or(|t| now_ms.saturating_sub(t) < EVALUATION_WINDOW_MS);

        if in_window {
            let now = Pair { voltage, current };
            if let Some(first) = est.first
                && first.is_close_to(&now)
            {
                let avg = first.midpoint(&now);
                match (est.trigger_ms, est.min, est.max) {
                    (Some(_), Some(min), Some(max)) => {
                        if avg.voltage < min.voltage {
                            est.min = Some(avg);
                        }
                        if avg.voltage > max.voltage {
                            est.max = Some(avg);
                        }
                        self.state = ResistanceState::SecondPair;
                    }
                    _ => {
                        est.min = Some(avg);
                        est.max = Some(avg);
                        self.state = ResistanceState::FirstPair;
                    }
                }
            }
            est.first = Some(now);
            self.enter_state(self.state);
            return;
        }

        let estimation = std::mem::take(&mut self.estimation);
        let state = match (estimation.min, estimation.max) {
            (Some(min), Some(max)) => self.evaluate_resistance(min, max),
            _ => ResistanceState::DeltaPower,
        };
        self.state = state;
        self.enter_state(state);
    }

    fn evaluate_resistance(&mut self, min: Pair, max: Pair) -> ResistanceState {
        let min_delta_voltage = if self.resolution_v <= 0.005 { 0.04 } else { 0.07 };
        let delta_voltage = max.voltage - min.voltage;
        let delta_current = (max.current - min.current).abs();

        if delta_voltage < min_delta_voltage || delta_current < TRIGGER_CURRENT_DIFF {
            return ResistanceState::DeltaPower;
        }

        let resistance = delta_voltage / delta_current;
        let reference = if self.configured_resistance != 0.0 {
            Some(self.configured_resistance)
        } else if !self.calculated_resistance.is_empty() {
            Some(self.calculated_resistance.average())
        } else {
            None
        };

        if let Some(reference) = reference
            && (resistance > reference * 2.0 || resistance < reference / 2.0)
        {
            debug!(
                "[battery guard] rejecting resistance {:.1} mOhm, reference is {:.1} mOhm",
                resistance * 1000.0,
                reference * 1000.0
            );
            return ResistanceState::TooBad;
        }

        self.calculated_resistance.add(resistance);
        info!(
            "[battery guard] internal resistance {:.1} mOhm (dV {:.3} V, dI {:.2} A), average {:.1} mOhm",
            resistance * 1000.0,
            delta_voltage,
            delta_current,
            self.calculated_resistance.average() * 1000.0
        );
        ResistanceState::Calculated
    }

    fn enter_state(&mut self, state: ResistanceState) {
        if self.state_last == state {
            return;
        }
        self.state_last = state;
        debug!("[battery guard] resistance calculation state: {}", state);
        if state > self.state_max {
            self.state_max = state;
        }
    }

    fn calculate_open_circuit_voltage(&mut self, voltage: f32, current: f32) {
        if let Some(resistance) = self.internal_resistance() {
            self.open_circuit_voltage.add(voltage - current * resistance);
        }
    }

    /// Calculated resistance once enough calculations exist, else the
    /// configured one, else `None`
    pub fn internal_resistance(&self) -> Option<f32> {
        if !self.enabled {
            return None;
        }
        if self.is_internal_resistance_calculated() {
            return Some(self.calculated_resistance.average());
        }
        if self.configured_resistance != 0.0 {
            return Some(self.configured_resistance);
        }
        None
    }

    pub fn is_internal_resistance_calculated(&self) -> bool {
        self.calculated_resistance.count() >= MIN_RESISTANCE_CALCULATIONS
    }

    /// Averaged open circuit voltage, `None` without data or when the last
    /// sample is older than 30 s. Every `None` is counted.
    pub fn open_circuit_voltage(&mut self, now_ms: u64) -> Option<f32> {
        let ocv = self.fresh_open_circuit_voltage(now_ms);
        if ocv.is_none() {
            self.not_available_count = self.not_available_count.saturating_add(1);
        }
        ocv
    }

    fn fresh_open_circuit_voltage(&self, now_ms: u64) -> Option<f32> {
        let fresh = self
            .last_sample
            .is_some_and(|s| now_ms.saturating_sub(s.timestamp_ms) <= OCV_MAX_AGE_MS);
        (self.enabled && !self.open_circuit_voltage.is_empty() && fresh)
            .then(|| self.open_circuit_voltage.average())
    }

    pub fn resistance_state(&self) -> ResistanceState {
        self.state_last
    }

    pub fn status(&self, now_ms: u64) -> BatteryGuardStatus {
        BatteryGuardStatus {
            resolution_sufficient: self.is_resolution_sufficient(),
            resistance_mohm: self.internal_resistance().map(|r| r * 1000.0),
            calculated_resistance_mohm: self.calculated_resistance.average() * 1000.0,
            calculated_resistance_min_mohm: self.calculated_resistance.min() * 1000.0,
            calculated_resistance_max_mohm: self.calculated_resistance.max() * 1000.0,
            calculation_count: self.calculated_resistance.count(),
            configured_resistance_mohm: self.configured_resistance * 1000.0,
            resistance_state: self.state_max.to_string(),
            open_circuit_voltage: self.fresh_open_circuit_voltage(now_ms),
            battery_voltage: self.last_sample.map_or(0.0, |s| s.voltage),
            voltage_resolution_mv: self.resolution_v * 1000.0,
            current_resolution_ma: self.resolution_i * 1000.0,
            measurement_period_ms: self.period.average(),
            vi_delay_ms: self.vi_delay.average(),
            ocv_not_available_count: self.not_available_count,
        }
    }

    /// Once-a-minute report at debug level
    pub fn report(&self, now_ms: u64) {
        if !self.enabled {
            return;
        }
        let status = self.status(now_ms);

        debug!("[battery guard] ------------- Battery Guard Report -------------");
        debug!(
            "[battery guard] Open circuit voltage calculation. Battery data {}",
            if status.resolution_sufficient { "sufficient" } else { "not sufficient" }
        );
        debug!(
            "[battery guard] Open circuit voltage: {:.3} V (Actual battery voltage: {:.3} V, average {:.3} V)",
            self.open_circuit_voltage.average(),
            status.battery_voltage,
            self.voltage_avg.average()
        );
        match status.resistance_mohm {
            Some(r) => debug!(
                "[battery guard] Resistance in use: {:.1} mOhm (Calc.: {:.1} mOhm, Config.: {:.1} mOhm)",
                r, status.calculated_resistance_mohm, status.configured_resistance_mohm
            ),
            None => debug!(
                "[battery guard] Resistance neither calculated ({MIN_RESISTANCE_CALCULATIONS} times) nor configured"
            ),
        }
        debug!(
            "[battery guard] Resistance calc.: {:.1} mOhm (Min: {:.1}, Max: {:.1}, Amount: {})",
            status.calculated_resistance_mohm,
            status.calculated_resistance_min_mohm,
            status.calculated_resistance_max_mohm,
            status.calculation_count
        );
        debug!("[battery guard] Resistance calculation state: {}", status.resistance_state);
        debug!(
            "[battery guard] Voltage resolution: {:.0} mV, Current resolution: {:.0} mA",
            status.voltage_resolution_mv, status.current_resolution_ma
        );
        debug!(
            "[battery guard] Measurement period: {} ms, V-I time stamp delay: {:.0} ms",
            status.measurement_period_ms, status.vi_delay_ms
        );
        debug!(
            "[battery guard] Open circuit voltage not available counter: {}",
            status.ocv_not_available_count
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PERIOD_MS: u64 = 3000;

    /// Alternating samples establishing 15 mV / 80 mA resolution and a 3 s period
    fn warm_up(est: &mut BatteryStateEstimator) -> u64 {
        let mut t = 0;
        for n in 0..8 {
            let (v, i) = if n % 2 == 0 { (13.300, 2.00) } else { (13.315, 2.08) };
            est.ingest_sample(v, i, t);
            t += PERIOD_MS;
        }
        t
    }

    /// Stable low-current pair, a 1.3 A step and 15 s of stable high current.
    /// Returns the timestamp of the next sample.
    fn resistance_cycle(est: &mut BatteryStateEstimator, mut t: u64) -> u64 {
        for _ in 0..2 {
            est.ingest_sample(13.30, 2.0, t);
            t += PERIOD_MS;
        }
        let trigger = t;
        while t <= trigger + EVALUATION_WINDOW_MS {
            est.ingest_sample(13.39, 3.3, t);
            t += PERIOD_MS;
        }
        t
    }

    fn estimator(resistance_ohm: f32) -> BatteryStateEstimator {
        BatteryStateEstimator::new(&BatteryGuardConfig {
            enabled: true,
            internal_resistance_ohm: resistance_ohm,
        })
    }

    #[test]
    fn test_resolution_analysis() {
        let mut est = estimator(0.0);
        assert!(!est.is_resolution_sufficient());

        warm_up(&mut est);

        let status = est.status(21_000);
        assert!((status.voltage_resolution_mv - 15.0).abs() < 0.1);
        assert!((status.current_resolution_ma - 80.0).abs() < 0.1);
        assert!(status.measurement_period_ms <= 4000);
        assert!(est.is_resolution_sufficient());
    }

    #[test]
    fn test_resistance_from_current_step() {
        let mut est = estimator(0.0);
        let t = warm_up(&mut est);
        resistance_cycle(&mut est, t);

        assert_eq!(est.resistance_state(), ResistanceState::Calculated);
        let status = est.status(t);
        assert_eq!(status.calculation_count, 1);
        assert!((status.calculated_resistance_mohm - 69.2).abs() < 0.5);

        // a single calculation is not enough to be trusted
        assert!(!est.is_internal_resistance_calculated());
        assert_eq!(est.internal_resistance(), None);
    }

    #[test]
    fn test_calculated_resistance_after_five_cycles() {
        let mut est = estimator(0.0);
        let mut t = warm_up(&mut est);
        for _ in 0..MIN_RESISTANCE_CALCULATIONS {
            t = resistance_cycle(&mut est, t);
        }

        assert!(est.is_internal_resistance_calculated());
        let r = est.internal_resistance().unwrap();
        assert!((r - 0.0692).abs() < 0.001);
    }

    #[test]
    fn test_resistance_out_of_range_is_rejected() {
        // configured 10 mOhm, measured ~69 mOhm is more than twice as high
        let mut est = estimator(0.010);
        let t = warm_up(&mut est);
        resistance_cycle(&mut est, t);

        assert_eq!(est.resistance_state(), ResistanceState::TooBad);
        assert_eq!(est.status(t).calculation_count, 0);
        assert_eq!(est.internal_resistance(), Some(0.010));
    }

    #[test]
    fn test_small_voltage_step_is_not_enough() {
        let mut est = estimator(0.0);
        let mut t = warm_up(&mut est);
        for _ in 0..2 {
            est.ingest_sample(13.30, 2.0, t);
            t += PERIOD_MS;
        }
        let trigger = t;
        while t <= trigger + EVALUATION_WINDOW_MS {
            est.ingest_sample(13.33, 3.3, t);
            t += PERIOD_MS;
        }

        assert_eq!(est.resistance_state(), ResistanceState::DeltaPower);
        assert_eq!(est.status(t).calculation_count, 0);
    }

    #[test]
    fn test_insufficient_resolution_blocks_calculation() {
        let mut est = estimator(0.0);
        // 10 s period, no fine steps
        for n in 0..10_u64 {
            let (v, i) = if n < 5 { (13.3, 2.0) } else { (13.4, 3.3) };
            est.ingest_sample(v, i, n * 10_000);
        }
        assert_eq!(est.resistance_state(), ResistanceState::Resolution);
        assert_eq!(est.status(100_000).calculation_count, 0);
    }

    #[test]
    fn test_open_circuit_voltage_uses_configured_resistance() {
        let mut est = estimator(0.010);
        est.ingest_sample(13.0, 10.0, 1_000);

        let ocv = est.open_circuit_voltage(5_000).unwrap();
        assert!((ocv - 12.9).abs() < 1e-4);
    }

    #[test]
    fn test_open_circuit_voltage_goes_stale() {
        let mut est = estimator(0.010);
        est.ingest_sample(13.0, -5.0, 1_000);

        assert!(est.open_circuit_voltage(31_000).is_some());
        assert_eq!(est.open_circuit_voltage(31_001), None);
        assert_eq!(est.status(31_001).ocv_not_available_count, 1);
    }

    #[test]
    fn test_open_circuit_voltage_without_resistance() {
        let mut est = estimator(0.0);
        est.ingest_sample(13.0, 1.0, 0);
        assert_eq!(est.open_circuit_voltage(0), None);
    }

    #[test]
    fn test_negative_voltage_is_ignored() {
        let mut est = estimator(0.010);
        est.ingest_sample(-1.0, 1.0, 0);
        assert_eq!(est.open_circuit_voltage(0), None);
        assert!((est.status(0).battery_voltage).abs() < f32::EPSILON);
    }

    struct Readings {
        voltage: Timed<f32>,
        current: Timed<f32>,
    }

    impl BatteryTelemetry for Readings {
        fn voltage(&self) -> Option<Timed<f32>> {
            Some(self.voltage)
        }
        fn current(&self) -> Option<Timed<f32>> {
            Some(self.current)
        }
        fn state_of_charge(&self) -> Option<Timed<f32>> {
            None
        }
        fn discharge_current_limit(&self) -> Option<Timed<f32>> {
            None
        }
        fn immediate_charging_requested(&self) -> bool {
            false
        }
    }

    #[test]
    fn test_poll_skips_duplicates() {
        let mut est = estimator(0.010);
        let readings = Readings {
            voltage: Timed::new(13.0, 1_000),
            current: Timed::new(0.0, 1_000),
        };

        est.poll(&readings);
        est.poll(&readings);
        assert_eq!(est.open_circuit_voltage.count(), 1);
    }

    #[test]
    fn test_poll_pairs_shifted_timestamps() {
        let mut est = estimator(0.010);

        est.poll(&Readings {
            voltage: Timed::new(13.0, 1_000),
            current: Timed::new(1.0, 1_100),
        });
        // first current only, nothing to pair with yet
        assert!(est.open_circuit_voltage.is_empty());

        est.poll(&Readings {
            voltage: Timed::new(13.1, 2_000),
            current: Timed::new(2.0, 2_100),
        });
        // voltage at 2000 is closer to the current at 2100
        assert_eq!(est.open_circuit_voltage.count(), 1);
        assert!((est.open_circuit_voltage.last() - (13.1 - 2.0 * 0.010)).abs() < 1e-4);
        assert!((est.vi_delay.average() - 100.0).abs() < f32::EPSILON);
    }
}
