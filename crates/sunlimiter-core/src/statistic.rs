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

//! Running statistics used by the estimators and regulators.

use serde::{Deserialize, Serialize};

/// Number of samples after which `count_total` stops increasing
pub const MAX_TOTAL_COUNT: u32 = 10_000;

/// Numeric types a [`WeightedAverage`] can be built over
pub trait AverageValue: Copy + PartialOrd + Default {
    /// `(avg * (count - 1) + value) / count`
    fn incremental_mean(avg: Self, count: u32, value: Self) -> Self;
}

macro_rules! impl_average_float {
    ($($t:ty),*) => {
        $(impl AverageValue for $t {
            fn incremental_mean(avg: Self, count: u32, value: Self) -> Self {
                let n = count as $t;
                (avg * (n - 1.0) + value) / n
            }
        })*
    };
}

macro_rules! impl_average_unsigned {
    ($($t:ty),*) => {
        $(impl AverageValue for $t {
            fn incremental_mean(avg: Self, count: u32, value: Self) -> Self {
                let n = u128::from(count);
                ((u128::from(avg) * (n - 1) + u128::from(value)) / n) as $t
            }
        })*
    };
}

impl_average_float!(f32, f64);
impl_average_unsigned!(u16, u32, u64);

/// Incremental mean over a window of `factor` samples.
///
/// For the first `factor` samples this is a plain average, afterwards each new
/// sample is weighted with `1/factor` (exponential smoothing). Min, max and the
/// last value are tracked alongside.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WeightedAverage<T> {
    factor: u32,
    count: u32,
    count_total: u32,
    avg: T,
    min: T,
    max: T,
    last: T,
}

impl<T: AverageValue> WeightedAverage<T> {
    pub fn new(factor: u32) -> Self {
        Self {
            factor: factor.max(1),
            count: 0,
            count_total: 0,
            avg: T::default(),
            min: T::default(),
            max: T::default(),
            last: T::default(),
        }
    }

    pub fn add(&mut self, value: T) {
        if self.count == 0 {
            self.count = 1;
            self.count_total = 1;
            self.avg = value;
            self.min = value;
            self.max = value;
        } else {
            if self.count < self.factor {
                self.count += 1;
            }
            self.avg = T::incremental_mean(self.avg, self.count, value);
            if value < self.min {
                self.min = value;
            }
            if value > self.max {
                self.max = value;
            }
            if self.count_total < MAX_TOTAL_COUNT {
                self.count_total += 1;
            }
        }
        self.last = value;
    }

    /// Forget everything
    pub fn reset(&mut self) {
        *self = Self::new(self.factor);
    }

    /// Forget everything and seed with `value`
    pub fn reset_to(&mut self, value: T) {
        self.reset();
        self.add(value);
    }

    pub fn average(&self) -> T {
        self.avg
    }

    pub fn min(&self) -> T {
        self.min
    }

    pub fn max(&self) -> T {
        self.max
    }

    pub fn last(&self) -> T {
        self.last
    }

    /// Number of added samples, saturating at [`MAX_TOTAL_COUNT`]
    pub fn count(&self) -> u32 {
        self.count_total
    }

    pub fn is_empty(&self) -> bool {
        self.count_total == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_sample_initializes_everything() {
        let mut avg = WeightedAverage::<f32>::new(10);
        assert!(avg.is_empty());

        avg.add(3.5);
        assert_eq!(avg.count(), 1);
        assert!((avg.average() - 3.5).abs() < f32::EPSILON);
        assert!((avg.min() - 3.5).abs() < f32::EPSILON);
        assert!((avg.max() - 3.5).abs() < f32::EPSILON);
        assert!((avg.last() - 3.5).abs() < f32::EPSILON);
    }

    #[test]
    fn test_plain_average_within_window() {
        let mut avg = WeightedAverage::<f32>::new(5);
        for v in [1.0, 2.0, 3.0, 4.0, 5.0] {
            avg.add(v);
        }
        assert!((avg.average() - 3.0).abs() < 1e-5);
        assert!((avg.min() - 1.0).abs() < f32::EPSILON);
        assert!((avg.max() - 5.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_exponential_weight_after_window() {
        let mut avg = WeightedAverage::<f32>::new(2);
        avg.add(0.0);
        avg.add(10.0);
        // window full, each new sample weighs 1/2
        avg.add(20.0);
        assert!((avg.average() - 12.5).abs() < 1e-5);
        assert_eq!(avg.count(), 3);
    }

    #[test]
    fn test_count_saturates_and_average_stays_in_bounds() {
        let mut avg = WeightedAverage::<f32>::new(20);
        for i in 0..12_000_u32 {
            let v = ((i * 37) % 101) as f32 - 50.0;
            avg.add(v);
            assert!(avg.average() >= avg.min() - 1e-3);
            assert!(avg.average() <= avg.max() + 1e-3);
        }
        assert_eq!(avg.count(), MAX_TOTAL_COUNT);
    }

    #[test]
    fn test_integer_average_and_reseed() {
        let mut period = WeightedAverage::<u32>::new(20);
        period.reset_to(10_000);
        assert_eq!(period.count(), 1);
        period.add(2_000);
        assert_eq!(period.average(), 6_000);
        assert_eq!(period.min(), 2_000);

        period.reset();
        assert!(period.is_empty());
        assert_eq!(period.average(), 0);
    }
}
