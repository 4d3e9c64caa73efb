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

//! Daily restart of the inverters drawing from the battery.

use chrono::{NaiveTime, Timelike};
use tracing::{debug, info};

const MINUTES_PER_DAY: u32 = 24 * 60;

#[derive(Debug)]
pub struct RestartSchedule {
    /// Local hour of the restart, `None` = no automatic restarts
    hour: Option<u8>,
    due_ms: Option<u64>,
    /// The next restart has to be calculated once the wall clock is known
    stale: bool,
}

impl RestartSchedule {
    pub fn new(hour: Option<u8>) -> Self {
        Self {
            hour,
            due_ms: None,
            stale: true,
        }
    }

    pub fn update_config(&mut self, hour: Option<u8>) {
        self.hour = hour;
        self.due_ms = None;
        self.stale = true;
    }

    pub fn is_stale(&self) -> bool {
        self.stale
    }

    /// Plan the next restart. `applies` is false without battery or
    /// smart-buffer powered inverters.
    pub fn plan(&mut self, applies: bool, local_time: NaiveTime, now_ms: u64) {
        self.stale = false;
        self.due_ms = None;

        let Some(hour) = self.hour.filter(|_| applies) else {
            debug!("[limiter] automatic inverter restart disabled");
            return;
        };

        let minutes = minutes_until(local_time, hour);
        self.due_ms = Some(now_ms + u64::from(minutes) * 60 * 1000);
        info!(
            "[limiter] next inverter restart at {:02}:00 local time, in {} minutes",
            hour, minutes
        );
    }

    pub fn is_due(&self, now_ms: u64) -> bool {
        self.due_ms.is_some_and(|due| now_ms >= due)
    }

    pub fn due_ms(&self) -> Option<u64> {
        self.due_ms
    }
}

/// Minutes from `now` to the next full `hour`, the same hour means tomorrow
fn minutes_until(now: NaiveTime, hour: u8) -> u32 {
    let day_minutes = now.hour() * 60 + now.minute();
    let target = u32::from(hour) * 60;
    if u32::from(hour) > now.hour() {
        target - day_minutes
    } else {
        MINUTES_PER_DAY - day_minutes + target
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn time(hour: u32, minute: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(hour, minute, 0).unwrap()
    }

    #[test]
    fn test_minutes_until() {
        assert_eq!(minutes_until(time(1, 30), 3), 90);
        assert_eq!(minutes_until(time(3, 0), 3), 1440);
        assert_eq!(minutes_until(time(3, 10), 3), 1430);
        assert_eq!(minutes_until(time(23, 59), 0), 1);
    }

    #[test]
    fn test_plan_and_due() {
        let mut schedule = RestartSchedule::new(Some(4));
        assert!(schedule.is_stale());

        schedule.plan(true, time(2, 0), 5_000);
        assert!(!schedule.is_stale());
        assert_eq!(schedule.due_ms(), Some(5_000 + 2 * 3_600_000));
        assert!(!schedule.is_due(7_204_999));
        assert!(schedule.is_due(7_205_000));
    }

    #[test]
    fn test_disabled_schedule() {
        let mut schedule = RestartSchedule::new(None);
        schedule.plan(true, time(2, 0), 0);
        assert_eq!(schedule.due_ms(), None);

        // only solar-powered inverters
        schedule.update_config(Some(4));
        schedule.plan(false, time(2, 0), 0);
        assert!(!schedule.is_due(u64::MAX));
    }
}
