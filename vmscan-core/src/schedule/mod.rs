//! Schedule evaluation for scan configurations.
//!
//! [`ScanConfigSchedule::evaluate`] is pure: it classifies a configuration
//! against a window centred on `now` and never mutates anything. Persisting
//! the resulting advancement is the watcher's job.

mod expression;
mod operation_time;
mod window;

use std::fmt;

use chrono::{DateTime, TimeDelta, Utc};
use thiserror::Error;
use vmscan_model::{RuntimeSchedule, ScanConfig, ScanConfigPatch};

pub use expression::CronExpression;
pub use operation_time::OperationTime;
pub use window::ScheduleWindow;

#[derive(Error, Debug)]
pub enum ScheduleError {
    #[error("invalid cron expression `{line}`: {source}")]
    InvalidCron {
        line: String,
        #[source]
        source: cron::error::Error,
    },

    #[error("cron expression `{line}` has {count} fields, expected 5, 6 or 7")]
    FieldCount { line: String, count: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScheduleState {
    /// The configuration is disabled.
    Disabled,
    /// Nothing to schedule: no time at all, or a one-shot time that passed.
    Unscheduled,
    /// The operation time lies after the window.
    NotDue,
    /// The operation time falls inside the window.
    Due,
    /// A recurring operation time fell behind the window.
    Overdue,
}

impl fmt::Display for ScheduleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ScheduleState::Disabled => "Disabled",
            ScheduleState::Unscheduled => "Unscheduled",
            ScheduleState::NotDue => "NotDue",
            ScheduleState::Due => "Due",
            ScheduleState::Overdue => "Overdue",
        })
    }
}

/// Outcome of evaluating one configuration at one instant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanConfigSchedule {
    pub state: ScheduleState,
    pub operation_time: Option<OperationTime>,
    pub window: ScheduleWindow,
}

impl ScanConfigSchedule {
    pub fn evaluate(
        config: &ScanConfig,
        now: DateTime<Utc>,
        window_size: TimeDelta,
    ) -> Result<Self, ScheduleError> {
        let window = ScheduleWindow::new(now, window_size);
        let outcome = |state, operation_time| Self {
            state,
            operation_time,
            window,
        };

        if config.disabled {
            return Ok(outcome(ScheduleState::Disabled, None));
        }

        let cron_line = config.cron_line();
        let one_shot = config.operation_time();
        if cron_line.is_none() && one_shot.is_none() {
            return Ok(outcome(ScheduleState::Unscheduled, None));
        }

        let cron = cron_line.map(CronExpression::parse).transpose()?;
        let op = OperationTime::new(one_shot, cron);
        let t = op.time();

        let state = if window.contains(t) {
            ScheduleState::Due
        } else if window.is_before(t) {
            ScheduleState::NotDue
        } else if op.is_recurring() {
            ScheduleState::Overdue
        } else {
            ScheduleState::Unscheduled
        };

        Ok(outcome(state, Some(op)))
    }

    /// Patch persisting the schedule advancement after this evaluation
    /// fired a scan: recurring configs move to their next tick, one-shot
    /// configs are disabled.
    pub fn after_fire_patch(&self) -> Option<ScanConfigPatch> {
        let op = self.operation_time.as_ref()?;
        if op.is_recurring() {
            Some(ScanConfigPatch::reschedule(runtime_schedule(&op.next())))
        } else {
            Some(ScanConfigPatch::disable())
        }
    }

    /// Patch moving an overdue configuration to its first occurrence at or
    /// after `now`. Missed ticks are dropped.
    pub fn fast_forward_patch(&self, now: DateTime<Utc>) -> Option<ScanConfigPatch> {
        let op = self.operation_time.as_ref()?;
        let advanced = op.next_after(now);
        (advanced.time() != op.time())
            .then(|| ScanConfigPatch::reschedule(runtime_schedule(&advanced)))
    }
}

fn runtime_schedule(op: &OperationTime) -> RuntimeSchedule {
    RuntimeSchedule {
        operation_time: Some(op.time()),
        cron_line: op.cron().map(|cron| cron.source().to_string()),
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn five_minutes() -> TimeDelta {
        TimeDelta::minutes(5)
    }

    fn evaluate(config: &ScanConfig) -> ScanConfigSchedule {
        ScanConfigSchedule::evaluate(config, noon(), five_minutes())
            .expect("schedule evaluates")
    }

    #[test]
    fn hourly_cron_on_the_hour_is_due() {
        let config = ScanConfig::new("hourly").with_schedule(RuntimeSchedule {
            operation_time: Some(noon()),
            cron_line: Some("0 * * * *".into()),
        });

        let schedule = evaluate(&config);

        assert_eq!(schedule.state, ScheduleState::Due);
        let op = schedule.operation_time.as_ref().expect("operation time");
        assert_eq!(op.time(), noon());
        assert_eq!(op.next().time(), noon() + TimeDelta::hours(1));

        let patch = schedule.after_fire_patch().expect("advance patch");
        let rescheduled = patch.scheduled.expect("rescheduled");
        assert_eq!(rescheduled.operation_time, Some(noon() + TimeDelta::hours(1)));
        assert_eq!(rescheduled.cron_line.as_deref(), Some("0 * * * *"));
        assert_eq!(patch.disabled, None);
    }

    #[test]
    fn disabled_configs_short_circuit() {
        let mut config =
            ScanConfig::new("off").with_schedule(RuntimeSchedule::once(noon()));
        config.disabled = true;

        let schedule = evaluate(&config);

        assert_eq!(schedule.state, ScheduleState::Disabled);
        assert!(schedule.operation_time.is_none());
        assert!(schedule.after_fire_patch().is_none());
    }

    #[test]
    fn configs_without_any_time_are_unscheduled() {
        let bare = ScanConfig::new("bare");
        assert_eq!(evaluate(&bare).state, ScheduleState::Unscheduled);

        let blank = ScanConfig::new("blank")
            .with_schedule(RuntimeSchedule::cron("   "));
        assert_eq!(evaluate(&blank).state, ScheduleState::Unscheduled);
    }

    #[test]
    fn one_shot_in_window_fires_then_disables() {
        let config = ScanConfig::new("once").with_schedule(RuntimeSchedule::once(
            noon() + TimeDelta::seconds(90),
        ));

        let schedule = evaluate(&config);

        assert_eq!(schedule.state, ScheduleState::Due);
        assert_eq!(schedule.after_fire_patch(), Some(ScanConfigPatch::disable()));
    }

    #[test]
    fn past_one_shot_is_unscheduled_not_overdue() {
        let config = ScanConfig::new("missed")
            .with_schedule(RuntimeSchedule::once(noon() - TimeDelta::hours(3)));
        assert_eq!(evaluate(&config).state, ScheduleState::Unscheduled);
    }

    #[test]
    fn future_times_beyond_the_window_are_not_due() {
        let one_shot = ScanConfig::new("later")
            .with_schedule(RuntimeSchedule::once(noon() + TimeDelta::hours(2)));
        assert_eq!(evaluate(&one_shot).state, ScheduleState::NotDue);

        let recurring = ScanConfig::new("later-hourly").with_schedule(
            RuntimeSchedule {
                operation_time: Some(noon() + TimeDelta::hours(2)),
                cron_line: Some("0 * * * *".into()),
            },
        );
        assert_eq!(evaluate(&recurring).state, ScheduleState::NotDue);
    }

    #[test]
    fn window_end_belongs_to_the_next_window() {
        let at_end = noon() + five_minutes() / 2;
        let config =
            ScanConfig::new("edge").with_schedule(RuntimeSchedule::once(at_end));
        assert_eq!(evaluate(&config).state, ScheduleState::NotDue);

        let at_start = noon() - five_minutes() / 2;
        let config =
            ScanConfig::new("edge").with_schedule(RuntimeSchedule::once(at_start));
        assert_eq!(evaluate(&config).state, ScheduleState::Due);
    }

    #[test]
    fn stale_recurring_time_is_overdue_and_fast_forwards() {
        let config = ScanConfig::new("stale").with_schedule(RuntimeSchedule {
            operation_time: Some(noon() - TimeDelta::days(2)),
            cron_line: Some("15 * * * *".into()),
        });

        let schedule = evaluate(&config);
        assert_eq!(schedule.state, ScheduleState::Overdue);

        let patch = schedule.fast_forward_patch(noon()).expect("fast-forward");
        let advanced = patch.scheduled.expect("rescheduled");
        let next = advanced.operation_time.expect("operation time");
        assert_eq!(next, noon() + TimeDelta::minutes(15));

        let refreshed = ScanConfig {
            scheduled: Some(advanced),
            ..config
        };
        assert_ne!(evaluate(&refreshed).state, ScheduleState::Overdue);
    }

    #[test]
    fn cron_without_anchor_starts_overdue() {
        let config =
            ScanConfig::new("cron-only").with_schedule(RuntimeSchedule::cron("0 * * * *"));

        let schedule = evaluate(&config);
        assert_eq!(schedule.state, ScheduleState::Overdue);

        let patch = schedule.fast_forward_patch(noon()).expect("fast-forward");
        let advanced = patch.scheduled.expect("rescheduled");
        assert_eq!(advanced.operation_time, Some(noon()));
    }

    #[test]
    fn malformed_cron_is_a_hard_error() {
        let config = ScanConfig::new("broken")
            .with_schedule(RuntimeSchedule::cron("not a valid cron line"));

        let err = ScanConfigSchedule::evaluate(&config, noon(), five_minutes())
            .unwrap_err();

        assert!(matches!(err, ScheduleError::InvalidCron { .. }));
    }

    #[test]
    fn exactly_one_state_per_instant() {
        let config = ScanConfig::new("sweep").with_schedule(RuntimeSchedule {
            operation_time: Some(noon()),
            cron_line: Some("*/10 * * * *".into()),
        });

        for offset in -30..=30 {
            let now = noon() + TimeDelta::minutes(offset);
            let schedule =
                ScanConfigSchedule::evaluate(&config, now, five_minutes())
                    .expect("evaluates");
            let due = schedule.window.contains(noon());
            assert_eq!(schedule.state == ScheduleState::Due, due, "offset {offset}");
            if offset > 3 {
                assert_eq!(schedule.state, ScheduleState::Overdue);
            }
            if offset < -3 {
                assert_eq!(schedule.state, ScheduleState::NotDue);
            }
        }
    }
}
