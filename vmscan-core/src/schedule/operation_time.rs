use std::fmt;

use chrono::{DateTime, Utc};

use super::expression::CronExpression;

/// A concrete operation instant plus the cron expression, if any, that
/// generates its successors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationTime {
    time: DateTime<Utc>,
    cron: Option<CronExpression>,
}

impl OperationTime {
    /// Build from an optional anchor time and an optional cron.
    ///
    /// A missing anchor falls back to the Unix epoch. A cron that only ever
    /// fires once pins the time to that single occurrence.
    pub fn new(time: Option<DateTime<Utc>>, cron: Option<CronExpression>) -> Self {
        let time = cron
            .as_ref()
            .and_then(CronExpression::single_occurrence)
            .or(time)
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);

        Self { time, cron }
    }

    pub fn time(&self) -> DateTime<Utc> {
        self.time
    }

    pub fn cron(&self) -> Option<&CronExpression> {
        self.cron.as_ref()
    }

    /// The next occurrence strictly after this one, or `self` unchanged when
    /// there is none.
    pub fn next(&self) -> Self {
        match self.cron.as_ref().and_then(|c| c.first_after(self.time)) {
            Some(time) => Self {
                time,
                cron: self.cron.clone(),
            },
            None => self.clone(),
        }
    }

    /// The first occurrence at or after `t`. Times already at or past `t`,
    /// and times without a cron, are returned unchanged.
    pub fn next_after(&self, t: DateTime<Utc>) -> Self {
        if self.time >= t {
            return self.clone();
        }
        match self.cron.as_ref().and_then(|c| c.first_at_or_after(t)) {
            Some(time) => Self {
                time,
                cron: self.cron.clone(),
            },
            None => self.clone(),
        }
    }

    pub fn is_recurring(&self) -> bool {
        self.next().time > self.time
    }
}

impl fmt::Display for OperationTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.time.to_rfc3339())
    }
}
