use std::fmt;

use chrono::{DateTime, TimeDelta, Utc};

/// Half-open time interval `[start, end)` centred on an evaluation instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScheduleWindow {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

impl ScheduleWindow {
    /// Window of width `size` centred on `now`.
    pub fn new(now: DateTime<Utc>, size: TimeDelta) -> Self {
        let half = size / 2;
        Self {
            start: now - half,
            end: now + half,
        }
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.end
    }

    pub fn size(&self) -> TimeDelta {
        self.end - self.start
    }

    pub fn contains(&self, t: DateTime<Utc>) -> bool {
        self.start <= t && t < self.end
    }

    /// The whole window lies before `t`.
    pub fn is_before(&self, t: DateTime<Utc>) -> bool {
        self.end <= t
    }

    /// The whole window lies after `t`.
    pub fn is_after(&self, t: DateTime<Utc>) -> bool {
        t < self.start
    }

    /// The adjacent window immediately after this one.
    pub fn next(&self) -> Self {
        let size = self.size();
        Self {
            start: self.end,
            end: self.end + size,
        }
    }

    /// The adjacent window immediately before this one.
    pub fn prev(&self) -> Self {
        let size = self.size();
        Self {
            start: self.start - size,
            end: self.start,
        }
    }
}

impl fmt::Display for ScheduleWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start.to_rfc3339(), self.end.to_rfc3339())
    }
}
