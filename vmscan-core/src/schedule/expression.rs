use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, TimeDelta, Utc};

use super::ScheduleError;

/// A parsed cron line.
///
/// Accepts the five-field POSIX form (`min hour dom month dow`, Sunday = 0 or
/// 7) as well as the six/seven-field form with a leading seconds field and
/// an optional trailing year.
#[derive(Debug, Clone)]
pub struct CronExpression {
    source: String,
    schedule: cron::Schedule,
}

impl CronExpression {
    pub fn parse(line: &str) -> Result<Self, ScheduleError> {
        let source = line.trim().to_string();
        let normalized = normalize(&source)?;
        let schedule = cron::Schedule::from_str(&normalized).map_err(|err| {
            ScheduleError::InvalidCron {
                line: source.clone(),
                source: err,
            }
        })?;

        Ok(Self { source, schedule })
    }

    /// The line as written by the user.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// First occurrence strictly after `t`.
    pub fn first_after(&self, t: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&t).next()
    }

    /// First occurrence at or after `t`.
    pub fn first_at_or_after(
        &self,
        t: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        // Occurrences land on whole seconds.
        let probe = t - TimeDelta::seconds(1);
        self.schedule.after(&probe).find(|occurrence| *occurrence >= t)
    }

    /// The only occurrence this expression will ever produce, if it is
    /// degenerate (for example pinned to a single year).
    pub fn single_occurrence(&self) -> Option<DateTime<Utc>> {
        let mut occurrences = self.schedule.after(&DateTime::<Utc>::UNIX_EPOCH);
        let first = occurrences.next()?;
        match occurrences.next() {
            Some(_) => None,
            None => Some(first),
        }
    }
}

impl PartialEq for CronExpression {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

impl Eq for CronExpression {}

impl fmt::Display for CronExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

fn normalize(line: &str) -> Result<String, ScheduleError> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    match fields.as_slice() {
        [macro_line] if macro_line.starts_with('@') => Ok(macro_line.to_string()),
        [minute, hour, dom, month, dow] => Ok(format!(
            "0 {minute} {hour} {dom} {month} {}",
            posix_weekdays(dow)
        )),
        fields if fields.len() == 6 || fields.len() == 7 => Ok(fields.join(" ")),
        fields => Err(ScheduleError::FieldCount {
            line: line.to_string(),
            count: fields.len(),
        }),
    }
}

/// Translate a POSIX day-of-week field (Sunday = 0 or 7) into the
/// one-based numbering the parser expects (Sunday = 1).
fn posix_weekdays(field: &str) -> String {
    field
        .split(',')
        .map(posix_weekday_part)
        .collect::<Vec<_>>()
        .join(",")
}

fn posix_weekday_part(part: &str) -> String {
    let (range, step) = match part.split_once('/') {
        Some((range, step)) => (range, Some(step)),
        None => (part, None),
    };

    let mut shifted = match range.split_once('-') {
        Some((lo, "7")) => {
            let mut out = format!("{}-7", shift_weekday(lo));
            if step.is_none() && lo != "0" {
                out.push_str(",1");
            }
            out
        }
        Some((lo, hi)) => format!("{}-{}", shift_weekday(lo), shift_weekday(hi)),
        None => shift_weekday(range),
    };

    if let Some(step) = step {
        shifted.push('/');
        shifted.push_str(step);
    }
    shifted
}

fn shift_weekday(token: &str) -> String {
    match token.parse::<u8>() {
        Ok(day) if day < 7 => (day + 1).to_string(),
        Ok(7) => "1".to_string(),
        _ => token.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Datelike, TimeZone, Weekday};

    use super::*;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn five_field_lines_gain_a_seconds_field() {
        let cron = CronExpression::parse("0 * * * *").expect("hourly");
        let next = cron.first_after(at(2024, 5, 1, 12, 0)).expect("next tick");
        assert_eq!(next, at(2024, 5, 1, 13, 0));
        assert_eq!(cron.source(), "0 * * * *");
    }

    #[test]
    fn posix_weekdays_are_translated() {
        // 2024-05-05 is a Sunday.
        let sunday = at(2024, 5, 5, 0, 30);

        let weekdays = CronExpression::parse("30 9 * * 1-5").expect("weekdays");
        let next = weekdays.first_after(sunday).expect("next weekday");
        assert_eq!(next.weekday(), Weekday::Mon);

        let sundays = CronExpression::parse("0 0 * * 0").expect("sundays");
        let next = sundays.first_after(sunday).expect("next sunday");
        assert_eq!(next.weekday(), Weekday::Sun);

        let weekend = CronExpression::parse("0 0 * * 6-7").expect("weekend");
        let next = weekend.first_after(sunday).expect("next weekend day");
        assert_eq!(next.weekday(), Weekday::Sat);
        let after = weekend.first_after(next).expect("following day");
        assert_eq!(after.weekday(), Weekday::Sun);
    }

    #[test]
    fn six_field_lines_pass_through() {
        let cron = CronExpression::parse("0 0 0 * * *").expect("daily");
        let next = cron.first_after(at(2024, 5, 1, 12, 0)).expect("next");
        assert_eq!(next, at(2024, 5, 2, 0, 0));
    }

    #[test]
    fn first_at_or_after_includes_the_boundary() {
        let cron = CronExpression::parse("0 * * * *").expect("hourly");
        let noon = at(2024, 5, 1, 12, 0);
        assert_eq!(cron.first_at_or_after(noon), Some(noon));
        assert_eq!(
            cron.first_at_or_after(noon + TimeDelta::milliseconds(1)),
            Some(at(2024, 5, 1, 13, 0))
        );
    }

    #[test]
    fn year_pinned_expression_is_single_shot() {
        let cron =
            CronExpression::parse("0 0 9 1 6 * 2031").expect("pinned year");
        assert_eq!(cron.single_occurrence(), Some(at(2031, 6, 1, 9, 0)));

        let hourly = CronExpression::parse("0 * * * *").expect("hourly");
        assert_eq!(hourly.single_occurrence(), None);
    }

    #[test]
    fn malformed_lines_are_rejected() {
        assert!(matches!(
            CronExpression::parse("* * *"),
            Err(ScheduleError::FieldCount { count: 3, .. })
        ));
        assert!(matches!(
            CronExpression::parse("61 * * * *"),
            Err(ScheduleError::InvalidCron { .. })
        ));
    }
}
