//! Cron expression parsing and next-run computation.
//!
//! Expressions use the classic 5-field form: minute, hour, day-of-month,
//! month, day-of-week (0 = Sunday). Each field reduces to an explicit
//! set of allowed values at parse time, so malformed expressions fail at
//! registration rather than at first use.

use crate::error::{DaemonError, Result};
use chrono::{Datelike, Duration, NaiveDateTime, Timelike};
use std::collections::BTreeSet;

/// Upper bound on the minute-by-minute next-run scan (~4 years).
const MAX_SCAN_MINUTES: u32 = 525_600 * 4;

/// A parsed cron expression.
///
/// All five fields are ANDed when matching, including day-of-month and
/// day-of-week. Classic cron ORs those two when both are restricted;
/// this matcher deliberately does not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    expr: String,
    minutes: BTreeSet<u32>,
    hours: BTreeSet<u32>,
    days: BTreeSet<u32>,
    months: BTreeSet<u32>,
    /// Allowed weekdays, 0 = Sunday.
    weekdays: BTreeSet<u32>,
}

impl CronSchedule {
    /// Parse a 5-field cron expression.
    ///
    /// Supported per field: `*`, `*/N`, `M/N` (stepped from M), `N`,
    /// `N-M` (inclusive), and comma-separated lists.
    ///
    /// # Errors
    ///
    /// Returns [`DaemonError::Config`] on a wrong field count, a
    /// non-numeric token, or a zero step.
    pub fn parse(expr: &str) -> Result<Self> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(DaemonError::Config(format!(
                "invalid cron expression '{expr}': expected 5 fields, got {}",
                fields.len()
            )));
        }

        Ok(Self {
            expr: expr.to_owned(),
            minutes: parse_field(fields[0], 0, 59)?,
            hours: parse_field(fields[1], 0, 23)?,
            days: parse_field(fields[2], 1, 31)?,
            months: parse_field(fields[3], 1, 12)?,
            weekdays: parse_field(fields[4], 0, 6)?,
        })
    }

    /// Returns the original expression string.
    #[must_use]
    pub fn expr(&self) -> &str {
        &self.expr
    }

    /// Returns `true` if the given time matches every field.
    #[must_use]
    pub fn matches(&self, t: NaiveDateTime) -> bool {
        self.minutes.contains(&t.minute())
            && self.hours.contains(&t.hour())
            && self.days.contains(&t.day())
            && self.months.contains(&t.month())
            && self.weekdays.contains(&t.weekday().num_days_from_sunday())
    }

    /// Compute the first matching time strictly after `from`.
    ///
    /// Scans minute-by-minute starting at `from` truncated to the minute
    /// plus one minute. The scan only runs at registration time and once
    /// per task execution, never in a hot path.
    ///
    /// # Errors
    ///
    /// Returns [`DaemonError::Scheduler`] if no match exists within the
    /// ~4 year scan horizon.
    pub fn next_run(&self, from: NaiveDateTime) -> Result<NaiveDateTime> {
        let mut next = truncate_to_minute(from) + Duration::minutes(1);

        for _ in 0..MAX_SCAN_MINUTES {
            if self.matches(next) {
                return Ok(next);
            }
            next += Duration::minutes(1);
        }

        Err(DaemonError::Scheduler(format!(
            "no next run time within 4 years for cron expression '{}'",
            self.expr
        )))
    }
}

impl std::fmt::Display for CronSchedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.expr)
    }
}

/// Drop seconds and sub-second precision.
pub(crate) fn truncate_to_minute(t: NaiveDateTime) -> NaiveDateTime {
    t.with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(t)
}

/// Parse one cron field into its allowed-value set.
fn parse_field(field: &str, min: u32, max: u32) -> Result<BTreeSet<u32>> {
    if field == "*" {
        return Ok((min..=max).collect());
    }

    if let Some((base, step)) = field.split_once('/') {
        let step = parse_number(step, field)?;
        if step == 0 {
            return Err(DaemonError::Config(format!(
                "invalid cron field '{field}': step must be non-zero"
            )));
        }
        let start = if base == "*" {
            min
        } else {
            parse_number(base, field)?
        };
        return Ok((start..=max).step_by(step as usize).collect());
    }

    if field.contains(',') {
        return field
            .split(',')
            .map(|v| parse_number(v, field))
            .collect();
    }

    if let Some((start, end)) = field.split_once('-') {
        let start = parse_number(start, field)?;
        let end = parse_number(end, field)?;
        return Ok((start..=end).collect());
    }

    Ok(BTreeSet::from([parse_number(field, field)?]))
}

fn parse_number(token: &str, field: &str) -> Result<u32> {
    token.trim().parse().map_err(|_| {
        DaemonError::Config(format!(
            "invalid cron field '{field}': '{token}' is not a number"
        ))
    })
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use chrono::NaiveDate;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, mo, d)
            .unwrap()
            .and_hms_opt(h, mi, 0)
            .unwrap()
    }

    #[test]
    fn wildcard_covers_full_range() {
        let set = parse_field("*", 0, 59).unwrap();
        assert_eq!(set.len(), 60);
        assert!(set.contains(&0));
        assert!(set.contains(&59));
    }

    #[test]
    fn step_from_wildcard() {
        let set = parse_field("*/15", 0, 59).unwrap();
        assert_eq!(set, BTreeSet::from([0, 15, 30, 45]));
    }

    #[test]
    fn step_from_offset() {
        let set = parse_field("3/10", 0, 59).unwrap();
        assert_eq!(set, BTreeSet::from([3, 13, 23, 33, 43, 53]));
    }

    #[test]
    fn single_value_and_range_and_list() {
        assert_eq!(parse_field("7", 0, 59).unwrap(), BTreeSet::from([7]));
        assert_eq!(
            parse_field("2-5", 0, 59).unwrap(),
            BTreeSet::from([2, 3, 4, 5])
        );
        assert_eq!(
            parse_field("1,15,45", 0, 59).unwrap(),
            BTreeSet::from([1, 15, 45])
        );
    }

    #[test]
    fn non_numeric_token_is_config_error() {
        assert!(matches!(
            parse_field("abc", 0, 59),
            Err(DaemonError::Config(_))
        ));
        assert!(matches!(
            parse_field("1,x", 0, 59),
            Err(DaemonError::Config(_))
        ));
        assert!(matches!(
            parse_field("*/0", 0, 59),
            Err(DaemonError::Config(_))
        ));
    }

    #[test]
    fn wrong_field_count_is_config_error() {
        assert!(matches!(
            CronSchedule::parse("* * * *"),
            Err(DaemonError::Config(_))
        ));
        assert!(matches!(
            CronSchedule::parse("* * * * * *"),
            Err(DaemonError::Config(_))
        ));
    }

    #[test]
    fn every_15_minutes_across_one_hour() {
        let cron = CronSchedule::parse("*/15 * * * *").unwrap();
        let matching: Vec<u32> = (0..60)
            .filter(|&m| cron.matches(at(2026, 3, 2, 10, m)))
            .collect();
        assert_eq!(matching, vec![0, 15, 30, 45]);
    }

    #[test]
    fn hourly_at_1159_fires_at_noon_then_one_pm() {
        let cron = CronSchedule::parse("0 * * * *").unwrap();
        let noon = cron.next_run(at(2026, 3, 2, 11, 59)).unwrap();
        assert_eq!(noon, at(2026, 3, 2, 12, 0));
        let one = cron.next_run(noon).unwrap();
        assert_eq!(one, at(2026, 3, 2, 13, 0));
    }

    #[test]
    fn next_run_is_strictly_later_and_matches() {
        let exprs = ["* * * * *", "*/5 * * * *", "0 2 * * *", "30 6 1 * *"];
        let from = at(2026, 7, 31, 23, 59);
        for expr in exprs {
            let cron = CronSchedule::parse(expr).unwrap();
            let next = cron.next_run(from).unwrap();
            assert!(next > from, "{expr}: {next} not after {from}");
            assert!(cron.matches(next), "{expr}: {next} does not match");
        }
    }

    #[test]
    fn next_run_truncates_seconds_before_stepping() {
        let cron = CronSchedule::parse("* * * * *").unwrap();
        let from = NaiveDate::from_ymd_opt(2026, 3, 2)
            .unwrap()
            .and_hms_opt(10, 5, 42)
            .unwrap();
        assert_eq!(cron.next_run(from).unwrap(), at(2026, 3, 2, 10, 6));
    }

    #[test]
    fn day_and_weekday_are_both_required() {
        // 13th of the month AND a Friday. 2026-02-13 is a Friday;
        // 2026-01-13 is a Tuesday and must be skipped.
        let cron = CronSchedule::parse("0 0 13 * 5").unwrap();
        let next = cron.next_run(at(2026, 1, 1, 0, 0)).unwrap();
        assert_eq!(next, at(2026, 2, 13, 0, 0));
    }

    #[test]
    fn weekday_zero_is_sunday() {
        let cron = CronSchedule::parse("0 9 * * 0").unwrap();
        // 2026-03-08 is a Sunday.
        assert!(cron.matches(at(2026, 3, 8, 9, 0)));
        // 2026-03-09 is a Monday.
        assert!(!cron.matches(at(2026, 3, 9, 9, 0)));
    }

    #[test]
    fn unsatisfiable_expression_exhausts_horizon() {
        // February 31st never exists.
        let cron = CronSchedule::parse("0 0 31 2 *").unwrap();
        let err = cron.next_run(at(2026, 1, 1, 0, 0)).unwrap_err();
        assert!(matches!(err, DaemonError::Scheduler(_)));
    }

    #[test]
    fn out_of_range_values_parse_but_never_match() {
        // The grammar only rejects structural errors; a minute of 75
        // simply never fires.
        let cron = CronSchedule::parse("75 * * * *").unwrap();
        assert!((0..60).all(|m| !cron.matches(at(2026, 3, 2, 10, m))));
    }
}
