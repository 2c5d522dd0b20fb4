//! Timezone-aware schedule evaluation.
//!
//! Cron specs are evaluated structurally: each [`CronField`] is matched
//! against the corresponding component of a candidate local minute, and
//! [`Schedule::next_run_after`] scans forward minute by minute in the
//! task's timezone before converting to UTC.  Intervals advance from the
//! evaluation time, so outages never cause catch-up storms.

use chrono::{DateTime, Datelike, NaiveDateTime, Timelike, Utc};

use super::model::{CronField, CronSpec, Schedule};

/// Parse a timezone name, falling back to UTC.
pub fn parse_tz(tz: &str) -> chrono_tz::Tz {
    tz.parse::<chrono_tz::Tz>().unwrap_or(chrono_tz::UTC)
}

impl CronField {
    /// Whether a time component satisfies this field.  Expression fields
    /// accept `*`, `*/N`, ranges, and comma-separated lists of either.
    pub fn matches(&self, value: u32) -> bool {
        match self {
            CronField::Number(n) => *n == value,
            CronField::Expr(expr) => expr_matches(expr.trim(), value),
        }
    }
}

fn expr_matches(expr: &str, value: u32) -> bool {
    if expr == "*" {
        return true;
    }
    if let Some(step) = expr.strip_prefix("*/") {
        return step
            .parse::<u32>()
            .map(|n| n > 0 && value % n == 0)
            .unwrap_or(false);
    }
    expr.split(',').any(|atom| match atom.split_once('-') {
        Some((lo, hi)) => matches!(
            (lo.parse::<u32>(), hi.parse::<u32>()),
            (Ok(lo), Ok(hi)) if (lo..=hi).contains(&value)
        ),
        None => atom.parse::<u32>().map(|n| n == value).unwrap_or(false),
    })
}

impl CronSpec {
    /// Whether a local minute satisfies every field.  Day-of-week counts
    /// from Sunday = 0.
    pub fn matches_local(&self, dt: &NaiveDateTime) -> bool {
        self.minute.matches(dt.minute())
            && self.hour.matches(dt.hour())
            && self.day_of_month.matches(dt.day())
            && self.month.matches(dt.month())
            && self.day_of_week.matches(dt.weekday().num_days_from_sunday())
    }
}

/// How far ahead the minute scan looks: one year.
const SCAN_LIMIT_MINUTES: i64 = 366 * 24 * 60;

impl Schedule {
    /// Next run strictly after `after`, returned in UTC.
    ///
    /// DST handling for cron: spring-forward gaps are skipped (the local
    /// minute doesn't exist); fall-back overlaps take the earliest
    /// mapping.
    pub fn next_run_after(&self, tz_name: &str, after: &DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Schedule::Interval { interval } => {
                Some(*after + chrono::Duration::seconds(interval.as_seconds() as i64))
            }
            Schedule::Cron { cron } => {
                use chrono::TimeZone;

                let tz = parse_tz(tz_name);
                let local = after.with_timezone(&tz).naive_local();
                let first = local
                    .with_second(0)
                    .and_then(|dt| dt.with_nanosecond(0))
                    .unwrap_or(local)
                    + chrono::Duration::minutes(1);

                (0..SCAN_LIMIT_MINUTES)
                    .map(|offset| first + chrono::Duration::minutes(offset))
                    .filter(|candidate| cron.matches_local(candidate))
                    .find_map(|candidate| match tz.from_local_datetime(&candidate) {
                        chrono::LocalResult::Single(dt) => Some(dt.with_timezone(&Utc)),
                        chrono::LocalResult::Ambiguous(earliest, _) => {
                            Some(earliest.with_timezone(&Utc))
                        }
                        // DST gap — this local minute doesn't exist.
                        chrono::LocalResult::None => None,
                    })
            }
        }
    }
}

/// Compute the next run time for a schedule, in UTC.
pub fn compute_next_run(
    schedule: &Schedule,
    tz_name: &str,
    after: &DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    schedule.next_run_after(tz_name, after)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::scheduler::model::{IntervalSpec, IntervalUnit};
    use chrono::TimeZone;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    fn daily(minute: u32, hour: u32) -> Schedule {
        Schedule::Cron {
            cron: CronSpec {
                minute: CronField::Number(minute),
                hour: CronField::Number(hour),
                day_of_month: CronField::Expr("*".into()),
                month: CronField::Expr("*".into()),
                day_of_week: CronField::Expr("*".into()),
            },
        }
    }

    fn cron(minute: CronField, hour: CronField) -> Schedule {
        Schedule::Cron {
            cron: CronSpec {
                minute,
                hour,
                day_of_month: CronField::Expr("*".into()),
                month: CronField::Expr("*".into()),
                day_of_week: CronField::Expr("*".into()),
            },
        }
    }

    #[test]
    fn field_matching() {
        assert!(CronField::Expr("*".into()).matches(7));
        assert!(CronField::Expr("*/5".into()).matches(10));
        assert!(!CronField::Expr("*/5".into()).matches(7));
        assert!(CronField::Expr("9-17".into()).matches(12));
        assert!(!CronField::Expr("9-17".into()).matches(18));
        assert!(CronField::Expr("0,15,30,45".into()).matches(30));
        assert!(!CronField::Expr("0,15,30,45".into()).matches(20));
        assert!(CronField::Number(9).matches(9));
        assert!(!CronField::Number(9).matches(10));
        // Garbage expressions match nothing rather than everything.
        assert!(!CronField::Expr("not-a-field".into()).matches(0));
    }

    #[test]
    fn spec_matches_all_components() {
        let Schedule::Cron { cron } = daily(30, 9) else {
            unreachable!()
        };
        let dt = utc(2024, 6, 15, 9, 30).naive_utc();
        assert!(cron.matches_local(&dt));
        let wrong_hour = utc(2024, 6, 15, 10, 30).naive_utc();
        assert!(!cron.matches_local(&wrong_hour));
    }

    #[test]
    fn next_occurrence_hourly() {
        let schedule = cron(CronField::Number(30), CronField::Expr("*".into()));
        let next = schedule
            .next_run_after("UTC", &utc(2024, 6, 15, 10, 0))
            .unwrap();
        assert_eq!(next, utc(2024, 6, 15, 10, 30));
    }

    #[test]
    fn next_occurrence_is_strictly_forward() {
        // Evaluating exactly at a matching minute yields the next window.
        let schedule = daily(0, 9);
        let next = schedule
            .next_run_after("UTC", &utc(2024, 6, 15, 9, 0))
            .unwrap();
        assert_eq!(next, utc(2024, 6, 16, 9, 0));
    }

    #[test]
    fn next_occurrence_respects_timezone() {
        // 09:00 Asia/Seoul is 00:00 UTC.
        let next = daily(0, 9)
            .next_run_after("Asia/Seoul", &utc(2024, 6, 15, 1, 0))
            .unwrap();
        assert_eq!(next, utc(2024, 6, 16, 0, 0));
    }

    #[test]
    fn spring_forward_gap_skipped() {
        // US/Eastern 2024-03-10: 02:30 local doesn't exist.
        let next = daily(30, 2)
            .next_run_after("US/Eastern", &utc(2024, 3, 10, 6, 0))
            .unwrap();
        assert_eq!(next.day(), 11);
        assert_eq!(next.hour(), 6);
        assert_eq!(next.minute(), 30);
    }

    #[test]
    fn fall_back_takes_earliest() {
        let next = daily(30, 1)
            .next_run_after("US/Eastern", &utc(2024, 11, 3, 4, 0))
            .unwrap();
        assert_eq!(next.hour(), 5);
        assert_eq!(next.minute(), 30);
    }

    #[test]
    fn invalid_timezone_falls_back_to_utc() {
        let schedule = cron(CronField::Number(30), CronField::Expr("*".into()));
        let next = schedule
            .next_run_after("Not/Real", &utc(2024, 6, 15, 10, 0))
            .unwrap();
        assert_eq!(next, utc(2024, 6, 15, 10, 30));
    }

    #[test]
    fn weekday_range_evaluated_from_sunday() {
        // 2024-06-15 is a Saturday (dow 6); 1-5 excludes it.
        let schedule = Schedule::Cron {
            cron: CronSpec {
                minute: CronField::Number(0),
                hour: CronField::Number(9),
                day_of_month: CronField::Expr("*".into()),
                month: CronField::Expr("*".into()),
                day_of_week: CronField::Expr("1-5".into()),
            },
        };
        let next = schedule
            .next_run_after("UTC", &utc(2024, 6, 14, 10, 0))
            .unwrap();
        // Friday 10:00 → next weekday 09:00 is Monday the 17th.
        assert_eq!(next, utc(2024, 6, 17, 9, 0));
    }

    #[test]
    fn compute_next_run_interval_from_now() {
        let schedule = Schedule::Interval {
            interval: IntervalSpec {
                every: 90,
                unit: IntervalUnit::Minutes,
            },
        };
        let now = utc(2024, 6, 15, 12, 0);
        assert_eq!(
            compute_next_run(&schedule, "UTC", &now).unwrap(),
            utc(2024, 6, 15, 13, 30)
        );
    }
}
