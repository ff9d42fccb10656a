//! Standard 5-field cron expressions on top of the `cron` crate.
//!
//! The crate expects a leading seconds field and numbers weekdays 1-7 from
//! Sunday, while standard cron numbers them 0-7 with both 0 and 7 meaning
//! Sunday. Expressions are rewritten before parsing.
//!
//! When both day fields are restricted, standard cron fires on a day matching
//! either of them, whereas the crate requires both to match. Such expressions
//! are split into a day-of-month schedule and a day-of-week schedule.

use chrono::{DateTime, Utc};
use cron::Schedule;
use std::str::FromStr;

use crate::errors::{AppError, Result};

fn invalid(expr: &str, reason: impl Into<String>) -> AppError {
    AppError::InvalidScheduleExpr {
        expr: expr.to_string(),
        reason: reason.into(),
    }
}

#[derive(Debug, Clone)]
pub struct CronSchedule {
    primary: Schedule,
    by_weekday: Option<Schedule>,
}

impl CronSchedule {
    /// First run strictly after `after`.
    pub fn next_after(&self, after: &DateTime<Utc>) -> Option<DateTime<Utc>> {
        let first = self.primary.after(after).next();
        let second = self
            .by_weekday
            .as_ref()
            .and_then(|schedule| schedule.after(after).next());
        match (first, second) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}

/// Parses a standard cron expression (`min hour dom month dow`, or one of the
/// `@hourly`-style shorthands).
pub fn parse(expr: &str) -> Result<CronSchedule> {
    let translated = translate(expr)?;
    let compile = |source: &str| Schedule::from_str(source).map_err(|e| invalid(expr, e.to_string()));

    let fields: Vec<&str> = translated.split_whitespace().collect();
    match fields.as_slice() {
        [sec, min, hour, dom, month, dow] if restricted(dom) && restricted(dow) => {
            Ok(CronSchedule {
                primary: compile(&format!("{sec} {min} {hour} {dom} {month} *"))?,
                by_weekday: Some(compile(&format!("{sec} {min} {hour} * {month} {dow}"))?),
            })
        }
        _ => Ok(CronSchedule {
            primary: compile(&translated)?,
            by_weekday: None,
        }),
    }
}

fn restricted(field: &str) -> bool {
    field != "*" && field != "?"
}

fn translate(expr: &str) -> Result<String> {
    let trimmed = expr.trim();
    if trimmed.starts_with('@') {
        let full = match trimmed {
            "@yearly" | "@annually" => "0 0 0 1 1 *",
            "@monthly" => "0 0 0 1 * *",
            "@weekly" => "0 0 0 * * 1",
            "@daily" | "@midnight" => "0 0 0 * * *",
            "@hourly" => "0 0 * * * *",
            _ => return Err(invalid(expr, "unknown shorthand")),
        };
        return Ok(full.to_string());
    }

    let fields: Vec<&str> = trimmed.split_whitespace().collect();
    if fields.len() != 5 {
        return Err(invalid(
            expr,
            format!("expected 5 fields, found {}", fields.len()),
        ));
    }
    let day_of_week = translate_day_of_week(expr, fields[4])?;
    Ok(format!(
        "0 {} {} {} {} {}",
        fields[0], fields[1], fields[2], fields[3], day_of_week
    ))
}

fn translate_day_of_week(expr: &str, field: &str) -> Result<String> {
    field
        .split(',')
        .map(|item| {
            let (range, step) = match item.split_once('/') {
                Some((range, step)) => (range, Some(step)),
                None => (item, None),
            };
            let translated = match range.split_once('-') {
                Some((start, end)) => match (weekday(expr, start)?, weekday(expr, end)?) {
                    (Some(0), Some(7)) => "1-7".to_string(),
                    // Ranges ending on Sunday wrap around in the target numbering.
                    (Some(a), Some(7)) if step.is_none() => {
                        if a == 6 {
                            "7,1".to_string()
                        } else {
                            format!("{}-7,1", a + 1)
                        }
                    }
                    (Some(_), Some(7)) => {
                        return Err(invalid(expr, "stepped weekday range ending on 7"));
                    }
                    (Some(a), Some(b)) => format!("{}-{}", a + 1, b + 1),
                    _ => range.to_string(),
                },
                None => match weekday(expr, range)? {
                    Some(n) => (n % 7 + 1).to_string(),
                    None => range.to_string(),
                },
            };
            Ok(match step {
                Some(step) => format!("{}/{}", translated, step),
                None => translated,
            })
        })
        .collect::<Result<Vec<_>>>()
        .map(|items| items.join(","))
}

/// Numeric weekday token, or `None` for `*` and names like `MON`.
fn weekday(expr: &str, token: &str) -> Result<Option<u8>> {
    if token.is_empty() || !token.chars().all(|c| c.is_ascii_digit()) {
        return Ok(None);
    }
    match token.parse::<u8>() {
        Ok(n) if n <= 7 => Ok(Some(n)),
        _ => Err(invalid(expr, format!("day of week {} is out of range 0-7", token))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, TimeZone, Timelike, Utc, Weekday};

    #[test]
    fn five_fields_gain_a_seconds_column() {
        assert_eq!(translate("0 0 * * *").unwrap(), "0 0 0 * * *");
        assert_eq!(translate("*/15 9-17 * * 1-5").unwrap(), "0 */15 9-17 * * 2-6");
        assert_eq!(translate("  30 2 1 * *  ").unwrap(), "0 30 2 1 * *");
    }

    #[test]
    fn weekday_numbers_are_shifted() {
        assert_eq!(translate("0 0 * * 0").unwrap(), "0 0 0 * * 1");
        assert_eq!(translate("0 0 * * 7").unwrap(), "0 0 0 * * 1");
        assert_eq!(translate("0 0 * * 0-6").unwrap(), "0 0 0 * * 1-7");
        assert_eq!(translate("0 0 * * 5-7").unwrap(), "0 0 0 * * 6-7,1");
        assert_eq!(translate("0 0 * * 1,3,5").unwrap(), "0 0 0 * * 2,4,6");
        assert_eq!(translate("0 0 * * */2").unwrap(), "0 0 0 * * */2");
        assert_eq!(translate("0 0 * * MON").unwrap(), "0 0 0 * * MON");
    }

    #[test]
    fn sunday_expression_fires_on_sunday() {
        let schedule = parse("30 4 * * 0").unwrap();
        let start = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(); // Wednesday
        let next = schedule.next_after(&start).unwrap();
        assert_eq!(next.weekday(), Weekday::Sun);
        assert_eq!((next.hour(), next.minute()), (4, 30));
    }

    #[test]
    fn daily_midnight_is_accepted() {
        let schedule = parse("0 0 * * *").unwrap();
        let start = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        let next = schedule.next_after(&start).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 6, 2, 0, 0, 0).unwrap());
        assert!(parse("@daily").is_ok());
    }

    #[test]
    fn restricted_day_fields_match_either_day() {
        let schedule = parse("0 0 1 * 1").unwrap();
        let wednesday = Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap();
        assert_eq!(
            schedule.next_after(&wednesday),
            Some(Utc.with_ymd_and_hms(2025, 1, 6, 0, 0, 0).unwrap())
        );
        // Saturday the 1st comes before the next Monday.
        let monday = Utc.with_ymd_and_hms(2025, 1, 27, 12, 0, 0).unwrap();
        assert_eq!(
            schedule.next_after(&monday),
            Some(Utc.with_ymd_and_hms(2025, 2, 1, 0, 0, 0).unwrap())
        );
    }

    #[test]
    fn a_wildcard_day_field_keeps_the_other_one_strict() {
        let first_of_month = parse("0 0 1 * *").unwrap();
        let start = Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap();
        assert_eq!(
            first_of_month.next_after(&start),
            Some(Utc.with_ymd_and_hms(2025, 2, 1, 0, 0, 0).unwrap())
        );
        let weekdays = parse("0 9 * * 1-5").unwrap();
        let saturday = Utc.with_ymd_and_hms(2025, 1, 4, 12, 0, 0).unwrap();
        assert_eq!(
            weekdays.next_after(&saturday),
            Some(Utc.with_ymd_and_hms(2025, 1, 6, 9, 0, 0).unwrap())
        );
    }

    #[test]
    fn malformed_expressions_are_validation_errors() {
        for expr in ["invalid cron", "", "* * * *", "0 0 0 * * *", "61 * * * *", "0 0 * * 8", "@often"] {
            let err = parse(expr).unwrap_err();
            assert!(err.is_validation(), "{expr:?} should be rejected");
        }
    }
}
