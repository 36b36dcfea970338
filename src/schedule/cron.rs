//! Cron expression derivation, validation, and next-run evaluation.
//!
//! Schedules store a bare 6-field AWS-style cron body
//! (`minute hour day-of-month month day-of-week year`). The `cron(...)`
//! wrapper is added by the timer adapter at the rule boundary.

use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use cron::Schedule as CronSchedule;

use super::{Frequency, ScheduleError};

const WEEKDAY_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

/// Accept only the five enumerated frequencies; `custom` additionally
/// requires a valid 6-field expression.
pub fn validate_frequency(frequency: Frequency, custom_expr: Option<&str>) -> bool {
    match frequency {
        Frequency::Custom => custom_expr.is_some_and(is_valid_cron_expression),
        _ => true,
    }
}

/// Validate an AWS-style 6-field cron body: per-position character classes,
/// and exactly one of day-of-month / day-of-week equal to `?`.
pub fn is_valid_cron_expression(expr: &str) -> bool {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    if fields.len() != 6 {
        return false;
    }

    const BASE: &str = "0123456789,-*/";
    let field_ok = |field: &str, extra: &str| -> bool {
        field
            .chars()
            .all(|c| BASE.contains(c) || extra.contains(c))
    };

    let dow_ok = |field: &str| -> bool {
        field_ok(field, "?L#") || WEEKDAY_NAMES.contains(&field.to_ascii_uppercase().as_str())
    };

    if !field_ok(fields[0], "") // minute
        || !field_ok(fields[1], "") // hour
        || !field_ok(fields[2], "?LW") // day-of-month
        || !field_ok(fields[3], "") // month
        || !dow_ok(fields[4]) // day-of-week
        || !field_ok(fields[5], "")
    // year
    {
        return false;
    }

    // Exactly one of day-of-month / day-of-week must be '?'.
    (fields[2] == "?") != (fields[4] == "?")
}

/// Derive the stored cron body from a frequency selection.
///
/// Weekly is always Monday and monthly always the 1st; only the time of day
/// is caller-controlled. The UI has never offered a day picker, so the
/// narrow mapping is the product behavior.
pub fn derive_cron_expression(
    frequency: Frequency,
    custom_expr: Option<&str>,
    specific_time: Option<&str>,
) -> Result<String, ScheduleError> {
    let (hour, minute) = parse_specific_time(specific_time)?;

    let expr = match frequency {
        Frequency::Hourly => "0 * * * ? *".to_string(),
        Frequency::Daily => format!("{} {} * * ? *", minute, hour),
        Frequency::Weekly => format!("{} {} ? * MON *", minute, hour),
        Frequency::Monthly => format!("{} {} 1 * ? *", minute, hour),
        Frequency::Custom => custom_expr
            .ok_or_else(|| {
                ScheduleError::Validation(
                    "custom frequency requires a cron expression".to_string(),
                )
            })?
            .trim()
            .to_string(),
    };

    Ok(expr)
}

/// Split an optional "HH:MM" wall-clock time; absent defaults to midnight.
fn parse_specific_time(specific_time: Option<&str>) -> Result<(u32, u32), ScheduleError> {
    let raw = match specific_time {
        Some(s) if !s.trim().is_empty() => s.trim(),
        _ => "00:00",
    };

    let invalid =
        || ScheduleError::Validation(format!("invalid specificTime '{}', expected HH:MM", raw));

    let (h, m) = raw.split_once(':').ok_or_else(invalid)?;
    let hour: u32 = h.parse().map_err(|_| invalid())?;
    let minute: u32 = m.parse().map_err(|_| invalid())?;
    if hour > 23 || minute > 59 {
        return Err(invalid());
    }
    Ok((hour, minute))
}

/// Compute the next fire time strictly after `now`.
///
/// The stored 6-field body is evaluated for real by the `cron` crate (seconds
/// field prepended). Expressions the crate cannot parse (AWS `L`/`W`/`#`
/// forms) fall back to `now + 24h`, the documented degraded behavior.
pub fn next_run_time(cron_expr: &str, now: DateTime<Utc>) -> DateTime<Utc> {
    let seven_field = format!("0 {}", cron_expr.trim());
    match CronSchedule::from_str(&seven_field) {
        Ok(schedule) => schedule
            .after(&now)
            .next()
            .unwrap_or_else(|| now + Duration::hours(24)),
        Err(e) => {
            tracing::debug!(expr = %cron_expr, error = %e, "cron evaluation failed, using 24h fallback");
            now + Duration::hours(24)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn derived_expressions_have_six_fields_and_one_question_mark() {
        for freq in [
            Frequency::Hourly,
            Frequency::Daily,
            Frequency::Weekly,
            Frequency::Monthly,
        ] {
            let expr = derive_cron_expression(freq, None, Some("08:30")).unwrap();
            let fields: Vec<&str> = expr.split_whitespace().collect();
            assert_eq!(fields.len(), 6, "{}: {}", freq, expr);
            let marks = (fields[2] == "?") as u32 + (fields[4] == "?") as u32;
            assert_eq!(marks, 1, "{}: {}", freq, expr);
            assert!(is_valid_cron_expression(&expr), "{}: {}", freq, expr);
        }
    }

    #[test]
    fn hourly_ignores_specific_time() {
        let expr = derive_cron_expression(Frequency::Hourly, None, Some("17:45")).unwrap();
        assert_eq!(expr, "0 * * * ? *");
    }

    #[test]
    fn specific_time_defaults_to_midnight() {
        let expr = derive_cron_expression(Frequency::Daily, None, None).unwrap();
        assert_eq!(expr, "0 0 * * ? *");
    }

    #[test]
    fn malformed_specific_time_is_a_validation_error() {
        assert!(matches!(
            derive_cron_expression(Frequency::Daily, None, Some("8am")),
            Err(ScheduleError::Validation(_))
        ));
        assert!(matches!(
            derive_cron_expression(Frequency::Daily, None, Some("25:00")),
            Err(ScheduleError::Validation(_))
        ));
    }

    #[test]
    fn custom_expression_is_used_verbatim() {
        let expr =
            derive_cron_expression(Frequency::Custom, Some("*/15 2 * * ? *"), None).unwrap();
        assert_eq!(expr, "*/15 2 * * ? *");
    }

    #[test]
    fn validation_rejects_wrong_field_count() {
        assert!(!is_valid_cron_expression("0 * * * ?"));
        assert!(!is_valid_cron_expression("0 * * * ? * *"));
        assert!(!is_valid_cron_expression(""));
    }

    #[test]
    fn validation_enforces_exactly_one_question_mark() {
        // both
        assert!(!is_valid_cron_expression("0 12 ? * ? *"));
        // neither
        assert!(!is_valid_cron_expression("0 12 * * * *"));
        // one, either side
        assert!(is_valid_cron_expression("0 12 * * ? *"));
        assert!(is_valid_cron_expression("0 12 ? * MON *"));
    }

    #[test]
    fn validation_rejects_stray_characters() {
        assert!(!is_valid_cron_expression("a * * * ? *"));
        assert!(!is_valid_cron_expression("0 * L * ? x"));
        // L/W belong to day-of-month only
        assert!(is_valid_cron_expression("0 12 L * ? *"));
        assert!(!is_valid_cron_expression("0 L * * ? *"));
    }

    #[test]
    fn validate_frequency_gates_custom_on_expression() {
        assert!(validate_frequency(Frequency::Daily, None));
        assert!(!validate_frequency(Frequency::Custom, None));
        assert!(!validate_frequency(Frequency::Custom, Some("not cron")));
        assert!(validate_frequency(Frequency::Custom, Some("0 12 * * ? *")));
    }

    #[test]
    fn hourly_next_run_is_start_of_next_hour() {
        let now = utc(2025, 1, 1, 10, 37, 0);
        let next = next_run_time("0 * * * ? *", now);
        assert_eq!(next, utc(2025, 1, 1, 11, 0, 0));
    }

    #[test]
    fn daily_next_run_advances_a_day_when_slot_has_passed() {
        let now = utc(2025, 1, 1, 9, 0, 0);
        let next = next_run_time("0 8 * * ? *", now);
        assert_eq!(next, utc(2025, 1, 2, 8, 0, 0));
    }

    #[test]
    fn daily_next_run_is_today_when_slot_is_ahead() {
        let now = utc(2025, 1, 1, 5, 0, 0);
        let next = next_run_time("0 8 * * ? *", now);
        assert_eq!(next, utc(2025, 1, 1, 8, 0, 0));
    }

    #[test]
    fn weekly_next_run_lands_on_monday() {
        // 2025-01-01 is a Wednesday; the next Monday is 2025-01-06.
        let now = utc(2025, 1, 1, 12, 0, 0);
        let next = next_run_time("30 9 ? * MON *", now);
        assert_eq!(next, utc(2025, 1, 6, 9, 30, 0));
    }

    #[test]
    fn monthly_next_run_is_the_first_of_next_month() {
        let now = utc(2025, 1, 15, 12, 0, 0);
        let next = next_run_time("0 6 1 * ? *", now);
        assert_eq!(next, utc(2025, 2, 1, 6, 0, 0));
    }

    #[test]
    fn custom_expressions_are_evaluated_for_real() {
        let now = utc(2025, 1, 1, 10, 7, 0);
        let next = next_run_time("*/15 * * * ? *", now);
        assert_eq!(next, utc(2025, 1, 1, 10, 15, 0));
    }

    #[test]
    fn unparseable_expression_falls_back_to_24h() {
        let now = utc(2025, 1, 1, 10, 0, 0);
        // 'L' passes surface validation but the evaluator cannot handle it
        let next = next_run_time("0 12 L * ? *", now);
        assert_eq!(next, now + Duration::hours(24));
    }
}
