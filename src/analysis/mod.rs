//! Read-only aggregation over stored run records for the dashboard.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::runner::{RunRecord, RunStatus};

/// Error-category breakdown keyed by substring match on error text.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorCategories {
    pub field: u64,
    pub navigation: u64,
    pub timeout: u64,
    pub validation: u64,
    pub submission: u64,
    pub other: u64,
}

impl ErrorCategories {
    fn add(&mut self, message: &str) {
        let m = message.to_ascii_lowercase();
        if m.contains("field") {
            self.field += 1;
        } else if m.contains("navigation") {
            self.navigation += 1;
        } else if m.contains("timeout") {
            self.timeout += 1;
        } else if m.contains("validation") {
            self.validation += 1;
        } else if m.contains("submission") {
            self.submission += 1;
        } else {
            self.other += 1;
        }
    }
}

/// One calendar day of outcomes.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DayBucket {
    pub date: String,
    pub total: u64,
    pub success: u64,
    pub failed: u64,
    pub completed: u64,
}

/// Full time-range report for the analytics endpoints.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyticsReport {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub total_runs: u64,
    pub successful: u64,
    pub failed: u64,
    pub completed: u64,
    pub running: u64,
    pub avg_duration_ms: f64,
    pub daily: Vec<DayBucket>,
    pub error_categories: ErrorCategories,
}

/// Aggregate runs into a day-bucketed report. Days with no runs still get a
/// zero bucket so dashboard series stay contiguous.
pub fn analyze(runs: &[RunRecord], from: DateTime<Utc>, to: DateTime<Utc>) -> AnalyticsReport {
    let mut buckets: BTreeMap<String, DayBucket> = BTreeMap::new();
    let mut day = from.date_naive();
    let last = to.date_naive();
    // guard against absurd ranges
    let mut remaining = 1000;
    while day <= last && remaining > 0 {
        let key = day.to_string();
        buckets.insert(
            key.clone(),
            DayBucket {
                date: key,
                total: 0,
                success: 0,
                failed: 0,
                completed: 0,
            },
        );
        day += Duration::days(1);
        remaining -= 1;
    }

    let mut categories = ErrorCategories::default();
    let (mut successful, mut failed, mut completed, mut running) = (0u64, 0u64, 0u64, 0u64);
    let (mut duration_sum, mut duration_count) = (0i64, 0u64);

    for run in runs {
        match run.status {
            RunStatus::Success => successful += 1,
            RunStatus::Failed => failed += 1,
            RunStatus::Completed => completed += 1,
            RunStatus::Running => running += 1,
        }

        if let Some(m) = run.metrics {
            duration_sum += m.duration_ms;
            duration_count += 1;
        }

        for err in &run.errors {
            categories.add(err);
        }

        let key = run.start_time.date_naive().to_string();
        if let Some(bucket) = buckets.get_mut(&key) {
            bucket.total += 1;
            match run.status {
                RunStatus::Success => bucket.success += 1,
                RunStatus::Failed => bucket.failed += 1,
                RunStatus::Completed => bucket.completed += 1,
                RunStatus::Running => {}
            }
        }
    }

    AnalyticsReport {
        from,
        to,
        total_runs: runs.len() as u64,
        successful,
        failed,
        completed,
        running,
        avg_duration_ms: if duration_count > 0 {
            duration_sum as f64 / duration_count as f64
        } else {
            0.0
        },
        daily: buckets.into_values().collect(),
        error_categories: categories,
    }
}

/// Summary aggregates over one listing page (the returned page only, not the
/// full filtered set).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PageSummary {
    pub total: u64,
    pub successful: u64,
    pub failed: u64,
    pub avg_duration_ms: f64,
}

pub fn page_summary(runs: &[RunRecord]) -> PageSummary {
    let successful = runs
        .iter()
        .filter(|r| r.status == RunStatus::Success)
        .count() as u64;
    let failed = runs
        .iter()
        .filter(|r| r.status == RunStatus::Failed)
        .count() as u64;
    let durations: Vec<i64> = runs
        .iter()
        .filter_map(|r| r.metrics.map(|m| m.duration_ms))
        .collect();
    PageSummary {
        total: runs.len() as u64,
        successful,
        failed,
        avg_duration_ms: if durations.is_empty() {
            0.0
        } else {
            durations.iter().sum::<i64>() as f64 / durations.len() as f64
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::{FormConfig, RunMetrics};
    use chrono::TimeZone;
    use std::collections::HashMap;

    fn config() -> FormConfig {
        serde_json::from_value(serde_json::json!({
            "fields": [], "submitButtonSelector": "#go"
        }))
        .unwrap()
    }

    fn run_at(day: u32, status: RunStatus, errors: Vec<&str>) -> RunRecord {
        let mut rec = RunRecord::start(None, "https://x.test".into(), config(), HashMap::new());
        rec.start_time = Utc.with_ymd_and_hms(2025, 1, day, 12, 0, 0).unwrap();
        rec.status = status;
        rec.errors = errors.into_iter().map(String::from).collect();
        rec.metrics = Some(RunMetrics {
            duration_ms: 1000,
            fields_processed: 0,
            errors_count: rec.errors.len(),
        });
        rec
    }

    #[test]
    fn buckets_cover_the_whole_range_including_empty_days() {
        let from = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let to = Utc.with_ymd_and_hms(2025, 1, 5, 23, 59, 59).unwrap();
        let runs = vec![
            run_at(1, RunStatus::Success, vec![]),
            run_at(4, RunStatus::Failed, vec!["timeout waiting for success indicator"]),
        ];

        let report = analyze(&runs, from, to);
        assert_eq!(report.daily.len(), 5);
        assert_eq!(report.daily[0].success, 1);
        assert_eq!(report.daily[1].total, 0);
        assert_eq!(report.daily[3].failed, 1);
        assert_eq!(report.total_runs, 2);
        assert_eq!(report.successful, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(report.avg_duration_ms, 1000.0);
    }

    #[test]
    fn error_categorization_by_substring() {
        let mut c = ErrorCategories::default();
        c.add("required field 'email' has no supplied value");
        c.add("navigation to https://x.test failed");
        c.add("timeout waiting for success indicator .welcome");
        c.add("validation rejected the payload");
        c.add("submission was never acknowledged");
        c.add("something exploded");
        assert_eq!(
            c,
            ErrorCategories {
                field: 1,
                navigation: 1,
                timeout: 1,
                validation: 1,
                submission: 1,
                other: 1,
            }
        );
    }

    #[test]
    fn field_takes_precedence_over_later_categories() {
        let mut c = ErrorCategories::default();
        // contains both 'field' and 'timeout'; first match wins
        c.add("field 'email' timeout");
        assert_eq!(c.field, 1);
        assert_eq!(c.timeout, 0);
    }

    #[test]
    fn page_summary_covers_only_the_given_page() {
        let runs = vec![
            run_at(1, RunStatus::Success, vec![]),
            run_at(2, RunStatus::Failed, vec![]),
            run_at(3, RunStatus::Completed, vec![]),
        ];
        let summary = page_summary(&runs);
        assert_eq!(summary.total, 3);
        assert_eq!(summary.successful, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.avg_duration_ms, 1000.0);
    }

    #[test]
    fn empty_input_yields_zeroes() {
        let from = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let report = analyze(&[], from, from);
        assert_eq!(report.total_runs, 0);
        assert_eq!(report.avg_duration_ms, 0.0);
        assert_eq!(report.daily.len(), 1);
    }
}
