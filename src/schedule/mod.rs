//! Recurring test schedules -- cron derivation, lifecycle, timer linkage.

pub mod cron;
pub mod lifecycle;
pub mod sweep;
pub mod timer;

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::runner::FormConfig;

pub use self::lifecycle::ScheduleManager;

#[derive(Debug, Error)]
pub enum ScheduleError {
    /// Bad caller input; reported verbatim, never retried.
    #[error("{0}")]
    Validation(String),

    #[error("schedule {0} not found")]
    NotFound(Uuid),

    /// The record changed between read and guarded write.
    #[error("schedule {0} was modified concurrently")]
    Conflict(Uuid),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl From<rusqlite::Error> for ScheduleError {
    fn from(e: rusqlite::Error) -> Self {
        ScheduleError::Storage(e.into())
    }
}

impl From<r2d2::Error> for ScheduleError {
    fn from(e: r2d2::Error) -> Self {
        ScheduleError::Storage(e.into())
    }
}

/// Coarse recurrence category from which a cron expression is derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Frequency {
    Hourly,
    Daily,
    Weekly,
    Monthly,
    Custom,
}

impl Frequency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Frequency::Hourly => "hourly",
            Frequency::Daily => "daily",
            Frequency::Weekly => "weekly",
            Frequency::Monthly => "monthly",
            Frequency::Custom => "custom",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "hourly" => Some(Frequency::Hourly),
            "daily" => Some(Frequency::Daily),
            "weekly" => Some(Frequency::Weekly),
            "monthly" => Some(Frequency::Monthly),
            "custom" => Some(Frequency::Custom),
            _ => None,
        }
    }
}

impl std::fmt::Display for Frequency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Run counters. `total == success + failed` always holds because all three
/// are bumped in one statement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleStats {
    pub total: i64,
    pub success: i64,
    pub failed: i64,
}

/// A persisted recurring-test configuration plus its timer linkage and run
/// history summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schedule {
    pub id: Uuid,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub url: String,
    pub form_config: FormConfig,
    pub user_data: HashMap<String, serde_json::Value>,
    pub frequency: Frequency,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub specific_time: Option<String>,
    /// Derived 6-field AWS-style cron body, always present.
    pub cron_expression: String,
    pub active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule_arn: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_run_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_run_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_test_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_test_status: Option<String>,
    /// Ids of runs produced by this schedule, oldest first.
    pub runs: Vec<Uuid>,
    pub stats: ScheduleStats,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Optimistic concurrency version, bumped on every mutation.
    pub version: i64,
}

/// Creation payload.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSchedule {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub url: String,
    pub form_config: FormConfig,
    pub user_data: HashMap<String, serde_json::Value>,
    pub frequency: Frequency,
    /// Required when frequency is `custom`.
    #[serde(default)]
    pub cron_expression: Option<String>,
    #[serde(default)]
    pub specific_time: Option<String>,
    /// Defaults to active.
    #[serde(default)]
    pub active: Option<bool>,
}

/// Partial update payload; only supplied fields are applied.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleUpdate {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub form_config: Option<FormConfig>,
    #[serde(default)]
    pub user_data: Option<HashMap<String, serde_json::Value>>,
    #[serde(default)]
    pub frequency: Option<Frequency>,
    #[serde(default)]
    pub cron_expression: Option<String>,
    #[serde(default)]
    pub specific_time: Option<String>,
    #[serde(default)]
    pub active: Option<bool>,
}

impl ScheduleUpdate {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.description.is_none()
            && self.url.is_none()
            && self.form_config.is_none()
            && self.user_data.is_none()
            && self.frequency.is_none()
            && self.cron_expression.is_none()
            && self.specific_time.is_none()
            && self.active.is_none()
    }
}
