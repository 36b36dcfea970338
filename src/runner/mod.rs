//! Form test runs -- declarative field configuration, run records, executor.

pub mod browser;
pub mod executor;
pub mod store;

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use self::executor::TestRunner;
pub use self::store::RunStore;

/// Supported form field kinds. Closed set: an unknown kind is rejected when
/// the config is deserialized, not silently skipped at fill time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    Text,
    Email,
    Password,
    Number,
    Tel,
    Url,
    Date,
    Textarea,
    Select,
    Checkbox,
    Radio,
    /// File uploads are not supported; filling one records a run error.
    File,
}

impl FieldKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldKind::Text => "text",
            FieldKind::Email => "email",
            FieldKind::Password => "password",
            FieldKind::Number => "number",
            FieldKind::Tel => "tel",
            FieldKind::Url => "url",
            FieldKind::Date => "date",
            FieldKind::Textarea => "textarea",
            FieldKind::Select => "select",
            FieldKind::Checkbox => "checkbox",
            FieldKind::Radio => "radio",
            FieldKind::File => "file",
        }
    }
}

/// One field of the target form.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FormField {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: FieldKind,
    pub selector: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<String>,
    /// Choices for select/radio fields, informational for the dashboard.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<String>>,
}

/// Selector that, once present after submit, marks the run successful.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuccessIndicator {
    pub selector: String,
    /// Milliseconds to wait for the indicator.
    #[serde(default = "default_indicator_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_indicator_timeout_ms() -> u64 {
    10_000
}

/// Declarative description of the form under test.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FormConfig {
    pub fields: Vec<FormField>,
    pub submit_button_selector: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success_indicator: Option<SuccessIndicator>,
}

/// Terminal and non-terminal run states. `running` is the sole non-terminal
/// state; a record never leaves a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Success,
    Failed,
    /// Submitted with no success indicator configured; outcome unknown.
    Completed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
            RunStatus::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(RunStatus::Running),
            "success" => Some(RunStatus::Success),
            "failed" => Some(RunStatus::Failed),
            "completed" => Some(RunStatus::Completed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Computed once the run reaches a terminal state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunMetrics {
    pub duration_ms: i64,
    pub fields_processed: usize,
    pub errors_count: usize,
}

/// One concrete execution of a form test, ad hoc or schedule-triggered.
///
/// The form/user-data configuration is snapshotted at run start and immutable
/// thereafter; logs, errors, and screenshots are append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRecord {
    pub id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schedule_id: Option<Uuid>,
    pub url: String,
    pub form_config: FormConfig,
    pub user_data: HashMap<String, serde_json::Value>,
    pub status: RunStatus,
    pub start_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    pub logs: Vec<String>,
    pub errors: Vec<String>,
    /// Named stage (initial, preSubmit, final, error-<field>) to stored-blob
    /// reference.
    pub screenshots: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<RunMetrics>,
}

impl RunRecord {
    /// Fresh record in `running` state.
    pub fn start(
        schedule_id: Option<Uuid>,
        url: String,
        form_config: FormConfig,
        user_data: HashMap<String, serde_json::Value>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            schedule_id,
            url,
            form_config,
            user_data,
            status: RunStatus::Running,
            start_time: Utc::now(),
            end_time: None,
            logs: Vec::new(),
            errors: Vec::new(),
            screenshots: BTreeMap::new(),
            metrics: None,
        }
    }

    pub fn log(&mut self, msg: impl Into<String>) {
        let msg = msg.into();
        tracing::debug!(run = %self.id, "{}", msg);
        self.logs.push(msg);
    }

    pub fn record_error(&mut self, msg: impl Into<String>) {
        let msg = msg.into();
        tracing::warn!(run = %self.id, "{}", msg);
        self.errors.push(msg);
    }
}
