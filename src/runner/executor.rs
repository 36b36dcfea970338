//! The run executor: drives one browser session through navigate, fill,
//! submit, and verdict, producing a terminal [`RunRecord`] no matter what.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Result;
use serde_json::Value;
use uuid::Uuid;

use crate::evidence::ScreenshotStore;

use super::browser::{BrowserSession, WebDriverSession};
use super::store::RunStore;
use super::{FieldKind, FormConfig, FormField, RunMetrics, RunRecord, RunStatus};

const NAVIGATION_TIMEOUT: Duration = Duration::from_secs(30);
const IDLE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct TestRunner {
    store: RunStore,
    shots: ScreenshotStore,
    webdriver_url: String,
    run_deadline: Duration,
}

impl TestRunner {
    pub fn new(
        store: RunStore,
        shots: ScreenshotStore,
        webdriver_url: String,
        run_deadline: Duration,
    ) -> Self {
        Self {
            store,
            shots,
            webdriver_url,
            run_deadline,
        }
    }

    /// Execute a form test end to end. Never returns an error: every failure
    /// mode ends in a persisted terminal record.
    pub async fn run(
        &self,
        schedule_id: Option<Uuid>,
        url: String,
        form_config: FormConfig,
        user_data: HashMap<String, Value>,
    ) -> RunRecord {
        self.execute(RunRecord::start(schedule_id, url, form_config, user_data))
            .await
    }

    /// Execute an already-created record (callers that need the id before the
    /// browser work starts, e.g. the accepted-and-running API response).
    pub async fn execute(&self, mut rec: RunRecord) -> RunRecord {
        // Persist immediately so partial or crashed runs stay observable.
        if let Err(e) = self.store.save(&rec) {
            tracing::error!(run = %rec.id, error = %e, "failed to persist starting run record");
        }

        match WebDriverSession::connect(&self.webdriver_url).await {
            Ok(session) => self.drive_to_completion(Box::new(session), &mut rec).await,
            Err(e) => {
                rec.record_error(format!("navigation setup failed: {:#}", e));
                rec.status = RunStatus::Failed;
            }
        }

        self.finalize(&mut rec);
        rec
    }

    /// Same as [`execute`], with a caller-supplied session. Test seam.
    pub async fn run_with_session(
        &self,
        session: Box<dyn BrowserSession>,
        schedule_id: Option<Uuid>,
        url: String,
        form_config: FormConfig,
        user_data: HashMap<String, Value>,
    ) -> RunRecord {
        let mut rec = RunRecord::start(schedule_id, url, form_config, user_data);
        if let Err(e) = self.store.save(&rec) {
            tracing::error!(run = %rec.id, error = %e, "failed to persist starting run record");
        }
        self.drive_to_completion(session, &mut rec).await;
        self.finalize(&mut rec);
        rec
    }

    /// Run the browser sequence under the overall deadline, force `failed` on
    /// any escaped error, and close the session on every path.
    async fn drive_to_completion(
        &self,
        mut session: Box<dyn BrowserSession>,
        rec: &mut RunRecord,
    ) {
        let outcome =
            tokio::time::timeout(self.run_deadline, self.drive(session.as_mut(), rec)).await;

        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let msg = format!("test execution failed: {:#}", e);
                rec.record_error(msg.clone());
                rec.log(msg);
                rec.status = RunStatus::Failed;
                // Final screenshot is captured regardless of outcome.
                self.capture(session.as_mut(), rec, "final").await.ok();
            }
            Err(_) => {
                rec.record_error(format!(
                    "run deadline of {:?} exceeded, aborting",
                    self.run_deadline
                ));
                rec.status = RunStatus::Failed;
            }
        }

        if let Err(e) = session.close().await {
            tracing::warn!(run = %rec.id, error = %e, "browser session close failed");
        }
    }

    /// The fallible sequence: any error escaping here becomes a `failed` run.
    async fn drive(&self, session: &mut dyn BrowserSession, rec: &mut RunRecord) -> Result<()> {
        rec.log(format!("navigating to {}", rec.url));
        let url = rec.url.clone();
        session.goto(&url, NAVIGATION_TIMEOUT).await?;
        self.capture(session, rec, "initial").await?;

        let fields = rec.form_config.fields.clone();
        for field in &fields {
            self.process_field(session, rec, field).await;
        }

        self.capture(session, rec, "preSubmit").await?;

        let submit = rec.form_config.submit_button_selector.clone();
        rec.log(format!("clicking submit button {}", submit));
        session.click(&submit).await?;

        match rec.form_config.success_indicator.clone() {
            Some(indicator) => {
                let timeout = Duration::from_millis(indicator.timeout_ms);
                if session
                    .wait_for_selector(&indicator.selector, timeout)
                    .await?
                {
                    rec.log(format!("success indicator {} appeared", indicator.selector));
                    rec.status = RunStatus::Success;
                } else {
                    rec.record_error(format!(
                        "timeout waiting for success indicator {} after {:?}",
                        indicator.selector, timeout
                    ));
                    rec.status = RunStatus::Failed;
                }
            }
            None => {
                // No indicator configured: the submission outcome is unknowable,
                // so the run degrades to `completed` rather than success/failed.
                if let Err(e) = session.wait_for_idle(IDLE_TIMEOUT).await {
                    rec.log(format!("post-submit settle wait ended early: {:#}", e));
                }
                rec.log("form submitted, no success indicator configured");
                rec.status = RunStatus::Completed;
            }
        }

        self.capture(session, rec, "final").await?;
        Ok(())
    }

    /// Fill one field. Failures here are recovered locally: recorded on the
    /// run, never aborting the remaining fields.
    async fn process_field(
        &self,
        session: &mut dyn BrowserSession,
        rec: &mut RunRecord,
        field: &FormField,
    ) {
        let value = resolve_value(field, &rec.user_data);

        let value = match value {
            Some(v) => v,
            None if field.required => {
                rec.record_error(format!(
                    "required field '{}' has no supplied value and no default",
                    field.name
                ));
                let stage = format!("error-{}", field.name);
                self.capture(session, rec, &stage).await.ok();
                return;
            }
            None => {
                rec.log(format!("skipping optional field '{}' (no value)", field.name));
                return;
            }
        };

        if field.kind == FieldKind::File {
            rec.record_error(format!(
                "unsupported file upload field '{}', skipping",
                field.name
            ));
            return;
        }

        rec.log(format!(
            "filling {} field '{}' via {}",
            field.kind.as_str(),
            field.name,
            field.selector
        ));

        let result = match field.kind {
            FieldKind::Select => session.select_option(&field.selector, &value).await,
            FieldKind::Checkbox => session.set_checkbox(&field.selector, is_truthy(&value)).await,
            FieldKind::Radio => session.pick_radio(&field.selector, &value).await,
            FieldKind::File => unreachable!("handled above"),
            _ => session.fill(&field.selector, &value).await,
        };

        if let Err(e) = result {
            rec.record_error(format!("field '{}' failed: {:#}", field.name, e));
            let stage = format!("error-{}", field.name);
            self.capture(session, rec, &stage).await.ok();
        }
    }

    /// Capture a named-stage screenshot into the blob store.
    async fn capture(
        &self,
        session: &mut dyn BrowserSession,
        rec: &mut RunRecord,
        stage: &str,
    ) -> Result<()> {
        let png = session.screenshot().await?;
        let reference = self.shots.save(rec.id, stage, &png)?;
        rec.log(format!("captured {} screenshot", stage));
        rec.screenshots.insert(stage.to_string(), reference);
        Ok(())
    }

    /// Stamp end time and metrics, then persist the terminal state.
    fn finalize(&self, rec: &mut RunRecord) {
        let end = chrono::Utc::now();
        rec.end_time = Some(end);
        rec.metrics = Some(RunMetrics {
            duration_ms: (end - rec.start_time).num_milliseconds(),
            fields_processed: rec.form_config.fields.len(),
            errors_count: rec.errors.len(),
        });
        if let Err(e) = self.store.save(rec) {
            tracing::error!(run = %rec.id, error = %e, "failed to persist final run record");
        }
        tracing::info!(
            run = %rec.id,
            status = %rec.status,
            errors = rec.errors.len(),
            "run finished"
        );
    }
}

/// Fill value resolution order: userData, then the field default.
fn resolve_value(field: &FormField, user_data: &HashMap<String, Value>) -> Option<String> {
    match user_data.get(&field.name) {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Null) | None => field.default_value.clone(),
        Some(v) => Some(v.to_string()),
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.to_ascii_lowercase().as_str(),
        "true" | "1" | "yes" | "on" | "checked"
    )
}
