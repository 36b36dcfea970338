//! Schedule lifecycle: create, partial update, activation toggling, delete,
//! and run-completion accounting.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{params, Row};
use uuid::Uuid;

use crate::config::CompletedPolicy;
use crate::runner::store::{decode_page_token, encode_page_token};
use crate::runner::RunStatus;
use crate::storage::Pool;

use super::cron::{derive_cron_expression, next_run_time, validate_frequency};
use super::timer::{rule_name_for, TimerRules};
use super::{Frequency, NewSchedule, Schedule, ScheduleError, ScheduleStats, ScheduleUpdate};

type Result<T> = std::result::Result<T, ScheduleError>;

#[derive(Clone)]
pub struct ScheduleManager {
    pool: Pool,
    rules: Arc<dyn TimerRules>,
    completed_policy: CompletedPolicy,
}

impl ScheduleManager {
    pub fn new(pool: Pool, rules: Arc<dyn TimerRules>, completed_policy: CompletedPolicy) -> Self {
        Self {
            pool,
            rules,
            completed_policy,
        }
    }

    /// Create a schedule. When active, also create its timer rule and compute
    /// the first next-run time. A rule-creation failure after the record is
    /// persisted is logged and swallowed: the schedule exists but will not
    /// fire until the next successful activation.
    pub async fn create(&self, input: NewSchedule) -> Result<Schedule> {
        if input.name.trim().is_empty() {
            return Err(ScheduleError::Validation("name must not be empty".into()));
        }
        if input.url.trim().is_empty() {
            return Err(ScheduleError::Validation("url must not be empty".into()));
        }
        if !validate_frequency(input.frequency, input.cron_expression.as_deref()) {
            return Err(ScheduleError::Validation(
                "invalid frequency or cron expression".into(),
            ));
        }

        let cron_expr = derive_cron_expression(
            input.frequency,
            input.cron_expression.as_deref(),
            input.specific_time.as_deref(),
        )?;

        let id = Uuid::new_v4();
        let active = input.active.unwrap_or(true);
        let now = Utc::now();

        {
            let conn = self.pool.get()?;
            conn.execute(
                "INSERT INTO schedules (id, name, description, url, form_config_json,
                     user_data_json, frequency, specific_time, cron_expr, active,
                     version, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 0, ?11, ?11)",
                params![
                    id.to_string(),
                    input.name,
                    input.description,
                    input.url,
                    serde_json::to_string(&input.form_config)
                        .map_err(|e| ScheduleError::Storage(e.into()))?,
                    serde_json::to_string(&input.user_data)
                        .map_err(|e| ScheduleError::Storage(e.into()))?,
                    input.frequency.as_str(),
                    input.specific_time,
                    cron_expr,
                    active as i64,
                    now.to_rfc3339(),
                ],
            )?;
        }

        if active {
            self.link_timer_rule(id, &cron_expr, now).await;
        }

        tracing::info!(schedule = %id, name = %input.name, active, "schedule created");
        self.get(id)
    }

    /// Attach (or refresh) the timer rule and next-run time for an active
    /// schedule. Failures are logged, never propagated.
    async fn link_timer_rule(&self, id: Uuid, cron_expr: &str, now: DateTime<Utc>) {
        let payload = match self.run_payload(id) {
            Ok(p) => p,
            Err(e) => {
                tracing::error!(schedule = %id, error = %e, "failed to build rule payload");
                return;
            }
        };

        let name = rule_name_for(id);
        match self.rules.put_rule(&name, cron_expr, id, &payload).await {
            Ok(arn) => {
                let next = next_run_time(cron_expr, now);
                if let Err(e) = self.store_rule_linkage(id, &arn, next) {
                    tracing::error!(schedule = %id, error = %e, "failed to store rule linkage");
                }
            }
            Err(e) => {
                // Accepted risk: the schedule record exists but is not
                // actually scheduled. Surfaced here, not to the caller.
                tracing::error!(schedule = %id, error = %e, "timer rule creation failed; schedule will not fire");
            }
        }
    }

    fn store_rule_linkage(&self, id: Uuid, arn: &str, next: DateTime<Utc>) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "UPDATE schedules SET rule_arn = ?1, next_run_at = ?2, updated_at = ?3 WHERE id = ?4",
            params![
                arn,
                next.to_rfc3339(),
                Utc::now().to_rfc3339(),
                id.to_string()
            ],
        )?;
        Ok(())
    }

    /// The rule's invocation input: everything the executor needs.
    fn run_payload(&self, id: Uuid) -> Result<serde_json::Value> {
        let s = self.get(id)?;
        Ok(serde_json::json!({
            "scheduleId": s.id,
            "url": s.url,
            "formConfig": s.form_config,
            "userData": s.user_data,
        }))
    }

    pub fn get(&self, id: Uuid) -> Result<Schedule> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM schedules WHERE id = ?1",
            SCHEDULE_COLUMNS
        ))?;
        let mut rows = stmt.query_map(params![id.to_string()], row_to_schedule)?;
        let mut schedule = match rows.next() {
            Some(r) => r?,
            None => return Err(ScheduleError::NotFound(id)),
        };
        schedule.runs = self.run_ids(id)?;
        Ok(schedule)
    }

    /// Newest-first page of schedules with an opaque continuation token.
    pub fn list(&self, limit: u64, token: Option<&str>) -> Result<(Vec<Schedule>, Option<String>)> {
        let offset = token.and_then(decode_page_token).unwrap_or(0);
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM schedules ORDER BY created_at DESC LIMIT ?1 OFFSET ?2",
            SCHEDULE_COLUMNS
        ))?;
        let rows = stmt.query_map(params![limit + 1, offset], row_to_schedule)?;
        let mut schedules = Vec::new();
        for r in rows {
            schedules.push(r?);
        }
        let next = if schedules.len() as u64 > limit {
            schedules.truncate(limit as usize);
            Some(encode_page_token(offset + limit))
        } else {
            None
        };
        for s in &mut schedules {
            s.runs = self.run_ids(s.id)?;
        }
        Ok((schedules, next))
    }

    /// Apply a partial update. An empty update is a reported no-op. A version
    /// mismatch between read and guarded write is a conflict.
    pub async fn update(&self, id: Uuid, upd: ScheduleUpdate) -> Result<Schedule> {
        let current = self.get(id)?;

        if upd.is_empty() {
            return Ok(current);
        }

        // Re-activating an already-active schedule (and the inverse) is a
        // reported no-op, not an error.
        let activation_changed = upd.active.is_some_and(|a| a != current.active);
        let only_active = upd.name.is_none()
            && upd.description.is_none()
            && upd.url.is_none()
            && upd.form_config.is_none()
            && upd.user_data.is_none()
            && upd.frequency.is_none()
            && upd.cron_expression.is_none()
            && upd.specific_time.is_none();
        if only_active && !activation_changed {
            return Ok(current);
        }

        let frequency = upd.frequency.unwrap_or(current.frequency);
        let timing_changed = upd.frequency.is_some()
            || upd.cron_expression.is_some()
            || upd.specific_time.is_some();

        let cron_expr = if timing_changed {
            let custom = upd
                .cron_expression
                .as_deref()
                .or(if frequency == Frequency::Custom {
                    Some(current.cron_expression.as_str())
                } else {
                    None
                });
            if !validate_frequency(frequency, custom) {
                return Err(ScheduleError::Validation(
                    "invalid frequency or cron expression".into(),
                ));
            }
            let specific = upd
                .specific_time
                .as_deref()
                .or(current.specific_time.as_deref());
            derive_cron_expression(frequency, custom, specific)?
        } else {
            current.cron_expression.clone()
        };

        let active = upd.active.unwrap_or(current.active);
        let now = Utc::now();

        {
            let conn = self.pool.get()?;
            let changed = conn.execute(
                "UPDATE schedules SET name = ?1, description = ?2, url = ?3,
                     form_config_json = ?4, user_data_json = ?5, frequency = ?6,
                     specific_time = ?7, cron_expr = ?8, active = ?9,
                     version = version + 1, updated_at = ?10
                 WHERE id = ?11 AND version = ?12",
                params![
                    upd.name.as_deref().unwrap_or(&current.name),
                    upd.description.as_deref().or(current.description.as_deref()),
                    upd.url.as_deref().unwrap_or(&current.url),
                    serde_json::to_string(upd.form_config.as_ref().unwrap_or(&current.form_config))
                        .map_err(|e| ScheduleError::Storage(e.into()))?,
                    serde_json::to_string(upd.user_data.as_ref().unwrap_or(&current.user_data))
                        .map_err(|e| ScheduleError::Storage(e.into()))?,
                    frequency.as_str(),
                    upd.specific_time
                        .as_deref()
                        .or(current.specific_time.as_deref()),
                    cron_expr,
                    active as i64,
                    now.to_rfc3339(),
                    id.to_string(),
                    current.version,
                ],
            )?;
            if changed == 0 {
                // Either gone or concurrently modified; disambiguate.
                return match self.get(id) {
                    Ok(_) => Err(ScheduleError::Conflict(id)),
                    Err(e) => Err(e),
                };
            }
        }

        let rule_name = rule_name_for(id);

        if activation_changed {
            if active {
                // Enable the existing rule, or create one if none existed.
                if current.rule_arn.is_some() {
                    if timing_changed {
                        self.link_timer_rule(id, &cron_expr, now).await;
                    } else if let Err(e) = self.rules.enable(&rule_name).await {
                        tracing::error!(schedule = %id, error = %e, "failed to enable timer rule");
                    }
                } else {
                    self.link_timer_rule(id, &cron_expr, now).await;
                }
                // Activation always recomputes the next run.
                self.set_next_run(id, next_run_time(&cron_expr, now))?;
            } else {
                // Deactivation disables the rule but deletes nothing, and
                // leaves next_run_at in place.
                if current.rule_arn.is_some() {
                    if let Err(e) = self.rules.disable(&rule_name).await {
                        tracing::error!(schedule = %id, error = %e, "failed to disable timer rule");
                    }
                }
            }
        } else if timing_changed && active {
            if current.rule_arn.is_some() {
                self.link_timer_rule(id, &cron_expr, now).await;
            }
            self.set_next_run(id, next_run_time(&cron_expr, now))?;
        }

        tracing::info!(schedule = %id, "schedule updated");
        self.get(id)
    }

    pub async fn set_active(&self, id: Uuid, active: bool) -> Result<Schedule> {
        self.update(
            id,
            ScheduleUpdate {
                active: Some(active),
                ..Default::default()
            },
        )
        .await
    }

    /// Delete a schedule. Timer-rule cleanup failures are logged and
    /// swallowed: the record is removed regardless, an orphaned external
    /// rule being the accepted risk.
    pub async fn delete(&self, id: Uuid) -> Result<()> {
        let current = self.get(id)?;

        if current.rule_arn.is_some() {
            let name = rule_name_for(id);
            if let Err(e) = self.rules.remove(&name).await {
                tracing::warn!(schedule = %id, error = %e, "timer rule cleanup failed, deleting schedule anyway");
            }
        }

        let conn = self.pool.get()?;
        conn.execute(
            "DELETE FROM schedules WHERE id = ?1",
            params![id.to_string()],
        )?;
        tracing::info!(schedule = %id, "schedule deleted");
        Ok(())
    }

    /// Fold one finished run into the schedule's counters and recompute the
    /// next run time if the schedule is still active.
    ///
    /// Idempotent: the run row carries a recorded flag, so a repeated call
    /// for the same run is a logged no-op instead of a double count.
    pub fn record_run_completion(
        &self,
        schedule_id: Uuid,
        run_id: Uuid,
        status: RunStatus,
    ) -> Result<()> {
        let conn = self.pool.get()?;

        let claimed = conn.execute(
            "UPDATE runs SET stats_recorded = 1 WHERE id = ?1 AND stats_recorded = 0",
            params![run_id.to_string()],
        )?;
        if claimed == 0 {
            tracing::warn!(run = %run_id, "completion already recorded, skipping");
            return Ok(());
        }

        let success = match status {
            RunStatus::Success => true,
            RunStatus::Completed => self.completed_policy == CompletedPolicy::Success,
            _ => false,
        };

        let now = Utc::now();
        let changed = conn.execute(
            "UPDATE schedules SET
                 stats_total = stats_total + 1,
                 stats_success = stats_success + ?1,
                 stats_failed = stats_failed + ?2,
                 last_run_at = ?3,
                 last_test_id = ?4,
                 last_test_status = ?5,
                 version = version + 1,
                 updated_at = ?3
             WHERE id = ?6",
            params![
                success as i64,
                !success as i64,
                now.to_rfc3339(),
                run_id.to_string(),
                status.as_str(),
                schedule_id.to_string(),
            ],
        )?;
        if changed == 0 {
            tracing::warn!(schedule = %schedule_id, run = %run_id, "schedule gone before completion accounting");
            return Ok(());
        }
        drop(conn);

        // Re-read the activation flag: a schedule deactivated mid-flight must
        // not get a fresh next-run time.
        let schedule = self.get(schedule_id)?;
        if schedule.active {
            self.set_next_run(schedule_id, next_run_time(&schedule.cron_expression, now))?;
        }

        Ok(())
    }

    fn set_next_run(&self, id: Uuid, next: DateTime<Utc>) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "UPDATE schedules SET next_run_at = ?1 WHERE id = ?2",
            params![next.to_rfc3339(), id.to_string()],
        )?;
        Ok(())
    }

    /// Active schedules whose next run time has passed (the fallback sweep's
    /// work list).
    pub fn due_schedules(&self, now: DateTime<Utc>) -> Result<Vec<Schedule>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM schedules
             WHERE active = 1 AND next_run_at IS NOT NULL AND next_run_at <= ?1",
            SCHEDULE_COLUMNS
        ))?;
        let rows = stmt.query_map(params![now.to_rfc3339()], row_to_schedule)?;
        let mut due = Vec::new();
        for r in rows {
            due.push(r?);
        }
        Ok(due)
    }

    /// Advance a schedule's next run time past `now`. Called before dispatch
    /// so a slow run cannot be double-scheduled.
    pub fn advance_next_run(&self, id: Uuid, now: DateTime<Utc>) -> Result<()> {
        let schedule = self.get(id)?;
        self.set_next_run(id, next_run_time(&schedule.cron_expression, now))
    }

    /// Dry-run preview: upcoming (time, name) pairs within the next `hours`.
    pub fn preview_next_runs(&self, hours: u64) -> Result<Vec<(DateTime<Utc>, String)>> {
        let (schedules, _) = self.list(10_000, None)?;
        let now = Utc::now();
        let end = now + chrono::Duration::hours(hours as i64);
        let mut preview = Vec::new();
        for s in schedules.iter().filter(|s| s.active) {
            let mut at = now;
            loop {
                let next = next_run_time(&s.cron_expression, at);
                if next > end || next <= at {
                    break;
                }
                preview.push((next, s.name.clone()));
                at = next;
            }
        }
        preview.sort_by_key(|(t, _)| *t);
        Ok(preview)
    }

    fn run_ids(&self, id: Uuid) -> Result<Vec<Uuid>> {
        let conn = self.pool.get()?;
        let mut stmt =
            conn.prepare("SELECT id FROM runs WHERE schedule_id = ?1 ORDER BY created_at ASC")?;
        let rows = stmt.query_map(params![id.to_string()], |row| row.get::<_, String>(0))?;
        let mut ids = Vec::new();
        for r in rows {
            if let Ok(run_id) = Uuid::parse_str(&r?) {
                ids.push(run_id);
            }
        }
        Ok(ids)
    }
}

const SCHEDULE_COLUMNS: &str = "id, name, description, url, form_config_json, user_data_json,
     frequency, specific_time, cron_expr, active, rule_arn, last_run_at, next_run_at,
     last_test_id, last_test_status, stats_total, stats_success, stats_failed,
     version, created_at, updated_at";

fn row_to_schedule(row: &Row<'_>) -> rusqlite::Result<Schedule> {
    let parse_err = |e: String| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, e.into())
    };

    let id: String = row.get(0)?;
    let form_config: String = row.get(4)?;
    let user_data: String = row.get(5)?;
    let frequency: String = row.get(6)?;
    let last_run: Option<String> = row.get(11)?;
    let next_run: Option<String> = row.get(12)?;
    let last_test_id: Option<String> = row.get(13)?;
    let created: String = row.get(19)?;
    let updated: String = row.get(20)?;

    let parse_ts = |s: &str| {
        DateTime::parse_from_rfc3339(s)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| parse_err(e.to_string()))
    };

    Ok(Schedule {
        id: Uuid::parse_str(&id).map_err(|e| parse_err(e.to_string()))?,
        name: row.get(1)?,
        description: row.get(2)?,
        url: row.get(3)?,
        form_config: serde_json::from_str(&form_config).map_err(|e| parse_err(e.to_string()))?,
        user_data: serde_json::from_str(&user_data).map_err(|e| parse_err(e.to_string()))?,
        frequency: Frequency::parse(&frequency)
            .ok_or_else(|| parse_err(format!("unknown frequency '{}'", frequency)))?,
        specific_time: row.get(7)?,
        cron_expression: row.get(8)?,
        active: row.get::<_, i64>(9)? != 0,
        rule_arn: row.get(10)?,
        last_run_time: last_run.as_deref().map(parse_ts).transpose()?,
        next_run_time: next_run.as_deref().map(parse_ts).transpose()?,
        last_test_id: last_test_id.and_then(|s| Uuid::parse_str(&s).ok()),
        last_test_status: row.get(14)?,
        stats: ScheduleStats {
            total: row.get(15)?,
            success: row.get(16)?,
            failed: row.get(17)?,
        },
        runs: Vec::new(),
        version: row.get(18)?,
        created_at: parse_ts(&created)?,
        updated_at: parse_ts(&updated)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::store::RunStore;
    use crate::runner::RunRecord;
    use crate::schedule::timer::LocalTimerRules;
    use std::collections::HashMap;

    struct FailingRules;

    #[async_trait::async_trait]
    impl TimerRules for FailingRules {
        async fn put_rule(
            &self,
            _name: &str,
            _cron: &str,
            _id: Uuid,
            _payload: &serde_json::Value,
        ) -> anyhow::Result<String> {
            anyhow::bail!("timer service unavailable")
        }
        async fn enable(&self, _name: &str) -> anyhow::Result<()> {
            anyhow::bail!("timer service unavailable")
        }
        async fn disable(&self, _name: &str) -> anyhow::Result<()> {
            anyhow::bail!("timer service unavailable")
        }
        async fn remove(&self, _name: &str) -> anyhow::Result<()> {
            anyhow::bail!("timer service unavailable")
        }
    }

    fn setup() -> (tempfile::TempDir, Pool, ScheduleManager, LocalTimerRules) {
        setup_with_policy(CompletedPolicy::Failed)
    }

    fn setup_with_policy(
        policy: CompletedPolicy,
    ) -> (tempfile::TempDir, Pool, ScheduleManager, LocalTimerRules) {
        let dir = tempfile::tempdir().unwrap();
        let pool = crate::storage::open_pool(dir.path().join("t.db").to_str().unwrap()).unwrap();
        let rules = LocalTimerRules::new(pool.clone());
        let manager = ScheduleManager::new(pool.clone(), Arc::new(rules.clone()), policy);
        (dir, pool, manager, rules)
    }

    fn new_schedule(frequency: Frequency, active: Option<bool>) -> NewSchedule {
        serde_json::from_value(serde_json::json!({
            "name": "nightly login check",
            "url": "https://x.test/login",
            "formConfig": {
                "fields": [
                    {"name": "email", "type": "email", "selector": "#email", "required": true}
                ],
                "submitButtonSelector": "#go"
            },
            "userData": {"email": "a@b.com"},
            "frequency": frequency.as_str(),
            "specificTime": "08:00",
            "active": active,
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn create_inactive_has_no_rule_and_no_next_run() {
        let (_dir, _pool, manager, rules) = setup();
        let s = manager
            .create(new_schedule(Frequency::Daily, Some(false)))
            .await
            .unwrap();
        assert!(!s.active);
        assert!(s.rule_arn.is_none());
        assert!(s.next_run_time.is_none());
        assert!(rules.is_enabled(&rule_name_for(s.id)).unwrap().is_none());
    }

    #[tokio::test]
    async fn create_active_links_rule_and_computes_next_run() {
        let (_dir, _pool, manager, rules) = setup();
        let s = manager
            .create(new_schedule(Frequency::Daily, None))
            .await
            .unwrap();
        assert!(s.active);
        assert!(s.rule_arn.is_some());
        let next = s.next_run_time.expect("next run set on activation");
        assert!(next > Utc::now());
        assert_eq!(rules.is_enabled(&rule_name_for(s.id)).unwrap(), Some(true));
        assert_eq!(s.cron_expression, "0 8 * * ? *");
    }

    #[tokio::test]
    async fn create_rejects_bad_input() {
        let (_dir, _pool, manager, _) = setup();

        let mut input = new_schedule(Frequency::Daily, None);
        input.name = "   ".into();
        assert!(matches!(
            manager.create(input).await,
            Err(ScheduleError::Validation(_))
        ));

        let mut input = new_schedule(Frequency::Custom, None);
        input.cron_expression = Some("bogus".into());
        assert!(matches!(
            manager.create(input).await,
            Err(ScheduleError::Validation(_))
        ));

        // custom without an expression at all
        let input = new_schedule(Frequency::Custom, None);
        assert!(matches!(
            manager.create(input).await,
            Err(ScheduleError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn rule_failure_on_create_is_swallowed() {
        let dir = tempfile::tempdir().unwrap();
        let pool = crate::storage::open_pool(dir.path().join("t.db").to_str().unwrap()).unwrap();
        let manager =
            ScheduleManager::new(pool, Arc::new(FailingRules), CompletedPolicy::Failed);

        let s = manager
            .create(new_schedule(Frequency::Daily, None))
            .await
            .unwrap();
        // persisted and nominally active, but never linked
        assert!(s.active);
        assert!(s.rule_arn.is_none());
        assert!(s.next_run_time.is_none());
    }

    #[tokio::test]
    async fn empty_update_is_a_noop() {
        let (_dir, _pool, manager, _) = setup();
        let s = manager
            .create(new_schedule(Frequency::Daily, None))
            .await
            .unwrap();
        let after = manager.update(s.id, ScheduleUpdate::default()).await.unwrap();
        assert_eq!(after.version, s.version);
        assert_eq!(after.updated_at, s.updated_at);
    }

    #[tokio::test]
    async fn reactivating_active_schedule_is_a_noop() {
        let (_dir, _pool, manager, _) = setup();
        let s = manager
            .create(new_schedule(Frequency::Daily, None))
            .await
            .unwrap();
        let after = manager.set_active(s.id, true).await.unwrap();
        assert_eq!(after.version, s.version);
    }

    #[tokio::test]
    async fn update_unknown_id_is_not_found() {
        let (_dir, _pool, manager, _) = setup();
        assert!(matches!(
            manager.update(Uuid::new_v4(), ScheduleUpdate::default()).await,
            Err(ScheduleError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn frequency_change_recomputes_cron_and_next_run() {
        let (_dir, _pool, manager, _) = setup();
        let s = manager
            .create(new_schedule(Frequency::Daily, None))
            .await
            .unwrap();

        let after = manager
            .update(
                s.id,
                ScheduleUpdate {
                    frequency: Some(Frequency::Hourly),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(after.cron_expression, "0 * * * ? *");
        assert!(after.next_run_time.unwrap() <= Utc::now() + chrono::Duration::hours(1));
        assert!(after.version > s.version);
    }

    #[tokio::test]
    async fn deactivation_disables_rule_but_keeps_next_run() {
        let (_dir, _pool, manager, rules) = setup();
        let s = manager
            .create(new_schedule(Frequency::Daily, None))
            .await
            .unwrap();
        let next_before = s.next_run_time.unwrap();

        let after = manager.set_active(s.id, false).await.unwrap();
        assert!(!after.active);
        assert_eq!(after.next_run_time.unwrap(), next_before);
        assert_eq!(rules.is_enabled(&rule_name_for(s.id)).unwrap(), Some(false));
        // rule still exists, merely disabled
        assert!(after.rule_arn.is_some());
    }

    #[tokio::test]
    async fn activation_enables_existing_rule_and_recomputes_next_run() {
        let (_dir, _pool, manager, rules) = setup();
        let s = manager
            .create(new_schedule(Frequency::Daily, None))
            .await
            .unwrap();
        manager.set_active(s.id, false).await.unwrap();

        let after = manager.set_active(s.id, true).await.unwrap();
        assert!(after.active);
        assert!(after.next_run_time.is_some());
        assert_eq!(rules.is_enabled(&rule_name_for(s.id)).unwrap(), Some(true));
    }

    #[tokio::test]
    async fn activation_creates_rule_when_none_existed() {
        let (_dir, _pool, manager, rules) = setup();
        let s = manager
            .create(new_schedule(Frequency::Daily, Some(false)))
            .await
            .unwrap();
        assert!(s.rule_arn.is_none());

        let after = manager.set_active(s.id, true).await.unwrap();
        assert!(after.rule_arn.is_some());
        assert!(after.next_run_time.is_some());
        assert_eq!(rules.is_enabled(&rule_name_for(s.id)).unwrap(), Some(true));
    }

    #[tokio::test]
    async fn stale_version_surfaces_conflict() {
        let (_dir, pool, manager, _) = setup();
        let s = manager
            .create(new_schedule(Frequency::Daily, None))
            .await
            .unwrap();

        // First writer wins.
        manager
            .update(
                s.id,
                ScheduleUpdate {
                    name: Some("renamed".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        // A writer still holding the stale snapshot loses. Exercised through
        // the guarded statement directly, since `update` re-reads.
        let conn = pool.get().unwrap();
        let changed = conn
            .execute(
                "UPDATE schedules SET name = 'loser', version = version + 1
                 WHERE id = ?1 AND version = ?2",
                params![s.id.to_string(), s.version],
            )
            .unwrap();
        assert_eq!(changed, 0);
    }

    #[tokio::test]
    async fn delete_removes_schedule_even_when_rule_cleanup_fails() {
        let (_dir, pool, manager, _) = setup();
        let s = manager
            .create(new_schedule(Frequency::Daily, None))
            .await
            .unwrap();
        assert!(s.rule_arn.is_some());

        // Same store, but a timer adapter that always fails.
        let broken =
            ScheduleManager::new(pool, Arc::new(FailingRules), CompletedPolicy::Failed);
        broken.delete(s.id).await.unwrap();

        assert!(matches!(
            manager.get(s.id),
            Err(ScheduleError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn delete_unknown_id_is_not_found() {
        let (_dir, _pool, manager, _) = setup();
        assert!(matches!(
            manager.delete(Uuid::new_v4()).await,
            Err(ScheduleError::NotFound(_))
        ));
    }

    fn seed_run(pool: &Pool, schedule_id: Uuid) -> Uuid {
        let store = RunStore::new(pool.clone());
        let rec = RunRecord::start(
            Some(schedule_id),
            "https://x.test/login".into(),
            serde_json::from_value(serde_json::json!({
                "fields": [], "submitButtonSelector": "#go"
            }))
            .unwrap(),
            HashMap::new(),
        );
        store.save(&rec).unwrap();
        rec.id
    }

    #[tokio::test]
    async fn completion_updates_stats_and_is_deduplicated() {
        let (_dir, pool, manager, _) = setup();
        let s = manager
            .create(new_schedule(Frequency::Daily, None))
            .await
            .unwrap();
        let run_id = seed_run(&pool, s.id);

        manager
            .record_run_completion(s.id, run_id, RunStatus::Success)
            .unwrap();
        let after = manager.get(s.id).unwrap();
        assert_eq!(after.stats, ScheduleStats { total: 1, success: 1, failed: 0 });
        assert_eq!(after.last_test_id, Some(run_id));
        assert_eq!(after.last_test_status.as_deref(), Some("success"));
        assert_eq!(after.runs, vec![run_id]);

        // Second call for the same run must not double-count.
        manager
            .record_run_completion(s.id, run_id, RunStatus::Success)
            .unwrap();
        let again = manager.get(s.id).unwrap();
        assert_eq!(again.stats.total, 1);
    }

    #[tokio::test]
    async fn stats_invariant_holds_across_outcomes() {
        let (_dir, pool, manager, _) = setup();
        let s = manager
            .create(new_schedule(Frequency::Daily, None))
            .await
            .unwrap();

        for status in [RunStatus::Success, RunStatus::Failed, RunStatus::Completed] {
            let run_id = seed_run(&pool, s.id);
            manager.record_run_completion(s.id, run_id, status).unwrap();
        }

        let after = manager.get(s.id).unwrap();
        assert_eq!(after.stats.total, 3);
        assert_eq!(after.stats.total, after.stats.success + after.stats.failed);
        // default policy counts `completed` as failed
        assert_eq!(after.stats.success, 1);
        assert_eq!(after.stats.failed, 2);
    }

    #[tokio::test]
    async fn completed_policy_success_counts_completed_runs_as_success() {
        let (_dir, pool, manager, _) = setup_with_policy(CompletedPolicy::Success);
        let s = manager
            .create(new_schedule(Frequency::Daily, None))
            .await
            .unwrap();
        let run_id = seed_run(&pool, s.id);

        manager
            .record_run_completion(s.id, run_id, RunStatus::Completed)
            .unwrap();
        let after = manager.get(s.id).unwrap();
        assert_eq!(after.stats.success, 1);
        assert_eq!(after.stats.failed, 0);
    }

    #[tokio::test]
    async fn completion_skips_next_run_recompute_when_deactivated() {
        let (_dir, pool, manager, _) = setup();
        let s = manager
            .create(new_schedule(Frequency::Daily, None))
            .await
            .unwrap();
        manager.set_active(s.id, false).await.unwrap();
        let frozen_next = manager.get(s.id).unwrap().next_run_time;

        let run_id = seed_run(&pool, s.id);
        manager
            .record_run_completion(s.id, run_id, RunStatus::Success)
            .unwrap();

        let after = manager.get(s.id).unwrap();
        assert_eq!(after.next_run_time, frozen_next);
        assert_eq!(after.stats.total, 1);
    }

    #[tokio::test]
    async fn due_schedules_and_advance() {
        let (_dir, _pool, manager, _) = setup();
        let s = manager
            .create(new_schedule(Frequency::Hourly, None))
            .await
            .unwrap();

        // nothing due before the next slot
        assert!(manager.due_schedules(Utc::now()).unwrap().is_empty());

        // well past the slot, the schedule shows up
        let later = Utc::now() + chrono::Duration::hours(2);
        let due = manager.due_schedules(later).unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, s.id);

        // advancing clears it for that instant
        manager.advance_next_run(s.id, later).unwrap();
        assert!(manager.due_schedules(later).unwrap().is_empty());
    }
}
