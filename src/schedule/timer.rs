//! Timer rule adapter -- the cron-like trigger object linked 1:1 with an
//! active schedule.
//!
//! The trait mirrors the external timer service surface (put / enable /
//! disable / delete); the local implementation keeps rules in SQLite, where
//! the sweep loop is what actually fires them.

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::params;
use uuid::Uuid;

use crate::storage::Pool;

/// Deterministic rule name for a schedule.
pub fn rule_name_for(schedule_id: Uuid) -> String {
    format!("form-test-schedule-{}", schedule_id)
}

/// Wrap a stored 6-field cron body in the rule-boundary syntax.
pub fn schedule_expression(cron_body: &str) -> String {
    format!("cron({})", cron_body)
}

#[async_trait::async_trait]
pub trait TimerRules: Send + Sync {
    /// Create or update a rule, enabled, with the run payload attached as its
    /// invocation input. Returns the rule identifier.
    async fn put_rule(
        &self,
        name: &str,
        cron_body: &str,
        schedule_id: Uuid,
        payload: &serde_json::Value,
    ) -> Result<String>;

    async fn enable(&self, name: &str) -> Result<()>;

    async fn disable(&self, name: &str) -> Result<()>;

    /// Remove the rule's targets and the rule itself.
    async fn remove(&self, name: &str) -> Result<()>;
}

/// SQLite-backed rules table.
#[derive(Clone)]
pub struct LocalTimerRules {
    pool: Pool,
}

impl LocalTimerRules {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Enabled state of a rule, if it exists.
    pub fn is_enabled(&self, name: &str) -> Result<Option<bool>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare("SELECT enabled FROM timer_rules WHERE name = ?1")?;
        let mut rows = stmt.query_map(params![name], |row| row.get::<_, i64>(0))?;
        match rows.next() {
            Some(r) => Ok(Some(r? != 0)),
            None => Ok(None),
        }
    }

    fn set_enabled(&self, name: &str, enabled: bool) -> Result<()> {
        let conn = self.pool.get()?;
        let changed = conn.execute(
            "UPDATE timer_rules SET enabled = ?1, updated_at = ?2 WHERE name = ?3",
            params![enabled as i64, Utc::now().to_rfc3339(), name],
        )?;
        if changed == 0 {
            anyhow::bail!("timer rule '{}' not found", name);
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl TimerRules for LocalTimerRules {
    async fn put_rule(
        &self,
        name: &str,
        cron_body: &str,
        schedule_id: Uuid,
        payload: &serde_json::Value,
    ) -> Result<String> {
        let arn = format!("local:rule/{}", name);
        let now = Utc::now().to_rfc3339();
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO timer_rules (name, rule_arn, schedule_id, schedule_expr, payload_json,
                                      enabled, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6, ?6)
             ON CONFLICT(name) DO UPDATE SET
                 schedule_expr = excluded.schedule_expr,
                 payload_json = excluded.payload_json,
                 enabled = 1,
                 updated_at = excluded.updated_at",
            params![
                name,
                arn,
                schedule_id.to_string(),
                schedule_expression(cron_body),
                serde_json::to_string(payload)?,
                now,
            ],
        )
        .context("failed to put timer rule")?;
        Ok(arn)
    }

    async fn enable(&self, name: &str) -> Result<()> {
        self.set_enabled(name, true)
    }

    async fn disable(&self, name: &str) -> Result<()> {
        self.set_enabled(name, false)
    }

    async fn remove(&self, name: &str) -> Result<()> {
        let conn = self.pool.get()?;
        let changed = conn.execute("DELETE FROM timer_rules WHERE name = ?1", params![name])?;
        if changed == 0 {
            anyhow::bail!("timer rule '{}' not found", name);
        }
        Ok(())
    }
}
