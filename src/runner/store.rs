//! Run record persistence and paginated listing.

use anyhow::{Context, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use rusqlite::{params, Row};
use uuid::Uuid;

use crate::storage::Pool;

use super::{RunRecord, RunStatus};

/// Opaque continuation token wrapping the store's native offset.
pub fn encode_page_token(offset: u64) -> String {
    URL_SAFE_NO_PAD.encode(format!("offset:{}", offset))
}

pub fn decode_page_token(token: &str) -> Option<u64> {
    let bytes = URL_SAFE_NO_PAD.decode(token).ok()?;
    let s = String::from_utf8(bytes).ok()?;
    s.strip_prefix("offset:")?.parse().ok()
}

#[derive(Clone)]
pub struct RunStore {
    pool: Pool,
}

impl RunStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Insert or update a run record. The `stats_recorded` bookkeeping flag
    /// is owned by the schedule lifecycle and deliberately left untouched.
    pub fn save(&self, rec: &RunRecord) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO runs (id, schedule_id, url, form_config_json, user_data_json,
                               status, started_at, finished_at, logs_json, errors_json,
                               screenshots_json, duration_ms, fields_processed, errors_count,
                               created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
             ON CONFLICT(id) DO UPDATE SET
                 status = excluded.status,
                 finished_at = excluded.finished_at,
                 logs_json = excluded.logs_json,
                 errors_json = excluded.errors_json,
                 screenshots_json = excluded.screenshots_json,
                 duration_ms = excluded.duration_ms,
                 fields_processed = excluded.fields_processed,
                 errors_count = excluded.errors_count",
            params![
                rec.id.to_string(),
                rec.schedule_id.map(|s| s.to_string()),
                rec.url,
                serde_json::to_string(&rec.form_config)?,
                serde_json::to_string(&rec.user_data)?,
                rec.status.as_str(),
                rec.start_time.to_rfc3339(),
                rec.end_time.map(|t| t.to_rfc3339()),
                serde_json::to_string(&rec.logs)?,
                serde_json::to_string(&rec.errors)?,
                serde_json::to_string(&rec.screenshots)?,
                rec.metrics.map(|m| m.duration_ms),
                rec.metrics.map(|m| m.fields_processed as i64),
                rec.metrics.map(|m| m.errors_count as i64),
                rec.start_time.to_rfc3339(),
            ],
        )
        .context("failed to save run record")?;
        Ok(())
    }

    pub fn get(&self, id: Uuid) -> Result<Option<RunRecord>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM runs WHERE id = ?1",
            RUN_COLUMNS
        ))?;
        let mut rows = stmt.query_map(params![id.to_string()], row_to_record)?;
        match rows.next() {
            Some(r) => Ok(Some(r?)),
            None => Ok(None),
        }
    }

    /// Newest-first page of runs, optionally filtered by target URL.
    /// Returns the page and, when more rows remain, a continuation token.
    pub fn list(
        &self,
        limit: u64,
        token: Option<&str>,
        url: Option<&str>,
    ) -> Result<(Vec<RunRecord>, Option<String>)> {
        let offset = token.and_then(decode_page_token).unwrap_or(0);
        let conn = self.pool.get()?;

        // Fetch one extra row to learn whether a next page exists.
        let (sql, has_url) = match url {
            Some(_) => (
                format!(
                    "SELECT {} FROM runs WHERE url = ?1 ORDER BY created_at DESC LIMIT ?2 OFFSET ?3",
                    RUN_COLUMNS
                ),
                true,
            ),
            None => (
                format!(
                    "SELECT {} FROM runs ORDER BY created_at DESC LIMIT ?1 OFFSET ?2",
                    RUN_COLUMNS
                ),
                false,
            ),
        };

        let mut stmt = conn.prepare(&sql)?;
        let mut records = Vec::new();
        if has_url {
            let rows = stmt.query_map(
                params![url.unwrap_or_default(), limit + 1, offset],
                row_to_record,
            )?;
            for r in rows {
                records.push(r?);
            }
        } else {
            let rows = stmt.query_map(params![limit + 1, offset], row_to_record)?;
            for r in rows {
                records.push(r?);
            }
        }

        let next = if records.len() as u64 > limit {
            records.truncate(limit as usize);
            Some(encode_page_token(offset + limit))
        } else {
            None
        };
        Ok((records, next))
    }

    /// Newest-first page of a single schedule's runs.
    pub fn list_for_schedule(
        &self,
        schedule_id: Uuid,
        limit: u64,
        token: Option<&str>,
    ) -> Result<(Vec<RunRecord>, Option<String>)> {
        let offset = token.and_then(decode_page_token).unwrap_or(0);
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM runs WHERE schedule_id = ?1 ORDER BY created_at DESC LIMIT ?2 OFFSET ?3",
            RUN_COLUMNS
        ))?;
        let rows = stmt.query_map(
            params![schedule_id.to_string(), limit + 1, offset],
            row_to_record,
        )?;
        let mut records = Vec::new();
        for r in rows {
            records.push(r?);
        }
        let next = if records.len() as u64 > limit {
            records.truncate(limit as usize);
            Some(encode_page_token(offset + limit))
        } else {
            None
        };
        Ok((records, next))
    }

    /// Append-only run id history for a schedule, oldest first.
    pub fn run_ids_for_schedule(&self, schedule_id: Uuid) -> Result<Vec<Uuid>> {
        let conn = self.pool.get()?;
        let mut stmt = conn
            .prepare("SELECT id FROM runs WHERE schedule_id = ?1 ORDER BY created_at ASC")?;
        let rows = stmt.query_map(params![schedule_id.to_string()], |row| {
            row.get::<_, String>(0)
        })?;
        let mut ids = Vec::new();
        for r in rows {
            if let Ok(id) = Uuid::parse_str(&r?) {
                ids.push(id);
            }
        }
        Ok(ids)
    }

    /// All runs in a closed time range, oldest first, for analytics.
    pub fn in_range(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        url: Option<&str>,
    ) -> Result<Vec<RunRecord>> {
        let conn = self.pool.get()?;
        let mut records = Vec::new();
        if let Some(url) = url {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM runs WHERE created_at >= ?1 AND created_at <= ?2 AND url = ?3
                 ORDER BY created_at ASC",
                RUN_COLUMNS
            ))?;
            let rows = stmt.query_map(
                params![from.to_rfc3339(), to.to_rfc3339(), url],
                row_to_record,
            )?;
            for r in rows {
                records.push(r?);
            }
        } else {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM runs WHERE created_at >= ?1 AND created_at <= ?2
                 ORDER BY created_at ASC",
                RUN_COLUMNS
            ))?;
            let rows =
                stmt.query_map(params![from.to_rfc3339(), to.to_rfc3339()], row_to_record)?;
            for r in rows {
                records.push(r?);
            }
        }
        Ok(records)
    }
}

const RUN_COLUMNS: &str = "id, schedule_id, url, form_config_json, user_data_json, status,
     started_at, finished_at, logs_json, errors_json, screenshots_json,
     duration_ms, fields_processed, errors_count";

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<RunRecord> {
    let parse_err =
        |e: String| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, e.into());

    let id: String = row.get(0)?;
    let schedule_id: Option<String> = row.get(1)?;
    let status_str: String = row.get(5)?;
    let started: String = row.get(6)?;
    let finished: Option<String> = row.get(7)?;
    let logs: String = row.get(8)?;
    let errors: String = row.get(9)?;
    let screenshots: String = row.get(10)?;
    let duration_ms: Option<i64> = row.get(11)?;
    let fields_processed: Option<i64> = row.get(12)?;
    let errors_count: Option<i64> = row.get(13)?;

    let form_config: String = row.get(3)?;
    let user_data: String = row.get(4)?;

    let metrics = match (duration_ms, fields_processed, errors_count) {
        (Some(d), Some(f), Some(e)) => Some(super::RunMetrics {
            duration_ms: d,
            fields_processed: f as usize,
            errors_count: e as usize,
        }),
        _ => None,
    };

    Ok(RunRecord {
        id: Uuid::parse_str(&id).map_err(|e| parse_err(e.to_string()))?,
        schedule_id: schedule_id.and_then(|s| Uuid::parse_str(&s).ok()),
        url: row.get(2)?,
        form_config: serde_json::from_str(&form_config).map_err(|e| parse_err(e.to_string()))?,
        user_data: serde_json::from_str(&user_data).map_err(|e| parse_err(e.to_string()))?,
        status: RunStatus::parse(&status_str).unwrap_or(RunStatus::Failed),
        start_time: parse_ts(&started).map_err(|e| parse_err(e))?,
        end_time: match finished {
            Some(t) => Some(parse_ts(&t).map_err(parse_err)?),
            None => None,
        },
        logs: serde_json::from_str(&logs).map_err(|e| parse_err(e.to_string()))?,
        errors: serde_json::from_str(&errors).map_err(|e| parse_err(e.to_string()))?,
        screenshots: serde_json::from_str(&screenshots).map_err(|e| parse_err(e.to_string()))?,
        metrics,
    })
}

fn parse_ts(s: &str) -> std::result::Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::{FormConfig, RunMetrics};
    use std::collections::HashMap;

    fn test_pool() -> (tempfile::TempDir, Pool) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");
        let pool = crate::storage::open_pool(path.to_str().unwrap()).unwrap();
        (dir, pool)
    }

    fn sample_config() -> FormConfig {
        serde_json::from_value(serde_json::json!({
            "fields": [
                {"name": "email", "type": "email", "selector": "#email", "required": true}
            ],
            "submitButtonSelector": "#go"
        }))
        .unwrap()
    }

    #[test]
    fn save_then_get_roundtrips() {
        let (_dir, pool) = test_pool();
        let store = RunStore::new(pool);

        let mut rec = RunRecord::start(
            None,
            "https://x.test/login".to_string(),
            sample_config(),
            HashMap::new(),
        );
        store.save(&rec).unwrap();

        // mutate as the executor would, then persist the terminal state
        rec.log("navigated");
        rec.status = RunStatus::Success;
        rec.end_time = Some(Utc::now());
        rec.metrics = Some(RunMetrics {
            duration_ms: 1200,
            fields_processed: 1,
            errors_count: 0,
        });
        store.save(&rec).unwrap();

        let loaded = store.get(rec.id).unwrap().unwrap();
        assert_eq!(loaded.status, RunStatus::Success);
        assert_eq!(loaded.logs, vec!["navigated".to_string()]);
        assert_eq!(loaded.metrics.unwrap().fields_processed, 1);
    }

    #[test]
    fn get_unknown_id_is_none() {
        let (_dir, pool) = test_pool();
        let store = RunStore::new(pool);
        assert!(store.get(Uuid::new_v4()).unwrap().is_none());
    }

    #[test]
    fn list_paginates_with_opaque_token() {
        let (_dir, pool) = test_pool();
        let store = RunStore::new(pool);

        for i in 0..5 {
            let mut rec = RunRecord::start(
                None,
                format!("https://x.test/{}", i),
                sample_config(),
                HashMap::new(),
            );
            // spread creation times so ordering is deterministic
            rec.start_time = Utc::now() - chrono::Duration::seconds(10 - i);
            store.save(&rec).unwrap();
        }

        let (page1, token) = store.list(3, None, None).unwrap();
        assert_eq!(page1.len(), 3);
        let token = token.expect("more rows remain");

        let (page2, token2) = store.list(3, Some(&token), None).unwrap();
        assert_eq!(page2.len(), 2);
        assert!(token2.is_none());

        // no overlap between pages
        let ids1: Vec<_> = page1.iter().map(|r| r.id).collect();
        assert!(page2.iter().all(|r| !ids1.contains(&r.id)));
    }

    #[test]
    fn page_token_roundtrip_and_garbage() {
        let t = encode_page_token(40);
        assert_eq!(decode_page_token(&t), Some(40));
        assert_eq!(decode_page_token("not-a-token"), None);
    }

    #[test]
    fn url_filter_applies() {
        let (_dir, pool) = test_pool();
        let store = RunStore::new(pool);

        for url in ["https://a.test", "https://a.test", "https://b.test"] {
            let rec = RunRecord::start(None, url.to_string(), sample_config(), HashMap::new());
            store.save(&rec).unwrap();
        }

        let (page, _) = store.list(10, None, Some("https://a.test")).unwrap();
        assert_eq!(page.len(), 2);
    }
}
