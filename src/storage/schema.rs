//! Database schema and migrations.

use anyhow::Result;
use rusqlite::Connection;

/// Run all pending migrations.
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS schedules (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            description TEXT,
            url TEXT NOT NULL,
            form_config_json TEXT NOT NULL,
            user_data_json TEXT NOT NULL,
            frequency TEXT NOT NULL,
            specific_time TEXT,
            cron_expr TEXT NOT NULL,
            active INTEGER NOT NULL DEFAULT 1,
            rule_arn TEXT,
            last_run_at TEXT,
            next_run_at TEXT,
            last_test_id TEXT,
            last_test_status TEXT,
            stats_total INTEGER NOT NULL DEFAULT 0,
            stats_success INTEGER NOT NULL DEFAULT 0,
            stats_failed INTEGER NOT NULL DEFAULT 0,
            version INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS runs (
            id TEXT PRIMARY KEY,
            schedule_id TEXT REFERENCES schedules(id) ON DELETE SET NULL,
            url TEXT NOT NULL,
            form_config_json TEXT NOT NULL,
            user_data_json TEXT NOT NULL,
            status TEXT NOT NULL,
            started_at TEXT NOT NULL,
            finished_at TEXT,
            logs_json TEXT NOT NULL DEFAULT '[]',
            errors_json TEXT NOT NULL DEFAULT '[]',
            screenshots_json TEXT NOT NULL DEFAULT '{}',
            duration_ms INTEGER,
            fields_processed INTEGER,
            errors_count INTEGER,
            stats_recorded INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS timer_rules (
            name TEXT PRIMARY KEY,
            rule_arn TEXT NOT NULL,
            schedule_id TEXT NOT NULL,
            schedule_expr TEXT NOT NULL,
            payload_json TEXT NOT NULL,
            enabled INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_schedules_next_run ON schedules(next_run_at);
        CREATE INDEX IF NOT EXISTS idx_runs_url_created ON runs(url, created_at);
        CREATE INDEX IF NOT EXISTS idx_runs_schedule ON runs(schedule_id);
        CREATE INDEX IF NOT EXISTS idx_runs_created ON runs(created_at);",
    )?;

    Ok(())
}
