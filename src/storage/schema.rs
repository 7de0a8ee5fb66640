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

        CREATE TABLE IF NOT EXISTS reports (
            report_id TEXT PRIMARY KEY,
            suite_type TEXT NOT NULL,
            environment TEXT NOT NULL DEFAULT '',
            status TEXT NOT NULL,
            total_tests INTEGER NOT NULL DEFAULT 0,
            passed_tests INTEGER NOT NULL DEFAULT 0,
            failed_tests INTEGER NOT NULL DEFAULT 0,
            skipped_tests INTEGER NOT NULL DEFAULT 0,
            success_rate REAL NOT NULL DEFAULT 0,
            started_at TEXT NOT NULL,
            finished_at TEXT,
            duration_ms INTEGER,
            created_by TEXT NOT NULL,
            trigger_type TEXT NOT NULL,
            report_path TEXT,
            message TEXT
        );

        CREATE TABLE IF NOT EXISTS test_details (
            id INTEGER PRIMARY KEY,
            report_id TEXT NOT NULL,
            test_name TEXT NOT NULL,
            status TEXT NOT NULL,
            start_time TEXT NOT NULL,
            end_time TEXT NOT NULL,
            duration_ms INTEGER NOT NULL,
            error_message TEXT,
            artifact_ref TEXT,
            test_type TEXT NOT NULL,
            FOREIGN KEY (report_id) REFERENCES reports(report_id)
        );

        CREATE TABLE IF NOT EXISTS schedules (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            cron_expr TEXT NOT NULL,
            target_suite TEXT NOT NULL,
            environment TEXT NOT NULL DEFAULT '',
            parallelism INTEGER NOT NULL DEFAULT 1,
            enabled INTEGER NOT NULL DEFAULT 1,
            last_run_at TEXT,
            next_run_at TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_reports_started ON reports(started_at);
        CREATE INDEX IF NOT EXISTS idx_reports_suite ON reports(suite_type);
        CREATE INDEX IF NOT EXISTS idx_test_details_report ON test_details(report_id);
        CREATE INDEX IF NOT EXISTS idx_test_details_start ON test_details(start_time);
        CREATE INDEX IF NOT EXISTS idx_test_details_name ON test_details(test_name);",
    )?;

    Ok(())
}
