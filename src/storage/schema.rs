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

        CREATE TABLE IF NOT EXISTS executions (
            id INTEGER PRIMARY KEY,
            tenant_id INTEGER NOT NULL,
            script_type TEXT NOT NULL,
            script_source_id INTEGER,
            status TEXT NOT NULL DEFAULT 'PENDING',
            thread_config TEXT NOT NULL,
            original_thread_config TEXT,
            trial INTEGER NOT NULL DEFAULT 0,
            debug INTEGER NOT NULL DEFAULT 0,
            node_count INTEGER NOT NULL DEFAULT 1,
            node_pool TEXT,
            strategy TEXT,
            schedule_count INTEGER NOT NULL DEFAULT 0,
            schedule_result TEXT NOT NULL DEFAULT '[]',
            schedule_time TEXT,
            start_time TEXT,
            end_time TEXT,
            script TEXT NOT NULL DEFAULT '',
            indicator TEXT,
            failure_message TEXT,
            deleted_at TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS execution_nodes (
            execution_id INTEGER NOT NULL,
            node_id INTEGER NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            PRIMARY KEY (execution_id, node_id)
        );

        CREATE TABLE IF NOT EXISTS nodes (
            id INTEGER PRIMARY KEY,
            tenant_id INTEGER,
            name TEXT NOT NULL,
            controller_ip TEXT NOT NULL,
            enabled INTEGER NOT NULL DEFAULT 1,
            last_heartbeat_ms INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS locks (
            key TEXT PRIMARY KEY,
            token TEXT NOT NULL,
            expires_at_ms INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS execution_samples (
            execution_id INTEGER PRIMARY KEY,
            summary_json TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS node_usage (
            execution_id INTEGER NOT NULL,
            node_id INTEGER NOT NULL,
            usage_json TEXT NOT NULL,
            PRIMARY KEY (execution_id, node_id)
        );

        CREATE TABLE IF NOT EXISTS case_samples (
            id INTEGER PRIMARY KEY,
            execution_id INTEGER NOT NULL,
            case_name TEXT NOT NULL,
            success INTEGER,
            message TEXT
        );

        CREATE TABLE IF NOT EXISTS execution_cases (
            execution_id INTEGER NOT NULL,
            case_id INTEGER NOT NULL,
            case_name TEXT NOT NULL,
            enabled INTEGER NOT NULL DEFAULT 1,
            PRIMARY KEY (execution_id, case_id)
        );

        CREATE TABLE IF NOT EXISTS test_results (
            id INTEGER PRIMARY KEY,
            script_type TEXT NOT NULL,
            script_source_id INTEGER NOT NULL,
            execution_id INTEGER NOT NULL,
            passed INTEGER NOT NULL,
            failure_reason TEXT,
            usage_failed_node_id INTEGER,
            indicator_json TEXT,
            summary_json TEXT,
            assertion_json TEXT,
            usage_json TEXT,
            times_run INTEGER NOT NULL DEFAULT 1,
            times_failed INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS test_case_results (
            id INTEGER PRIMARY KEY,
            result_id INTEGER NOT NULL,
            case_id INTEGER NOT NULL,
            execution_id INTEGER NOT NULL,
            passed INTEGER,
            failure_reason TEXT,
            updated_at TEXT NOT NULL DEFAULT (datetime('now')),
            UNIQUE (result_id, case_id)
        );

        CREATE INDEX IF NOT EXISTS idx_executions_tenant_status ON executions(tenant_id, status);
        CREATE INDEX IF NOT EXISTS idx_execution_nodes_node ON execution_nodes(node_id);
        CREATE INDEX IF NOT EXISTS idx_nodes_controller ON nodes(controller_ip);
        CREATE INDEX IF NOT EXISTS idx_case_samples_execution ON case_samples(execution_id);
        CREATE INDEX IF NOT EXISTS idx_test_results_source ON test_results(script_type, script_source_id);",
    )?;

    Ok(())
}
