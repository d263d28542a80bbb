//! Execution persistence: rows, node associations, run samples.

use std::collections::HashMap;

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::types::Type;
use rusqlite::{params, OptionalExtension, Row};
use serde::de::DeserializeOwned;

use super::script::apply_threads;
use super::{
    Execution, ExecutionCase, ExecutionStatus, NewExecution, NodeOutcome, ScriptType,
    ThreadConfig,
};
use crate::judge::{CaseSample, SampleSummary, UsageSummary};
use crate::storage::{self, parse_ts, Pool};

const EXECUTION_COLUMNS: &str = "id, tenant_id, script_type, script_source_id, status, \
     thread_config, original_thread_config, trial, debug, node_count, node_pool, strategy, \
     schedule_count, schedule_result, schedule_time, start_time, end_time, script, indicator, \
     failure_message";

/// Samples a runner reported for one execution.
#[derive(Debug, Clone, Default)]
pub struct RunSamples {
    pub summary: Option<SampleSummary>,
    pub usage: Vec<UsageSummary>,
    pub cases: Vec<CaseSample>,
}

/// Repository over the `executions` table and its satellites.
#[derive(Clone)]
pub struct ExecutionStore {
    pool: Pool,
}

impl ExecutionStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Insert a new PENDING execution and return its id.
    ///
    /// The thread configuration is written into the script up front. A script
    /// that cannot be rewritten is stored verbatim; `start` reports it.
    pub async fn create(&self, new: NewExecution) -> Result<i64> {
        storage::with_conn(&self.pool, move |conn| {
            let script = apply_threads(&new.script, &new.threads).unwrap_or(new.script.clone());
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO executions (tenant_id, script_type, script_source_id, status,
                    thread_config, original_thread_config, trial, debug, node_count, node_pool,
                    strategy, script, indicator)
                 VALUES (?1, ?2, ?3, 'PENDING', ?4, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    new.tenant_id,
                    new.script_type.as_str(),
                    new.script_source_id,
                    serde_json::to_string(&new.threads)?,
                    new.trial,
                    new.debug,
                    new.node_count,
                    new.node_pool.as_ref().map(serde_json::to_string).transpose()?,
                    new.strategy.as_ref().map(serde_json::to_string).transpose()?,
                    script,
                    new.indicator.as_ref().map(serde_json::to_string).transpose()?,
                ],
            )?;
            let id = tx.last_insert_rowid();
            for case in &new.cases {
                tx.execute(
                    "INSERT INTO execution_cases (execution_id, case_id, case_name, enabled)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![id, case.case_id, case.case_name, case.enabled],
                )?;
            }
            tx.commit()?;
            Ok(id)
        })
        .await
    }

    /// Load a live (not deleted) execution with its current node set.
    pub async fn get(&self, id: i64) -> Result<Option<Execution>> {
        storage::with_conn(&self.pool, move |conn| {
            let sql = format!(
                "SELECT {} FROM executions WHERE id = ?1 AND deleted_at IS NULL",
                EXECUTION_COLUMNS
            );
            let exec = conn.query_row(&sql, params![id], map_execution).optional()?;
            let Some(mut exec) = exec else {
                return Ok(None);
            };
            let mut stmt = conn.prepare(
                "SELECT node_id FROM execution_nodes WHERE execution_id = ?1 ORDER BY node_id",
            )?;
            exec.node_ids = stmt
                .query_map(params![id], |row| row.get::<_, i64>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(Some(exec))
        })
        .await
    }

    pub async fn status(&self, id: i64) -> Result<Option<ExecutionStatus>> {
        storage::with_conn(&self.pool, move |conn| {
            let raw: Option<String> = conn
                .query_row(
                    "SELECT status FROM executions WHERE id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()?;
            raw.map(|s| s.parse()).transpose()
        })
        .await
    }

    /// Replace the load configuration, writing it back into the script.
    pub async fn update_threads(&self, id: i64, threads: ThreadConfig) -> Result<()> {
        storage::with_conn(&self.pool, move |conn| {
            let script: String = conn
                .query_row(
                    "SELECT script FROM executions WHERE id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .with_context(|| format!("execution {} not found", id))?;
            let script = apply_threads(&script, &threads)?;
            let json = serde_json::to_string(&threads)?;
            conn.execute(
                "UPDATE executions
                 SET thread_config = ?2, original_thread_config = ?2, script = ?3,
                     updated_at = datetime('now')
                 WHERE id = ?1",
                params![id, json, script],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn set_status(&self, id: i64, status: ExecutionStatus) -> Result<()> {
        storage::with_conn(&self.pool, move |conn| {
            conn.execute(
                "UPDATE executions SET status = ?2, updated_at = datetime('now') WHERE id = ?1",
                params![id, status.as_str()],
            )?;
            Ok(())
        })
        .await
    }

    /// Persist the outcome of one scheduling attempt.
    pub async fn record_schedule(
        &self,
        id: i64,
        status: ExecutionStatus,
        outcomes: Vec<NodeOutcome>,
        failure_message: Option<String>,
    ) -> Result<()> {
        storage::with_conn(&self.pool, move |conn| {
            let now = Utc::now().to_rfc3339();
            conn.execute(
                "UPDATE executions
                 SET status = ?2,
                     schedule_result = ?3,
                     schedule_count = schedule_count + 1,
                     schedule_time = ?4,
                     failure_message = COALESCE(?5, failure_message),
                     start_time = CASE WHEN ?2 = 'RUNNING' AND start_time IS NULL
                                       THEN ?4 ELSE start_time END,
                     updated_at = datetime('now')
                 WHERE id = ?1",
                params![
                    id,
                    status.as_str(),
                    serde_json::to_string(&outcomes)?,
                    now,
                    failure_message
                ],
            )?;
            Ok(())
        })
        .await
    }

    /// Count RUNNING executions of a tenant, ignoring `exclude`.
    pub async fn count_running(&self, tenant_id: i64, exclude: i64) -> Result<u32> {
        storage::with_conn(&self.pool, move |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM executions
                 WHERE tenant_id = ?1 AND status = 'RUNNING' AND id != ?2
                   AND deleted_at IS NULL",
                params![tenant_id, exclude],
                |row| row.get(0),
            )?;
            Ok(count as u32)
        })
        .await
    }

    /// Forget everything a previous run left behind: node associations and
    /// samples. Safe to repeat.
    pub async fn clear_run_state(&self, id: i64) -> Result<()> {
        storage::with_conn(&self.pool, move |conn| {
            let tx = conn.transaction()?;
            for table in [
                "execution_nodes",
                "execution_samples",
                "node_usage",
                "case_samples",
            ] {
                tx.execute(
                    &format!("DELETE FROM {} WHERE execution_id = ?1", table),
                    params![id],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    pub async fn node_ids(&self, id: i64) -> Result<Vec<i64>> {
        storage::with_conn(&self.pool, move |conn| {
            let mut stmt = conn.prepare(
                "SELECT node_id FROM execution_nodes WHERE execution_id = ?1 ORDER BY node_id",
            )?;
            let ids = stmt
                .query_map(params![id], |row| row.get::<_, i64>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(ids)
        })
        .await
    }

    pub async fn add_nodes(&self, id: i64, node_ids: Vec<i64>) -> Result<()> {
        if node_ids.is_empty() {
            return Ok(());
        }
        storage::with_conn(&self.pool, move |conn| {
            let tx = conn.transaction()?;
            for node_id in node_ids {
                tx.execute(
                    "INSERT OR IGNORE INTO execution_nodes (execution_id, node_id) VALUES (?1, ?2)",
                    params![id, node_id],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    pub async fn remove_nodes(&self, id: i64, node_ids: Vec<i64>) -> Result<()> {
        if node_ids.is_empty() {
            return Ok(());
        }
        storage::with_conn(&self.pool, move |conn| {
            let tx = conn.transaction()?;
            for node_id in node_ids {
                tx.execute(
                    "DELETE FROM execution_nodes WHERE execution_id = ?1 AND node_id = ?2",
                    params![id, node_id],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    /// Final status flip after a stop round. Executions already in a terminal
    /// state are left alone; returns the status in force afterwards.
    pub async fn settle_stop(&self, id: i64, all_stopped: bool) -> Result<Option<ExecutionStatus>> {
        storage::with_conn(&self.pool, move |conn| {
            let (status, end_time) = if all_stopped {
                (ExecutionStatus::Stopped, Some(Utc::now().to_rfc3339()))
            } else {
                (ExecutionStatus::Running, None)
            };
            conn.execute(
                "UPDATE executions
                 SET status = ?2, end_time = COALESCE(?3, end_time), updated_at = datetime('now')
                 WHERE id = ?1 AND status NOT IN ('COMPLETED', 'FAILED', 'STOPPED')",
                params![id, status.as_str(), end_time],
            )?;
            let raw: Option<String> = conn
                .query_row(
                    "SELECT status FROM executions WHERE id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()?;
            raw.map(|s| s.parse()).transpose()
        })
        .await
    }

    /// Mark a run finished with the status the runner reported.
    pub async fn finish(
        &self,
        id: i64,
        status: ExecutionStatus,
        failure_message: Option<String>,
    ) -> Result<()> {
        storage::with_conn(&self.pool, move |conn| {
            conn.execute(
                "UPDATE executions
                 SET status = ?2, end_time = ?3,
                     failure_message = COALESCE(?4, failure_message),
                     updated_at = datetime('now')
                 WHERE id = ?1",
                params![id, status.as_str(), Utc::now().to_rfc3339(), failure_message],
            )?;
            Ok(())
        })
        .await
    }

    /// Soft-delete: the row stays for historical results but is no longer
    /// visible. Node associations go away; case results are untouched.
    pub async fn soft_delete(&self, id: i64) -> Result<()> {
        storage::with_conn(&self.pool, move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "UPDATE executions SET deleted_at = ?2, updated_at = datetime('now')
                 WHERE id = ?1 AND deleted_at IS NULL",
                params![id, Utc::now().to_rfc3339()],
            )?;
            tx.execute(
                "DELETE FROM execution_nodes WHERE execution_id = ?1",
                params![id],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    /// PENDING executions still eligible for an automatic retry.
    pub async fn pending_for_retry(&self, max_attempts: u32) -> Result<Vec<i64>> {
        storage::with_conn(&self.pool, move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id FROM executions
                 WHERE status = 'PENDING' AND deleted_at IS NULL AND schedule_count < ?1
                 ORDER BY id",
            )?;
            let ids = stmt
                .query_map(params![max_attempts], |row| row.get::<_, i64>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(ids)
        })
        .await
    }

    pub async fn cases(&self, id: i64) -> Result<Vec<ExecutionCase>> {
        storage::with_conn(&self.pool, move |conn| {
            let mut stmt = conn.prepare(
                "SELECT case_id, case_name, enabled FROM execution_cases
                 WHERE execution_id = ?1 ORDER BY case_id",
            )?;
            let cases = stmt
                .query_map(params![id], |row| {
                    Ok(ExecutionCase {
                        case_id: row.get(0)?,
                        case_name: row.get(1)?,
                        enabled: row.get(2)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(cases)
        })
        .await
    }

    /// Store the samples of a finished run, replacing earlier ones.
    pub async fn save_samples(&self, id: i64, samples: RunSamples) -> Result<()> {
        storage::with_conn(&self.pool, move |conn| {
            let tx = conn.transaction()?;
            for table in ["execution_samples", "node_usage", "case_samples"] {
                tx.execute(
                    &format!("DELETE FROM {} WHERE execution_id = ?1", table),
                    params![id],
                )?;
            }
            if let Some(summary) = &samples.summary {
                tx.execute(
                    "INSERT INTO execution_samples (execution_id, summary_json) VALUES (?1, ?2)",
                    params![id, serde_json::to_string(summary)?],
                )?;
            }
            for usage in &samples.usage {
                tx.execute(
                    "INSERT OR REPLACE INTO node_usage (execution_id, node_id, usage_json)
                     VALUES (?1, ?2, ?3)",
                    params![id, usage.node_id, serde_json::to_string(usage)?],
                )?;
            }
            for case in &samples.cases {
                tx.execute(
                    "INSERT INTO case_samples (execution_id, case_name, success, message)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![id, case.case_name, case.success, case.message],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    pub async fn load_samples(&self, id: i64) -> Result<RunSamples> {
        storage::with_conn(&self.pool, move |conn| {
            let summary: Option<String> = conn
                .query_row(
                    "SELECT summary_json FROM execution_samples WHERE execution_id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()?;
            let summary = summary.map(|s| serde_json::from_str(&s)).transpose()?;

            let mut stmt = conn.prepare(
                "SELECT usage_json FROM node_usage WHERE execution_id = ?1 ORDER BY node_id",
            )?;
            let usage = stmt
                .query_map(params![id], |row| row.get::<_, String>(0))?
                .map(|raw| Ok(serde_json::from_str::<UsageSummary>(&raw?)?))
                .collect::<Result<Vec<_>>>()?;

            let mut stmt = conn.prepare(
                "SELECT case_name, success, message FROM case_samples
                 WHERE execution_id = ?1 ORDER BY id",
            )?;
            let cases = stmt
                .query_map(params![id], |row| {
                    Ok(CaseSample {
                        case_name: row.get(0)?,
                        success: row.get(1)?,
                        message: row.get(2)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            Ok(RunSamples {
                summary,
                usage,
                cases,
            })
        })
        .await
    }

    /// Status histogram, for the CLI and health output.
    pub async fn status_counts(&self) -> Result<HashMap<String, i64>> {
        storage::with_conn(&self.pool, |conn| {
            let mut stmt = conn.prepare(
                "SELECT status, COUNT(*) FROM executions WHERE deleted_at IS NULL GROUP BY status",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?;
            let mut counts = HashMap::new();
            for r in rows {
                let (status, count) = r?;
                counts.insert(status, count);
            }
            Ok(counts)
        })
        .await
    }
}

fn json_col<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn opt_json_col<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<T>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| {
        serde_json::from_str(&s)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
    })
    .transpose()
}

fn parsed_col<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: std::str::FromStr<Err = anyhow::Error>,
{
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e: anyhow::Error| {
        rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into())
    })
}

fn map_execution(row: &Row<'_>) -> rusqlite::Result<Execution> {
    Ok(Execution {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        script_type: parsed_col::<ScriptType>(row, 2)?,
        script_source_id: row.get(3)?,
        status: parsed_col::<ExecutionStatus>(row, 4)?,
        threads: json_col(row, 5)?,
        original_threads: opt_json_col(row, 6)?,
        trial: row.get(7)?,
        debug: row.get(8)?,
        node_count: row.get(9)?,
        node_pool: opt_json_col(row, 10)?,
        strategy: opt_json_col(row, 11)?,
        node_ids: Vec::new(),
        schedule_count: row.get(12)?,
        schedule_result: json_col(row, 13)?,
        schedule_time: parse_ts(row.get(14)?),
        start_time: parse_ts(row.get(15)?),
        end_time: parse_ts(row.get(16)?),
        script: row.get(17)?,
        indicator: opt_json_col(row, 18)?,
        failure_message: row.get(19)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::{OutcomeKind, RampConfig};
    use crate::storage::open_pool;

    fn store() -> (tempfile::TempDir, ExecutionStore) {
        let dir = tempfile::TempDir::new().unwrap();
        let pool = open_pool(dir.path().join("exec.db").to_str().unwrap()).unwrap();
        (dir, ExecutionStore::new(pool))
    }

    fn new_execution() -> NewExecution {
        NewExecution {
            tenant_id: 7,
            script_type: ScriptType::Performance,
            script_source_id: Some(70),
            threads: ThreadConfig {
                thread_count: 10,
                iteration_count: 200,
                ramp: Some(RampConfig {
                    ramp_up_threads: 4,
                    ramp_down_threads: 2,
                    ramp_up_secs: 30,
                    ramp_down_secs: 10,
                }),
                duration_secs: None,
            },
            trial: false,
            debug: false,
            node_count: 2,
            node_pool: None,
            strategy: None,
            script: r#"{"name":"login"}"#.to_string(),
            indicator: None,
            cases: vec![ExecutionCase {
                case_id: 1,
                case_name: "login ok".into(),
                enabled: true,
            }],
        }
    }

    #[tokio::test]
    async fn test_create_writes_threads_into_script() {
        let (_dir, store) = store();
        let id = store.create(new_execution()).await.unwrap();
        let exec = store.get(id).await.unwrap().unwrap();

        assert_eq!(exec.status, ExecutionStatus::Pending);
        assert_eq!(exec.original_threads, Some(exec.threads));
        let doc: serde_json::Value = serde_json::from_str(&exec.script).unwrap();
        assert_eq!(doc["thread_group"]["thread_count"], 10);
        assert_eq!(doc["thread_group"]["ramp_up_threads"], 4);
        assert_eq!(store.cases(id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_update_threads_rewrites_script() {
        let (_dir, store) = store();
        let id = store.create(new_execution()).await.unwrap();
        let threads = ThreadConfig {
            thread_count: 3,
            iteration_count: 9,
            ramp: None,
            duration_secs: Some(60),
        };
        store.update_threads(id, threads).await.unwrap();

        let exec = store.get(id).await.unwrap().unwrap();
        assert_eq!(exec.threads, threads);
        let doc: serde_json::Value = serde_json::from_str(&exec.script).unwrap();
        assert_eq!(doc["thread_group"]["thread_count"], 3);
        assert_eq!(doc["thread_group"]["duration_secs"], 60);
        assert!(doc["thread_group"].get("ramp_up_threads").is_none());
    }

    #[tokio::test]
    async fn test_record_schedule_sets_start_time_once() {
        let (_dir, store) = store();
        let id = store.create(new_execution()).await.unwrap();
        let outcomes = vec![NodeOutcome::accepted(1, "ok")];
        store
            .record_schedule(id, ExecutionStatus::Running, outcomes.clone(), None)
            .await
            .unwrap();
        let first = store.get(id).await.unwrap().unwrap();
        assert_eq!(first.schedule_count, 1);
        assert_eq!(first.schedule_result, outcomes);
        let started = first.start_time.unwrap();

        store
            .record_schedule(id, ExecutionStatus::Running, outcomes, None)
            .await
            .unwrap();
        let second = store.get(id).await.unwrap().unwrap();
        assert_eq!(second.schedule_count, 2);
        assert_eq!(second.start_time.unwrap(), started);
    }

    #[tokio::test]
    async fn test_settle_stop_leaves_terminal_states() {
        let (_dir, store) = store();
        let id = store.create(new_execution()).await.unwrap();
        store.set_status(id, ExecutionStatus::Running).await.unwrap();

        let status = store.settle_stop(id, false).await.unwrap();
        assert_eq!(status, Some(ExecutionStatus::Running));
        let status = store.settle_stop(id, true).await.unwrap();
        assert_eq!(status, Some(ExecutionStatus::Stopped));

        store.set_status(id, ExecutionStatus::Completed).await.unwrap();
        let status = store.settle_stop(id, true).await.unwrap();
        assert_eq!(status, Some(ExecutionStatus::Completed));
    }

    #[tokio::test]
    async fn test_node_associations_and_soft_delete() {
        let (_dir, store) = store();
        let id = store.create(new_execution()).await.unwrap();
        store.add_nodes(id, vec![2, 1, 2]).await.unwrap();
        assert_eq!(store.node_ids(id).await.unwrap(), vec![1, 2]);

        store.remove_nodes(id, vec![1]).await.unwrap();
        assert_eq!(store.node_ids(id).await.unwrap(), vec![2]);

        store.soft_delete(id).await.unwrap();
        assert!(store.get(id).await.unwrap().is_none());
        assert!(store.node_ids(id).await.unwrap().is_empty());
        // Case associations survive deletion.
        assert_eq!(store.cases(id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_samples_round_trip_and_clear() {
        let (_dir, store) = store();
        let id = store.create(new_execution()).await.unwrap();
        let samples = RunSamples {
            summary: Some(SampleSummary {
                tps: 120.0,
                ..SampleSummary::default()
            }),
            usage: vec![UsageSummary {
                node_id: 3,
                cpu_mean: Some(40.0),
                ..UsageSummary::default()
            }],
            cases: vec![CaseSample {
                case_name: "login ok".into(),
                success: Some(true),
                message: None,
            }],
        };
        store.save_samples(id, samples).await.unwrap();

        let loaded = store.load_samples(id).await.unwrap();
        assert_eq!(loaded.summary.unwrap().tps, 120.0);
        assert_eq!(loaded.usage[0].node_id, 3);
        assert_eq!(loaded.cases[0].success, Some(true));

        store.clear_run_state(id).await.unwrap();
        let cleared = store.load_samples(id).await.unwrap();
        assert!(cleared.summary.is_none());
        assert!(cleared.usage.is_empty());
        assert!(cleared.cases.is_empty());
    }

    #[tokio::test]
    async fn test_count_running_and_pending_for_retry() {
        let (_dir, store) = store();
        let a = store.create(new_execution()).await.unwrap();
        let b = store.create(new_execution()).await.unwrap();
        store.set_status(a, ExecutionStatus::Running).await.unwrap();

        assert_eq!(store.count_running(7, b).await.unwrap(), 1);
        assert_eq!(store.count_running(7, a).await.unwrap(), 0);
        assert_eq!(store.pending_for_retry(10).await.unwrap(), vec![b]);

        let failure = NodeOutcome::failed(None, OutcomeKind::Scheduling, "no nodes");
        store
            .record_schedule(b, ExecutionStatus::Pending, vec![failure], None)
            .await
            .unwrap();
        assert!(store.pending_for_retry(1).await.unwrap().is_empty());
    }
}
