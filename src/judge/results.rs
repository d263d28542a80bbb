//! Persisted test results.
//!
//! There is at most one current `test_results` row per
//! `(script_type, script_source_id)`. Re-running the same logical script
//! updates that row and bumps its counters; stale rows are purged.

use anyhow::Result;
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use super::{CaseSample, CaseVerdict, Indicator, SampleSummary, UsageSummary, Verdict};
use crate::execution::store::RunSamples;
use crate::execution::{Execution, ScriptType};
use crate::storage::{self, Pool};

/// Pass/fail tally of the per-case samples of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssertionSummary {
    pub total: u32,
    pub passed: u32,
    pub failed: u32,
}

impl AssertionSummary {
    pub fn from_samples(samples: &[CaseSample]) -> Self {
        let passed = samples.iter().filter(|s| s.success == Some(true)).count() as u32;
        let total = samples.len() as u32;
        Self {
            total,
            passed,
            failed: total - passed,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestResult {
    pub id: i64,
    pub script_type: ScriptType,
    pub script_source_id: i64,
    /// Execution that produced the latest verdict.
    pub execution_id: i64,
    pub passed: bool,
    pub failure_reason: Option<String>,
    pub usage_failed_node_id: Option<i64>,
    /// Indicator as it was when the run was judged.
    pub indicator: Option<Indicator>,
    pub summary: Option<SampleSummary>,
    pub assertions: AssertionSummary,
    pub usage: Vec<UsageSummary>,
    pub times_run: u32,
    pub times_failed: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCaseResult {
    pub case_id: i64,
    pub execution_id: i64,
    pub passed: Option<bool>,
    pub failure_reason: Option<String>,
}

#[derive(Clone)]
pub struct ResultStore {
    pool: Pool,
}

impl ResultStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Write the verdict of `exec` into the current result row of its script.
    pub async fn record(
        &self,
        exec: &Execution,
        verdict: &Verdict,
        samples: &RunSamples,
        cases: &[CaseVerdict],
    ) -> Result<TestResult> {
        let script_type = exec.script_type;
        let source_id = exec.result_source_id();
        let execution_id = exec.id;
        let verdict = verdict.clone();
        let indicator_json = exec.indicator.as_ref().map(serde_json::to_string).transpose()?;
        let summary_json = samples.summary.as_ref().map(serde_json::to_string).transpose()?;
        let assertion_json = serde_json::to_string(&AssertionSummary::from_samples(&samples.cases))?;
        let usage_json = serde_json::to_string(&samples.usage)?;
        let cases = cases.to_vec();

        let id = storage::with_conn(&self.pool, move |conn| {
            let tx = conn.transaction()?;
            let current: Option<i64> = tx
                .query_row(
                    "SELECT id FROM test_results
                     WHERE script_type = ?1 AND script_source_id = ?2
                     ORDER BY id DESC LIMIT 1",
                    params![script_type.as_str(), source_id],
                    |row| row.get(0),
                )
                .optional()?;

            let id = match current {
                Some(id) => {
                    tx.execute(
                        "UPDATE test_results
                         SET execution_id = ?2, passed = ?3, failure_reason = ?4,
                             usage_failed_node_id = ?5, indicator_json = ?6, summary_json = ?7,
                             assertion_json = ?8, usage_json = ?9,
                             times_run = times_run + 1,
                             times_failed = times_failed + ?10,
                             updated_at = datetime('now')
                         WHERE id = ?1",
                        params![
                            id,
                            execution_id,
                            verdict.passed,
                            verdict.reason,
                            verdict.usage_failed_node_id,
                            indicator_json,
                            summary_json,
                            assertion_json,
                            usage_json,
                            i64::from(!verdict.passed)
                        ],
                    )?;
                    id
                }
                None => {
                    tx.execute(
                        "INSERT INTO test_results (script_type, script_source_id, execution_id,
                            passed, failure_reason, usage_failed_node_id, indicator_json,
                            summary_json, assertion_json, usage_json, times_run, times_failed)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 1, ?11)",
                        params![
                            script_type.as_str(),
                            source_id,
                            execution_id,
                            verdict.passed,
                            verdict.reason,
                            verdict.usage_failed_node_id,
                            indicator_json,
                            summary_json,
                            assertion_json,
                            usage_json,
                            i64::from(!verdict.passed)
                        ],
                    )?;
                    tx.last_insert_rowid()
                }
            };

            tx.execute(
                "DELETE FROM test_case_results WHERE result_id IN (
                    SELECT id FROM test_results
                    WHERE script_type = ?1 AND script_source_id = ?2 AND id != ?3)",
                params![script_type.as_str(), source_id, id],
            )?;
            tx.execute(
                "DELETE FROM test_results
                 WHERE script_type = ?1 AND script_source_id = ?2 AND id != ?3",
                params![script_type.as_str(), source_id, id],
            )?;

            for case in &cases {
                tx.execute(
                    "INSERT INTO test_case_results (result_id, case_id, execution_id, passed,
                        failure_reason)
                     VALUES (?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT(result_id, case_id) DO UPDATE SET
                        execution_id = excluded.execution_id,
                        passed = excluded.passed,
                        failure_reason = excluded.failure_reason,
                        updated_at = datetime('now')",
                    params![id, case.case_id, execution_id, case.passed, case.reason],
                )?;
            }

            tx.commit()?;
            Ok(id)
        })
        .await?;

        self.by_id(id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("test result {} vanished after write", id))
    }

    /// The current result of a script, if it has run to completion before.
    pub async fn current(
        &self,
        script_type: ScriptType,
        script_source_id: i64,
    ) -> Result<Option<TestResult>> {
        storage::with_conn(&self.pool, move |conn| {
            let result = conn
                .query_row(
                    &format!(
                        "SELECT {} FROM test_results
                         WHERE script_type = ?1 AND script_source_id = ?2
                         ORDER BY id DESC LIMIT 1",
                        RESULT_COLUMNS
                    ),
                    params![script_type.as_str(), script_source_id],
                    map_result,
                )
                .optional()?;
            Ok(result)
        })
        .await
    }

    pub async fn by_id(&self, id: i64) -> Result<Option<TestResult>> {
        storage::with_conn(&self.pool, move |conn| {
            let result = conn
                .query_row(
                    &format!("SELECT {} FROM test_results WHERE id = ?1", RESULT_COLUMNS),
                    params![id],
                    map_result,
                )
                .optional()?;
            Ok(result)
        })
        .await
    }

    pub async fn case_results(&self, result_id: i64) -> Result<Vec<TestCaseResult>> {
        storage::with_conn(&self.pool, move |conn| {
            let mut stmt = conn.prepare(
                "SELECT case_id, execution_id, passed, failure_reason FROM test_case_results
                 WHERE result_id = ?1 ORDER BY case_id",
            )?;
            let rows = stmt
                .query_map(params![result_id], |row| {
                    Ok(TestCaseResult {
                        case_id: row.get(0)?,
                        execution_id: row.get(1)?,
                        passed: row.get(2)?,
                        failure_reason: row.get(3)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
    }
}

const RESULT_COLUMNS: &str = "id, script_type, script_source_id, execution_id, passed, \
     failure_reason, usage_failed_node_id, indicator_json, summary_json, assertion_json, \
     usage_json, times_run, times_failed";

fn json_err(idx: usize, e: impl std::error::Error + Send + Sync + 'static) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
}

fn map_result(row: &Row<'_>) -> rusqlite::Result<TestResult> {
    let opt_json = |idx: usize| -> rusqlite::Result<Option<String>> { row.get(idx) };

    let script_type: String = row.get(1)?;
    let script_type = script_type.parse::<ScriptType>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, e.into())
    })?;
    let indicator = opt_json(7)?
        .map(|raw| serde_json::from_str(&raw))
        .transpose()
        .map_err(|e| json_err(7, e))?;
    let summary = opt_json(8)?
        .map(|raw| serde_json::from_str(&raw))
        .transpose()
        .map_err(|e| json_err(8, e))?;
    let assertions = opt_json(9)?
        .map(|raw| serde_json::from_str(&raw))
        .transpose()
        .map_err(|e| json_err(9, e))?
        .unwrap_or_default();
    let usage = opt_json(10)?
        .map(|raw| serde_json::from_str(&raw))
        .transpose()
        .map_err(|e| json_err(10, e))?
        .unwrap_or_default();

    Ok(TestResult {
        id: row.get(0)?,
        script_type,
        script_source_id: row.get(2)?,
        execution_id: row.get(3)?,
        passed: row.get(4)?,
        failure_reason: row.get(5)?,
        usage_failed_node_id: row.get(6)?,
        indicator,
        summary,
        assertions,
        usage,
        times_run: row.get(11)?,
        times_failed: row.get(12)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::{ExecutionStatus, ThreadConfig};
    use crate::storage::open_pool;

    fn store() -> (tempfile::TempDir, ResultStore) {
        let dir = tempfile::TempDir::new().unwrap();
        let pool = open_pool(dir.path().join("results.db").to_str().unwrap()).unwrap();
        (dir, ResultStore::new(pool))
    }

    fn execution(id: i64) -> Execution {
        Execution {
            id,
            tenant_id: 1,
            script_type: ScriptType::Functional,
            script_source_id: Some(500),
            status: ExecutionStatus::Completed,
            threads: ThreadConfig {
                thread_count: 1,
                iteration_count: 1,
                ramp: None,
                duration_secs: None,
            },
            original_threads: None,
            trial: false,
            debug: false,
            node_count: 1,
            node_pool: None,
            strategy: None,
            node_ids: Vec::new(),
            schedule_count: 1,
            schedule_result: Vec::new(),
            schedule_time: None,
            start_time: None,
            end_time: None,
            script: "{}".into(),
            indicator: Some(Indicator {
                min_tps: Some(10.0),
                ..Indicator::default()
            }),
            failure_message: None,
        }
    }

    fn case_verdict(case_id: i64, passed: Option<bool>) -> CaseVerdict {
        CaseVerdict {
            case_id,
            case_name: format!("case-{}", case_id),
            passed,
            reason: None,
        }
    }

    #[tokio::test]
    async fn test_reruns_update_one_row_and_count() {
        let (_dir, store) = store();
        let samples = RunSamples {
            cases: vec![CaseSample {
                case_name: "case-1".into(),
                success: Some(true),
                message: None,
            }],
            ..RunSamples::default()
        };

        let first = store
            .record(&execution(1), &Verdict::pass(), &samples, &[case_verdict(1, Some(true))])
            .await
            .unwrap();
        assert_eq!((first.times_run, first.times_failed), (1, 0));
        assert_eq!(first.assertions.passed, 1);
        assert_eq!(first.indicator.unwrap().min_tps, Some(10.0));

        let second = store
            .record(
                &execution(2),
                &Verdict::fail("case-1 broke"),
                &samples,
                &[case_verdict(1, Some(false))],
            )
            .await
            .unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!((second.times_run, second.times_failed), (2, 1));
        assert_eq!(second.execution_id, 2);
        assert_eq!(second.failure_reason.as_deref(), Some("case-1 broke"));

        let cases = store.case_results(second.id).await.unwrap();
        assert_eq!(cases.len(), 1);
        assert_eq!(cases[0].passed, Some(false));
        assert_eq!(cases[0].execution_id, 2);
    }

    #[tokio::test]
    async fn test_stale_rows_are_purged() {
        let (_dir, store) = store();
        let pool = store.pool.clone();
        storage::with_conn(&pool, |conn| {
            for exec in [10, 11] {
                conn.execute(
                    "INSERT INTO test_results (script_type, script_source_id, execution_id, passed)
                     VALUES ('functional', 500, ?1, 1)",
                    params![exec],
                )?;
            }
            Ok(())
        })
        .await
        .unwrap();

        let result = store
            .record(&execution(12), &Verdict::pass(), &RunSamples::default(), &[])
            .await
            .unwrap();

        let remaining: i64 = storage::with_conn(&pool, |conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM test_results WHERE script_source_id = 500",
                [],
                |row| row.get(0),
            )?)
        })
        .await
        .unwrap();
        assert_eq!(remaining, 1);
        assert_eq!(result.times_run, 2);
        let current = store.current(ScriptType::Functional, 500).await.unwrap().unwrap();
        assert_eq!(current.id, result.id);
    }

    #[tokio::test]
    async fn test_disabled_case_is_stored_as_null() {
        let (_dir, store) = store();
        let result = store
            .record(
                &execution(1),
                &Verdict::pass(),
                &RunSamples::default(),
                &[case_verdict(1, Some(true)), case_verdict(2, None)],
            )
            .await
            .unwrap();
        let cases = store.case_results(result.id).await.unwrap();
        assert_eq!(cases[1].passed, None);
    }
}
