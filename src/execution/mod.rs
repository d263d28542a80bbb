//! Executions -- the unit of dispatch, its status machine and persistence.

pub mod script;
pub mod store;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::judge::Indicator;
use crate::nodes::SelectionStrategy;

pub use self::store::ExecutionStore;

/// Lifecycle status of an execution. Persisted as the upper-case name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Pending,
    Scheduling,
    Running,
    Completed,
    Failed,
    Stopped,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "PENDING",
            ExecutionStatus::Scheduling => "SCHEDULING",
            ExecutionStatus::Running => "RUNNING",
            ExecutionStatus::Completed => "COMPLETED",
            ExecutionStatus::Failed => "FAILED",
            ExecutionStatus::Stopped => "STOPPED",
        }
    }

    /// Terminal states. A stop request leaves these untouched.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Stopped
        )
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "PENDING" => ExecutionStatus::Pending,
            "SCHEDULING" => ExecutionStatus::Scheduling,
            "RUNNING" => ExecutionStatus::Running,
            "COMPLETED" => ExecutionStatus::Completed,
            "FAILED" => ExecutionStatus::Failed,
            "STOPPED" => ExecutionStatus::Stopped,
            other => anyhow::bail!("unknown execution status '{}'", other),
        })
    }
}

/// Kind of test script, which selects the judging rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptType {
    Functional,
    Performance,
    Stability,
    Customized,
}

impl ScriptType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScriptType::Functional => "functional",
            ScriptType::Performance => "performance",
            ScriptType::Stability => "stability",
            ScriptType::Customized => "customized",
        }
    }
}

impl FromStr for ScriptType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "functional" => ScriptType::Functional,
            "performance" => ScriptType::Performance,
            "stability" => ScriptType::Stability,
            "customized" => ScriptType::Customized,
            other => anyhow::bail!("unknown script type '{}'", other),
        })
    }
}

/// Ramp section of a thread group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RampConfig {
    pub ramp_up_threads: u32,
    pub ramp_down_threads: u32,
    #[serde(default)]
    pub ramp_up_secs: u64,
    #[serde(default)]
    pub ramp_down_secs: u64,
}

/// Load parameters of an execution (or of one shard of it).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadConfig {
    pub thread_count: u32,
    pub iteration_count: u32,
    #[serde(default)]
    pub ramp: Option<RampConfig>,
    #[serde(default)]
    pub duration_secs: Option<u64>,
}

/// How one node fared in a dispatch round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    /// The agent accepted the command.
    Accepted,
    /// The agent refused or failed the command.
    AgentError,
    /// The agent process failed to start the runner.
    StartException,
    /// Neither this instance nor any sibling owns a route to the node.
    RouterNotFound,
    /// No reply within the per-node timeout, or the link dropped mid-call.
    Transport,
    /// Failure not tied to a single node (lock, quota, script, selection).
    Scheduling,
}

/// Per-node result of a start/stop attempt. The persisted scheduling result
/// of an execution is a list of these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeOutcome {
    pub node_id: Option<i64>,
    pub success: bool,
    pub kind: OutcomeKind,
    pub message: String,
}

impl NodeOutcome {
    pub fn accepted(node_id: i64, message: impl Into<String>) -> Self {
        Self {
            node_id: Some(node_id),
            success: true,
            kind: OutcomeKind::Accepted,
            message: message.into(),
        }
    }

    pub fn failed(node_id: Option<i64>, kind: OutcomeKind, message: impl Into<String>) -> Self {
        Self {
            node_id,
            success: false,
            kind,
            message: message.into(),
        }
    }
}

/// An execution row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: i64,
    pub tenant_id: i64,
    pub script_type: ScriptType,
    /// Logical script this execution runs; test results are keyed on it.
    pub script_source_id: Option<i64>,
    pub status: ExecutionStatus,
    pub threads: ThreadConfig,
    /// Un-sharded configuration kept so restarts re-shard from the original.
    pub original_threads: Option<ThreadConfig>,
    pub trial: bool,
    pub debug: bool,
    /// Number of worker nodes to select.
    pub node_count: u32,
    /// Restricts selection to these node ids when set.
    pub node_pool: Option<Vec<i64>>,
    pub strategy: Option<SelectionStrategy>,
    /// Nodes currently executing it (from `execution_nodes`).
    pub node_ids: Vec<i64>,
    pub schedule_count: u32,
    pub schedule_result: Vec<NodeOutcome>,
    pub schedule_time: Option<DateTime<Utc>>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    /// Serialized script body, source of truth for runtime parameters.
    pub script: String,
    pub indicator: Option<Indicator>,
    pub failure_message: Option<String>,
}

impl Execution {
    /// Configuration sharding starts from.
    pub fn shard_base(&self) -> ThreadConfig {
        self.original_threads.unwrap_or(self.threads)
    }

    /// Source id used to group test results.
    pub fn result_source_id(&self) -> i64 {
        self.script_source_id.unwrap_or(self.id)
    }
}

/// Fields accepted when submitting an execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewExecution {
    pub tenant_id: i64,
    pub script_type: ScriptType,
    #[serde(default)]
    pub script_source_id: Option<i64>,
    pub threads: ThreadConfig,
    #[serde(default)]
    pub trial: bool,
    #[serde(default)]
    pub debug: bool,
    #[serde(default = "default_node_count")]
    pub node_count: u32,
    #[serde(default)]
    pub node_pool: Option<Vec<i64>>,
    #[serde(default)]
    pub strategy: Option<SelectionStrategy>,
    pub script: String,
    #[serde(default)]
    pub indicator: Option<Indicator>,
    /// Cases of an API-sourced functional execution.
    #[serde(default)]
    pub cases: Vec<ExecutionCase>,
}

fn default_node_count() -> u32 {
    1
}

/// A test case attached to a functional execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionCase {
    pub case_id: i64,
    pub case_name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}
