//! The execution state machine: start, stop, delete and completion.
//!
//! `start` on the primary instance runs under the per-execution restart lock.
//! Node associations and the final status are written only by the primary,
//! after every local and relayed outcome of the round is in.

pub mod context;
pub mod failure;

use std::sync::Arc;

use anyhow::Result;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::config::{ClusterConfig, ControllerConfig, DispatchConfig, QuotaConfig, TrialConfig};
use crate::dispatch::{AgentAction, AgentCommand, AgentRouter, HttpRelay, Relay, StaticDiscovery};
use crate::execution::script::{apply_threads, ScriptError};
use crate::execution::store::RunSamples;
use crate::execution::{Execution, ExecutionStatus, ExecutionStore, NodeOutcome, OutcomeKind};
use crate::judge::{self, CaseSample, JudgeInput, ResultStore, SampleSummary, TestResult, UsageSummary};
use crate::lock::{restart_key, LockCoordinator, SqliteLockCoordinator};
use crate::nodes::{shard, NodePool, NodeRegistry, NodeSelector, SelectionRequest, SelectionStrategy};
use crate::storage::Pool;

pub use self::context::{Principal, RequestContext};
pub use self::failure::SchedulingFailure;

/// How a relayed start should shard: over `total` nodes, with the remainder
/// going to `first_node_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardPlan {
    pub total: u32,
    pub first_node_id: i64,
}

fn default_broadcast() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartRequest {
    pub execution_id: i64,
    /// Explicit targets. Required on relayed requests.
    #[serde(default)]
    pub node_ids: Vec<i64>,
    /// `true` on the instance that received the original request.
    #[serde(default = "default_broadcast")]
    pub broadcast: bool,
    #[serde(default)]
    pub shard_plan: Option<ShardPlan>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopRequest {
    pub execution_id: i64,
    #[serde(default)]
    pub node_ids: Vec<i64>,
    #[serde(default = "default_broadcast")]
    pub broadcast: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeleteReport {
    pub deleted: Vec<i64>,
    /// Executions left alone because a start was in flight.
    pub skipped: Vec<i64>,
    pub failed: Vec<DeleteFailure>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteFailure {
    pub execution_id: i64,
    pub message: String,
}

/// What a runner reports when an execution finishes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionReport {
    pub status: ExecutionStatus,
    #[serde(default)]
    pub failure_message: Option<String>,
    #[serde(default)]
    pub summary: Option<SampleSummary>,
    #[serde(default)]
    pub usage: Vec<UsageSummary>,
    #[serde(default)]
    pub cases: Vec<CaseSample>,
}

pub struct ExecutionOrchestrator {
    store: ExecutionStore,
    results: ResultStore,
    locks: Arc<dyn LockCoordinator>,
    selector: NodeSelector,
    router: AgentRouter,
    relay: Arc<dyn Relay>,
    dispatch: DispatchConfig,
    quotas: QuotaConfig,
    trial: TrialConfig,
}

impl ExecutionOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: ExecutionStore,
        results: ResultStore,
        locks: Arc<dyn LockCoordinator>,
        selector: NodeSelector,
        router: AgentRouter,
        relay: Arc<dyn Relay>,
        config: &ControllerConfig,
    ) -> Self {
        Self {
            store,
            results,
            locks,
            selector,
            router,
            relay,
            dispatch: config.dispatch.clone(),
            quotas: config.quotas.clone(),
            trial: config.trial.clone(),
        }
    }

    /// Wire the SQLite-backed collaborators and the HTTP relay.
    pub fn from_config(config: &ControllerConfig, pool: Pool) -> Result<Self> {
        let registry = NodeRegistry::new(pool.clone());
        let ClusterConfig {
            peers,
            relay_timeout_secs,
        } = config.cluster.clone();
        let relay = HttpRelay::new(
            Arc::new(StaticDiscovery::new(peers)),
            registry.clone(),
            &config.controller.instance_id,
            std::time::Duration::from_secs(relay_timeout_secs),
        )?;
        let selector = NodeSelector::new(
            registry,
            std::time::Duration::from_secs(config.dispatch.node_liveness_secs),
        );
        let router = AgentRouter::new(
            config.dispatch.agent_timeout(),
            config.dispatch.console_tail_chars,
        );

        Ok(Self::new(
            ExecutionStore::new(pool.clone()),
            ResultStore::new(pool.clone()),
            Arc::new(SqliteLockCoordinator::new(pool)),
            selector,
            router,
            Arc::new(relay),
            config,
        ))
    }

    pub fn store(&self) -> &ExecutionStore {
        &self.store
    }

    pub fn results(&self) -> &ResultStore {
        &self.results
    }

    pub fn registry(&self) -> &NodeRegistry {
        self.selector.registry()
    }

    pub fn router(&self) -> &AgentRouter {
        &self.router
    }

    pub fn dispatch_config(&self) -> &DispatchConfig {
        &self.dispatch
    }

    // -----------------------------------------------------------------------
    // start
    // -----------------------------------------------------------------------

    /// Dispatch an execution to its nodes.
    ///
    /// With `broadcast` set this instance is the primary: it takes the restart
    /// lock, selects nodes, relays what it cannot reach and persists the
    /// outcome. Otherwise it only runs the given targets it owns and reports.
    pub async fn start(
        &self,
        ctx: &RequestContext,
        req: StartRequest,
    ) -> Result<Vec<NodeOutcome>, SchedulingFailure> {
        let exec = self.load(ctx, req.execution_id).await?;
        let primary = req.broadcast;

        if primary {
            if exec.status == ExecutionStatus::Running {
                return Err(SchedulingFailure::AlreadyRunning(exec.id));
            }
            self.check_quota(&exec).await?;
        } else if req.node_ids.is_empty() {
            return Err(SchedulingFailure::MissingTargets(exec.id));
        }

        if !primary {
            return self.start_secondary(&exec, &req).await;
        }

        let key = restart_key(exec.id);
        let token = exec.id.to_string();
        if !self
            .locks
            .try_acquire(&key, &token, self.dispatch.lock_ttl())
            .await?
        {
            info!(execution_id = exec.id, "start already in flight, request dropped");
            return Err(SchedulingFailure::InFlight(exec.id));
        }

        let result = self.start_primary(ctx, &exec, &req).await;

        if let Err(e) = self.locks.release(&key, &token).await {
            error!(execution_id = exec.id, error = %e, "failed to release restart lock");
        }
        result
    }

    async fn start_primary(
        &self,
        ctx: &RequestContext,
        exec: &Execution,
        req: &StartRequest,
    ) -> Result<Vec<NodeOutcome>, SchedulingFailure> {
        let prior = exec.status;

        // The quota may have been used up between the precondition and the lock.
        if let Err(failure) = self.check_quota(exec).await {
            return Err(self.record_failure(exec.id, failure).await);
        }

        let script = match prepare_script(exec) {
            Ok(script) => script,
            Err(e) => return Err(self.record_failure(exec.id, e.into()).await),
        };

        let targets = match self.select_nodes(ctx, exec, &req.node_ids).await {
            Ok(targets) => targets,
            Err(failure) => return Err(self.record_failure(exec.id, failure).await),
        };

        self.store
            .set_status(exec.id, ExecutionStatus::Scheduling)
            .await?;
        self.store.clear_run_state(exec.id).await?;
        info!(execution_id = exec.id, nodes = ?targets, "dispatching execution");

        let plan = ShardPlan {
            total: targets.len() as u32,
            first_node_id: targets[0],
        };
        let commands = match shard_commands(exec, &script, &targets, &plan) {
            Ok(commands) => commands,
            Err(e) => return Err(self.record_failure(exec.id, e.into()).await),
        };

        let (mut outcomes, unrouted) = self.dispatch_local(commands).await;

        if unrouted.is_empty() && all_transport_failures(&outcomes) {
            warn!(execution_id = exec.id, "no node answered the run command");
            let failure = SchedulingFailure::DispatchFailed(outcomes);
            return Err(self.record_failure(exec.id, failure).await);
        }

        if !unrouted.is_empty() {
            debug!(execution_id = exec.id, nodes = ?unrouted, "relaying start to sibling controllers");
            let relayed = StartRequest {
                execution_id: exec.id,
                node_ids: unrouted.clone(),
                broadcast: false,
                shard_plan: Some(plan),
            };
            outcomes.extend(self.relay.relay_start(&unrouted, relayed).await);
        }

        let started: Vec<i64> = outcomes
            .iter()
            .filter(|o| o.success)
            .filter_map(|o| o.node_id)
            .collect();
        self.store.add_nodes(exec.id, started).await?;

        let (status, message) = judge_dispatch(prior, &outcomes);
        self.store
            .record_schedule(exec.id, status, outcomes.clone(), message)
            .await?;
        info!(execution_id = exec.id, status = %status, "dispatch round finished");
        Ok(outcomes)
    }

    async fn start_secondary(
        &self,
        exec: &Execution,
        req: &StartRequest,
    ) -> Result<Vec<NodeOutcome>, SchedulingFailure> {
        let script = prepare_script(exec)?;

        let token = self.locks.get(&restart_key(exec.id)).await?;
        if token.as_deref() != Some(exec.id.to_string().as_str()) {
            warn!(execution_id = exec.id, "relayed start arrived after the primary gave up");
            return Err(SchedulingFailure::StartupTimeout(exec.id));
        }

        let plan = req.shard_plan.unwrap_or(ShardPlan {
            total: req.node_ids.len() as u32,
            first_node_id: req.node_ids[0],
        });
        let commands = shard_commands(exec, &script, &req.node_ids, &plan)?;
        let (mut outcomes, unrouted) = self.dispatch_local(commands).await;
        outcomes.extend(unrouted.into_iter().map(router_not_found));

        if all_transport_failures(&outcomes) {
            return Err(SchedulingFailure::DispatchFailed(outcomes));
        }
        Ok(outcomes)
    }

    // -----------------------------------------------------------------------
    // stop
    // -----------------------------------------------------------------------

    /// Stop an execution on its nodes. Ignored while a start is in flight.
    pub async fn stop(
        &self,
        ctx: &RequestContext,
        req: StopRequest,
    ) -> Result<Vec<NodeOutcome>, SchedulingFailure> {
        let exec = self.load(ctx, req.execution_id).await?;
        let primary = req.broadcast;
        if !primary && req.node_ids.is_empty() {
            return Err(SchedulingFailure::MissingTargets(exec.id));
        }

        if self.locks.get(&restart_key(exec.id)).await?.is_some() {
            info!(execution_id = exec.id, "start in flight, stop ignored");
            return Err(SchedulingFailure::InFlight(exec.id));
        }

        let targets = if req.node_ids.is_empty() {
            exec.node_ids.clone()
        } else {
            req.node_ids.clone()
        };
        let commands = targets
            .iter()
            .map(|id| (*id, AgentCommand::stop(exec.id)))
            .collect();
        let (mut outcomes, unrouted) = self.dispatch_local(commands).await;

        if !primary {
            outcomes.extend(unrouted.into_iter().map(router_not_found));
            return Ok(outcomes);
        }

        if !unrouted.is_empty() {
            let relayed = StopRequest {
                execution_id: exec.id,
                node_ids: unrouted.clone(),
                broadcast: false,
            };
            outcomes.extend(self.relay.relay_stop(&unrouted, relayed).await);
        }

        let stopped: Vec<i64> = outcomes
            .iter()
            .filter(|o| o.success)
            .filter_map(|o| o.node_id)
            .collect();
        let all_stopped = outcomes.iter().all(|o| o.success);
        self.store.remove_nodes(exec.id, stopped).await?;
        let status = self.store.settle_stop(exec.id, all_stopped).await?;

        info!(
            execution_id = exec.id,
            all_stopped,
            status = ?status,
            "stop round finished"
        );
        Ok(outcomes)
    }

    // -----------------------------------------------------------------------
    // delete
    // -----------------------------------------------------------------------

    /// Delete executions one by one. A failure is reported and the batch
    /// carries on.
    pub async fn delete(&self, ctx: &RequestContext, ids: Vec<i64>) -> DeleteReport {
        let mut report = DeleteReport::default();
        for id in ids {
            match self.delete_one(ctx, id).await {
                Ok(true) => report.deleted.push(id),
                Ok(false) => report.skipped.push(id),
                Err(e) => {
                    error!(execution_id = id, error = %e, "failed to delete execution");
                    report.failed.push(DeleteFailure {
                        execution_id: id,
                        message: e.to_string(),
                    });
                }
            }
        }
        report
    }

    async fn delete_one(&self, ctx: &RequestContext, id: i64) -> Result<bool, SchedulingFailure> {
        let exec = self.load(ctx, id).await?;
        if self.locks.get(&restart_key(id)).await?.is_some() {
            info!(execution_id = id, "start in flight, delete skipped");
            return Ok(false);
        }

        if exec.status == ExecutionStatus::Running {
            let req = StopRequest {
                execution_id: id,
                node_ids: Vec::new(),
                broadcast: true,
            };
            let outcomes = self.stop(ctx, req).await?;
            if outcomes.iter().any(|o| !o.success) {
                warn!(execution_id = id, "some nodes did not confirm stop before delete");
            }
        }

        self.store.soft_delete(id).await?;
        info!(execution_id = id, "execution deleted");
        Ok(true)
    }

    // -----------------------------------------------------------------------
    // completion
    // -----------------------------------------------------------------------

    /// Record a finished run and judge it.
    pub async fn complete(
        &self,
        ctx: &RequestContext,
        id: i64,
        report: CompletionReport,
    ) -> Result<TestResult, SchedulingFailure> {
        let exec = self.load(ctx, id).await?;
        if !report.status.is_terminal() {
            return Err(SchedulingFailure::BusinessRule(format!(
                "completion status must be terminal, got {}",
                report.status
            )));
        }

        let samples = RunSamples {
            summary: report.summary,
            usage: report.usage,
            cases: report.cases,
        };
        self.store.save_samples(id, samples.clone()).await?;
        self.store
            .finish(id, report.status, report.failure_message)
            .await?;
        let ran_on = exec.node_ids;
        self.store.remove_nodes(id, ran_on.clone()).await?;

        let exec = self.load(ctx, id).await?;
        let verdict = judge::judge(&JudgeInput {
            script_type: exec.script_type,
            status: exec.status,
            failure_message: exec.failure_message.as_deref(),
            indicator: exec.indicator.as_ref(),
            samples: &samples,
            node_ids: &ran_on,
        });
        let cases = self.store.cases(id).await?;
        let case_verdicts = judge::judge_cases(
            exec.status,
            exec.failure_message.as_deref(),
            &cases,
            &samples.cases,
        );

        let result = self
            .results
            .record(&exec, &verdict, &samples, &case_verdicts)
            .await?;
        info!(
            execution_id = id,
            passed = verdict.passed,
            reason = verdict.reason.as_deref().unwrap_or(""),
            "execution judged"
        );
        Ok(result)
    }

    // -----------------------------------------------------------------------
    // helpers
    // -----------------------------------------------------------------------

    async fn load(&self, ctx: &RequestContext, id: i64) -> Result<Execution, SchedulingFailure> {
        let exec = self
            .store
            .get(id)
            .await?
            .ok_or(SchedulingFailure::NotFound(id))?;
        if !ctx.may_operate(exec.tenant_id) {
            return Err(SchedulingFailure::Forbidden(id));
        }
        Ok(exec)
    }

    async fn check_quota(&self, exec: &Execution) -> Result<(), SchedulingFailure> {
        let limit = self.quotas.max_concurrent_executions;
        let running = self.store.count_running(exec.tenant_id, exec.id).await?;
        if running >= limit {
            return Err(SchedulingFailure::QuotaExceeded { limit });
        }
        Ok(())
    }

    /// Persist a failed scheduling attempt and hand the failure back.
    async fn record_failure(&self, id: i64, failure: SchedulingFailure) -> SchedulingFailure {
        let status = failure.resulting_status();
        let message = failure.to_string();
        let outcomes = match &failure {
            SchedulingFailure::DispatchFailed(outcomes) => outcomes.clone(),
            _ => vec![NodeOutcome::failed(None, OutcomeKind::Scheduling, message.clone())],
        };

        if let Err(e) = self
            .store
            .record_schedule(id, status, outcomes, Some(message.clone()))
            .await
        {
            error!(execution_id = id, error = %e, "failed to record scheduling failure");
        }
        if status == ExecutionStatus::Pending {
            info!(execution_id = id, reason = %message, "scheduling deferred, back to PENDING");
        } else {
            warn!(execution_id = id, reason = %message, "scheduling failed");
        }
        failure
    }

    async fn select_nodes(
        &self,
        ctx: &RequestContext,
        exec: &Execution,
        requested: &[i64],
    ) -> Result<Vec<i64>, SchedulingFailure> {
        let available = if requested.is_empty() {
            exec.node_pool.clone()
        } else {
            Some(requested.to_vec())
        };
        let strategy = exec.strategy.unwrap_or(self.dispatch.default_strategy);

        if exec.trial || ctx.trial_tenant {
            match self.select_trial_nodes(exec).await {
                Ok(nodes) => return Ok(nodes),
                Err(e @ SchedulingFailure::BusinessRule(_)) => return Err(e),
                Err(SchedulingFailure::NoNodes(reason)) if exec.trial => {
                    return Err(SchedulingFailure::BusinessRule(format!(
                        "no trial nodes available: {}",
                        reason
                    )));
                }
                Err(e) if exec.trial => return Err(e),
                Err(e) => {
                    debug!(execution_id = exec.id, reason = %e, "no shared node, falling back to tenant nodes");
                }
            }
        }

        let req = SelectionRequest {
            count: exec.node_count,
            pool: NodePool::Tenant(exec.tenant_id),
            available,
            exclude: Vec::new(),
            strategy,
            require_live: self.dispatch.require_live,
        };
        let nodes = self.selector.select(&req).await?;
        Ok(nodes.into_iter().map(|n| n.id).collect())
    }

    async fn select_trial_nodes(&self, exec: &Execution) -> Result<Vec<i64>, SchedulingFailure> {
        if exec.trial {
            self.check_trial_limits(exec)?;
        }
        let req = SelectionRequest {
            count: exec.node_count.min(self.trial.max_nodes.max(1)),
            pool: NodePool::Shared,
            available: None,
            exclude: Vec::new(),
            strategy: SelectionStrategy::IdlePreferred,
            require_live: self.dispatch.require_live,
        };
        let nodes = self.selector.select(&req).await?;
        Ok(nodes.into_iter().map(|n| n.id).collect())
    }

    fn check_trial_limits(&self, exec: &Execution) -> Result<(), SchedulingFailure> {
        let threads = exec.shard_base();
        let limits = &self.trial;
        let violation = if exec.node_count > limits.max_nodes {
            Some(format!("trial runs may use at most {} nodes", limits.max_nodes))
        } else if threads.thread_count > limits.max_threads {
            Some(format!("trial runs may use at most {} threads", limits.max_threads))
        } else if threads.iteration_count > limits.max_iterations {
            Some(format!(
                "trial runs may use at most {} iterations",
                limits.max_iterations
            ))
        } else if threads.duration_secs.unwrap_or(0) > limits.max_duration_secs {
            Some(format!(
                "trial runs may last at most {}s",
                limits.max_duration_secs
            ))
        } else {
            None
        };
        match violation {
            Some(rule) => Err(SchedulingFailure::BusinessRule(rule)),
            None => Ok(()),
        }
    }

    /// Send commands over local routes. One node is dispatched inline; more
    /// fan out concurrently and are all awaited. Returns the outcomes and the
    /// nodes this instance has no route to.
    async fn dispatch_local(&self, commands: Vec<(i64, AgentCommand)>) -> (Vec<NodeOutcome>, Vec<i64>) {
        let replies = if commands.len() == 1 {
            let mut commands = commands;
            let (node_id, command) = commands.remove(0);
            vec![(node_id, self.router.dispatch(node_id, command).await)]
        } else {
            join_all(commands.into_iter().map(|(node_id, command)| {
                let router = self.router.clone();
                async move { (node_id, router.dispatch(node_id, command).await) }
            }))
            .await
        };

        let mut outcomes = Vec::with_capacity(replies.len());
        let mut unrouted = Vec::new();
        for (node_id, reply) in replies {
            match reply {
                Some(outcome) => outcomes.push(outcome),
                None => unrouted.push(node_id),
            }
        }
        (outcomes, unrouted)
    }
}

/// The execution's script with its un-sharded configuration applied.
fn prepare_script(exec: &Execution) -> Result<String, ScriptError> {
    apply_threads(&exec.script, &exec.shard_base())
}

/// One run command per target, each carrying its shard of the load.
fn shard_commands(
    exec: &Execution,
    script: &str,
    targets: &[i64],
    plan: &ShardPlan,
) -> Result<Vec<(i64, AgentCommand)>, ScriptError> {
    let base = exec.shard_base();
    targets
        .iter()
        .map(|&node_id| {
            let part = shard(&base, plan.total, node_id == plan.first_node_id);
            let command = AgentCommand {
                action: AgentAction::Run,
                execution_id: exec.id,
                script: apply_threads(script, &part)?,
                is_test_task: exec.trial,
                debug: exec.debug,
            };
            Ok((node_id, command))
        })
        .collect()
}

fn router_not_found(node_id: i64) -> NodeOutcome {
    NodeOutcome::failed(
        Some(node_id),
        OutcomeKind::RouterNotFound,
        format!("router not found for node {}", node_id),
    )
}

/// Every attempted node failed in transport; no agent said anything.
fn all_transport_failures(outcomes: &[NodeOutcome]) -> bool {
    !outcomes.is_empty()
        && outcomes
            .iter()
            .all(|o| !o.success && o.kind == OutcomeKind::Transport)
}

/// Status after a dispatch round, and the failure message to keep.
///
/// Any accepted node means RUNNING. If every node failed to start its runner
/// the execution is FAILED with that node's console tail. Anything else
/// leaves the pre-dispatch status in place.
fn judge_dispatch(
    prior: ExecutionStatus,
    outcomes: &[NodeOutcome],
) -> (ExecutionStatus, Option<String>) {
    if outcomes.iter().any(|o| o.success) {
        return (ExecutionStatus::Running, None);
    }
    if !outcomes.is_empty()
        && outcomes
            .iter()
            .all(|o| o.kind == OutcomeKind::StartException)
    {
        return (ExecutionStatus::Failed, Some(outcomes[0].message.clone()));
    }
    let message = outcomes.first().map(|o| o.message.clone());
    (prior, message)
}
