//! Pushing run/stop commands to worker nodes.
//!
//! Nodes connected to this controller instance have a local channel route in
//! the [`AgentRouter`]. Nodes connected elsewhere are reached through the
//! one-hop HTTP relay in [`relay`].

pub mod relay;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{debug, warn};

use crate::execution::{NodeOutcome, OutcomeKind};

pub use self::relay::{HttpRelay, Relay, StaticDiscovery, ServiceDiscovery};

/// Exit code an agent reports when the runner process could not start.
pub const START_EXCEPTION_EXIT_CODE: i32 = 2;

/// Console fragments that mark a line as an error report.
const ERROR_MARKERS: [&str; 3] = ["[ERROR]", "Exception", "FATAL"];

/// Capacity of a node's command channel.
const ROUTE_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentAction {
    Run,
    Stop,
}

/// Command sent to a worker agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentCommand {
    pub action: AgentAction,
    pub execution_id: i64,
    /// Script with this node's shard applied. Empty for stop commands.
    pub script: String,
    pub is_test_task: bool,
    pub debug: bool,
}

impl AgentCommand {
    pub fn stop(execution_id: i64) -> Self {
        Self {
            action: AgentAction::Stop,
            execution_id,
            script: String::new(),
            is_test_task: false,
            debug: false,
        }
    }
}

/// What an agent answers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentReply {
    pub success: bool,
    pub device_id: i64,
    pub message: String,
    #[serde(default)]
    pub console: Vec<String>,
    pub exit_code: i32,
}

/// A command travelling to an agent together with its reply slot.
#[derive(Debug)]
pub struct AgentEnvelope {
    pub command: AgentCommand,
    pub reply: oneshot::Sender<AgentReply>,
}

/// Local channel routes to the nodes this instance owns.
#[derive(Clone)]
pub struct AgentRouter {
    routes: Arc<RwLock<HashMap<i64, mpsc::Sender<AgentEnvelope>>>>,
    timeout: Duration,
    console_tail_chars: usize,
}

impl AgentRouter {
    pub fn new(timeout: Duration, console_tail_chars: usize) -> Self {
        Self {
            routes: Arc::new(RwLock::new(HashMap::new())),
            timeout,
            console_tail_chars,
        }
    }

    /// Register a route for `node_id`, replacing any previous one. The agent
    /// transport drains the returned receiver.
    pub async fn attach(&self, node_id: i64) -> mpsc::Receiver<AgentEnvelope> {
        let (tx, rx) = mpsc::channel(ROUTE_CAPACITY);
        self.routes.write().await.insert(node_id, tx);
        debug!(node_id, "agent route attached");
        rx
    }

    pub async fn detach(&self, node_id: i64) {
        self.routes.write().await.remove(&node_id);
        debug!(node_id, "agent route detached");
    }

    pub async fn is_local(&self, node_id: i64) -> bool {
        self.routes
            .read()
            .await
            .get(&node_id)
            .is_some_and(|tx| !tx.is_closed())
    }

    /// Send `command` to a locally routed node and wait for its reply.
    ///
    /// `None` means this instance has no route to the node.
    pub async fn dispatch(&self, node_id: i64, command: AgentCommand) -> Option<NodeOutcome> {
        let sender = self.routes.read().await.get(&node_id).cloned()?;
        if sender.is_closed() {
            self.routes.write().await.remove(&node_id);
            debug!(node_id, "dropped stale agent route");
            return None;
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        let envelope = AgentEnvelope {
            command,
            reply: reply_tx,
        };
        if sender.send(envelope).await.is_err() {
            return Some(NodeOutcome::failed(
                Some(node_id),
                OutcomeKind::Transport,
                "agent link closed before the command was delivered",
            ));
        }

        let outcome = match tokio::time::timeout(self.timeout, reply_rx).await {
            Ok(Ok(reply)) => classify_reply(node_id, reply, self.console_tail_chars),
            Ok(Err(_)) => NodeOutcome::failed(
                Some(node_id),
                OutcomeKind::Transport,
                "agent dropped the command without replying",
            ),
            Err(_) => NodeOutcome::failed(
                Some(node_id),
                OutcomeKind::Transport,
                format!("agent did not reply within {}s", self.timeout.as_secs()),
            ),
        };
        Some(outcome)
    }
}

/// Turn an agent reply into a per-node outcome.
pub fn classify_reply(node_id: i64, reply: AgentReply, tail_chars: usize) -> NodeOutcome {
    if reply.device_id != node_id {
        warn!(
            node_id,
            device_id = reply.device_id,
            "agent reply device id does not match dispatched node"
        );
    }

    let marker_line = reply
        .console
        .iter()
        .find(|line| ERROR_MARKERS.iter().any(|m| line.contains(m)));

    if reply.success {
        if let Some(line) = marker_line {
            debug!(node_id, line = %line, "agent accepted command with errors on console");
        }
        return NodeOutcome::accepted(node_id, reply.message);
    }

    if reply.exit_code == START_EXCEPTION_EXIT_CODE {
        let tail = console_tail(&reply.console, tail_chars);
        let message = if tail.is_empty() {
            reply.message
        } else {
            tail
        };
        return NodeOutcome::failed(Some(node_id), OutcomeKind::StartException, message);
    }

    let message = match marker_line {
        Some(line) => line.clone(),
        None => reply.message,
    };
    NodeOutcome::failed(Some(node_id), OutcomeKind::AgentError, message)
}

/// Last `max_chars` characters of the console output.
pub fn console_tail(lines: &[String], max_chars: usize) -> String {
    let joined = lines.join("\n");
    let total = joined.chars().count();
    if total <= max_chars {
        return joined;
    }
    joined.chars().skip(total - max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply(success: bool, exit_code: i32, console: &[&str]) -> AgentReply {
        AgentReply {
            success,
            device_id: 1,
            message: "agent message".into(),
            console: console.iter().map(|s| s.to_string()).collect(),
            exit_code,
        }
    }

    fn run_command() -> AgentCommand {
        AgentCommand {
            action: AgentAction::Run,
            execution_id: 5,
            script: "{}".into(),
            is_test_task: false,
            debug: false,
        }
    }

    #[test]
    fn test_classify_success() {
        let out = classify_reply(1, reply(true, 0, &["[ERROR] noisy"]), 100);
        assert!(out.success);
        assert_eq!(out.kind, OutcomeKind::Accepted);
    }

    #[test]
    fn test_classify_start_exception_uses_console_tail() {
        let out = classify_reply(1, reply(false, START_EXCEPTION_EXIT_CODE, &["boot", "jvm crashed"]), 11);
        assert_eq!(out.kind, OutcomeKind::StartException);
        assert_eq!(out.message, "jvm crashed");
    }

    #[test]
    fn test_classify_agent_error_prefers_marker_line() {
        let out = classify_reply(1, reply(false, 1, &["ok", "[ERROR] disk full", "bye"]), 100);
        assert_eq!(out.kind, OutcomeKind::AgentError);
        assert_eq!(out.message, "[ERROR] disk full");

        let out = classify_reply(1, reply(false, 1, &["ok"]), 100);
        assert_eq!(out.message, "agent message");
    }

    #[test]
    fn test_console_tail_is_char_safe() {
        let lines = vec!["héllo".to_string(), "wörld".to_string()];
        assert_eq!(console_tail(&lines, 3), "rld");
        assert_eq!(console_tail(&lines, 100), "héllo\nwörld");
    }

    #[tokio::test]
    async fn test_dispatch_without_route_is_none() {
        let router = AgentRouter::new(Duration::from_secs(1), 100);
        assert!(router.dispatch(9, run_command()).await.is_none());
        assert!(!router.is_local(9).await);
    }

    #[tokio::test]
    async fn test_dispatch_round_trip() {
        let router = AgentRouter::new(Duration::from_secs(1), 100);
        let mut rx = router.attach(1).await;
        tokio::spawn(async move {
            while let Some(env) = rx.recv().await {
                assert_eq!(env.command.execution_id, 5);
                let _ = env.reply.send(reply(true, 0, &[]));
            }
        });

        let out = router.dispatch(1, run_command()).await.unwrap();
        assert!(out.success);
        assert_eq!(out.node_id, Some(1));
    }

    #[tokio::test]
    async fn test_dispatch_times_out() {
        let router = AgentRouter::new(Duration::from_millis(50), 100);
        let mut rx = router.attach(1).await;
        // Hold envelopes without answering.
        let holder = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Some(env) = rx.recv().await {
                held.push(env);
            }
        });

        let out = router.dispatch(1, run_command()).await.unwrap();
        assert_eq!(out.kind, OutcomeKind::Transport);
        holder.abort();
    }

    #[tokio::test]
    async fn test_dropped_link_means_not_local() {
        let router = AgentRouter::new(Duration::from_secs(1), 100);
        let rx = router.attach(1).await;
        drop(rx);
        assert!(!router.is_local(1).await);
        assert!(router.dispatch(1, run_command()).await.is_none());
    }
}
