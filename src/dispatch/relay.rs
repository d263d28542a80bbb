//! One-hop relay of start/stop commands to sibling controller instances.
//!
//! Only the primary instance relays, and it always sends `broadcast: false`,
//! so a sibling handles the command with its local routes and never relays
//! further.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info};

use crate::api::envelope::ResultEnvelope;
use crate::api::extract::PRINCIPAL_HEADER;
use crate::config::{host_prefix, PeerInstance};
use crate::execution::{NodeOutcome, OutcomeKind};
use crate::nodes::NodeRegistry;
use crate::orchestrator::{StartRequest, StopRequest};

pub const RELAY_START_PATH: &str = "/api/v1/relay/start";
pub const RELAY_STOP_PATH: &str = "/api/v1/relay/stop";

/// A controller instance as seen by service discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerInstance {
    pub instance_id: String,
    pub host: String,
    pub port: u16,
}

impl From<PeerInstance> for ControllerInstance {
    fn from(peer: PeerInstance) -> Self {
        Self {
            instance_id: peer.instance_id,
            host: peer.host,
            port: peer.port,
        }
    }
}

#[async_trait]
pub trait ServiceDiscovery: Send + Sync {
    async fn instances(&self) -> Result<Vec<ControllerInstance>>;
}

/// Discovery over a fixed peer list from configuration.
pub struct StaticDiscovery {
    peers: Vec<ControllerInstance>,
}

impl StaticDiscovery {
    pub fn new(peers: Vec<PeerInstance>) -> Self {
        Self {
            peers: peers.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl ServiceDiscovery for StaticDiscovery {
    async fn instances(&self) -> Result<Vec<ControllerInstance>> {
        Ok(self.peers.clone())
    }
}

/// Reaching nodes owned by other controller instances.
#[async_trait]
pub trait Relay: Send + Sync {
    async fn relay_start(&self, node_ids: &[i64], request: StartRequest) -> Vec<NodeOutcome>;
    async fn relay_stop(&self, node_ids: &[i64], request: StopRequest) -> Vec<NodeOutcome>;
}

#[derive(Debug, Error)]
enum RelayError {
    #[error("request to {instance} failed: {source}")]
    Transport {
        instance: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{instance} answered: {message}")]
    Rejected { instance: String, message: String },
}

/// [`Relay`] over HTTP to the instances reported by service discovery.
pub struct HttpRelay {
    client: reqwest::Client,
    discovery: Arc<dyn ServiceDiscovery>,
    registry: NodeRegistry,
    self_host_prefix: String,
}

impl HttpRelay {
    pub fn new(
        discovery: Arc<dyn ServiceDiscovery>,
        registry: NodeRegistry,
        self_instance_id: &str,
        timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            discovery,
            registry,
            self_host_prefix: host_prefix(self_instance_id).to_string(),
        })
    }

    /// Sibling instances worth relaying to: not this one, and present in the
    /// node ownership map.
    fn candidates(
        &self,
        instances: Vec<ControllerInstance>,
        ownership: &HashMap<String, Vec<i64>>,
    ) -> Vec<ControllerInstance> {
        instances
            .into_iter()
            .filter(|inst| host_prefix(&inst.instance_id) != self.self_host_prefix)
            .filter(|inst| ownership.contains_key(&inst.host))
            .collect()
    }

    async fn post<T: Serialize + Sync>(
        &self,
        inst: &ControllerInstance,
        path: &str,
        body: &T,
    ) -> Result<Vec<NodeOutcome>, RelayError> {
        let url = format!("http://{}:{}{}", inst.host, inst.port, path);
        let transport = |source| RelayError::Transport {
            instance: inst.instance_id.clone(),
            source,
        };
        let envelope: ResultEnvelope<Vec<NodeOutcome>> = self
            .client
            .post(&url)
            .header(PRINCIPAL_HEADER, "system")
            .json(body)
            .send()
            .await
            .map_err(transport)?
            .json()
            .await
            .map_err(transport)?;

        if !envelope.success {
            return Err(RelayError::Rejected {
                instance: inst.instance_id.clone(),
                message: envelope.message.unwrap_or_default(),
            });
        }
        Ok(envelope.data.unwrap_or_default())
    }

    async fn relay<T, F>(&self, node_ids: &[i64], path: &str, build: F) -> Vec<NodeOutcome>
    where
        T: Serialize + Sync,
        F: Fn(Vec<i64>) -> T,
    {
        if node_ids.is_empty() {
            return Vec::new();
        }

        let batch_failure = |message: String| -> Vec<NodeOutcome> {
            node_ids
                .iter()
                .map(|id| NodeOutcome::failed(Some(*id), OutcomeKind::RouterNotFound, message.clone()))
                .collect()
        };

        let instances = match self.discovery.instances().await {
            Ok(instances) if !instances.is_empty() => instances,
            Ok(_) => {
                error!("service discovery returned no controller instances");
                return batch_failure("no controller instance discovered".to_string());
            }
            Err(e) => {
                error!(error = %e, "service discovery failed");
                return batch_failure(format!("service discovery failed: {}", e));
            }
        };
        let ownership = match self.registry.ownership().await {
            Ok(map) => map,
            Err(e) => {
                error!(error = %e, "node ownership map unavailable");
                return batch_failure(format!("node ownership map unavailable: {}", e));
            }
        };

        let candidates = self.candidates(instances, &ownership);
        if candidates.is_empty() {
            error!(nodes = ?node_ids, "no sibling controller owns the requested nodes");
            return batch_failure("no matching controller instance".to_string());
        }

        let mut remaining: Vec<i64> = node_ids.to_vec();
        let mut outcomes = Vec::with_capacity(node_ids.len());

        for inst in &candidates {
            if remaining.is_empty() {
                break;
            }
            debug!(instance = %inst.instance_id, nodes = ?remaining, path, "relaying command");
            let body = build(remaining.clone());
            match self.post(inst, path, &body).await {
                Ok(answers) => {
                    for answer in answers {
                        let Some(node_id) = answer.node_id else {
                            continue;
                        };
                        if answer.kind == OutcomeKind::RouterNotFound || !remaining.contains(&node_id) {
                            continue;
                        }
                        remaining.retain(|id| *id != node_id);
                        outcomes.push(answer);
                    }
                }
                Err(e) => {
                    error!(error = %e, "relay to sibling controller failed");
                }
            }
        }

        if !remaining.is_empty() {
            info!(nodes = ?remaining, "nodes left unclaimed after relay");
        }
        outcomes.extend(remaining.into_iter().map(|id| {
            NodeOutcome::failed(
                Some(id),
                OutcomeKind::RouterNotFound,
                format!("router not found for node {}", id),
            )
        }));
        outcomes
    }
}

#[async_trait]
impl Relay for HttpRelay {
    async fn relay_start(&self, node_ids: &[i64], request: StartRequest) -> Vec<NodeOutcome> {
        self.relay(node_ids, RELAY_START_PATH, |targets| StartRequest {
            node_ids: targets,
            broadcast: false,
            ..request.clone()
        })
        .await
    }

    async fn relay_stop(&self, node_ids: &[i64], request: StopRequest) -> Vec<NodeOutcome> {
        self.relay(node_ids, RELAY_STOP_PATH, |targets| StopRequest {
            node_ids: targets,
            broadcast: false,
            ..request.clone()
        })
        .await
    }
}
