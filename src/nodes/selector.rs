//! Choosing worker nodes for an execution.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use rand::seq::SliceRandom;
use thiserror::Error;
use tracing::{debug, warn};

use super::{NodeInfo, NodePool, NodeRegistry, SelectionStrategy};

#[derive(Debug, Error)]
pub enum SelectionError {
    #[error("no nodes meet conditions: {0}")]
    NoNodes(String),
    #[error("selected node {0} is not live")]
    NodeNotLive(i64),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// Parameters of one selection.
#[derive(Debug, Clone)]
pub struct SelectionRequest {
    /// Maximum number of nodes to return.
    pub count: u32,
    pub pool: NodePool,
    /// When set, only these node ids may be chosen.
    pub available: Option<Vec<i64>>,
    pub exclude: Vec<i64>,
    pub strategy: SelectionStrategy,
    pub require_live: bool,
}

pub struct NodeSelector {
    registry: NodeRegistry,
    liveness_window: Duration,
    cursor: AtomicUsize,
}

impl NodeSelector {
    pub fn new(registry: NodeRegistry, liveness_window: Duration) -> Self {
        Self {
            registry,
            liveness_window,
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    /// Pick up to `count` nodes, then verify the picked ones are live.
    /// A dead pick fails the whole selection rather than being skipped.
    pub async fn select(&self, req: &SelectionRequest) -> Result<Vec<NodeInfo>, SelectionError> {
        let candidates: Vec<NodeInfo> = self
            .registry
            .candidates(req.pool)
            .await?
            .into_iter()
            .filter(|n| {
                req.available
                    .as_ref()
                    .map_or(true, |allowed| allowed.contains(&n.id))
            })
            .filter(|n| !req.exclude.contains(&n.id))
            .collect();

        if candidates.is_empty() {
            return Err(SelectionError::NoNodes(match req.pool {
                NodePool::Shared => "no shared nodes available".to_string(),
                NodePool::Tenant(id) => format!("no enabled nodes for tenant {}", id),
            }));
        }

        let count = req.count.max(1) as usize;
        let cursor = match req.strategy {
            SelectionStrategy::RoundRobin => self.cursor.fetch_add(count, Ordering::Relaxed),
            _ => 0,
        };
        let mut picked = order_candidates(candidates, req.strategy, cursor);
        picked.truncate(count);

        if req.require_live {
            let ids: Vec<i64> = picked.iter().map(|n| n.id).collect();
            let live = self
                .registry
                .live_ids(ids, self.liveness_window.as_millis() as i64)
                .await?;
            if let Some(dead) = picked.iter().find(|n| !live.contains(&n.id)) {
                warn!(node_id = dead.id, "selected node failed liveness check");
                return Err(SelectionError::NodeNotLive(dead.id));
            }
        }

        debug!(
            strategy = %req.strategy,
            nodes = ?picked.iter().map(|n| n.id).collect::<Vec<_>>(),
            "nodes selected"
        );
        Ok(picked)
    }
}

/// Order candidates (given sorted by id) according to a strategy.
fn order_candidates(
    mut candidates: Vec<NodeInfo>,
    strategy: SelectionStrategy,
    cursor: usize,
) -> Vec<NodeInfo> {
    match strategy {
        SelectionStrategy::RoundRobin => {
            let len = candidates.len();
            if len > 0 {
                candidates.rotate_left(cursor % len);
            }
        }
        SelectionStrategy::IdlePreferred => {
            candidates.sort_by_key(|n| (n.active_executions, n.id));
        }
        SelectionStrategy::Random => {
            candidates.shuffle(&mut rand::thread_rng());
        }
    }
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::NodeRegistration;
    use crate::storage::open_pool;

    fn node(id: i64, active: u32) -> NodeInfo {
        NodeInfo {
            id,
            tenant_id: Some(1),
            name: format!("n{}", id),
            controller_ip: "10.0.0.1".into(),
            enabled: true,
            last_heartbeat_ms: 0,
            active_executions: active,
        }
    }

    fn ids(nodes: &[NodeInfo]) -> Vec<i64> {
        nodes.iter().map(|n| n.id).collect()
    }

    #[test]
    fn test_round_robin_rotates_by_cursor() {
        let nodes = vec![node(1, 0), node(2, 0), node(3, 0)];
        assert_eq!(
            ids(&order_candidates(nodes.clone(), SelectionStrategy::RoundRobin, 0)),
            vec![1, 2, 3]
        );
        assert_eq!(
            ids(&order_candidates(nodes.clone(), SelectionStrategy::RoundRobin, 4)),
            vec![2, 3, 1]
        );
    }

    #[test]
    fn test_idle_preferred_orders_by_load_then_id() {
        let nodes = vec![node(1, 3), node(2, 0), node(3, 1), node(4, 0)];
        assert_eq!(
            ids(&order_candidates(nodes, SelectionStrategy::IdlePreferred, 0)),
            vec![2, 4, 3, 1]
        );
    }

    #[test]
    fn test_random_keeps_the_same_set() {
        let nodes = vec![node(1, 0), node(2, 0), node(3, 0)];
        let mut shuffled = ids(&order_candidates(nodes, SelectionStrategy::Random, 0));
        shuffled.sort();
        assert_eq!(shuffled, vec![1, 2, 3]);
    }

    async fn selector_with(nodes: &[(i64, Option<i64>)]) -> (tempfile::TempDir, NodeSelector) {
        let dir = tempfile::TempDir::new().unwrap();
        let pool = open_pool(dir.path().join("sel.db").to_str().unwrap()).unwrap();
        let registry = NodeRegistry::new(pool);
        for (id, tenant_id) in nodes {
            registry
                .register(NodeRegistration {
                    id: *id,
                    tenant_id: *tenant_id,
                    name: format!("n{}", id),
                    controller_ip: "10.0.0.1".into(),
                })
                .await
                .unwrap();
        }
        (dir, NodeSelector::new(registry, Duration::from_secs(30)))
    }

    fn request(count: u32) -> SelectionRequest {
        SelectionRequest {
            count,
            pool: NodePool::Tenant(1),
            available: None,
            exclude: Vec::new(),
            strategy: SelectionStrategy::IdlePreferred,
            require_live: true,
        }
    }

    #[tokio::test]
    async fn test_select_honours_filters_and_count() {
        let (_dir, selector) = selector_with(&[(1, Some(1)), (2, Some(1)), (3, Some(1))]).await;

        let picked = selector.select(&request(2)).await.unwrap();
        assert_eq!(ids(&picked), vec![1, 2]);

        let req = SelectionRequest {
            available: Some(vec![2, 3]),
            exclude: vec![2],
            ..request(5)
        };
        assert_eq!(ids(&selector.select(&req).await.unwrap()), vec![3]);
    }

    #[tokio::test]
    async fn test_select_empty_pool_is_no_nodes() {
        let (_dir, selector) = selector_with(&[(1, Some(2))]).await;
        let err = selector.select(&request(1)).await.unwrap_err();
        assert!(matches!(err, SelectionError::NoNodes(_)));
    }

    #[tokio::test]
    async fn test_select_fails_fast_on_dead_node() {
        let (_dir, selector) = selector_with(&[(1, Some(1))]).await;
        let dead = NodeSelector::new(selector.registry().clone(), Duration::ZERO);
        // Heartbeats older than "now - 0" count as dead.
        tokio::time::sleep(Duration::from_millis(5)).await;
        let err = dead.select(&request(1)).await.unwrap_err();
        assert!(matches!(err, SelectionError::NodeNotLive(1)));

        let relaxed = SelectionRequest {
            require_live: false,
            ..request(1)
        };
        assert_eq!(ids(&dead.select(&relaxed).await.unwrap()), vec![1]);
    }
}
