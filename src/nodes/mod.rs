//! Worker node registry, node selection and load sharding.

pub mod selector;
pub mod shard;

use std::collections::HashMap;
use std::fmt;

use anyhow::Result;
use chrono::Utc;
use rusqlite::params;
use serde::{Deserialize, Serialize};

use crate::storage::{self, Pool};

pub use self::selector::{NodeSelector, SelectionError, SelectionRequest};
pub use self::shard::shard;

/// How candidate nodes are ordered before the first `count` are taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    RoundRobin,
    IdlePreferred,
    Random,
}

impl fmt::Display for SelectionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SelectionStrategy::RoundRobin => write!(f, "round_robin"),
            SelectionStrategy::IdlePreferred => write!(f, "idle_preferred"),
            SelectionStrategy::Random => write!(f, "random"),
        }
    }
}

/// Which nodes a selection may draw from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodePool {
    /// Nodes owned by the tenant.
    Tenant(i64),
    /// Shared nodes (no owning tenant), used for trial runs.
    Shared,
}

/// A registered worker node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub id: i64,
    pub tenant_id: Option<i64>,
    pub name: String,
    /// Controller instance the node is connected to.
    pub controller_ip: String,
    pub enabled: bool,
    pub last_heartbeat_ms: i64,
    /// Executions currently associated with the node.
    pub active_executions: u32,
}

/// Node registration payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRegistration {
    pub id: i64,
    #[serde(default)]
    pub tenant_id: Option<i64>,
    pub name: String,
    pub controller_ip: String,
}

/// Read/write access to the `nodes` table.
#[derive(Clone)]
pub struct NodeRegistry {
    pool: Pool,
}

impl NodeRegistry {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Insert or update a node. A registration counts as a heartbeat.
    pub async fn register(&self, reg: NodeRegistration) -> Result<()> {
        storage::with_conn(&self.pool, move |conn| {
            conn.execute(
                "INSERT INTO nodes (id, tenant_id, name, controller_ip, enabled, last_heartbeat_ms)
                 VALUES (?1, ?2, ?3, ?4, 1, ?5)
                 ON CONFLICT(id) DO UPDATE SET
                    tenant_id = excluded.tenant_id,
                    name = excluded.name,
                    controller_ip = excluded.controller_ip,
                    last_heartbeat_ms = excluded.last_heartbeat_ms",
                params![
                    reg.id,
                    reg.tenant_id,
                    reg.name,
                    reg.controller_ip,
                    storage::epoch_ms(Utc::now())
                ],
            )?;
            Ok(())
        })
        .await
    }

    /// Record a heartbeat. Returns `false` for unknown nodes.
    pub async fn heartbeat(&self, node_id: i64) -> Result<bool> {
        storage::with_conn(&self.pool, move |conn| {
            let changed = conn.execute(
                "UPDATE nodes SET last_heartbeat_ms = ?2 WHERE id = ?1",
                params![node_id, storage::epoch_ms(Utc::now())],
            )?;
            Ok(changed == 1)
        })
        .await
    }

    pub async fn set_enabled(&self, node_id: i64, enabled: bool) -> Result<()> {
        storage::with_conn(&self.pool, move |conn| {
            conn.execute(
                "UPDATE nodes SET enabled = ?2 WHERE id = ?1",
                params![node_id, enabled],
            )?;
            Ok(())
        })
        .await
    }

    /// Enabled nodes of a pool, ordered by id, with their current load.
    pub async fn candidates(&self, pool: NodePool) -> Result<Vec<NodeInfo>> {
        storage::with_conn(&self.pool, move |conn| {
            let (filter, tenant) = match pool {
                NodePool::Tenant(id) => ("n.tenant_id = ?1", Some(id)),
                NodePool::Shared => ("n.tenant_id IS NULL AND ?1 IS NULL", None),
            };
            let sql = format!(
                "SELECT n.id, n.tenant_id, n.name, n.controller_ip, n.enabled, n.last_heartbeat_ms,
                        (SELECT COUNT(*) FROM execution_nodes en WHERE en.node_id = n.id)
                 FROM nodes n
                 WHERE n.enabled = 1 AND {}
                 ORDER BY n.id",
                filter
            );
            let mut stmt = conn.prepare(&sql)?;
            let nodes = stmt
                .query_map(params![tenant], map_node)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(nodes)
        })
        .await
    }

    pub async fn list(&self) -> Result<Vec<NodeInfo>> {
        storage::with_conn(&self.pool, |conn| {
            let mut stmt = conn.prepare(
                "SELECT n.id, n.tenant_id, n.name, n.controller_ip, n.enabled, n.last_heartbeat_ms,
                        (SELECT COUNT(*) FROM execution_nodes en WHERE en.node_id = n.id)
                 FROM nodes n ORDER BY n.id",
            )?;
            let nodes = stmt
                .query_map([], map_node)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(nodes)
        })
        .await
    }

    /// Ids among `node_ids` whose last heartbeat is within `window_ms`.
    pub async fn live_ids(&self, node_ids: Vec<i64>, window_ms: i64) -> Result<Vec<i64>> {
        let cutoff = storage::epoch_ms(Utc::now()) - window_ms;
        storage::with_conn(&self.pool, move |conn| {
            let mut live = Vec::new();
            let mut stmt = conn.prepare(
                "SELECT 1 FROM nodes WHERE id = ?1 AND enabled = 1 AND last_heartbeat_ms >= ?2",
            )?;
            for id in node_ids {
                if stmt.exists(params![id, cutoff])? {
                    live.push(id);
                }
            }
            Ok(live)
        })
        .await
    }

    /// Node ownership map: controller ip -> node ids it reaches locally.
    pub async fn ownership(&self) -> Result<HashMap<String, Vec<i64>>> {
        storage::with_conn(&self.pool, |conn| {
            let mut stmt =
                conn.prepare("SELECT controller_ip, id FROM nodes WHERE enabled = 1 ORDER BY id")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?;
            let mut map: HashMap<String, Vec<i64>> = HashMap::new();
            for r in rows {
                let (ip, id) = r?;
                map.entry(ip).or_default().push(id);
            }
            Ok(map)
        })
        .await
    }
}

fn map_node(row: &rusqlite::Row<'_>) -> rusqlite::Result<NodeInfo> {
    Ok(NodeInfo {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        name: row.get(2)?,
        controller_ip: row.get(3)?,
        enabled: row.get(4)?,
        last_heartbeat_ms: row.get(5)?,
        active_executions: row.get(6)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::open_pool;

    fn registry() -> (tempfile::TempDir, NodeRegistry) {
        let dir = tempfile::TempDir::new().unwrap();
        let pool = open_pool(dir.path().join("nodes.db").to_str().unwrap()).unwrap();
        (dir, NodeRegistry::new(pool))
    }

    fn reg(id: i64, tenant_id: Option<i64>, controller_ip: &str) -> NodeRegistration {
        NodeRegistration {
            id,
            tenant_id,
            name: format!("node-{}", id),
            controller_ip: controller_ip.to_string(),
        }
    }

    #[tokio::test]
    async fn test_candidates_split_by_pool() {
        let (_dir, registry) = registry();
        registry.register(reg(1, Some(7), "10.0.0.1")).await.unwrap();
        registry.register(reg(2, None, "10.0.0.1")).await.unwrap();
        registry.register(reg(3, Some(8), "10.0.0.2")).await.unwrap();

        let tenant: Vec<i64> = registry
            .candidates(NodePool::Tenant(7))
            .await
            .unwrap()
            .iter()
            .map(|n| n.id)
            .collect();
        assert_eq!(tenant, vec![1]);

        let shared: Vec<i64> = registry
            .candidates(NodePool::Shared)
            .await
            .unwrap()
            .iter()
            .map(|n| n.id)
            .collect();
        assert_eq!(shared, vec![2]);
    }

    #[tokio::test]
    async fn test_disabled_nodes_are_not_candidates() {
        let (_dir, registry) = registry();
        registry.register(reg(1, Some(7), "10.0.0.1")).await.unwrap();
        registry.set_enabled(1, false).await.unwrap();
        assert!(registry.candidates(NodePool::Tenant(7)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_liveness_window() {
        let (_dir, registry) = registry();
        registry.register(reg(1, Some(7), "10.0.0.1")).await.unwrap();
        assert_eq!(registry.live_ids(vec![1, 99], 60_000).await.unwrap(), vec![1]);
        assert!(registry.live_ids(vec![1], -60_000).await.unwrap().is_empty());
        assert!(registry.heartbeat(1).await.unwrap());
        assert!(!registry.heartbeat(99).await.unwrap());
    }

    #[tokio::test]
    async fn test_ownership_map_groups_by_controller() {
        let (_dir, registry) = registry();
        registry.register(reg(1, Some(7), "10.0.0.1")).await.unwrap();
        registry.register(reg(2, Some(7), "10.0.0.2")).await.unwrap();
        registry.register(reg(3, Some(7), "10.0.0.1")).await.unwrap();

        let map = registry.ownership().await.unwrap();
        assert_eq!(map["10.0.0.1"], vec![1, 3]);
        assert_eq!(map["10.0.0.2"], vec![2]);
    }
}
