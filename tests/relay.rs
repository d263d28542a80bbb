//! Two controller instances sharing one database: the primary reaches a node
//! owned by its sibling through the relay endpoint.

use std::path::Path;
use std::sync::{Arc, Mutex};

use testfleet::api::envelope::ResultEnvelope;
use testfleet::api::extract::PRINCIPAL_HEADER;
use testfleet::config::{ControllerConfig, PeerInstance};
use testfleet::dispatch::relay::RELAY_START_PATH;
use testfleet::dispatch::{AgentAction, AgentCommand, AgentReply};
use testfleet::execution::{
    ExecutionStatus, NewExecution, NodeOutcome, OutcomeKind, ScriptType, ThreadConfig,
};
use testfleet::nodes::{NodeRegistration, SelectionStrategy};
use testfleet::orchestrator::{ExecutionOrchestrator, RequestContext, StartRequest, StopRequest};
use testfleet::storage::open_pool;

const PRIMARY_HOST: &str = "10.0.0.1";
const SIBLING_HOST: &str = "127.0.0.1";

type Seen = Arc<Mutex<Vec<(i64, AgentCommand)>>>;

fn base_config(db: &Path, instance_id: &str) -> ControllerConfig {
    let mut config = ControllerConfig::default();
    config.controller.instance_id = instance_id.to_string();
    config.storage.db_path = db.to_path_buf();
    config.dispatch.default_strategy = SelectionStrategy::IdlePreferred;
    config.dispatch.agent_timeout_secs = 2;
    config.cluster.relay_timeout_secs = 5;
    config
}

async fn attach_agent(orch: &ExecutionOrchestrator, node_id: i64, seen: Seen) {
    let mut rx = orch.router().attach(node_id).await;
    tokio::spawn(async move {
        while let Some(env) = rx.recv().await {
            seen.lock().unwrap().push((node_id, env.command.clone()));
            let _ = env.reply.send(AgentReply {
                success: true,
                device_id: node_id,
                message: "ok".into(),
                console: Vec::new(),
                exit_code: 0,
            });
        }
    });
}

struct Cluster {
    _dir: tempfile::TempDir,
    primary: ExecutionOrchestrator,
    sibling_port: u16,
    seen: Seen,
}

/// Node 10 lives on the primary, node 20 on the sibling.
async fn cluster() -> Cluster {
    let dir = tempfile::TempDir::new().unwrap();
    let db = dir.path().join("shared.db");
    let seen: Seen = Arc::new(Mutex::new(Vec::new()));

    let (app, sibling) = testfleet::build_app(base_config(&db, "127.0.0.1:0")).unwrap();
    attach_agent(&sibling, 20, seen.clone()).await;
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let sibling_port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let mut config = base_config(&db, &format!("{}:8080", PRIMARY_HOST));
    config.cluster.peers = vec![
        PeerInstance {
            instance_id: format!("{}:8080", PRIMARY_HOST),
            host: PRIMARY_HOST.into(),
            port: 8080,
        },
        PeerInstance {
            instance_id: format!("{}:{}", SIBLING_HOST, sibling_port),
            host: SIBLING_HOST.into(),
            port: sibling_port,
        },
    ];
    let pool = open_pool(db.to_str().unwrap()).unwrap();
    let primary = ExecutionOrchestrator::from_config(&config, pool).unwrap();
    attach_agent(&primary, 10, seen.clone()).await;

    for (id, host) in [(10, PRIMARY_HOST), (20, SIBLING_HOST)] {
        primary
            .registry()
            .register(NodeRegistration {
                id,
                tenant_id: Some(7),
                name: format!("worker-{}", id),
                controller_ip: host.into(),
            })
            .await
            .unwrap();
    }

    Cluster {
        _dir: dir,
        primary,
        sibling_port,
        seen,
    }
}

fn execution(threads: u32) -> NewExecution {
    NewExecution {
        tenant_id: 7,
        script_type: ScriptType::Performance,
        script_source_id: None,
        threads: ThreadConfig {
            thread_count: threads,
            iteration_count: 10,
            ramp: None,
            duration_secs: None,
        },
        trial: false,
        debug: false,
        node_count: 2,
        node_pool: None,
        strategy: None,
        script: r#"{"name":"search"}"#.into(),
        indicator: None,
        cases: Vec::new(),
    }
}

fn thread_count(command: &AgentCommand) -> u64 {
    let doc: serde_json::Value = serde_json::from_str(&command.script).unwrap();
    doc["thread_group"]["thread_count"].as_u64().unwrap()
}

#[tokio::test]
async fn test_start_and_stop_span_both_instances() {
    let c = cluster().await;
    let id = c.primary.store().create(execution(11)).await.unwrap();

    let outcomes = c
        .primary
        .start(
            &RequestContext::system(),
            StartRequest {
                execution_id: id,
                node_ids: Vec::new(),
                broadcast: true,
                shard_plan: None,
            },
        )
        .await
        .unwrap();
    assert_eq!(outcomes.len(), 2);
    assert!(outcomes.iter().all(|o| o.success), "{:?}", outcomes);

    let exec = c.primary.store().get(id).await.unwrap().unwrap();
    assert_eq!(exec.status, ExecutionStatus::Running);
    assert_eq!(exec.node_ids, vec![10, 20]);

    // The sibling sharded its node exactly as the primary would have.
    let runs: Vec<(i64, u64)> = {
        let seen = c.seen.lock().unwrap();
        let mut runs: Vec<_> = seen
            .iter()
            .filter(|(_, cmd)| cmd.action == AgentAction::Run)
            .map(|(node, cmd)| (*node, thread_count(cmd)))
            .collect();
        runs.sort();
        runs
    };
    assert_eq!(runs, vec![(10, 6), (20, 5)]);

    let outcomes = c
        .primary
        .stop(
            &RequestContext::system(),
            StopRequest {
                execution_id: id,
                node_ids: Vec::new(),
                broadcast: true,
            },
        )
        .await
        .unwrap();
    assert!(outcomes.iter().all(|o| o.success), "{:?}", outcomes);
    let exec = c.primary.store().get(id).await.unwrap().unwrap();
    assert_eq!(exec.status, ExecutionStatus::Stopped);
    assert!(exec.node_ids.is_empty());
}

#[tokio::test]
async fn test_relayed_start_without_lock_is_refused_per_node() {
    let c = cluster().await;
    let id = c.primary.store().create(execution(4)).await.unwrap();

    let body = StartRequest {
        execution_id: id,
        node_ids: vec![20],
        broadcast: false,
        shard_plan: None,
    };
    let envelope: ResultEnvelope<Vec<NodeOutcome>> = reqwest::Client::new()
        .post(format!("http://{}:{}{}", SIBLING_HOST, c.sibling_port, RELAY_START_PATH))
        .header(PRINCIPAL_HEADER, "system")
        .json(&body)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert!(envelope.success);
    let outcomes = envelope.data.unwrap();
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].node_id, Some(20));
    assert_eq!(outcomes[0].kind, OutcomeKind::Scheduling);
    assert!(outcomes[0].message.contains("startup timeout"));
    assert!(c.seen.lock().unwrap().is_empty());

    // The secondary never writes status.
    let exec = c.primary.store().get(id).await.unwrap().unwrap();
    assert_eq!(exec.status, ExecutionStatus::Pending);
}
