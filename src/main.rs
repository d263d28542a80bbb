use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};

use testfleet::api::envelope::ResultEnvelope;
use testfleet::api::extract::PRINCIPAL_HEADER;
use testfleet::config::ControllerConfig;
use testfleet::execution::NewExecution;

#[derive(Parser)]
#[command(
    name = "testfleet",
    about = "Execution dispatch and result judgment controller for load-test worker fleets",
    version,
    long_about = None
)]
struct Cli {
    /// Configuration file (overrides TESTFLEET_CONFIG)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Controller to talk to for execution and node commands
    #[arg(long, global = true, default_value = "http://127.0.0.1:8080")]
    server: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the controller (API server + pending retry sweep)
    Serve,

    /// Submit, start, stop and inspect executions
    Execution {
        #[command(subcommand)]
        action: ExecutionAction,
    },

    /// Register worker nodes and inspect the fleet
    Node {
        #[command(subcommand)]
        action: NodeAction,
    },

    /// Inspect configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ExecutionAction {
    /// Submit an execution described by a JSON file
    Submit {
        /// Path to the execution JSON
        file: PathBuf,
    },

    /// Dispatch an execution to its nodes
    Start {
        id: i64,

        /// Explicit target nodes (comma separated)
        #[arg(long, value_delimiter = ',')]
        nodes: Vec<i64>,
    },

    /// Stop an execution on its nodes
    Stop {
        id: i64,

        /// Only stop on these nodes (comma separated)
        #[arg(long, value_delimiter = ',')]
        nodes: Vec<i64>,
    },

    /// Override the thread configuration of an execution that is not running
    Threads {
        id: i64,

        #[arg(long)]
        threads: u32,

        #[arg(long)]
        iterations: u32,

        /// Run duration in seconds
        #[arg(long)]
        duration: Option<u64>,
    },

    /// Soft-delete executions
    Delete {
        #[arg(required = true)]
        ids: Vec<i64>,
    },

    /// Show an execution
    Show { id: i64 },

    /// Show the current test result of an execution's script
    Result { id: i64 },
}

#[derive(Subcommand)]
enum NodeAction {
    /// Register or update a worker node
    Register {
        #[arg(long)]
        id: i64,

        #[arg(long)]
        name: String,

        /// Controller instance host the node connects to
        #[arg(long)]
        controller_ip: String,

        /// Owning tenant; omit for a shared node
        #[arg(long)]
        tenant: Option<i64>,
    },

    /// Record a heartbeat for a node
    Heartbeat { id: i64 },

    /// Make a node selectable again
    Enable { id: i64 },

    /// Exclude a node from selection
    Disable { id: i64 },

    /// List registered nodes
    List,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the resolved configuration as TOML
    Show,
}

/// Minimal client for the controller API, acting as the system principal.
struct ApiClient {
    http: reqwest::Client,
    base: String,
}

impl ApiClient {
    fn new(server: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base: format!("{}/api/v1", server.trim_end_matches('/')),
        }
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<ResultEnvelope<T>> {
        let resp = self
            .http
            .get(format!("{}{}", self.base, path))
            .header(PRINCIPAL_HEADER, "system")
            .send()
            .await
            .with_context(|| format!("GET {} failed", path))?;
        Ok(resp.json().await?)
    }

    async fn post<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<ResultEnvelope<T>> {
        let resp = self
            .http
            .post(format!("{}{}", self.base, path))
            .header(PRINCIPAL_HEADER, "system")
            .json(body)
            .send()
            .await
            .with_context(|| format!("POST {} failed", path))?;
        Ok(resp.json().await?)
    }
}

/// Print the payload, and fail the command when the controller refused.
fn report(envelope: ResultEnvelope<Value>) -> Result<()> {
    if let Some(data) = &envelope.data {
        println!("{}", serde_json::to_string_pretty(data)?);
    }
    if !envelope.success {
        bail!(envelope.message.unwrap_or_else(|| "request failed".to_string()));
    }
    Ok(())
}

fn init_tracing(config: &ControllerConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if config.logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = ControllerConfig::resolve(cli.config.as_deref())?;
    init_tracing(&config);

    let client = ApiClient::new(&cli.server);

    match cli.command {
        Commands::Serve => {
            tracing::info!(
                listen = %config.network.listen_address,
                instance_id = %config.controller.instance_id,
                "Starting testfleet controller"
            );
            testfleet::serve(config).await?;
        }
        Commands::Execution { action } => match action {
            ExecutionAction::Submit { file } => {
                let raw = std::fs::read_to_string(&file)
                    .with_context(|| format!("failed to read {}", file.display()))?;
                let new: NewExecution = serde_json::from_str(&raw)
                    .with_context(|| format!("invalid execution JSON in {}", file.display()))?;
                report(client.post("/executions", &new).await?)?;
            }
            ExecutionAction::Start { id, nodes } => {
                let body = json!({ "execution_id": id, "node_ids": nodes });
                report(client.post("/executions/start", &body).await?)?;
            }
            ExecutionAction::Stop { id, nodes } => {
                let body = json!({ "execution_id": id, "node_ids": nodes });
                report(client.post("/executions/stop", &body).await?)?;
            }
            ExecutionAction::Threads {
                id,
                threads,
                iterations,
                duration,
            } => {
                let body = json!({
                    "thread_count": threads,
                    "iteration_count": iterations,
                    "duration_secs": duration,
                });
                report(client.post(&format!("/executions/{}/threads", id), &body).await?)?;
            }
            ExecutionAction::Delete { ids } => {
                report(client.post("/executions/delete", &json!({ "ids": ids })).await?)?;
            }
            ExecutionAction::Show { id } => {
                report(client.get(&format!("/executions/{}", id)).await?)?;
            }
            ExecutionAction::Result { id } => {
                report(client.get(&format!("/executions/{}/result", id)).await?)?;
            }
        },
        Commands::Node { action } => match action {
            NodeAction::Register {
                id,
                name,
                controller_ip,
                tenant,
            } => {
                let body = json!({
                    "id": id,
                    "tenant_id": tenant,
                    "name": name,
                    "controller_ip": controller_ip,
                });
                report(client.post("/nodes", &body).await?)?;
            }
            NodeAction::Heartbeat { id } => {
                report(client.post(&format!("/nodes/{}/heartbeat", id), &json!({})).await?)?;
            }
            NodeAction::Enable { id } => {
                let body = json!({ "enabled": true });
                report(client.post(&format!("/nodes/{}/enabled", id), &body).await?)?;
            }
            NodeAction::Disable { id } => {
                let body = json!({ "enabled": false });
                report(client.post(&format!("/nodes/{}/enabled", id), &body).await?)?;
            }
            NodeAction::List => {
                let envelope: ResultEnvelope<Value> = client.get("/nodes").await?;
                if let Some(Value::Array(nodes)) = &envelope.data {
                    if nodes.is_empty() {
                        println!("No nodes registered.");
                        return Ok(());
                    }
                    println!(
                        "{:<8} | {:<20} | {:<16} | {:<8} | Active",
                        "Id", "Name", "Controller", "Enabled"
                    );
                    println!("{:-<8}-|-{:-<20}-|-{:-<16}-|-{:-<8}-|-{:-<6}", "", "", "", "", "");
                    for node in nodes {
                        println!(
                            "{:<8} | {:<20} | {:<16} | {:<8} | {}",
                            node["id"],
                            node["name"].as_str().unwrap_or(""),
                            node["controller_ip"].as_str().unwrap_or(""),
                            node["enabled"],
                            node["active_executions"],
                        );
                    }
                    return Ok(());
                }
                report(envelope)?;
            }
        },
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                println!("{}", toml::to_string_pretty(&config)?);
            }
        },
    }

    Ok(())
}
