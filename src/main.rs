use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use clap::Parser;
use crossbar_core::{ApiRequest, ServerError, Verb};
use crossbar_server::{
    ApiServer, FnHandler, LoadContext, ObjectDataProvider, ObjectStatus, ServerBuilder,
    ServerConfig,
};
use serde_json::json;

#[derive(Parser)]
#[command(name = "crossbar", about = "Machine-control API server")]
struct Cli {
    /// Path to a JSON configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the configured bind host.
    #[arg(long)]
    host: Option<String>,

    /// Override the configured bind port.
    #[arg(long)]
    port: Option<u16>,
}

/// Built-in provider exposing basic process state. Real deployments swap in
/// a provider backed by their machine firmware connection.
struct SystemProvider {
    started: Instant,
    polls: parking_lot::Mutex<u64>,
}

impl SystemProvider {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            polls: parking_lot::Mutex::new(0),
        }
    }
}

#[async_trait]
impl ObjectDataProvider for SystemProvider {
    async fn list_objects(&self) -> Result<Vec<String>, ServerError> {
        Ok(vec!["system".to_string()])
    }

    async fn query_objects(
        &self,
        objects: &[String],
    ) -> Result<HashMap<String, ObjectStatus>, ServerError> {
        let mut result = HashMap::new();
        if objects.iter().any(|name| name == "system") {
            let polls = {
                let mut polls = self.polls.lock();
                *polls += 1;
                *polls
            };
            let mut status = ObjectStatus::new();
            let _ = status.insert("uptime".into(), json!(self.started.elapsed().as_secs_f64()));
            let _ = status.insert("polls".into(), json!(polls));
            let _ = result.insert("system".to_string(), status);
        }
        Ok(result)
    }
}

struct EchoComponent;
impl crossbar_server::Component for EchoComponent {}

fn build_server(config: ServerConfig) -> Result<ApiServer, ServerError> {
    ServerBuilder::new(config)
        .provider(Arc::new(SystemProvider::new()))
        .register_component("echo", |cx: &mut LoadContext<'_>| {
            cx.register_endpoint(
                "server/echo",
                &[Verb::Post],
                FnHandler(|req: ApiRequest| async move {
                    Ok(json!({ "echo": req.args.as_map().clone() }))
                }),
            )?;
            Ok(Arc::new(EchoComponent))
        })
        .build()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .map_err(|e| anyhow::anyhow!("reading {}: {e}", path.display()))?;
            serde_json::from_str::<ServerConfig>(&raw)
                .map_err(|e| anyhow::anyhow!("parsing {}: {e}", path.display()))?
        }
        None => ServerConfig::default(),
    };
    if let Some(host) = cli.host {
        config.host = host;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if config.port == 0 {
        config.port = 7125;
    }

    tracing::info!("starting crossbar server");
    let server = build_server(config)?;
    let handle = server.start().await?;
    tracing::info!(addr = %handle.addr(), "crossbar ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    handle.shutdown();
    Ok(())
}
