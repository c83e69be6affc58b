//! Tidepool MCP Server
//!
//! This binary serves the `sandbox_*` tools over stdio. Sandboxes run on the
//! local Docker daemon, or in process memory with `--backend memory`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::{Parser, ValueEnum};
use rmcp::ServiceExt;
use tidepool::{
    AgentDefaults, DirFileStore, DockerBackend, ExecutionContext, MemoryBackend, Runtime,
    SandboxBackend, SandboxSettings, SandboxToolkit, SessionManager,
};
use tidepool_mcp::{TidepoolServer, run_then_close};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum BackendKind {
    /// Containers on the local Docker daemon
    Docker,
    /// In-process sandboxes with a tiny builtin command set
    Memory,
}

#[derive(Debug, Parser)]
#[command(name = "tidepool-mcp", version, about = "Persistent sandboxes over MCP")]
struct Args {
    /// Execution backend
    #[arg(long, env = "TIDEPOOL_BACKEND", value_enum, default_value_t = BackendKind::Docker)]
    backend: BackendKind,

    /// JSON file with sandbox settings; flags override it
    #[arg(long, env = "TIDEPOOL_CONFIG")]
    config: Option<PathBuf>,

    /// Runtime shortcut (python, node or bash)
    #[arg(long, env = "TIDEPOOL_RUNTIME")]
    runtime: Option<String>,

    /// Container image, overriding the runtime's default
    #[arg(long, env = "TIDEPOOL_IMAGE")]
    image: Option<String>,

    /// Allow sandboxes to reach the network
    #[arg(long, env = "TIDEPOOL_ALLOW_NETWORK")]
    allow_network: Option<bool>,

    /// Default and maximum exec timeout in seconds
    #[arg(long, env = "TIDEPOOL_EXEC_TIMEOUT_SECS")]
    exec_timeout_secs: Option<u64>,

    /// Destroy sandboxes unused for this many seconds
    #[arg(long, env = "TIDEPOOL_IDLE_TIMEOUT_SECS")]
    idle_timeout_secs: Option<u64>,

    /// Seconds between idle sweeps, 0 disables them
    #[arg(long, env = "TIDEPOOL_CLEANUP_INTERVAL_SECS")]
    cleanup_interval_secs: Option<u64>,

    /// Directory backing sandbox_stage_file and sandbox_publish_file
    #[arg(long, env = "TIDEPOOL_FILE_STORE")]
    file_store: Option<PathBuf>,

    /// Workflow run to share sandboxes with
    #[arg(long, env = "TIDEPOOL_WORKFLOW_RUN_ID")]
    workflow_run_id: Option<String>,

    /// Agent run id, random when omitted
    #[arg(long, env = "TIDEPOOL_AGENT_RUN_ID")]
    agent_run_id: Option<String>,

    /// Session name within the run
    #[arg(long, env = "TIDEPOOL_SESSION_NAME")]
    session_name: Option<String>,
}

impl Args {
    fn settings(&self) -> anyhow::Result<SandboxSettings> {
        let mut settings = match &self.config {
            Some(path) => {
                let raw = std::fs::read(path)
                    .with_context(|| format!("reading {}", path.display()))?;
                serde_json::from_slice(&raw)
                    .with_context(|| format!("parsing {}", path.display()))?
            }
            None => SandboxSettings::default(),
        };
        if let Some(secs) = self.idle_timeout_secs {
            settings.idle_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = self.cleanup_interval_secs {
            settings.cleanup_interval = Duration::from_secs(secs);
        }
        Ok(settings)
    }

    fn defaults(&self) -> AgentDefaults {
        AgentDefaults {
            runtime: self.runtime.as_deref().map(Runtime::parse),
            image: self.image.clone(),
            allow_network: self.allow_network,
            timeout_secs: self.exec_timeout_secs,
        }
    }

    fn context(&self) -> ExecutionContext {
        ExecutionContext {
            workflow_run_id: self.workflow_run_id.clone().unwrap_or_default(),
            agent_run_id: self
                .agent_run_id
                .clone()
                .unwrap_or_else(|| format!("mcp-{}", uuid::Uuid::new_v4().simple())),
            agent_name: "tidepool-mcp".to_string(),
            session_name: self.session_name.clone().unwrap_or_default(),
        }
    }
}

async fn backend(kind: BackendKind) -> anyhow::Result<Arc<dyn SandboxBackend>> {
    match kind {
        BackendKind::Docker => {
            let docker = DockerBackend::connect().context("connecting to docker")?;
            docker.ping().await.context("docker daemon is not reachable")?;
            Ok(Arc::new(docker))
        }
        BackendKind::Memory => Ok(Arc::new(MemoryBackend::new())),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing - output to stderr so it doesn't interfere with MCP stdio
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let args = Args::parse();
    let settings = args.settings()?;
    let context = args.context();
    tracing::info!(
        backend = ?args.backend,
        workflow_run_id = %context.workflow_run_id,
        agent_run_id = %context.agent_run_id,
        "Starting Tidepool MCP server"
    );

    let manager = Arc::new(SessionManager::with_settings(
        backend(args.backend).await?,
        &settings,
    ));
    let mut builder = SandboxToolkit::builder(manager.clone())
        .settings(settings)
        .defaults(args.defaults());
    if let Some(root) = &args.file_store {
        builder = builder.file_store(Arc::new(DirFileStore::new(root)));
    }
    let server = TidepoolServer::new(Arc::new(builder.build()), context);

    let service = server
        .serve(rmcp::transport::stdio())
        .await
        .inspect_err(|e| {
            tracing::error!("Failed to start MCP service: {}", e);
        })?;

    tracing::info!("Tidepool MCP server running");

    let serving = async move {
        tokio::select! {
            result = service.waiting() => result.map(drop),
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted");
                Ok(())
            }
        }
    };
    run_then_close(&manager, serving).await?;

    Ok(())
}
