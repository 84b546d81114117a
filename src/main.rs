#![allow(missing_docs)]

//! Brain -- TEE-resident orchestrator service binary.
//!
//! Wires the intent parser, context manager, planning engine, tool
//! orchestrator, Soul client, and attestation verifier together, then
//! serves gRPC and the HTTP diagnostics surface until shutdown.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{error, info, warn};

use brain::config::BrainConfig;
use brain::context::summarizer::{ActionDigestSummarizer, LlmSummarizer, Summarizer};
use brain::context::ContextManager;
use brain::intent::IntentParser;
use brain::llm::ChatClient;
use brain::logging::{self, LogMode};
use brain::planner::engine::PlanningEngine;
use brain::server::http;
use brain::server::metrics::Metrics;
use brain::server::rpc::BrainRpc;
use brain::server::ServiceState;
use brain::soul::attestation::AttestationVerifier;
use brain::soul::client::SoulClient;
use brain::soul::SoulApi;
use brain::tools::orchestrator::ToolOrchestrator;
use brain::tools::{register_default_tools, AttestationGate};

/// Summarization deadline for the LLM strategy.
const SUMMARIZER_DEADLINE: Duration = Duration::from_secs(4);

#[derive(Parser)]
#[command(name = "brain", version, about = "Brain orchestrator service")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the service (default).
    Start {
        /// Directory for rotated JSON logs.
        #[arg(long, default_value = "./logs")]
        logs_dir: PathBuf,
    },
    /// Check connectivity to Soul and print a diagnostic report.
    Doctor,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = BrainConfig::load().context("failed to load configuration")?;

    match cli.command.unwrap_or(Command::Start {
        logs_dir: PathBuf::from("./logs"),
    }) {
        Command::Start { logs_dir } => run_start(config, &logs_dir).await,
        Command::Doctor => run_doctor(config).await,
    }
}

async fn run_start(config: BrainConfig, logs_dir: &std::path::Path) -> Result<()> {
    let _log_handle = logging::init(
        &config,
        LogMode::Service {
            logs_dir: logs_dir.to_path_buf(),
        },
    );

    info!(
        version = env!("CARGO_PKG_VERSION"),
        grpc_port = config.server.grpc_port,
        http_port = config.server.http_port,
        soul = %config.soul.grpc_url,
        "brain starting"
    );

    let state = build_state(config)?;

    // Fan-out shutdown: Ctrl-C flips the watch, every task drains.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    });

    // Background sweeper: session TTL/LRU eviction (cancelling plans the
    // evicted sessions own) and expired-approval cleanup.
    let sweeper = {
        let state = Arc::clone(&state);
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(
                state.config.context.sweep_interval_seconds.max(1),
            ));
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let outcome = state.context.sweep().await;
                        for (session_id, _) in &outcome.evicted {
                            state.engine.cancel_for_session(session_id).await;
                        }
                        let reaped = state.engine.approvals().lock().await.cleanup_expired();
                        if reaped > 0 {
                            info!(reaped, "expired approvals reaped");
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        })
    };

    let http_task = {
        let state = Arc::clone(&state);
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = http::serve(state, shutdown).await {
                error!(error = %e, "http surface failed");
            }
        })
    };

    let grpc_addr = std::net::SocketAddr::from(([0, 0, 0, 0], state.config.server.grpc_port));
    info!(addr = %grpc_addr, "rpc surface listening");
    let mut grpc_shutdown = shutdown_rx.clone();
    tonic::transport::Server::builder()
        .add_service(BrainRpc::new(Arc::clone(&state)).into_server())
        .serve_with_shutdown(grpc_addr, async move {
            let _ = grpc_shutdown.changed().await;
        })
        .await
        .context("rpc server failed")?;

    let _ = tokio::join!(http_task, sweeper);
    info!("brain stopped");
    Ok(())
}

/// Wire all components into the shared service state.
fn build_state(config: BrainConfig) -> Result<Arc<ServiceState>> {
    let soul_client = Arc::new(SoulClient::new(
        config.soul.grpc_url.clone(),
        config.soul.call_deadline(),
    ));
    let soul_api: Arc<dyn SoulApi> = Arc::clone(&soul_client) as Arc<dyn SoulApi>;

    let verifier = Arc::new(AttestationVerifier::new(
        Arc::clone(&soul_api),
        config.attestation.clone(),
    ));
    let gate: Arc<dyn AttestationGate> = Arc::clone(&verifier) as Arc<dyn AttestationGate>;

    let mut orchestrator = ToolOrchestrator::new(config.tools.clone(), Arc::clone(&gate));
    register_default_tools(&mut orchestrator, Arc::clone(&soul_api), gate)
        .context("failed to register default tools")?;
    let orchestrator = Arc::new(orchestrator);

    let engine = Arc::new(PlanningEngine::new(
        config.planner.clone(),
        Arc::clone(&orchestrator),
    ));

    let llm = Arc::new(ChatClient::new(config.llm.clone()));
    let summarizer: Arc<dyn Summarizer> = if llm.enabled() {
        Arc::new(LlmSummarizer::new(Arc::clone(&llm), SUMMARIZER_DEADLINE))
    } else {
        Arc::new(ActionDigestSummarizer)
    };

    let context = Arc::new(ContextManager::new(
        config.context.clone(),
        config.privacy.clone(),
        summarizer,
    ));

    Ok(Arc::new(ServiceState {
        parser: IntentParser::new(),
        context,
        engine,
        orchestrator,
        verifier,
        llm,
        metrics: Metrics::default(),
        config,
        started_at: Instant::now(),
    }))
}

/// One-shot connectivity and trust report.
async fn run_doctor(config: BrainConfig) -> Result<()> {
    let _log_handle = logging::init(&config, LogMode::Console);

    println!("brain doctor");
    println!("  soul endpoint: {}", config.soul.grpc_url);
    if let Some(url) = &config.soul.attestation_url {
        println!("  attestation url: {url}");
    }

    let soul_client = Arc::new(SoulClient::new(
        config.soul.grpc_url.clone(),
        config.soul.call_deadline(),
    ));
    let soul_api: Arc<dyn SoulApi> = Arc::clone(&soul_client) as Arc<dyn SoulApi>;

    match soul_api.health_check().await {
        Ok(report) => println!(
            "  soul health: {} ({} ms)",
            if report.healthy { "ok" } else { "unhealthy" },
            report.latency_ms
        ),
        Err(e) => {
            warn!(error = %e, "soul health check failed");
            println!("  soul health: unreachable ({e})");
        }
    }

    let verifier = AttestationVerifier::new(soul_api, config.attestation.clone());
    let result = verifier.verify(true).await;
    println!(
        "  attestation: {}",
        if result.verified {
            "verified".to_owned()
        } else {
            format!(
                "NOT verified ({})",
                result.error.as_deref().unwrap_or("unknown")
            )
        }
    );
    if let Some(record) = &result.attestation {
        println!("  mr_enclave:  {}", record.mr_enclave);
        println!("  mr_signer:   {}", record.mr_signer);
    }

    println!(
        "  llm:         {}",
        if config.llm.enabled() {
            format!("enabled ({})", config.llm.model)
        } else {
            "disabled (no PHALA_AI_API_KEY)".to_owned()
        }
    );

    if !result.verified && config.attestation.strict {
        println!("  verdict:     privileged tools will be refused (strict mode)");
    } else {
        println!("  verdict:     ready");
    }
    Ok(())
}
