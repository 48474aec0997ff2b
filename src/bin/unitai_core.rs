//! Debug/administrative CLI for `unitai-core`. Not the product's own CLI:
//! the core is meant to be embedded in an MCP-style tool server. This
//! binary is a thin `clap`-derived harness for inspecting a `Dependencies`
//! instance from the shell.

use clap::{Parser, Subcommand};
use unitai_core::deps::Dependencies;
use unitai_core::model::BackendId;

#[derive(Parser)]
#[command(name = "unitai-core", about = "Debug harness for the AI backend orchestration core")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print registered backends and their circuit state.
    Status,
    /// Show the most recent audit entries.
    Audit {
        #[command(subcommand)]
        action: AuditAction,
    },
    /// Query RED metrics for a backend.
    Metrics {
        #[command(subcommand)]
        action: MetricsAction,
    },
    /// Administrative circuit-breaker actions.
    Circuit {
        #[command(subcommand)]
        action: CircuitAction,
    },
}

#[derive(Subcommand)]
enum AuditAction {
    /// Show the most recent audit entries for a workflow.
    Tail {
        #[arg(long)]
        workflow_id: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

#[derive(Subcommand)]
enum MetricsAction {
    /// RED stats for a single backend over a window.
    Red {
        backend: String,
        #[arg(long, default_value_t = 5)]
        window_minutes: u64,
    },
}

#[derive(Subcommand)]
enum CircuitAction {
    /// Clear all in-memory and persisted circuit-breaker state.
    Reset,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let deps = Dependencies::init().await;

    match cli.command {
        Command::Status => {
            for id in deps.registry.all_ids() {
                let state = deps.circuit_breaker.state(&id);
                println!("{id}: {state:?}");
            }
        }
        Command::Audit { action } => match action {
            AuditAction::Tail { workflow_id, limit } => {
                let entries = deps
                    .permissions
                    .audit_query(workflow_id.as_deref(), None)
                    .await;
                for entry in entries.iter().rev().take(limit) {
                    println!(
                        "{} {} {:?} approved={} outcome={:?}",
                        entry.timestamp_ms, entry.target, entry.operation, entry.approved, entry.outcome
                    );
                }
            }
        },
        Command::Metrics { action } => match action {
            MetricsAction::Red { backend, window_minutes } => {
                let id = BackendId::new(backend);
                let stats = deps.metrics.red("executor", Some(&id), window_minutes);
                println!(
                    "rate={:.2}/s error_rate={:.2} p50={}ms p95={}ms p99={}ms",
                    stats.rate_per_sec, stats.error_rate, stats.p50_ms, stats.p95_ms, stats.p99_ms
                );
            }
        },
        Command::Circuit { action } => match action {
            CircuitAction::Reset => {
                deps.circuit_breaker.reset_all().await;
                println!("circuit breaker state reset");
            }
        },
    }

    deps.shutdown().await;
}
