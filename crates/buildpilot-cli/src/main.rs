//! Thin JSON-RPC client for the build-orchestration service.

use clap::{Parser, Subcommand};

mod client;
mod commands;

use client::RpcClient;

#[derive(Parser)]
#[command(name = "buildpilot")]
#[command(about = "Client for the build-orchestration JSON-RPC service", long_about = None)]
struct Cli {
    /// Base URL of the buildpilot-api server.
    #[arg(long, env = "BUILDPILOT_URL", default_value = "http://localhost:8080")]
    url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit a build/test/publish job. Pass a JSON literal or `-` for stdin.
    SubmitJob {
        #[arg(value_name = "json|-")]
        config: String,
    },
    /// Get a job's current status.
    GetStatus { job_id: String },
    /// Get a job's logs, optionally scoped to one phase (build/test/publish).
    GetLogs {
        job_id: String,
        phase: Option<String>,
    },
    /// Cancel a running job.
    KillJob { job_id: String },
    /// Best-effort cleanup of a terminal job's scheduler artifacts and lock.
    Cleanup { job_id: String },
    /// List terminal jobs, newest first.
    GetHistory {
        #[arg(default_value_t = 50)]
        limit: u64,
        #[arg(default_value_t = 0)]
        offset: u64,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()),
        )
        .init();

    let cli = Cli::parse();
    let client = RpcClient::new(&cli.url);

    let result = match cli.command {
        Commands::SubmitJob { config } => commands::submit_job(&client, &config).await,
        Commands::GetStatus { job_id } => commands::get_status(&client, &job_id).await,
        Commands::GetLogs { job_id, phase } => {
            commands::get_logs(&client, &job_id, phase.as_deref()).await
        }
        Commands::KillJob { job_id } => commands::kill_job(&client, &job_id).await,
        Commands::Cleanup { job_id } => commands::cleanup(&client, &job_id).await,
        Commands::GetHistory { limit, offset } => {
            commands::get_history(&client, limit, offset).await
        }
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
