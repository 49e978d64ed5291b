//! `certwatch` agent
//!
//! Serves gRPC health over mutual TLS with credentials that rotate on disk,
//! and optionally keeps a health-probed connection to an upstream endpoint
//! that is rebuilt whenever its client certificate or CA changes.

mod dev_certs;
mod run;

use clap::{Parser, Subcommand};

/// certwatch agent.
#[derive(Debug, Parser)]
#[command(name = "certwatch-agent", version, about)]
struct Cli {
    /// Log level filter (e.g. "info", "debug", "warn").
    #[arg(long, global = true, default_value = "info", env = "CERTWATCH_LOG_LEVEL")]
    log_level: String,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, global = true, env = "CERTWATCH_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Serve health over rotating mTLS and watch the upstream connection
    Run(run::RunArgs),
    /// Write a development CA plus server and client certificates
    GenDevCerts(dev_certs::DevCertsArgs),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = format!(
        "certwatch_agent={level},certwatch_tls={level},certwatch_grpc={level}",
        level = cli.log_level
    );
    certwatch_core::tracing_init::init_tracing(&filter, cli.log_json);

    match cli.command {
        Commands::Run(args) => run::run(args).await,
        Commands::GenDevCerts(ref args) => dev_certs::run(args),
    }
}
