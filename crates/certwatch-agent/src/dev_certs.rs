//! `gen-dev-certs`: development credentials for local testing.

use std::path::PathBuf;

use anyhow::Context;
use clap::Args;
use tracing::info;

use certwatch_tls::certs::{generate_dev_bundle, write_dev_bundle};

#[derive(Debug, Args)]
pub struct DevCertsArgs {
    /// Directory to write ca.pem, server.pem, server-key.pem, client.pem, client-key.pem
    #[arg(long, default_value = "certs")]
    out_dir: PathBuf,

    /// DNS names or IPs the server certificate is valid for (repeatable)
    #[arg(long = "server-name", default_value = "localhost")]
    server_names: Vec<String>,

    /// Common Name of the client certificate
    #[arg(long, default_value = "certwatch-agent")]
    client_id: String,
}

pub fn run(args: &DevCertsArgs) -> anyhow::Result<()> {
    let names: Vec<&str> = args.server_names.iter().map(String::as_str).collect();
    let bundle = generate_dev_bundle(&names, &args.client_id)
        .context("Failed to generate development certificates")?;
    let paths = write_dev_bundle(&args.out_dir, &bundle)
        .with_context(|| format!("Failed to write certificates to {}", args.out_dir.display()))?;

    info!(
        ca = %paths.server.ca.display(),
        server_cert = %paths.server.cert.display(),
        client_cert = %paths.client.cert.display(),
        "Development certificates ready (NOT for production use)"
    );
    Ok(())
}
