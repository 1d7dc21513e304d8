use std::path::PathBuf;
use std::process;

use arouter_core::ArouterProxy;
use clap::Parser;

/// Affinity-aware transparent gRPC router.
#[derive(Parser)]
#[command(name = "arouter")]
struct Cli {
    /// Path to the JSON configuration document.
    #[arg(long)]
    config: PathBuf,

    /// Raise logging to debug (-v) or trace (-vv).
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    verbose: u8,
}

impl Cli {
    fn log_filter(&self) -> &'static str {
        match self.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| cli.log_filter().into()))
        .init();

    let config = match arouter_core::Configuration::load(&cli.config) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("failed to load configuration: {err}");
            process::exit(1);
        }
    };

    tracing::info!(instance_id = %config.instance_id, "starting arouter");

    let proxy = match ArouterProxy::build(config) {
        Ok(proxy) => proxy,
        Err(err) => {
            eprintln!("failed to build proxy: {err}");
            process::exit(1);
        }
    };

    if let Err(err) = proxy.listen_and_serve(None).await {
        eprintln!("fatal error: {err}");
        process::exit(1);
    }
}
