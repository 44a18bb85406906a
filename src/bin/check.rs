//! nvme-offload backend checker
//!
//! Lists the compiled-in backends and probes whether each works here.

use clap::Parser;
use nvme_offload::{get_backends, probe_backend, BackendKind};
use tracing_subscriber::{fmt, EnvFilter};

/// Check which async I/O backends are usable on this host
#[derive(Parser, Debug)]
#[command(name = "offload-check")]
#[command(about = "Check if offload backends are available")]
#[command(version)]
struct Args {
    /// Backend to check ("all", "uring" or "aio")
    #[arg(short, long, default_value = "all")]
    backend: String,
}

fn main() {
    // Initialize tracing/logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,nvme_offload=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    tracing::debug!("nvme-offload v{}", nvme_offload::VERSION);

    println!("Check backends:");
    if args.backend.eq_ignore_ascii_case("all") {
        for kind in get_backends() {
            check_backend(kind.name());
        }
    } else {
        check_backend(&args.backend);
    }
}

fn check_backend(name: &str) {
    let compiled_in = name
        .parse::<BackendKind>()
        .map(|kind| get_backends().contains(&kind))
        .unwrap_or(false);
    if !compiled_in {
        println!("Invalid backend: {}", name);
        return;
    }

    let status = if probe_backend(name) { "\u{2713}" } else { "x" };
    println!("{}: {}", name, status);
}
