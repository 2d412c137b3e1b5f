use std::path::PathBuf;

use clap::Parser;
use geoedge::{debug_flags, GeoEdge};
use tokio::signal::unix::{signal, SignalKind};
use tracing_subscriber::EnvFilter;

/// A geo-aware DNS edge: answers from the nearest healthy site or forwards
/// upstream through a pool of proxies.
#[derive(Parser)]
#[command(version)]
struct Cli {
    /// Path to the YAML config file.
    #[arg(default_value = "geoedge.yaml")]
    config: PathBuf,
}

/// `RUST_LOG` always wins; otherwise `info` everywhere, raised to `debug`
/// for the resolution path (`dns_debug`) or the service-table/control-API
/// path (`service_debug`) per the config file's toggles.
fn init_logging(dns_debug: bool, service_debug: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let mut directives = "info".to_string();
        if dns_debug {
            directives.push_str(",geoedge::engine=debug,geoedge::server=debug,geoedge::forward=debug,geoedge::proxy=debug");
        }
        if service_debug {
            directives.push_str(",geoedge::service_table=debug,geoedge::api=debug");
        }
        EnvFilter::new(directives)
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let (dns_debug, service_debug) = debug_flags(&cli.config);
    init_logging(dns_debug, service_debug);

    let geoedge = match GeoEdge::new(&cli.config).await {
        Ok(geoedge) => geoedge,
        Err(e) => {
            tracing::error!(error = %e, "failed to start");
            std::process::exit(1);
        }
    };

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            tracing::error!(error = %e, "failed to register signal handler");
            std::process::exit(1);
        }
    };

    tokio::select! {
        _ = sigterm.recv() => tracing::debug!("saw sigterm"),
        _ = tokio::signal::ctrl_c() => tracing::debug!("saw ctrl-c"),
    }

    geoedge.shutdown().await;
}
