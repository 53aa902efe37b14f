//! vpa-butler Operator Entry Point
//!
//! Starts the workload controllers, the VPA controller, the capacity
//! runnable and the metrics/probe servers.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use vpa_butler::config::Settings;
use vpa_butler::controller::{self, CapacityRunnable};
use vpa_butler::{server, Error};

const METRICS_PORT: u16 = 8080;
const PROBE_PORT: u16 = 8081;
const CAPACITY_PERIOD: Duration = Duration::from_secs(30);
const CAPACITY_JITTER_FACTOR: f64 = 1.2;

#[tokio::main]
async fn main() -> Result<(), Error> {
    let settings = Settings::parse();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(
            EnvFilter::builder()
                .with_default_directive(Level::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let defaults = match settings.defaults(env!("CARGO_PKG_VERSION")) {
        Ok(defaults) => defaults,
        Err(err) => {
            println!("{err}");
            std::process::exit(1);
        }
    };

    info!("starting vpa-butler v{}", env!("CARGO_PKG_VERSION"));

    let client = kube::Client::try_default().await.map_err(Error::KubeError)?;
    info!("connected to Kubernetes cluster");

    tokio::spawn(async {
        let addr = SocketAddr::from(([0, 0, 0, 0], METRICS_PORT));
        if let Err(err) = server::run_metrics_server(addr).await {
            error!(error = %err, "metrics server error");
        }
    });
    tokio::spawn(async {
        let addr = SocketAddr::from(([0, 0, 0, 0], PROBE_PORT));
        if let Err(err) = server::run_probe_server(addr).await {
            error!(error = %err, "probe server error");
        }
    });

    let capacity = CapacityRunnable {
        client: client.clone(),
        period: CAPACITY_PERIOD,
        jitter_factor: CAPACITY_JITTER_FACTOR,
        capacity_percent: defaults.capacity_percent,
    };
    let defaults = Arc::new(defaults);

    // Run until the first controller exits (on signal) or fails
    tokio::select! {
        _ = controller::run_workload_controllers(client.clone()) => {
            info!("workload controllers stopped")
        }
        result = controller::run_vpa_controller(client, defaults) => match result {
            Ok(()) => info!("vpa controller stopped"),
            Err(err) => {
                error!(error = %err, "vpa controller failed");
                return Err(err);
            }
        },
        _ = capacity.run() => {}
    }

    info!("shutting down");
    Ok(())
}
