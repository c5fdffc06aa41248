//! Entry point for the `vos-gateway` HTTP server.

use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use vos_core::VosConfig;
use vos_gateway::{routes::create_router, state::AppState};
use vos_vm::{ControllerConfig, QemuLauncher, VmController};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config_path =
        PathBuf::from(std::env::var("VOS_CONFIG").unwrap_or_else(|_| "config.json".to_owned()));
    let mut vos = match VosConfig::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            warn!(path = %config_path.display(), error = %e, "using default configuration");
            VosConfig::default()
        }
    };
    if let Ok(addr) = std::env::var("VOS_LISTEN_ADDR") {
        vos.listen_addr = addr;
    }

    let config = ControllerConfig::from(&vos);
    let vm = Arc::new(VmController::new(QemuLauncher::from_config(&config), config));
    let state = AppState::new(Arc::clone(&vm));
    let streams = state.shutdown_token();
    let app = create_router(state);

    let listener = match tokio::net::TcpListener::bind(&vos.listen_addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(addr = %vos.listen_addr, error = %e, "failed to bind");
            std::process::exit(1);
        }
    };
    info!(addr = %vos.listen_addr, "vos-gateway listening");

    if vos.autostart {
        let vm = Arc::clone(&vm);
        tokio::spawn(async move {
            if let Err(e) = vm.start(None, None).await {
                error!(error = %e, "autostart failed");
            }
        });
    }

    let served = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal(streams)).await;
    vm.shutdown().await;
    if let Err(e) = served {
        error!(error = %e, "server error");
        std::process::exit(1);
    }
}

/// Resolve on Ctrl-C, closing open event streams so in-flight responses end.
async fn shutdown_signal(streams: CancellationToken) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "cannot listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
    streams.cancel();
}
