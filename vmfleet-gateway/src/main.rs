//! Entry point for the `vmfleet-gateway` HTTP server.

use std::path::Path;
use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;
use vmfleet_gateway::{routes::create_router, state::AppState};
use vmfleet_vbox::{CacheDirStore, IsoTool, SshCli, VBoxManage, VboxConfig, VboxContext};

fn load_config() -> VboxConfig {
    let config = match std::env::var_os("VMFLEET_CONFIG") {
        Some(path) => match VboxConfig::from_file(Path::new(&path)) {
            Ok(c) => c,
            Err(e) => {
                tracing::error!(path = ?path, error = %e, "failed to load config");
                std::process::exit(1);
            }
        },
        None => VboxConfig::default(),
    };
    config.with_env_overrides()
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let addr = std::env::var("VMFLEET_LISTEN_ADDR")
        .unwrap_or_else(|_| "127.0.0.1:3457".to_owned());

    let config = load_config();
    let ctx = VboxContext::new(
        config.clone(),
        Arc::new(VBoxManage::new(config.vboxmanage.clone())),
        Arc::new(SshCli::default()),
        Arc::new(CacheDirStore::new(config.cache_dir())),
        Arc::new(IsoTool::default()),
    );
    let app = create_router(AppState::new(Arc::new(ctx)));

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "failed to bind");
            std::process::exit(1);
        }
    };

    info!(addr = %addr, state_dir = %config.state_dir.display(), "vmfleet-gateway listening");

    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!(error = %e, "server error");
        std::process::exit(1);
    }
}
