use std::sync::Arc;
use std::time::Duration;

use societyhub::backend::rest::RestBackend;
use societyhub::notify::LogNotifier;
use societyhub::router::{MemoryRouter, routes};
use societyhub::{AdminSessionController, IdentitySessionController, RoleCache, SessionConfig, SessionDeps};
use tokio::sync::watch;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt::init();

    let config = match SessionConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "invalid configuration");
            std::process::exit(2);
        }
    };
    let Some(backend_config) = config.backend.clone() else {
        tracing::error!("no backend configured");
        std::process::exit(2);
    };
    let backend = match RestBackend::new(backend_config) {
        Ok(backend) => Arc::new(backend),
        Err(e) => {
            tracing::error!(error = %e, "backend client init failed");
            std::process::exit(1);
        }
    };

    let deps = SessionDeps {
        backend,
        router: Arc::new(MemoryRouter::at(routes::LANDING)),
        notifier: Arc::new(LogNotifier),
        role_cache: RoleCache::default(),
        timeouts: config.timeouts,
    };
    let identity = IdentitySessionController::new(deps.clone());
    let admin = AdminSessionController::new(deps.clone());
    let _identity_mount = identity.mount();
    let _admin_mount = admin.mount();

    let bound = config.timeouts.session_resolve.max(config.timeouts.admin_resolve) + Duration::from_secs(1);
    settled(identity.subscribe(), bound, |s| !s.is_loading()).await;
    settled(admin.subscribe(), bound, |s| !s.is_loading()).await;

    tracing::info!(
        session = ?identity.state(),
        role = ?deps.role_cache.get(),
        admin = ?admin.state(),
        "session resolved"
    );
}

/// Wait up to `bound` for the watched state to satisfy `done`.
async fn settled<T>(mut rx: watch::Receiver<T>, bound: Duration, done: impl Fn(&T) -> bool) {
    if tokio::time::timeout(bound, rx.wait_for(|v| done(v))).await.is_err() {
        tracing::warn!(?bound, "state did not settle");
    }
}
