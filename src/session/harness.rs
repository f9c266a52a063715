//! Shared wiring for controller tests.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use super::SessionDeps;
use crate::backend::memory::MemoryBackend;
use crate::config::Timeouts;
use crate::guard::RoleCache;
use crate::notify::RecordingNotifier;
use crate::router::{Location, MemoryRouter};

pub(crate) struct Harness {
    pub backend: Arc<MemoryBackend>,
    pub router: Arc<MemoryRouter>,
    pub notifier: Arc<RecordingNotifier>,
    pub cache: RoleCache,
    pub deps: SessionDeps,
}

impl Harness {
    pub fn at(location: Location) -> Self {
        let backend = Arc::new(MemoryBackend::new());
        let router = Arc::new(MemoryRouter::new(location));
        let notifier = Arc::new(RecordingNotifier::new());
        let cache = RoleCache::default();
        let deps = SessionDeps {
            backend: backend.clone(),
            router: router.clone(),
            notifier: notifier.clone(),
            role_cache: cache.clone(),
            timeouts: Timeouts::default(),
        };
        Self { backend, router, notifier, cache, deps }
    }
}

/// Wait until the watched value satisfies `pred`, returning it.
pub(crate) async fn wait_for<T: Clone>(rx: &mut watch::Receiver<T>, pred: impl Fn(&T) -> bool) -> T {
    let wait = async {
        loop {
            {
                let value = rx.borrow_and_update();
                if pred(&value) {
                    return value.clone();
                }
            }
            rx.changed().await.expect("state channel closed");
        }
    };
    tokio::time::timeout(Duration::from_secs(60), wait)
        .await
        .expect("condition not reached")
}

/// Let spawned tasks run without advancing past any real deadline.
pub(crate) async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}
