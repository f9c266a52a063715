//! Session controllers: who is signed in, what role they hold, and whether
//! they administer a society.
//!
//! ARCHITECTURE
//! ============
//! Two independently-lifecycled controllers share one backend auth stream:
//! [`identity::IdentitySessionController`] resolves identity + profile,
//! [`admin::AdminSessionController`] resolves admin standing. Each publishes
//! its resolved state on a `watch` channel; consumers subscribe explicitly.
//!
//! ORDERING
//! ========
//! Every resolution attempt is stamped by a [`ResolutionClock`]. A result is
//! applied only while its stamp is still the latest and the controller is
//! still mounted, so out-of-order completions never regress state and nothing
//! lands after unmount.

pub mod admin;
pub mod identity;

#[cfg(test)]
mod harness;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tokio::task::JoinHandle;

use crate::backend::{Backend, BackendError};
use crate::config::Timeouts;
use crate::guard::RoleCache;
use crate::notify::Notifier;
use crate::router::Router;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("{0}")]
    InvalidCredentials(String),
    #[error("not signed in")]
    NotSignedIn,
    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl AuthError {
    /// Credential rejections become [`AuthError::InvalidCredentials`]; everything
    /// else stays a backend error.
    pub(crate) fn from_backend(err: BackendError) -> Self {
        match err {
            BackendError::Credentials(message) => Self::InvalidCredentials(message),
            other => Self::Backend(other),
        }
    }
}

/// Collaborators injected into both controllers.
#[derive(Clone)]
pub struct SessionDeps {
    pub backend: Arc<dyn Backend>,
    pub router: Arc<dyn Router>,
    pub notifier: Arc<dyn Notifier>,
    pub role_cache: RoleCache,
    pub timeouts: Timeouts,
}

// =============================================================================
// RESOLUTION CLOCK
// =============================================================================

/// Monotonic stamp source; the most recently issued stamp is authoritative.
#[derive(Debug, Clone, Default)]
pub(crate) struct ResolutionClock {
    latest: Arc<AtomicU64>,
}

impl ResolutionClock {
    pub(crate) fn stamp(&self) -> u64 {
        self.latest.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn is_current(&self, token: u64) -> bool {
        self.latest.load(Ordering::SeqCst) == token
    }
}

// =============================================================================
// MOUNT
// =============================================================================

/// Shared "still mounted" flag checked before applying resolution results.
#[derive(Debug, Clone, Default)]
pub(crate) struct MountFlag(Arc<AtomicBool>);

impl MountFlag {
    pub(crate) fn set(&self, mounted: bool) {
        self.0.store(mounted, Ordering::SeqCst);
    }

    pub(crate) fn is_mounted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Handle returned by a controller's `mount()`.
///
/// Dropping it (or calling [`Mount::unmount`]) detaches the auth and route
/// listeners and stops in-flight resolutions from applying their results.
pub struct Mount {
    flag: MountFlag,
    tasks: Vec<JoinHandle<()>>,
}

impl Mount {
    pub(crate) fn new(flag: MountFlag, tasks: Vec<JoinHandle<()>>) -> Self {
        Self { flag, tasks }
    }

    #[must_use]
    pub fn is_mounted(&self) -> bool {
        self.flag.is_mounted()
    }

    pub fn unmount(self) {
        drop(self);
    }
}

impl Drop for Mount {
    fn drop(&mut self) {
        self.flag.set(false);
        for task in &self.tasks {
            task.abort();
        }
    }
}
