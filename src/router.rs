//! Router collaborator: current location, navigation with typed state, and a
//! watchable location stream.
//!
//! SYSTEM CONTEXT
//! ==============
//! Controllers navigate through [`Router`] after sign-in/sign-out; guards
//! read the current [`Location`] and redirect through it. The admin controller
//! watches location changes because the onboarding bypass depends on the path.

use std::sync::{Mutex, PoisonError};

use tokio::sync::watch;
use uuid::Uuid;

/// Application paths the session core navigates to.
pub mod routes {
    pub const LANDING: &str = "/";
    pub const LOGIN: &str = "/login";
    pub const TENANT_DASHBOARD: &str = "/tenant/dashboard";
    pub const ADMIN_DASHBOARD: &str = "/admin/dashboard";
    pub const ADMIN_LOGIN: &str = "/admin/login";
    pub const CREATE_SOCIETY: &str = "/admin/create-society";
}

/// Marker carried into the society-creation page by the "become admin" flow.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OnboardingToken {
    pub user_id: Option<Uuid>,
    pub from_signup: bool,
}

impl OnboardingToken {
    #[must_use]
    pub fn for_user(user_id: Uuid) -> Self {
        Self { user_id: Some(user_id), from_signup: false }
    }

    #[must_use]
    pub fn from_signup() -> Self {
        Self { user_id: None, from_signup: true }
    }

    /// A token grants the bypass only if it names a user or comes from sign-up.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.user_id.is_some() || self.from_signup
    }
}

/// Typed navigation state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NavState {
    pub onboarding: Option<OnboardingToken>,
    /// Originally requested path, for post-login return.
    pub from: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    pub path: String,
    pub state: NavState,
}

impl Location {
    #[must_use]
    pub fn new(path: &str) -> Self {
        Self { path: path.to_owned(), state: NavState::default() }
    }

    #[must_use]
    pub fn with_state(path: &str, state: NavState) -> Self {
        Self { path: path.to_owned(), state }
    }

    #[must_use]
    pub fn return_to(&self) -> Option<&str> {
        self.state.from.as_deref()
    }

    /// Onboarding token, if one was carried and it is valid.
    #[must_use]
    pub fn onboarding(&self) -> Option<&OnboardingToken> {
        self.state
            .onboarding
            .as_ref()
            .filter(|token| token.is_valid())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NavigateOptions {
    pub replace: bool,
    pub state: NavState,
}

impl NavigateOptions {
    #[must_use]
    pub fn replace() -> Self {
        Self { replace: true, state: NavState::default() }
    }
}

pub trait Router: Send + Sync {
    fn location(&self) -> Location;

    fn navigate(&self, path: &str, options: NavigateOptions);

    /// Receiver that observes every navigation.
    fn watch(&self) -> watch::Receiver<Location>;
}

// =============================================================================
// MEMORY ROUTER
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NavEntry {
    pub path: String,
    pub replace: bool,
}

/// History-recording router with no rendering behind it.
pub struct MemoryRouter {
    tx: watch::Sender<Location>,
    history: Mutex<Vec<NavEntry>>,
}

impl MemoryRouter {
    #[must_use]
    pub fn new(initial: Location) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx, history: Mutex::new(Vec::new()) }
    }

    #[must_use]
    pub fn at(path: &str) -> Self {
        Self::new(Location::new(path))
    }

    #[must_use]
    pub fn path(&self) -> String {
        self.tx.borrow().path.clone()
    }

    /// Every navigation performed since construction, oldest first.
    #[must_use]
    pub fn history(&self) -> Vec<NavEntry> {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    #[must_use]
    pub fn navigations_to(&self, path: &str) -> usize {
        self.history().iter().filter(|e| e.path == path).count()
    }
}

impl Router for MemoryRouter {
    fn location(&self) -> Location {
        self.tx.borrow().clone()
    }

    fn navigate(&self, path: &str, options: NavigateOptions) {
        tracing::debug!(path, replace = options.replace, "navigate");
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(NavEntry { path: path.to_owned(), replace: options.replace });
        self.tx
            .send_replace(Location::with_state(path, options.state));
    }

    fn watch(&self) -> watch::Receiver<Location> {
        self.tx.subscribe()
    }
}
