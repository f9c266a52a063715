//! Route protection.
//!
//! SYSTEM CONTEXT
//! ==============
//! Two guard flavors wrap protected content:
//! - role-gated: reads the locally cached role marker synchronously, so first
//!   paint never waits on the backend. The controllers correct any mismatch on
//!   the next render.
//! - admin-gated: reads the admin controller's resolved state and never
//!   redirects while that state is `Loading`.
//!
//! Decisions are pure functions ([`role_decision`], [`admin_decision`]); the
//! guard types apply them through the [`Router`].

use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::model::{AdminState, Role};
use crate::router::{Location, NavState, NavigateOptions, Router, routes};

// =============================================================================
// ROLE CACHE
// =============================================================================

/// Locally cached role marker, written when a profile resolves and cleared on
/// sign-out.
#[derive(Debug, Clone, Default)]
pub struct RoleCache {
    inner: Arc<RwLock<Option<Role>>>,
}

impl RoleCache {
    #[must_use]
    pub fn get(&self) -> Option<Role> {
        *self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set(&self, role: Role) {
        *self.inner.write().unwrap_or_else(PoisonError::into_inner) = Some(role);
    }

    pub fn clear(&self) {
        *self.inner.write().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

// =============================================================================
// DECISIONS
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redirect {
    pub to: &'static str,
    /// Originally requested path, carried for post-login return.
    pub from: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardDecision {
    Render,
    /// Blocking placeholder: no content and no redirect.
    Loading,
    Redirect(Redirect),
}

/// Role-gated decision. `required == None` marks a public route.
///
/// A role mismatch sends the user to their own dashboard rather than an error
/// page.
#[must_use]
pub fn role_decision(required: Option<Role>, cached: Option<Role>, location: &Location) -> GuardDecision {
    let Some(required) = required else {
        return GuardDecision::Render;
    };
    match cached {
        None => GuardDecision::Redirect(Redirect { to: routes::LOGIN, from: Some(location.path.clone()) }),
        Some(role) if role != required => GuardDecision::Redirect(Redirect { to: role.dashboard_path(), from: None }),
        Some(_) => GuardDecision::Render,
    }
}

/// Admin-gated decision. `PendingOnboarding` renders like `Admin`.
#[must_use]
pub fn admin_decision(state: &AdminState, location: &Location) -> GuardDecision {
    match state {
        AdminState::Loading => GuardDecision::Loading,
        AdminState::NotAdmin => {
            GuardDecision::Redirect(Redirect { to: routes::ADMIN_LOGIN, from: Some(location.path.clone()) })
        }
        AdminState::Admin(_) | AdminState::PendingOnboarding { .. } => GuardDecision::Render,
    }
}

fn perform(router: &dyn Router, redirect: &Redirect) {
    router.navigate(
        redirect.to,
        NavigateOptions { replace: true, state: NavState { onboarding: None, from: redirect.from.clone() } },
    );
}

// =============================================================================
// ROLE GUARD
// =============================================================================

pub struct RoleGuard {
    required: Option<Role>,
    cache: RoleCache,
    router: Arc<dyn Router>,
}

impl RoleGuard {
    #[must_use]
    pub fn new(required: Option<Role>, cache: RoleCache, router: Arc<dyn Router>) -> Self {
        Self { required, cache, router }
    }

    /// Decide for the current location and perform any redirect.
    pub fn check(&self) -> GuardDecision {
        let location = self.router.location();
        let decision = role_decision(self.required, self.cache.get(), &location);
        if let GuardDecision::Redirect(redirect) = &decision {
            info!(from = %location.path, to = redirect.to, "role guard redirect");
            perform(self.router.as_ref(), redirect);
        }
        decision
    }
}

// =============================================================================
// ADMIN GUARD
// =============================================================================

/// Admin-gated guard bound to an admin controller's state stream.
pub struct AdminGuard {
    state: watch::Receiver<AdminState>,
    router: Arc<dyn Router>,
    /// Path a redirect was last issued from and not yet arrived at its
    /// target. Re-renders on that same path don't redirect again.
    pending_from: Mutex<Option<String>>,
}

impl AdminGuard {
    #[must_use]
    pub fn new(state: watch::Receiver<AdminState>, router: Arc<dyn Router>) -> Self {
        Self { state, router, pending_from: Mutex::new(None) }
    }

    /// Decide from the latest state and perform any redirect.
    pub fn check(&self) -> GuardDecision {
        let location = self.router.location();
        let decision = admin_decision(&self.state.borrow(), &location);
        let mut pending = self
            .pending_from
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match &decision {
            GuardDecision::Redirect(redirect) if location.path == redirect.to => {
                *pending = None;
            }
            GuardDecision::Redirect(redirect) if pending.as_deref() == Some(location.path.as_str()) => {
                debug!(path = %location.path, to = redirect.to, "admin guard redirect already in flight");
            }
            GuardDecision::Redirect(redirect) => {
                info!(from = %location.path, to = redirect.to, "admin guard redirect");
                *pending = Some(location.path.clone());
                perform(self.router.as_ref(), redirect);
            }
            GuardDecision::Render => *pending = None,
            GuardDecision::Loading => {}
        }
        decision
    }

    /// Re-evaluate on every state or location change, publishing each decision.
    #[must_use]
    pub fn install(self) -> GuardHandle {
        let (tx, rx) = watch::channel(self.check());
        let mut locations = self.router.watch();
        let task = tokio::spawn(async move {
            let mut guard = self;
            loop {
                tokio::select! {
                    changed = guard.state.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    changed = locations.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
                tx.send_replace(guard.check());
            }
            debug!("admin guard detached");
        });
        GuardHandle { decisions: rx, task }
    }
}

/// Running admin guard. Dropping it detaches the guard.
pub struct GuardHandle {
    decisions: watch::Receiver<GuardDecision>,
    task: JoinHandle<()>,
}

impl GuardHandle {
    #[must_use]
    pub fn decisions(&self) -> watch::Receiver<GuardDecision> {
        self.decisions.clone()
    }

    #[must_use]
    pub fn current(&self) -> GuardDecision {
        self.decisions.borrow().clone()
    }
}

impl Drop for GuardHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
#[path = "guard_test.rs"]
mod tests;
