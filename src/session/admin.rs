//! Admin session controller: whether the current identity administers a
//! society, and which one.
//!
//! DESIGN
//! ======
//! Layered beside, not on top of, the identity controller: it attaches its own
//! auth-stream listener and re-resolves on mount, on every auth change, and on
//! every route change. The `admins` row (joined with its society) is the only
//! authority for admin standing; `Profile.role` is never consulted.
//!
//! ONBOARDING BYPASS
//! =================
//! While a user is on the society-creation page with a valid
//! [`OnboardingToken`], the membership row does not exist yet. Resolution then
//! short-circuits to `PendingOnboarding` without querying. The token is passed
//! into [`AdminSessionController::resolve`] explicitly and the bypass ends as
//! soon as the path changes away.
//!
//! ERROR HANDLING
//! ==============
//! Every lookup failure fails closed to `NotAdmin`. Each resolution is bounded
//! by the admin timeout; expiry also yields `NotAdmin` and is not an error.

use std::sync::Arc;

use serde_json::json;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{AuthError, Mount, MountFlag, ResolutionClock, SessionDeps};
use crate::backend::{BackendError, Notification, Query, tables};
use crate::model::{AdminMembership, AdminState, AuthEvent, NewSociety, Society, decode_row};
use crate::router::{Location, NavigateOptions, OnboardingToken, routes};

#[derive(Clone)]
pub struct AdminSessionController {
    inner: Arc<Inner>,
}

struct Inner {
    deps: SessionDeps,
    state: watch::Sender<AdminState>,
    clock: ResolutionClock,
    mounted: MountFlag,
}

impl AdminSessionController {
    #[must_use]
    pub fn new(deps: SessionDeps) -> Self {
        let (state, _) = watch::channel(AdminState::Loading);
        Self {
            inner: Arc::new(Inner {
                deps,
                state,
                clock: ResolutionClock::default(),
                mounted: MountFlag::default(),
            }),
        }
    }

    #[must_use]
    pub fn state(&self) -> AdminState {
        self.inner.state.borrow().clone()
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<AdminState> {
        self.inner.state.subscribe()
    }

    #[must_use]
    pub fn society(&self) -> Option<Society> {
        self.inner.state.borrow().society().cloned()
    }

    // =========================================================================
    // LIFECYCLE
    // =========================================================================

    /// Attach auth and route listeners and start the first resolution.
    #[must_use]
    pub fn mount(&self) -> Mount {
        self.inner.mounted.set(true);

        let mut subscription = self.inner.deps.backend.on_session_change();
        let auth_listener = {
            let this = self.clone();
            tokio::spawn(async move {
                while let Some(notification) = subscription.recv().await {
                    // Sign-in/out voids the previous verdict; other events keep it
                    // visible while re-resolving.
                    let reset = match &notification {
                        Notification::Change(change) => {
                            matches!(change.event, AuthEvent::SignedIn | AuthEvent::SignedOut)
                        }
                        Notification::Resync => true,
                    };
                    this.spawn_refresh(reset);
                }
                debug!("auth stream closed; admin listener exiting");
            })
        };

        let mut locations = self.inner.deps.router.watch();
        let route_listener = {
            let this = self.clone();
            tokio::spawn(async move {
                let mut last = route_key(&locations.borrow_and_update());
                while locations.changed().await.is_ok() {
                    let key = route_key(&locations.borrow_and_update());
                    if key == last {
                        continue;
                    }
                    debug!(path = %key.0, "route changed; re-resolving admin state");
                    last = key;
                    this.spawn_refresh(false);
                }
            })
        };

        let initial = {
            let this = self.clone();
            tokio::spawn(async move {
                this.refresh().await;
            })
        };

        Mount::new(self.inner.mounted.clone(), vec![auth_listener, route_listener, initial])
    }

    fn spawn_refresh(&self, reset: bool) {
        let this = self.clone();
        tokio::spawn(async move {
            this.refresh_inner(reset).await;
        });
    }

    // =========================================================================
    // RESOLUTION
    // =========================================================================

    fn is_live(&self, token: u64) -> bool {
        self.inner.mounted.is_mounted() && self.inner.clock.is_current(token)
    }

    fn apply(&self, token: u64, next: AdminState) -> bool {
        if !self.is_live(token) {
            debug!(token, "discarding stale admin resolution");
            return false;
        }
        self.inner.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
        true
    }

    /// Re-resolve admin standing for the router's current location and
    /// return the state this call produced (or the current state, if a newer
    /// resolution superseded it).
    pub async fn refresh(&self) -> AdminState {
        self.refresh_inner(false).await
    }

    async fn refresh_inner(&self, reset: bool) -> AdminState {
        let token = self.inner.clock.stamp();
        let location = self.inner.deps.router.location();
        let onboarding = location.onboarding().cloned();

        let leaving_bypass = matches!(*self.inner.state.borrow(), AdminState::PendingOnboarding { .. })
            && !bypass_applies(&location.path, onboarding.as_ref());
        if reset || leaving_bypass {
            self.apply(token, AdminState::Loading);
        }

        let timeout = self.inner.deps.timeouts.admin_resolve;
        let next = match tokio::time::timeout(timeout, self.resolve(&location.path, onboarding.as_ref())).await {
            Ok(state) => state,
            Err(_) => {
                info!(?timeout, "admin resolution timed out; not admin");
                AdminState::NotAdmin
            }
        };
        if self.apply(token, next.clone()) {
            next
        } else {
            self.state()
        }
    }

    /// Resolve admin standing for `path`, honoring an explicit onboarding token.
    pub async fn resolve(&self, path: &str, onboarding: Option<&OnboardingToken>) -> AdminState {
        if bypass_applies(path, onboarding) {
            let user_id = onboarding.and_then(|t| t.user_id);
            info!(?user_id, "onboarding bypass active");
            return AdminState::PendingOnboarding { user_id };
        }

        let identity = match self.inner.deps.backend.get_current_session().await {
            Ok(Some(session)) => session.identity,
            Ok(None) => {
                debug!("no session; not admin");
                return AdminState::NotAdmin;
            }
            Err(e) => {
                warn!(error = %e, "identity lookup failed; not admin");
                return AdminState::NotAdmin;
            }
        };

        match self.fetch_membership(identity.id).await {
            Ok(Some(membership)) => {
                info!(user_id = %identity.id, society_id = %membership.society_id, "admin membership resolved");
                AdminState::Admin(membership)
            }
            Ok(None) => {
                debug!(user_id = %identity.id, "no admin membership");
                AdminState::NotAdmin
            }
            Err(e) => {
                warn!(user_id = %identity.id, error = %e, "membership lookup failed; not admin");
                AdminState::NotAdmin
            }
        }
    }

    async fn fetch_membership(&self, user_id: Uuid) -> Result<Option<AdminMembership>, BackendError> {
        let query = Query::table(tables::ADMINS)
            .eq("user_id", user_id)
            .embed(tables::SOCIETIES, "society_id");
        let row = self.inner.deps.backend.query_one(&query).await?;
        row.map(decode_row::<AdminMembership>)
            .transpose()
            .map_err(|e| BackendError::Decode(e.to_string()))
    }

    // =========================================================================
    // OPERATIONS
    // =========================================================================

    /// Sign out through the backend, clear admin state, and go to the admin
    /// entry point.
    pub async fn sign_out(&self) {
        match self.inner.deps.backend.sign_out().await {
            Ok(()) => self.inner.deps.notifier.success("Signed out successfully"),
            Err(e) => {
                warn!(error = %e, "admin sign-out failed");
                self.inner
                    .deps
                    .notifier
                    .error(&format!("Sign out failed: {e}"));
            }
        }
        self.inner.clock.stamp();
        self.inner.state.send_replace(AdminState::NotAdmin);
        info!("admin signed out");
        self.inner
            .deps
            .router
            .navigate(routes::ADMIN_LOGIN, NavigateOptions::replace());
    }

    /// Finish the "become admin" flow: create the society, link the user to it
    /// as an admin, then move to the admin dashboard and re-resolve.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Backend`] if either insert fails or the inserted
    /// society row cannot be decoded.
    pub async fn complete_onboarding(
        &self,
        user_id: Uuid,
        society: &NewSociety,
        designation: &str,
    ) -> Result<Society, AuthError> {
        let result = self.create_membership(user_id, society, designation).await;
        let created = match result {
            Ok(created) => created,
            Err(e) => {
                warn!(%user_id, error = %e, "society registration failed");
                self.inner
                    .deps
                    .notifier
                    .error(&format!("Could not register society: {e}"));
                return Err(AuthError::Backend(e));
            }
        };
        info!(%user_id, society_id = %created.id, "society registered");
        self.inner
            .deps
            .notifier
            .success("Society registered successfully");
        self.inner
            .deps
            .router
            .navigate(routes::ADMIN_DASHBOARD, NavigateOptions::replace());
        self.refresh().await;
        Ok(created)
    }

    async fn create_membership(
        &self,
        user_id: Uuid,
        society: &NewSociety,
        designation: &str,
    ) -> Result<Society, BackendError> {
        let row = serde_json::to_value(society).map_err(|e| BackendError::Decode(e.to_string()))?;
        let inserted = self
            .inner
            .deps
            .backend
            .insert(tables::SOCIETIES, vec![row])
            .await?;
        let created: Society = inserted
            .into_iter()
            .next()
            .ok_or_else(|| BackendError::Decode("society insert returned no rows".into()))
            .and_then(|row| decode_row(row).map_err(|e| BackendError::Decode(e.to_string())))?;

        self.inner
            .deps
            .backend
            .insert(
                tables::ADMINS,
                vec![json!({ "user_id": user_id, "society_id": created.id, "designation": designation })],
            )
            .await?;
        Ok(created)
    }
}

fn bypass_applies(path: &str, onboarding: Option<&OnboardingToken>) -> bool {
    path == routes::CREATE_SOCIETY && onboarding.is_some_and(OnboardingToken::is_valid)
}

fn route_key(location: &Location) -> (String, Option<OnboardingToken>) {
    (location.path.clone(), location.onboarding().cloned())
}

#[cfg(test)]
#[path = "admin_test.rs"]
mod tests;
