//! Identity session controller: the single source of truth for who is signed
//! in and what role they hold.
//!
//! STATE MACHINE
//! =============
//! `Loading -> {Unauthenticated | Authenticated}`. Every auth-change
//! notification re-enters resolution: the notified identity is applied
//! immediately, then its profile is fetched. On `SIGNED_IN`, once the role is
//! known, a one-time redirect sends the user to their dashboard.
//!
//! DEFERRED PROFILE FETCH
//! ======================
//! The hosted client must not be called back into from inside its own
//! notification callback. The listener therefore never awaits a backend call:
//! it stamps the resolution, applies the identity, and enqueues the profile
//! fetch as a separate task that runs on a later scheduler tick.
//!
//! ERROR HANDLING
//! ==============
//! Profile fetch failures and timeouts leave the identity authenticated but
//! role-less (no redirect). Initial session failures and timeouts degrade to
//! `Unauthenticated`. Credential failures come back as `Err` and a toast;
//! nothing here panics into the render path.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{AuthError, Mount, MountFlag, ResolutionClock, SessionDeps};
use crate::backend::{BackendError, Notification, Query, tables};
use crate::model::{
    AuthChange, AuthEvent, Identity, Profile, ProfileUpdate, Role, Session, SessionState, SignUpProfile, decode_row,
};
use crate::router::{NavigateOptions, routes};

#[derive(Clone)]
pub struct IdentitySessionController {
    inner: Arc<Inner>,
}

struct Inner {
    deps: SessionDeps,
    state: watch::Sender<SessionState>,
    clock: ResolutionClock,
    mounted: MountFlag,
    /// Identity the post-sign-in redirect has already fired for.
    redirected_for: Mutex<Option<Uuid>>,
    /// Identity whose `SIGNED_IN` still owes a redirect. Consumed by whichever
    /// resolution first applies a role for it.
    pending_redirect: Mutex<Option<Uuid>>,
}

impl IdentitySessionController {
    #[must_use]
    pub fn new(deps: SessionDeps) -> Self {
        let (state, _) = watch::channel(SessionState::Loading);
        Self {
            inner: Arc::new(Inner {
                deps,
                state,
                clock: ResolutionClock::default(),
                mounted: MountFlag::default(),
                redirected_for: Mutex::new(None),
                pending_redirect: Mutex::new(None),
            }),
        }
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.inner.state.borrow().clone()
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    #[must_use]
    pub fn role(&self) -> Option<Role> {
        self.inner.state.borrow().role()
    }

    // =========================================================================
    // LIFECYCLE
    // =========================================================================

    /// Attach to the auth stream and start the one-shot session fetch.
    ///
    /// The subscription is taken before the fetch starts so no notification
    /// issued in between is missed; whichever finishes last with the newest
    /// stamp wins.
    #[must_use]
    pub fn mount(&self) -> Mount {
        self.inner.mounted.set(true);
        let mut subscription = self.inner.deps.backend.on_session_change();
        let listener = {
            let this = self.clone();
            tokio::spawn(async move {
                while let Some(notification) = subscription.recv().await {
                    match notification {
                        Notification::Change(change) => this.on_auth_change(change),
                        Notification::Resync => {
                            this.spawn_session_fetch();
                        }
                    }
                }
                debug!("auth stream closed; identity listener exiting");
            })
        };
        let initial = self.spawn_session_fetch();
        Mount::new(self.inner.mounted.clone(), vec![listener, initial])
    }

    fn spawn_session_fetch(&self) -> JoinHandle<()> {
        let token = self.inner.clock.stamp();
        let this = self.clone();
        tokio::spawn(async move { this.resolve_current_session(token).await })
    }

    /// Runs inside the notification callback: no awaits on the backend here.
    fn on_auth_change(&self, change: AuthChange) {
        let token = self.inner.clock.stamp();
        info!(event = %change.event, token, "identity controller observed auth change");

        let Some(session) = change.session else {
            self.clear_local(token);
            return;
        };
        let identity = session.identity;
        if !self.apply_identity(token, identity.clone()) {
            return;
        }

        if change.event == AuthEvent::SignedIn {
            *lock(&self.inner.pending_redirect) = Some(identity.id);
        }
        let this = self.clone();
        tokio::spawn(async move { this.resolve_profile(token, identity).await });
    }

    // =========================================================================
    // RESOLUTION
    // =========================================================================

    fn is_live(&self, token: u64) -> bool {
        self.inner.mounted.is_mounted() && self.inner.clock.is_current(token)
    }

    /// Publish `next` if `token` is still authoritative. Returns whether it was.
    fn apply(&self, token: u64, next: SessionState) -> bool {
        if !self.is_live(token) {
            debug!(token, "discarding stale identity resolution");
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

    /// Apply an identity, keeping the cached profile when the identity is unchanged.
    fn apply_identity(&self, token: u64, identity: Identity) -> bool {
        let profile = match &*self.inner.state.borrow() {
            SessionState::Authenticated { identity: current, profile } if current.id == identity.id => profile.clone(),
            _ => None,
        };
        self.apply(token, SessionState::Authenticated { identity, profile })
    }

    fn clear_local(&self, token: u64) {
        if self.apply(token, SessionState::Unauthenticated) {
            self.inner.deps.role_cache.clear();
            self.reset_redirect();
        }
    }

    async fn resolve_current_session(&self, token: u64) {
        let timeout = self.inner.deps.timeouts.session_resolve;
        let session = match tokio::time::timeout(timeout, self.inner.deps.backend.get_current_session()).await {
            Ok(Ok(session)) => session,
            Ok(Err(e)) => {
                warn!(error = %e, "session fetch failed; treating as signed out");
                None
            }
            Err(_) => {
                info!(?timeout, "session fetch timed out; treating as signed out");
                None
            }
        };

        match session {
            None => self.clear_local(token),
            Some(session) => {
                let identity = session.identity;
                if self.apply_identity(token, identity.clone()) {
                    self.resolve_profile(token, identity).await;
                }
            }
        }
    }

    async fn resolve_profile(&self, token: u64, identity: Identity) {
        let profile = self.fetch_profile_bounded(identity.id).await;
        let role = profile.as_ref().map(|p| p.role);
        if !self.apply(token, SessionState::Authenticated { identity: identity.clone(), profile }) {
            return;
        }
        let Some(role) = role else {
            debug!(user_id = %identity.id, "role unknown; no post-sign-in redirect yet");
            return;
        };
        self.inner.deps.role_cache.set(role);
        if self.take_pending_redirect(identity.id) {
            self.redirect_once(identity.id, role);
        }
    }

    fn take_pending_redirect(&self, user_id: Uuid) -> bool {
        let mut pending = lock(&self.inner.pending_redirect);
        if *pending == Some(user_id) {
            *pending = None;
            return true;
        }
        false
    }

    async fn fetch_profile_bounded(&self, user_id: Uuid) -> Option<Profile> {
        let timeout = self.inner.deps.timeouts.session_resolve;
        match tokio::time::timeout(timeout, self.fetch_profile(user_id)).await {
            Ok(Ok(Some(profile))) => Some(profile),
            Ok(Ok(None)) => {
                warn!(%user_id, "no profile row; role unknown");
                None
            }
            Ok(Err(e)) => {
                warn!(%user_id, error = %e, "profile fetch failed; role unknown");
                None
            }
            Err(_) => {
                info!(%user_id, ?timeout, "profile fetch timed out; role unknown");
                None
            }
        }
    }

    async fn fetch_profile(&self, user_id: Uuid) -> Result<Option<Profile>, BackendError> {
        let row = self
            .inner
            .deps
            .backend
            .query_one(&Query::table(tables::PROFILES).eq("id", user_id))
            .await?;
        row.map(decode_row::<Profile>)
            .transpose()
            .map_err(|e| BackendError::Decode(e.to_string()))
    }

    fn redirect_once(&self, user_id: Uuid, role: Role) {
        {
            let mut redirected = lock(&self.inner.redirected_for);
            if *redirected == Some(user_id) {
                debug!(%user_id, "post-sign-in redirect already performed");
                return;
            }
            *redirected = Some(user_id);
        }
        info!(%user_id, role = role.as_str(), "post-sign-in redirect");
        self.inner
            .deps
            .router
            .navigate(role.dashboard_path(), NavigateOptions::replace());
    }

    fn reset_redirect(&self) {
        *lock(&self.inner.redirected_for) = None;
        *lock(&self.inner.pending_redirect) = None;
    }

    // =========================================================================
    // OPERATIONS
    // =========================================================================

    /// Exchange credentials for a session.
    ///
    /// The identity is applied right away; the backend's `SIGNED_IN`
    /// notification independently drives profile resolution and the redirect.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvalidCredentials`] for rejected credentials and
    /// [`AuthError::Backend`] for service failures. A toast is emitted either way.
    pub async fn sign_in(&self, email: &str, password: &str) -> Result<Session, AuthError> {
        match self
            .inner
            .deps
            .backend
            .sign_in_with_password(email, password)
            .await
        {
            Ok(session) => {
                info!(user_id = %session.identity.id, "signed in");
                let identity = session.identity.clone();
                self.inner.state.send_if_modified(|current| {
                    if current.identity().is_some_and(|c| c.id == identity.id) {
                        return false;
                    }
                    *current = SessionState::Authenticated { identity, profile: None };
                    true
                });
                Ok(session)
            }
            Err(e) => {
                let err = AuthError::from_backend(e);
                warn!(error = %err, "sign-in failed");
                self.inner
                    .deps
                    .notifier
                    .error(&format!("Sign in failed: {err}"));
                Err(err)
            }
        }
    }

    /// Register a new identity with profile metadata. Does not sign in.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvalidCredentials`] (e.g. email already registered)
    /// or [`AuthError::Backend`].
    pub async fn sign_up(&self, email: &str, password: &str, profile: &SignUpProfile) -> Result<Uuid, AuthError> {
        match self.inner.deps.backend.sign_up(email, password, profile).await {
            Ok(identity) => {
                info!(user_id = %identity.id, role = profile.role.as_str(), "signed up");
                self.inner.deps.notifier.success("Account created");
                Ok(identity.id)
            }
            Err(e) => {
                let err = AuthError::from_backend(e);
                warn!(error = %err, "sign-up failed");
                self.inner
                    .deps
                    .notifier
                    .error(&format!("Sign up failed: {err}"));
                Err(err)
            }
        }
    }

    /// Revoke the session, clear all local state, and go to the landing page.
    /// Safe to call when already signed out.
    pub async fn sign_out(&self) {
        if let Err(e) = self.inner.deps.backend.sign_out().await {
            warn!(error = %e, "backend sign-out failed; clearing local session anyway");
            self.inner
                .deps
                .notifier
                .error(&format!("Sign out failed: {e}"));
        }
        // Invalidate any in-flight resolution before clearing.
        self.inner.clock.stamp();
        self.inner
            .state
            .send_replace(SessionState::Unauthenticated);
        self.inner.deps.role_cache.clear();
        self.reset_redirect();
        info!("signed out");
        self.inner
            .deps
            .router
            .navigate(routes::LANDING, NavigateOptions::replace());
    }

    /// Persist a partial profile update for the signed-in identity.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::NotSignedIn`] when no identity is resolved, or the
    /// backend failure.
    pub async fn update_profile(&self, update: ProfileUpdate) -> Result<(), AuthError> {
        let Some(identity) = self.state().identity().cloned() else {
            return Err(AuthError::NotSignedIn);
        };
        if update.is_empty() {
            return Ok(());
        }
        let fields = serde_json::to_value(&update).map_err(|e| AuthError::Backend(BackendError::Decode(e.to_string())))?;

        if let Err(e) = self
            .inner
            .deps
            .backend
            .update(&Query::table(tables::PROFILES).eq("id", identity.id), fields)
            .await
        {
            let err = AuthError::from_backend(e);
            warn!(user_id = %identity.id, error = %err, "profile update failed");
            self.inner
                .deps
                .notifier
                .error(&format!("Profile update failed: {err}"));
            return Err(err);
        }

        self.inner.state.send_if_modified(|current| match current {
            SessionState::Authenticated { identity: current_identity, profile: Some(profile) }
                if current_identity.id == identity.id =>
            {
                update.apply_to(profile);
                true
            }
            _ => false,
        });
        if let Some(role) = update.role {
            self.inner.deps.role_cache.set(role);
        }
        info!(user_id = %identity.id, "profile updated");
        self.inner.deps.notifier.success("Profile updated");
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
#[path = "identity_test.rs"]
mod tests;
