use std::time::Duration;

use super::*;
use crate::backend::memory::{Latency, MemoryBackend, Op};
use crate::session::harness::{Harness, settle, wait_for};
use crate::router::{Location, Router, routes};

fn setup() -> (Harness, IdentitySessionController) {
    let h = Harness::at(Location::new(routes::LOGIN));
    let controller = IdentitySessionController::new(h.deps.clone());
    (h, controller)
}

async fn mounted() -> (Harness, IdentitySessionController, Mount, watch::Receiver<SessionState>) {
    let (h, controller) = setup();
    let mount = controller.mount();
    let mut rx = controller.subscribe();
    wait_for(&mut rx, |s| *s == SessionState::Unauthenticated).await;
    (h, controller, mount, rx)
}

// =============================================================================
// sign-in and redirect
// =============================================================================

#[tokio::test(start_paused = true)]
async fn starts_loading_and_resolves_unauthenticated_without_session() {
    let (_h, controller) = setup();
    assert!(controller.state().is_loading());
    let _mount = controller.mount();
    let mut rx = controller.subscribe();
    let state = wait_for(&mut rx, |s| !s.is_loading()).await;
    assert_eq!(state, SessionState::Unauthenticated);
}

#[tokio::test(start_paused = true)]
async fn tenant_sign_in_resolves_role_and_redirects_once() {
    let (h, controller, _mount, mut rx) = mounted().await;
    let tenant = h.backend.add_user("tenant@example.com", "pw", Role::Tenant);

    controller.sign_in("tenant@example.com", "pw").await.unwrap();
    let state = wait_for(&mut rx, |s| s.role().is_some()).await;

    assert_eq!(state.identity().map(|i| i.id), Some(tenant.id));
    assert_eq!(state.role(), Some(Role::Tenant));
    assert_eq!(h.cache.get(), Some(Role::Tenant));
    assert_eq!(h.router.path(), routes::TENANT_DASHBOARD);
    assert_eq!(h.router.navigations_to(routes::TENANT_DASHBOARD), 1);
    assert!(h.router.history().iter().all(|e| e.replace));
}

#[tokio::test(start_paused = true)]
async fn admin_sign_in_redirects_to_admin_dashboard() {
    let (h, controller, _mount, mut rx) = mounted().await;
    h.backend.add_user("admin@example.com", "pw", Role::Admin);

    controller.sign_in("admin@example.com", "pw").await.unwrap();
    wait_for(&mut rx, |s| s.role() == Some(Role::Admin)).await;

    assert_eq!(h.router.path(), routes::ADMIN_DASHBOARD);
    assert_eq!(h.router.navigations_to(routes::TENANT_DASHBOARD), 0);
}

#[tokio::test(start_paused = true)]
async fn repeated_signed_in_notification_does_not_redirect_again() {
    let (h, controller, _mount, mut rx) = mounted().await;
    h.backend.add_user("tenant@example.com", "pw", Role::Tenant);
    let session = controller.sign_in("tenant@example.com", "pw").await.unwrap();
    wait_for(&mut rx, |s| s.role().is_some()).await;

    h.backend.emit(AuthEvent::SignedIn, Some(session));
    settle().await;
    settle().await;

    assert_eq!(h.router.navigations_to(routes::TENANT_DASHBOARD), 1);
    assert_eq!(controller.role(), Some(Role::Tenant));
}

#[tokio::test(start_paused = true)]
async fn redirect_survives_event_superseding_sign_in_resolution() {
    let (h, controller, _mount, mut rx) = mounted().await;
    h.backend.add_user("tenant@example.com", "pw", Role::Tenant);
    h.backend.set_query_latency(tables::PROFILES, None, Latency::Delay(Duration::from_millis(100)));

    let session = controller.sign_in("tenant@example.com", "pw").await.unwrap();
    settle().await;
    h.backend.emit(AuthEvent::TokenRefreshed, Some(session));
    wait_for(&mut rx, |s| s.role().is_some()).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(controller.role(), Some(Role::Tenant));
    assert_eq!(h.router.path(), routes::TENANT_DASHBOARD);
    assert_eq!(h.router.navigations_to(routes::TENANT_DASHBOARD), 1);
}

#[tokio::test(start_paused = true)]
async fn sign_out_drops_owed_redirect() {
    let (h, controller, _mount, mut rx) = mounted().await;
    h.backend.add_user("tenant@example.com", "pw", Role::Tenant);
    h.backend.set_query_latency(tables::PROFILES, None, Latency::Delay(Duration::from_millis(100)));

    controller.sign_in("tenant@example.com", "pw").await.unwrap();
    wait_for(&mut rx, |s| s.identity().is_some()).await;
    settle().await;
    controller.sign_out().await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(controller.state(), SessionState::Unauthenticated);
    assert_eq!(h.router.navigations_to(routes::TENANT_DASHBOARD), 0);
}

#[tokio::test(start_paused = true)]
async fn token_refresh_keeps_profile_without_redirect() {
    let (h, controller, _mount, mut rx) = mounted().await;
    h.backend.add_user("tenant@example.com", "pw", Role::Tenant);
    let session = controller.sign_in("tenant@example.com", "pw").await.unwrap();
    wait_for(&mut rx, |s| s.role().is_some()).await;
    h.router.navigate(routes::LANDING, NavigateOptions::default());

    h.backend.emit(AuthEvent::TokenRefreshed, Some(session));
    settle().await;

    assert_eq!(controller.role(), Some(Role::Tenant));
    assert_eq!(h.router.path(), routes::LANDING);
}

#[tokio::test(start_paused = true)]
async fn existing_session_on_mount_resolves_without_redirect() {
    let (h, controller) = setup();
    let tenant = h.backend.add_user("tenant@example.com", "pw", Role::Tenant);
    h.backend.set_session(Some(MemoryBackend::session_for(&tenant)));

    let _mount = controller.mount();
    let mut rx = controller.subscribe();
    let state = wait_for(&mut rx, |s| s.role().is_some()).await;

    assert_eq!(state.identity().map(|i| i.id), Some(tenant.id));
    assert!(h.router.history().is_empty());
    assert_eq!(h.cache.get(), Some(Role::Tenant));
}

// =============================================================================
// sign-out
// =============================================================================

#[tokio::test(start_paused = true)]
async fn sign_out_clears_state_and_cache_and_rearms_redirect() {
    let (h, controller, _mount, mut rx) = mounted().await;
    h.backend.add_user("tenant@example.com", "pw", Role::Tenant);
    controller.sign_in("tenant@example.com", "pw").await.unwrap();
    wait_for(&mut rx, |s| s.role().is_some()).await;

    controller.sign_out().await;
    assert_eq!(controller.state(), SessionState::Unauthenticated);
    assert_eq!(h.cache.get(), None);
    assert_eq!(h.router.path(), routes::LANDING);
    assert!(h.backend.current_session().is_none());

    settle().await;
    assert_eq!(controller.state(), SessionState::Unauthenticated);

    controller.sign_in("tenant@example.com", "pw").await.unwrap();
    wait_for(&mut rx, |s| s.role().is_some()).await;
    assert_eq!(h.router.navigations_to(routes::TENANT_DASHBOARD), 2);
}

#[tokio::test(start_paused = true)]
async fn sign_out_twice_is_idempotent() {
    let (h, controller, _mount, _rx) = mounted().await;
    controller.sign_out().await;
    controller.sign_out().await;
    settle().await;

    assert_eq!(controller.state(), SessionState::Unauthenticated);
    assert!(h.notifier.errors().is_empty());
    assert_eq!(h.router.navigations_to(routes::LANDING), 2);
}

#[tokio::test(start_paused = true)]
async fn sign_out_clears_locally_even_when_backend_fails() {
    let (h, controller, _mount, mut rx) = mounted().await;
    h.backend.add_user("tenant@example.com", "pw", Role::Tenant);
    controller.sign_in("tenant@example.com", "pw").await.unwrap();
    wait_for(&mut rx, |s| s.role().is_some()).await;

    h.backend.fail(Op::SignOut, BackendError::Transport("connection reset".into()));
    controller.sign_out().await;

    assert_eq!(controller.state(), SessionState::Unauthenticated);
    assert_eq!(h.cache.get(), None);
    assert_eq!(h.notifier.errors().len(), 1);
}

// =============================================================================
// failure and timing
// =============================================================================

#[tokio::test(start_paused = true)]
async fn hanging_session_fetch_degrades_to_unauthenticated_after_timeout() {
    let (h, controller) = setup();
    h.backend.set_latency(Op::GetSession, Latency::Hang);
    let started = tokio::time::Instant::now();

    let _mount = controller.mount();
    let mut rx = controller.subscribe();
    wait_for(&mut rx, |s| !s.is_loading()).await;

    assert_eq!(controller.state(), SessionState::Unauthenticated);
    assert!(started.elapsed() >= Duration::from_secs(5));
}

#[tokio::test(start_paused = true)]
async fn session_fetch_error_degrades_to_unauthenticated() {
    let (h, controller) = setup();
    h.backend.fail(Op::GetSession, BackendError::Status { status: 503, body: "unavailable".into() });

    let _mount = controller.mount();
    let mut rx = controller.subscribe();
    let state = wait_for(&mut rx, |s| !s.is_loading()).await;
    assert_eq!(state, SessionState::Unauthenticated);
}

#[tokio::test(start_paused = true)]
async fn profile_failure_leaves_identity_role_less_without_redirect() {
    let (h, controller, _mount, mut rx) = mounted().await;
    h.backend.add_user("tenant@example.com", "pw", Role::Tenant);
    h.backend.fail_table(tables::PROFILES, BackendError::Transport("timeout".into()));

    controller.sign_in("tenant@example.com", "pw").await.unwrap();
    wait_for(&mut rx, |s| s.identity().is_some()).await;
    settle().await;

    assert!(h.backend.query_count(tables::PROFILES) >= 1);
    assert!(controller.state().identity().is_some());
    assert_eq!(controller.role(), None);
    assert!(h.router.history().is_empty());
}

#[tokio::test(start_paused = true)]
async fn missing_profile_row_leaves_identity_role_less() {
    let (h, controller, _mount, mut rx) = mounted().await;
    h.backend.add_account("bare@example.com", "pw");

    controller.sign_in("bare@example.com", "pw").await.unwrap();
    wait_for(&mut rx, |s| s.identity().is_some()).await;
    settle().await;

    assert_eq!(controller.role(), None);
    assert!(h.router.history().is_empty());
}

#[tokio::test(start_paused = true)]
async fn hanging_profile_fetch_times_out_role_less() {
    let (h, controller, _mount, mut rx) = mounted().await;
    h.backend.add_user("tenant@example.com", "pw", Role::Tenant);
    h.backend.set_query_latency(tables::PROFILES, None, Latency::Hang);

    controller.sign_in("tenant@example.com", "pw").await.unwrap();
    wait_for(&mut rx, |s| s.identity().is_some()).await;
    tokio::time::sleep(Duration::from_secs(6)).await;

    assert!(controller.state().identity().is_some());
    assert_eq!(controller.role(), None);
    assert!(h.router.history().is_empty());
}

#[tokio::test(start_paused = true)]
async fn slower_earlier_resolution_never_overwrites_newer_identity() {
    let (h, controller, _mount, _rx) = mounted().await;
    let slow = h.backend.add_user("slow@example.com", "pw", Role::Admin);
    let fast = h.backend.add_user("fast@example.com", "pw", Role::Tenant);
    h.backend.set_query_latency(
        tables::PROFILES,
        Some(&slow.id.to_string()),
        Latency::Delay(Duration::from_secs(2)),
    );

    h.backend.emit(AuthEvent::SignedIn, Some(MemoryBackend::session_for(&slow)));
    h.backend.emit(AuthEvent::SignedIn, Some(MemoryBackend::session_for(&fast)));
    tokio::time::sleep(Duration::from_secs(3)).await;

    let state = controller.state();
    assert_eq!(state.identity().map(|i| i.id), Some(fast.id));
    assert_eq!(state.role(), Some(Role::Tenant));
    assert_eq!(h.cache.get(), Some(Role::Tenant));
    assert_eq!(h.router.navigations_to(routes::ADMIN_DASHBOARD), 0);
    assert_eq!(h.router.path(), routes::TENANT_DASHBOARD);
}

#[tokio::test(start_paused = true)]
async fn lagged_listener_resyncs_from_current_session() {
    let (h, _controller, _mount, mut rx) = mounted().await;
    let tenant = h.backend.add_user("tenant@example.com", "pw", Role::Tenant);
    let session = MemoryBackend::session_for(&tenant);
    h.backend.set_session(Some(session.clone()));

    // Overflow the listener's buffer before it gets a chance to run.
    for _ in 0..200 {
        h.backend.emit(AuthEvent::UserUpdated, Some(session.clone()));
    }
    let state = wait_for(&mut rx, |s| s.role().is_some()).await;
    assert_eq!(state.identity().map(|i| i.id), Some(tenant.id));
}

#[tokio::test(start_paused = true)]
async fn unmount_discards_in_flight_resolution() {
    let (h, controller, mount, mut rx) = mounted().await;
    let tenant = h.backend.add_user("tenant@example.com", "pw", Role::Tenant);
    h.backend.set_query_latency(tables::PROFILES, None, Latency::Delay(Duration::from_secs(1)));

    h.backend.emit(AuthEvent::SignedIn, Some(MemoryBackend::session_for(&tenant)));
    wait_for(&mut rx, |s| s.identity().is_some()).await;
    mount.unmount();
    tokio::time::sleep(Duration::from_secs(2)).await;

    assert_eq!(controller.role(), None);
    assert_eq!(h.cache.get(), None);
    assert!(h.router.history().is_empty());

    h.backend.emit(AuthEvent::SignedOut, None);
    settle().await;
    assert!(controller.state().identity().is_some());
}

// =============================================================================
// operations
// =============================================================================

#[tokio::test(start_paused = true)]
async fn wrong_password_returns_error_and_toasts() {
    let (h, controller, _mount, _rx) = mounted().await;
    h.backend.add_user("tenant@example.com", "pw", Role::Tenant);

    let err = controller.sign_in("tenant@example.com", "nope").await.unwrap_err();
    assert_eq!(err, AuthError::InvalidCredentials("Invalid login credentials".into()));
    assert_eq!(h.notifier.errors(), vec!["Sign in failed: Invalid login credentials".to_string()]);
    assert_eq!(controller.state(), SessionState::Unauthenticated);
}

#[tokio::test(start_paused = true)]
async fn sign_up_creates_profile_without_signing_in() {
    let (h, controller, _mount, _rx) = mounted().await;
    let meta = SignUpProfile {
        role: Role::Tenant,
        first_name: "Asha".into(),
        last_name: "Rao".into(),
        phone: Some("555-0100".into()),
    };

    let id = controller.sign_up("new@example.com", "pw", &meta).await.unwrap();
    settle().await;

    assert!(h.backend.current_session().is_none());
    assert_eq!(controller.state(), SessionState::Unauthenticated);
    let rows = h.backend.rows(tables::PROFILES);
    let row = rows
        .iter()
        .find(|r| r["id"] == serde_json::json!(id))
        .expect("profile row");
    assert_eq!(row["first_name"], "Asha");
    assert_eq!(h.notifier.successes(), vec!["Account created".to_string()]);

    let err = controller.sign_up("new@example.com", "pw", &meta).await.unwrap_err();
    assert!(matches!(err, AuthError::InvalidCredentials(_)));
}

#[tokio::test(start_paused = true)]
async fn update_profile_requires_identity() {
    let (_h, controller) = setup();
    let update = ProfileUpdate { first_name: Some("Asha".into()), ..ProfileUpdate::default() };
    assert_eq!(controller.update_profile(update).await, Err(AuthError::NotSignedIn));
}

#[tokio::test(start_paused = true)]
async fn update_profile_persists_and_refreshes_role_cache() {
    let (h, controller, _mount, mut rx) = mounted().await;
    let tenant = h.backend.add_user("tenant@example.com", "pw", Role::Tenant);
    controller.sign_in("tenant@example.com", "pw").await.unwrap();
    wait_for(&mut rx, |s| s.role().is_some()).await;

    let update = ProfileUpdate {
        role: Some(Role::Admin),
        first_name: Some("Asha".into()),
        ..ProfileUpdate::default()
    };
    controller.update_profile(update).await.unwrap();

    assert_eq!(controller.role(), Some(Role::Admin));
    assert_eq!(h.cache.get(), Some(Role::Admin));
    let profile = controller.state().profile().cloned().unwrap();
    assert_eq!(profile.first_name.as_deref(), Some("Asha"));
    let row = h
        .backend
        .rows(tables::PROFILES)
        .into_iter()
        .find(|r| r["id"] == serde_json::json!(tenant.id))
        .unwrap();
    assert_eq!(row["role"], "admin");
}
