use super::*;

use crate::backend::Notification;

fn tenant_metadata() -> SignUpProfile {
    SignUpProfile { role: Role::Tenant, first_name: "Ravi".into(), last_name: "Kumar".into(), phone: None }
}

// =============================================================================
// credentials
// =============================================================================

#[tokio::test]
async fn sign_in_sets_session_and_publishes_signed_in() {
    let backend = MemoryBackend::new();
    let identity = backend.add_user("tenant@example.com", "pw", Role::Tenant);
    let mut sub = backend.on_session_change();

    let session = backend
        .sign_in_with_password("Tenant@Example.com", "pw")
        .await
        .unwrap();
    assert_eq!(session.identity, identity);
    assert_eq!(backend.current_session(), Some(session.clone()));

    let Some(Notification::Change(change)) = sub.recv().await else {
        panic!("expected a change notification");
    };
    assert_eq!(change.event, AuthEvent::SignedIn);
    assert_eq!(change.session, Some(session));
}

#[tokio::test]
async fn sign_in_wrong_password_is_credential_error() {
    let backend = MemoryBackend::new();
    backend.add_user("tenant@example.com", "pw", Role::Tenant);
    let err = backend
        .sign_in_with_password("tenant@example.com", "nope")
        .await
        .unwrap_err();
    assert!(matches!(err, BackendError::Credentials(_)));
    assert!(backend.current_session().is_none());
}

#[tokio::test]
async fn sign_up_creates_profile_row_without_session() {
    let backend = MemoryBackend::new();
    let identity = backend
        .sign_up("new@example.com", "pw", &tenant_metadata())
        .await
        .unwrap();
    assert!(backend.current_session().is_none());

    let profile = backend
        .query_one(&Query::table(tables::PROFILES).eq("id", identity.id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(profile["role"], "tenant");
    assert_eq!(profile["first_name"], "Ravi");
}

#[tokio::test]
async fn sign_up_duplicate_email_errors() {
    let backend = MemoryBackend::new();
    backend.add_account("dup@example.com", "pw");
    let err = backend
        .sign_up("DUP@example.com", "pw", &tenant_metadata())
        .await
        .unwrap_err();
    assert_eq!(err, BackendError::Credentials("User already registered".into()));
}

#[tokio::test]
async fn sign_out_when_signed_out_still_succeeds() {
    let backend = MemoryBackend::new();
    backend.sign_out().await.unwrap();
    assert!(backend.current_session().is_none());
}

// =============================================================================
// rows
// =============================================================================

#[tokio::test]
async fn query_one_embeds_related_row() {
    let backend = MemoryBackend::new();
    let user_id = Uuid::new_v4();
    let society_id = backend.add_admin_membership(user_id, "Lake View", "treasurer");

    let row = backend
        .query_one(
            &Query::table(tables::ADMINS)
                .eq("user_id", user_id)
                .embed(tables::SOCIETIES, "society_id"),
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row["societies"]["name"], "Lake View");
    assert_eq!(row["societies"]["id"], society_id.to_string());
    assert_eq!(backend.query_count(tables::ADMINS), 1);
}

#[tokio::test]
async fn query_one_missing_row_is_none() {
    let backend = MemoryBackend::new();
    let row = backend
        .query_one(&Query::table(tables::ADMINS).eq("user_id", Uuid::new_v4()))
        .await
        .unwrap();
    assert!(row.is_none());
}

#[tokio::test]
async fn table_failure_applies_only_to_that_table() {
    let backend = MemoryBackend::new();
    backend.fail_table(tables::ADMINS, BackendError::Transport("reset".into()));
    assert!(
        backend
            .query_one(&Query::table(tables::ADMINS))
            .await
            .is_err()
    );
    assert!(
        backend
            .query_one(&Query::table(tables::PROFILES))
            .await
            .is_ok()
    );
    backend.clear_failures();
    assert!(
        backend
            .query_one(&Query::table(tables::ADMINS))
            .await
            .is_ok()
    );
}

#[tokio::test]
async fn update_merges_fields_into_matching_rows() {
    let backend = MemoryBackend::new();
    let identity = backend.add_user("a@example.com", "pw", Role::Tenant);
    backend
        .update(&Query::table(tables::PROFILES).eq("id", identity.id), json!({"phone": "555"}))
        .await
        .unwrap();
    let rows = backend.rows(tables::PROFILES);
    assert_eq!(rows[0]["phone"], "555");
    assert_eq!(rows[0]["role"], "tenant");
}

#[tokio::test]
async fn insert_assigns_ids() {
    let backend = MemoryBackend::new();
    let inserted = backend
        .insert(tables::SOCIETIES, vec![json!({"name": "Hill Crest"})])
        .await
        .unwrap();
    assert!(inserted[0]["id"].is_string());
    assert_eq!(backend.rows(tables::SOCIETIES).len(), 1);
}

// =============================================================================
// latency
// =============================================================================

#[tokio::test(start_paused = true)]
async fn keyed_query_latency_only_delays_that_key() {
    let backend = MemoryBackend::new();
    backend.set_query_latency(tables::PROFILES, Some("slow"), Latency::Delay(Duration::from_secs(10)));

    let started = tokio::time::Instant::now();
    backend
        .query_one(&Query::table(tables::PROFILES).eq("id", "fast"))
        .await
        .unwrap();
    assert!(started.elapsed() < Duration::from_secs(1));

    backend
        .query_one(&Query::table(tables::PROFILES).eq("id", "slow"))
        .await
        .unwrap();
    assert!(started.elapsed() >= Duration::from_secs(10));
}

#[tokio::test(start_paused = true)]
async fn hang_never_completes() {
    let backend = MemoryBackend::new();
    backend.set_latency(Op::GetSession, Latency::Hang);
    let res = tokio::time::timeout(Duration::from_secs(60), backend.get_current_session()).await;
    assert!(res.is_err());
}
