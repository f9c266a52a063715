use super::*;

use serde_json::json;
use uuid::Uuid;

// =============================================================================
// Query
// =============================================================================

#[test]
fn select_clause_without_embeds_is_star() {
    assert_eq!(Query::table(tables::PROFILES).select_clause(), "*");
}

#[test]
fn select_clause_lists_embeds() {
    let query = Query::table(tables::ADMINS)
        .eq("user_id", Uuid::nil())
        .embed(tables::SOCIETIES, "society_id");
    assert_eq!(query.select_clause(), "*,societies(*)");
    assert_eq!(query.first_value(), Some("00000000-0000-0000-0000-000000000000"));
}

#[test]
fn matches_compares_strings_and_numbers() {
    let row = json!({"id": "abc", "floor": 3, "note": null});
    assert!(Query::table("t").eq("id", "abc").matches(&row));
    assert!(Query::table("t").eq("floor", 3).matches(&row));
    assert!(!Query::table("t").eq("id", "abd").matches(&row));
    assert!(!Query::table("t").eq("note", "null").matches(&row));
    assert!(!Query::table("t").eq("missing", "x").matches(&row));
}

#[test]
fn matches_requires_every_filter() {
    let row = json!({"a": "1", "b": "2"});
    assert!(Query::table("t").eq("a", "1").eq("b", "2").matches(&row));
    assert!(!Query::table("t").eq("a", "1").eq("b", "3").matches(&row));
}

// =============================================================================
// AuthEventHub
// =============================================================================

#[tokio::test]
async fn publish_without_listeners_reaches_none() {
    let hub = AuthEventHub::new();
    assert_eq!(hub.publish(AuthEvent::SignedOut, None), 0);
}

#[tokio::test]
async fn every_subscriber_receives_each_change() {
    let hub = AuthEventHub::new();
    let mut a = hub.subscribe();
    let mut b = hub.subscribe();
    assert_eq!(hub.publish(AuthEvent::SignedOut, None), 2);

    let expected = Notification::Change(AuthChange { event: AuthEvent::SignedOut, session: None });
    assert_eq!(a.recv().await, Some(expected.clone()));
    assert_eq!(b.recv().await, Some(expected));
}

#[tokio::test]
async fn lagging_subscriber_gets_resync() {
    let hub = AuthEventHub::new();
    let mut sub = hub.subscribe();
    for _ in 0..=AUTH_EVENT_CAPACITY {
        hub.publish(AuthEvent::TokenRefreshed, None);
    }
    assert_eq!(sub.recv().await, Some(Notification::Resync));
}

#[tokio::test]
async fn closed_hub_ends_subscription() {
    let hub = AuthEventHub::new();
    let mut sub = hub.subscribe();
    drop(hub);
    assert_eq!(sub.recv().await, None);
}

#[test]
fn backend_error_display() {
    let err = BackendError::Status { status: 503, body: "down".into() };
    assert_eq!(err.to_string(), "backend returned 503: down");
}
