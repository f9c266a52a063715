//! Hosted identity & data service: the only collaborator the session core
//! talks to.
//!
//! ARCHITECTURE
//! ============
//! [`Backend`] is the narrow surface the controllers consume: one-shot session
//! reads, the auth-change stream, credential calls, and single-row table access.
//! [`rest::RestBackend`] speaks to the hosted service over HTTP;
//! [`memory::MemoryBackend`] is an in-process stand-in with injectable latency
//! and failures.
//!
//! The auth-change stream is a process-wide broadcast ([`AuthEventHub`]). Each
//! controller attaches its own receiver and no ordering between receivers is
//! assumed.

pub mod memory;
pub mod rest;

use serde_json::Value;
use tokio::sync::broadcast;

use crate::model::{AuthChange, AuthEvent, Identity, Session, SignUpProfile};

pub const AUTH_EVENT_CAPACITY: usize = 64;

/// Table names in the hosted schema.
pub mod tables {
    pub const PROFILES: &str = "profiles";
    pub const ADMINS: &str = "admins";
    pub const SOCIETIES: &str = "societies";
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("backend returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("invalid credentials: {0}")]
    Credentials(String),
    #[error("unexpected response: {0}")]
    Decode(String),
    #[error("backend not configured: {0}")]
    Config(String),
}

// =============================================================================
// QUERY
// =============================================================================

/// Related table embedded into a row through a foreign-key column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Embed {
    pub table: String,
    pub foreign_key: String,
}

/// Single-table equality lookup, optionally embedding related rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    pub table: String,
    pub filters: Vec<(String, String)>,
    pub embeds: Vec<Embed>,
}

impl Query {
    #[must_use]
    pub fn table(table: &str) -> Self {
        Self { table: table.to_owned(), filters: Vec::new(), embeds: Vec::new() }
    }

    #[must_use]
    pub fn eq(mut self, column: &str, value: impl ToString) -> Self {
        self.filters.push((column.to_owned(), value.to_string()));
        self
    }

    /// Embed `table` by matching its `id` against this row's `foreign_key`.
    #[must_use]
    pub fn embed(mut self, table: &str, foreign_key: &str) -> Self {
        self.embeds
            .push(Embed { table: table.to_owned(), foreign_key: foreign_key.to_owned() });
        self
    }

    /// `select=` clause for the row REST API, e.g. `*,societies(*)`.
    #[must_use]
    pub fn select_clause(&self) -> String {
        let mut select = String::from("*");
        for embed in &self.embeds {
            select.push(',');
            select.push_str(&embed.table);
            select.push_str("(*)");
        }
        select
    }

    /// Value of the first filter, used to key per-row latency and logging.
    #[must_use]
    pub fn first_value(&self) -> Option<&str> {
        self.filters.first().map(|(_, v)| v.as_str())
    }

    /// Whether a row satisfies every equality filter.
    #[must_use]
    pub fn matches(&self, row: &Value) -> bool {
        self.filters
            .iter()
            .all(|(column, expected)| row.get(column).is_some_and(|v| value_eq(v, expected)))
    }
}

fn value_eq(value: &Value, expected: &str) -> bool {
    match value {
        Value::String(s) => s == expected,
        Value::Null => false,
        other => other.to_string() == expected,
    }
}

// =============================================================================
// AUTH STREAM
// =============================================================================

/// Process-wide auth-change stream.
#[derive(Clone)]
pub struct AuthEventHub {
    tx: broadcast::Sender<AuthChange>,
}

impl AuthEventHub {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(AUTH_EVENT_CAPACITY);
        Self { tx }
    }

    /// Publish to every attached listener. Returns the number of listeners reached.
    pub fn publish(&self, event: AuthEvent, session: Option<Session>) -> usize {
        tracing::debug!(%event, has_session = session.is_some(), "auth change published");
        self.tx.send(AuthChange { event, session }).unwrap_or(0)
    }

    #[must_use]
    pub fn subscribe(&self) -> AuthSubscription {
        AuthSubscription { rx: self.tx.subscribe() }
    }
}

impl Default for AuthEventHub {
    fn default() -> Self {
        Self::new()
    }
}

/// Item delivered to an auth-stream listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    Change(AuthChange),
    /// The listener fell behind and missed notifications; re-read the current session.
    Resync,
}

/// One listener's handle on the auth-change stream. Dropping it unsubscribes.
pub struct AuthSubscription {
    rx: broadcast::Receiver<AuthChange>,
}

impl AuthSubscription {
    /// Wait for the next notification. `None` once the stream is closed.
    pub async fn recv(&mut self) -> Option<Notification> {
        match self.rx.recv().await {
            Ok(change) => Some(Notification::Change(change)),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "auth subscription lagged; resyncing");
                Some(Notification::Resync)
            }
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }
}

// =============================================================================
// BACKEND TRAIT
// =============================================================================

#[async_trait::async_trait]
pub trait Backend: Send + Sync {
    /// One-shot read of the current session.
    async fn get_current_session(&self) -> Result<Option<Session>, BackendError>;

    /// Attach a listener to the auth-change stream.
    fn on_session_change(&self) -> AuthSubscription;

    async fn sign_in_with_password(&self, email: &str, password: &str) -> Result<Session, BackendError>;

    /// Register a new identity. Does not establish a session.
    async fn sign_up(&self, email: &str, password: &str, metadata: &SignUpProfile) -> Result<Identity, BackendError>;

    async fn sign_out(&self) -> Result<(), BackendError>;

    async fn query_one(&self, query: &Query) -> Result<Option<Value>, BackendError>;

    async fn update(&self, query: &Query, fields: Value) -> Result<(), BackendError>;

    async fn insert(&self, table: &str, rows: Vec<Value>) -> Result<Vec<Value>, BackendError>;
}

#[cfg(test)]
#[path = "mod_test.rs"]
mod tests;
