//! In-process backend with injectable latency and failures.
//!
//! DESIGN
//! ======
//! Mirrors the hosted service closely enough to drive the controllers end to
//! end: password accounts, a current session, row tables with single-level
//! embeds, and a sign-up trigger that creates the profile row from metadata.
//! Every query is recorded so callers can assert which lookups were issued.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::{Value, json};
use uuid::Uuid;

use super::{AuthEventHub, AuthSubscription, Backend, BackendError, Query, tables};
use crate::model::{AuthEvent, Identity, Role, Session, SignUpProfile};

/// Backend operation, used to key injected latency and failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    GetSession,
    SignIn,
    SignUp,
    SignOut,
    Query,
    Update,
    Insert,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Latency {
    Delay(Duration),
    /// Never completes.
    Hang,
}

impl Latency {
    async fn wait(self) {
        match self {
            Self::Delay(d) => tokio::time::sleep(d).await,
            Self::Hang => std::future::pending::<()>().await,
        }
    }
}

struct Account {
    password: String,
    identity: Identity,
}

#[derive(Default)]
struct MemoryInner {
    accounts: HashMap<String, Account>,
    session: Option<Session>,
    tables: HashMap<String, Vec<Value>>,
    op_latency: HashMap<Op, Latency>,
    /// Keyed by (table, first filter value); `None` applies to the whole table.
    query_latency: HashMap<(String, Option<String>), Latency>,
    op_failures: HashMap<Op, BackendError>,
    table_failures: HashMap<String, BackendError>,
    queries: Vec<Query>,
}

pub struct MemoryBackend {
    hub: AuthEventHub,
    inner: Mutex<MemoryInner>,
}

impl MemoryBackend {
    #[must_use]
    pub fn new() -> Self {
        Self { hub: AuthEventHub::new(), inner: Mutex::new(MemoryInner::default()) }
    }

    fn lock(&self) -> MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn hub(&self) -> &AuthEventHub {
        &self.hub
    }

    // -------------------------------------------------------------------------
    // seeding
    // -------------------------------------------------------------------------

    /// Register a password account without creating a profile row.
    pub fn add_account(&self, email: &str, password: &str) -> Identity {
        let identity = Identity { id: Uuid::new_v4(), email: Some(email.to_owned()) };
        self.lock().accounts.insert(
            email.to_ascii_lowercase(),
            Account { password: password.to_owned(), identity: identity.clone() },
        );
        identity
    }

    /// Register an account and its profile row.
    pub fn add_user(&self, email: &str, password: &str, role: Role) -> Identity {
        let identity = self.add_account(email, password);
        self.insert_row(
            tables::PROFILES,
            json!({"id": identity.id, "role": role.as_str(), "email": email}),
        );
        identity
    }

    /// Create a society and an admin membership linking `user_id` to it.
    /// Returns the society id.
    pub fn add_admin_membership(&self, user_id: Uuid, society_name: &str, designation: &str) -> Uuid {
        let society_id = Uuid::new_v4();
        self.insert_row(tables::SOCIETIES, json!({"id": society_id, "name": society_name}));
        self.insert_row(
            tables::ADMINS,
            json!({
                "id": Uuid::new_v4(),
                "user_id": user_id,
                "society_id": society_id,
                "designation": designation,
            }),
        );
        society_id
    }

    pub fn insert_row(&self, table: &str, row: Value) {
        self.lock().tables.entry(table.to_owned()).or_default().push(row);
    }

    #[must_use]
    pub fn rows(&self, table: &str) -> Vec<Value> {
        self.lock().tables.get(table).cloned().unwrap_or_default()
    }

    /// Replace the current session without publishing a notification.
    pub fn set_session(&self, session: Option<Session>) {
        self.lock().session = session;
    }

    /// Mint a session for an identity, as a sign-in would.
    #[must_use]
    pub fn session_for(identity: &Identity) -> Session {
        Session {
            access_token: format!("mem-{}", Uuid::new_v4()),
            refresh_token: Some(Uuid::new_v4().to_string()),
            expires_at: None,
            identity: identity.clone(),
        }
    }

    /// Publish a notification on the auth stream as the hosted service would.
    pub fn emit(&self, event: AuthEvent, session: Option<Session>) -> usize {
        self.hub.publish(event, session)
    }

    // -------------------------------------------------------------------------
    // fault injection
    // -------------------------------------------------------------------------

    pub fn set_latency(&self, op: Op, latency: Latency) {
        self.lock().op_latency.insert(op, latency);
    }

    /// Latency for queries against `table`; with `key`, only when the first
    /// filter value equals it.
    pub fn set_query_latency(&self, table: &str, key: Option<&str>, latency: Latency) {
        self.lock()
            .query_latency
            .insert((table.to_owned(), key.map(str::to_owned)), latency);
    }

    pub fn fail(&self, op: Op, err: BackendError) {
        self.lock().op_failures.insert(op, err);
    }

    pub fn fail_table(&self, table: &str, err: BackendError) {
        self.lock().table_failures.insert(table.to_owned(), err);
    }

    pub fn clear_failures(&self) {
        let mut inner = self.lock();
        inner.op_failures.clear();
        inner.table_failures.clear();
    }

    // -------------------------------------------------------------------------
    // inspection
    // -------------------------------------------------------------------------

    #[must_use]
    pub fn queries(&self) -> Vec<Query> {
        self.lock().queries.clone()
    }

    #[must_use]
    pub fn query_count(&self, table: &str) -> usize {
        self.lock().queries.iter().filter(|q| q.table == table).count()
    }

    #[must_use]
    pub fn current_session(&self) -> Option<Session> {
        self.lock().session.clone()
    }

    /// Latency and failure configured for an operation, read under one lock.
    fn plan(&self, op: Op) -> (Option<Latency>, Option<BackendError>) {
        let inner = self.lock();
        (inner.op_latency.get(&op).copied(), inner.op_failures.get(&op).cloned())
    }

    async fn gate(&self, op: Op) -> Result<(), BackendError> {
        let (latency, failure) = self.plan(op);
        if let Some(latency) = latency {
            latency.wait().await;
        }
        failure.map_or(Ok(()), Err)
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Backend for MemoryBackend {
    async fn get_current_session(&self) -> Result<Option<Session>, BackendError> {
        self.gate(Op::GetSession).await?;
        Ok(self.lock().session.clone())
    }

    fn on_session_change(&self) -> AuthSubscription {
        self.hub.subscribe()
    }

    async fn sign_in_with_password(&self, email: &str, password: &str) -> Result<Session, BackendError> {
        self.gate(Op::SignIn).await?;
        let session = {
            let mut inner = self.lock();
            let identity = inner
                .accounts
                .get(&email.trim().to_ascii_lowercase())
                .filter(|account| account.password == password)
                .map(|account| account.identity.clone())
                .ok_or_else(|| BackendError::Credentials("Invalid login credentials".into()))?;
            let session = Self::session_for(&identity);
            inner.session = Some(session.clone());
            session
        };
        self.hub.publish(AuthEvent::SignedIn, Some(session.clone()));
        Ok(session)
    }

    async fn sign_up(&self, email: &str, password: &str, metadata: &SignUpProfile) -> Result<Identity, BackendError> {
        self.gate(Op::SignUp).await?;
        let key = email.trim().to_ascii_lowercase();
        if self.lock().accounts.contains_key(&key) {
            return Err(BackendError::Credentials("User already registered".into()));
        }
        let identity = self.add_account(&key, password);
        // Service-side trigger: profile row from sign-up metadata.
        self.insert_row(
            tables::PROFILES,
            json!({
                "id": identity.id,
                "role": metadata.role.as_str(),
                "first_name": metadata.first_name,
                "last_name": metadata.last_name,
                "phone": metadata.phone,
                "email": key,
            }),
        );
        Ok(identity)
    }

    async fn sign_out(&self) -> Result<(), BackendError> {
        self.gate(Op::SignOut).await?;
        self.lock().session = None;
        self.hub.publish(AuthEvent::SignedOut, None);
        Ok(())
    }

    async fn query_one(&self, query: &Query) -> Result<Option<Value>, BackendError> {
        let (latency, failure) = {
            let mut inner = self.lock();
            inner.queries.push(query.clone());
            let keyed = query
                .first_value()
                .and_then(|key| inner.query_latency.get(&(query.table.clone(), Some(key.to_owned()))));
            let latency = keyed
                .or_else(|| inner.query_latency.get(&(query.table.clone(), None)))
                .or_else(|| inner.op_latency.get(&Op::Query))
                .copied();
            let failure = inner
                .table_failures
                .get(&query.table)
                .or_else(|| inner.op_failures.get(&Op::Query))
                .cloned();
            (latency, failure)
        };
        if let Some(latency) = latency {
            latency.wait().await;
        }
        if let Some(err) = failure {
            return Err(err);
        }

        let inner = self.lock();
        let Some(mut row) = inner
            .tables
            .get(&query.table)
            .and_then(|rows| rows.iter().find(|row| query.matches(row)))
            .cloned()
        else {
            return Ok(None);
        };
        for embed in &query.embeds {
            let related = row
                .get(&embed.foreign_key)
                .and_then(|fk| {
                    inner
                        .tables
                        .get(&embed.table)
                        .and_then(|rows| rows.iter().find(|r| r.get("id") == Some(fk)))
                })
                .cloned()
                .unwrap_or(Value::Null);
            if let Some(obj) = row.as_object_mut() {
                obj.insert(embed.table.clone(), related);
            }
        }
        Ok(Some(row))
    }

    async fn update(&self, query: &Query, fields: Value) -> Result<(), BackendError> {
        self.gate(Op::Update).await?;
        let Value::Object(fields) = fields else {
            return Err(BackendError::Decode("update fields must be an object".into()));
        };
        let mut inner = self.lock();
        if let Some(rows) = inner.tables.get_mut(&query.table) {
            for row in rows.iter_mut().filter(|row| query.matches(row)) {
                if let Some(obj) = row.as_object_mut() {
                    obj.extend(fields.clone());
                }
            }
        }
        Ok(())
    }

    async fn insert(&self, table: &str, rows: Vec<Value>) -> Result<Vec<Value>, BackendError> {
        self.gate(Op::Insert).await?;
        let mut inserted = Vec::with_capacity(rows.len());
        for mut row in rows {
            let Some(obj) = row.as_object_mut() else {
                return Err(BackendError::Decode("inserted rows must be objects".into()));
            };
            obj.entry("id")
                .or_insert_with(|| Value::String(Uuid::new_v4().to_string()));
            inserted.push(row);
        }
        self.lock()
            .tables
            .entry(table.to_owned())
            .or_default()
            .extend(inserted.iter().cloned());
        Ok(inserted)
    }
}

#[cfg(test)]
#[path = "memory_test.rs"]
mod tests;
