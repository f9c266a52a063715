//! Hosted-service adapter: auth endpoints under `/auth/v1`, row endpoints
//! under `/rest/v1`.
//!
//! SYSTEM CONTEXT
//! ==============
//! The hosted client keeps the current session locally and publishes auth
//! changes to its own listeners; this adapter does the same through
//! [`AuthEventHub`]. Row requests carry the session's access token when one is
//! present, otherwise the anon key.
//!
//! ERROR HANDLING
//! ==============
//! Non-2xx responses become [`BackendError::Status`]; 400 responses on the
//! password grant and sign-up become [`BackendError::Credentials`] with the
//! service's message.

use std::sync::{PoisonError, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::{Value, json};
use tracing::{debug, info, warn};

use super::{AuthEventHub, AuthSubscription, Backend, BackendError, Query};
use crate::config::BackendConfig;
use crate::model::{AuthEvent, Identity, Session, SignUpProfile};

/// Seconds of slack before `expires_at` at which a session counts as expired.
const EXPIRY_MARGIN_SECS: i64 = 30;

pub struct RestBackend {
    http: reqwest::Client,
    config: BackendConfig,
    hub: AuthEventHub,
    session: RwLock<Option<Session>>,
}

impl RestBackend {
    /// Build an HTTP client from backend config.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Config`] if the HTTP client fails to build.
    pub fn new(config: BackendConfig) -> Result<Self, BackendError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| BackendError::Config(e.to_string()))?;
        Ok(Self { http, config, hub: AuthEventHub::new(), session: RwLock::new(None) })
    }

    fn stored_session(&self) -> Option<Session> {
        self.session
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn store_session(&self, session: Option<Session>) {
        *self
            .session
            .write()
            .unwrap_or_else(PoisonError::into_inner) = session;
    }

    fn bearer(&self) -> String {
        self.stored_session()
            .map_or_else(|| self.config.anon_key.clone(), |s| s.access_token)
    }

    /// Exchange the stored refresh token for a new session and publish
    /// `TOKEN_REFRESHED`.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Credentials`] when no refresh token is stored,
    /// or the service's error for a rejected refresh.
    pub async fn refresh_session(&self) -> Result<Session, BackendError> {
        let refresh_token = self
            .stored_session()
            .and_then(|s| s.refresh_token)
            .ok_or_else(|| BackendError::Credentials("no refresh token".into()))?;
        let resp = self
            .http
            .post(auth_endpoint(&self.config.url, "token?grant_type=refresh_token"))
            .header("apikey", &self.config.anon_key)
            .json(&json!({ "refresh_token": refresh_token }))
            .send()
            .await
            .map_err(transport)?;
        let session: Session = decode_json(check_credentials(resp).await?).await?;
        self.store_session(Some(session.clone()));
        info!(user_id = %session.identity.id, "session refreshed");
        self.hub
            .publish(AuthEvent::TokenRefreshed, Some(session.clone()));
        Ok(session)
    }
}

// =============================================================================
// URL + RESPONSE HELPERS
// =============================================================================

pub(crate) fn auth_endpoint(base: &str, path: &str) -> String {
    format!("{base}/auth/v1/{path}")
}

pub(crate) fn rest_endpoint(base: &str, table: &str) -> String {
    format!("{base}/rest/v1/{table}")
}

/// Query-string pairs for a row request: `select` plus `col=eq.value` filters.
pub(crate) fn query_params(query: &Query) -> Vec<(String, String)> {
    let mut params = vec![("select".to_owned(), query.select_clause())];
    params.extend(
        query
            .filters
            .iter()
            .map(|(column, value)| (column.clone(), format!("eq.{value}"))),
    );
    params
}

pub(crate) fn is_expired(session: &Session, now_secs: i64) -> bool {
    session
        .expires_at
        .is_some_and(|exp| exp - EXPIRY_MARGIN_SECS <= now_secs)
}

/// Sign-up responses carry the user either at the top level or under `user`.
pub(crate) fn identity_from_signup(body: &Value) -> Result<Identity, BackendError> {
    let user = body.get("user").filter(|u| !u.is_null()).unwrap_or(body);
    serde_json::from_value(user.clone()).map_err(|e| BackendError::Decode(e.to_string()))
}

/// Human-readable message from an auth error body.
pub(crate) fn error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            ["msg", "error_description", "message", "error"]
                .iter()
                .find_map(|key| v.get(*key).and_then(Value::as_str).map(str::to_owned))
        })
        .unwrap_or_else(|| body.to_owned())
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
}

fn transport(e: reqwest::Error) -> BackendError {
    BackendError::Transport(e.to_string())
}

async fn check(resp: reqwest::Response) -> Result<reqwest::Response, BackendError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(BackendError::Status { status: status.as_u16(), body })
}

/// Like [`check`], but 400/401/422 become credential errors.
async fn check_credentials(resp: reqwest::Response) -> Result<reqwest::Response, BackendError> {
    let status = resp.status().as_u16();
    match check(resp).await {
        Err(BackendError::Status { body, .. }) if matches!(status, 400 | 401 | 422) => {
            Err(BackendError::Credentials(error_message(&body)))
        }
        other => other,
    }
}

async fn decode_json<T: serde::de::DeserializeOwned>(resp: reqwest::Response) -> Result<T, BackendError> {
    resp.json::<T>()
        .await
        .map_err(|e| BackendError::Decode(e.to_string()))
}

// =============================================================================
// BACKEND IMPL
// =============================================================================

#[async_trait::async_trait]
impl Backend for RestBackend {
    async fn get_current_session(&self) -> Result<Option<Session>, BackendError> {
        let Some(session) = self.stored_session() else {
            return Ok(None);
        };
        if is_expired(&session, now_secs()) {
            debug!(user_id = %session.identity.id, "stored session expired; refreshing");
            return match self.refresh_session().await {
                Ok(session) => Ok(Some(session)),
                Err(BackendError::Credentials(_)) => {
                    self.store_session(None);
                    self.hub.publish(AuthEvent::SignedOut, None);
                    Ok(None)
                }
                Err(e) => Err(e),
            };
        }
        Ok(Some(session))
    }

    fn on_session_change(&self) -> AuthSubscription {
        self.hub.subscribe()
    }

    async fn sign_in_with_password(&self, email: &str, password: &str) -> Result<Session, BackendError> {
        let resp = self
            .http
            .post(auth_endpoint(&self.config.url, "token?grant_type=password"))
            .header("apikey", &self.config.anon_key)
            .json(&json!({ "email": email, "password": password }))
            .send()
            .await
            .map_err(transport)?;
        let session: Session = decode_json(check_credentials(resp).await?).await?;
        self.store_session(Some(session.clone()));
        self.hub.publish(AuthEvent::SignedIn, Some(session.clone()));
        Ok(session)
    }

    async fn sign_up(&self, email: &str, password: &str, metadata: &SignUpProfile) -> Result<Identity, BackendError> {
        let resp = self
            .http
            .post(auth_endpoint(&self.config.url, "signup"))
            .header("apikey", &self.config.anon_key)
            .json(&json!({ "email": email, "password": password, "data": metadata }))
            .send()
            .await
            .map_err(transport)?;
        let body: Value = decode_json(check_credentials(resp).await?).await?;
        identity_from_signup(&body)
    }

    async fn sign_out(&self) -> Result<(), BackendError> {
        let token = self.stored_session().map(|s| s.access_token);
        // Local state is cleared even when the revoke call fails.
        self.store_session(None);
        self.hub.publish(AuthEvent::SignedOut, None);

        let Some(token) = token else {
            return Ok(());
        };
        let resp = self
            .http
            .post(auth_endpoint(&self.config.url, "logout"))
            .header("apikey", &self.config.anon_key)
            .bearer_auth(token)
            .send()
            .await
            .map_err(transport)?;
        if let Err(e) = check(resp).await {
            warn!(error = %e, "remote session revoke failed");
            return Err(e);
        }
        Ok(())
    }

    async fn query_one(&self, query: &Query) -> Result<Option<Value>, BackendError> {
        let mut params = query_params(query);
        params.push(("limit".to_owned(), "1".to_owned()));
        let resp = self
            .http
            .get(rest_endpoint(&self.config.url, &query.table))
            .header("apikey", &self.config.anon_key)
            .bearer_auth(self.bearer())
            .query(&params)
            .send()
            .await
            .map_err(transport)?;
        let rows: Vec<Value> = decode_json(check(resp).await?).await?;
        Ok(rows.into_iter().next())
    }

    async fn update(&self, query: &Query, fields: Value) -> Result<(), BackendError> {
        let params: Vec<(String, String)> = query_params(query)
            .into_iter()
            .filter(|(k, _)| k != "select")
            .collect();
        let resp = self
            .http
            .patch(rest_endpoint(&self.config.url, &query.table))
            .header("apikey", &self.config.anon_key)
            .bearer_auth(self.bearer())
            .query(&params)
            .json(&fields)
            .send()
            .await
            .map_err(transport)?;
        check(resp).await?;
        Ok(())
    }

    async fn insert(&self, table: &str, rows: Vec<Value>) -> Result<Vec<Value>, BackendError> {
        let resp = self
            .http
            .post(rest_endpoint(&self.config.url, table))
            .header("apikey", &self.config.anon_key)
            .header("Prefer", "return=representation")
            .bearer_auth(self.bearer())
            .json(&rows)
            .send()
            .await
            .map_err(transport)?;
        decode_json(check(resp).await?).await
    }
}

#[cfg(test)]
#[path = "rest_test.rs"]
mod tests;
