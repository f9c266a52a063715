//! Typed records exchanged with the hosted backend, plus the resolved states
//! published by the session controllers.
//!
//! DESIGN
//! ======
//! Backend rows arrive as untyped JSON. They are decoded into these records at
//! the boundary ([`decode_row`]) so a malformed row fails once, where it is
//! read, instead of leaking `serde_json::Value` into controller logic.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("row decode failed: {0}")]
    Json(#[from] serde_json::Error),
}

/// Decode an untyped backend row into a typed record.
///
/// # Errors
///
/// Returns [`ModelError::Json`] if required fields are missing or mistyped.
pub fn decode_row<T: DeserializeOwned>(row: serde_json::Value) -> Result<T, ModelError> {
    Ok(serde_json::from_value(row)?)
}

// =============================================================================
// IDENTITY / SESSION
// =============================================================================

/// Backend-authenticated principal. Non-authoritative cached copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: Uuid,
    #[serde(default)]
    pub email: Option<String>,
}

/// Backend-issued credential bound to an [`Identity`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Unix seconds.
    #[serde(default)]
    pub expires_at: Option<i64>,
    #[serde(rename = "user")]
    pub identity: Identity,
}

/// Auth-change notification kinds published on the backend stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuthEvent {
    InitialSession,
    SignedIn,
    SignedOut,
    TokenRefreshed,
    UserUpdated,
    PasswordRecovery,
}

impl AuthEvent {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InitialSession => "INITIAL_SESSION",
            Self::SignedIn => "SIGNED_IN",
            Self::SignedOut => "SIGNED_OUT",
            Self::TokenRefreshed => "TOKEN_REFRESHED",
            Self::UserUpdated => "USER_UPDATED",
            Self::PasswordRecovery => "PASSWORD_RECOVERY",
        }
    }
}

impl std::fmt::Display for AuthEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One message on the auth-change stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthChange {
    pub event: AuthEvent,
    pub session: Option<Session>,
}

// =============================================================================
// PROFILE
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Tenant,
    Admin,
}

impl Role {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tenant => "tenant",
            Self::Admin => "admin",
        }
    }

    /// Dashboard a user of this role lands on.
    #[must_use]
    pub fn dashboard_path(self) -> &'static str {
        match self {
            Self::Tenant => crate::router::routes::TENANT_DASHBOARD,
            Self::Admin => crate::router::routes::ADMIN_DASHBOARD,
        }
    }
}

/// Application-level record of role and contact info, keyed by identity id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub id: Uuid,
    pub role: Role,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

/// Partial profile update. Absent fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProfileUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
}

impl ProfileUpdate {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.role.is_none() && self.first_name.is_none() && self.last_name.is_none() && self.phone.is_none()
    }

    /// Apply this update on top of a cached profile.
    pub fn apply_to(&self, profile: &mut Profile) {
        if let Some(role) = self.role {
            profile.role = role;
        }
        if let Some(first) = &self.first_name {
            profile.first_name = Some(first.clone());
        }
        if let Some(last) = &self.last_name {
            profile.last_name = Some(last.clone());
        }
        if let Some(phone) = &self.phone {
            profile.phone = Some(phone.clone());
        }
    }
}

/// Metadata attached to a new identity at sign-up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SignUpProfile {
    pub role: Role,
    pub first_name: String,
    pub last_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
}

// =============================================================================
// SOCIETY / MEMBERSHIP
// =============================================================================

/// The managed residential entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Society {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
}

/// Fields needed to register a society during admin onboarding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NewSociety {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
}

/// Join record proving an identity administers a society.
///
/// Decoded from an `admins` row with the `societies` relation embedded; a row
/// whose society did not join fails to decode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminMembership {
    pub id: Uuid,
    pub user_id: Uuid,
    pub society_id: Uuid,
    pub designation: String,
    #[serde(rename = "societies")]
    pub society: Society,
}

// =============================================================================
// RESOLVED STATES
// =============================================================================

/// Resolved state of the identity controller.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Loading,
    Unauthenticated,
    /// `profile` is `None` until fetched, or when the fetch failed.
    Authenticated { identity: Identity, profile: Option<Profile> },
}

impl SessionState {
    #[must_use]
    pub fn is_loading(&self) -> bool {
        matches!(self, Self::Loading)
    }

    #[must_use]
    pub fn identity(&self) -> Option<&Identity> {
        match self {
            Self::Authenticated { identity, .. } => Some(identity),
            _ => None,
        }
    }

    #[must_use]
    pub fn profile(&self) -> Option<&Profile> {
        match self {
            Self::Authenticated { profile, .. } => profile.as_ref(),
            _ => None,
        }
    }

    #[must_use]
    pub fn role(&self) -> Option<Role> {
        self.profile().map(|p| p.role)
    }
}

/// Resolved state of the admin controller.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum AdminState {
    #[default]
    Loading,
    NotAdmin,
    Admin(AdminMembership),
    /// Onboarding bypass: admin-equivalent before the membership row exists.
    PendingOnboarding { user_id: Option<Uuid> },
}

impl AdminState {
    #[must_use]
    pub fn is_loading(&self) -> bool {
        matches!(self, Self::Loading)
    }

    #[must_use]
    pub fn is_admin_equivalent(&self) -> bool {
        matches!(self, Self::Admin(_) | Self::PendingOnboarding { .. })
    }

    #[must_use]
    pub fn society(&self) -> Option<&Society> {
        match self {
            Self::Admin(membership) => Some(&membership.society),
            _ => None,
        }
    }
}

#[cfg(test)]
#[path = "model_test.rs"]
mod tests;
