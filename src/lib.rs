//! Session and role-resolution core for a residential society management app.
//!
//! Two controllers observe one hosted auth backend: the identity controller
//! answers "who is signed in, and are they a tenant or an admin?", the admin
//! controller answers "does this identity administer a society?". Route guards
//! consume both to decide what to render and where to redirect.

pub mod backend;
pub mod config;
pub mod guard;
pub mod model;
pub mod notify;
pub mod router;
pub mod session;

pub use backend::{Backend, BackendError};
pub use config::{ConfigError, SessionConfig, Timeouts};
pub use guard::{AdminGuard, GuardDecision, RoleCache, RoleGuard};
pub use model::{AdminState, Role, SessionState};
pub use session::admin::AdminSessionController;
pub use session::identity::IdentitySessionController;
pub use session::{AuthError, Mount, SessionDeps};
