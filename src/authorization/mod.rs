//! Roles, client identity, and the host-side directory.
//!
//! ## Pieces
//! - [`Role`]: the fixed role vocabulary sessions authorize against.
//! - [`ClientInfo`]: identity plus roles for one client.
//! - [`HostDirectory`]: the host endpoints the resolver calls.
//! - [`RoleResolver`]: cached, retried, polyfill-aware lookups on top
//!   of a directory.

pub mod resolver;

pub use resolver::{AuthorizationConfig, RoleResolver};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::SyncError;

/// Role a client can hold within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Guest,
    Attendee,
    Presenter,
    Organizer,
}

impl Role {
    /// Parse a wire-format role name. Unknown names yield `None`.
    pub fn parse(name: &str) -> Option<Role> {
        match name {
            "guest" => Some(Role::Guest),
            "attendee" => Some(Role::Attendee),
            "presenter" => Some(Role::Presenter),
            "organizer" => Some(Role::Organizer),
            _ => None,
        }
    }
}

/// What a session knows about one client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientInfo {
    #[serde(rename = "userId")]
    pub user_id: String,
    pub roles: Vec<Role>,
    #[serde(rename = "displayName", skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

/// Host endpoints for identity and authorization.
///
/// All three return raw JSON: hosts disagree on response shapes and the
/// resolver owns the normalization.
#[async_trait]
pub trait HostDirectory: Send + Sync {
    /// Announce a client id to the host so later role checks can see it.
    async fn register_client_id(&self, client_id: &str) -> Result<Value, SyncError>;

    /// Roles granted to `client_id`.
    async fn client_roles(&self, client_id: &str) -> Result<Value, SyncError>;

    /// Full identity record for `client_id`. Hosts predating this
    /// endpoint hang or reject here; the resolver detects that and
    /// falls back to assembling the record itself.
    async fn client_info(&self, client_id: &str) -> Result<Value, SyncError>;
}

/// Directory with a fixed grant table, for single-machine sessions and
/// tests. Unknown ids fall back to the default role set.
pub struct StaticDirectory {
    grants: HashMap<String, Vec<Role>>,
    default_roles: Vec<Role>,
    warned: AtomicBool,
}

impl StaticDirectory {
    pub fn new(default_roles: Vec<Role>) -> Self {
        Self {
            grants: HashMap::new(),
            default_roles,
            warned: AtomicBool::new(false),
        }
    }

    pub fn grant(mut self, client_id: &str, roles: Vec<Role>) -> Self {
        self.grants.insert(client_id.to_string(), roles);
        self
    }

    fn roles_for(&self, client_id: &str) -> Value {
        if !self.warned.swap(true, Ordering::Relaxed) {
            tracing::warn!(
                "static role directory answering authorization queries; not for production sessions"
            );
        }
        let roles = self
            .grants
            .get(client_id)
            .unwrap_or(&self.default_roles);
        json!(roles)
    }
}

#[async_trait]
impl HostDirectory for StaticDirectory {
    async fn register_client_id(&self, client_id: &str) -> Result<Value, SyncError> {
        Ok(self.roles_for(client_id))
    }

    async fn client_roles(&self, client_id: &str) -> Result<Value, SyncError> {
        Ok(self.roles_for(client_id))
    }

    async fn client_info(&self, client_id: &str) -> Result<Value, SyncError> {
        Ok(json!({
            "userId": client_id,
            "roles": self.roles_for(client_id),
        }))
    }
}

// ── Tests ───────────────────────────────────────────────────────
