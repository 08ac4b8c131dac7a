//! Security boundary for the Fieldgate gateway: authentication, per-value
//! encryption, and audit logging.
//!
//! The engine and the API consume this crate through three handles bundled
//! in [`SecurityContext`]. Encryption is optional per deployment; audit
//! recording for authentication attempts, connection lifecycle events, and
//! write operations happens regardless of the encryption setting.

pub mod audit;
pub mod auth;
pub mod vault;

use std::sync::Arc;

use fieldgate_core::config::SecuritySettings;
use fieldgate_core::Result;

pub use audit::AuditLog;
pub use auth::{Authenticator, Identity, IdentityKind};
pub use vault::{SealedValue, ValueCipher};

/// The security handles the engine and API are constructed with.
#[derive(Clone)]
pub struct SecurityContext {
    pub authenticator: Arc<Authenticator>,
    pub cipher: Arc<ValueCipher>,
    pub audit: Arc<AuditLog>,
}

impl SecurityContext {
    /// Builds the context from validated gateway settings.
    pub fn from_settings(settings: &SecuritySettings) -> Result<Self> {
        Ok(Self {
            authenticator: Arc::new(Authenticator::new(settings.auth_enabled)),
            cipher: Arc::new(ValueCipher::from_settings(settings)?),
            audit: Arc::new(AuditLog::new(settings.audit_enabled)),
        })
    }
}
