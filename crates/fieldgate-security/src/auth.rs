//! Credential store and authentication.
//!
//! Secrets are stored as Argon2 hashes and verified through the password
//! hash framework, so comparisons never short-circuit on a byte mismatch.
//! Unknown identities are verified against a fixed decoy hash: the work
//! factor is identical whether or not the identity exists, and the caller
//! always receives the same `InvalidCredentials` error.

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use dashmap::DashMap;
use fieldgate_core::{AuthError, GatewayError, Result};
use tracing::debug;

/// What kind of principal a credential belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityKind {
    /// A human or service operating the gateway API
    Operator,
    /// A field device authenticating itself to the gateway
    Device,
}

/// An authenticated principal.
#[derive(Debug, Clone)]
pub struct Identity {
    pub id: String,
    pub kind: IdentityKind,
}

struct StoredCredential {
    hash: String,
    kind: IdentityKind,
}

/// Credential store with uniform-failure authentication.
pub struct Authenticator {
    enabled: bool,
    credentials: DashMap<String, StoredCredential>,
    decoy_hash: String,
}

impl Authenticator {
    pub fn new(enabled: bool) -> Self {
        let mut decoy = [0u8; 32];
        use rand::RngCore;
        rand::rngs::OsRng.fill_bytes(&mut decoy);
        let decoy_hash = hash_secret(&hex::encode(decoy)).expect("hashing a fresh secret");

        Self {
            enabled,
            credentials: DashMap::new(),
            decoy_hash,
        }
    }

    /// Whether the API must require credentials.
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Registers or replaces a credential.
    pub fn add_credential(
        &self,
        id: impl Into<String>,
        secret: &str,
        kind: IdentityKind,
    ) -> Result<()> {
        let id = id.into();
        let hash = hash_secret(secret)?;
        self.credentials.insert(id, StoredCredential { hash, kind });
        Ok(())
    }

    /// Verifies a credential.
    ///
    /// Returns the same error for an unknown id and a wrong secret; the
    /// decoy verification keeps the timing profile of the two cases
    /// indistinguishable.
    pub fn authenticate(&self, id: &str, secret: &str) -> Result<Identity> {
        match self.credentials.get(id) {
            Some(stored) => {
                if verify_secret(secret, &stored.hash) {
                    Ok(Identity {
                        id: id.to_string(),
                        kind: stored.kind,
                    })
                } else {
                    debug!(identity = %id, "credential verification failed");
                    Err(AuthError::InvalidCredentials.into())
                }
            }
            None => {
                let _ = verify_secret(secret, &self.decoy_hash);
                debug!("credential verification failed");
                Err(AuthError::InvalidCredentials.into())
            }
        }
    }
}

fn hash_secret(secret: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(secret.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|e| GatewayError::Internal(format!("failed to hash secret: {e}")))
}

fn verify_secret(secret: &str, hash: &str) -> bool {
    PasswordHash::new(hash)
        .map(|parsed| {
            Argon2::default()
                .verify_password(secret.as_bytes(), &parsed)
                .is_ok()
        })
        .unwrap_or(false)
}
