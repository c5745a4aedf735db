//! Authentication for the job API
//!
//! Handles:
//! - Credential lookup and password verification (`credentials`)
//! - Bearer token issue and verification (`token`)
//!
//! Does NOT handle:
//! - HTTP concerns (status codes, headers). See `server`
//! - Authorization beyond "is this a known, enabled user"

pub mod credentials;
pub mod token;

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, warn};

pub use credentials::{
    hash_password, verify_password, Credential, CredentialStore, StaticCredentialStore,
};
pub use token::{AccessToken, TokenIssuer};

/// Authentication failures
///
/// Every variant is reported to callers as the same "could not validate
/// credentials" response; the distinction is for logs and tests only.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Incorrect username or password")]
    InvalidCredentials,

    #[error("No bearer token supplied")]
    MissingToken,

    #[error("Token signature is invalid")]
    InvalidSignature,

    #[error("Token is malformed")]
    Malformed,

    #[error("Token has expired")]
    Expired,

    #[error("Token has no subject")]
    MissingSubject,

    #[error("Token subject is unknown or disabled")]
    UnknownOrDisabledUser,

    #[error("Password hashing failed: {0}")]
    Hashing(String),

    #[error("Token signing failed: {0}")]
    Signing(String),
}

/// Credential store plus token issuer, shared by the HTTP handlers
#[derive(Clone)]
pub struct Authenticator {
    store: Arc<dyn CredentialStore>,
    issuer: TokenIssuer,
}

impl Authenticator {
    pub fn new(store: Arc<dyn CredentialStore>, issuer: TokenIssuer) -> Self {
        Self { store, issuer }
    }

    pub fn issuer(&self) -> &TokenIssuer {
        &self.issuer
    }

    /// Exchange a username/password for a fresh token
    pub fn login(&self, username: &str, password: &str) -> Result<AccessToken, AuthError> {
        let Some(credential) = self.store.authenticate(username, password) else {
            warn!("Login failed for user {:?}", username);
            return Err(AuthError::InvalidCredentials);
        };

        let token = self.issuer.issue(&credential.username)?;
        debug!(
            "Issued token for {} (expires {})",
            credential.username, token.expires_at
        );
        Ok(token)
    }

    /// Verify a bearer token and resolve it to an enabled credential
    pub fn verify_token(&self, token: &str) -> Result<Credential, AuthError> {
        let subject = self.issuer.verify(token)?;
        match self.store.lookup(&subject) {
            Some(credential) if !credential.disabled => Ok(credential),
            _ => Err(AuthError::UnknownOrDisabledUser),
        }
    }
}
