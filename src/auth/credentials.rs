//! Credential records and password hashing
//!
//! Passwords are stored as Argon2id PHC strings. Inputs are truncated to
//! [`MAX_PASSWORD_BYTES`] before hashing and before verification, so two
//! passwords sharing the same first 72 bytes are indistinguishable. This is a
//! known limitation, the same input bound bcrypt has.

use std::collections::HashMap;
use std::sync::OnceLock;

use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use rand::RngCore;
use tracing::{error, warn};

use super::AuthError;

/// Passwords longer than this are truncated before hashing/verifying
pub const MAX_PASSWORD_BYTES: usize = 72;

const SALT_LEN: usize = 16;

/// A user allowed to request tokens
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub username: String,
    pub hashed_password: String,
    pub disabled: bool,
}

impl Credential {
    pub fn new(username: impl Into<String>, hashed_password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            hashed_password: hashed_password.into(),
            disabled: false,
        }
    }

    pub fn disabled(mut self) -> Self {
        self.disabled = true;
        self
    }
}

/// Lookup interface over the credential records
pub trait CredentialStore: Send + Sync {
    /// Find the record for `username`, if any
    fn lookup(&self, username: &str) -> Option<Credential>;

    /// Verify a username/password pair.
    ///
    /// Returns `None` on unknown user, wrong password, or disabled account,
    /// without saying which.
    fn authenticate(&self, username: &str, password: &str) -> Option<Credential> {
        match self.lookup(username) {
            Some(credential) => {
                let valid = verify_password(password, &credential.hashed_password);
                (valid && !credential.disabled).then_some(credential)
            }
            None => {
                // Burn the same hashing cost as a real check.
                if let Some(dummy) = dummy_hash() {
                    let _ = verify_password(password, dummy);
                }
                None
            }
        }
    }
}

/// Credential store fixed at startup
#[derive(Debug, Default, Clone)]
pub struct StaticCredentialStore {
    credentials: HashMap<String, Credential>,
}

impl StaticCredentialStore {
    pub fn new(credentials: impl IntoIterator<Item = Credential>) -> Self {
        Self {
            credentials: credentials
                .into_iter()
                .map(|c| (c.username.clone(), c))
                .collect(),
        }
    }

    /// Store with a single user whose plaintext password is hashed now
    pub fn with_password(username: &str, password: &str) -> Result<Self, AuthError> {
        let hashed = hash_password(password)?;
        Ok(Self::new([Credential::new(username, hashed)]))
    }

    pub fn len(&self) -> usize {
        self.credentials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.credentials.is_empty()
    }
}

impl CredentialStore for StaticCredentialStore {
    fn lookup(&self, username: &str) -> Option<Credential> {
        self.credentials.get(username).cloned()
    }
}

/// Hash a password into an Argon2id PHC string
pub fn hash_password(password: &str) -> Result<String, AuthError> {
    let bytes = truncate_password(password);

    let mut salt = [0u8; SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    let salt = SaltString::encode_b64(&salt).map_err(|e| AuthError::Hashing(e.to_string()))?;

    let hash = Argon2::default()
        .hash_password(bytes, &salt)
        .map_err(|e| AuthError::Hashing(e.to_string()))?;

    Ok(hash.to_string())
}

/// Verify a password against a PHC hash; malformed hashes never verify
pub fn verify_password(password: &str, hashed_password: &str) -> bool {
    let parsed = match PasswordHash::new(hashed_password) {
        Ok(parsed) => parsed,
        Err(e) => {
            error!("Password verification error: {}", e);
            return false;
        }
    };

    Argon2::default()
        .verify_password(truncate_password(password), &parsed)
        .is_ok()
}

fn truncate_password(password: &str) -> &[u8] {
    let bytes = password.as_bytes();
    if bytes.len() > MAX_PASSWORD_BYTES {
        warn!(
            "Password is longer than {} bytes, truncating",
            MAX_PASSWORD_BYTES
        );
        &bytes[..MAX_PASSWORD_BYTES]
    } else {
        bytes
    }
}

fn dummy_hash() -> Option<&'static str> {
    static DUMMY: OnceLock<Option<String>> = OnceLock::new();
    DUMMY
        .get_or_init(|| hash_password("dummy-password-for-timing").ok())
        .as_deref()
}
