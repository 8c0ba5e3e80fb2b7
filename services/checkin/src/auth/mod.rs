//! Account signup, login and bearer-token authorization.
//!
//! Passwords are stored as Argon2id hashes. Tokens are HS256 JWTs with
//! `sub = username`; no session state is kept server side.

pub mod password;
pub mod token;

use crate::config::{AuthConfig, MAX_TOKEN_TTL_SECS};
use crate::model::{Account, CredentialRecord};
use crate::stores::{with_timeout, CredentialStore, InsertOutcome, StoreError};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, instrument, warn};

pub use password::CredentialHasher;
pub use token::{Claims, IssuedToken, TokenIssuer};

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid signup: {0}")]
    Validation(String),

    #[error("account already exists")]
    DuplicateAccount,

    /// Unknown user, wrong password and lookup failure all look the same to callers
    #[error("invalid password or username")]
    InvalidCredentials,

    #[error("missing, malformed or expired token")]
    InvalidToken,

    #[error("credential store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),

    #[error("internal auth error: {0}")]
    Internal(String),
}

/// Source of "now" for token issue and expiry checks
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

pub struct AuthService {
    store: Arc<dyn CredentialStore>,
    hasher: CredentialHasher,
    tokens: TokenIssuer,
    clock: Arc<dyn Clock>,
    store_timeout: Duration,
}

impl AuthService {
    pub fn new(
        config: &AuthConfig,
        store: Arc<dyn CredentialStore>,
        clock: Arc<dyn Clock>,
        store_timeout: Duration,
    ) -> Result<Self, AuthError> {
        if config.token_ttl_secs == 0 || config.token_ttl_secs > MAX_TOKEN_TTL_SECS {
            return Err(AuthError::Internal(format!(
                "token lifetime of {}s is out of range",
                config.token_ttl_secs
            )));
        }
        let ttl = chrono::Duration::from_std(config.token_ttl())
            .map_err(|e| AuthError::Internal(format!("invalid token lifetime: {e}")))?;

        Ok(Self {
            store,
            hasher: CredentialHasher::new(config.argon2_memory_kib, config.argon2_iterations)?,
            tokens: TokenIssuer::new(config.signing_key.as_bytes(), ttl),
            clock,
            store_timeout,
        })
    }

    /// Create an account; the username must be free and match `[a-z0-9_]+`
    #[instrument(skip(self, candidate), fields(username = %candidate.username))]
    pub async fn signup(&self, candidate: Account) -> Result<(), AuthError> {
        if candidate.username.is_empty() || candidate.password.is_empty() {
            return Err(AuthError::Validation(
                "username and password must not be empty".to_string(),
            ));
        }
        if !Account::is_valid_username(&candidate.username) {
            return Err(AuthError::Validation(
                "username may only contain lowercase letters, digits and underscores"
                    .to_string(),
            ));
        }

        let existing = with_timeout(
            self.store_timeout,
            self.store.find_by_username(&candidate.username),
        )
        .await?;
        if existing.is_some() {
            info!("Signup rejected, username taken");
            return Err(AuthError::DuplicateAccount);
        }

        let hasher = self.hasher.clone();
        let password = candidate.password;
        let password_hash = tokio::task::spawn_blocking(move || hasher.hash(&password))
            .await
            .map_err(|e| AuthError::Internal(format!("hashing task failed: {e}")))??;

        let record = CredentialRecord {
            username: candidate.username,
            password_hash,
            age: candidate.age,
            gender: candidate.gender,
            created_at: self.clock.now(),
        };

        // The lookup above is only a fast path; this call decides races
        match with_timeout(self.store_timeout, self.store.insert_if_absent(&record)).await? {
            InsertOutcome::Inserted => {
                info!("Account created");
                metrics::counter!("checkin.auth.signups").increment(1);
                Ok(())
            }
            InsertOutcome::AlreadyExists => {
                info!("Signup lost a race for the username");
                Err(AuthError::DuplicateAccount)
            }
        }
    }

    /// Exchange a username and password for a signed token
    #[instrument(skip(self, password))]
    pub async fn login(&self, username: &str, password: &str) -> Result<IssuedToken, AuthError> {
        let record = match with_timeout(self.store_timeout, self.store.find_by_username(username))
            .await
        {
            Ok(Some(record)) if record.username == username => record,
            Ok(_) => {
                warn!(reason = "unknown_user", "Login rejected");
                metrics::counter!("checkin.auth.login.failed").increment(1);
                return Err(AuthError::InvalidCredentials);
            }
            Err(e) => {
                warn!(reason = "store_error", error = %e, "Login rejected");
                metrics::counter!("checkin.auth.login.failed").increment(1);
                return Err(AuthError::InvalidCredentials);
            }
        };

        let hasher = self.hasher.clone();
        let password = password.to_string();
        let matches = tokio::task::spawn_blocking(move || {
            hasher.verify(&password, &record.password_hash)
        })
        .await
        .map_err(|e| AuthError::Internal(format!("verification task failed: {e}")))?;

        if !matches {
            warn!(reason = "password_mismatch", "Login rejected");
            metrics::counter!("checkin.auth.login.failed").increment(1);
            return Err(AuthError::InvalidCredentials);
        }

        let issued = self.tokens.issue_at(username, self.clock.now())?;
        info!(expires_at = %issued.expires_at, "Token issued");
        Ok(issued)
    }

    /// Username carried by a valid, unexpired token
    pub fn authorize(&self, token: &str) -> Result<String, AuthError> {
        self.tokens
            .verify_at(token, self.clock.now())
            .map(|claims| claims.sub)
    }
}
