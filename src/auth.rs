use std::sync::Arc;

use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use ulid::Ulid;

use crate::engine::{Engine, EngineError};
use crate::limits::*;

// ── Credentials ──────────────────────────────────────────────────

pub fn validate_password(password: &str) -> Result<(), EngineError> {
    if password.len() < MIN_PASSWORD_LEN {
        return Err(EngineError::Validation("password must be at least 6 characters"));
    }
    if password.len() > MAX_PASSWORD_LEN {
        return Err(EngineError::LimitExceeded("password too long"));
    }
    Ok(())
}

/// bcrypt hash of `password`. CPU-bound; call before taking engine locks.
pub fn hash_password(password: &str, cost: u32) -> Result<String, EngineError> {
    validate_password(password)?;
    bcrypt::hash(password, cost).map_err(|e| EngineError::Validation(bcrypt_reason(&e)))
}

/// Constant-time check of `password` against a stored hash. A malformed
/// hash verifies as `false`.
pub fn verify_password(password: &str, hash: &str) -> bool {
    bcrypt::verify(password, hash).unwrap_or(false)
}

/// [`hash_password`] on the blocking pool, so a high bcrypt cost never stalls
/// the connections sharing this worker thread.
pub async fn hash_password_blocking(password: String, cost: u32) -> Result<String, EngineError> {
    tokio::task::spawn_blocking(move || hash_password(&password, cost))
        .await
        .map_err(|_| EngineError::Validation("password could not be hashed"))?
}

/// [`verify_password`] on the blocking pool.
pub async fn verify_password_blocking(password: String, hash: String) -> bool {
    tokio::task::spawn_blocking(move || verify_password(&password, &hash))
        .await
        .unwrap_or(false)
}

fn bcrypt_reason(e: &bcrypt::BcryptError) -> &'static str {
    match e {
        bcrypt::BcryptError::CostNotAllowed(_) => "bcrypt cost out of range",
        _ => "password could not be hashed",
    }
}

// ── Session authentication ───────────────────────────────────────

/// Startup authentication for pgwire sessions.
///
/// Every connection presents the service password. The startup `user`
/// names the principal: the service user is an anonymous session, any
/// other name must be the id of a registered user.
#[derive(Debug)]
pub struct ChaletAuthSource {
    engine: Arc<Engine>,
    service_user: String,
    password: String,
}

impl ChaletAuthSource {
    pub fn new(engine: Arc<Engine>, service_user: String, password: String) -> Self {
        Self {
            engine,
            service_user,
            password,
        }
    }
}

#[async_trait]
impl AuthSource for ChaletAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        let user = login.user().unwrap_or_default();
        if user != self.service_user {
            let known = match Ulid::from_string(user) {
                Ok(id) => self.engine.principal(id).await.is_some(),
                Err(_) => false,
            };
            if !known {
                metrics::counter!(crate::observability::AUTH_FAILURES_TOTAL).increment(1);
                return Err(PgWireError::UserError(Box::new(ErrorInfo::new(
                    "FATAL".into(),
                    "28000".into(),
                    format!("unknown session user: {user}"),
                ))));
            }
        }
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}
