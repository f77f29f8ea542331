//! Password hashing and HS256 bearer tokens.

use chrono::{ Duration, Utc };
use jsonwebtoken::{ decode, encode, errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header, Validation };
use lazy_static::lazy_static;
use log::{ info, warn };
use serde::{ Deserialize, Serialize };
use std::sync::Arc;

use crate::cli::Args;
use crate::error::ChatError;
use crate::store::UserStore;

#[cfg(not(test))]
const HASH_COST: u32 = bcrypt::DEFAULT_COST;
#[cfg(test)]
const HASH_COST: u32 = 4;

pub const ANONYMOUS: &str = "anonymous";

lazy_static! {
    // compared against when the username is unknown, so both paths cost one bcrypt verify
    static ref UNKNOWN_USER_HASH: Option<String> = hash_password("unknown-user").ok();
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Claims {
    pub sub: String,
    pub exp: i64,
}

pub fn hash_password(password: &str) -> Result<String, ChatError> {
    bcrypt::hash(password, HASH_COST).map_err(|e| ChatError::Config(format!("Failed to hash password: {}", e)))
}

pub fn verify_password(password: &str, stored: &str) -> bool {
    bcrypt::verify(password, stored).unwrap_or(false)
}

/// bcrypt is CPU-bound; keep it off the async workers.
async fn blocking<F, T>(task: F) -> Result<T, ChatError>
    where F: FnOnce() -> T + Send + 'static, T: Send + 'static
{
    tokio::task
        ::spawn_blocking(task).await
        .map_err(|e| ChatError::Config(format!("Password hashing task failed: {}", e)))
}

/// Token of an `Authorization` header value. The scheme is matched case-insensitively.
pub fn bearer_token(header_value: &str) -> Option<&str> {
    let (scheme, token) = header_value.trim().split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}

pub fn issue_token(secret: &str, subject: &str, ttl: Duration) -> Result<String, ChatError> {
    let claims = Claims {
        sub: subject.to_string(),
        exp: (Utc::now() + ttl).timestamp(),
    };
    encode(&Header::new(Algorithm::HS256), &claims, &EncodingKey::from_secret(secret.as_bytes())).map_err(
        |e| ChatError::Config(format!("Failed to sign token: {}", e))
    )
}

pub fn verify_token(secret: &str, token: &str) -> Result<Claims, ChatError> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.leeway = 0;

    let data = decode::<Claims>(
        token.trim(),
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation
    ).map_err(|e| {
        match e.kind() {
            ErrorKind::ExpiredSignature => ChatError::unauthorized("token expired"),
            _ => ChatError::unauthorized("invalid token"),
        }
    })?;

    if data.claims.sub.is_empty() {
        return Err(ChatError::unauthorized("invalid token"));
    }
    Ok(data.claims)
}

fn validate_credentials(username: &str, password: &str) -> Result<(), ChatError> {
    let len = username.chars().count();
    if !(3..=50).contains(&len) {
        return Err(ChatError::invalid("username must be 3 to 50 characters"));
    }
    if !username.chars().all(|c| c.is_alphanumeric() || c == '_' || c == '-' || c == '.') {
        return Err(ChatError::invalid("username may contain letters, digits, '_', '-' and '.'"));
    }
    if username.eq_ignore_ascii_case(ANONYMOUS) {
        return Err(ChatError::Conflict(format!("username '{}' is reserved", username)));
    }
    if password.chars().count() < 6 {
        return Err(ChatError::invalid("password must be at least 6 characters"));
    }
    Ok(())
}

/// Signup, login and resolution of bearer tokens to authors.
pub struct Authenticator {
    users: Arc<dyn UserStore>,
    secret: String,
    ttl: Duration,
    require_auth: bool,
}

impl Authenticator {
    pub fn new(users: Arc<dyn UserStore>, secret: String, ttl: Duration, require_auth: bool) -> Self {
        Self { users, secret, ttl, require_auth }
    }

    pub fn from_args(users: Arc<dyn UserStore>, args: &Args) -> Self {
        if args.jwt_secret == "change_me" {
            warn!("JWT_SECRET is not set; tokens are signed with the built-in development secret.");
        }
        if args.require_auth {
            info!("Posting messages requires a bearer token.");
        } else {
            info!("Anonymous posting is allowed.");
        }
        Self::new(
            users,
            args.jwt_secret.clone(),
            Duration::minutes(args.jwt_expire_minutes),
            args.require_auth
        )
    }

    pub fn require_auth(&self) -> bool {
        self.require_auth
    }

    /// Signature and expiry check only; does not consult the user store.
    pub fn verify(&self, token: &str) -> Result<Claims, ChatError> {
        verify_token(&self.secret, token)
    }

    pub async fn signup(&self, username: &str, password: &str) -> Result<String, ChatError> {
        let username = username.trim();
        validate_credentials(username, password)?;
        let password = password.to_string();
        let password_hash = blocking(move || hash_password(&password)).await??;
        let user = self.users.create_user(username, &password_hash).await?;
        info!("Registered user {} ({})", user.username, user.id);
        issue_token(&self.secret, &user.username, self.ttl)
    }

    pub async fn login(&self, username: &str, password: &str) -> Result<String, ChatError> {
        let user = self.users.find_user(username.trim()).await?;
        let stored = user.as_ref().map(|u| u.password_hash.clone());
        let password = password.to_string();
        let verified = blocking(move || {
            match stored {
                Some(stored) => verify_password(&password, &stored),
                None => {
                    if let Some(dummy) = UNKNOWN_USER_HASH.as_deref() {
                        let _ = verify_password(&password, dummy);
                    }
                    false
                }
            }
        }).await?;

        match user {
            Some(user) if verified =>
                issue_token(&self.secret, &user.username, self.ttl),
            _ => Err(ChatError::unauthorized("invalid credentials")),
        }
    }

    /// Resolves the author of a request. A presented token must be valid and
    /// name an existing user; a missing token is only allowed without `require_auth`.
    pub async fn resolve_author(&self, token: Option<&str>) -> Result<String, ChatError> {
        match token.map(str::trim).filter(|t| !t.is_empty()) {
            Some(token) => {
                let claims = verify_token(&self.secret, token)?;
                match self.users.find_user(&claims.sub).await? {
                    Some(user) => Ok(user.username),
                    None => Err(ChatError::unauthorized("unknown user")),
                }
            }
            None if self.require_auth => Err(ChatError::unauthorized("missing bearer token")),
            None => Ok(ANONYMOUS.to_string()),
        }
    }
}
