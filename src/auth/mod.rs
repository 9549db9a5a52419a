//! User accounts, password hashing and bearer-token issuance/verification.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use base64::Engine;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

const PBKDF2_ITERATIONS: u32 = 100_000;
const KEY_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("username already taken")]
    UsernameTaken,
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("invalid or expired token")]
    InvalidToken,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub username: String,
    #[serde(skip_serializing)]
    password_hash: String,
    #[serde(skip_serializing)]
    salt: String,
    pub created_at_unix: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Claims {
    sub: String,
    username: String,
    exp: u64,
    iat: u64,
}

struct Inner {
    by_id: HashMap<String, User>,
    by_username: HashMap<String, String>, // username -> id
}

#[derive(Clone)]
pub struct AuthService {
    inner: Arc<RwLock<Inner>>,
    jwt_secret: String,
    token_ttl_seconds: u64,
}

impl AuthService {
    pub fn new(jwt_secret: String, token_ttl_seconds: u64) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner {
                by_id: HashMap::new(),
                by_username: HashMap::new(),
            })),
            jwt_secret,
            token_ttl_seconds,
        }
    }

    pub async fn signup(&self, username: &str, password: &str) -> Result<(User, String), AuthError> {
        let mut inner = self.inner.write().await;
        if inner.by_username.contains_key(username) {
            return Err(AuthError::UsernameTaken);
        }

        let (hash, salt) = hash_password(password);
        let user = User {
            id: Uuid::new_v4().to_string(),
            username: username.to_string(),
            password_hash: hash,
            salt,
            created_at_unix: now_unix(),
        };
        inner.by_username.insert(username.to_string(), user.id.clone());
        inner.by_id.insert(user.id.clone(), user.clone());

        let token = self.issue_token(&user);
        Ok((user, token))
    }

    pub async fn login(&self, username: &str, password: &str) -> Result<(User, String), AuthError> {
        let inner = self.inner.read().await;
        let id = inner
            .by_username
            .get(username)
            .ok_or(AuthError::InvalidCredentials)?;
        let user = inner.by_id.get(id).ok_or(AuthError::InvalidCredentials)?;

        if !verify_password(password, &user.password_hash, &user.salt) {
            return Err(AuthError::InvalidCredentials);
        }

        let token = self.issue_token(user);
        Ok((user.clone(), token))
    }

    fn issue_token(&self, user: &User) -> String {
        let now = now_unix();
        let claims = Claims {
            sub: user.id.clone(),
            username: user.username.clone(),
            iat: now,
            exp: now + self.token_ttl_seconds,
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.jwt_secret.as_bytes()),
        )
        .expect("encoding a JWT with a well-formed secret never fails")
    }

    pub async fn verify_token(&self, token: &str) -> Result<User, AuthError> {
        self.verify_token_with_expiry(token).await.map(|(user, _)| user)
    }

    /// Same verification as `verify_token`, also surfacing the token's
    /// expiry so callers like `/auth/me` can report it without re-decoding.
    pub async fn verify_token_with_expiry(&self, token: &str) -> Result<(User, u64), AuthError> {
        let data = decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.jwt_secret.as_bytes()),
            &Validation::default(),
        )
        .map_err(|_| AuthError::InvalidToken)?;

        let inner = self.inner.read().await;
        let user = inner
            .by_id
            .get(&data.claims.sub)
            .cloned()
            .ok_or(AuthError::InvalidToken)?;
        Ok((user, data.claims.exp))
    }
}

fn hash_password(password: &str) -> (String, String) {
    let mut salt = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut salt);
    let hash = derive_key(password, &salt);
    (
        base64::engine::general_purpose::STANDARD.encode(hash),
        base64::engine::general_purpose::STANDARD.encode(salt),
    )
}

fn verify_password(password: &str, stored_hash: &str, stored_salt: &str) -> bool {
    let Ok(salt) = base64::engine::general_purpose::STANDARD.decode(stored_salt) else {
        return false;
    };
    let hash = derive_key(password, &salt);
    base64::engine::general_purpose::STANDARD.encode(hash) == stored_hash
}

fn derive_key(password: &str, salt: &[u8]) -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, PBKDF2_ITERATIONS, &mut key);
    key
}

fn now_unix() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> AuthService {
        AuthService::new("test-secret".to_string(), 3600)
    }

    #[tokio::test]
    async fn signup_then_login_succeeds() {
        let auth = service();
        auth.signup("alice", "hunter2").await.unwrap();
        let (user, token) = auth.login("alice", "hunter2").await.unwrap();
        let verified = auth.verify_token(&token).await.unwrap();
        assert_eq!(verified.id, user.id);
    }

    #[tokio::test]
    async fn login_rejects_wrong_password() {
        let auth = service();
        auth.signup("alice", "hunter2").await.unwrap();
        let result = auth.login("alice", "wrong").await;
        assert!(matches!(result, Err(AuthError::InvalidCredentials)));
    }

    #[tokio::test]
    async fn duplicate_signup_is_rejected() {
        let auth = service();
        auth.signup("alice", "hunter2").await.unwrap();
        let result = auth.signup("alice", "other").await;
        assert!(matches!(result, Err(AuthError::UsernameTaken)));
    }

    #[tokio::test]
    async fn verify_token_rejects_garbage() {
        let auth = service();
        let result = auth.verify_token("not-a-real-token").await;
        assert!(matches!(result, Err(AuthError::InvalidToken)));
    }
}
