//! Authentication and authorization.

use crate::db::{Database, User, now_timestamp};
use crate::error::{AppError, Result};
use argon2::{
    Argon2,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng},
};
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Hash a password using Argon2.
pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let argon2 = Argon2::default();

    argon2
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| AppError::Internal(format!("Failed to hash password: {}", e)))
}

/// Verify a password against a hash.
pub fn verify_password(password: &str, hash: &str) -> Result<bool> {
    let parsed_hash = PasswordHash::new(hash)
        .map_err(|e| AppError::Internal(format!("Invalid password hash: {}", e)))?;

    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed_hash)
        .is_ok())
}

/// Validate username shape: 1-64 characters from the allowed set.
pub fn validate_username(username: &str) -> Result<()> {
    if username.is_empty() || username.len() > 64 {
        return Err(AppError::Validation(
            "Username must be 1-64 characters".to_string(),
        ));
    }

    if !username
        .chars()
        .all(|c| c.is_alphanumeric() || c == '_' || c == '-')
    {
        return Err(AppError::Validation(
            "Username can only contain letters, numbers, _ and -".to_string(),
        ));
    }

    Ok(())
}

/// Bearer token claims. `sub` carries the username.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /// Username the token was issued for.
    pub sub: String,
    /// Issued-at (unix seconds).
    pub iat: i64,
    /// Expiry (unix seconds).
    pub exp: i64,
}

/// Request roles, ordered by privilege.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Role {
    /// Default role: browse, purchase, read, review.
    Reader,
    /// Reader plus the creator dashboard.
    Creator,
    /// Full access including catalog management.
    Admin,
}

impl Role {
    /// Whether this role satisfies a required role. Privileges are strictly
    /// nested: admin covers creator, creator covers reader.
    pub fn allows(&self, required: Role) -> bool {
        *self >= required
    }

    /// Role name as stored in the users table.
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Reader => "reader",
            Role::Creator => "creator",
            Role::Admin => "admin",
        }
    }
}

impl FromStr for Role {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "reader" => Ok(Role::Reader),
            "creator" => Ok(Role::Creator),
            "admin" => Ok(Role::Admin),
            other => Err(AppError::Internal(format!("Unknown role '{}'", other))),
        }
    }
}

/// Authentication service: registration, login, token issue and validation.
pub struct AuthService {
    db: Database,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    token_minutes: u64,
}

impl AuthService {
    /// Create a new auth service with an HMAC signing secret.
    pub fn new(db: Database, secret: &str, token_minutes: u64) -> Self {
        Self {
            db,
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            token_minutes,
        }
    }

    /// Register a new reader account.
    pub fn register(&self, username: &str, email: &str, password: &str) -> Result<User> {
        self.create_user(username, email, password, "reader")
    }

    /// Create a new user with an explicit role.
    pub fn create_user(
        &self,
        username: &str,
        email: &str,
        password: &str,
        role: &str,
    ) -> Result<User> {
        validate_username(username)?;

        // Validate email
        if !email.contains('@') || email.len() > 254 {
            return Err(AppError::Validation("Invalid email address".to_string()));
        }

        // Validate password
        if password.len() < 4 {
            return Err(AppError::Validation(
                "Password must be at least 4 characters".to_string(),
            ));
        }

        // Validate role
        Role::from_str(role)
            .map_err(|_| AppError::Validation("Role must be 'reader', 'creator' or 'admin'".to_string()))?;

        let password_hash = hash_password(password)?;

        let user = User {
            id: uuid::Uuid::new_v4().to_string(),
            username: username.to_string(),
            email: email.to_string(),
            password_hash,
            role: role.to_string(),
            points: 0,
            settings: Default::default(),
            full_name: None,
            bio: None,
            avatar_url: None,
            country: None,
            phone: None,
            created_at: now_timestamp(),
        };

        self.db.create_user(&user)?;
        Ok(user)
    }

    /// Login and issue a bearer token.
    pub fn login(&self, username: &str, password: &str) -> Result<(User, String)> {
        let user = self
            .db
            .get_user_by_username(username)?
            .ok_or_else(|| AppError::Unauthorized("Invalid username or password".to_string()))?;

        if !verify_password(password, &user.password_hash)? {
            return Err(AppError::Unauthorized(
                "Invalid username or password".to_string(),
            ));
        }

        let token = self.issue_token(&user.username)?;
        Ok((user, token))
    }

    /// Sign a token for a username.
    pub fn issue_token(&self, username: &str) -> Result<String> {
        let now = now_timestamp();
        let claims = Claims {
            sub: username.to_string(),
            iat: now,
            exp: now + (self.token_minutes as i64) * 60,
        };

        encode(&Header::default(), &claims, &self.encoding_key)
            .map_err(|e| AppError::Internal(format!("Failed to sign token: {}", e)))
    }

    /// Validate a bearer token and load the current account state.
    ///
    /// The user is re-read from storage on every request, so role and balance
    /// are always current even for tokens issued before a change.
    pub fn authenticate(&self, token: &str) -> Result<User> {
        let validation = Validation::default();
        let data = decode::<Claims>(token, &self.decoding_key, &validation)
            .map_err(|_| AppError::Unauthorized("Invalid or expired token".to_string()))?;

        self.db
            .get_user_by_username(&data.claims.sub)?
            .ok_or_else(|| AppError::Unauthorized("User no longer exists".to_string()))
    }

    /// Change a user's password.
    pub fn change_password(&self, username: &str, new_password: &str) -> Result<bool> {
        if new_password.len() < 4 {
            return Err(AppError::Validation(
                "Password must be at least 4 characters".to_string(),
            ));
        }

        let password_hash = hash_password(new_password)?;
        self.db.update_user_password(username, &password_hash)
    }

    /// Delete a user.
    pub fn delete_user(&self, username: &str) -> Result<bool> {
        self.db.delete_user(username)
    }

    /// List all users.
    pub fn list_users(&self) -> Result<Vec<User>> {
        self.db.list_users()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_password_hash_and_verify() {
        let password = "test_password_123";
        let hash = hash_password(password).unwrap();

        assert!(verify_password(password, &hash).unwrap());
        assert!(!verify_password("wrong_password", &hash).unwrap());
    }

    #[test]
    fn test_role_ordering() {
        assert!(Role::Admin.allows(Role::Reader));
        assert!(Role::Admin.allows(Role::Creator));
        assert!(Role::Creator.allows(Role::Reader));
        assert!(!Role::Reader.allows(Role::Creator));
        assert!(!Role::Creator.allows(Role::Admin));
    }

    #[test]
    fn test_token_round_trip() {
        let db = Database::open_memory().unwrap();
        let auth = AuthService::new(db, "test-secret", 60);
        let user = auth.register("alice", "alice@example.com", "password").unwrap();

        let token = auth.issue_token(&user.username).unwrap();
        let loaded = auth.authenticate(&token).unwrap();
        assert_eq!(loaded.username, "alice");

        assert!(auth.authenticate("not-a-token").is_err());
    }
}
