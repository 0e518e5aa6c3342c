//! Authentication and authorization.
//!
//! Optional: with auth disabled every request is permitted (and reported as
//! unauthenticated admin). With auth enabled, users live in
//! `<data>/auth/users.json` with salted SHA-256 password hashes, and logins
//! mint opaque bearer tokens held in memory.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use axum::http::HeaderMap;
use base64::Engine as _;
use parking_lot::RwLock;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::audit;
use crate::error::{NornicError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Read,
    Write,
    Admin,
}

impl Role {
    pub fn parse(name: &str) -> Option<Role> {
        match name.to_ascii_lowercase().as_str() {
            "read" => Some(Role::Read),
            "write" => Some(Role::Write),
            "admin" => Some(Role::Admin),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Role::Read => "read",
            Role::Write => "write",
            Role::Admin => "admin",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    pub username: String,
    pub salt: String,
    pub password_hash: String,
    pub role: Role,
}

#[derive(Debug, Clone)]
struct Session {
    username: String,
    role: Role,
}

/// Authenticated request context.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub username: String,
    pub role: Role,
    pub authenticated: bool,
    /// False when no authenticator is configured; everything is permitted.
    pub enforced: bool,
}

impl AuthContext {
    pub fn require(&self, role: Role) -> Result<()> {
        if !self.enforced || self.role >= role {
            Ok(())
        } else {
            Err(NornicError::Forbidden(format!(
                "{} requires the {} role",
                self.username,
                role.name()
            )))
        }
    }

    pub fn is_admin(&self) -> bool {
        !self.enforced || self.role == Role::Admin
    }
}

#[derive(Default, Serialize, Deserialize)]
struct UserFile {
    users: Vec<UserRecord>,
}

pub struct Authenticator {
    enabled: bool,
    users: RwLock<BTreeMap<String, UserRecord>>,
    tokens: RwLock<HashMap<String, Session>>,
    path: Option<PathBuf>,
}

impl Authenticator {
    /// No-auth mode: everything is permitted.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            users: RwLock::new(BTreeMap::new()),
            tokens: RwLock::new(HashMap::new()),
            path: None,
        }
    }

    /// Auth mode backed by `<dir>/users.json`. A fresh store gets a default
    /// admin account that must be rotated.
    pub fn open(dir: &std::path::Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join("users.json");
        let mut users = BTreeMap::new();
        if path.exists() {
            let bytes = std::fs::read(&path)?;
            let file: UserFile = serde_json::from_slice(&bytes)
                .map_err(|e| NornicError::Corruption(format!("user store: {e}")))?;
            for user in file.users {
                users.insert(user.username.clone(), user);
            }
        }
        let authenticator = Self {
            enabled: true,
            users: RwLock::new(users),
            tokens: RwLock::new(HashMap::new()),
            path: Some(path),
        };
        if authenticator.users.read().is_empty() {
            warn!("user store empty; creating default admin/admin account, rotate it");
            authenticator.create_user("admin", "admin", Role::Admin)?;
        }
        Ok(authenticator)
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    fn persist(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let file = UserFile {
            users: self.users.read().values().cloned().collect(),
        };
        let json = serde_json::to_vec_pretty(&file)
            .map_err(|e| NornicError::Serialization(e.to_string()))?;
        let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        std::io::Write::write_all(&mut tmp, &json)?;
        tmp.persist(path).map_err(|e| NornicError::Io(e.error))?;
        Ok(())
    }

    /// Resolves the request's identity from `Authorization`. With auth
    /// disabled this always permits; with auth enabled, missing or bad
    /// credentials are 401.
    pub fn authenticate(&self, headers: &HeaderMap) -> Result<AuthContext> {
        if !self.enabled {
            return Ok(AuthContext {
                username: "anonymous".into(),
                role: Role::Admin,
                authenticated: false,
                enforced: false,
            });
        }
        let header = headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| NornicError::Unauthorized("missing credentials".into()))?;

        if let Some(token) = header.strip_prefix("Bearer ") {
            let tokens = self.tokens.read();
            let session = tokens
                .get(token.trim())
                .ok_or_else(|| NornicError::Unauthorized("unknown or expired token".into()))?;
            return Ok(AuthContext {
                username: session.username.clone(),
                role: session.role,
                authenticated: true,
                enforced: true,
            });
        }
        if let Some(encoded) = header.strip_prefix("Basic ") {
            let decoded = base64::engine::general_purpose::STANDARD
                .decode(encoded.trim())
                .map_err(|_| NornicError::Unauthorized("malformed Basic credentials".into()))?;
            let text = String::from_utf8(decoded)
                .map_err(|_| NornicError::Unauthorized("malformed Basic credentials".into()))?;
            let (username, password) = text
                .split_once(':')
                .ok_or_else(|| NornicError::Unauthorized("malformed Basic credentials".into()))?;
            let role = self.verify_password(username, password)?;
            return Ok(AuthContext {
                username: username.to_string(),
                role,
                authenticated: true,
                enforced: true,
            });
        }
        Err(NornicError::Unauthorized(
            "unsupported authorization scheme".into(),
        ))
    }

    fn verify_password(&self, username: &str, password: &str) -> Result<Role> {
        let users = self.users.read();
        let user = users.get(username).ok_or_else(|| {
            audit::auth_event(username, "login", false);
            NornicError::Unauthorized("unknown user or bad password".into())
        })?;
        if hash_password(&user.salt, password) != user.password_hash {
            audit::auth_event(username, "login", false);
            return Err(NornicError::Unauthorized(
                "unknown user or bad password".into(),
            ));
        }
        Ok(user.role)
    }

    /// Password login minting an opaque bearer token.
    pub fn login(&self, username: &str, password: &str) -> Result<(String, Role)> {
        let role = self.verify_password(username, password)?;
        let token: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(48)
            .map(char::from)
            .collect();
        self.tokens.write().insert(
            token.clone(),
            Session {
                username: username.to_string(),
                role,
            },
        );
        audit::auth_event(username, "login", true);
        Ok((token, role))
    }

    pub fn logout(&self, headers: &HeaderMap) {
        let Some(token) = headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|h| h.strip_prefix("Bearer "))
        else {
            return;
        };
        if let Some(session) = self.tokens.write().remove(token.trim()) {
            audit::auth_event(&session.username, "logout", true);
        }
    }

    pub fn create_user(&self, username: &str, password: &str, role: Role) -> Result<()> {
        if username.is_empty() || username.len() > 128 {
            return Err(NornicError::InvalidRequest("invalid username".into()));
        }
        {
            let mut users = self.users.write();
            if users.contains_key(username) {
                return Err(NornicError::InvalidRequest(format!(
                    "user {username} already exists"
                )));
            }
            let salt = random_salt();
            let record = UserRecord {
                username: username.to_string(),
                password_hash: hash_password(&salt, password),
                salt,
                role,
            };
            users.insert(username.to_string(), record);
        }
        self.persist()
    }

    pub fn update_user(
        &self,
        username: &str,
        password: Option<&str>,
        role: Option<Role>,
    ) -> Result<()> {
        {
            let mut users = self.users.write();
            let user = users
                .get_mut(username)
                .ok_or_else(|| NornicError::not_found("user", username))?;
            if let Some(password) = password {
                user.salt = random_salt();
                user.password_hash = hash_password(&user.salt, password);
            }
            if let Some(role) = role {
                user.role = role;
            }
        }
        // Old tokens keep the old role until logout; drop them instead.
        self.tokens
            .write()
            .retain(|_, session| session.username != username);
        self.persist()
    }

    pub fn delete_user(&self, username: &str) -> Result<()> {
        {
            let mut users = self.users.write();
            users
                .remove(username)
                .ok_or_else(|| NornicError::not_found("user", username))?;
        }
        self.tokens
            .write()
            .retain(|_, session| session.username != username);
        self.persist()
    }

    pub fn list_users(&self) -> Vec<(String, Role)> {
        self.users
            .read()
            .values()
            .map(|u| (u.username.clone(), u.role))
            .collect()
    }
}

fn random_salt() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(16)
        .map(char::from)
        .collect()
}

fn hash_password(salt: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(b":");
    hasher.update(password.as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(64);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_auth_permits_everything() {
        let auth = Authenticator::disabled();
        let ctx = auth.authenticate(&HeaderMap::new()).unwrap();
        assert!(!ctx.enforced);
        assert!(ctx.require(Role::Admin).is_ok());
    }

    #[test]
    fn login_round_trip_and_role_gate() -> Result<()> {
        let dir = tempfile::tempdir().expect("tmpdir");
        let auth = Authenticator::open(dir.path())?;
        auth.create_user("reader", "hunter2", Role::Read)?;
        let (token, role) = auth.login("reader", "hunter2")?;
        assert_eq!(role, Role::Read);

        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            format!("Bearer {token}").parse().unwrap(),
        );
        let ctx = auth.authenticate(&headers)?;
        assert!(ctx.require(Role::Read).is_ok());
        assert!(ctx.require(Role::Write).is_err());
        Ok(())
    }

    #[test]
    fn bad_password_is_unauthorized() -> Result<()> {
        let dir = tempfile::tempdir().expect("tmpdir");
        let auth = Authenticator::open(dir.path())?;
        assert!(matches!(
            auth.login("admin", "wrong"),
            Err(NornicError::Unauthorized(_))
        ));
        Ok(())
    }

    #[test]
    fn users_persist_across_reopen() -> Result<()> {
        let dir = tempfile::tempdir().expect("tmpdir");
        {
            let auth = Authenticator::open(dir.path())?;
            auth.create_user("alice", "secret", Role::Write)?;
        }
        let auth = Authenticator::open(dir.path())?;
        let (_, role) = auth.login("alice", "secret")?;
        assert_eq!(role, Role::Write);
        Ok(())
    }
}
