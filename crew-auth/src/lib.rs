#![deny(clippy::print_stdout, clippy::print_stderr)]

//! Authentication and role-based access: password and PIN login, JWT
//! access/refresh pairs with rotation, the shared-secret automation
//! channel, and user management.
//!
//! Handlers never see raw credentials. Every route depends on an
//! [`AuthCaller`] value carrying the resolved role and the channel the
//! request arrived on.

use argon2::Argon2;
use argon2::password_hash::PasswordHash;
use argon2::password_hash::PasswordHasher;
use argon2::password_hash::PasswordVerifier;
use argon2::password_hash::SaltString;
use argon2::password_hash::rand_core::OsRng;
use chrono::Utc;
use hmac::Hmac;
use hmac::Mac;
use jsonwebtoken::DecodingKey;
use jsonwebtoken::EncodingKey;
use jsonwebtoken::Header;
use jsonwebtoken::Validation;
use rusqlite::OptionalExtension;
use serde::Deserialize;
use serde::Serialize;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;
use uuid::Uuid;

use crew_audit::AuditOutcome;
use crew_store::Session;
use crew_store::now_rfc3339;

pub mod users;

pub use users::User;
pub use users::UserCreate;
pub use users::UserPatch;
pub use users::UserStatus;

pub type AuthResult<T> = Result<T, AuthError>;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("web access denied for this role")]
    AccessDeniedWeb,
    #[error("invalid or expired token")]
    TokenInvalid,
    #[error("admin secret header missing")]
    MissingAdminSecret,
    #[error("admin secret mismatch")]
    WrongAdminSecret,
    #[error("role not permitted: {0}")]
    ForbiddenRole(String),
    #[error("resource not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("hashing failure: {0}")]
    Hash(String),
    #[error("storage failure: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    Store(#[from] crew_store::StoreError),
    #[error(transparent)]
    Audit(#[from] crew_audit::AuditError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Foreman,
    Worker,
}

impl Role {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Foreman => "foreman",
            Role::Worker => "worker",
        }
    }

    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "admin" => Some(Role::Admin),
            "foreman" => Some(Role::Foreman),
            "worker" => Some(Role::Worker),
            _ => None,
        }
    }

    #[must_use]
    pub fn can_moderate(&self) -> bool {
        matches!(self, Role::Admin | Role::Foreman)
    }

    #[must_use]
    pub fn is_admin(&self) -> bool {
        matches!(self, Role::Admin)
    }
}

/// Where a request authenticated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Web,
    Bot,
    Automation,
}

impl Channel {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Web => "web",
            Channel::Bot => "bot",
            Channel::Automation => "automation",
        }
    }

    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "web" => Some(Channel::Web),
            "bot" => Some(Channel::Bot),
            "automation" => Some(Channel::Automation),
            _ => None,
        }
    }
}

/// The authenticated caller every handler depends on, regardless of which
/// credential flavour produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthCaller {
    pub user_id: Option<i64>,
    pub name: String,
    pub role: Role,
    pub channel: Channel,
}

impl AuthCaller {
    /// The caller value minted by a valid `X-Admin-Secret` header.
    #[must_use]
    pub fn automation() -> Self {
        Self {
            user_id: None,
            name: "internal-automation".into(),
            role: Role::Admin,
            channel: Channel::Automation,
        }
    }

    pub fn require_admin(&self) -> AuthResult<()> {
        if self.role.is_admin() {
            Ok(())
        } else {
            Err(AuthError::ForbiddenRole(self.role.as_str().into()))
        }
    }

    pub fn require_moderator(&self) -> AuthResult<()> {
        if self.role.can_moderate() {
            Ok(())
        } else {
            Err(AuthError::ForbiddenRole(self.role.as_str().into()))
        }
    }
}

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub jwt_secret: String,
    pub admin_secret: String,
    pub access_ttl_secs: i64,
    pub refresh_ttl_secs: i64,
}

impl AuthConfig {
    #[must_use]
    pub fn new(jwt_secret: impl Into<String>, admin_secret: impl Into<String>) -> Self {
        Self {
            jwt_secret: jwt_secret.into(),
            admin_secret: admin_secret.into(),
            access_ttl_secs: 900,
            refresh_ttl_secs: 7 * 24 * 60 * 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    pub expires_in: i64,
    pub role: Role,
    pub user_id: i64,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub telegram_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: i64,
    pub name: String,
    pub role: String,
    pub channel: String,
    pub typ: String,
    pub jti: String,
    pub iat: i64,
    pub exp: i64,
}

/// Argon2id hash for passwords and PINs.
pub fn hash_secret(secret: &str) -> AuthResult<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(secret.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|err| AuthError::Hash(err.to_string()))
}

/// Verifies a candidate against a stored Argon2 hash. Malformed stored
/// hashes verify as false rather than erroring.
#[must_use]
pub fn verify_secret(stored: &str, candidate: &str) -> bool {
    PasswordHash::new(stored)
        .map(|parsed| {
            Argon2::default()
                .verify_password(candidate.as_bytes(), &parsed)
                .is_ok()
        })
        .unwrap_or(false)
}

/// Deterministic PIN lookup fingerprint. Only locates the credential row;
/// the Argon2 hash is still verified afterwards.
pub fn pin_fingerprint(config: &AuthConfig, pin: &str) -> AuthResult<String> {
    let mut mac = Hmac::<Sha256>::new_from_slice(config.jwt_secret.as_bytes())
        .map_err(|err| AuthError::Hash(err.to_string()))?;
    mac.update(pin.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Password login over the web channel. Workers are denied here regardless
/// of whether the password is correct.
pub fn login_password(
    session: &mut Session,
    config: &AuthConfig,
    username: &str,
    password: &str,
) -> AuthResult<TokenResponse> {
    let user = users::find_by_name(session.conn(), username)?
        .ok_or(AuthError::InvalidCredentials)?;
    if user.role == Role::Worker {
        return Err(AuthError::AccessDeniedWeb);
    }
    if user.status != UserStatus::Active {
        return Err(AuthError::InvalidCredentials);
    }
    let stored: Option<String> = session
        .conn()
        .query_row(
            "SELECT password_hash FROM auth_credentials WHERE user_id = ?1",
            [user.id],
            |row| row.get(0),
        )
        .optional()?
        .flatten();
    let stored = stored.ok_or(AuthError::InvalidCredentials)?;
    if !verify_secret(&stored, password) {
        return Err(AuthError::InvalidCredentials);
    }
    issue_pair(session, config, &user, Channel::Web)
}

/// PIN login over the bot channel.
pub fn login_pin(
    session: &mut Session,
    config: &AuthConfig,
    pin_code: &str,
) -> AuthResult<TokenResponse> {
    if pin_code.trim().is_empty() {
        return Err(AuthError::InvalidCredentials);
    }
    let fingerprint = pin_fingerprint(config, pin_code)?;
    let row: Option<(i64, Option<String>)> = session
        .conn()
        .query_row(
            "SELECT user_id, pin_hash FROM auth_credentials WHERE pin_fingerprint = ?1",
            [&fingerprint],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    let (user_id, pin_hash) = row.ok_or(AuthError::InvalidCredentials)?;
    let pin_hash = pin_hash.ok_or(AuthError::InvalidCredentials)?;
    if !verify_secret(&pin_hash, pin_code) {
        return Err(AuthError::InvalidCredentials);
    }
    let user = users::get(session.conn(), user_id)?;
    if user.status != UserStatus::Active {
        return Err(AuthError::InvalidCredentials);
    }
    issue_pair(session, config, &user, Channel::Bot)
}

/// Rotates a refresh token: the presented jti is revoked in the same
/// transaction that records the replacement.
pub fn refresh(
    session: &mut Session,
    config: &AuthConfig,
    refresh_token: &str,
) -> AuthResult<TokenResponse> {
    let claims = decode_claims(config, refresh_token)?;
    if claims.typ != "refresh" {
        return Err(AuthError::TokenInvalid);
    }
    let usable: Option<(i64, String)> = session
        .conn()
        .query_row(
            "SELECT user_id, expires_at FROM refresh_tokens WHERE jti = ?1 AND revoked = 0",
            [&claims.jti],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    let (user_id, expires_at) = usable.ok_or(AuthError::TokenInvalid)?;
    if crew_store::parse_ts(&expires_at) <= Utc::now() {
        return Err(AuthError::TokenInvalid);
    }
    session.conn().execute(
        "UPDATE refresh_tokens SET revoked = 1 WHERE jti = ?1",
        [&claims.jti],
    )?;

    let user = users::get(session.conn(), user_id)?;
    if user.status != UserStatus::Active {
        return Err(AuthError::TokenInvalid);
    }
    let channel = Channel::parse(&claims.channel).unwrap_or(Channel::Web);
    issue_pair(session, config, &user, channel)
}

/// Decodes an access token into the caller value.
pub fn verify_access(config: &AuthConfig, token: &str) -> AuthResult<AuthCaller> {
    let claims = decode_claims(config, token)?;
    if claims.typ != "access" {
        return Err(AuthError::TokenInvalid);
    }
    let role = Role::parse(&claims.role).ok_or(AuthError::TokenInvalid)?;
    let channel = Channel::parse(&claims.channel).ok_or(AuthError::TokenInvalid)?;
    Ok(AuthCaller {
        user_id: Some(claims.sub),
        name: claims.name,
        role,
        channel,
    })
}

/// Constant-time check of the automation header.
pub fn caller_from_admin_secret(
    config: &AuthConfig,
    header: Option<&str>,
) -> AuthResult<AuthCaller> {
    let presented = header.ok_or(AuthError::MissingAdminSecret)?;
    let matches: bool = presented
        .as_bytes()
        .ct_eq(config.admin_secret.as_bytes())
        .into();
    if !matches {
        return Err(AuthError::WrongAdminSecret);
    }
    Ok(AuthCaller::automation())
}

fn issue_pair(
    session: &mut Session,
    config: &AuthConfig,
    user: &User,
    channel: Channel,
) -> AuthResult<TokenResponse> {
    let now = Utc::now().timestamp();
    let access_claims = Claims {
        sub: user.id,
        name: user.name.clone(),
        role: user.role.as_str().into(),
        channel: channel.as_str().into(),
        typ: "access".into(),
        jti: Uuid::new_v4().to_string(),
        iat: now,
        exp: now + config.access_ttl_secs,
    };
    let refresh_jti = Uuid::new_v4().to_string();
    let refresh_claims = Claims {
        typ: "refresh".into(),
        jti: refresh_jti.clone(),
        exp: now + config.refresh_ttl_secs,
        ..access_claims.clone()
    };

    let key = EncodingKey::from_secret(config.jwt_secret.as_bytes());
    let access_token = jsonwebtoken::encode(&Header::default(), &access_claims, &key)
        .map_err(|err| AuthError::Hash(err.to_string()))?;
    let refresh_token = jsonwebtoken::encode(&Header::default(), &refresh_claims, &key)
        .map_err(|err| AuthError::Hash(err.to_string()))?;

    let refresh_expiry = Utc::now() + chrono::Duration::seconds(config.refresh_ttl_secs);
    session.conn().execute(
        "INSERT INTO refresh_tokens (jti, user_id, expires_at, created_at)
         VALUES (?1, ?2, ?3, ?4)",
        rusqlite::params![refresh_jti, user.id, refresh_expiry.to_rfc3339(), now_rfc3339()],
    )?;
    session.conn().execute(
        "UPDATE auth_credentials SET last_login = ?2, updated_at = ?2 WHERE user_id = ?1",
        rusqlite::params![user.id, now_rfc3339()],
    )?;
    session.mark_mutation()?;
    crew_audit::append(
        session,
        &user.name,
        "auth.login",
        "user",
        Some(user.id),
        &serde_json::json!({"channel": channel.as_str(), "role": user.role.as_str()}),
        AuditOutcome::Applied,
        None,
    )?;
    session.queue_metric(
        "auth.login",
        serde_json::json!({"user_id": user.id, "channel": channel.as_str()}),
    );

    Ok(TokenResponse {
        access_token,
        refresh_token,
        token_type: "Bearer".into(),
        expires_in: config.access_ttl_secs,
        role: user.role,
        user_id: user.id,
        name: user.name.clone(),
        telegram_id: user.telegram_id,
    })
}

fn decode_claims(config: &AuthConfig, token: &str) -> AuthResult<Claims> {
    let mut validation = Validation::default();
    validation.leeway = 0;
    validation.validate_exp = true;
    jsonwebtoken::decode::<Claims>(
        token,
        &DecodingKey::from_secret(config.jwt_secret.as_bytes()),
        &validation,
    )
    .map(|data| data.claims)
    .map_err(|_| AuthError::TokenInvalid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crew_metrics::MetricsSink;
    use crew_store::SessionMode;
    use crew_store::Store;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn setup(dir: &TempDir) -> (Store, Arc<MetricsSink>, AuthConfig) {
        let store = Store::open(dir.path().join("crew.db")).expect("open store");
        store.migrate().expect("migrate");
        let metrics = Arc::new(MetricsSink::new(dir.path().join("metrics")));
        let config = AuthConfig::new("unit-test-jwt-secret", "unit-test-admin-secret");
        (store, metrics, config)
    }

    fn seed_user(
        store: &Store,
        metrics: &Arc<MetricsSink>,
        config: &AuthConfig,
        name: &str,
        role: Role,
        password: Option<&str>,
        pin: Option<&str>,
    ) -> User {
        let mut session = store
            .session(SessionMode::ReadWrite, Arc::clone(metrics))
            .expect("session");
        let user = users::create(
            &mut session,
            config,
            "seed",
            UserCreate {
                name: name.into(),
                telegram_id: None,
                role,
                daily_rate: None,
                password: password.map(Into::into),
                pin_code: pin.map(Into::into),
            },
        )
        .expect("create user");
        session.commit().expect("commit");
        user
    }

    #[test]
    fn password_login_issues_bearer_pair() {
        let dir = TempDir::new().expect("temp dir");
        let (store, metrics, config) = setup(&dir);
        seed_user(
            &store,
            &metrics,
            &config,
            "boss",
            Role::Admin,
            Some("s3cret!"),
            None,
        );

        let mut session = store
            .session(SessionMode::ReadWrite, Arc::clone(&metrics))
            .expect("session");
        let tokens = login_password(&mut session, &config, "boss", "s3cret!")
            .expect("login");
        session.commit().expect("commit");

        assert_eq!(tokens.token_type, "Bearer");
        assert_eq!(tokens.expires_in, 900);
        assert_eq!(tokens.role, Role::Admin);

        let caller = verify_access(&config, &tokens.access_token).expect("verify");
        assert_eq!(caller.role, Role::Admin);
        assert_eq!(caller.channel, Channel::Web);
        assert_eq!(caller.name, "boss");
    }

    #[test]
    fn wrong_password_is_invalid_credentials() {
        let dir = TempDir::new().expect("temp dir");
        let (store, metrics, config) = setup(&dir);
        seed_user(
            &store,
            &metrics,
            &config,
            "boss",
            Role::Admin,
            Some("s3cret!"),
            None,
        );

        let mut session = store
            .session(SessionMode::ReadWrite, metrics)
            .expect("session");
        assert!(matches!(
            login_password(&mut session, &config, "boss", "wrong"),
            Err(AuthError::InvalidCredentials)
        ));
    }

    #[test]
    fn worker_on_web_channel_is_denied_even_with_valid_password() {
        let dir = TempDir::new().expect("temp dir");
        let (store, metrics, config) = setup(&dir);
        seed_user(
            &store,
            &metrics,
            &config,
            "mosh",
            Role::Worker,
            Some("pw-ok"),
            None,
        );

        let mut session = store
            .session(SessionMode::ReadWrite, metrics)
            .expect("session");
        assert!(matches!(
            login_password(&mut session, &config, "mosh", "pw-ok"),
            Err(AuthError::AccessDeniedWeb)
        ));
        assert!(matches!(
            login_password(&mut session, &config, "mosh", "bad"),
            Err(AuthError::AccessDeniedWeb)
        ));
    }

    #[test]
    fn pin_login_authenticates_workers_on_bot_channel() {
        let dir = TempDir::new().expect("temp dir");
        let (store, metrics, config) = setup(&dir);
        seed_user(
            &store,
            &metrics,
            &config,
            "mosh",
            Role::Worker,
            None,
            Some("442211"),
        );

        let mut session = store
            .session(SessionMode::ReadWrite, Arc::clone(&metrics))
            .expect("session");
        let tokens = login_pin(&mut session, &config, "442211").expect("pin login");
        session.commit().expect("commit");

        let caller = verify_access(&config, &tokens.access_token).expect("verify");
        assert_eq!(caller.channel, Channel::Bot);
        assert_eq!(caller.role, Role::Worker);

        let mut session = store
            .session(SessionMode::ReadWrite, metrics)
            .expect("session");
        assert!(matches!(
            login_pin(&mut session, &config, "000000"),
            Err(AuthError::InvalidCredentials)
        ));
    }

    #[test]
    fn refresh_rotates_and_revokes_the_old_token() {
        let dir = TempDir::new().expect("temp dir");
        let (store, metrics, config) = setup(&dir);
        seed_user(
            &store,
            &metrics,
            &config,
            "boss",
            Role::Admin,
            Some("s3cret!"),
            None,
        );

        let mut session = store
            .session(SessionMode::ReadWrite, Arc::clone(&metrics))
            .expect("session");
        let first = login_password(&mut session, &config, "boss", "s3cret!")
            .expect("login");
        session.commit().expect("commit");

        let mut session = store
            .session(SessionMode::ReadWrite, Arc::clone(&metrics))
            .expect("session");
        let second = refresh(&mut session, &config, &first.refresh_token)
            .expect("refresh");
        session.commit().expect("commit");
        assert!(second.refresh_token != first.refresh_token);

        // The rotated-out token is dead.
        let mut session = store
            .session(SessionMode::ReadWrite, metrics)
            .expect("session");
        assert!(matches!(
            refresh(&mut session, &config, &first.refresh_token),
            Err(AuthError::TokenInvalid)
        ));
    }

    #[test]
    fn access_token_is_rejected_where_refresh_is_expected() {
        let dir = TempDir::new().expect("temp dir");
        let (store, metrics, config) = setup(&dir);
        seed_user(
            &store,
            &metrics,
            &config,
            "boss",
            Role::Admin,
            Some("s3cret!"),
            None,
        );

        let mut session = store
            .session(SessionMode::ReadWrite, Arc::clone(&metrics))
            .expect("session");
        let tokens = login_password(&mut session, &config, "boss", "s3cret!")
            .expect("login");
        session.commit().expect("commit");

        let mut session = store
            .session(SessionMode::ReadWrite, metrics)
            .expect("session");
        assert!(matches!(
            refresh(&mut session, &config, &tokens.access_token),
            Err(AuthError::TokenInvalid)
        ));
    }

    #[test]
    fn admin_secret_distinguishes_missing_from_wrong() {
        let config = AuthConfig::new("jwt", "the-secret");
        assert!(matches!(
            caller_from_admin_secret(&config, None),
            Err(AuthError::MissingAdminSecret)
        ));
        assert!(matches!(
            caller_from_admin_secret(&config, Some("nope")),
            Err(AuthError::WrongAdminSecret)
        ));
        let caller = caller_from_admin_secret(&config, Some("the-secret")).expect("caller");
        assert_eq!(caller.role, Role::Admin);
        assert_eq!(caller.channel, Channel::Automation);
        assert_eq!(caller.user_id, None);
    }

    #[test]
    fn secret_hashing_round_trips() {
        let hash = hash_secret("pin-1234").expect("hash");
        assert!(verify_secret(&hash, "pin-1234"));
        assert!(!verify_secret(&hash, "pin-4321"));
        assert!(!verify_secret("not-a-phc-string", "pin-1234"));
    }
}
