use std::ops::Add;
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::{FromRequest, Multipart, RequestParts};
use axum::headers::{Cookie, HeaderMapExt};
use axum::http::HeaderMap;
use axum::{Extension, Json};
use chrono::{DateTime, Duration, Utc};
use pbkdf2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use pbkdf2::Pbkdf2;
use rand::{thread_rng, Rng};
use rand_core::OsRng;
use serde::{Deserialize, Serialize, Serializer};
use sha2::{Digest, Sha256};
use sqlx::PgPool;
use uuid::Uuid;

use crate::config::Config;
use crate::face::{self, encode_face, SharedEncoder};
use crate::io::UploadForm;
use crate::models::{Role, UserData, UserSession};
use crate::{breaks, proceeds, settle, Error, Payload};

pub const SESSION_COOKIE: &str = "ssid";
pub const SESSION_HEADER: &str = "x-session-id";

#[derive(Debug, Clone, Eq, Ord, PartialOrd, PartialEq)]
pub enum AuthResult {
    Success,
    SessionExpired,
    InvalidSession,
}

impl Serialize for AuthResult {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{:?}", self))
    }
}

fn not_authenticated(auth_result: AuthResult) -> Error {
    let message = match auth_result {
        AuthResult::SessionExpired => "Session expired, please login again",
        _ => "Please login first",
    };
    Error::NotAuthenticated {
        auth_result,
        message: message.to_string(),
    }
}

/// The session id travels either in the `x-session-id` header or the
/// `ssid` cookie; the header wins.
pub fn session_id_from(headers: &HeaderMap) -> Option<String> {
    if let Some(value) = headers.get(SESSION_HEADER).and_then(|v| v.to_str().ok()) {
        return Some(value.trim().to_string());
    }
    headers
        .typed_get::<Cookie>()
        .and_then(|cookie| cookie.get(SESSION_COOKIE).map(str::to_string))
}

pub async fn ensure_authenticated(
    session_id: Option<&str>,
    pg: &PgPool,
) -> Result<UserSession, Error> {
    let ssid = match session_id {
        Some(ssid) if !ssid.is_empty() => ssid,
        _ => return Err(not_authenticated(AuthResult::InvalidSession)),
    };

    let session = sqlx::query_as::<_, UserSession>(
        "SELECT ssid, belongs_to, role, expires_at FROM user_sessions WHERE ssid = $1 LIMIT 1",
    )
    .bind(ssid)
    .fetch_optional(pg)
    .await?;

    match session {
        Some(session) if Utc::now() > session.expires_at => {
            sqlx::query("DELETE FROM user_sessions WHERE ssid = $1")
                .bind(ssid)
                .execute(pg)
                .await?;
            Err(not_authenticated(AuthResult::SessionExpired))
        }
        Some(session) => Ok(session),
        None => Err(not_authenticated(AuthResult::InvalidSession)),
    }
}

async fn session_with_role<B: Send>(
    req: &mut RequestParts<B>,
    allowed: &[Role],
    denied: &str,
) -> Result<UserSession, Error> {
    let ssid = session_id_from(req.headers());
    let pg = req
        .extensions()
        .get::<PgPool>()
        .cloned()
        .ok_or_else(|| Error::InternalError {
            kind: "ConfigurationError",
            message: "database pool is not installed".to_string(),
        })?;
    let session = ensure_authenticated(ssid.as_deref(), &pg).await?;
    if !allowed.contains(&session.role) {
        return Err(Error::forbidden(denied));
    }
    Ok(session)
}

/// Any live session, parents included.
pub struct AnySession(pub UserSession);

/// A logged-in teacher or student.
pub struct Authed {
    pub user_id: Uuid,
    pub role: Role,
}

pub struct Teacher(pub Uuid);

pub struct Student(pub Uuid);

/// A parent session; the id is the child's.
pub struct Parent(pub Uuid);

#[async_trait]
impl<B: Send> FromRequest<B> for AnySession {
    type Rejection = Error;

    async fn from_request(req: &mut RequestParts<B>) -> Result<Self, Self::Rejection> {
        session_with_role(req, &[Role::Teacher, Role::Student, Role::Parent], "")
            .await
            .map(AnySession)
    }
}

#[async_trait]
impl<B: Send> FromRequest<B> for Authed {
    type Rejection = Error;

    async fn from_request(req: &mut RequestParts<B>) -> Result<Self, Self::Rejection> {
        let session = session_with_role(
            req,
            &[Role::Teacher, Role::Student],
            "Student or teacher access required",
        )
        .await?;
        Ok(Authed {
            user_id: session.belongs_to,
            role: session.role,
        })
    }
}

#[async_trait]
impl<B: Send> FromRequest<B> for Teacher {
    type Rejection = Error;

    async fn from_request(req: &mut RequestParts<B>) -> Result<Self, Self::Rejection> {
        let session = session_with_role(req, &[Role::Teacher], "Teacher access required").await?;
        Ok(Teacher(session.belongs_to))
    }
}

#[async_trait]
impl<B: Send> FromRequest<B> for Student {
    type Rejection = Error;

    async fn from_request(req: &mut RequestParts<B>) -> Result<Self, Self::Rejection> {
        let session = session_with_role(req, &[Role::Student], "Student access required").await?;
        Ok(Student(session.belongs_to))
    }
}

#[async_trait]
impl<B: Send> FromRequest<B> for Parent {
    type Rejection = Error;

    async fn from_request(req: &mut RequestParts<B>) -> Result<Self, Self::Rejection> {
        let session = session_with_role(req, &[Role::Parent], "Parent access required").await?;
        Ok(Parent(session.belongs_to))
    }
}

pub fn hash_password(password: &str) -> Result<String, Error> {
    Ok(Pbkdf2
        .hash_password(password.as_bytes(), &SaltString::generate(&mut OsRng))?
        .to_string())
}

pub fn verify_password(hash: &str, password: &str) -> Result<bool, Error> {
    let hash = PasswordHash::new(hash)?;
    Ok(Pbkdf2.verify_password(password.as_bytes(), &hash).is_ok())
}

fn new_session_id() -> String {
    let ssid_bytes: [u8; 32] = thread_rng().gen();

    let mut hasher: Sha256 = Digest::new();
    hasher.update(&ssid_bytes);
    let result = hasher.finalize();
    hex::encode(result)
}

/// Hands back the caller's live session for `role`, or opens a new one.
pub async fn open_session(
    pg: &PgPool,
    user_id: Uuid,
    role: Role,
    ttl_hours: i64,
) -> Result<OpenedSession, Error> {
    let existing = sqlx::query_as::<_, UserSession>(
        "SELECT ssid, belongs_to, role, expires_at FROM user_sessions \
         WHERE belongs_to = $1 AND role = $2 AND expires_at > now() LIMIT 1",
    )
    .bind(user_id)
    .bind(role)
    .fetch_optional(pg)
    .await?;

    if let Some(existing) = existing {
        // already authenticated
        return Ok(OpenedSession {
            session_id: existing.ssid,
            user_id: existing.belongs_to,
            role: existing.role,
            expires_at: existing.expires_at,
        });
    }

    let ssid = new_session_id();
    let expires_at = Utc::now().add(Duration::hours(ttl_hours));
    let res = sqlx::query(
        "INSERT INTO user_sessions (ssid, belongs_to, role, expires_at) VALUES ($1, $2, $3, $4)",
    )
    .bind(&ssid)
    .bind(user_id)
    .bind(role)
    .bind(expires_at)
    .execute(pg)
    .await?;

    if res.rows_affected() < 1 {
        return Err(Error::InternalError {
            kind: "DatabaseError",
            message: "Could not update session ids!".to_string(),
        });
    }

    Ok(OpenedSession {
        session_id: ssid,
        user_id,
        role,
        expires_at,
    })
}

pub async fn register_user(
    Extension(pg): Extension<PgPool>,
    Json(user): Json<CreateUser>,
) -> Payload<CreatedUser> {
    if user.username.trim().is_empty() || user.password.is_empty() {
        return breaks(Error::MissingCredentials {
            message: "Username and password are required".to_string(),
        });
    }
    if user.role == Role::Parent {
        return breaks(Error::invalid(
            "Parents sign in with the student's roll number",
        ));
    }

    let taken: Option<Uuid> = sqlx::query_scalar("SELECT uuid FROM users WHERE username = $1")
        .bind(user.username.trim())
        .fetch_optional(&pg)
        .await?;
    if taken.is_some() {
        return breaks(Error::UserAlreadyExists {
            message: "Username already exists".to_string(),
        });
    }

    let uuid = Uuid::new_v4();
    sqlx::query(
        "INSERT INTO users (uuid, role, username, password_hash, email, full_name) \
         VALUES ($1, $2, $3, $4, $5, $6)",
    )
    .bind(uuid)
    .bind(user.role)
    .bind(user.username.trim())
    .bind(hash_password(&user.password)?)
    .bind(&user.email)
    .bind(&user.full_name)
    .execute(&pg)
    .await?;

    log::info!("Registered {} `{}`", user.role.as_str(), user.username.trim());
    proceeds(CreatedUser {
        user_id: uuid,
        role: user.role,
    })
}

pub async fn login_user(
    Extension(pg): Extension<PgPool>,
    Extension(config): Extension<Arc<Config>>,
    Json(login): Json<LoginUser>,
) -> Payload<LoggedIn> {
    if login.username.is_empty() || login.password.is_empty() {
        return breaks(Error::MissingCredentials {
            message: "Username and password are required".to_string(),
        });
    }

    let user = sqlx::query_as::<_, UserData>(
        "SELECT * FROM users WHERE username = $1 AND role = $2 LIMIT 1",
    )
    .bind(&login.username)
    .bind(login.role)
    .fetch_optional(&pg)
    .await?;

    let user = match user {
        Some(user) if verify_password(&user.password_hash, &login.password)? => user,
        _ => {
            return breaks(Error::AuthenticationFailure {
                message: "Invalid username or password".to_string(),
            })
        }
    };

    let session = open_session(&pg, user.uuid, user.role, config.session_ttl_hours).await?;
    proceeds(LoggedIn {
        face_registered: user.face_registered(),
        full_name: user.full_name,
        session,
    })
}

pub async fn login_with_face(
    Extension(pg): Extension<PgPool>,
    Extension(config): Extension<Arc<Config>>,
    Extension(encoder): Extension<SharedEncoder>,
    multipart: Multipart,
) -> Payload<LoggedIn> {
    settle(face_login(&pg, &config, &encoder, multipart).await)
}

async fn face_login(
    pg: &PgPool,
    config: &Config,
    encoder: &SharedEncoder,
    multipart: Multipart,
) -> Result<LoggedIn, Error> {
    let mut form = UploadForm::read(multipart, config.max_upload_bytes).await?;
    let image = form.take_image("face_image", config.max_upload_bytes)?;

    let rows: Vec<(Uuid, Role, Vec<u8>)> = sqlx::query_as(
        "SELECT uuid, role, face_encoding FROM users \
         WHERE face_encoding IS NOT NULL ORDER BY created_at, uuid",
    )
    .fetch_all(pg)
    .await?;
    if rows.is_empty() {
        return Err(Error::FaceNotRecognized {
            message: "No registered users found".to_string(),
            needs_registration: false,
        });
    }

    let sample = encode_face(encoder.as_ref(), &image, config.face.encoding_len).await?;
    let candidates = face::decode_candidates(
        rows.into_iter()
            .map(|(uuid, role, bytes)| ((uuid, role), bytes)),
    );

    let found = face::nearest(&sample, &candidates, config.face.tolerance).ok_or_else(|| {
        Error::FaceNotRecognized {
            message: "Face not recognized. Please use password login.".to_string(),
            needs_registration: false,
        }
    })?;
    let (user_id, role) = found.id;

    let user = sqlx::query_as::<_, UserData>("SELECT * FROM users WHERE uuid = $1")
        .bind(user_id)
        .fetch_one(pg)
        .await?;
    log::info!(
        "Face login for {} (distance {:.4})",
        user.username,
        found.distance
    );

    let session = open_session(pg, user_id, role, config.session_ttl_hours).await?;
    Ok(LoggedIn {
        face_registered: true,
        full_name: user.full_name,
        session,
    })
}

pub async fn login_parent(
    Extension(pg): Extension<PgPool>,
    Extension(config): Extension<Arc<Config>>,
    Json(login): Json<LoginParent>,
) -> Payload<LoggedIn> {
    let roll_number = login.roll_number.trim();
    if roll_number.is_empty() || login.parent_password.is_empty() {
        return breaks(Error::MissingCredentials {
            message: "Roll Number and Password are required".to_string(),
        });
    }

    let student = sqlx::query_as::<_, UserData>(
        "SELECT * FROM users WHERE role = 'student' AND roll_number = $1 LIMIT 1",
    )
    .bind(roll_number)
    .fetch_optional(&pg)
    .await?;

    let student = match student {
        Some(student) => student,
        None => {
            return breaks(Error::AuthenticationFailure {
                message: "Invalid Roll Number or Password".to_string(),
            })
        }
    };
    let matches = match &student.parent_password_hash {
        Some(hash) => verify_password(hash, &login.parent_password)?,
        None => false,
    };
    if !matches {
        return breaks(Error::AuthenticationFailure {
            message: "Invalid Roll Number or Password".to_string(),
        });
    }

    let session = open_session(&pg, student.uuid, Role::Parent, config.session_ttl_hours).await?;
    proceeds(LoggedIn {
        face_registered: student.face_registered(),
        full_name: student.full_name,
        session,
    })
}

pub async fn drop_session(
    AnySession(session): AnySession,
    Extension(pg): Extension<PgPool>,
) -> Payload<SessionDropped> {
    let affected = sqlx::query("DELETE FROM user_sessions WHERE ssid = $1 AND belongs_to = $2")
        .bind(&session.ssid)
        .bind(session.belongs_to)
        .execute(&pg)
        .await?;

    proceeds(SessionDropped {
        user_id: session.belongs_to,
        drop_success: affected.rows_affected() >= 1,
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionDropped {
    pub user_id: Uuid,
    pub drop_success: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenedSession {
    pub session_id: String,
    pub user_id: Uuid,
    pub role: Role,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoggedIn {
    #[serde(flatten)]
    pub session: OpenedSession,
    pub full_name: String,
    pub face_registered: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreatedUser {
    pub user_id: Uuid,
    pub role: Role,
}

fn student_role() -> Role {
    Role::Student
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoginUser {
    pub username: String,
    pub password: String,
    #[serde(default = "student_role")]
    pub role: Role,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoginParent {
    pub roll_number: String,
    pub parent_password: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateUser {
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub full_name: String,
    #[serde(default = "student_role")]
    pub role: Role,
}
