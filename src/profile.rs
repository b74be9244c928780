use std::sync::Arc;

use axum::extract::Multipart;
use axum::{Extension, Json};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::auth::{hash_password, Authed};
use crate::config::Config;
use crate::face::{self, encode_face, Embedding, SharedEncoder};
use crate::io::{allowed_file, create_io_file, encoding_backup_path, sanitize_file_name, UploadForm};
use crate::models::{Role, UserData};
use crate::{proceeds, settle, Error, Payload};

const MIN_PARENT_PASSWORD: usize = 6;

async fn load_user(pg: &PgPool, user_id: Uuid) -> Result<UserData, Error> {
    sqlx::query_as::<_, UserData>("SELECT * FROM users WHERE uuid = $1")
        .bind(user_id)
        .fetch_optional(pg)
        .await?
        .ok_or_else(|| Error::UserDoesNotExist {
            message: "Account no longer exists".to_string(),
        })
}

pub async fn read_profile(user: Authed, Extension(pg): Extension<PgPool>) -> Payload<Profile> {
    let data = load_user(&pg, user.user_id).await?;
    proceeds(Profile::from(data))
}

pub async fn update_profile(
    user: Authed,
    Extension(pg): Extension<PgPool>,
    Json(body): Json<UpdateProfile>,
) -> Payload<Profile> {
    let full_name = body.full_name.trim();
    if full_name.is_empty() {
        return Err(Error::invalid("Full name is required"));
    }
    let email = body.email.trim();
    let phone = non_empty(body.phone.as_deref());

    let data = match user.role {
        Role::Student => {
            let parent_hash = match parent_password(
                body.parent_password.as_deref(),
                body.parent_password_confirm.as_deref(),
            )? {
                Some(password) => Some(hash_password(password)?),
                None => None,
            };
            sqlx::query_as::<_, UserData>(
                "UPDATE users SET full_name = $2, email = $3, phone = $4, roll_number = $5, \
                 parent_password_hash = COALESCE($6, parent_password_hash) \
                 WHERE uuid = $1 RETURNING *",
            )
            .bind(user.user_id)
            .bind(full_name)
            .bind(email)
            .bind(phone)
            .bind(non_empty(body.roll_number.as_deref()))
            .bind(parent_hash)
            .fetch_one(&pg)
            .await?
        }
        _ => {
            sqlx::query_as::<_, UserData>(
                "UPDATE users SET full_name = $2, email = $3, phone = $4 WHERE uuid = $1 RETURNING *",
            )
            .bind(user.user_id)
            .bind(full_name)
            .bind(email)
            .bind(phone)
            .fetch_one(&pg)
            .await?
        }
    };
    log::info!("Profile of {} updated", data.username);
    proceeds(Profile::from(data))
}

/// Returns the parent password to store, if one was supplied and is acceptable.
pub fn parent_password<'a>(
    password: Option<&'a str>,
    confirm: Option<&str>,
) -> Result<Option<&'a str>, Error> {
    let password = match password {
        Some(p) if !p.is_empty() => p,
        _ => return Ok(None),
    };
    if Some(password) != confirm {
        return Err(Error::invalid("Parent passwords do not match"));
    }
    if password.chars().count() < MIN_PARENT_PASSWORD {
        return Err(Error::invalid(format!(
            "Parent password must be at least {} characters",
            MIN_PARENT_PASSWORD
        )));
    }
    Ok(Some(password))
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

pub async fn upload_profile_image(
    user: Authed,
    Extension(pg): Extension<PgPool>,
    Extension(config): Extension<Arc<Config>>,
    multipart: Multipart,
) -> Payload<ProfileImage> {
    let mut form = UploadForm::read(multipart, config.max_upload_bytes).await?;
    let upload = form
        .take_file("profile_image")
        .filter(|f| !f.file_name.is_empty() && !f.bytes.is_empty())
        .ok_or_else(|| Error::invalid("No image provided"))?;
    if !allowed_file(&upload.file_name) {
        return Err(Error::invalid("Only png, jpg, jpeg and gif images are accepted"));
    }

    let file_name = profile_file_name(user.user_id, Utc::now().timestamp(), &upload.file_name);
    let mut file = create_io_file(config.uploads_dir().join(&file_name)).await?;
    file.write_all(&upload.bytes).await?;
    file.flush().await?;

    let profile_image = format!("uploads/profiles/{}", file_name);
    sqlx::query("UPDATE users SET profile_image = $2 WHERE uuid = $1")
        .bind(user.user_id)
        .bind(&profile_image)
        .execute(&pg)
        .await?;
    log::info!("Stored profile image {} for {}", file_name, user.user_id);
    proceeds(ProfileImage { profile_image })
}

pub fn profile_file_name(user_id: Uuid, timestamp: i64, original: &str) -> String {
    sanitize_file_name(&format!("{}_{}_{}", user_id, timestamp, original))
}

pub async fn register_face(
    user: Authed,
    Extension(pg): Extension<PgPool>,
    Extension(config): Extension<Arc<Config>>,
    Extension(encoder): Extension<SharedEncoder>,
    multipart: Multipart,
) -> Payload<FaceRegistered> {
    settle(store_face(&pg, &config, &encoder, &user, multipart).await)
}

async fn store_face(
    pg: &PgPool,
    config: &Config,
    encoder: &SharedEncoder,
    user: &Authed,
    multipart: Multipart,
) -> Result<FaceRegistered, Error> {
    let mut form = UploadForm::read(multipart, config.max_upload_bytes).await?;
    let image = form.take_image("face_image", config.max_upload_bytes)?;
    let embedding = encode_face(encoder.as_ref(), &image, config.face.encoding_len).await?;
    let bytes = embedding.to_bytes()?;

    let registered_at: Option<chrono::DateTime<Utc>> = sqlx::query_scalar(
        "UPDATE users SET face_encoding = $2, face_registered_at = now() \
         WHERE uuid = $1 RETURNING face_registered_at",
    )
    .bind(user.user_id)
    .bind(&bytes)
    .fetch_one(pg)
    .await?;

    let backup = encoding_backup_path(config, &user.user_id, user.role.as_str());
    if let Err(err) = crate::io::write_io_file(&backup, &bytes).await {
        log::warn!("Could not write encoding backup {:?}: {:?}", backup, err);
    }
    log::info!("Registered face for {} {}", user.role.as_str(), user.user_id);
    Ok(FaceRegistered {
        message: "Face registered successfully".to_string(),
        registered_at,
    })
}

pub async fn verify_face(
    user: Authed,
    Extension(pg): Extension<PgPool>,
    Extension(config): Extension<Arc<Config>>,
    Extension(encoder): Extension<SharedEncoder>,
    multipart: Multipart,
) -> Payload<FaceVerified> {
    settle(check_face(&pg, &config, &encoder, &user, multipart).await)
}

async fn check_face(
    pg: &PgPool,
    config: &Config,
    encoder: &SharedEncoder,
    user: &Authed,
    multipart: Multipart,
) -> Result<FaceVerified, Error> {
    let mut form = UploadForm::read(multipart, config.max_upload_bytes).await?;
    let image = form.take_image("face_image", config.max_upload_bytes)?;

    let stored: Option<Vec<u8>> =
        sqlx::query_scalar::<_, Option<Vec<u8>>>("SELECT face_encoding FROM users WHERE uuid = $1")
            .bind(user.user_id)
            .fetch_optional(pg)
            .await?
            .flatten();
    let stored = match stored {
        Some(bytes) => Embedding::from_bytes(&bytes)?,
        None => {
            return Err(Error::FaceNotRegistered {
                message: "Face not registered".to_string(),
            })
        }
    };

    let sample = encode_face(encoder.as_ref(), &image, config.face.encoding_len).await?;
    if !face::verify(&stored, &sample, config.face.tolerance) {
        return Err(Error::FaceMismatch {
            message: "Face mismatch".to_string(),
        });
    }
    let distance = stored.distance(&sample).unwrap_or_default();
    Ok(FaceVerified {
        message: "Face verified".to_string(),
        confidence: face::confidence(distance, config.face.tolerance),
    })
}

/// The account as shown to its owner.
#[derive(Debug, Clone, Serialize)]
pub struct Profile {
    #[serde(flatten)]
    pub user: UserData,
    pub face_registered: bool,
    pub parent_access: bool,
}

impl From<UserData> for Profile {
    fn from(user: UserData) -> Self {
        Self {
            face_registered: user.face_registered(),
            parent_access: user.parent_password_hash.is_some() && user.roll_number.is_some(),
            user,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpdateProfile {
    #[serde(default)]
    pub full_name: String,
    #[serde(default)]
    pub email: String,
    pub phone: Option<String>,
    pub roll_number: Option<String>,
    pub parent_password: Option<String>,
    pub parent_password_confirm: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProfileImage {
    pub profile_image: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct FaceRegistered {
    pub message: String,
    pub registered_at: Option<chrono::DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FaceVerified {
    pub message: String,
    pub confidence: f64,
}
