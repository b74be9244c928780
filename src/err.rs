#![allow(non_snake_case)]

use crate::auth::AuthResult;
use crate::{IntoResponse, Uri};

use axum::http::StatusCode;
use axum::response::Response;
use axum::Json;

use serde::Serialize;

pub async fn handler404(path: Uri) -> (StatusCode, Json<Error>) {
    (
        StatusCode::NOT_FOUND,
        Json(Error::NotFound {
            message: format!("Invalid path: {}", path),
        }),
    )
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Maybe<T> {
    Nothing(Failure),
    Fine(Success<T>),
}

pub fn Fine<V>(v: V) -> Maybe<V>
where
    V: Serialize,
{
    Maybe::Fine(Success::of(v))
}

pub fn Nothing<V>(err: Error) -> Maybe<V> {
    Maybe::Nothing(Failure::of(err))
}

#[derive(Debug, Clone, Serialize)]
pub struct Success<V> {
    success: bool,
    #[serde(flatten)]
    value: V,
}

/// A soft error with the same `success` key as [`Success`].
#[derive(Debug, Clone, Serialize)]
pub struct Failure {
    success: bool,
    #[serde(flatten)]
    pub error: Error,
}

impl<T> IntoResponse for Maybe<T>
where
    T: Serialize,
{
    fn into_response(self) -> Response {
        match self {
            Maybe::Nothing(failure) => Json::into_response(Json(failure)),
            Maybe::Fine(success) => Json::into_response(Json(success)),
        }
    }
}

impl<V: Serialize> Success<V> {
    pub fn of(value: V) -> Self {
        Self {
            success: true,
            value,
        }
    }
}

impl Failure {
    pub fn of(error: Error) -> Self {
        Self {
            success: false,
            error,
        }
    }
}

/// Everything a handler can answer with instead of a value.
///
/// Returned through [`crate::breaks`] these are soft outcomes and travel with
/// `200 OK`; propagated with `?` they carry the status from [`Error::status`].
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "error")]
pub enum Error {
    NotFound {
        message: String,
    },
    InvalidPayload {
        message: String,
    },
    MissingCredentials {
        message: String,
    },
    UserAlreadyExists {
        message: String,
    },
    UserDoesNotExist {
        message: String,
    },
    AuthenticationFailure {
        message: String,
    },
    NotAuthenticated {
        auth_result: AuthResult,
        message: String,
    },
    Forbidden {
        message: String,
    },
    Conflict {
        message: String,
    },
    InvalidImage {
        message: String,
    },
    NoFaceDetected {
        message: String,
    },
    FaceNotRecognized {
        message: String,
        needs_registration: bool,
    },
    FaceMismatch {
        message: String,
    },
    FaceNotRegistered {
        message: String,
    },
    AlreadyMarked {
        message: String,
    },
    OutsideWindow {
        message: String,
        opens_at: String,
        closes_at: String,
    },
    LocationRequired {
        message: String,
    },
    OutsideGeofence {
        message: String,
        distance_m: f64,
        radius_m: f64,
    },
    InternalError {
        kind: &'static str,
        message: String,
    },
    Unknown {
        message: String,
    },
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        (self.status(), Json(self)).into_response()
    }
}

impl Error {
    pub fn unknown<S: Into<String>>(msg: S) -> Error {
        Error::Unknown {
            message: msg.into(),
        }
    }

    pub fn not_found<S: Into<String>>(msg: S) -> Error {
        Error::NotFound {
            message: msg.into(),
        }
    }

    pub fn invalid<S: Into<String>>(msg: S) -> Error {
        Error::InvalidPayload {
            message: msg.into(),
        }
    }

    pub fn forbidden<S: Into<String>>(msg: S) -> Error {
        Error::Forbidden {
            message: msg.into(),
        }
    }

    pub fn conflict<S: Into<String>>(msg: S) -> Error {
        Error::Conflict {
            message: msg.into(),
        }
    }

    /// Outcomes the client is expected to recover from by retrying with a
    /// better photo or location. These are answered through `breaks`.
    pub fn is_soft(&self) -> bool {
        matches!(
            self,
            Error::InvalidImage { .. }
                | Error::NoFaceDetected { .. }
                | Error::FaceNotRecognized { .. }
                | Error::FaceMismatch { .. }
                | Error::FaceNotRegistered { .. }
                | Error::AlreadyMarked { .. }
                | Error::OutsideWindow { .. }
                | Error::LocationRequired { .. }
                | Error::OutsideGeofence { .. }
        )
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Error::NotFound { .. } | Error::UserDoesNotExist { .. } => StatusCode::NOT_FOUND,
            Error::NotAuthenticated { .. } | Error::AuthenticationFailure { .. } => {
                StatusCode::UNAUTHORIZED
            }
            Error::Forbidden { .. }
            | Error::FaceMismatch { .. }
            | Error::OutsideWindow { .. }
            | Error::OutsideGeofence { .. } => StatusCode::FORBIDDEN,
            Error::Conflict { .. }
            | Error::UserAlreadyExists { .. }
            | Error::AlreadyMarked { .. } => StatusCode::CONFLICT,
            Error::InvalidPayload { .. }
            | Error::MissingCredentials { .. }
            | Error::InvalidImage { .. }
            | Error::NoFaceDetected { .. }
            | Error::FaceNotRecognized { .. }
            | Error::FaceNotRegistered { .. }
            | Error::LocationRequired { .. } => StatusCode::BAD_REQUEST,
            Error::InternalError { .. } | Error::Unknown { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(io: std::io::Error) -> Self {
        Self::InternalError {
            kind: "IOError",
            message: io.to_string(),
        }
    }
}

impl From<uuid::Error> for Error {
    fn from(id: uuid::Error) -> Self {
        Self::InvalidPayload {
            message: id.to_string(),
        }
    }
}

impl From<postcard::Error> for Error {
    fn from(err: postcard::Error) -> Self {
        Self::InternalError {
            kind: "SerializationError",
            message: err.to_string(),
        }
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &err {
            // unique_violation
            if db.code().as_deref() == Some("23505") {
                return Self::Conflict {
                    message: db.message().to_string(),
                };
            }
        }
        log::error!("database error: {:?}", err);
        Self::InternalError {
            kind: "DatabaseError",
            message: err.to_string(),
        }
    }
}

impl From<pbkdf2::password_hash::Error> for Error {
    fn from(err: pbkdf2::password_hash::Error) -> Self {
        Self::InternalError {
            kind: "PasswordHashError",
            message: err.to_string(),
        }
    }
}

impl From<axum::extract::multipart::MultipartError> for Error {
    fn from(err: axum::extract::multipart::MultipartError) -> Self {
        Self::InvalidPayload {
            message: err.to_string(),
        }
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::Unknown {
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn success_flattens_value() {
        #[derive(Serialize)]
        struct Created {
            student_id: u32,
        }

        let body = serde_json::to_value(Fine(Created { student_id: 7 })).unwrap();
        assert_eq!(body, json!({ "success": true, "student_id": 7 }));
    }

    #[test]
    fn errors_are_tagged_by_kind() {
        let body = serde_json::to_value(Nothing::<()>(Error::LocationRequired {
            message: "need location".into(),
        }))
        .unwrap();
        assert_eq!(
            body,
            json!({ "success": false, "error": "LocationRequired", "message": "need location" })
        );
    }

    #[test]
    fn soft_failures_keep_their_fields() {
        let body = serde_json::to_value(Nothing::<()>(Error::FaceNotRecognized {
            message: "Register your face before marking attendance".into(),
            needs_registration: true,
        }))
        .unwrap();
        assert_eq!(body["success"], false);
        assert_eq!(body["error"], "FaceNotRecognized");
        assert_eq!(body["needs_registration"], true);
    }

    #[test]
    fn status_codes_follow_error_kind() {
        assert_eq!(Error::not_found("x").status(), StatusCode::NOT_FOUND);
        assert_eq!(Error::forbidden("x").status(), StatusCode::FORBIDDEN);
        assert_eq!(Error::conflict("x").status(), StatusCode::CONFLICT);
        assert_eq!(
            Error::NotAuthenticated {
                auth_result: AuthResult::SessionExpired,
                message: "x".into()
            }
            .status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            Error::unknown("x").status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
