pub mod attendance;
pub mod auth;
pub mod classroom;
pub mod config;
pub mod dashboard;
pub mod err;
pub mod events;
pub mod face;
pub mod geo;
pub mod io;
pub mod leaves;
pub mod models;
pub mod profile;
pub mod schedule;

use axum::handler::Handler;
use axum::routing::{delete, get, post};
use axum::{response::IntoResponse, Extension, Json, Router};

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use axum::http::Uri;
use serde::Serialize;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tower::ServiceBuilder;
use crate::config::Config;
use crate::err::{Error, Fine, Maybe, Nothing};
use crate::face::{HttpEncoder, SharedEncoder};

pub type Payload<T> = axum::response::Result<Json<Maybe<T>>, Error>;

pub fn proceeds<V>(value: V) -> Payload<V> where V: Serialize {
    Ok(Json(Fine(value)))
}

pub fn breaks<V>(err: Error) -> Payload<V> where V: Serialize {
    Ok(Json(Nothing(err)))
}

/// Soft failures go out as a `200` envelope, everything else keeps its status.
pub fn settle<V>(result: Result<V, Error>) -> Payload<V> where V: Serialize {
    match result {
        Ok(value) => proceeds(value),
        Err(err) if err.is_soft() => breaks(err),
        Err(err) => Err(err),
    }
}

pub fn router(pg: PgPool, config: Arc<Config>, encoder: SharedEncoder) -> Router {
    Router::new()
        .route("/auth/signup", post(auth::register_user))
        .route("/auth/login", post(auth::login_user))
        .route("/auth/login/face", post(auth::login_with_face))
        .route("/auth/parent/login", post(auth::login_parent))
        .route("/auth/logout", post(auth::drop_session))
        .route("/profile", get(profile::read_profile).put(profile::update_profile))
        .route("/profile/image", post(profile::upload_profile_image))
        .route("/profile/face", post(profile::register_face))
        .route("/profile/face/verify", post(profile::verify_face))
        .route(
            "/classrooms",
            get(classroom::list_classrooms).post(classroom::create_classroom),
        )
        .route(
            "/classrooms/:id",
            get(classroom::read_classroom).delete(classroom::delete_classroom),
        )
        .route("/classrooms/:id/share", get(classroom::share_classroom))
        .route("/classrooms/:id/students", get(classroom::classroom_roster))
        .route("/join", post(classroom::join_classroom))
        .route("/join/:code", post(classroom::join_by_code))
        .route(
            "/classrooms/:id/attendance",
            get(attendance::view_attendance).post(attendance::mark_attendance),
        )
        .route("/classrooms/:id/attendance/window", get(attendance::attendance_window))
        .route(
            "/classrooms/:id/attendance/sheet",
            get(attendance::day_sheet).put(attendance::set_attendance),
        )
        .route("/classrooms/:id/attendance/stats", get(attendance::attendance_stats))
        .route("/classrooms/:id/attendance/export", get(attendance::export_attendance))
        .route("/leaves", get(leaves::my_leaves).post(leaves::apply_leave))
        .route("/leaves/manage", get(leaves::manage_leaves))
        .route("/leaves/manage/:id", post(leaves::decide_leave))
        .route(
            "/classrooms/:id/events",
            get(events::list_events).post(events::create_event),
        )
        .route("/events/:id", delete(events::delete_event))
        .route("/dashboard/student", get(dashboard::student_dashboard))
        .route("/dashboard/teacher", get(dashboard::teacher_dashboard))
        .route("/dashboard/teacher/trends", get(dashboard::teacher_trends))
        .route("/dashboard/parent", get(dashboard::parent_dashboard))
        .route("/stats/me", get(dashboard::my_stats))
        .fallback(err::handler404.into_service())
        .layer(
            ServiceBuilder::new()
                .layer(Extension(pg))
                .layer(Extension(config))
                .layer(Extension(encoder)),
        )
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    env_logger::init();

    let config = Arc::new(config::load_config(None)?);
    io::prepare_io(&config).await?;

    let pg = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(Duration::from_secs(10))
        .connect(&config.database_url)
        .await?;
    sqlx::migrate!("./migrations").run(&pg).await?;
    log::info!("Database ready, migrations applied");

    let encoder: SharedEncoder = Arc::new(HttpEncoder::new(&config.face)?);
    events::spawn_sweeper(pg.clone(), config.events.clone());

    let addr: SocketAddr = config.bind_addr.parse()?;
    let app = router(pg, config.clone(), encoder);

    log::info!("Starting attendance HTTP server on http://{}", addr);
    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::face::tests::FixedEncoder;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::Value;
    use tower::ServiceExt;

    fn app() -> Router {
        let config = Config::default();
        let pg = PgPoolOptions::new()
            .connect_lazy(&config.database_url)
            .unwrap();
        router(pg, Arc::new(config), Arc::new(FixedEncoder(None)))
    }

    async fn call(request: Request<Body>) -> (StatusCode, Value) {
        let response = app().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn unknown_paths_are_not_found() {
        let (status, body) = call(
            Request::builder()
                .uri("/no/such/route")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "NotFound");
        assert_eq!(body["message"], "Invalid path: /no/such/route");
    }

    #[tokio::test]
    async fn protected_routes_need_a_session() {
        for uri in ["/profile", "/classrooms", "/dashboard/teacher", "/stats/me"] {
            let (status, body) = call(Request::builder().uri(uri).body(Body::empty()).unwrap()).await;
            assert_eq!(status, StatusCode::UNAUTHORIZED, "{}", uri);
            assert_eq!(body["error"], "NotAuthenticated");
            assert_eq!(body["auth_result"], "InvalidSession");
        }
    }

    #[test]
    fn soft_errors_settle_as_ok() {
        let soft: Payload<()> = settle(Err(Error::AlreadyMarked {
            message: "Attendance already marked".to_string(),
        }));
        match soft {
            Ok(Json(Maybe::Nothing(failure))) => {
                assert!(matches!(failure.error, Error::AlreadyMarked { .. }))
            }
            other => panic!("expected a soft failure, got {:?}", other),
        }

        let hard: Payload<()> = settle(Err(Error::forbidden("nope")));
        assert!(matches!(hard, Err(Error::Forbidden { .. })));

        let fine: Payload<u8> = settle(Ok(3));
        assert!(matches!(fine, Ok(Json(Maybe::Fine(_)))));
    }
}
