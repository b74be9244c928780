use std::sync::Arc;

use axum::extract::Path;
use axum::{Extension, Json};
use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use crate::auth::{Authed, Student, Teacher};
use crate::config::Config;
use crate::models::{Classroom, Role};
use crate::schedule::{de_opt_time, schedule_label};
use crate::{breaks, proceeds, Error, Payload};

const SUMMARY_COLUMNS: &str = "c.*, t.full_name AS teacher_name, \
    (SELECT COUNT(*) FROM classroom_students s WHERE s.classroom_id = c.uuid) AS student_count";

pub async fn owned_classroom(
    pg: &PgPool,
    classroom_id: Uuid,
    teacher_id: Uuid,
) -> Result<Classroom, Error> {
    sqlx::query_as::<_, Classroom>("SELECT * FROM classrooms WHERE uuid = $1 AND teacher_id = $2")
        .bind(classroom_id)
        .bind(teacher_id)
        .fetch_optional(pg)
        .await?
        .ok_or_else(|| Error::not_found("Classroom not found or access denied"))
}

pub async fn is_enrolled(pg: &PgPool, student_id: Uuid, classroom_id: Uuid) -> Result<bool, Error> {
    let found: Option<i32> = sqlx::query_scalar(
        "SELECT 1 FROM classroom_students WHERE student_id = $1 AND classroom_id = $2",
    )
    .bind(student_id)
    .bind(classroom_id)
    .fetch_optional(pg)
    .await?;
    Ok(found.is_some())
}

pub async fn enrolled_classroom(
    pg: &PgPool,
    classroom_id: Uuid,
    student_id: Uuid,
) -> Result<Classroom, Error> {
    sqlx::query_as::<_, Classroom>(
        "SELECT c.* FROM classrooms c \
         JOIN classroom_students cs ON cs.classroom_id = c.uuid \
         WHERE c.uuid = $1 AND cs.student_id = $2",
    )
    .bind(classroom_id)
    .bind(student_id)
    .fetch_optional(pg)
    .await?
    .ok_or_else(|| Error::forbidden("You are not enrolled in this classroom"))
}

/// The owner teacher or an enrolled student may look at a classroom.
pub async fn visible_classroom(
    pg: &PgPool,
    classroom_id: Uuid,
    user: &Authed,
) -> Result<Classroom, Error> {
    match user.role {
        Role::Teacher => owned_classroom(pg, classroom_id, user.user_id).await,
        _ => enrolled_classroom(pg, classroom_id, user.user_id).await,
    }
}

pub async fn create_classroom(
    Teacher(teacher_id): Teacher,
    Extension(pg): Extension<PgPool>,
    Json(body): Json<NewClassroom>,
) -> Payload<Classroom> {
    let class_name = body.class_name.trim();
    let class_code = body.class_code.trim();
    if class_name.is_empty() || class_code.is_empty() {
        return breaks(Error::invalid("`class_name` and `class_code` are required"));
    }
    if let (Some(start), Some(end)) = (body.start_time, body.end_time) {
        if end <= start {
            return breaks(Error::invalid("`end_time` must be after `start_time`"));
        }
    }
    if let Some(radius) = body.geofence_radius_m {
        if radius <= 0.0 {
            return breaks(Error::invalid("`geofence_radius_m` must be positive"));
        }
    }
    if body.venue_lat.is_some() != body.venue_lng.is_some() {
        return breaks(Error::invalid(
            "`venue_lat` and `venue_lng` must be given together",
        ));
    }

    let schedule_time = schedule_label(body.schedule_days.as_deref(), body.start_time, body.end_time);
    let classroom = sqlx::query_as::<_, Classroom>(
        "INSERT INTO classrooms (uuid, teacher_id, class_name, class_code, description, \
         start_time, end_time, schedule_days, schedule_time, venue, venue_lat, venue_lng, geofence_radius_m) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13) RETURNING *",
    )
    .bind(Uuid::new_v4())
    .bind(teacher_id)
    .bind(class_name)
    .bind(class_code)
    .bind(&body.description)
    .bind(body.start_time)
    .bind(body.end_time)
    .bind(&body.schedule_days)
    .bind(&schedule_time)
    .bind(&body.venue)
    .bind(body.venue_lat)
    .bind(body.venue_lng)
    .bind(body.geofence_radius_m)
    .fetch_one(&pg)
    .await
    .map_err(|err| match Error::from(err) {
        Error::Conflict { .. } => Error::conflict(format!("Class code `{}` is already in use", class_code)),
        other => other,
    })?;

    log::info!("Classroom {} ({}) created", classroom.class_name, classroom.uuid);
    proceeds(classroom)
}

pub async fn list_classrooms(
    user: Authed,
    Extension(pg): Extension<PgPool>,
) -> Payload<ClassroomList> {
    let sql = match user.role {
        Role::Teacher => format!(
            "SELECT {} FROM classrooms c JOIN users t ON t.uuid = c.teacher_id \
             WHERE c.teacher_id = $1 ORDER BY c.created_at",
            SUMMARY_COLUMNS
        ),
        _ => format!(
            "SELECT {} FROM classrooms c JOIN users t ON t.uuid = c.teacher_id \
             JOIN classroom_students cs ON cs.classroom_id = c.uuid \
             WHERE cs.student_id = $1 ORDER BY c.class_name",
            SUMMARY_COLUMNS
        ),
    };
    let classrooms = sqlx::query_as::<_, ClassroomSummary>(&sql)
        .bind(user.user_id)
        .fetch_all(&pg)
        .await?;
    proceeds(ClassroomList { classrooms })
}

pub async fn read_classroom(
    user: Authed,
    Path(classroom_id): Path<Uuid>,
    Extension(pg): Extension<PgPool>,
) -> Payload<ClassroomSummary> {
    visible_classroom(&pg, classroom_id, &user).await?;
    let sql = format!(
        "SELECT {} FROM classrooms c JOIN users t ON t.uuid = c.teacher_id WHERE c.uuid = $1",
        SUMMARY_COLUMNS
    );
    let summary = sqlx::query_as::<_, ClassroomSummary>(&sql)
        .bind(classroom_id)
        .fetch_one(&pg)
        .await?;
    proceeds(summary)
}

/// Enrollments, attendance, leaves and events go with the classroom through
/// `ON DELETE CASCADE`.
pub async fn delete_classroom(
    Teacher(teacher_id): Teacher,
    Path(classroom_id): Path<Uuid>,
    Extension(pg): Extension<PgPool>,
) -> Payload<ClassroomDeleted> {
    let classroom = owned_classroom(&pg, classroom_id, teacher_id).await?;
    let res = sqlx::query("DELETE FROM classrooms WHERE uuid = $1 AND teacher_id = $2")
        .bind(classroom_id)
        .bind(teacher_id)
        .execute(&pg)
        .await?;

    log::info!("Classroom {} ({}) deleted", classroom.class_name, classroom.uuid);
    proceeds(ClassroomDeleted {
        classroom_id,
        class_name: classroom.class_name,
        deleted: res.rows_affected() >= 1,
    })
}

pub async fn join_classroom(
    Student(student_id): Student,
    Extension(pg): Extension<PgPool>,
    Json(body): Json<JoinClassroom>,
) -> Payload<Joined> {
    enroll(&pg, student_id, body.class_code.trim()).await
}

pub async fn join_by_code(
    Student(student_id): Student,
    Path(class_code): Path<String>,
    Extension(pg): Extension<PgPool>,
) -> Payload<Joined> {
    enroll(&pg, student_id, class_code.trim()).await
}

async fn enroll(pg: &PgPool, student_id: Uuid, class_code: &str) -> Payload<Joined> {
    let classroom = sqlx::query_as::<_, Classroom>("SELECT * FROM classrooms WHERE class_code = $1")
        .bind(class_code)
        .fetch_optional(pg)
        .await?;
    let classroom = match classroom {
        Some(classroom) => classroom,
        None => return breaks(Error::not_found("Invalid class code")),
    };

    let res = sqlx::query(
        "INSERT INTO classroom_students (student_id, classroom_id) VALUES ($1, $2) \
         ON CONFLICT DO NOTHING",
    )
    .bind(student_id)
    .bind(classroom.uuid)
    .execute(pg)
    .await?;

    proceeds(Joined {
        classroom_id: classroom.uuid,
        class_name: classroom.class_name,
        already_joined: res.rows_affected() == 0,
    })
}

pub async fn share_classroom(
    Teacher(teacher_id): Teacher,
    Path(classroom_id): Path<Uuid>,
    Extension(pg): Extension<PgPool>,
    Extension(config): Extension<Arc<Config>>,
) -> Payload<ShareLinks> {
    let classroom = owned_classroom(&pg, classroom_id, teacher_id).await?;
    proceeds(share_links(&config.public_url, &classroom))
}

pub fn share_links(public_url: &str, classroom: &Classroom) -> ShareLinks {
    let base = public_url.trim_end_matches('/');
    ShareLinks {
        class_code: classroom.class_code.clone(),
        join_url: format!("{}/join/{}", base, classroom.class_code),
        attendance_url: format!("{}/classrooms/{}/attendance", base, classroom.uuid),
    }
}

pub async fn classroom_roster(
    Teacher(teacher_id): Teacher,
    Path(classroom_id): Path<Uuid>,
    Extension(pg): Extension<PgPool>,
) -> Payload<Roster> {
    owned_classroom(&pg, classroom_id, teacher_id).await?;
    let students = sqlx::query_as::<_, RosterEntry>(
        "SELECT u.uuid, u.username, u.full_name, u.email, u.roll_number, \
                (u.face_encoding IS NOT NULL) AS face_registered, \
                COUNT(a.uuid) FILTER (WHERE a.status = 'P') AS present_days, \
                COUNT(a.uuid) AS total_days \
         FROM users u \
         JOIN classroom_students cs ON cs.student_id = u.uuid \
         LEFT JOIN attendance a ON a.student_id = u.uuid AND a.classroom_id = cs.classroom_id \
         WHERE cs.classroom_id = $1 \
         GROUP BY u.uuid \
         ORDER BY u.roll_number NULLS LAST, u.full_name",
    )
    .bind(classroom_id)
    .fetch_all(&pg)
    .await?;
    proceeds(Roster { students })
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewClassroom {
    pub class_name: String,
    pub class_code: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, deserialize_with = "de_opt_time")]
    pub start_time: Option<NaiveTime>,
    #[serde(default, deserialize_with = "de_opt_time")]
    pub end_time: Option<NaiveTime>,
    pub schedule_days: Option<String>,
    #[serde(default)]
    pub venue: String,
    pub venue_lat: Option<f64>,
    pub venue_lng: Option<f64>,
    pub geofence_radius_m: Option<f64>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ClassroomSummary {
    #[serde(flatten)]
    #[sqlx(flatten)]
    pub classroom: Classroom,
    pub teacher_name: String,
    pub student_count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClassroomList {
    pub classrooms: Vec<ClassroomSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClassroomDeleted {
    pub classroom_id: Uuid,
    pub class_name: String,
    pub deleted: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JoinClassroom {
    pub class_code: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Joined {
    pub classroom_id: Uuid,
    pub class_name: String,
    pub already_joined: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ShareLinks {
    pub class_code: String,
    pub join_url: String,
    pub attendance_url: String,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct RosterEntry {
    pub uuid: Uuid,
    pub username: String,
    pub full_name: String,
    pub email: String,
    pub roll_number: Option<String>,
    pub face_registered: bool,
    pub present_days: i64,
    pub total_days: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Roster {
    pub students: Vec<RosterEntry>,
}
