use axum::extract::Path;
use axum::{Extension, Json};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use crate::attendance::upsert_status;
use crate::auth::{Student, Teacher};
use crate::classroom::is_enrolled;
use crate::models::{AttendanceStatus, LeaveRecord, LeaveStatus};
use crate::{proceeds, Error, Payload};

pub async fn my_leaves(
    Student(student_id): Student,
    Extension(pg): Extension<PgPool>,
) -> Payload<LeaveList> {
    let leaves = sqlx::query_as::<_, LeaveEntry>(
        "SELECT l.*, c.class_name, u.full_name AS student_name, u.roll_number FROM leaves l \
         JOIN classrooms c ON c.uuid = l.classroom_id \
         JOIN users u ON u.uuid = l.student_id \
         WHERE l.student_id = $1 ORDER BY l.date DESC, l.created_at DESC",
    )
    .bind(student_id)
    .fetch_all(&pg)
    .await?;
    proceeds(LeaveList { leaves })
}

pub async fn apply_leave(
    Student(student_id): Student,
    Extension(pg): Extension<PgPool>,
    Json(body): Json<ApplyLeave>,
) -> Payload<LeaveRecord> {
    let reason = body.reason.trim();
    if reason.is_empty() {
        return Err(Error::invalid("A reason is required"));
    }
    if !is_enrolled(&pg, student_id, body.classroom_id).await? {
        return Err(Error::forbidden("You are not enrolled in this classroom"));
    }

    let leave = sqlx::query_as::<_, LeaveRecord>(
        "INSERT INTO leaves (uuid, student_id, classroom_id, date, reason, status) \
         VALUES ($1, $2, $3, $4, $5, 'Pending') RETURNING *",
    )
    .bind(Uuid::new_v4())
    .bind(student_id)
    .bind(body.classroom_id)
    .bind(body.date)
    .bind(reason)
    .fetch_one(&pg)
    .await?;
    log::info!(
        "Leave {} requested by {} for {}",
        leave.uuid,
        student_id,
        leave.date
    );
    proceeds(leave)
}

pub async fn manage_leaves(
    Teacher(teacher_id): Teacher,
    Extension(pg): Extension<PgPool>,
) -> Payload<LeaveList> {
    let leaves = sqlx::query_as::<_, LeaveEntry>(
        "SELECT l.*, c.class_name, u.full_name AS student_name, u.roll_number FROM leaves l \
         JOIN classrooms c ON c.uuid = l.classroom_id \
         JOIN users u ON u.uuid = l.student_id \
         WHERE c.teacher_id = $1 \
         ORDER BY (l.status = 'Pending') DESC, l.date DESC, l.created_at DESC",
    )
    .bind(teacher_id)
    .fetch_all(&pg)
    .await?;
    proceeds(LeaveList { leaves })
}

pub async fn decide_leave(
    Teacher(teacher_id): Teacher,
    Path(leave_id): Path<Uuid>,
    Extension(pg): Extension<PgPool>,
    Json(body): Json<LeaveDecision>,
) -> Payload<Decided> {
    if body.status == LeaveStatus::Pending {
        return Err(Error::invalid("A decision must be Approved or Rejected"));
    }

    let mut tx = pg.begin().await?;
    let leave = sqlx::query_as::<_, LeaveRecord>(
        "SELECT l.* FROM leaves l JOIN classrooms c ON c.uuid = l.classroom_id \
         WHERE l.uuid = $1 AND c.teacher_id = $2 FOR UPDATE OF l",
    )
    .bind(leave_id)
    .bind(teacher_id)
    .fetch_optional(&mut tx)
    .await?
    .ok_or_else(|| Error::not_found("Leave not found or access denied"))?;
    if leave.status != LeaveStatus::Pending {
        return Err(Error::conflict("Leave has already been decided"));
    }

    let leave = sqlx::query_as::<_, LeaveRecord>(
        "UPDATE leaves SET status = $2 WHERE uuid = $1 RETURNING *",
    )
    .bind(leave_id)
    .bind(body.status)
    .fetch_one(&mut tx)
    .await?;

    let attendance_marked = if leave.status == LeaveStatus::Approved {
        upsert_status(
            &mut tx,
            leave.student_id,
            leave.classroom_id,
            leave.date,
            AttendanceStatus::Leave,
        )
        .await?;
        true
    } else {
        false
    };
    tx.commit().await?;

    log::info!("Leave {} marked {:?}", leave.uuid, leave.status);
    proceeds(Decided {
        leave,
        attendance_marked,
    })
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApplyLeave {
    pub classroom_id: Uuid,
    pub date: NaiveDate,
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LeaveDecision {
    pub status: LeaveStatus,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct LeaveEntry {
    pub uuid: Uuid,
    pub student_id: Uuid,
    pub classroom_id: Uuid,
    pub date: NaiveDate,
    pub reason: String,
    pub status: LeaveStatus,
    pub created_at: DateTime<Utc>,
    pub class_name: String,
    pub student_name: String,
    pub roll_number: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LeaveList {
    pub leaves: Vec<LeaveEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Decided {
    pub leave: LeaveRecord,
    pub attendance_marked: bool,
}
