use std::time::Duration;

use axum::extract::Path;
use axum::{Extension, Json};
use chrono::{Local, NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use uuid::Uuid;

use crate::auth::{Authed, Teacher};
use crate::classroom::{owned_classroom, visible_classroom};
use crate::config::EventsConfig;
use crate::models::{ClassroomEvent, EventType};
use crate::schedule::de_opt_time;
use crate::{proceeds, Error, Payload};

const PAST_EVENTS_DAYS: i64 = 30;

pub async fn list_events(
    user: Authed,
    Path(classroom_id): Path<Uuid>,
    Extension(pg): Extension<PgPool>,
) -> Payload<EventList> {
    visible_classroom(&pg, classroom_id, &user).await?;
    let today = Local::now().naive_local().date();

    let upcoming = sqlx::query_as::<_, ClassroomEvent>(
        "SELECT * FROM classroom_events WHERE classroom_id = $1 AND event_date >= $2 \
         ORDER BY event_date, event_time NULLS LAST",
    )
    .bind(classroom_id)
    .bind(today)
    .fetch_all(&pg)
    .await?;

    let past = sqlx::query_as::<_, ClassroomEvent>(
        "SELECT * FROM classroom_events WHERE classroom_id = $1 \
         AND event_date < $2 AND event_date >= $3 \
         ORDER BY event_date DESC, event_time DESC NULLS LAST",
    )
    .bind(classroom_id)
    .bind(today)
    .bind(today - chrono::Duration::days(PAST_EVENTS_DAYS))
    .fetch_all(&pg)
    .await?;

    proceeds(EventList { upcoming, past })
}

pub async fn create_event(
    Teacher(teacher_id): Teacher,
    Path(classroom_id): Path<Uuid>,
    Extension(pg): Extension<PgPool>,
    Json(body): Json<NewEvent>,
) -> Payload<ClassroomEvent> {
    owned_classroom(&pg, classroom_id, teacher_id).await?;
    let title = body.title.trim();
    let event_date = match (title.is_empty(), body.event_date) {
        (false, Some(date)) => date,
        _ => return Err(Error::invalid("Title and date are required")),
    };

    let event = sqlx::query_as::<_, ClassroomEvent>(
        "INSERT INTO classroom_events \
         (uuid, classroom_id, title, description, event_date, event_time, event_type, created_by) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8) RETURNING *",
    )
    .bind(Uuid::new_v4())
    .bind(classroom_id)
    .bind(title)
    .bind(body.description.trim())
    .bind(event_date)
    .bind(body.event_time)
    .bind(body.event_type)
    .bind(teacher_id)
    .fetch_one(&pg)
    .await?;
    log::info!("Event {} added to {}", event.uuid, classroom_id);
    proceeds(event)
}

pub async fn delete_event(
    Teacher(teacher_id): Teacher,
    Path(event_id): Path<Uuid>,
    Extension(pg): Extension<PgPool>,
) -> Payload<EventDeleted> {
    let deleted = sqlx::query(
        "DELETE FROM classroom_events e USING classrooms c \
         WHERE e.uuid = $1 AND c.uuid = e.classroom_id AND c.teacher_id = $2",
    )
    .bind(event_id)
    .bind(teacher_id)
    .execute(&pg)
    .await?
    .rows_affected();
    if deleted == 0 {
        return Err(Error::not_found("Event not found or access denied"));
    }
    proceeds(EventDeleted { event_id })
}

/// Events dated before the returned day are due for removal.
pub fn retention_cutoff(today: NaiveDate, retention_days: i64) -> NaiveDate {
    today - chrono::Duration::days(retention_days)
}

pub async fn sweep_events(pg: &PgPool, cutoff: NaiveDate) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("DELETE FROM classroom_events WHERE event_date < $1")
        .bind(cutoff)
        .execute(pg)
        .await?;
    Ok(result.rows_affected())
}

/// Runs the retention sweep every `sweep_interval_secs`, first tick one
/// period after startup.
pub fn spawn_sweeper(pg: PgPool, config: EventsConfig) -> JoinHandle<()> {
    let period = Duration::from_secs(config.sweep_interval_secs.max(1));
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        loop {
            ticker.tick().await;
            let cutoff = retention_cutoff(Local::now().naive_local().date(), config.retention_days);
            match sweep_events(&pg, cutoff).await {
                Ok(0) => log::debug!("Event sweep found nothing before {}", cutoff),
                Ok(n) => log::info!("Removed {} events dated before {}", n, cutoff),
                Err(err) => log::error!("Event sweep failed: {:?}", err),
            }
        }
    })
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewEvent {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub event_date: Option<NaiveDate>,
    #[serde(default, deserialize_with = "de_opt_time")]
    pub event_time: Option<NaiveTime>,
    #[serde(default)]
    pub event_type: EventType,
}

#[derive(Debug, Clone, Serialize)]
pub struct EventList {
    pub upcoming: Vec<ClassroomEvent>,
    pub past: Vec<ClassroomEvent>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EventDeleted {
    pub event_id: Uuid,
}
