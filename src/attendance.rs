use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Multipart, Path, Query};
use axum::http::{header, HeaderMap, HeaderValue};
use axum::{Extension, Json};
use chrono::{DateTime, Local, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Postgres};
use uuid::Uuid;

use crate::auth::{Authed, Student, Teacher};
use crate::classroom::{enrolled_classroom, is_enrolled, owned_classroom, visible_classroom};
use crate::config::Config;
use crate::dashboard::percentage;
use crate::face::{self, encode_face, Embedding, FaceMatch, SharedEncoder};
use crate::geo::{self, Geofence};
use crate::io::UploadForm;
use crate::models::{AttendanceRecord, AttendanceStatus, Classroom, Role};
use crate::schedule::{window_for, AttendanceWindow};
use crate::{proceeds, settle, Error, Payload};

/// Writes `status` for the day, replacing an earlier mark if there is one.
pub async fn upsert_status<'e, E>(
    executor: E,
    student_id: Uuid,
    classroom_id: Uuid,
    date: NaiveDate,
    status: AttendanceStatus,
) -> Result<AttendanceRecord, sqlx::Error>
where
    E: sqlx::Executor<'e, Database = Postgres>,
{
    sqlx::query_as::<_, AttendanceRecord>(
        "INSERT INTO attendance (uuid, student_id, classroom_id, date, status, marked_at, verification_method) \
         VALUES ($1, $2, $3, $4, $5, now(), 'manual') \
         ON CONFLICT (student_id, classroom_id, date) DO UPDATE \
         SET status = EXCLUDED.status, marked_at = now(), verification_method = 'manual' \
         RETURNING *",
    )
    .bind(Uuid::new_v4())
    .bind(student_id)
    .bind(classroom_id)
    .bind(date)
    .bind(status)
    .fetch_one(executor)
    .await
}

fn classroom_window(classroom: &Classroom, now: NaiveDateTime, config: &Config) -> Option<AttendanceWindow> {
    window_for(
        classroom.start_time,
        classroom.end_time,
        now,
        config.attendance.window_buffer_minutes,
    )
}

pub async fn mark_attendance(
    Student(student_id): Student,
    Path(classroom_id): Path<Uuid>,
    Extension(pg): Extension<PgPool>,
    Extension(config): Extension<Arc<Config>>,
    Extension(encoder): Extension<SharedEncoder>,
    multipart: Multipart,
) -> Payload<Marked> {
    settle(mark_with_face(&pg, &config, &encoder, student_id, classroom_id, multipart).await)
}

/// Window first, then the geofence.
fn admit(
    classroom: &Classroom,
    window: Option<&AttendanceWindow>,
    now: NaiveDateTime,
    location: Option<geo::Point>,
    config: &Config,
) -> Result<(), Error> {
    if let Some(window) = window {
        window.check(now)?;
    }
    let fence = geo::classroom_geofence(classroom, config.attendance.default_geofence_radius_m);
    geo::check_location(fence, location)
}

fn ensure_registered(caller: Uuid, candidates: &[(Uuid, Embedding)]) -> Result<(), Error> {
    if candidates.iter().any(|(id, _)| *id == caller) {
        Ok(())
    } else {
        Err(Error::FaceNotRecognized {
            message: "Register your face before marking attendance".to_string(),
            needs_registration: true,
        })
    }
}

/// Finds the enrolled face closest to `sample` and insists it is the caller's.
pub fn match_caller(
    caller: Uuid,
    candidates: &[(Uuid, Embedding)],
    sample: &Embedding,
    tolerance: f64,
) -> Result<FaceMatch<Uuid>, Error> {
    ensure_registered(caller, candidates)?;
    let found = face::nearest(sample, candidates, tolerance).ok_or_else(|| {
        Error::FaceNotRecognized {
            message: "Face not recognized. Please try again.".to_string(),
            needs_registration: false,
        }
    })?;
    if found.id != caller {
        log::warn!("Face mismatch: session {} matched {}", caller, found.id);
        return Err(Error::FaceMismatch {
            message: "Detected face does not match logged-in user".to_string(),
        });
    }
    Ok(found)
}

async fn mark_with_face(
    pg: &PgPool,
    config: &Config,
    encoder: &SharedEncoder,
    student_id: Uuid,
    classroom_id: Uuid,
    multipart: Multipart,
) -> Result<Marked, Error> {
    let classroom = enrolled_classroom(pg, classroom_id, student_id).await?;
    let now = Local::now().naive_local();
    let window = classroom_window(&classroom, now, config);

    let mut form = UploadForm::read(multipart, config.max_upload_bytes).await?;
    let location = geo::parse_location(form.field("latitude"), form.field("longitude"))?;
    admit(&classroom, window.as_ref(), now, location, config)?;
    let image = form.take_image("face_image", config.max_upload_bytes)?;

    let rows: Vec<(Uuid, Vec<u8>)> = sqlx::query_as(
        "SELECT u.uuid, u.face_encoding FROM users u \
         JOIN classroom_students cs ON cs.student_id = u.uuid \
         WHERE cs.classroom_id = $1 AND u.face_encoding IS NOT NULL \
         ORDER BY u.uuid",
    )
    .bind(classroom_id)
    .fetch_all(pg)
    .await?;
    let candidates = face::decode_candidates(rows);
    ensure_registered(student_id, &candidates)?;

    let sample = encode_face(encoder.as_ref(), &image, config.face.encoding_len).await?;
    let found = match_caller(student_id, &candidates, &sample, config.face.tolerance)?;

    let full_name: String = sqlx::query_scalar("SELECT full_name FROM users WHERE uuid = $1")
        .bind(student_id)
        .fetch_one(pg)
        .await?;

    let record = sqlx::query_as::<_, AttendanceRecord>(
        "INSERT INTO attendance (uuid, student_id, classroom_id, date, status, marked_at, \
         verification_method, confidence, latitude, longitude) \
         VALUES ($1, $2, $3, $4, 'P', now(), 'face', $5, $6, $7) \
         ON CONFLICT (student_id, classroom_id, date) DO NOTHING \
         RETURNING *",
    )
    .bind(Uuid::new_v4())
    .bind(student_id)
    .bind(classroom_id)
    .bind(now.date())
    .bind(found.confidence)
    .bind(location.map(|p| p.lat))
    .bind(location.map(|p| p.lng))
    .fetch_optional(pg)
    .await?
    .ok_or_else(|| Error::AlreadyMarked {
        message: format!("Attendance already marked for {}", full_name),
    })?;

    log::info!(
        "Attendance marked for {} in {} (distance {:.4})",
        student_id,
        classroom_id,
        found.distance
    );
    Ok(Marked {
        message: format!("Attendance marked for {}", full_name),
        student_name: full_name,
        time: now.format("%H:%M:%S").to_string(),
        record,
    })
}

pub async fn attendance_window(
    Student(student_id): Student,
    Path(classroom_id): Path<Uuid>,
    Extension(pg): Extension<PgPool>,
    Extension(config): Extension<Arc<Config>>,
) -> Payload<WindowState> {
    let classroom = enrolled_classroom(&pg, classroom_id, student_id).await?;
    let now = Local::now().naive_local();
    let window = classroom_window(&classroom, now, &config);
    proceeds(WindowState {
        open: window.map(|w| w.contains(now)).unwrap_or(true),
        window,
        geofence: geo::classroom_geofence(&classroom, config.attendance.default_geofence_radius_m),
    })
}

pub async fn view_attendance(
    user: Authed,
    Path(classroom_id): Path<Uuid>,
    Extension(pg): Extension<PgPool>,
) -> Payload<AttendanceList> {
    visible_classroom(&pg, classroom_id, &user).await?;
    let records = match user.role {
        Role::Teacher => {
            sqlx::query_as::<_, AttendanceRow>(
                "SELECT a.*, u.full_name AS student_name, u.username FROM attendance a \
                 JOIN users u ON u.uuid = a.student_id \
                 WHERE a.classroom_id = $1 ORDER BY a.date DESC, u.full_name",
            )
            .bind(classroom_id)
            .fetch_all(&pg)
            .await?
        }
        _ => {
            sqlx::query_as::<_, AttendanceRow>(
                "SELECT a.*, u.full_name AS student_name, u.username FROM attendance a \
                 JOIN users u ON u.uuid = a.student_id \
                 WHERE a.classroom_id = $1 AND a.student_id = $2 ORDER BY a.date DESC",
            )
            .bind(classroom_id)
            .bind(user.user_id)
            .fetch_all(&pg)
            .await?
        }
    };
    proceeds(AttendanceList { records })
}

pub async fn day_sheet(
    Teacher(teacher_id): Teacher,
    Path(classroom_id): Path<Uuid>,
    Query(query): Query<SheetQuery>,
    Extension(pg): Extension<PgPool>,
) -> Payload<DaySheet> {
    owned_classroom(&pg, classroom_id, teacher_id).await?;
    let date = query.date.unwrap_or_else(|| Local::now().naive_local().date());
    let entries = sqlx::query_as::<_, SheetEntry>(
        "SELECT u.uuid AS student_id, u.full_name, u.roll_number, u.profile_image, \
                a.status, a.marked_at \
         FROM users u \
         JOIN classroom_students cs ON cs.student_id = u.uuid \
         LEFT JOIN attendance a ON a.student_id = u.uuid \
              AND a.classroom_id = cs.classroom_id AND a.date = $2 \
         WHERE cs.classroom_id = $1 \
         ORDER BY u.roll_number NULLS LAST, u.full_name",
    )
    .bind(classroom_id)
    .bind(date)
    .fetch_all(&pg)
    .await?;
    let (marked, missing) = split_sheet(entries);
    proceeds(DaySheet {
        date,
        marked,
        missing,
    })
}

pub fn split_sheet(entries: Vec<SheetEntry>) -> (Vec<SheetEntry>, Vec<SheetEntry>) {
    entries.into_iter().partition(|entry| entry.status.is_some())
}

pub async fn set_attendance(
    Teacher(teacher_id): Teacher,
    Path(classroom_id): Path<Uuid>,
    Extension(pg): Extension<PgPool>,
    Json(body): Json<SetAttendance>,
) -> Payload<AttendanceRecord> {
    owned_classroom(&pg, classroom_id, teacher_id).await?;
    if !is_enrolled(&pg, body.student_id, classroom_id).await? {
        return Err(Error::invalid("Student is not enrolled in this classroom"));
    }
    let date = body.date.unwrap_or_else(|| Local::now().naive_local().date());
    let record = upsert_status(&pg, body.student_id, classroom_id, date, body.status).await?;
    log::info!(
        "Attendance for {} in {} on {} set to {}",
        body.student_id,
        classroom_id,
        date,
        body.status.code()
    );
    proceeds(record)
}

pub async fn attendance_stats(
    user: Authed,
    Path(classroom_id): Path<Uuid>,
    Extension(pg): Extension<PgPool>,
) -> Payload<DailyStats> {
    visible_classroom(&pg, classroom_id, &user).await?;
    let days = sqlx::query_as::<_, DayStat>(
        "SELECT date, \
                COUNT(*) FILTER (WHERE status = 'P') AS present, \
                COUNT(*) FILTER (WHERE status = 'A') AS absent, \
                COUNT(*) FILTER (WHERE status = 'L') AS leave, \
                COUNT(*) AS total \
         FROM attendance WHERE classroom_id = $1 \
         GROUP BY date ORDER BY date DESC LIMIT 30",
    )
    .bind(classroom_id)
    .fetch_all(&pg)
    .await?;
    proceeds(DailyStats { days })
}

pub async fn export_attendance(
    Teacher(teacher_id): Teacher,
    Path(classroom_id): Path<Uuid>,
    Extension(pg): Extension<PgPool>,
) -> Result<(HeaderMap, String), Error> {
    let classroom = owned_classroom(&pg, classroom_id, teacher_id).await?;

    let students = sqlx::query_as::<_, ReportStudent>(
        "SELECT u.uuid, u.roll_number, u.full_name, u.email FROM users u \
         JOIN classroom_students cs ON cs.student_id = u.uuid \
         WHERE cs.classroom_id = $1 ORDER BY u.roll_number NULLS LAST, u.full_name",
    )
    .bind(classroom_id)
    .fetch_all(&pg)
    .await?;

    let marks: Vec<(Uuid, NaiveDate, AttendanceStatus)> = sqlx::query_as(
        "SELECT student_id, date, status FROM attendance WHERE classroom_id = $1 ORDER BY date",
    )
    .bind(classroom_id)
    .fetch_all(&pg)
    .await?;

    let csv = render_report(&students, &marks);
    let filename = format!("attendance_{}.csv", classroom.class_code);

    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/csv; charset=utf-8"),
    );
    headers.insert(
        header::CONTENT_DISPOSITION,
        HeaderValue::from_str(&format!("attachment; filename=\"{}\"", filename))
            .unwrap_or(HeaderValue::from_static("attachment")),
    );
    Ok((headers, csv))
}

/// Quotes a CSV cell. Cells that a spreadsheet would read as a formula get a
/// leading `'`.
fn esc(s: &str) -> String {
    let cell = match s.chars().next() {
        Some('=' | '+' | '-' | '@') => format!("'{}", s),
        _ => s.to_string(),
    };
    if cell.contains(|c: char| matches!(c, ',' | '"' | '\n' | '\r')) {
        format!("\"{}\"", cell.replace('"', "\"\""))
    } else {
        cell
    }
}

/// One row per student, one column per date that has any mark, then totals.
pub fn render_report(
    students: &[ReportStudent],
    marks: &[(Uuid, NaiveDate, AttendanceStatus)],
) -> String {
    let mut dates: Vec<NaiveDate> = marks.iter().map(|(_, date, _)| *date).collect();
    dates.sort();
    dates.dedup();

    let cells: HashMap<(Uuid, NaiveDate), AttendanceStatus> = marks
        .iter()
        .map(|(student, date, status)| ((*student, *date), *status))
        .collect();

    let mut csv = String::from("Roll No,Name,Email");
    for date in &dates {
        csv.push(',');
        csv.push_str(&date.format("%Y-%m-%d").to_string());
    }
    csv.push_str(",Present,Total,Percentage\n");

    for student in students {
        let mut present = 0;
        let mut total = 0;
        let mut row = format!(
            "{},{},{}",
            esc(student.roll_number.as_deref().unwrap_or("")),
            esc(&student.full_name),
            esc(&student.email)
        );
        for date in &dates {
            row.push(',');
            if let Some(status) = cells.get(&(student.uuid, *date)) {
                total += 1;
                if *status == AttendanceStatus::Present {
                    present += 1;
                }
                row.push_str(status.code());
            }
        }
        row.push_str(&format!(
            ",{},{},{:.1}\n",
            present,
            total,
            percentage(present, total)
        ));
        csv.push_str(&row);
    }
    csv
}

#[derive(Debug, Clone, Serialize)]
pub struct Marked {
    pub message: String,
    pub student_name: String,
    pub time: String,
    pub record: AttendanceRecord,
}

#[derive(Debug, Clone, Serialize)]
pub struct WindowState {
    pub open: bool,
    pub window: Option<AttendanceWindow>,
    pub geofence: Option<Geofence>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct AttendanceRow {
    #[serde(flatten)]
    #[sqlx(flatten)]
    pub record: AttendanceRecord,
    pub student_name: String,
    pub username: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct AttendanceList {
    pub records: Vec<AttendanceRow>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SheetQuery {
    pub date: Option<NaiveDate>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct SheetEntry {
    pub student_id: Uuid,
    pub full_name: String,
    pub roll_number: Option<String>,
    pub profile_image: Option<String>,
    pub status: Option<AttendanceStatus>,
    pub marked_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DaySheet {
    pub date: NaiveDate,
    pub marked: Vec<SheetEntry>,
    pub missing: Vec<SheetEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SetAttendance {
    pub student_id: Uuid,
    pub date: Option<NaiveDate>,
    pub status: AttendanceStatus,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct DayStat {
    pub date: NaiveDate,
    pub present: i64,
    pub absent: i64,
    pub leave: i64,
    pub total: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DailyStats {
    pub days: Vec<DayStat>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ReportStudent {
    pub uuid: Uuid,
    pub roll_number: Option<String>,
    pub full_name: String,
    pub email: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 9, d).unwrap()
    }

    fn entry(name: &str, status: Option<AttendanceStatus>) -> SheetEntry {
        SheetEntry {
            student_id: Uuid::new_v4(),
            full_name: name.to_string(),
            roll_number: None,
            profile_image: None,
            status,
            marked_at: None,
        }
    }

    #[test]
    fn sheet_splits_marked_from_missing() {
        let (marked, missing) = split_sheet(vec![
            entry("Asha", Some(AttendanceStatus::Present)),
            entry("Ravi", None),
            entry("Meera", Some(AttendanceStatus::Leave)),
        ]);
        let names = |v: &[SheetEntry]| v.iter().map(|e| e.full_name.clone()).collect::<Vec<_>>();
        assert_eq!(names(&marked), vec!["Asha", "Meera"]);
        assert_eq!(names(&missing), vec!["Ravi"]);
    }

    #[test]
    fn report_has_a_column_per_marked_date() {
        let asha = ReportStudent {
            uuid: Uuid::new_v4(),
            roll_number: Some("R01".into()),
            full_name: "Asha Rao".into(),
            email: "asha@example.edu".into(),
        };
        let ravi = ReportStudent {
            uuid: Uuid::new_v4(),
            roll_number: None,
            full_name: "Ravi, K".into(),
            email: "ravi@example.edu".into(),
        };
        let marks = vec![
            (asha.uuid, day(2), AttendanceStatus::Present),
            (asha.uuid, day(3), AttendanceStatus::Absent),
            (ravi.uuid, day(3), AttendanceStatus::Leave),
            (asha.uuid, day(4), AttendanceStatus::Present),
        ];

        let csv = render_report(&[asha, ravi], &marks);
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(
            lines[0],
            "Roll No,Name,Email,2024-09-02,2024-09-03,2024-09-04,Present,Total,Percentage"
        );
        assert_eq!(lines[1], "R01,Asha Rao,asha@example.edu,P,A,P,2,3,66.7");
        assert_eq!(lines[2], ",\"Ravi, K\",ravi@example.edu,,L,,0,1,0.0");
    }

    #[test]
    fn empty_report_is_just_a_header() {
        assert_eq!(
            render_report(&[], &[]),
            "Roll No,Name,Email,Present,Total,Percentage\n"
        );
    }

    #[test]
    fn manual_mark_body() {
        let body: SetAttendance = serde_json::from_str(&format!(
            r#"{{"student_id":"{}","date":"2024-09-02","status":"A"}}"#,
            Uuid::nil()
        ))
        .unwrap();
        assert_eq!(body.status, AttendanceStatus::Absent);
        assert_eq!(body.date, Some(day(2)));
    }

    #[test]
    fn csv_cells_are_quoted_and_defused() {
        assert_eq!(esc("Asha Rao"), "Asha Rao");
        assert_eq!(esc("line\rbreak"), "\"line\rbreak\"");
        assert_eq!(esc("say \"hi\""), "\"say \"\"hi\"\"\"");
        assert_eq!(esc("=HYPERLINK(\"x\")"), "\"'=HYPERLINK(\"\"x\"\")\"");
        assert_eq!(esc("+91 98450"), "'+91 98450");
        assert_eq!(esc("-1"), "'-1");
        assert_eq!(esc("@sum"), "'@sum");
        assert_eq!(esc(""), "");
    }

    fn face(v: f64) -> Embedding {
        Embedding(vec![v, 0.0])
    }

    #[test]
    fn caller_must_own_the_nearest_face() {
        let me = Uuid::new_v4();
        let other = Uuid::new_v4();
        let candidates = vec![(me, face(0.0)), (other, face(1.0))];

        let found = match_caller(me, &candidates, &face(0.1), 0.6).unwrap();
        assert_eq!(found.id, me);
        assert!(found.confidence > 0.8);

        assert!(matches!(
            match_caller(me, &candidates, &face(0.95), 0.6),
            Err(Error::FaceMismatch { .. })
        ));
    }

    #[test]
    fn unregistered_caller_is_told_to_register() {
        let me = Uuid::new_v4();
        let candidates = vec![(Uuid::new_v4(), face(0.0))];
        match match_caller(me, &candidates, &face(0.0), 0.6) {
            Err(Error::FaceNotRecognized {
                needs_registration, ..
            }) => assert!(needs_registration),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn distant_face_is_not_recognized() {
        let me = Uuid::new_v4();
        let candidates = vec![(me, face(0.0))];
        match match_caller(me, &candidates, &face(2.0), 0.6) {
            Err(Error::FaceNotRecognized {
                needs_registration, ..
            }) => assert!(!needs_registration),
            other => panic!("unexpected {:?}", other),
        }
    }

    fn fenced_classroom() -> Classroom {
        Classroom {
            uuid: Uuid::new_v4(),
            teacher_id: Uuid::new_v4(),
            class_name: "Physics".into(),
            class_code: "PHY101".into(),
            description: String::new(),
            start_time: chrono::NaiveTime::from_hms_opt(10, 0, 0),
            end_time: chrono::NaiveTime::from_hms_opt(11, 0, 0),
            schedule_days: None,
            schedule_time: String::new(),
            venue: String::new(),
            venue_lat: Some(12.9716),
            venue_lng: Some(77.5946),
            geofence_radius_m: Some(100.0),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn window_is_checked_before_location() {
        let classroom = fenced_classroom();
        let config = Config::default();
        let at = |h, m| day(2).and_hms_opt(h, m, 0).unwrap();
        let gate = |now: NaiveDateTime, location| {
            let window = classroom_window(&classroom, now, &config);
            admit(&classroom, window.as_ref(), now, location, &config)
        };
        let far = Some(geo::Point::new(13.5, 78.0));
        let near = Some(geo::Point::new(12.9716, 77.5946));

        assert!(matches!(gate(at(8, 0), None), Err(Error::OutsideWindow { .. })));
        assert!(matches!(gate(at(8, 0), far), Err(Error::OutsideWindow { .. })));
        assert!(matches!(gate(at(9, 50), None), Err(Error::LocationRequired { .. })));
        assert!(matches!(gate(at(10, 30), far), Err(Error::OutsideGeofence { .. })));
        assert!(gate(at(11, 15), near).is_ok());
    }

    /// Needs a scratch Postgres in `DATABASE_URL`; skipped otherwise.
    #[tokio::test]
    async fn face_mark_twice_reports_already_marked() {
        use crate::face::tests::{png_bytes, FixedEncoder};
        use crate::io::tests::{form_body, Part};
        use axum::body::Body;
        use axum::http::{Request, StatusCode};
        use tower::ServiceExt;

        let url = match std::env::var("DATABASE_URL") {
            Ok(url) => url,
            Err(_) => return,
        };
        let pg = sqlx::postgres::PgPoolOptions::new()
            .max_connections(2)
            .connect(&url)
            .await
            .unwrap();
        sqlx::migrate!("./migrations").run(&pg).await.unwrap();

        let teacher = Uuid::new_v4();
        let student = Uuid::new_v4();
        let classroom = Uuid::new_v4();
        let known = Embedding(vec![0.25; 128]);
        for (id, role) in [(teacher, Role::Teacher), (student, Role::Student)] {
            sqlx::query(
                "INSERT INTO users (uuid, role, username, password_hash, full_name) VALUES ($1, $2, $3, 'x', 'Asha Rao')",
            )
            .bind(id)
            .bind(role)
            .bind(id.to_string())
            .execute(&pg)
            .await
            .unwrap();
        }
        sqlx::query("UPDATE users SET face_encoding = $2 WHERE uuid = $1")
            .bind(student)
            .bind(known.to_bytes().unwrap())
            .execute(&pg)
            .await
            .unwrap();
        sqlx::query("INSERT INTO classrooms (uuid, teacher_id, class_name, class_code) VALUES ($1, $2, 'Physics', $3)")
            .bind(classroom)
            .bind(teacher)
            .bind(classroom.simple().to_string())
            .execute(&pg)
            .await
            .unwrap();
        sqlx::query("INSERT INTO classroom_students (student_id, classroom_id) VALUES ($1, $2)")
            .bind(student)
            .bind(classroom)
            .execute(&pg)
            .await
            .unwrap();
        let session = crate::auth::open_session(&pg, student, Role::Student, 1)
            .await
            .unwrap();

        let app = crate::router(
            pg.clone(),
            Arc::new(Config::default()),
            Arc::new(FixedEncoder(Some(known.clone()))),
        );
        let mut replies = Vec::new();
        for _ in 0..2 {
            let (content_type, body) =
                form_body(vec![Part::File("face_image", "face.png", png_bytes())]);
            let request = Request::builder()
                .method("POST")
                .uri(format!("/classrooms/{}/attendance", classroom))
                .header("content-type", content_type)
                .header(crate::auth::SESSION_HEADER, &session.session_id)
                .body(Body::from(body))
                .unwrap();
            let response = app.clone().oneshot(request).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
            replies.push(serde_json::from_slice::<serde_json::Value>(&bytes).unwrap());
        }

        assert_eq!(replies[0]["success"], true, "{}", replies[0]);
        assert_eq!(replies[0]["student_name"], "Asha Rao");
        assert_eq!(replies[0]["record"]["verification_method"], "face");
        assert_eq!(replies[1]["success"], false);
        assert_eq!(replies[1]["error"], "AlreadyMarked");

        sqlx::query("DELETE FROM users WHERE uuid = $1 OR uuid = $2")
            .bind(teacher)
            .bind(student)
            .execute(&pg)
            .await
            .unwrap();
    }

    /// Needs a scratch Postgres in `DATABASE_URL`; skipped otherwise.
    #[tokio::test]
    async fn one_mark_per_student_per_day() {
        let url = match std::env::var("DATABASE_URL") {
            Ok(url) => url,
            Err(_) => return,
        };
        let pg = sqlx::postgres::PgPoolOptions::new()
            .max_connections(2)
            .connect(&url)
            .await
            .unwrap();
        sqlx::migrate!("./migrations").run(&pg).await.unwrap();

        let teacher = Uuid::new_v4();
        let student = Uuid::new_v4();
        let classroom = Uuid::new_v4();
        for (id, role) in [(teacher, Role::Teacher), (student, Role::Student)] {
            sqlx::query("INSERT INTO users (uuid, role, username, password_hash) VALUES ($1, $2, $3, 'x')")
                .bind(id)
                .bind(role)
                .bind(id.to_string())
                .execute(&pg)
                .await
                .unwrap();
        }
        sqlx::query("INSERT INTO classrooms (uuid, teacher_id, class_name, class_code) VALUES ($1, $2, 'Physics', $3)")
            .bind(classroom)
            .bind(teacher)
            .bind(classroom.simple().to_string())
            .execute(&pg)
            .await
            .unwrap();

        let date = day(2);
        upsert_status(&pg, student, classroom, date, AttendanceStatus::Absent).await.unwrap();
        let second = upsert_status(&pg, student, classroom, date, AttendanceStatus::Leave).await.unwrap();
        assert_eq!(second.status, AttendanceStatus::Leave);
        assert_eq!(second.verification_method, Some(crate::models::VerificationMethod::Manual));

        let duplicate = sqlx::query(
            "INSERT INTO attendance (uuid, student_id, classroom_id, date, status) VALUES ($1, $2, $3, $4, 'P') \
             ON CONFLICT (student_id, classroom_id, date) DO NOTHING",
        )
        .bind(Uuid::new_v4())
        .bind(student)
        .bind(classroom)
        .bind(date)
        .execute(&pg)
        .await
        .unwrap();
        assert_eq!(duplicate.rows_affected(), 0);

        let rows: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM attendance WHERE student_id = $1 AND classroom_id = $2 AND date = $3",
        )
        .bind(student)
        .bind(classroom)
        .bind(date)
        .fetch_one(&pg)
        .await
        .unwrap();
        assert_eq!(rows, 1);

        sqlx::query("DELETE FROM users WHERE uuid = $1 OR uuid = $2")
            .bind(teacher)
            .bind(student)
            .execute(&pg)
            .await
            .unwrap();
    }
}
