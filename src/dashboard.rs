use axum::Extension;
use chrono::{Duration, Local, NaiveDate};
use serde::Serialize;
use sqlx::PgPool;
use uuid::Uuid;

use crate::auth::{Parent, Student, Teacher};
use crate::models::{AttendanceRecord, ClassroomEvent, UserData};
use crate::{proceeds, Error, Payload};

const RECENT_LIMIT: i64 = 20;
const UPCOMING_DAYS: i64 = 7;
const UPCOMING_PER_CLASS: i64 = 5;

/// Share of `part` in `whole` as a percentage with one decimal, 0 for an empty whole.
pub fn percentage(part: i64, whole: i64) -> f64 {
    if whole <= 0 {
        return 0.0;
    }
    (part as f64 * 1000.0 / whole as f64).round() / 10.0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Standing {
    Good,
    Warning,
    Critical,
}

pub fn standing(percentage: f64) -> Standing {
    if percentage >= 75.0 {
        Standing::Good
    } else if percentage >= 60.0 {
        Standing::Warning
    } else {
        Standing::Critical
    }
}

/// Difference in present marks against the previous day, absolute and relative.
/// Both are zero when nothing was marked the day before.
pub fn change_since(today: i64, yesterday: i64) -> (i64, f64) {
    if yesterday <= 0 {
        return (0, 0.0);
    }
    let change = today - yesterday;
    (change, percentage(change, yesterday))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct Counts {
    pub present: i64,
    pub absent: i64,
    pub leave: i64,
    pub total: i64,
}

impl Counts {
    pub fn percentage(&self) -> f64 {
        percentage(self.present, self.total)
    }

    pub fn add(&mut self, other: &Counts) {
        self.present += other.present;
        self.absent += other.absent;
        self.leave += other.leave;
        self.total += other.total;
    }
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ClassTally {
    pub classroom_id: Uuid,
    pub class_name: String,
    pub class_code: String,
    pub schedule_time: String,
    pub venue: String,
    pub teacher_name: String,
    #[sqlx(flatten)]
    #[serde(flatten)]
    pub counts: Counts,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClassAttendance {
    #[serde(flatten)]
    pub class: ClassTally,
    pub percentage: f64,
    pub standing: Standing,
}

impl From<ClassTally> for ClassAttendance {
    fn from(class: ClassTally) -> Self {
        let percentage = class.counts.percentage();
        Self {
            percentage,
            standing: standing(percentage),
            class,
        }
    }
}

async fn class_attendance(pg: &PgPool, student_id: Uuid) -> Result<Vec<ClassAttendance>, Error> {
    let rows = sqlx::query_as::<_, ClassTally>(
        "SELECT c.uuid AS classroom_id, c.class_name, c.class_code, c.schedule_time, c.venue, \
                t.full_name AS teacher_name, \
                COUNT(a.uuid) FILTER (WHERE a.status = 'P') AS present, \
                COUNT(a.uuid) FILTER (WHERE a.status = 'A') AS absent, \
                COUNT(a.uuid) FILTER (WHERE a.status = 'L') AS leave, \
                COUNT(a.uuid) AS total \
         FROM classrooms c \
         JOIN classroom_students cs ON cs.classroom_id = c.uuid AND cs.student_id = $1 \
         JOIN users t ON t.uuid = c.teacher_id \
         LEFT JOIN attendance a ON a.classroom_id = c.uuid AND a.student_id = $1 \
         GROUP BY c.uuid, t.full_name \
         ORDER BY c.class_name",
    )
    .bind(student_id)
    .fetch_all(pg)
    .await?;
    Ok(rows.into_iter().map(ClassAttendance::from).collect())
}

fn overall(classes: &[ClassAttendance]) -> Counts {
    let mut counts = Counts::default();
    for class in classes {
        counts.add(&class.class.counts);
    }
    counts
}

async fn recent_for_student(pg: &PgPool, student_id: Uuid) -> Result<Vec<RecentRecord>, Error> {
    let records = sqlx::query_as::<_, RecentRecord>(
        "SELECT a.*, u.full_name AS student_name, c.class_name FROM attendance a \
         JOIN users u ON u.uuid = a.student_id \
         JOIN classrooms c ON c.uuid = a.classroom_id \
         WHERE a.student_id = $1 ORDER BY a.date DESC, a.marked_at DESC LIMIT $2",
    )
    .bind(student_id)
    .bind(RECENT_LIMIT)
    .fetch_all(pg)
    .await?;
    Ok(records)
}

async fn load_student(pg: &PgPool, student_id: Uuid) -> Result<UserData, Error> {
    sqlx::query_as::<_, UserData>("SELECT * FROM users WHERE uuid = $1 AND role = 'student'")
        .bind(student_id)
        .fetch_optional(pg)
        .await?
        .ok_or_else(|| Error::UserDoesNotExist {
            message: "Student not found".to_string(),
        })
}

pub async fn student_dashboard(
    Student(student_id): Student,
    Extension(pg): Extension<PgPool>,
) -> Payload<StudentDashboard> {
    let student = load_student(&pg, student_id).await?;
    let classrooms = class_attendance(&pg, student_id).await?;
    let totals = overall(&classrooms);
    let today = Local::now().naive_local().date();

    let marked_today = sqlx::query_as::<_, MarkedToday>(
        "SELECT a.classroom_id, c.class_name, a.status, a.marked_at FROM attendance a \
         JOIN classrooms c ON c.uuid = a.classroom_id \
         WHERE a.student_id = $1 AND a.date = $2 ORDER BY a.marked_at",
    )
    .bind(student_id)
    .bind(today)
    .fetch_all(&pg)
    .await?;

    let upcoming_events = sqlx::query_as::<_, UpcomingEvent>(
        "SELECT * FROM ( \
             SELECT e.*, c.class_name, ROW_NUMBER() OVER ( \
                 PARTITION BY e.classroom_id ORDER BY e.event_date, e.event_time NULLS LAST \
             ) AS pos \
             FROM classroom_events e \
             JOIN classrooms c ON c.uuid = e.classroom_id \
             JOIN classroom_students cs ON cs.classroom_id = e.classroom_id \
             WHERE cs.student_id = $1 AND e.event_date BETWEEN $2 AND $3 \
         ) ranked WHERE pos <= $4 \
         ORDER BY event_date, event_time NULLS LAST",
    )
    .bind(student_id)
    .bind(today)
    .bind(today + Duration::days(UPCOMING_DAYS))
    .bind(UPCOMING_PER_CLASS)
    .fetch_all(&pg)
    .await?;

    proceeds(StudentDashboard {
        full_name: student.full_name.clone(),
        face_registered: student.face_registered(),
        roll_number_missing: student.roll_number.is_none(),
        overall_percentage: totals.percentage(),
        overall: totals,
        classrooms,
        marked_today,
        upcoming_events,
    })
}

/// Attendance marks across every classroom of a teacher, optionally for one day.
async fn teacher_counts(
    pg: &PgPool,
    teacher_id: Uuid,
    date: Option<NaiveDate>,
) -> Result<Counts, Error> {
    let counts = sqlx::query_as::<_, Counts>(
        "SELECT COUNT(*) FILTER (WHERE a.status = 'P') AS present, \
                COUNT(*) FILTER (WHERE a.status = 'A') AS absent, \
                COUNT(*) FILTER (WHERE a.status = 'L') AS leave, \
                COUNT(*) AS total \
         FROM attendance a JOIN classrooms c ON c.uuid = a.classroom_id \
         WHERE c.teacher_id = $1 AND ($2::date IS NULL OR a.date = $2)",
    )
    .bind(teacher_id)
    .bind(date)
    .fetch_one(pg)
    .await?;
    Ok(counts)
}

pub async fn teacher_dashboard(
    Teacher(teacher_id): Teacher,
    Extension(pg): Extension<PgPool>,
) -> Payload<TeacherDashboard> {
    let today = Local::now().naive_local().date();

    let classrooms = sqlx::query_as::<_, TeacherClass>(
        "SELECT c.uuid AS classroom_id, c.class_name, c.class_code, c.schedule_time, c.venue, \
                (SELECT COUNT(*) FROM classroom_students cs WHERE cs.classroom_id = c.uuid) AS student_count, \
                (SELECT COUNT(*) FROM attendance a \
                 WHERE a.classroom_id = c.uuid AND a.date = $2 AND a.status = 'P') AS present_today \
         FROM classrooms c WHERE c.teacher_id = $1 ORDER BY c.created_at DESC",
    )
    .bind(teacher_id)
    .bind(today)
    .fetch_all(&pg)
    .await?;

    let recent = sqlx::query_as::<_, RecentRecord>(
        "SELECT a.*, u.full_name AS student_name, c.class_name FROM attendance a \
         JOIN users u ON u.uuid = a.student_id \
         JOIN classrooms c ON c.uuid = a.classroom_id \
         WHERE c.teacher_id = $1 ORDER BY a.date DESC, a.marked_at DESC LIMIT $2",
    )
    .bind(teacher_id)
    .bind(RECENT_LIMIT)
    .fetch_all(&pg)
    .await?;

    let today_counts = teacher_counts(&pg, teacher_id, Some(today)).await?;
    let yesterday = teacher_counts(&pg, teacher_id, Some(today - Duration::days(1))).await?;
    let all_time = teacher_counts(&pg, teacher_id, None).await?;
    let (present_change, present_change_percentage) =
        change_since(today_counts.present, yesterday.present);

    proceeds(TeacherDashboard {
        date: today,
        classrooms,
        recent,
        today: today_counts,
        attendance_percentage: all_time.percentage(),
        present_change,
        present_change_percentage,
    })
}

/// One entry per day of the week ending at `today`, zero-filled.
pub fn fill_week(today: NaiveDate, rows: &[(NaiveDate, i64, i64)]) -> Vec<DayTrend> {
    (0..7)
        .rev()
        .map(|back| {
            let date = today - Duration::days(back);
            let (present, absent) = rows
                .iter()
                .find(|(d, _, _)| *d == date)
                .map(|(_, p, a)| (*p, *a))
                .unwrap_or((0, 0));
            DayTrend {
                date,
                day_name: date.format("%a").to_string(),
                present,
                absent,
            }
        })
        .collect()
}

pub async fn teacher_trends(
    Teacher(teacher_id): Teacher,
    Extension(pg): Extension<PgPool>,
) -> Payload<Trends> {
    let today = Local::now().naive_local().date();

    let rows: Vec<(NaiveDate, i64, i64)> = sqlx::query_as(
        "SELECT a.date, \
                COUNT(*) FILTER (WHERE a.status = 'P'), \
                COUNT(*) FILTER (WHERE a.status = 'A') \
         FROM attendance a JOIN classrooms c ON c.uuid = a.classroom_id \
         WHERE c.teacher_id = $1 AND a.date BETWEEN $2 AND $3 \
         GROUP BY a.date ORDER BY a.date",
    )
    .bind(teacher_id)
    .bind(today - Duration::days(6))
    .bind(today)
    .fetch_all(&pg)
    .await?;

    let class_distribution = sqlx::query_as::<_, ClassSize>(
        "SELECT c.class_name, COUNT(cs.student_id) AS student_count FROM classrooms c \
         LEFT JOIN classroom_students cs ON cs.classroom_id = c.uuid \
         WHERE c.teacher_id = $1 GROUP BY c.uuid ORDER BY c.class_name",
    )
    .bind(teacher_id)
    .fetch_all(&pg)
    .await?;

    proceeds(Trends {
        weekly: fill_week(today, &rows),
        class_distribution,
        distribution: teacher_counts(&pg, teacher_id, None).await?,
    })
}

pub async fn parent_dashboard(
    Parent(student_id): Parent,
    Extension(pg): Extension<PgPool>,
) -> Payload<ParentDashboard> {
    let student = load_student(&pg, student_id).await?;
    let classrooms = class_attendance(&pg, student_id).await?;
    let totals = overall(&classrooms);
    let recent = recent_for_student(&pg, student_id).await?;
    let overall_percentage = totals.percentage();

    proceeds(ParentDashboard {
        student: ChildProfile {
            full_name: student.full_name,
            roll_number: student.roll_number,
            email: student.email,
            phone: student.phone,
            profile_image: student.profile_image,
        },
        classrooms,
        recent,
        overall: totals,
        overall_percentage,
        standing: standing(overall_percentage),
    })
}

pub async fn my_stats(
    Student(student_id): Student,
    Extension(pg): Extension<PgPool>,
) -> Payload<MyStats> {
    let (total_days, present_days): (i64, i64) = sqlx::query_as(
        "SELECT COUNT(*), COUNT(*) FILTER (WHERE status = 'P') FROM attendance WHERE student_id = $1",
    )
    .bind(student_id)
    .fetch_one(&pg)
    .await?;
    proceeds(MyStats {
        total_days,
        present_days,
        attendance_percentage: percentage(present_days, total_days),
    })
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct RecentRecord {
    #[sqlx(flatten)]
    #[serde(flatten)]
    pub record: AttendanceRecord,
    pub student_name: String,
    pub class_name: String,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct MarkedToday {
    pub classroom_id: Uuid,
    pub class_name: String,
    pub status: crate::models::AttendanceStatus,
    pub marked_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct UpcomingEvent {
    #[sqlx(flatten)]
    #[serde(flatten)]
    pub event: ClassroomEvent,
    pub class_name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct StudentDashboard {
    pub full_name: String,
    pub face_registered: bool,
    pub roll_number_missing: bool,
    pub classrooms: Vec<ClassAttendance>,
    pub overall: Counts,
    pub overall_percentage: f64,
    pub marked_today: Vec<MarkedToday>,
    pub upcoming_events: Vec<UpcomingEvent>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct TeacherClass {
    pub classroom_id: Uuid,
    pub class_name: String,
    pub class_code: String,
    pub schedule_time: String,
    pub venue: String,
    pub student_count: i64,
    pub present_today: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TeacherDashboard {
    pub date: NaiveDate,
    pub classrooms: Vec<TeacherClass>,
    pub recent: Vec<RecentRecord>,
    pub today: Counts,
    pub attendance_percentage: f64,
    pub present_change: i64,
    pub present_change_percentage: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DayTrend {
    pub date: NaiveDate,
    pub day_name: String,
    pub present: i64,
    pub absent: i64,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ClassSize {
    pub class_name: String,
    pub student_count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Trends {
    pub weekly: Vec<DayTrend>,
    pub class_distribution: Vec<ClassSize>,
    pub distribution: Counts,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChildProfile {
    pub full_name: String,
    pub roll_number: Option<String>,
    pub email: String,
    pub phone: Option<String>,
    pub profile_image: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParentDashboard {
    pub student: ChildProfile,
    pub classrooms: Vec<ClassAttendance>,
    pub recent: Vec<RecentRecord>,
    pub overall: Counts,
    pub overall_percentage: f64,
    pub standing: Standing,
}

#[derive(Debug, Clone, Serialize)]
pub struct MyStats {
    pub total_days: i64,
    pub present_days: i64,
    pub attendance_percentage: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentages_round_to_one_decimal() {
        assert_eq!(percentage(0, 0), 0.0);
        assert_eq!(percentage(2, 3), 66.7);
        assert_eq!(percentage(1, 8), 12.5);
        assert_eq!(percentage(5, 5), 100.0);
    }

    #[test]
    fn standing_thresholds() {
        assert_eq!(standing(75.0), Standing::Good);
        assert_eq!(standing(74.9), Standing::Warning);
        assert_eq!(standing(60.0), Standing::Warning);
        assert_eq!(standing(59.9), Standing::Critical);
        assert_eq!(serde_json::to_value(Standing::Critical).unwrap(), "Critical");
    }

    #[test]
    fn change_against_yesterday() {
        assert_eq!(change_since(12, 0), (0, 0.0));
        assert_eq!(change_since(12, 10), (2, 20.0));
        assert_eq!(change_since(5, 10), (-5, -50.0));
    }

    #[test]
    fn counts_add_up() {
        let mut total = Counts::default();
        total.add(&Counts { present: 3, absent: 1, leave: 0, total: 4 });
        total.add(&Counts { present: 0, absent: 1, leave: 1, total: 2 });
        assert_eq!(total, Counts { present: 3, absent: 2, leave: 1, total: 6 });
        assert_eq!(total.percentage(), 50.0);
    }

    #[test]
    fn week_is_zero_filled_and_ordered() {
        let today = NaiveDate::from_ymd_opt(2024, 9, 8).unwrap();
        let rows = vec![(NaiveDate::from_ymd_opt(2024, 9, 4).unwrap(), 7, 2), (today, 9, 1)];
        let week = fill_week(today, &rows);
        assert_eq!(week.len(), 7);
        assert_eq!(week[0].date, NaiveDate::from_ymd_opt(2024, 9, 2).unwrap());
        assert_eq!(week[0].day_name, "Mon");
        assert_eq!((week[0].present, week[0].absent), (0, 0));
        assert_eq!((week[2].present, week[2].absent), (7, 2));
        assert_eq!((week[6].present, week[6].absent), (9, 1));
        assert_eq!(week[6].day_name, "Sun");
    }
}
