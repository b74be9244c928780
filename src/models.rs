use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "account_role", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Teacher,
    Student,
    Parent,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Teacher => "teacher",
            Role::Student => "student",
            Role::Parent => "parent",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "attendance_status")]
pub enum AttendanceStatus {
    #[sqlx(rename = "P")]
    #[serde(rename = "P")]
    Present,
    #[sqlx(rename = "A")]
    #[serde(rename = "A")]
    Absent,
    #[sqlx(rename = "L")]
    #[serde(rename = "L")]
    Leave,
}

impl AttendanceStatus {
    pub fn code(&self) -> &'static str {
        match self {
            AttendanceStatus::Present => "P",
            AttendanceStatus::Absent => "A",
            AttendanceStatus::Leave => "L",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "verification_method", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum VerificationMethod {
    Face,
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "leave_status")]
pub enum LeaveStatus {
    Pending,
    Approved,
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "event_type", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Assignment,
    Exam,
    Lecture,
    Project,
    Quiz,
    Other,
}

impl Default for EventType {
    fn default() -> Self {
        EventType::Other
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct UserData {
    pub uuid: Uuid,
    pub role: Role,
    pub username: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub full_name: String,
    pub email: String,
    pub phone: Option<String>,
    pub roll_number: Option<String>,
    #[serde(skip_serializing)]
    pub parent_password_hash: Option<String>,
    pub profile_image: Option<String>,
    #[serde(skip_serializing)]
    pub face_encoding: Option<Vec<u8>>,
    pub face_registered_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl UserData {
    pub fn face_registered(&self) -> bool {
        self.face_encoding.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct UserSession {
    pub ssid: String,
    pub belongs_to: Uuid,
    pub role: Role,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Classroom {
    pub uuid: Uuid,
    pub teacher_id: Uuid,
    pub class_name: String,
    pub class_code: String,
    pub description: String,
    pub start_time: Option<NaiveTime>,
    pub end_time: Option<NaiveTime>,
    pub schedule_days: Option<String>,
    pub schedule_time: String,
    pub venue: String,
    pub venue_lat: Option<f64>,
    pub venue_lng: Option<f64>,
    pub geofence_radius_m: Option<f64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AttendanceRecord {
    pub uuid: Uuid,
    pub student_id: Uuid,
    pub classroom_id: Uuid,
    pub date: NaiveDate,
    pub status: AttendanceStatus,
    pub marked_at: DateTime<Utc>,
    pub verification_method: Option<VerificationMethod>,
    pub confidence: Option<f64>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct LeaveRecord {
    pub uuid: Uuid,
    pub student_id: Uuid,
    pub classroom_id: Uuid,
    pub date: NaiveDate,
    pub reason: String,
    pub status: LeaveStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ClassroomEvent {
    pub uuid: Uuid,
    pub classroom_id: Uuid,
    pub title: String,
    pub description: String,
    pub event_date: NaiveDate,
    pub event_time: Option<NaiveTime>,
    pub event_type: EventType,
    pub created_by: Uuid,
    pub created_at: DateTime<Utc>,
}
