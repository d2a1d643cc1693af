use std::{fmt, str::FromStr, sync::Arc};

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::store::Repository;

#[derive(Clone)]
pub struct AppState {
    pub repo: Arc<dyn Repository>,
}

/* -------------------------
   Enumerations
--------------------------*/

#[derive(Debug, thiserror::Error)]
#[error("unknown {kind} `{value}`")]
pub struct ParseEnumError {
    kind: &'static str,
    value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "user_role", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Patient,
    Doctor,
    Admin,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Patient => "patient",
            Role::Doctor => "doctor",
            Role::Admin => "admin",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "appointment_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum AppointmentStatus {
    #[default]
    Scheduled,
    Completed,
    Cancelled,
    Pending,
}

impl AppointmentStatus {
    pub const ALL: [AppointmentStatus; 4] = [
        AppointmentStatus::Scheduled,
        AppointmentStatus::Completed,
        AppointmentStatus::Cancelled,
        AppointmentStatus::Pending,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            AppointmentStatus::Scheduled => "scheduled",
            AppointmentStatus::Completed => "completed",
            AppointmentStatus::Cancelled => "cancelled",
            AppointmentStatus::Pending => "pending",
        }
    }

    /// Completed and cancelled appointments are final.
    pub fn is_terminal(self) -> bool {
        match self {
            AppointmentStatus::Completed | AppointmentStatus::Cancelled => true,
            AppointmentStatus::Scheduled | AppointmentStatus::Pending => false,
        }
    }

    pub fn can_transition_to(self, next: AppointmentStatus) -> bool {
        use AppointmentStatus::*;
        match (self, next) {
            (Pending, Scheduled) | (Pending, Cancelled) => true,
            (Scheduled, Completed) | (Scheduled, Cancelled) => true,
            (Pending, _) | (Scheduled, _) | (Completed, _) | (Cancelled, _) => false,
        }
    }
}

impl fmt::Display for AppointmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AppointmentStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AppointmentStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| ParseEnumError {
                kind: "appointment status",
                value: s.to_string(),
            })
    }
}

/* -------------------------
   API DTOs
--------------------------*/

/// Booking request body. Every field is optional at the wire level so the
/// validator can report all missing fields at once.
#[derive(Debug, Default, Deserialize)]
pub struct CreateAppointmentRequest {
    pub patient_id: Option<String>,
    pub doctor_id: Option<String>,
    pub appointment_date: Option<String>,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub status: Option<String>,
    pub location: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct UpdateAppointmentRequest {
    pub appointment_date: Option<String>,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub location: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct StatusChangeRequest {
    pub status: String,
}

#[derive(Debug, Serialize)]
pub struct AppointmentMutationResponse {
    pub message: String,
    pub appointment: AppointmentView,
}

/* -------------------------
   Domain values
--------------------------*/

/// A booking that passed format validation and is ready for the
/// referential and conflict checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAppointment {
    pub patient_id: Uuid,
    pub doctor_id: Uuid,
    pub slot: Slot,
    pub status: AppointmentStatus,
    pub location: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    pub date: NaiveDate,
    pub start: NaiveTime,
    pub end: NaiveTime,
}

/// Validated edit. `None` leaves a column untouched; `Some(None)` clears it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppointmentChanges {
    /// Slot the edit was validated against; the write is refused if the
    /// stored slot no longer matches.
    pub expected_slot: Slot,
    pub slot: Option<Slot>,
    pub location: Option<Option<String>>,
    pub notes: Option<Option<String>>,
}

/* -------------------------
   DB Row Models
--------------------------*/

#[derive(Debug, Clone, Copy, FromRow)]
pub struct UserRow {
    pub id: Uuid,
    pub role: Role,
}

#[derive(Debug, Clone, Copy, FromRow)]
pub struct SessionRow {
    pub session_id: Uuid,
    pub user_id: Uuid,
    pub role: Role,
}

/// Appointment joined with the names and emails of its patient and doctor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct AppointmentView {
    pub id: Uuid,
    pub patient_id: Uuid,
    pub patient_name: String,
    pub patient_email: String,
    pub doctor_id: Uuid,
    pub doctor_name: String,
    pub doctor_email: String,
    pub appointment_date: NaiveDate,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub status: AppointmentStatus,
    pub location: Option<String>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl AppointmentView {
    pub fn slot(&self) -> Slot {
        Slot {
            date: self.appointment_date,
            start: self.start_time,
            end: self.end_time,
        }
    }
}
