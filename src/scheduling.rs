//! Booking validation and slot arithmetic.
//!
//! Everything here is pure: the handlers run these checks before touching the
//! repository, and the repositories reuse [`slots_overlap`] (or its SQL
//! equivalent) for conflict detection.

use std::sync::LazyLock;

use chrono::{NaiveDate, NaiveTime};
use regex::Regex;
use uuid::Uuid;

use crate::{
    error::ApiError,
    models::{
        AppointmentChanges, AppointmentStatus, AppointmentView, CreateAppointmentRequest,
        NewAppointment, Slot, UpdateAppointmentRequest,
    },
};

// RFC 4122 versions 1-5, variant 10xx.
static UUID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^[0-9a-f]{8}-[0-9a-f]{4}-[1-5][0-9a-f]{3}-[89ab][0-9a-f]{3}-[0-9a-f]{12}$")
        .expect("uuid pattern compiles")
});

static DATE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d{4})-(\d{2})-(\d{2})$").expect("date pattern compiles"));

static TIME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([01]?\d|2[0-3]):([0-5]\d)(?::([0-5]\d))?$").expect("time pattern compiles")
});

/// Run the format half of the booking pipeline. Stops at the first failure.
pub fn validate_new_appointment(req: CreateAppointmentRequest) -> Result<NewAppointment, ApiError> {
    let patient_id = present(req.patient_id);
    let doctor_id = present(req.doctor_id);
    let appointment_date = present(req.appointment_date);
    let start_time = present(req.start_time);
    let end_time = present(req.end_time);

    let missing: Vec<&str> = [
        ("patient_id", patient_id.is_none()),
        ("doctor_id", doctor_id.is_none()),
        ("appointment_date", appointment_date.is_none()),
        ("start_time", start_time.is_none()),
        ("end_time", end_time.is_none()),
    ]
    .into_iter()
    .filter_map(|(name, absent)| absent.then_some(name))
    .collect();

    let (Some(patient_id), Some(doctor_id), Some(appointment_date), Some(start_time), Some(end_time)) =
        (patient_id, doctor_id, appointment_date, start_time, end_time)
    else {
        return Err(ApiError::BadRequest(
            "MISSING_FIELDS",
            format!("Missing required fields: {}", missing.join(", ")),
        ));
    };

    let patient_id = parse_uuid(&patient_id, "patient_id", "INVALID_PATIENT_ID")?;
    let doctor_id = parse_uuid(&doctor_id, "doctor_id", "INVALID_DOCTOR_ID")?;
    let date = parse_date(&appointment_date)?;
    let start = parse_time(&start_time, "start_time")?;
    let end = parse_time(&end_time, "end_time")?;
    let slot = ordered_slot(date, start, end)?;

    let status = match present(req.status) {
        Some(raw) => parse_status(&raw)?,
        None => AppointmentStatus::default(),
    };

    Ok(NewAppointment {
        patient_id,
        doctor_id,
        slot,
        status,
        location: non_blank(req.location),
        notes: non_blank(req.notes),
    })
}

/// Validate an edit against the appointment it modifies. Date and time
/// fields are merged with the stored values before the ordering check.
pub fn validate_changes(
    current: &AppointmentView,
    req: UpdateAppointmentRequest,
) -> Result<AppointmentChanges, ApiError> {
    let existing = current.slot();

    let date = match present(req.appointment_date) {
        Some(raw) => parse_date(&raw)?,
        None => existing.date,
    };
    let start = match present(req.start_time) {
        Some(raw) => parse_time(&raw, "start_time")?,
        None => existing.start,
    };
    let end = match present(req.end_time) {
        Some(raw) => parse_time(&raw, "end_time")?,
        None => existing.end,
    };
    let slot = ordered_slot(date, start, end)?;

    Ok(AppointmentChanges {
        expected_slot: existing,
        slot: (slot != existing).then_some(slot),
        // blank clears the column
        location: req.location.map(|v| non_blank(Some(v))),
        notes: req.notes.map(|v| non_blank(Some(v))),
    })
}

pub fn parse_status(raw: &str) -> Result<AppointmentStatus, ApiError> {
    raw.trim().parse().map_err(|_| {
        let allowed: Vec<&str> = AppointmentStatus::ALL.iter().map(|s| s.as_str()).collect();
        ApiError::BadRequest(
            "INVALID_STATUS",
            format!("Invalid status; expected one of: {}", allowed.join(", ")),
        )
    })
}

/// Half-open interval overlap on the same date.
///
/// Equivalent to: the new start falls inside an existing slot, the new end
/// falls inside it, or the new slot contains it entirely. Touching endpoints
/// do not conflict.
pub fn slots_overlap(a: &Slot, b: &Slot) -> bool {
    a.date == b.date && a.start < b.end && b.start < a.end
}

fn present(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Free text is stored as written; only all-blank input becomes `None`.
fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn parse_uuid(raw: &str, field: &str, code: &'static str) -> Result<Uuid, ApiError> {
    let invalid = || ApiError::BadRequest(code, format!("Invalid {field} format; expected a UUID"));
    if !UUID_RE.is_match(raw) {
        return Err(invalid());
    }
    Uuid::parse_str(raw).map_err(|_| invalid())
}

fn parse_date(raw: &str) -> Result<NaiveDate, ApiError> {
    let invalid = || {
        ApiError::BadRequest(
            "INVALID_DATE",
            "Invalid appointment_date format; expected YYYY-MM-DD".into(),
        )
    };
    let caps = DATE_RE.captures(raw).ok_or_else(invalid)?;
    let year: i32 = caps[1].parse().map_err(|_| invalid())?;
    let month: u32 = caps[2].parse().map_err(|_| invalid())?;
    let day: u32 = caps[3].parse().map_err(|_| invalid())?;
    NaiveDate::from_ymd_opt(year, month, day).ok_or_else(invalid)
}

fn parse_time(raw: &str, field: &str) -> Result<NaiveTime, ApiError> {
    let invalid = || {
        ApiError::BadRequest(
            "INVALID_TIME",
            format!("Invalid {field} format; expected HH:MM or HH:MM:SS"),
        )
    };
    let caps = TIME_RE.captures(raw).ok_or_else(invalid)?;
    let hour: u32 = caps[1].parse().map_err(|_| invalid())?;
    let minute: u32 = caps[2].parse().map_err(|_| invalid())?;
    let second: u32 = match caps.get(3) {
        Some(m) => m.as_str().parse().map_err(|_| invalid())?,
        None => 0,
    };
    NaiveTime::from_hms_opt(hour, minute, second).ok_or_else(invalid)
}

fn ordered_slot(date: NaiveDate, start: NaiveTime, end: NaiveTime) -> Result<Slot, ApiError> {
    if end <= start {
        return Err(ApiError::BadRequest(
            "END_BEFORE_START",
            "end_time must be after start_time".into(),
        ));
    }
    Ok(Slot { date, start, end })
}
