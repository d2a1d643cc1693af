// src/routes/appointment_routes.rs

use axum::{
    Json, Router,
    extract::{Path, State, rejection::JsonRejection},
    http::StatusCode,
    routing::{get, patch},
};
use uuid::Uuid;

use crate::{
    auth::{can_cancel, can_change_status, can_edit},
    error::ApiError,
    middleware::auth_context::AuthContext,
    models::{
        AppState, AppointmentMutationResponse, AppointmentStatus, AppointmentView,
        CreateAppointmentRequest, Role, StatusChangeRequest, UpdateAppointmentRequest,
    },
    scheduling::{parse_status, validate_changes, validate_new_appointment},
    store::{SlotWrite, StoreError},
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/appointments", get(list_appointments).post(create_appointment))
        .route(
            "/appointments/{appointment_id}",
            get(get_appointment)
                .patch(update_appointment)
                .delete(cancel_appointment),
        )
        .route("/appointments/{appointment_id}/status", patch(change_status))
}

type Mutation = Json<AppointmentMutationResponse>;

/* ============================================================
   Helpers
   ============================================================ */

fn parse_appointment_id(raw: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw.trim()).map_err(|_| {
        ApiError::BadRequest("INVALID_APPOINTMENT_ID", "appointment id must be a UUID".into())
    })
}

/// The referenced user must exist and hold exactly `role`.
async fn ensure_user_role(
    state: &AppState,
    user_id: Uuid,
    role: Role,
    code: &'static str,
) -> Result<(), ApiError> {
    let user = state
        .repo
        .find_user(user_id)
        .await
        .map_err(|e| ApiError::internal("Failed to create appointment", e))?;

    match user {
        Some(u) if u.role == role => {
            tracing::debug!(user_id = %u.id, %role, "participant verified");
            Ok(())
        }
        _ => Err(ApiError::BadRequest(
            code,
            format!("Invalid {role} ID or user is not a {role}"),
        )),
    }
}

async fn load_appointment(state: &AppState, id: Uuid) -> Result<AppointmentView, ApiError> {
    state
        .repo
        .get_appointment(id)
        .await?
        .ok_or_else(ApiError::appointment_not_found)
}

async fn reload(state: &AppState, id: Uuid) -> Result<AppointmentView, ApiError> {
    Ok(state
        .repo
        .get_appointment(id)
        .await?
        .ok_or(StoreError::Vanished(id))?)
}

fn scheduling_conflict(doctor_id: Uuid, clashes: &[Uuid]) -> ApiError {
    tracing::warn!(%doctor_id, ?clashes, "slot already taken");
    ApiError::Conflict(
        "SCHEDULING_CONFLICT",
        "Doctor already has an appointment during this time slot".into(),
    )
}

fn not_editable(status: AppointmentStatus) -> ApiError {
    ApiError::BadRequest(
        "NOT_EDITABLE",
        format!("A {status} appointment cannot be edited"),
    )
}

fn ensure_transition(from: AppointmentStatus, to: AppointmentStatus) -> Result<(), ApiError> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(ApiError::BadRequest(
            "INVALID_TRANSITION",
            format!("Cannot change status from {from} to {to}"),
        ))
    }
}

/* ============================================================
   GET /appointments
   ============================================================ */

pub async fn list_appointments(
    State(state): State<AppState>,
) -> Result<Json<Vec<AppointmentView>>, ApiError> {
    let rows = state
        .repo
        .list_appointments()
        .await
        .map_err(|e| ApiError::internal("Failed to fetch appointments", e))?;

    Ok(Json(rows))
}

/* ============================================================
   GET /appointments/{id}
   ============================================================ */

pub async fn get_appointment(
    State(state): State<AppState>,
    Path(appointment_id): Path<String>,
) -> Result<Json<AppointmentView>, ApiError> {
    let id = parse_appointment_id(&appointment_id)?;
    Ok(Json(load_appointment(&state, id).await?))
}

/* ============================================================
   POST /appointments (create)
   ============================================================ */

pub async fn create_appointment(
    State(state): State<AppState>,
    payload: Result<Json<CreateAppointmentRequest>, JsonRejection>,
) -> Result<(StatusCode, Mutation), ApiError> {
    let Json(req) = payload?;
    let booking = validate_new_appointment(req)?;

    ensure_user_role(&state, booking.patient_id, Role::Patient, "INVALID_PATIENT").await?;
    ensure_user_role(&state, booking.doctor_id, Role::Doctor, "INVALID_DOCTOR").await?;

    let written = state
        .repo
        .insert_if_free(&booking)
        .await
        .map_err(|e| ApiError::internal("Failed to create appointment", e))?;

    let id = match written {
        SlotWrite::Written(id) => id,
        SlotWrite::Conflict(clashes) => return Err(scheduling_conflict(booking.doctor_id, &clashes)),
        other @ (SlotWrite::Missing | SlotWrite::NotEditable(_) | SlotWrite::Stale) => {
            return Err(ApiError::internal(
                "Failed to create appointment",
                format!("insert reported {other:?}"),
            ));
        }
    };

    let appointment = state
        .repo
        .get_appointment(id)
        .await
        .and_then(|row| row.ok_or(StoreError::Vanished(id)))
        .map_err(|e| ApiError::internal("Failed to create appointment", e))?;
    tracing::info!(
        appointment_id = %id,
        doctor_id = %booking.doctor_id,
        date = %booking.slot.date,
        "appointment booked"
    );

    Ok((
        StatusCode::CREATED,
        Json(AppointmentMutationResponse {
            message: "Appointment created successfully".into(),
            appointment,
        }),
    ))
}

/* ============================================================
   PATCH /appointments/{id}
   ============================================================ */

pub async fn update_appointment(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(appointment_id): Path<String>,
    payload: Result<Json<UpdateAppointmentRequest>, JsonRejection>,
) -> Result<Mutation, ApiError> {
    let id = parse_appointment_id(&appointment_id)?;
    let Json(req) = payload?;

    let current = load_appointment(&state, id).await?;
    if !can_edit(auth.role, auth.user_id, &current) {
        return Err(ApiError::forbidden("Only an admin or the assigned doctor can edit this appointment"));
    }
    if current.status.is_terminal() {
        return Err(not_editable(current.status));
    }

    let changes = validate_changes(&current, req)?;

    match state.repo.update_if_free(id, &changes).await? {
        SlotWrite::Written(_) => {}
        SlotWrite::Conflict(clashes) => return Err(scheduling_conflict(current.doctor_id, &clashes)),
        SlotWrite::Missing => return Err(ApiError::appointment_not_found()),
        SlotWrite::NotEditable(status) => return Err(not_editable(status)),
        SlotWrite::Stale => {
            return Err(ApiError::Conflict(
                "STALE_APPOINTMENT",
                "Appointment changed concurrently; reload and retry".into(),
            ));
        }
    }

    tracing::info!(appointment_id = %id, session_id = %auth.session_id, "appointment edited");

    Ok(Json(AppointmentMutationResponse {
        message: "Appointment updated successfully".into(),
        appointment: reload(&state, id).await?,
    }))
}

/* ============================================================
   PATCH /appointments/{id}/status
   ============================================================ */

pub async fn change_status(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(appointment_id): Path<String>,
    payload: Result<Json<StatusChangeRequest>, JsonRejection>,
) -> Result<Mutation, ApiError> {
    let id = parse_appointment_id(&appointment_id)?;
    let Json(req) = payload?;
    let next = parse_status(&req.status)?;

    let current = load_appointment(&state, id).await?;
    if !can_change_status(auth.role, auth.user_id, &current) {
        return Err(ApiError::forbidden(
            "Only an admin or the assigned doctor can change this appointment's status",
        ));
    }
    ensure_transition(current.status, next)?;

    if !state.repo.set_status(id, current.status, next).await? {
        return Err(ApiError::Conflict(
            "STALE_STATUS",
            "Appointment changed concurrently; reload and retry".into(),
        ));
    }

    tracing::info!(
        appointment_id = %id,
        session_id = %auth.session_id,
        from = %current.status,
        to = %next,
        "appointment status changed"
    );

    Ok(Json(AppointmentMutationResponse {
        message: format!("Appointment marked as {next}"),
        appointment: reload(&state, id).await?,
    }))
}

/* ============================================================
   DELETE /appointments/{id}  (soft cancel)
   ============================================================ */

pub async fn cancel_appointment(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(appointment_id): Path<String>,
) -> Result<Mutation, ApiError> {
    let id = parse_appointment_id(&appointment_id)?;
    if !can_cancel(auth.role) {
        return Err(ApiError::forbidden("Only an admin can cancel appointments"));
    }

    let current = load_appointment(&state, id).await?;
    ensure_transition(current.status, AppointmentStatus::Cancelled)?;

    if !state
        .repo
        .set_status(id, current.status, AppointmentStatus::Cancelled)
        .await?
    {
        return Err(ApiError::Conflict(
            "STALE_STATUS",
            "Appointment changed concurrently; reload and retry".into(),
        ));
    }

    tracing::info!(appointment_id = %id, session_id = %auth.session_id, "appointment cancelled");

    Ok(Json(AppointmentMutationResponse {
        message: "Appointment cancelled".into(),
        appointment: reload(&state, id).await?,
    }))
}
