use async_trait::async_trait;
use uuid::Uuid;

use crate::models::{
    AppointmentChanges, AppointmentStatus, AppointmentView, NewAppointment, SessionRow, UserRow,
};

#[cfg(test)]
pub mod memory;
pub mod postgres;

pub use postgres::PgRepository;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("appointment {0} missing after write")]
    Vanished(Uuid),
}

/// Result of a write that has to claim a doctor's time slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotWrite {
    Written(Uuid),
    /// Ids of the live appointments the requested slot overlaps.
    Conflict(Vec<Uuid>),
    Missing,
    /// The row reached a final status before the edit could be applied.
    NotEditable(AppointmentStatus),
    /// The row's slot changed since the edit was validated.
    Stale,
}

#[async_trait]
pub trait Repository: Send + Sync {
    async fn ping(&self) -> Result<(), StoreError>;

    /// All appointments, `appointment_date DESC, start_time ASC`.
    async fn list_appointments(&self) -> Result<Vec<AppointmentView>, StoreError>;

    async fn get_appointment(&self, id: Uuid) -> Result<Option<AppointmentView>, StoreError>;

    async fn find_user(&self, id: Uuid) -> Result<Option<UserRow>, StoreError>;

    /// Live session for a hashed bearer token.
    async fn find_session(&self, token_hash: &str) -> Result<Option<SessionRow>, StoreError>;

    /// Conflict check and insert as one atomic step per doctor and day.
    async fn insert_if_free(&self, new: &NewAppointment) -> Result<SlotWrite, StoreError>;

    /// Apply an edit. Status, expected slot, conflict check (ignoring the
    /// appointment itself) and the update happen under one row lock.
    async fn update_if_free(
        &self,
        id: Uuid,
        changes: &AppointmentChanges,
    ) -> Result<SlotWrite, StoreError>;

    /// Compare-and-set on status. `false` when the row is gone or no longer
    /// in `from`.
    async fn set_status(
        &self,
        id: Uuid,
        from: AppointmentStatus,
        to: AppointmentStatus,
    ) -> Result<bool, StoreError>;
}
