use sha2::{Digest, Sha256};

use crate::models::{AppointmentView, Role};

/// Hash token for DB storage (SHA-256 hex).
pub fn hash_access_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    let out = hasher.finalize();
    hex::encode(out)
}

/*
Who may touch an existing appointment:
  edit / change status -> admin, or the doctor it is booked with
  cancel (delete)      -> admin
*/

pub fn can_edit(role: Role, caller: uuid::Uuid, appointment: &AppointmentView) -> bool {
    match role {
        Role::Admin => true,
        Role::Doctor => appointment.doctor_id == caller,
        Role::Patient => false,
    }
}

pub fn can_change_status(role: Role, caller: uuid::Uuid, appointment: &AppointmentView) -> bool {
    can_edit(role, caller, appointment)
}

pub fn can_cancel(role: Role) -> bool {
    match role {
        Role::Admin => true,
        Role::Doctor | Role::Patient => false,
    }
}
