//! In-process repository used by the handler tests.

use std::{
    collections::HashMap,
    sync::atomic::{AtomicBool, Ordering},
};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{
    models::{
        AppointmentChanges, AppointmentStatus, AppointmentView, NewAppointment, Role, SessionRow,
        Slot, UserRow,
    },
    scheduling::slots_overlap,
};

use super::{Repository, SlotWrite, StoreError};

#[derive(Debug, Clone)]
struct StoredAppointment {
    id: Uuid,
    patient_id: Uuid,
    doctor_id: Uuid,
    slot: Slot,
    status: AppointmentStatus,
    location: Option<String>,
    notes: Option<String>,
    created_at: chrono::DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct TestUser {
    pub id: Uuid,
    pub name: String,
    pub email: String,
    pub role: Role,
}

#[derive(Default)]
struct Tables {
    users: HashMap<Uuid, TestUser>,
    sessions: HashMap<String, SessionRow>,
    appointments: Vec<StoredAppointment>,
}

#[derive(Default)]
pub struct MemoryRepository {
    tables: Mutex<Tables>,
    failing: AtomicBool,
    fail_after_insert: AtomicBool,
    /// Applied inside the next `update_if_free`, after the caller's reads.
    pending_status: Mutex<Option<AppointmentStatus>>,
}

impl MemoryRepository {
    pub async fn add_user(&self, name: &str, role: Role) -> TestUser {
        let user = TestUser {
            id: Uuid::new_v4(),
            name: name.to_string(),
            email: format!("{}@hospital.test", name.to_lowercase().replace(' ', ".")),
            role,
        };
        self.tables.lock().await.users.insert(user.id, user.clone());
        user
    }

    pub async fn add_session(&self, token_hash: &str, user: &TestUser) {
        self.tables.lock().await.sessions.insert(
            token_hash.to_string(),
            SessionRow {
                session_id: Uuid::new_v4(),
                user_id: user.id,
                role: user.role,
            },
        );
    }

    pub async fn appointment_count(&self) -> usize {
        self.tables.lock().await.appointments.len()
    }

    /// Make every subsequent call fail as if the database were down.
    pub fn fail_all(&self) {
        self.failing.store(true, Ordering::SeqCst);
    }

    /// Accept the next insert, then fail every call after it.
    pub fn fail_after_next_insert(&self) {
        self.fail_after_insert.store(true, Ordering::SeqCst);
    }

    /// Simulate a status change that lands between an edit's read and its
    /// write.
    pub async fn change_status_during_next_update(&self, status: AppointmentStatus) {
        *self.pending_status.lock().await = Some(status);
    }

    pub async fn force_status(&self, id: Uuid, status: AppointmentStatus) {
        let mut tables = self.tables.lock().await;
        if let Some(stored) = tables.appointments.iter_mut().find(|a| a.id == id) {
            stored.status = status;
        }
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Database(sqlx::Error::PoolTimedOut));
        }
        Ok(())
    }
}

impl Tables {
    fn view(&self, a: &StoredAppointment) -> Option<AppointmentView> {
        let patient = self.users.get(&a.patient_id)?;
        let doctor = self.users.get(&a.doctor_id)?;
        Some(AppointmentView {
            id: a.id,
            patient_id: patient.id,
            patient_name: patient.name.clone(),
            patient_email: patient.email.clone(),
            doctor_id: doctor.id,
            doctor_name: doctor.name.clone(),
            doctor_email: doctor.email.clone(),
            appointment_date: a.slot.date,
            start_time: a.slot.start,
            end_time: a.slot.end,
            status: a.status,
            location: a.location.clone(),
            notes: a.notes.clone(),
            created_at: a.created_at,
        })
    }

    fn overlapping(&self, doctor_id: Uuid, slot: &Slot, exclude: Option<Uuid>) -> Vec<Uuid> {
        self.appointments
            .iter()
            .filter(|a| a.doctor_id == doctor_id && a.status != AppointmentStatus::Cancelled)
            .filter(|a| Some(a.id) != exclude)
            .filter(|a| slots_overlap(slot, &a.slot))
            .map(|a| a.id)
            .collect()
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn ping(&self) -> Result<(), StoreError> {
        self.check()
    }

    async fn list_appointments(&self) -> Result<Vec<AppointmentView>, StoreError> {
        self.check()?;
        let tables = self.tables.lock().await;
        let mut views: Vec<AppointmentView> =
            tables.appointments.iter().filter_map(|a| tables.view(a)).collect();
        views.sort_by(|a, b| {
            b.appointment_date
                .cmp(&a.appointment_date)
                .then(a.start_time.cmp(&b.start_time))
        });
        Ok(views)
    }

    async fn get_appointment(&self, id: Uuid) -> Result<Option<AppointmentView>, StoreError> {
        self.check()?;
        let tables = self.tables.lock().await;
        Ok(tables
            .appointments
            .iter()
            .find(|a| a.id == id)
            .and_then(|a| tables.view(a)))
    }

    async fn find_user(&self, id: Uuid) -> Result<Option<UserRow>, StoreError> {
        self.check()?;
        Ok(self.tables.lock().await.users.get(&id).map(|u| UserRow {
            id: u.id,
            role: u.role,
        }))
    }

    async fn find_session(&self, token_hash: &str) -> Result<Option<SessionRow>, StoreError> {
        self.check()?;
        Ok(self.tables.lock().await.sessions.get(token_hash).copied())
    }

    async fn insert_if_free(&self, new: &NewAppointment) -> Result<SlotWrite, StoreError> {
        self.check()?;
        let mut tables = self.tables.lock().await;

        let clashes = tables.overlapping(new.doctor_id, &new.slot, None);
        if !clashes.is_empty() {
            return Ok(SlotWrite::Conflict(clashes));
        }

        let id = Uuid::new_v4();
        tables.appointments.push(StoredAppointment {
            id,
            patient_id: new.patient_id,
            doctor_id: new.doctor_id,
            slot: new.slot,
            status: new.status,
            location: new.location.clone(),
            notes: new.notes.clone(),
            created_at: Utc::now(),
        });
        if self.fail_after_insert.load(Ordering::SeqCst) {
            self.fail_all();
        }
        Ok(SlotWrite::Written(id))
    }

    async fn update_if_free(
        &self,
        id: Uuid,
        changes: &AppointmentChanges,
    ) -> Result<SlotWrite, StoreError> {
        self.check()?;
        let mut tables = self.tables.lock().await;

        if let Some(status) = self.pending_status.lock().await.take() {
            if let Some(stored) = tables.appointments.iter_mut().find(|a| a.id == id) {
                stored.status = status;
            }
        }

        let Some(stored) = tables.appointments.iter().find(|a| a.id == id) else {
            return Ok(SlotWrite::Missing);
        };
        if stored.status.is_terminal() {
            return Ok(SlotWrite::NotEditable(stored.status));
        }
        if stored.slot != changes.expected_slot {
            return Ok(SlotWrite::Stale);
        }
        let doctor_id = stored.doctor_id;

        if let Some(slot) = &changes.slot {
            let clashes = tables.overlapping(doctor_id, slot, Some(id));
            if !clashes.is_empty() {
                return Ok(SlotWrite::Conflict(clashes));
            }
        }

        if let Some(stored) = tables.appointments.iter_mut().find(|a| a.id == id) {
            if let Some(slot) = changes.slot {
                stored.slot = slot;
            }
            if let Some(location) = &changes.location {
                stored.location = location.clone();
            }
            if let Some(notes) = &changes.notes {
                stored.notes = notes.clone();
            }
        }
        Ok(SlotWrite::Written(id))
    }

    async fn set_status(
        &self,
        id: Uuid,
        from: AppointmentStatus,
        to: AppointmentStatus,
    ) -> Result<bool, StoreError> {
        self.check()?;
        let mut tables = self.tables.lock().await;
        match tables
            .appointments
            .iter_mut()
            .find(|a| a.id == id && a.status == from)
        {
            Some(stored) => {
                stored.status = to;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{NaiveDate, NaiveTime};

    use super::*;

    fn slot(start: &str, end: &str) -> Slot {
        Slot {
            date: NaiveDate::from_ymd_opt(2024, 6, 1).unwrap(),
            start: NaiveTime::parse_from_str(start, "%H:%M").unwrap(),
            end: NaiveTime::parse_from_str(end, "%H:%M").unwrap(),
        }
    }

    async fn seeded() -> (MemoryRepository, Uuid) {
        let repo = MemoryRepository::default();
        let patient = repo.add_user("Alice Patient", Role::Patient).await;
        let doctor = repo.add_user("Gregory House", Role::Doctor).await;
        let new = NewAppointment {
            patient_id: patient.id,
            doctor_id: doctor.id,
            slot: slot("09:00", "10:00"),
            status: AppointmentStatus::Scheduled,
            location: None,
            notes: None,
        };
        let SlotWrite::Written(id) = repo.insert_if_free(&new).await.unwrap() else {
            panic!("seed booking should be written");
        };
        (repo, id)
    }

    fn move_to(expected: Slot, target: Slot) -> AppointmentChanges {
        AppointmentChanges {
            expected_slot: expected,
            slot: Some(target),
            location: None,
            notes: Some(Some("moved".into())),
        }
    }

    #[tokio::test]
    async fn finished_rows_refuse_edits() {
        let (repo, id) = seeded().await;
        repo.force_status(id, AppointmentStatus::Completed).await;

        let outcome = repo
            .update_if_free(id, &move_to(slot("09:00", "10:00"), slot("11:00", "12:00")))
            .await
            .unwrap();
        assert_eq!(outcome, SlotWrite::NotEditable(AppointmentStatus::Completed));

        let view = repo.get_appointment(id).await.unwrap().unwrap();
        assert_eq!(view.slot(), slot("09:00", "10:00"));
        assert_eq!(view.notes, None);
    }

    #[tokio::test]
    async fn edits_against_a_moved_slot_are_stale() {
        let (repo, id) = seeded().await;

        let outcome = repo
            .update_if_free(id, &move_to(slot("08:00", "09:00"), slot("11:00", "12:00")))
            .await
            .unwrap();
        assert_eq!(outcome, SlotWrite::Stale);

        let outcome = repo
            .update_if_free(id, &move_to(slot("09:00", "10:00"), slot("09:30", "10:30")))
            .await
            .unwrap();
        assert_eq!(outcome, SlotWrite::Written(id));
    }
}
