// src/store/postgres.rs

use async_trait::async_trait;
use chrono::NaiveDate;
use sqlx::{PgConnection, PgPool, Row};
use uuid::Uuid;

use crate::models::{
    AppointmentChanges, AppointmentStatus, AppointmentView, NewAppointment, SessionRow, Slot,
    UserRow,
};

use super::{Repository, SlotWrite, StoreError};

const APPOINTMENT_VIEW_SELECT: &str = r#"
    SELECT
      a.id,
      a.patient_id,
      p.name  AS patient_name,
      p.email AS patient_email,
      a.doctor_id,
      d.name  AS doctor_name,
      d.email AS doctor_email,
      a.appointment_date,
      a.start_time,
      a.end_time,
      a.status,
      a.location,
      a.notes,
      a.created_at
    FROM appointments a
    JOIN users p ON p.id = a.patient_id
    JOIN users d ON d.id = a.doctor_id
"#;

#[derive(Clone)]
pub struct PgRepository {
    pool: PgPool,
}

impl PgRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/* ============================================================
   Slot locking
   ============================================================ */

/// Serialize slot writes for one doctor on one day. Released on commit or
/// rollback.
async fn lock_doctor_day(
    conn: &mut PgConnection,
    doctor_id: Uuid,
    date: NaiveDate,
) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
        .bind(format!("{doctor_id}:{date}"))
        .execute(conn)
        .await?;
    Ok(())
}

async fn overlapping_ids(
    conn: &mut PgConnection,
    doctor_id: Uuid,
    slot: &Slot,
    exclude: Option<Uuid>,
) -> Result<Vec<Uuid>, sqlx::Error> {
    sqlx::query_scalar::<_, Uuid>(
        r#"
        SELECT id
        FROM appointments
        WHERE doctor_id = $1
          AND appointment_date = $2
          AND status <> $3
          AND start_time < $5
          AND end_time   > $4
          AND ($6::uuid IS NULL OR id <> $6)
        ORDER BY start_time ASC
        "#,
    )
    .bind(doctor_id)
    .bind(slot.date)
    .bind(AppointmentStatus::Cancelled)
    .bind(slot.start)
    .bind(slot.end)
    .bind(exclude)
    .fetch_all(conn)
    .await
}

#[async_trait]
impl Repository for PgRepository {
    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn list_appointments(&self) -> Result<Vec<AppointmentView>, StoreError> {
        let sql = format!("{APPOINTMENT_VIEW_SELECT} ORDER BY a.appointment_date DESC, a.start_time ASC");
        let rows = sqlx::query_as::<_, AppointmentView>(&sql)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    async fn get_appointment(&self, id: Uuid) -> Result<Option<AppointmentView>, StoreError> {
        let sql = format!("{APPOINTMENT_VIEW_SELECT} WHERE a.id = $1");
        let row = sqlx::query_as::<_, AppointmentView>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn find_user(&self, id: Uuid) -> Result<Option<UserRow>, StoreError> {
        let row = sqlx::query_as::<_, UserRow>(
            r#"
            SELECT id, role
            FROM users
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn find_session(&self, token_hash: &str) -> Result<Option<SessionRow>, StoreError> {
        let row = sqlx::query_as::<_, SessionRow>(
            r#"
            SELECT s.id AS session_id, s.user_id, u.role
            FROM sessions s
            JOIN users u ON u.id = s.user_id
            WHERE s.token_hash = $1
              AND s.revoked_at IS NULL
              AND s.expires_at > now()
            "#,
        )
        .bind(token_hash)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(session) = &row {
            // best-effort
            if let Err(e) = sqlx::query("UPDATE sessions SET last_seen_at = now() WHERE id = $1")
                .bind(session.session_id)
                .execute(&self.pool)
                .await
            {
                tracing::debug!(error = %e, "failed to touch session");
            }
        }

        Ok(row)
    }

    async fn insert_if_free(&self, new: &NewAppointment) -> Result<SlotWrite, StoreError> {
        let mut tx = self.pool.begin().await?;

        lock_doctor_day(&mut tx, new.doctor_id, new.slot.date).await?;

        let clashes = overlapping_ids(&mut tx, new.doctor_id, &new.slot, None).await?;
        if !clashes.is_empty() {
            tx.rollback().await?;
            return Ok(SlotWrite::Conflict(clashes));
        }

        let row = sqlx::query(
            r#"
            INSERT INTO appointments (
              patient_id,
              doctor_id,
              appointment_date,
              start_time,
              end_time,
              status,
              location,
              notes
            )
            VALUES ($1,$2,$3,$4,$5,$6,$7,$8)
            RETURNING id
            "#,
        )
        .bind(new.patient_id)
        .bind(new.doctor_id)
        .bind(new.slot.date)
        .bind(new.slot.start)
        .bind(new.slot.end)
        .bind(new.status)
        .bind(new.location.as_deref())
        .bind(new.notes.as_deref())
        .fetch_one(&mut *tx)
        .await?;

        let id: Uuid = row.try_get("id")?;
        tx.commit().await?;
        Ok(SlotWrite::Written(id))
    }

    async fn update_if_free(
        &self,
        id: Uuid,
        changes: &AppointmentChanges,
    ) -> Result<SlotWrite, StoreError> {
        let mut tx = self.pool.begin().await?;

        let locked = sqlx::query(
            r#"
            SELECT doctor_id, status, appointment_date, start_time, end_time
            FROM appointments
            WHERE id = $1
            FOR UPDATE
            "#,
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(locked) = locked else {
            tx.rollback().await?;
            return Ok(SlotWrite::Missing);
        };

        let doctor_id: Uuid = locked.try_get("doctor_id")?;
        let status: AppointmentStatus = locked.try_get("status")?;
        if status.is_terminal() {
            tx.rollback().await?;
            return Ok(SlotWrite::NotEditable(status));
        }

        let stored_slot = Slot {
            date: locked.try_get("appointment_date")?,
            start: locked.try_get("start_time")?,
            end: locked.try_get("end_time")?,
        };
        if stored_slot != changes.expected_slot {
            tx.rollback().await?;
            return Ok(SlotWrite::Stale);
        }

        if let Some(slot) = &changes.slot {
            lock_doctor_day(&mut tx, doctor_id, slot.date).await?;
            let clashes = overlapping_ids(&mut tx, doctor_id, slot, Some(id)).await?;
            if !clashes.is_empty() {
                tx.rollback().await?;
                return Ok(SlotWrite::Conflict(clashes));
            }
        }

        sqlx::query(
            r#"
            UPDATE appointments
            SET
              appointment_date = COALESCE($2, appointment_date),
              start_time       = COALESCE($3, start_time),
              end_time         = COALESCE($4, end_time),
              location = CASE WHEN $5 THEN $6 ELSE location END,
              notes    = CASE WHEN $7 THEN $8 ELSE notes END,
              updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(changes.slot.map(|s| s.date))
        .bind(changes.slot.map(|s| s.start))
        .bind(changes.slot.map(|s| s.end))
        .bind(changes.location.is_some())
        .bind(changes.location.clone().flatten())
        .bind(changes.notes.is_some())
        .bind(changes.notes.clone().flatten())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(SlotWrite::Written(id))
    }

    async fn set_status(
        &self,
        id: Uuid,
        from: AppointmentStatus,
        to: AppointmentStatus,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE appointments
            SET status = $3,
                updated_at = now()
            WHERE id = $1
              AND status = $2
            "#,
        )
        .bind(id)
        .bind(from)
        .bind(to)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}
