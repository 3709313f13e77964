use std::collections::HashSet;

use chrono::{NaiveDate, NaiveTime};

use crate::limits;
use crate::model::{
    BookedSlot, Ci, LedgerEvent, ReservationId, Role, RoomCategory, RoomKey, SlotId, StoredStatus,
};
use crate::observability;

use super::error::Reject;
use super::validate::validate_admission;
use super::{Engine, EngineError};

fn check_name(value: &str, what: &str) -> Result<(), EngineError> {
    if value.trim().is_empty() {
        return Err(EngineError::InvalidInput(format!("{what} is empty")));
    }
    if value.len() > limits::MAX_NAME_LEN {
        return Err(EngineError::InvalidInput(format!(
            "{what} exceeds {} characters",
            limits::MAX_NAME_LEN
        )));
    }
    Ok(())
}

/// Minimal structural email check: local@domain with a dot in the domain.
fn check_email(email: &str) -> Result<(), EngineError> {
    let ok = email.len() <= limits::MAX_EMAIL_LEN
        && email
            .split_once('@')
            .is_some_and(|(local, domain)| {
                !local.is_empty() && domain.contains('.') && !domain.starts_with('.')
            });
    if ok {
        Ok(())
    } else {
        Err(EngineError::InvalidInput(format!("invalid email {email:?}")))
    }
}

fn dedup_preserving_order<T: Copy + std::hash::Hash + Eq>(items: &[T]) -> Vec<T> {
    let mut seen = HashSet::with_capacity(items.len());
    items.iter().copied().filter(|x| seen.insert(*x)).collect()
}

impl Engine {
    // ── Room catalog ─────────────────────────────────────

    pub async fn create_room(
        &self,
        room: RoomKey,
        capacity: u32,
        category: RoomCategory,
    ) -> Result<(), EngineError> {
        check_name(&room.name, "room name")?;
        check_name(&room.building, "building name")?;
        if capacity == 0 {
            return Err(EngineError::InvalidInput("room capacity is zero".into()));
        }

        let mut tables = self.tables.write().await;
        if tables.rooms.contains_key(&room) {
            return Err(EngineError::AlreadyExists(format!("room {room}")));
        }
        let event = LedgerEvent::RoomCreated {
            room,
            capacity,
            category,
        };
        self.persist_and_apply(&mut tables, vec![event]).await
    }

    /// Update capacity/category. Shrinking the capacity below the group size
    /// of an existing active reservation is refused — the rooms catalog may
    /// never contradict admitted bookings.
    pub async fn update_room(
        &self,
        room: RoomKey,
        capacity: u32,
        category: RoomCategory,
    ) -> Result<(), EngineError> {
        if capacity == 0 {
            return Err(EngineError::InvalidInput("room capacity is zero".into()));
        }

        let mut tables = self.tables.write().await;
        if !tables.rooms.contains_key(&room) {
            return Err(EngineError::RoomNotFound {
                name: room.name,
                building: room.building,
            });
        }
        let largest_group = tables
            .reservations
            .values()
            .filter(|r| r.status == StoredStatus::Active && r.room == room)
            .map(|r| r.participants.len() as u32)
            .max()
            .unwrap_or(0);
        if capacity < largest_group {
            return Err(EngineError::InUse(format!(
                "room {room} has an active reservation for {largest_group} participants"
            )));
        }
        let event = LedgerEvent::RoomUpdated {
            room,
            capacity,
            category,
        };
        self.persist_and_apply(&mut tables, vec![event]).await
    }

    /// Delete a room. Refused while it still has active reservations dated
    /// today or later.
    pub async fn delete_room(&self, room: RoomKey, today: NaiveDate) -> Result<(), EngineError> {
        let mut tables = self.tables.write().await;
        if !tables.rooms.contains_key(&room) {
            return Err(EngineError::RoomNotFound {
                name: room.name,
                building: room.building,
            });
        }
        let pending = tables
            .reservations
            .values()
            .filter(|r| r.status == StoredStatus::Active && r.room == room && r.date >= today)
            .count();
        if pending > 0 {
            return Err(EngineError::InUse(format!(
                "room {room} has {pending} upcoming reservations"
            )));
        }
        let event = LedgerEvent::RoomDeleted { room: room.clone() };
        self.persist_and_apply(&mut tables, vec![event]).await?;
        self.notify.remove(&room);
        Ok(())
    }

    // ── Participant catalog ──────────────────────────────

    pub async fn create_participant(
        &self,
        ci: Ci,
        name: &str,
        surname: &str,
        email: &str,
    ) -> Result<(), EngineError> {
        if ci <= 0 {
            return Err(EngineError::InvalidInput(format!("invalid ci {ci}")));
        }
        check_name(name, "name")?;
        check_name(surname, "surname")?;
        check_email(email)?;

        let mut tables = self.tables.write().await;
        if tables.participants.contains_key(&ci) {
            return Err(EngineError::AlreadyExists(format!("participant {ci}")));
        }
        if tables.participants.values().any(|p| p.email == email) {
            return Err(EngineError::AlreadyExists(format!("email {email}")));
        }
        let event = LedgerEvent::ParticipantCreated {
            ci,
            name: name.trim().to_string(),
            surname: surname.trim().to_string(),
            email: email.to_string(),
        };
        self.persist_and_apply(&mut tables, vec![event]).await
    }

    /// Delete a participant. Refused while they appear on an upcoming active
    /// reservation or hold an active sanction; the ledger must stay
    /// explainable after the row is gone.
    pub async fn delete_participant(&self, ci: Ci, today: NaiveDate) -> Result<(), EngineError> {
        let mut tables = self.tables.write().await;
        if !tables.participants.contains_key(&ci) {
            return Err(EngineError::ParticipantNotFound(ci));
        }
        let upcoming = tables.reservations.values().any(|r| {
            r.status == StoredStatus::Active
                && r.date >= today
                && r.participants.iter().any(|l| l.ci == ci)
        });
        if upcoming {
            return Err(EngineError::InUse(format!(
                "participant {ci} has upcoming reservations"
            )));
        }
        if tables.is_sanctioned(ci, today) {
            return Err(EngineError::InUse(format!(
                "participant {ci} has an active sanction"
            )));
        }
        self.persist_and_apply(&mut tables, vec![LedgerEvent::ParticipantDeleted { ci }])
            .await
    }

    pub async fn add_affiliation(
        &self,
        ci: Ci,
        program: &str,
        role: Role,
    ) -> Result<(), EngineError> {
        check_name(program, "program")?;
        let mut tables = self.tables.write().await;
        let Some(p) = tables.participants.get(&ci) else {
            return Err(EngineError::ParticipantNotFound(ci));
        };
        if p.affiliations.iter().any(|a| a.program == program) {
            return Err(EngineError::AlreadyExists(format!(
                "affiliation of {ci} with {program}"
            )));
        }
        let event = LedgerEvent::AffiliationAdded {
            ci,
            program: program.to_string(),
            role,
        };
        self.persist_and_apply(&mut tables, vec![event]).await
    }

    pub async fn remove_affiliation(&self, ci: Ci, program: &str) -> Result<(), EngineError> {
        let mut tables = self.tables.write().await;
        let Some(p) = tables.participants.get(&ci) else {
            return Err(EngineError::ParticipantNotFound(ci));
        };
        if !p.affiliations.iter().any(|a| a.program == program) {
            return Err(EngineError::InvalidInput(format!(
                "participant {ci} is not affiliated with {program}"
            )));
        }
        let event = LedgerEvent::AffiliationRemoved {
            ci,
            program: program.to_string(),
        };
        self.persist_and_apply(&mut tables, vec![event]).await
    }

    // ── Slot catalog ─────────────────────────────────────

    pub async fn add_slot(
        &self,
        id: SlotId,
        start: NaiveTime,
        end: NaiveTime,
    ) -> Result<(), EngineError> {
        if end <= start {
            return Err(EngineError::InvalidInput("slot end precedes start".into()));
        }
        if (end - start).num_minutes() != self.config.slot_minutes {
            return Err(EngineError::InvalidInput(format!(
                "slots must be exactly {} minutes long",
                self.config.slot_minutes
            )));
        }
        if start < self.config.open_time || end > self.config.close_time {
            return Err(EngineError::InvalidInput(
                "slot falls outside operating hours".into(),
            ));
        }

        let mut tables = self.tables.write().await;
        if tables.slots.contains_key(&id) {
            return Err(EngineError::AlreadyExists(format!("time slot {id}")));
        }
        self.persist_and_apply(&mut tables, vec![LedgerEvent::SlotAdded { id, start, end }])
            .await
    }

    // ── Booking ──────────────────────────────────────────

    /// Courtesy pre-check under a read lock: would this batch be admitted
    /// right now? Non-binding — `book_batch` re-validates under the write
    /// guard before committing.
    pub async fn validate_booking(
        &self,
        room: &RoomKey,
        date: NaiveDate,
        slot_ids: &[SlotId],
        participants: &[Ci],
        today: NaiveDate,
    ) -> Result<(), EngineError> {
        let slot_ids = dedup_preserving_order(slot_ids);
        let participants = dedup_preserving_order(participants);
        let tables = self.tables.read().await;
        validate_admission(
            &tables,
            &self.config,
            room,
            date,
            &slot_ids,
            &participants,
            today,
        )
        .map_err(EngineError::from)
    }

    /// Atomically book one reservation per requested slot, all with the same
    /// room, date, and participant group. All-or-nothing: the batch is
    /// re-validated under the write guard and committed to the WAL with a
    /// single group flush; any failure leaves no reservation behind.
    ///
    /// A slot found taken during the in-guard re-validation (i.e. a
    /// concurrent booking won between pre-check and commit) surfaces as
    /// `ConflictOnCommit` rather than a plain validation failure.
    pub async fn book_batch(
        &self,
        room: &RoomKey,
        date: NaiveDate,
        slot_ids: &[SlotId],
        participants: &[Ci],
        today: NaiveDate,
    ) -> Result<Vec<BookedSlot>, EngineError> {
        let slot_ids = dedup_preserving_order(slot_ids);
        let participants = dedup_preserving_order(participants);

        if slot_ids.is_empty() {
            return Err(EngineError::InvalidInput("no slots requested".into()));
        }
        if slot_ids.len() > limits::MAX_BATCH_SLOTS {
            return Err(EngineError::InvalidInput(format!(
                "at most {} slots per batch",
                limits::MAX_BATCH_SLOTS
            )));
        }
        if participants.is_empty() {
            return Err(EngineError::InvalidInput("no participants listed".into()));
        }
        if participants.len() > limits::MAX_PARTICIPANTS_PER_BOOKING {
            return Err(EngineError::InvalidInput(format!(
                "at most {} participants per booking",
                limits::MAX_PARTICIPANTS_PER_BOOKING
            )));
        }
        if date < today {
            return Err(EngineError::InvalidInput(
                "cannot book a date in the past".into(),
            ));
        }

        let mut tables = self.tables.write().await;

        for &ci in &participants {
            if !tables.participants.contains_key(&ci) {
                return Err(EngineError::ParticipantNotFound(ci));
            }
        }

        // The authoritative admission run. Everything it read stays frozen
        // until the write guard drops, after the inserts below.
        if let Err(reject) = validate_admission(
            &tables,
            &self.config,
            room,
            date,
            &slot_ids,
            &participants,
            today,
        ) {
            metrics::counter!(
                observability::BOOKINGS_REJECTED_TOTAL,
                "reason" => observability::reject_label(&reject)
            )
            .increment(1);
            return Err(match reject {
                Reject::SlotAlreadyBooked { slot_id } => {
                    EngineError::ConflictOnCommit { slot_id }
                }
                other => EngineError::Validation(other),
            });
        }

        let first_id = tables.next_reservation_id;
        let events: Vec<LedgerEvent> = slot_ids
            .iter()
            .enumerate()
            .map(|(i, &slot_id)| LedgerEvent::ReservationBooked {
                id: first_id + i as ReservationId,
                room: room.clone(),
                date,
                slot_id,
                participants: participants.clone(),
            })
            .collect();

        self.persist_and_apply(&mut tables, events).await?;
        metrics::counter!(observability::BOOKINGS_TOTAL).increment(slot_ids.len() as u64);
        tracing::info!(
            %room,
            %date,
            slots = slot_ids.len(),
            group = participants.len(),
            "batch booked"
        );

        Ok(slot_ids
            .iter()
            .enumerate()
            .map(|(i, &slot_id)| BookedSlot {
                reservation_id: first_id + i as ReservationId,
                slot_id,
            })
            .collect())
    }

    /// Cancel an active reservation. Requires at least `config.cancel_days`
    /// full days of notice before the reserved date.
    pub async fn cancel_reservation(
        &self,
        id: ReservationId,
        today: NaiveDate,
    ) -> Result<(), EngineError> {
        let mut tables = self.tables.write().await;
        let Some(r) = tables.reservations.get(&id) else {
            return Err(EngineError::ReservationNotFound(id));
        };
        if r.status != StoredStatus::Active {
            return Err(EngineError::TransitionNotAllowed(
                "only active reservations can be cancelled",
            ));
        }
        if (r.date - today).num_days() < self.config.cancel_days {
            return Err(EngineError::CancellationWindow {
                days: self.config.cancel_days,
            });
        }
        let event = LedgerEvent::ReservationCancelled {
            id,
            room: r.room.clone(),
        };
        self.persist_and_apply(&mut tables, vec![event]).await?;
        metrics::counter!(observability::CANCELLATIONS_TOTAL).increment(1);
        Ok(())
    }

    /// Record one participant's attendance. Permitted on any non-cancelled
    /// reservation so retroactive corrections are possible.
    pub async fn mark_attendance(
        &self,
        id: ReservationId,
        ci: Ci,
        attended: bool,
    ) -> Result<(), EngineError> {
        let mut tables = self.tables.write().await;
        let Some(r) = tables.reservations.get(&id) else {
            return Err(EngineError::ReservationNotFound(id));
        };
        if r.status == StoredStatus::Cancelled {
            return Err(EngineError::TransitionNotAllowed(
                "cancelled reservations have no attendance",
            ));
        }
        if !r.participants.iter().any(|l| l.ci == ci) {
            return Err(EngineError::InvalidInput(format!(
                "participant {ci} is not on reservation {id}"
            )));
        }
        let event = LedgerEvent::AttendanceMarked {
            reservation_id: id,
            ci,
            attended,
        };
        self.persist_and_apply(&mut tables, vec![event]).await
    }

    /// Retroactively mark a whole reservation as attended: every participant
    /// link is set to attended, a no-show close is corrected back to a plain
    /// close, and every sanction that this reservation's no-show created is
    /// reversed. Returns the number of sanctions removed.
    pub async fn mark_reservation_attended(
        &self,
        id: ReservationId,
    ) -> Result<usize, EngineError> {
        let mut tables = self.tables.write().await;
        let Some(r) = tables.reservations.get(&id) else {
            return Err(EngineError::ReservationNotFound(id));
        };
        if r.status == StoredStatus::Cancelled {
            return Err(EngineError::TransitionNotAllowed(
                "cancelled reservations have no attendance",
            ));
        }

        let mut events = Vec::new();
        for link in &r.participants {
            if link.attendance != Some(true) {
                events.push(LedgerEvent::AttendanceMarked {
                    reservation_id: id,
                    ci: link.ci,
                    attended: true,
                });
            }
        }
        if r.status == StoredStatus::NoShow {
            events.push(LedgerEvent::ReservationClosed {
                id,
                room: r.room.clone(),
                no_show: false,
            });
        }

        // Reverse exactly the sanctions this reservation created; manual
        // sanctions (source = None) are never touched.
        let reversed: Vec<LedgerEvent> = tables
            .sanctions
            .values()
            .filter(|s| s.source == Some(id))
            .map(|s| LedgerEvent::SanctionRemoved { id: s.id })
            .collect();
        let reversed_count = reversed.len();
        events.extend(reversed);

        if !events.is_empty() {
            self.persist_and_apply(&mut tables, events).await?;
        }
        if reversed_count > 0 {
            tracing::info!(
                reservation = id,
                sanctions = reversed_count,
                "no-show corrected, sanctions reversed"
            );
        }
        Ok(reversed_count)
    }

    /// Hard-delete a reservation row. Administrative escape hatch — normal
    /// flows cancel or close instead.
    pub async fn delete_reservation(&self, id: ReservationId) -> Result<(), EngineError> {
        let mut tables = self.tables.write().await;
        let Some(r) = tables.reservations.get(&id) else {
            return Err(EngineError::ReservationNotFound(id));
        };
        let event = LedgerEvent::ReservationDeleted {
            id,
            room: r.room.clone(),
        };
        self.persist_and_apply(&mut tables, vec![event]).await
    }
}
