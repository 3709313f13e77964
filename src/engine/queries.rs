use chrono::{NaiveDate, NaiveTime};

use crate::model::{
    Ci, DerivedStatus, ParticipantInfo, Reservation, ReservationId, ReservationView, RoomCategory,
    RoomInfo, RoomKey, SlotId, StoredStatus, TimeSlot,
};

use super::roles::effective_role;
use super::{derived_status, Engine, EngineError, Tables};

fn view(tables: &Tables, r: &Reservation, today: NaiveDate, now: NaiveTime) -> ReservationView {
    let derived = match tables.slots.get(&r.slot_id) {
        Some(slot) => derived_status(r, slot, today, now),
        // Slot rows are never deleted, so this arm is for defense in replay
        // of a foreign WAL only: report the stored state as-is.
        None => match r.status {
            StoredStatus::Active => DerivedStatus::Active,
            StoredStatus::Cancelled => DerivedStatus::Cancelled,
            StoredStatus::Closed => DerivedStatus::Attended,
            StoredStatus::NoShow => DerivedStatus::NoShow,
        },
    };
    ReservationView {
        id: r.id,
        room: r.room.clone(),
        date: r.date,
        slot_id: r.slot_id,
        stored: r.status,
        derived,
        participants: r.participants.clone(),
    }
}

impl Engine {
    pub async fn get_room(&self, room: &RoomKey) -> Result<RoomInfo, EngineError> {
        let tables = self.tables.read().await;
        tables
            .rooms
            .get(room)
            .map(|r| RoomInfo {
                room: room.clone(),
                capacity: r.capacity,
                category: r.category,
            })
            .ok_or_else(|| EngineError::RoomNotFound {
                name: room.name.clone(),
                building: room.building.clone(),
            })
    }

    pub async fn list_rooms(
        &self,
        building: Option<&str>,
        category: Option<RoomCategory>,
    ) -> Vec<RoomInfo> {
        let tables = self.tables.read().await;
        tables
            .rooms
            .iter()
            .filter(|(key, _)| building.is_none_or(|b| key.building == b))
            .filter(|(_, room)| category.is_none_or(|c| room.category == c))
            .map(|(key, room)| RoomInfo {
                room: key.clone(),
                capacity: room.capacity,
                category: room.category,
            })
            .collect()
    }

    pub async fn get_participant(&self, ci: Ci) -> Result<ParticipantInfo, EngineError> {
        let tables = self.tables.read().await;
        tables
            .participants
            .get(&ci)
            .map(|p| ParticipantInfo {
                ci: p.ci,
                name: p.name.clone(),
                surname: p.surname.clone(),
                email: p.email.clone(),
                affiliations: p.affiliations.clone(),
                effective_role: effective_role(&p.affiliations),
            })
            .ok_or(EngineError::ParticipantNotFound(ci))
    }

    pub async fn get_slot(&self, id: SlotId) -> Result<TimeSlot, EngineError> {
        let tables = self.tables.read().await;
        tables
            .slots
            .get(&id)
            .copied()
            .ok_or(EngineError::SlotNotFound(id))
    }

    pub async fn list_slots(&self) -> Vec<TimeSlot> {
        let tables = self.tables.read().await;
        tables.slots.values().copied().collect()
    }

    /// Look up a slot by its exact start and end times.
    pub async fn find_slot_by_times(&self, start: NaiveTime, end: NaiveTime) -> Option<TimeSlot> {
        let tables = self.tables.read().await;
        tables
            .slots
            .values()
            .find(|s| s.start == start && s.end == end)
            .copied()
    }

    /// Slots of the catalog with no active reservation for `room` on `date`.
    pub async fn available_slots(
        &self,
        room: &RoomKey,
        date: NaiveDate,
    ) -> Result<Vec<TimeSlot>, EngineError> {
        let tables = self.tables.read().await;
        if !tables.rooms.contains_key(room) {
            return Err(EngineError::RoomNotFound {
                name: room.name.clone(),
                building: room.building.clone(),
            });
        }
        Ok(tables
            .slots
            .values()
            .filter(|s| !tables.active_index.contains(&(room.clone(), date, s.id)))
            .copied()
            .collect())
    }

    pub async fn get_reservation(
        &self,
        id: ReservationId,
        today: NaiveDate,
        now: NaiveTime,
    ) -> Result<ReservationView, EngineError> {
        let tables = self.tables.read().await;
        tables
            .reservations
            .get(&id)
            .map(|r| view(&tables, r, today, now))
            .ok_or(EngineError::ReservationNotFound(id))
    }

    /// List reservations, optionally filtered by participant and/or room,
    /// each with its derived lifecycle status.
    pub async fn list_reservations(
        &self,
        ci: Option<Ci>,
        room: Option<&RoomKey>,
        today: NaiveDate,
        now: NaiveTime,
    ) -> Vec<ReservationView> {
        let tables = self.tables.read().await;
        tables
            .reservations
            .values()
            .filter(|r| ci.is_none_or(|ci| r.participants.iter().any(|l| l.ci == ci)))
            .filter(|r| room.is_none_or(|room| &r.room == room))
            .map(|r| view(&tables, r, today, now))
            .collect()
    }
}
