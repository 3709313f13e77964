use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};

/// Participant national id (CI).
pub type Ci = i64;

/// Surrogate reservation id, assigned sequentially by the engine.
pub type ReservationId = u64;

/// Surrogate sanction id.
pub type SanctionId = u64;

/// Time-slot catalog id.
pub type SlotId = u32;

/// A room is identified by (name, building).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RoomKey {
    pub name: String,
    pub building: String,
}

impl RoomKey {
    pub fn new(name: impl Into<String>, building: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            building: building.into(),
        }
    }
}

impl std::fmt::Display for RoomKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.name, self.building)
    }
}

/// Who may book a room. `Open` rooms are additionally subject to quota caps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoomCategory {
    Open,
    Graduate,
    Faculty,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
    pub capacity: u32,
    pub category: RoomCategory,
}

/// Role a participant holds within one academic program.
/// The derived ordering is the booking-priority order:
/// faculty > graduate > undergraduate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Role {
    Undergraduate,
    Graduate,
    Faculty,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Affiliation {
    pub program: String,
    pub role: Role,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub ci: Ci,
    pub name: String,
    pub surname: String,
    pub email: String,
    pub affiliations: Vec<Affiliation>,
}

/// An institution-wide bookable time-of-day slot. Not tied to a date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSlot {
    pub id: SlotId,
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl TimeSlot {
    pub fn duration_minutes(&self) -> i64 {
        (self.end - self.start).num_minutes()
    }
}

/// The status persisted on a reservation row. Coarser than [`DerivedStatus`]:
/// `Closed` is disambiguated into attended/no-show at read time by inspecting
/// the attendance links.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoredStatus {
    Active,
    Cancelled,
    Closed,
    NoShow,
}

/// Effective lifecycle state, computed from stored status + attendance +
/// wall clock by `lifecycle::derived_status` (and nowhere else).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DerivedStatus {
    Active,
    Attended,
    NoShow,
    Cancelled,
}

/// One participant on a reservation. `attendance` starts unknown (`None`)
/// and is the sole signal for the no-show rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantLink {
    pub ci: Ci,
    pub attendance: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: ReservationId,
    pub room: RoomKey,
    pub date: NaiveDate,
    pub slot_id: SlotId,
    pub status: StoredStatus,
    pub participants: Vec<ParticipantLink>,
}

impl Reservation {
    /// True if at least one participant link has attendance = true.
    pub fn any_attended(&self) -> bool {
        self.participants
            .iter()
            .any(|p| p.attendance == Some(true))
    }
}

/// A date-ranged booking ban. Natural key is (ci, start, end); `source` links
/// a sweep-created sanction back to the no-show reservation that triggered it
/// so a retroactive attendance correction can reverse exactly that sanction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sanction {
    pub id: SanctionId,
    pub ci: Ci,
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub source: Option<ReservationId>,
}

impl Sanction {
    /// Currently sanctioned ⇔ start ≤ today ≤ end.
    pub fn is_active(&self, today: NaiveDate) -> bool {
        self.start <= today && today <= self.end
    }
}

/// The event types — flat, no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LedgerEvent {
    RoomCreated {
        room: RoomKey,
        capacity: u32,
        category: RoomCategory,
    },
    RoomUpdated {
        room: RoomKey,
        capacity: u32,
        category: RoomCategory,
    },
    RoomDeleted {
        room: RoomKey,
    },
    ParticipantCreated {
        ci: Ci,
        name: String,
        surname: String,
        email: String,
    },
    ParticipantDeleted {
        ci: Ci,
    },
    AffiliationAdded {
        ci: Ci,
        program: String,
        role: Role,
    },
    AffiliationRemoved {
        ci: Ci,
        program: String,
    },
    SlotAdded {
        id: SlotId,
        start: NaiveTime,
        end: NaiveTime,
    },
    ReservationBooked {
        id: ReservationId,
        room: RoomKey,
        date: NaiveDate,
        slot_id: SlotId,
        participants: Vec<Ci>,
    },
    ReservationCancelled {
        id: ReservationId,
        room: RoomKey,
    },
    ReservationClosed {
        id: ReservationId,
        room: RoomKey,
        no_show: bool,
    },
    ReservationDeleted {
        id: ReservationId,
        room: RoomKey,
    },
    AttendanceMarked {
        reservation_id: ReservationId,
        ci: Ci,
        attended: bool,
    },
    SanctionCreated {
        id: SanctionId,
        ci: Ci,
        start: NaiveDate,
        end: NaiveDate,
        source: Option<ReservationId>,
    },
    SanctionRemoved {
        id: SanctionId,
    },
    SanctionExtended {
        id: SanctionId,
        end: NaiveDate,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoomInfo {
    pub room: RoomKey,
    pub capacity: u32,
    pub category: RoomCategory,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParticipantInfo {
    pub ci: Ci,
    pub name: String,
    pub surname: String,
    pub email: String,
    pub affiliations: Vec<Affiliation>,
    /// Priority-resolved role; `None` when the participant has no affiliations.
    pub effective_role: Option<Role>,
}

/// A reservation as surfaced to callers: the stored row plus derived status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReservationView {
    pub id: ReservationId,
    pub room: RoomKey,
    pub date: NaiveDate,
    pub slot_id: SlotId,
    pub stored: StoredStatus,
    pub derived: DerivedStatus,
    pub participants: Vec<ParticipantLink>,
}

/// A sanction augmented with the derived fields callers display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SanctionInfo {
    pub id: SanctionId,
    pub ci: Ci,
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub source: Option<ReservationId>,
    pub duration_days: i64,
    /// end − today; negative once expired.
    pub days_remaining: i64,
}

/// One slot successfully committed by a batch booking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BookedSlot {
    pub reservation_id: ReservationId,
    pub slot_id: SlotId,
}

/// Outcome of closing one reservation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CloseOutcome {
    pub reservation_id: ReservationId,
    pub no_show: bool,
    pub sanctioned: Vec<Ci>,
    /// Idempotent inserts — 0 when every sanction already existed.
    pub sanctions_created: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SweepFailure {
    pub reservation_id: ReservationId,
    pub error: String,
}

/// Report of one lifecycle sweep over past-dated active reservations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepSummary {
    pub processed: usize,
    pub attended: usize,
    pub no_shows: usize,
    pub sanctions_created: usize,
    pub failures: Vec<SweepFailure>,
}
