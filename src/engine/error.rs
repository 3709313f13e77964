use crate::model::{Ci, ReservationId, SlotId};

/// A failed admission check. The `Display` text is the reason surfaced
/// verbatim to callers — this API deliberately exposes business-rule text,
/// not opaque codes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reject {
    RoomNotFound {
        name: String,
        building: String,
    },
    CapacityExceeded {
        capacity: u32,
    },
    SlotAlreadyBooked {
        slot_id: SlotId,
    },
    InvalidSlot {
        slot_id: SlotId,
    },
    ParticipantSanctioned {
        ci: Ci,
    },
    NoProgramAffiliation {
        ci: Ci,
    },
    FacultyOnlyRoom {
        name: String,
    },
    GraduateOnlyRoom {
        name: String,
    },
    DailyCapExceeded {
        ci: Ci,
        cap: u32,
    },
    WeeklyCapExceeded {
        ci: Ci,
        cap: u32,
    },
}

impl std::fmt::Display for Reject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Reject::RoomNotFound { name, building } => {
                write!(f, "room {name} in building {building} does not exist")
            }
            Reject::CapacityExceeded { capacity } => {
                write!(f, "the room only allows {capacity} participants")
            }
            Reject::SlotAlreadyBooked { slot_id } => {
                write!(f, "the room is already reserved for slot {slot_id} on that date")
            }
            Reject::InvalidSlot { slot_id } => {
                write!(f, "time slot {slot_id} is not a valid bookable slot")
            }
            Reject::ParticipantSanctioned { ci } => {
                write!(f, "participant {ci} has an active sanction and cannot book")
            }
            Reject::NoProgramAffiliation { ci } => {
                write!(f, "participant {ci} has no academic program affiliation")
            }
            Reject::FacultyOnlyRoom { name } => {
                write!(f, "room {name} is reserved for faculty")
            }
            Reject::GraduateOnlyRoom { name } => {
                write!(f, "room {name} is reserved for graduate students")
            }
            Reject::DailyCapExceeded { ci, cap } => {
                write!(
                    f,
                    "participant {ci} has reached the daily limit of {cap} reservations in open rooms"
                )
            }
            Reject::WeeklyCapExceeded { ci, cap } => {
                write!(
                    f,
                    "participant {ci} has reached the weekly limit of {cap} active reservations in open rooms"
                )
            }
        }
    }
}

#[derive(Debug)]
pub enum EngineError {
    /// An admission predicate failed; carries the specific reason.
    Validation(Reject),
    RoomNotFound {
        name: String,
        building: String,
    },
    ParticipantNotFound(Ci),
    SlotNotFound(SlotId),
    ReservationNotFound(ReservationId),
    AlreadyExists(String),
    /// A guarded delete/update refused because dependent rows exist.
    InUse(String),
    InvalidInput(String),
    InvalidDate(String),
    /// Cancellation requested inside the minimum-notice window.
    CancellationWindow {
        days: i64,
    },
    /// A lifecycle transition whose preconditions do not hold.
    TransitionNotAllowed(&'static str),
    /// The authoritative commit-time check found the slot taken.
    ConflictOnCommit {
        slot_id: SlotId,
    },
    /// Lower-level storage failure; the whole batch was rolled back.
    Storage(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Validation(reject) => write!(f, "{reject}"),
            EngineError::RoomNotFound { name, building } => {
                write!(f, "room not found: {name}@{building}")
            }
            EngineError::ParticipantNotFound(ci) => write!(f, "participant not found: {ci}"),
            EngineError::SlotNotFound(id) => write!(f, "time slot not found: {id}"),
            EngineError::ReservationNotFound(id) => write!(f, "reservation not found: {id}"),
            EngineError::AlreadyExists(what) => write!(f, "already exists: {what}"),
            EngineError::InUse(msg) => write!(f, "cannot delete or modify: {msg}"),
            EngineError::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            EngineError::InvalidDate(s) => {
                write!(f, "invalid date {s:?}: expected YYYY-MM-DD")
            }
            EngineError::CancellationWindow { days } => {
                write!(f, "cannot cancel with fewer than {days} days notice")
            }
            EngineError::TransitionNotAllowed(msg) => {
                write!(f, "transition not allowed: {msg}")
            }
            EngineError::ConflictOnCommit { slot_id } => {
                write!(f, "conflict at commit time: slot {slot_id} was booked concurrently")
            }
            EngineError::Storage(e) => write!(f, "storage error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<Reject> for EngineError {
    fn from(reject: Reject) -> Self {
        EngineError::Validation(reject)
    }
}
