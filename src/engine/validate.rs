use chrono::NaiveDate;

use crate::calendar::week_bounds;
use crate::config::Config;
use crate::model::{Ci, Role, RoomCategory, RoomKey, SlotId, StoredStatus};

use super::error::Reject;
use super::roles::effective_role;
use super::Tables;

/// The admission pipeline: every predicate must pass for a batch to be
/// bookable. Checks run in a fixed order and the first failure wins, so a
/// request with several problems always reports the same reason.
///
/// Callers run this twice: once on the read path as a courtesy pre-check,
/// and again under the write guard immediately before commit. Only the
/// second run is authoritative.
pub(super) fn validate_admission(
    tables: &Tables,
    config: &Config,
    room_key: &RoomKey,
    date: NaiveDate,
    slot_ids: &[SlotId],
    participants: &[Ci],
    today: NaiveDate,
) -> Result<(), Reject> {
    // 1. The room must exist.
    let Some(room) = tables.rooms.get(room_key) else {
        return Err(Reject::RoomNotFound {
            name: room_key.name.clone(),
            building: room_key.building.clone(),
        });
    };

    // 2. The group must fit.
    if participants.len() as u32 > room.capacity {
        return Err(Reject::CapacityExceeded {
            capacity: room.capacity,
        });
    }

    // 3. No requested slot may already hold an active reservation.
    for &slot_id in slot_ids {
        if tables
            .active_index
            .contains(&(room_key.clone(), date, slot_id))
        {
            return Err(Reject::SlotAlreadyBooked { slot_id });
        }
    }

    // 4. Every slot must exist, have the standard duration, and lie within
    //    opening hours.
    for &slot_id in slot_ids {
        let Some(slot) = tables.slots.get(&slot_id) else {
            return Err(Reject::InvalidSlot { slot_id });
        };
        if slot.duration_minutes() != config.slot_minutes
            || slot.start < config.open_time
            || slot.end > config.close_time
        {
            return Err(Reject::InvalidSlot { slot_id });
        }
    }

    // 5. Nobody in the group may be under an active sanction.
    for &ci in participants {
        if tables.is_sanctioned(ci, today) {
            return Err(Reject::ParticipantSanctioned { ci });
        }
    }

    // 6. Everybody needs at least one program affiliation; the effective
    //    role is also what the category check below uses.
    let mut roles = Vec::with_capacity(participants.len());
    for &ci in participants {
        let role = tables
            .participants
            .get(&ci)
            .and_then(|p| effective_role(&p.affiliations));
        match role {
            Some(role) => roles.push(role),
            None => return Err(Reject::NoProgramAffiliation { ci }),
        }
    }

    // 7. Restricted categories admit by exact effective role: a graduate
    //    room takes graduate students only, a faculty room faculty only.
    match room.category {
        RoomCategory::Open => {}
        RoomCategory::Graduate => {
            if roles.iter().any(|&r| r != Role::Graduate) {
                return Err(Reject::GraduateOnlyRoom {
                    name: room_key.name.clone(),
                });
            }
        }
        RoomCategory::Faculty => {
            if roles.iter().any(|&r| r != Role::Faculty) {
                return Err(Reject::FacultyOnlyRoom {
                    name: room_key.name.clone(),
                });
            }
        }
    }

    // 8. Usage quotas, open rooms only. The whole batch counts against the
    //    caps: existing active reservations plus every requested slot.
    if room.category == RoomCategory::Open {
        let requested = slot_ids.len() as u32;
        let (week_start, week_end) = week_bounds(date);
        for &ci in participants {
            let mut daily = 0u32;
            let mut weekly = 0u32;
            for r in tables.reservations.values() {
                if r.status != StoredStatus::Active {
                    continue;
                }
                if !r.participants.iter().any(|l| l.ci == ci) {
                    continue;
                }
                let Some(r_room) = tables.rooms.get(&r.room) else {
                    continue;
                };
                if r_room.category != RoomCategory::Open {
                    continue;
                }
                if r.date == date {
                    daily += 1;
                }
                if r.date >= week_start && r.date <= week_end {
                    weekly += 1;
                }
            }
            if daily + requested > config.daily_cap {
                return Err(Reject::DailyCapExceeded {
                    ci,
                    cap: config.daily_cap,
                });
            }
            if weekly + requested > config.weekly_cap {
                return Err(Reject::WeeklyCapExceeded {
                    ci,
                    cap: config.weekly_cap,
                });
            }
        }
    }

    Ok(())
}
