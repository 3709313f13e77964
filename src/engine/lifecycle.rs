use chrono::{Duration, NaiveDate, NaiveTime};

use crate::model::{
    CloseOutcome, DerivedStatus, LedgerEvent, Reservation, ReservationId, StoredStatus,
    SweepFailure, SweepSummary, TimeSlot,
};
use crate::observability;

use super::{Engine, EngineError};

/// True once the reserved slot lies in the past.
fn slot_elapsed(r: &Reservation, slot: &TimeSlot, today: NaiveDate, now: NaiveTime) -> bool {
    r.date < today || (r.date == today && now >= slot.end)
}

/// The effective lifecycle state of a reservation. This is the only place
/// the wall clock meets stored state: a stored-active reservation whose slot
/// has elapsed reads as attended or no-show depending on the attendance
/// links, even before the sweep settles it.
pub fn derived_status(
    r: &Reservation,
    slot: &TimeSlot,
    today: NaiveDate,
    now: NaiveTime,
) -> DerivedStatus {
    match r.status {
        StoredStatus::Cancelled => DerivedStatus::Cancelled,
        StoredStatus::NoShow => DerivedStatus::NoShow,
        StoredStatus::Closed => {
            if r.any_attended() {
                DerivedStatus::Attended
            } else {
                DerivedStatus::NoShow
            }
        }
        StoredStatus::Active => {
            if !slot_elapsed(r, slot, today, now) {
                DerivedStatus::Active
            } else if r.any_attended() {
                DerivedStatus::Attended
            } else {
                DerivedStatus::NoShow
            }
        }
    }
}

impl Engine {
    /// Settle one elapsed reservation: close it, and on a no-show create one
    /// sanction per participant anchored at the reservation's date:
    /// `r.date..=r.date + window_days`. Anchoring at the reservation keeps
    /// no-shows on different dates as distinct sanctions even when one sweep
    /// settles them together; creation is idempotent on (ci, start, end), so
    /// re-running a sweep never doubles a ban.
    pub async fn close_reservation(
        &self,
        id: ReservationId,
        today: NaiveDate,
        now: NaiveTime,
        window_days: i64,
    ) -> Result<CloseOutcome, EngineError> {
        let mut tables = self.tables.write().await;
        let Some(r) = tables.reservations.get(&id) else {
            return Err(EngineError::ReservationNotFound(id));
        };
        if r.status != StoredStatus::Active {
            return Err(EngineError::TransitionNotAllowed(
                "reservation is already settled",
            ));
        }
        let Some(slot) = tables.slots.get(&r.slot_id).copied() else {
            return Err(EngineError::SlotNotFound(r.slot_id));
        };
        if !slot_elapsed(r, &slot, today, now) {
            return Err(EngineError::TransitionNotAllowed(
                "the reserved slot has not elapsed",
            ));
        }

        let no_show = !r.any_attended();
        let mut events = vec![LedgerEvent::ReservationClosed {
            id,
            room: r.room.clone(),
            no_show,
        }];

        let mut sanctioned = Vec::new();
        let mut sanctions_created = 0;
        if no_show {
            let start = r.date;
            let end = start + Duration::days(window_days);
            let mut next_id = tables.next_sanction_id;
            for link in &r.participants {
                sanctioned.push(link.ci);
                if tables.sanction_keys.contains(&(link.ci, start, end)) {
                    continue;
                }
                events.push(LedgerEvent::SanctionCreated {
                    id: next_id,
                    ci: link.ci,
                    start,
                    end,
                    source: Some(id),
                });
                next_id += 1;
                sanctions_created += 1;
            }
        }

        self.persist_and_apply(&mut tables, events).await?;
        Ok(CloseOutcome {
            reservation_id: id,
            no_show,
            sanctioned,
            sanctions_created,
        })
    }

    /// Settle every stored-active reservation dated before `today`. One bad
    /// reservation never aborts the sweep: failures are collected into the
    /// summary and the rest proceed.
    pub async fn run_sweep(
        &self,
        today: NaiveDate,
        now: NaiveTime,
        window_days: i64,
    ) -> SweepSummary {
        let candidates: Vec<ReservationId> = {
            let tables = self.tables.read().await;
            tables
                .reservations
                .values()
                .filter(|r| r.status == StoredStatus::Active && r.date < today)
                .map(|r| r.id)
                .collect()
        };

        let mut summary = SweepSummary::default();
        for id in candidates {
            summary.processed += 1;
            match self.close_reservation(id, today, now, window_days).await {
                Ok(outcome) => {
                    if outcome.no_show {
                        summary.no_shows += 1;
                        summary.sanctions_created += outcome.sanctions_created;
                        metrics::counter!(
                            observability::SWEEP_RESERVATIONS_TOTAL,
                            "outcome" => "no_show"
                        )
                        .increment(1);
                        metrics::counter!(observability::SWEEP_SANCTIONS_TOTAL)
                            .increment(outcome.sanctions_created as u64);
                    } else {
                        summary.attended += 1;
                        metrics::counter!(
                            observability::SWEEP_RESERVATIONS_TOTAL,
                            "outcome" => "attended"
                        )
                        .increment(1);
                    }
                }
                Err(e) => {
                    tracing::warn!(reservation = id, error = %e, "sweep: close failed");
                    metrics::counter!(observability::SWEEP_FAILURES_TOTAL).increment(1);
                    summary.failures.push(SweepFailure {
                        reservation_id: id,
                        error: e.to_string(),
                    });
                }
            }
        }

        tracing::info!(
            processed = summary.processed,
            attended = summary.attended,
            no_shows = summary.no_shows,
            sanctions = summary.sanctions_created,
            failures = summary.failures.len(),
            "lifecycle sweep finished"
        );
        summary
    }
}
