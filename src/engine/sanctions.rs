use std::collections::HashSet;

use chrono::{Duration, NaiveDate};

use crate::model::{Ci, LedgerEvent, ReservationId, SanctionInfo};

use super::{Engine, EngineError};

impl Engine {
    /// Record a sanction for `ci` covering `start..=end` (both inclusive).
    /// Idempotent on the natural key (ci, start, end): returns `Ok(false)`
    /// without writing anything when an identical sanction already exists.
    /// `source` is set by the lifecycle sweep to the no-show reservation;
    /// manually created sanctions pass `None`.
    pub async fn create_sanction(
        &self,
        ci: Ci,
        start: NaiveDate,
        end: NaiveDate,
        source: Option<ReservationId>,
    ) -> Result<bool, EngineError> {
        if end < start {
            return Err(EngineError::InvalidInput(
                "sanction end date precedes start date".into(),
            ));
        }

        let mut tables = self.tables.write().await;
        if !tables.participants.contains_key(&ci) {
            return Err(EngineError::ParticipantNotFound(ci));
        }
        if tables.sanction_keys.contains(&(ci, start, end)) {
            return Ok(false);
        }

        let id = tables.next_sanction_id;
        let event = LedgerEvent::SanctionCreated {
            id,
            ci,
            start,
            end,
            source,
        };
        self.persist_and_apply(&mut tables, vec![event]).await?;
        tracing::info!(ci, %start, %end, "sanction created");
        Ok(true)
    }

    /// Remove the sanction identified by its natural key. Returns the number
    /// of rows removed; 0 means no match, which callers treat as non-fatal.
    pub async fn remove_sanction(
        &self,
        ci: Ci,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<usize, EngineError> {
        let mut tables = self.tables.write().await;
        let Some(id) = tables
            .sanctions
            .values()
            .find(|s| s.ci == ci && s.start == start && s.end == end)
            .map(|s| s.id)
        else {
            return Ok(0);
        };
        self.persist_and_apply(&mut tables, vec![LedgerEvent::SanctionRemoved { id }])
            .await?;
        tracing::info!(ci, %start, %end, "sanction removed");
        Ok(1)
    }

    /// Bulk maintenance: stretch every sanction shorter than `min_days` so it
    /// spans exactly `min_days` from its start. Returns how many were
    /// extended. Used when the institutional sanction window is lengthened
    /// and existing sanctions must follow.
    ///
    /// An extension that would land on an already-taken (ci, start, end)
    /// natural key is skipped, so two rows never collapse onto one key.
    pub async fn extend_all_sanctions(&self, min_days: i64) -> Result<usize, EngineError> {
        if min_days < 0 {
            return Err(EngineError::InvalidInput(
                "sanction window must be non-negative".into(),
            ));
        }

        let mut tables = self.tables.write().await;
        let mut claimed: HashSet<(Ci, NaiveDate, NaiveDate)> = HashSet::new();
        let events: Vec<LedgerEvent> = tables
            .sanctions
            .values()
            .filter(|s| (s.end - s.start).num_days() < min_days)
            .filter_map(|s| {
                let end = s.start + Duration::days(min_days);
                let key = (s.ci, s.start, end);
                if tables.sanction_keys.contains(&key) || !claimed.insert(key) {
                    return None;
                }
                Some(LedgerEvent::SanctionExtended { id: s.id, end })
            })
            .collect();

        let extended = events.len();
        if extended > 0 {
            self.persist_and_apply(&mut tables, events).await?;
            tracing::info!(extended, min_days, "sanctions extended");
        }
        Ok(extended)
    }

    /// List sanctions with the derived display fields, optionally filtered
    /// to one participant and/or to currently active sanctions.
    pub async fn list_sanctions(
        &self,
        ci: Option<Ci>,
        active_only: bool,
        today: NaiveDate,
    ) -> Vec<SanctionInfo> {
        let tables = self.tables.read().await;
        tables
            .sanctions
            .values()
            .filter(|s| ci.is_none_or(|ci| s.ci == ci))
            .filter(|s| !active_only || s.is_active(today))
            .map(|s| SanctionInfo {
                id: s.id,
                ci: s.ci,
                start: s.start,
                end: s.end,
                source: s.source,
                duration_days: (s.end - s.start).num_days(),
                days_remaining: (s.end - today).num_days(),
            })
            .collect()
    }

    /// Whether `ci` is under any active sanction on `today`.
    pub async fn is_sanctioned(&self, ci: Ci, today: NaiveDate) -> bool {
        self.tables.read().await.is_sanctioned(ci, today)
    }
}
