mod error;
mod lifecycle;
mod mutations;
mod queries;
mod roles;
mod sanctions;
mod validate;
#[cfg(test)]
mod tests;

pub use error::{EngineError, Reject};
pub use lifecycle::derived_status;
pub use roles::{effective_role, parse_category_label, parse_role_label};

use std::collections::{BTreeMap, HashSet};
use std::io;
use std::path::Path;
use std::sync::Arc;

use chrono::NaiveDate;
use tokio::sync::{RwLock, mpsc, oneshot};

use crate::config::Config;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    /// Append a batch of events atomically (one fsync covers them all).
    Append {
        events: Vec<LedgerEvent>,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<LedgerEvent>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond Ok to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { events, response } => {
                let mut batch = vec![(events, response)];

                // Drain all immediately available appends
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { events, response }) => {
                            batch.push((events, response));
                        }
                        Ok(other) => {
                            // Flush current batch first, then handle the non-append command
                            flush_and_respond(&mut wal, &mut batch);
                            handle_non_append(&mut wal, other);
                            break;
                        }
                        Err(_) => break, // channel empty — flush batch
                    }
                }

                if !batch.is_empty() {
                    flush_and_respond(&mut wal, &mut batch);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

type PendingAppend = (Vec<LedgerEvent>, oneshot::Sender<io::Result<()>>);

fn flush_and_respond(wal: &mut Wal, batch: &mut Vec<PendingAppend>) {
    let event_count: usize = batch.iter().map(|(events, _)| events.len()).sum();
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(event_count as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &mut [PendingAppend]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    'outer: for (events, _) in batch.iter() {
        for event in events {
            if let Err(e) = wal.append_buffered(event) {
                append_err = Some(e);
                break 'outer;
            }
        }
    }
    // Always flush — even on append error — so partially buffered bytes
    // don't leak into the next batch (callers were told this batch failed).
    let flush_err = wal.flush_sync().err();
    if let Some(e) = append_err {
        return Err(e);
    }
    if let Some(e) = flush_err {
        return Err(e);
    }
    Ok(())
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

// ── Tables ───────────────────────────────────────────────

/// The relational tables, replayed from the WAL at startup. The engine holds
/// them behind a single `RwLock`; a write guard is the unit of work of the
/// batch committer — every re-validation read and every insert of a batch
/// happens under one guard, so partial commits cannot happen.
#[derive(Debug, Default)]
pub struct Tables {
    pub(super) rooms: BTreeMap<RoomKey, Room>,
    pub(super) participants: BTreeMap<Ci, Participant>,
    pub(super) slots: BTreeMap<SlotId, TimeSlot>,
    pub(super) reservations: BTreeMap<ReservationId, Reservation>,
    pub(super) sanctions: BTreeMap<SanctionId, Sanction>,
    /// Authoritative uniqueness guard: one active reservation per
    /// (room, date, slot). The validator's existence check is only the
    /// fast-path pre-filter; membership here decides.
    pub(super) active_index: HashSet<(RoomKey, NaiveDate, SlotId)>,
    /// Natural-key index for idempotent sanction creation.
    pub(super) sanction_keys: HashSet<(Ci, NaiveDate, NaiveDate)>,
    pub(super) next_reservation_id: ReservationId,
    pub(super) next_sanction_id: SanctionId,
}

impl Tables {
    /// Apply one event. Infallible: mutations validate before emitting, and
    /// replay trusts the log.
    pub(super) fn apply(&mut self, event: &LedgerEvent) {
        match event {
            LedgerEvent::RoomCreated {
                room,
                capacity,
                category,
            }
            | LedgerEvent::RoomUpdated {
                room,
                capacity,
                category,
            } => {
                self.rooms.insert(
                    room.clone(),
                    Room {
                        capacity: *capacity,
                        category: *category,
                    },
                );
            }
            LedgerEvent::RoomDeleted { room } => {
                self.rooms.remove(room);
            }
            LedgerEvent::ParticipantCreated {
                ci,
                name,
                surname,
                email,
            } => {
                self.participants.insert(
                    *ci,
                    Participant {
                        ci: *ci,
                        name: name.clone(),
                        surname: surname.clone(),
                        email: email.clone(),
                        affiliations: Vec::new(),
                    },
                );
            }
            LedgerEvent::ParticipantDeleted { ci } => {
                self.participants.remove(ci);
            }
            LedgerEvent::AffiliationAdded { ci, program, role } => {
                if let Some(p) = self.participants.get_mut(ci) {
                    p.affiliations.push(Affiliation {
                        program: program.clone(),
                        role: *role,
                    });
                }
            }
            LedgerEvent::AffiliationRemoved { ci, program } => {
                if let Some(p) = self.participants.get_mut(ci) {
                    p.affiliations.retain(|a| a.program != *program);
                }
            }
            LedgerEvent::SlotAdded { id, start, end } => {
                self.slots.insert(
                    *id,
                    TimeSlot {
                        id: *id,
                        start: *start,
                        end: *end,
                    },
                );
            }
            LedgerEvent::ReservationBooked {
                id,
                room,
                date,
                slot_id,
                participants,
            } => {
                self.reservations.insert(
                    *id,
                    Reservation {
                        id: *id,
                        room: room.clone(),
                        date: *date,
                        slot_id: *slot_id,
                        status: StoredStatus::Active,
                        participants: participants
                            .iter()
                            .map(|&ci| ParticipantLink {
                                ci,
                                attendance: None,
                            })
                            .collect(),
                    },
                );
                self.active_index.insert((room.clone(), *date, *slot_id));
                self.next_reservation_id = self.next_reservation_id.max(id + 1);
            }
            LedgerEvent::ReservationCancelled { id, .. } => {
                if let Some(r) = self.reservations.get_mut(id) {
                    r.status = StoredStatus::Cancelled;
                    self.active_index.remove(&(r.room.clone(), r.date, r.slot_id));
                }
            }
            LedgerEvent::ReservationClosed { id, no_show, .. } => {
                if let Some(r) = self.reservations.get_mut(id) {
                    r.status = if *no_show {
                        StoredStatus::NoShow
                    } else {
                        StoredStatus::Closed
                    };
                    self.active_index.remove(&(r.room.clone(), r.date, r.slot_id));
                }
            }
            LedgerEvent::ReservationDeleted { id, .. } => {
                if let Some(r) = self.reservations.remove(id) {
                    self.active_index.remove(&(r.room, r.date, r.slot_id));
                }
            }
            LedgerEvent::AttendanceMarked {
                reservation_id,
                ci,
                attended,
            } => {
                if let Some(r) = self.reservations.get_mut(reservation_id)
                    && let Some(link) = r.participants.iter_mut().find(|l| l.ci == *ci)
                {
                    link.attendance = Some(*attended);
                }
            }
            LedgerEvent::SanctionCreated {
                id,
                ci,
                start,
                end,
                source,
            } => {
                self.sanctions.insert(
                    *id,
                    Sanction {
                        id: *id,
                        ci: *ci,
                        start: *start,
                        end: *end,
                        source: *source,
                    },
                );
                self.sanction_keys.insert((*ci, *start, *end));
                self.next_sanction_id = self.next_sanction_id.max(id + 1);
            }
            LedgerEvent::SanctionRemoved { id } => {
                if let Some(s) = self.sanctions.remove(id) {
                    self.sanction_keys.remove(&(s.ci, s.start, s.end));
                }
            }
            LedgerEvent::SanctionExtended { id, end } => {
                if let Some(s) = self.sanctions.get_mut(id) {
                    self.sanction_keys.remove(&(s.ci, s.start, s.end));
                    s.end = *end;
                    self.sanction_keys.insert((s.ci, s.start, s.end));
                }
            }
        }
    }

    /// Used by the Admission Validator (check 5) and the delete guards.
    pub(super) fn is_sanctioned(&self, ci: Ci, today: NaiveDate) -> bool {
        self.sanctions
            .values()
            .any(|s| s.ci == ci && s.is_active(today))
    }
}

// ── Engine ───────────────────────────────────────────────

pub struct Engine {
    pub(super) tables: Arc<RwLock<Tables>>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    pub config: Config,
    replayed_events: u64,
}

impl Engine {
    /// Replay the WAL at `wal_path` into fresh tables and start the
    /// group-commit writer task.
    pub fn open(wal_path: &Path, config: Config, notify: Arc<NotifyHub>) -> io::Result<Self> {
        let events = Wal::replay(wal_path)?;
        let wal = Wal::open(wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let mut tables = Tables::default();
        for event in &events {
            tables.apply(event);
        }

        Ok(Self {
            tables: Arc::new(RwLock::new(tables)),
            wal_tx,
            notify,
            config,
            replayed_events: events.len() as u64,
        })
    }

    /// Number of events replayed from disk at startup. Together with
    /// `wal_appends_since_compact` this is the compaction backlog.
    pub fn replayed_events(&self) -> u64 {
        self.replayed_events
    }

    /// Write a batch of events to the WAL via the background group-commit
    /// writer. All events in the batch become durable together or not at all.
    pub(super) async fn wal_append(&self, events: Vec<LedgerEvent>) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                events,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::Storage("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Storage("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Storage(e.to_string()))
    }

    /// WAL-append + apply + notify for a whole batch, in that order. If the
    /// WAL write fails nothing is applied — the caller's write guard still
    /// holds the untouched tables, which is the rollback.
    pub(super) async fn persist_and_apply(
        &self,
        tables: &mut Tables,
        events: Vec<LedgerEvent>,
    ) -> Result<(), EngineError> {
        self.wal_append(events.clone()).await?;
        for event in &events {
            tables.apply(event);
            if let Some(room) = event_room(event) {
                self.notify.send(room, event);
            }
        }
        Ok(())
    }

    /// Compact the WAL by rewriting it with only the events needed to
    /// recreate the current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let events = {
            let tables = self.tables.read().await;
            snapshot_events(&tables)
        };

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact {
                events,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::Storage("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Storage("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Storage(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

/// The room a reservation-related event belongs to, for notification routing.
fn event_room(event: &LedgerEvent) -> Option<&RoomKey> {
    match event {
        LedgerEvent::RoomCreated { room, .. }
        | LedgerEvent::RoomUpdated { room, .. }
        | LedgerEvent::RoomDeleted { room }
        | LedgerEvent::ReservationBooked { room, .. }
        | LedgerEvent::ReservationCancelled { room, .. }
        | LedgerEvent::ReservationClosed { room, .. }
        | LedgerEvent::ReservationDeleted { room, .. } => Some(room),
        _ => None,
    }
}

/// Minimal event sequence that recreates `tables` when replayed.
fn snapshot_events(tables: &Tables) -> Vec<LedgerEvent> {
    let mut events = Vec::new();

    for (key, room) in &tables.rooms {
        events.push(LedgerEvent::RoomCreated {
            room: key.clone(),
            capacity: room.capacity,
            category: room.category,
        });
    }
    for p in tables.participants.values() {
        events.push(LedgerEvent::ParticipantCreated {
            ci: p.ci,
            name: p.name.clone(),
            surname: p.surname.clone(),
            email: p.email.clone(),
        });
        for a in &p.affiliations {
            events.push(LedgerEvent::AffiliationAdded {
                ci: p.ci,
                program: a.program.clone(),
                role: a.role,
            });
        }
    }
    for slot in tables.slots.values() {
        events.push(LedgerEvent::SlotAdded {
            id: slot.id,
            start: slot.start,
            end: slot.end,
        });
    }
    for r in tables.reservations.values() {
        events.push(LedgerEvent::ReservationBooked {
            id: r.id,
            room: r.room.clone(),
            date: r.date,
            slot_id: r.slot_id,
            participants: r.participants.iter().map(|l| l.ci).collect(),
        });
        for link in &r.participants {
            if let Some(attended) = link.attendance {
                events.push(LedgerEvent::AttendanceMarked {
                    reservation_id: r.id,
                    ci: link.ci,
                    attended,
                });
            }
        }
        match r.status {
            StoredStatus::Active => {}
            StoredStatus::Cancelled => events.push(LedgerEvent::ReservationCancelled {
                id: r.id,
                room: r.room.clone(),
            }),
            StoredStatus::Closed => events.push(LedgerEvent::ReservationClosed {
                id: r.id,
                room: r.room.clone(),
                no_show: false,
            }),
            StoredStatus::NoShow => events.push(LedgerEvent::ReservationClosed {
                id: r.id,
                room: r.room.clone(),
                no_show: true,
            }),
        }
    }
    for s in tables.sanctions.values() {
        events.push(LedgerEvent::SanctionCreated {
            id: s.id,
            ci: s.ci,
            start: s.start,
            end: s.end,
            source: s.source,
        });
    }

    events
}
