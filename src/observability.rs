use std::net::SocketAddr;

use crate::engine::Reject;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: reservations committed. Labels: none (one increment per slot).
pub const BOOKINGS_TOTAL: &str = "aula_bookings_total";

/// Counter: booking batches rejected. Labels: reason.
pub const BOOKINGS_REJECTED_TOTAL: &str = "aula_bookings_rejected_total";

/// Counter: reservations cancelled.
pub const CANCELLATIONS_TOTAL: &str = "aula_cancellations_total";

// ── Sweep metrics ───────────────────────────────────────────────

/// Counter: reservations processed by the lifecycle sweep. Labels: outcome.
pub const SWEEP_RESERVATIONS_TOTAL: &str = "aula_sweep_reservations_total";

/// Counter: sanctions inserted by the sweep.
pub const SWEEP_SANCTIONS_TOTAL: &str = "aula_sweep_sanctions_total";

/// Counter: per-reservation sweep failures (non-fatal to the batch).
pub const SWEEP_FAILURES_TOTAL: &str = "aula_sweep_failures_total";

// ── WAL metrics ─────────────────────────────────────────────────

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "aula_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "aula_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .expect("failed to install Prometheus metrics exporter");
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
}

/// Map an admission rejection to a short label for metrics.
pub fn reject_label(reject: &Reject) -> &'static str {
    match reject {
        Reject::RoomNotFound { .. } => "room_not_found",
        Reject::CapacityExceeded { .. } => "capacity_exceeded",
        Reject::SlotAlreadyBooked { .. } => "slot_already_booked",
        Reject::InvalidSlot { .. } => "invalid_slot",
        Reject::ParticipantSanctioned { .. } => "participant_sanctioned",
        Reject::NoProgramAffiliation { .. } => "no_program_affiliation",
        Reject::FacultyOnlyRoom { .. } => "faculty_only_room",
        Reject::GraduateOnlyRoom { .. } => "graduate_only_room",
        Reject::DailyCapExceeded { .. } => "daily_cap_exceeded",
        Reject::WeeklyCapExceeded { .. } => "weekly_cap_exceeded",
    }
}
