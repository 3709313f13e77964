use std::path::PathBuf;
use std::sync::Arc;

use chrono::{NaiveDate, NaiveTime};
use tokio_test::assert_ok;

use crate::config::Config;
use crate::model::*;
use crate::notify::NotifyHub;

use super::{Engine, EngineError, Reject};

fn d(s: &str) -> NaiveDate {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
}

fn t(h: u32, m: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(h, m, 0).unwrap()
}

fn test_wal(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("aula_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn open_engine(path: &std::path::Path) -> Engine {
    Engine::open(path, Config::default(), Arc::new(NotifyHub::new())).unwrap()
}

fn lab() -> RoomKey {
    RoomKey::new("Lab A", "Main")
}

fn seminar() -> RoomKey {
    RoomKey::new("Seminar", "Main")
}

fn office() -> RoomKey {
    RoomKey::new("Faculty Office", "Main")
}

// 2025-03-10 is a Monday.
const MONDAY: &str = "2025-03-10";

/// Open-category Lab A (capacity 2), a graduate room, a faculty room, four
/// participants (undergrad 111, grad 222, faculty 333, unaffiliated 444),
/// and four two-hour slots.
async fn seed(e: &Engine) {
    e.create_room(lab(), 2, RoomCategory::Open).await.unwrap();
    e.create_room(seminar(), 6, RoomCategory::Graduate)
        .await
        .unwrap();
    e.create_room(office(), 4, RoomCategory::Faculty)
        .await
        .unwrap();

    e.create_participant(111, "Ana", "Silva", "ana@example.edu")
        .await
        .unwrap();
    e.add_affiliation(111, "Physics BSc", Role::Undergraduate)
        .await
        .unwrap();
    e.create_participant(222, "Bruno", "Costa", "bruno@example.edu")
        .await
        .unwrap();
    e.add_affiliation(222, "Physics MSc", Role::Graduate)
        .await
        .unwrap();
    e.create_participant(333, "Carla", "Mendez", "carla@example.edu")
        .await
        .unwrap();
    e.add_affiliation(333, "Physics Dept", Role::Faculty)
        .await
        .unwrap();
    e.create_participant(444, "Diego", "Rojas", "diego@example.edu")
        .await
        .unwrap();

    for (id, hour) in [(1u32, 8), (2, 10), (3, 12), (4, 14)] {
        e.add_slot(id, t(hour, 0), t(hour + 2, 0)).await.unwrap();
    }
}

// ── Admission ────────────────────────────────────────────

#[tokio::test]
async fn book_single_slot() {
    let e = open_engine(&test_wal("book_single.wal"));
    seed(&e).await;
    let today = d(MONDAY);

    let booked = assert_ok!(e.book_batch(&lab(), d("2025-03-12"), &[1], &[111], today).await);
    assert_eq!(booked.len(), 1);
    assert_eq!(booked[0].slot_id, 1);

    let view = e
        .get_reservation(booked[0].reservation_id, today, t(9, 0))
        .await
        .unwrap();
    assert_eq!(view.derived, DerivedStatus::Active);
    assert_eq!(view.participants.len(), 1);
}

#[tokio::test]
async fn unknown_room_rejected() {
    let e = open_engine(&test_wal("unknown_room.wal"));
    seed(&e).await;

    let err = e
        .book_batch(
            &RoomKey::new("Basement", "Main"),
            d("2025-03-12"),
            &[1],
            &[111],
            d(MONDAY),
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::Validation(Reject::RoomNotFound { .. })
    ));
}

#[tokio::test]
async fn capacity_exceeded_rejected() {
    let e = open_engine(&test_wal("capacity.wal"));
    seed(&e).await;

    // Lab A holds 2; a group of 3 does not fit
    let err = e
        .book_batch(&lab(), d("2025-03-12"), &[1], &[111, 222, 333], d(MONDAY))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::Validation(Reject::CapacityExceeded { capacity: 2 })
    ));
}

#[tokio::test]
async fn taken_slot_is_conflict_at_commit_but_reject_at_precheck() {
    let e = open_engine(&test_wal("taken_slot.wal"));
    seed(&e).await;
    let today = d(MONDAY);
    let date = d("2025-03-12");

    assert_ok!(e.book_batch(&lab(), date, &[1], &[111], today).await);

    // Pre-check path: plain validation failure
    let err = e
        .validate_booking(&lab(), date, &[1], &[222], today)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::Validation(Reject::SlotAlreadyBooked { slot_id: 1 })
    ));

    // Commit path: the authoritative re-validation reports a conflict
    let err = e
        .book_batch(&lab(), date, &[1], &[222], today)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::ConflictOnCommit { slot_id: 1 }));
}

#[tokio::test]
async fn unknown_slot_rejected() {
    let e = open_engine(&test_wal("unknown_slot.wal"));
    seed(&e).await;

    let err = e
        .book_batch(&lab(), d("2025-03-12"), &[99], &[111], d(MONDAY))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::Validation(Reject::InvalidSlot { slot_id: 99 })
    ));
}

#[tokio::test]
async fn sanctioned_participant_rejected() {
    let e = open_engine(&test_wal("sanctioned.wal"));
    seed(&e).await;
    let today = d(MONDAY);

    assert_ok!(e.create_sanction(111, today, d("2025-05-09"), None).await);

    let err = e
        .book_batch(&lab(), d("2025-03-12"), &[1], &[111], today)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::Validation(Reject::ParticipantSanctioned { ci: 111 })
    ));

    // One sanctioned member taints the whole group
    let err = e
        .book_batch(&lab(), d("2025-03-12"), &[1], &[222, 111], today)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::Validation(Reject::ParticipantSanctioned { ci: 111 })
    ));
}

#[tokio::test]
async fn unaffiliated_participant_rejected() {
    let e = open_engine(&test_wal("unaffiliated.wal"));
    seed(&e).await;

    let err = e
        .book_batch(&lab(), d("2025-03-12"), &[1], &[444], d(MONDAY))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::Validation(Reject::NoProgramAffiliation { ci: 444 })
    ));
}

#[tokio::test]
async fn restricted_rooms_admit_by_effective_role() {
    let e = open_engine(&test_wal("restricted_rooms.wal"));
    seed(&e).await;
    let today = d(MONDAY);
    let date = d("2025-03-12");

    // Undergrad in a graduate room: rejected
    let err = e
        .book_batch(&seminar(), date, &[1], &[111], today)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::Validation(Reject::GraduateOnlyRoom { .. })
    ));

    // Grad in a graduate room: fine; grad in a faculty room: rejected
    assert_ok!(e.book_batch(&seminar(), date, &[2], &[222], today).await);
    let err = e
        .book_batch(&office(), date, &[1], &[222], today)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::Validation(Reject::FacultyOnlyRoom { .. })
    ));

    // Exclusivity cuts both ways: faculty belongs in the faculty room but
    // not in the graduate room
    assert_ok!(e.book_batch(&office(), date, &[2], &[333], today).await);
    let err = e
        .book_batch(&seminar(), date, &[3], &[333], today)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::Validation(Reject::GraduateOnlyRoom { .. })
    ));

    // A mixed grad+faculty group fails the graduate room too
    let err = e
        .book_batch(&seminar(), date, &[3], &[222, 333], today)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::Validation(Reject::GraduateOnlyRoom { .. })
    ));
}

#[tokio::test]
async fn revoking_a_faculty_affiliation_revokes_admission() {
    let e = open_engine(&test_wal("exclusivity_monotonic.wal"));
    seed(&e).await;
    let today = d(MONDAY);
    let date = d("2025-03-12");

    // 333 holds faculty and graduate affiliations; faculty wins
    e.add_affiliation(333, "Physics MSc", Role::Graduate)
        .await
        .unwrap();
    assert_ok!(e.book_batch(&office(), date, &[1], &[333], today).await);

    // Dropping the faculty affiliation demotes the effective role, so the
    // same combination is no longer admissible
    e.remove_affiliation(333, "Physics Dept").await.unwrap();
    let err = e
        .book_batch(&office(), date, &[2], &[333], today)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::Validation(Reject::FacultyOnlyRoom { .. })
    ));

    // Removing a program the participant never joined is an input error
    let err = e.remove_affiliation(333, "Physics Dept").await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidInput(_)));
}

#[tokio::test]
async fn undergrad_with_graduate_affiliation_uses_highest_role() {
    let e = open_engine(&test_wal("dual_role.wal"));
    seed(&e).await;
    e.add_affiliation(111, "Physics MSc", Role::Graduate)
        .await
        .unwrap();

    assert_ok!(
        e.book_batch(&seminar(), d("2025-03-12"), &[1], &[111], d(MONDAY))
            .await
    );
}

// ── Quotas ───────────────────────────────────────────────

#[tokio::test]
async fn daily_cap_counts_existing_plus_requested() {
    let e = open_engine(&test_wal("daily_cap.wal"));
    seed(&e).await;
    let today = d(MONDAY);
    let date = d("2025-03-12");

    assert_ok!(e.book_batch(&lab(), date, &[1], &[111], today).await);

    // 1 existing + 2 requested > 2: the whole batch is refused
    let err = e
        .book_batch(&lab(), date, &[2, 3], &[111], today)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::Validation(Reject::DailyCapExceeded { ci: 111, cap: 2 })
    ));

    // 1 existing + 1 requested = 2: exactly at the cap, admitted
    assert_ok!(e.book_batch(&lab(), date, &[2], &[111], today).await);
}

#[tokio::test]
async fn weekly_cap_spans_the_iso_week() {
    let e = open_engine(&test_wal("weekly_cap.wal"));
    seed(&e).await;
    let today = d(MONDAY);

    assert_ok!(e.book_batch(&lab(), d("2025-03-10"), &[1], &[111], today).await);
    assert_ok!(e.book_batch(&lab(), d("2025-03-11"), &[1], &[111], today).await);

    // 2 existing this week + 2 requested > 3
    let err = e
        .book_batch(&lab(), d("2025-03-12"), &[1, 2], &[111], today)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::Validation(Reject::WeeklyCapExceeded { ci: 111, cap: 3 })
    ));

    // 2 + 1 = 3: at the cap
    assert_ok!(e.book_batch(&lab(), d("2025-03-12"), &[1], &[111], today).await);

    // Next week is a fresh window
    assert_ok!(e.book_batch(&lab(), d("2025-03-17"), &[1], &[111], today).await);
}

#[tokio::test]
async fn quotas_apply_to_open_rooms_only() {
    let e = open_engine(&test_wal("quota_open_only.wal"));
    seed(&e).await;
    let today = d(MONDAY);
    let date = d("2025-03-12");

    // Four same-day reservations in a faculty room: no cap applies
    assert_ok!(
        e.book_batch(&office(), date, &[1, 2, 3, 4], &[333], today)
            .await
    );

    // Those reservations also don't count against the open-room caps
    assert_ok!(e.book_batch(&lab(), date, &[1, 2], &[333], today).await);
}

#[tokio::test]
async fn cancelled_reservations_do_not_count_against_quota() {
    let e = open_engine(&test_wal("quota_cancelled.wal"));
    seed(&e).await;
    let today = d(MONDAY);
    let date = d("2025-03-14");

    let booked = e
        .book_batch(&lab(), date, &[1, 2], &[111], today)
        .await
        .unwrap();
    e.cancel_reservation(booked[0].reservation_id, today)
        .await
        .unwrap();

    // 1 remaining active + 1 requested = 2
    assert_ok!(e.book_batch(&lab(), date, &[3], &[111], today).await);
}

// ── Batch atomicity ──────────────────────────────────────

#[tokio::test]
async fn batch_is_all_or_nothing() {
    let e = open_engine(&test_wal("batch_atomic.wal"));
    seed(&e).await;
    let today = d(MONDAY);
    let date = d("2025-03-12");

    // Slot 99 does not exist, so nothing from the batch may land
    let err = e
        .book_batch(&lab(), date, &[1, 99], &[111], today)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::Validation(Reject::InvalidSlot { slot_id: 99 })
    ));

    let free = e.available_slots(&lab(), date).await.unwrap();
    assert_eq!(free.len(), 4, "no reservation may survive a failed batch");
}

#[tokio::test]
async fn batch_books_one_reservation_per_slot() {
    let e = open_engine(&test_wal("batch_multi.wal"));
    seed(&e).await;
    let today = d(MONDAY);
    let date = d("2025-03-12");

    let booked = e
        .book_batch(&lab(), date, &[1, 2], &[111, 222], today)
        .await
        .unwrap();
    assert_eq!(booked.len(), 2);
    assert_ne!(booked[0].reservation_id, booked[1].reservation_id);

    for b in &booked {
        let view = e.get_reservation(b.reservation_id, today, t(9, 0)).await.unwrap();
        assert_eq!(view.participants.len(), 2);
        assert_eq!(view.date, date);
    }

    let free = e.available_slots(&lab(), date).await.unwrap();
    assert_eq!(free.iter().map(|s| s.id).collect::<Vec<_>>(), vec![3, 4]);
}

#[tokio::test]
async fn past_date_rejected() {
    let e = open_engine(&test_wal("past_date.wal"));
    seed(&e).await;

    let err = e
        .book_batch(&lab(), d("2025-03-09"), &[1], &[111], d(MONDAY))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidInput(_)));
}

// ── Cancellation ─────────────────────────────────────────

#[tokio::test]
async fn cancellation_requires_two_days_notice() {
    let e = open_engine(&test_wal("cancel_window.wal"));
    seed(&e).await;
    let today = d(MONDAY);

    // Tomorrow: 1 day of notice, inside the window
    let booked = e
        .book_batch(&lab(), d("2025-03-11"), &[1], &[111], today)
        .await
        .unwrap();
    let err = e
        .cancel_reservation(booked[0].reservation_id, today)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::CancellationWindow { days: 2 }));

    // Day after tomorrow: exactly 2 days, allowed
    let booked = e
        .book_batch(&lab(), d("2025-03-12"), &[1], &[111], today)
        .await
        .unwrap();
    assert_ok!(e.cancel_reservation(booked[0].reservation_id, today).await);

    let view = e
        .get_reservation(booked[0].reservation_id, today, t(9, 0))
        .await
        .unwrap();
    assert_eq!(view.derived, DerivedStatus::Cancelled);
}

#[tokio::test]
async fn cancelling_frees_the_slot() {
    let e = open_engine(&test_wal("cancel_frees.wal"));
    seed(&e).await;
    let today = d(MONDAY);
    let date = d("2025-03-14");

    let booked = e.book_batch(&lab(), date, &[1], &[111], today).await.unwrap();
    e.cancel_reservation(booked[0].reservation_id, today)
        .await
        .unwrap();

    assert_ok!(e.book_batch(&lab(), date, &[1], &[222], today).await);
}

#[tokio::test]
async fn cancel_twice_not_allowed() {
    let e = open_engine(&test_wal("cancel_twice.wal"));
    seed(&e).await;
    let today = d(MONDAY);

    let booked = e
        .book_batch(&lab(), d("2025-03-14"), &[1], &[111], today)
        .await
        .unwrap();
    e.cancel_reservation(booked[0].reservation_id, today)
        .await
        .unwrap();
    let err = e
        .cancel_reservation(booked[0].reservation_id, today)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::TransitionNotAllowed(_)));
}

// ── Sanction ledger ──────────────────────────────────────

#[tokio::test]
async fn sanction_creation_is_idempotent() {
    let e = open_engine(&test_wal("sanction_idem.wal"));
    seed(&e).await;
    let start = d(MONDAY);
    let end = d("2025-05-09");

    assert!(e.create_sanction(111, start, end, None).await.unwrap());
    assert!(!e.create_sanction(111, start, end, None).await.unwrap());

    let all = e.list_sanctions(Some(111), false, start).await;
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].duration_days, 60);
    assert_eq!(all[0].days_remaining, 60);
}

#[tokio::test]
async fn sanction_listing_filters_active() {
    let e = open_engine(&test_wal("sanction_list.wal"));
    seed(&e).await;

    e.create_sanction(111, d("2025-01-01"), d("2025-02-01"), None)
        .await
        .unwrap();
    e.create_sanction(111, d("2025-03-01"), d("2025-04-01"), None)
        .await
        .unwrap();
    e.create_sanction(222, d("2025-03-01"), d("2025-04-01"), None)
        .await
        .unwrap();

    let today = d(MONDAY);
    assert_eq!(e.list_sanctions(None, false, today).await.len(), 3);
    assert_eq!(e.list_sanctions(None, true, today).await.len(), 2);
    assert_eq!(e.list_sanctions(Some(111), true, today).await.len(), 1);

    let expired = &e.list_sanctions(Some(111), false, today).await[0];
    assert!(expired.days_remaining < 0);
}

#[tokio::test]
async fn remove_sanction_by_natural_key() {
    let e = open_engine(&test_wal("sanction_remove.wal"));
    seed(&e).await;
    let start = d(MONDAY);
    let end = d("2025-05-09");

    e.create_sanction(111, start, end, None).await.unwrap();
    assert_eq!(e.remove_sanction(111, start, end).await.unwrap(), 1);
    assert!(!e.is_sanctioned(111, start).await);

    // Second removal finds nothing; non-fatal
    assert_eq!(e.remove_sanction(111, start, end).await.unwrap(), 0);
}

#[tokio::test]
async fn extend_all_lengthens_short_sanctions_only() {
    let e = open_engine(&test_wal("sanction_extend.wal"));
    seed(&e).await;

    // 30-day and 90-day windows
    e.create_sanction(111, d(MONDAY), d("2025-04-09"), None)
        .await
        .unwrap();
    e.create_sanction(222, d(MONDAY), d("2025-06-08"), None)
        .await
        .unwrap();

    let extended = e.extend_all_sanctions(60).await.unwrap();
    assert_eq!(extended, 1);

    let s111 = &e.list_sanctions(Some(111), false, d(MONDAY)).await[0];
    assert_eq!(s111.end, d("2025-05-09"));
    let s222 = &e.list_sanctions(Some(222), false, d(MONDAY)).await[0];
    assert_eq!(s222.end, d("2025-06-08"), "longer sanction untouched");

    // Second run is a no-op
    assert_eq!(e.extend_all_sanctions(60).await.unwrap(), 0);
}

#[tokio::test]
async fn extend_all_skips_colliding_natural_keys() {
    let e = open_engine(&test_wal("sanction_extend_collide.wal"));
    seed(&e).await;
    let start = d(MONDAY);

    // Same participant and start, two short windows: only one of them can
    // own the (111, start, start + 60) key after extension
    e.create_sanction(111, start, d("2025-03-20"), None)
        .await
        .unwrap();
    e.create_sanction(111, start, d("2025-03-30"), None)
        .await
        .unwrap();

    assert_eq!(e.extend_all_sanctions(60).await.unwrap(), 1);

    let mut ends: Vec<_> = e
        .list_sanctions(Some(111), false, start)
        .await
        .iter()
        .map(|s| s.end)
        .collect();
    ends.sort();
    assert_eq!(ends, vec![d("2025-03-30"), d("2025-05-09")]);

    // The keys stayed distinct: removing the extended row leaves the other
    // one's key intact, so idempotent create still sees it
    assert_eq!(
        e.remove_sanction(111, start, d("2025-05-09")).await.unwrap(),
        1
    );
    assert!(!e.create_sanction(111, start, d("2025-03-30"), None).await.unwrap());
}

// ── Lifecycle ────────────────────────────────────────────

#[tokio::test]
async fn sweep_sanctions_no_shows_and_spares_attendees() {
    let e = open_engine(&test_wal("sweep_basic.wal"));
    seed(&e).await;

    let booked_day = d("2025-03-08");
    let a = e
        .book_batch(&lab(), booked_day, &[1], &[111], booked_day)
        .await
        .unwrap();
    let b = e
        .book_batch(&lab(), booked_day, &[2], &[222], booked_day)
        .await
        .unwrap();
    e.mark_attendance(b[0].reservation_id, 222, true)
        .await
        .unwrap();

    let today = d(MONDAY);
    let summary = e.run_sweep(today, t(3, 0), 60).await;
    assert_eq!(summary.processed, 2);
    assert_eq!(summary.attended, 1);
    assert_eq!(summary.no_shows, 1);
    assert_eq!(summary.sanctions_created, 1);
    assert!(summary.failures.is_empty());

    assert!(e.is_sanctioned(111, today).await);
    assert!(!e.is_sanctioned(222, today).await);

    // Sanction window: 60 days anchored at the reservation date, inclusive
    let s = &e.list_sanctions(Some(111), true, today).await[0];
    assert_eq!(s.start, d("2025-03-08"));
    assert_eq!(s.end, d("2025-05-07"));
    assert_eq!(s.source, Some(a[0].reservation_id));

    let view = e
        .get_reservation(a[0].reservation_id, today, t(3, 0))
        .await
        .unwrap();
    assert_eq!(view.stored, StoredStatus::NoShow);
    assert_eq!(view.derived, DerivedStatus::NoShow);
}

#[tokio::test]
async fn sweep_ignores_current_and_future_reservations() {
    let e = open_engine(&test_wal("sweep_future.wal"));
    seed(&e).await;
    let today = d(MONDAY);

    e.book_batch(&lab(), today, &[1], &[111], today).await.unwrap();
    e.book_batch(&lab(), d("2025-03-12"), &[1], &[222], today)
        .await
        .unwrap();

    let summary = e.run_sweep(today, t(23, 0), 60).await;
    assert_eq!(summary.processed, 0);
}

#[tokio::test]
async fn sweep_rerun_does_not_double_sanction() {
    let e = open_engine(&test_wal("sweep_rerun.wal"));
    seed(&e).await;

    let booked_day = d("2025-03-08");
    e.book_batch(&lab(), booked_day, &[1], &[111], booked_day)
        .await
        .unwrap();

    let today = d(MONDAY);
    let first = e.run_sweep(today, t(3, 0), 60).await;
    assert_eq!(first.sanctions_created, 1);

    // Settled reservations are no longer candidates
    let second = e.run_sweep(today, t(3, 0), 60).await;
    assert_eq!(second.processed, 0);
    assert_eq!(e.list_sanctions(Some(111), false, today).await.len(), 1);
}

#[tokio::test]
async fn group_no_show_sanctions_every_participant() {
    let e = open_engine(&test_wal("sweep_group.wal"));
    seed(&e).await;

    let booked_day = d("2025-03-08");
    e.book_batch(&lab(), booked_day, &[1], &[111, 222], booked_day)
        .await
        .unwrap();

    let today = d(MONDAY);
    let summary = e.run_sweep(today, t(3, 0), 60).await;
    assert_eq!(summary.sanctions_created, 2);
    assert!(e.is_sanctioned(111, today).await);
    assert!(e.is_sanctioned(222, today).await);
}

#[tokio::test]
async fn one_attendee_clears_the_whole_group() {
    let e = open_engine(&test_wal("sweep_one_attends.wal"));
    seed(&e).await;

    let booked_day = d("2025-03-08");
    let booked = e
        .book_batch(&lab(), booked_day, &[1], &[111, 222], booked_day)
        .await
        .unwrap();
    e.mark_attendance(booked[0].reservation_id, 111, true)
        .await
        .unwrap();

    let today = d(MONDAY);
    let summary = e.run_sweep(today, t(3, 0), 60).await;
    assert_eq!(summary.attended, 1);
    assert_eq!(summary.no_shows, 0);
    assert!(!e.is_sanctioned(111, today).await);
    assert!(!e.is_sanctioned(222, today).await);
}

#[tokio::test]
async fn close_refuses_unelapsed_slot() {
    let e = open_engine(&test_wal("close_unelapsed.wal"));
    seed(&e).await;
    let today = d(MONDAY);

    // Slot 1 runs 08:00–10:00 today; at 09:00 it has not elapsed
    let booked = e.book_batch(&lab(), today, &[1], &[111], today).await.unwrap();
    let err = e
        .close_reservation(booked[0].reservation_id, today, t(9, 0), 60)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::TransitionNotAllowed(_)));

    // At 10:00 it has
    assert_ok!(
        e.close_reservation(booked[0].reservation_id, today, t(10, 0), 60)
            .await
    );
}

#[tokio::test]
async fn elapsed_unsettled_reservation_reads_as_no_show() {
    let e = open_engine(&test_wal("derived_noshow.wal"));
    seed(&e).await;
    let today = d(MONDAY);

    let booked = e.book_batch(&lab(), today, &[1], &[111], today).await.unwrap();
    let id = booked[0].reservation_id;

    // During the slot: active. After, without attendance: no-show.
    let view = e.get_reservation(id, today, t(9, 0)).await.unwrap();
    assert_eq!(view.derived, DerivedStatus::Active);
    let view = e.get_reservation(id, today, t(10, 30)).await.unwrap();
    assert_eq!(view.derived, DerivedStatus::NoShow);

    // With attendance recorded it reads attended even before the sweep
    e.mark_attendance(id, 111, true).await.unwrap();
    let view = e.get_reservation(id, today, t(10, 30)).await.unwrap();
    assert_eq!(view.stored, StoredStatus::Active);
    assert_eq!(view.derived, DerivedStatus::Attended);
}

// ── No-show reversal ─────────────────────────────────────

#[tokio::test]
async fn retroactive_attendance_reverses_the_sweep_sanction() {
    let e = open_engine(&test_wal("reversal.wal"));
    seed(&e).await;

    let booked_day = d("2025-03-08");
    let booked = e
        .book_batch(&lab(), booked_day, &[1], &[111], booked_day)
        .await
        .unwrap();
    let id = booked[0].reservation_id;

    let today = d(MONDAY);
    e.run_sweep(today, t(3, 0), 60).await;
    assert!(e.is_sanctioned(111, today).await);

    // A manual sanction with a different window must survive the reversal
    e.create_sanction(111, d("2025-03-01"), d("2025-03-20"), None)
        .await
        .unwrap();

    let reversed = e.mark_reservation_attended(id).await.unwrap();
    assert_eq!(reversed, 1);

    let remaining = e.list_sanctions(Some(111), false, today).await;
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].source, None);

    let view = e.get_reservation(id, today, t(12, 0)).await.unwrap();
    assert_eq!(view.stored, StoredStatus::Closed);
    assert_eq!(view.derived, DerivedStatus::Attended);
}

#[tokio::test]
async fn reversal_on_attended_close_is_a_noop() {
    let e = open_engine(&test_wal("reversal_noop.wal"));
    seed(&e).await;

    let booked_day = d("2025-03-08");
    let booked = e
        .book_batch(&lab(), booked_day, &[1], &[111], booked_day)
        .await
        .unwrap();
    let id = booked[0].reservation_id;
    e.mark_attendance(id, 111, true).await.unwrap();
    e.run_sweep(d(MONDAY), t(3, 0), 60).await;

    assert_eq!(e.mark_reservation_attended(id).await.unwrap(), 0);
}

// ── Sixty-day ban end to end ─────────────────────────────

#[tokio::test]
async fn no_show_ban_blocks_bookings_until_it_lapses() {
    let e = open_engine(&test_wal("ban_e2e.wal"));
    seed(&e).await;

    let booked_day = d("2025-03-08");
    e.book_batch(&lab(), booked_day, &[1], &[111], booked_day)
        .await
        .unwrap();
    e.run_sweep(d(MONDAY), t(3, 0), 60).await;

    // Mid-window: still banned
    let err = e
        .book_batch(&lab(), d("2025-04-16"), &[1], &[111], d("2025-04-15"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::Validation(Reject::ParticipantSanctioned { ci: 111 })
    ));

    // Last banned day: the window runs from the reservation date, 2025-03-08
    let err = e
        .book_batch(&lab(), d("2025-05-12"), &[1], &[111], d("2025-05-07"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));

    // Day after the window closes
    assert_ok!(
        e.book_batch(&lab(), d("2025-05-12"), &[1], &[111], d("2025-05-08"))
            .await
    );
}

#[tokio::test]
async fn sanctions_anchor_at_each_reservation_date() {
    let e = open_engine(&test_wal("sanction_anchor.wal"));
    seed(&e).await;

    // Two no-shows on different dates, settled by one sweep
    e.book_batch(&lab(), d("2025-03-03"), &[1], &[111], d("2025-03-03"))
        .await
        .unwrap();
    e.book_batch(&lab(), d("2025-03-08"), &[1], &[111], d("2025-03-08"))
        .await
        .unwrap();

    let today = d(MONDAY);
    let summary = e.run_sweep(today, t(3, 0), 60).await;
    assert_eq!(summary.no_shows, 2);
    assert_eq!(summary.sanctions_created, 2);

    let mut starts: Vec<_> = e
        .list_sanctions(Some(111), false, today)
        .await
        .iter()
        .map(|s| s.start)
        .collect();
    starts.sort();
    assert_eq!(starts, vec![d("2025-03-03"), d("2025-03-08")]);

    // Correcting the first no-show lifts only its own ban
    let first = e
        .list_reservations(Some(111), None, today, t(3, 0))
        .await
        .into_iter()
        .find(|v| v.date == d("2025-03-03"))
        .unwrap()
        .id;
    assert_eq!(e.mark_reservation_attended(first).await.unwrap(), 1);

    let remaining = e.list_sanctions(Some(111), false, today).await;
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].start, d("2025-03-08"));
    assert!(e.is_sanctioned(111, today).await);
}

// ── Catalog guards ───────────────────────────────────────

#[tokio::test]
async fn room_delete_guarded_by_upcoming_reservations() {
    let e = open_engine(&test_wal("room_delete.wal"));
    seed(&e).await;
    let today = d(MONDAY);

    let booked = e
        .book_batch(&lab(), d("2025-03-14"), &[1], &[111], today)
        .await
        .unwrap();
    let err = e.delete_room(lab(), today).await.unwrap_err();
    assert!(matches!(err, EngineError::InUse(_)));

    e.cancel_reservation(booked[0].reservation_id, today)
        .await
        .unwrap();
    assert_ok!(e.delete_room(lab(), today).await);
    assert!(e.get_room(&lab()).await.is_err());
}

#[tokio::test]
async fn capacity_shrink_guarded_by_active_groups() {
    let e = open_engine(&test_wal("room_shrink.wal"));
    seed(&e).await;
    let today = d(MONDAY);

    e.book_batch(&lab(), d("2025-03-14"), &[1], &[111, 222], today)
        .await
        .unwrap();

    let err = e.update_room(lab(), 1, RoomCategory::Open).await.unwrap_err();
    assert!(matches!(err, EngineError::InUse(_)));

    // Growing is always fine
    assert_ok!(e.update_room(lab(), 5, RoomCategory::Open).await);
}

#[tokio::test]
async fn participant_delete_guarded() {
    let e = open_engine(&test_wal("participant_delete.wal"));
    seed(&e).await;
    let today = d(MONDAY);

    let booked = e
        .book_batch(&lab(), d("2025-03-14"), &[1], &[111], today)
        .await
        .unwrap();
    let err = e.delete_participant(111, today).await.unwrap_err();
    assert!(matches!(err, EngineError::InUse(_)));

    e.cancel_reservation(booked[0].reservation_id, today)
        .await
        .unwrap();

    e.create_sanction(111, today, d("2025-05-09"), None)
        .await
        .unwrap();
    let err = e.delete_participant(111, today).await.unwrap_err();
    assert!(matches!(err, EngineError::InUse(_)));

    e.remove_sanction(111, today, d("2025-05-09")).await.unwrap();
    assert_ok!(e.delete_participant(111, today).await);
}

#[tokio::test]
async fn duplicate_rows_rejected() {
    let e = open_engine(&test_wal("dupes.wal"));
    seed(&e).await;

    let err = e.create_room(lab(), 4, RoomCategory::Open).await.unwrap_err();
    assert!(matches!(err, EngineError::AlreadyExists(_)));
    let err = e
        .create_participant(111, "Ana", "Silva", "ana@example.edu")
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::AlreadyExists(_)));
    // Same email under a new ci is also a duplicate
    let err = e
        .create_participant(555, "Eva", "Silva", "ana@example.edu")
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::AlreadyExists(_)));
    let err = e
        .add_affiliation(111, "Physics BSc", Role::Graduate)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::AlreadyExists(_)));
    let err = e.add_slot(1, t(8, 0), t(10, 0)).await.unwrap_err();
    assert!(matches!(err, EngineError::AlreadyExists(_)));
}

#[tokio::test]
async fn slot_catalog_validates_shape() {
    let e = open_engine(&test_wal("slot_shape.wal"));
    seed(&e).await;

    // Wrong length
    let err = e.add_slot(9, t(8, 0), t(9, 0)).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidInput(_)));
    // Outside operating hours (close is 23:00)
    let err = e.add_slot(9, t(21, 30), t(23, 30)).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidInput(_)));
}

#[tokio::test]
async fn participant_input_validated() {
    let e = open_engine(&test_wal("participant_input.wal"));
    seed(&e).await;

    let err = e
        .create_participant(555, "", "Silva", "x@example.edu")
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidInput(_)));
    let err = e
        .create_participant(555, "Eva", "Silva", "not-an-email")
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidInput(_)));
    let err = e
        .create_participant(-1, "Eva", "Silva", "eva@example.edu")
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidInput(_)));
}

#[tokio::test]
async fn find_slot_by_times_matches_exactly() {
    let e = open_engine(&test_wal("slot_by_times.wal"));
    seed(&e).await;

    let slot = e.find_slot_by_times(t(10, 0), t(12, 0)).await.unwrap();
    assert_eq!(slot.id, 2);
    assert!(e.find_slot_by_times(t(10, 30), t(12, 30)).await.is_none());
    assert!(e.find_slot_by_times(t(10, 0), t(14, 0)).await.is_none());
}

// ── Durability ───────────────────────────────────────────

#[tokio::test]
async fn state_survives_restart() {
    let path = test_wal("restart.wal");
    let today = d(MONDAY);

    let reservation_id;
    {
        let e = open_engine(&path);
        seed(&e).await;
        let booked = e
            .book_batch(&lab(), d("2025-03-14"), &[1], &[111, 222], today)
            .await
            .unwrap();
        reservation_id = booked[0].reservation_id;
        e.create_sanction(333, today, d("2025-05-09"), None)
            .await
            .unwrap();
    }

    let e = open_engine(&path);
    let view = e.get_reservation(reservation_id, today, t(9, 0)).await.unwrap();
    assert_eq!(view.room, lab());
    assert_eq!(view.participants.len(), 2);
    assert!(e.is_sanctioned(333, today).await);

    // The slot is still held after replay
    let err = e
        .book_batch(&lab(), d("2025-03-14"), &[1], &[333], today)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::ConflictOnCommit { slot_id: 1 }));

    // Fresh ids continue past the replayed ones
    let booked = e
        .book_batch(&lab(), d("2025-03-14"), &[3], &[333], today)
        .await
        .unwrap();
    assert!(booked[0].reservation_id > reservation_id);
}

#[tokio::test]
async fn compaction_preserves_state() {
    let path = test_wal("compact_state.wal");
    let today = d(MONDAY);

    {
        let e = open_engine(&path);
        seed(&e).await;
        let booked = e
            .book_batch(&lab(), d("2025-03-14"), &[1, 2], &[111], today)
            .await
            .unwrap();
        e.cancel_reservation(booked[1].reservation_id, today)
            .await
            .unwrap();
        e.create_sanction(222, today, d("2025-05-09"), None)
            .await
            .unwrap();
        e.compact_wal().await.unwrap();
    }

    let e = open_engine(&path);
    let active = e
        .list_reservations(Some(111), None, today, t(9, 0))
        .await
        .into_iter()
        .filter(|v| v.stored == StoredStatus::Active)
        .count();
    assert_eq!(active, 1);
    assert!(e.is_sanctioned(222, today).await);

    // The cancelled slot stays free, the booked one stays held
    let free = e.available_slots(&lab(), d("2025-03-14")).await.unwrap();
    let free_ids: Vec<_> = free.iter().map(|s| s.id).collect();
    assert!(!free_ids.contains(&1));
    assert!(free_ids.contains(&2));
}

// ── Notifications ────────────────────────────────────────

#[tokio::test]
async fn booking_notifies_room_subscribers() {
    let e = open_engine(&test_wal("notify_book.wal"));
    seed(&e).await;
    let mut rx = e.notify.subscribe(&lab());

    e.book_batch(&lab(), d("2025-03-14"), &[1], &[111], d(MONDAY))
        .await
        .unwrap();

    let event = rx.recv().await.unwrap();
    assert!(matches!(
        event,
        LedgerEvent::ReservationBooked { slot_id: 1, .. }
    ));
}
