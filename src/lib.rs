//! Room-reservation engine for an academic institution: admission
//! validation, atomic batch booking, a sanction ledger, and the attendance
//! lifecycle sweep, all backed by a write-ahead log.

pub mod calendar;
pub mod config;
pub mod engine;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod wal;
