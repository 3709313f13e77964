//! Hard input caps enforced by the mutation layer, independent of the
//! business rules in `engine::validate`.

/// Max time slots accepted in one batch booking request.
pub const MAX_BATCH_SLOTS: usize = 16;

/// Max participants accepted on one booking request.
pub const MAX_PARTICIPANTS_PER_BOOKING: usize = 64;

/// Max length for room names, building names, participant names and programs.
pub const MAX_NAME_LEN: usize = 100;

/// Max length for participant emails.
pub const MAX_EMAIL_LEN: usize = 254;
