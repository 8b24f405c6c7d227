use crate::model::{Ms, DAY_MS};

pub const MAX_SLOTS_PER_INSTRUCTOR: usize = 10_000;
pub const MAX_BOOKINGS_PER_INSTRUCTOR: usize = 100_000;

/// Longest single availability window or booking.
pub const MAX_SPAN_DURATION_MS: Ms = 7 * DAY_MS;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2200-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 7_258_118_400_000;

/// Participant ids come from the user-management collaborator.
pub const MAX_ID_LEN: usize = 128;

pub const MAX_GRID_DAYS: u32 = 7;
pub const MAX_GRID_HOUR: u32 = 24;

/// Longest accepted request line on the wire.
pub const MAX_LINE_LEN: usize = 64 * 1024;
