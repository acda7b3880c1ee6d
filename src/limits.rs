use crate::model::Ms;

/// Max rooms the registry will hold.
pub const MAX_ROOMS: usize = 10_000;

/// Max bookings (any status) kept per room.
pub const MAX_BOOKINGS_PER_ROOM: usize = 100_000;

/// Max length of a room name in bytes.
pub const MAX_NAME_LEN: usize = 256;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;

/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

/// A single stay may not exceed one year.
pub const MAX_SPAN_DURATION_MS: Ms = 366 * 24 * 3_600_000;

/// Longest pending expiry the server accepts (one year).
pub const MAX_PENDING_TTL_SECS: u64 = 366 * 24 * 3600;

/// Max bytes in one gateway line (request or event).
pub const MAX_LINE_LEN: usize = 64 * 1024;

/// Max scopes a single gateway connection may join.
pub const MAX_JOINED_SCOPES: usize = 1024;
