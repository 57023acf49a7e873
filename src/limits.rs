use crate::model::Ms;

pub const MAX_STAFF: usize = 10_000;
pub const MAX_SERVICES: usize = 10_000;
pub const MAX_INTERVALS_PER_STAFF: usize = 100_000;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_REASON_LEN: usize = 1_024;
pub const MAX_SESSION_ID_LEN: usize = 256;
pub const MAX_CONTACT_LEN: usize = 320;
pub const MAX_SERVICES_PER_QUERY: usize = 16;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2200-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 7_258_118_400_000;
/// No single appointment, reservation or time-off runs longer than a week.
pub const MAX_SPAN_DURATION_MS: Ms = 7 * 24 * 3_600_000;
/// 24 hours; a longer service cannot fit in any working day.
pub const MAX_DURATION_MIN: u32 = 24 * 60;
