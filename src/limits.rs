use crate::model::{DAY_MS, Ms};

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2200-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 7_258_118_400_000;

/// A single booking may not exceed one year.
pub const MAX_SPAN_DURATION_MS: Ms = 366 * DAY_MS;
/// Calendar queries are capped at roughly one quarter.
pub const MAX_QUERY_WINDOW_MS: Ms = 93 * DAY_MS;

pub const MAX_RESOURCES: usize = 10_000;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_NOTES_LEN: usize = 2_048;
pub const MAX_PAGE_SIZE: usize = 1_000;
