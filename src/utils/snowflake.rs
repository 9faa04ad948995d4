//! Discord snowflake helpers.
//!
//! The upper 42 bits of a snowflake are milliseconds since the Discord epoch,
//! which makes ids usable both as timestamps and as sortable cursors.

pub const DISCORD_EPOCH_MS: i64 = 1_420_070_400_000;
const TIMESTAMP_SHIFT: u32 = 22;

pub fn timestamp_from_id(id: u64) -> i64 {
    (id >> TIMESTAMP_SHIFT) as i64 + DISCORD_EPOCH_MS
}

/// Smallest snowflake whose timestamp is `timestamp_ms`. Timestamps before the
/// Discord epoch clamp to zero.
pub fn id_from_timestamp(timestamp_ms: i64) -> u64 {
    let offset = (timestamp_ms - DISCORD_EPOCH_MS).max(0) as u64;
    offset << TIMESTAMP_SHIFT
}

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
