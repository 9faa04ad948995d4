use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// One `(message, emote)` usage. Unique by `(guild_id, user_id, sent_at, emote_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageEvent {
    pub guild_id: u64,
    pub user_id: u64,
    /// Decimal id for custom emotes, literal text for unicode emoji.
    pub emote_id: String,
    /// Milliseconds since the Unix epoch.
    pub sent_at: i64,
    pub usages: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmoteMetadata {
    pub id: u64,
    pub name: String,
    pub animated: bool,
    pub guild_id: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CrawlPhase {
    CatchingUp,
    Backfilling,
    Done,
}

impl CrawlPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            CrawlPhase::CatchingUp => "catching_up",
            CrawlPhase::Backfilling => "backfilling",
            CrawlPhase::Done => "done",
        }
    }
}

impl fmt::Display for CrawlPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CrawlPhase {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "catching_up" => Ok(CrawlPhase::CatchingUp),
            "backfilling" => Ok(CrawlPhase::Backfilling),
            "done" => Ok(CrawlPhase::Done),
            other => Err(format!("unknown crawl phase: {other}")),
        }
    }
}

/// Pagination cursors for one channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelCrawlState {
    pub channel_id: u64,
    pub guild_id: u64,
    /// Newest message id whose content has been recorded.
    pub latest_parsed_id: Option<u64>,
    /// Oldest message id whose content has been recorded.
    pub earliest_parsed_id: Option<u64>,
    /// Exclusive upper cursor of the current catch-up pass.
    pub latest_unparsed_id: Option<u64>,
    /// Newest id seen by the current catch-up pass.
    pub catch_up_newest_id: Option<u64>,
    pub phase: CrawlPhase,
}

impl ChannelCrawlState {
    pub fn new(channel_id: u64, guild_id: u64, now_id: u64) -> Self {
        Self {
            channel_id,
            guild_id,
            latest_parsed_id: None,
            earliest_parsed_id: None,
            latest_unparsed_id: Some(now_id),
            catch_up_newest_id: None,
            phase: CrawlPhase::CatchingUp,
        }
    }
}

/// Storage-level predicate for usage reads. `None` means unrestricted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UsageFilter {
    pub guild_ids: Option<Vec<u64>>,
    pub user_ids: Option<Vec<u64>>,
    pub emote_ids: Option<Vec<String>>,
    /// Exclusive lower bound on `sent_at`.
    pub since: Option<i64>,
}

pub(crate) fn to_db_id(id: u64) -> i64 {
    id as i64
}

pub(crate) fn from_db_id(id: i64) -> u64 {
    id as u64
}

pub(crate) fn to_db_ids(ids: &[u64]) -> Vec<i64> {
    ids.iter().copied().map(to_db_id).collect()
}
