use std::collections::HashMap;

use async_trait::async_trait;

use super::DatabaseError;
use super::models::{ChannelCrawlState, EmoteMetadata, UsageEvent, UsageFilter};

#[async_trait]
pub trait UsageStore: Send + Sync {
    /// Insert-or-overwrite on the natural key.
    async fn upsert_usages(&self, events: &[UsageEvent]) -> Result<(), DatabaseError>;
    /// Deletes rows for one message, optionally narrowed to a single emote.
    async fn delete_usages(
        &self,
        guild_id: u64,
        user_id: u64,
        sent_at: i64,
        emote_id: Option<&str>,
    ) -> Result<u64, DatabaseError>;
    async fn fetch_filtered(&self, filter: &UsageFilter) -> Result<Vec<UsageEvent>, DatabaseError>;
}

#[async_trait]
pub trait EmoteStore: Send + Sync {
    async fn record_emote_metadata(&self, emotes: &[EmoteMetadata]) -> Result<(), DatabaseError>;
    async fn unset_emote_guild(&self, emote_id: u64) -> Result<(), DatabaseError>;
    /// Points already known emotes at `guild_id`. Unknown ids are ignored.
    async fn update_emotes_guild(
        &self,
        guild_id: u64,
        emote_ids: &[u64],
    ) -> Result<(), DatabaseError>;
    async fn fetch_emote_metadata(
        &self,
        emote_ids: &[u64],
    ) -> Result<HashMap<u64, EmoteMetadata>, DatabaseError>;
    async fn fetch_guild_emote_ids(&self, guild_id: u64) -> Result<Vec<u64>, DatabaseError>;
}

#[async_trait]
pub trait CrawlStateStore: Send + Sync {
    async fn upsert_crawl_state(&self, state: &ChannelCrawlState) -> Result<(), DatabaseError>;
    /// An empty id list returns every persisted state.
    async fn fetch_crawl_states(
        &self,
        channel_ids: &[u64],
    ) -> Result<Vec<ChannelCrawlState>, DatabaseError>;
}

#[async_trait]
pub trait GuildStore: Send + Sync {
    async fn fetch_guilds(&self) -> Result<Vec<u64>, DatabaseError>;
    async fn record_guilds(&self, guild_ids: &[u64]) -> Result<(), DatabaseError>;
    async fn remove_guilds(&self, guild_ids: &[u64]) -> Result<(), DatabaseError>;
}
