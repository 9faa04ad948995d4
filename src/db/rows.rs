//! Diesel row types shared by both backends. Snowflakes are stored as signed
//! 64-bit integers.

use diesel::prelude::*;

use super::DatabaseError;
use super::models::{
    ChannelCrawlState, CrawlPhase, EmoteMetadata, UsageEvent, from_db_id, to_db_id,
};
use super::schema::{channels, custom_emote_metadata, emote_usages};

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = emote_usages)]
pub(crate) struct DbUsage {
    pub guild_id: i64,
    pub user_id: i64,
    pub emote_id: String,
    pub sent_at: i64,
    pub usages: i32,
}

impl From<DbUsage> for UsageEvent {
    fn from(value: DbUsage) -> Self {
        Self {
            guild_id: from_db_id(value.guild_id),
            user_id: from_db_id(value.user_id),
            emote_id: value.emote_id,
            sent_at: value.sent_at,
            usages: u32::try_from(value.usages).unwrap_or(0),
        }
    }
}

#[derive(Insertable)]
#[diesel(table_name = emote_usages)]
pub(crate) struct NewUsage<'a> {
    pub guild_id: i64,
    pub user_id: i64,
    pub emote_id: &'a str,
    pub sent_at: i64,
    pub usages: i32,
}

impl<'a> From<&'a UsageEvent> for NewUsage<'a> {
    fn from(value: &'a UsageEvent) -> Self {
        Self {
            guild_id: to_db_id(value.guild_id),
            user_id: to_db_id(value.user_id),
            emote_id: &value.emote_id,
            sent_at: value.sent_at,
            usages: i32::try_from(value.usages).unwrap_or(i32::MAX),
        }
    }
}

#[derive(Debug, Clone, Queryable, Selectable, Insertable)]
#[diesel(table_name = custom_emote_metadata)]
pub(crate) struct DbEmote {
    pub id: i64,
    pub name: String,
    pub animated: bool,
    pub guild_id: Option<i64>,
}

impl From<DbEmote> for EmoteMetadata {
    fn from(value: DbEmote) -> Self {
        Self {
            id: from_db_id(value.id),
            name: value.name,
            animated: value.animated,
            guild_id: value.guild_id.map(from_db_id),
        }
    }
}

impl From<&EmoteMetadata> for DbEmote {
    fn from(value: &EmoteMetadata) -> Self {
        Self {
            id: to_db_id(value.id),
            name: value.name.clone(),
            animated: value.animated,
            guild_id: value.guild_id.map(to_db_id),
        }
    }
}

#[derive(Debug, Clone, Queryable, Selectable, Insertable)]
#[diesel(table_name = channels)]
pub(crate) struct DbCrawlState {
    pub channel_id: i64,
    pub guild_id: i64,
    pub latest_parsed_id: Option<i64>,
    pub earliest_parsed_id: Option<i64>,
    pub latest_unparsed_id: Option<i64>,
    pub catch_up_newest_id: Option<i64>,
    pub phase: String,
}

/// Update half of the crawl state upsert. Cursors cleared in memory must be
/// cleared on disk, so `None` is written as NULL.
#[derive(AsChangeset)]
#[diesel(table_name = channels, treat_none_as_null = true)]
pub(crate) struct CrawlStateChanges {
    pub guild_id: i64,
    pub latest_parsed_id: Option<i64>,
    pub earliest_parsed_id: Option<i64>,
    pub latest_unparsed_id: Option<i64>,
    pub catch_up_newest_id: Option<i64>,
    pub phase: String,
}

impl From<&ChannelCrawlState> for DbCrawlState {
    fn from(value: &ChannelCrawlState) -> Self {
        Self {
            channel_id: to_db_id(value.channel_id),
            guild_id: to_db_id(value.guild_id),
            latest_parsed_id: value.latest_parsed_id.map(to_db_id),
            earliest_parsed_id: value.earliest_parsed_id.map(to_db_id),
            latest_unparsed_id: value.latest_unparsed_id.map(to_db_id),
            catch_up_newest_id: value.catch_up_newest_id.map(to_db_id),
            phase: value.phase.as_str().to_string(),
        }
    }
}

impl DbCrawlState {
    pub fn changes(&self) -> CrawlStateChanges {
        CrawlStateChanges {
            guild_id: self.guild_id,
            latest_parsed_id: self.latest_parsed_id,
            earliest_parsed_id: self.earliest_parsed_id,
            latest_unparsed_id: self.latest_unparsed_id,
            catch_up_newest_id: self.catch_up_newest_id,
            phase: self.phase.clone(),
        }
    }

    pub fn into_state(self) -> Result<ChannelCrawlState, DatabaseError> {
        let phase = self
            .phase
            .parse::<CrawlPhase>()
            .map_err(DatabaseError::Query)?;
        Ok(ChannelCrawlState {
            channel_id: from_db_id(self.channel_id),
            guild_id: from_db_id(self.guild_id),
            latest_parsed_id: self.latest_parsed_id.map(from_db_id),
            earliest_parsed_id: self.earliest_parsed_id.map(from_db_id),
            latest_unparsed_id: self.latest_unparsed_id.map(from_db_id),
            catch_up_newest_id: self.catch_up_newest_id.map(from_db_id),
            phase,
        })
    }
}
