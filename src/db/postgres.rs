use std::collections::HashMap;

use async_trait::async_trait;
use diesel::pg::PgConnection;
use diesel::prelude::*;
use diesel::upsert::excluded;

use crate::db::manager::Pool;
use crate::db::schema::{channels, custom_emote_metadata, emote_usages, guilds};

use super::{
    DatabaseError,
    models::{
        ChannelCrawlState, EmoteMetadata, UsageEvent, UsageFilter, from_db_id, to_db_id,
        to_db_ids,
    },
    rows::{DbCrawlState, DbEmote, DbUsage, NewUsage},
};

async fn with_connection<T, F>(pool: Pool, operation: F) -> Result<T, DatabaseError>
where
    T: Send + 'static,
    F: FnOnce(&mut PgConnection) -> Result<T, DatabaseError> + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let mut conn = pool
            .get()
            .map_err(|e| DatabaseError::Connection(e.to_string()))?;
        operation(&mut conn)
    })
    .await
    .map_err(|e| DatabaseError::Query(format!("database task failed: {e}")))?
}

pub struct PostgresUsageStore {
    pool: Pool,
}

impl PostgresUsageStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl super::UsageStore for PostgresUsageStore {
    async fn upsert_usages(&self, events: &[UsageEvent]) -> Result<(), DatabaseError> {
        if events.is_empty() {
            return Ok(());
        }
        let pool = self.pool.clone();
        let events = events.to_vec();
        with_connection(pool, move |conn| {
            conn.transaction::<_, diesel::result::Error, _>(|conn| {
                for event in &events {
                    diesel::insert_into(emote_usages::table)
                        .values(NewUsage::from(event))
                        .on_conflict((
                            emote_usages::guild_id,
                            emote_usages::user_id,
                            emote_usages::sent_at,
                            emote_usages::emote_id,
                        ))
                        .do_update()
                        .set(emote_usages::usages.eq(excluded(emote_usages::usages)))
                        .execute(conn)?;
                }
                Ok(())
            })
            .map_err(|e| DatabaseError::Query(e.to_string()))
        })
        .await
    }

    async fn delete_usages(
        &self,
        guild_id: u64,
        user_id: u64,
        sent_at: i64,
        emote_id: Option<&str>,
    ) -> Result<u64, DatabaseError> {
        let pool = self.pool.clone();
        let emote_id = emote_id.map(ToString::to_string);
        with_connection(pool, move |conn| {
            let message_rows = emote_usages::table
                .filter(emote_usages::guild_id.eq(to_db_id(guild_id)))
                .filter(emote_usages::user_id.eq(to_db_id(user_id)))
                .filter(emote_usages::sent_at.eq(sent_at));
            let deleted = match emote_id {
                Some(emote) => diesel::delete(message_rows.filter(emote_usages::emote_id.eq(emote)))
                    .execute(conn),
                None => diesel::delete(message_rows).execute(conn),
            };
            deleted
                .map(|count| count as u64)
                .map_err(|e| DatabaseError::Query(e.to_string()))
        })
        .await
    }

    async fn fetch_filtered(&self, filter: &UsageFilter) -> Result<Vec<UsageEvent>, DatabaseError> {
        let pool = self.pool.clone();
        let filter = filter.clone();
        with_connection(pool, move |conn| {
            let mut query = emote_usages::table.into_boxed();
            if let Some(ids) = &filter.guild_ids {
                query = query.filter(emote_usages::guild_id.eq_any(to_db_ids(ids)));
            }
            if let Some(ids) = &filter.user_ids {
                query = query.filter(emote_usages::user_id.eq_any(to_db_ids(ids)));
            }
            if let Some(ids) = filter.emote_ids {
                query = query.filter(emote_usages::emote_id.eq_any(ids));
            }
            if let Some(since) = filter.since {
                query = query.filter(emote_usages::sent_at.gt(since));
            }
            query
                .select(DbUsage::as_select())
                .load::<DbUsage>(conn)
                .map(|rows| rows.into_iter().map(Into::into).collect())
                .map_err(|e| DatabaseError::Query(e.to_string()))
        })
        .await
    }
}

pub struct PostgresEmoteStore {
    pool: Pool,
}

impl PostgresEmoteStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl super::EmoteStore for PostgresEmoteStore {
    async fn record_emote_metadata(&self, emotes: &[EmoteMetadata]) -> Result<(), DatabaseError> {
        if emotes.is_empty() {
            return Ok(());
        }
        let pool = self.pool.clone();
        let rows: Vec<DbEmote> = emotes.iter().map(DbEmote::from).collect();
        with_connection(pool, move |conn| {
            conn.transaction::<_, diesel::result::Error, _>(|conn| {
                for row in &rows {
                    diesel::insert_into(custom_emote_metadata::table)
                        .values(row)
                        .on_conflict(custom_emote_metadata::id)
                        .do_update()
                        .set((
                            custom_emote_metadata::name.eq(excluded(custom_emote_metadata::name)),
                            custom_emote_metadata::animated
                                .eq(excluded(custom_emote_metadata::animated)),
                            custom_emote_metadata::guild_id
                                .eq(excluded(custom_emote_metadata::guild_id)),
                        ))
                        .execute(conn)?;
                }
                Ok(())
            })
            .map_err(|e| DatabaseError::Query(e.to_string()))
        })
        .await
    }

    async fn unset_emote_guild(&self, emote_id: u64) -> Result<(), DatabaseError> {
        let pool = self.pool.clone();
        with_connection(pool, move |conn| {
            diesel::update(
                custom_emote_metadata::table.filter(custom_emote_metadata::id.eq(to_db_id(emote_id))),
            )
            .set(custom_emote_metadata::guild_id.eq(None::<i64>))
            .execute(conn)
            .map(|_| ())
            .map_err(|e| DatabaseError::Query(e.to_string()))
        })
        .await
    }

    async fn update_emotes_guild(
        &self,
        guild_id: u64,
        emote_ids: &[u64],
    ) -> Result<(), DatabaseError> {
        if emote_ids.is_empty() {
            return Ok(());
        }
        let pool = self.pool.clone();
        let ids = to_db_ids(emote_ids);
        with_connection(pool, move |conn| {
            diesel::update(custom_emote_metadata::table.filter(custom_emote_metadata::id.eq_any(ids)))
                .set(custom_emote_metadata::guild_id.eq(Some(to_db_id(guild_id))))
                .execute(conn)
                .map(|_| ())
                .map_err(|e| DatabaseError::Query(e.to_string()))
        })
        .await
    }

    async fn fetch_emote_metadata(
        &self,
        emote_ids: &[u64],
    ) -> Result<HashMap<u64, EmoteMetadata>, DatabaseError> {
        if emote_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let pool = self.pool.clone();
        let ids = to_db_ids(emote_ids);
        with_connection(pool, move |conn| {
            custom_emote_metadata::table
                .filter(custom_emote_metadata::id.eq_any(ids))
                .select(DbEmote::as_select())
                .load::<DbEmote>(conn)
                .map(|rows| {
                    rows.into_iter()
                        .map(|row| {
                            let emote = EmoteMetadata::from(row);
                            (emote.id, emote)
                        })
                        .collect()
                })
                .map_err(|e| DatabaseError::Query(e.to_string()))
        })
        .await
    }

    async fn fetch_guild_emote_ids(&self, guild_id: u64) -> Result<Vec<u64>, DatabaseError> {
        let pool = self.pool.clone();
        with_connection(pool, move |conn| {
            custom_emote_metadata::table
                .filter(custom_emote_metadata::guild_id.eq(to_db_id(guild_id)))
                .select(custom_emote_metadata::id)
                .load::<i64>(conn)
                .map(|ids| ids.into_iter().map(from_db_id).collect())
                .map_err(|e| DatabaseError::Query(e.to_string()))
        })
        .await
    }
}

pub struct PostgresCrawlStateStore {
    pool: Pool,
}

impl PostgresCrawlStateStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl super::CrawlStateStore for PostgresCrawlStateStore {
    async fn upsert_crawl_state(&self, state: &ChannelCrawlState) -> Result<(), DatabaseError> {
        let pool = self.pool.clone();
        let row = DbCrawlState::from(state);
        with_connection(pool, move |conn| {
            diesel::insert_into(channels::table)
                .values(&row)
                .on_conflict(channels::channel_id)
                .do_update()
                .set(row.changes())
                .execute(conn)
                .map(|_| ())
                .map_err(|e| DatabaseError::Query(e.to_string()))
        })
        .await
    }

    async fn fetch_crawl_states(
        &self,
        channel_ids: &[u64],
    ) -> Result<Vec<ChannelCrawlState>, DatabaseError> {
        let pool = self.pool.clone();
        let ids = to_db_ids(channel_ids);
        with_connection(pool, move |conn| {
            let mut query = channels::table.order(channels::channel_id.asc()).into_boxed();
            if !ids.is_empty() {
                query = query.filter(channels::channel_id.eq_any(ids));
            }
            let rows = query
                .select(DbCrawlState::as_select())
                .load::<DbCrawlState>(conn)
                .map_err(|e| DatabaseError::Query(e.to_string()))?;
            rows.into_iter().map(DbCrawlState::into_state).collect()
        })
        .await
    }
}

pub struct PostgresGuildStore {
    pool: Pool,
}

impl PostgresGuildStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl super::GuildStore for PostgresGuildStore {
    async fn fetch_guilds(&self) -> Result<Vec<u64>, DatabaseError> {
        let pool = self.pool.clone();
        with_connection(pool, move |conn| {
            guilds::table
                .select(guilds::id)
                .order(guilds::id.asc())
                .load::<i64>(conn)
                .map(|ids| ids.into_iter().map(from_db_id).collect())
                .map_err(|e| DatabaseError::Query(e.to_string()))
        })
        .await
    }

    async fn record_guilds(&self, guild_ids: &[u64]) -> Result<(), DatabaseError> {
        if guild_ids.is_empty() {
            return Ok(());
        }
        let pool = self.pool.clone();
        let ids = to_db_ids(guild_ids);
        with_connection(pool, move |conn| {
            conn.transaction::<_, diesel::result::Error, _>(|conn| {
                for id in &ids {
                    diesel::insert_into(guilds::table)
                        .values(guilds::id.eq(*id))
                        .on_conflict_do_nothing()
                        .execute(conn)?;
                }
                Ok(())
            })
            .map_err(|e| DatabaseError::Query(e.to_string()))
        })
        .await
    }

    async fn remove_guilds(&self, guild_ids: &[u64]) -> Result<(), DatabaseError> {
        if guild_ids.is_empty() {
            return Ok(());
        }
        let pool = self.pool.clone();
        let ids = to_db_ids(guild_ids);
        with_connection(pool, move |conn| {
            diesel::delete(guilds::table.filter(guilds::id.eq_any(ids)))
                .execute(conn)
                .map(|_| ())
                .map_err(|e| DatabaseError::Query(e.to_string()))
        })
        .await
    }
}
