//! Live gateway events applied to the stores.

use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::db::{DatabaseError, EmoteMetadata, EmoteStore, GuildStore, UsageEvent, UsageStore};
use crate::discord::directory::GuildDirectory;
use crate::parsers::{CustomEmote, ExtractedEmotes, extract_emotes, is_report_command};
use crate::utils::snowflake::timestamp_from_id;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveMessage {
    pub id: u64,
    pub channel_id: u64,
    pub guild_id: Option<u64>,
    pub author_id: u64,
    pub author_bot: bool,
    pub content: String,
}

/// A message edit. Fields the gateway omitted are `None`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageEdit {
    pub id: u64,
    pub guild_id: Option<u64>,
    pub author_id: Option<u64>,
    pub author_bot: bool,
    pub content: Option<String>,
}

pub(crate) fn usage_events(
    guild_id: u64,
    user_id: u64,
    message_id: u64,
    extracted: &ExtractedEmotes,
) -> Vec<UsageEvent> {
    let sent_at = timestamp_from_id(message_id);
    extracted
        .counts
        .iter()
        .map(|(emote_id, count)| UsageEvent {
            guild_id,
            user_id,
            emote_id: emote_id.clone(),
            sent_at,
            usages: *count,
        })
        .collect()
}

pub(crate) fn emote_metadata(
    emotes: &[CustomEmote],
    directory: &dyn GuildDirectory,
) -> Vec<EmoteMetadata> {
    emotes
        .iter()
        .map(|emote| EmoteMetadata {
            id: emote.id,
            name: emote.name.clone(),
            animated: emote.animated,
            guild_id: directory.emote_owner(emote.id),
        })
        .collect()
}

pub struct LiveIngestor {
    usage_store: Arc<dyn UsageStore>,
    emote_store: Arc<dyn EmoteStore>,
    guild_store: Arc<dyn GuildStore>,
    directory: Arc<dyn GuildDirectory>,
    command_prefix: String,
    consideration_period_ms: i64,
    /// message id -> (guild id, author id), for deletes that only carry ids.
    recent: Mutex<LruCache<u64, (u64, u64)>>,
}

impl LiveIngestor {
    pub fn new(
        usage_store: Arc<dyn UsageStore>,
        emote_store: Arc<dyn EmoteStore>,
        guild_store: Arc<dyn GuildStore>,
        directory: Arc<dyn GuildDirectory>,
        command_prefix: &str,
        consideration_period_ms: u64,
        recent_capacity: usize,
    ) -> Self {
        let capacity = NonZeroUsize::new(recent_capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            usage_store,
            emote_store,
            guild_store,
            directory,
            command_prefix: command_prefix.to_string(),
            consideration_period_ms: i64::try_from(consideration_period_ms).unwrap_or(i64::MAX),
            recent: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Whether a message is still young enough for edits and deletes to count.
    pub fn within_window(&self, message_id: u64, now_ms: i64) -> bool {
        now_ms.saturating_sub(timestamp_from_id(message_id)) <= self.consideration_period_ms
    }

    /// Records a new message. Returns the number of usages written.
    pub async fn on_message(&self, message: &LiveMessage) -> Result<u64, DatabaseError> {
        let Some(guild_id) = message.guild_id else {
            return Ok(0);
        };
        if message.author_bot {
            return Ok(0);
        }
        self.recent
            .lock()
            .put(message.id, (guild_id, message.author_id));
        self.record(guild_id, message.author_id, message.id, &message.content)
            .await
    }

    /// Replaces the usages of an edited message. Returns `false` when the edit
    /// was ignored.
    pub async fn on_message_update(
        &self,
        edit: &MessageEdit,
        now_ms: i64,
    ) -> Result<bool, DatabaseError> {
        if edit.author_bot || !self.within_window(edit.id, now_ms) {
            return Ok(false);
        }
        let Some(content) = &edit.content else {
            return Ok(false);
        };
        let cached = self.recent.lock().get(&edit.id).copied();
        let guild_id = edit.guild_id.or(cached.map(|(guild_id, _)| guild_id));
        let author_id = edit.author_id.or(cached.map(|(_, author_id)| author_id));
        let (Some(guild_id), Some(author_id)) = (guild_id, author_id) else {
            return Ok(false);
        };

        let sent_at = timestamp_from_id(edit.id);
        let removed = self
            .usage_store
            .delete_usages(guild_id, author_id, sent_at, None)
            .await?;
        let written = self.record(guild_id, author_id, edit.id, content).await?;
        debug!(
            "re-extracted edited message message_id={} removed={} written={}",
            edit.id, removed, written
        );
        Ok(true)
    }

    /// Removes the usages of deleted messages. Returns how many messages were
    /// resolved and cleared.
    pub async fn on_messages_deleted(
        &self,
        message_ids: &[u64],
        now_ms: i64,
    ) -> Result<usize, DatabaseError> {
        let mut cleared = 0;
        for &message_id in message_ids {
            let cached = self.recent.lock().pop(&message_id);
            let Some((guild_id, author_id)) = cached else {
                continue;
            };
            if !self.within_window(message_id, now_ms) {
                continue;
            }
            self.usage_store
                .delete_usages(guild_id, author_id, timestamp_from_id(message_id), None)
                .await?;
            cleared += 1;
        }
        Ok(cleared)
    }

    /// Reconciles custom emote ownership after a guild's emoji list changed.
    pub async fn on_emotes_updated(
        &self,
        guild_id: u64,
        current: &[u64],
    ) -> Result<(), DatabaseError> {
        let current_set: HashSet<u64> = current.iter().copied().collect();
        let stored = self.emote_store.fetch_guild_emote_ids(guild_id).await?;
        for emote_id in stored.into_iter().filter(|id| !current_set.contains(id)) {
            debug!("emote left guild emote_id={} guild_id={}", emote_id, guild_id);
            self.emote_store.unset_emote_guild(emote_id).await?;
        }
        self.emote_store.update_emotes_guild(guild_id, current).await
    }

    pub async fn on_guild_joined(
        &self,
        guild_id: u64,
        emote_ids: &[u64],
    ) -> Result<(), DatabaseError> {
        self.guild_store.record_guilds(&[guild_id]).await?;
        self.on_emotes_updated(guild_id, emote_ids).await
    }

    pub async fn on_guild_left(&self, guild_id: u64) -> Result<(), DatabaseError> {
        info!("left guild guild_id={}", guild_id);
        self.guild_store.remove_guilds(&[guild_id]).await
    }

    /// Forgets guilds the bot was removed from while offline.
    pub async fn on_ready(&self, guild_ids: &[u64]) -> Result<Vec<u64>, DatabaseError> {
        let current: HashSet<u64> = guild_ids.iter().copied().collect();
        let stale: Vec<u64> = self
            .guild_store
            .fetch_guilds()
            .await?
            .into_iter()
            .filter(|id| !current.contains(id))
            .collect();
        if !stale.is_empty() {
            info!("removing {} guilds left while offline", stale.len());
            self.guild_store.remove_guilds(&stale).await?;
        }
        self.guild_store.record_guilds(guild_ids).await?;
        Ok(stale)
    }

    async fn record(
        &self,
        guild_id: u64,
        author_id: u64,
        message_id: u64,
        content: &str,
    ) -> Result<u64, DatabaseError> {
        if is_report_command(content, &self.command_prefix) {
            return Ok(0);
        }
        let extracted = extract_emotes(content);
        if extracted.is_empty() {
            return Ok(0);
        }
        self.usage_store
            .upsert_usages(&usage_events(guild_id, author_id, message_id, &extracted))
            .await?;
        self.emote_store
            .record_emote_metadata(&emote_metadata(&extracted.custom, self.directory.as_ref()))
            .await?;
        Ok(extracted.total())
    }
}
