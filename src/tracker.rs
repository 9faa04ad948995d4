use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::TrackerConfig;
use crate::db::DatabaseManager;
use crate::discord::directory::GuildDirectory;
use crate::discord::history::HistoryFetcher;
use crate::utils::snowflake::{id_from_timestamp, now_ms};

pub mod crawler;
pub mod ingest;

use self::crawler::{CrawlScheduler, StepResult};
use self::ingest::{LiveIngestor, LiveMessage, MessageEdit};

/// Gateway activity forwarded by the Discord handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackerEvent {
    Ready {
        guild_ids: Vec<u64>,
    },
    MessageCreated(LiveMessage),
    MessageUpdated(MessageEdit),
    MessagesDeleted {
        message_ids: Vec<u64>,
    },
    GuildAvailable {
        guild_id: u64,
        emote_ids: Vec<u64>,
        /// Text channels the bot can currently see.
        channel_ids: Vec<u64>,
    },
    GuildRemoved {
        guild_id: u64,
    },
    EmotesUpdated {
        guild_id: u64,
        emote_ids: Vec<u64>,
    },
    ChannelAvailable {
        guild_id: u64,
        channel_id: u64,
    },
    ChannelRemoved {
        channel_id: u64,
    },
}

/// Serializes live events and paced crawl steps onto one task.
pub struct TrackerCore {
    ingestor: LiveIngestor,
    crawler: CrawlScheduler,
    crawl_interval: Duration,
}

impl TrackerCore {
    pub fn new(
        db_manager: &DatabaseManager,
        fetcher: Arc<dyn HistoryFetcher>,
        directory: Arc<dyn GuildDirectory>,
        config: &TrackerConfig,
        command_prefix: &str,
    ) -> Self {
        Self::with_parts(
            LiveIngestor::new(
                db_manager.usage_store(),
                db_manager.emote_store(),
                db_manager.guild_store(),
                directory.clone(),
                command_prefix,
                config.consideration_period_ms,
                config.recent_message_capacity,
            ),
            CrawlScheduler::new(
                fetcher,
                db_manager.usage_store(),
                db_manager.emote_store(),
                db_manager.crawl_state_store(),
                directory,
                command_prefix,
                config.crawl_page_size,
            ),
            Duration::from_millis(config.crawl_interval_ms.max(1)),
        )
    }

    pub fn with_parts(
        ingestor: LiveIngestor,
        crawler: CrawlScheduler,
        crawl_interval: Duration,
    ) -> Self {
        Self {
            ingestor,
            crawler,
            crawl_interval,
        }
    }

    pub fn crawler(&self) -> &CrawlScheduler {
        &self.crawler
    }

    pub async fn handle(&self, event: TrackerEvent, now_ms: i64) -> Result<()> {
        match event {
            TrackerEvent::Ready { guild_ids } => {
                self.ingestor.on_ready(&guild_ids).await?;
            }
            TrackerEvent::MessageCreated(message) => {
                self.ingestor.on_message(&message).await?;
            }
            TrackerEvent::MessageUpdated(edit) => {
                self.ingestor.on_message_update(&edit, now_ms).await?;
            }
            TrackerEvent::MessagesDeleted { message_ids } => {
                self.ingestor
                    .on_messages_deleted(&message_ids, now_ms)
                    .await?;
            }
            TrackerEvent::GuildAvailable {
                guild_id,
                emote_ids,
                channel_ids,
            } => {
                // Channels are scheduled even when the guild registry write fails.
                let joined = self.ingestor.on_guild_joined(guild_id, &emote_ids).await;
                let channels: Vec<(u64, u64)> = channel_ids
                    .into_iter()
                    .map(|channel_id| (channel_id, guild_id))
                    .collect();
                let queued = self
                    .crawler
                    .on_channels_visible(&channels, id_from_timestamp(now_ms))
                    .await?;
                info!(
                    "guild available guild_id={} channels={} queued={}",
                    guild_id,
                    channels.len(),
                    queued
                );
                joined?;
            }
            TrackerEvent::GuildRemoved { guild_id } => {
                self.crawler.on_guild_removed(guild_id);
                self.ingestor.on_guild_left(guild_id).await?;
            }
            TrackerEvent::EmotesUpdated {
                guild_id,
                emote_ids,
            } => {
                self.ingestor
                    .on_emotes_updated(guild_id, &emote_ids)
                    .await?;
            }
            TrackerEvent::ChannelAvailable {
                guild_id,
                channel_id,
            } => {
                self.crawler
                    .on_channel_visible(channel_id, guild_id, id_from_timestamp(now_ms))
                    .await?;
            }
            TrackerEvent::ChannelRemoved { channel_id } => {
                self.crawler.on_channel_removed(channel_id);
            }
        }
        Ok(())
    }

    /// Runs until the event channel closes.
    pub async fn run(&self, mut events: mpsc::Receiver<TrackerEvent>) -> Result<()> {
        info!("tracker core started");

        let mut ticker = tokio::time::interval(self.crawl_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else {
                        info!("event channel closed, stopping tracker core");
                        return Ok(());
                    };
                    if let Err(err) = self.handle(event, now_ms()).await {
                        error!("failed to apply gateway event: {err:#}");
                    }
                }
                _ = ticker.tick() => match self.crawler.step().await {
                    Ok(StepResult::Idle | StepResult::Busy) => {}
                    Ok(result) => debug!("crawl step {:?}", result),
                    Err(err) => warn!("crawl step failed, will retry: {err}"),
                },
            }
        }
    }
}

#[cfg(all(test, feature = "sqlite"))]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use tempfile::NamedTempFile;
    use tokio::sync::mpsc;

    use super::{TrackerCore, TrackerEvent};
    use crate::config::TrackerConfig;
    use crate::db::{CrawlPhase, DatabaseError, DatabaseManager, GuildStore, UsageEvent, UsageFilter};
    use crate::discord::directory::fake::FakeDirectory;
    use crate::discord::history::{FetchError, HistoryFetcher, HistoryMessage};
    use crate::tracker::crawler::{CrawlScheduler, StepResult};
    use crate::tracker::ingest::{LiveIngestor, LiveMessage};
    use crate::utils::snowflake::id_from_timestamp;

    const NOW_MS: i64 = 1_700_000_000_000;

    struct EmptyHistory;

    #[async_trait]
    impl HistoryFetcher for EmptyHistory {
        async fn fetch_page(
            &self,
            _channel_id: u64,
            _before: u64,
            _limit: u8,
        ) -> Result<Vec<HistoryMessage>, FetchError> {
            Ok(Vec::new())
        }
    }

    /// Serves a fixed newest-first history for every channel.
    struct FixedHistory(Vec<HistoryMessage>);

    #[async_trait]
    impl HistoryFetcher for FixedHistory {
        async fn fetch_page(
            &self,
            _channel_id: u64,
            before: u64,
            limit: u8,
        ) -> Result<Vec<HistoryMessage>, FetchError> {
            Ok(self
                .0
                .iter()
                .filter(|message| message.id < before)
                .take(usize::from(limit))
                .cloned()
                .collect())
        }
    }

    struct UnavailableGuildStore;

    #[async_trait]
    impl GuildStore for UnavailableGuildStore {
        async fn fetch_guilds(&self) -> Result<Vec<u64>, DatabaseError> {
            Err(DatabaseError::Connection("pool timed out".to_string()))
        }

        async fn record_guilds(&self, _guild_ids: &[u64]) -> Result<(), DatabaseError> {
            Err(DatabaseError::Connection("pool timed out".to_string()))
        }

        async fn remove_guilds(&self, _guild_ids: &[u64]) -> Result<(), DatabaseError> {
            Err(DatabaseError::Connection("pool timed out".to_string()))
        }
    }

    async fn usage(manager: &DatabaseManager) -> Vec<UsageEvent> {
        let mut events = manager
            .usage_store()
            .fetch_filtered(&UsageFilter::default())
            .await
            .expect("usage");
        events.sort_by(|a, b| a.emote_id.cmp(&b.emote_id));
        events
    }

    fn config() -> TrackerConfig {
        TrackerConfig {
            crawl_interval_ms: 1,
            ..TrackerConfig::default()
        }
    }

    #[tokio::test]
    async fn guild_lifecycle_schedules_and_drops_channels() {
        let file = NamedTempFile::new().expect("temp sqlite file");
        let manager = crate::db::manager::tests::sqlite_manager(&file).await;
        let core = TrackerCore::new(
            &manager,
            Arc::new(EmptyHistory),
            Arc::new(FakeDirectory::default()),
            &config(),
            "!",
        );

        core.handle(
            TrackerEvent::GuildAvailable {
                guild_id: 1,
                emote_ids: vec![],
                channel_ids: vec![10, 11],
            },
            NOW_MS,
        )
        .await
        .expect("guild available");
        assert_eq!(core.crawler().queue_len(), 2);
        assert_eq!(
            manager.guild_store().fetch_guilds().await.expect("guilds"),
            vec![1]
        );

        core.handle(TrackerEvent::ChannelRemoved { channel_id: 11 }, NOW_MS)
            .await
            .expect("channel removed");
        assert_eq!(core.crawler().queue_len(), 1);

        core.handle(TrackerEvent::GuildRemoved { guild_id: 1 }, NOW_MS)
            .await
            .expect("guild removed");
        assert_eq!(core.crawler().queue_len(), 0);
        assert!(manager.guild_store().fetch_guilds().await.expect("guilds").is_empty());
    }

    #[tokio::test]
    async fn run_drains_events_and_crawls_until_channel_closes() {
        let file = NamedTempFile::new().expect("temp sqlite file");
        let manager = crate::db::manager::tests::sqlite_manager(&file).await;
        let core = TrackerCore::new(
            &manager,
            Arc::new(EmptyHistory),
            Arc::new(FakeDirectory::default()),
            &config(),
            "!",
        );
        let (sender, receiver) = mpsc::channel(8);

        sender
            .send(TrackerEvent::ChannelAvailable {
                guild_id: 1,
                channel_id: 10,
            })
            .await
            .expect("send");
        sender
            .send(TrackerEvent::MessageCreated(LiveMessage {
                id: id_from_timestamp(NOW_MS),
                channel_id: 10,
                guild_id: Some(1),
                author_id: 7,
                author_bot: false,
                content: "🤔".to_string(),
            }))
            .await
            .expect("send");

        let runner = async {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            drop(sender);
        };
        let (result, ()) = tokio::join!(core.run(receiver), runner);
        result.expect("run");

        let usage = manager
            .usage_store()
            .fetch_filtered(&UsageFilter::default())
            .await
            .expect("usage");
        assert_eq!(usage.len(), 1);
        assert_eq!(
            core.crawler().state(10).map(|state| state.phase),
            Some(CrawlPhase::Done)
        );
    }

    #[tokio::test]
    async fn crawl_over_live_message_keeps_counts() {
        let file = NamedTempFile::new().expect("temp sqlite file");
        let manager = crate::db::manager::tests::sqlite_manager(&file).await;
        let message_id = id_from_timestamp(NOW_MS);
        let history = FixedHistory(vec![HistoryMessage {
            id: message_id,
            author_id: 7,
            author_bot: false,
            content: "🤔 🤔 <:pog:55>".to_string(),
        }]);
        let core = TrackerCore::new(
            &manager,
            Arc::new(history),
            Arc::new(FakeDirectory::default().with_guild(1, "Home", &[55])),
            &config(),
            "!",
        );

        core.handle(
            TrackerEvent::MessageCreated(LiveMessage {
                id: message_id,
                channel_id: 10,
                guild_id: Some(1),
                author_id: 7,
                author_bot: false,
                content: "🤔 🤔 <:pog:55>".to_string(),
            }),
            NOW_MS,
        )
        .await
        .expect("live message");
        let live = usage(&manager).await;
        assert_eq!(live.len(), 2);

        core.handle(
            TrackerEvent::ChannelAvailable {
                guild_id: 1,
                channel_id: 10,
            },
            NOW_MS + 1_000,
        )
        .await
        .expect("channel available");
        while core.crawler().step().await.expect("step") != StepResult::Idle {}

        assert_eq!(
            core.crawler().state(10).map(|state| state.phase),
            Some(CrawlPhase::Done)
        );
        assert_eq!(usage(&manager).await, live);
    }

    #[tokio::test]
    async fn guild_registry_failure_still_schedules_channels() {
        let file = NamedTempFile::new().expect("temp sqlite file");
        let manager = crate::db::manager::tests::sqlite_manager(&file).await;
        let directory = Arc::new(FakeDirectory::default());
        let config = config();
        let core = TrackerCore::with_parts(
            LiveIngestor::new(
                manager.usage_store(),
                manager.emote_store(),
                Arc::new(UnavailableGuildStore),
                directory.clone(),
                "!",
                config.consideration_period_ms,
                config.recent_message_capacity,
            ),
            CrawlScheduler::new(
                Arc::new(EmptyHistory),
                manager.usage_store(),
                manager.emote_store(),
                manager.crawl_state_store(),
                directory,
                "!",
                config.crawl_page_size,
            ),
            std::time::Duration::from_millis(1),
        );

        let result = core
            .handle(
                TrackerEvent::GuildAvailable {
                    guild_id: 1,
                    emote_ids: vec![],
                    channel_ids: vec![10, 11, 12],
                },
                NOW_MS,
            )
            .await;

        assert!(result.is_err());
        assert_eq!(core.crawler().queue_len(), 3);
    }
}
