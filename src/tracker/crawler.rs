//! Resumable history backfill.
//!
//! Each channel walks `CatchingUp -> Backfilling -> Done`. Catching up reads
//! backward from "now" until it meets the newest message recorded by an
//! earlier pass; backfilling then reads backward from the oldest recorded
//! message until the history is exhausted. Cursors are persisted after every
//! page, so a restart resumes where the previous process stopped.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::ingest::{emote_metadata, usage_events};
use crate::db::{ChannelCrawlState, CrawlPhase, CrawlStateStore, DatabaseError, EmoteStore, UsageStore};
use crate::discord::directory::GuildDirectory;
use crate::discord::history::{FetchError, HistoryFetcher, HistoryMessage};
use crate::parsers::{extract_emotes, is_report_command};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Continue(ChannelCrawlState),
    Done(ChannelCrawlState),
}

impl StepOutcome {
    pub fn state(&self) -> &ChannelCrawlState {
        match self {
            StepOutcome::Continue(state) | StepOutcome::Done(state) => state,
        }
    }
}

/// Outcome of one scheduler tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepResult {
    Idle,
    Busy,
    Advanced { channel_id: u64, phase: CrawlPhase },
    Finished { channel_id: u64 },
    Dropped { channel_id: u64 },
    Retried { channel_id: u64 },
}

/// Cursor the next page is fetched before.
pub fn next_cursor(state: &ChannelCrawlState) -> Option<u64> {
    match state.phase {
        CrawlPhase::CatchingUp => state.latest_unparsed_id,
        CrawlPhase::Backfilling => state.earliest_parsed_id,
        CrawlPhase::Done => None,
    }
}

/// Messages of `page` that still need recording in the current phase.
pub fn unrecorded<'a>(
    state: &ChannelCrawlState,
    page: &'a [HistoryMessage],
) -> impl Iterator<Item = &'a HistoryMessage> {
    let floor = match state.phase {
        CrawlPhase::CatchingUp => state.latest_parsed_id,
        _ => None,
    };
    page.iter()
        .filter(move |message| floor.is_none_or(|parsed| message.id > parsed))
}

/// Applies one fetched page to `state`. `page` is newest-first.
pub fn advance(state: &ChannelCrawlState, page: &[HistoryMessage], page_size: u8) -> StepOutcome {
    let mut next = state.clone();
    let newest = page.first().map(|message| message.id);
    let oldest = page.last().map(|message| message.id);

    match state.phase {
        CrawlPhase::CatchingUp => {
            let pass_newest = state.catch_up_newest_id.or(newest);
            let reached_parsed = match (state.latest_parsed_id, oldest) {
                (Some(parsed), Some(oldest)) => oldest <= parsed,
                _ => true,
            };
            let exhausted = page.len() < usize::from(page_size);

            if reached_parsed || exhausted {
                next.latest_parsed_id = state.latest_parsed_id.max(pass_newest);
                next.earliest_parsed_id = state.earliest_parsed_id.or(oldest);
                next.latest_unparsed_id = None;
                next.catch_up_newest_id = None;
                if next.earliest_parsed_id.is_none() {
                    next.phase = CrawlPhase::Done;
                    StepOutcome::Done(next)
                } else {
                    next.phase = CrawlPhase::Backfilling;
                    StepOutcome::Continue(next)
                }
            } else {
                next.catch_up_newest_id = pass_newest;
                next.latest_unparsed_id = oldest;
                StepOutcome::Continue(next)
            }
        }
        CrawlPhase::Backfilling => match oldest {
            Some(oldest) => {
                next.earliest_parsed_id = Some(oldest);
                StepOutcome::Continue(next)
            }
            None => {
                next.phase = CrawlPhase::Done;
                StepOutcome::Done(next)
            }
        },
        CrawlPhase::Done => StepOutcome::Done(next),
    }
}

pub struct CrawlScheduler {
    fetcher: Arc<dyn HistoryFetcher>,
    usage_store: Arc<dyn UsageStore>,
    emote_store: Arc<dyn EmoteStore>,
    crawl_store: Arc<dyn CrawlStateStore>,
    directory: Arc<dyn GuildDirectory>,
    command_prefix: String,
    page_size: u8,
    queue: Mutex<VecDeque<u64>>,
    states: Mutex<HashMap<u64, ChannelCrawlState>>,
    /// Channels already scheduled by this process.
    seen: Mutex<HashSet<u64>>,
    in_flight: tokio::sync::Mutex<()>,
}

impl CrawlScheduler {
    pub fn new(
        fetcher: Arc<dyn HistoryFetcher>,
        usage_store: Arc<dyn UsageStore>,
        emote_store: Arc<dyn EmoteStore>,
        crawl_store: Arc<dyn CrawlStateStore>,
        directory: Arc<dyn GuildDirectory>,
        command_prefix: &str,
        page_size: u8,
    ) -> Self {
        Self {
            fetcher,
            usage_store,
            emote_store,
            crawl_store,
            directory,
            command_prefix: command_prefix.to_string(),
            page_size: page_size.clamp(1, crate::discord::history::MAX_PAGE_SIZE),
            queue: Mutex::new(VecDeque::new()),
            states: Mutex::new(HashMap::new()),
            seen: Mutex::new(HashSet::new()),
            in_flight: tokio::sync::Mutex::new(()),
        }
    }

    pub fn queue_len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn state(&self, channel_id: u64) -> Option<ChannelCrawlState> {
        self.states.lock().get(&channel_id).cloned()
    }

    pub async fn on_channel_visible(
        &self,
        channel_id: u64,
        guild_id: u64,
        now_id: u64,
    ) -> Result<usize, DatabaseError> {
        self.on_channels_visible(&[(channel_id, guild_id)], now_id)
            .await
    }

    /// Schedules `(channel_id, guild_id)` pairs not yet seen by this process,
    /// resuming persisted cursors. Returns how many channels were queued.
    ///
    /// A channel stays queued when persisting its initial state fails; the
    /// first crawled page persists it again.
    pub async fn on_channels_visible(
        &self,
        channels: &[(u64, u64)],
        now_id: u64,
    ) -> Result<usize, DatabaseError> {
        let fresh: Vec<(u64, u64)> = {
            let seen = self.seen.lock();
            channels
                .iter()
                .copied()
                .filter(|(channel_id, _)| !seen.contains(channel_id))
                .collect()
        };
        if fresh.is_empty() {
            return Ok(0);
        }

        let ids: Vec<u64> = fresh.iter().map(|(channel_id, _)| *channel_id).collect();
        let persisted: HashMap<u64, ChannelCrawlState> = self
            .crawl_store
            .fetch_crawl_states(&ids)
            .await?
            .into_iter()
            .map(|state| (state.channel_id, state))
            .collect();

        let mut queued = 0;
        for (channel_id, guild_id) in fresh {
            let state = match persisted.get(&channel_id) {
                Some(state) if state.phase == CrawlPhase::Done => ChannelCrawlState {
                    guild_id,
                    latest_unparsed_id: Some(now_id),
                    catch_up_newest_id: None,
                    phase: CrawlPhase::CatchingUp,
                    ..state.clone()
                },
                Some(state) => state.clone(),
                None => ChannelCrawlState::new(channel_id, guild_id, now_id),
            };
            if !self.seen.lock().insert(channel_id) {
                continue;
            }
            debug!(
                "scheduling channel crawl channel_id={} guild_id={} phase={} resumed={}",
                channel_id,
                guild_id,
                state.phase,
                persisted.contains_key(&channel_id)
            );
            self.states.lock().insert(channel_id, state.clone());
            self.queue.lock().push_back(channel_id);
            queued += 1;

            if let Err(err) = self.crawl_store.upsert_crawl_state(&state).await {
                warn!("failed to persist crawl state channel_id={}: {err}", channel_id);
            }
        }
        Ok(queued)
    }

    pub fn on_channel_removed(&self, channel_id: u64) {
        self.queue.lock().retain(|id| *id != channel_id);
        if self.states.lock().remove(&channel_id).is_some() {
            debug!("dropped crawl task channel_id={}", channel_id);
        }
    }

    /// Drops every task of the guild. A later rejoin resumes persisted cursors.
    pub fn on_guild_removed(&self, guild_id: u64) {
        let removed: Vec<u64> = {
            let mut states = self.states.lock();
            let removed = states
                .values()
                .filter(|state| state.guild_id == guild_id)
                .map(|state| state.channel_id)
                .collect::<Vec<_>>();
            for channel_id in &removed {
                states.remove(channel_id);
            }
            removed
        };
        self.queue.lock().retain(|id| !removed.contains(id));
        let mut seen = self.seen.lock();
        for channel_id in &removed {
            seen.remove(channel_id);
        }
        if !removed.is_empty() {
            info!(
                "dropped crawl tasks for guild guild_id={} channels={}",
                guild_id,
                removed.len()
            );
        }
    }

    /// Runs at most one crawl step. Concurrent callers get [`StepResult::Busy`].
    pub async fn step(&self) -> Result<StepResult, DatabaseError> {
        let Ok(_guard) = self.in_flight.try_lock() else {
            return Ok(StepResult::Busy);
        };
        let Some(channel_id) = self.queue.lock().pop_front() else {
            return Ok(StepResult::Idle);
        };
        let Some(state) = self.state(channel_id) else {
            return Ok(StepResult::Dropped { channel_id });
        };

        let Some(before) = next_cursor(&state) else {
            return Ok(StepResult::Finished { channel_id });
        };

        let page = match self
            .fetcher
            .fetch_page(channel_id, before, self.page_size)
            .await
        {
            Ok(page) => page,
            Err(FetchError::ChannelUnavailable(_)) => {
                debug!("channel unreadable, dropping crawl channel_id={}", channel_id);
                self.states.lock().remove(&channel_id);
                return Ok(StepResult::Dropped { channel_id });
            }
            Err(FetchError::Transient(err)) => {
                warn!("history fetch failed channel_id={} before={}: {err}", channel_id, before);
                self.requeue(channel_id);
                return Ok(StepResult::Retried { channel_id });
            }
        };

        if let Err(err) = self.record_page(&state, &page).await {
            self.requeue(channel_id);
            return Err(err);
        }

        let outcome = advance(&state, &page, self.page_size);
        if let Err(err) = self.crawl_store.upsert_crawl_state(outcome.state()).await {
            self.requeue(channel_id);
            return Err(err);
        }

        debug!(
            "crawled page channel_id={} phase={} messages={} next_phase={}",
            channel_id,
            state.phase,
            page.len(),
            outcome.state().phase
        );

        let mut states = self.states.lock();
        if !states.contains_key(&channel_id) {
            // Removed while the page was in flight.
            return Ok(StepResult::Dropped { channel_id });
        }
        match outcome {
            StepOutcome::Continue(next) => {
                let phase = next.phase;
                states.insert(channel_id, next);
                drop(states);
                self.queue.lock().push_back(channel_id);
                Ok(StepResult::Advanced { channel_id, phase })
            }
            StepOutcome::Done(next) => {
                states.insert(channel_id, next);
                info!("channel crawl finished channel_id={}", channel_id);
                Ok(StepResult::Finished { channel_id })
            }
        }
    }

    fn requeue(&self, channel_id: u64) {
        if self.states.lock().contains_key(&channel_id) {
            self.queue.lock().push_back(channel_id);
        }
    }

    async fn record_page(
        &self,
        state: &ChannelCrawlState,
        page: &[HistoryMessage],
    ) -> Result<(), DatabaseError> {
        let mut events = Vec::new();
        let mut metadata = Vec::new();
        let counted = unrecorded(state, page).filter(|message| {
            !message.author_bot && !is_report_command(&message.content, &self.command_prefix)
        });
        for message in counted {
            let extracted = extract_emotes(&message.content);
            if extracted.is_empty() {
                continue;
            }
            events.extend(usage_events(
                state.guild_id,
                message.author_id,
                message.id,
                &extracted,
            ));
            for emote in emote_metadata(&extracted.custom, self.directory.as_ref()) {
                if !metadata.iter().any(|known: &crate::db::EmoteMetadata| known.id == emote.id) {
                    metadata.push(emote);
                }
            }
        }

        self.usage_store.upsert_usages(&events).await?;
        self.emote_store.record_emote_metadata(&metadata).await
    }
}
