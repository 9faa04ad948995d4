use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use parking_lot::RwLock;
use secrecy::ExposeSecret;
use serenity::all::{
    Cache, ChannelId, ChannelType, Client as SerenityClient, Context as SerenityContext, Emoji,
    EmojiId, EventHandler as SerenityEventHandler, GatewayIntents, GetMessages, Guild,
    GuildChannel, GuildId, Http, Message as SerenityMessage, MessageId, MessageUpdateEvent, Ready,
    UnavailableGuild,
};
use tokio::sync::{Mutex as AsyncMutex, mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::analytics::{AggregationEngine, AnalyticsError, render_report};
use crate::config::Config;
use crate::parsers::{REPORT_COMMAND, parse_prefixed_command};
use crate::tracker::TrackerEvent;
use crate::tracker::ingest::{LiveMessage, MessageEdit};

pub mod directory;
pub mod history;

use self::directory::GuildDirectory;
use self::history::{FetchError, HistoryFetcher, HistoryMessage};

const INITIAL_LOGIN_RETRY_SECONDS: u64 = 2;
const MAX_LOGIN_RETRY_SECONDS: u64 = 300;
const MAX_MESSAGE_LENGTH: usize = 2000;
const REPORT_FAILED: &str = "Failed to fetch emote usage, try again later.";

/// HTTP and cache handles of the connected gateway, shared with the tracker.
#[derive(Default)]
pub struct Gateway {
    http: RwLock<Option<Arc<Http>>>,
    cache: RwLock<Option<Arc<Cache>>>,
}

impl Gateway {
    fn cache(&self) -> Option<Arc<Cache>> {
        self.cache.read().clone()
    }
}

fn guild_id(id: u64) -> Option<GuildId> {
    (id != 0).then(|| GuildId::new(id))
}

impl GuildDirectory for Gateway {
    fn guild_name(&self, guild_id_value: u64) -> Option<String> {
        let cache = self.cache()?;
        let guild = cache.guild(guild_id(guild_id_value)?)?;
        Some(guild.name.clone())
    }

    fn emote_in_guild(&self, guild_id_value: u64, emote_id: u64) -> Option<bool> {
        if emote_id == 0 {
            return Some(false);
        }
        let cache = self.cache()?;
        let guild = cache.guild(guild_id(guild_id_value)?)?;
        Some(guild.emojis.contains_key(&EmojiId::new(emote_id)))
    }

    fn emote_owner(&self, emote_id: u64) -> Option<u64> {
        if emote_id == 0 {
            return None;
        }
        let cache = self.cache()?;
        let emoji_id = EmojiId::new(emote_id);
        cache.guilds().into_iter().find_map(|guild_id| {
            cache
                .guild(guild_id)
                .filter(|guild| guild.emojis.contains_key(&emoji_id))
                .map(|_| guild_id.get())
        })
    }
}

#[async_trait]
impl HistoryFetcher for Gateway {
    async fn fetch_page(
        &self,
        channel_id: u64,
        before: u64,
        limit: u8,
    ) -> Result<Vec<HistoryMessage>, FetchError> {
        if channel_id == 0 || before == 0 {
            return Err(FetchError::ChannelUnavailable(channel_id));
        }
        let Some(http) = self.http.read().clone() else {
            return Err(FetchError::Transient("discord gateway is not connected".to_string()));
        };
        let builder = GetMessages::new()
            .before(MessageId::new(before))
            .limit(limit.clamp(1, history::MAX_PAGE_SIZE));
        let mut page: Vec<HistoryMessage> = ChannelId::new(channel_id)
            .messages(http.as_ref(), builder)
            .await
            .map_err(|err| fetch_error(channel_id, err))?
            .iter()
            .map(history_message)
            .collect();
        page.sort_by(|a, b| b.id.cmp(&a.id));
        Ok(page)
    }
}

fn fetch_error(channel_id: u64, err: serenity::Error) -> FetchError {
    if let serenity::Error::Http(http_err) = &err {
        if let Some(status) = http_err.status_code() {
            if matches!(status.as_u16(), 403 | 404) {
                return FetchError::ChannelUnavailable(channel_id);
            }
        }
    }
    FetchError::Transient(err.to_string())
}

fn history_message(msg: &SerenityMessage) -> HistoryMessage {
    HistoryMessage {
        id: msg.id.get(),
        author_id: msg.author.id.get(),
        author_bot: msg.author.bot,
        content: msg.content.clone(),
    }
}

fn gateway_intents(use_privileged_intents: bool) -> GatewayIntents {
    let intents = GatewayIntents::GUILDS
        | GatewayIntents::GUILD_MESSAGES
        | GatewayIntents::GUILD_EMOJIS_AND_STICKERS
        | GatewayIntents::DIRECT_MESSAGES;
    if use_privileged_intents {
        intents | GatewayIntents::MESSAGE_CONTENT
    } else {
        intents
    }
}

fn is_crawlable(kind: ChannelType) -> bool {
    matches!(kind, ChannelType::Text | ChannelType::News)
}

/// Text channels of `guild` whose history the bot may read.
fn readable_channels(guild: &Guild, bot_id: serenity::all::UserId) -> Vec<u64> {
    let member = guild.members.get(&bot_id);
    guild
        .channels
        .values()
        .filter(|channel| is_crawlable(channel.kind))
        .filter(|channel| {
            member.is_none_or(|member| {
                let permissions = guild.user_permissions_in(channel, member);
                permissions.view_channel() && permissions.read_message_history()
            })
        })
        .map(|channel| channel.id.get())
        .collect()
}

fn unique_message_ids(ids: Vec<MessageId>) -> Vec<u64> {
    let mut seen = HashSet::new();
    ids.into_iter()
        .map(MessageId::get)
        .filter(|id| seen.insert(*id))
        .collect()
}

fn emote_ids(emojis: &HashMap<EmojiId, Emoji>) -> Vec<u64> {
    let mut ids: Vec<u64> = emojis.keys().map(|id| id.get()).collect();
    ids.sort_unstable();
    ids
}

/// Cuts `text` at the last line break that keeps it within a single message.
fn fit_message(text: String) -> String {
    if text.chars().count() <= MAX_MESSAGE_LENGTH {
        return text;
    }
    let mut fitted = String::new();
    for line in text.lines() {
        if fitted.chars().count() + line.chars().count() + 1 > MAX_MESSAGE_LENGTH {
            break;
        }
        fitted.push_str(line);
        fitted.push('\n');
    }
    fitted.trim_end().to_string()
}

/// Runs a report command and renders the reply text.
pub async fn answer_report_command(
    engine: &AggregationEngine,
    args: &[String],
    guild_id: Option<u64>,
    user_id: u64,
    bar_width: usize,
) -> String {
    match engine.run(args, guild_id, user_id).await {
        Ok(report) => fit_message(render_report(&report, bar_width)),
        Err(AnalyticsError::Validation(err)) => err.to_string(),
        Err(err) => {
            error!("emote report failed: {err}");
            REPORT_FAILED.to_string()
        }
    }
}

struct TrackerHandler {
    ready_sender: Arc<AsyncMutex<Option<oneshot::Sender<()>>>>,
    events: mpsc::Sender<TrackerEvent>,
    engine: Arc<RwLock<Option<Arc<AggregationEngine>>>>,
    command_prefix: String,
    bar_width: usize,
}

impl TrackerHandler {
    async fn forward(&self, event: TrackerEvent) {
        if self.events.send(event).await.is_err() {
            debug!("tracker core stopped, dropping gateway event");
        }
    }
}

#[serenity::async_trait]
impl SerenityEventHandler for TrackerHandler {
    async fn ready(&self, _ctx: SerenityContext, ready: Ready) {
        info!(
            "discord gateway ready as {} ({}), guilds={}",
            ready.user.name,
            ready.user.id,
            ready.guilds.len()
        );
        if let Some(sender) = self.ready_sender.lock().await.take() {
            let _ = sender.send(());
        }
        self.forward(TrackerEvent::Ready {
            guild_ids: ready.guilds.iter().map(|guild| guild.id.get()).collect(),
        })
        .await;
    }

    async fn guild_create(&self, ctx: SerenityContext, guild: Guild, _is_new: Option<bool>) {
        let bot_id = ctx.cache.current_user().id;
        self.forward(TrackerEvent::GuildAvailable {
            guild_id: guild.id.get(),
            emote_ids: emote_ids(&guild.emojis),
            channel_ids: readable_channels(&guild, bot_id),
        })
        .await;
    }

    async fn guild_delete(
        &self,
        _ctx: SerenityContext,
        incomplete: UnavailableGuild,
        _full: Option<Guild>,
    ) {
        if incomplete.unavailable {
            warn!("guild became unavailable guild_id={}", incomplete.id);
            return;
        }
        self.forward(TrackerEvent::GuildRemoved {
            guild_id: incomplete.id.get(),
        })
        .await;
    }

    async fn guild_emojis_update(
        &self,
        _ctx: SerenityContext,
        guild_id: GuildId,
        current_state: HashMap<EmojiId, Emoji>,
    ) {
        self.forward(TrackerEvent::EmotesUpdated {
            guild_id: guild_id.get(),
            emote_ids: emote_ids(&current_state),
        })
        .await;
    }

    async fn channel_create(&self, _ctx: SerenityContext, channel: GuildChannel) {
        if !is_crawlable(channel.kind) {
            return;
        }
        self.forward(TrackerEvent::ChannelAvailable {
            guild_id: channel.guild_id.get(),
            channel_id: channel.id.get(),
        })
        .await;
    }

    async fn channel_delete(
        &self,
        _ctx: SerenityContext,
        channel: GuildChannel,
        _messages: Option<Vec<SerenityMessage>>,
    ) {
        self.forward(TrackerEvent::ChannelRemoved {
            channel_id: channel.id.get(),
        })
        .await;
    }

    async fn message(&self, ctx: SerenityContext, msg: SerenityMessage) {
        if msg.author.bot {
            return;
        }

        if let Some(command) = parse_prefixed_command(&msg.content, &self.command_prefix) {
            if command.is(REPORT_COMMAND) {
                let engine = self.engine.read().clone();
                let Some(engine) = engine else {
                    debug!("ignoring report command before engine binding");
                    return;
                };
                let reply = answer_report_command(
                    &engine,
                    &command.args,
                    msg.guild_id.map(GuildId::get),
                    msg.author.id.get(),
                    self.bar_width,
                )
                .await;
                if let Err(err) = msg.channel_id.say(&ctx.http, reply).await {
                    error!("failed to send emote report: {err}");
                }
                return;
            }
        }

        self.forward(TrackerEvent::MessageCreated(LiveMessage {
            id: msg.id.get(),
            channel_id: msg.channel_id.get(),
            guild_id: msg.guild_id.map(GuildId::get),
            author_id: msg.author.id.get(),
            author_bot: msg.author.bot,
            content: msg.content,
        }))
        .await;
    }

    async fn message_update(
        &self,
        _ctx: SerenityContext,
        _old_if_available: Option<SerenityMessage>,
        _new_if_available: Option<SerenityMessage>,
        update: MessageUpdateEvent,
    ) {
        self.forward(TrackerEvent::MessageUpdated(MessageEdit {
            id: update.id.get(),
            guild_id: update.guild_id.map(GuildId::get),
            author_id: update.author.as_ref().map(|author| author.id.get()),
            author_bot: update.author.as_ref().is_some_and(|author| author.bot),
            content: update.content,
        }))
        .await;
    }

    async fn message_delete(
        &self,
        _ctx: SerenityContext,
        _channel_id: ChannelId,
        deleted_message_id: MessageId,
        _guild_id: Option<GuildId>,
    ) {
        self.forward(TrackerEvent::MessagesDeleted {
            message_ids: vec![deleted_message_id.get()],
        })
        .await;
    }

    async fn message_delete_bulk(
        &self,
        _ctx: SerenityContext,
        _channel_id: ChannelId,
        deleted_messages_ids: Vec<MessageId>,
        _guild_id: Option<GuildId>,
    ) {
        self.forward(TrackerEvent::MessagesDeleted {
            message_ids: unique_message_ids(deleted_messages_ids),
        })
        .await;
    }
}

#[derive(Default)]
struct DiscordLoginState {
    is_logged_in: bool,
    gateway_task: Option<tokio::task::JoinHandle<()>>,
}

#[derive(Clone)]
pub struct DiscordClient {
    config: Arc<Config>,
    login_state: Arc<AsyncMutex<DiscordLoginState>>,
    engine: Arc<RwLock<Option<Arc<AggregationEngine>>>>,
    events: mpsc::Sender<TrackerEvent>,
    gateway: Arc<Gateway>,
}

impl DiscordClient {
    pub fn new(config: Arc<Config>, events: mpsc::Sender<TrackerEvent>) -> Self {
        info!("initializing discord client");
        Self {
            config,
            login_state: Arc::new(AsyncMutex::new(DiscordLoginState::default())),
            engine: Arc::new(RwLock::new(None)),
            events,
            gateway: Arc::new(Gateway::default()),
        }
    }

    pub fn gateway(&self) -> Arc<Gateway> {
        self.gateway.clone()
    }

    pub fn set_engine(&self, engine: Arc<AggregationEngine>) {
        *self.engine.write() = Some(engine);
    }

    pub async fn login(&self) -> Result<()> {
        let mut state = self.login_state.lock().await;
        if state.is_logged_in {
            return Ok(());
        }

        let discord = &self.config.discord;
        if !discord.use_privileged_intents {
            warn!("message content intent disabled, emotes in guild messages will not be seen");
        }

        let (ready_tx, ready_rx) = oneshot::channel();
        let event_handler = TrackerHandler {
            ready_sender: Arc::new(AsyncMutex::new(Some(ready_tx))),
            events: self.events.clone(),
            engine: self.engine.clone(),
            command_prefix: discord.command_prefix.clone(),
            bar_width: self.config.reports.bar_width,
        };

        let mut gateway_client = SerenityClient::builder(
            discord.bot_token.expose_secret(),
            gateway_intents(discord.use_privileged_intents),
        )
        .event_handler(event_handler)
        .await
        .map_err(|err| anyhow!("failed to build discord gateway client: {err}"))?;

        *self.gateway.http.write() = Some(gateway_client.http.clone());
        *self.gateway.cache.write() = Some(gateway_client.cache.clone());

        let gateway_task = tokio::spawn(async move {
            if let Err(err) = gateway_client.start_autosharded().await {
                error!("discord gateway stopped: {err}");
            }
        });

        match tokio::time::timeout(std::time::Duration::from_secs(30), ready_rx).await {
            Ok(Ok(())) => {
                state.is_logged_in = true;
                state.gateway_task = Some(gateway_task);
                info!("discord bot login succeeded and gateway is connected");
                Ok(())
            }
            Ok(Err(_)) => {
                gateway_task.abort();
                Err(anyhow!("discord gateway exited before receiving Ready event"))
            }
            Err(_) => {
                gateway_task.abort();
                Err(anyhow!("timed out waiting for discord Ready event"))
            }
        }
    }

    pub async fn start(&self) -> Result<()> {
        let mut retry_seconds = INITIAL_LOGIN_RETRY_SECONDS;

        loop {
            match self.login().await {
                Ok(()) => {
                    info!("discord client is ready");
                    return Ok(());
                }
                Err(err) => {
                    error!(
                        "failed to start discord client: {err}. retrying in {} seconds",
                        retry_seconds
                    );
                    tokio::time::sleep(std::time::Duration::from_secs(retry_seconds)).await;
                    retry_seconds = (retry_seconds * 2).min(MAX_LOGIN_RETRY_SECONDS);
                }
            }
        }
    }

    pub async fn stop(&self) -> Result<()> {
        let mut state = self.login_state.lock().await;
        if !state.is_logged_in {
            return Ok(());
        }

        if let Some(gateway_task) = state.gateway_task.take() {
            gateway_task.abort();
            match gateway_task.await {
                Ok(()) => info!("discord gateway task exited"),
                Err(join_err) if join_err.is_cancelled() => {
                    info!("discord gateway task aborted")
                }
                Err(join_err) => {
                    error!("discord gateway task join error: {join_err}");
                }
            }
        }

        *self.gateway.http.write() = None;
        *self.gateway.cache.write() = None;
        state.is_logged_in = false;
        info!("discord client stopped");
        Ok(())
    }
}
