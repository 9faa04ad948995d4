use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use tracing::debug;

use super::AnalyticsError;
use super::filters::{FilterLimits, FilterSpec, GroupBy, Invocation, Visibility, parse_filters};
use crate::db::{EmoteStore, UsageEvent, UsageStore};
use crate::discord::directory::GuildDirectory;
use crate::parsers::CustomEmote;

pub const GUILD_NOT_FOUND: &str = "Not found";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportOptions {
    pub default_limit: usize,
    pub max_limit: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportRow {
    /// Group key: emote id or literal, user id, or guild id.
    pub key: String,
    pub label: String,
    pub value: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Report {
    pub group_by: GroupBy,
    pub rows: Vec<ReportRow>,
    /// Sum over the shown rows.
    pub total: u64,
}

/// Outcome of labelling one emote row.
struct EmoteLabel {
    label: String,
    renderable: bool,
    guild_id: Option<u64>,
}

pub struct AggregationEngine {
    usage_store: Arc<dyn UsageStore>,
    emote_store: Arc<dyn EmoteStore>,
    directory: Arc<dyn GuildDirectory>,
    options: ReportOptions,
}

impl AggregationEngine {
    pub fn new(
        usage_store: Arc<dyn UsageStore>,
        emote_store: Arc<dyn EmoteStore>,
        directory: Arc<dyn GuildDirectory>,
        options: ReportOptions,
    ) -> Self {
        Self {
            usage_store,
            emote_store,
            directory,
            options,
        }
    }

    pub async fn run(
        &self,
        args: &[String],
        invoking_guild: Option<u64>,
        invoking_user: u64,
    ) -> Result<Report, AnalyticsError> {
        self.run_at(
            args,
            invoking_guild,
            invoking_user,
            crate::utils::snowflake::now_ms(),
        )
        .await
    }

    pub async fn run_at(
        &self,
        args: &[String],
        invoking_guild: Option<u64>,
        invoking_user: u64,
        now_ms: i64,
    ) -> Result<Report, AnalyticsError> {
        let limits = FilterLimits {
            default_limit: self.options.default_limit,
            max_limit: self.options.max_limit,
        };
        let invocation = Invocation {
            guild_id: invoking_guild,
            user_id: invoking_user,
        };
        let spec = parse_filters(args, limits, now_ms)?.fix(&invocation)?;
        self.report(&spec, invoking_guild).await
    }

    pub async fn report(
        &self,
        spec: &FilterSpec,
        invoking_guild: Option<u64>,
    ) -> Result<Report, AnalyticsError> {
        let group_by = spec.group_by();
        let events = self
            .usage_store
            .fetch_filtered(&spec.to_usage_filter())
            .await?;
        debug!(
            "aggregating usage rows={} group_by={:?} duplicate={}",
            events.len(),
            group_by,
            spec.duplicate
        );

        let mut ranked = aggregate(&events, group_by, spec.duplicate);
        rank(&mut ranked, spec.order_ascending);

        let limit = spec.limit.max(1);
        let mut rows = Vec::with_capacity(limit);
        for window in ranked.chunks(limit) {
            let labels = self
                .label_window(window, group_by, spec.visibility, invoking_guild)
                .await?;
            for ((key, value), label) in window.iter().zip(labels) {
                let Some(label) = label else { continue };
                rows.push(ReportRow {
                    key: key.clone(),
                    label,
                    value: *value,
                });
                if rows.len() == limit {
                    break;
                }
            }
            if rows.len() == limit {
                break;
            }
        }

        let total = rows.iter().map(|row| row.value).sum();
        Ok(Report {
            group_by,
            rows,
            total,
        })
    }

    /// Labels one rank window. `None` marks a row suppressed by visibility.
    async fn label_window(
        &self,
        window: &[(String, u64)],
        group_by: GroupBy,
        visibility: Visibility,
        invoking_guild: Option<u64>,
    ) -> Result<Vec<Option<String>>, AnalyticsError> {
        match group_by {
            GroupBy::User => Ok(window
                .iter()
                .map(|(key, _)| Some(format!("<@{key}>")))
                .collect()),
            GroupBy::Guild => Ok(window
                .iter()
                .map(|(key, _)| {
                    let name = key
                        .parse::<u64>()
                        .ok()
                        .and_then(|id| self.directory.guild_name(id));
                    Some(name.unwrap_or_else(|| GUILD_NOT_FOUND.to_string()))
                })
                .collect()),
            GroupBy::Emote => {
                let labels = self.label_emotes(window).await?;
                Ok(labels
                    .into_iter()
                    .map(|emote| {
                        let shown = match visibility {
                            Visibility::Global => true,
                            Visibility::Visible => emote.renderable,
                            Visibility::Server => {
                                emote.guild_id.is_some() && emote.guild_id == invoking_guild
                            }
                        };
                        shown.then_some(emote.label)
                    })
                    .collect())
            }
        }
    }

    async fn label_emotes(&self, window: &[(String, u64)]) -> Result<Vec<EmoteLabel>, AnalyticsError> {
        let custom_ids: Vec<u64> = window
            .iter()
            .filter_map(|(key, _)| custom_emote_id(key))
            .collect();
        let metadata = self.emote_store.fetch_emote_metadata(&custom_ids).await?;

        let mut labels = Vec::with_capacity(window.len());
        let mut stale = BTreeSet::new();
        for (key, _) in window {
            let Some(id) = custom_emote_id(key) else {
                labels.push(EmoteLabel {
                    label: key.clone(),
                    renderable: true,
                    guild_id: None,
                });
                continue;
            };
            let Some(emote) = metadata.get(&id) else {
                labels.push(EmoteLabel {
                    label: key.clone(),
                    renderable: false,
                    guild_id: None,
                });
                continue;
            };

            let (renderable, guild_id) = match emote.guild_id {
                Some(guild_id) => match self.directory.emote_in_guild(guild_id, id) {
                    Some(true) => (true, Some(guild_id)),
                    Some(false) => {
                        stale.insert(id);
                        (false, None)
                    }
                    None => (false, Some(guild_id)),
                },
                None => (false, None),
            };
            let token = CustomEmote {
                id,
                name: emote.name.clone(),
                animated: emote.animated,
            };
            labels.push(EmoteLabel {
                label: if renderable {
                    token.token()
                } else {
                    format!(":{}:", emote.name)
                },
                renderable,
                guild_id,
            });
        }

        for id in stale {
            debug!("emote no longer in its recorded guild emote_id={}", id);
            self.emote_store.unset_emote_guild(id).await?;
        }

        Ok(labels)
    }
}

fn custom_emote_id(key: &str) -> Option<u64> {
    if key.bytes().all(|b| b.is_ascii_digit()) {
        key.parse().ok()
    } else {
        None
    }
}

/// Sums usage per group key, or counts rows when `duplicate` is false.
pub fn aggregate(events: &[UsageEvent], group_by: GroupBy, duplicate: bool) -> Vec<(String, u64)> {
    let mut sums: HashMap<String, u64> = HashMap::new();
    for event in events {
        let key = match group_by {
            GroupBy::Emote => event.emote_id.clone(),
            GroupBy::User => event.user_id.to_string(),
            GroupBy::Guild => event.guild_id.to_string(),
        };
        let amount = if duplicate { u64::from(event.usages) } else { 1 };
        *sums.entry(key).or_insert(0) += amount;
    }
    sums.into_iter().collect()
}

/// Orders by value, ties broken by key ascending.
pub fn rank(rows: &mut [(String, u64)], ascending: bool) {
    rows.sort_by(|(key_a, a), (key_b, b)| {
        let by_value = if ascending { a.cmp(b) } else { b.cmp(a) };
        match by_value {
            Ordering::Equal => key_a.cmp(key_b),
            other => other,
        }
    });
}
