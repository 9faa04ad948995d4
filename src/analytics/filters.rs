//! Filter expressions accepted by the `emotes` command.
//!
//! Each whitespace-separated token is matched against an ordered rule table;
//! the first matching rule decides which field it sets. Guild, user and emote
//! filters accumulate (OR within the field), every other filter keeps the last
//! value given. A single unmatched token rejects the whole expression.

use std::collections::BTreeSet;

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

use crate::db::UsageFilter;
use crate::parsers::emote_parser::UNICODE_EMOTE_PATTERN;
use crate::utils::duration::parse_duration_ms;
use crate::utils::snowflake::timestamp_from_id;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FilterError {
    #[error("Invalid filter(s): {}", .0.join(" "))]
    Unrecognized(Vec<String>),
    #[error("limit must be between 1 and {max}, got {value}")]
    LimitOutOfRange { value: String, max: usize },
    #[error("invalid id: {0}")]
    InvalidId(String),
    #[error("invalid duration: {0}")]
    InvalidDuration(String),
    #[error("server:here can only be used inside a server")]
    HereOutsideGuild,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Visibility {
    #[default]
    Global,
    Visible,
    Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupBy {
    Emote,
    User,
    Guild,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterSpec {
    pub guild: Option<BTreeSet<u64>>,
    pub user: Option<BTreeSet<u64>>,
    pub emote: Option<BTreeSet<String>>,
    /// Set by `server:here`, resolved by [`FilterSpec::fix`].
    pub here: bool,
    /// Set by `user:me`, resolved by [`FilterSpec::fix`].
    pub me: bool,
    /// When false every stored row counts once regardless of its usage count.
    pub duplicate: bool,
    pub order_ascending: bool,
    pub limit: usize,
    /// Exclusive lower bound on `sent_at`, in milliseconds.
    pub since: Option<i64>,
    pub visibility: Visibility,
}

impl FilterSpec {
    pub fn new(default_limit: usize) -> Self {
        Self {
            guild: None,
            user: None,
            emote: None,
            here: false,
            me: false,
            duplicate: true,
            order_ascending: false,
            limit: default_limit,
            since: None,
            visibility: Visibility::Global,
        }
    }

    /// Resolves `here`/`me` against the invoking context and scopes an
    /// unscoped query to the invoking guild, or the invoking user in DMs.
    pub fn fix(mut self, invocation: &Invocation) -> Result<Self, FilterError> {
        if self.here {
            let guild_id = invocation.guild_id.ok_or(FilterError::HereOutsideGuild)?;
            self.guild.get_or_insert_with(BTreeSet::new).insert(guild_id);
            self.here = false;
        }
        if self.me {
            self.user
                .get_or_insert_with(BTreeSet::new)
                .insert(invocation.user_id);
            self.me = false;
        }

        if self.guild.is_none() && self.user.is_none() {
            match invocation.guild_id {
                Some(guild_id) => self.guild = Some(BTreeSet::from([guild_id])),
                None => self.user = Some(BTreeSet::from([invocation.user_id])),
            }
        }

        Ok(self)
    }

    pub fn group_by(&self) -> GroupBy {
        if self.emote.is_none() {
            GroupBy::Emote
        } else if self.user.is_none() {
            GroupBy::User
        } else {
            GroupBy::Guild
        }
    }

    pub fn to_usage_filter(&self) -> UsageFilter {
        UsageFilter {
            guild_ids: self.guild.as_ref().map(|ids| ids.iter().copied().collect()),
            user_ids: self.user.as_ref().map(|ids| ids.iter().copied().collect()),
            emote_ids: self.emote.as_ref().map(|ids| ids.iter().cloned().collect()),
            since: self.since,
        }
    }
}

/// Who asked, and where.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Invocation {
    pub guild_id: Option<u64>,
    pub user_id: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterLimits {
    pub default_limit: usize,
    pub max_limit: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    GuildHere,
    Guild,
    UserMe,
    User,
    Emote,
    Duplicate,
    Order,
    Limit,
    Since,
    Last,
    Visibility,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Multiplicity {
    Many,
    Single,
}

struct FilterRule {
    pattern: Regex,
    field: Field,
    multiplicity: Multiplicity,
}

impl FilterRule {
    fn new(pattern: &str, field: Field, multiplicity: Multiplicity) -> Self {
        Self {
            pattern: Regex::new(pattern).expect("valid regex"),
            field,
            multiplicity,
        }
    }
}

static RULES: Lazy<Vec<FilterRule>> = Lazy::new(|| {
    let unicode = format!("^({UNICODE_EMOTE_PATTERN})$");
    vec![
        FilterRule::new(r"^(?i)(?:server|guild):here$", Field::GuildHere, Multiplicity::Many),
        FilterRule::new(r"^(?i)(?:server|guild):([0-9]+)$", Field::Guild, Multiplicity::Many),
        FilterRule::new(r"^(?i)user:me$", Field::UserMe, Multiplicity::Many),
        FilterRule::new(r"^(?i)user:([0-9]+)$", Field::User, Multiplicity::Many),
        FilterRule::new(r"^<@!?([0-9]+)>$", Field::User, Multiplicity::Many),
        FilterRule::new(r"^<a?:\w+:([0-9]+)>$", Field::Emote, Multiplicity::Many),
        FilterRule::new(r"^(?i)emote:([0-9]+)$", Field::Emote, Multiplicity::Many),
        FilterRule::new(&unicode, Field::Emote, Multiplicity::Many),
        FilterRule::new(
            r"^(?i)duplicates?:(yes|no|true|false)$",
            Field::Duplicate,
            Multiplicity::Single,
        ),
        FilterRule::new(
            r"^(?i)order:(asc|ascending|desc|descending)$",
            Field::Order,
            Multiplicity::Single,
        ),
        FilterRule::new(r"^(?i)limit:([0-9]+)$", Field::Limit, Multiplicity::Single),
        FilterRule::new(r"^(?i)since:([0-9]+)$", Field::Since, Multiplicity::Single),
        FilterRule::new(r"^(?i)last:([0-9a-z]+)$", Field::Last, Multiplicity::Single),
        FilterRule::new(
            r"^(?i)visibility:(global|visible|server)$",
            Field::Visibility,
            Multiplicity::Single,
        ),
    ]
});

fn collect<T: Ord>(slot: &mut Option<BTreeSet<T>>, value: T, multiplicity: Multiplicity) {
    let values = slot.get_or_insert_with(BTreeSet::new);
    if multiplicity == Multiplicity::Single {
        values.clear();
    }
    values.insert(value);
}

fn parse_id(raw: &str) -> Result<u64, FilterError> {
    raw.parse::<u64>()
        .map_err(|_| FilterError::InvalidId(raw.to_string()))
}

/// Parses filter tokens into a [`FilterSpec`]. `now_ms` anchors `last:`.
pub fn parse_filters<S: AsRef<str>>(
    tokens: &[S],
    limits: FilterLimits,
    now_ms: i64,
) -> Result<FilterSpec, FilterError> {
    let mut spec = FilterSpec::new(limits.default_limit);
    let mut unrecognized = Vec::new();

    for token in tokens.iter().map(AsRef::as_ref) {
        let matched = RULES.iter().find_map(|rule| {
            rule.pattern
                .captures(token)
                .map(|caps| (rule, caps.get(1).map(|m| m.as_str().to_string())))
        });
        let Some((rule, value)) = matched else {
            unrecognized.push(token.to_string());
            continue;
        };
        let value = value.unwrap_or_default();
        apply_rule(&mut spec, rule, &value, limits, now_ms)?;
    }

    if !unrecognized.is_empty() {
        return Err(FilterError::Unrecognized(unrecognized));
    }
    Ok(spec)
}

fn apply_rule(
    spec: &mut FilterSpec,
    rule: &FilterRule,
    value: &str,
    limits: FilterLimits,
    now_ms: i64,
) -> Result<(), FilterError> {
    match rule.field {
        Field::GuildHere => spec.here = true,
        Field::UserMe => spec.me = true,
        Field::Guild => collect(&mut spec.guild, parse_id(value)?, rule.multiplicity),
        Field::User => collect(&mut spec.user, parse_id(value)?, rule.multiplicity),
        Field::Emote => {
            let key = if value.bytes().all(|b| b.is_ascii_digit()) {
                parse_id(value)?.to_string()
            } else {
                value.to_string()
            };
            collect(&mut spec.emote, key, rule.multiplicity);
        }
        Field::Duplicate => {
            spec.duplicate = matches!(value.to_ascii_lowercase().as_str(), "yes" | "true");
        }
        Field::Order => {
            spec.order_ascending = value.to_ascii_lowercase().starts_with("asc");
        }
        Field::Limit => {
            let limit = value
                .parse::<usize>()
                .ok()
                .filter(|limit| (1..=limits.max_limit).contains(limit))
                .ok_or_else(|| FilterError::LimitOutOfRange {
                    value: value.to_string(),
                    max: limits.max_limit,
                })?;
            spec.limit = limit;
        }
        Field::Since => {
            spec.since = Some(timestamp_from_id(parse_id(value)?));
        }
        Field::Last => {
            let duration = parse_duration_ms(value)
                .and_then(|ms| i64::try_from(ms).ok())
                .ok_or_else(|| FilterError::InvalidDuration(value.to_string()))?;
            spec.since = Some(now_ms.saturating_sub(duration));
        }
        Field::Visibility => {
            spec.visibility = match value.to_ascii_lowercase().as_str() {
                "visible" => Visibility::Visible,
                "server" => Visibility::Server,
                _ => Visibility::Global,
            };
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use test_case::test_case;

    use super::{
        FilterError, FilterLimits, FilterSpec, GroupBy, Invocation, Visibility, parse_filters,
    };
    use crate::utils::snowflake::timestamp_from_id;

    const LIMITS: FilterLimits = FilterLimits {
        default_limit: 5,
        max_limit: 25,
    };
    const NOW: i64 = 1_700_000_000_000;

    fn parse(tokens: &[&str]) -> Result<FilterSpec, FilterError> {
        parse_filters(tokens, LIMITS, NOW)
    }

    #[test]
    fn user_guild_and_emoji_fill_their_fields() {
        let spec = parse(&["user:123", "server:456", "🤔"]).expect("valid filters");

        assert_eq!(spec.user, Some(BTreeSet::from([123])));
        assert_eq!(spec.guild, Some(BTreeSet::from([456])));
        assert_eq!(spec.emote, Some(BTreeSet::from(["🤔".to_string()])));
        assert!(spec.duplicate);
        assert!(!spec.order_ascending);
        assert_eq!(spec.limit, 5);
        assert_eq!(spec.visibility, Visibility::Global);
    }

    #[test]
    fn unknown_token_rejects_everything() {
        assert_eq!(
            parse(&["user:1", "bogus:1"]),
            Err(FilterError::Unrecognized(vec!["bogus:1".to_string()]))
        );
    }

    #[test]
    fn multi_valued_fields_accumulate() {
        let spec = parse(&["user:1", "<@2>", "<@!3>", "<:pog:10>", "emote:11", "<a:x:12>"])
            .expect("valid filters");
        assert_eq!(spec.user, Some(BTreeSet::from([1, 2, 3])));
        assert_eq!(
            spec.emote,
            Some(BTreeSet::from([
                "10".to_string(),
                "11".to_string(),
                "12".to_string()
            ]))
        );
    }

    #[test]
    fn single_valued_fields_keep_last_value() {
        let spec = parse(&["limit:3", "order:asc", "limit:7", "order:descending"]).expect("valid");
        assert_eq!(spec.limit, 7);
        assert!(!spec.order_ascending);
    }

    #[test_case("duplicate:no", false; "no")]
    #[test_case("duplicate:false", false; "false")]
    #[test_case("duplicates:yes", true; "plural yes")]
    #[test_case("DUPLICATE:TRUE", true; "uppercase")]
    fn duplicate_flag(token: &str, expected: bool) {
        assert_eq!(parse(&[token]).expect("valid").duplicate, expected);
    }

    #[test_case("visibility:global", Visibility::Global)]
    #[test_case("visibility:visible", Visibility::Visible)]
    #[test_case("visibility:server", Visibility::Server)]
    fn visibility_values(token: &str, expected: Visibility) {
        assert_eq!(parse(&[token]).expect("valid").visibility, expected);
    }

    #[test_case("limit:0"; "zero")]
    #[test_case("limit:26"; "above max")]
    #[test_case("limit:99999999999999999999999"; "overflow")]
    fn limit_out_of_range(token: &str) {
        assert!(matches!(
            parse(&[token]),
            Err(FilterError::LimitOutOfRange { max: 25, .. })
        ));
    }

    #[test]
    fn since_uses_snowflake_timestamp() {
        let spec = parse(&["since:175928847299117063"]).expect("valid");
        assert_eq!(spec.since, Some(timestamp_from_id(175928847299117063)));
    }

    #[test]
    fn last_counts_back_from_now() {
        let spec = parse(&["last:1d"]).expect("valid");
        assert_eq!(spec.since, Some(NOW - 86_400_000));
        assert_eq!(
            parse(&["last:soon"]),
            Err(FilterError::InvalidDuration("soon".to_string()))
        );
    }

    #[test]
    fn fix_defaults_to_invoking_guild_then_user() {
        let in_guild = Invocation {
            guild_id: Some(9),
            user_id: 4,
        };
        let in_dm = Invocation {
            guild_id: None,
            user_id: 4,
        };

        let spec = parse(&[]).expect("valid").fix(&in_guild).expect("fixed");
        assert_eq!(spec.guild, Some(BTreeSet::from([9])));
        assert_eq!(spec.user, None);

        let spec = parse(&[]).expect("valid").fix(&in_dm).expect("fixed");
        assert_eq!(spec.guild, None);
        assert_eq!(spec.user, Some(BTreeSet::from([4])));

        let spec = parse(&["user:7"]).expect("valid").fix(&in_guild).expect("fixed");
        assert_eq!(spec.guild, None);
    }

    #[test]
    fn fix_resolves_here_and_me() {
        let invocation = Invocation {
            guild_id: Some(9),
            user_id: 4,
        };
        let spec = parse(&["server:here", "user:me", "user:5"])
            .expect("valid")
            .fix(&invocation)
            .expect("fixed");
        assert_eq!(spec.guild, Some(BTreeSet::from([9])));
        assert_eq!(spec.user, Some(BTreeSet::from([4, 5])));

        let dm = Invocation {
            guild_id: None,
            user_id: 4,
        };
        assert_eq!(
            parse(&["server:here"]).expect("valid").fix(&dm),
            Err(FilterError::HereOutsideGuild)
        );
    }

    #[test]
    fn group_by_precedence() {
        let emote_only = parse(&["emote:1"]).expect("valid");
        assert_eq!(emote_only.group_by(), GroupBy::User);

        let emote_and_user = parse(&["emote:1", "user:2"]).expect("valid");
        assert_eq!(emote_and_user.group_by(), GroupBy::Guild);

        let nothing = parse(&[]).expect("valid");
        assert_eq!(nothing.group_by(), GroupBy::Emote);

        let user_only = parse(&["user:2"]).expect("valid");
        assert_eq!(user_only.group_by(), GroupBy::Emote);
    }

    #[test]
    fn usage_filter_carries_parsed_restrictions() {
        let spec = parse(&["server:1", "🤔", "last:1s"]).expect("valid");
        let filter = spec.to_usage_filter();
        assert_eq!(filter.guild_ids, Some(vec![1]));
        assert_eq!(filter.user_ids, None);
        assert_eq!(filter.emote_ids, Some(vec!["🤔".to_string()]));
        assert_eq!(filter.since, Some(NOW - 1_000));
    }
}
