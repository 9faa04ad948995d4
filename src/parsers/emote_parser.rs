//! Emote token extraction shared by the live path and the history crawler.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;

/// `<:name:id>` or `<a:name:id>`.
pub static CUSTOM_EMOTE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<(a)?:(\w+):([1-9][0-9]{0,19})>").expect("valid regex"));

/// Flag pairs, keycaps and pictographs with optional skin tone modifier and
/// ZWJ continuation. Text-default pictographs such as `©` or `‼` only count
/// when followed by the emoji variation selector.
pub const UNICODE_EMOTE_PATTERN: &str = concat!(
    r"(?:[\x{1F1E6}-\x{1F1FF}]{2})",
    r"|(?:[0-9#*]\x{FE0F}?\x{20E3})",
    r"|(?:(?:[\p{Emoji_Presentation}&&\p{Extended_Pictographic}]\x{FE0F}?",
    r"|\p{Extended_Pictographic}\x{FE0F})\p{Emoji_Modifier}?",
    r"(?:\x{200D}\p{Extended_Pictographic}\x{FE0F}?\p{Emoji_Modifier}?)*)",
);

static UNICODE_EMOTE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(r"(\\)?({UNICODE_EMOTE_PATTERN})")).expect("valid regex")
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomEmote {
    pub id: u64,
    pub name: String,
    pub animated: bool,
}

impl CustomEmote {
    pub fn token(&self) -> String {
        if self.animated {
            format!("<a:{}:{}>", self.name, self.id)
        } else {
            format!("<:{}:{}>", self.name, self.id)
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractedEmotes {
    /// `(emote_id, count)` in first-occurrence order. Custom emotes use their
    /// decimal id, unicode emoji their literal text.
    pub counts: Vec<(String, u32)>,
    /// One entry per distinct custom emote.
    pub custom: Vec<CustomEmote>,
}

impl ExtractedEmotes {
    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    pub fn total(&self) -> u64 {
        self.counts.iter().map(|(_, count)| u64::from(*count)).sum()
    }
}

pub fn extract_emotes(content: &str) -> ExtractedEmotes {
    let mut hits: Vec<(usize, String)> = Vec::new();
    let mut custom: Vec<CustomEmote> = Vec::new();

    for caps in CUSTOM_EMOTE.captures_iter(content) {
        let Some(whole) = caps.get(0) else { continue };
        let Ok(id) = caps[3].parse::<u64>() else {
            continue;
        };
        if !custom.iter().any(|emote| emote.id == id) {
            custom.push(CustomEmote {
                id,
                name: caps[2].to_string(),
                animated: caps.get(1).is_some(),
            });
        }
        hits.push((whole.start(), id.to_string()));
    }

    for caps in UNICODE_EMOTE.captures_iter(content) {
        if caps.get(1).is_some() {
            continue;
        }
        if let Some(emoji) = caps.get(2) {
            hits.push((emoji.start(), emoji.as_str().to_string()));
        }
    }

    hits.sort_by_key(|(start, _)| *start);

    let mut counts: Vec<(String, u32)> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    for (_, key) in hits {
        match index.get(&key) {
            Some(&slot) => counts[slot].1 += 1,
            None => {
                index.insert(key.clone(), counts.len());
                counts.push((key, 1));
            }
        }
    }

    ExtractedEmotes { counts, custom }
}

#[cfg(test)]
mod tests {
    use super::{CustomEmote, extract_emotes};

    #[test]
    fn repeated_unicode_emotes_are_all_counted() {
        let extracted = extract_emotes("🤔🤔👌");
        assert_eq!(
            extracted.counts,
            vec![("🤔".to_string(), 2), ("👌".to_string(), 1)]
        );
        assert!(extracted.custom.is_empty());
    }

    #[test]
    fn custom_emotes_carry_metadata_once() {
        let extracted =
            extract_emotes("hi <:pog:123456789> and <a:dance:987654321> <:pog:123456789>");

        assert_eq!(
            extracted.counts,
            vec![("123456789".to_string(), 2), ("987654321".to_string(), 1)]
        );
        assert_eq!(
            extracted.custom,
            vec![
                CustomEmote {
                    id: 123456789,
                    name: "pog".to_string(),
                    animated: false,
                },
                CustomEmote {
                    id: 987654321,
                    name: "dance".to_string(),
                    animated: true,
                },
            ]
        );
    }

    #[test]
    fn escaped_unicode_emote_is_skipped() {
        let extracted = extract_emotes(r"\🤔 but 🎉");
        assert_eq!(extracted.counts, vec![("🎉".to_string(), 1)]);
    }

    #[test]
    fn order_follows_first_occurrence_across_families() {
        let extracted = extract_emotes("👍 <:a:42> 👍");
        assert_eq!(
            extracted.counts,
            vec![("👍".to_string(), 2), ("42".to_string(), 1)]
        );
    }

    #[test]
    fn zwj_sequences_and_modifiers_are_one_token() {
        let extracted = extract_emotes("👨‍👩‍👧 👍🏽 🇫🇷 1️⃣");
        let keys: Vec<&str> = extracted.counts.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["👨‍👩‍👧", "👍🏽", "🇫🇷", "1️⃣"]);
    }

    #[test]
    fn plain_text_has_no_emotes() {
        let extracted = extract_emotes("hello world 123 <:broken:0>");
        assert!(extracted.is_empty());
        assert_eq!(extracted.total(), 0);
    }

    #[test]
    fn custom_token_renders_back() {
        let emote = CustomEmote {
            id: 7,
            name: "wave".to_string(),
            animated: true,
        };
        assert_eq!(emote.token(), "<a:wave:7>");
    }

    #[test]
    fn text_symbols_need_emoji_presentation() {
        assert!(extract_emotes("Copyright © 2024 Acme™ ‼ ❤").is_empty());

        let extracted = extract_emotes("❤️ 🤔 ™️");
        let keys: Vec<&str> = extracted.counts.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["❤️", "🤔", "™️"]);
    }
}
