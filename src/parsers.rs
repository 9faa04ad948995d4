pub mod command_parser;
pub mod emote_parser;

pub use self::command_parser::{
    ParsedCommand, REPORT_COMMAND, is_report_command, parse_prefixed_command,
};
pub use self::emote_parser::{CustomEmote, ExtractedEmotes, extract_emotes};
