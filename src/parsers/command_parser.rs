/// Name of the usage report command.
pub const REPORT_COMMAND: &str = "emotes";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCommand {
    pub name: String,
    pub args: Vec<String>,
}

impl ParsedCommand {
    pub fn is(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }
}

/// Splits `<prefix><name> arg arg ...` into a command. Returns `None` when the
/// content does not start with the prefix or names nothing.
pub fn parse_prefixed_command(content: &str, prefix: &str) -> Option<ParsedCommand> {
    if prefix.is_empty() {
        return None;
    }
    let rest = content.trim_start().strip_prefix(prefix)?;
    let mut parts = rest.split_whitespace();
    let name = parts.next()?;
    if rest.starts_with(char::is_whitespace) {
        return None;
    }

    Some(ParsedCommand {
        name: name.to_lowercase(),
        args: parts.map(ToString::to_string).collect(),
    })
}

/// Whether `content` invokes the report command. Such messages are never counted.
pub fn is_report_command(content: &str, prefix: &str) -> bool {
    parse_prefixed_command(content, prefix).is_some_and(|command| command.is(REPORT_COMMAND))
}

#[cfg(test)]
mod tests {
    use super::{is_report_command, parse_prefixed_command};

    #[test]
    fn parses_name_and_args() {
        let command = parse_prefixed_command("!emotes user:me   limit:3", "!").expect("command");
        assert!(command.is("emotes"));
        assert_eq!(command.args, vec!["user:me", "limit:3"]);
    }

    #[test]
    fn name_is_case_insensitive() {
        let command = parse_prefixed_command("!EMOTES", "!").expect("command");
        assert_eq!(command.name, "emotes");
        assert!(command.args.is_empty());
    }

    #[test]
    fn rejects_missing_prefix_and_detached_name() {
        assert!(parse_prefixed_command("emotes", "!").is_none());
        assert!(parse_prefixed_command("! emotes", "!").is_none());
        assert!(parse_prefixed_command("!", "!").is_none());
    }

    #[test]
    fn supports_multi_character_prefix() {
        let command = parse_prefixed_command("e!emotes 🤔", "e!").expect("command");
        assert_eq!(command.args, vec!["🤔"]);
    }

    #[test]
    fn detects_report_command_only() {
        assert!(is_report_command("!emotes 🤔 🤔", "!"));
        assert!(is_report_command("  !Emotes", "!"));
        assert!(!is_report_command("!help 🤔", "!"));
        assert!(!is_report_command("emotes 🤔", "!"));
        assert!(!is_report_command("!emotes", "e!"));
    }
}
