//! Command table: names, aliases, help text and typo suggestions.

use std::cmp::max;

/// Leading marker operators may put in front of a command.
pub const COMMAND_MARKER: char = '!';

const COMMAND_SUGGESTIONS: &[&str] = &[
    "ping", "help", "list", "show", "create", "reset", "delete", "cancel",
];

const CANCEL_COMMAND: &str = "cancel";

/// An operator command that runs a handler, after alias resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Ping,
    Help,
    List,
    Show,
    Create,
    Reset,
    Delete,
}

impl Command {
    pub fn from_name(name: &str) -> Option<Self> {
        Self::from_canonical(&canonicalize_command_name(name))
    }

    fn from_canonical(name: &str) -> Option<Self> {
        match name {
            "ping" => Some(Self::Ping),
            "help" => Some(Self::Help),
            "list" => Some(Self::List),
            "show" => Some(Self::Show),
            "create" => Some(Self::Create),
            "reset" => Some(Self::Reset),
            "delete" => Some(Self::Delete),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Ping => "ping",
            Self::Help => "help",
            Self::List => "list",
            Self::Show => "show",
            Self::Create => "create",
            Self::Reset => "reset",
            Self::Delete => "delete",
        }
    }
}

/// What the first word of a message asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    /// Drop the pending confirmation, if any.
    Cancel,
    Run(Command),
    Unknown,
}

impl Request {
    pub fn from_word(word: &str) -> Self {
        let name = canonicalize_command_name(word);
        if name == CANCEL_COMMAND {
            return Self::Cancel;
        }
        Command::from_canonical(&name).map_or(Self::Unknown, Self::Run)
    }
}

/// A message split into its command word and arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedMessage {
    /// First word as typed, marker included.
    pub word: String,
    pub args: Vec<String>,
}

impl ParsedMessage {
    /// `None` for a blank message.
    pub fn parse(body: &str) -> Option<Self> {
        let mut words = body.split_whitespace().map(str::to_string);
        let word = words.next()?;
        Some(Self {
            word,
            args: words.collect(),
        })
    }

    pub fn request(&self) -> Request {
        Request::from_word(&self.word)
    }

    /// Every word, command word included.
    pub fn all_words(&self) -> Vec<String> {
        std::iter::once(self.word.clone())
            .chain(self.args.iter().cloned())
            .collect()
    }
}

pub fn canonicalize_command_name(command: &str) -> String {
    let trimmed = command.trim();
    let lower = trimmed
        .strip_prefix(COMMAND_MARKER)
        .unwrap_or(trimmed)
        .to_lowercase();
    match lower.as_str() {
        "remove" | "unregister" => "delete".to_string(),
        _ => lower,
    }
}

pub fn help_text() -> String {
    format!(
        "{} {}

Commands:
* `ping`: Pings the bot
* `help`: Shows this message
* `list`: Show a list of your bots
* `show <username>`: Show info about a specific bot
* `create <username>`: Register a new bot
* `reset <username>`: Reset the access token of a bot
* `delete <username>`: Deactivate a bot and forget it (aliases: `remove`, `unregister`)
* `cancel`: Cancel a pending confirmation",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION")
    )
}

fn levenshtein_distance(a: &str, b: &str) -> usize {
    let a_chars: Vec<char> = a.chars().collect();
    let b_chars: Vec<char> = b.chars().collect();

    if a_chars.is_empty() {
        return b_chars.len();
    }
    if b_chars.is_empty() {
        return a_chars.len();
    }

    let mut prev: Vec<usize> = (0..=b_chars.len()).collect();
    let mut curr = vec![0; b_chars.len() + 1];

    for (i, a_ch) in a_chars.iter().enumerate() {
        curr[0] = i + 1;
        for (j, b_ch) in b_chars.iter().enumerate() {
            let cost = usize::from(a_ch != b_ch);
            curr[j + 1] = (curr[j] + 1).min(prev[j + 1] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[b_chars.len()]
}

fn command_suggestions(command: &str) -> Vec<&'static str> {
    let normalized = canonicalize_command_name(command);
    if normalized.is_empty() {
        return Vec::new();
    }

    let mut ranked: Vec<(&'static str, usize)> = COMMAND_SUGGESTIONS
        .iter()
        .map(|candidate| (*candidate, levenshtein_distance(&normalized, candidate)))
        .collect();
    ranked.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(b.0)));

    let threshold = if normalized.len() <= 4 {
        1
    } else {
        max(2, normalized.len() / 3)
    };

    ranked
        .into_iter()
        .filter(|(_, distance)| *distance <= threshold)
        .take(2)
        .map(|(candidate, _)| candidate)
        .collect()
}

pub fn unknown_command_message(command: &str) -> String {
    let suggestions = command_suggestions(command);
    match suggestions.as_slice() {
        [] => "Unknown command. Use `help` for help.".to_string(),
        [only] => format!("Unknown command. Did you mean `{}`? Use `help` for help.", only),
        many => {
            let formatted = many
                .iter()
                .map(|suggestion| format!("`{}`", suggestion))
                .collect::<Vec<_>>()
                .join(" or ");
            format!(
                "Unknown command. Did you mean {}? Use `help` for help.",
                formatted
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_marker_and_case_are_ignored() {
        assert_eq!(Command::from_name("!PING"), Some(Command::Ping));
        assert_eq!(Command::from_name("Create"), Some(Command::Create));
        assert_eq!(Command::from_name("frobnicate"), None);
    }

    #[test]
    fn test_only_one_marker_is_stripped() {
        assert_eq!(canonicalize_command_name("!!ping"), "!ping");
        assert_eq!(Command::from_name("!!ping"), None);
        assert_eq!(Request::from_word("!!!help"), Request::Unknown);
    }

    #[test]
    fn test_cancel_is_not_a_handler_command() {
        assert_eq!(Request::from_word("!Cancel"), Request::Cancel);
        assert_eq!(Command::from_name("cancel"), None);
        assert_eq!(Request::from_word("remove"), Request::Run(Command::Delete));
        assert_eq!(Request::from_word("nope"), Request::Unknown);
    }

    #[test]
    fn test_delete_aliases() {
        assert_eq!(Command::from_name("remove"), Some(Command::Delete));
        assert_eq!(Command::from_name("!unregister"), Some(Command::Delete));
        assert_eq!(canonicalize_command_name("Delete"), "delete");
    }

    #[test]
    fn test_parse_splits_on_any_whitespace() {
        let parsed = ParsedMessage::parse("  reset\t coolbot  \n").unwrap();
        assert_eq!(parsed.word, "reset");
        assert_eq!(parsed.args, vec!["coolbot"]);
        assert_eq!(parsed.all_words(), vec!["reset", "coolbot"]);
        assert!(ParsedMessage::parse("   ").is_none());
    }

    #[test]
    fn test_levenshtein_distance_basic() {
        assert_eq!(levenshtein_distance("reset", "reset"), 0);
        assert_eq!(levenshtein_distance("rest", "reset"), 1);
        assert_eq!(levenshtein_distance("", "list"), 4);
    }

    #[test]
    fn test_unknown_command_suggests_close_names() {
        assert_eq!(
            unknown_command_message("craete"),
            "Unknown command. Did you mean `create`? Use `help` for help."
        );
        assert_eq!(
            unknown_command_message("zzzzzzzzzz"),
            "Unknown command. Use `help` for help."
        );
    }

    #[test]
    fn test_help_lists_every_command() {
        let help = help_text();
        assert!(help.starts_with(concat!("botkeeper ", env!("CARGO_PKG_VERSION"))));
        for name in COMMAND_SUGGESTIONS {
            assert!(help.contains(&format!("`{}", name)), "missing {}", name);
        }
    }
}
