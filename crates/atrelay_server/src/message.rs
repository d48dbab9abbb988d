//! IRC message parsing and the small formatting helpers replies need.

use chrono::{DateTime, Utc};

/// Budget for the text of one outbound PRIVMSG, in bytes. Leaves room for
/// the prefix, command and target inside the 512 byte line limit.
pub const MAX_TEXT_BYTES: usize = 400;

/// Reply numerics used by the bridge.
pub mod numeric {
    pub const RPL_WELCOME: &str = "001";
    pub const RPL_YOURHOST: &str = "002";
    pub const RPL_CREATED: &str = "003";
    pub const RPL_MYINFO: &str = "004";
    pub const RPL_UMODEIS: &str = "221";
    pub const RPL_WHOISUSER: &str = "311";
    pub const RPL_ENDOFWHO: &str = "315";
    pub const RPL_ENDOFWHOIS: &str = "318";
    pub const RPL_WHOISCHANNELS: &str = "319";
    pub const RPL_WHOISSPECIAL: &str = "320";
    pub const RPL_CHANNELMODEIS: &str = "324";
    pub const RPL_TOPIC: &str = "332";
    pub const RPL_WHOREPLY: &str = "352";
    pub const RPL_NAMREPLY: &str = "353";
    pub const RPL_ENDOFNAMES: &str = "366";
    pub const ERR_NOSUCHNICK: &str = "401";
}

/// A parsed client line. Tags and prefix sent by clients are ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub command: String,
    pub params: Vec<String>,
}

impl Message {
    /// Parse `[@tags] [:prefix] COMMAND params... [:trailing]`. Returns
    /// `None` for blank lines.
    pub fn parse(line: &str) -> Option<Message> {
        let mut rest = line.trim_matches(|c| c == '\r' || c == '\n');

        if rest.starts_with('@') {
            rest = rest.split_once(' ').map(|(_, r)| r)?;
        }
        rest = rest.trim_start_matches(' ');
        if rest.starts_with(':') {
            rest = rest.split_once(' ').map(|(_, r)| r)?;
        }

        let (head, trailing) = match rest.split_once(" :") {
            Some((head, trailing)) => (head, Some(trailing)),
            None => (rest, None),
        };
        let mut words = head.split(' ').filter(|w| !w.is_empty());
        let command = words.next()?.to_ascii_uppercase();
        let mut params: Vec<String> = words.map(str::to_string).collect();
        if let Some(trailing) = trailing {
            params.push(trailing.to_string());
        }

        Some(Message { command, params })
    }

    pub fn param(&self, n: usize) -> Option<&str> {
        self.params.get(n).map(String::as_str)
    }
}

/// Escape a message tag value.
pub fn escape_tag_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            ';' => out.push_str("\\:"),
            ' ' => out.push_str("\\s"),
            '\r' => out.push_str("\\r"),
            '\n' => out.push_str("\\n"),
            c => out.push(c),
        }
    }
    out
}

/// Render `key=value` pairs as a tag block, without the leading `@`.
pub fn format_tags(tags: &[(&str, String)]) -> String {
    tags.iter()
        .map(|(key, value)| format!("{key}={}", escape_tag_value(value)))
        .collect::<Vec<_>>()
        .join(";")
}

/// `time` tag value: UTC with millisecond precision.
pub fn time_tag(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

/// Split text into pieces of at most `budget` bytes, never inside a
/// character. Text that already fits comes back as one piece.
pub fn split_text(text: &str, budget: usize) -> Vec<&str> {
    if text.len() <= budget || budget == 0 {
        return vec![text];
    }

    let mut pieces = Vec::new();
    let mut rest = text;
    while rest.len() > budget {
        let mut cut = budget;
        while !rest.is_char_boundary(cut) {
            cut -= 1;
        }
        if cut == 0 {
            // a single character wider than the budget
            cut = rest.chars().next().map(char::len_utf8).unwrap_or(rest.len());
        }
        let (piece, tail) = rest.split_at(cut);
        pieces.push(piece);
        rest = tail;
    }
    if !rest.is_empty() {
        pieces.push(rest);
    }
    pieces
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_basic() {
        let msg = Message::parse("nick bob").unwrap();
        assert_eq!(msg.command, "NICK");
        assert_eq!(msg.params, vec!["bob"]);
    }

    #[test]
    fn test_parse_trailing_and_prefix() {
        let msg = Message::parse(":bob!x@y PRIVMSG #timeline :!echo hello  world").unwrap();
        assert_eq!(msg.command, "PRIVMSG");
        assert_eq!(msg.params, vec!["#timeline", "!echo hello  world"]);
    }

    #[test]
    fn test_parse_tags_ignored() {
        let msg = Message::parse("@time=x;label=1 PING :tok").unwrap();
        assert_eq!(msg.command, "PING");
        assert_eq!(msg.param(0), Some("tok"));
    }

    #[test]
    fn test_parse_user_line() {
        let msg = Message::parse("USER x 0 * :Real Name").unwrap();
        assert_eq!(msg.params, vec!["x", "0", "*", "Real Name"]);
    }

    #[test]
    fn test_parse_blank() {
        assert_eq!(Message::parse(""), None);
        assert_eq!(Message::parse("   "), None);
        assert_eq!(Message::parse(":prefixonly"), None);
    }

    #[test]
    fn test_escape_tag_value() {
        assert_eq!(escape_tag_value(r"a b;c\d"), r"a\sb\:c\\d");
    }

    #[test]
    fn test_format_tags() {
        let tags = [("time", "2024-01-01T00:00:00.000Z".to_string()), ("x", "a b".to_string())];
        assert_eq!(format_tags(&tags), r"time=2024-01-01T00:00:00.000Z;x=a\sb");
    }

    #[test]
    fn test_time_tag_millis() {
        let at = Utc.with_ymd_and_hms(2024, 3, 5, 7, 8, 9).unwrap()
            + chrono::Duration::milliseconds(42);
        assert_eq!(time_tag(at), "2024-03-05T07:08:09.042Z");
    }

    #[test]
    fn test_split_text() {
        assert_eq!(split_text("short", 10), vec!["short"]);
        assert_eq!(split_text("abcdefgh", 3), vec!["abc", "def", "gh"]);
        // 'é' is two bytes and must not be cut
        assert_eq!(split_text("aéb", 2), vec!["a", "é", "b"]);
        for piece in split_text(&"ü".repeat(300), MAX_TEXT_BYTES) {
            assert!(piece.len() <= MAX_TEXT_BYTES);
        }
    }
}
