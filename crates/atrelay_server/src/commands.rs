//! Bang commands typed into the timeline channel.

/// One line of help listing every command.
pub const HELP: &str = "Commands: !echo <text>, !page [n], !post <n>, !refresh, !help";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BangCommand {
    /// Repeat the text back into the channel
    Echo(String),
    /// List a page of numbered posts
    Page(usize),
    /// Show post #n in full
    Post(usize),
    /// Reload the whole timeline
    Refresh,
    Help,
}

impl BangCommand {
    /// Parse a channel message. Blank messages yield `None`; anything that
    /// isn't a well-formed command yields [`BangCommand::Help`].
    pub fn parse(text: &str) -> Option<BangCommand> {
        let text = text.trim();
        let mut parts = text.split_whitespace();
        let name = parts.next()?.to_lowercase();

        let command = match name.as_str() {
            "!echo" => {
                let rest = text[text.find(char::is_whitespace).unwrap_or(text.len())..].trim();
                if rest.is_empty() {
                    BangCommand::Help
                } else {
                    BangCommand::Echo(rest.to_string())
                }
            }
            "!page" => match parts.next() {
                None => BangCommand::Page(1),
                Some(n) => match n.parse::<usize>() {
                    Ok(n) if n > 0 => BangCommand::Page(n),
                    _ => BangCommand::Help,
                },
            },
            "!post" => match parts.next().map(|n| n.trim_start_matches('#').parse::<usize>()) {
                Some(Ok(n)) => BangCommand::Post(n),
                _ => BangCommand::Help,
            },
            "!refresh" => BangCommand::Refresh,
            _ => BangCommand::Help,
        };
        Some(command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_echo_keeps_inner_spacing() {
        assert_eq!(
            BangCommand::parse("!echo  hello   there "),
            Some(BangCommand::Echo("hello   there".into()))
        );
        assert_eq!(BangCommand::parse("!ECHO hi"), Some(BangCommand::Echo("hi".into())));
        assert_eq!(BangCommand::parse("!echo"), Some(BangCommand::Help));
    }

    #[test]
    fn test_page() {
        assert_eq!(BangCommand::parse("!page"), Some(BangCommand::Page(1)));
        assert_eq!(BangCommand::parse("!page 3"), Some(BangCommand::Page(3)));
        assert_eq!(BangCommand::parse("!page 0"), Some(BangCommand::Help));
        assert_eq!(BangCommand::parse("!page two"), Some(BangCommand::Help));
    }

    #[test]
    fn test_post() {
        assert_eq!(BangCommand::parse("!post 7"), Some(BangCommand::Post(7)));
        assert_eq!(BangCommand::parse("!post #7"), Some(BangCommand::Post(7)));
        assert_eq!(BangCommand::parse("!post"), Some(BangCommand::Help));
    }

    #[test]
    fn test_unknown_and_blank() {
        assert_eq!(BangCommand::parse("hello everyone"), Some(BangCommand::Help));
        assert_eq!(BangCommand::parse("!nope"), Some(BangCommand::Help));
        assert_eq!(BangCommand::parse("!refresh"), Some(BangCommand::Refresh));
        assert_eq!(BangCommand::parse("   "), None);
    }
}
