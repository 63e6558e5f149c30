//! IRC line parsing and serialization.
//!
//! Format: `[@tags] [:prefix] COMMAND [params...] [:trailing]`. Tags are
//! skipped on input; the bot never negotiates `message-tags`.

use std::fmt;

/// A single parsed IRC message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub prefix: Option<String>,
    pub command: String,
    /// Middle params followed by the trailing param, if any.
    pub params: Vec<String>,
}

impl Message {
    pub fn new(command: &str, params: Vec<&str>) -> Self {
        Self {
            prefix: None,
            command: command.to_string(),
            params: params.into_iter().map(str::to_string).collect(),
        }
    }

    /// Parse a raw line. Returns `None` for empty or command-less input.
    pub fn parse(line: &str) -> Option<Self> {
        let mut rest = line.trim_end_matches(['\r', '\n']);
        if rest.is_empty() {
            return None;
        }

        if rest.starts_with('@') {
            let (_, after) = rest.split_once(' ')?;
            rest = after.trim_start_matches(' ');
        }

        let mut prefix = None;
        if let Some(stripped) = rest.strip_prefix(':') {
            let (p, after) = stripped.split_once(' ')?;
            prefix = Some(p.to_string());
            rest = after.trim_start_matches(' ');
        }

        let (command, mut rest) = match rest.split_once(' ') {
            Some((c, r)) => (c, r),
            None => (rest, ""),
        };
        if command.is_empty() {
            return None;
        }

        let mut params = Vec::new();
        loop {
            rest = rest.trim_start_matches(' ');
            if rest.is_empty() {
                break;
            }
            if let Some(trailing) = rest.strip_prefix(':') {
                params.push(trailing.to_string());
                break;
            }
            match rest.split_once(' ') {
                Some((p, r)) => {
                    params.push(p.to_string());
                    rest = r;
                }
                None => {
                    params.push(rest.to_string());
                    break;
                }
            }
        }

        Some(Self {
            prefix,
            command: command.to_ascii_uppercase(),
            params,
        })
    }

    /// Nick portion of the prefix (`nick!user@host` → `nick`).
    pub fn source_nick(&self) -> Option<&str> {
        self.prefix
            .as_deref()
            .and_then(|p| p.split('!').next())
            .filter(|n| !n.is_empty())
    }
}

/// Renders without the trailing CRLF.
impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ref p) = self.prefix {
            write!(f, ":{p} ")?;
        }
        write!(f, "{}", self.command)?;
        if let Some((last, middle)) = self.params.split_last() {
            for p in middle {
                write!(f, " {p}")?;
            }
            if last.is_empty() || last.contains(' ') || last.starts_with(':') {
                write!(f, " :{last}")?;
            } else {
                write!(f, " {last}")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_privmsg_with_prefix() {
        let msg = Message::parse(":alice!a@host PRIVMSG #chat :hello there\r\n").unwrap();
        assert_eq!(msg.prefix.as_deref(), Some("alice!a@host"));
        assert_eq!(msg.source_nick(), Some("alice"));
        assert_eq!(msg.command, "PRIVMSG");
        assert_eq!(msg.params, vec!["#chat", "hello there"]);
    }

    #[test]
    fn parses_kick() {
        let msg = Message::parse(":op!o@h KICK #chat gptbot :be nice").unwrap();
        assert_eq!(msg.command, "KICK");
        assert_eq!(msg.params, vec!["#chat", "gptbot", "be nice"]);
    }

    #[test]
    fn parses_numeric_without_prefix() {
        let msg = Message::parse("PING :irc.example.net").unwrap();
        assert_eq!(msg.prefix, None);
        assert_eq!(msg.command, "PING");
        assert_eq!(msg.params, vec!["irc.example.net"]);
    }

    #[test]
    fn skips_tags() {
        let msg = Message::parse("@time=2024-01-01T00:00:00Z;label=a\\sb :n!u@h PRIVMSG #c :x").unwrap();
        assert_eq!(msg.source_nick(), Some("n"));
        assert_eq!(msg.params, vec!["#c", "x"]);
    }

    #[test]
    fn empty_line_is_none() {
        assert!(Message::parse("\r\n").is_none());
        assert!(Message::parse("").is_none());
    }

    #[test]
    fn renders_trailing_param() {
        let msg = Message::new("PRIVMSG", vec!["#chat", "hi all"]);
        assert_eq!(msg.to_string(), "PRIVMSG #chat :hi all");
        let msg = Message::new("JOIN", vec!["#chat"]);
        assert_eq!(msg.to_string(), "JOIN #chat");
    }

    #[test]
    fn display_then_parse_keeps_params() {
        let line = ":bot!b@h PRIVMSG #chat ::colon leading";
        let msg = Message::parse(line).unwrap();
        assert_eq!(msg.params[1], ":colon leading");
        assert_eq!(Message::parse(&msg.to_string()).unwrap(), msg);
    }
}
