//! Bot configuration, loaded from a YAML file.
//!
//! The file lives next to the binary as `config.yml` by default. Keys use
//! the PascalCase names the bot has always shipped with:
//!
//! ```yaml
//! ApiKey: sk-...
//! OpenAI-Organization: org-...
//! BotName: gptbot
//! BotContext: You are gptbot, a friendly regular in this channel.
//! IrcServer: irc.libera.chat
//! IrcPort: 6697
//! ChatRoom: "#gptbot"
//! MemorySize: 30
//! ContextLinesForResponseDetermination: 5
//! ResponseGPTModel: gpt-4o
//! ShouldRespondGPTModel: gpt-4o-mini
//! ```
//!
//! A file that can't be read is not fatal: the bot logs it and carries on
//! with empty values. A file that can't be parsed is.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Deserializer, Serialize};
use serde_yaml_ng::Value;
use thiserror::Error;

/// Default chat-completions endpoint.
pub const DEFAULT_API_URL: &str = "https://api.openai.com/v1/chat/completions";
/// Default path of the config file.
pub const DEFAULT_CONFIG_PATH: &str = "config.yml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("can't read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("can't parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml_ng::Error,
    },
}

/// Per-session settings. Loaded once at startup and again after a kick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    #[serde(rename = "ApiKey")]
    pub api_key: String,
    #[serde(rename = "OpenAI-Organization")]
    pub organization: String,
    /// System prompt for replies.
    #[serde(rename = "BotContext")]
    pub bot_context: String,
    /// Buffer capacity, in lines.
    #[serde(rename = "MemorySize")]
    pub memory_size: usize,
    #[serde(rename = "IrcServer")]
    pub irc_server: String,
    #[serde(rename = "IrcPort", deserialize_with = "port_from_string_or_int")]
    pub irc_port: u16,
    #[serde(rename = "ChatRoom")]
    pub chat_room: String,
    #[serde(rename = "BotName")]
    pub bot_name: String,
    /// How many trailing lines the gate looks at.
    #[serde(rename = "ContextLinesForResponseDetermination")]
    pub context_lines: usize,
    #[serde(rename = "ResponseGPTModel")]
    pub response_model: String,
    #[serde(rename = "ShouldRespondGPTModel")]
    pub should_respond_model: String,

    #[serde(rename = "UseTls")]
    pub use_tls: bool,
    /// Skip certificate verification. On by default.
    #[serde(rename = "TlsInsecure")]
    pub tls_insecure: bool,
    #[serde(rename = "ApiUrl")]
    pub api_url: String,
    #[serde(rename = "RequestTimeoutSecs")]
    pub request_timeout_secs: u64,
    #[serde(rename = "Temperature")]
    pub temperature: Option<f32>,
    #[serde(rename = "MaxTokens")]
    pub max_tokens: Option<u32>,
    /// Replies in flight at once. 1 keeps replies in arrival order.
    #[serde(rename = "MaxConcurrentReplies")]
    pub max_concurrent_replies: usize,
    /// Inbound lines that may wait for a turn before new ones are recorded
    /// without being considered for a reply.
    #[serde(rename = "QueueDepth")]
    pub queue_depth: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            organization: String::new(),
            bot_context: String::new(),
            memory_size: 0,
            irc_server: String::new(),
            irc_port: 0,
            chat_room: String::new(),
            bot_name: String::new(),
            context_lines: 0,
            response_model: String::new(),
            should_respond_model: String::new(),
            use_tls: true,
            tls_insecure: true,
            api_url: DEFAULT_API_URL.to_string(),
            request_timeout_secs: 15,
            temperature: None,
            max_tokens: None,
            max_concurrent_replies: 1,
            queue_depth: 64,
        }
    }
}

impl Config {
    /// Load from `path`.
    ///
    /// A read failure is logged and yields [`Config::default`]. A parse
    /// failure is returned as [`ConfigError::Parse`]; callers treat it as
    /// fatal at startup.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match Self::read(path) {
            Ok(config) => Ok(config),
            Err(e @ ConfigError::Read { .. }) => {
                tracing::warn!(error = %e, "Config unreadable, continuing with empty settings");
                Ok(Self::default())
            }
            Err(e) => Err(e),
        }
    }

    /// Like [`Config::load`] but reports read failures too.
    pub fn read(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Parse YAML text. Blank input yields the defaults.
    pub fn parse(raw: &str) -> Result<Self, serde_yaml_ng::Error> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml_ng::from_str(raw)
    }

    /// Re-read `path` over the current settings. Keys present in the file
    /// replace current values; keys it leaves out keep theirs.
    pub fn reread(&self, path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        self.overlay(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply YAML text on top of `self`.
    pub fn overlay(&self, raw: &str) -> Result<Self, serde_yaml_ng::Error> {
        if raw.trim().is_empty() {
            return Ok(self.clone());
        }
        let incoming: Value = serde_yaml_ng::from_str(raw)?;
        let incoming = match incoming {
            Value::Mapping(m) => m,
            Value::Null => return Ok(self.clone()),
            other => return serde_yaml_ng::from_value(other),
        };
        let mut merged = serde_yaml_ng::to_value(self)?;
        if let Value::Mapping(ref mut base) = merged {
            for (key, value) in incoming {
                base.insert(key, value);
            }
        }
        serde_yaml_ng::from_value(merged)
    }

    /// `host:port` for the IRC connection.
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.irc_server, self.irc_port)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PortValue {
    Int(u16),
    Text(String),
}

fn port_from_string_or_int<'de, D>(deserializer: D) -> Result<u16, D::Error>
where
    D: Deserializer<'de>,
{
    match PortValue::deserialize(deserializer)? {
        PortValue::Int(p) => Ok(p),
        PortValue::Text(s) if s.trim().is_empty() => Ok(0),
        PortValue::Text(s) => s
            .trim()
            .parse()
            .map_err(|_| serde::de::Error::custom(format!("invalid IrcPort {s:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r##"
ApiKey: sk-test
OpenAI-Organization: org-test
BotContext: You are gptbot.
MemorySize: 30
IrcServer: irc.example.net
IrcPort: "6697"
ChatRoom: "#gptbot"
BotName: gptbot
ContextLinesForResponseDetermination: 5
ResponseGPTModel: gpt-4o
ShouldRespondGPTModel: gpt-4o-mini
"##;

    #[test]
    fn overlay_keeps_keys_the_file_omits() {
        let current = Config::parse(SAMPLE).unwrap();
        let next = current.overlay("MemorySize: 42\nIrcPort: 7000").unwrap();
        assert_eq!(next.memory_size, 42);
        assert_eq!(next.irc_port, 7000);
        assert_eq!(next.api_key, "sk-test");
        assert_eq!(next.response_model, "gpt-4o");
        assert_eq!(current.overlay("").unwrap(), current);
    }

    #[test]
    fn overlay_rejects_bad_values() {
        let current = Config::parse(SAMPLE).unwrap();
        assert!(current.overlay("MemorySize: lots").is_err());
        assert!(current.overlay("- just\n- a list").is_err());
    }

    #[test]
    fn parses_all_documented_keys() {
        let config = Config::parse(SAMPLE).unwrap();
        assert_eq!(config.api_key, "sk-test");
        assert_eq!(config.organization, "org-test");
        assert_eq!(config.bot_context, "You are gptbot.");
        assert_eq!(config.memory_size, 30);
        assert_eq!(config.irc_port, 6697);
        assert_eq!(config.chat_room, "#gptbot");
        assert_eq!(config.bot_name, "gptbot");
        assert_eq!(config.context_lines, 5);
        assert_eq!(config.response_model, "gpt-4o");
        assert_eq!(config.should_respond_model, "gpt-4o-mini");
        assert_eq!(config.server_addr(), "irc.example.net:6697");
    }

    #[test]
    fn extra_keys_default_when_absent() {
        let config = Config::parse(SAMPLE).unwrap();
        assert!(config.use_tls);
        assert!(config.tls_insecure);
        assert_eq!(config.api_url, DEFAULT_API_URL);
        assert_eq!(config.request_timeout_secs, 15);
        assert_eq!(config.temperature, None);
        assert_eq!(config.max_concurrent_replies, 1);
    }

    #[test]
    fn port_accepts_integer() {
        let config = Config::parse("IrcPort: 6667").unwrap();
        assert_eq!(config.irc_port, 6667);
    }

    #[test]
    fn empty_values_are_not_rejected() {
        let config = Config::parse("ApiKey: \"\"\nMemorySize: 0").unwrap();
        assert_eq!(config.api_key, "");
        assert_eq!(config.memory_size, 0);
    }

    #[test]
    fn missing_file_degrades_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(&dir.path().join("nope.yml")).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn unparsable_file_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "MemorySize: [not, a, number]").unwrap();
        let err = Config::load(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn loads_from_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.bot_name, "gptbot");
    }
}
