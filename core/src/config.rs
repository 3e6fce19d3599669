/// Configuration management
use crate::error::{Result, SyncError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8080/api";

/// Synchronizer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// REST API root, e.g. `https://shop.example.com/api`
    pub base_url: String,

    /// Bearer token attached to every request
    pub token: Option<String>,

    /// Conversation list page size
    pub page_size: u32,

    /// Open thread poll interval
    #[serde(with = "duration_ms")]
    pub thread_poll_interval: Duration,

    /// Conversation list poll interval
    #[serde(with = "duration_ms")]
    pub list_poll_interval: Duration,

    /// Server unread-count poll interval
    #[serde(with = "duration_ms")]
    pub unread_poll_interval: Duration,

    /// Per-request timeout
    #[serde(with = "duration_ms")]
    pub request_timeout: Duration,

    /// Badge shows `{cap}+` above this
    pub badge_cap: u32,

    /// Shown until a counterpart's profile arrives (or if it has no nickname)
    pub display_name_placeholder: String,

    /// Maximum outgoing message length in characters
    pub max_message_len: usize,

    /// Words rejected in outgoing messages
    pub blocked_words: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            token: None,
            page_size: 20,
            thread_poll_interval: Duration::from_secs(5),
            list_poll_interval: Duration::from_secs(10),
            unread_poll_interval: Duration::from_secs(30),
            request_timeout: Duration::from_secs(30),
            badge_cap: 99,
            display_name_placeholder: "User".to_string(),
            max_message_len: 500,
            blocked_words: Vec::new(),
        }
    }
}

impl Config {
    /// Load config from a JSON file (durations in milliseconds)
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Create config from command line flags.
    ///
    /// `args[0]` is the program name; flags may appear in any order and
    /// unknown positional arguments are returned untouched for the caller.
    /// A `--config` file is the base layer wherever it appears; the other
    /// flags override it.
    pub fn from_args(args: &[String]) -> Result<(Self, Vec<String>)> {
        let mut config = match args.iter().skip(1).position(|a| a == "--config") {
            Some(pos) => Config::from_file(Path::new(flag_value(args, pos + 1)?))?,
            None => Config::default(),
        };
        let mut rest = Vec::new();

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--config" => {
                    // Already loaded above
                    i += 2;
                }
                "--base-url" => {
                    config.base_url = flag_value(args, i)?.to_string();
                    i += 2;
                }
                "--token" => {
                    config.token = Some(flag_value(args, i)?.to_string());
                    i += 2;
                }
                "--page-size" => {
                    config.page_size = parse_flag(args, i)?;
                    i += 2;
                }
                "--thread-poll-ms" => {
                    config.thread_poll_interval = Duration::from_millis(parse_flag(args, i)?);
                    i += 2;
                }
                "--list-poll-ms" => {
                    config.list_poll_interval = Duration::from_millis(parse_flag(args, i)?);
                    i += 2;
                }
                "--unread-poll-ms" => {
                    config.unread_poll_interval = Duration::from_millis(parse_flag(args, i)?);
                    i += 2;
                }
                "--timeout-ms" => {
                    config.request_timeout = Duration::from_millis(parse_flag(args, i)?);
                    i += 2;
                }
                other => {
                    rest.push(other.to_string());
                    i += 1;
                }
            }
        }

        // Env overrides (nice for scripts)
        if let Ok(url) = std::env::var("CHATSYNC_BASE_URL") {
            config.base_url = url;
        }
        if let Ok(token) = std::env::var("CHATSYNC_TOKEN") {
            config.token = Some(token);
        }

        config.validate()?;
        Ok((config, rest))
    }

    pub fn validate(&self) -> Result<()> {
        if self.base_url.trim().is_empty() {
            return Err(SyncError::Config("base_url must not be empty".to_string()));
        }
        if self.page_size == 0 {
            return Err(SyncError::Config("page_size must be at least 1".to_string()));
        }
        let intervals = [
            ("thread_poll_interval", self.thread_poll_interval),
            ("list_poll_interval", self.list_poll_interval),
            ("unread_poll_interval", self.unread_poll_interval),
            ("request_timeout", self.request_timeout),
        ];
        for (name, value) in intervals {
            if value.is_zero() {
                return Err(SyncError::Config(format!("{} must be non-zero", name)));
            }
        }
        Ok(())
    }
}

fn flag_value(args: &[String], i: usize) -> Result<&str> {
    args.get(i + 1)
        .map(String::as_str)
        .ok_or_else(|| SyncError::Config(format!("{} requires a value", args[i])))
}

fn parse_flag<T: std::str::FromStr>(args: &[String], i: usize) -> Result<T> {
    let raw = flag_value(args, i)?;
    raw.parse::<T>()
        .map_err(|_| SyncError::Config(format!("{} must be a valid number, got {:?}", args[i], raw)))
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
