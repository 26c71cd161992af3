/// Configuration management
use crate::error::{Result, SyncError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const DEFAULT_MAX_CONTENT_LEN: usize = 2000;
const DEFAULT_RATE_LIMIT_MAX_SENDS: usize = 10;

/// Store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Id (email) of the signed-in user
    pub local_user_id: String,

    /// Maximum message length in characters
    pub max_content_len: usize,

    /// Sends allowed per rate-limit window
    pub rate_limit_max_sends: usize,

    /// Rate-limit window
    pub rate_limit_window: Duration,

    /// How long a typing event keeps a peer marked as typing
    pub typing_window: Duration,

    /// Timeout for a bulk fetch
    pub fetch_timeout: Duration,

    /// Timeout for send, delete, clear and mark-read calls
    pub send_timeout: Duration,

    /// Interval of the background poller
    pub poll_interval: Duration,

    /// Capacity of the observer broadcast channel
    pub event_buffer: usize,

    /// First realtime reconnect delay; doubles on every further attempt
    pub reconnect_base_delay: Duration,

    /// Reconnect attempts before falling back to polling alone
    pub reconnect_max_attempts: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            local_user_id: String::new(),
            max_content_len: DEFAULT_MAX_CONTENT_LEN,
            rate_limit_max_sends: DEFAULT_RATE_LIMIT_MAX_SENDS,
            rate_limit_window: Duration::from_secs(60),
            typing_window: Duration::from_secs(3),
            fetch_timeout: Duration::from_secs(15),
            send_timeout: Duration::from_secs(15),
            poll_interval: Duration::from_millis(1500),
            event_buffer: 256,
            reconnect_base_delay: Duration::from_secs(1),
            reconnect_max_attempts: 5,
        }
    }
}

impl Config {
    pub fn for_user(local_user_id: impl Into<String>) -> Self {
        Self {
            local_user_id: local_user_id.into(),
            ..Default::default()
        }
    }

    /// Create config from command line arguments
    pub fn from_args(args: &[String]) -> Result<Self> {
        if args.len() < 2 {
            return Err(SyncError::Config(format!(
                "Usage: {} <user_email> [--rate-limit <sends>/<secs>] [--typing-ms <ms>] [--timeout-ms <ms>] [--poll-ms <ms>] [--reconnect-ms <ms>] [--reconnect-attempts <n>]",
                args.first().map(String::as_str).unwrap_or("wirewave")
            )));
        }

        let mut config = Config::for_user(args[1].trim());

        let mut i = 2;
        while i < args.len() {
            let flag = args[i].as_str();
            let value = args.get(i + 1).ok_or_else(|| {
                SyncError::Config(format!("{} requires a value", flag))
            })?;
            match flag {
                "--rate-limit" => {
                    let (max, window) = parse_rate_limit(value)?;
                    config.rate_limit_max_sends = max;
                    config.rate_limit_window = window;
                }
                "--typing-ms" => config.typing_window = parse_millis(flag, value)?,
                "--timeout-ms" => {
                    let timeout = parse_millis(flag, value)?;
                    config.fetch_timeout = timeout;
                    config.send_timeout = timeout;
                }
                "--poll-ms" => config.poll_interval = parse_millis(flag, value)?,
                "--reconnect-ms" => config.reconnect_base_delay = parse_millis(flag, value)?,
                "--reconnect-attempts" => {
                    config.reconnect_max_attempts = value.parse::<u32>().map_err(|_| {
                        SyncError::Config(format!("{} must be a number", flag))
                    })?;
                }
                other => {
                    return Err(SyncError::Config(format!("Unknown option: {}", other)));
                }
            }
            i += 2;
        }

        // Env overrides (nice for scripts)
        if let Ok(raw) = std::env::var("WIREWAVE_RATE_LIMIT") {
            let (max, window) = parse_rate_limit(&raw)?;
            config.rate_limit_max_sends = max;
            config.rate_limit_window = window;
        }
        if let Some(ms) = std::env::var("WIREWAVE_TYPING_MS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
        {
            config.typing_window = Duration::from_millis(ms);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.local_user_id.trim().is_empty() {
            return Err(SyncError::Config("Local user id is required".to_string()));
        }
        if self.max_content_len == 0 {
            return Err(SyncError::Config("max_content_len must be positive".to_string()));
        }
        if self.rate_limit_max_sends == 0 || self.rate_limit_window.is_zero() {
            return Err(SyncError::Config(
                "Rate limit needs a positive count and window".to_string(),
            ));
        }
        if self.typing_window.is_zero() {
            return Err(SyncError::Config("typing_window must be positive".to_string()));
        }
        if self.fetch_timeout.is_zero() || self.send_timeout.is_zero() {
            return Err(SyncError::Config("Timeouts must be positive".to_string()));
        }
        if self.poll_interval.is_zero() {
            return Err(SyncError::Config("poll_interval must be positive".to_string()));
        }
        if self.reconnect_base_delay.is_zero() {
            return Err(SyncError::Config(
                "reconnect_base_delay must be positive".to_string(),
            ));
        }
        if self.event_buffer == 0 {
            return Err(SyncError::Config("event_buffer must be positive".to_string()));
        }
        Ok(())
    }
}

/// "3/10" -> 3 sends per 10 seconds
fn parse_rate_limit(raw: &str) -> Result<(usize, Duration)> {
    let (max, secs) = raw.split_once('/').ok_or_else(|| {
        SyncError::Config("Rate limit must look like <sends>/<secs>".to_string())
    })?;
    let max = max
        .trim()
        .parse::<usize>()
        .map_err(|_| SyncError::Config("Rate limit count must be a number".to_string()))?;
    let secs = secs
        .trim()
        .parse::<u64>()
        .map_err(|_| SyncError::Config("Rate limit window must be a number".to_string()))?;
    Ok((max, Duration::from_secs(secs)))
}

fn parse_millis(flag: &str, raw: &str) -> Result<Duration> {
    raw.parse::<u64>()
        .map(Duration::from_millis)
        .map_err(|_| SyncError::Config(format!("{} must be a number of milliseconds", flag)))
}
