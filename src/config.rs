use serde::Deserialize;
use std::time::Duration;

/// Runtime knobs. Defaults work for a local deployment; `from_env` overlays
/// `INTERVIEW_*` variables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub ice_servers: Vec<String>,
    /// how long a candidate waits for `host_ready` before offering anyway
    pub ready_timeout: Duration,
    /// how long arriving tracks are batched before classification
    pub debounce_window: Duration,
    pub screen_min_width: u32,
    pub screen_min_height: u32,
    pub code_length: usize,
    pub code_attempts: usize,
    pub poll_timeout: Duration,
    /// the server drops a peer that has neither polled nor sent for this long
    pub idle_timeout: Duration,
    pub listen_addr: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ice_servers: vec![
                "stun:stun.services.mozilla.com:3478".into(),
                "stun:stun.l.google.com:19302".into(),
            ],
            ready_timeout: Duration::from_millis(3000),
            debounce_window: Duration::from_millis(200),
            screen_min_width: 1280,
            screen_min_height: 720,
            code_length: 6,
            code_attempts: 32,
            poll_timeout: Duration::from_secs(25),
            idle_timeout: Duration::from_secs(75),
            listen_addr: "127.0.0.1:3000".into(),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let millis = |key: &str, default: Duration, min: u64| {
            lookup(key)
                .and_then(|v| v.parse::<u64>().ok())
                .map(|v| Duration::from_millis(v.max(min)))
                .unwrap_or(default)
        };
        let number = |key: &str, default: usize| {
            lookup(key)
                .and_then(|v| v.parse::<usize>().ok())
                .filter(|v| *v > 0)
                .unwrap_or(default)
        };

        Self {
            ice_servers: lookup("INTERVIEW_ICE_SERVERS")
                .map(|v| {
                    v.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(String::from)
                        .collect()
                })
                .unwrap_or(defaults.ice_servers),
            ready_timeout: millis("INTERVIEW_READY_TIMEOUT_MS", defaults.ready_timeout, 100),
            debounce_window: millis("INTERVIEW_DEBOUNCE_MS", defaults.debounce_window, 10),
            screen_min_width: number("INTERVIEW_SCREEN_MIN_WIDTH", defaults.screen_min_width as usize)
                as u32,
            screen_min_height: number(
                "INTERVIEW_SCREEN_MIN_HEIGHT",
                defaults.screen_min_height as usize,
            ) as u32,
            code_length: number("INTERVIEW_CODE_LENGTH", defaults.code_length).clamp(4, 16),
            code_attempts: number("INTERVIEW_CODE_ATTEMPTS", defaults.code_attempts),
            poll_timeout: millis("INTERVIEW_POLL_TIMEOUT_MS", defaults.poll_timeout, 1000),
            idle_timeout: millis("INTERVIEW_IDLE_TIMEOUT_MS", defaults.idle_timeout, 1000),
            listen_addr: lookup("INTERVIEW_LISTEN_ADDR").unwrap_or(defaults.listen_addr),
        }
    }
}
