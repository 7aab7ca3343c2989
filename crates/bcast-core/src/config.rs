use std::{env, path::PathBuf, time::Duration};

use crate::{
    engine::{BroadcastOptions, DEFAULT_CONCURRENCY},
    errors::Error,
    retry::RetryPolicy,
    Result,
};

pub const DEFAULT_API_BASE_URL: &str = "https://discord.com/api/v9";

/// Typed configuration, read from the environment (and `.env` if present).
#[derive(Clone, Debug)]
pub struct Config {
    // Control surface
    pub telegram_bot_token: String,
    pub telegram_allowed_users: Vec<i64>,

    // Accounts
    pub accounts_file: PathBuf,
    pub reload_poll: Duration,

    // Transport
    pub api_base_url: String,
    pub request_timeout: Duration,
    pub retry: RetryPolicy,

    // Broadcast defaults
    pub broadcast: BroadcastOptions,
    pub progress_throttle: Duration,

    // Reports
    pub report_dir: Option<PathBuf>,
    pub report_json: bool,
}

impl Config {
    pub fn load() -> Result<Self> {
        // Existing env always wins over `.env`.
        match dotenvy::dotenv() {
            Ok(path) => tracing::debug!(path = %path.display(), "loaded .env"),
            Err(e) if e.not_found() => {}
            Err(e) => return Err(Error::Config(format!(".env: {e}"))),
        }
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. `load` passes the process env.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| lookup(key).and_then(non_empty);

        let telegram_bot_token = get("TELEGRAM_BOT_TOKEN").unwrap_or_default();
        let telegram_allowed_users = parse_csv_i64(get("TELEGRAM_ALLOWED_USERS"));

        if telegram_bot_token.trim().is_empty() {
            return Err(Error::Config(
                "TELEGRAM_BOT_TOKEN environment variable is required".to_string(),
            ));
        }
        if telegram_allowed_users.is_empty() {
            return Err(Error::Config(
                "TELEGRAM_ALLOWED_USERS environment variable is required".to_string(),
            ));
        }

        let accounts_file =
            PathBuf::from(get("ACCOUNTS_FILE").unwrap_or_else(|| "accounts.yaml".to_string()));
        let reload_poll = millis(&get, "RELOAD_POLL_MS", 2_000)?;

        let api_base_url = get("API_BASE_URL")
            .unwrap_or_else(|| DEFAULT_API_BASE_URL.to_string())
            .trim_end_matches('/')
            .to_string();
        let request_timeout = millis(&get, "REQUEST_TIMEOUT_MS", 15_000)?;

        let defaults = RetryPolicy::default();
        let retry = RetryPolicy {
            max_attempts: parse_num(&get, "RETRY_MAX_ATTEMPTS")?.unwrap_or(defaults.max_attempts),
            initial_delay: parse_num(&get, "RETRY_INITIAL_DELAY_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.initial_delay),
            backoff_multiplier: parse_num(&get, "RETRY_BACKOFF_MULTIPLIER")?
                .unwrap_or(defaults.backoff_multiplier),
            max_delay: parse_num(&get, "RETRY_MAX_DELAY_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.max_delay),
        };
        retry.validate()?;

        let concurrency = parse_num(&get, "BROADCAST_CONCURRENCY")?.unwrap_or(DEFAULT_CONCURRENCY);
        let delay = parse_num::<u64>(&get, "BROADCAST_DELAY_MS")?.map(Duration::from_millis);
        let random_delay = get("BROADCAST_RANDOM_DELAY_MS")
            .map(|raw| {
                parse_range_ms(&raw).ok_or_else(|| {
                    Error::Config(format!(
                        "BROADCAST_RANDOM_DELAY_MS must look like MIN-MAX, got {raw:?}"
                    ))
                })
            })
            .transpose()?;
        let broadcast = BroadcastOptions::from_parts(concurrency, delay, random_delay)?;

        let progress_throttle = millis(&get, "PROGRESS_THROTTLE_MS", 1_500)?;

        let report_dir = get("REPORT_DIR").map(PathBuf::from);
        let report_json = get("REPORT_JSON").map(|s| parse_bool(&s)).unwrap_or(false);

        Ok(Self {
            telegram_bot_token,
            telegram_allowed_users,
            accounts_file,
            reload_poll,
            api_base_url,
            request_timeout,
            retry,
            broadcast,
            progress_throttle,
            report_dir,
            report_json,
        })
    }
}

/// `"100-500"` -> (100ms, 500ms). Order is checked later by option validation.
pub fn parse_range_ms(raw: &str) -> Option<(Duration, Duration)> {
    let (min, max) = raw.trim().split_once('-')?;
    let min = min.trim().parse::<u64>().ok()?;
    let max = max.trim().parse::<u64>().ok()?;
    Some((Duration::from_millis(min), Duration::from_millis(max)))
}

fn parse_num<T: std::str::FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>> {
    match get(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| Error::Config(format!("{key} is not a valid number: {raw:?}"))),
    }
}

fn millis(get: &impl Fn(&str) -> Option<String>, key: &str, default: u64) -> Result<Duration> {
    Ok(Duration::from_millis(parse_num(get, key)?.unwrap_or(default)))
}

fn parse_bool(s: &str) -> bool {
    matches!(
        s.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn parse_csv_i64(v: Option<String>) -> Vec<i64> {
    v.unwrap_or_default()
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .filter_map(|s| s.parse::<i64>().ok())
        .collect()
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}
