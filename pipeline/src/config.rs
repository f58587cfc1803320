use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::Duration as ChronoDuration;

/// Every pipeline tunable, sourced from the environment. The thresholds
/// are operating parameters, not contracts — ops can retune without a
/// redeploy of policy code.
#[derive(Debug, Clone)]
pub struct GuardConfig {
    /// Bounded queue size between the gate and the scheduler.
    pub queue_capacity: usize,
    /// Queue length that triggers an immediate drain.
    pub batch_threshold: usize,
    /// Fixed drain cadence when the threshold is not reached.
    pub batch_tick: Duration,
    /// Upper bound on a single classifier call.
    pub classifier_timeout: Duration,
    /// How many similar past cases calibration retrieves.
    pub top_k: usize,
    /// Level TTLs. `ban` is committed without an expiry.
    pub delay_ttl: ChronoDuration,
    pub captcha_ttl: ChronoDuration,
    pub temp_block_ttl: ChronoDuration,
    /// Directory of `<category>.rules` analyst rule files.
    pub rules_dir: PathBuf,
    /// OpenAI-compatible chat-completions endpoint. When unset the
    /// deterministic heuristic classifier runs instead.
    pub llm_endpoint: Option<String>,
    pub llm_api_key: Option<String>,
    pub llm_model: String,
    /// Cadence of the expired-mitigation sweep.
    pub sweep_interval: Duration,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 4096,
            batch_threshold: 100,
            batch_tick: Duration::from_secs(5),
            classifier_timeout: Duration::from_secs(30),
            top_k: 5,
            delay_ttl: ChronoDuration::minutes(10),
            captcha_ttl: ChronoDuration::minutes(15),
            temp_block_ttl: ChronoDuration::hours(1),
            rules_dir: PathBuf::from("rules"),
            llm_endpoint: None,
            llm_api_key: None,
            llm_model: "llama-3.1-8b-instant".to_string(),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

impl GuardConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            queue_capacity: parse_or("WARDEN_QUEUE_CAPACITY", defaults.queue_capacity),
            batch_threshold: parse_or("WARDEN_BATCH_THRESHOLD", defaults.batch_threshold),
            batch_tick: Duration::from_secs(parse_or("WARDEN_BATCH_TICK_SECS", 5)),
            classifier_timeout: Duration::from_secs(parse_or("WARDEN_CLASSIFIER_TIMEOUT_SECS", 30)),
            top_k: parse_or("WARDEN_CALIBRATION_TOP_K", defaults.top_k),
            delay_ttl: ChronoDuration::seconds(parse_or("WARDEN_DELAY_TTL_SECS", 600)),
            captcha_ttl: ChronoDuration::seconds(parse_or("WARDEN_CAPTCHA_TTL_SECS", 900)),
            temp_block_ttl: ChronoDuration::seconds(parse_or("WARDEN_TEMP_BLOCK_TTL_SECS", 3600)),
            rules_dir: std::env::var("WARDEN_RULES_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.rules_dir),
            llm_endpoint: non_empty(std::env::var("WARDEN_LLM_ENDPOINT").ok()),
            llm_api_key: non_empty(std::env::var("WARDEN_LLM_API_KEY").ok()),
            llm_model: non_empty(std::env::var("WARDEN_LLM_MODEL").ok())
                .unwrap_or(defaults.llm_model),
            sweep_interval: Duration::from_secs(parse_or("WARDEN_STORE_SWEEP_SECS", 60)),
        }
    }
}

fn parse_or<T: FromStr + Copy>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => parse_value(key, &raw, default),
        Err(_) => default,
    }
}

fn parse_value<T: FromStr + Copy>(key: &str, raw: &str, default: T) -> T {
    match raw.trim().parse() {
        Ok(value) => value,
        Err(_) => {
            tracing::warn!(key, raw, "unparseable config value, using default");
            default
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::{non_empty, parse_value};

    #[test]
    fn parse_value_falls_back_on_garbage() {
        assert_eq!(parse_value::<usize>("K", "250", 100), 250);
        assert_eq!(parse_value::<usize>("K", "lots", 100), 100);
        assert_eq!(parse_value::<u64>("K", " 42 ", 7), 42);
    }

    #[test]
    fn non_empty_filters_blank_values() {
        assert_eq!(non_empty(Some("  ".into())), None);
        assert_eq!(non_empty(Some("x".into())), Some("x".into()));
        assert_eq!(non_empty(None), None);
    }
}
