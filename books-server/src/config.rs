use std::env;
use std::time::Duration;

/// Server configuration, read once from the environment at startup.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    /// Chat-completions endpoint for the advisor; `None` disables it.
    pub advisor_url: Option<String>,
    pub advisor_api_key: Option<String>,
    pub advisor_model: String,
    pub advisor_timeout: Duration,
    pub story_timeout: Duration,
    pub story_debounce: Duration,
    pub story_worker_interval: Duration,
    pub seed_demo: bool,
}

fn env_string(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn env_seconds(key: &str, default: Duration) -> Duration {
    env_string(key)
        .and_then(|value| value.parse::<u64>().ok())
        .map_or(default, Duration::from_secs)
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8044".into(),
            advisor_url: None,
            advisor_api_key: None,
            advisor_model: "deepseek-chat".into(),
            advisor_timeout: books_advisor::DEFAULT_TIMEOUT,
            story_timeout: books_advisor::STORY_TIMEOUT,
            story_debounce: books_companion::STORY_DEBOUNCE,
            story_worker_interval: Duration::from_secs(60),
            seed_demo: false,
        }
    }
}

impl ServerConfig {
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            bind_addr: env_string("BOOKS_BIND_ADDR").unwrap_or(defaults.bind_addr),
            advisor_url: env_string("BOOKS_ADVISOR_URL"),
            advisor_api_key: env_string("BOOKS_ADVISOR_API_KEY"),
            advisor_model: env_string("BOOKS_ADVISOR_MODEL").unwrap_or(defaults.advisor_model),
            advisor_timeout: env_seconds("BOOKS_ADVISOR_TIMEOUT_SECONDS", defaults.advisor_timeout),
            story_timeout: env_seconds("BOOKS_STORY_TIMEOUT_SECONDS", defaults.story_timeout),
            story_debounce: env_seconds("BOOKS_STORY_DEBOUNCE_SECONDS", defaults.story_debounce),
            story_worker_interval: env_seconds(
                "BOOKS_STORY_WORKER_INTERVAL_SECONDS",
                defaults.story_worker_interval,
            ),
            seed_demo: env_string("BOOKS_SEED_DEMO").is_some_and(|value| value == "1"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn defaults_disable_the_advisor() {
        let config = ServerConfig::default();
        assert_eq!(config.advisor_url, None);
        assert_eq!(config.advisor_timeout, Duration::from_secs(15));
        assert_eq!(config.story_timeout, Duration::from_secs(60));
        assert_eq!(config.story_debounce, Duration::from_secs(300));
    }
}
