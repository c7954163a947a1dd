//! Environment-driven settings. Every knob has a default; unparsable values
//! fall back to it.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|s| s.trim().parse::<T>().ok()).unwrap_or(default)
}

pub fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|s| !s.trim().is_empty())
}

pub fn env_flag(key: &str) -> bool {
    std::env::var(key)
        .ok()
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub log: String,
    pub metrics_addr: Option<String>,
    pub cache_poll: Duration,
    pub cache_poll_timeout: Duration,
    pub fn_timeout: Duration,
    pub fn_evaluator_addr: Option<String>,
    pub fn_pod_port: u16,
    pub fn_pod_namespace: String,
    pub git_bin: String,
    pub retry_backoff: Duration,
    pub cache_dir: PathBuf,
}

impl Settings {
    pub fn from_env() -> Self {
        Self {
            log: env_opt("KPT_LOG").unwrap_or_else(|| "info".to_string()),
            metrics_addr: env_opt("KPT_METRICS_ADDR"),
            cache_poll: Duration::from_secs(env_or("KPT_CACHE_POLL_SECS", 60u64)),
            cache_poll_timeout: Duration::from_secs(env_or("KPT_CACHE_POLL_TIMEOUT_SECS", 30u64)),
            fn_timeout: Duration::from_secs(env_or("KPT_FN_TIMEOUT_SECS", 300u64)),
            fn_evaluator_addr: env_opt("KPT_FN_EVALUATOR_ADDR"),
            fn_pod_port: env_or("KPT_FN_POD_PORT", 9446u16),
            fn_pod_namespace: env_opt("KPT_FN_POD_NAMESPACE").unwrap_or_else(|| "porch-fn-system".to_string()),
            git_bin: env_opt("KPT_GIT_BIN").unwrap_or_else(|| "git".to_string()),
            retry_backoff: Duration::from_millis(env_or("KPT_RETRY_BACKOFF_MS", 500u64)),
            cache_dir: env_opt("KPT_CACHE_DIR").map(PathBuf::from).unwrap_or_else(default_cache_dir),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self::from_env()
    }
}

fn default_cache_dir() -> PathBuf {
    if let Some(home) = std::env::var_os("HOME") {
        let mut p = PathBuf::from(home);
        p.push(".kpt");
        p.push("cache");
        return p;
    }
    std::env::temp_dir().join("kpt-cache")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unparsable_values_fall_back() {
        std::env::set_var("KPT_TEST_ENV_OR", "not-a-number");
        assert_eq!(env_or("KPT_TEST_ENV_OR", 7u64), 7);
        std::env::set_var("KPT_TEST_ENV_OR", " 12 ");
        assert_eq!(env_or("KPT_TEST_ENV_OR", 7u64), 12);
        std::env::remove_var("KPT_TEST_ENV_OR");
        assert!(env_opt("KPT_TEST_ENV_OR").is_none());
    }
}
