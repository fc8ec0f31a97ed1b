use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use clap::Parser;

use crate::pipeline::PipelineConfig;
use crate::types::{ClientConfig, PollerError, Result, MAX_PAGE_LIMIT};

pub const DEFAULT_SOURCE: &str = "rust";

/// Command line flags of the service binary.
#[derive(Debug, Parser)]
#[command(name = "source-poller", version, about = "Polls paginated sources and serves aggregate statistics")]
pub struct Cli {
    /// Path to the .env file
    #[arg(long, env = "POLLER_ENV_FILE", default_value = ".env")]
    pub env_file: PathBuf,

    /// Logging level
    #[arg(long, default_value = "info", value_parser = ["debug", "info", "warn", "error"])]
    pub log_level: String,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub client: ClientConfig,
    pub sources: Vec<String>,
    pub polling_interval: Duration,
    pub page_limit: usize,
    pub database_path: PathBuf,
    pub server_port: u16,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from any key/value source. Empty values count
    /// as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let client_id = required(&get, "POLLER_CLIENT_ID")?;
        let client_secret = required(&get, "POLLER_CLIENT_SECRET")?;
        let user_agent = required(&get, "POLLER_USER_AGENT")?;

        let sources = parse_sources(get("POLLER_SOURCES").as_deref().unwrap_or(DEFAULT_SOURCE));

        let polling_interval: i64 = parse_or(&get, "POLLER_POLLING_INTERVAL", 60)?;
        if polling_interval < 1 {
            return Err(PollerError::Config("POLLER_POLLING_INTERVAL must be positive".to_string()));
        }

        let max_requests_per_minute: i64 = parse_or(&get, "POLLER_MAX_REQUESTS_PER_MINUTE", 100)?;
        let max_requests_per_minute = if max_requests_per_minute <= 0 {
            100
        } else {
            u32::try_from(max_requests_per_minute).map_err(|_| {
                PollerError::Config("POLLER_MAX_REQUESTS_PER_MINUTE is too large".to_string())
            })?
        };

        let page_limit: usize = parse_or(&get, "POLLER_PAGE_LIMIT", MAX_PAGE_LIMIT)?;

        let defaults = ClientConfig::default();
        let client = ClientConfig {
            client_id,
            client_secret,
            user_agent,
            base_url: get("POLLER_API_BASE_URL").unwrap_or(defaults.base_url.clone()),
            auth_url: get("POLLER_AUTH_URL").unwrap_or(defaults.auth_url.clone()),
            max_requests_per_minute,
            ..defaults
        };

        Ok(Self {
            client,
            sources,
            polling_interval: Duration::from_secs(polling_interval as u64),
            page_limit,
            database_path: PathBuf::from(get("DATABASE_PATH").unwrap_or_else(|| "./poller.db".to_string())),
            server_port: parse_or(&get, "SERVER_PORT", 8080)?,
        })
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            sources: self.sources.clone(),
            initial_interval: self.polling_interval,
            page_limit: self.page_limit,
            policy: self.client.rate_policy(),
            ..PipelineConfig::default()
        }
    }
}

fn required<G>(get: &G, key: &str) -> Result<String>
where
    G: Fn(&str) -> Option<String>,
{
    get(key).ok_or_else(|| PollerError::Config(format!("{} environment variable is required", key)))
}

fn parse_or<G, T>(get: &G, key: &str, default: T) -> Result<T>
where
    G: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match get(key) {
        Some(raw) => raw
            .parse()
            .map_err(|_| PollerError::Config(format!("{} must be a number, got {:?}", key, raw))),
        None => Ok(default),
    }
}

/// Split a comma separated list, dropping blanks. Falls back to the default
/// source when nothing is left.
pub fn parse_sources(raw: &str) -> Vec<String> {
    let sources: Vec<String> = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();

    if sources.is_empty() {
        vec![DEFAULT_SOURCE.to_string()]
    } else {
        sources
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    const CREDENTIALS: [(&str, &str); 3] = [
        ("POLLER_CLIENT_ID", "id"),
        ("POLLER_CLIENT_SECRET", "secret"),
        ("POLLER_USER_AGENT", "linux:source-poller:0.1 (by /u/someone)"),
    ];

    #[test]
    fn defaults_apply_when_only_credentials_are_set() {
        let config = AppConfig::from_lookup(lookup(&CREDENTIALS)).unwrap();

        assert_eq!(config.sources, vec!["rust"]);
        assert_eq!(config.polling_interval, Duration::from_secs(60));
        assert_eq!(config.client.max_requests_per_minute, 100);
        assert_eq!(config.page_limit, 100);
        assert_eq!(config.client.base_url, "https://oauth.reddit.com");
        assert_eq!(config.database_path, PathBuf::from("./poller.db"));
        assert_eq!(config.server_port, 8080);
        assert_eq!(config.pipeline_config().policy.total_allowed, 1000);
    }

    #[test]
    fn missing_credentials_are_rejected() {
        for missing in ["POLLER_CLIENT_ID", "POLLER_CLIENT_SECRET", "POLLER_USER_AGENT"] {
            let pairs: Vec<(&str, &str)> = CREDENTIALS.iter().copied().filter(|(k, _)| *k != missing).collect();
            let err = AppConfig::from_lookup(lookup(&pairs)).unwrap_err();
            assert!(err.to_string().contains(missing), "{err}");
        }
    }

    #[test]
    fn polling_interval_must_be_positive() {
        let mut pairs = CREDENTIALS.to_vec();
        pairs.push(("POLLER_POLLING_INTERVAL", "0"));
        assert!(matches!(AppConfig::from_lookup(lookup(&pairs)), Err(PollerError::Config(_))));
    }

    #[test]
    fn non_positive_request_budget_falls_back() {
        let mut pairs = CREDENTIALS.to_vec();
        pairs.push(("POLLER_MAX_REQUESTS_PER_MINUTE", "-5"));
        let config = AppConfig::from_lookup(lookup(&pairs)).unwrap();
        assert_eq!(config.client.max_requests_per_minute, 100);
    }

    #[test]
    fn malformed_numbers_are_rejected() {
        let mut pairs = CREDENTIALS.to_vec();
        pairs.push(("SERVER_PORT", "eighty"));
        assert!(matches!(AppConfig::from_lookup(lookup(&pairs)), Err(PollerError::Config(_))));
    }

    #[test]
    fn sources_are_trimmed_and_blanks_dropped() {
        assert_eq!(parse_sources(" rust , golang,, ,python "), vec!["rust", "golang", "python"]);
        assert_eq!(parse_sources(" , "), vec!["rust"]);
    }

    #[test]
    fn cli_defaults() {
        let cli = Cli::parse_from(["source-poller"]);
        assert_eq!(cli.log_level, "info");

        let cli = Cli::parse_from(["source-poller", "--log-level", "debug", "--env-file", "config/dev.env"]);
        assert_eq!(cli.log_level, "debug");
        assert_eq!(cli.env_file, PathBuf::from("config/dev.env"));
        assert!(Cli::try_parse_from(["source-poller", "--log-level", "loud"]).is_err());
    }
}
