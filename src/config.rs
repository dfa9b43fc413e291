use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub connections: BTreeMap<String, ConnectionConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// How long a writer waits on a locked database.
    #[serde(default = "default_busy_timeout_secs")]
    pub busy_timeout_secs: u64,
}

impl DbConfig {
    /// Defaults for a database at `path`.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            max_connections: default_max_connections(),
            busy_timeout_secs: default_busy_timeout_secs(),
        }
    }
}

fn default_max_connections() -> u32 {
    5
}
fn default_busy_timeout_secs() -> u64 {
    10
}

/// Client and worker-pool limits shared by every connection.
#[derive(Debug, Deserialize, Clone)]
pub struct ApiConfig {
    #[serde(default = "default_requests_per_hour")]
    pub requests_per_hour: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            requests_per_hour: default_requests_per_hour(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
            max_in_flight: default_max_in_flight(),
            concurrency: default_concurrency(),
        }
    }
}

fn default_requests_per_hour() -> u32 {
    18000
}
fn default_max_retries() -> u32 {
    3
}
fn default_timeout_secs() -> u64 {
    120
}
fn default_max_in_flight() -> usize {
    16
}
fn default_concurrency() -> usize {
    8
}

/// One configured connection: which connector to run and the scope it runs on.
#[derive(Debug, Deserialize, Clone)]
pub struct ConnectionConfig {
    pub connector: String,
    pub connection_id: u64,
    pub scope_id: String,
    pub endpoint: String,
    /// Name of the environment variable holding the API token.
    #[serde(default)]
    pub token_env: Option<String>,
    /// Basic-auth user name, for connectors that authenticate that way.
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub organization: Option<String>,
    /// Explicit per-connection ceiling; overrides calibration.
    #[serde(default)]
    pub rate_limit_per_hour: Option<u32>,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

fn default_page_size() -> usize {
    100
}

impl ConnectionConfig {
    /// Read the token from the environment variable named by `token_env`.
    pub fn token(&self) -> Result<Option<String>> {
        match &self.token_env {
            None => Ok(None),
            Some(var) => std::env::var(var)
                .map(Some)
                .with_context(|| format!("Environment variable {} is not set", var)),
        }
    }
}

impl Config {
    pub fn connection(&self, name: &str) -> Result<&ConnectionConfig> {
        self.connections.get(name).with_context(|| {
            format!(
                "Unknown connection: '{}'. Configured: {}",
                name,
                self.connections
                    .keys()
                    .cloned()
                    .collect::<Vec<_>>()
                    .join(", ")
            )
        })
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.db.max_connections == 0 {
        anyhow::bail!("db.max_connections must be > 0");
    }
    if config.api.requests_per_hour == 0 {
        anyhow::bail!("api.requests_per_hour must be > 0");
    }
    if config.api.max_in_flight == 0 {
        anyhow::bail!("api.max_in_flight must be > 0");
    }
    if config.api.concurrency == 0 {
        anyhow::bail!("api.concurrency must be > 0");
    }
    if config.api.timeout_secs == 0 {
        anyhow::bail!("api.timeout_secs must be > 0");
    }

    for (name, conn) in &config.connections {
        if conn.connector.is_empty() {
            anyhow::bail!("connections.{}.connector must not be empty", name);
        }
        if conn.scope_id.is_empty() {
            anyhow::bail!("connections.{}.scope_id must not be empty", name);
        }
        if !conn.endpoint.starts_with("http://") && !conn.endpoint.starts_with("https://") {
            anyhow::bail!(
                "connections.{}.endpoint must be an http(s) URL, got '{}'",
                name,
                conn.endpoint
            );
        }
        if conn.rate_limit_per_hour == Some(0) {
            anyhow::bail!("connections.{}.rate_limit_per_hour must be > 0", name);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml_str: &str) -> Result<Config> {
        let config: Config = toml::from_str(toml_str)?;
        validate(&config)?;
        Ok(config)
    }

    #[test]
    fn test_defaults() {
        let config = parse(
            r#"
            [db]
            path = "./data/ingest.sqlite"
            "#,
        )
        .unwrap();
        assert_eq!(config.api.requests_per_hour, 18000);
        assert_eq!(config.api.max_retries, 3);
        assert_eq!(config.api.timeout_secs, 120);
        assert_eq!(config.db.max_connections, 5);
        assert_eq!(config.db.busy_timeout_secs, 10);
        assert!(config.connections.is_empty());
    }

    #[test]
    fn test_connection_parses() {
        let config = parse(
            r#"
            [db]
            path = "./data/ingest.sqlite"

            [connections.copilot]
            connector = "gh-copilot"
            connection_id = 1
            scope_id = "octo-org"
            endpoint = "https://api.github.com/"
            token_env = "GITHUB_TOKEN"
            organization = "octo-org"
            rate_limit_per_hour = 5000
            "#,
        )
        .unwrap();
        let conn = config.connection("copilot").unwrap();
        assert_eq!(conn.connector, "gh-copilot");
        assert_eq!(conn.rate_limit_per_hour, Some(5000));
        assert_eq!(conn.page_size, 100);
        assert!(config.connection("missing").is_err());
    }

    #[test]
    fn test_rejects_bad_endpoint() {
        let err = parse(
            r#"
            [db]
            path = "x.sqlite"

            [connections.j]
            connector = "jira"
            connection_id = 1
            scope_id = "10"
            endpoint = "ftp://jira"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("endpoint"));
    }

    #[test]
    fn test_rejects_zero_rate() {
        assert!(parse(
            r#"
            [db]
            path = "x.sqlite"
            [api]
            requests_per_hour = 0
            "#,
        )
        .is_err());
    }
}
