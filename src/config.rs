use base64::{engine::general_purpose::STANDARD, Engine as _};
use color_eyre::{eyre::eyre, Result};
use reqwest::header::HeaderValue;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub jira: JiraConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub observability: ObservabilityConfig,
  #[serde(default)]
  pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AuthType {
  /// Auto-detect based on URL: .atlassian.net = cloud, else on-premise
  #[default]
  Auto,
  /// Jira Cloud - uses Basic auth (email + API token as password)
  Cloud,
  /// Jira On-premise - uses Bearer auth (PAT)
  Onpremise,
}

impl AuthType {
  /// Resolve `Auto` against the instance URL.
  pub fn resolve(self, url: &str) -> AuthType {
    match self {
      AuthType::Auto => {
        let host = url::Url::parse(url)
          .ok()
          .and_then(|u| u.host_str().map(str::to_lowercase))
          .unwrap_or_default();
        if host.ends_with(".atlassian.net") {
          AuthType::Cloud
        } else {
          AuthType::Onpremise
        }
      }
      other => other,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct JiraConfig {
  pub url: String,
  /// Account email, required for cloud (Basic) authentication
  #[serde(default)]
  pub email: Option<String>,
  /// Authentication type: auto, cloud, or onpremise
  #[serde(default)]
  pub auth_type: AuthType,
  /// Upper bound for a single upstream call
  #[serde(
    default = "default_request_timeout",
    rename = "request_timeout_secs",
    deserialize_with = "deserialize_secs"
  )]
  pub request_timeout: Duration,
}

fn default_request_timeout() -> Duration {
  Duration::from_secs(30)
}

/// Where cache entries are kept.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
  #[default]
  Memory,
  Sqlite,
  None,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  pub enabled: bool,
  pub backend: CacheBackend,
  /// SQLite database file (defaults to the platform data dir)
  pub sqlite_path: Option<PathBuf>,
  /// Capacity of the in-memory backend
  pub max_entries: Option<usize>,
  #[serde(deserialize_with = "deserialize_secs")]
  pub default_ttl: Duration,
  #[serde(deserialize_with = "deserialize_secs")]
  pub search_ttl: Duration,
  #[serde(deserialize_with = "deserialize_secs")]
  pub lookup_ttl: Duration,
  /// Per-operation TTL overrides, in seconds
  #[serde(deserialize_with = "deserialize_secs_map")]
  pub operation_ttls: HashMap<String, Duration>,
  /// Send If-None-Match / If-Modified-Since when an entry is held
  pub enable_etags: bool,
  /// When non-empty, only these operations are cached
  pub cacheable_operations: Vec<String>,
  pub non_cacheable_operations: Vec<String>,
  /// Request headers that partition the cache (credential, representation)
  pub vary_headers: Vec<String>,
  /// Mutation operation -> operation patterns to drop after it succeeds
  pub invalidation_rules: HashMap<String, Vec<String>>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    let secs = |(op, s): (&str, u64)| (op.to_string(), Duration::from_secs(s));
    let rule = |(op, targets): (&str, &[&str])| {
      (
        op.to_string(),
        targets.iter().map(|t| t.to_string()).collect::<Vec<_>>(),
      )
    };

    Self {
      enabled: true,
      backend: CacheBackend::Memory,
      sqlite_path: None,
      max_entries: Some(10_000),
      default_ttl: Duration::from_secs(300),
      search_ttl: Duration::from_secs(120),
      lookup_ttl: Duration::from_secs(600),
      operation_ttls: [
        ("issues/get", 600),
        ("issues/search", 120),
        ("issues/transitions", 1800),
        ("projects/get", 1800),
        ("projects/list", 900),
        ("workflows/list", 3600),
        ("workflows/get", 3600),
        ("issues/comments/list", 60),
        ("myself", 600),
        ("serverInfo", 3600),
      ]
      .into_iter()
      .map(secs)
      .collect(),
      enable_etags: true,
      cacheable_operations: Vec::new(),
      non_cacheable_operations: vec!["permissions/mine".into(), "users/search".into()],
      vary_headers: vec!["authorization".into(), "accept".into()],
      invalidation_rules: [
        (
          "issues/create",
          &["issues/search", "projects/*"][..],
        ),
        (
          "issues/update",
          &["issues/get", "issues/search", "issues/transitions"][..],
        ),
        ("issues/delete", &["issues/get", "issues/search"][..]),
        (
          "issues/comments/add",
          &["issues/get", "issues/comments/*"][..],
        ),
        (
          "issues/comments/update",
          &["issues/get", "issues/comments/*"][..],
        ),
        (
          "issues/transition",
          &["issues/get", "issues/transitions", "issues/search"][..],
        ),
        ("issues/assign", &["issues/get", "issues/search"][..]),
      ]
      .into_iter()
      .map(rule)
      .collect(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
  /// Log a debug line when each operation starts
  pub debug_mode: bool,
  #[serde(deserialize_with = "deserialize_secs")]
  pub health_check_timeout: Duration,
  #[serde(deserialize_with = "deserialize_secs")]
  pub health_check_interval: Duration,
  pub enable_metrics: bool,
  pub metrics_namespace: String,
  /// Count classified errors in `<namespace>_errors_total`
  pub enable_error_tracking: bool,
}

impl Default for ObservabilityConfig {
  fn default() -> Self {
    Self {
      debug_mode: false,
      health_check_timeout: Duration::from_secs(30),
      health_check_interval: Duration::from_secs(300),
      enable_metrics: true,
      metrics_namespace: "jira".to_string(),
      enable_error_tracking: true,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
  /// Default filter directive when RUST_LOG is unset
  pub level: String,
  /// Also write a daily-rolling log file here
  pub directory: Option<PathBuf>,
}

impl Default for LoggingConfig {
  fn default() -> Self {
    Self {
      level: "info".to_string(),
      directory: None,
    }
  }
}

fn deserialize_secs<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
  D: serde::Deserializer<'de>,
{
  let secs = u64::deserialize(deserializer)?;
  Ok(Duration::from_secs(secs))
}

fn deserialize_secs_map<'de, D>(deserializer: D) -> Result<HashMap<String, Duration>, D::Error>
where
  D: serde::Deserializer<'de>,
{
  let m: HashMap<String, u64> = HashMap::deserialize(deserializer)?;
  Ok(
    m.into_iter()
      .map(|(k, v)| (k, Duration::from_secs(v)))
      .collect(),
  )
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./jira-conduit.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/jira-conduit/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/jira-conduit/config.yaml\n\
                 See config.example.yaml for the format."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("jira-conduit.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("jira-conduit").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  /// Parse a configuration document.
  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))?;
    Ok(config)
  }

  /// Get the Jira API token from environment variables.
  ///
  /// Checks JIRA_CONDUIT_TOKEN first, then JIRA_API_TOKEN as fallback.
  pub fn get_api_token() -> Result<String> {
    std::env::var("JIRA_CONDUIT_TOKEN")
      .or_else(|_| std::env::var("JIRA_API_TOKEN"))
      .map_err(|_| {
        eyre!(
          "Jira API token not found. Set JIRA_CONDUIT_TOKEN or JIRA_API_TOKEN environment variable."
        )
      })
  }

  /// Build the opaque `Authorization` header value for this instance.
  pub fn authorization(&self, token: &str) -> Result<HeaderValue> {
    let raw = match self.jira.auth_type.resolve(&self.jira.url) {
      AuthType::Cloud => {
        let email = self
          .jira
          .email
          .as_deref()
          .ok_or_else(|| eyre!("jira.email is required for cloud authentication"))?;
        format!("Basic {}", STANDARD.encode(format!("{}:{}", email, token)))
      }
      _ => format!("Bearer {}", token),
    };

    let mut value =
      HeaderValue::from_str(&raw).map_err(|e| eyre!("Invalid credential characters: {}", e))?;
    value.set_sensitive(true);
    Ok(value)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  const EXAMPLE: &str = r#"
jira:
  url: https://example.atlassian.net
  email: dev@example.com
  request_timeout_secs: 10
cache:
  backend: sqlite
  search_ttl: 30
  operation_ttls:
    issues/get: 900
  non_cacheable_operations: [users/search]
observability:
  health_check_timeout: 5
  metrics_namespace: conduit
"#;

  #[test]
  fn test_parse_full_config() {
    let config = Config::from_yaml(EXAMPLE).unwrap();

    assert_eq!(config.jira.request_timeout, Duration::from_secs(10));
    assert_eq!(config.cache.backend, CacheBackend::Sqlite);
    assert_eq!(config.cache.search_ttl, Duration::from_secs(30));
    assert_eq!(
      config.cache.operation_ttls.get("issues/get"),
      Some(&Duration::from_secs(900))
    );
    assert_eq!(config.cache.non_cacheable_operations, vec!["users/search"]);
    assert_eq!(config.observability.health_check_timeout, Duration::from_secs(5));
    assert_eq!(config.observability.metrics_namespace, "conduit");
  }

  #[test]
  fn test_missing_sections_use_defaults() {
    let config = Config::from_yaml("jira:\n  url: https://jira.internal\n").unwrap();

    assert!(config.cache.enabled);
    assert!(config.cache.enable_etags);
    assert_eq!(config.cache.default_ttl, Duration::from_secs(300));
    assert_eq!(config.cache.vary_headers, vec!["authorization", "accept"]);
    assert!(config.cache.invalidation_rules.contains_key("issues/update"));
    assert_eq!(config.observability.health_check_timeout, Duration::from_secs(30));
    assert_eq!(config.jira.request_timeout, Duration::from_secs(30));
    assert_eq!(config.logging.level, "info");
  }

  #[test]
  fn test_auth_type_resolution() {
    assert_eq!(
      AuthType::Auto.resolve("https://acme.atlassian.net"),
      AuthType::Cloud
    );
    assert_eq!(
      AuthType::Auto.resolve("https://jira.acme.corp"),
      AuthType::Onpremise
    );
    assert_eq!(
      AuthType::Onpremise.resolve("https://acme.atlassian.net"),
      AuthType::Onpremise
    );
  }

  #[test]
  fn test_authorization_header() {
    let cloud = Config::from_yaml(EXAMPLE).unwrap();
    let value = cloud.authorization("secret").unwrap();
    assert!(value.is_sensitive());
    assert!(value.to_str().unwrap().starts_with("Basic "));

    let onprem = Config::from_yaml("jira:\n  url: https://jira.internal\n").unwrap();
    assert_eq!(
      onprem.authorization("pat").unwrap().to_str().unwrap(),
      "Bearer pat"
    );
  }

  #[test]
  fn test_cloud_requires_email() {
    let config =
      Config::from_yaml("jira:\n  url: https://x.atlassian.net\n  auth_type: cloud\n").unwrap();
    assert!(config.authorization("t").is_err());
  }
}
