use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use std::path::PathBuf;
use std::sync::Arc;

use jira_conduit::config::Config;
use jira_conduit::jira::{CachedJiraClient, JiraClient, Transport};
use jira_conduit::observability::{Failure, TracingMetrics};

const SERVER_INFO_PATH: &str = "/rest/api/3/serverInfo";

#[derive(Parser, Debug)]
#[command(name = "jira-conduit")]
#[command(about = "Cache-aware Jira REST client")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/jira-conduit/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Execute one REST call through the cache
  Call {
    /// HTTP method (GET, POST, PUT, DELETE, ...)
    method: String,
    /// Logical operation name, e.g. issues/get
    operation: String,
    /// API path, e.g. /rest/api/3/issue/PROJ-1
    path: String,
    /// Query parameter as key=value (repeatable)
    #[arg(short, long = "query")]
    query: Vec<String>,
    /// JSON request body
    #[arg(long)]
    body: Option<String>,
    /// Issue the call this many times (shows cache behaviour)
    #[arg(long, default_value_t = 1)]
    repeat: u32,
  },
  /// Probe the Jira server and print the health status
  Health {
    /// Keep probing at the configured interval
    #[arg(long)]
    watch: bool,
  },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let config = Config::load(args.config.as_deref())?;
  let _log_guard = jira_conduit::logging::init(&config.logging)?;

  let jira = JiraClient::new(&config)?;
  let transport: Arc<dyn Transport> = Arc::new(jira.clone());
  let client = CachedJiraClient::from_config(&config, transport, Arc::new(TracingMetrics))?;

  match args.command {
    Command::Call {
      method,
      operation,
      path,
      query,
      body,
      repeat,
    } => {
      let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes())
        .map_err(|e| eyre!("Invalid HTTP method {}: {}", method, e))?;

      let mut request = jira.request(method, &operation, &path)?;
      for pair in &query {
        let (k, v) = pair
          .split_once('=')
          .ok_or_else(|| eyre!("Query parameter must be key=value: {}", pair))?;
        request = request.with_query(k, v);
      }
      if let Some(body) = body {
        let value: serde_json::Value =
          serde_json::from_str(&body).map_err(|e| eyre!("Body is not valid JSON: {}", e))?;
        request = request.with_json(&value)?;
      }

      for _ in 0..repeat.max(1) {
        match client.execute(request.clone()).await {
          Ok(response) => {
            let rendered = response
              .json::<serde_json::Value>()
              .and_then(|v| serde_json::to_string_pretty(&v))
              .unwrap_or_else(|_| response.text());
            println!("{}", rendered);
          }
          Err(e) => {
            let status = e.response.as_ref().map(|r| r.status.as_u16());
            tracing::error!(
              error_kind = %e.kind(),
              recoverable = e.is_recoverable(),
              status,
              "call failed"
            );
            return Err(eyre!("{}", e.error));
          }
        }
      }

      let stats = client.cache().stats();
      tracing::info!(
        hits = stats.hit_count,
        misses = stats.miss_count,
        entries = stats.total_entries,
        bytes = stats.total_bytes,
        hit_ratio = stats.hit_ratio(),
        "cache stats"
      );
    }
    Command::Health { watch } => loop {
      let request = jira.request(Method::GET, "serverInfo", SERVER_INFO_PATH)?;
      let status = client
        .recorder()
        .perform_health_check(|| async {
          client
            .execute(request)
            .await
            .map(|_| ())
            .map_err(|e| Failure::from(e.error))
        })
        .await;
      println!("{}", serde_json::to_string_pretty(&status)?);

      if !watch {
        break;
      }
      tokio::time::sleep(config.observability.health_check_interval).await;
    },
  }

  Ok(())
}
