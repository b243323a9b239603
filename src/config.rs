use crate::constants::{
    CACHED_STREAM_PATH, CACHE_CHECK_PATH, DEFAULT_BASE_URL, LIVE_STREAM_PATH,
    RESULTS_PATH, RESULT_FETCH_BASE_DELAY_MS, RESULT_FETCH_MAX_ATTEMPTS,
};
use crate::hardening::RetryPolicy;
use crate::types::*;
use clap::{Parser, Subcommand};
use reqwest::Url;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about = "Watch competitive analyses stream in", long_about = None)]
pub struct Args {
    #[arg(long, env = "VANTAGE_BASE_URL", default_value = DEFAULT_BASE_URL, global = true)]
    pub base_url: String,
    #[arg(long, env = "VANTAGE_API_TOKEN", global = true, hide_env_values = true)]
    pub api_token: Option<String>,
    #[arg(long, env = "VANTAGE_CONNECT_TIMEOUT_SECS", default_value_t = 10, global = true)]
    pub connect_timeout_secs: u64,
    /// Timeout for one-shot requests (cache check, result fetch). Streams have none.
    #[arg(long, env = "VANTAGE_REQUEST_TIMEOUT_SECS", default_value_t = 30, global = true)]
    pub request_timeout_secs: u64,
    #[arg(long, env = "VANTAGE_MAX_RETRIES", default_value_t = RESULT_FETCH_MAX_ATTEMPTS, global = true)]
    pub max_retries: u32,
    #[arg(long, default_value_t = RESULT_FETCH_BASE_DELAY_MS, global = true)]
    pub retry_base_delay_ms: u64,
    /// Directory for daily-rotated log files. Stderr only when unset.
    #[arg(long, env = "VANTAGE_LOG_DIR", global = true)]
    pub log_dir: Option<PathBuf>,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Stream an analysis to completion, printing every state change.
    Watch {
        #[arg(long, value_delimiter = ',', required = true)]
        competitors: Vec<String>,
        #[arg(long)]
        focus_area: String,
        /// Skip the cache check and go straight to live computation.
        #[arg(long, default_value_t = false)]
        live: bool,
        #[arg(long, default_value_t = false)]
        research: bool,
        /// Reuse an existing analysis id instead of deriving a new one.
        #[arg(long)]
        analysis_id: Option<String>,
        /// Fetch and print the finished result after completion.
        #[arg(long, default_value_t = false)]
        fetch: bool,
        /// Write the event log as NDJSON when the watch ends.
        #[arg(long)]
        export_log: Option<PathBuf>,
    },
    /// Ask the backend whether a finished result already exists.
    Probe {
        #[arg(long, value_delimiter = ',', required = true)]
        competitors: Vec<String>,
        #[arg(long)]
        focus_area: String,
    },
    /// Retrieve the finished payload of an analysis.
    Fetch { analysis_id: String },
    /// Fold an exported event log and print the resulting state.
    Replay { path: PathBuf },
    /// Serve a simulated backend for local development.
    Simulate {
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        #[arg(long, default_value_t = 8000)]
        port: u16,
        #[arg(long, default_value_t = 150)]
        step_delay_ms: u64,
    },
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: Url,
    pub api_token: Option<String>,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
}

impl ClientConfig {
    pub fn new(base_url: &str) -> Result<Self> {
        let base_url = Url::parse(base_url)
            .map_err(|e| VantageError::Validation(format!("invalid base url {:?}: {}", base_url, e)))?;
        if base_url.cannot_be_a_base() {
            return Err(VantageError::Validation(format!("base url {} cannot carry paths", base_url)).into());
        }
        Ok(Self {
            base_url,
            api_token: None,
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            max_retries: RESULT_FETCH_MAX_ATTEMPTS,
            retry_base_delay_ms: RESULT_FETCH_BASE_DELAY_MS,
        })
    }

    pub fn from_args(args: &Args) -> Result<Self> {
        let mut config = Self::new(&args.base_url)?;
        config.api_token = args.api_token.clone().filter(|t| !t.is_empty());
        config.connect_timeout = Duration::from_secs(args.connect_timeout_secs);
        config.request_timeout = Duration::from_secs(args.request_timeout_secs);
        config.max_retries = args.max_retries;
        config.retry_base_delay_ms = args.retry_base_delay_ms;
        Ok(config)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, self.retry_base_delay_ms)
    }

    /// HTTP client shared by streams and one-shot calls. No overall timeout is
    /// set here because streams stay open until a terminal event.
    pub fn build_http_client(&self) -> Result<reqwest::Client> {
        Ok(reqwest::Client::builder()
            .connect_timeout(self.connect_timeout)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Some(Duration::from_secs(60)))
            .build()?)
    }

    pub fn cached_stream_url(&self, id: &AnalysisId, request: &AnalysisRequest) -> Result<Url> {
        let mut url = self.endpoint(CACHED_STREAM_PATH, Some(id))?;
        url.query_pairs_mut()
            .append_pair("competitors", &request.competitors.join(","))
            .append_pair("focus_area", &request.focus_area);
        Ok(url)
    }

    pub fn live_stream_url(&self, id: &AnalysisId, research_enabled: bool) -> Result<Url> {
        let mut url = self.endpoint(LIVE_STREAM_PATH, Some(id))?;
        url.query_pairs_mut()
            .append_pair("research", if research_enabled { "true" } else { "false" });
        Ok(url)
    }

    pub fn cache_check_url(&self) -> Result<Url> {
        self.endpoint(CACHE_CHECK_PATH, None)
    }

    pub fn result_url(&self, id: &AnalysisId) -> Result<Url> {
        self.endpoint(RESULTS_PATH, Some(id))
    }

    fn endpoint(&self, path: &str, id: Option<&AnalysisId>) -> Result<Url> {
        let mut url = self.base_url.clone();
        {
            let mut segments = url.path_segments_mut().map_err(|_| {
                VantageError::Validation(format!("base url {} cannot carry paths", self.base_url))
            })?;
            segments.pop_if_empty();
            for part in path.split('/').filter(|p| !p.is_empty()) {
                segments.push(part);
            }
            if let Some(id) = id {
                segments.push(id.as_str());
            }
        }
        Ok(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(base: &str) -> ClientConfig {
        match ClientConfig::new(base) {
            Ok(c) => c,
            Err(e) => panic!("bad base url {}: {}", base, e),
        }
    }

    fn request() -> AnalysisRequest {
        match AnalysisRequest::new(["Acme Health", "Globex"], "Rare Disease") {
            Ok(r) => r,
            Err(e) => panic!("bad request: {}", e),
        }
    }

    #[test]
    fn test_cached_stream_url_encodes_query() {
        let cfg = config("http://localhost:8000");
        let id = AnalysisId::from("abc-123");
        let url = match cfg.cached_stream_url(&id, &request()) {
            Ok(u) => u,
            Err(e) => panic!("url failed: {}", e),
        };
        assert_eq!(url.path(), "/api/stream/cached/abc-123");
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert_eq!(
            pairs,
            vec![
                ("competitors".to_string(), "acme health,globex".to_string()),
                ("focus_area".to_string(), "rare disease".to_string()),
            ]
        );
    }

    #[test]
    fn test_base_path_prefix_is_preserved() {
        let cfg = config("https://example.com/dashboard/");
        let url = match cfg.live_stream_url(&AnalysisId::from("a/b"), true) {
            Ok(u) => u,
            Err(e) => panic!("url failed: {}", e),
        };
        assert_eq!(url.path(), "/dashboard/api/stream/a%2Fb");
        assert_eq!(url.query(), Some("research=true"));

        let check = match cfg.cache_check_url() {
            Ok(u) => u,
            Err(e) => panic!("url failed: {}", e),
        };
        assert_eq!(check.as_str(), "https://example.com/dashboard/api/cache/check");
    }

    #[test]
    fn test_rejects_bad_base_urls() {
        assert!(ClientConfig::new("not a url").is_err());
        assert!(ClientConfig::new("mailto:someone@example.com").is_err());
    }

    #[test]
    fn test_args_parse_watch_with_env_defaults() {
        let args = match Args::try_parse_from([
            "vantage",
            "--base-url",
            "http://10.0.0.5:9000",
            "watch",
            "--competitors",
            "acme,globex",
            "--focus-area",
            "oncology",
            "--live",
        ]) {
            Ok(a) => a,
            Err(e) => panic!("parse failed: {}", e),
        };
        let cfg = match ClientConfig::from_args(&args) {
            Ok(c) => c,
            Err(e) => panic!("config failed: {}", e),
        };
        assert_eq!(cfg.base_url.as_str(), "http://10.0.0.5:9000/");
        match args.command {
            Command::Watch {
                competitors, live, ..
            } => {
                assert_eq!(competitors, vec!["acme".to_string(), "globex".to_string()]);
                assert!(live);
            }
            other => panic!("Expected watch, got {:?}", other),
        }
    }
}
