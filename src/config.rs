//! Harness configuration: TOML file plus environment overrides.
//!
//! Resolution order for every setting: environment variable, then the
//! config file, then the built-in default.
//!
//! ```toml
//! [gateway]
//! call_timeout_secs = 60
//!
//! [run]
//! deadline_secs = 300
//!
//! [[lanes]]
//! id = "deep"
//! max_solver_parallelism = 5
//! budget_nanodollars = 50000000
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::chunking::ChunkingParams;
use crate::lanes::{LaneConfig, LaneError, LaneRegistry};

pub const DEFAULT_OPENROUTER_URL: &str = "https://openrouter.ai/api/v1";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid value for {key}: {value}")]
    Env { key: &'static str, value: String },
    #[error("invalid config: {0}")]
    Invalid(String),
    #[error(transparent)]
    Lane(#[from] LaneError),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    pub gateway: GatewaySettings,
    pub cache: CacheSettings,
    pub store: StoreSettings,
    pub ledger: LedgerSettings,
    pub run: RunSettings,
    pub lanes: Vec<LaneConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewaySettings {
    /// Never written back out.
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub base_url: String,
    /// Extra OpenAI-compatible endpoints tried in rotation after `base_url`.
    pub fallback_base_urls: Vec<String>,
    /// reqwest client timeout, a backstop behind `call_timeout_secs`.
    pub http_timeout_secs: u64,
    pub call_timeout_secs: u64,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub referer: Option<String>,
    pub app_title: Option<String>,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: DEFAULT_OPENROUTER_URL.into(),
            fallback_base_urls: Vec::new(),
            http_timeout_secs: 120,
            call_timeout_secs: 90,
            max_retries: 2,
            retry_base_delay_ms: 1_000,
            referer: None,
            app_title: Some("quorum-harness".into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub path: PathBuf,
    pub default_ttl_secs: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            path: PathBuf::from(".quorum/response_cache.sqlite"),
            default_ttl_secs: 7 * 24 * 3_600,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    pub path: PathBuf,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            path: PathBuf::from(".quorum/runs.sqlite"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerSettings {
    /// Defaults to the run store's database.
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunSettings {
    /// Overall deadline for one run, independent of per-call timeouts.
    pub deadline_secs: u64,
    /// Extra attempts when a pass's reply fails schema validation.
    pub max_schema_retries: u32,
    pub schema_retry_delay_ms: u64,
    pub max_goal_chars: usize,
    pub max_context_bytes: usize,
    /// Chunks handed to the retriever across all caller documents.
    pub max_evidence_chunks: usize,
    pub chunking: ChunkingParams,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            deadline_secs: 600,
            max_schema_retries: 2,
            schema_retry_delay_ms: 250,
            max_goal_chars: 20_000,
            max_context_bytes: 256 * 1024,
            max_evidence_chunks: 40,
            chunking: ChunkingParams::default(),
        }
    }
}

impl HarnessConfig {
    /// Load from `path`, else `$QUORUM_CONFIG`, else defaults; then apply
    /// environment overrides and validate.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let env_path = std::env::var("QUORUM_CONFIG").ok().map(PathBuf::from);
        let mut config = match path.map(Path::to_path_buf).or(env_path) {
            Some(p) => Self::from_file(&p)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }

    /// Apply environment overrides through `lookup` (normally `std::env::var`).
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("QUORUM_CACHE_PATH") {
            self.cache.path = PathBuf::from(v);
        }
        if let Some(v) = lookup("QUORUM_STORE_PATH") {
            self.store.path = PathBuf::from(v);
        }
        if let Some(v) = lookup("QUORUM_RUN_DEADLINE_SECS") {
            self.run.deadline_secs = parse_env("QUORUM_RUN_DEADLINE_SECS", v)?;
        }
        if let Some(v) = lookup("OPENROUTER_API_KEY") {
            if !v.trim().is_empty() {
                self.gateway.api_key = Some(v);
            }
        }
        if let Some(v) = lookup("OPENROUTER_BASE_URL") {
            self.gateway.base_url = v;
        }
        if let Some(v) = lookup("OPENROUTER_TIMEOUT_SECONDS") {
            self.gateway.http_timeout_secs = parse_env("OPENROUTER_TIMEOUT_SECONDS", v)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.gateway.call_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "gateway.call_timeout_secs must be positive".into(),
            ));
        }
        if self.run.deadline_secs <= self.gateway.call_timeout_secs {
            return Err(ConfigError::Invalid(format!(
                "run.deadline_secs ({}) must exceed gateway.call_timeout_secs ({})",
                self.run.deadline_secs, self.gateway.call_timeout_secs
            )));
        }
        ChunkingParams::new(
            self.run.chunking.target_tokens,
            self.run.chunking.min_tokens,
            self.run.chunking.max_tokens,
            self.run.chunking.overlap_tokens,
        )
        .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        self.lane_registry()?;
        Ok(())
    }

    pub fn lane_registry(&self) -> Result<LaneRegistry, ConfigError> {
        Ok(LaneRegistry::new(self.lanes.clone())?)
    }

    pub fn ledger_path(&self) -> &Path {
        self.ledger.path.as_deref().unwrap_or(&self.store.path)
    }
}

fn parse_env<T: std::str::FromStr>(key: &'static str, value: String) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::Env { key, value })
}
