use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use logsift_logs::{CategorySet, MatchCategory, RankingWeights};
use logsift_store::{DEFAULT_URL_TEMPLATE, RetryPolicy, StoreConfig, UrlTemplate};

/// Config file read when `--config` is not given
pub const DEFAULT_CONFIG_FILE: &str = "logsift.toml";

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub extract: ExtractConfig,
    #[serde(default)]
    pub tests: TestsConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub output: OutputConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_cache_root")]
    pub root: PathBuf,
    #[serde(default = "default_budget_bytes")]
    pub budget_bytes: u64,
}

fn default_cache_root() -> PathBuf {
    PathBuf::from("temp_logs")
}
fn default_budget_bytes() -> u64 {
    2 * 1024 * 1024 * 1024
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            root: default_cache_root(),
            budget_bytes: default_budget_bytes(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct FetchConfig {
    #[serde(default = "default_url_template")]
    pub url_template: String,
    #[serde(default = "default_attempts")]
    pub attempts: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_url_template() -> String {
    DEFAULT_URL_TEMPLATE.to_string()
}
fn default_attempts() -> u32 {
    3
}
fn default_backoff_base_ms() -> u64 {
    1000
}
fn default_timeout_secs() -> u64 {
    300
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            url_template: default_url_template(),
            attempts: default_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExtractConfig {
    #[serde(default = "default_max_total_matches")]
    pub max_total_matches: usize,
    #[serde(default = "default_context_lines")]
    pub context_lines: usize,
    #[serde(default = "default_max_line_chars")]
    pub max_line_chars: usize,
    /// Replaces the built-in categories when present
    #[serde(default)]
    pub categories: Option<Vec<MatchCategory>>,
}

fn default_max_total_matches() -> usize {
    200
}
fn default_context_lines() -> usize {
    3
}
fn default_max_line_chars() -> usize {
    300
}

impl Default for ExtractConfig {
    fn default() -> Self {
        Self {
            max_total_matches: default_max_total_matches(),
            context_lines: default_context_lines(),
            max_line_chars: default_max_line_chars(),
            categories: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct TestsConfig {
    #[serde(default = "default_max_outcomes")]
    pub max_outcomes: usize,
    #[serde(default = "default_max_message_chars")]
    pub max_message_chars: usize,
    #[serde(default = "default_probe_lines")]
    pub probe_lines: usize,
    #[serde(default = "default_min_probe_matches")]
    pub min_probe_matches: usize,
}

fn default_max_outcomes() -> usize {
    500
}
fn default_max_message_chars() -> usize {
    1000
}
fn default_probe_lines() -> usize {
    2000
}
fn default_min_probe_matches() -> usize {
    1
}

impl Default for TestsConfig {
    fn default() -> Self {
        Self {
            max_outcomes: default_max_outcomes(),
            max_message_chars: default_max_message_chars(),
            probe_lines: default_probe_lines(),
            min_probe_matches: default_min_probe_matches(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SearchConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_per_log_limit")]
    pub per_log_limit: usize,
    #[serde(default = "default_total_limit")]
    pub total_limit: usize,
    #[serde(default = "default_weight")]
    pub recency_weight: f64,
    #[serde(default = "default_weight")]
    pub density_weight: f64,
}

fn default_workers() -> usize {
    8
}
fn default_per_log_limit() -> usize {
    20
}
fn default_total_limit() -> usize {
    100
}
fn default_weight() -> f64 {
    0.5
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            per_log_limit: default_per_log_limit(),
            total_limit: default_total_limit(),
            recency_weight: default_weight(),
            density_weight: default_weight(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct OutputConfig {
    #[serde(default = "default_max_response_bytes")]
    pub max_response_bytes: usize,
}

fn default_max_response_bytes() -> usize {
    10 * 1024
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            max_response_bytes: default_max_response_bytes(),
        }
    }
}

impl Config {
    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            root: self.cache.root.clone(),
            budget_bytes: self.cache.budget_bytes,
            retry: RetryPolicy {
                attempts: self.fetch.attempts,
                backoff_base: Duration::from_millis(self.fetch.backoff_base_ms),
            },
        }
    }

    pub fn url_template(&self) -> Result<UrlTemplate> {
        UrlTemplate::new(self.fetch.url_template.clone()).map_err(Into::into)
    }

    /// The configured category set, or the built-in one
    pub fn categories(&self) -> Result<CategorySet> {
        match &self.extract.categories {
            Some(defs) => CategorySet::compile(defs).context("Invalid extract.categories"),
            None => Ok(CategorySet::defaults()),
        }
    }

    pub fn ranking_weights(&self) -> RankingWeights {
        RankingWeights {
            recency: self.search.recency_weight,
            density: self.search.density_weight,
        }
    }
}

/// Load and validate a config file. A missing default file yields defaults;
/// a missing explicit file is an error.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let config = match path {
        Some(path) => read_config(path)?,
        None => {
            let path = Path::new(DEFAULT_CONFIG_FILE);
            if path.exists() {
                read_config(path)?
            } else {
                Config::default()
            }
        }
    };
    validate(&config)?;
    Ok(config)
}

fn read_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    toml::from_str(&content).with_context(|| "Failed to parse config file")
}

fn validate(config: &Config) -> Result<()> {
    if config.cache.budget_bytes == 0 {
        anyhow::bail!("cache.budget_bytes must be > 0");
    }
    if config.fetch.attempts == 0 {
        anyhow::bail!("fetch.attempts must be >= 1");
    }
    if config.fetch.timeout_secs == 0 {
        anyhow::bail!("fetch.timeout_secs must be > 0");
    }
    config.url_template()?;

    if config.extract.max_total_matches == 0 {
        anyhow::bail!("extract.max_total_matches must be >= 1");
    }
    if config.extract.max_line_chars == 0 {
        anyhow::bail!("extract.max_line_chars must be >= 1");
    }
    if let Some(defs) = &config.extract.categories {
        if defs.is_empty() {
            anyhow::bail!("extract.categories must not be empty when present");
        }
        if let Some(def) = defs.iter().find(|d| d.max_matches == 0) {
            anyhow::bail!("extract.categories '{}': max_matches must be >= 1", def.name);
        }
    }
    config.categories()?;

    if config.tests.max_outcomes == 0 || config.tests.max_message_chars == 0 {
        anyhow::bail!("tests.max_outcomes and tests.max_message_chars must be >= 1");
    }
    if config.tests.probe_lines == 0 || config.tests.min_probe_matches == 0 {
        anyhow::bail!("tests.probe_lines and tests.min_probe_matches must be >= 1");
    }

    if config.search.workers == 0 {
        anyhow::bail!("search.workers must be >= 1");
    }
    if config.search.per_log_limit == 0 || config.search.total_limit == 0 {
        anyhow::bail!("search.per_log_limit and search.total_limit must be >= 1");
    }
    for (name, weight) in [
        ("recency_weight", config.search.recency_weight),
        ("density_weight", config.search.density_weight),
    ] {
        if !(0.0..=1.0).contains(&weight) {
            anyhow::bail!("search.{} must be in [0.0, 1.0]", name);
        }
    }

    if config.output.max_response_bytes < 256 {
        anyhow::bail!("output.max_response_bytes must be >= 256");
    }
    Ok(())
}
