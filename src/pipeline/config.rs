//! Run configuration for the generation orchestrator.
//!
//! Values are layered: defaults, then an optional YAML file, then
//! `TRAJFORGE_*` environment variables, then command-line flags. The result
//! is validated once, before anything is dispatched.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::dataset::DistributionSpec;
use crate::error::ConfigError;
use crate::llm::DEFAULT_API_BASE;
use crate::tools::registry::DEFAULT_TOOL_TIMEOUT_SECS;
use crate::trajectory::driver::DEFAULT_COMPLETION_TIMEOUT_SECS;
use crate::trajectory::{Limits, RetryPolicy, RolloutSettings};

/// Default checkpoint log location.
pub const DEFAULT_CHECKPOINT_PATH: &str = "trajectories.jsonl";

/// Environment variables consulted for the API key, in order.
pub const API_KEY_ENV_VARS: &[&str] = &["OPENAI_API_KEY", "OPENROUTER_API_KEY"];

/// Where the category distribution comes from.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum DistributionSource {
    /// Path to a YAML distribution file.
    File(PathBuf),
    Inline(DistributionSpec),
}

impl Default for DistributionSource {
    fn default() -> Self {
        DistributionSource::Inline(DistributionSpec::uniform())
    }
}

impl DistributionSource {
    /// Resolves the source into a validated distribution.
    pub fn load(&self) -> Result<DistributionSpec, ConfigError> {
        match self {
            DistributionSource::File(path) => DistributionSpec::from_yaml_file(path),
            DistributionSource::Inline(spec) => {
                spec.validate()?;
                Ok(spec.clone())
            }
        }
    }
}

/// Configuration for one generation run.
#[derive(Debug, Clone)]
pub struct RunConfig {
    // Input
    /// JSON Lines (or JSON array) file of task prompts.
    pub dataset_path: Option<PathBuf>,
    pub distribution: DistributionSource,
    /// Sampler seed; the same seed over the same dataset yields the same order.
    pub seed: u64,
    /// Optional subset size.
    pub limit: Option<usize>,

    // Execution
    pub workers: usize,
    pub max_turns: u32,
    pub retry: RetryPolicy,
    pub completion_timeout: Duration,
    pub tool_timeout: Duration,
    pub progress_interval: Duration,

    // Model
    pub model: String,
    pub system_prompt: Option<String>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
    pub api_base: String,
    pub api_key: Option<String>,

    // Budget
    /// Total tokens the run may consume before dispatch stops.
    pub token_budget: Option<u64>,
    pub requests_per_minute: Option<u32>,

    // Checkpointing
    pub checkpoint_path: PathBuf,
    /// Continue an existing checkpoint log instead of refusing to touch it.
    pub resume: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            dataset_path: None,
            distribution: DistributionSource::default(),
            seed: 0,
            limit: None,

            workers: 4,
            max_turns: 10,
            retry: RetryPolicy::default(),
            completion_timeout: Duration::from_secs(DEFAULT_COMPLETION_TIMEOUT_SECS),
            tool_timeout: Duration::from_secs(DEFAULT_TOOL_TIMEOUT_SECS),
            progress_interval: Duration::from_secs(30),

            model: String::new(),
            system_prompt: None,
            temperature: None,
            max_tokens: None,
            api_base: DEFAULT_API_BASE.to_string(),
            api_key: None,

            token_budget: None,
            requests_per_minute: None,

            checkpoint_path: PathBuf::from(DEFAULT_CHECKPOINT_PATH),
            resume: false,
        }
    }
}

/// On-disk form of [`RunConfig`]. Every key is optional; durations are in
/// seconds (retry delays in milliseconds).
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    dataset: Option<PathBuf>,
    distribution: Option<DistributionSource>,
    seed: Option<u64>,
    limit: Option<usize>,
    workers: Option<usize>,
    max_turns: Option<u32>,
    max_attempts: Option<u32>,
    retry_base_delay_ms: Option<u64>,
    retry_max_delay_ms: Option<u64>,
    retry_multiplier: Option<f64>,
    completion_timeout_secs: Option<u64>,
    tool_timeout_secs: Option<u64>,
    progress_interval_secs: Option<u64>,
    model: Option<String>,
    system_prompt: Option<String>,
    temperature: Option<f64>,
    max_tokens: Option<u32>,
    api_base: Option<String>,
    token_budget: Option<u64>,
    requests_per_minute: Option<u32>,
    checkpoint: Option<PathBuf>,
    resume: Option<bool>,
}

impl RunConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads defaults overlaid with the keys present in a YAML file.
    ///
    /// A relative distribution file path is resolved against the config
    /// file's directory.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        let mut config = Self::from_yaml_str(&contents)?;

        if let DistributionSource::File(dist) = &config.distribution {
            if dist.is_relative() {
                if let Some(dir) = path.parent() {
                    config.distribution = DistributionSource::File(dir.join(dist));
                }
            }
        }
        Ok(config)
    }

    /// Parses a YAML configuration document.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile = serde_yaml::from_str(yaml)?;
        let mut config = Self::default();

        macro_rules! overlay {
            ($($src:ident => $dst:ident),* $(,)?) => {
                $(if let Some(value) = file.$src { config.$dst = value; })*
            };
        }
        overlay!(
            distribution => distribution,
            seed => seed,
            workers => workers,
            max_turns => max_turns,
            model => model,
            api_base => api_base,
            checkpoint => checkpoint_path,
            resume => resume,
        );

        config.dataset_path = file.dataset.or(config.dataset_path);
        config.limit = file.limit.or(config.limit);
        config.system_prompt = file.system_prompt.or(config.system_prompt);
        config.temperature = file.temperature.or(config.temperature);
        config.max_tokens = file.max_tokens.or(config.max_tokens);
        config.token_budget = file.token_budget.or(config.token_budget);
        config.requests_per_minute = file.requests_per_minute.or(config.requests_per_minute);

        if let Some(attempts) = file.max_attempts {
            config.retry.max_attempts = attempts;
        }
        if let Some(ms) = file.retry_base_delay_ms {
            config.retry.base_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = file.retry_max_delay_ms {
            config.retry.max_delay = Duration::from_millis(ms);
        }
        if let Some(multiplier) = file.retry_multiplier {
            config.retry.multiplier = multiplier;
        }
        if let Some(secs) = file.completion_timeout_secs {
            config.completion_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = file.tool_timeout_secs {
            config.tool_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = file.progress_interval_secs {
            config.progress_interval = Duration::from_secs(secs);
        }

        Ok(config)
    }

    /// Applies overrides from the process environment.
    ///
    /// # Environment Variables
    ///
    /// - `TRAJFORGE_DATASET`: dataset path
    /// - `TRAJFORGE_DISTRIBUTION`: distribution YAML file
    /// - `TRAJFORGE_CHECKPOINT`: checkpoint log path
    /// - `TRAJFORGE_MODEL`: model identifier
    /// - `TRAJFORGE_API_BASE`: completion endpoint base URL
    /// - `TRAJFORGE_WORKERS`: worker count (default: 4)
    /// - `TRAJFORGE_MAX_TURNS`: model turns per trajectory (default: 10)
    /// - `TRAJFORGE_MAX_ATTEMPTS`: completion attempts per turn (default: 3)
    /// - `TRAJFORGE_SEED`: sampler seed (default: 0)
    /// - `TRAJFORGE_LIMIT`: subset size
    /// - `TRAJFORGE_TOKEN_BUDGET`: total token budget
    /// - `TRAJFORGE_REQUESTS_PER_MINUTE`: request pacing
    /// - `TRAJFORGE_RESUME`: resume an existing log (`true`/`false`)
    /// - `OPENAI_API_KEY` / `OPENROUTER_API_KEY`: API key
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if a variable cannot be parsed.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Applies overrides from an arbitrary variable lookup.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(val) = lookup("TRAJFORGE_DATASET") {
            self.dataset_path = Some(PathBuf::from(val));
        }
        if let Some(val) = lookup("TRAJFORGE_DISTRIBUTION") {
            self.distribution = DistributionSource::File(PathBuf::from(val));
        }
        if let Some(val) = lookup("TRAJFORGE_CHECKPOINT") {
            self.checkpoint_path = PathBuf::from(val);
        }
        if let Some(val) = lookup("TRAJFORGE_MODEL") {
            self.model = val;
        }
        if let Some(val) = lookup("TRAJFORGE_API_BASE") {
            self.api_base = val;
        }
        if let Some(val) = lookup("TRAJFORGE_WORKERS") {
            self.workers = parse_env_value(&val, "TRAJFORGE_WORKERS")?;
        }
        if let Some(val) = lookup("TRAJFORGE_MAX_TURNS") {
            self.max_turns = parse_env_value(&val, "TRAJFORGE_MAX_TURNS")?;
        }
        if let Some(val) = lookup("TRAJFORGE_MAX_ATTEMPTS") {
            self.retry.max_attempts = parse_env_value(&val, "TRAJFORGE_MAX_ATTEMPTS")?;
        }
        if let Some(val) = lookup("TRAJFORGE_SEED") {
            self.seed = parse_env_value(&val, "TRAJFORGE_SEED")?;
        }
        if let Some(val) = lookup("TRAJFORGE_LIMIT") {
            self.limit = Some(parse_env_value(&val, "TRAJFORGE_LIMIT")?);
        }
        if let Some(val) = lookup("TRAJFORGE_TOKEN_BUDGET") {
            self.token_budget = Some(parse_env_value(&val, "TRAJFORGE_TOKEN_BUDGET")?);
        }
        if let Some(val) = lookup("TRAJFORGE_REQUESTS_PER_MINUTE") {
            self.requests_per_minute = Some(parse_env_value(&val, "TRAJFORGE_REQUESTS_PER_MINUTE")?);
        }
        if let Some(val) = lookup("TRAJFORGE_RESUME") {
            self.resume = parse_env_bool(&val, "TRAJFORGE_RESUME")?;
        }
        if self.api_key.is_none() {
            self.api_key = API_KEY_ENV_VARS
                .iter()
                .find_map(|key| lookup(key).filter(|v| !v.is_empty()));
        }
        Ok(())
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Missing` for absent required values and
    /// `ConfigError::ValidationFailed` for out-of-range ones.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dataset_path.is_none() {
            return Err(ConfigError::Missing("dataset path".to_string()));
        }

        if self.model.trim().is_empty() {
            return Err(ConfigError::Missing("model".to_string()));
        }

        if self.workers == 0 {
            return Err(ConfigError::ValidationFailed(
                "workers must be greater than 0".to_string(),
            ));
        }

        if self.retry.max_attempts == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_attempts must be at least 1".to_string(),
            ));
        }

        if self.retry.multiplier < 1.0 {
            return Err(ConfigError::ValidationFailed(
                "retry multiplier must be at least 1.0".to_string(),
            ));
        }

        if self.retry.base_delay > self.retry.max_delay {
            return Err(ConfigError::ValidationFailed(
                "retry base delay cannot exceed the max delay".to_string(),
            ));
        }

        if self.completion_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "completion_timeout must be greater than 0".to_string(),
            ));
        }

        if self.tool_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "tool_timeout must be greater than 0".to_string(),
            ));
        }

        if self.progress_interval.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "progress_interval must be greater than 0".to_string(),
            ));
        }

        if let Some(temperature) = self.temperature {
            if !(0.0..=2.0).contains(&temperature) {
                return Err(ConfigError::ValidationFailed(
                    "temperature must be between 0.0 and 2.0".to_string(),
                ));
            }
        }

        if self.max_tokens == Some(0) {
            return Err(ConfigError::ValidationFailed(
                "max_tokens must be greater than 0".to_string(),
            ));
        }

        if self.requests_per_minute == Some(0) {
            return Err(ConfigError::ValidationFailed(
                "requests_per_minute must be greater than 0".to_string(),
            ));
        }

        if self.api_base.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "api_base cannot be empty".to_string(),
            ));
        }

        Ok(())
    }

    /// Settings handed to every trajectory of the run.
    pub fn to_rollout_settings(&self) -> RolloutSettings {
        RolloutSettings {
            model: self.model.clone(),
            system_prompt: self.system_prompt.clone(),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            limits: Limits {
                max_turns: self.max_turns,
                retry: self.retry.clone(),
            },
            completion_timeout: self.completion_timeout,
        }
    }

    pub fn with_dataset_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.dataset_path = Some(path.into());
        self
    }

    pub fn with_distribution(mut self, spec: DistributionSpec) -> Self {
        self.distribution = DistributionSource::Inline(spec);
        self
    }

    pub fn with_distribution_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.distribution = DistributionSource::File(path.into());
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_limit(mut self, limit: Option<usize>) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_max_turns(mut self, max_turns: u32) -> Self {
        self.max_turns = max_turns;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_completion_timeout(mut self, timeout: Duration) -> Self {
        self.completion_timeout = timeout;
        self
    }

    pub fn with_tool_timeout(mut self, timeout: Duration) -> Self {
        self.tool_timeout = timeout;
        self
    }

    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_api_base(mut self, base: impl Into<String>) -> Self {
        self.api_base = base.into();
        self
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn with_token_budget(mut self, tokens: Option<u64>) -> Self {
        self.token_budget = tokens;
        self
    }

    pub fn with_requests_per_minute(mut self, rpm: Option<u32>) -> Self {
        self.requests_per_minute = rpm;
        self
    }

    pub fn with_checkpoint_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.checkpoint_path = path.into();
        self
    }

    pub fn with_resume(mut self, resume: bool) -> Self {
        self.resume = resume;
        self
    }
}

/// Parse an environment variable value into the target type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

/// Parse an environment variable as a boolean.
fn parse_env_bool(value: &str, key: &str) -> Result<bool, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected boolean value, got '{}'", value),
        }),
    }
}
