//! Layered configuration for the inference session layer.
//!
//! Sources, later ones winning:
//! - compiled defaults
//! - `anchor-infer.toml` / `anchor-infer.json` in the working directory, or an explicit file
//! - `ANCHOR_*` environment variables, `__` between nested keys
//!   (e.g. `ANCHOR_TIMEOUTS__GENERATE=90000`)

use anyhow::{bail, Context};
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::runtime::{Backend, GenerationOptions, PrecisionProfile};

/// Root configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnchorConfig {
    /// Model selection and load behaviour
    #[serde(default)]
    pub session: SessionConfig,

    /// Request deadlines
    #[serde(default)]
    pub timeouts: TimeoutConfig,

    /// Default sampling parameters
    #[serde(default)]
    pub generation: GenerationConfig,

    /// Model metadata cache
    #[serde(default)]
    pub cache: CacheConfig,
}

/// Model selection and load behaviour
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Model loaded when `load_model` is called without an id
    pub default_model: String,
    /// Size reported in status and load metadata
    pub approximate_size_mb: u32,
    /// Precision profiles tried in order until one initializes
    pub precision_profiles: Vec<PrecisionProfile>,
    /// Backends probed in order; CPU is used when none probes
    pub backend_priority: Vec<Backend>,
    /// System message prepended to bare prompts
    pub system_prompt: String,
    /// Highest percent reported before the load is confirmed
    pub progress_cap: u8,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_model: "Xenova/Qwen1.5-0.5B-Chat".to_string(),
            approximate_size_mb: 500,
            precision_profiles: PrecisionProfile::default_ladder(),
            backend_priority: Backend::PRIORITY.to_vec(),
            system_prompt: "You are a helpful assistant.".to_string(),
            progress_cap: 95,
        }
    }
}

/// Deadlines in milliseconds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub bring_up: u64,
    pub load: u64,
    pub generate: u64,
    /// Status/info/unload round trips
    pub query: u64,
    /// Interval of the pending-request expiry sweep
    pub sweep_interval: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            bring_up: 10_000,
            load: 300_000,
            generate: 60_000,
            query: 1_000,
            sweep_interval: 1_000,
        }
    }
}

impl TimeoutConfig {
    pub fn bring_up(&self) -> Duration {
        Duration::from_millis(self.bring_up)
    }

    pub fn load(&self) -> Duration {
        Duration::from_millis(self.load)
    }

    pub fn generate(&self) -> Duration {
        Duration::from_millis(self.generate)
    }

    pub fn query(&self) -> Duration {
        Duration::from_millis(self.query)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval)
    }
}

/// Default sampling parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub max_output_tokens: u32,
    pub temperature: f32,
    pub top_k: u32,
    pub top_p: f32,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        let defaults = GenerationOptions::default();
        Self {
            max_output_tokens: defaults.max_output_tokens,
            temperature: defaults.temperature,
            top_k: defaults.top_k,
            top_p: defaults.top_p,
        }
    }
}

impl From<&GenerationConfig> for GenerationOptions {
    fn from(config: &GenerationConfig) -> Self {
        GenerationOptions {
            max_output_tokens: config.max_output_tokens,
            temperature: config.temperature,
            top_k: config.top_k,
            top_p: config.top_p,
        }
    }
}

/// Model metadata cache
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub dir: PathBuf,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: std::env::temp_dir().join("anchor-infer").join("metadata"),
        }
    }
}

/// Builder for [`AnchorConfig`]
#[derive(Debug, Clone, Default)]
pub struct AnchorConfigBuilder {
    config: AnchorConfig,
}

impl AnchorConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing config
    pub fn from_config(config: AnchorConfig) -> Self {
        Self { config }
    }

    pub fn default_model(mut self, model_id: impl Into<String>) -> Self {
        self.config.session.default_model = model_id.into();
        self
    }

    pub fn precision_profiles(mut self, profiles: impl IntoIterator<Item = PrecisionProfile>) -> Self {
        self.config.session.precision_profiles = profiles.into_iter().collect();
        self
    }

    pub fn backend_priority(mut self, backends: impl IntoIterator<Item = Backend>) -> Self {
        self.config.session.backend_priority = backends.into_iter().collect();
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.session.system_prompt = prompt.into();
        self
    }

    pub fn bring_up_timeout(mut self, timeout: Duration) -> Self {
        self.config.timeouts.bring_up = timeout.as_millis() as u64;
        self
    }

    pub fn load_timeout(mut self, timeout: Duration) -> Self {
        self.config.timeouts.load = timeout.as_millis() as u64;
        self
    }

    pub fn generate_timeout(mut self, timeout: Duration) -> Self {
        self.config.timeouts.generate = timeout.as_millis() as u64;
        self
    }

    pub fn query_timeout(mut self, timeout: Duration) -> Self {
        self.config.timeouts.query = timeout.as_millis() as u64;
        self
    }

    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.config.timeouts.sweep_interval = interval.as_millis() as u64;
        self
    }

    pub fn cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.cache.enabled = true;
        self.config.cache.dir = dir.into();
        self
    }

    pub fn disable_cache(mut self) -> Self {
        self.config.cache.enabled = false;
        self
    }

    pub fn build(self) -> AnchorConfig {
        self.config
    }
}

impl AnchorConfig {
    pub fn builder() -> AnchorConfigBuilder {
        AnchorConfigBuilder::new()
    }

    /// Load from defaults, an optional file in the working directory, and the environment.
    pub fn load() -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(Config::try_from(&AnchorConfig::default())?)
            .add_source(File::with_name("anchor-infer").required(false))
            .add_source(Self::environment())
            .build()?
            .try_deserialize()
    }

    /// Load from defaults, the given file, and the environment.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let config = Config::builder()
            .add_source(Config::try_from(&AnchorConfig::default())?)
            .add_source(File::from(path).required(true))
            .add_source(Self::environment())
            .build()
            .with_context(|| format!("failed to read config file {}", path.display()))?
            .try_deserialize()
            .with_context(|| format!("invalid config file {}", path.display()))?;
        Ok(config)
    }

    fn environment() -> Environment {
        Environment::with_prefix("ANCHOR")
            .prefix_separator("_")
            .separator("__")
    }

    /// Validate the entire configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.session.default_model.trim().is_empty() {
            bail!("session.default_model must not be empty");
        }
        if self.session.precision_profiles.is_empty() {
            bail!("session.precision_profiles must list at least one profile");
        }
        if self.session.backend_priority.is_empty() {
            bail!("session.backend_priority must list at least one backend");
        }
        if self.session.progress_cap > 100 {
            bail!("session.progress_cap must be at most 100");
        }

        let timeouts = [
            ("bring_up", self.timeouts.bring_up),
            ("load", self.timeouts.load),
            ("generate", self.timeouts.generate),
            ("query", self.timeouts.query),
            ("sweep_interval", self.timeouts.sweep_interval),
        ];
        for (name, value) in timeouts {
            if value == 0 {
                bail!("timeouts.{} must be greater than zero", name);
            }
        }

        GenerationOptions::from(&self.generation)
            .validate()
            .context("invalid generation defaults")?;
        Ok(())
    }

    /// Default options for generation calls that don't supply their own.
    pub fn generation_options(&self) -> GenerationOptions {
        GenerationOptions::from(&self.generation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = AnchorConfig::default();
        config.validate().expect("test: defaults validate");
        assert_eq!(config.session.default_model, "Xenova/Qwen1.5-0.5B-Chat");
        assert_eq!(
            config.session.precision_profiles,
            vec![
                PrecisionProfile::Q4,
                PrecisionProfile::Q4f16,
                PrecisionProfile::Int8,
                PrecisionProfile::Auto
            ]
        );
        assert_eq!(config.timeouts.bring_up(), Duration::from_secs(10));
        assert_eq!(config.timeouts.load(), Duration::from_secs(300));
        assert_eq!(config.timeouts.generate(), Duration::from_secs(60));
    }

    #[test]
    fn test_builder_overrides() {
        let config = AnchorConfig::builder()
            .default_model("tiny")
            .precision_profiles([PrecisionProfile::Fp32])
            .generate_timeout(Duration::from_millis(250))
            .disable_cache()
            .build();
        assert_eq!(config.session.default_model, "tiny");
        assert_eq!(config.session.precision_profiles, vec![PrecisionProfile::Fp32]);
        assert_eq!(config.timeouts.generate, 250);
        assert!(!config.cache.enabled);
    }

    #[test]
    fn test_validate_rejects_empty_profiles_and_zero_timeouts() {
        let config = AnchorConfig::builder().precision_profiles([]).build();
        assert!(config.validate().is_err());

        let config = AnchorConfig::builder()
            .load_timeout(Duration::ZERO)
            .build();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file_layers_over_defaults() {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .expect("test: create temp file");
        writeln!(
            file,
            "[session]\ndefault_model = \"custom/model\"\nprecision_profiles = [\"int8\", \"auto\"]\n\n[timeouts]\ngenerate = 1234"
        )
        .expect("test: write config");

        let config = AnchorConfig::from_file(file.path()).expect("test: load config");
        assert_eq!(config.session.default_model, "custom/model");
        assert_eq!(
            config.session.precision_profiles,
            vec![PrecisionProfile::Int8, PrecisionProfile::Auto]
        );
        assert_eq!(config.timeouts.generate, 1234);
        assert_eq!(config.timeouts.load, 300_000);
        assert_eq!(config.session.approximate_size_mb, 500);
    }
}
