use std::{
    env, fs,
    path::{Path, PathBuf},
};

use serde::Deserialize;

use crate::MedLumaError;

const DEFAULT_CONFIG_PATH: &str = "medluma.toml";
const CONFIG_PATH_ENV: &str = "MEDLUMA_CONFIG";

pub const DEFAULT_FLASH_MODEL: &str = "gemini-2.5-flash";
pub const DEFAULT_FLASH_LITE_MODEL: &str = "gemini-2.5-flash-lite";

/// Top-level configuration structure.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub models: ModelsConfig,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub refine: RefineConfig,
    #[serde(default)]
    pub biomcp: BioMcpSettings,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Resolve the configured API key from the environment only.
    pub fn api_key(&self) -> Result<String, MedLumaError> {
        require_env(&self.models.api_key_env)
    }
}

/// Helper to load configuration with explicit resolution order.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from a provided path or discoverable defaults.
    ///
    /// Resolution order:
    /// 1. Explicit `path` argument (must exist).
    /// 2. `MEDLUMA_CONFIG` environment variable.
    /// 3. `medluma.toml` in the current working directory, falling back to
    ///    built-in defaults when absent.
    pub fn load(path: Option<PathBuf>) -> Result<Config, MedLumaError> {
        let explicit = path.is_some()
            || env::var(CONFIG_PATH_ENV)
                .map(|value| !value.trim().is_empty())
                .unwrap_or(false);
        let candidate = resolve_path(path);

        if !candidate.exists() && !explicit {
            let config = Config::default();
            Self::validate(&config)?;
            return Ok(config);
        }

        let raw = fs::read_to_string(&candidate)
            .map_err(|err| MedLumaError::config_io(candidate.clone(), err))?;
        let config: Config = toml::from_str(&raw)
            .map_err(|err| MedLumaError::InvalidConfiguration(err.to_string()))?;

        Self::validate(&config)?;
        Ok(config)
    }

    fn validate(config: &Config) -> Result<(), MedLumaError> {
        if config.models.api_key_env.trim().is_empty() {
            return Err(MedLumaError::InvalidConfiguration(
                "models.api_key_env must reference an environment variable".into(),
            ));
        }
        if config.retry.attempts == 0 {
            return Err(MedLumaError::InvalidConfiguration(
                "retry.attempts must be at least 1".into(),
            ));
        }
        if config.refine.max_cycles == 0 {
            return Err(MedLumaError::InvalidConfiguration(
                "refine.max_cycles must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

fn resolve_path(path: Option<PathBuf>) -> PathBuf {
    if let Some(path) = path {
        return path;
    }

    if let Ok(from_env) = env::var(CONFIG_PATH_ENV) {
        if !from_env.trim().is_empty() {
            return PathBuf::from(from_env);
        }
    }

    Path::new(DEFAULT_CONFIG_PATH).to_path_buf()
}

pub fn require_env(name: &str) -> Result<String, MedLumaError> {
    env::var(name).map_err(|_| MedLumaError::MissingSecret(name.to_string()))
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelsConfig {
    #[serde(default = "ModelsConfig::default_flash")]
    pub flash: String,
    #[serde(default = "ModelsConfig::default_flash_lite")]
    pub flash_lite: String,
    #[serde(default = "ModelsConfig::default_api_key_env")]
    pub api_key_env: String,
}

impl ModelsConfig {
    fn default_flash() -> String {
        DEFAULT_FLASH_MODEL.to_string()
    }

    fn default_flash_lite() -> String {
        DEFAULT_FLASH_LITE_MODEL.to_string()
    }

    fn default_api_key_env() -> String {
        "GOOGLE_API_KEY".to_string()
    }
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            flash: Self::default_flash(),
            flash_lite: Self::default_flash_lite(),
            api_key_env: Self::default_api_key_env(),
        }
    }
}

/// Retry policy handed to the model client. The pipeline itself never retries;
/// transient failures are the client's concern.
#[derive(Debug, Clone, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "RetryPolicy::default_attempts")]
    pub attempts: u32,
    #[serde(default = "RetryPolicy::default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "RetryPolicy::default_exp_base")]
    pub exp_base: u64,
    #[serde(default = "RetryPolicy::default_retry_status_codes")]
    pub retry_status_codes: Vec<u16>,
}

impl RetryPolicy {
    const fn default_attempts() -> u32 {
        5
    }

    const fn default_initial_delay_ms() -> u64 {
        1_000
    }

    const fn default_exp_base() -> u64 {
        7
    }

    fn default_retry_status_codes() -> Vec<u16> {
        vec![429, 500, 503, 504]
    }

    pub fn is_retryable_status(&self, status: u16) -> bool {
        self.retry_status_codes.contains(&status)
    }

    /// Delay before retry number `attempt` (zero-based), in milliseconds.
    pub fn backoff_ms(&self, attempt: u32) -> u64 {
        self.initial_delay_ms
            .saturating_mul(self.exp_base.saturating_pow(attempt))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: Self::default_attempts(),
            initial_delay_ms: Self::default_initial_delay_ms(),
            exp_base: Self::default_exp_base(),
            retry_status_codes: Self::default_retry_status_codes(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RefineConfig {
    #[serde(default = "RefineConfig::default_max_cycles")]
    pub max_cycles: u32,
}

impl RefineConfig {
    const fn default_max_cycles() -> u32 {
        2
    }
}

impl Default for RefineConfig {
    fn default() -> Self {
        Self {
            max_cycles: Self::default_max_cycles(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BioMcpSettings {
    /// Explicit path to the biomcp executable; skips the search when set.
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default = "BioMcpSettings::default_timeout_secs")]
    pub timeout_secs: u64,
}

impl BioMcpSettings {
    const fn default_timeout_secs() -> u64 {
        120
    }
}

impl Default for BioMcpSettings {
    fn default() -> Self {
        Self {
            path: None,
            timeout_secs: Self::default_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "LoggingConfig::default_level")]
    pub level: String,
}

impl LoggingConfig {
    fn default_level() -> String {
        "info".to_string()
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
        }
    }
}
