//! Configuration loading, validation, and management for Reflector.
//!
//! Loads configuration from `~/.reflector/config.toml` with environment
//! variable overrides. Validates all settings at startup.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// The root configuration structure.
///
/// Maps directly to `~/.reflector/config.toml`.
#[derive(Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// API key shared by both models
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Provider name (selects the default endpoint)
    #[serde(default = "default_provider")]
    pub provider: String,

    /// Override the provider's base URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_url: Option<String>,

    /// The model that writes answers
    #[serde(default = "ModelConfig::primary")]
    pub primary: ModelConfig,

    /// The model that critiques them
    #[serde(default = "ModelConfig::critic")]
    pub critic: ModelConfig,

    /// Loop behavior
    #[serde(default)]
    pub reflection: ReflectionConfig,

    /// System prompt overrides
    #[serde(default)]
    pub prompts: PromptConfig,

    /// HTTP gateway configuration
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Run trace export
    #[serde(default)]
    pub tracing: TracingConfig,
}

fn default_provider() -> String {
    "gemini".into()
}

/// Redact a secret string for Debug output.
fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("api_key", &redact(&self.api_key))
            .field("provider", &self.provider)
            .field("api_url", &self.api_url)
            .field("primary", &self.primary)
            .field("critic", &self.critic)
            .field("reflection", &self.reflection)
            .field("prompts", &self.prompts)
            .field("gateway", &self.gateway)
            .field("tracing", &self.tracing)
            .finish()
    }
}

impl std::fmt::Debug for TracingConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TracingConfig")
            .field("enabled", &self.enabled)
            .field("endpoint", &self.endpoint)
            .field("api_key", &redact(&self.api_key))
            .field("project", &self.project)
            .finish()
    }
}

/// Sampling settings for one model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub model: String,

    pub temperature: f32,

    pub max_tokens: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
}

impl ModelConfig {
    /// Defaults for the answering model: longer, more creative output.
    pub fn primary() -> Self {
        Self {
            model: "gemini-2.0-flash-exp".into(),
            temperature: 0.7,
            max_tokens: 4096,
            top_p: Some(0.95),
        }
    }

    /// Defaults for the critic: shorter, more deterministic output.
    pub fn critic() -> Self {
        Self {
            model: "gemini-2.0-flash".into(),
            temperature: 0.2,
            max_tokens: 2048,
            top_p: Some(0.8),
        }
    }
}

/// Which rule turns critique text into a "needs improvement" verdict.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CriticPolicyKind {
    /// Parse a `NEEDS IMPROVEMENT: yes|no` field
    #[default]
    Structured,
    /// Improvement needed unless the critique says "No critique needed"
    Marker,
}

impl std::str::FromStr for CriticPolicyKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "structured" => Ok(Self::Structured),
            "marker" => Ok(Self::Marker),
            other => Err(ConfigError::ValidationError(format!(
                "unknown critic policy '{other}' (expected 'structured' or 'marker')"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReflectionConfig {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_base_delay_secs")]
    pub base_delay_secs: f64,

    #[serde(default = "default_true")]
    pub verbose: bool,

    #[serde(default)]
    pub critic_policy: CriticPolicyKind,

    /// Abort a run that takes longer than this
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_timeout_secs: Option<u64>,
}

fn default_max_iterations() -> u32 {
    3
}
fn default_max_retries() -> u32 {
    3
}
fn default_base_delay_secs() -> f64 {
    2.0
}
fn default_true() -> bool {
    true
}

impl Default for ReflectionConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            max_retries: default_max_retries(),
            base_delay_secs: default_base_delay_secs(),
            verbose: true,
            critic_policy: CriticPolicyKind::default(),
            run_timeout_secs: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PromptConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub main_system_prompt: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reflection_system_prompt: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// CORS origins; `"*"` allows any
    #[serde(default = "default_allowed_origins")]
    pub allowed_origins: Vec<String>,
}

fn default_host() -> String {
    "0.0.0.0".into()
}
fn default_port() -> u16 {
    5001
}
fn default_allowed_origins() -> Vec<String> {
    vec!["*".into()]
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            allowed_origins: default_allowed_origins(),
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct TracingConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Collector base URL; traces are only logged when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default = "default_tracing_project")]
    pub project: String,
}

fn default_tracing_project() -> String {
    "reflection-pattern-agent".into()
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: None,
            api_key: None,
            project: default_tracing_project(),
        }
    }
}

impl AppConfig {
    /// Load configuration from the default path (~/.reflector/config.toml),
    /// then apply environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        let mut config = Self::load_from(&config_path)?;
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from an environment lookup.
    ///
    /// Takes the lookup as a function so tests don't have to mutate the
    /// process environment.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if self.api_key.is_none() {
            self.api_key = lookup("REFLECTOR_API_KEY")
                .or_else(|| lookup("GEMINI_API_KEY"))
                .or_else(|| lookup("OPENAI_API_KEY"))
                .filter(|k| !k.is_empty());
        }

        if let Some(provider) = lookup("REFLECTOR_PROVIDER") {
            self.provider = provider;
        }
        if let Some(url) = lookup("REFLECTOR_API_URL") {
            self.api_url = Some(url);
        }
        if let Some(model) = lookup("MAIN_MODEL") {
            self.primary.model = model;
        }
        if let Some(model) = lookup("REFLECTION_MODEL") {
            self.critic.model = model;
        }
        if let Some(v) = lookup("MAX_ITERATIONS") {
            self.reflection.max_iterations = parse_env("MAX_ITERATIONS", &v)?;
        }
        if let Some(v) = lookup("MAX_RETRIES") {
            self.reflection.max_retries = parse_env("MAX_RETRIES", &v)?;
        }
        if let Some(v) = lookup("RETRY_DELAY") {
            self.reflection.base_delay_secs = parse_env("RETRY_DELAY", &v)?;
        }
        if let Some(v) = lookup("VERBOSE") {
            self.reflection.verbose = parse_flag(&v);
        }
        if let Some(v) = lookup("CRITIC_POLICY") {
            self.reflection.critic_policy = v.parse()?;
        }
        if let Some(host) = lookup("HOST") {
            self.gateway.host = host;
        }
        if let Some(v) = lookup("PORT") {
            self.gateway.port = parse_env("PORT", &v)?;
        }
        if let Some(v) = lookup("ALLOWED_ORIGINS") {
            self.gateway.allowed_origins = v
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Some(v) = lookup("USE_TRACING") {
            self.tracing.enabled = parse_flag(&v);
        }
        if let Some(url) = lookup("TRACING_ENDPOINT") {
            self.tracing.endpoint = Some(url);
        }
        if let Some(key) = lookup("TRACING_API_KEY") {
            self.tracing.api_key = Some(key);
        }
        if let Some(project) = lookup("TRACING_PROJECT") {
            self.tracing.project = project;
        }

        Ok(())
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".reflector")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, model) in [("primary", &self.primary), ("critic", &self.critic)] {
            if !(0.0..=2.0).contains(&model.temperature) {
                return Err(ConfigError::ValidationError(format!(
                    "{name}.temperature must be between 0.0 and 2.0"
                )));
            }
            if model.model.trim().is_empty() {
                return Err(ConfigError::ValidationError(format!(
                    "{name}.model must not be empty"
                )));
            }
        }

        if self.reflection.max_iterations == 0 {
            return Err(ConfigError::ValidationError(
                "reflection.max_iterations must be at least 1".into(),
            ));
        }

        if !(self.reflection.base_delay_secs > 0.0) {
            return Err(ConfigError::ValidationError(
                "reflection.base_delay_secs must be > 0".into(),
            ));
        }

        Ok(())
    }

    /// Check if an API key is available (from config or environment).
    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }

    /// Generate a default config TOML string (for `init` command).
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            provider: default_provider(),
            api_url: None,
            primary: ModelConfig::primary(),
            critic: ModelConfig::critic(),
            reflection: ReflectionConfig::default(),
            prompts: PromptConfig::default(),
            gateway: GatewayConfig::default(),
            tracing: TracingConfig::default(),
        }
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidEnv {
            key: key.to_string(),
            value: value.to_string(),
        })
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Invalid value for {key}: '{value}'")]
    InvalidEnv { key: String, value: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn default_config_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.provider, "gemini");
        assert_eq!(config.reflection.max_iterations, 3);
        assert_eq!(config.reflection.max_retries, 3);
        assert!((config.reflection.base_delay_secs - 2.0).abs() < f64::EPSILON);
        assert_eq!(config.gateway.port, 5001);
    }

    #[test]
    fn primary_and_critic_defaults_differ() {
        let config = AppConfig::default();
        assert!(config.primary.temperature > config.critic.temperature);
        assert!(config.primary.max_tokens > config.critic.max_tokens);
    }

    #[test]
    fn config_roundtrip_toml() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: AppConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.primary.model, config.primary.model);
        assert_eq!(parsed.reflection.critic_policy, CriticPolicyKind::Structured);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
[reflection]
max_iterations = 5
critic_policy = "marker"

[critic]
model = "gpt-4o-mini"
temperature = 0.0
max_tokens = 512
"#,
        )
        .unwrap();
        assert_eq!(config.reflection.max_iterations, 5);
        assert_eq!(config.reflection.max_retries, 3);
        assert_eq!(config.reflection.critic_policy, CriticPolicyKind::Marker);
        assert_eq!(config.critic.model, "gpt-4o-mini");
        assert_eq!(config.critic.top_p, None);
        assert_eq!(config.primary.model, "gemini-2.0-flash-exp");
    }

    #[test]
    fn invalid_temperature_rejected() {
        let mut config = AppConfig::default();
        config.critic.temperature = 5.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_iterations_rejected() {
        let mut config = AppConfig::default();
        config.reflection.max_iterations = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn non_positive_delay_rejected() {
        let mut config = AppConfig::default();
        config.reflection.base_delay_secs = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_config_file_returns_defaults() {
        let config = AppConfig::load_from(Path::new("/nonexistent/config.toml")).unwrap();
        assert_eq!(config.provider, "gemini");
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "provider = \"openai\"\n[gateway]\nport = 9000\n").unwrap();

        let config = AppConfig::load_from(&path).unwrap();
        assert_eq!(config.provider, "openai");
        assert_eq!(config.gateway.port, 9000);
    }

    #[test]
    fn malformed_file_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "reflection = [").unwrap();

        match AppConfig::load_from(&path) {
            Err(ConfigError::ParseError { .. }) => {}
            other => panic!("Expected ParseError, got {other:?}"),
        }
    }

    #[test]
    fn env_overrides_apply() {
        let mut config = AppConfig::default();
        config
            .apply_env(env(&[
                ("GEMINI_API_KEY", "g-key"),
                ("MAIN_MODEL", "gemini-pro"),
                ("MAX_ITERATIONS", "5"),
                ("VERBOSE", "false"),
                ("PORT", "8080"),
                ("ALLOWED_ORIGINS", "http://a.test, http://b.test"),
                ("CRITIC_POLICY", "marker"),
                ("USE_TRACING", "true"),
            ]))
            .unwrap();

        assert_eq!(config.api_key.as_deref(), Some("g-key"));
        assert_eq!(config.primary.model, "gemini-pro");
        assert_eq!(config.reflection.max_iterations, 5);
        assert!(!config.reflection.verbose);
        assert_eq!(config.gateway.port, 8080);
        assert_eq!(
            config.gateway.allowed_origins,
            vec!["http://a.test".to_string(), "http://b.test".to_string()]
        );
        assert_eq!(config.reflection.critic_policy, CriticPolicyKind::Marker);
        assert!(config.tracing.enabled);
    }

    #[test]
    fn config_file_key_beats_env_key() {
        let mut config = AppConfig {
            api_key: Some("from-file".into()),
            ..AppConfig::default()
        };
        config.apply_env(env(&[("GEMINI_API_KEY", "from-env")])).unwrap();
        assert_eq!(config.api_key.as_deref(), Some("from-file"));
    }

    #[test]
    fn bad_env_number_is_reported() {
        let mut config = AppConfig::default();
        let err = config.apply_env(env(&[("PORT", "eighty")])).unwrap_err();
        assert!(err.to_string().contains("PORT"));
    }

    #[test]
    fn debug_output_redacts_keys() {
        let config = AppConfig {
            api_key: Some("super-secret".into()),
            ..AppConfig::default()
        };
        let debug = format!("{config:?}");
        assert!(!debug.contains("super-secret"));
        assert!(debug.contains("[REDACTED]"));
    }

    #[test]
    fn default_toml_generation() {
        let toml_str = AppConfig::default_toml();
        assert!(toml_str.contains("gemini-2.0-flash"));
        assert!(toml_str.contains("max_iterations"));
    }
}
