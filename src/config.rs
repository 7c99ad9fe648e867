use std::{
    env, fmt, fs,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use anyhow::Context as _;
use serde::{Deserialize, Serialize};

use crate::matching::{self, PatternError};

pub const PROJECT_CONFIG_FILENAME: &str = "capturetap.toml";
pub const HOME_CONFIG_DIR: &str = ".capturetap";
pub const HOME_CONFIG_FILENAME: &str = "config.toml";

pub const DEFAULT_MAX_ENTRIES: usize = 100;
pub const DEFAULT_MAX_BODY_SIZE: usize = 1024 * 1024;
pub const DEFAULT_POLICY_WAIT_MS: u64 = 500;
pub const DEFAULT_ALLOWED_STATUS_CODES: [u16; 7] = [200, 201, 202, 203, 204, 205, 206];
pub const DEFAULT_RESOURCE_TYPES: [&str; 9] = [
    "xmlhttprequest",
    "main_frame",
    "sub_frame",
    "script",
    "stylesheet",
    "image",
    "font",
    "object",
    "other",
];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: Option<LoggingConfig>,
}

/// Capture policy as written in `[capture]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CaptureConfig {
    pub enabled: bool,
    pub url_patterns: Vec<String>,
    /// Empty means every resource type passes.
    pub resource_types: Vec<String>,
    pub allowed_status_codes: Vec<u16>,
    pub require_content_type: bool,
    pub capture_request_body: bool,
    pub capture_response_body: bool,
    pub max_body_size: usize,
    pub log_filtered_requests: bool,
    pub policy_wait_ms: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            url_patterns: vec![matching::ALL_URLS.to_owned()],
            resource_types: DEFAULT_RESOURCE_TYPES
                .iter()
                .map(|kind| (*kind).to_owned())
                .collect(),
            allowed_status_codes: DEFAULT_ALLOWED_STATUS_CODES.to_vec(),
            require_content_type: false,
            capture_request_body: true,
            capture_response_body: true,
            max_body_size: DEFAULT_MAX_BODY_SIZE,
            log_filtered_requests: false,
            policy_wait_ms: DEFAULT_POLICY_WAIT_MS,
        }
    }
}

impl CaptureConfig {
    pub fn policy_wait(&self) -> Duration {
        Duration::from_millis(self.policy_wait_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StorageConfig {
    pub max_entries: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            max_entries: DEFAULT_MAX_ENTRIES,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    pub level: Option<String>,
    pub format: Option<LogFormat>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid URL pattern `{pattern}`: {source}")]
    InvalidUrlPattern {
        pattern: String,
        #[source]
        source: PatternError,
    },
    #[error("`capture.url_patterns` must contain at least one pattern")]
    NoUrlPatterns,
    #[error("status code {0} in `capture.allowed_status_codes` is outside 200-599")]
    InvalidStatusCode(u16),
    #[error("`capture.max_body_size` must be at least 1 byte")]
    ZeroMaxBodySize,
    #[error("`storage.max_entries` must be at least 1")]
    ZeroMaxEntries,
}

impl Config {
    pub fn from_path(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let toml =
            fs::read_to_string(path).with_context(|| format!("read config {}", path.display()))?;
        Self::from_toml_str(&toml).with_context(|| format!("load config {}", path.display()))
    }

    pub fn from_toml_str(toml: &str) -> anyhow::Result<Self> {
        toml.parse()
    }

    /// Loads the explicit override if given, otherwise the first config found by discovery,
    /// otherwise built-in defaults.
    pub fn load(override_path: Option<&Path>) -> anyhow::Result<Self> {
        Self::load_from(&resolve_config_source(override_path)?)
    }

    pub fn load_from(source: &ConfigSource) -> anyhow::Result<Self> {
        match source.path() {
            Some(path) => Self::from_path(path).with_context(|| format!("config from {source}")),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let capture = &self.capture;
        if capture.url_patterns.is_empty() {
            return Err(ConfigError::NoUrlPatterns);
        }
        for pattern in &capture.url_patterns {
            matching::validate_url_pattern(pattern).map_err(|source| {
                ConfigError::InvalidUrlPattern {
                    pattern: pattern.clone(),
                    source,
                }
            })?;
        }
        if let Some(code) = capture
            .allowed_status_codes
            .iter()
            .copied()
            .find(|code| !matching::is_valid_status_code(*code))
        {
            return Err(ConfigError::InvalidStatusCode(code));
        }
        if capture.max_body_size == 0 {
            return Err(ConfigError::ZeroMaxBodySize);
        }
        if self.storage.max_entries == 0 {
            return Err(ConfigError::ZeroMaxEntries);
        }
        Ok(())
    }
}

impl FromStr for Config {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let config: Self = toml::from_str(s).context("parse config TOML")?;
        config.validate()?;
        Ok(config)
    }
}

/// Where a config file was found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    Override(PathBuf),
    Project(PathBuf),
    Home(PathBuf),
    Defaults,
}

impl ConfigSource {
    pub fn path(&self) -> Option<&Path> {
        match self {
            Self::Override(path) | Self::Project(path) | Self::Home(path) => Some(path),
            Self::Defaults => None,
        }
    }
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Override(path) => write!(f, "override {}", path.display()),
            Self::Project(_) => write!(f, "project ./{PROJECT_CONFIG_FILENAME}"),
            Self::Home(path) => write!(f, "home {}", path.display()),
            Self::Defaults => f.write_str("built-in defaults"),
        }
    }
}

/// Discovery against the process working directory and `$HOME`.
pub fn resolve_config_source(override_path: Option<&Path>) -> anyhow::Result<ConfigSource> {
    let cwd = env::current_dir().context("resolve current directory")?;
    let home = env::var_os("HOME").map(PathBuf::from);
    Ok(discover_config_source(override_path, &cwd, home.as_deref()))
}

pub fn discover_config_source(
    override_path: Option<&Path>,
    cwd: &Path,
    home: Option<&Path>,
) -> ConfigSource {
    if let Some(path) = override_path {
        return ConfigSource::Override(path.to_path_buf());
    }
    let project = cwd.join(PROJECT_CONFIG_FILENAME);
    if project.is_file() {
        return ConfigSource::Project(project);
    }
    if let Some(home) = home {
        let home_config = home.join(HOME_CONFIG_DIR).join(HOME_CONFIG_FILENAME);
        if home_config.is_file() {
            return ConfigSource::Home(home_config);
        }
    }
    ConfigSource::Defaults
}
