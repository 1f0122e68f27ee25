//! Configuration loading and root folder resolution
//!
//! Resolution order for every setting:
//! 1. Command-line argument (highest priority)
//! 2. Environment variable
//! 3. TOML config file
//! 4. Compiled default (fallback)
//!
//! A missing TOML file is never fatal: the service logs a warning and
//! starts with defaults.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Environment variable overriding the root folder
pub const ROOT_FOLDER_ENV: &str = "MCAI_ROOT_FOLDER";

/// Environment variable pointing at an explicit TOML config file
pub const CONFIG_FILE_ENV: &str = "MCAI_CONFIG";

/// Database file name inside the root folder
pub const DATABASE_FILE: &str = "mcai.db";

/// Upload directory name inside the root folder
pub const UPLOADS_DIR: &str = "uploads";

/// Compiled defaults used when nothing else is configured
#[derive(Debug, Clone)]
pub struct CompiledDefaults {
    pub root_folder: PathBuf,
    pub log_level: String,
    pub bind_address: String,
    pub port: u16,
}

impl CompiledDefaults {
    /// Defaults for the platform the binary was built for
    pub fn for_current_platform() -> Self {
        let root_folder = if cfg!(target_os = "windows") {
            dirs::data_local_dir()
                .map(|d| d.join("mcai"))
                .unwrap_or_else(|| PathBuf::from("C:\\ProgramData\\mcai"))
        } else if cfg!(target_os = "macos") {
            dirs::data_dir()
                .map(|d| d.join("mcai"))
                .unwrap_or_else(|| PathBuf::from("/Library/Application Support/mcai"))
        } else {
            // ~/.local/share/mcai (or /var/lib/mcai for system-wide)
            dirs::data_local_dir()
                .map(|d| d.join("mcai"))
                .unwrap_or_else(|| PathBuf::from("/var/lib/mcai"))
        };

        Self {
            root_folder,
            log_level: "info".to_string(),
            bind_address: "127.0.0.1".to_string(),
            port: 5780,
        }
    }
}

/// `[logging]` section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default level when RUST_LOG is not set ("trace" .. "error")
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// `[server]` section
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: Option<String>,
    pub port: Option<u16>,
    /// Maximum accepted upload size in bytes
    pub max_upload_bytes: Option<usize>,
    /// Shared token ACRCloud must present on the callback URL
    pub webhook_token: Option<String>,
}

/// `[acrcloud]` section
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AcrCloudConfig {
    pub base_url: Option<String>,
    pub bearer_token: Option<String>,
    pub container_id: Option<String>,
    /// Public URL of `/webhooks/acrcloud` registered with the container
    pub callback_url: Option<String>,
}

/// `[soundcharts]` section
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SoundchartsConfig {
    pub base_url: Option<String>,
    pub app_id: Option<String>,
    pub api_key: Option<String>,
    pub requests_per_second: Option<u32>,
    /// Platform used for audience snapshots (e.g. "spotify")
    pub audience_platform: Option<String>,
    /// Entities fetched per cascade batch
    pub batch_size: Option<usize>,
}

/// `[pipeline]` section
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    pub max_fetch_attempts: Option<u32>,
    pub retry_base_delay_ms: Option<u64>,
    pub retry_max_delay_ms: Option<u64>,
    /// Score (0-100) at which a match counts toward the verdict
    pub match_score_threshold: Option<f64>,
    pub queue_capacity: Option<usize>,
}

/// Contents of `mcai.toml`
///
/// Every field is optional; absent values fall through to environment
/// variables or compiled defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TomlConfig {
    pub root_folder: Option<PathBuf>,
    pub logging: LoggingConfig,
    pub server: ServerConfig,
    pub acrcloud: AcrCloudConfig,
    pub soundcharts: SoundchartsConfig,
    pub pipeline: PipelineConfig,
}

impl TomlConfig {
    /// Load configuration
    ///
    /// An explicit path (CLI or `MCAI_CONFIG`) must exist and parse. Without
    /// one, the platform config locations are searched and a missing file
    /// yields defaults.
    pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
        let explicit = explicit_path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var(CONFIG_FILE_ENV).ok().map(PathBuf::from));

        if let Some(path) = explicit {
            return Self::from_file(&path);
        }

        match default_config_path() {
            Some(path) => {
                info!("Loading configuration from {}", path.display());
                Self::from_file(&path)
            }
            None => {
                warn!("No mcai.toml found, using defaults");
                Ok(Self::default())
            }
        }
    }

    /// Parse a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))
    }

    /// Parse TOML text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(format!("Parse TOML failed: {}", e)))
    }
}

/// Search the platform config locations for `mcai.toml`
fn default_config_path() -> Option<PathBuf> {
    let user_config = dirs::config_dir().map(|d| d.join("mcai").join("mcai.toml"));
    if let Some(path) = user_config {
        if path.exists() {
            return Some(path);
        }
    }

    if cfg!(unix) {
        let system_config = PathBuf::from("/etc/mcai/mcai.toml");
        if system_config.exists() {
            return Some(system_config);
        }
    }

    None
}

/// Resolves the root folder (database, uploads)
pub struct RootFolderResolver {
    module_name: String,
    cli_arg: Option<PathBuf>,
    toml_value: Option<PathBuf>,
}

impl RootFolderResolver {
    pub fn new(module_name: &str) -> Self {
        Self {
            module_name: module_name.to_string(),
            cli_arg: None,
            toml_value: None,
        }
    }

    pub fn with_cli_arg(mut self, path: Option<PathBuf>) -> Self {
        self.cli_arg = path;
        self
    }

    pub fn with_toml(mut self, config: &TomlConfig) -> Self {
        self.toml_value = config.root_folder.clone();
        self
    }

    /// Resolve the root folder, never failing
    pub fn resolve(&self) -> PathBuf {
        if let Some(path) = &self.cli_arg {
            info!(module = %self.module_name, "Root folder from command line: {}", path.display());
            return path.clone();
        }

        if let Ok(path) = std::env::var(ROOT_FOLDER_ENV) {
            if !path.trim().is_empty() {
                info!(module = %self.module_name, "Root folder from {}: {}", ROOT_FOLDER_ENV, path);
                return PathBuf::from(path);
            }
        }

        if let Some(path) = &self.toml_value {
            info!(module = %self.module_name, "Root folder from TOML config: {}", path.display());
            return path.clone();
        }

        let default = CompiledDefaults::for_current_platform().root_folder;
        info!(module = %self.module_name, "Root folder default: {}", default.display());
        default
    }
}

/// Creates the root folder layout on first run
pub struct RootFolderInitializer {
    root_folder: PathBuf,
}

impl RootFolderInitializer {
    pub fn new(root_folder: PathBuf) -> Self {
        Self { root_folder }
    }

    /// Create the root and uploads directories if missing
    pub fn ensure_directory_exists(&self) -> Result<()> {
        if !self.root_folder.exists() {
            info!("Creating root folder: {}", self.root_folder.display());
        }
        std::fs::create_dir_all(&self.root_folder)?;
        std::fs::create_dir_all(self.uploads_path())?;
        Ok(())
    }

    pub fn root_folder(&self) -> &Path {
        &self.root_folder
    }

    pub fn database_path(&self) -> PathBuf {
        self.root_folder.join(DATABASE_FILE)
    }

    pub fn uploads_path(&self) -> PathBuf {
        self.root_folder.join(UPLOADS_DIR)
    }
}

/// User-Agent sent to third-party APIs
pub fn get_user_agent() -> String {
    format!(
        "MusicChartsAI/{} (+https://github.com/musicchartsai/mcai)",
        env!("CARGO_PKG_VERSION")
    )
}
