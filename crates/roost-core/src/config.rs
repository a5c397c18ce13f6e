// ABOUTME: Configuration loading and management for roost
// ABOUTME: Supports TOML config files with sensible defaults

use crate::types::{ProviderSnapshot, SessionDefaults};
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Database settings
    pub database: DatabaseConfig,
    /// Assistant engine subprocess settings
    pub engine: EngineSection,
    /// Provider/model recorded on new sessions
    pub provider: ProviderSection,
    /// Extension defaults and custom catalog entries
    pub extensions: ExtensionsSection,
    /// Stream relay settings
    pub relay: RelaySection,
    /// Cross-process arbitration settings
    pub hybrid: HybridSection,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Path to SQLite database file
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSection {
    /// Engine binary (defaults to "goose")
    pub binary: String,
    /// Extra arguments passed to the engine
    pub args: Vec<String>,
    /// Working directory for the engine, defaults to the current directory
    pub working_dir: Option<PathBuf>,
    /// Upper bound on spawning the engine and completing the handshake
    pub start_timeout_secs: u64,
    /// Grace period between the stop signal and a forced kill
    pub stop_grace_secs: u64,
    /// Idle time after which a binding is released (0 disables)
    pub idle_timeout_secs: u64,
    /// Output line that terminates a response
    pub end_marker: String,
    /// Wait for a ready frame before accepting prompts
    pub await_ready: bool,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            binary: "goose".to_string(),
            args: Vec::new(),
            working_dir: None,
            start_timeout_secs: 10,
            stop_grace_secs: 5,
            idle_timeout_secs: 900,
            end_marker: "<<END>>".to_string(),
            await_ready: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderSection {
    pub provider: String,
    pub model: String,
}

impl Default for ProviderSection {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: "gpt-4".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtensionsSection {
    /// Extensions enabled on newly created sessions
    pub default_enabled: Vec<String>,
    /// Additional catalog entries
    pub custom: Vec<CustomExtension>,
}

impl Default for ExtensionsSection {
    fn default() -> Self {
        Self {
            default_enabled: vec!["developer".to_string()],
            custom: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomExtension {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelaySection {
    /// Events a subscriber may fall behind before it is dropped
    pub buffer: usize,
}

impl Default for RelaySection {
    fn default() -> Self {
        Self { buffer: 256 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HybridSection {
    /// How often a bound session's lock heartbeat is renewed
    pub heartbeat_interval_secs: u64,
    /// Heartbeat age after which another process may reclaim the lock
    pub lock_timeout_secs: u64,
    /// Fixed owner identity (defaults to hostname:pid:nonce)
    pub owner_id: Option<String>,
}

impl Default for HybridSection {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 5,
            lock_timeout_secs: 20,
            owner_id: None,
        }
    }
}

/// Runtime settings for one engine subprocess.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub binary: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub start_timeout: Duration,
    pub stop_grace: Duration,
    pub end_marker: String,
    pub await_ready: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineSection::default().to_runtime()
    }
}

impl EngineSection {
    fn to_runtime(&self) -> EngineConfig {
        EngineConfig {
            binary: self.binary.clone(),
            args: self.args.clone(),
            working_dir: self
                .working_dir
                .clone()
                .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))),
            start_timeout: Duration::from_secs(self.start_timeout_secs),
            stop_grace: Duration::from_secs(self.stop_grace_secs),
            end_marker: self.end_marker.clone(),
            await_ready: self.await_ready,
        }
    }
}

/// Runtime settings for the session coordinator.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub engine: EngineConfig,
    pub heartbeat_interval: Duration,
    pub lock_timeout: Duration,
    pub idle_timeout: Option<Duration>,
    pub owner_id: Option<String>,
    pub defaults: SessionDefaults,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Config::default().coordinator()
    }
}

impl Config {
    /// Get the XDG config directory for roost (~/.config/roost)
    pub fn config_dir() -> PathBuf {
        // Respect XDG_CONFIG_HOME if set, otherwise use ~/.config
        std::env::var("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                dirs::home_dir()
                    .map(|p| p.join(".config"))
                    .unwrap_or_else(|| PathBuf::from("."))
            })
            .join("roost")
    }

    /// Get the XDG data directory for roost (~/.local/share/roost)
    pub fn data_dir() -> PathBuf {
        // Respect XDG_DATA_HOME if set, otherwise use ~/.local/share
        std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                dirs::home_dir()
                    .map(|p| p.join(".local").join("share"))
                    .unwrap_or_else(|| PathBuf::from("."))
            })
            .join("roost")
    }

    /// Get the default config file path
    pub fn config_path() -> PathBuf {
        Self::config_dir().join("config.toml")
    }

    /// Load config from XDG config directory
    pub fn load() -> Result<Self> {
        let path = Self::config_path();

        if path.exists() {
            Self::load_from(&path)
        } else {
            // No config found, use defaults
            Ok(Self::default())
        }
    }

    /// Load config from a specific path
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("Invalid config in {}", path.display()))?;

        Ok(config)
    }

    /// Reject settings under which a live lock could look stale to another process
    pub fn validate(&self) -> Result<()> {
        let heartbeat = self.hybrid.heartbeat_interval_secs.max(1);
        let timeout = self.hybrid.lock_timeout_secs;
        if timeout <= 2 * heartbeat {
            bail!(
                "hybrid.lock_timeout_secs ({timeout}) must be more than twice hybrid.heartbeat_interval_secs ({heartbeat})"
            );
        }
        Ok(())
    }

    /// Get the database path, using default if not configured
    pub fn db_path(&self) -> PathBuf {
        self.database
            .path
            .clone()
            .unwrap_or_else(|| Self::data_dir().join("sessions.db"))
    }

    /// Defaults applied to newly created sessions
    pub fn session_defaults(&self) -> SessionDefaults {
        SessionDefaults {
            extensions: self
                .extensions
                .default_enabled
                .iter()
                .map(|name| name.trim().to_lowercase())
                .filter(|name| !name.is_empty())
                .collect(),
            provider: ProviderSnapshot {
                provider: self.provider.provider.clone(),
                model: self.provider.model.clone(),
            },
        }
    }

    /// Runtime settings for the coordinator
    pub fn coordinator(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            engine: self.engine.to_runtime(),
            heartbeat_interval: Duration::from_secs(self.hybrid.heartbeat_interval_secs.max(1)),
            lock_timeout: Duration::from_secs(self.hybrid.lock_timeout_secs),
            idle_timeout: match self.engine.idle_timeout_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
            owner_id: self.hybrid.owner_id.clone(),
            defaults: self.session_defaults(),
        }
    }

    /// Generate a default config file content
    pub fn default_toml() -> String {
        let data_dir = Self::data_dir().display().to_string();

        format!(
            r#"# roost configuration
# Location: ~/.config/roost/config.toml

[database]
# path = "{data_dir}/sessions.db"  # Default location

[engine]
binary = "goose"
# args = []
# working_dir = "~/projects"
start_timeout_secs = 10
stop_grace_secs = 5
idle_timeout_secs = 900
end_marker = "<<END>>"
await_ready = false

[provider]
provider = "openai"
model = "gpt-4"

[extensions]
default_enabled = ["developer"]
# [[extensions.custom]]
# name = "memory"
# description = "Long-term notes"

[relay]
buffer = 256

[hybrid]
heartbeat_interval_secs = 5
lock_timeout_secs = 20
# owner_id = "terminal"
"#
        )
    }

    /// Initialize config directory and create default config if needed
    pub fn init() -> Result<PathBuf> {
        let config_dir = Self::config_dir();
        let config_path = Self::config_path();
        let data_dir = Self::data_dir();

        // Create directories
        std::fs::create_dir_all(&config_dir)
            .with_context(|| format!("Failed to create config dir: {}", config_dir.display()))?;
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data dir: {}", data_dir.display()))?;

        // Write default config if it doesn't exist
        if !config_path.exists() {
            std::fs::write(&config_path, Self::default_toml())
                .with_context(|| format!("Failed to write config: {}", config_path.display()))?;
        }

        Ok(config_path)
    }
}
