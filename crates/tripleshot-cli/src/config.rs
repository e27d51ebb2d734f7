//! Configuration file management.
//!
//! TOML config at `~/.config/tripleshot/config.toml` with a resolution
//! chain: CLI flag > env var > config file > default.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use tripleshot_core::session::{
    DEFAULT_MAX_ADVERSARIAL_ROUNDS, DEFAULT_MIN_PASSING_SCORE, SessionConfig,
};

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub agent: AgentSection,
    #[serde(default)]
    pub defaults: DefaultsSection,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AgentSection {
    /// Agent command line, whitespace-separated (e.g. "claude -p").
    pub command: String,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            command: "claude -p".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsSection {
    pub base_branch: String,
    pub adversarial: bool,
    pub min_passing_score: i32,
    pub max_adversarial_rounds: u32,
}

impl Default for DefaultsSection {
    fn default() -> Self {
        Self {
            base_branch: "main".to_string(),
            adversarial: false,
            min_passing_score: DEFAULT_MIN_PASSING_SCORE,
            max_adversarial_rounds: DEFAULT_MAX_ADVERSARIAL_ROUNDS,
        }
    }
}

impl Default for ConfigFile {
    fn default() -> Self {
        Self {
            agent: AgentSection::default(),
            defaults: DefaultsSection::default(),
        }
    }
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// The tripleshot config directory.
///
/// Always XDG layout: `$XDG_CONFIG_HOME/tripleshot` or
/// `~/.config/tripleshot`, including on macOS.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("tripleshot");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("tripleshot")
}

pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

// -----------------------------------------------------------------------
// Read / write
// -----------------------------------------------------------------------

/// Load and parse the config file. Errors when it does not exist.
pub fn load_config() -> Result<ConfigFile> {
    let path = config_path();
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    let config: ConfigFile = toml::from_str(&contents).context("failed to parse config file")?;
    Ok(config)
}

/// Serialize and write the config file, creating parent dirs as needed.
/// Sets 0600 permissions on Unix.
pub fn save_config(config: &ConfigFile) -> Result<()> {
    let path = config_path();
    let dir = config_dir();
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create config directory {}", dir.display()))?;

    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(&path, &contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(&path, perms)
            .with_context(|| format!("failed to set permissions on {}", path.display()))?;
    }

    Ok(())
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

/// Flag-level overrides taken from the `run` subcommand.
#[derive(Debug, Default)]
pub struct RunOverrides {
    pub agent_cmd: Option<String>,
    pub base_branch: Option<String>,
    pub adversarial: bool,
    pub min_score: Option<i32>,
    pub max_rounds: Option<u32>,
    pub auto_approve: bool,
}

/// Fully resolved configuration, ready for use.
#[derive(Debug)]
pub struct TripleshotConfig {
    pub agent_command: Vec<String>,
    pub base_branch: String,
    pub session: SessionConfig,
}

impl TripleshotConfig {
    /// Resolve using the chain: CLI flag > env var > config file > default.
    ///
    /// - Agent command: `--agent-cmd` > `TRIPLESHOT_AGENT_CMD` >
    ///   `config.agent.command` > `"claude -p"`.
    /// - Base branch: `--base-branch` > `TRIPLESHOT_BASE_BRANCH` >
    ///   `config.defaults.base_branch` > `"main"`.
    pub fn resolve(overrides: &RunOverrides) -> Result<Self> {
        let file_config = load_config().ok();
        let defaults = file_config
            .as_ref()
            .map(|c| c.defaults.clone())
            .unwrap_or_default();

        let agent_raw = if let Some(ref cmd) = overrides.agent_cmd {
            cmd.clone()
        } else if let Ok(cmd) = std::env::var("TRIPLESHOT_AGENT_CMD") {
            cmd
        } else if let Some(ref cfg) = file_config {
            cfg.agent.command.clone()
        } else {
            AgentSection::default().command
        };
        let agent_command: Vec<String> =
            agent_raw.split_whitespace().map(str::to_owned).collect();
        if agent_command.is_empty() {
            anyhow::bail!("agent command is empty");
        }

        let base_branch = if let Some(ref branch) = overrides.base_branch {
            branch.clone()
        } else if let Ok(branch) = std::env::var("TRIPLESHOT_BASE_BRANCH") {
            branch
        } else {
            defaults.base_branch.clone()
        };

        let session = SessionConfig {
            auto_approve: overrides.auto_approve,
            adversarial: overrides.adversarial || defaults.adversarial,
            min_passing_score: overrides.min_score.unwrap_or(defaults.min_passing_score),
            max_adversarial_rounds: overrides
                .max_rounds
                .unwrap_or(defaults.max_adversarial_rounds),
        };

        Ok(Self {
            agent_command,
            base_branch,
            session,
        })
    }
}
