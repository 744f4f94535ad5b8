use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Config file looked up in the working directory when `--config` is not given.
pub const DEFAULT_CONFIG_FILE: &str = "relaunch.toml";

/// Top-level configuration loaded from relaunch.toml.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct RelaunchConfig {
    pub watch: WatchConfig,
    pub process: ProcessConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    pub path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProcessConfig {
    /// Program followed by its arguments.
    pub command: Vec<String>,
    pub on_clean_exit: CleanExitPolicy,
    /// Buffer stdout and log it after each run instead of passing it through.
    pub capture_stdout: bool,
}

/// What to do when the child exits with status 0 on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CleanExitPolicy {
    /// Stop supervising and exit with a failure status.
    #[default]
    Exit,
    /// Start the command again right away.
    Restart,
    /// Start the command again on the next change.
    Wait,
}

impl std::fmt::Display for CleanExitPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CleanExitPolicy::Exit => "exit",
            CleanExitPolicy::Restart => "restart",
            CleanExitPolicy::Wait => "wait",
        };
        f.write_str(name)
    }
}

/// Errors loading the config file.
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse {}: {}", path.display(), source)
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
        }
    }
}

// --- Default implementations ---

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("."),
        }
    }
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            on_clean_exit: CleanExitPolicy::default(),
            capture_stdout: true,
        }
    }
}

impl RelaunchConfig {
    /// Load config from `path`.
    ///
    /// A missing file yields defaults unless `required` is set (the user named
    /// the file explicitly). Parse errors are always reported.
    pub fn load(path: &Path, required: bool) -> Result<Self, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && !required => {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        };
        toml::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Apply command-line values on top of the file. An empty `command`
    /// keeps the one from the file.
    pub fn apply_overrides(&mut self, path: Option<PathBuf>, command: Vec<String>) {
        if let Some(path) = path {
            self.watch.path = path;
        }
        if !command.is_empty() {
            self.process.command = command;
        }
    }
}
