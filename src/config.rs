//! Configuration for piperelay.
//!
//! Configuration sources (highest priority first):
//! 1. Command-line overrides (--pipe, --session, --mode, ...)
//! 2. Environment variables (PIPERELAY_NAMED_PIPE, PIPERELAY_SESSION_ID, PIPERELAY_OPEN_MODE)
//! 3. Config file (.piperelay/config.yaml)
//! 4. Defaults (blocking open, generated session)
//!
//! Config file discovery:
//! - Searches the working directory and its parents for .piperelay/config.yaml
//! - Falls back to ~/.piperelay/config.yaml
//! - Pipe paths in the config file are relative to the project root (the
//!   directory containing .piperelay/)

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::domain::{PipeTarget, Session};
use crate::pipe::{OpenMode, WriterOptions};

/// Colon-separated list of named pipe paths
pub const ENV_NAMED_PIPE: &str = "PIPERELAY_NAMED_PIPE";
/// Externally supplied session id
pub const ENV_SESSION_ID: &str = "PIPERELAY_SESSION_ID";
/// `blocking` or `nonblocking`
pub const ENV_OPEN_MODE: &str = "PIPERELAY_OPEN_MODE";

const CONFIG_DIR: &str = ".piperelay";
const CONFIG_FILE: &str = "config.yaml";

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    pub version: String,
    #[serde(default)]
    pub pipes: Vec<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub writer: WriterConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WriterConfig {
    pub mode: Option<OpenMode>,
    pub open_timeout_ms: Option<u64>,
    pub exclusive: Option<bool>,
}

/// Values supplied on the command line
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub pipes: Vec<PathBuf>,
    pub session_id: Option<String>,
    pub mode: Option<OpenMode>,
    pub open_timeout_ms: Option<u64>,
    pub exclusive: bool,
}

/// Where configuration is read from
pub struct ConfigSources<F> {
    /// Environment lookup
    pub env: F,
    /// Directory the config file search starts from
    pub search_from: Option<PathBuf>,
    /// Home directory for the fallback config file
    pub home: Option<PathBuf>,
}

impl ConfigSources<fn(&str) -> Option<String>> {
    /// The real process environment, working directory and home
    pub fn system() -> Self {
        Self {
            env: process_env,
            search_from: std::env::current_dir().ok(),
            home: dirs::home_dir(),
        }
    }
}

fn process_env(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

/// Resolved configuration
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Pipe targets, in delivery order
    pub pipes: Vec<PipeTarget>,
    /// Session for this process
    pub session: Session,
    /// True when no session id was supplied and one was generated
    pub session_generated: bool,
    /// How writers acquire their pipes
    pub writer: WriterOptions,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
}

impl ResolvedConfig {
    /// Pipe targets, failing when none were configured
    pub fn targets(&self) -> Result<&[PipeTarget]> {
        if self.pipes.is_empty() {
            anyhow::bail!(
                "No named pipe configured: set {} or pass --pipe",
                ENV_NAMED_PIPE
            );
        }
        Ok(&self.pipes)
    }
}

/// Find config file by searching `start` and its parents, then the home directory
fn find_config_file(start: Option<&Path>, home: Option<&Path>) -> Option<PathBuf> {
    if let Some(start) = start {
        let mut current = start.to_path_buf();
        loop {
            let config_path = current.join(CONFIG_DIR).join(CONFIG_FILE);
            if config_path.exists() {
                return Some(config_path);
            }
            if !current.pop() {
                break;
            }
        }
    }

    home.map(|h| h.join(CONFIG_DIR).join(CONFIG_FILE))
        .filter(|p| p.exists())
}

/// Load and parse config file
pub fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to the project root
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
    }
}

/// Split a PATH-style list, dropping empty entries
fn split_pipe_list(value: &str) -> Vec<PathBuf> {
    std::env::split_paths(&OsString::from(value))
        .filter(|p| !p.as_os_str().is_empty())
        .collect()
}

/// Load configuration from the process environment
pub fn load(overrides: &Overrides) -> Result<ResolvedConfig> {
    load_with(overrides, &ConfigSources::system())
}

/// Load configuration from explicit sources
pub fn load_with<F>(overrides: &Overrides, sources: &ConfigSources<F>) -> Result<ResolvedConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let env = &sources.env;

    let config_file = find_config_file(sources.search_from.as_deref(), sources.home.as_deref());
    let file = match config_file {
        Some(ref path) => Some(load_config_file(path)?),
        None => None,
    };

    // Project root is the parent of .piperelay/
    let base_dir = config_file
        .as_deref()
        .and_then(Path::parent)
        .and_then(Path::parent)
        .unwrap_or(Path::new("."));

    // Pipes: overrides > env > file
    let pipes: Vec<PathBuf> = if !overrides.pipes.is_empty() {
        overrides.pipes.clone()
    } else if let Some(list) = env(ENV_NAMED_PIPE).filter(|v| !v.is_empty()) {
        split_pipe_list(&list)
    } else if let Some(ref file) = file {
        file.pipes.iter().map(|p| resolve_path(base_dir, p)).collect()
    } else {
        Vec::new()
    };

    // Session: overrides > env > file > generated
    let supplied_session = overrides
        .session_id
        .clone()
        .or_else(|| env(ENV_SESSION_ID).filter(|v| !v.is_empty()))
        .or_else(|| file.as_ref().and_then(|f| f.session_id.clone()));
    let session_generated = supplied_session.is_none();
    let session = Session::resolve(supplied_session).context("Invalid session id")?;

    // Open mode: overrides > env > file > default
    let mode = match overrides.mode {
        Some(mode) => mode,
        None => match env(ENV_OPEN_MODE).filter(|v| !v.is_empty()) {
            Some(raw) => raw
                .parse::<OpenMode>()
                .map_err(anyhow::Error::msg)
                .with_context(|| format!("Invalid {}", ENV_OPEN_MODE))?,
            None => file
                .as_ref()
                .and_then(|f| f.writer.mode)
                .unwrap_or_default(),
        },
    };

    let open_timeout_ms = overrides
        .open_timeout_ms
        .or_else(|| file.as_ref().and_then(|f| f.writer.open_timeout_ms));

    let exclusive = overrides.exclusive
        || file
            .as_ref()
            .and_then(|f| f.writer.exclusive)
            .unwrap_or(false);

    Ok(ResolvedConfig {
        pipes: pipes.into_iter().map(PipeTarget::new).collect(),
        session,
        session_generated,
        writer: WriterOptions {
            mode,
            open_timeout: open_timeout_ms.map(Duration::from_millis),
            exclusive,
        },
        config_file,
    })
}
