use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;

pub const WORK_DIR_ENV: &str = "CODE_INTERPRETER_WORK_DIR";
pub const PYTHON_ENV: &str = "CODE_INTERPRETER_PYTHON";
pub const TIMEOUT_ENV: &str = "CODE_INTERPRETER_TIMEOUT";
pub const STATIC_URL_ENV: &str = "CODE_INTERPRETER_STATIC_URL";

const DEFAULT_WORK_DIR_NAME: &str = "code_interpreter_ws";
const DEFAULT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_DRAIN_WAIT: Duration = Duration::from_secs(600);
const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(60);
const PYTHON_PROGRAM: &str = "python3";
const PYTHON_PROGRAM_FALLBACK: &str = "python";

#[derive(Debug, Clone)]
pub struct InterpreterConfig {
    /// Kernel working directory; descriptors, launch scripts and figures land here.
    pub workspace_root: PathBuf,
    pub python_program: PathBuf,
    /// Applied when a caller does not pass its own timeout. `None` disables arming.
    pub default_timeout_secs: Option<u64>,
    /// How long to wait for the next event when no timeout is armed.
    pub drain_wait: Duration,
    pub ready_timeout: Duration,
    /// Figures are referenced as `{static_url}/{file}` instead of local paths when set.
    pub static_url: Option<String>,
}

impl Default for InterpreterConfig {
    fn default() -> Self {
        Self {
            workspace_root: std::env::temp_dir().join(DEFAULT_WORK_DIR_NAME),
            python_program: PathBuf::from(PYTHON_PROGRAM),
            default_timeout_secs: Some(DEFAULT_TIMEOUT_SECS),
            drain_wait: DEFAULT_DRAIN_WAIT,
            ready_timeout: DEFAULT_READY_TIMEOUT,
            static_url: None,
        }
    }
}

impl InterpreterConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self {
            python_program: resolve_python_program(),
            ..Self::default()
        };
        if let Some(dir) = non_empty_env(WORK_DIR_ENV) {
            config.workspace_root = PathBuf::from(dir);
        }
        if let Some(python) = non_empty_env(PYTHON_ENV) {
            config.python_program = PathBuf::from(python);
        }
        if let Some(raw) = non_empty_env(TIMEOUT_ENV) {
            config.default_timeout_secs = parse_timeout_secs(&raw)?;
        }
        if let Some(url) = non_empty_env(STATIC_URL_ENV) {
            config.static_url = Some(url.trim_end_matches('/').to_string());
        }
        Ok(config)
    }

    pub fn with_workspace_root(mut self, dir: impl Into<PathBuf>) -> Self {
        self.workspace_root = dir.into();
        self
    }
}

/// `0` turns the timer off entirely.
pub fn parse_timeout_secs(raw: &str) -> Result<Option<u64>, ConfigError> {
    let value: u64 = raw
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidTimeout(raw.to_string()))?;
    Ok((value > 0).then_some(value))
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

/// Prefers a `.venv` in the current directory or its parents (stopping at `$HOME`), then
/// `python3`/`python` on `PATH`.
fn resolve_python_program() -> PathBuf {
    std::env::current_dir()
        .ok()
        .and_then(|cwd| find_dot_venv_python(&cwd))
        .or_else(|| find_program_on_path(PYTHON_PROGRAM))
        .or_else(|| find_program_on_path(PYTHON_PROGRAM_FALLBACK))
        .unwrap_or_else(|| PathBuf::from(PYTHON_PROGRAM))
}

fn find_dot_venv_python(start: &Path) -> Option<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let stop_at_home = home.filter(|home| start.starts_with(home));

    let mut dir = start.to_path_buf();
    loop {
        for candidate in [
            dir.join(".venv").join("bin").join("python"),
            dir.join(".venv").join("bin").join("python3"),
        ] {
            if candidate.is_file() {
                return Some(candidate);
            }
        }

        if let Some(stop) = stop_at_home.as_ref()
            && &dir == stop
        {
            break;
        }

        let Some(parent) = dir.parent() else {
            break;
        };
        if parent == dir {
            break;
        }
        dir = parent.to_path_buf();
    }
    None
}

fn find_program_on_path(name: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path) {
        let candidate = dir.join(name);
        if !candidate.is_file() {
            continue;
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Ok(meta) = std::fs::metadata(&candidate)
                && meta.permissions().mode() & 0o111 != 0
            {
                return Some(candidate);
            }
        }

        #[cfg(not(unix))]
        {
            return Some(candidate);
        }
    }
    None
}
