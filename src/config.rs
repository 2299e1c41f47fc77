use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::errors::SupervisorError;

/// Launch parameters for one supervised upstream process.
///
/// The host integration builds this once per site and hands it to
/// [`crate::ProcessSupervisor::new`], which validates it and fills in
/// defaults. All fields are immutable afterwards.
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    /// Working directory of the site. Required.
    pub directory: PathBuf,
    /// Executable to run. Bare names are resolved through `PATH` during
    /// validation.
    pub program: String,
    /// Argument vector for the server process. The tokens `{port}` and
    /// `{location}` are substituted when the process is started.
    pub args: Vec<String>,
    /// Optional one-shot preparation command (argv) run to completion before
    /// each spawn, e.g. a dependency install.
    pub prepare: Option<Vec<String>>,
    /// Environment entries merged over the inherited environment.
    pub env: HashMap<String, String>,
    /// Public URL of the site, passed to the child via `{location}`.
    pub location: String,
    /// Inactivity period after which the process is stopped.
    pub idle_timeout: Duration,
    /// Tick interval of the idle monitor.
    pub poll_interval: Duration,
    /// Grace period between the termination request and a forced kill.
    pub stop_timeout: Duration,
    /// Delay before the idle monitor performs its first check.
    pub startup_grace: Duration,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::new(),
            program: String::new(),
            args: Vec::new(),
            prepare: None,
            env: HashMap::new(),
            location: String::new(),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            startup_grace: Duration::ZERO,
        }
    }
}

pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(2 * 60 * 60);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(5);

impl UpstreamConfig {
    /// Checks required fields, resolves the program through `PATH` when it
    /// carries no path component, and replaces zero durations with defaults.
    pub fn validate(&mut self) -> Result<(), SupervisorError> {
        if self.directory.as_os_str().is_empty() {
            return Err(SupervisorError::InvalidConfig(
                "directory is required".to_string(),
            ));
        }
        if self.program.is_empty() {
            return Err(SupervisorError::InvalidConfig(
                "program is required".to_string(),
            ));
        }
        if let Some(prepare) = &self.prepare {
            if prepare.is_empty() {
                return Err(SupervisorError::InvalidConfig(
                    "preparation command cannot be empty".to_string(),
                ));
            }
        }

        let resolved = resolve_program(&self.program).ok_or_else(|| {
            SupervisorError::InvalidConfig(format!("program not found: {}", self.program))
        })?;
        self.program = resolved.display().to_string();

        if self.idle_timeout.is_zero() {
            self.idle_timeout = DEFAULT_IDLE_TIMEOUT;
        }
        if self.poll_interval.is_zero() {
            self.poll_interval = DEFAULT_POLL_INTERVAL;
        }
        if self.stop_timeout.is_zero() {
            self.stop_timeout = DEFAULT_STOP_TIMEOUT;
        }
        Ok(())
    }
}

fn resolve_program(program: &str) -> Option<PathBuf> {
    let candidate = Path::new(program);
    if candidate.components().count() > 1 {
        return candidate.exists().then(|| candidate.to_path_buf());
    }

    let paths = env::var_os("PATH")?;
    env::split_paths(&paths)
        .map(|dir| dir.join(program))
        .find(|full| is_executable(full))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    path.metadata()
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::time::Duration;

    use super::{
        resolve_program, UpstreamConfig, DEFAULT_IDLE_TIMEOUT, DEFAULT_POLL_INTERVAL,
        DEFAULT_STOP_TIMEOUT,
    };

    #[test]
    fn validate_rejects_missing_directory() {
        let mut config = UpstreamConfig {
            program: "sh".to_string(),
            ..UpstreamConfig::default()
        };
        let err = config
            .validate()
            .expect_err("expected empty directory to be rejected");
        assert!(
            err.to_string().contains("directory is required"),
            "unexpected error: {err}"
        );
    }

    #[test]
    fn validate_rejects_missing_program() {
        let mut config = UpstreamConfig {
            directory: PathBuf::from("."),
            ..UpstreamConfig::default()
        };
        let err = config
            .validate()
            .expect_err("expected empty program to be rejected");
        assert!(
            err.to_string().contains("program is required"),
            "unexpected error: {err}"
        );
    }

    #[test]
    fn validate_rejects_empty_preparation_command() {
        let mut config = UpstreamConfig {
            directory: PathBuf::from("."),
            program: "sh".to_string(),
            prepare: Some(Vec::new()),
            ..UpstreamConfig::default()
        };
        let err = config
            .validate()
            .expect_err("expected empty preparation argv to be rejected");
        assert!(
            err.to_string().contains("preparation command"),
            "unexpected error: {err}"
        );
    }

    #[cfg(unix)]
    #[test]
    fn validate_resolves_bare_program_through_path() {
        let mut config = UpstreamConfig {
            directory: PathBuf::from("."),
            program: "sh".to_string(),
            ..UpstreamConfig::default()
        };
        config
            .validate()
            .expect("expected sh to resolve through PATH");
        assert!(
            config.program.contains('/'),
            "expected an absolute path, got {}",
            config.program
        );
    }

    #[test]
    fn validate_rejects_unknown_program() {
        let mut config = UpstreamConfig {
            directory: PathBuf::from("."),
            program: "definitely-not-a-real-binary-name".to_string(),
            ..UpstreamConfig::default()
        };
        let err = config
            .validate()
            .expect_err("expected unknown program to be rejected");
        assert!(
            err.to_string().contains("program not found"),
            "unexpected error: {err}"
        );
    }

    #[cfg(unix)]
    #[test]
    fn validate_applies_default_durations() {
        let mut config = UpstreamConfig {
            directory: PathBuf::from("."),
            program: "sh".to_string(),
            idle_timeout: Duration::ZERO,
            poll_interval: Duration::ZERO,
            stop_timeout: Duration::ZERO,
            ..UpstreamConfig::default()
        };
        config.validate().expect("expected validation to succeed");
        assert_eq!(config.idle_timeout, DEFAULT_IDLE_TIMEOUT);
        assert_eq!(config.poll_interval, DEFAULT_POLL_INTERVAL);
        assert_eq!(config.stop_timeout, DEFAULT_STOP_TIMEOUT);
    }

    #[test]
    fn resolve_program_accepts_existing_explicit_path() {
        let dir = std::env::temp_dir();
        let resolved = resolve_program(&dir.display().to_string());
        assert_eq!(resolved, Some(dir));
    }

    #[test]
    fn resolve_program_rejects_missing_explicit_path() {
        assert_eq!(resolve_program("/definitely/not/a/real/path"), None);
    }
}
