use crate::pm::error::KeeperError;
use crate::pm::lock::InstanceIdentity;
use serde::Deserialize;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name used for this tool's own files (owner pid-file prefix).
pub const SUPERVISOR_NAME: &str = "pidkeeper";

/// Defaults an invocation starts from: built-in values, then the YAML file, then CLI flags.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub lock_dir: PathBuf,
    pub pid_dir: PathBuf,
    pub log_dir: PathBuf,
    pub user: Option<String>,
    pub nice: Option<i32>,
    pub interpreter: Option<String>,
    /// Output timestamping helper looked up on `PATH`. `None` disables it.
    pub timestamper: Option<String>,
    pub watch_interval_ms: u64,
    pub terminate_timeout_ms: u64,
}

fn default_state_dir() -> PathBuf {
    std::env::temp_dir()
}

fn default_timestamper() -> Option<String> {
    Some("ts".to_string())
}

fn default_watch_interval_ms() -> u64 {
    1000
}

fn default_terminate_timeout_ms() -> u64 {
    100
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            lock_dir: default_state_dir(),
            pid_dir: default_state_dir(),
            log_dir: default_state_dir(),
            user: None,
            nice: None,
            interpreter: None,
            timestamper: default_timestamper(),
            watch_interval_ms: default_watch_interval_ms(),
            terminate_timeout_ms: default_terminate_timeout_ms(),
        }
    }
}

// -------- YAML file schema (strict) --------

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct DirsFile {
    #[serde(default)]
    lock: Option<PathBuf>,
    #[serde(default)]
    pid: Option<PathBuf>,
    #[serde(default)]
    log: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct SettingsFile {
    #[serde(default)]
    dirs: Option<DirsFile>,
    #[serde(default)]
    user: Option<String>,
    #[serde(default)]
    nice: Option<i32>,
    #[serde(default)]
    interpreter: Option<String>,
    /// Missing keeps the default helper; an empty string disables timestamping.
    #[serde(default)]
    timestamper: Option<String>,
    #[serde(default)]
    watch_interval_ms: Option<u64>,
    #[serde(default)]
    terminate_timeout_ms: Option<u64>,
}

pub fn load_settings(config_path: &Path) -> anyhow::Result<Settings> {
    let raw = std::fs::read_to_string(config_path)
        .map_err(|e| anyhow::anyhow!("failed to read config {}: {e}", config_path.display()))?;
    parse_settings(&raw, config_path.parent().unwrap_or_else(|| Path::new(".")))
        .map_err(|e| anyhow::anyhow!("failed to parse config {}: {e:#}", config_path.display()))
}

/// Parse a settings document; relative directories resolve against `base`.
pub fn parse_settings(raw: &str, base: &Path) -> anyhow::Result<Settings> {
    let file: SettingsFile = serde_yaml::from_str(raw)?;
    let mut s = Settings::default();

    if let Some(dirs) = file.dirs {
        let resolve = |p: PathBuf| if p.is_relative() { base.join(p) } else { p };
        if let Some(p) = dirs.lock {
            s.lock_dir = resolve(p);
        }
        if let Some(p) = dirs.pid {
            s.pid_dir = resolve(p);
        }
        if let Some(p) = dirs.log {
            s.log_dir = resolve(p);
        }
    }
    if let Some(u) = file.user {
        let u = u.trim().to_string();
        anyhow::ensure!(!u.is_empty(), "user must not be empty (omit it to run as the current user)");
        s.user = Some(u);
    }
    s.nice = file.nice;
    s.interpreter = file.interpreter.filter(|i| !i.trim().is_empty());
    if let Some(ts) = file.timestamper {
        s.timestamper = Some(ts.trim().to_string()).filter(|t| !t.is_empty());
    }
    if let Some(ms) = file.watch_interval_ms {
        anyhow::ensure!(ms > 0, "watch_interval_ms must be > 0");
        s.watch_interval_ms = ms;
    }
    if let Some(ms) = file.terminate_timeout_ms {
        anyhow::ensure!(ms > 0, "terminate_timeout_ms must be > 0");
        s.terminate_timeout_ms = ms;
    }
    Ok(s)
}

/// Everything one invocation needs, fixed at startup and passed by reference afterwards.
#[derive(Debug, Clone)]
pub struct Config {
    /// Target program as given on the command line. May be empty for kill/status by basename.
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub basename: String,
    pub lock_dir: PathBuf,
    pub pid_dir: PathBuf,
    pub log_dir: PathBuf,
    pub user: Option<String>,
    pub nice: Option<i32>,
    pub interpreter: Option<String>,
    pub timestamper: Option<String>,
    pub watch_interval: Duration,
    pub timeout_base: Duration,
}

impl Config {
    pub fn new(
        program: impl Into<PathBuf>,
        args: Vec<OsString>,
        basename: Option<String>,
        settings: Settings,
    ) -> anyhow::Result<Self> {
        let program = program.into();
        let basename = basename
            .map(|b| b.trim().to_string())
            .unwrap_or_else(|| default_basename(&program));
        if basename.is_empty() {
            return Err(KeeperError::Config(format!(
                "cannot derive a basename from {}; pass --basename",
                program.display()
            ))
            .into());
        }
        if basename.contains(std::path::is_separator) {
            return Err(KeeperError::Config(format!("basename {basename:?} must not contain a path separator")).into());
        }
        Ok(Self {
            program,
            args,
            basename,
            lock_dir: settings.lock_dir,
            pid_dir: settings.pid_dir,
            log_dir: settings.log_dir,
            user: settings.user,
            nice: settings.nice,
            interpreter: settings.interpreter,
            timestamper: settings.timestamper,
            watch_interval: Duration::from_millis(settings.watch_interval_ms),
            timeout_base: Duration::from_millis(settings.terminate_timeout_ms),
        })
    }

    pub fn identity(&self) -> InstanceIdentity {
        InstanceIdentity::new(&self.basename, &self.lock_dir, &self.pid_dir, &self.log_dir)
    }
}

/// File name of the program without its extension.
pub fn default_basename(program: &Path) -> String {
    program
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basename_strips_extension() {
        assert_eq!(default_basename(Path::new("/srv/app/worker.js")), "worker");
        assert_eq!(default_basename(Path::new("worker")), "worker");
        assert_eq!(default_basename(Path::new("/")), "");
    }

    #[test]
    fn no_program_and_no_basename_is_a_config_error() {
        let err = Config::new("", vec![], None, Settings::default()).unwrap_err();
        assert!(matches!(
            crate::pm::error::keeper_error(&err),
            Some(KeeperError::Config(_))
        ));
    }

    #[test]
    fn explicit_basename_wins() {
        let cfg = Config::new("/srv/worker.php", vec![], Some("queue".into()), Settings::default()).unwrap();
        assert_eq!(cfg.basename, "queue");
        let id = cfg.identity();
        assert!(id.lock_path.ends_with("queue.lock"));
        assert!(id.owner_pid_path.ends_with("pidkeeper_queue.pid"));
    }

    #[test]
    fn settings_file_resolves_relative_dirs() {
        let raw = "dirs:\n  lock: run\n  log: /var/log/app\nnice: 5\ntimestamper: ''\n";
        let s = parse_settings(raw, Path::new("/etc/pidkeeper")).unwrap();
        assert_eq!(s.lock_dir, PathBuf::from("/etc/pidkeeper/run"));
        assert_eq!(s.log_dir, PathBuf::from("/var/log/app"));
        assert_eq!(s.pid_dir, default_state_dir());
        assert_eq!(s.nice, Some(5));
        assert_eq!(s.timestamper, None);
        assert_eq!(s.watch_interval_ms, 1000);
    }

    #[test]
    fn settings_file_rejects_unknown_keys() {
        assert!(parse_settings("restart_policy: always\n", Path::new(".")).is_err());
        assert!(parse_settings("watch_interval_ms: 0\n", Path::new(".")).is_err());
    }
}
