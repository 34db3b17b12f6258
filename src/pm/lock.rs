use crate::pm::config::SUPERVISOR_NAME;
use crate::pm::error::KeeperError;
use crate::pm::pidset::PidSet;
use crate::pm::probe::{LivenessState, ProcessProbe};
use anyhow::Context as _;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// File triad (plus the watcher's own pid-file) for one named instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceIdentity {
    pub basename: String,
    pub lock_path: PathBuf,
    pub pid_path: PathBuf,
    pub log_path: PathBuf,
    /// Pid-file of the supervising pidkeeper process, not of the program.
    pub owner_pid_path: PathBuf,
}

impl InstanceIdentity {
    pub fn new(basename: &str, lock_dir: &Path, pid_dir: &Path, log_dir: &Path) -> Self {
        Self {
            basename: basename.to_string(),
            lock_path: lock_dir.join(format!("{basename}.lock")),
            pid_path: pid_dir.join(format!("{basename}.pid")),
            log_path: log_dir.join(format!("{basename}.log")),
            owner_pid_path: pid_dir.join(format!("{SUPERVISOR_NAME}_{basename}.pid")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquire {
    Accepted,
    Rejected,
}

/// What a forced start found already running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Takeover {
    /// Nothing live; launch a fresh copy.
    Launch,
    /// The recorded pid set is running; keep it.
    Adopt(PidSet),
}

/// Lock/pid-file bookkeeping. Best-effort and non-atomic: the filesystem is the only
/// coordination primitive and concurrent invocations may race between check and create.
#[derive(Debug, Clone)]
pub struct LockRegistry {
    id: InstanceIdentity,
}

impl LockRegistry {
    pub fn new(id: InstanceIdentity) -> Self {
        Self { id }
    }

    pub fn identity(&self) -> &InstanceIdentity {
        &self.id
    }

    /// Create the lock/pid/log directories. Failures are returned, not raised; callers log
    /// them and carry on.
    pub fn ensure_dirs(&self) -> Vec<KeeperError> {
        let mut failures = Vec::new();
        let dirs = [&self.id.lock_path, &self.id.pid_path, &self.id.log_path]
            .into_iter()
            .filter_map(|p| p.parent());
        for dir in dirs {
            if dir.as_os_str().is_empty() || dir.is_dir() {
                continue;
            }
            if let Err(e) = fs::create_dir_all(dir) {
                failures.push(KeeperError::DirectoryCreation {
                    path: dir.to_path_buf(),
                    reason: e.to_string(),
                });
            }
        }
        failures
    }

    pub fn is_locked(&self) -> bool {
        self.id.lock_path.exists()
    }

    /// Pid set recorded for the program.
    pub fn running(&self) -> PidSet {
        read_pid_file(&self.id.pid_path)
    }

    pub fn acquire(&self, force: bool) -> Acquire {
        if !force && self.is_locked() {
            debug!(target: "lock", lock = %self.id.lock_path.display(), "attempt=acquire outcome=rejected");
            return Acquire::Rejected;
        }
        Acquire::Accepted
    }

    /// Persist a freshly launched pid set: pid-file first, then the empty lock marker.
    pub fn record(&self, pids: &PidSet) -> anyhow::Result<()> {
        fs::write(&self.id.pid_path, pids.render())
            .with_context(|| format!("write pid file {}", self.id.pid_path.display()))?;
        fs::File::create(&self.id.lock_path)
            .with_context(|| format!("create lock file {}", self.id.lock_path.display()))?;
        info!(target: "lock", pids = %pids, pid_file = %self.id.pid_path.display(), "outcome=recorded");
        Ok(())
    }

    /// Remove lock and pid files. Only call once every owned process is confirmed dead.
    pub fn release(&self) -> anyhow::Result<()> {
        remove_if_exists(&self.id.lock_path)?;
        remove_if_exists(&self.id.pid_path)?;
        info!(target: "lock", lock = %self.id.lock_path.display(), "outcome=released");
        Ok(())
    }

    /// Pid of the supervising process, if one is recorded.
    pub fn owner(&self) -> Option<u32> {
        read_pid_file(&self.id.owner_pid_path).iter().next()
    }

    pub fn record_owner(&self, pid: u32) -> anyhow::Result<()> {
        fs::write(&self.id.owner_pid_path, PidSet::new(vec![pid]).render())
            .with_context(|| format!("write owner pid file {}", self.id.owner_pid_path.display()))
    }

    pub fn release_owner(&self) -> anyhow::Result<()> {
        remove_if_exists(&self.id.owner_pid_path)
    }

    /// Forced-start arbitration.
    ///
    /// A live watcher other than `self_pid` means another supervisor owns the instance and the
    /// caller must back off. Otherwise a running recorded pid set is adopted as-is.
    pub fn takeover(&self, probe: &dyn ProcessProbe, self_pid: u32) -> Result<Takeover, KeeperError> {
        if let Some(owner) = self.owner() {
            if owner != self_pid && probe.state(owner) == LivenessState::Active {
                warn!(target: "lock", owner, "attempt=takeover outcome=conflict");
                return Err(KeeperError::TakeoverConflict {
                    basename: self.id.basename.clone(),
                    owner,
                });
            }
        }
        let pids = self.running();
        if probe.check(&pids) {
            info!(target: "lock", pids = %pids, "attempt=takeover outcome=adopted");
            Ok(Takeover::Adopt(pids))
        } else {
            Ok(Takeover::Launch)
        }
    }
}

/// Pid set in a pid-file; empty when the file is missing or unreadable.
pub fn read_pid_file(path: &Path) -> PidSet {
    match fs::read_to_string(path) {
        Ok(s) => PidSet::parse(&s),
        Err(e) => {
            if e.kind() != io::ErrorKind::NotFound {
                debug!(target: "lock", path = %path.display(), "outcome=unreadable err={e}");
            }
            PidSet::default()
        }
    }
}

fn remove_if_exists(path: &Path) -> anyhow::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("remove {}", path.display())),
    }
}
