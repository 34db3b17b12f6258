use crate::pm::pidset::PidSet;
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use sysinfo::{Pid as SysPid, ProcessStatus, ProcessesToUpdate, System};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LivenessState {
    /// No process record exists for the id.
    Killed,
    Active,
    /// Finished but not yet reaped by its parent.
    Zombie,
}

impl LivenessState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LivenessState::Killed => "KILLED",
            LivenessState::Active => "ACTIVE",
            LivenessState::Zombie => "ZOMBIE",
        }
    }
}

impl fmt::Display for LivenessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopSignal {
    /// SIGTERM or the platform equivalent.
    Graceful,
    /// SIGKILL or the platform equivalent.
    Forceful,
}

impl StopSignal {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopSignal::Graceful => "SIGTERM",
            StopSignal::Forceful => "SIGKILL",
        }
    }
}

/// Process state and control for one host process model.
///
/// Implementations must treat a process that vanishes mid-query as `Killed` and a stop request
/// for a vanished process as success.
pub trait ProcessProbe {
    fn state(&self, pid: u32) -> LivenessState;

    /// True iff the set is non-empty and every member is `Active`.
    fn check(&self, pids: &PidSet) -> bool {
        !pids.is_empty() && pids.iter().all(|pid| self.state(pid) == LivenessState::Active)
    }

    fn request_stop(&self, pid: u32, signal: StopSignal) -> anyhow::Result<()>;

    /// Collect a finished child without blocking. Non-children are ignored.
    fn reap(&self, _pid: u32) {}

    fn name(&self) -> &'static str;
}

/// Pick the probe for this host once, at startup.
pub fn default_probe() -> Box<dyn ProcessProbe> {
    #[cfg(unix)]
    {
        if Path::new(PROC_ROOT).join("self").join("status").exists() {
            return Box::new(ProcfsProbe::new());
        }
    }
    Box::new(ProcessTableProbe::new())
}

pub const PROC_ROOT: &str = "/proc";

/// First `State:` line of a `/proc/<pid>/status` record, as its one-letter code.
///
/// Later `State:` lines and lines without a usable value are ignored.
pub fn parse_status_state(status: &str) -> Option<char> {
    let line = status.lines().find(|l| l.starts_with("State:"))?;
    line["State:".len()..].trim_start().chars().next()
}

fn state_from_code(code: Option<char>) -> LivenessState {
    match code {
        Some('Z') => LivenessState::Zombie,
        _ => LivenessState::Active,
    }
}

/// POSIX probe: reads the procfs status record and signals with `kill(2)`.
#[cfg(unix)]
#[derive(Debug, Clone)]
pub struct ProcfsProbe {
    root: PathBuf,
}

#[cfg(unix)]
impl ProcfsProbe {
    pub fn new() -> Self {
        Self::with_root(PROC_ROOT)
    }

    /// Probe against an alternate procfs tree. Signals still go to real processes.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn status_path(&self, pid: u32) -> PathBuf {
        self.root.join(pid.to_string()).join("status")
    }
}

#[cfg(unix)]
impl Default for ProcfsProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
impl ProcessProbe for ProcfsProbe {
    fn state(&self, pid: u32) -> LivenessState {
        if pid == 0 {
            return LivenessState::Killed;
        }
        let path = self.status_path(pid);
        match std::fs::read_to_string(&path) {
            Ok(s) => state_from_code(parse_status_state(&s)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => LivenessState::Killed,
            // Died between open and read (ESRCH), or the record went away with its directory.
            Err(_) if !path.exists() => LivenessState::Killed,
            Err(_) => LivenessState::Active,
        }
    }

    fn request_stop(&self, pid: u32, signal: StopSignal) -> anyhow::Result<()> {
        use nix::errno::Errno;
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let raw = i32::try_from(pid).map_err(|_| anyhow::anyhow!("pid {pid} out of range"))?;
        anyhow::ensure!(raw > 0, "refusing to signal pid {pid}");
        let sig = match signal {
            StopSignal::Graceful => Signal::SIGTERM,
            StopSignal::Forceful => Signal::SIGKILL,
        };
        match kill(Pid::from_raw(raw), sig) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(anyhow::anyhow!("kill pid={pid} sig={} failed: {e}", signal.as_str())),
        }
    }

    fn reap(&self, pid: u32) {
        use nix::sys::wait::{waitpid, WaitPidFlag};
        use nix::unistd::Pid;

        if let Ok(raw) = i32::try_from(pid) {
            // ECHILD for anything we did not spawn; nothing to do then.
            let _ = waitpid(Pid::from_raw(raw), Some(WaitPidFlag::WNOHANG));
        }
    }

    fn name(&self) -> &'static str {
        "procfs"
    }
}

/// Generic probe: enumerates the OS process table through `sysinfo`.
pub struct ProcessTableProbe {
    system: Mutex<System>,
}

impl ProcessTableProbe {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }

    fn with_table<R>(&self, f: impl FnOnce(&mut System) -> R) -> R {
        let mut g = self.system.lock().unwrap_or_else(|p| p.into_inner());
        f(&mut g)
    }
}

impl Default for ProcessTableProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessProbe for ProcessTableProbe {
    fn state(&self, pid: u32) -> LivenessState {
        self.with_table(|sys| {
            sys.refresh_processes(ProcessesToUpdate::All, true);
            match sys.process(SysPid::from_u32(pid)) {
                None => LivenessState::Killed,
                Some(p) if p.status() == ProcessStatus::Zombie => LivenessState::Zombie,
                Some(_) => LivenessState::Active,
            }
        })
    }

    fn check(&self, pids: &PidSet) -> bool {
        if pids.is_empty() {
            return false;
        }
        // One listing for the whole set.
        self.with_table(|sys| {
            sys.refresh_processes(ProcessesToUpdate::All, true);
            pids.iter().all(|pid| {
                sys.process(SysPid::from_u32(pid))
                    .is_some_and(|p| p.status() != ProcessStatus::Zombie)
            })
        })
    }

    fn request_stop(&self, pid: u32, signal: StopSignal) -> anyhow::Result<()> {
        self.with_table(|sys| {
            let spid = SysPid::from_u32(pid);
            sys.refresh_processes(ProcessesToUpdate::Some(&[spid]), true);
            let Some(p) = sys.process(spid) else {
                return Ok(());
            };
            let sig = match signal {
                StopSignal::Graceful => sysinfo::Signal::Term,
                StopSignal::Forceful => sysinfo::Signal::Kill,
            };
            // Platforms without a graceful signal fall back to a plain kill.
            let sent = p.kill_with(sig).unwrap_or_else(|| p.kill());
            anyhow::ensure!(sent, "stop request pid={pid} sig={} was not delivered", signal.as_str());
            Ok(())
        })
    }

    fn name(&self) -> &'static str {
        "process-table"
    }
}
