use crate::pm::config::Config;
use crate::pm::error::KeeperError;
use crate::pm::launch::Launcher;
use crate::pm::lock::{LockRegistry, Takeover};
use crate::pm::pidset::PidSet;
use crate::pm::probe::{LivenessState, ProcessProbe};
use crate::pm::supervisor::Supervisor;
use crate::pm::terminate::{Termination, Terminator};
use serde::Serialize;
use std::path::PathBuf;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    Launched(PidSet),
    /// Forced start found the recorded set running and kept it.
    Adopted(PidSet),
}

impl StartOutcome {
    pub fn pids(&self) -> &PidSet {
        match self {
            StartOutcome::Launched(p) | StartOutcome::Adopted(p) => p,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PidStatus {
    pub pid: u32,
    pub state: LivenessState,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub basename: String,
    pub running: bool,
    pub locked: bool,
    pub pid_file: PathBuf,
    pub pids: Vec<PidStatus>,
    pub watcher: Option<PidStatus>,
}

impl StatusReport {
    pub fn render_text(&self) -> String {
        let mut out = format!(
            "{} {}",
            self.basename,
            if self.running { "[RUNNING]" } else { "[STOPPED]" }
        );
        if self.locked {
            out.push_str(" locked");
        }
        for p in &self.pids {
            out.push_str(&format!("\n  pid={} state={}", p.pid, p.state));
        }
        if let Some(w) = &self.watcher {
            out.push_str(&format!("\n  watcher={} state={}", w.pid, w.state));
        }
        out
    }
}

/// Start / kill / restart / status for one named instance.
pub struct Instance<'a> {
    cfg: &'a Config,
    registry: LockRegistry,
    probe: &'a dyn ProcessProbe,
}

impl<'a> Instance<'a> {
    pub fn new(cfg: &'a Config, probe: &'a dyn ProcessProbe) -> Self {
        Self {
            cfg,
            registry: LockRegistry::new(cfg.identity()),
            probe,
        }
    }

    pub fn registry(&self) -> &LockRegistry {
        &self.registry
    }

    /// Create state directories. Failures are logged and returned; none of them are fatal.
    pub fn prepare(&self) -> Vec<KeeperError> {
        let failures = self.registry.ensure_dirs();
        for f in &failures {
            warn!(target: "lock", "{f}");
        }
        failures
    }

    pub fn launcher(&self) -> Launcher<'_> {
        Launcher::new(self.cfg, &self.registry)
    }

    /// Start the program.
    ///
    /// Without `force` an existing lock refuses the start. With `force` a live watcher refuses
    /// it and a running recorded set is adopted. A partially alive set is stopped before the
    /// fresh launch so no member is left running untracked.
    pub fn start(&self, force: bool) -> anyhow::Result<StartOutcome> {
        if force {
            if let Takeover::Adopt(pids) = self.registry.takeover(self.probe, std::process::id())? {
                return Ok(StartOutcome::Adopted(pids));
            }
            let leftover = self.registry.running();
            let terminator = Terminator::with_timeout_base(self.probe, self.cfg.timeout_base);
            if let Termination::Failure { survivors } = terminator.terminate(&leftover) {
                return Err(KeeperError::TerminationFailure { survivors }.into());
            }
        }
        let pids = self.launcher().execute(force)?;
        Ok(StartOutcome::Launched(pids))
    }

    /// Hand a started set to the watch loop. Returns when the loop is stopped by a signal.
    pub fn watch(&self, started: &StartOutcome) -> anyhow::Result<()> {
        let mut sup = Supervisor::new(self.cfg, &self.registry, self.probe, started.pids().clone());
        sup.enter()?;
        sup.run()
    }

    /// Stop the instance and clear its files.
    ///
    /// With `watch` the recorded watcher goes first so it cannot relaunch what we stop. Every
    /// pid is attempted even after a failure; any survivor keeps the lock and pid files in place.
    pub fn kill(&self, watch: bool) -> anyhow::Result<()> {
        let terminator = Terminator::with_timeout_base(self.probe, self.cfg.timeout_base);
        let mut survivors: Vec<u32> = Vec::new();
        let me = std::process::id();
        let basename = &self.registry.identity().basename;

        let owner = self.registry.owner().filter(|&o| o != me);
        match owner {
            Some(owner) if watch => {
                info!(target: "stop", instance = %basename, owner, "attempt=stop_watcher");
                if let Termination::Failure { survivors: s } = terminator.terminate(&PidSet::new(vec![owner])) {
                    survivors.extend(s);
                }
            }
            Some(owner) if self.probe.state(owner) == LivenessState::Active => {
                warn!(
                    target: "stop",
                    instance = %basename,
                    owner,
                    "watcher still running; it will relaunch the program (use --watch to stop it too)"
                );
            }
            _ => {}
        }

        let pids = self.registry.running();
        info!(target: "stop", instance = %basename, pids = %pids, "attempt=stop");
        if let Termination::Failure { survivors: s } = terminator.terminate(&pids) {
            survivors.extend(s);
        }

        if !survivors.is_empty() {
            return Err(KeeperError::TerminationFailure { survivors }.into());
        }
        if watch {
            self.registry.release_owner()?;
        }
        self.registry.release()?;
        Ok(())
    }

    /// Kill (including any watcher) then start again.
    pub fn restart(&self) -> anyhow::Result<StartOutcome> {
        self.kill(true)?;
        self.start(false)
    }

    /// Liveness of the recorded set and watcher. Read-only.
    pub fn status(&self) -> StatusReport {
        let pids = self.registry.running();
        let states: Vec<PidStatus> = pids
            .iter()
            .map(|pid| PidStatus {
                pid,
                state: self.probe.state(pid),
            })
            .collect();
        let running = !states.is_empty() && states.iter().all(|p| p.state == LivenessState::Active);
        let watcher = self.registry.owner().map(|pid| PidStatus {
            pid,
            state: self.probe.state(pid),
        });
        StatusReport {
            basename: self.registry.identity().basename.clone(),
            running,
            locked: self.registry.is_locked(),
            pid_file: self.registry.identity().pid_path.clone(),
            pids: states,
            watcher,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pm::config::Settings;
    use crate::pm::probe::StopSignal;
    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::path::Path;

    /// Processes die on any signal unless listed as immortal.
    #[derive(Default)]
    struct Table {
        states: RefCell<HashMap<u32, LivenessState>>,
        immortal: Vec<u32>,
        sent: RefCell<Vec<u32>>,
    }

    impl Table {
        fn alive(pids: &[u32]) -> Self {
            Self {
                states: RefCell::new(pids.iter().map(|&p| (p, LivenessState::Active)).collect()),
                ..Self::default()
            }
        }
    }

    impl ProcessProbe for Table {
        fn state(&self, pid: u32) -> LivenessState {
            self.states.borrow().get(&pid).copied().unwrap_or(LivenessState::Killed)
        }

        fn request_stop(&self, pid: u32, _signal: StopSignal) -> anyhow::Result<()> {
            self.sent.borrow_mut().push(pid);
            if !self.immortal.contains(&pid) {
                self.states.borrow_mut().insert(pid, LivenessState::Killed);
            }
            Ok(())
        }

        fn name(&self) -> &'static str {
            "table"
        }
    }

    fn config(dir: &Path) -> Config {
        let mut s = Settings::default();
        s.lock_dir = dir.to_path_buf();
        s.pid_dir = dir.to_path_buf();
        s.log_dir = dir.to_path_buf();
        s.timestamper = None;
        s.terminate_timeout_ms = 1;
        Config::new(dir.join("worker"), vec![], None, s).unwrap()
    }

    #[test]
    fn kill_with_watch_stops_watcher_first_and_clears_files() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());
        let probe = Table::alive(&[900, 100]);
        let inst = Instance::new(&cfg, &probe);
        inst.registry().record(&PidSet::new(vec![100])).unwrap();
        inst.registry().record_owner(900).unwrap();

        inst.kill(true).unwrap();
        assert_eq!(*probe.sent.borrow(), vec![900, 100]);
        let id = inst.registry().identity();
        assert!(!id.lock_path.exists());
        assert!(!id.pid_path.exists());
        assert!(!id.owner_pid_path.exists());
    }

    #[test]
    fn failed_kill_keeps_files() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());
        let mut probe = Table::alive(&[100, 101]);
        probe.immortal = vec![101];
        let inst = Instance::new(&cfg, &probe);
        inst.registry().record(&PidSet::new(vec![100, 101])).unwrap();

        let err = inst.kill(false).unwrap_err();
        assert!(matches!(
            crate::pm::error::keeper_error(&err),
            Some(KeeperError::TerminationFailure { survivors }) if survivors == &vec![101]
        ));
        assert!(inst.registry().is_locked());
        assert_eq!(inst.registry().running(), PidSet::new(vec![100, 101]));
    }

    #[test]
    fn kill_repairs_stale_lock() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());
        let probe = Table::default();
        let inst = Instance::new(&cfg, &probe);
        inst.registry().record(&PidSet::new(vec![4242])).unwrap();

        inst.kill(false).unwrap();
        assert!(probe.sent.borrow().is_empty());
        assert!(!inst.registry().is_locked());
    }

    #[test]
    fn forced_start_adopts_running_set() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());
        let probe = Table::alive(&[300]);
        let inst = Instance::new(&cfg, &probe);
        inst.registry().record(&PidSet::new(vec![300])).unwrap();

        let out = inst.start(true).unwrap();
        assert_eq!(out, StartOutcome::Adopted(PidSet::new(vec![300])));
    }

    #[test]
    fn forced_start_stops_survivors_of_a_partial_set() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());
        let probe = Table::alive(&[300]);
        let inst = Instance::new(&cfg, &probe);
        inst.registry().record(&PidSet::new(vec![300, 301])).unwrap();

        // The program file does not exist, so the relaunch itself fails after the stop.
        let err = inst.start(true).unwrap_err();
        assert_eq!(*probe.sent.borrow(), vec![300]);
        assert_eq!(probe.state(300), LivenessState::Killed);
        assert!(matches!(
            crate::pm::error::keeper_error(&err),
            Some(KeeperError::SpawnFailure { .. })
        ));
    }

    #[test]
    fn forced_start_does_not_launch_over_an_immortal_survivor() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());
        let mut probe = Table::alive(&[300]);
        probe.immortal = vec![300];
        let inst = Instance::new(&cfg, &probe);
        inst.registry().record(&PidSet::new(vec![300, 301])).unwrap();

        let err = inst.start(true).unwrap_err();
        assert!(matches!(
            crate::pm::error::keeper_error(&err),
            Some(KeeperError::TerminationFailure { survivors }) if survivors == &vec![300]
        ));
        assert_eq!(inst.registry().running(), PidSet::new(vec![300, 301]));
        assert!(!inst.registry().identity().log_path.exists());
    }

    #[test]
    fn forced_start_refuses_live_watcher() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());
        let probe = Table::alive(&[900]);
        let inst = Instance::new(&cfg, &probe);
        inst.registry().record_owner(900).unwrap();

        let err = inst.start(true).unwrap_err();
        assert!(matches!(
            crate::pm::error::keeper_error(&err),
            Some(KeeperError::TakeoverConflict { owner: 900, .. })
        ));
    }

    #[test]
    fn status_reports_each_member() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());
        let probe = Table::alive(&[10]);
        let inst = Instance::new(&cfg, &probe);
        inst.registry().record(&PidSet::new(vec![10, 11])).unwrap();

        let report = inst.status();
        assert!(!report.running);
        assert!(report.locked);
        assert_eq!(report.pids[1].state, LivenessState::Killed);
        let text = report.render_text();
        assert!(text.starts_with("worker [STOPPED] locked"));
        assert!(text.contains("pid=11 state=KILLED"));
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["pids"][0]["state"], "active");
    }
}
