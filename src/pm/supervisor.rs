use crate::pm::config::Config;
use crate::pm::launch::Launcher;
use crate::pm::lock::LockRegistry;
use crate::pm::pidset::PidSet;
use crate::pm::probe::ProcessProbe;
use crate::pm::terminate::{Termination, Terminator};
use anyhow::Context as _;
use std::fmt;
use std::future::Future;
use tokio::time::{self as tokio_time, MissedTickBehavior};
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Watching,
    Stopped,
}

impl Phase {
    fn as_str(&self) -> &'static str {
        match self {
            Phase::Idle => "IDLE",
            Phase::Watching => "WATCHING",
            Phase::Stopped => "STOPPED",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    Alive,
    Restarted(PidSet),
    /// Relaunch failed; the old set stays tracked and the next tick tries again.
    RestartFailed,
}

/// Watch loop for one instance. Owns the tracked pid set; ticks never overlap.
pub struct Supervisor<'a> {
    cfg: &'a Config,
    registry: &'a LockRegistry,
    probe: &'a dyn ProcessProbe,
    tracked: PidSet,
    phase: Phase,
    restarts: u64,
}

impl<'a> Supervisor<'a> {
    pub fn new(cfg: &'a Config, registry: &'a LockRegistry, probe: &'a dyn ProcessProbe, tracked: PidSet) -> Self {
        Self {
            cfg,
            registry,
            probe,
            tracked,
            phase: Phase::Idle,
            restarts: 0,
        }
    }

    pub fn tracked(&self) -> &PidSet {
        &self.tracked
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn restarts(&self) -> u64 {
        self.restarts
    }

    /// Record our own pid so a later `--kill --watch` can find this watcher.
    pub fn enter(&mut self) -> anyhow::Result<()> {
        let me = std::process::id();
        self.registry
            .record_owner(me)
            .context("record supervisor pid")?;
        self.phase = Phase::Watching;
        info!(
            target: "watch",
            instance = %self.registry.identity().basename,
            owner = me,
            pids = %self.tracked,
            interval_ms = self.cfg.watch_interval.as_millis() as u64,
            "phase={}",
            self.phase
        );
        Ok(())
    }

    /// One liveness check. Any dead member fails the whole set: every member is terminated and
    /// the program is relaunched with force.
    pub fn tick(&mut self) -> TickOutcome {
        if self.probe.check(&self.tracked) {
            return TickOutcome::Alive;
        }
        let basename = self.registry.identity().basename.clone();
        let states: Vec<String> = self
            .tracked
            .iter()
            .map(|pid| format!("{pid}:{}", self.probe.state(pid)))
            .collect();
        warn!(target: "watch", instance = %basename, "outcome=not_running states={}", states.join(","));

        let terminator = Terminator::with_timeout_base(self.probe, self.cfg.timeout_base);
        if let Termination::Failure { survivors } = terminator.terminate(&self.tracked) {
            // Best effort; the relaunch goes ahead regardless.
            error!(target: "watch", instance = %basename, ?survivors, "outcome=terminate_failed");
        }

        match Launcher::new(self.cfg, self.registry).execute(true) {
            Ok(pids) => {
                self.restarts += 1;
                info!(
                    target: "watch",
                    instance = %basename,
                    old = %self.tracked,
                    new = %pids,
                    restarts = self.restarts,
                    "outcome=restarted"
                );
                self.tracked = pids.clone();
                TickOutcome::Restarted(pids)
            }
            Err(e) => {
                error!(target: "watch", instance = %basename, "outcome=restart_failed err={e:#}");
                TickOutcome::RestartFailed
            }
        }
    }

    /// Tick every `watch_interval` until `shutdown` resolves.
    pub async fn watch(mut self, shutdown: impl Future<Output = ()>) -> anyhow::Result<()> {
        if self.phase != Phase::Watching {
            self.enter()?;
        }
        let mut interval = tokio_time::interval(self.cfg.watch_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; the program was just checked or launched.
        interval.tick().await;

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = interval.tick() => {
                    self.tick();
                }
            }
        }
        self.leave();
        Ok(())
    }

    /// Blocking entry point: current-thread runtime, stops on SIGTERM/SIGINT.
    pub fn run(self) -> anyhow::Result<()> {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context("build tokio runtime")?;
        rt.block_on(self.watch(shutdown_signal()))
    }

    fn leave(&mut self) {
        self.phase = Phase::Stopped;
        // A newer watcher may have replaced our record; leave theirs alone.
        if self.registry.owner() == Some(std::process::id()) {
            if let Err(e) = self.registry.release_owner() {
                warn!(target: "watch", "owner pid file not removed: {e:#}");
            }
        }
        info!(
            target: "watch",
            instance = %self.registry.identity().basename,
            restarts = self.restarts,
            "phase={}",
            self.phase
        );
    }
}

/// Resolves on the first SIGTERM or SIGINT (Ctrl-C elsewhere).
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal as unix_signal, SignalKind};
        match (unix_signal(SignalKind::terminate()), unix_signal(SignalKind::interrupt())) {
            (Ok(mut term), Ok(mut int)) => {
                tokio::select! {
                    _ = term.recv() => {}
                    _ = int.recv() => {}
                }
                return;
            }
            (Err(e), _) | (_, Err(e)) => {
                warn!(target: "watch", "signal handlers unavailable, falling back to ctrl_c: {e}");
            }
        }
    }
    let _ = tokio::signal::ctrl_c().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pm::config::Settings;
    use crate::pm::probe::{LivenessState, StopSignal};
    use std::time::Duration;

    struct AllActive;

    impl ProcessProbe for AllActive {
        fn state(&self, _pid: u32) -> LivenessState {
            LivenessState::Active
        }

        fn request_stop(&self, pid: u32, _signal: StopSignal) -> anyhow::Result<()> {
            panic!("unexpected stop request for {pid}");
        }

        fn name(&self) -> &'static str {
            "all-active"
        }
    }

    fn config(dir: &std::path::Path) -> Config {
        let mut s = Settings::default();
        s.lock_dir = dir.to_path_buf();
        s.pid_dir = dir.to_path_buf();
        s.log_dir = dir.to_path_buf();
        s.timestamper = None;
        s.watch_interval_ms = 10;
        Config::new("/nonexistent/worker", vec![], None, s).unwrap()
    }

    #[test]
    fn alive_set_is_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());
        let reg = LockRegistry::new(cfg.identity());
        let mut sup = Supervisor::new(&cfg, &reg, &AllActive, PidSet::new(vec![1234]));
        assert_eq!(sup.tick(), TickOutcome::Alive);
        assert_eq!(sup.tracked().as_slice(), &[1234]);
        assert_eq!(sup.restarts(), 0);
    }

    #[tokio::test]
    async fn watch_records_and_clears_owner() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());
        let reg = LockRegistry::new(cfg.identity());
        let sup = Supervisor::new(&cfg, &reg, &AllActive, PidSet::new(vec![1234]));
        let owner_path = reg.identity().owner_pid_path.clone();

        let stop = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            assert_eq!(reg.owner(), Some(std::process::id()));
        };
        sup.watch(stop).await.unwrap();
        assert!(!owner_path.exists());
    }
}
