use crate::pm::pidset::PidSet;
use crate::pm::probe::{LivenessState, ProcessProbe, StopSignal};
use std::time::{Duration, Instant};
use tracing::{info, warn};

pub const DEFAULT_TIMEOUT_BASE: Duration = Duration::from_millis(100);

/// Wait multipliers applied to the timeout base before the forceful stop.
const ESCALATION: [u32; 3] = [1, 10, 30];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    Success,
    /// Members still `Active` after the full escalation.
    Failure { survivors: Vec<u32> },
}

impl Termination {
    pub fn is_success(&self) -> bool {
        matches!(self, Termination::Success)
    }
}

/// Graceful-then-forceful stop of a pid set. Blocks the calling thread.
///
/// Sequence: SIGTERM to every active member, wait `base`, then `base*10`, then `base*30`,
/// SIGKILL to whatever is still active, wait `base`, final probe. Each signal kind goes to a
/// member at most once; worst case blocks for `base*42`.
pub struct Terminator<'a> {
    probe: &'a dyn ProcessProbe,
    timeout_base: Duration,
}

impl<'a> Terminator<'a> {
    pub fn new(probe: &'a dyn ProcessProbe) -> Self {
        Self::with_timeout_base(probe, DEFAULT_TIMEOUT_BASE)
    }

    pub fn with_timeout_base(probe: &'a dyn ProcessProbe, timeout_base: Duration) -> Self {
        Self { probe, timeout_base }
    }

    /// Upper bound on how long `terminate` can block.
    pub fn worst_case(&self) -> Duration {
        self.timeout_base * (ESCALATION.iter().sum::<u32>() + 1)
    }

    pub fn terminate(&self, pids: &PidSet) -> Termination {
        let mut survivors = self.active_members(pids.iter());
        if survivors.is_empty() {
            // Reap anything we own that already finished.
            self.reap_all(pids);
            info!(target: "stop", pids = %pids, "attempt=stop outcome=not_running");
            return Termination::Success;
        }

        let t0 = Instant::now();
        for &pid in &survivors {
            self.send(pid, StopSignal::Graceful);
        }

        for mult in ESCALATION {
            std::thread::sleep(self.timeout_base * mult);
            self.reap_all(pids);
            survivors = self.active_members(survivors.into_iter());
            if survivors.is_empty() {
                info!(
                    target: "stop",
                    pids = %pids,
                    elapsed_ms = t0.elapsed().as_millis() as u64,
                    "outcome=grace_exit"
                );
                return Termination::Success;
            }
        }

        warn!(
            target: "stop",
            remaining = survivors.len(),
            elapsed_ms = t0.elapsed().as_millis() as u64,
            "outcome=grace_expired decision=kill"
        );
        for &pid in &survivors {
            self.send(pid, StopSignal::Forceful);
        }
        std::thread::sleep(self.timeout_base);
        self.reap_all(pids);

        survivors = self.active_members(survivors.into_iter());
        if survivors.is_empty() {
            info!(target: "stop", pids = %pids, "outcome=stopped");
            Termination::Success
        } else {
            for pid in &survivors {
                warn!(target: "stop", pid, "outcome=kill_failed");
            }
            Termination::Failure { survivors }
        }
    }

    fn active_members(&self, pids: impl Iterator<Item = u32>) -> Vec<u32> {
        pids.filter(|&pid| self.probe.state(pid) == LivenessState::Active)
            .collect()
    }

    fn send(&self, pid: u32, signal: StopSignal) {
        match self.probe.request_stop(pid, signal) {
            Ok(()) => info!(target: "stop", pid, sig = signal.as_str(), "outcome=signal_sent"),
            Err(e) => warn!(target: "stop", pid, sig = signal.as_str(), "outcome=signal_failed err={e:#}"),
        }
    }

    fn reap_all(&self, pids: &PidSet) {
        for pid in pids.iter() {
            self.probe.reap(pid);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::HashMap;

    /// Scripted process table. `stubborn` pids ignore SIGTERM; `immortal` pids ignore both.
    #[derive(Default)]
    struct FakeProbe {
        states: RefCell<HashMap<u32, LivenessState>>,
        stubborn: Vec<u32>,
        immortal: Vec<u32>,
        sent: RefCell<Vec<(u32, StopSignal)>>,
    }

    impl FakeProbe {
        fn with(states: &[(u32, LivenessState)]) -> Self {
            Self {
                states: RefCell::new(states.iter().copied().collect()),
                ..Self::default()
            }
        }

        fn count(&self, signal: StopSignal) -> usize {
            self.sent.borrow().iter().filter(|(_, s)| *s == signal).count()
        }
    }

    impl ProcessProbe for FakeProbe {
        fn state(&self, pid: u32) -> LivenessState {
            self.states
                .borrow()
                .get(&pid)
                .copied()
                .unwrap_or(LivenessState::Killed)
        }

        fn request_stop(&self, pid: u32, signal: StopSignal) -> anyhow::Result<()> {
            self.sent.borrow_mut().push((pid, signal));
            let survives = self.immortal.contains(&pid)
                || (signal == StopSignal::Graceful && self.stubborn.contains(&pid));
            if !survives {
                self.states.borrow_mut().insert(pid, LivenessState::Killed);
            }
            Ok(())
        }

        fn name(&self) -> &'static str {
            "fake"
        }
    }

    const BASE: Duration = Duration::from_millis(1);

    #[test]
    fn dead_set_sends_nothing() {
        let probe = FakeProbe::with(&[(2, LivenessState::Zombie)]);
        let t = Terminator::with_timeout_base(&probe, BASE);
        assert_eq!(t.terminate(&PidSet::new(vec![1, 2])), Termination::Success);
        assert!(probe.sent.borrow().is_empty());
    }

    #[test]
    fn cooperative_set_gets_only_sigterm() {
        let probe = FakeProbe::with(&[(1, LivenessState::Active), (2, LivenessState::Active)]);
        let t = Terminator::with_timeout_base(&probe, BASE);
        assert!(t.terminate(&PidSet::new(vec![1, 2])).is_success());
        assert_eq!(probe.count(StopSignal::Graceful), 2);
        assert_eq!(probe.count(StopSignal::Forceful), 0);
    }

    #[test]
    fn stubborn_member_gets_exactly_one_sigkill() {
        let mut probe = FakeProbe::with(&[(1, LivenessState::Active), (2, LivenessState::Active)]);
        probe.stubborn = vec![2];
        let t = Terminator::with_timeout_base(&probe, BASE);
        assert!(t.terminate(&PidSet::new(vec![1, 2])).is_success());
        assert_eq!(*probe.sent.borrow(), vec![
            (1, StopSignal::Graceful),
            (2, StopSignal::Graceful),
            (2, StopSignal::Forceful),
        ]);
    }

    #[test]
    fn immortal_member_is_reported() {
        let mut probe = FakeProbe::with(&[(1, LivenessState::Active), (9, LivenessState::Active)]);
        probe.immortal = vec![9];
        let t = Terminator::with_timeout_base(&probe, BASE);
        assert_eq!(
            t.terminate(&PidSet::new(vec![1, 9])),
            Termination::Failure { survivors: vec![9] }
        );
        assert_eq!(probe.count(StopSignal::Forceful), 1);
    }

    #[test]
    fn partially_dead_set_only_signals_live_members() {
        let probe = FakeProbe::with(&[(1, LivenessState::Active), (2, LivenessState::Killed)]);
        let t = Terminator::with_timeout_base(&probe, BASE);
        assert!(t.terminate(&PidSet::new(vec![1, 2])).is_success());
        assert_eq!(*probe.sent.borrow(), vec![(1, StopSignal::Graceful)]);
    }

    #[test]
    fn worst_case_is_42_bases() {
        let probe = FakeProbe::default();
        let t = Terminator::new(&probe);
        assert_eq!(t.worst_case(), Duration::from_millis(4200));
    }
}
