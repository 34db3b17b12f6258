use crate::pm::config::Config;
use crate::pm::error::KeeperError;
use crate::pm::lock::{Acquire, LockRegistry};
use crate::pm::pidset::PidSet;
use anyhow::Context as _;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};
use tracing::{debug, info, warn};

/// Privilege-switch helper used when a target user is configured.
pub const SU_PROGRAM: &str = "su";
pub const NICE_PROGRAM: &str = "nice";

/// Fully resolved command for one launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchPlan {
    /// argv[0] is the program to exec; wrappers (nice, su) come first.
    pub argv: Vec<OsString>,
    pub working_directory: PathBuf,
    /// Absolute path of the target program.
    pub program: PathBuf,
}

impl LaunchPlan {
    pub fn command_line(&self) -> String {
        self.argv
            .iter()
            .map(|a| shell_quote(&a.to_string_lossy()))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Spawns the target program detached, with output going to the instance log.
pub struct Launcher<'a> {
    cfg: &'a Config,
    registry: &'a LockRegistry,
}

impl<'a> Launcher<'a> {
    pub fn new(cfg: &'a Config, registry: &'a LockRegistry) -> Self {
        Self { cfg, registry }
    }

    /// Resolve the program and compose wrappers. No side effects.
    pub fn plan(&self) -> anyhow::Result<LaunchPlan> {
        let cfg = self.cfg;
        if cfg.program.as_os_str().is_empty() || cfg.basename.is_empty() {
            return Err(KeeperError::Config("program path and basename must be set".to_string()).into());
        }
        let program = absolute_program(&cfg.program)?;
        let working_directory = program
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("/"));

        let mut inner: Vec<OsString> = Vec::new();
        if let Some(interp) = cfg.interpreter.as_deref() {
            inner.push(interp.into());
        }
        inner.push(program.clone().into_os_string());
        inner.extend(cfg.args.iter().cloned());

        let mut argv: Vec<OsString> = Vec::new();
        if let Some(n) = cfg.nice {
            if !(-20..=19).contains(&n) {
                return Err(KeeperError::Config(format!("nice priority {n} out of range -20..=19")).into());
            }
            argv.extend([NICE_PROGRAM.into(), "-n".into(), n.to_string().into()]);
        }
        match cfg.user.as_deref() {
            Some(user) => {
                // su resets little but may land in the user's home; cd back explicitly.
                let script = format!(
                    "cd {} && exec {}",
                    shell_quote(&working_directory.to_string_lossy()),
                    inner
                        .iter()
                        .map(|a| shell_quote(&a.to_string_lossy()))
                        .collect::<Vec<_>>()
                        .join(" ")
                );
                argv.extend([
                    SU_PROGRAM.into(),
                    "-s".into(),
                    "/bin/sh".into(),
                    "-c".into(),
                    script.into(),
                    user.into(),
                ]);
            }
            None => argv.extend(inner),
        }

        Ok(LaunchPlan {
            argv,
            working_directory,
            program,
        })
    }

    /// Launch the program and record its pid set.
    ///
    /// An invalid configuration is reported before the lock is consulted. Without `force` an
    /// existing lock file refuses the launch before anything is touched. A spawn failure
    /// writes neither pid nor lock file.
    pub fn execute(&self, force: bool) -> anyhow::Result<PidSet> {
        let id = self.registry.identity();
        let plan = self.plan()?;
        if self.registry.acquire(force) == Acquire::Rejected {
            return Err(KeeperError::LockContention {
                basename: id.basename.clone(),
                lock: id.lock_path.clone(),
            }
            .into());
        }
        check_user(self.cfg.user.as_deref())?;
        info!(
            target: "launch",
            instance = %id.basename,
            cwd = %plan.working_directory.display(),
            force,
            "attempt=start argv={}",
            plan.command_line()
        );

        let log = open_append_log(&id.log_path)?;
        let mut helper = self.spawn_timestamper(&log);

        let (stdout, stderr) = match helper.as_mut().and_then(|h| h.stdin.take()) {
            Some(stdin) => pipe_stdio(stdin, &log)?,
            None => (
                Stdio::from(log.try_clone().context("duplicate log handle")?),
                Stdio::from(log),
            ),
        };

        let mut cmd = Command::new(&plan.argv[0]);
        cmd.args(&plan.argv[1..])
            .current_dir(&plan.working_directory)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr);
        detach(&mut cmd);

        let mut child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => {
                if let Some(h) = helper.as_mut() {
                    let _ = h.kill();
                    let _ = h.wait();
                }
                return Err(KeeperError::SpawnFailure {
                    program: plan.program.display().to_string(),
                    reason: format!("kind={:?} os_error={:?} err={e}", e.kind(), e.raw_os_error()),
                }
                .into());
            }
        };

        let mut pids = PidSet::new(vec![child.id()]);
        if let Some(h) = helper.as_ref() {
            pids.push(h.id());
        }
        if let Err(e) = self.registry.record(&pids) {
            let _ = child.kill();
            let _ = child.wait();
            if let Some(h) = helper.as_mut() {
                let _ = h.kill();
                let _ = h.wait();
            }
            return Err(e);
        }
        info!(target: "launch", instance = %id.basename, pids = %pids, "outcome=started");
        // Children keep running after their handles drop; the watch loop reaps them.
        Ok(pids)
    }

    fn spawn_timestamper(&self, log: &fs::File) -> Option<Child> {
        let name = self.cfg.timestamper.as_deref()?;
        let Ok(path) = which::which(name) else {
            debug!(target: "launch", helper = name, "timestamper=unavailable");
            return None;
        };
        let out = log.try_clone().ok()?;
        let err = log.try_clone().ok()?;
        let mut cmd = Command::new(&path);
        cmd.stdin(Stdio::piped()).stdout(out).stderr(err);
        detach(&mut cmd);
        match cmd.spawn() {
            Ok(c) => Some(c),
            Err(e) => {
                warn!(target: "launch", helper = %path.display(), "timestamper=spawn_failed err={e}");
                None
            }
        }
    }
}

/// Absolute program path; canonical when it exists.
pub fn absolute_program(program: &Path) -> anyhow::Result<PathBuf> {
    let abs = if program.is_absolute() {
        program.to_path_buf()
    } else {
        std::env::current_dir()
            .context("resolve current directory")?
            .join(program)
    };
    Ok(fs::canonicalize(&abs).unwrap_or(abs))
}

fn open_append_log(path: &Path) -> anyhow::Result<fs::File> {
    fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open log file {}", path.display()))
}

#[cfg(unix)]
fn check_user(user: Option<&str>) -> anyhow::Result<()> {
    if let Some(u) = user {
        if users::get_user_by_name(u).is_none() {
            return Err(KeeperError::Config(format!("user not found: {u}")).into());
        }
    }
    Ok(())
}

#[cfg(not(unix))]
fn check_user(user: Option<&str>) -> anyhow::Result<()> {
    if user.is_some() {
        return Err(KeeperError::Config("switching user is only supported on unix".to_string()).into());
    }
    Ok(())
}

/// stdout and stderr of the program both feed the timestamper.
#[cfg(unix)]
fn pipe_stdio(stdin: ChildStdin, _log: &fs::File) -> anyhow::Result<(Stdio, Stdio)> {
    use std::os::fd::OwnedFd;
    let fd: OwnedFd = stdin.into();
    let dup = fd.try_clone().context("duplicate timestamper pipe")?;
    Ok((Stdio::from(fd), Stdio::from(dup)))
}

#[cfg(not(unix))]
fn pipe_stdio(stdin: ChildStdin, log: &fs::File) -> anyhow::Result<(Stdio, Stdio)> {
    let err = log.try_clone().context("duplicate log handle")?;
    Ok((Stdio::from(stdin), Stdio::from(err)))
}

/// New session for the child so it outlives our terminal.
#[cfg(unix)]
fn detach(cmd: &mut Command) {
    use std::os::unix::process::CommandExt;
    // SAFETY: setsid is async-signal-safe; nothing else runs between fork and exec.
    unsafe {
        cmd.pre_exec(|| {
            let _ = nix::unistd::setsid();
            Ok(())
        });
    }
}

#[cfg(not(unix))]
fn detach(_cmd: &mut Command) {}

/// Single-quote for `sh` when the word is not plainly safe.
pub fn shell_quote(s: &str) -> String {
    let safe = !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,+@%".contains(c));
    if safe {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', r"'\''"))
    }
}
