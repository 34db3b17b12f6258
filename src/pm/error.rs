use std::path::PathBuf;

/// Failures the start/kill/status flows report to the caller.
///
/// Plumbing inside the crate stays on `anyhow`; these variants sit at the bottom of the
/// error chain so callers can `downcast_ref::<KeeperError>()` and pick a status marker.
#[derive(Debug, thiserror::Error)]
pub enum KeeperError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("instance {basename} is already started (lock file {} exists)", lock.display())]
    LockContention { basename: String, lock: PathBuf },

    #[error("instance {basename} is already watched by pid {owner}")]
    TakeoverConflict { basename: String, owner: u32 },

    #[error("failed to spawn {program}: {reason}")]
    SpawnFailure { program: String, reason: String },

    #[error("processes survived termination: {}", format_pids(survivors))]
    TerminationFailure { survivors: Vec<u32> },

    #[error("failed to create directory {}: {reason}", path.display())]
    DirectoryCreation { path: PathBuf, reason: String },
}

fn format_pids(pids: &[u32]) -> String {
    pids.iter()
        .map(|p| p.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

impl KeeperError {
    /// Whether the invocation can carry on after reporting this error.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, KeeperError::DirectoryCreation { .. })
    }
}

/// Find the first `KeeperError` in an `anyhow` chain.
pub fn keeper_error(err: &anyhow::Error) -> Option<&KeeperError> {
    err.chain().find_map(|e| e.downcast_ref::<KeeperError>())
}
