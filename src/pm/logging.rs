use tracing_subscriber::fmt::time::ChronoLocal;
use tracing_subscriber::EnvFilter;

/// Timestamp layout for every log line.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H:%M:%S%.3f";

/// Default filter directive for the requested verbosity.
pub fn default_directive(verbose: bool, silent: bool) -> &'static str {
    if silent {
        "error"
    } else if verbose {
        "debug"
    } else {
        "info"
    }
}

/// Install the stderr subscriber. `RUST_LOG` overrides the flags. Safe to call twice.
pub fn init(verbose: bool, silent: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbose, silent)));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(ChronoLocal::new(TIMESTAMP_FORMAT.to_string()))
        .with_target(true)
        .with_writer(std::io::stderr)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn silent_beats_verbose() {
        assert_eq!(default_directive(true, true), "error");
        assert_eq!(default_directive(true, false), "debug");
        assert_eq!(default_directive(false, false), "info");
    }
}
