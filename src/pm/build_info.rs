use chrono::{DateTime, Utc};
use std::fmt;

/// Where and when this binary was built, as stamped by the build script.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildInfo {
    pub version: &'static str,
    pub host: &'static str,
    pub epoch: Option<i64>,
}

impl BuildInfo {
    pub fn current() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION"),
            host: option_env!("PIDKEEPER_BUILD_HOST").unwrap_or("unknown"),
            epoch: option_env!("PIDKEEPER_BUILD_EPOCH").and_then(|s| s.parse().ok()),
        }
    }

    pub fn built_at(&self) -> Option<DateTime<Utc>> {
        self.epoch.and_then(|secs| DateTime::from_timestamp(secs, 0))
    }
}

impl fmt::Display for BuildInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pidkeeper {} built on {}", self.version, self.host)?;
        if let Some(at) = self.built_at() {
            write!(f, " at {} UTC", at.format("%Y-%m-%d %H:%M:%S"))?;
        }
        Ok(())
    }
}

pub fn banner() -> String {
    BuildInfo::current().to_string()
}
