use std::env;
use std::fs;
use std::time::{SystemTime, UNIX_EPOCH};

/// Seconds since the epoch; `SOURCE_DATE_EPOCH` pins it for reproducible builds.
fn build_epoch() -> u64 {
    env::var("SOURCE_DATE_EPOCH")
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or_else(|| {
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0)
        })
}

fn non_empty(s: String) -> Option<String> {
    let s = s.trim().to_string();
    (!s.is_empty()).then_some(s)
}

fn build_host() -> String {
    ["HOSTNAME", "HOST"]
        .iter()
        .find_map(|k| env::var(k).ok().and_then(non_empty))
        .or_else(|| fs::read_to_string("/etc/hostname").ok().and_then(non_empty))
        .unwrap_or_else(|| "unknown".to_string())
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-env-changed=SOURCE_DATE_EPOCH");
    println!("cargo:rustc-env=PIDKEEPER_BUILD_EPOCH={}", build_epoch());
    println!("cargo:rustc-env=PIDKEEPER_BUILD_HOST={}", build_host());
}
