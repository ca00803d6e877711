//! Version info reported by `sensorhub version` and the startup log.

/// Crate version from Cargo.toml.
pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

/// Commit hash from `GIT_COMMIT` in the compile-time environment, or "unknown".
pub fn git_commit() -> &'static str {
    option_env!("GIT_COMMIT").unwrap_or("unknown")
}

/// Version, commit and platform in one line.
pub fn full() -> String {
    format!(
        "{RELEASE} (commit: {}, {}/{})",
        git_commit(),
        std::env::consts::OS,
        std::env::consts::ARCH,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_names_release_and_platform() {
        let v = full();
        assert!(v.starts_with(RELEASE));
        assert!(v.contains(std::env::consts::OS));
        assert!(v.contains(git_commit()));
    }
}
