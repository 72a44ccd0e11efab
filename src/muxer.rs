//! Locating the `dotnet` host executable.
//!
//! Resolution order: the `DOTNET_HOST_PATH` the SDK sets for child tools,
//! then `DOTNET_ROOT`, then a walk over `PATH`. Nothing here runs the host;
//! if no candidate exists the tool refuses to start instead of failing one
//! attempt at a time.

use std::env;
use std::ffi::OsString;
use std::path::PathBuf;

use tracing::debug;

/// Platform-specific executable name for the host.
fn executable_name() -> &'static str {
    if cfg!(windows) { "dotnet.exe" } else { "dotnet" }
}

/// Resolves the `dotnet` host from the process environment.
pub fn locate() -> Option<PathBuf> {
    locate_with(|name| env::var_os(name))
}

fn locate_with(var: impl Fn(&str) -> Option<OsString>) -> Option<PathBuf> {
    if let Some(host) = var("DOTNET_HOST_PATH") {
        let candidate = PathBuf::from(host);
        if candidate.is_file() {
            debug!("dotnet host from DOTNET_HOST_PATH: {}", candidate.display());
            return Some(candidate);
        }
    }

    if let Some(root) = var("DOTNET_ROOT") {
        let candidate = PathBuf::from(root).join(executable_name());
        if candidate.is_file() {
            debug!("dotnet host from DOTNET_ROOT: {}", candidate.display());
            return Some(candidate);
        }
    }

    if let Some(path) = var("PATH") {
        for dir in env::split_paths(&path) {
            let candidate = dir.join(executable_name());
            if candidate.is_file() {
                debug!("dotnet host from PATH: {}", candidate.display());
                return Some(candidate);
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::fs;
    use std::path::Path;

    fn fake_host(dir: &Path) -> PathBuf {
        let path = dir.join(executable_name());
        fs::write(&path, "").unwrap();
        path
    }

    fn env_of(vars: &[(&str, OsString)]) -> HashMap<String, OsString> {
        vars.iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_host_path_takes_precedence() {
        let dir = tempfile::tempdir().unwrap();
        let host = fake_host(dir.path());
        let env = env_of(&[
            ("DOTNET_HOST_PATH", host.clone().into_os_string()),
            ("PATH", OsString::from("/usr/bin")),
        ]);

        let found = locate_with(|name| env.get(name).cloned());
        assert_eq!(found, Some(host));
    }

    #[test]
    fn test_dotnet_root_is_joined_with_executable_name() {
        let dir = tempfile::tempdir().unwrap();
        let host = fake_host(dir.path());
        let env = env_of(&[("DOTNET_ROOT", dir.path().as_os_str().to_os_string())]);

        let found = locate_with(|name| env.get(name).cloned());
        assert_eq!(found, Some(host));
    }

    #[test]
    fn test_path_walk_finds_the_host() {
        let empty = tempfile::tempdir().unwrap();
        let with_host = tempfile::tempdir().unwrap();
        let host = fake_host(with_host.path());

        let joined = env::join_paths([empty.path(), with_host.path()]).unwrap();
        let env = env_of(&[("PATH", joined)]);

        let found = locate_with(|name| env.get(name).cloned());
        assert_eq!(found, Some(host));
    }

    #[test]
    fn test_no_candidates_means_none() {
        let empty = tempfile::tempdir().unwrap();
        let env = env_of(&[("PATH", empty.path().as_os_str().to_os_string())]);

        let found = locate_with(|name| env.get(name).cloned());
        assert_eq!(found, None);
    }
}
