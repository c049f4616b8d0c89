//! System-path predicate shared by both ends.

use std::path::{Component, Path};

use serde::{Deserialize, Serialize};

/// Prefixes of the local namespace whose contents are assumed immutable for
/// the length of a session.
///
/// Only these are eligible for persistent caching on the remote side, and
/// the server refuses to expand prefetch closures outside them. A prefix
/// ending in `*` matches on the raw string; anything else matches on whole
/// path components.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemPaths {
    prefixes: Vec<String>,
}

impl Default for SystemPaths {
    fn default() -> Self {
        Self::new(Self::DEFAULT_PREFIXES.iter().map(ToString::to_string))
    }
}

impl SystemPaths {
    /// Conventional defaults: binaries, libraries, and the dynamic linker
    /// configuration.
    pub const DEFAULT_PREFIXES: &'static [&'static str] = &[
        "/bin",
        "/sbin",
        "/lib",
        "/lib32",
        "/lib64",
        "/usr",
        "/opt",
        "/etc/ld.so.*",
    ];

    /// Builds a predicate from explicit prefixes.
    pub fn new(prefixes: impl IntoIterator<Item = String>) -> Self {
        Self {
            prefixes: prefixes.into_iter().collect(),
        }
    }

    /// The configured prefixes, for transport in the handshake.
    #[must_use]
    pub fn prefixes(&self) -> &[String] {
        &self.prefixes
    }

    /// Whether the path falls under any configured prefix.
    #[must_use]
    pub fn contains(&self, path: &str) -> bool {
        self.prefixes.iter().any(|prefix| {
            prefix.strip_suffix('*').map_or_else(
                || is_component_prefix(prefix, path),
                |stem| path.starts_with(stem),
            )
        })
    }
}

fn is_component_prefix(prefix: &str, path: &str) -> bool {
    let mut want = Path::new(prefix).components().peekable();
    let mut have = Path::new(path).components();

    loop {
        match (want.next(), have.next()) {
            (None, _) => return true,
            (Some(_), None) => return false,
            (Some(Component::Normal(w)), Some(Component::Normal(h))) if w != h => return false,
            (Some(w), Some(h)) if w == h => {}
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_prefixes_match() {
        let paths = SystemPaths::default();

        assert!(paths.contains("/usr/bin/ffmpeg"));
        assert!(paths.contains("/usr"));
        assert!(paths.contains("/lib64/ld-linux-x86-64.so.2"));
        assert!(paths.contains("/etc/ld.so.cache"));
        assert!(paths.contains("/etc/ld.so.conf.d/libc.conf"));

        assert!(!paths.contains("/home/user/project"));
        assert!(!paths.contains("/etc/passwd"));
        assert!(!paths.contains("/tmp/usr"));
    }

    #[test]
    fn test_prefix_matches_whole_components() {
        let paths = SystemPaths::new(["/usr/lib".to_string()]);

        assert!(paths.contains("/usr/lib"));
        assert!(paths.contains("/usr/lib/libc.so.6"));
        assert!(!paths.contains("/usr/lib64"));
        assert!(!paths.contains("/usr"));
    }
}
