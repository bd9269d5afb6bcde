//! IPMsg Node -- library crate for the LAN messenger core.
//!
//! Re-exports all internal modules so integration tests and the binary
//! can reach discovery, presence, delivery, transfer and config types.

pub mod config;
pub mod connection;
pub mod delivery;
pub mod discovery;
pub mod file_transfer;
pub mod node;
pub mod presence;
pub mod recall;
pub mod store;
pub mod transport;
pub mod typing;

use std::path::PathBuf;

pub use node::Node;

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs_or_home() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

pub fn dirs_or_home() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_tilde_leaves_plain_paths() {
        assert_eq!(expand_tilde("/etc/ipmsg.toml"), PathBuf::from("/etc/ipmsg.toml"));
        assert_eq!(expand_tilde("relative/x"), PathBuf::from("relative/x"));
    }

    #[test]
    fn test_expand_tilde_uses_home() {
        if let Some(home) = dirs_or_home() {
            assert_eq!(expand_tilde("~/.ipmsg/config.toml"), home.join(".ipmsg/config.toml"));
        }
    }
}
