//! Deterministic workspace-to-port mapping.
//!
//! Each workspace always resolves to the same port so that a restarted host
//! finds (and can reclaim) its own stale server, while independent
//! workspaces on the same machine land on different ports.

use std::path::Path;

pub const BASE_PORT: u16 = 47339;
pub const PORT_RANGE: u16 = 1000;

/// Map a workspace root to a port in `[BASE_PORT, BASE_PORT + PORT_RANGE)`.
pub fn allocate_port(workspace_root: &Path) -> u16 {
    BASE_PORT + (hash_workspace(workspace_root) % PORT_RANGE as u32) as u16
}

// 32-bit string hash: h = (h << 5) - h + c, wrapping. Stable across runs,
// unlike the std hasher.
fn hash_workspace(path: &Path) -> u32 {
    let mut hash: i32 = 0;
    for ch in path.to_string_lossy().chars() {
        hash = hash
            .wrapping_shl(5)
            .wrapping_sub(hash)
            .wrapping_add(ch as i32);
    }
    hash.unsigned_abs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn same_workspace_same_port() {
        let path = PathBuf::from("/home/u/proj");
        assert_eq!(allocate_port(&path), allocate_port(&path));
    }

    #[test]
    fn port_stays_in_range() {
        for path in ["/", "/a", "/home/u/proj", "/tmp/x/y/z", "C:\\work\\repo"] {
            let port = allocate_port(Path::new(path));
            assert!(port >= BASE_PORT);
            assert!(port < BASE_PORT + PORT_RANGE);
        }
    }

    #[test]
    fn sibling_workspaces_get_distinct_ports() {
        let a = allocate_port(Path::new("/home/u/proj"));
        let b = allocate_port(Path::new("/home/u/proj2"));
        assert_ne!(a, b);
    }
}
