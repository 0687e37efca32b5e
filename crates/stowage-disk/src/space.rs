//! Free space of the volume holding a store

use std::io;
use std::path::Path;

/// Bytes available to unprivileged users on the volume containing `path`
#[cfg(unix)]
#[allow(clippy::useless_conversion)]
pub fn available_bytes(path: &Path) -> io::Result<u64> {
    let stat = nix::sys::statvfs::statvfs(path).map_err(io::Error::from)?;
    Ok(u64::from(stat.blocks_available()).saturating_mul(u64::from(stat.fragment_size())))
}

#[cfg(not(unix))]
pub fn available_bytes(_path: &Path) -> io::Result<u64> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "free space probing is only supported on Unix",
    ))
}

/// Size budget that leaves `target_free` bytes free on the volume
///
/// Returns `None` when the volume already has enough free space.
pub fn budget_for_free_space(stored: u64, available: u64, target_free: u64) -> Option<u64> {
    if target_free == 0 || available >= target_free {
        return None;
    }
    Some(stored.saturating_sub(target_free - available))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_budget_for_free_space() {
        assert_eq!(budget_for_free_space(1000, 500, 0), None);
        assert_eq!(budget_for_free_space(1000, 500, 500), None);
        assert_eq!(budget_for_free_space(1000, 500, 800), Some(700));
        assert_eq!(budget_for_free_space(100, 0, 800), Some(0));
    }

    #[cfg(unix)]
    #[test]
    fn test_available_bytes() {
        let dir = tempfile::tempdir().unwrap();
        assert!(available_bytes(dir.path()).is_ok());
        assert!(available_bytes(&dir.path().join("missing")).is_err());
    }
}
