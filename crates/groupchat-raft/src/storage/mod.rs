//! Durable storage for the consensus core: a segmented write-ahead log and a
//! snapshot directory.

mod snapshotter;
mod wal;

pub use snapshotter::Snapshotter;
pub use wal::{ReplayedLog, Wal, WalSnapshot};

use std::fs;
use std::path::Path;

use crate::error::{RaftError, Result};

/// Create `dir` if missing and verify it is writable.
pub fn ensure_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir)?;
    let probe = dir.join(".touch");
    fs::write(&probe, b"")
        .map_err(|e| RaftError::Storage(format!("dir {} is not writable: {e}", dir.display())))?;
    fs::remove_file(&probe)?;
    Ok(())
}

/// Remove `dir` and recreate it empty.
pub fn ensure_empty_dir(dir: &Path) -> Result<()> {
    if dir.exists() {
        fs::remove_dir_all(dir)?;
    }
    ensure_dir(dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ensure_empty_dir_clears_contents() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let dir = tmp.path().join("wal");
        ensure_dir(&dir).expect("create");
        std::fs::write(dir.join("stale"), b"x").expect("write");
        ensure_empty_dir(&dir).expect("reset");
        assert_eq!(std::fs::read_dir(&dir).expect("read dir").count(), 0);
    }
}
