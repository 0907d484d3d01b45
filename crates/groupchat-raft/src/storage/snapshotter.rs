//! Snapshot files: one checksummed record per snapshot,
//! `"{term:016x}-{index:016x}.snap"`, containing the full protobuf snapshot
//! (metadata plus encoded state).

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use protobuf::Message as PbMessage;
use raft::eraftpb::Snapshot;

use crate::error::{RaftError, Result};
use crate::storage::wal::WalSnapshot;

pub struct Snapshotter {
    dir: PathBuf,
}

impl Snapshotter {
    pub fn new(dir: &Path) -> Self {
        Self { dir: dir.to_path_buf() }
    }

    /// Persist a snapshot record. Durable before return.
    pub fn save_snap(&self, snapshot: &Snapshot) -> Result<()> {
        let meta = snapshot.get_metadata();
        let path = self.dir.join(snap_name(meta.term, meta.index));
        let body = snapshot.write_to_bytes()?;

        let mut buf = Vec::with_capacity(4 + body.len());
        // Infallible: Vec<u8> writes cannot error.
        let _ = buf.write_u32::<LittleEndian>(crc32fast::hash(&body));
        buf.extend_from_slice(&body);

        let mut file = OpenOptions::new().create(true).write(true).truncate(true).open(&path)?;
        file.write_all(&buf)?;
        file.sync_all()?;
        File::open(&self.dir)?.sync_all()?;
        log::info!("saved snapshot at term {} index {}", meta.term, meta.index);
        Ok(())
    }

    /// Load the newest snapshot whose `(term, index)` is referenced by a WAL
    /// snapshot marker, skipping unreadable files.
    pub fn load_newest_available(&self, wal_snaps: &[WalSnapshot]) -> Result<Option<Snapshot>> {
        let mut names: Vec<(u64, u64, PathBuf)> = Vec::new();
        if !self.dir.exists() {
            return Ok(None);
        }
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some((term, index)) = parse_snap_name(name) {
                names.push((term, index, entry.path()));
            }
        }
        names.sort_by_key(|(term, index, _)| (*index, *term));

        for (term, index, path) in names.into_iter().rev() {
            if !wal_snaps.iter().any(|s| s.term == term && s.index == index) {
                continue;
            }
            match read_snap(&path) {
                Ok(snapshot) => return Ok(Some(snapshot)),
                Err(e) => {
                    log::warn!("skipping unreadable snapshot {}: {e}", path.display());
                }
            }
        }
        Ok(None)
    }
}

fn read_snap(path: &Path) -> Result<Snapshot> {
    let mut data = Vec::new();
    File::open(path)?.read_to_end(&mut data)?;
    if data.len() < 4 {
        return Err(RaftError::Storage("snapshot file too small".to_string()));
    }
    let crc = (&data[..4]).read_u32::<LittleEndian>()?;
    let body = &data[4..];
    if crc32fast::hash(body) != crc {
        return Err(RaftError::Storage("snapshot checksum mismatch".to_string()));
    }
    Ok(Snapshot::parse_from_bytes(body)?)
}

fn snap_name(term: u64, index: u64) -> String {
    format!("{term:016x}-{index:016x}.snap")
}

fn parse_snap_name(name: &str) -> Option<(u64, u64)> {
    let stem = name.strip_suffix(".snap")?;
    let (term, index) = stem.split_once('-')?;
    Some((u64::from_str_radix(term, 16).ok()?, u64::from_str_radix(index, 16).ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::ensure_dir;

    fn snapshot(term: u64, index: u64, data: &[u8]) -> Snapshot {
        let mut snap = Snapshot::default();
        snap.mut_metadata().term = term;
        snap.mut_metadata().index = index;
        snap.set_data(data.to_vec().into());
        snap
    }

    fn snap_dir() -> (tempfile::TempDir, Snapshotter) {
        let tmp = tempfile::tempdir().expect("tempdir");
        let dir = tmp.path().join("snap");
        ensure_dir(&dir).expect("ensure dir");
        (tmp, Snapshotter::new(&dir))
    }

    #[test]
    fn roundtrip_through_wal_markers() {
        let (_tmp, snapshotter) = snap_dir();
        snapshotter.save_snap(&snapshot(1, 10, b"ten")).expect("save");
        snapshotter.save_snap(&snapshot(2, 20, b"twenty")).expect("save");

        // Only marked snapshots are loadable; the newest marked one wins.
        let markers = vec![
            WalSnapshot { index: 10, term: 1 },
            WalSnapshot { index: 20, term: 2 },
        ];
        let loaded = snapshotter
            .load_newest_available(&markers)
            .expect("load")
            .expect("some snapshot");
        assert_eq!(loaded.get_metadata().index, 20);
        assert_eq!(&loaded.data[..], b"twenty");
    }

    #[test]
    fn unmarked_snapshots_are_ignored() {
        let (_tmp, snapshotter) = snap_dir();
        snapshotter.save_snap(&snapshot(2, 20, b"unmarked")).expect("save");
        let loaded = snapshotter
            .load_newest_available(&[WalSnapshot { index: 10, term: 1 }])
            .expect("load");
        assert!(loaded.is_none());
        assert!(snapshotter.load_newest_available(&[]).expect("load").is_none());
    }

    #[test]
    fn corrupt_newest_falls_back_to_older() {
        let (_tmp, snapshotter) = snap_dir();
        snapshotter.save_snap(&snapshot(1, 10, b"good")).expect("save");
        snapshotter.save_snap(&snapshot(2, 20, b"bad")).expect("save");

        let bad = snapshotter.dir.join(snap_name(2, 20));
        let mut data = std::fs::read(&bad).expect("read");
        let last = data.len() - 1;
        data[last] ^= 0xff;
        std::fs::write(&bad, data).expect("corrupt");

        let markers = vec![
            WalSnapshot { index: 10, term: 1 },
            WalSnapshot { index: 20, term: 2 },
        ];
        let loaded = snapshotter
            .load_newest_available(&markers)
            .expect("load")
            .expect("older snapshot");
        assert_eq!(loaded.get_metadata().index, 10);
    }
}
