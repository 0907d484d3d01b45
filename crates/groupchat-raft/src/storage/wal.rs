//! Append-only write-ahead log of Raft hard states and entries.
//!
//! Frame layout: `[len: u32 LE][crc32: u32 LE][type: u8][payload]`, where
//! `len` counts the type byte plus the payload and the checksum covers both.
//! A torn tail fails the checksum and truncates replay at the last valid
//! frame; everything before a valid frame is immutable.
//!
//! The log is segmented: `"{seq:016x}-{first_index:016x}.wal"`, cut when a
//! segment exceeds [`SEGMENT_SIZE_BYTES`]. Every segment starts with the
//! cluster metadata record so any retained suffix of segments is
//! self-describing. Snapshot markers gate which snapshot files are safe to
//! load and which segments [`Wal::release_to`] may delete.

use std::fs::{self, File, OpenOptions};
use std::io::{Cursor, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use protobuf::Message as PbMessage;
use raft::eraftpb::{Entry, HardState};

use crate::error::{RaftError, Result};

const SEGMENT_SIZE_BYTES: u64 = 64 * 1024 * 1024;
const FRAME_HEADER_SIZE: usize = 4 + 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum RecordType {
    /// Cluster metadata, JSON. First record of every segment.
    Metadata = 0,
    /// One Raft entry, protobuf.
    Entry = 1,
    /// Raft hard state, protobuf.
    HardState = 2,
    /// Snapshot marker `{index, term}`.
    Snapshot = 3,
}

impl TryFrom<u8> for RecordType {
    type Error = RaftError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::Metadata),
            1 => Ok(Self::Entry),
            2 => Ok(Self::HardState),
            3 => Ok(Self::Snapshot),
            other => Err(RaftError::Storage(format!("unknown wal record type {other}"))),
        }
    }
}

/// A `(index, term)` snapshot reference recorded in the WAL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WalSnapshot {
    pub index: u64,
    pub term: u64,
}

impl WalSnapshot {
    fn to_bytes(self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(16);
        // Infallible: Vec<u8> writes cannot error.
        let _ = buf.write_u64::<LittleEndian>(self.index);
        let _ = buf.write_u64::<LittleEndian>(self.term);
        buf
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(bytes);
        Ok(Self {
            index: cursor.read_u64::<LittleEndian>()?,
            term: cursor.read_u64::<LittleEndian>()?,
        })
    }
}

/// Everything recovered by [`Wal::open`].
#[derive(Debug)]
pub struct ReplayedLog {
    pub metadata: Vec<u8>,
    pub hard_state: HardState,
    pub entries: Vec<Entry>,
}

pub struct Wal {
    dir: PathBuf,
    file: File,
    seq: u64,
    segment_size: u64,
    size: u64,
    /// Index of the last entry record ever written.
    last_index: u64,
    metadata: Vec<u8>,
    prev_hard_state: HardState,
}

impl Wal {
    /// True if `dir` contains any WAL segment.
    pub fn exists(dir: &Path) -> bool {
        segment_files(dir).map(|s| !s.is_empty()).unwrap_or(false)
    }

    /// Create a fresh WAL in an empty directory, writing the metadata record.
    pub fn create(dir: &Path, metadata: &[u8]) -> Result<Wal> {
        if !segment_files(dir)?.is_empty() {
            return Err(RaftError::Storage(format!(
                "wal dir {} is not empty",
                dir.display()
            )));
        }
        let path = dir.join(segment_name(0, 0));
        let mut file = OpenOptions::new().create_new(true).write(true).open(&path)?;
        let record = encode_frame(RecordType::Metadata, metadata);
        file.write_all(&record)?;
        file.sync_all()?;
        sync_dir(dir)?;

        Ok(Wal {
            dir: dir.to_path_buf(),
            file,
            seq: 0,
            segment_size: SEGMENT_SIZE_BYTES,
            size: record.len() as u64,
            last_index: 0,
            metadata: metadata.to_vec(),
            prev_hard_state: HardState::default(),
        })
    }

    /// Open the WAL at the given snapshot and replay everything after it.
    ///
    /// Replay verifies checksums, applies the overwrite discipline (an entry
    /// whose index rewinds truncates the replayed slice), drops entries at or
    /// below the snapshot, and truncates a torn tail of the last segment so
    /// subsequent appends start at the last valid frame.
    pub fn open(dir: &Path, snap: WalSnapshot) -> Result<(Wal, ReplayedLog)> {
        let segments = segment_files(dir)?;
        if segments.is_empty() {
            return Err(RaftError::Storage(format!(
                "no wal segments in {}",
                dir.display()
            )));
        }

        // Start from the newest segment that can contain entry snap.index+1.
        let mut start = 0;
        for (i, seg) in segments.iter().enumerate() {
            if seg.first_index <= snap.index + 1 {
                start = i;
            }
        }
        if segments[start].first_index > snap.index + 1 {
            return Err(RaftError::Storage(format!(
                "wal segments do not cover snapshot index {}",
                snap.index
            )));
        }

        let mut metadata: Option<Vec<u8>> = None;
        let mut hard_state = HardState::default();
        let mut entries: Vec<Entry> = Vec::new();
        let mut last_valid_len = 0u64;
        let mut last_index = snap.index;

        let selected = &segments[start..];
        for (i, seg) in selected.iter().enumerate() {
            let is_last = i == selected.len() - 1;
            let (records, valid_len, clean) = read_segment(&seg.path)?;
            if !clean && !is_last {
                return Err(RaftError::Storage(format!(
                    "wal segment {} is corrupted mid-log",
                    seg.path.display()
                )));
            }
            if !clean {
                log::warn!(
                    "wal segment {} has a torn tail, truncating to {} bytes",
                    seg.path.display(),
                    valid_len
                );
            }
            last_valid_len = valid_len;

            for (kind, payload) in records {
                match kind {
                    RecordType::Metadata => {
                        if metadata.is_none() {
                            metadata = Some(payload);
                        }
                    }
                    RecordType::HardState => {
                        hard_state = HardState::parse_from_bytes(&payload)?;
                    }
                    RecordType::Entry => {
                        let entry = Entry::parse_from_bytes(&payload)?;
                        while entries.last().map_or(false, |e| e.index >= entry.index) {
                            entries.pop();
                        }
                        if entry.index > snap.index {
                            last_index = entry.index;
                            entries.push(entry);
                        }
                    }
                    RecordType::Snapshot => {}
                }
            }
        }

        let metadata = metadata
            .ok_or_else(|| RaftError::Storage("wal is missing the metadata record".to_string()))?;

        let last_seg = &segments[segments.len() - 1];
        let mut file = OpenOptions::new().write(true).open(&last_seg.path)?;
        file.set_len(last_valid_len)?;
        file.seek(SeekFrom::End(0))?;

        let wal = Wal {
            dir: dir.to_path_buf(),
            file,
            seq: last_seg.seq,
            segment_size: SEGMENT_SIZE_BYTES,
            size: last_valid_len,
            last_index,
            metadata: metadata.clone(),
            prev_hard_state: hard_state.clone(),
        };
        Ok((wal, ReplayedLog { metadata, hard_state, entries }))
    }

    /// Persist a hard-state update and an entry batch.
    ///
    /// Syncs when entries are present or the term/vote changed; a
    /// commit-only hard-state change rides along with the next sync.
    pub fn save(&mut self, hs: Option<&HardState>, entries: &[Entry]) -> Result<()> {
        let hs_changed = hs.map_or(false, |hs| *hs != self.prev_hard_state);
        if entries.is_empty() && !hs_changed {
            return Ok(());
        }

        let mut buf = Vec::new();
        for entry in entries {
            buf.extend_from_slice(&encode_frame(RecordType::Entry, &entry.write_to_bytes()?));
            self.last_index = entry.index;
        }
        let mut must_sync = !entries.is_empty();
        if let Some(hs) = hs {
            if hs_changed {
                buf.extend_from_slice(&encode_frame(RecordType::HardState, &hs.write_to_bytes()?));
                must_sync |= hs.term != self.prev_hard_state.term
                    || hs.vote != self.prev_hard_state.vote;
                self.prev_hard_state = hs.clone();
            }
        }

        self.file.write_all(&buf)?;
        self.size += buf.len() as u64;
        if must_sync {
            self.file.sync_data()?;
        }
        if self.size > self.segment_size {
            self.cut()?;
        }
        Ok(())
    }

    /// Record that a snapshot at `snap` has been persisted. Durable before
    /// return, so `valid_snapshot_entries` only ever reports saved snapshots.
    pub fn save_snapshot(&mut self, snap: WalSnapshot) -> Result<()> {
        let record = encode_frame(RecordType::Snapshot, &snap.to_bytes());
        self.file.write_all(&record)?;
        self.size += record.len() as u64;
        self.file.sync_data()?;
        Ok(())
    }

    /// Delete segments whose entries all precede `index`. The newest segment
    /// that can still contain `index` is always retained.
    pub fn release_to(&mut self, index: u64) -> Result<()> {
        let segments = segment_files(&self.dir)?;
        for window in segments.windows(2) {
            if window[1].first_index <= index {
                log::info!("releasing wal segment {}", window[0].path.display());
                fs::remove_file(&window[0].path)?;
            }
        }
        Ok(())
    }

    /// Scan every retained segment for snapshot markers, in write order.
    pub fn valid_snapshot_entries(dir: &Path) -> Result<Vec<WalSnapshot>> {
        let mut markers = Vec::new();
        for seg in segment_files(dir)? {
            let (records, _, clean) = read_segment(&seg.path)?;
            if !clean {
                log::warn!("wal segment {} has a torn tail", seg.path.display());
            }
            for (kind, payload) in records {
                if kind == RecordType::Snapshot {
                    markers.push(WalSnapshot::from_bytes(&payload)?);
                }
            }
        }
        Ok(markers)
    }

    fn cut(&mut self) -> Result<()> {
        self.file.sync_data()?;
        self.seq += 1;
        let path = self.dir.join(segment_name(self.seq, self.last_index + 1));
        let mut file = OpenOptions::new().create_new(true).write(true).open(&path)?;

        let mut buf = encode_frame(RecordType::Metadata, &self.metadata);
        if self.prev_hard_state != HardState::default() {
            buf.extend_from_slice(&encode_frame(
                RecordType::HardState,
                &self.prev_hard_state.write_to_bytes()?,
            ));
        }
        file.write_all(&buf)?;
        file.sync_all()?;
        sync_dir(&self.dir)?;

        log::info!("cut wal segment {}", path.display());
        self.file = file;
        self.size = buf.len() as u64;
        Ok(())
    }

    #[cfg(test)]
    fn set_segment_size(&mut self, size: u64) {
        self.segment_size = size;
    }
}

fn encode_frame(kind: RecordType, payload: &[u8]) -> Vec<u8> {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&[kind as u8]);
    hasher.update(payload);
    let crc = hasher.finalize();

    let mut buf = Vec::with_capacity(FRAME_HEADER_SIZE + 1 + payload.len());
    // Infallible: Vec<u8> writes cannot error.
    let _ = buf.write_u32::<LittleEndian>(payload.len() as u32 + 1);
    let _ = buf.write_u32::<LittleEndian>(crc);
    buf.push(kind as u8);
    buf.extend_from_slice(payload);
    buf
}

/// Decode every valid frame of one segment. Returns the records, the byte
/// offset of the end of the last valid frame, and whether the whole file was
/// consumed cleanly.
fn read_segment(path: &Path) -> Result<(Vec<(RecordType, Vec<u8>)>, u64, bool)> {
    let mut data = Vec::new();
    File::open(path)?.read_to_end(&mut data)?;

    let mut records = Vec::new();
    let mut offset = 0usize;
    loop {
        if offset + FRAME_HEADER_SIZE > data.len() {
            break;
        }
        let mut header = Cursor::new(&data[offset..offset + FRAME_HEADER_SIZE]);
        let len = header.read_u32::<LittleEndian>()? as usize;
        let crc = header.read_u32::<LittleEndian>()?;
        if len == 0 || offset + FRAME_HEADER_SIZE + len > data.len() {
            break;
        }
        let body = &data[offset + FRAME_HEADER_SIZE..offset + FRAME_HEADER_SIZE + len];
        if crc32fast::hash(body) != crc {
            break;
        }
        let kind = match RecordType::try_from(body[0]) {
            Ok(kind) => kind,
            Err(_) => break,
        };
        records.push((kind, body[1..].to_vec()));
        offset += FRAME_HEADER_SIZE + len;
    }
    let clean = offset == data.len();
    Ok((records, offset as u64, clean))
}

#[derive(Debug, Clone)]
struct SegmentFile {
    path: PathBuf,
    seq: u64,
    first_index: u64,
}

fn segment_name(seq: u64, first_index: u64) -> String {
    format!("{seq:016x}-{first_index:016x}.wal")
}

fn parse_segment_name(name: &str) -> Option<(u64, u64)> {
    let stem = name.strip_suffix(".wal")?;
    let (seq, first) = stem.split_once('-')?;
    Some((u64::from_str_radix(seq, 16).ok()?, u64::from_str_radix(first, 16).ok()?))
}

fn segment_files(dir: &Path) -> Result<Vec<SegmentFile>> {
    let mut segments = Vec::new();
    if !dir.exists() {
        return Ok(segments);
    }
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Some((seq, first_index)) = parse_segment_name(name) {
            segments.push(SegmentFile { path: entry.path(), seq, first_index });
        }
    }
    segments.sort_by_key(|s| s.seq);
    Ok(segments)
}

fn sync_dir(dir: &Path) -> Result<()> {
    File::open(dir)?.sync_all()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::ensure_dir;

    fn entry(index: u64, term: u64, data: &[u8]) -> Entry {
        let mut e = Entry::default();
        e.index = index;
        e.term = term;
        e.data = data.to_vec().into();
        e
    }

    fn hard_state(term: u64, vote: u64, commit: u64) -> HardState {
        let mut hs = HardState::default();
        hs.term = term;
        hs.vote = vote;
        hs.commit = commit;
        hs
    }

    fn wal_dir() -> (tempfile::TempDir, PathBuf) {
        let tmp = tempfile::tempdir().expect("tempdir");
        let dir = tmp.path().join("wal");
        ensure_dir(&dir).expect("ensure dir");
        (tmp, dir)
    }

    #[test]
    fn replay_returns_what_was_saved() {
        let (_tmp, dir) = wal_dir();
        let mut wal = Wal::create(&dir, b"meta").expect("create");
        let hs = hard_state(2, 1, 3);
        wal.save(Some(&hs), &[entry(1, 1, b"a"), entry(2, 2, b"b"), entry(3, 2, b"c")])
            .expect("save");
        drop(wal);

        assert!(Wal::exists(&dir));
        let (_wal, replayed) = Wal::open(&dir, WalSnapshot::default()).expect("open");
        assert_eq!(replayed.metadata, b"meta");
        assert_eq!(replayed.hard_state, hs);
        assert_eq!(replayed.entries.len(), 3);
        assert_eq!(replayed.entries[2].index, 3);
        assert_eq!(&replayed.entries[0].data[..], b"a");
    }

    #[test]
    fn appends_survive_reopen() {
        let (_tmp, dir) = wal_dir();
        let mut wal = Wal::create(&dir, b"meta").expect("create");
        wal.save(Some(&hard_state(1, 1, 0)), &[entry(1, 1, b"a")]).expect("save");
        drop(wal);

        let (mut wal, _) = Wal::open(&dir, WalSnapshot::default()).expect("open");
        wal.save(Some(&hard_state(1, 1, 1)), &[entry(2, 1, b"b")]).expect("save");
        drop(wal);

        let (_wal, replayed) = Wal::open(&dir, WalSnapshot::default()).expect("reopen");
        assert_eq!(replayed.entries.len(), 2);
        assert_eq!(replayed.hard_state.commit, 1);
    }

    #[test]
    fn rewritten_entries_truncate_the_replayed_slice() {
        let (_tmp, dir) = wal_dir();
        let mut wal = Wal::create(&dir, b"meta").expect("create");
        wal.save(None, &[entry(1, 1, b"a"), entry(2, 1, b"b"), entry(3, 1, b"c")])
            .expect("save");
        // A new leader overwrites indexes 2 and 3.
        wal.save(None, &[entry(2, 2, b"x")]).expect("save");
        drop(wal);

        let (_wal, replayed) = Wal::open(&dir, WalSnapshot::default()).expect("open");
        let got: Vec<(u64, u64)> = replayed.entries.iter().map(|e| (e.index, e.term)).collect();
        assert_eq!(got, vec![(1, 1), (2, 2)]);
    }

    #[test]
    fn torn_tail_is_truncated_and_log_stays_usable() {
        let (_tmp, dir) = wal_dir();
        let mut wal = Wal::create(&dir, b"meta").expect("create");
        wal.save(None, &[entry(1, 1, b"a")]).expect("save");
        drop(wal);

        // Simulate a crash mid-write.
        let seg = segment_files(&dir).expect("segments").remove(0);
        let mut file = OpenOptions::new().append(true).open(&seg.path).expect("open");
        file.write_all(&[0x12, 0x34, 0x56]).expect("tear");
        drop(file);

        let (mut wal, replayed) = Wal::open(&dir, WalSnapshot::default()).expect("open");
        assert_eq!(replayed.entries.len(), 1);
        wal.save(None, &[entry(2, 1, b"b")]).expect("save after tear");
        drop(wal);

        let (_wal, replayed) = Wal::open(&dir, WalSnapshot::default()).expect("reopen");
        assert_eq!(replayed.entries.len(), 2);
    }

    #[test]
    fn snapshot_markers_are_scanned_and_gate_replay() {
        let (_tmp, dir) = wal_dir();
        let mut wal = Wal::create(&dir, b"meta").expect("create");
        wal.save(None, &[entry(1, 1, b"a"), entry(2, 1, b"b"), entry(3, 1, b"c")])
            .expect("save");
        wal.save_snapshot(WalSnapshot { index: 2, term: 1 }).expect("marker");
        drop(wal);

        let markers = Wal::valid_snapshot_entries(&dir).expect("markers");
        assert_eq!(markers, vec![WalSnapshot { index: 2, term: 1 }]);

        let (_wal, replayed) =
            Wal::open(&dir, WalSnapshot { index: 2, term: 1 }).expect("open at snapshot");
        assert_eq!(replayed.entries.len(), 1);
        assert_eq!(replayed.entries[0].index, 3);
    }

    #[test]
    fn segments_rotate_and_release() {
        let (_tmp, dir) = wal_dir();
        let mut wal = Wal::create(&dir, b"meta").expect("create");
        wal.set_segment_size(256);
        for i in 1..=50 {
            wal.save(Some(&hard_state(1, 1, i)), &[entry(i, 1, &[0u8; 32])]).expect("save");
        }
        let before = segment_files(&dir).expect("segments").len();
        assert!(before > 1, "expected rotation, got {before} segment(s)");

        wal.release_to(40).expect("release");
        let after = segment_files(&dir).expect("segments");
        assert!(after.len() < before);
        // Everything after index 40 must still replay.
        drop(wal);
        let (_wal, replayed) =
            Wal::open(&dir, WalSnapshot { index: 40, term: 1 }).expect("open");
        let first = replayed.entries.first().map(|e| e.index);
        assert_eq!(first, Some(41));
        assert_eq!(replayed.entries.last().map(|e| e.index), Some(50));
        assert_eq!(replayed.metadata, b"meta");
    }

    #[test]
    fn segment_name_roundtrip() {
        let name = segment_name(3, 1024);
        assert_eq!(parse_segment_name(&name), Some((3, 1024)));
        assert_eq!(parse_segment_name("garbage"), None);
        assert_eq!(parse_segment_name("0-0.snap"), None);
    }
}
