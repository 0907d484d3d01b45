//! The Raft node: bring-up, restart, and the handle the rest of the process
//! uses to talk to the driver loop.
//!
//! The driver owns `RawNode`, the WAL, the snapshotter, and the outbound
//! transport on a dedicated OS thread. Everything else communicates with it
//! through a control channel: proposals, read-index requests, inbound peer
//! messages, and local checkpoint triggers. Committed work flows back out as
//! [`ApplyTask`]s over a single-slot channel, which backpressures the driver
//! until the applier has taken the previous task.

mod driver;

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc};

use parking_lot::Mutex;
use raft::eraftpb::{ConfState, Entry, HardState, Message, Snapshot};
use raft::storage::MemStorage;
use raft::{ReadState, Storage as _};
use slog::{o, Drain};

use crate::error::{RaftError, Result};
use crate::metadata::ClusterMetadata;
use crate::network::PeerTransport;
use crate::storage::{ensure_dir, ensure_empty_dir, Snapshotter, Wal, WalSnapshot};
use driver::Driver;

const ELECTION_TICK: usize = 10;
const HEARTBEAT_TICK: usize = 1;
const MAX_SIZE_PER_MSG: u64 = 1024 * 1024;
const MAX_INFLIGHT_MSGS: usize = 256;
const MAX_UNCOMMITTED_SIZE: u64 = 1 << 30;

/// One unit of work for the applier: an optional snapshot to install,
/// followed by committed normal entries in log order.
#[derive(Debug)]
pub struct ApplyTask {
    pub snapshot: Snapshot,
    pub entries: Vec<Entry>,
}

/// Control messages consumed by the driver loop.
pub(crate) enum RaftMsg {
    Propose {
        data: Vec<u8>,
        reply: tokio::sync::oneshot::Sender<Result<()>>,
    },
    ReadIndex {
        rctx: Vec<u8>,
    },
    Step(Message),
    /// Persist a local state checkpoint taken at `index`.
    Snapshot {
        index: u64,
        data: Vec<u8>,
    },
}

/// Handle to a running Raft node.
pub struct RaftNode {
    id: u64,
    lead: Arc<AtomicU64>,
    msg_tx: mpsc::Sender<RaftMsg>,
    apply_rx: Mutex<Option<tokio::sync::mpsc::Receiver<ApplyTask>>>,
    read_state_rx: tokio::sync::watch::Receiver<Option<ReadState>>,
}

impl RaftNode {
    /// Bootstrap a fresh node. Wipes `wal/` and `snap/` under `data_dir`,
    /// derives the node ID from the sorted peer URL list, and writes the
    /// cluster metadata as the first WAL record.
    ///
    /// Must be called on a tokio runtime; the transport workers are spawned
    /// onto it.
    pub fn bootstrap(local_url: &str, remote_urls: &[String], data_dir: &Path) -> Result<RaftNode> {
        let snap_dir = data_dir.join("snap");
        let wal_dir = data_dir.join("wal");
        ensure_empty_dir(&snap_dir)?;
        ensure_empty_dir(&wal_dir)?;

        let mut peer_urls: Vec<String> = Vec::with_capacity(remote_urls.len() + 1);
        peer_urls.push(local_url.to_string());
        peer_urls.extend(remote_urls.iter().cloned());
        peer_urls.sort();
        let id = peer_urls
            .iter()
            .position(|url| url == local_url)
            .map(|i| i as u64 + 1)
            .ok_or_else(|| RaftError::config("local URL missing from peer list"))?;

        let metadata = ClusterMetadata::from_sorted_urls(id, &peer_urls);
        let wal = Wal::create(&wal_dir, &metadata.to_json()?)?;
        let snapshotter = Snapshotter::new(&snap_dir);

        let conf_state = ConfState::from((metadata.voter_ids(), vec![]));
        let storage = MemStorage::new_with_conf_state((metadata.voter_ids(), vec![]));

        log::info!(
            "bootstrapping raft node {id} with peers {:?}",
            metadata.peers
        );
        start_node(metadata, storage, conf_state, wal, snapshotter, None)
    }

    /// Restart from an existing WAL. Returns `Ok(None)` when there is no WAL,
    /// or when nothing beyond the metadata record was ever persisted (the
    /// original bring-up never completed), in which case the caller falls
    /// back to the fresh-cluster path.
    pub fn restart(data_dir: &Path) -> Result<Option<RaftNode>> {
        let snap_dir = data_dir.join("snap");
        let wal_dir = data_dir.join("wal");
        ensure_dir(&snap_dir)?;
        ensure_dir(&wal_dir)?;

        if !Wal::exists(&wal_dir) {
            return Ok(None);
        }

        let markers = Wal::valid_snapshot_entries(&wal_dir)?;
        let snapshotter = Snapshotter::new(&snap_dir);
        let snapshot = snapshotter.load_newest_available(&markers)?;

        let wal_snap = snapshot
            .as_ref()
            .map(|s| WalSnapshot {
                index: s.get_metadata().index,
                term: s.get_metadata().term,
            })
            .unwrap_or_default();
        let (wal, replayed) = Wal::open(&wal_dir, wal_snap)?;
        let metadata = ClusterMetadata::from_json(&replayed.metadata)?;

        if snapshot.is_none()
            && replayed.hard_state == HardState::default()
            && replayed.entries.is_empty()
        {
            log::info!("wal holds no raft state yet, waiting for cluster bootstrap");
            return Ok(None);
        }

        let conf_state;
        let storage;
        match &snapshot {
            Some(snap) => {
                conf_state = snap.get_metadata().get_conf_state().clone();
                storage = MemStorage::new();
                storage
                    .wl()
                    .apply_snapshot(snap.clone())
                    .map_err(|e| RaftError::storage(e.to_string()))?;
            }
            None => {
                conf_state = ConfState::from((metadata.voter_ids(), vec![]));
                storage = MemStorage::new_with_conf_state((metadata.voter_ids(), vec![]));
            }
        }

        let mut hard_state = replayed.hard_state.clone();
        if hard_state.commit < wal_snap.index {
            hard_state.commit = wal_snap.index;
        }
        storage.wl().set_hardstate(hard_state);
        storage
            .wl()
            .append(&replayed.entries)
            .map_err(|e| RaftError::storage(e.to_string()))?;

        log::info!(
            "restarting raft node {} at snapshot index {}, last log index {}",
            metadata.id,
            wal_snap.index,
            storage.last_index().unwrap_or(0),
        );
        start_node(metadata, storage, conf_state, wal, snapshotter, snapshot).map(Some)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_leader(&self) -> bool {
        self.lead.load(Ordering::SeqCst) == self.id
    }

    /// Submit a proposal and wait for the driver to accept or reject it.
    /// Acceptance only means the entry entered the local log; the command's
    /// result arrives later through the notify registry.
    pub async fn propose(&self, data: Vec<u8>) -> Result<()> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.msg_tx
            .send(RaftMsg::Propose { data, reply: tx })
            .map_err(|_| RaftError::Shutdown)?;
        rx.await.map_err(|_| RaftError::Shutdown)?
    }

    /// Start a read-index round tagged with `rctx`.
    pub fn read_index(&self, rctx: Vec<u8>) -> Result<()> {
        self.msg_tx
            .send(RaftMsg::ReadIndex { rctx })
            .map_err(|_| RaftError::Shutdown)
    }

    /// Step an inbound peer message into the state machine.
    pub fn step(&self, message: Message) -> Result<()> {
        self.msg_tx
            .send(RaftMsg::Step(message))
            .map_err(|_| RaftError::Shutdown)
    }

    /// Ask the driver to persist a state checkpoint taken at `index`.
    pub fn trigger_snapshot(&self, index: u64, data: Vec<u8>) -> Result<()> {
        self.msg_tx
            .send(RaftMsg::Snapshot { index, data })
            .map_err(|_| RaftError::Shutdown)
    }

    /// Take the apply-task receiver. Yields `Some` exactly once; the applier
    /// is the single consumer.
    pub fn take_apply_rx(&self) -> Option<tokio::sync::mpsc::Receiver<ApplyTask>> {
        self.apply_rx.lock().take()
    }

    /// Watch channel carrying the most recent read-state. Capacity one with
    /// overwrite: a slow consumer only ever sees the latest.
    pub fn read_states(&self) -> tokio::sync::watch::Receiver<Option<ReadState>> {
        self.read_state_rx.clone()
    }
}

fn start_node(
    metadata: ClusterMetadata,
    storage: MemStorage,
    conf_state: ConfState,
    wal: Wal,
    snapshotter: Snapshotter,
    initial_snapshot: Option<Snapshot>,
) -> Result<RaftNode> {
    let config = raft::Config {
        id: metadata.id,
        election_tick: ELECTION_TICK,
        heartbeat_tick: HEARTBEAT_TICK,
        max_size_per_msg: MAX_SIZE_PER_MSG,
        max_inflight_msgs: MAX_INFLIGHT_MSGS,
        max_uncommitted_size: MAX_UNCOMMITTED_SIZE,
        pre_vote: true,
        ..Default::default()
    };
    config
        .validate()
        .map_err(|e| RaftError::config(e.to_string()))?;

    // Route the consensus library's slog output into the process logger.
    let logger = slog::Logger::root(slog_stdlog::StdLog.fuse(), o!());
    let raw_node = raft::RawNode::new(&config, storage.clone(), &logger)
        .map_err(|e| RaftError::config(e.to_string()))?;

    let transport = PeerTransport::new(metadata.id, metadata.remote_peers());

    let (msg_tx, msg_rx) = mpsc::channel();
    let (apply_tx, apply_rx) = tokio::sync::mpsc::channel(1);
    let (read_state_tx, read_state_rx) = tokio::sync::watch::channel(None);
    let lead = Arc::new(AtomicU64::new(0));

    let driver = Driver::new(
        raw_node,
        storage,
        conf_state,
        wal,
        snapshotter,
        transport,
        msg_rx,
        apply_tx,
        read_state_tx,
        Arc::clone(&lead),
        initial_snapshot,
    );
    std::thread::Builder::new()
        .name("raft-driver".to_string())
        .spawn(move || driver.run())
        .map_err(|e| RaftError::storage(format!("failed to spawn raft driver: {e}")))?;

    Ok(RaftNode {
        id: metadata.id,
        lead,
        msg_tx,
        apply_rx: Mutex::new(Some(apply_rx)),
        read_state_rx,
    })
}
