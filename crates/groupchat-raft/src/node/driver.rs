//! The driver loop: tick the clock, pump ready cycles, persist, apply, send.
//!
//! Runs on its own OS thread and exclusively owns the `RawNode`, the WAL and
//! the snapshot files. Failures that would break durability or protocol
//! invariants terminate the process: a node that cannot persist must not
//! keep voting.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};

use protobuf::Message as PbMessage;
use raft::eraftpb::{ConfChange, ConfState, Entry, EntryType, Snapshot};
use raft::storage::MemStorage;
use raft::{RawNode, ReadState, Storage as _};

use crate::error::Result;
use crate::network::PeerTransport;
use crate::node::{ApplyTask, RaftMsg};
use crate::storage::{Snapshotter, Wal, WalSnapshot};

const TICK_INTERVAL: Duration = Duration::from_millis(100);

pub(crate) struct Driver {
    raw_node: RawNode<MemStorage>,
    storage: MemStorage,
    conf_state: ConfState,
    wal: Wal,
    snapshotter: Snapshotter,
    transport: PeerTransport,
    msg_rx: mpsc::Receiver<RaftMsg>,
    apply_tx: tokio::sync::mpsc::Sender<ApplyTask>,
    read_state_tx: tokio::sync::watch::Sender<Option<ReadState>>,
    lead: Arc<AtomicU64>,
    initial_snapshot: Option<Snapshot>,
    last_snap_index: u64,
}

impl Driver {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        raw_node: RawNode<MemStorage>,
        storage: MemStorage,
        conf_state: ConfState,
        wal: Wal,
        snapshotter: Snapshotter,
        transport: PeerTransport,
        msg_rx: mpsc::Receiver<RaftMsg>,
        apply_tx: tokio::sync::mpsc::Sender<ApplyTask>,
        read_state_tx: tokio::sync::watch::Sender<Option<ReadState>>,
        lead: Arc<AtomicU64>,
        initial_snapshot: Option<Snapshot>,
    ) -> Self {
        let last_snap_index = initial_snapshot
            .as_ref()
            .map_or(0, |s| s.get_metadata().index);
        Self {
            raw_node,
            storage,
            conf_state,
            wal,
            snapshotter,
            transport,
            msg_rx,
            apply_tx,
            read_state_tx,
            lead,
            initial_snapshot,
            last_snap_index,
        }
    }

    pub(crate) fn run(mut self) {
        // A snapshot restored from disk is already applied as far as the
        // consensus library is concerned, so it never reappears in a ready;
        // hand it to the applier directly so the chat state catches up.
        if let Some(snapshot) = self.initial_snapshot.take() {
            if self
                .apply_tx
                .blocking_send(ApplyTask { snapshot, entries: Vec::new() })
                .is_err()
            {
                fatal_msg("applier is gone");
            }
        }

        let mut last_tick = Instant::now();
        loop {
            let timeout = TICK_INTERVAL
                .checked_sub(last_tick.elapsed())
                .unwrap_or(Duration::ZERO);
            match self.msg_rx.recv_timeout(timeout) {
                Ok(msg) => self.handle_msg(msg),
                Err(mpsc::RecvTimeoutError::Timeout) => {}
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    log::info!("raft driver control channel closed, stopping");
                    return;
                }
            }
            if last_tick.elapsed() >= TICK_INTERVAL {
                self.raw_node.tick();
                last_tick = Instant::now();
            }
            self.on_ready();
        }
    }

    fn handle_msg(&mut self, msg: RaftMsg) {
        match msg {
            RaftMsg::Propose { data, reply } => {
                let result: Result<()> = self
                    .raw_node
                    .propose(Vec::new(), data)
                    .map_err(Into::into);
                let _ = reply.send(result);
            }
            RaftMsg::ReadIndex { rctx } => {
                self.raw_node.read_index(rctx);
            }
            RaftMsg::Step(message) => {
                if let Err(e) = self.raw_node.step(message) {
                    log::warn!("failed to step peer message: {e}");
                }
            }
            RaftMsg::Snapshot { index, data } => {
                self.checkpoint(index, data);
            }
        }
    }

    /// One ready cycle, in a fixed order: soft state, read states, committed
    /// entries out to the applier, snapshot persistence, WAL persistence,
    /// in-memory log append, outbound messages, advance.
    fn on_ready(&mut self) {
        if !self.raw_node.has_ready() {
            return;
        }
        let mut rd = self.raw_node.ready();

        if let Some(ss) = rd.ss() {
            self.lead.store(ss.leader_id, Ordering::SeqCst);
        }

        if let Some(rs) = rd.take_read_states().pop() {
            let _ = self.read_state_tx.send(Some(rs));
        }

        let snapshot = rd.snapshot().clone();
        let committed = rd.take_committed_entries();
        self.dispatch_committed(snapshot.clone(), committed);

        if snapshot.get_metadata().index > 0 {
            if let Err(e) = self.save_snap(&snapshot) {
                fatal("failed to save snapshot", &e);
            }
            if let Err(e) = self.storage.wl().apply_snapshot(snapshot.clone()) {
                fatal("failed to apply snapshot to raft storage", &e);
            }
            self.conf_state = snapshot.get_metadata().get_conf_state().clone();
            self.last_snap_index = snapshot.get_metadata().index;
        }

        if let Err(e) = self.wal.save(rd.hs(), rd.entries()) {
            fatal("failed to save raft entries", &e);
        }
        if let Err(e) = self.storage.wl().append(rd.entries()) {
            fatal("failed to append raft entries", &e);
        }
        if let Some(hs) = rd.hs() {
            self.storage.wl().set_hardstate(hs.clone());
        }

        let mut messages = rd.take_messages();
        messages.extend(rd.take_persisted_messages());
        self.transport.send(messages);

        let mut light_rd = self.raw_node.advance(rd);
        if let Some(commit) = light_rd.commit_index() {
            self.storage.wl().mut_hard_state().commit = commit;
        }
        self.transport.send(light_rd.take_messages());
        let committed = light_rd.take_committed_entries();
        if !committed.is_empty() {
            self.dispatch_committed(Snapshot::default(), committed);
        }
        self.raw_node.advance_apply();
    }

    /// Partition a committed batch: configuration changes apply to the node
    /// immediately, normal entries ship to the applier. A configuration
    /// change appearing after a normal entry would reorder application and is
    /// a protocol violation.
    fn dispatch_committed(&mut self, snapshot: Snapshot, entries: Vec<Entry>) {
        let mut normal: Vec<Entry> = Vec::new();
        for entry in entries {
            match entry.get_entry_type() {
                EntryType::EntryNormal => normal.push(entry),
                EntryType::EntryConfChange => {
                    if !normal.is_empty() {
                        fatal_msg("conf-change entry after a normal entry in one batch");
                    }
                    let mut cc = ConfChange::default();
                    if let Err(e) = cc.merge_from_bytes(&entry.data) {
                        fatal("failed to decode conf change", &e);
                    }
                    match self.raw_node.apply_conf_change(&cc) {
                        Ok(cs) => {
                            self.storage.wl().set_conf_state(cs.clone());
                            self.conf_state = cs;
                        }
                        Err(e) => fatal("failed to apply conf change", &e),
                    }
                }
                EntryType::EntryConfChangeV2 => {
                    fatal_msg("unknown raft entry type EntryConfChangeV2");
                }
            }
        }

        if self
            .apply_tx
            .blocking_send(ApplyTask { snapshot, entries: normal })
            .is_err()
        {
            fatal_msg("applier is gone");
        }
    }

    /// Persist a locally generated checkpoint of the applied state.
    fn checkpoint(&mut self, index: u64, data: Vec<u8>) {
        if index <= self.last_snap_index {
            return;
        }
        let term = match self.storage.term(index) {
            Ok(term) => term,
            Err(e) => {
                log::warn!("cannot checkpoint at index {index}: {e}");
                return;
            }
        };
        let mut snapshot = Snapshot::default();
        {
            let meta = snapshot.mut_metadata();
            meta.index = index;
            meta.term = term;
            meta.set_conf_state(self.conf_state.clone());
        }
        snapshot.set_data(data.into());
        if let Err(e) = self.save_snap(&snapshot) {
            fatal("failed to save snapshot", &e);
        }
        self.last_snap_index = index;
    }

    /// Snapshot save ordering: snapshot file first, then the WAL marker, then
    /// release of segments the snapshot made obsolete. A crash between the
    /// steps leaves at worst an unreferenced snapshot file.
    fn save_snap(&mut self, snapshot: &Snapshot) -> Result<()> {
        let meta = snapshot.get_metadata();
        self.snapshotter.save_snap(snapshot)?;
        self.wal.save_snapshot(WalSnapshot {
            index: meta.index,
            term: meta.term,
        })?;
        self.wal.release_to(meta.index)?;
        Ok(())
    }
}

fn fatal(msg: &str, err: &dyn std::fmt::Display) -> ! {
    log::error!("{msg}: {err}");
    std::process::exit(1);
}

fn fatal_msg(msg: &str) -> ! {
    log::error!("{msg}");
    std::process::exit(1);
}
