//! The server core: owns the chat state, drives the applier and the
//! linearizable-read coordinator, and performs cluster bring-up.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use actix_web::{web, App, HttpServer};
use aes_gcm::{Aes128Gcm, KeyInit};
use groupchat_raft::node::ApplyTask;
use groupchat_raft::notify::{ApplyWait, Completion, IdGenerator, NotifyRegistry};
use groupchat_raft::{
    codec, network, ChatState, Command, CommandKind, CommandOutput, RaftError, RaftNode,
};
use once_cell::sync::OnceCell;
use parking_lot::RwLock;
use rand::RngCore;

use crate::errors::ApiError;

/// Deadline for a single proposal or linearizable-read round.
const ROUND_TIMEOUT: Duration = Duration::from_secs(5);
/// Backoff between secret-key initialization attempts.
const SECRET_KEY_RETRY: Duration = Duration::from_secs(1);
/// Applied entries between local snapshot checkpoints.
const CHECKPOINT_INTERVAL: u64 = 10_000;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub raft_port: u16,
    pub data_dir: PathBuf,
}

/// Everything that only exists once the Raft node is up.
struct Consensus {
    node: Arc<RaftNode>,
    id_gen: IdGenerator,
    apply_notify: NotifyRegistry,
    apply_wait: ApplyWait,
    read_wait_tx: tokio::sync::mpsc::Sender<()>,
    ready_read: RwLock<Completion>,
}

pub struct ChatServer {
    pub(crate) config: ServerConfig,
    pub(crate) state: RwLock<ChatState>,
    aead: OnceCell<Aes128Gcm>,
    core: OnceCell<Arc<Consensus>>,
    bootstrapped: AtomicBool,
    cluster_started: AtomicBool,
    applied_index: AtomicU64,
    last_checkpoint: AtomicU64,
}

impl ChatServer {
    pub fn new(config: ServerConfig) -> Arc<ChatServer> {
        Arc::new(ChatServer {
            config,
            state: RwLock::new(ChatState::new()),
            aead: OnceCell::new(),
            core: OnceCell::new(),
            bootstrapped: AtomicBool::new(false),
            cluster_started: AtomicBool::new(false),
            applied_index: AtomicU64::new(0),
            last_checkpoint: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn cluster_started(&self) -> bool {
        self.cluster_started.load(Ordering::SeqCst)
    }

    /// The AEAD cipher, available once bootstrap completed.
    pub fn aead(&self) -> Option<&Aes128Gcm> {
        self.aead.get()
    }

    fn core(&self) -> Result<&Arc<Consensus>, ApiError> {
        self.core.get().ok_or(ApiError::ClusterNotStarted)
    }

    /// Bring the node up. Runs at most once per process; later calls return
    /// immediately. `make_node` is only invoked by the winning call, so a
    /// racing second `/updateCluster` cannot wipe the data directory twice.
    pub async fn bootstrap<F>(self: Arc<Self>, make_node: F)
    where
        F: FnOnce() -> Result<RaftNode, RaftError> + Send + 'static,
    {
        if self.bootstrapped.swap(true, Ordering::SeqCst) {
            return;
        }
        let node = match make_node() {
            Ok(node) => Arc::new(node),
            Err(e) => fatal("failed to start raft node", &e),
        };

        self.spawn_raft_listener(Arc::clone(&node));

        let Some(apply_rx) = node.take_apply_rx() else {
            fatal_msg("apply channel already taken");
        };
        let (read_wait_tx, read_wait_rx) = tokio::sync::mpsc::channel(1);
        let core = Arc::new(Consensus {
            id_gen: IdGenerator::new(node.id()),
            node,
            apply_notify: NotifyRegistry::new(),
            apply_wait: ApplyWait::new(),
            read_wait_tx,
            ready_read: RwLock::new(Completion::new()),
        });
        if self.core.set(Arc::clone(&core)).is_err() {
            fatal_msg("consensus core initialized twice");
        }

        tokio::spawn(Arc::clone(&self).run_applier(apply_rx));
        tokio::spawn(Arc::clone(&self).run_read_loop(read_wait_rx));

        self.init_aead().await;
        self.cluster_started.store(true, Ordering::SeqCst);
        log::info!("cluster started, serving requests");
    }

    /// The peer listener needs its own actix system: bootstrap may run from
    /// any task context, including tests without a running System.
    fn spawn_raft_listener(&self, node: Arc<RaftNode>) {
        let raft_port = self.config.raft_port;
        let spawned = std::thread::Builder::new()
            .name("raft-http".to_string())
            .spawn(move || {
                actix_web::rt::System::new().block_on(async move {
                    let data = web::Data::new(node);
                    let bound = HttpServer::new(move || {
                        App::new()
                            .app_data(data.clone())
                            .configure(network::configure)
                    })
                    .bind(("0.0.0.0", raft_port));
                    match bound {
                        Ok(server) => {
                            if let Err(e) = server.run().await {
                                fatal("raft listener failed", &e);
                            }
                        }
                        Err(e) => fatal("failed to bind raft port", &e),
                    }
                });
            });
        if let Err(e) = spawned {
            fatal("failed to spawn raft listener thread", &e);
        }
    }

    // ---- applier ----

    async fn run_applier(self: Arc<Self>, mut apply_rx: tokio::sync::mpsc::Receiver<ApplyTask>) {
        while let Some(task) = apply_rx.recv().await {
            if task.snapshot.get_metadata().index > 0 {
                self.install_snapshot(&task.snapshot);
            }
            self.apply_entries(&task.entries);
        }
        log::info!("apply channel closed, applier stopping");
    }

    fn install_snapshot(&self, snapshot: &groupchat_raft::Snapshot) {
        let index = snapshot.get_metadata().index;
        let mut state = self.state.write();
        if let Err(e) = state.restore_snapshot(&snapshot.data) {
            fatal("failed to restore state snapshot", &e);
        }
        state.applied_index = index;
        drop(state);
        self.applied_index.store(index, Ordering::SeqCst);
        self.last_checkpoint.store(index, Ordering::SeqCst);
        log::info!("installed snapshot at index {index}");
    }

    fn apply_entries(&self, entries: &[groupchat_raft::Entry]) {
        if entries.is_empty() {
            return;
        }
        let Some(core) = self.core.get() else { return };

        let last_applied = self.state.read().applied_index;
        let mut new_index = last_applied;
        let mut commands: Vec<Command> = Vec::new();
        for entry in entries {
            // Entries at or below the applied index were re-delivered on
            // restart; empty entries only advance the index.
            if entry.index <= last_applied {
                continue;
            }
            new_index = entry.index;
            if entry.data.is_empty() {
                continue;
            }
            match codec::decode_command(&entry.data) {
                Ok(command) => commands.push(command),
                Err(e) => fatal("undecodable committed entry", &e),
            }
        }

        {
            let mut state = self.state.write();
            for command in &commands {
                let result = state.apply(command);
                core.apply_notify.trigger(command.id, result);
            }
            state.applied_index = new_index;
        }
        self.applied_index.store(new_index, Ordering::SeqCst);
        core.apply_wait.trigger(new_index);
        self.maybe_checkpoint(new_index, core);
    }

    /// Hand the driver a state checkpoint every `CHECKPOINT_INTERVAL` applied
    /// entries so restarts replay a bounded suffix of the log.
    fn maybe_checkpoint(&self, applied: u64, core: &Arc<Consensus>) {
        let last = self.last_checkpoint.load(Ordering::SeqCst);
        if applied.saturating_sub(last) < CHECKPOINT_INTERVAL {
            return;
        }
        if self
            .last_checkpoint
            .compare_exchange(last, applied, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        let data = match self.state.read().gen_snapshot() {
            Ok(data) => data,
            Err(e) => {
                log::warn!("failed to generate snapshot: {e}");
                return;
            }
        };
        if let Err(e) = core.node.trigger_snapshot(applied, data) {
            log::warn!("failed to trigger snapshot at index {applied}: {e}");
        }
    }

    // ---- proposals ----

    /// Propose a command and wait for the applier to deliver its result.
    pub async fn propose_raft_command(&self, kind: CommandKind) -> Result<CommandOutput, ApiError> {
        let core = self.core()?;
        let id = core.id_gen.next();
        let command = Command { id, kind };
        let data = codec::encode_command(&command).map_err(ApiError::Raft)?;

        let notify = core.apply_notify.register(id);
        if let Err(e) = core.node.propose(data).await {
            core.apply_notify.deregister(id);
            return Err(ApiError::Raft(e));
        }

        match tokio::time::timeout(ROUND_TIMEOUT, notify).await {
            Ok(Ok(result)) => result.map_err(ApiError::Command),
            Ok(Err(_)) => Err(ApiError::Raft(RaftError::Shutdown)),
            Err(_) => {
                core.apply_notify.deregister(id);
                Err(ApiError::Raft(RaftError::Timeout))
            }
        }
    }

    // ---- linearizable reads ----

    /// Wait until this replica has applied everything committed before the
    /// call. Concurrent callers share one read-index round.
    pub async fn linearizable_read_notify(&self) -> Result<(), RaftError> {
        let core = self.core.get().ok_or(RaftError::Shutdown)?;
        let ready = core.ready_read.read().clone();
        // Nudge the loop; a full slot means a round is already pending.
        let _ = core.read_wait_tx.try_send(());
        match tokio::time::timeout(ROUND_TIMEOUT, ready.wait()).await {
            Ok(result) => result,
            Err(_) => Err(RaftError::Read("read deadline exceeded".to_string())),
        }
    }

    async fn run_read_loop(self: Arc<Self>, mut read_wait_rx: tokio::sync::mpsc::Receiver<()>) {
        while read_wait_rx.recv().await.is_some() {
            let Some(core) = self.core.get() else { continue };
            let ready = {
                let mut guard = core.ready_read.write();
                std::mem::replace(&mut *guard, Completion::new())
            };
            let result = match tokio::time::timeout(ROUND_TIMEOUT, self.apply_to_latest(core)).await
            {
                Ok(result) => result,
                Err(_) => Err(RaftError::Read("read round deadline exceeded".to_string())),
            };
            if let Err(e) = &result {
                log::warn!("linearizable read round failed: {e}");
            }
            ready.notify(result.err());
        }
    }

    /// One read-index round: tag it, wait for the matching read state, then
    /// wait for the apply index to cover it.
    async fn apply_to_latest(&self, core: &Arc<Consensus>) -> Result<(), RaftError> {
        let rctx = core.id_gen.next().to_be_bytes().to_vec();
        core.node.read_index(rctx.clone())?;

        let mut read_states = core.node.read_states();
        let rs = loop {
            {
                let current = read_states.borrow_and_update();
                if let Some(rs) = current.as_ref() {
                    if rs.request_ctx == rctx {
                        break rs.clone();
                    }
                }
            }
            read_states
                .changed()
                .await
                .map_err(|_| RaftError::Shutdown)?;
        };

        if self.applied_index.load(Ordering::SeqCst) < rs.index {
            core.apply_wait
                .wait(rs.index)
                .await
                .map_err(|_| RaftError::Shutdown)?;
        }
        Ok(())
    }

    // ---- secret key ----

    async fn get_secret_key(&self) -> Result<Vec<u8>, RaftError> {
        self.linearizable_read_notify().await?;
        Ok(self.state.read().secret_key.clone())
    }

    /// Read the cluster secret, or create it if this node leads. Retries
    /// forever: the cluster is not usable without the key.
    async fn get_or_init_secret_key(&self) -> Vec<u8> {
        loop {
            match self.get_secret_key().await {
                Err(e) => log::warn!("failed to get secret key: {e}"),
                Ok(key) if !key.is_empty() => return key,
                Ok(_) => {
                    let is_leader = self.core.get().map_or(false, |c| c.node.is_leader());
                    if !is_leader {
                        log::info!("secret key is empty, waiting for the leader to initialize it");
                    } else {
                        log::info!("secret key is empty, initializing a new one");
                        let mut key = vec![0u8; 16];
                        rand::rngs::OsRng.fill_bytes(&mut key);
                        match self
                            .propose_raft_command(CommandKind::InitSecretKey { secret_key: key })
                            .await
                        {
                            Ok(CommandOutput::SecretKey(key)) => return key,
                            Ok(other) => {
                                log::warn!("unexpected secret key result: {other:?}")
                            }
                            Err(e) => log::warn!("failed to initialize secret key: {e}"),
                        }
                    }
                }
            }
            tokio::time::sleep(SECRET_KEY_RETRY).await;
        }
    }

    async fn init_aead(&self) {
        let key = self.get_or_init_secret_key().await;
        match Aes128Gcm::new_from_slice(&key) {
            Ok(cipher) => {
                let _ = self.aead.set(cipher);
                log::info!("AEAD cipher initialized");
            }
            Err(e) => fatal("cluster secret is not a valid AES key", &e),
        }
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
