//! Rendezvous primitives between proposers, readers, and the applier.
//!
//! - [`IdGenerator`]: process-unique 64-bit command/read-context ids with the
//!   node ID in the high bits, so ids never collide across replicas even
//!   though every replica applies every entry.
//! - [`NotifyRegistry`]: at-most-once result delivery keyed by command id.
//! - [`ApplyWait`]: unblocks every waiter at or below a triggered log index.
//! - [`Completion`]: one-shot completion handle shared by a whole round of
//!   coalesced linearizable reads.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tokio::sync::{oneshot, watch};

use crate::commands::CommandResult;
use crate::error::RaftError;

const ID_PREFIX_BITS: u32 = 48;
const ID_SUFFIX_MASK: u64 = (1 << ID_PREFIX_BITS) - 1;
const ID_COUNTER_BITS: u32 = 8;

/// Generates 64-bit ids as `[node id (16)][unix ms (40)][counter (8)]`.
///
/// The counter wraps into the timestamp bits, which keeps ids monotonic per
/// process for far longer than any process lives.
#[derive(Debug)]
pub struct IdGenerator {
    prefix: u64,
    suffix: AtomicU64,
}

impl IdGenerator {
    pub fn new(node_id: u64) -> Self {
        let ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let suffix = (ms & (ID_SUFFIX_MASK >> ID_COUNTER_BITS)) << ID_COUNTER_BITS;
        Self {
            prefix: node_id << ID_PREFIX_BITS,
            suffix: AtomicU64::new(suffix),
        }
    }

    pub fn next(&self) -> u64 {
        let suffix = self.suffix.fetch_add(1, Ordering::Relaxed) + 1;
        self.prefix | (suffix & ID_SUFFIX_MASK)
    }
}

/// At-most-once notification channel per command id.
#[derive(Debug, Default)]
pub struct NotifyRegistry {
    pending: Mutex<HashMap<u64, oneshot::Sender<CommandResult>>>,
}

impl NotifyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register interest in a command id. The returned receiver fires once
    /// when the applier executes the command.
    pub fn register(&self, id: u64) -> oneshot::Receiver<CommandResult> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);
        rx
    }

    /// Deliver a result. Unknown ids and repeated triggers are no-ops; a
    /// receiver that was dropped (cancelled proposer) is ignored.
    pub fn trigger(&self, id: u64, result: CommandResult) {
        if let Some(tx) = self.pending.lock().remove(&id) {
            let _ = tx.send(result);
        }
    }

    /// Abandon a registration after a failed or timed-out proposal.
    pub fn deregister(&self, id: u64) {
        self.pending.lock().remove(&id);
    }

    #[cfg(test)]
    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }
}

#[derive(Debug, Default)]
struct ApplyWaitInner {
    last_triggered: u64,
    waiters: BTreeMap<u64, Vec<oneshot::Sender<()>>>,
}

/// Wait-until-applied primitive: `wait(i)` resolves once `trigger(j)` has
/// been called with `j >= i`.
#[derive(Debug, Default)]
pub struct ApplyWait {
    inner: Mutex<ApplyWaitInner>,
}

impl ApplyWait {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn wait(&self, index: u64) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.inner.lock();
        if index <= inner.last_triggered {
            let _ = tx.send(());
        } else {
            inner.waiters.entry(index).or_default().push(tx);
        }
        rx
    }

    pub fn trigger(&self, index: u64) {
        let fired = {
            let mut inner = self.inner.lock();
            if index > inner.last_triggered {
                inner.last_triggered = index;
            }
            let keep = inner.waiters.split_off(&(index + 1));
            std::mem::replace(&mut inner.waiters, keep)
        };
        for (_, senders) in fired {
            for tx in senders {
                let _ = tx.send(());
            }
        }
    }
}

#[derive(Debug, Clone)]
enum CompletionState {
    Pending,
    Done(Option<RaftError>),
}

/// One-shot completion observed by many waiters.
///
/// `notify` stores the outcome and wakes everyone; a second notify is a
/// no-op; a waiter arriving after completion sees the stored outcome
/// immediately.
#[derive(Debug, Clone)]
pub struct Completion {
    tx: std::sync::Arc<watch::Sender<CompletionState>>,
}

impl Default for Completion {
    fn default() -> Self {
        Self::new()
    }
}

impl Completion {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(CompletionState::Pending);
        Self { tx: std::sync::Arc::new(tx) }
    }

    pub fn notify(&self, err: Option<RaftError>) {
        self.tx.send_if_modified(|state| match state {
            CompletionState::Pending => {
                *state = CompletionState::Done(err.clone());
                true
            }
            CompletionState::Done(_) => false,
        });
    }

    pub async fn wait(&self) -> Result<(), RaftError> {
        let mut rx = self.tx.subscribe();
        loop {
            if let CompletionState::Done(err) = &*rx.borrow_and_update() {
                return match err {
                    Some(e) => Err(e.clone()),
                    None => Ok(()),
                };
            }
            if rx.changed().await.is_err() {
                return Err(RaftError::Shutdown);
            }
        }
    }
}
