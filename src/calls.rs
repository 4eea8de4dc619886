//! Call table: correlation of outbound calls with inbound replies.
//!
//! Every call registers a pending entry under a fresh callback id before
//! its packet is written. Because encode+send is synchronous relative to
//! decoding any reply, a reply can never be observed before its own entry
//! exists, so there is no orphan-reply race to handle.
//!
//! Settlement is at-most-once by construction: removing the entry from
//! the map is the single linearization point, and whichever of
//! {reply, timeout, close} removes it first wins. Later attempts find no
//! entry and are no-ops.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use rmpv::Value;
use tokio::sync::oneshot;

use crate::error::{Error, Result};

type Settlement = Result<Value>;

/// Per-connection table of outstanding calls.
///
/// Ids are strictly increasing and never reused while the connection
/// lives. The counter is 64-bit and wraparound is not guarded; reuse is
/// unreachable in practice on a single connection.
pub(crate) struct CallTable {
    /// Pending settlement channels by callback id.
    pending: Mutex<HashMap<u64, oneshot::Sender<Settlement>>>,
    /// Next callback id to allocate.
    next_id: AtomicU64,
}

impl CallTable {
    pub(crate) fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Allocate the next callback id and register its pending entry.
    ///
    /// Must be called before the outbound packet is written.
    pub(crate) fn register(&self) -> (u64, oneshot::Receiver<Settlement>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("call table lock poisoned")
            .insert(id, tx);
        (id, rx)
    }

    /// Deliver a settlement to the pending entry for `id`.
    ///
    /// Returns `false` when no entry exists — the call already settled via
    /// reply, timeout, or close, and this delivery is a no-op.
    pub(crate) fn settle(&self, id: u64, outcome: Settlement) -> bool {
        let tx = self
            .pending
            .lock()
            .expect("call table lock poisoned")
            .remove(&id);
        match tx {
            // A dropped receiver just means the caller went away first.
            Some(tx) => {
                let _ = tx.send(outcome);
                true
            }
            None => false,
        }
    }

    /// Remove a pending entry without settling it (timeout path).
    ///
    /// Returns `false` when the entry is already gone.
    pub(crate) fn discard(&self, id: u64) -> bool {
        self.pending
            .lock()
            .expect("call table lock poisoned")
            .remove(&id)
            .is_some()
    }

    /// Await settlement of `id`, optionally racing a timer.
    ///
    /// The race is biased toward the reply: if both the reply and the
    /// timer are ready, the reply wins. A timer that fires but loses the
    /// discard race to a concurrent settlement re-awaits the in-flight
    /// result instead of reporting a timeout, so a settled call is never
    /// reported as timed out.
    pub(crate) async fn wait(
        &self,
        id: u64,
        rx: oneshot::Receiver<Settlement>,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        let mut rx = rx;
        match timeout {
            None => rx.await.unwrap_or(Err(Error::ConnectionClosed)),
            Some(timeout) => {
                tokio::select! {
                    biased;
                    outcome = &mut rx => outcome.unwrap_or(Err(Error::ConnectionClosed)),
                    _ = tokio::time::sleep(timeout) => {
                        if self.discard(id) {
                            Err(Error::WaitTimeout { id })
                        } else {
                            rx.await.unwrap_or(Err(Error::ConnectionClosed))
                        }
                    }
                }
            }
        }
    }

    /// Force-settle every pending call with `CONNECTION_CLOSED`.
    ///
    /// Called once when the read loop ends, so no caller is ever left
    /// waiting on a dead connection.
    pub(crate) fn settle_all_closed(&self) {
        let drained: Vec<_> = {
            let mut pending = self.pending.lock().expect("call table lock poisoned");
            pending.drain().collect()
        };
        for (_, tx) in drained {
            let _ = tx.send(Err(Error::ConnectionClosed));
        }
    }

    /// Number of calls currently awaiting a reply.
    pub(crate) fn len(&self) -> usize {
        self.pending.lock().expect("call table lock poisoned").len()
    }
}
