//! Session-owned cancellable timers
//!
//! Every timer a session arms (reconnect backoff, settle delays, key-frame
//! checkpoints) goes through a [`TimerSet`]. A fired timer is delivered to the
//! session's owner queue as a [`TimerFired`] and must be accepted with
//! [`TimerSet::accept`] before acting on it: fires from cancelled timers, or
//! from timers armed before an invalidation, are rejected.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// Timers a session may arm; at most one of each kind is outstanding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Next reconnect attempt
    Reconnect,
    /// Restart streaming after returning to the foreground
    ResumeSettle,
    /// Clear the `switching` flag after a facing switch
    SwitchSettle,
    /// Key-frame request checkpoint after a facing switch (index into the checkpoint list)
    KeyFrame(u8),
    /// Reconnect after a bounce tore the pipeline down
    BounceRestart,
}

/// A timer that elapsed, as delivered to the owner queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerFired {
    pub kind: TimerKind,
    epoch: u64,
    seq: u64,
}

/// Invalidates every timer of a session from outside its owner task
#[derive(Debug, Clone)]
pub struct TimerInvalidator {
    epoch: Arc<AtomicU64>,
}

impl TimerInvalidator {
    /// Make every currently armed timer a no-op. Takes effect immediately.
    pub fn invalidate(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
    }
}

struct Armed {
    seq: u64,
    epoch: u64,
    task: JoinHandle<()>,
}

/// Set of timers owned by one session
pub struct TimerSet {
    tx: mpsc::UnboundedSender<TimerFired>,
    epoch: Arc<AtomicU64>,
    armed: HashMap<TimerKind, Armed>,
    next_seq: u64,
}

impl TimerSet {
    pub fn new(tx: mpsc::UnboundedSender<TimerFired>) -> Self {
        Self {
            tx,
            epoch: Arc::new(AtomicU64::new(0)),
            armed: HashMap::new(),
            next_seq: 0,
        }
    }

    pub fn invalidator(&self) -> TimerInvalidator {
        TimerInvalidator {
            epoch: self.epoch.clone(),
        }
    }

    /// Arm `kind` to fire after `delay`, replacing any outstanding timer of the same kind
    pub fn arm(&mut self, kind: TimerKind, delay: Duration) {
        self.cancel(kind);

        self.next_seq += 1;
        let seq = self.next_seq;
        let epoch = self.epoch.load(Ordering::SeqCst);
        let current = self.epoch.clone();
        let tx = self.tx.clone();

        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if current.load(Ordering::SeqCst) != epoch {
                return;
            }
            let _ = tx.send(TimerFired { kind, epoch, seq });
        });

        debug!("Armed {:?} timer ({} ms)", kind, delay.as_millis());
        self.armed.insert(kind, Armed { seq, epoch, task });
    }

    /// Cancel the outstanding timer of `kind`, if any
    pub fn cancel(&mut self, kind: TimerKind) -> bool {
        match self.armed.remove(&kind) {
            Some(armed) => {
                armed.task.abort();
                true
            }
            None => false,
        }
    }

    /// Cancel every outstanding timer whose kind matches
    pub fn cancel_matching<F>(&mut self, mut pred: F)
    where
        F: FnMut(TimerKind) -> bool,
    {
        let kinds: Vec<TimerKind> = self.armed.keys().copied().filter(|k| pred(*k)).collect();
        for kind in kinds {
            self.cancel(kind);
        }
    }

    /// Cancel every timer and invalidate any fire already in flight
    pub fn cancel_all(&mut self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        for (_, armed) in self.armed.drain() {
            armed.task.abort();
        }
    }

    /// Validate a fire. Returns false for stale or cancelled timers,
    /// which the caller must then ignore.
    pub fn accept(&mut self, fired: TimerFired) -> bool {
        let epoch = self.epoch.load(Ordering::SeqCst);
        let live = match self.armed.get(&fired.kind) {
            Some(armed) => armed.seq == fired.seq && armed.epoch == fired.epoch && fired.epoch == epoch,
            None => false,
        };

        if live {
            self.armed.remove(&fired.kind);
        } else {
            debug!("Ignoring stale {:?} timer", fired.kind);
        }
        live
    }

    pub fn is_armed(&self, kind: TimerKind) -> bool {
        let epoch = self.epoch.load(Ordering::SeqCst);
        self.armed
            .get(&kind)
            .map(|armed| armed.epoch == epoch)
            .unwrap_or(false)
    }

    /// Number of timers that can still fire (including fires queued but not yet accepted)
    pub fn pending(&self) -> usize {
        let epoch = self.epoch.load(Ordering::SeqCst);
        self.armed
            .values()
            .filter(|armed| armed.epoch == epoch)
            .count()
    }
}

impl Drop for TimerSet {
    fn drop(&mut self) {
        for (_, armed) in self.armed.drain() {
            armed.task.abort();
        }
    }
}
