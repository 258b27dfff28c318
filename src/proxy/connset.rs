use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

/// Handle to one proxied connection. The pump owns the streams; everyone else
/// (shutdown, idle sweeps) interacts through the cancellation token carried
/// here. The pump stamps `last_activity` on every successful read or write.
#[derive(Clone)]
pub struct ConnHandle {
    pub instance: String,
    pub conn_id: u64,
    epoch: Instant,
    token: CancellationToken,
    last_activity: Arc<AtomicU64>,
}

impl ConnHandle {
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Record activity now.
    pub fn touch(&self) {
        self.last_activity
            .store(self.epoch.elapsed().as_millis() as u64, Ordering::Relaxed);
    }

    /// Ask the owning pump to tear the connection down.
    pub fn close(&self) {
        self.token.cancel();
    }

    fn idle_for(&self) -> Duration {
        let now_ms = self.epoch.elapsed().as_millis() as u64;
        let last = self.last_activity.load(Ordering::Relaxed);
        Duration::from_millis(now_ms.saturating_sub(last))
    }
}

/// Registry of live proxied connections, keyed by instance connection name.
///
/// Every handle registered here is currently being pumped or awaiting close;
/// `remove` is called exactly once per `add`, by the task that ran the pump.
#[derive(Clone)]
pub struct ConnSet {
    epoch: Instant,
    conns: Arc<DashMap<String, Vec<ConnHandle>>>,
}

impl Default for ConnSet {
    fn default() -> Self {
        Self {
            epoch: Instant::now(),
            conns: Arc::new(DashMap::new()),
        }
    }
}

impl ConnSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a handle tied to this set's clock. Not yet registered.
    pub fn make_handle(&self, instance: &str, conn_id: u64) -> ConnHandle {
        let handle = ConnHandle {
            instance: instance.to_string(),
            conn_id,
            epoch: self.epoch,
            token: CancellationToken::new(),
            last_activity: Arc::new(AtomicU64::new(0)),
        };
        handle.touch();
        handle
    }

    pub fn add(&self, handle: ConnHandle) {
        self.conns
            .entry(handle.instance.clone())
            .or_default()
            .push(handle);
    }

    /// Remove one registration. Returns false when no matching entry exists.
    pub fn remove(&self, instance: &str, conn_id: u64) -> bool {
        let Some(mut entry) = self.conns.get_mut(instance) else {
            return false;
        };
        let list = entry.value_mut();
        let Some(pos) = list.iter().position(|h| h.conn_id == conn_id) else {
            return false;
        };
        list.remove(pos);
        let now_empty = list.is_empty();
        drop(entry);
        if now_empty {
            // Racing adds re-create the entry; removing an empty vec is tidy,
            // not load-bearing.
            self.conns
                .remove_if(instance, |_, list| list.is_empty());
        }
        true
    }

    /// Instances with at least one open connection.
    pub fn ids(&self) -> Vec<String> {
        self.conns
            .iter()
            .filter(|e| !e.value().is_empty())
            .map(|e| e.key().clone())
            .collect()
    }

    /// Snapshot of the handles registered for the given instances.
    pub fn conns(&self, ids: &[&str]) -> Vec<ConnHandle> {
        let mut out = Vec::new();
        for id in ids {
            if let Some(entry) = self.conns.get(*id) {
                out.extend(entry.value().iter().cloned());
            }
        }
        out
    }

    pub fn len(&self) -> usize {
        self.conns.iter().map(|e| e.value().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Signal every connection to close. Best-effort; returns how many were
    /// signalled. The owning pumps unregister as they exit.
    pub fn close(&self) -> usize {
        let mut closed = 0;
        for entry in self.conns.iter() {
            for handle in entry.value() {
                handle.close();
                closed += 1;
            }
        }
        closed
    }

    /// Close exactly the connections idle for longer than `threshold`.
    pub fn close_idle(&self, threshold: Duration) -> usize {
        let mut closed = 0;
        for entry in self.conns.iter() {
            for handle in entry.value() {
                if handle.idle_for() > threshold {
                    handle.close();
                    closed += 1;
                }
            }
        }
        closed
    }
}
