//! Process-local set of clusters with work in flight
//!
//! The job worker and the reconciler share one [`BusySet`]. A cluster id is
//! held for as long as its [`BusyGuard`] lives. The worker waits for the
//! guard; the reconciler only tries and skips busy clusters.
//!
//! The set does not survive a restart and is not shared across processes, so
//! the controller must run as a single replica.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

#[derive(Default)]
struct Inner {
    ids: Mutex<HashSet<String>>,
    released: Notify,
}

/// Cluster ids with an operation in flight
#[derive(Clone, Default)]
pub struct BusySet {
    inner: Arc<Inner>,
}

impl BusySet {
    /// Create an empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `cluster_id` if nobody holds it
    pub fn try_acquire(&self, cluster_id: &str) -> Option<BusyGuard> {
        let mut ids = self.inner.ids.lock();
        if !ids.insert(cluster_id.to_string()) {
            return None;
        }
        Some(BusyGuard {
            set: self.clone(),
            cluster_id: cluster_id.to_string(),
        })
    }

    /// Wait until `cluster_id` is free, then claim it
    pub async fn acquire(&self, cluster_id: &str) -> BusyGuard {
        loop {
            // register before checking so a release between the two is not missed
            let released = self.inner.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            if let Some(guard) = self.try_acquire(cluster_id) {
                return guard;
            }
            released.await;
        }
    }

    /// Whether `cluster_id` is currently held
    pub fn is_busy(&self, cluster_id: &str) -> bool {
        self.inner.ids.lock().contains(cluster_id)
    }

    /// Number of clusters held
    pub fn len(&self) -> usize {
        self.inner.ids.lock().len()
    }

    /// True when nothing is held
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Holds a cluster id in a [`BusySet`] until dropped
pub struct BusyGuard {
    set: BusySet,
    cluster_id: String,
}

impl BusyGuard {
    /// The held cluster id
    pub fn cluster_id(&self) -> &str {
        &self.cluster_id
    }
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.set.inner.ids.lock().remove(&self.cluster_id);
        self.set.inner.released.notify_waiters();
    }
}

impl std::fmt::Debug for BusyGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusyGuard")
            .field("cluster_id", &self.cluster_id)
            .finish()
    }
}
