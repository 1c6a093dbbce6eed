//! Top-level `Cache` wiring (components A–G) behind the operations in
//! [`crate::ops`].
//!
//! One `Cache` owns the index, the LRU engine, the entry pool, and a
//! handle to the reclaimer, then hands out `Arc<Entry>` references to
//! callers, each of a few long-lived shared tasks touching a piece of
//! that state rather than owning a private copy of it.

use std::sync::Arc;
use std::time::Duration;

use crate::backend::Backend;
use crate::config::CacheConfig;
use crate::entry::pool::EntryPool;
use crate::error::CacheError;
use crate::index::Index;
use crate::lru::{LruEngine, Reclaimer};

/// The cache's top-level handle (spec §2's "control flow of a typical
/// protocol op" runs entirely through methods in [`crate::ops`] on this
/// type).
pub struct Cache {
    pub(crate) index: Index,
    pub(crate) lru: Arc<LruEngine>,
    pub(crate) pool: Arc<EntryPool>,
    pub(crate) backend: Arc<dyn Backend>,
    pub(crate) reclaimer: Arc<Reclaimer>,
    pub(crate) config: CacheConfig,
}

impl Cache {
    /// Build a new cache in front of `backend`. `fd_limit` is the process's
    /// descriptor budget the configured `fd_*_percent` watermarks are
    /// fractions of (spec §6); this crate does not query the OS rlimit
    /// itself (see `DESIGN.md`), callers are expected to pass whatever
    /// `getrlimit(RLIMIT_NOFILE)` or an equivalent reports.
    pub fn new(config: CacheConfig, fd_limit: u64, backend: Arc<dyn Backend>) -> Result<Self, CacheError> {
        config.validate()?;

        let pool = Arc::new(EntryPool::new(config.entries_hwmark as usize, config.lanes));
        let index = Index::new(config.nparts, config.cache_entry_count, pool.clone());
        let lru = Arc::new(LruEngine::new(config.lanes, pool.clone()));
        let reclaimer = Arc::new(Reclaimer::new(lru.clone(), backend.clone(), config.clone(), fd_limit));

        tracing::info!(
            nparts = config.nparts,
            lanes = config.lanes,
            entries_hwmark = config.entries_hwmark,
            "cache initialized"
        );

        Ok(Self { index, lru, pool, backend, reclaimer, config })
    }

    /// Spawn the reclaimer as a long-lived background task (spec §4.4
    /// "Reclaimer thread"). The caller owns the returned handle; dropping
    /// it does not stop the task, which keeps running fire-and-forget
    /// until [`Cache::shutdown`] signals it.
    pub fn spawn_reclaimer(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let reclaimer = self.reclaimer.clone();
        tokio::spawn(reclaimer.run_forever())
    }

    pub fn live_entry_count(&self) -> usize {
        self.pool.live_count()
    }

    pub fn open_descriptor_count(&self) -> u64 {
        self.reclaimer.open_fd_count()
    }

    /// Run one reclaimer pass inline rather than waiting for the background
    /// task's adaptive sleep (spec §8 testable properties: reclamation
    /// behavior should be directly exercisable).
    pub async fn run_reclaimer_pass(&self) {
        self.reclaimer.pass(false).await;
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Tear the cache down (spec §5 "Cancellation / timeout"): signal the
    /// reclaimer to stop, give it `drain_timeout` to finish whatever pass
    /// it is mid-way through before forcing cancellation, then walk every
    /// entry still reachable in the index and run the shutdown-only,
    /// lock-free teardown path.
    ///
    /// That teardown path performs no locking at all and must never run
    /// while ordinary request handling is still live — a worker cancelled
    /// mid-operation could be holding a per-entry lock, and acquiring it
    /// here would deadlock. The live reference-drop path (`LruEngine::unref`)
    /// never calls it for exactly that reason; an entry's external state is
    /// instead reset lazily by `reset_for` the next time its slot is handed
    /// back out. `shutdown` is the only place this path runs, once workers
    /// are confirmed gone (or force-cancelled), so nothing is left to race.
    pub async fn shutdown(&self, reclaimer_task: tokio::task::JoinHandle<()>, drain_timeout: Duration) {
        self.reclaimer.signal_shutdown();

        let mut reclaimer_task = reclaimer_task;
        tokio::select! {
            res = &mut reclaimer_task => {
                if let Err(e) = res {
                    tracing::warn!(error = %e, "reclaimer task ended abnormally during shutdown");
                }
            }
            _ = tokio::time::sleep(drain_timeout) => {
                tracing::warn!("reclaimer did not drain within the timeout, forcing cancellation");
                reclaimer_task.abort();
            }
        }

        self.index.for_each(|_key, entry| {
            entry.destroy_state_unlocked();
        });
        tracing::info!("cache shutdown complete");
    }
}
