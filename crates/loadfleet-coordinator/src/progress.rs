//! Per-plan engine running state, used to gate start and stop completion.

use loadfleet_core::{CollectionId, PlanId};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// How long [`PlanProgress::terminate`] waits for engines to report stopped.
pub const TERMINATE_TIMEOUT: Duration = Duration::from_secs(60);

/// Interval between checks inside [`PlanProgress::terminate`].
pub const TERMINATE_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Running flag for one engine ordinal.
#[derive(Debug, Default)]
pub struct EngineProgress {
    running: AtomicBool,
}

impl EngineProgress {
    /// Whether the engine last reported running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn set(&self, running: bool) {
        self.running.store(running, Ordering::Release);
    }
}

/// Tracked state of one (collection, plan).
///
/// The number of engine slots is fixed at creation.
#[derive(Debug)]
pub struct Progress {
    /// Owning collection.
    pub collection_id: CollectionId,
    /// Tracked plan.
    pub plan_id: PlanId,
    engines: Vec<EngineProgress>,
}

impl Progress {
    /// A record with `engines` slots, all not running.
    pub fn new(collection_id: CollectionId, plan_id: PlanId, engines: usize) -> Self {
        Self {
            collection_id,
            plan_id,
            engines: (0..engines).map(|_| EngineProgress::default()).collect(),
        }
    }

    /// Number of engine slots.
    pub fn len(&self) -> usize {
        self.engines.len()
    }

    /// Whether the record tracks no engines.
    pub fn is_empty(&self) -> bool {
        self.engines.is_empty()
    }

    /// True iff every tracked engine reports running. False with no engines.
    pub fn is_running(&self) -> bool {
        !self.engines.is_empty() && self.engines.iter().all(EngineProgress::is_running)
    }

    /// True iff at least one engine reports running.
    pub fn any_running(&self) -> bool {
        self.engines.iter().any(EngineProgress::is_running)
    }

    fn set(&self, ordinal: usize, running: bool) -> bool {
        match self.engines.get(ordinal) {
            Some(engine) => {
                engine.set(running);
                true
            }
            None => false,
        }
    }
}

/// Concurrency-safe table of [`Progress`] records keyed by (collection, plan).
pub struct PlanProgress {
    records: RwLock<HashMap<(CollectionId, PlanId), Arc<Progress>>>,
    timeout: Duration,
    poll_interval: Duration,
}

impl Default for PlanProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl PlanProgress {
    /// An empty table using the default termination timing.
    pub fn new() -> Self {
        Self::with_timing(TERMINATE_TIMEOUT, TERMINATE_POLL_INTERVAL)
    }

    /// An empty table with custom termination timing.
    pub fn with_timing(timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            timeout,
            poll_interval,
        }
    }

    /// Register a record, replacing any stale one for the same key.
    pub fn add(&self, progress: Progress) {
        let key = (progress.collection_id, progress.plan_id);
        debug!(collection_id = key.0, plan_id = key.1, engines = progress.len(), "Progress added");
        self.records.write().insert(key, Arc::new(progress));
    }

    /// The record for (collection, plan), if tracked.
    pub fn get(&self, collection_id: CollectionId, plan_id: PlanId) -> Option<Arc<Progress>> {
        self.records.read().get(&(collection_id, plan_id)).cloned()
    }

    /// Record an engine report.
    ///
    /// Creates a record sized `ordinal + 1` when none exists. Reports for an
    /// ordinal beyond an existing record's size are dropped and `false` is returned.
    pub fn set_engine_status(
        &self,
        collection_id: CollectionId,
        plan_id: PlanId,
        ordinal: usize,
        running: bool,
    ) -> bool {
        let key = (collection_id, plan_id);
        let existing = self.records.read().get(&key).cloned();
        let progress = match existing {
            Some(p) => p,
            None => self
                .records
                .write()
                .entry(key)
                .or_insert_with(|| Arc::new(Progress::new(collection_id, plan_id, ordinal + 1)))
                .clone(),
        };
        let recorded = progress.set(ordinal, running);
        if !recorded {
            warn!(
                collection_id,
                plan_id,
                ordinal,
                engines = progress.len(),
                "Engine ordinal out of range, report dropped"
            );
        }
        recorded
    }

    /// Wait for every engine of the plan to stop, then forget the record.
    ///
    /// Call only after a stop has been broadcast. Returns within the
    /// configured timeout plus one poll interval whether or not engines report.
    pub async fn terminate(&self, collection_id: CollectionId, plan_id: PlanId) {
        let Some(progress) = self.get(collection_id, plan_id) else {
            return;
        };
        let deadline = Instant::now() + self.timeout;
        loop {
            tokio::time::sleep(self.poll_interval).await;
            if !progress.any_running() {
                info!(collection_id, plan_id, "All engines stopped");
                break;
            }
            if Instant::now() >= deadline {
                warn!(collection_id, plan_id, "Timed out waiting for engines to stop");
                break;
            }
        }
        let mut records = self.records.write();
        // A re-trigger may have replaced the record while we waited.
        if records
            .get(&(collection_id, plan_id))
            .is_some_and(|current| Arc::ptr_eq(current, &progress))
        {
            records.remove(&(collection_id, plan_id));
        }
    }

    /// Number of tracked plans.
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// Whether no plan is tracked.
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}
