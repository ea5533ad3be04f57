//! Capability registry.
//!
//! Tracks the worker pool: what each worker can take on, whether it is
//! available, and how reliably it has performed. Each worker sits behind
//! its own mutex so outcome updates for different workers never contend.

use crate::clock::{Clock, SystemClock};
use crate::core::task::Complexity;
use crate::core::worker::{Worker, WorkerId, WorkerStatus};
use crate::error::{Error, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

/// Smoothing factor for the success-rate moving average.
pub const SUCCESS_RATE_ALPHA: f64 = 0.1;

type WorkerEntry = Arc<Mutex<Worker>>;

/// Registry of workers keyed by id.
#[derive(Debug)]
pub struct CapabilityRegistry {
    workers: RwLock<HashMap<WorkerId, WorkerEntry>>,
    clock: Arc<dyn Clock>,
}

impl Default for CapabilityRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            workers: RwLock::new(HashMap::new()),
            clock,
        }
    }

    /// Register a worker, replacing any previous record with the same id.
    ///
    /// # Arguments
    ///
    /// * `id` - Worker identifier
    /// * `domains` - Domains the worker handles
    /// * `max_complexity` - Highest complexity the worker accepts
    /// * `initial_success_rate` - Starting success rate, clamped to `[0, 1]`
    pub fn register(
        &self,
        id: impl Into<WorkerId>,
        domains: impl IntoIterator<Item = impl Into<String>>,
        max_complexity: Complexity,
        initial_success_rate: f64,
    ) {
        let worker = Worker::new(id, domains, max_complexity, initial_success_rate);
        tracing::debug!(
            worker = %worker.id,
            domains = ?worker.domains,
            max_complexity = %worker.max_complexity,
            "worker registered"
        );
        self.write_map()
            .insert(worker.id.clone(), Arc::new(Mutex::new(worker)));
    }

    /// Remove a worker. Returns the last known record.
    pub fn deregister(&self, id: &WorkerId) -> Option<Worker> {
        let entry = self.write_map().remove(id)?;
        let worker = lock(&entry).clone();
        tracing::debug!(worker = %id, "worker deregistered");
        Some(worker)
    }

    /// Fold an execution outcome into the worker's statistics.
    ///
    /// Returns the updated success rate.
    pub fn record_outcome(&self, id: &WorkerId, domain: Option<&str>, success: bool) -> Result<f64> {
        let entry = self.entry(id)?;
        let mut worker = lock(&entry);
        worker.record_outcome(domain, success, SUCCESS_RATE_ALPHA, self.clock.now());
        Ok(worker.success_rate)
    }

    pub fn set_status(&self, id: &WorkerId, status: WorkerStatus) -> Result<()> {
        let entry = self.entry(id)?;
        lock(&entry).status = status;
        Ok(())
    }

    pub fn get(&self, id: &WorkerId) -> Option<Worker> {
        let entry = self.read_map().get(id).cloned()?;
        let worker = lock(&entry).clone();
        Some(worker)
    }

    pub fn contains(&self, id: &WorkerId) -> bool {
        self.read_map().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.read_map().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read_map().is_empty()
    }

    /// Workers able to take a task of this domain and complexity, best
    /// success rate first, ties by id.
    pub fn capable_workers(&self, domain: Option<&str>, complexity: Complexity) -> Vec<Worker> {
        rank_capable(&self.snapshot(), domain, complexity)
    }

    pub fn available_workers(&self) -> Vec<Worker> {
        self.snapshot()
            .into_iter()
            .filter(Worker::is_available)
            .collect()
    }

    /// Point-in-time copy of every worker, sorted by id.
    pub fn snapshot(&self) -> Vec<Worker> {
        let entries: Vec<WorkerEntry> = self.read_map().values().cloned().collect();
        let mut workers: Vec<Worker> = entries.iter().map(|e| lock(e).clone()).collect();
        workers.sort_by(|a, b| a.id.cmp(&b.id));
        workers
    }

    fn entry(&self, id: &WorkerId) -> Result<WorkerEntry> {
        self.read_map()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::WorkerNotFound(id.clone()))
    }

    fn read_map(&self) -> std::sync::RwLockReadGuard<'_, HashMap<WorkerId, WorkerEntry>> {
        self.workers.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_map(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<WorkerId, WorkerEntry>> {
        self.workers.write().unwrap_or_else(|e| e.into_inner())
    }
}

fn lock(entry: &WorkerEntry) -> MutexGuard<'_, Worker> {
    entry.lock().unwrap_or_else(|e| e.into_inner())
}

/// Filter `workers` to those capable of the task and order them by
/// success rate descending, then id.
pub fn rank_capable(workers: &[Worker], domain: Option<&str>, complexity: Complexity) -> Vec<Worker> {
    let mut capable: Vec<Worker> = workers
        .iter()
        .filter(|w| w.can_handle(domain, complexity))
        .cloned()
        .collect();
    capable.sort_by(|a, b| {
        b.success_rate
            .total_cmp(&a.success_rate)
            .then_with(|| a.id.cmp(&b.id))
    });
    capable
}
