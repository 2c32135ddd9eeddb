use crate::error::BusError;
use crate::protocol::Envelope;
use crate::transport::EnvelopeSender;
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

type TeardownFn = Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<()>> + Send>;

/// Lifecycle state of a test worker known to the registry.
///
/// `Unregistered` and `Gone` are represented by absence from the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Registered,
    Deregistering,
}

/// Reverse channel to one test worker. Everything sent through it is
/// addressed to that worker.
#[derive(Debug, Clone)]
pub struct WorkerPort {
    worker_id: String,
    link: EnvelopeSender,
}

impl WorkerPort {
    pub fn new(worker_id: impl Into<String>, link: EnvelopeSender) -> Self {
        Self {
            worker_id: worker_id.into(),
            link,
        }
    }

    /// Post `envelope` to the worker. Returns `false` once the link closed.
    pub fn send(&self, envelope: Envelope) -> bool {
        self.link.send(envelope.with_worker(&self.worker_id)).is_ok()
    }
}

/// Registry record for one connected test worker.
pub struct WorkerEntry {
    id: String,
    file: String,
    sequence: u64,
    port: WorkerPort,
    state: Mutex<WorkerState>,
    teardown: Mutex<TeardownSet>,
}

#[derive(Default)]
struct TeardownSet {
    next_id: u64,
    slots: Vec<Arc<TeardownSlot>>,
}

struct TeardownSlot {
    id: u64,
    callback: Mutex<Option<TeardownFn>>,
}

impl TeardownSlot {
    fn take(&self) -> Option<TeardownFn> {
        self.callback.lock().take()
    }
}

impl WorkerEntry {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn file(&self) -> &str {
        &self.file
    }

    pub fn port(&self) -> &WorkerPort {
        &self.port
    }

    pub fn state(&self) -> WorkerState {
        *self.state.lock()
    }

    /// Number of teardown callbacks still pending.
    pub fn pending_teardowns(&self) -> usize {
        self.teardown.lock().slots.len()
    }

    /// Append `callback` to this worker's ordered teardown set.
    pub fn teardown<F, Fut>(self: &Arc<Self>, callback: F) -> TeardownHandle
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let boxed: TeardownFn = Box::new(move || Box::pin(callback()));
        let mut set = self.teardown.lock();
        set.next_id += 1;
        let slot = Arc::new(TeardownSlot {
            id: set.next_id,
            callback: Mutex::new(Some(boxed)),
        });
        set.slots.push(Arc::clone(&slot));
        TeardownHandle {
            slot,
            entry: Arc::downgrade(self),
        }
    }

    pub(crate) fn begin_deregistration(&self) {
        *self.state.lock() = WorkerState::Deregistering;
    }

    fn forget_slot(&self, id: u64) {
        self.teardown.lock().slots.retain(|slot| slot.id != id);
    }

    /// Run every pending teardown callback, last registered first, each
    /// awaited before the next. The first failure aborts the remainder.
    pub(crate) async fn run_teardown(&self) -> Result<(), BusError> {
        self.begin_deregistration();
        let slots = std::mem::take(&mut self.teardown.lock().slots);
        tracing::debug!(
            worker_id = %self.id,
            callbacks = slots.len(),
            "Running test worker teardown"
        );

        for slot in slots.into_iter().rev() {
            let Some(callback) = slot.take() else {
                continue;
            };
            callback().await.map_err(|source| BusError::Teardown {
                worker_id: self.id.clone(),
                source,
            })?;
        }
        Ok(())
    }
}

/// Returned by [`WorkerEntry::teardown`]. Releasing removes the callback
/// from the worker's teardown set and runs it right away; later releases
/// (and the worker's own deregistration) no longer run it.
#[derive(Clone)]
pub struct TeardownHandle {
    slot: Arc<TeardownSlot>,
    entry: Weak<WorkerEntry>,
}

impl TeardownHandle {
    pub async fn release(&self) -> anyhow::Result<()> {
        if let Some(entry) = self.entry.upgrade() {
            entry.forget_slot(self.slot.id);
        }
        match self.slot.take() {
            Some(callback) => callback().await,
            None => Ok(()),
        }
    }
}

/// Exclusive owner of the worker id → entry mapping for one plugin.
#[derive(Clone, Default)]
pub struct Registry {
    workers: Arc<Mutex<HashMap<String, Arc<WorkerEntry>>>>,
    sequence: Arc<AtomicU64>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        id: &str,
        file: &str,
        port: WorkerPort,
    ) -> Result<Arc<WorkerEntry>, BusError> {
        let mut workers = self.workers.lock();
        if workers.contains_key(id) {
            return Err(BusError::DuplicateWorker { id: id.to_string() });
        }
        let entry = Arc::new(WorkerEntry {
            id: id.to_string(),
            file: file.to_string(),
            sequence: self.sequence.fetch_add(1, Ordering::Relaxed),
            port,
            state: Mutex::new(WorkerState::Registered),
            teardown: Mutex::new(TeardownSet::default()),
        });
        workers.insert(id.to_string(), Arc::clone(&entry));
        tracing::debug!(worker_id = id, file, "Registered test worker");
        Ok(entry)
    }

    /// `None` means the worker is already gone; that is a normal race for
    /// in-flight replies, not an error.
    pub fn lookup(&self, id: &str) -> Option<Arc<WorkerEntry>> {
        self.workers.lock().get(id).cloned()
    }

    pub fn remove(&self, id: &str) -> Option<Arc<WorkerEntry>> {
        let removed = self.workers.lock().remove(id);
        if removed.is_some() {
            tracing::debug!(worker_id = id, "Removed test worker");
        }
        removed
    }

    /// Registered workers in registration order.
    pub fn snapshot(&self) -> Vec<Arc<WorkerEntry>> {
        let mut entries: Vec<_> = self.workers.lock().values().cloned().collect();
        entries.sort_by_key(|entry| entry.sequence);
        entries
    }
}
