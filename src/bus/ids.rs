use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_NAMESPACE: AtomicU64 = AtomicU64::new(1);

/// Correlation id allocator.
///
/// Ids look like `"{namespace}/message/{n}"` where `n` increases
/// monotonically. Namespaces combine the OS process id with a per-process
/// counter, so two buses in one process (or one host's many workers) never
/// hand out the same id.
#[derive(Debug)]
pub struct MessageIds {
    namespace: String,
    counter: AtomicU64,
}

impl MessageIds {
    /// Allocator whose namespace starts with `label` (a worker id, plugin
    /// filename, ...).
    pub fn new(label: &str) -> Self {
        let instance = NEXT_NAMESPACE.fetch_add(1, Ordering::Relaxed);
        Self::with_namespace(format!("{label}@{}.{instance}", std::process::id()))
    }

    pub fn with_namespace(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            counter: AtomicU64::new(0),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn next_id(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{}/message/{n}", self.namespace)
    }
}
