//! Capability objects handed to plugin code: the factory options, the
//! negotiated protocol handle, per-worker handles and message wrappers.

use super::lifecycle::{PluginCore, PluginEvent};
use super::registry::{TeardownHandle, WorkerEntry, WorkerState};
use crate::bus::{MessageFilter, Subscription, Verdict};
use crate::error::BusError;
use crate::protocol::{negotiate, Envelope};
use futures_util::Stream;
use serde_json::Value;
use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::task::{ready, Context, Poll};

/// Passed to [`PluginFactory::start`](super::PluginFactory::start).
pub struct FactoryOptions {
    core: Arc<PluginCore>,
}

impl FactoryOptions {
    pub(crate) fn new(core: Arc<PluginCore>) -> Self {
        Self { core }
    }

    pub fn filename(&self) -> &str {
        &self.core.filename
    }

    /// Agree on a protocol version. When the framework's required version is
    /// not in `supported` the plugin worker crashes with the returned
    /// [`BusError::ProtocolMismatch`].
    pub fn negotiate_protocol<S: AsRef<str>>(
        &self,
        supported: &[S],
    ) -> Result<ProtocolHandle, BusError> {
        match negotiate(&self.core.filename, &self.core.required_protocol, supported) {
            Ok(protocol) => Ok(ProtocolHandle {
                core: Arc::clone(&self.core),
                protocol,
            }),
            Err(BusError::ProtocolMismatch {
                filename,
                required,
                supported,
            }) => {
                self.core.crash.capture(BusError::ProtocolMismatch {
                    filename: filename.clone(),
                    required: required.clone(),
                    supported: supported.clone(),
                });
                Err(BusError::ProtocolMismatch {
                    filename,
                    required,
                    supported,
                })
            }
            Err(other) => Err(other),
        }
    }
}

/// The plugin's view of the bus after a successful negotiation.
#[derive(Clone)]
pub struct ProtocolHandle {
    core: Arc<PluginCore>,
    protocol: String,
}

impl ProtocolHandle {
    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn initial_data(&self) -> &Value {
        &self.core.initial_data
    }

    pub fn currently_available(&self) -> bool {
        self.core.available.load(Ordering::Acquire)
    }

    /// Signal the host that the plugin can serve test workers. Only the
    /// first call has any effect.
    pub fn ready(&self) -> &Self {
        if !self.core.available.swap(true, Ordering::AcqRel) {
            tracing::info!(filename = %self.core.filename, "Shared worker is available");
            if self.core.link.send(Envelope::Available).is_err() {
                tracing::warn!(
                    filename = %self.core.filename,
                    "Host link closed before availability"
                );
            }
        }
        self
    }

    /// Send `data` to every test worker registered right now. Workers that
    /// register later do not receive it.
    pub fn broadcast(&self, data: Value) -> PublishedMessage {
        let id = self.core.ids.next_id();
        let mut recipients = 0usize;
        for entry in self.core.registry.snapshot() {
            if entry.state() != WorkerState::Registered {
                continue;
            }
            if entry
                .port()
                .send(Envelope::message(id.clone(), None, None, data.clone()))
            {
                recipients += 1;
            }
        }
        tracing::debug!(message_id = %id, recipients, "Broadcast message");
        PublishedMessage::new(id.clone(), &self.core, MessageFilter::replies_to(id))
    }

    /// Top-level messages from every test worker, including late messages
    /// from workers that already left.
    pub fn subscribe(&self) -> MessageStream {
        MessageStream::open(&self.core, MessageFilter::top_level())
    }

    /// Every registered test worker, each exactly once: first those already
    /// registered, then newcomers as they arrive.
    pub fn test_workers(&self) -> TestWorkerStream {
        TestWorkerStream::open(&self.core)
    }
}

/// One connected test worker as seen by the plugin.
#[derive(Clone)]
pub struct TestWorker {
    entry: Arc<WorkerEntry>,
    core: Arc<PluginCore>,
}

impl std::fmt::Debug for TestWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestWorker")
            .field("id", &self.id())
            .field("file", &self.file())
            .field("state", &self.entry.state())
            .finish()
    }
}

impl TestWorker {
    pub(crate) fn new(entry: Arc<WorkerEntry>, core: Arc<PluginCore>) -> Self {
        Self { entry, core }
    }

    pub fn id(&self) -> &str {
        self.entry.id()
    }

    pub fn file(&self) -> &str {
        self.entry.file()
    }

    pub fn currently_available(&self) -> bool {
        self.entry.state() == WorkerState::Registered
    }

    pub fn publish(&self, data: Value) -> PublishedMessage {
        self.send_message(data, None)
    }

    /// Top-level messages from this worker. Ends when the worker
    /// deregisters.
    pub fn subscribe(&self) -> MessageStream {
        MessageStream::open(&self.core, MessageFilter::top_level().bound_to(self.id()))
    }

    /// Register `callback` to run when this worker deregisters. Callbacks run
    /// last-registered first; a failure crashes the plugin.
    pub fn teardown<F, Fut>(&self, callback: F) -> TeardownHandle
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.entry.teardown(callback)
    }

    pub(crate) fn send_message(&self, data: Value, reply_to: Option<String>) -> PublishedMessage {
        let id = self.core.ids.next_id();
        if !self
            .entry
            .port()
            .send(Envelope::message(id.clone(), reply_to, None, data))
        {
            tracing::debug!(worker_id = %self.id(), "Host link closed, message dropped");
        }
        let filter = MessageFilter::replies_to(id.clone()).bound_to(self.id());
        PublishedMessage::new(id, &self.core, filter)
    }
}

/// A message delivered to the plugin. One instance exists per received
/// envelope and is shared by every stream that yields it.
#[derive(Debug)]
pub struct ReceivedMessage {
    id: String,
    reply_to: Option<String>,
    worker_id: Option<String>,
    data: Value,
    worker: Option<TestWorker>,
}

impl ReceivedMessage {
    pub(crate) fn new(
        id: String,
        reply_to: Option<String>,
        worker_id: Option<String>,
        data: Value,
        worker: Option<TestWorker>,
    ) -> Self {
        Self {
            id,
            reply_to,
            worker_id,
            data,
            worker,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn data(&self) -> &Value {
        &self.data
    }

    pub fn reply_to(&self) -> Option<&str> {
        self.reply_to.as_deref()
    }

    pub fn worker_id(&self) -> Option<&str> {
        self.worker_id.as_deref()
    }

    /// The sending worker, unless it had already left when the message
    /// arrived.
    pub fn test_worker(&self) -> Option<&TestWorker> {
        self.worker.as_ref()
    }

    pub fn reply(&self, data: Value) -> Result<PublishedMessage, BusError> {
        match &self.worker {
            Some(worker) => Ok(worker.send_message(data, Some(self.id.clone()))),
            None => Err(BusError::worker_gone(
                self.worker_id.as_deref().unwrap_or("unknown"),
            )),
        }
    }
}

/// Result of a publish or broadcast: its correlation id and a way to read
/// the replies it receives.
#[derive(Clone)]
pub struct PublishedMessage {
    id: String,
    core: Arc<PluginCore>,
    filter: MessageFilter,
}

impl PublishedMessage {
    fn new(id: String, core: &Arc<PluginCore>, filter: MessageFilter) -> Self {
        Self {
            id,
            core: Arc::clone(core),
            filter,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Replies to this message, in arrival order. Replies to an addressed
    /// publish end when that worker deregisters.
    pub fn replies(&self) -> MessageStream {
        MessageStream::open(&self.core, self.filter.clone())
    }
}

/// Filtered stream of received messages. Dropping it releases the
/// underlying subscription.
pub struct MessageStream {
    subscription: Option<Subscription<PluginEvent>>,
    filter: MessageFilter,
}

impl MessageStream {
    fn open(core: &Arc<PluginCore>, filter: MessageFilter) -> Self {
        let subscription = core.router.subscribe();
        let bound_worker_left = filter.worker_id.as_deref().is_some_and(|worker_id| {
            core.registry
                .lookup(worker_id)
                .is_none_or(|entry| entry.state() != WorkerState::Registered)
        });
        Self {
            subscription: (!bound_worker_left).then_some(subscription),
            filter,
        }
    }

    fn finish(&mut self) -> Poll<Option<Arc<ReceivedMessage>>> {
        self.subscription = None;
        Poll::Ready(None)
    }
}

impl Stream for MessageStream {
    type Item = Arc<ReceivedMessage>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            let Some(subscription) = this.subscription.as_mut() else {
                return Poll::Ready(None);
            };
            match ready!(subscription.poll_recv(cx)) {
                None => return this.finish(),
                Some(PluginEvent::Message(message)) => {
                    let verdict = this.filter.check_message(
                        message.worker_id(),
                        message.reply_to(),
                        message.test_worker().is_some(),
                    );
                    if verdict == Verdict::Deliver {
                        return Poll::Ready(Some(message));
                    }
                }
                Some(PluginEvent::Deregistering(worker_id)) => {
                    if this.filter.check_deregistration(&worker_id) == Verdict::End {
                        return this.finish();
                    }
                }
                Some(PluginEvent::Registered(_)) => {}
            }
        }
    }
}

/// Stream of test workers, yielding each registered worker once.
pub struct TestWorkerStream {
    backlog: VecDeque<TestWorker>,
    seen: HashSet<String>,
    subscription: Option<Subscription<PluginEvent>>,
}

impl TestWorkerStream {
    fn open(core: &Arc<PluginCore>) -> Self {
        let subscription = core.router.subscribe();
        let mut seen = HashSet::new();
        let backlog = core
            .registry
            .snapshot()
            .into_iter()
            .filter(|entry| entry.state() == WorkerState::Registered)
            .filter(|entry| seen.insert(entry.id().to_string()))
            .map(|entry| TestWorker::new(entry, Arc::clone(core)))
            .collect();
        Self {
            backlog,
            seen,
            subscription: Some(subscription),
        }
    }
}

impl Stream for TestWorkerStream {
    type Item = TestWorker;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if let Some(worker) = this.backlog.pop_front() {
            return Poll::Ready(Some(worker));
        }
        loop {
            let Some(subscription) = this.subscription.as_mut() else {
                return Poll::Ready(None);
            };
            match ready!(subscription.poll_recv(cx)) {
                None => {
                    this.subscription = None;
                    return Poll::Ready(None);
                }
                Some(PluginEvent::Registered(worker)) => {
                    if this.seen.insert(worker.id().to_string()) {
                        return Poll::Ready(Some(worker));
                    }
                }
                Some(PluginEvent::Deregistering(worker_id)) => {
                    this.seen.remove(&worker_id);
                }
                Some(PluginEvent::Message(_)) => {}
            }
        }
    }
}
