//! Test-worker side of the bus.
//!
//! A [`SharedWorkerClient`] is what one test worker holds for one shared
//! worker plugin. Messages may only be published once the host has
//! forwarded the plugin's `available` signal.

use crate::bus::{MessageFilter, MessageIds, Router, Subscription, Verdict};
use crate::error::BusError;
use crate::host::SharedWorkerHost;
use crate::protocol::{negotiate, Envelope, DEFAULT_PROTOCOL};
use crate::transport::{EnvelopeReceiver, EnvelopeSender};
use futures_util::future::BoxFuture;
use futures_util::Stream;
use parking_lot::Mutex;
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use tokio::sync::mpsc::WeakUnboundedSender;
use tokio::sync::watch;

type TeardownFn = Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<()>> + Send>;

/// How a test worker registers with a shared worker plugin.
pub struct RegistrationOptions {
    pub filename: String,
    pub initial_data: Value,
    pub supported_protocols: Vec<String>,
    teardown: Option<TeardownFn>,
}

impl RegistrationOptions {
    pub fn new(filename: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            initial_data: Value::Null,
            supported_protocols: vec![DEFAULT_PROTOCOL.to_string()],
            teardown: None,
        }
    }

    pub fn with_initial_data(mut self, initial_data: Value) -> Self {
        self.initial_data = initial_data;
        self
    }

    pub fn with_supported_protocols<S: Into<String>>(
        mut self,
        protocols: impl IntoIterator<Item = S>,
    ) -> Self {
        self.supported_protocols = protocols.into_iter().map(Into::into).collect();
        self
    }

    /// Run `callback` when the client shuts down, before it deregisters.
    pub fn with_teardown<F, Fut>(mut self, callback: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.teardown = Some(Box::new(move || Box::pin(callback())));
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Availability {
    Pending,
    Available,
    Gone,
}

struct ClientShared {
    worker_id: String,
    filename: String,
    ids: MessageIds,
    router: Router<Arc<WorkerMessage>>,
    availability: watch::Sender<Availability>,
}

impl ClientShared {
    fn check_available(&self) -> Result<(), BusError> {
        match *self.availability.borrow() {
            Availability::Available => Ok(()),
            Availability::Pending => Err(BusError::not_yet_available(&self.filename)),
            Availability::Gone => Err(BusError::no_longer_available(&self.filename)),
        }
    }
}

/// Sending side shared by the client and the messages it received. Only
/// the client keeps the link alive; dropping it disconnects the worker.
#[derive(Clone)]
struct Outbox {
    link: WeakUnboundedSender<Envelope>,
    shared: Arc<ClientShared>,
}

impl Outbox {
    fn send(&self, data: Value, reply_to: Option<String>) -> Result<PublishedMessage, BusError> {
        self.shared.check_available()?;
        let link = self
            .link
            .upgrade()
            .ok_or_else(|| BusError::no_longer_available(&self.shared.filename))?;
        let id = self.shared.ids.next_id();
        link.send(Envelope::message(id.clone(), reply_to, None, data))
            .map_err(|_| BusError::no_longer_available(&self.shared.filename))?;
        Ok(PublishedMessage {
            id,
            shared: Arc::clone(&self.shared),
        })
    }
}

/// A test worker's connection to one shared worker plugin.
pub struct SharedWorkerClient {
    link: EnvelopeSender,
    outbox: Outbox,
    protocol: String,
    teardown: Mutex<Option<TeardownFn>>,
}

impl SharedWorkerClient {
    /// Negotiate the protocol and connect through `host`.
    pub fn register(
        host: &SharedWorkerHost,
        worker_id: &str,
        file: &str,
        options: RegistrationOptions,
    ) -> Result<Self, BusError> {
        let protocol = negotiate(
            &options.filename,
            host.protocol(),
            &options.supported_protocols,
        )?;
        let channel = host.connect(worker_id, file, &options.filename, options.initial_data)?;
        let (link, inbound) = channel.into_parts();

        let shared = Arc::new(ClientShared {
            worker_id: worker_id.to_string(),
            filename: options.filename,
            ids: MessageIds::new(worker_id),
            router: Router::new(),
            availability: watch::Sender::new(Availability::Pending),
        });
        let outbox = Outbox {
            link: link.downgrade(),
            shared: Arc::clone(&shared),
        };
        tokio::spawn(pump(outbox.clone(), inbound));

        Ok(Self {
            link,
            outbox,
            protocol,
            teardown: Mutex::new(options.teardown),
        })
    }

    pub fn worker_id(&self) -> &str {
        &self.outbox.shared.worker_id
    }

    pub fn filename(&self) -> &str {
        &self.outbox.shared.filename
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    /// Wait until the plugin is available. Fails if it went away first.
    pub async fn available(&self) -> Result<(), BusError> {
        let mut availability = self.outbox.shared.availability.subscribe();
        let state = availability
            .wait_for(|state| *state != Availability::Pending)
            .await
            .map(|state| *state)
            .unwrap_or(Availability::Gone);
        match state {
            Availability::Available => Ok(()),
            _ => Err(BusError::no_longer_available(self.filename())),
        }
    }

    pub fn currently_available(&self) -> bool {
        *self.outbox.shared.availability.borrow() == Availability::Available
    }

    /// Send `data` to the plugin. Fails without sending anything unless the
    /// plugin is available.
    pub fn publish(&self, data: Value) -> Result<PublishedMessage, BusError> {
        self.outbox.send(data, None)
    }

    /// Top-level messages from the plugin. Ends when the connection closes.
    pub fn subscribe(&self) -> MessageStream {
        MessageStream::open(&self.outbox.shared, MessageFilter::top_level())
    }

    /// Run the registration's teardown, deregister, and wait until the host
    /// confirms or the connection closes.
    pub async fn shutdown(self) -> Result<(), BusError> {
        let teardown = self.teardown.lock().take();
        let outcome = match teardown {
            Some(callback) => callback().await.map_err(|source| BusError::Teardown {
                worker_id: self.worker_id().to_string(),
                source,
            }),
            None => Ok(()),
        };

        let shared = Arc::clone(&self.outbox.shared);
        let mut availability = shared.availability.subscribe();
        let _ = self.link.send(Envelope::DeregisterWorker {
            id: shared.worker_id.clone(),
        });
        drop(self);
        let _ = availability
            .wait_for(|state| *state == Availability::Gone)
            .await;
        tracing::debug!(worker_id = %shared.worker_id, "Test worker shut down");
        outcome
    }
}

async fn pump(outbox: Outbox, mut inbound: EnvelopeReceiver) {
    let shared = Arc::clone(&outbox.shared);
    while let Some(envelope) = inbound.recv().await {
        match envelope {
            Envelope::Available => {
                tracing::debug!(worker_id = %shared.worker_id, "Shared worker available");
                shared.availability.send_replace(Availability::Available);
            }
            Envelope::Message {
                id, reply_to, data, ..
            } => {
                let message = Arc::new(WorkerMessage {
                    id,
                    reply_to,
                    data: data.unwrap_or(Value::Null),
                    outbox: outbox.clone(),
                });
                shared.router.publish(message).await;
            }
            Envelope::DeregisteredWorker { .. } => break,
            Envelope::RegisterWorker { .. } | Envelope::DeregisterWorker { .. } => {
                tracing::warn!(
                    kind = envelope.kind(),
                    "Ignoring envelope the host should never send to a test worker"
                );
            }
        }
    }
    tracing::debug!(worker_id = %shared.worker_id, "Connection to shared worker closed");
    shared.availability.send_replace(Availability::Gone);
    shared.router.close();
}

/// A message the plugin sent to this test worker.
pub struct WorkerMessage {
    id: String,
    reply_to: Option<String>,
    data: Value,
    outbox: Outbox,
}

impl std::fmt::Debug for WorkerMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerMessage")
            .field("id", &self.id)
            .field("reply_to", &self.reply_to)
            .field("data", &self.data)
            .finish()
    }
}

impl WorkerMessage {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn data(&self) -> &Value {
        &self.data
    }

    pub fn reply_to(&self) -> Option<&str> {
        self.reply_to.as_deref()
    }

    pub fn reply(&self, data: Value) -> Result<PublishedMessage, BusError> {
        self.outbox.send(data, Some(self.id.clone()))
    }
}

/// A message this worker published, with access to its replies.
#[derive(Clone)]
pub struct PublishedMessage {
    id: String,
    shared: Arc<ClientShared>,
}

impl std::fmt::Debug for PublishedMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublishedMessage")
            .field("id", &self.id)
            .finish()
    }
}

impl PublishedMessage {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn replies(&self) -> MessageStream {
        MessageStream::open(&self.shared, MessageFilter::replies_to(self.id.clone()))
    }
}

/// Filtered stream of messages from the plugin.
pub struct MessageStream {
    subscription: Option<Subscription<Arc<WorkerMessage>>>,
    filter: MessageFilter,
}

impl MessageStream {
    fn open(shared: &ClientShared, filter: MessageFilter) -> Self {
        Self {
            subscription: Some(shared.router.subscribe()),
            filter,
        }
    }
}

impl Stream for MessageStream {
    type Item = Arc<WorkerMessage>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            let Some(subscription) = this.subscription.as_mut() else {
                return Poll::Ready(None);
            };
            let Some(message) = ready!(subscription.poll_recv(cx)) else {
                this.subscription = None;
                return Poll::Ready(None);
            };
            if this.filter.check_message(None, message.reply_to(), true) == Verdict::Deliver {
                return Poll::Ready(Some(message));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::error::UnavailableReason;
    use crate::plugin::{builtin, plugin_fn, FactoryOptions, PluginCatalog};
    use futures_util::StreamExt;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    fn echo_host() -> SharedWorkerHost {
        SharedWorkerHost::new(Config::default(), PluginCatalog::with_builtins())
    }

    #[tokio::test]
    async fn unsupported_protocol_is_rejected_before_connecting() {
        let host = echo_host();
        let options = RegistrationOptions::new(builtin::ECHO).with_supported_protocols(["v1"]);
        let error = SharedWorkerClient::register(&host, "w1", "a.test.js", options)
            .err()
            .expect("v2 is required");
        assert!(matches!(error, BusError::ProtocolMismatch { .. }));
        assert!(host.plugin_status(builtin::ECHO).is_none());
    }

    #[tokio::test]
    async fn publish_before_available_sends_nothing() {
        let gate = Arc::new(Notify::new());
        let opened = Arc::clone(&gate);
        let received = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&received);
        let mut catalog = PluginCatalog::new();
        catalog.register(
            "slow.rs",
            plugin_fn(move |options: FactoryOptions| {
                let opened = Arc::clone(&opened);
                let flag = Arc::clone(&flag);
                async move {
                    let handle = options.negotiate_protocol(&["v2"])?;
                    let mut messages = handle.subscribe();
                    opened.notified().await;
                    handle.ready();
                    tokio::spawn(async move {
                        while messages.next().await.is_some() {
                            flag.store(true, Ordering::SeqCst);
                        }
                    });
                    Ok(())
                }
            }),
        );
        let host = SharedWorkerHost::new(Config::default(), catalog);
        let client = SharedWorkerClient::register(
            &host,
            "w1",
            "a.test.js",
            RegistrationOptions::new("slow.rs"),
        )
        .unwrap();

        let error = client.publish(json!("early")).expect_err("not ready yet");
        assert_eq!(
            error.unavailable_reason(),
            Some(UnavailableReason::NotYetAvailable)
        );
        assert!(!client.currently_available());

        gate.notify_one();
        timeout(WAIT, client.available()).await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!received.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn echo_round_trip() {
        let host = echo_host();
        let client = SharedWorkerClient::register(
            &host,
            "w1",
            "a.test.js",
            RegistrationOptions::new(builtin::ECHO),
        )
        .unwrap();
        timeout(WAIT, client.available()).await.unwrap().unwrap();
        assert_eq!(client.protocol(), "v2");

        let published = client.publish(json!({"ping": 1})).unwrap();
        let mut replies = published.replies();
        let reply = timeout(WAIT, replies.next()).await.unwrap().unwrap();
        assert_eq!(reply.data(), &json!({"ping": 1}));
        assert_eq!(reply.reply_to(), Some(published.id()));
    }

    #[tokio::test]
    async fn shutdown_runs_teardown_and_waits_for_confirmation() {
        let host = echo_host();
        let torn_down = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&torn_down);
        let options = RegistrationOptions::new(builtin::ECHO).with_teardown(move || async move {
            flag.store(true, Ordering::SeqCst);
            Ok(())
        });
        let client = SharedWorkerClient::register(&host, "w1", "a.test.js", options).unwrap();
        timeout(WAIT, client.available()).await.unwrap().unwrap();

        timeout(WAIT, client.shutdown()).await.unwrap().unwrap();
        assert!(torn_down.load(Ordering::SeqCst));
        assert!(host.registered_workers(builtin::ECHO).is_empty());
    }

    #[tokio::test]
    async fn crashed_plugin_reports_no_longer_available() {
        let mut catalog = PluginCatalog::new();
        catalog.register(
            "crashy.rs",
            plugin_fn(|options: FactoryOptions| async move {
                let _ = options.negotiate_protocol(&["v1"]);
                Ok(())
            }),
        );
        let host = SharedWorkerHost::new(Config::default(), catalog);
        let client = SharedWorkerClient::register(
            &host,
            "w1",
            "a.test.js",
            RegistrationOptions::new("crashy.rs"),
        )
        .unwrap();

        let error = timeout(WAIT, client.available())
            .await
            .unwrap()
            .expect_err("plugin crashed");
        assert_eq!(
            error.to_string(),
            "shared worker `crashy.rs` is no longer available"
        );
        let error = client.publish(json!(1)).expect_err("gone");
        assert_eq!(
            error.unavailable_reason(),
            Some(UnavailableReason::NoLongerAvailable)
        );
        let mut messages = client.subscribe();
        assert!(timeout(WAIT, messages.next()).await.unwrap().is_none());
    }
}
