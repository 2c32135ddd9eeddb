use super::protocol::{FactoryOptions, ReceivedMessage, TestWorker};
use super::registry::{Registry, WorkerPort};
use super::PluginFactory;
use crate::bus::{MessageIds, Router};
use crate::error::BusError;
use crate::protocol::{Envelope, DEFAULT_PROTOCOL};
use crate::transport::{Channel, EnvelopeSender};
use futures_util::FutureExt;
use parking_lot::Mutex;
use serde_json::Value;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// What the host tells a plugin worker when launching it.
#[derive(Debug, Clone)]
pub struct PluginLaunch {
    pub filename: String,
    pub initial_data: Value,
    /// Protocol version the framework requires the factory to support.
    pub protocol: String,
}

impl PluginLaunch {
    pub fn new(filename: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            initial_data: Value::Null,
            protocol: DEFAULT_PROTOCOL.to_string(),
        }
    }

    pub fn with_initial_data(mut self, initial_data: Value) -> Self {
        self.initial_data = initial_data;
        self
    }

    pub fn with_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = protocol.into();
        self
    }
}

/// Everything routed on the plugin side of the bus.
#[derive(Clone)]
pub(crate) enum PluginEvent {
    Message(Arc<ReceivedMessage>),
    Registered(TestWorker),
    Deregistering(String),
}

/// First-error-wins capture of fatal plugin errors.
pub(crate) struct CrashLatch {
    error: Mutex<Option<BusError>>,
    token: CancellationToken,
}

impl CrashLatch {
    fn new() -> Self {
        Self {
            error: Mutex::new(None),
            token: CancellationToken::new(),
        }
    }

    pub(crate) fn capture(&self, error: BusError) {
        if !error.is_fatal() {
            tracing::warn!("Not crashing shared worker for a consumer-local error: {error}");
            return;
        }
        let mut slot = self.error.lock();
        if slot.is_some() {
            tracing::debug!("Ignoring error after shared worker crash: {error}");
            return;
        }
        tracing::error!("Shared worker crashed: {error}");
        *slot = Some(error);
        drop(slot);
        self.token.cancel();
    }

    fn take(&self) -> Option<BusError> {
        self.error.lock().take()
    }
}

/// State shared by the coordinator and every handle given to plugin code.
pub(crate) struct PluginCore {
    pub(crate) filename: String,
    pub(crate) initial_data: Value,
    pub(crate) required_protocol: String,
    pub(crate) registry: Registry,
    pub(crate) router: Router<PluginEvent>,
    pub(crate) ids: MessageIds,
    pub(crate) link: EnvelopeSender,
    pub(crate) available: AtomicBool,
    pub(crate) crash: CrashLatch,
}

impl PluginCore {
    fn new(launch: PluginLaunch, link: EnvelopeSender) -> Self {
        let ids = MessageIds::new(&launch.filename);
        Self {
            filename: launch.filename,
            initial_data: launch.initial_data,
            required_protocol: launch.protocol,
            registry: Registry::new(),
            router: Router::new(),
            ids,
            link,
            available: AtomicBool::new(false),
            crash: CrashLatch::new(),
        }
    }
}

/// Run a plugin worker over `link` until the host closes it or the plugin
/// crashes.
///
/// Resolves to `Ok(())` when the link closes normally. Any fatal error
/// (factory failure or panic, protocol mismatch, duplicate registration,
/// failed teardown) is captured once and returned on the next turn of the
/// loop; later errors are logged and dropped.
pub async fn run_plugin_worker(
    factory: Arc<dyn PluginFactory>,
    launch: PluginLaunch,
    link: Channel,
) -> Result<(), BusError> {
    let (link_tx, mut link_rx) = link.into_parts();
    let mut coordinator = Coordinator {
        core: Arc::new(PluginCore::new(launch, link_tx)),
        teardowns: JoinSet::new(),
    };
    let core = Arc::clone(&coordinator.core);
    tracing::info!(
        filename = %core.filename,
        protocol = %core.required_protocol,
        "Starting shared worker"
    );

    let options = FactoryOptions::new(Arc::clone(&core));
    let mut factory_task = tokio::spawn(async move { factory.start(options).await });
    let mut factory_done = false;

    let outcome = loop {
        tokio::select! {
            biased;
            () = core.crash.token.cancelled() => {
                break Err(core
                    .crash
                    .take()
                    .unwrap_or_else(|| BusError::no_longer_available(&core.filename)));
            }
            joined = &mut factory_task, if !factory_done => {
                factory_done = true;
                match joined {
                    Ok(Ok(())) => tracing::debug!(filename = %core.filename, "Shared worker factory returned"),
                    Ok(Err(source)) => core.crash.capture(BusError::Factory {
                        filename: core.filename.clone(),
                        source,
                    }),
                    Err(error) if error.is_panic() => {
                        let message = panic_message(error.into_panic().as_ref());
                        core.crash.capture(BusError::Factory {
                            filename: core.filename.clone(),
                            source: anyhow::anyhow!("factory panicked: {message}"),
                        });
                    }
                    Err(_) => tracing::debug!(filename = %core.filename, "Shared worker factory cancelled"),
                }
            }
            Some(joined) = coordinator.teardowns.join_next(), if !coordinator.teardowns.is_empty() => {
                if let Err(error) = joined {
                    tracing::warn!("Teardown task ended abnormally: {error}");
                }
            }
            envelope = link_rx.recv() => match envelope {
                Some(envelope) => coordinator.handle(envelope).await,
                None => {
                    tracing::info!(filename = %core.filename, "Host link closed, stopping shared worker");
                    break Ok(());
                }
            },
        }
    };

    factory_task.abort();
    coordinator.teardowns.abort_all();
    core.router.close();
    outcome
}

struct Coordinator {
    core: Arc<PluginCore>,
    teardowns: JoinSet<()>,
}

impl Coordinator {
    async fn handle(&mut self, envelope: Envelope) {
        match envelope {
            Envelope::RegisterWorker { id, file } => self.register(id, file).await,
            Envelope::DeregisterWorker { id } => self.deregister(id).await,
            Envelope::Message {
                id,
                reply_to,
                worker_id,
                data,
            } => {
                let worker = worker_id
                    .as_deref()
                    .and_then(|worker_id| self.core.registry.lookup(worker_id))
                    .map(|entry| TestWorker::new(entry, Arc::clone(&self.core)));
                if worker.is_none() {
                    tracing::debug!(
                        message_id = %id,
                        worker_id = worker_id.as_deref().unwrap_or("-"),
                        "Message from a worker that is no longer registered"
                    );
                }
                let message = ReceivedMessage::new(
                    id,
                    reply_to,
                    worker_id,
                    data.unwrap_or(Value::Null),
                    worker,
                );
                self.core
                    .router
                    .publish(PluginEvent::Message(Arc::new(message)))
                    .await;
            }
            Envelope::DeregisteredWorker { .. } | Envelope::Available => {
                tracing::warn!(
                    kind = envelope.kind(),
                    "Ignoring envelope the host should never send to a shared worker"
                );
            }
        }
    }

    async fn register(&mut self, id: String, file: String) {
        let port = WorkerPort::new(id.clone(), self.core.link.clone());
        match self.core.registry.register(&id, &file, port) {
            Ok(entry) => {
                tracing::info!(worker_id = %id, file = %file, "Test worker registered");
                let worker = TestWorker::new(entry, Arc::clone(&self.core));
                self.core
                    .router
                    .publish(PluginEvent::Registered(worker))
                    .await;
            }
            Err(error) => self.core.crash.capture(error),
        }
    }

    async fn deregister(&mut self, id: String) {
        let Some(entry) = self.core.registry.lookup(&id) else {
            tracing::warn!(worker_id = %id, "Deregistration for unknown test worker");
            let _ = self
                .core
                .link
                .send(Envelope::DeregisteredWorker { id });
            return;
        };

        entry.begin_deregistration();
        self.core
            .router
            .publish(PluginEvent::Deregistering(id.clone()))
            .await;

        let core = Arc::clone(&self.core);
        self.teardowns.spawn(async move {
            let outcome = AssertUnwindSafe(entry.run_teardown())
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| {
                    Err(BusError::Teardown {
                        worker_id: id.clone(),
                        source: anyhow::anyhow!(
                            "teardown callback panicked: {}",
                            panic_message(panic.as_ref())
                        ),
                    })
                });
            match outcome {
                Ok(()) => tracing::info!(worker_id = %id, "Test worker deregistered"),
                Err(error) => core.crash.capture(error),
            }
            core.registry.remove(&id);
            let _ = core.link.send(Envelope::DeregisteredWorker { id });
        });
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
