//! Host side of the bus: launches plugin workers and connects test workers
//! to them.
//!
//! Each plugin filename gets one multiplexed link. Every connected test
//! worker gets its own [`Channel`]; the host stamps the worker id on traffic
//! headed for the plugin and routes the plugin's addressed messages back to
//! the right worker.

use crate::config::Config;
use crate::error::BusError;
use crate::observability::{EnvelopeTrace, TraceDirection};
use crate::plugin::{run_plugin_worker, PluginCatalog, PluginLaunch};
use crate::protocol::Envelope;
use crate::transport::{spawn_plugin_process, Channel, EnvelopeReceiver, EnvelopeSender};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::process::Child;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Environment variable carrying the plugin's initial data (JSON) to a
/// plugin launched as a child process.
pub const INITIAL_DATA_ENV: &str = "SHARED_WORKER_INITIAL_DATA";
/// Environment variable carrying the required protocol version to a plugin
/// launched as a child process.
pub const PROTOCOL_ENV: &str = "SHARED_WORKER_PROTOCOL";

/// Lifecycle of one launched plugin, as observed by the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PluginStatus {
    Launching,
    Available,
    /// The plugin stopped without reporting an error.
    Exited,
    /// The plugin crashed; carries the rendered error.
    Failed(String),
}

impl PluginStatus {
    fn is_terminal(&self) -> bool {
        matches!(self, Self::Exited | Self::Failed(_))
    }
}

pub struct SharedWorkerHost {
    config: Arc<Config>,
    catalog: PluginCatalog,
    trace: Option<Arc<EnvelopeTrace>>,
    plugins: Mutex<HashMap<String, Arc<PluginLink>>>,
}

impl SharedWorkerHost {
    pub fn new(config: Config, catalog: PluginCatalog) -> Self {
        let trace = EnvelopeTrace::from_config(&config);
        if let Some(trace) = &trace {
            tracing::info!(path = %trace.path().display(), "Envelope trace enabled");
        }
        Self {
            config: Arc::new(config),
            catalog,
            trace,
            plugins: Mutex::new(HashMap::new()),
        }
    }

    /// Protocol version plugins and clients must support.
    pub fn protocol(&self) -> &str {
        &self.config.protocol.version
    }

    /// Connect test worker `worker_id` (running `file`) to the plugin
    /// `filename`, launching the plugin on first use with `initial_data`.
    ///
    /// The returned channel receives `available` once the plugin is ready
    /// and the worker has been registered with it. It closes without
    /// `available` if the plugin is gone.
    pub fn connect(
        &self,
        worker_id: &str,
        file: &str,
        filename: &str,
        initial_data: Value,
    ) -> Result<Channel, BusError> {
        let link = self.launch(filename, initial_data)?;
        let (client_end, host_end) = Channel::pair();
        let (to_worker, from_worker) = host_end.into_parts();
        link.attach(worker_id, to_worker)?;

        tracing::debug!(worker_id, file, filename, "Test worker connecting");
        tokio::spawn(serve_worker(
            link,
            worker_id.to_string(),
            file.to_string(),
            from_worker,
        ));
        Ok(client_end)
    }

    /// Test workers currently connected to `filename`, sorted by id.
    pub fn registered_workers(&self, filename: &str) -> Vec<String> {
        let Some(link) = self.plugins.lock().get(filename).cloned() else {
            return Vec::new();
        };
        let mut ids: Vec<_> = link.workers.lock().keys().cloned().collect();
        ids.sort_unstable();
        ids
    }

    pub fn plugin_status(&self, filename: &str) -> Option<PluginStatus> {
        self.plugins
            .lock()
            .get(filename)
            .map(|link| link.status.borrow().clone())
    }

    fn launch(&self, filename: &str, initial_data: Value) -> Result<Arc<PluginLink>, BusError> {
        let mut plugins = self.plugins.lock();
        if let Some(link) = plugins.get(filename) {
            return Ok(Arc::clone(link));
        }

        let protocol = self.config.protocol.version.clone();
        let (link, from_plugin, run) = if let Some(process) = self.config.plugins.get(filename) {
            let envs = [
                (PROTOCOL_ENV, protocol),
                (INITIAL_DATA_ENV, initial_data.to_string()),
            ];
            let (channel, child) = spawn_plugin_process(&process.command, &process.args, &envs)?;
            let (to_plugin, from_plugin) = channel.into_parts();
            (
                PluginLink::new(filename, to_plugin, self.trace.clone()),
                from_plugin,
                PluginRun::Process(child),
            )
        } else {
            let factory = self.catalog.get(filename)?;
            let (host_end, plugin_end) = Channel::pair();
            let (to_plugin, from_plugin) = host_end.into_parts();
            let launch = PluginLaunch::new(filename)
                .with_initial_data(initial_data)
                .with_protocol(protocol);
            let handle = tokio::spawn(run_plugin_worker(factory, launch, plugin_end));
            (
                PluginLink::new(filename, to_plugin, self.trace.clone()),
                from_plugin,
                PluginRun::InProcess(handle),
            )
        };

        tracing::info!(filename, "Launched shared worker");
        let link = Arc::new(link);
        plugins.insert(filename.to_string(), Arc::clone(&link));
        tokio::spawn(supervise(Arc::clone(&link), from_plugin, run));
        Ok(link)
    }
}

enum PluginRun {
    InProcess(JoinHandle<Result<(), BusError>>),
    Process(Child),
}

impl PluginRun {
    /// Wait for the plugin to stop; `Some` carries the failure.
    async fn wait(&mut self) -> Option<String> {
        match self {
            Self::InProcess(handle) => match handle.await {
                Ok(Ok(())) => None,
                Ok(Err(error)) => Some(format!("{:#}", anyhow::Error::new(error))),
                Err(error) => Some(format!("shared worker task failed: {error}")),
            },
            Self::Process(child) => match child.wait().await {
                Ok(status) if status.success() => None,
                Ok(status) => Some(format!("shared worker process exited with {status}")),
                Err(error) => Some(format!("failed to wait for shared worker process: {error}")),
            },
        }
    }
}

struct PluginLink {
    filename: String,
    to_plugin: EnvelopeSender,
    workers: Mutex<HashMap<String, EnvelopeSender>>,
    status: watch::Sender<PluginStatus>,
    trace: Option<Arc<EnvelopeTrace>>,
}

impl PluginLink {
    fn new(filename: &str, to_plugin: EnvelopeSender, trace: Option<Arc<EnvelopeTrace>>) -> Self {
        Self {
            filename: filename.to_string(),
            to_plugin,
            workers: Mutex::new(HashMap::new()),
            status: watch::Sender::new(PluginStatus::Launching),
            trace,
        }
    }

    /// Track `worker_id`'s outbound queue. A plugin that already stopped
    /// gets no new workers: the queue is dropped so the worker sees its
    /// channel close.
    fn attach(&self, worker_id: &str, to_worker: EnvelopeSender) -> Result<(), BusError> {
        let mut workers = self.workers.lock();
        if workers.contains_key(worker_id) {
            return Err(BusError::DuplicateWorker {
                id: worker_id.to_string(),
            });
        }
        if self.status.borrow().is_terminal() {
            tracing::debug!(
                worker_id,
                filename = %self.filename,
                "Shared worker already stopped, closing test worker channel"
            );
            return Ok(());
        }
        workers.insert(worker_id.to_string(), to_worker);
        Ok(())
    }

    fn detach(&self, worker_id: &str) {
        self.workers.lock().remove(worker_id);
    }

    fn send_to_plugin(&self, envelope: Envelope) -> bool {
        if let Some(trace) = &self.trace {
            trace.record(TraceDirection::ToPlugin, &self.filename, &envelope);
        }
        self.to_plugin.send(envelope).is_ok()
    }

    fn send_to_worker(&self, worker_id: &str, envelope: Envelope) -> bool {
        match self.workers.lock().get(worker_id) {
            Some(to_worker) => to_worker.send(envelope).is_ok(),
            None => false,
        }
    }

    /// Route one envelope received from the plugin.
    fn dispatch(&self, envelope: Envelope) {
        if let Some(trace) = &self.trace {
            trace.record(TraceDirection::FromPlugin, &self.filename, &envelope);
        }
        match envelope {
            Envelope::Available => {
                tracing::info!(filename = %self.filename, "Shared worker is available");
                self.status.send_replace(PluginStatus::Available);
            }
            Envelope::Message { .. } => {
                let Some(worker_id) = envelope.worker_id().map(str::to_string) else {
                    tracing::warn!(
                        filename = %self.filename,
                        "Dropping unaddressed plugin message"
                    );
                    return;
                };
                if !self.send_to_worker(&worker_id, envelope) {
                    tracing::debug!(
                        worker_id = %worker_id,
                        "Dropping plugin message for disconnected test worker"
                    );
                }
            }
            Envelope::DeregisteredWorker { id } => {
                let to_worker = self.workers.lock().remove(&id);
                tracing::debug!(worker_id = %id, "Test worker deregistered by shared worker");
                if let Some(to_worker) = to_worker {
                    let _ = to_worker.send(Envelope::DeregisteredWorker { id });
                }
            }
            Envelope::RegisterWorker { .. } | Envelope::DeregisterWorker { .. } => {
                tracing::warn!(
                    kind = envelope.kind(),
                    filename = %self.filename,
                    "Ignoring envelope a shared worker should never send"
                );
            }
        }
    }

    /// Record how the plugin stopped and close every test worker channel.
    fn shut_down(&self, failure: Option<String>) {
        let status = match failure {
            Some(reason) => {
                tracing::error!(filename = %self.filename, "Shared worker failed: {reason}");
                PluginStatus::Failed(reason)
            }
            None => {
                tracing::info!(filename = %self.filename, "Shared worker exited");
                PluginStatus::Exited
            }
        };
        self.status.send_replace(status);
        let workers = std::mem::take(&mut *self.workers.lock());
        if !workers.is_empty() {
            tracing::debug!(
                filename = %self.filename,
                workers = workers.len(),
                "Closing test worker channels"
            );
        }
    }
}

async fn supervise(link: Arc<PluginLink>, mut from_plugin: EnvelopeReceiver, mut run: PluginRun) {
    let failure = loop {
        tokio::select! {
            biased;
            envelope = from_plugin.recv() => match envelope {
                Some(envelope) => link.dispatch(envelope),
                None => break run.wait().await,
            },
            failure = run.wait() => {
                while let Ok(envelope) = from_plugin.try_recv() {
                    link.dispatch(envelope);
                }
                break failure;
            }
        }
    };
    link.shut_down(failure);
}

async fn serve_worker(
    link: Arc<PluginLink>,
    worker_id: String,
    file: String,
    mut from_worker: EnvelopeReceiver,
) {
    let mut status = link.status.subscribe();

    // Hold the worker back until the plugin called ready().
    loop {
        let current = status.borrow_and_update().clone();
        match current {
            PluginStatus::Available => break,
            PluginStatus::Exited | PluginStatus::Failed(_) => return,
            PluginStatus::Launching => {}
        }
        tokio::select! {
            changed = status.changed() => {
                if changed.is_err() {
                    return;
                }
            }
            envelope = from_worker.recv() => match envelope {
                None | Some(Envelope::DeregisterWorker { .. }) => {
                    tracing::debug!(
                        worker_id = %worker_id,
                        "Test worker left before the shared worker was available"
                    );
                    link.detach(&worker_id);
                    return;
                }
                Some(other) => tracing::warn!(
                    worker_id = %worker_id,
                    kind = other.kind(),
                    "Dropping envelope sent before availability"
                ),
            },
        }
    }

    link.send_to_plugin(Envelope::RegisterWorker {
        id: worker_id.clone(),
        file,
    });
    link.send_to_worker(&worker_id, Envelope::Available);

    loop {
        tokio::select! {
            envelope = from_worker.recv() => match envelope {
                Some(envelope @ Envelope::Message { .. }) => {
                    link.send_to_plugin(envelope.with_worker(&worker_id));
                }
                Some(Envelope::DeregisterWorker { .. }) | None => break,
                Some(other) => tracing::warn!(
                    worker_id = %worker_id,
                    kind = other.kind(),
                    "Ignoring envelope a test worker should never send"
                ),
            },
            changed = status.changed() => {
                if changed.is_err() || status.borrow_and_update().is_terminal() {
                    return;
                }
            }
        }
    }

    tracing::debug!(worker_id = %worker_id, "Test worker disconnecting");
    if !link.send_to_plugin(Envelope::DeregisterWorker {
        id: worker_id.clone(),
    }) {
        link.detach(&worker_id);
    }
}
