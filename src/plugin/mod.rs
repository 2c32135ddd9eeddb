//! Plugin (shared worker) side of the bus.
//!
//! A plugin is a [`PluginFactory`] started by [`run_plugin_worker`] over one
//! multiplexed link to the host. The factory negotiates a protocol, signals
//! readiness and then talks to every connected test worker through the
//! returned [`ProtocolHandle`].

pub mod builtin;
pub mod lifecycle;
pub mod protocol;
pub mod registry;

pub use lifecycle::{run_plugin_worker, PluginLaunch};
pub use protocol::{
    FactoryOptions, MessageStream, ProtocolHandle, PublishedMessage, ReceivedMessage, TestWorker,
    TestWorkerStream,
};
pub use registry::{Registry, TeardownHandle, WorkerEntry, WorkerPort, WorkerState};

use crate::error::BusError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

/// Entry point of a shared worker plugin.
#[async_trait]
pub trait PluginFactory: Send + Sync {
    /// Set the plugin up. Returning an error, or panicking, crashes the
    /// plugin worker. The plugin keeps serving after this returns as long as
    /// it holds on to its handles or spawned tasks.
    async fn start(&self, options: FactoryOptions) -> anyhow::Result<()>;
}

/// Adapts an async closure into a [`PluginFactory`].
pub struct FnFactory<F>(F);

#[async_trait]
impl<F, Fut> PluginFactory for FnFactory<F>
where
    F: Fn(FactoryOptions) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn start(&self, options: FactoryOptions) -> anyhow::Result<()> {
        (self.0)(options).await
    }
}

pub fn plugin_fn<F, Fut>(factory: F) -> Arc<dyn PluginFactory>
where
    F: Fn(FactoryOptions) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(FnFactory(factory))
}

/// Plugins that can be started in-process, keyed by filename.
#[derive(Clone, Default)]
pub struct PluginCatalog {
    factories: HashMap<String, Arc<dyn PluginFactory>>,
}

impl PluginCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog preloaded with the plugins shipped in this crate.
    pub fn with_builtins() -> Self {
        let mut catalog = Self::new();
        catalog.register(builtin::ECHO, builtin::echo());
        catalog
    }

    pub fn register(
        &mut self,
        filename: impl Into<String>,
        factory: Arc<dyn PluginFactory>,
    ) -> &mut Self {
        self.factories.insert(filename.into(), factory);
        self
    }

    pub fn contains(&self, filename: &str) -> bool {
        self.factories.contains_key(filename)
    }

    pub fn get(&self, filename: &str) -> Result<Arc<dyn PluginFactory>, BusError> {
        self.factories
            .get(filename)
            .cloned()
            .ok_or_else(|| BusError::UnknownPlugin {
                filename: filename.to_string(),
            })
    }

    pub fn filenames(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_catalog_contains_echo() {
        let catalog = PluginCatalog::with_builtins();
        assert!(catalog.contains(builtin::ECHO));
        assert_eq!(catalog.filenames(), vec![builtin::ECHO]);
    }

    #[test]
    fn unknown_plugin_is_fatal() {
        let error = PluginCatalog::new()
            .get("missing.rs")
            .err()
            .expect("nothing registered");
        assert!(
            matches!(error, BusError::UnknownPlugin { ref filename } if filename == "missing.rs")
        );
        assert!(error.is_fatal());
    }

    #[test]
    fn later_registration_replaces_earlier() {
        let mut catalog = PluginCatalog::new();
        catalog
            .register("p", plugin_fn(|_| async { Ok(()) }))
            .register("p", builtin::echo());
        assert_eq!(catalog.filenames(), vec!["p"]);
    }
}
