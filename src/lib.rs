#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::doc_markdown,
    clippy::items_after_statements,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::new_without_default,
    clippy::needless_pass_by_value,
    clippy::return_self_not_must_use,
    clippy::single_match_else,
    clippy::uninlined_format_args
)]

//! Shared-worker message bus.
//!
//! A long-lived plugin worker exchanges correlated request/reply and
//! broadcast messages with many short-lived test workers. The [`host`] sits
//! between them, the [`plugin`] module is the plugin-side runtime and
//! [`client`] is what a test worker holds.

pub mod bus;
pub mod client;
pub mod config;
pub mod error;
pub mod host;
pub mod observability;
pub mod plugin;
pub mod protocol;
pub mod transport;

pub use client::{RegistrationOptions, SharedWorkerClient};
pub use config::Config;
pub use error::{BusError, UnavailableReason};
pub use host::SharedWorkerHost;
pub use plugin::{plugin_fn, run_plugin_worker, PluginCatalog, PluginFactory, PluginLaunch};
pub use protocol::{Envelope, DEFAULT_PROTOCOL};
