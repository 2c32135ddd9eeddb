pub mod schema;

pub use schema::{Config, PluginProcessConfig, ProtocolConfig, TraceConfig};
