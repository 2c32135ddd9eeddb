//! Plugins bundled with the crate.

use super::{plugin_fn, FactoryOptions, PluginFactory};
use futures_util::StreamExt;
use std::sync::Arc;

/// Filename under which the echo plugin is registered.
pub const ECHO: &str = "echo";

/// Replies to every top-level message with the data it carried.
pub fn echo() -> Arc<dyn PluginFactory> {
    plugin_fn(|options: FactoryOptions| async move {
        let handle = options.negotiate_protocol(&["v2"])?;
        let mut messages = handle.subscribe();
        handle.ready();

        tokio::spawn(async move {
            while let Some(message) = messages.next().await {
                if let Err(error) = message.reply(message.data().clone()) {
                    tracing::debug!(message_id = %message.id(), "Echo reply dropped: {error}");
                }
            }
        });
        Ok(())
    })
}
