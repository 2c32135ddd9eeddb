use thiserror::Error;

/// Errors emitted by the shared-worker bus, its plugin runtime, and clients.
#[derive(Debug, Error)]
pub enum BusError {
    #[error(
        "shared worker `{filename}` does not support protocol `{required}` (it supports: {})",
        .supported.join(", ")
    )]
    ProtocolMismatch {
        filename: String,
        required: String,
        supported: Vec<String>,
    },
    #[error("{target} is {reason}")]
    Unavailable {
        target: String,
        reason: UnavailableReason,
    },
    #[error("test worker `{id}` is already registered")]
    DuplicateWorker { id: String },
    #[error("teardown for test worker `{worker_id}` failed")]
    Teardown {
        worker_id: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("shared worker factory for `{filename}` failed")]
    Factory {
        filename: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("no shared worker plugin is registered for `{filename}`")]
    UnknownPlugin { filename: String },
    #[error("invalid envelope: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("transport failure: {0}")]
    Transport(#[from] std::io::Error),
}

/// Why a shared worker cannot currently serve a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnavailableReason {
    /// `ready()` has not been observed yet.
    NotYetAvailable,
    /// The plugin crashed, or the connection to it closed.
    NoLongerAvailable,
}

impl std::fmt::Display for UnavailableReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotYetAvailable => f.write_str("not yet available"),
            Self::NoLongerAvailable => f.write_str("no longer available"),
        }
    }
}

impl BusError {
    pub(crate) fn not_yet_available(filename: &str) -> Self {
        Self::Unavailable {
            target: format!("shared worker `{filename}`"),
            reason: UnavailableReason::NotYetAvailable,
        }
    }

    pub(crate) fn no_longer_available(filename: &str) -> Self {
        Self::Unavailable {
            target: format!("shared worker `{filename}`"),
            reason: UnavailableReason::NoLongerAvailable,
        }
    }

    pub(crate) fn worker_gone(worker_id: &str) -> Self {
        Self::Unavailable {
            target: format!("test worker `{worker_id}`"),
            reason: UnavailableReason::NoLongerAvailable,
        }
    }

    /// Why the target is unavailable, if this is an availability error.
    pub fn unavailable_reason(&self) -> Option<UnavailableReason> {
        match self {
            Self::Unavailable { reason, .. } => Some(*reason),
            _ => None,
        }
    }

    /// Whether this error corrupts bus state and must crash the owning worker.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::ProtocolMismatch { .. }
            | Self::DuplicateWorker { .. }
            | Self::Teardown { .. }
            | Self::Factory { .. }
            | Self::UnknownPlugin { .. } => true,
            Self::Unavailable { .. } | Self::Codec(_) | Self::Transport(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unavailable_message_names_the_plugin() {
        let error = BusError::no_longer_available("plugins/db.rs");
        assert_eq!(
            error.to_string(),
            "shared worker `plugins/db.rs` is no longer available"
        );
        assert!(!error.is_fatal());
        assert_eq!(
            error.unavailable_reason(),
            Some(UnavailableReason::NoLongerAvailable)
        );
    }

    #[test]
    fn departed_worker_is_reported_as_unavailable() {
        let error = BusError::worker_gone("w3");
        assert_eq!(error.to_string(), "test worker `w3` is no longer available");
    }

    #[test]
    fn protocol_mismatch_lists_supported_versions() {
        let error = BusError::ProtocolMismatch {
            filename: "worker".into(),
            required: "v2".into(),
            supported: vec!["v0".into(), "v1".into()],
        };
        let rendered = error.to_string();
        assert!(rendered.contains("`v2`"));
        assert!(rendered.contains("v0, v1"));
        assert!(error.is_fatal());
    }

    #[test]
    fn teardown_error_keeps_its_source() {
        let error = BusError::Teardown {
            worker_id: "w1".into(),
            source: anyhow::anyhow!("database still locked"),
        };
        let source = std::error::Error::source(&error).expect("teardown source");
        assert_eq!(source.to_string(), "database still locked");
    }
}
