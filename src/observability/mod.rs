pub mod envelope_trace;

pub use envelope_trace::{
    load_events, EnvelopeTrace, EnvelopeTraceEvent, TraceDirection, TraceStorageMode,
};
