//! Side-agnostic bus plumbing shared by the plugin runtime and test-worker
//! clients: the correlation router and correlation id allocation.

pub mod ids;
pub mod router;

pub use ids::MessageIds;
pub use router::{MessageFilter, Router, Subscription, Verdict};
