//! Wire-level pieces of the shared-worker protocol: the envelope shape, its
//! line framing for byte streams, and version negotiation.

pub mod codec;
pub mod envelope;
pub mod negotiate;

pub use codec::{CodecError, EnvelopeCodec};
pub use envelope::{decode, encode, Envelope};
pub use negotiate::{negotiate, DEFAULT_PROTOCOL};
