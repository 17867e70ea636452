//! PostgreSQL implementations of the verifier's stores
//!
//! Evidence, the append-only verification log, the fingerprint index,
//! verified planting history, zones and the security event stream.

mod evidence_store;
mod hash_index;
mod security_events;
mod zone_store;

pub use evidence_store::*;
pub use hash_index::*;
pub use security_events::*;
pub use zone_store::*;
