//! Domain models for the planting verifier
//!
//! Plain data types: evidence, zones, per-checker results, the verification
//! log, and the security event stream. No I/O lives here.

mod check;
mod evidence;
mod security;
mod signals;
mod types;
mod verification;
mod zone;

pub use check::*;
pub use evidence::*;
pub use security::*;
pub use signals::*;
pub use types::*;
pub use verification::*;
pub use zone::*;
