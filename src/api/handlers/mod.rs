//! REST API handlers organized by domain.

pub mod admin;
pub mod evidence;
pub mod health;
pub mod security;

pub use admin::*;
pub use evidence::*;
pub use health::*;
pub use security::*;
