//! Channel adapters for tern.
//!
//! The transports themselves (chat SDK websockets, the web PWA server)
//! are external collaborators; this crate fixes the [`Channel`]
//! contract they implement and ships the local CLI channel.

pub mod cli;
pub mod traits;

pub use cli::CliChannel;
pub use traits::{session_key, Channel};
