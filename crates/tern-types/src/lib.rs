//! Shared data types for the tern agent runtime.
//!
//! This crate holds the types that cross crate boundaries: bus events,
//! conversation sessions, the configuration schema, skill workflow
//! policies, and the framework error type. It deliberately has no async
//! or I/O dependencies.

pub mod config;
pub mod error;
pub mod event;
pub mod session;
pub mod workflow;

pub use error::{ChannelError, Result, TernError};
pub use event::{InboundMessage, OutboundMessage};
pub use session::Session;
