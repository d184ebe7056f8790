//! The agent loop and its turn-scoped helpers.

mod attachments;
mod loop_core;
mod realtime;
mod stream;
mod workflow;

pub use loop_core::{AgentLoop, AgentLoopOptions};
