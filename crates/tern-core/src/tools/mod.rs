//! Tool contract, registry, and the loop-owned tools.
//!
//! Leaf tools (filesystem, shell, web) live in the `tern-tools` crate;
//! tools that need runtime plumbing (the bus, the subagent manager, the
//! cron service) live here so the agent loop can wire them directly.

pub mod cron_tool;
pub mod message;
pub mod registry;
pub mod spawn;
