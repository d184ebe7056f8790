//! Core engine for the tern agent runtime.
//!
//! Wires the in-process message bus, the session store with its
//! active-pointer index, the layered memory store, the skills loader,
//! the context builder/manager, the tool registry, and the agent loop
//! that drives the tool-call fixed point.

pub mod agent;
pub mod bus;
pub mod context;
pub mod context_manager;
pub mod cron;
pub mod memory;
pub mod session;
pub mod skills;
pub mod tools;

pub use agent::AgentLoop;
pub use bus::MessageBus;
pub use context::ContextBuilder;
pub use context_manager::ContextManager;
pub use memory::MemoryStore;
pub use session::SessionStore;
pub use skills::SkillsLoader;
pub use tools::registry::{Tool, ToolError, ToolRegistry};
