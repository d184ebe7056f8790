//! LLM provider abstraction for tern.
//!
//! [`ChatProvider`] is the single contract the agent loop depends on;
//! [`OpenAiCompatProvider`] implements it against any endpoint speaking
//! the OpenAI chat-completion format, with SSE streaming and bounded
//! retry on transient failures.

pub mod error;
pub mod openai;
pub mod provider;
pub mod retry;
pub mod sse;
pub mod types;

pub use error::{ProviderError, Result};
pub use openai::OpenAiCompatProvider;
pub use provider::{ChatProvider, ChatRequest};
pub use types::{
    ChatMessage, LLMResponse, TokenUsage, ToolCallRequest, ToolChoice,
};
