//! BYO-key LLM client for agentbridge.
//!
//! Pure HTTP client used for the bot's text transforms (translation and
//! source matching). Plain chat completions only.

mod anthropic;
mod client;
mod error;
mod openai;
mod types;

pub use client::{LlmClient, Provider};
pub use error::{LlmError, Result};
pub use types::{ChatMessage, ChatResponse, Role, Usage};
