//! LLM provider abstraction.
//!
//! The engine consumes one narrow capability: `invoke` for free-form
//! completions with optional tool definitions, and `invoke_structured` for
//! schema-validated JSON output. Structured output is treated as untrusted
//! parsing; a validation failure surfaces as an ordinary error and the
//! calling component falls back to its deterministic strategy.
//!
//! ## Example
//!
//! ```rust,ignore
//! use apiscope_core::llm::{AnthropicClient, ClientConfig, InvokeRequest, ChatMessage};
//!
//! let client = AnthropicClient::new(ClientConfig::new("api-key"));
//! let response = client
//!     .invoke(InvokeRequest::new().with_message(ChatMessage::user("Summarize this endpoint")))
//!     .await?;
//! println!("{}", response.content);
//! ```

mod client;
mod types;

pub use client::{
    client_from_settings, parse_structured, AnthropicClient, ClientConfig, LlmClient, OpenAiClient,
};
pub use types::{
    ChatMessage, ChatRole, InvokeRequest, InvokeResponse, Provider, ToolCall, ToolSpec,
};
