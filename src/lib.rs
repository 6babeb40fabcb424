//! Request dispatch, credential rotation, and streaming aggregation for
//! OpenAI-family APIs.
//!
//! This crate is the transport layer under a higher-level client: it
//! resolves which credentials and routes a call should use, dispatches the
//! request over an async or blocking transport, and folds streamed delta
//! events back into complete responses.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use openai_dispatch::{CallOptions, ChatMessage, ClientMode, OpenAiClient};
//!
//! # async fn run() -> Result<(), openai_dispatch::DispatchError> {
//! let client = OpenAiClient::builder()
//!     .mode(ClientMode::Async)
//!     .api_key("sk-...")
//!     .build()?;
//!
//! let response = client
//!     .chat(
//!         vec![ChatMessage::user("Say hello.")],
//!         CallOptions::new().model("gpt-4o-mini"),
//!     )?
//!     .fetch()
//!     .await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Credential resolution
//!
//! Every call resolves each credential field independently through a fixed
//! precedence chain: an explicit [`Endpoint`], one rotation step from an
//! [`EndpointPool`], per-call [`CallOptions`], client defaults, environment
//! variables, and finally built-in defaults. See [`credentials`] for the
//! details, including Azure deployment routing.
//!
//! # Streaming
//!
//! Streaming calls return lazy chunk sequences ([`ChatStream`] /
//! [`ChatIter`]) that aggregate every delta as it passes through; once the
//! stream ends or is closed, the folded result is available and the
//! response hook fires exactly once.

#![deny(unsafe_code)]

pub mod aggregate;
pub mod blocking;
pub mod client;
pub mod credentials;
pub mod endpoint;
pub mod error;
pub mod hooks;
pub mod requestor;
mod sse;
pub mod types;

pub use aggregate::{ChatAggregator, CompletionsAggregator, DeltaAggregate};
pub use blocking::{ByteIter, ChatIter, CompletionsIter, EventIter};
pub use client::{ClientMode, OpenAiClient, OpenAiClientBuilder};
pub use credentials::{
    ApiType, CallOptions, ClientConfig, DEFAULT_API_BASE, EnvSource, ResolvedCall,
};
pub use endpoint::{Endpoint, EndpointBuilder, EndpointPool};
pub use error::DispatchError;
pub use hooks::{CallHooks, CallOutcome, HookState};
pub use requestor::{
    BinRequestor, ByteStream, ChatRequestor, ChatStream, CompletionsRequestor, CompletionsStream,
    DictRequestor, EventStream, FilePart, Requestor,
};
pub use types::{
    ChatAggregate, ChatChoice, ChatChunk, ChatChunkChoice, ChatChunkDelta, ChatMessage,
    ChatResponse, CompletionsAggregate, CompletionsChoice, CompletionsChunk,
    CompletionsChunkChoice, CompletionsResponse, FunctionCall, FunctionCallDelta, ToolCall,
    ToolCallDelta, Usage,
};
