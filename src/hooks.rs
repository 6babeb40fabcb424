//! Instrumentation hooks.
//!
//! A [`CallHooks`] implementation observes the boundary of each logical
//! call: `on_prepare` runs before the transport request and may return an
//! opaque state value (typically a start timestamp) that is handed back to
//! whichever terminal hook fires. Exactly one terminal hook fires per call;
//! for streaming calls `on_response` fires only once the stream has been
//! fully consumed or explicitly closed, never when the stream object is
//! merely returned.

use std::any::Any;

use crate::error::DispatchError;
use crate::types::{ChatAggregate, CompletionsAggregate};

/// Opaque per-call state produced by `on_prepare`.
pub type HookState = Box<dyn Any + Send + Sync>;

/// What a completed call produced, as seen by `on_response`.
#[derive(Debug)]
pub enum CallOutcome<'a> {
    /// A parsed non-streaming JSON response.
    Json(&'a serde_json::Value),
    /// A non-streaming binary response.
    Binary(&'a [u8]),
    /// A fully consumed chat stream, folded back together.
    ChatStream(&'a ChatAggregate),
    /// A fully consumed completions stream, folded back together.
    CompletionsStream(&'a CompletionsAggregate),
    /// A fully consumed binary stream.
    ByteStream { total_bytes: usize },
    /// A raw transport response handed back unparsed.
    Raw { status: u16 },
}

/// Callbacks around one logical call. All methods default to no-ops.
pub trait CallHooks: Send + Sync {
    /// Runs before the transport request is issued.
    fn on_prepare(&self) -> Option<HookState> {
        None
    }

    /// Runs exactly once on success, after the full result is available.
    fn on_response(&self, outcome: CallOutcome<'_>, state: Option<&HookState>) {
        let _ = (outcome, state);
    }

    /// Runs exactly once when the call fails, before the error propagates.
    fn on_exception(&self, error: &DispatchError, state: Option<&HookState>) {
        let _ = (error, state);
    }
}
