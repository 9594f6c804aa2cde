//! LLM client for an OpenAI-compatible inference server.
//!
//! Supports listing models, non-streaming completions (used for summaries), SSE streaming with
//! cooperative abort, and switching the served model through the admin endpoint.

mod openai;

pub use openai::{
    decode_sse_line, InferenceClient, LlmError, ModelInfo, SseLine, StreamOutcome,
};
