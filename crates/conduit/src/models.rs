//! These models represent the objects passed around by the orchestration loop
//!
//! There are several different related formats we need to interact with:
//! - conversation history handed to us by the caller, `{role, content}` pairs
//! - anthropic messages/tools, sent to the LLM
//! - openai (and xai) chat completion messages/tools, sent to the LLM
//! - gemini contents/function declarations, sent to the LLM
//!
//! We always immediately convert those formats into these internal structs using
//! to/from helpers in each provider. Because they have to round-trip through all
//! four vendors, the internal models are not an exact match to any one of them.
pub mod content;
pub mod message;
pub mod role;
pub mod tool;
