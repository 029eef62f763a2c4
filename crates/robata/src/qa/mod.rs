//! # Question answering
//!
//! The caller side of the dispatch layer: a conversation whose system prompt is
//! filled with retrieved contexts, answered by any
//! [`InferenceEngine`](crate::engine::InferenceEngine).
//!
//! Retrieval itself lives outside this crate behind the [`Retriever`] trait.

mod conversation;
mod session;

pub use conversation::{ContextPrompt, Conversation};
pub use session::{Document, QaSession, Retriever};
