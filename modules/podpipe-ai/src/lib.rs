//! The opaque model boundary. Speech-to-text, speaker clustering, LLM
//! narrative/structured generation, and embeddings are explicitly out of
//! scope as *implementations* — this crate specifies only their
//! contracts as traits, so the coordination fabric (daemon, RAG
//! subscriber, summarizer) never depends on a specific model provider.
//!
//! One concrete provider (OpenAI-compatible HTTP) is included because the
//! contracts need at least one real implementation to be exercised by
//! integration tests, grounded in the same request/response shape every
//! OpenAI-compatible API exposes.

mod openai;
mod traits;
mod types;

pub use openai::{NullDiarizer, OpenAiProvider};
pub use traits::{fallback_turns, AiError, AiResult, ChatModel, Diarizer, EmbeddingModel, Transcriber};
pub use types::{ChatMessage, Role, Segment, SpeakerTurn};
