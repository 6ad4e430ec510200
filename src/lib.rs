//! Worker-hosted LLM inference with single-flight loading and correlated
//! streaming generation.

pub mod cache;
pub mod config;
pub mod error;
pub mod inference;
pub mod runtime;

// Re-export commonly used types
pub use config::AnchorConfig;
pub use error::{format_error_message, SessionError, UserAction};
pub use inference::{
    GenerationEvent, GenerationStream, InfoSnapshot, SessionFacade, SessionMetadata,
    StatusSnapshot,
};
pub use runtime::{
    Backend, ChatInput, ChatMessage, GenerationOptions, LoopbackRuntime, ModelRuntime,
    PrecisionProfile, RuntimeFactory,
};
