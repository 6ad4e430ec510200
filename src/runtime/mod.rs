//! Model runtime abstraction consumed by the inference session.
//!
//! The runtime is the black box that turns chat-formatted input into text.
//! It is constructed inside the background worker from a [`RuntimeFactory`]
//! and never touched by the host directly.

pub mod loopback;

pub use loopback::LoopbackRuntime;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::error::SessionError;

/// Compute backend selected once per load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Accelerated GPU-like backend
    Gpu,
    /// Portable bytecode backend
    Wasm,
    /// Plain CPU backend, always available
    Cpu,
}

impl Backend {
    /// Default probe order, best first.
    pub const PRIORITY: [Backend; 3] = [Backend::Gpu, Backend::Wasm, Backend::Cpu];

    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::Gpu => "gpu",
            Backend::Wasm => "wasm",
            Backend::Cpu => "cpu",
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Numeric precision (quantization level) the runtime initializes with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrecisionProfile {
    Q4,
    Q4f16,
    Int8,
    Fp16,
    Fp32,
    /// No explicit profile; the runtime picks its own default.
    Auto,
}

impl PrecisionProfile {
    /// Most compressed first, ending with the runtime's own choice.
    pub fn default_ladder() -> Vec<PrecisionProfile> {
        vec![
            PrecisionProfile::Q4,
            PrecisionProfile::Q4f16,
            PrecisionProfile::Int8,
            PrecisionProfile::Auto,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PrecisionProfile::Q4 => "q4",
            PrecisionProfile::Q4f16 => "q4f16",
            PrecisionProfile::Int8 => "int8",
            PrecisionProfile::Fp16 => "fp16",
            PrecisionProfile::Fp32 => "fp32",
            PrecisionProfile::Auto => "auto",
        }
    }
}

impl fmt::Display for PrecisionProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Chat message role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One chat-formatted message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: Role::System, content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: content.into() }
    }
}

/// Generation input: either a bare prompt or a full message list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChatInput {
    Prompt(String),
    Messages(Vec<ChatMessage>),
}

impl ChatInput {
    /// Reject input the runtime cannot accept.
    pub fn validate(&self) -> Result<(), SessionError> {
        match self {
            ChatInput::Messages(messages) if messages.is_empty() => Err(
                SessionError::InvalidInput("message list must not be empty".to_string()),
            ),
            _ => Ok(()),
        }
    }

    /// Expand a bare prompt into `[system, user]`; message lists pass through.
    pub fn into_messages(self, system_prompt: &str) -> Vec<ChatMessage> {
        match self {
            ChatInput::Prompt(prompt) => vec![
                ChatMessage::system(system_prompt),
                ChatMessage::user(prompt),
            ],
            ChatInput::Messages(messages) => messages,
        }
    }
}

impl From<&str> for ChatInput {
    fn from(prompt: &str) -> Self {
        ChatInput::Prompt(prompt.to_string())
    }
}

impl From<String> for ChatInput {
    fn from(prompt: String) -> Self {
        ChatInput::Prompt(prompt)
    }
}

impl From<Vec<ChatMessage>> for ChatInput {
    fn from(messages: Vec<ChatMessage>) -> Self {
        ChatInput::Messages(messages)
    }
}

/// Sampling parameters forwarded verbatim to the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationOptions {
    pub max_output_tokens: u32,
    pub temperature: f32,
    pub top_k: u32,
    pub top_p: f32,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            max_output_tokens: 512,
            temperature: 0.7,
            top_k: 50,
            top_p: 0.9,
        }
    }
}

impl GenerationOptions {
    /// Type-level check only; semantic ranges belong to the runtime.
    pub fn validate(&self) -> Result<(), SessionError> {
        if !self.temperature.is_finite() {
            return Err(SessionError::InvalidInput(
                "temperature must be a finite number".to_string(),
            ));
        }
        if !self.top_p.is_finite() {
            return Err(SessionError::InvalidInput(
                "top_p must be a finite number".to_string(),
            ));
        }
        Ok(())
    }

    /// `temperature == 0` selects deterministic decoding.
    pub fn do_sample(&self) -> bool {
        self.temperature > 0.0
    }
}

/// Raw load progress as reported by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadProgress {
    pub loaded_bytes: u64,
    pub total_bytes: u64,
}

impl LoadProgress {
    /// Percent loaded, capped so 100 is only reported after confirmation.
    pub fn percent(&self, cap: u8) -> Option<u8> {
        if self.total_bytes == 0 {
            return None;
        }
        let ratio = self.loaded_bytes as f64 / self.total_bytes as f64;
        let percent = (ratio * 100.0).round().clamp(0.0, 100.0) as u8;
        Some(percent.min(cap))
    }
}

/// Progress callback handed to [`ModelRuntime::init`].
pub type ProgressSink = Arc<dyn Fn(LoadProgress) + Send + Sync>;

/// Per-fragment callback handed to [`LoadedModel::infer`].
pub type FragmentSink = Box<dyn FnMut(&str) + Send>;

/// What to initialize.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitSpec {
    pub model_id: String,
    pub backend: Backend,
    pub precision: PrecisionProfile,
}

/// Runtime entry point, owned by the background worker.
#[async_trait]
pub trait ModelRuntime: Send + Sync {
    /// Whether `backend` is usable here.
    async fn probe_backend(&self, backend: Backend) -> bool;

    /// Initialize a model, reporting progress through `progress`.
    async fn init(&self, spec: InitSpec, progress: ProgressSink) -> Result<Arc<dyn LoadedModel>>;
}

/// A model instance ready to generate.
#[async_trait]
pub trait LoadedModel: Send + Sync {
    /// Whether `infer` can call a fragment sink.
    fn supports_streaming(&self) -> bool {
        true
    }

    /// Generate a reply, calling `sink` once per produced fragment.
    async fn infer(
        &self,
        input: Vec<ChatMessage>,
        options: GenerationOptions,
        sink: Option<FragmentSink>,
    ) -> Result<String>;
}

/// Builds the runtime inside the worker thread.
pub trait RuntimeFactory: Send + Sync {
    fn create(&self) -> Result<Arc<dyn ModelRuntime>>;
}

impl<F> RuntimeFactory for F
where
    F: Fn() -> Result<Arc<dyn ModelRuntime>> + Send + Sync,
{
    fn create(&self) -> Result<Arc<dyn ModelRuntime>> {
        self()
    }
}
