//! Loopback runtime.
//!
//! Answers by streaming the last user message back one word at a time.
//! Useful for exercising the session layer without model weights.

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

use super::{
    Backend, ChatMessage, FragmentSink, GenerationOptions, InitSpec, LoadProgress, LoadedModel,
    ModelRuntime, PrecisionProfile, ProgressSink, Role,
};

/// Deterministic in-process [`ModelRuntime`].
#[derive(Debug, Clone)]
pub struct LoopbackRuntime {
    backends: HashSet<Backend>,
    failing_profiles: HashSet<PrecisionProfile>,
    total_bytes: u64,
    progress_steps: u64,
    streaming: bool,
}

impl Default for LoopbackRuntime {
    fn default() -> Self {
        Self {
            backends: [Backend::Wasm, Backend::Cpu].into_iter().collect(),
            failing_profiles: HashSet::new(),
            total_bytes: 500 * 1024 * 1024,
            progress_steps: 4,
            streaming: true,
        }
    }
}

impl LoopbackRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Backends that probe successfully.
    pub fn with_backends(mut self, backends: impl IntoIterator<Item = Backend>) -> Self {
        self.backends = backends.into_iter().collect();
        self
    }

    /// Make `init` fail for `profile`.
    pub fn failing_profile(mut self, profile: PrecisionProfile) -> Self {
        self.failing_profiles.insert(profile);
        self
    }

    /// Number of progress reports per init.
    pub fn with_progress_steps(mut self, steps: u64) -> Self {
        self.progress_steps = steps.max(1);
        self
    }

    /// Produce models that ignore the fragment sink.
    pub fn without_streaming(mut self) -> Self {
        self.streaming = false;
        self
    }
}

#[async_trait]
impl ModelRuntime for LoopbackRuntime {
    async fn probe_backend(&self, backend: Backend) -> bool {
        self.backends.contains(&backend)
    }

    async fn init(&self, spec: InitSpec, progress: ProgressSink) -> Result<Arc<dyn LoadedModel>> {
        if self.failing_profiles.contains(&spec.precision) {
            bail!(
                "no {} weights for {} on {}",
                spec.precision,
                spec.model_id,
                spec.backend
            );
        }

        let chunk = self.total_bytes / self.progress_steps;
        for step in 1..=self.progress_steps {
            progress(LoadProgress {
                loaded_bytes: chunk * step,
                total_bytes: self.total_bytes,
            });
            tokio::task::yield_now().await;
        }

        debug!(model_id = %spec.model_id, precision = %spec.precision, "Loopback model ready");
        Ok(Arc::new(LoopbackModel {
            streaming: self.streaming,
        }))
    }
}

struct LoopbackModel {
    streaming: bool,
}

#[async_trait]
impl LoadedModel for LoopbackModel {
    fn supports_streaming(&self) -> bool {
        self.streaming
    }

    async fn infer(
        &self,
        input: Vec<ChatMessage>,
        options: GenerationOptions,
        sink: Option<FragmentSink>,
    ) -> Result<String> {
        let prompt = input
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .or_else(|| input.last())
            .map(|m| m.content.clone())
            .unwrap_or_default();

        let mut sink = if self.streaming { sink } else { None };
        let mut text = String::new();
        for word in prompt
            .split_inclusive(char::is_whitespace)
            .take(options.max_output_tokens as usize)
        {
            text.push_str(word);
            if let Some(sink) = sink.as_mut() {
                sink(word);
            }
            tokio::task::yield_now().await;
        }
        Ok(text)
    }
}
