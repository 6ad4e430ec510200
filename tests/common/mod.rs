//! Common test utilities for the inference session layer

#![allow(dead_code)]

use anchor_infer::runtime::{FragmentSink, InitSpec, LoadProgress, LoadedModel, ProgressSink};
use anchor_infer::{
    AnchorConfig, ChatMessage, GenerationOptions, ModelRuntime, PrecisionProfile, SessionFacade,
};
use anyhow::{bail, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Scripted model runtime with call counters and injectable delays.
///
/// Clones share their counters, so a factory can hand a fresh clone to every
/// worker incarnation while the test keeps one to inspect.
#[derive(Clone, Default)]
pub struct ScriptedRuntime {
    pub init_calls: Arc<AtomicUsize>,
    pub infer_calls: Arc<AtomicUsize>,
    pub last_input: Arc<Mutex<Vec<ChatMessage>>>,
    failing: Arc<HashSet<PrecisionProfile>>,
    init_delay: Duration,
    infer_delay: Duration,
    reply: Option<Vec<String>>,
    no_streaming: bool,
    fail_streaming: bool,
}

impl ScriptedRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(mut self, profiles: impl IntoIterator<Item = PrecisionProfile>) -> Self {
        self.failing = Arc::new(profiles.into_iter().collect());
        self
    }

    pub fn init_delay(mut self, delay: Duration) -> Self {
        self.init_delay = delay;
        self
    }

    pub fn infer_delay(mut self, delay: Duration) -> Self {
        self.infer_delay = delay;
        self
    }

    /// Fixed fragments instead of echoing the last user message.
    pub fn reply(mut self, fragments: &[&str]) -> Self {
        self.reply = Some(fragments.iter().map(|f| f.to_string()).collect());
        self
    }

    pub fn without_streaming(mut self) -> Self {
        self.no_streaming = true;
        self
    }

    /// Streaming calls fail before producing anything.
    pub fn failing_streams(mut self) -> Self {
        self.fail_streaming = true;
        self
    }

    pub fn init_count(&self) -> usize {
        self.init_calls.load(Ordering::SeqCst)
    }

    pub fn infer_count(&self) -> usize {
        self.infer_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ModelRuntime for ScriptedRuntime {
    async fn probe_backend(&self, _backend: anchor_infer::Backend) -> bool {
        true
    }

    async fn init(&self, spec: InitSpec, progress: ProgressSink) -> Result<Arc<dyn LoadedModel>> {
        self.init_calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.contains(&spec.precision) {
            bail!("{} is unavailable", spec.precision);
        }
        for step in 1..=4u64 {
            progress(LoadProgress {
                loaded_bytes: step * 25,
                total_bytes: 100,
            });
            tokio::time::sleep(self.init_delay / 4).await;
        }
        Ok(Arc::new(ScriptedModel {
            runtime: self.clone(),
        }))
    }
}

struct ScriptedModel {
    runtime: ScriptedRuntime,
}

#[async_trait]
impl LoadedModel for ScriptedModel {
    fn supports_streaming(&self) -> bool {
        !self.runtime.no_streaming
    }

    async fn infer(
        &self,
        input: Vec<ChatMessage>,
        _options: GenerationOptions,
        sink: Option<FragmentSink>,
    ) -> Result<String> {
        self.runtime.infer_calls.fetch_add(1, Ordering::SeqCst);
        *self.runtime.last_input.lock() = input.clone();
        if !self.runtime.infer_delay.is_zero() {
            tokio::time::sleep(self.runtime.infer_delay).await;
        }
        if sink.is_some() && self.runtime.fail_streaming {
            bail!("streaming unavailable");
        }

        let fragments = match &self.runtime.reply {
            Some(reply) => reply.clone(),
            None => input
                .last()
                .map(|m| m.content.split_inclusive(' ').map(str::to_string).collect())
                .unwrap_or_default(),
        };

        let mut sink = sink;
        let mut text = String::new();
        for fragment in fragments {
            text.push_str(&fragment);
            if let Some(sink) = sink.as_mut() {
                sink(&fragment);
            }
            tokio::task::yield_now().await;
        }
        Ok(text)
    }
}

/// Test configuration: no metadata cache, short sweep interval.
pub fn test_config() -> anchor_infer::config::AnchorConfigBuilder {
    AnchorConfig::builder()
        .disable_cache()
        .sweep_interval(Duration::from_millis(20))
}

pub fn facade_with(runtime: ScriptedRuntime, config: AnchorConfig) -> SessionFacade {
    SessionFacade::builder()
        .config(config)
        .runtime_factory(move || -> Result<Arc<dyn ModelRuntime>> {
            Ok(Arc::new(runtime.clone()))
        })
        .build()
        .expect("test: build facade")
}

/// Collects progress percentages reported to a load callback.
pub fn progress_recorder() -> (Arc<Mutex<Vec<u8>>>, anchor_infer::inference::ProgressCallback) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    (seen, Arc::new(move |percent: u8| sink.lock().push(percent)))
}

/// Collects `(fragment, accumulated)` pairs reported to a generate callback.
pub fn fragment_recorder() -> (
    Arc<Mutex<Vec<(String, String)>>>,
    anchor_infer::inference::FragmentCallback,
) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    (
        seen,
        Arc::new(move |fragment: &str, accumulated: &str| {
            sink.lock().push((fragment.to_string(), accumulated.to_string()))
        }),
    )
}
