//! Inference session owned by the background worker.
//!
//! Tracks the `Unloaded -> Loading -> Ready` lifecycle, selects a backend and
//! precision profile with fallback, and keeps at most one load in flight.
//! Concurrent loads join the in-flight attempt through a shared future.

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::cache::{MetadataRecord, ModelMetadataCache};
use crate::config::SessionConfig;
use crate::error::describe_runtime_error;
use crate::runtime::{
    Backend, ChatInput, FragmentSink, GenerationOptions, InitSpec, LoadProgress, LoadedModel,
    ModelRuntime, PrecisionProfile, ProgressSink,
};

use super::envelope::{InfoSnapshot, StatusSnapshot};

/// Message given to callers of a load that an unload overtook.
pub const UNLOADED_WHILE_LOADING: &str = "session was unloaded while loading";

/// What a successful load reports back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMetadata {
    pub session_id: String,
    pub backend: Backend,
    pub precision_profile: PrecisionProfile,
    #[serde(rename = "sizeMB")]
    pub size_mb: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Unloaded,
    Loading,
    Ready,
}

/// Outcome of a load attempt, as seen by every joined caller.
pub type LoadOutcome = Result<SessionMetadata, String>;

/// Single-flight handle to a load attempt.
pub type SharedLoad = Shared<BoxFuture<'static, LoadOutcome>>;

/// Worker-wide load progress emitter.
pub type ProgressEmitter = Arc<dyn Fn(u8) + Send + Sync>;

/// Per-request fragment emitter, receives `(fragment, accumulated)`.
pub type FragmentEmitter = Box<dyn FnMut(&str, &str) + Send>;

struct SessionState {
    session_id: Option<String>,
    status: SessionStatus,
    backend: Option<Backend>,
    precision: Option<PrecisionProfile>,
    model: Option<Arc<dyn LoadedModel>>,
    in_flight: Option<SharedLoad>,
    epoch: u64,
    last_error: Option<String>,
}

impl SessionState {
    fn new() -> Self {
        Self {
            session_id: None,
            status: SessionStatus::Unloaded,
            backend: None,
            precision: None,
            model: None,
            in_flight: None,
            epoch: 0,
            last_error: None,
        }
    }

    fn clear(&mut self) {
        self.session_id = None;
        self.status = SessionStatus::Unloaded;
        self.backend = None;
        self.precision = None;
        self.model = None;
        self.in_flight = None;
        self.last_error = None;
    }
}

/// Session state machine plus the runtime it drives.
pub struct InferenceSession {
    runtime: Arc<dyn ModelRuntime>,
    settings: Arc<SessionConfig>,
    progress: ProgressEmitter,
    cache: Option<ModelMetadataCache>,
    state: Arc<Mutex<SessionState>>,
}

impl InferenceSession {
    pub fn new(
        runtime: Arc<dyn ModelRuntime>,
        settings: SessionConfig,
        progress: ProgressEmitter,
    ) -> Self {
        Self {
            runtime,
            settings: Arc::new(settings),
            progress,
            cache: None,
            state: Arc::new(Mutex::new(SessionState::new())),
        }
    }

    /// Record metadata of each successful load in `cache`.
    pub fn with_cache(mut self, cache: ModelMetadataCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn current_status(&self) -> SessionStatus {
        self.state.lock().status
    }

    /// Start or join a load of `model_id` (default model when `None`).
    ///
    /// Must be called from within a tokio runtime; the attempt runs as its own
    /// task so it completes even if every caller stops waiting.
    #[instrument(skip_all, fields(model_id = tracing::field::Empty))]
    pub fn load(&self, model_id: Option<String>) -> SharedLoad {
        let model_id = model_id.unwrap_or_else(|| self.settings.default_model.clone());
        tracing::Span::current().record("model_id", model_id.as_str());

        let mut state = self.state.lock();
        if state.status == SessionStatus::Ready && state.session_id.as_deref() == Some(model_id.as_str()) {
            if let (Some(backend), Some(precision_profile)) = (state.backend, state.precision) {
                debug!("Model already loaded");
                let meta = SessionMetadata {
                    session_id: model_id,
                    backend,
                    precision_profile,
                    size_mb: self.settings.approximate_size_mb,
                };
                return futures::future::ready(Ok(meta)).boxed().shared();
            }
        }

        if let Some(in_flight) = &state.in_flight {
            debug!("Joining in-flight load");
            return in_flight.clone();
        }

        if state.status != SessionStatus::Unloaded {
            info!(previous = ?state.session_id, "Tearing down current session");
        }
        state.clear();
        state.status = SessionStatus::Loading;
        state.session_id = Some(model_id.clone());
        let epoch = state.epoch;

        let attempt = Self::run_attempt(
            self.runtime.clone(),
            self.settings.clone(),
            self.progress.clone(),
            self.cache.clone(),
            self.state.clone(),
            model_id,
            epoch,
        );
        let task = tokio::spawn(attempt);
        let shared = async move {
            task.await
                .unwrap_or_else(|e| Err(format!("load task failed: {}", e)))
        }
        .boxed()
        .shared();
        state.in_flight = Some(shared.clone());
        shared
    }

    async fn run_attempt(
        runtime: Arc<dyn ModelRuntime>,
        settings: Arc<SessionConfig>,
        progress: ProgressEmitter,
        cache: Option<ModelMetadataCache>,
        state: Arc<Mutex<SessionState>>,
        model_id: String,
        epoch: u64,
    ) -> LoadOutcome {
        let outcome =
            Self::initialize(runtime.as_ref(), &settings, progress.clone(), &model_id).await;

        {
            let mut state = state.lock();
            if state.epoch != epoch {
                info!(%model_id, "Discarding load overtaken by unload");
                return Err(UNLOADED_WHILE_LOADING.to_string());
            }
            state.in_flight = None;
            match &outcome {
                Ok((model, meta)) => {
                    state.status = SessionStatus::Ready;
                    state.backend = Some(meta.backend);
                    state.precision = Some(meta.precision_profile);
                    state.model = Some(model.clone());
                }
                Err(message) => {
                    state.clear();
                    state.last_error = Some(message.clone());
                }
            }
        }

        match outcome {
            Ok((_, meta)) => {
                progress(100);
                info!(
                    %model_id,
                    backend = %meta.backend,
                    precision = %meta.precision_profile,
                    "Model loaded"
                );
                if let Some(cache) = cache {
                    let record = MetadataRecord::from_metadata(&meta);
                    tokio::spawn(async move {
                        if let Err(e) = cache.write(&record).await {
                            warn!(error = %e, "Failed to cache model metadata");
                        }
                    });
                }
                Ok(meta)
            }
            Err(message) => {
                warn!(%model_id, error = %message, "Model load failed");
                Err(message)
            }
        }
    }

    async fn initialize(
        runtime: &dyn ModelRuntime,
        settings: &SessionConfig,
        progress: ProgressEmitter,
        model_id: &str,
    ) -> Result<(Arc<dyn LoadedModel>, SessionMetadata), String> {
        let backend = select_backend(runtime, &settings.backend_priority).await;
        info!(%backend, "Selected compute backend");

        let cap = settings.progress_cap;
        // Highest percent reported so far, across profiles.
        let reported = Arc::new(AtomicU8::new(0));
        let mut last_error = None;
        for &precision in &settings.precision_profiles {
            let emit = progress.clone();
            let reported = reported.clone();
            let sink: ProgressSink = Arc::new(move |report: LoadProgress| {
                if let Some(percent) = report.percent(cap) {
                    if reported.fetch_max(percent, Ordering::SeqCst) < percent {
                        emit(percent);
                    }
                }
            });
            let spec = InitSpec {
                model_id: model_id.to_string(),
                backend,
                precision,
            };
            match runtime.init(spec, sink).await {
                Ok(model) => {
                    let meta = SessionMetadata {
                        session_id: model_id.to_string(),
                        backend,
                        precision_profile: precision,
                        size_mb: settings.approximate_size_mb,
                    };
                    return Ok((model, meta));
                }
                Err(e) => {
                    warn!(%precision, error = %e, "Precision profile failed, trying next");
                    last_error = Some(describe_runtime_error(&format!("{:#}", e)));
                }
            }
        }
        Err(last_error.unwrap_or_else(|| "no precision profiles configured".to_string()))
    }

    /// Run one generation. Fragments are pushed through `emit` as produced.
    ///
    /// Falls back to a single non-streaming call when the model cannot
    /// stream, or when streaming fails before the first fragment.
    pub async fn generate(
        &self,
        input: ChatInput,
        options: GenerationOptions,
        emit: Option<FragmentEmitter>,
    ) -> Result<String, String> {
        let model = {
            let state = self.state.lock();
            match (&state.model, state.status) {
                (Some(model), SessionStatus::Ready) => model.clone(),
                _ => return Err("Model not loaded".to_string()),
            }
        };
        let messages = input.into_messages(&self.settings.system_prompt);
        debug!(
            messages = messages.len(),
            do_sample = options.do_sample(),
            "Running generation"
        );

        let mut emit = match emit {
            Some(emit) if model.supports_streaming() => emit,
            _ => {
                return model
                    .infer(messages, options, None)
                    .await
                    .map_err(|e| describe_runtime_error(&format!("{:#}", e)));
            }
        };

        let accumulated = Arc::new(Mutex::new(String::new()));
        let emitted = Arc::new(AtomicBool::new(false));
        let sink: FragmentSink = {
            let accumulated = accumulated.clone();
            let emitted = emitted.clone();
            Box::new(move |fragment: &str| {
                let mut text = accumulated.lock();
                text.push_str(fragment);
                emitted.store(true, Ordering::SeqCst);
                emit(fragment, text.as_str());
            })
        };

        match model.infer(messages.clone(), options, Some(sink)).await {
            Ok(text) => {
                if emitted.load(Ordering::SeqCst) {
                    Ok(accumulated.lock().clone())
                } else {
                    Ok(text)
                }
            }
            Err(e) if !emitted.load(Ordering::SeqCst) => {
                warn!(error = %e, "Streaming failed before first fragment, retrying without streaming");
                model
                    .infer(messages, options, None)
                    .await
                    .map_err(|e| describe_runtime_error(&format!("{:#}", e)))
            }
            Err(e) => Err(describe_runtime_error(&format!("{:#}", e))),
        }
    }

    pub fn status(&self) -> StatusSnapshot {
        let state = self.state.lock();
        StatusSnapshot {
            loaded: state.status == SessionStatus::Ready,
            session_id: Some(
                state
                    .session_id
                    .clone()
                    .unwrap_or_else(|| self.settings.default_model.clone()),
            ),
            loading: state.status == SessionStatus::Loading,
        }
    }

    pub fn info(&self) -> InfoSnapshot {
        let state = self.state.lock();
        InfoSnapshot {
            session_id: Some(
                state
                    .session_id
                    .clone()
                    .unwrap_or_else(|| self.settings.default_model.clone()),
            ),
            backend: state.backend,
            precision_profile: state.precision,
            approximate_size_mb: self.settings.approximate_size_mb,
            loaded: state.status == SessionStatus::Ready,
            loading: state.status == SessionStatus::Loading,
            last_error: state.last_error.clone(),
        }
    }

    /// Drop the model. An in-flight load is discarded when it completes.
    pub fn unload(&self) {
        let mut state = self.state.lock();
        if state.in_flight.is_some() {
            info!(model_id = ?state.session_id, "Unloading while a load is in flight");
        }
        state.epoch += 1;
        state.clear();
        debug!("Session unloaded");
    }
}

/// First backend that probes successfully; CPU when none does.
async fn select_backend(runtime: &dyn ModelRuntime, priority: &[Backend]) -> Backend {
    for &backend in priority {
        if runtime.probe_backend(backend).await {
            return backend;
        }
        debug!(%backend, "Backend unavailable");
    }
    Backend::Cpu
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::LoopbackRuntime;
    use std::sync::atomic::AtomicUsize;

    fn session(runtime: LoopbackRuntime) -> (InferenceSession, Arc<Mutex<Vec<u8>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let session = InferenceSession::new(
            Arc::new(runtime),
            SessionConfig::default(),
            Arc::new(move |p: u8| sink.lock().push(p)),
        );
        (session, seen)
    }

    #[tokio::test]
    async fn test_profile_fallback_reaches_ready() {
        let runtime = LoopbackRuntime::new()
            .failing_profile(PrecisionProfile::Q4)
            .failing_profile(PrecisionProfile::Q4f16);
        let (session, progress) = session(runtime);

        let meta = session.load(Some("m".into())).await.expect("test: load");
        assert_eq!(meta.precision_profile, PrecisionProfile::Int8);
        assert_eq!(session.current_status(), SessionStatus::Ready);

        let progress = progress.lock();
        assert_eq!(progress.last(), Some(&100));
        assert_eq!(progress.iter().filter(|p| **p == 100).count(), 1);
    }

    #[tokio::test]
    async fn test_all_profiles_fail_keeps_last_error() {
        let mut runtime = LoopbackRuntime::new();
        for profile in PrecisionProfile::default_ladder() {
            runtime = runtime.failing_profile(profile);
        }
        let (session, _) = session(runtime);

        let error = session
            .load(Some("bad".into()))
            .await
            .expect_err("test: load should fail");
        assert!(error.contains("auto"));
        assert_eq!(session.current_status(), SessionStatus::Unloaded);
        assert_eq!(session.info().last_error, Some(error));
        assert_eq!(session.status().session_id, Some(SessionConfig::default().default_model));

        session.unload();
        assert_eq!(session.current_status(), SessionStatus::Unloaded);
        assert_eq!(session.info().last_error, None);
    }

    #[tokio::test]
    async fn test_backend_falls_back_to_cpu() {
        let runtime = LoopbackRuntime::new().with_backends([]);
        let (session, _) = session(runtime);
        let meta = session.load(None).await.expect("test: load");
        assert_eq!(meta.backend, Backend::Cpu);
    }

    #[tokio::test]
    async fn test_unload_during_load_discards_result() {
        let (session, _) = session(LoopbackRuntime::new().with_progress_steps(8));
        let load = session.load(None);
        session.unload();

        assert_eq!(load.await, Err(UNLOADED_WHILE_LOADING.to_string()));
        assert_eq!(session.current_status(), SessionStatus::Unloaded);
        assert!(!session.status().loaded);
    }

    #[tokio::test]
    async fn test_streamed_text_equals_fragment_concatenation() {
        let (session, _) = session(LoopbackRuntime::new());
        session.load(None).await.expect("test: load");

        let fragments = Arc::new(Mutex::new(Vec::<String>::new()));
        let collected = fragments.clone();
        let text = session
            .generate(
                ChatInput::from("one two three"),
                GenerationOptions::default(),
                Some(Box::new(move |f: &str, _: &str| collected.lock().push(f.to_string()))),
            )
            .await
            .expect("test: generate");
        assert_eq!(fragments.lock().concat(), text);

        let plain = session
            .generate(ChatInput::from("one two three"), GenerationOptions::default(), None)
            .await
            .expect("test: generate");
        assert_eq!(plain, text);
    }

    #[tokio::test]
    async fn test_non_streaming_model_completes_without_fragments() {
        let (session, _) = session(LoopbackRuntime::new().without_streaming());
        session.load(None).await.expect("test: load");

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let text = session
            .generate(
                ChatInput::from("hello world"),
                GenerationOptions::default(),
                Some(Box::new(move |_: &str, _: &str| {
                    counter.fetch_add(1, Ordering::SeqCst);
                })),
            )
            .await
            .expect("test: generate");
        assert_eq!(text, "hello world");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_generate_before_load_fails() {
        let (session, _) = session(LoopbackRuntime::new());
        let result = session
            .generate(ChatInput::from("hi"), GenerationOptions::default(), None)
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_status_reports_default_model_when_unloaded() {
        let (session, _) = session(LoopbackRuntime::new());
        let status = session.status();
        assert!(!status.loaded);
        assert!(!status.loading);
        assert_eq!(status.session_id, Some(SessionConfig::default().default_model));
    }
}
