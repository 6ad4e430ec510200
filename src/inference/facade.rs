//! Session facade: the object the rest of the application calls.
//!
//! Lazily brings up the background worker (single-flight), correlates every
//! call through the [`RequestCorrelator`], and hides the frame lanes.
//!
//! # Example
//! ```rust,ignore
//! let facade = SessionFacade::builder()
//!     .runtime_factory(|| Ok(Arc::new(LoopbackRuntime::new()) as Arc<dyn ModelRuntime>))
//!     .build()?;
//! facade.load_model(None, None).await?;
//! let text = facade.generate("hello", None, None).await?;
//! ```

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument, warn};

use crate::config::AnchorConfig;
use crate::error::{Result, SessionError};
use crate::runtime::{ChatInput, GenerationOptions, RuntimeFactory};

use super::channel::{self, WorkerLink};
use super::correlator::{FragmentCallback, ProgressCallback, RequestCorrelator, RequestKind};
use super::envelope::{HostEnvelope, InfoSnapshot, StatusSnapshot};
use super::response::GenerationStream;
use super::session::SessionMetadata;

type SharedBringUp = Shared<BoxFuture<'static, Result<Arc<WorkerLink>>>>;

enum WorkerSlot {
    Down,
    Starting(SharedBringUp),
    Up(Arc<WorkerLink>),
}

struct FacadeInner {
    config: Arc<AnchorConfig>,
    factory: Arc<dyn RuntimeFactory>,
    supported: bool,
    correlator: Arc<RequestCorrelator>,
    slot: Mutex<WorkerSlot>,
    /// Last successful load. Only used to fail `generate` fast.
    mirror: Mutex<Option<SessionMetadata>>,
    incarnations: AtomicU64,
    stopped: AtomicBool,
}

impl FacadeInner {
    fn handle_fault(&self, incarnation: u64, message: String) {
        {
            let mut slot = self.slot.lock();
            // Fault from a replaced worker.
            if self.incarnations.load(Ordering::SeqCst) != incarnation {
                warn!(incarnation, %message, "Ignoring fault from a replaced worker");
                return;
            }
            if matches!(&*slot, WorkerSlot::Up(link) if link.incarnation() == incarnation) {
                *slot = WorkerSlot::Down;
            }
        }
        error!(incarnation, %message, "Inference worker faulted");
        *self.mirror.lock() = None;
        let rejected = self.correlator.fail_all(|kind| match kind {
            RequestKind::Load => SessionError::BringUpFailure(message.clone()),
            RequestKind::Generate => SessionError::GenerationFailure(message.clone()),
            RequestKind::Status | RequestKind::Info | RequestKind::Unload => {
                SessionError::channel(message.clone())
            }
        });
        if rejected > 0 {
            warn!(rejected, "Rejected pending requests after worker fault");
        }
    }

    /// Current worker, without bringing one up.
    fn live_link(&self) -> Option<Arc<WorkerLink>> {
        match &*self.slot.lock() {
            WorkerSlot::Up(link) if link.is_alive() => Some(link.clone()),
            _ => None,
        }
    }
}

/// Host-side inference service.
///
/// Cheap to clone; all clones share one worker and one pending request
/// table. Independent facades do not share anything.
#[derive(Clone)]
pub struct SessionFacade {
    inner: Arc<FacadeInner>,
}

impl SessionFacade {
    /// Create a facade with the default capability probe.
    pub fn new(config: AnchorConfig, factory: Arc<dyn RuntimeFactory>) -> anyhow::Result<Self> {
        Self::builder().config(config).runtime_factory_arc(factory).build()
    }

    pub fn builder() -> SessionFacadeBuilder {
        SessionFacadeBuilder::new()
    }

    /// Whether a background worker can be created here. Probed once.
    pub fn is_supported(&self) -> bool {
        self.inner.supported
    }

    pub fn config(&self) -> &AnchorConfig {
        &self.inner.config
    }

    /// Number of requests awaiting a reply.
    pub fn pending_requests(&self) -> usize {
        self.inner.correlator.len()
    }

    async fn ensure_worker(&self) -> Result<Arc<WorkerLink>> {
        if self.inner.stopped.load(Ordering::SeqCst) {
            return Err(SessionError::ServiceStopped);
        }

        let attempt = {
            let mut slot = self.inner.slot.lock();
            match &*slot {
                WorkerSlot::Up(link) if link.is_alive() => return Ok(link.clone()),
                WorkerSlot::Starting(attempt) => attempt.clone(),
                WorkerSlot::Up(_) | WorkerSlot::Down => {
                    let incarnation = self.inner.incarnations.fetch_add(1, Ordering::SeqCst) + 1;
                    let attempt = Self::bring_up(&self.inner, incarnation).boxed().shared();
                    *slot = WorkerSlot::Starting(attempt.clone());
                    attempt
                }
            }
        };

        let result = attempt.clone().await;

        {
            let mut slot = self.inner.slot.lock();
            if let WorkerSlot::Starting(current) = &*slot {
                if current.ptr_eq(&attempt) {
                    *slot = match &result {
                        Ok(link) => WorkerSlot::Up(link.clone()),
                        Err(_) => WorkerSlot::Down,
                    };
                }
            }
        }

        if self.inner.stopped.load(Ordering::SeqCst) {
            if let Ok(link) = &result {
                link.close();
            }
            return Err(SessionError::ServiceStopped);
        }
        result
    }

    fn bring_up(
        inner: &Arc<FacadeInner>,
        incarnation: u64,
    ) -> impl std::future::Future<Output = Result<Arc<WorkerLink>>> + Send + 'static {
        let weak: Weak<FacadeInner> = Arc::downgrade(inner);
        let factory = inner.factory.clone();
        let config = inner.config.clone();
        let correlator = inner.correlator.clone();
        async move {
            let on_fault = Box::new(move |message: String| {
                if let Some(inner) = weak.upgrade() {
                    inner.handle_fault(incarnation, message);
                }
            });
            channel::bring_up(incarnation, factory, config, correlator, on_fault)
                .await
                .map(Arc::new)
        }
    }

    /// Load a model (the configured default when `model_id` is `None`).
    ///
    /// Concurrent calls share one bring-up and one load attempt; all of them
    /// resolve with the same metadata.
    #[instrument(skip_all, fields(model_id = ?model_id))]
    pub async fn load_model(
        &self,
        model_id: Option<&str>,
        on_progress: Option<ProgressCallback>,
    ) -> Result<SessionMetadata> {
        if !self.inner.supported {
            warn!("Background inference is not supported here");
            return Err(SessionError::UnsupportedEnvironment);
        }

        let link = self.ensure_worker().await?;
        {
            // Loading another model tears the current session down on the worker.
            let requested = model_id.unwrap_or(&self.inner.config.session.default_model);
            let mut mirror = self.inner.mirror.lock();
            if mirror.as_ref().is_some_and(|meta| meta.session_id != requested) {
                *mirror = None;
            }
        }
        let correlator = &self.inner.correlator;
        let pending = correlator.register_load(self.inner.config.timeouts.load(), on_progress);
        let request_id = pending.id();
        if let Err(e) = link.send(&HostEnvelope::Load {
            request_id,
            model_id: model_id.map(str::to_string),
        }) {
            correlator.expire(request_id);
            return Err(e);
        }

        let result = pending.wait(correlator).await;
        match &result {
            Ok(meta) => {
                info!(session_id = %meta.session_id, backend = %meta.backend, "Model ready");
                *self.inner.mirror.lock() = Some(meta.clone());
            }
            Err(e) => {
                warn!(error = %e, "Model load failed");
                *self.inner.mirror.lock() = None;
            }
        }
        result
    }

    fn generation_link(&self) -> Result<Arc<WorkerLink>> {
        if self.inner.mirror.lock().is_none() {
            return Err(SessionError::NotLoaded);
        }
        self.inner.live_link().ok_or(SessionError::NotLoaded)
    }

    fn prepare(
        &self,
        input: ChatInput,
        options: Option<GenerationOptions>,
    ) -> Result<(Arc<WorkerLink>, ChatInput, GenerationOptions)> {
        let link = self.generation_link()?;
        let options = options.unwrap_or_else(|| self.inner.config.generation_options());
        input.validate()?;
        options.validate()?;
        Ok((link, input, options))
    }

    /// Generate a reply. `on_fragment` receives `(fragment, accumulated)` as
    /// text is produced; the returned text is the full reply.
    ///
    /// Fails with [`SessionError::NotLoaded`] without contacting the worker
    /// unless a load has succeeded.
    pub async fn generate(
        &self,
        input: impl Into<ChatInput>,
        options: Option<GenerationOptions>,
        on_fragment: Option<FragmentCallback>,
    ) -> Result<String> {
        let (link, input, options) = self.prepare(input.into(), options)?;
        let correlator = &self.inner.correlator;
        let stream = on_fragment.is_some();
        let pending = correlator.register_generate(self.inner.config.timeouts.generate(), on_fragment);
        let request_id = pending.id();
        if let Err(e) = link.send(&HostEnvelope::Generate {
            request_id,
            input,
            options,
            stream,
        }) {
            correlator.expire(request_id);
            return Err(e);
        }
        debug!(%request_id, stream, "Generation dispatched");
        pending.wait(correlator).await
    }

    /// Generate a reply as a stream of fragments followed by the final text.
    pub fn generate_stream(
        &self,
        input: impl Into<ChatInput>,
        options: Option<GenerationOptions>,
    ) -> Result<GenerationStream> {
        let (link, input, options) = self.prepare(input.into(), options)?;
        let correlator = self.inner.correlator.clone();

        let (fragment_tx, fragment_rx) = mpsc::unbounded_channel();
        let on_fragment: FragmentCallback = Arc::new(move |fragment: &str, _: &str| {
            let _ = fragment_tx.send(fragment.to_string());
        });
        let pending = correlator.register_generate(self.inner.config.timeouts.generate(), Some(on_fragment));
        let request_id = pending.id();
        if let Err(e) = link.send(&HostEnvelope::Generate {
            request_id,
            input,
            options,
            stream: true,
        }) {
            correlator.expire(request_id);
            return Err(e);
        }

        let completion = async move { pending.wait(&correlator).await }.boxed();
        Ok(GenerationStream::new(request_id, fragment_rx, completion))
    }

    /// Status snapshot; quiescent default if the worker is not up or silent.
    pub async fn status(&self) -> StatusSnapshot {
        let Some(link) = self.inner.live_link() else {
            return StatusSnapshot::default();
        };
        let correlator = &self.inner.correlator;
        let pending = correlator.register_status(self.inner.config.timeouts.query());
        let request_id = pending.id();
        if link.send(&HostEnvelope::GetStatus { request_id }).is_err() {
            correlator.expire(request_id);
            return StatusSnapshot::default();
        }
        pending.wait(correlator).await.unwrap_or_else(|e| {
            debug!(error = %e, "Status query failed");
            StatusSnapshot::default()
        })
    }

    /// Info snapshot; quiescent default if the worker is not up or silent.
    pub async fn info(&self) -> InfoSnapshot {
        let Some(link) = self.inner.live_link() else {
            return InfoSnapshot::default();
        };
        let correlator = &self.inner.correlator;
        let pending = correlator.register_info(self.inner.config.timeouts.query());
        let request_id = pending.id();
        if link.send(&HostEnvelope::GetInfo { request_id }).is_err() {
            correlator.expire(request_id);
            return InfoSnapshot::default();
        }
        pending.wait(correlator).await.unwrap_or_else(|e| {
            debug!(error = %e, "Info query failed");
            InfoSnapshot::default()
        })
    }

    /// Unload the model. In-flight generations are left to complete or time out.
    pub async fn unload(&self) {
        *self.inner.mirror.lock() = None;
        let Some(link) = self.inner.live_link() else {
            debug!("No worker to unload");
            return;
        };
        let correlator = &self.inner.correlator;
        let pending = correlator.register_unload(self.inner.config.timeouts.query());
        let request_id = pending.id();
        if let Err(e) = link.send(&HostEnvelope::Unload { request_id }) {
            correlator.expire(request_id);
            warn!(error = %e, "Failed to send unload");
            return;
        }
        if let Err(e) = pending.wait(correlator).await {
            warn!(error = %e, "Unload was not acknowledged");
        }
    }

    /// Stop the worker and reject every pending request.
    pub fn shutdown(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let previous = std::mem::replace(&mut *self.inner.slot.lock(), WorkerSlot::Down);
        if let WorkerSlot::Up(link) = previous {
            link.close();
        }
        *self.inner.mirror.lock() = None;
        let rejected = self.inner.correlator.fail_all(|_| SessionError::ServiceStopped);
        info!(rejected, "Inference service stopped");
    }
}

/// Default capability probe: can an OS thread be spawned here?
fn probe_thread_support() -> bool {
    std::thread::Builder::new()
        .name("anchor-infer-probe".to_string())
        .spawn(|| {})
        .map(|handle| handle.join().is_ok())
        .unwrap_or(false)
}

/// Builder for [`SessionFacade`].
pub struct SessionFacadeBuilder {
    config: AnchorConfig,
    factory: Option<Arc<dyn RuntimeFactory>>,
    probe: Box<dyn FnOnce() -> bool + Send>,
}

impl Default for SessionFacadeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionFacadeBuilder {
    pub fn new() -> Self {
        Self {
            config: AnchorConfig::default(),
            factory: None,
            probe: Box::new(probe_thread_support),
        }
    }

    pub fn config(mut self, config: AnchorConfig) -> Self {
        self.config = config;
        self
    }

    /// Factory that builds the model runtime inside the worker thread.
    pub fn runtime_factory(mut self, factory: impl RuntimeFactory + 'static) -> Self {
        self.factory = Some(Arc::new(factory));
        self
    }

    pub fn runtime_factory_arc(mut self, factory: Arc<dyn RuntimeFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Replace the capability probe.
    pub fn support_probe(mut self, probe: impl FnOnce() -> bool + Send + 'static) -> Self {
        self.probe = Box::new(probe);
        self
    }

    pub fn build(self) -> anyhow::Result<SessionFacade> {
        self.config.validate()?;
        let factory = self
            .factory
            .ok_or_else(|| anyhow::anyhow!("a runtime factory is required"))?;
        let supported = (self.probe)();
        debug!(supported, "Capability probe");

        Ok(SessionFacade {
            inner: Arc::new(FacadeInner {
                config: Arc::new(self.config),
                factory,
                supported,
                correlator: Arc::new(RequestCorrelator::new()),
                slot: Mutex::new(WorkerSlot::Down),
                mirror: Mutex::new(None),
                incarnations: AtomicU64::new(0),
                stopped: AtomicBool::new(false),
            }),
        })
    }
}
