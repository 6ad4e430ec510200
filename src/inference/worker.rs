//! Background side of the boundary.
//!
//! The worker runs on a dedicated OS thread with its own single-threaded
//! tokio runtime. It constructs the model runtime from a [`RuntimeFactory`]
//! inside that thread, owns the [`InferenceSession`] exclusively, and talks to
//! the host only through encoded frames.

use anyhow::Context;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::cache::ModelMetadataCache;
use crate::config::AnchorConfig;
use crate::runtime::RuntimeFactory;

use super::envelope::{decode, encode, HostEnvelope, WorkerEnvelope};
use super::session::{FragmentEmitter, InferenceSession};

/// Sending half of the worker-to-host lane.
#[derive(Clone)]
pub(crate) struct FrameSender {
    tx: mpsc::UnboundedSender<Bytes>,
}

impl FrameSender {
    pub(crate) fn new(tx: mpsc::UnboundedSender<Bytes>) -> Self {
        Self { tx }
    }

    fn emit(&self, envelope: &WorkerEnvelope) {
        match encode(envelope) {
            Ok(frame) => {
                if self.tx.send(frame).is_err() {
                    debug!("Host lane closed, dropping envelope");
                }
            }
            Err(e) => error!(error = %e, "Failed to encode worker envelope"),
        }
    }
}

/// Worker loop state.
pub(crate) struct WorkerService {
    session: Arc<InferenceSession>,
    requests: mpsc::UnboundedReceiver<Bytes>,
    replies: FrameSender,
}

impl WorkerService {
    /// Start the worker thread. The first frame it sends is `ready` or `fault`.
    pub(crate) fn spawn(
        factory: Arc<dyn RuntimeFactory>,
        config: Arc<AnchorConfig>,
        requests: mpsc::UnboundedReceiver<Bytes>,
        replies: FrameSender,
    ) -> std::io::Result<()> {
        std::thread::Builder::new()
            .name("anchor-infer-worker".to_string())
            .spawn(move || {
                let rt = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        replies.emit(&WorkerEnvelope::Fault {
                            message: format!("failed to create worker runtime: {}", e),
                        });
                        return;
                    }
                };

                rt.block_on(async move {
                    match Self::initialize(factory.as_ref(), &config, requests, replies.clone()) {
                        Ok(service) => {
                            replies.emit(&WorkerEnvelope::Ready);
                            service.run().await;
                        }
                        Err(e) => {
                            error!(error = %e, "Worker initialization failed");
                            replies.emit(&WorkerEnvelope::Fault {
                                message: format!("{:#}", e),
                            });
                        }
                    }
                });
            })?;
        Ok(())
    }

    /// Build the runtime and session (called on the worker thread).
    pub(crate) fn initialize(
        factory: &dyn RuntimeFactory,
        config: &AnchorConfig,
        requests: mpsc::UnboundedReceiver<Bytes>,
        replies: FrameSender,
    ) -> anyhow::Result<Self> {
        let runtime = factory
            .create()
            .context("failed to construct model runtime")?;

        let progress = replies.clone();
        let mut session = InferenceSession::new(
            runtime,
            config.session.clone(),
            Arc::new(move |percent| progress.emit(&WorkerEnvelope::LoadProgress { percent })),
        );
        if config.cache.enabled {
            session = session.with_cache(ModelMetadataCache::new(config.cache.dir.clone()));
        }

        Ok(Self {
            session: Arc::new(session),
            requests,
            replies,
        })
    }

    /// Main loop: processes frames until shutdown or the host lane closes.
    pub(crate) async fn run(mut self) {
        debug!("Worker loop started");
        while let Some(frame) = self.requests.recv().await {
            let envelope: HostEnvelope = match decode(&frame) {
                Ok(envelope) => envelope,
                Err(e) => {
                    warn!(error = %e, "Dropping undecodable host frame");
                    continue;
                }
            };
            debug!(?envelope, "Processing envelope");
            if envelope == HostEnvelope::Shutdown {
                info!("Worker shutdown requested");
                break;
            }
            self.handle(envelope);
        }
        info!("Worker loop ended");
    }

    fn handle(&self, envelope: HostEnvelope) {
        match envelope {
            HostEnvelope::Load {
                request_id,
                model_id,
            } => {
                let load = self.session.load(model_id);
                let replies = self.replies.clone();
                tokio::spawn(async move {
                    let outcome = load.await;
                    replies.emit(&WorkerEnvelope::load_complete(request_id, &outcome));
                });
            }

            HostEnvelope::Generate {
                request_id,
                input,
                options,
                stream,
            } => {
                let session = self.session.clone();
                let replies = self.replies.clone();
                tokio::spawn(async move {
                    if let Err(e) = input.validate().and_then(|_| options.validate()) {
                        replies.emit(&WorkerEnvelope::generate_complete(
                            request_id,
                            Err(e.cause()),
                        ));
                        return;
                    }
                    let emitter: Option<FragmentEmitter> = if stream {
                        let fragments = replies.clone();
                        Some(Box::new(move |fragment: &str, accumulated: &str| {
                            fragments.emit(&WorkerEnvelope::Fragment {
                                request_id,
                                fragment_text: fragment.to_string(),
                                accumulated_text: accumulated.to_string(),
                            })
                        }))
                    } else {
                        None
                    };
                    let outcome = session.generate(input, options, emitter).await;
                    replies.emit(&WorkerEnvelope::generate_complete(request_id, outcome));
                });
            }

            HostEnvelope::GetStatus { request_id } => {
                self.replies.emit(&WorkerEnvelope::Status {
                    request_id,
                    snapshot: self.session.status(),
                });
            }

            HostEnvelope::GetInfo { request_id } => {
                self.replies.emit(&WorkerEnvelope::Info {
                    request_id,
                    snapshot: self.session.info(),
                });
            }

            HostEnvelope::Unload { request_id } => {
                self.session.unload();
                self.replies
                    .emit(&WorkerEnvelope::UnloadComplete { request_id });
            }

            HostEnvelope::Shutdown => {}
        }
    }
}
