//! Host-side pending request table.
//!
//! Every call that crosses the boundary is registered here under a fresh
//! [`RequestId`] before its envelope is sent. An entry is retired exactly once,
//! by whichever of completion, fault, caller timeout, expiry sweep or shutdown
//! reaches it first. Oneshot replies are sent while the table lock is held;
//! user callbacks are always invoked after it is released.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{Result, SessionError};

use super::envelope::{InfoSnapshot, RequestId, StatusSnapshot, WorkerEnvelope};
use super::session::SessionMetadata;

/// Load progress callback, receives a percent in `0..=100`.
pub type ProgressCallback = Arc<dyn Fn(u8) + Send + Sync>;

/// Fragment callback, receives `(fragment_text, accumulated_text)`.
pub type FragmentCallback = Arc<dyn Fn(&str, &str) + Send + Sync>;

/// What a pending request is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Load,
    Generate,
    Status,
    Info,
    Unload,
}

impl RequestKind {
    /// Error a caller receives when its deadline passes.
    pub fn timeout_error(&self) -> SessionError {
        match self {
            RequestKind::Load => SessionError::LoadTimeout,
            RequestKind::Generate => SessionError::GenerationTimeout,
            RequestKind::Status | RequestKind::Info | RequestKind::Unload => {
                SessionError::channel(format!("{} query timed out", self))
            }
        }
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RequestKind::Load => "load",
            RequestKind::Generate => "generate",
            RequestKind::Status => "status",
            RequestKind::Info => "info",
            RequestKind::Unload => "unload",
        };
        f.write_str(name)
    }
}

enum Reply {
    Load {
        tx: oneshot::Sender<Result<SessionMetadata>>,
        progress: Option<ProgressCallback>,
    },
    Generate {
        tx: oneshot::Sender<Result<String>>,
        fragments: Option<FragmentCallback>,
    },
    Status(oneshot::Sender<Result<StatusSnapshot>>),
    Info(oneshot::Sender<Result<InfoSnapshot>>),
    Unload(oneshot::Sender<Result<()>>),
}

impl Reply {
    fn kind(&self) -> RequestKind {
        match self {
            Reply::Load { .. } => RequestKind::Load,
            Reply::Generate { .. } => RequestKind::Generate,
            Reply::Status(_) => RequestKind::Status,
            Reply::Info(_) => RequestKind::Info,
            Reply::Unload(_) => RequestKind::Unload,
        }
    }

    fn fail(self, error: SessionError) {
        match self {
            Reply::Load { tx, .. } => {
                let _ = tx.send(Err(error));
            }
            Reply::Generate { tx, .. } => {
                let _ = tx.send(Err(error));
            }
            Reply::Status(tx) => {
                let _ = tx.send(Err(error));
            }
            Reply::Info(tx) => {
                let _ = tx.send(Err(error));
            }
            Reply::Unload(tx) => {
                let _ = tx.send(Err(error));
            }
        }
    }
}

struct PendingRequest {
    deadline: Instant,
    reply: Reply,
}

/// A registered request the caller can await.
#[must_use = "a pending request does nothing unless awaited"]
pub struct Pending<T> {
    id: RequestId,
    kind: RequestKind,
    deadline: Instant,
    rx: oneshot::Receiver<Result<T>>,
}

impl<T> Pending<T> {
    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Wait for the reply or the deadline, whichever comes first.
    ///
    /// When the deadline wins but a completion already retired the entry,
    /// the completion is returned instead of a timeout.
    pub async fn wait(mut self, correlator: &RequestCorrelator) -> Result<T> {
        match tokio::time::timeout_at(self.deadline, &mut self.rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SessionError::ServiceStopped),
            Err(_) => {
                if correlator.expire(self.id) {
                    warn!(request_id = %self.id, kind = %self.kind, "Request timed out");
                    return Err(self.kind.timeout_error());
                }
                match self.rx.try_recv() {
                    Ok(result) => result,
                    Err(_) => Err(self.kind.timeout_error()),
                }
            }
        }
    }
}

/// Pending request table keyed by [`RequestId`].
pub struct RequestCorrelator {
    next_id: AtomicU64,
    pending: Mutex<HashMap<RequestId, PendingRequest>>,
}

impl Default for RequestCorrelator {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestCorrelator {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
        }
    }

    fn register<T>(
        &self,
        kind: RequestKind,
        timeout: Duration,
        reply: impl FnOnce(oneshot::Sender<Result<T>>) -> Reply,
    ) -> Pending<T> {
        let id = RequestId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let deadline = Instant::now() + timeout;
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(
            id,
            PendingRequest {
                deadline,
                reply: reply(tx),
            },
        );
        debug!(request_id = %id, %kind, "Registered request");
        Pending {
            id,
            kind,
            deadline,
            rx,
        }
    }

    pub fn register_load(
        &self,
        timeout: Duration,
        progress: Option<ProgressCallback>,
    ) -> Pending<SessionMetadata> {
        self.register(RequestKind::Load, timeout, |tx| Reply::Load { tx, progress })
    }

    pub fn register_generate(
        &self,
        timeout: Duration,
        fragments: Option<FragmentCallback>,
    ) -> Pending<String> {
        self.register(RequestKind::Generate, timeout, |tx| Reply::Generate {
            tx,
            fragments,
        })
    }

    pub fn register_status(&self, timeout: Duration) -> Pending<StatusSnapshot> {
        self.register(RequestKind::Status, timeout, Reply::Status)
    }

    pub fn register_info(&self, timeout: Duration) -> Pending<InfoSnapshot> {
        self.register(RequestKind::Info, timeout, Reply::Info)
    }

    pub fn register_unload(&self, timeout: Duration) -> Pending<()> {
        self.register(RequestKind::Unload, timeout, Reply::Unload)
    }

    /// Route a correlated worker envelope to its caller.
    ///
    /// Returns false when the envelope was dropped because its request is
    /// unknown or already retired.
    pub fn resolve(&self, envelope: WorkerEnvelope) -> bool {
        let id = match &envelope {
            WorkerEnvelope::Fragment {
                request_id,
                fragment_text,
                accumulated_text,
            } => return self.deliver_fragment(*request_id, fragment_text, accumulated_text),
            WorkerEnvelope::LoadProgress { percent } => {
                self.broadcast_progress(*percent);
                return true;
            }
            other => match other.request_id() {
                Some(id) => id,
                None => return false,
            },
        };

        let mut pending = self.pending.lock();
        let Some(entry) = pending.remove(&id) else {
            debug!(request_id = %id, "Dropping envelope for unknown or expired request");
            return false;
        };

        match (entry.reply, envelope) {
            (
                Reply::Load { tx, .. },
                WorkerEnvelope::LoadComplete {
                    success,
                    session_id,
                    backend,
                    precision_profile,
                    size_mb,
                    error_message,
                    ..
                },
            ) => {
                let outcome = if success {
                    match (session_id, backend, precision_profile) {
                        (Some(session_id), Some(backend), Some(precision_profile)) => {
                            Ok(SessionMetadata {
                                session_id,
                                backend,
                                precision_profile,
                                size_mb: size_mb.unwrap_or_default(),
                            })
                        }
                        _ => Err(SessionError::channel(
                            "loadComplete is missing session metadata",
                        )),
                    }
                } else {
                    Err(SessionError::LoadFailure(
                        error_message.unwrap_or_else(|| "unknown load error".to_string()),
                    ))
                };
                let _ = tx.send(outcome);
            }
            (
                Reply::Generate { tx, .. },
                WorkerEnvelope::GenerateComplete {
                    success,
                    text,
                    error_message,
                    ..
                },
            ) => {
                let outcome = if success {
                    Ok(text.unwrap_or_default())
                } else {
                    Err(SessionError::GenerationFailure(
                        error_message.unwrap_or_else(|| "unknown generation error".to_string()),
                    ))
                };
                let _ = tx.send(outcome);
            }
            (Reply::Status(tx), WorkerEnvelope::Status { snapshot, .. }) => {
                let _ = tx.send(Ok(snapshot));
            }
            (Reply::Info(tx), WorkerEnvelope::Info { snapshot, .. }) => {
                let _ = tx.send(Ok(snapshot));
            }
            (Reply::Unload(tx), WorkerEnvelope::UnloadComplete { .. }) => {
                let _ = tx.send(Ok(()));
            }
            (reply, envelope) => {
                warn!(request_id = %id, kind = %reply.kind(), ?envelope, "Mismatched reply envelope");
                reply.fail(SessionError::channel("mismatched reply envelope"));
            }
        }
        true
    }

    /// Invoke the fragment callback of a pending generation.
    pub fn deliver_fragment(&self, id: RequestId, fragment: &str, accumulated: &str) -> bool {
        let callback = {
            let pending = self.pending.lock();
            match pending.get(&id).map(|entry| &entry.reply) {
                Some(Reply::Generate { fragments, .. }) => fragments.clone(),
                _ => {
                    debug!(request_id = %id, "Dropping fragment for unknown or expired request");
                    return false;
                }
            }
        };
        if let Some(callback) = callback {
            callback(fragment, accumulated);
        }
        true
    }

    /// Forward load progress to every pending load.
    pub fn broadcast_progress(&self, percent: u8) {
        let callbacks: Vec<ProgressCallback> = self
            .pending
            .lock()
            .values()
            .filter_map(|entry| match &entry.reply {
                Reply::Load {
                    progress: Some(progress),
                    ..
                } => Some(progress.clone()),
                _ => None,
            })
            .collect();
        for callback in callbacks {
            callback(percent);
        }
    }

    /// Retire a request whose caller timed out. Returns false if it was already gone.
    pub fn expire(&self, id: RequestId) -> bool {
        self.pending.lock().remove(&id).is_some()
    }

    /// Reject every entry whose deadline is at or before `now`.
    pub fn sweep_expired(&self, now: Instant) -> usize {
        let mut pending = self.pending.lock();
        let expired: Vec<RequestId> = pending
            .iter()
            .filter(|(_, entry)| entry.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            if let Some(entry) = pending.remove(id) {
                let kind = entry.reply.kind();
                warn!(request_id = %id, %kind, "Expiring abandoned request");
                entry.reply.fail(kind.timeout_error());
            }
        }
        expired.len()
    }

    /// Reject every pending request, e.g. after a worker fault.
    pub fn fail_all(&self, error: impl Fn(RequestKind) -> SessionError) -> usize {
        let drained: Vec<(RequestId, PendingRequest)> = self.pending.lock().drain().collect();
        let count = drained.len();
        for (id, entry) in drained {
            let kind = entry.reply.kind();
            debug!(request_id = %id, %kind, "Rejecting pending request");
            entry.reply.fail(error(kind));
        }
        count
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }
}
