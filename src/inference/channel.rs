//! Host side of the boundary: frame lanes, bring-up and dispatch.
//!
//! ```text
//! ┌──────────────────────┐  host lane (Bytes)   ┌──────────────────────┐
//! │ SessionFacade        │ ───────────────────▶ │ WorkerService        │
//! │  - RequestCorrelator │                      │  - InferenceSession  │
//! │  - dispatcher task   │ ◀─────────────────── │  - dedicated thread  │
//! └──────────────────────┘  worker lane (Bytes) └──────────────────────┘
//! ```
//!
//! Bring-up waits for the first frame on the worker lane (`ready` or `fault`).
//! Afterwards a dispatcher task decodes every frame and routes it through the
//! correlator; a single lane keeps fragments ahead of their completion.

use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

use crate::config::AnchorConfig;
use crate::error::{Result, SessionError};
use crate::runtime::RuntimeFactory;

use super::correlator::RequestCorrelator;
use super::envelope::{decode, encode, HostEnvelope, WorkerEnvelope};
use super::worker::{FrameSender, WorkerService};

/// Called once when a live worker faults or its lane closes unexpectedly.
pub(crate) type FaultHandler = Box<dyn FnOnce(String) + Send>;

/// Handle to a running worker.
pub(crate) struct WorkerLink {
    incarnation: u64,
    outbound: mpsc::UnboundedSender<Bytes>,
    alive: Arc<AtomicBool>,
}

impl WorkerLink {
    pub(crate) fn incarnation(&self) -> u64 {
        self.incarnation
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst) && !self.outbound.is_closed()
    }

    /// Encode and send an envelope to the worker.
    pub(crate) fn send(&self, envelope: &HostEnvelope) -> Result<()> {
        let frame = encode(envelope)?;
        self.outbound
            .send(frame)
            .map_err(|_| SessionError::channel("worker lane closed"))
    }

    /// Stop the worker. Lane closure after this is not reported as a fault.
    pub(crate) fn close(&self) {
        self.alive.store(false, Ordering::SeqCst);
        if self.send(&HostEnvelope::Shutdown).is_err() {
            debug!("Worker already gone at shutdown");
        }
    }
}

/// Spawn a worker and wait for it to report readiness.
#[instrument(skip_all, fields(incarnation = incarnation))]
pub(crate) async fn bring_up(
    incarnation: u64,
    factory: Arc<dyn RuntimeFactory>,
    config: Arc<AnchorConfig>,
    correlator: Arc<RequestCorrelator>,
    on_fault: FaultHandler,
) -> Result<WorkerLink> {
    info!("Starting inference worker");

    let (outbound, requests) = mpsc::unbounded_channel();
    let (replies, mut inbound) = mpsc::unbounded_channel();

    let bring_up_timeout = config.timeouts.bring_up();
    let sweep_interval = config.timeouts.sweep_interval();
    WorkerService::spawn(factory, config, requests, FrameSender::new(replies)).map_err(|e| {
        error!(error = %e, "Failed to spawn worker thread");
        SessionError::BringUpFailure(format!("failed to spawn worker thread: {}", e))
    })?;

    let first = match tokio::time::timeout(bring_up_timeout, inbound.recv()).await {
        Ok(first) => first,
        Err(_) => {
            warn!(timeout = ?bring_up_timeout, "Worker did not report readiness");
            return Err(SessionError::BringUpTimeout);
        }
    };

    match first.map(|frame| decode::<WorkerEnvelope>(&frame)) {
        Some(Ok(WorkerEnvelope::Ready)) => {}
        Some(Ok(WorkerEnvelope::Fault { message })) => {
            error!(%message, "Worker failed during bring-up");
            return Err(SessionError::BringUpFailure(message));
        }
        Some(Ok(other)) => {
            return Err(SessionError::BringUpFailure(format!(
                "unexpected first envelope: {:?}",
                other
            )));
        }
        Some(Err(e)) => return Err(SessionError::BringUpFailure(e.cause())),
        None => {
            return Err(SessionError::BringUpFailure(
                "worker exited during bring-up".to_string(),
            ));
        }
    }

    let alive = Arc::new(AtomicBool::new(true));
    tokio::spawn(dispatch(
        inbound,
        correlator,
        alive.clone(),
        sweep_interval,
        on_fault,
    ));

    info!("Inference worker ready");
    Ok(WorkerLink {
        incarnation,
        outbound,
        alive,
    })
}

/// Route worker frames until the lane closes or the worker faults.
async fn dispatch(
    mut inbound: mpsc::UnboundedReceiver<Bytes>,
    correlator: Arc<RequestCorrelator>,
    alive: Arc<AtomicBool>,
    sweep_interval: Duration,
    on_fault: FaultHandler,
) {
    let mut sweep = tokio::time::interval(sweep_interval);
    sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let fault = loop {
        tokio::select! {
            frame = inbound.recv() => {
                let Some(frame) = frame else {
                    break Some("worker channel closed".to_string());
                };
                match decode::<WorkerEnvelope>(&frame) {
                    Ok(WorkerEnvelope::Fault { message }) => break Some(message),
                    Ok(WorkerEnvelope::Ready) => debug!("Ignoring repeated ready"),
                    Ok(envelope) => {
                        correlator.resolve(envelope);
                    }
                    Err(e) => warn!(error = %e, "Dropping undecodable worker frame"),
                }
            }
            _ = sweep.tick() => {
                let expired = correlator.sweep_expired(Instant::now());
                if expired > 0 {
                    debug!(expired, "Expiry sweep");
                }
            }
        }
    };

    // A deliberate close clears `alive` first.
    if alive.swap(false, Ordering::SeqCst) {
        if let Some(message) = fault {
            error!(%message, "Inference worker fault");
            on_fault(message);
        }
    } else {
        debug!("Dispatcher stopped after shutdown");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{LoopbackRuntime, ModelRuntime};
    use parking_lot::Mutex;

    fn loopback() -> Arc<dyn RuntimeFactory> {
        Arc::new(|| -> anyhow::Result<Arc<dyn ModelRuntime>> { Ok(Arc::new(LoopbackRuntime::new())) })
    }

    fn config() -> Arc<AnchorConfig> {
        Arc::new(AnchorConfig::builder().disable_cache().build())
    }

    #[tokio::test]
    async fn test_bring_up_then_status_round_trip() {
        let correlator = Arc::new(RequestCorrelator::new());
        let link = bring_up(1, loopback(), config(), correlator.clone(), Box::new(|_: String| {}))
            .await
            .expect("test: bring up");
        assert!(link.is_alive());

        let pending = correlator.register_status(Duration::from_secs(5));
        link.send(&HostEnvelope::GetStatus { request_id: pending.id() })
            .expect("test: send");
        let status = pending.wait(&correlator).await.expect("test: status");
        assert!(!status.loaded);

        link.close();
        assert!(!link.is_alive());
    }

    #[tokio::test]
    async fn test_factory_failure_is_bring_up_failure() {
        let failing: Arc<dyn RuntimeFactory> =
            Arc::new(|| -> anyhow::Result<Arc<dyn ModelRuntime>> { anyhow::bail!("no device") });
        let result = bring_up(
            1,
            failing,
            config(),
            Arc::new(RequestCorrelator::new()),
            Box::new(|_: String| {}),
        )
        .await;
        match result {
            Err(SessionError::BringUpFailure(message)) => assert!(message.contains("no device")),
            Err(other) => panic!("unexpected error: {:?}", other),
            Ok(_) => panic!("bring-up should fail"),
        }
    }

    #[tokio::test]
    async fn test_shutdown_is_not_a_fault() {
        let faults = Arc::new(Mutex::new(Vec::new()));
        let sink = faults.clone();
        let link = bring_up(
            1,
            loopback(),
            config(),
            Arc::new(RequestCorrelator::new()),
            Box::new(move |message: String| sink.lock().push(message)),
        )
        .await
        .expect("test: bring up");

        link.close();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(faults.lock().is_empty());
    }
}
