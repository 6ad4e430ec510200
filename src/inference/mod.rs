//! Worker-hosted inference session layer.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │        SessionFacade (cloneable, host side)     │
//! │  - load_model()     - generate()                │
//! │  - generate_stream() - status() / info()        │
//! │  - RequestCorrelator (pending request table)    │
//! └───────────────────────┬─────────────────────────┘
//!                         │ JSON frames, keyed by requestId
//!                         ▼
//! ┌─────────────────────────────────────────────────┐
//! │        WorkerService (dedicated thread)         │
//! │  - InferenceSession (single-flight load)        │
//! │  - ModelRuntime built inside the thread         │
//! └─────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! let facade = SessionFacade::new(AnchorConfig::load()?, factory)?;
//! facade.load_model(None, None).await?;
//!
//! let mut stream = facade.generate_stream("hello", None)?;
//! while let Some(event) = stream.next().await {
//!     match event? {
//!         GenerationEvent::Fragment(text) => print!("{}", text),
//!         GenerationEvent::Complete(_) => println!(),
//!     }
//! }
//!
//! facade.shutdown();
//! ```
//!
//! # Thread Model
//!
//! The worker owns the session and the runtime on its own thread with a
//! single-threaded tokio runtime. Nothing is shared with the host; every
//! value crosses the boundary as an encoded frame.

mod channel;
pub mod correlator;
pub mod envelope;
mod facade;
mod response;
pub mod session;
mod worker;

pub use correlator::{FragmentCallback, ProgressCallback, RequestCorrelator, RequestKind};
pub use envelope::{HostEnvelope, InfoSnapshot, RequestId, StatusSnapshot, WorkerEnvelope};
pub use facade::{SessionFacade, SessionFacadeBuilder};
pub use response::{GenerationEvent, GenerationStream};
pub use session::{InferenceSession, SessionMetadata, SessionStatus};
