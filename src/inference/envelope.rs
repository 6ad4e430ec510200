//! Envelope protocol for the host/worker boundary.
//!
//! Envelopes are closed enums, exhaustively matched on both sides. Each one is
//! serialized with `serde_json` into a [`Bytes`] frame before it crosses the
//! boundary, so nothing but copied data ever reaches the other side.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::SessionError;
use crate::runtime::{Backend, ChatInput, GenerationOptions, PrecisionProfile};

use super::session::SessionMetadata;

/// Host-assigned correlation key, unique per call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Host to worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum HostEnvelope {
    Load {
        request_id: RequestId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model_id: Option<String>,
    },
    Generate {
        request_id: RequestId,
        input: ChatInput,
        options: GenerationOptions,
        /// Only set when the caller registered a fragment sink.
        stream: bool,
    },
    GetStatus {
        request_id: RequestId,
    },
    GetInfo {
        request_id: RequestId,
    },
    Unload {
        request_id: RequestId,
    },
    /// Stop the worker loop.
    Shutdown,
}

/// Worker to host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum WorkerEnvelope {
    /// Bring-up finished; always the first frame on a healthy lane.
    Ready,
    /// Worker-level failure. Every pending request is affected.
    Fault {
        message: String,
    },
    /// Progress of the in-flight load. Not correlated.
    LoadProgress {
        percent: u8,
    },
    LoadComplete {
        request_id: RequestId,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        backend: Option<Backend>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        precision_profile: Option<PrecisionProfile>,
        #[serde(rename = "sizeMB", default, skip_serializing_if = "Option::is_none")]
        size_mb: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_message: Option<String>,
    },
    Fragment {
        request_id: RequestId,
        fragment_text: String,
        accumulated_text: String,
    },
    GenerateComplete {
        request_id: RequestId,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_message: Option<String>,
    },
    Status {
        request_id: RequestId,
        snapshot: StatusSnapshot,
    },
    Info {
        request_id: RequestId,
        snapshot: InfoSnapshot,
    },
    UnloadComplete {
        request_id: RequestId,
    },
}

impl WorkerEnvelope {
    /// Build a `loadComplete` envelope from a load outcome.
    pub fn load_complete(request_id: RequestId, outcome: &Result<SessionMetadata, String>) -> Self {
        match outcome {
            Ok(meta) => WorkerEnvelope::LoadComplete {
                request_id,
                success: true,
                session_id: Some(meta.session_id.clone()),
                backend: Some(meta.backend),
                precision_profile: Some(meta.precision_profile),
                size_mb: Some(meta.size_mb),
                error_message: None,
            },
            Err(message) => WorkerEnvelope::LoadComplete {
                request_id,
                success: false,
                session_id: None,
                backend: None,
                precision_profile: None,
                size_mb: None,
                error_message: Some(message.clone()),
            },
        }
    }

    /// Build a `generateComplete` envelope from a generation outcome.
    pub fn generate_complete(request_id: RequestId, outcome: Result<String, String>) -> Self {
        match outcome {
            Ok(text) => WorkerEnvelope::GenerateComplete {
                request_id,
                success: true,
                text: Some(text),
                error_message: None,
            },
            Err(message) => WorkerEnvelope::GenerateComplete {
                request_id,
                success: false,
                text: None,
                error_message: Some(message),
            },
        }
    }

    /// Correlation key, if this envelope answers a specific request.
    pub fn request_id(&self) -> Option<RequestId> {
        match self {
            WorkerEnvelope::LoadComplete { request_id, .. }
            | WorkerEnvelope::Fragment { request_id, .. }
            | WorkerEnvelope::GenerateComplete { request_id, .. }
            | WorkerEnvelope::Status { request_id, .. }
            | WorkerEnvelope::Info { request_id, .. }
            | WorkerEnvelope::UnloadComplete { request_id } => Some(*request_id),
            WorkerEnvelope::Ready
            | WorkerEnvelope::Fault { .. }
            | WorkerEnvelope::LoadProgress { .. } => None,
        }
    }
}

/// Read-only status snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub loaded: bool,
    pub session_id: Option<String>,
    pub loading: bool,
}

/// Read-only session info snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InfoSnapshot {
    pub session_id: Option<String>,
    pub backend: Option<Backend>,
    pub precision_profile: Option<PrecisionProfile>,
    #[serde(rename = "approximateSizeMB")]
    pub approximate_size_mb: u32,
    pub loaded: bool,
    pub loading: bool,
    /// Error of the last failed load, until the next load or unload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Encode an envelope into a frame.
pub fn encode<T: Serialize>(envelope: &T) -> Result<Bytes, SessionError> {
    serde_json::to_vec(envelope)
        .map(Bytes::from)
        .map_err(|e| SessionError::channel(format!("failed to encode envelope: {}", e)))
}

/// Decode a frame into an envelope.
pub fn decode<T: DeserializeOwned>(frame: &[u8]) -> Result<T, SessionError> {
    serde_json::from_slice(frame)
        .map_err(|e| SessionError::channel(format!("failed to decode envelope: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_type_tags() {
        let frame = encode(&HostEnvelope::GetStatus { request_id: RequestId(7) }).expect("test: encode");
        let value: serde_json::Value = serde_json::from_slice(&frame).expect("test: json");
        assert_eq!(value, json!({"type": "getStatus", "requestId": 7}));

        let frame = encode(&WorkerEnvelope::Fragment {
            request_id: RequestId(3),
            fragment_text: "b".into(),
            accumulated_text: "ab".into(),
        })
        .expect("test: encode");
        let value: serde_json::Value = serde_json::from_slice(&frame).expect("test: json");
        assert_eq!(
            value,
            json!({"type": "fragment", "requestId": 3, "fragmentText": "b", "accumulatedText": "ab"})
        );
    }

    #[test]
    fn test_load_complete_wire_fields() {
        let meta = SessionMetadata {
            session_id: "m".into(),
            backend: Backend::Cpu,
            precision_profile: PrecisionProfile::Int8,
            size_mb: 500,
        };
        let envelope = WorkerEnvelope::load_complete(RequestId(1), &Ok(meta));
        let value = serde_json::to_value(&envelope).expect("test: json");
        assert_eq!(value["type"], "loadComplete");
        assert_eq!(value["precisionProfile"], "int8");
        assert_eq!(value["sizeMB"], 500);
        assert!(value.get("errorMessage").is_none());
    }

    #[test]
    fn test_load_without_model_id_decodes() {
        let envelope: HostEnvelope =
            decode(br#"{"type":"load","requestId":2}"#).expect("test: decode");
        assert_eq!(
            envelope,
            HostEnvelope::Load { request_id: RequestId(2), model_id: None }
        );
    }

    #[test]
    fn test_undecodable_frame_is_channel_error() {
        let result: Result<WorkerEnvelope, _> = decode(b"{\"type\":\"nope\"}");
        assert!(matches!(result, Err(SessionError::Channel(_))));
    }

    #[test]
    fn test_request_id_only_on_correlated_envelopes() {
        assert_eq!(WorkerEnvelope::Ready.request_id(), None);
        assert_eq!(WorkerEnvelope::LoadProgress { percent: 40 }.request_id(), None);
        assert_eq!(
            WorkerEnvelope::UnloadComplete { request_id: RequestId(9) }.request_id(),
            Some(RequestId(9))
        );
    }
}
