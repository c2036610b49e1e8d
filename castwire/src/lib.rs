//! Wire-level types for the cast orchestration service.
//!
//! This crate defines the frames exchanged on the two boundaries of the
//! orchestrator: the discovery/protocol process on one side (device
//! announcements, receiver and media status, outbound device commands)
//! and API clients on the other (page SDK instances and the trusted
//! device selector UI). All frames are serde models of line-delimited
//! JSON objects tagged by a `type` field, so an embedder can decode a
//! frame with [`decode_frame`] and route on the enum variant.
//!
//! The types here carry no behaviour beyond what the wire needs:
//! field-wise volume merging, capability and command bit decoding.
//! Everything stateful lives in the `castpoint` crate.

pub mod api;
pub mod discovery;
pub mod media;
pub mod receiver;
pub mod selector;

use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use thiserror::Error;

pub use api::{
    ApiConfig, ApiInbound, ApiOutbound, AutoJoinPolicy, ContentContext, ErrorCode,
    ReceiverActionKind, SessionDescriptor, SessionRequest,
};
pub use discovery::{DeviceCapabilities, DeviceDescriptor, DiscoveryCommand, DiscoveryEvent};
pub use media::{
    IdleReason, MediaCommandFlags, MediaInformation, MediaStatus, MediaStatusMessage, PlayerState,
    QueueItem, StreamType,
};
pub use receiver::{Application, Namespace, ReceiverStatus, ReceiverStatusMessage, ReceiverVolume};
pub use selector::{MediaTypeFlags, SelectorAppInfo, SelectorCommand, SelectorEvent};

/// Errors raised while encoding or decoding wire frames.
#[derive(Debug, Error)]
pub enum WireError {
    /// The frame was not valid JSON or did not match the expected shape.
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Stable identifier of a receiver device, unique within one discovery
/// backend. Treated as opaque by everything above the wire.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(pub String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        DeviceId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Decode one line-delimited JSON frame.
pub fn decode_frame<T: DeserializeOwned>(raw: &str) -> Result<T, WireError> {
    Ok(serde_json::from_str(raw)?)
}

/// Encode a frame as one line of JSON.
pub fn encode_frame<T: Serialize>(frame: &T) -> Result<String, WireError> {
    Ok(serde_json::to_string(frame)?)
}
