//! Frames exchanged with page-facing API instances.
//!
//! Each browser tab/frame that loads the cast SDK gets one instance
//! connection. The facade on the page side translates these frames to
//! and from the scripted API; the orchestrator only ever sees the typed
//! forms below. Passthrough command payloads stay raw JSON on purpose:
//! the orchestrator stamps request ids and routes them, it does not
//! interpret them.

use serde::{Deserialize, Serialize};

use crate::DeviceId;
use crate::discovery::{DeviceCapabilities, DeviceDescriptor};
use crate::media::MediaStatus;
use crate::receiver::{Namespace, ReceiverVolume};

/// Where a page-facing instance lives. Two instances never share a
/// `(tab_id, frame_id)` pair.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentContext {
    pub tab_id: i32,
    pub frame_id: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
}

impl ContentContext {
    pub fn new(tab_id: i32, frame_id: i32, origin: Option<String>) -> Self {
        ContentContext {
            tab_id,
            frame_id,
            origin,
        }
    }

    pub fn same_origin(&self, other: &ContentContext) -> bool {
        self.origin.is_some() && self.origin == other.origin
    }

    pub fn same_page(&self, other: &ContentContext) -> bool {
        self.tab_id == other.tab_id && self.frame_id == other.frame_id
    }
}

/// When a new instance may silently attach to an existing session.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutoJoinPolicy {
    /// Same origin and same tab+frame as an existing member.
    #[default]
    TabAndOriginScoped,
    /// Same origin as an existing member, any tab.
    OriginScoped,
    /// Never auto-join.
    PageScoped,
    /// Driven by a custom controller, never auto-join.
    CustomControllerScoped,
}

impl AutoJoinPolicy {
    pub fn never_joins(self) -> bool {
        matches!(
            self,
            AutoJoinPolicy::PageScoped | AutoJoinPolicy::CustomControllerScoped
        )
    }
}

/// What the page wants to cast.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRequest {
    pub app_id: String,
    /// Capabilities a receiver must advertise to be offered.
    #[serde(default)]
    pub capabilities: DeviceCapabilities,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

impl SessionRequest {
    pub fn new(app_id: impl Into<String>) -> Self {
        SessionRequest {
            app_id: app_id.into(),
            capabilities: DeviceCapabilities::default(),
            language: None,
        }
    }
}

/// Configuration an instance declares once, at SDK initialization.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiConfig {
    pub session_request: SessionRequest,
    #[serde(default)]
    pub auto_join_policy: AutoJoinPolicy,
}

/// Frames an instance sends to the orchestrator.
///
/// Untrusted instances are limited to the non-privileged subset; the
/// registry destroys them on anything else.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ApiInbound {
    /// Declare the api config. Triggers the one-shot auto-join scan.
    InitializeSdk { api_config: ApiConfig },
    /// Start a cast: auto-join if possible, otherwise prompt (or target
    /// `receiver_device_id` directly when given).
    RequestSession {
        session_request: SessionRequest,
        #[serde(default)]
        receiver_device_id: Option<DeviceId>,
    },
    /// Attach to a known session by its receiver-assigned id.
    RequestSessionById { session_id: String },
    /// Detach from the current session.
    LeaveSession,
    /// Application-namespace message, forwarded without correlation.
    AppMessage {
        namespace: String,
        message: serde_json::Value,
    },
    /// Raw media-channel command, correlated on the media lane.
    MediaCommand { payload: serde_json::Value },
    /// Raw receiver-channel command, correlated on the receiver lane.
    DeviceCommand { payload: serde_json::Value },
    /// Privileged: open the device selector outside any page flow.
    OpenSelection { session_request: SessionRequest },
    /// Privileged: stop whatever runs on a device.
    StopAppOnDevice { device_id: DeviceId },
}

impl ApiInbound {
    /// True for the subset ordinary page instances may send.
    pub fn allowed_untrusted(&self) -> bool {
        !matches!(
            self,
            ApiInbound::OpenSelection { .. } | ApiInbound::StopAppOnDevice { .. }
        )
    }

    /// Frame name as it appears in the `type` tag, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            ApiInbound::InitializeSdk { .. } => "initializeSdk",
            ApiInbound::RequestSession { .. } => "requestSession",
            ApiInbound::RequestSessionById { .. } => "requestSessionById",
            ApiInbound::LeaveSession => "leaveSession",
            ApiInbound::AppMessage { .. } => "appMessage",
            ApiInbound::MediaCommand { .. } => "mediaCommand",
            ApiInbound::DeviceCommand { .. } => "deviceCommand",
            ApiInbound::OpenSelection { .. } => "openSelection",
            ApiInbound::StopAppOnDevice { .. } => "stopAppOnDevice",
        }
    }
}

/// Error codes surfaced to the page facade.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    Cancel,
    Timeout,
    InvalidParameter,
    ReceiverUnavailable,
    SessionError,
    ChannelError,
    Forbidden,
}

/// What the user did with a receiver in the selector.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReceiverActionKind {
    Cast,
    Stop,
}

/// The session view an instance receives. Replayed in full on join so a
/// late member sees the same thing a founding member saw.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDescriptor {
    pub session_id: String,
    pub app_id: String,
    pub device: DeviceDescriptor,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_text: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub namespaces: Vec<Namespace>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver_volume: Option<ReceiverVolume>,
}

/// Frames the orchestrator sends to an instance.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ApiOutbound {
    /// Connection acknowledged; the instance is registered.
    InstanceCreated { instance_id: u64 },
    /// Edge-triggered: sent only when availability actually changes.
    ReceiverAvailabilityUpdated { is_available: bool },
    /// The instance is now attached to this session.
    SessionCreated { session: SessionDescriptor },
    /// Status of the attached session changed.
    SessionUpdated { session: SessionDescriptor },
    /// The attached session ended for everyone.
    SessionStopped { session_id: String },
    /// This instance detached; the session may live on for others.
    SessionLeft { session_id: String },
    /// Merged view of one media session after a status frame landed.
    MediaUpdated { status: MediaStatus },
    /// The user acted on a receiver in the selector.
    ReceiverAction {
        receiver: DeviceDescriptor,
        action: ReceiverActionKind,
    },
    /// Raw response to a passthrough command, ids already restored.
    CommandResponse { payload: serde_json::Value },
    Error {
        code: ErrorCode,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
    },
}
