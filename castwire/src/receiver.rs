//! Receiver-channel status payloads.
//!
//! A receiver reports its state as a `RECEIVER_STATUS` message: the list
//! of running applications plus the device volume. Statuses can be
//! partial, a frame that omits a field says nothing about it, so the
//! volume type merges field by field instead of replacing wholesale.

use serde::{Deserialize, Serialize};

/// Device or stream volume. Both channels use the same shape.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiverVolume {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub muted: Option<bool>,
}

impl ReceiverVolume {
    /// Overlay `update` on `self`, keeping fields the update omits.
    pub fn merge_from(&mut self, update: &ReceiverVolume) {
        if let Some(level) = update.level {
            self.level = Some(level);
        }
        if let Some(muted) = update.muted {
            self.muted = Some(muted);
        }
    }
}

/// One protocol namespace an application listens on.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Namespace {
    pub name: String,
}

/// One application entry in a receiver status.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Application {
    pub app_id: String,
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_text: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub namespaces: Vec<Namespace>,
}

impl Application {
    /// True when the application declares the given namespace.
    pub fn has_namespace(&self, name: &str) -> bool {
        self.namespaces.iter().any(|ns| ns.name == name)
    }
}

/// Snapshot of a receiver's state. Every field is optional on the wire.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiverStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub applications: Vec<Application>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<ReceiverVolume>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_active_input: Option<bool>,
}

impl ReceiverStatus {
    pub fn application(&self, session_id: &str) -> Option<&Application> {
        self.applications.iter().find(|a| a.session_id == session_id)
    }
}

/// Envelope of a receiver-channel status frame. `request_id` is present
/// when the frame answers a request, zero or absent on broadcasts.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiverStatusMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<u32>,
    #[serde(default)]
    pub status: ReceiverStatus,
}
