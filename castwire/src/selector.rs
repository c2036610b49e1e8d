//! Frames exchanged with the device-selection UI.
//!
//! The selector is a modal surface: the orchestrator opens it with a
//! device snapshot, streams directory updates into it while it is open,
//! and waits for exactly one terminal event back.

use serde::{Deserialize, Serialize};

use crate::DeviceId;
use crate::discovery::DeviceDescriptor;

/// Bitset of cast modes the dialog can offer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MediaTypeFlags(pub u32);

impl MediaTypeFlags {
    /// Cast a receiver application.
    pub const APP: u32 = 1 << 0;
    /// Mirror the requesting tab.
    pub const TAB_MIRROR: u32 = 1 << 1;
    /// Mirror the whole desktop.
    pub const DESKTOP_MIRROR: u32 = 1 << 2;

    pub fn contains(self, bit: u32) -> bool {
        self.0 & bit != 0
    }

    pub fn with(self, bit: u32) -> Self {
        MediaTypeFlags(self.0 | bit)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

/// What the dialog shows about the requesting application.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectorAppInfo {
    pub app_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
}

/// Frames the orchestrator sends to the selection UI.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum SelectorCommand {
    Open {
        devices: Vec<DeviceDescriptor>,
        default_media_type: MediaTypeFlags,
        available_media_types: MediaTypeFlags,
        #[serde(default)]
        app_info: Option<SelectorAppInfo>,
    },
    /// Refresh the device list of the open dialog.
    Update { devices: Vec<DeviceDescriptor> },
    Close,
}

/// Frames the selection UI sends back. Exactly one of these is terminal
/// per open dialog; anything received with no dialog open is stale.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum SelectorEvent {
    /// The user picked a device and a cast mode.
    Selected {
        device_id: DeviceId,
        media_type: MediaTypeFlags,
    },
    /// The user asked to stop what is running on a device.
    Stopped { device_id: DeviceId },
    /// The dialog closed without a choice.
    Cancelled,
}
