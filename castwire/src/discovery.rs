//! Frames exchanged with the discovery/protocol process.
//!
//! The discovery side owns the sockets: it finds receivers on the local
//! network, opens device channels on demand and relays receiver and
//! media status. The orchestrator never sees a socket, only these
//! frames.

use serde::{Deserialize, Serialize};

use crate::DeviceId;
use crate::media::MediaStatusMessage;
use crate::receiver::ReceiverStatusMessage;

/// Bitset of hardware capabilities advertised by a receiver.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceCapabilities(pub u32);

impl DeviceCapabilities {
    pub const VIDEO_OUT: u32 = 1 << 0;
    pub const VIDEO_IN: u32 = 1 << 1;
    pub const AUDIO_OUT: u32 = 1 << 2;
    pub const AUDIO_IN: u32 = 1 << 3;
    pub const DEV_MODE: u32 = 1 << 4;

    const NAMED: &'static [(u32, &'static str)] = &[
        (Self::VIDEO_OUT, "video_out"),
        (Self::VIDEO_IN, "video_in"),
        (Self::AUDIO_OUT, "audio_out"),
        (Self::AUDIO_IN, "audio_in"),
        (Self::DEV_MODE, "dev_mode"),
    ];

    pub fn contains(self, bit: u32) -> bool {
        self.0 & bit != 0
    }

    /// True when every bit of `required` is set.
    pub fn satisfies(self, required: DeviceCapabilities) -> bool {
        self.0 & required.0 == required.0
    }

    /// Names of the known bits that are set. Unknown bits are ignored.
    pub fn names(self) -> Vec<&'static str> {
        Self::NAMED
            .iter()
            .filter(|(bit, _)| self.contains(*bit))
            .map(|(_, name)| *name)
            .collect()
    }
}

/// Description of one discovered receiver.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceDescriptor {
    pub id: DeviceId,
    pub friendly_name: String,
    #[serde(default)]
    pub capabilities: DeviceCapabilities,
}

/// Frames the discovery process sends to the orchestrator.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum DiscoveryEvent {
    /// A receiver appeared, or an already-known one re-announced itself.
    DeviceUp { device: DeviceDescriptor },
    /// A receiver expired or explicitly said goodbye.
    DeviceDown { device_id: DeviceId },
    /// Receiver-channel status relayed from an open device connection.
    DeviceStatus {
        device_id: DeviceId,
        status: ReceiverStatusMessage,
    },
    /// Media-channel status relayed from an open device connection.
    DeviceMediaStatus {
        device_id: DeviceId,
        status: MediaStatusMessage,
    },
    /// The device connection dropped. Every request in flight on it is lost.
    DeviceConnectionClosed { device_id: DeviceId },
}

/// Frames the orchestrator sends to the discovery process.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum DiscoveryCommand {
    /// Begin (or resume) scanning. `watch_status` asks the backend to keep
    /// device connections open and relay status frames as they arrive.
    StartDiscovery { watch_status: bool },
    /// Stop scanning. Known devices stay valid until reported down.
    StopDiscovery,
    /// Ask the receiver to launch an application.
    CreateSession { device_id: DeviceId, app_id: String },
    /// Stop whatever application the backend tracks on the device. Used
    /// when the orchestrator has no receiver channel of its own to send
    /// a targeted stop on.
    StopApp { device_id: DeviceId },
    /// Forward a raw frame on the device's receiver channel.
    SendDeviceMessage {
        device_id: DeviceId,
        message: serde_json::Value,
    },
    /// Forward a raw frame on the device's media channel.
    SendMediaMessage {
        device_id: DeviceId,
        message: serde_json::Value,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{decode_frame, encode_frame};

    #[test]
    fn test_capability_names_skip_unknown_bits() {
        let caps =
            DeviceCapabilities(DeviceCapabilities::VIDEO_OUT | DeviceCapabilities::AUDIO_OUT | (1 << 14));
        assert_eq!(caps.names(), vec!["video_out", "audio_out"]);
    }

    #[test]
    fn test_capability_satisfies_requires_all_bits() {
        let caps = DeviceCapabilities(DeviceCapabilities::VIDEO_OUT | DeviceCapabilities::AUDIO_OUT);
        assert!(caps.satisfies(DeviceCapabilities(DeviceCapabilities::AUDIO_OUT)));
        assert!(!caps.satisfies(DeviceCapabilities(
            DeviceCapabilities::AUDIO_OUT | DeviceCapabilities::AUDIO_IN
        )));
    }

    #[test]
    fn test_device_up_frame_shape() {
        let raw = r#"{"type":"deviceUp","device":{"id":"d1","friendlyName":"Salon","capabilities":5}}"#;
        let event: DiscoveryEvent = decode_frame(raw).unwrap();
        match event {
            DiscoveryEvent::DeviceUp { device } => {
                assert_eq!(device.id.as_str(), "d1");
                assert_eq!(device.friendly_name, "Salon");
                assert!(device.capabilities.contains(DeviceCapabilities::VIDEO_OUT));
                assert!(device.capabilities.contains(DeviceCapabilities::AUDIO_OUT));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_create_session_frame_is_camel_case() {
        let cmd = DiscoveryCommand::CreateSession {
            device_id: DeviceId::new("d1"),
            app_id: "CC1AD845".to_string(),
        };
        let raw = encode_frame(&cmd).unwrap();
        assert_eq!(
            raw,
            r#"{"type":"createSession","deviceId":"d1","appId":"CC1AD845"}"#
        );
    }
}
