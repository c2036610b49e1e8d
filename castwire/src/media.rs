//! Media-channel status payloads.
//!
//! `MEDIA_STATUS` frames are deltas: a field the receiver omits is
//! unchanged, not cleared. The one place this matters most is `items`,
//! where an absent list means "queue unchanged" and an empty list means
//! "queue is now empty". The model keeps that distinction with
//! `Option<Vec<_>>`.

use serde::{Deserialize, Serialize};

use crate::receiver::ReceiverVolume;

/// Player state as reported on the media channel.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlayerState {
    #[default]
    Idle,
    Playing,
    Buffering,
    Paused,
}

/// Why the player went back to IDLE.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IdleReason {
    Cancelled,
    Interrupted,
    Finished,
    Error,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StreamType {
    #[default]
    None,
    Buffered,
    Live,
}

/// Bitset of media commands a stream currently supports.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MediaCommandFlags(pub u32);

impl MediaCommandFlags {
    pub const PAUSE: u32 = 1 << 0;
    pub const SEEK: u32 = 1 << 1;
    pub const STREAM_VOLUME: u32 = 1 << 2;
    pub const STREAM_MUTE: u32 = 1 << 3;
    pub const QUEUE_NEXT: u32 = 1 << 6;
    pub const QUEUE_PREV: u32 = 1 << 7;

    const NAMED: &'static [(u32, &'static str)] = &[
        (Self::PAUSE, "pause"),
        (Self::SEEK, "seek"),
        (Self::STREAM_VOLUME, "stream_volume"),
        (Self::STREAM_MUTE, "stream_mute"),
        (Self::QUEUE_NEXT, "queue_next"),
        (Self::QUEUE_PREV, "queue_prev"),
    ];

    pub fn contains(self, bit: u32) -> bool {
        self.0 & bit != 0
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

/// What is loaded in the player.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaInformation {
    pub content_id: String,
    #[serde(default)]
    pub content_type: String,
    #[serde(default)]
    pub stream_type: StreamType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    /// Opaque metadata blob, forwarded to clients untouched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// One entry of the receiver-side playback queue.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueItem {
    pub item_id: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media: Option<MediaInformation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub autoplay: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<f64>,
}

fn default_playback_rate() -> f64 {
    1.0
}

fn is_default_rate(rate: &f64) -> bool {
    *rate == 1.0
}

/// One media session's status, as carried in a `MEDIA_STATUS` frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaStatus {
    pub media_session_id: i32,
    #[serde(default)]
    pub player_state: PlayerState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle_reason: Option<IdleReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_time: Option<f64>,
    #[serde(default = "default_playback_rate", skip_serializing_if = "is_default_rate")]
    pub playback_rate: f64,
    #[serde(default)]
    pub supported_media_commands: MediaCommandFlags,
    /// Stream volume, distinct from the device volume.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<ReceiverVolume>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media: Option<MediaInformation>,
    /// Absent: queue unchanged. Present but empty: queue cleared.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<Vec<QueueItem>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_item_id: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loading_item_id: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repeat_mode: Option<String>,
    /// Extension fields some receivers add, forwarded untouched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extended_status: Option<serde_json::Value>,
}

impl MediaStatus {
    pub fn new(media_session_id: i32) -> Self {
        MediaStatus {
            media_session_id,
            player_state: PlayerState::default(),
            idle_reason: None,
            current_time: None,
            playback_rate: 1.0,
            supported_media_commands: MediaCommandFlags::default(),
            volume: None,
            media: None,
            items: None,
            current_item_id: None,
            loading_item_id: None,
            repeat_mode: None,
            extended_status: None,
        }
    }
}

/// Envelope of a media-channel status frame. `status` lists zero or more
/// media sessions; receivers usually report exactly one.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaStatusMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<u32>,
    #[serde(default)]
    pub status: Vec<MediaStatus>,
}
