//! Merges partial media status frames into a consistent local model.
//!
//! Receivers push deltas, not snapshots. The rules here decide what an
//! omitted field means: most fields keep their last value, `idle_reason`
//! and `extended_status` clear, the queue only changes when the frame
//! says something about it. Positions are extrapolated between frames
//! from the last reported time and the playback rate.

use std::collections::BTreeMap;
use std::time::Instant;

use tracing::debug;

use castwire::{
    IdleReason, MediaCommandFlags, MediaInformation, MediaStatus, MediaStatusMessage, PlayerState,
    QueueItem, ReceiverVolume,
};

/// Merged state of one receiver-side media session.
#[derive(Clone, Debug)]
pub struct MediaSession {
    pub media_session_id: i32,
    pub player_state: PlayerState,
    pub idle_reason: Option<IdleReason>,
    pub current_time: Option<f64>,
    pub playback_rate: f64,
    pub supported_media_commands: MediaCommandFlags,
    pub volume: ReceiverVolume,
    pub media: Option<MediaInformation>,
    pub items: Vec<QueueItem>,
    pub current_item_id: Option<i32>,
    pub loading_item_id: Option<i32>,
    pub repeat_mode: Option<String>,
    pub extended_status: Option<serde_json::Value>,
    position_updated_at: Option<Instant>,
}

impl MediaSession {
    fn new(media_session_id: i32) -> Self {
        MediaSession {
            media_session_id,
            player_state: PlayerState::Idle,
            idle_reason: None,
            current_time: None,
            playback_rate: 1.0,
            supported_media_commands: MediaCommandFlags::default(),
            volume: ReceiverVolume::default(),
            media: None,
            items: Vec::new(),
            current_item_id: None,
            loading_item_id: None,
            repeat_mode: None,
            extended_status: None,
            position_updated_at: None,
        }
    }

    /// Commands the stream supports, as capability names.
    pub fn supported_commands(&self) -> Vec<&'static str> {
        self.supported_media_commands.names()
    }

    /// Playback position extrapolated from the last reported time.
    /// Advances only while playing, clamped to `[0, duration]`.
    pub fn estimated_position(&self, now: Instant) -> Option<f64> {
        let base = self.current_time?;
        let mut position = base;
        if self.player_state == PlayerState::Playing {
            if let Some(at) = self.position_updated_at {
                position += self.playback_rate * now.saturating_duration_since(at).as_secs_f64();
            }
        }
        position = position.max(0.0);
        if let Some(duration) = self.media.as_ref().and_then(|m| m.duration) {
            position = position.min(duration);
        }
        Some(position)
    }

    /// Full merged view, for fanning out to attached instances.
    pub fn snapshot(&self) -> MediaStatus {
        MediaStatus {
            media_session_id: self.media_session_id,
            player_state: self.player_state,
            idle_reason: self.idle_reason,
            current_time: self.current_time,
            playback_rate: self.playback_rate,
            supported_media_commands: self.supported_media_commands,
            volume: (self.volume != ReceiverVolume::default()).then(|| self.volume.clone()),
            media: self.media.clone(),
            items: Some(self.items.clone()),
            current_item_id: self.current_item_id,
            loading_item_id: self.loading_item_id,
            repeat_mode: self.repeat_mode.clone(),
            extended_status: self.extended_status.clone(),
        }
    }

    fn apply(&mut self, status: &MediaStatus, now: Instant) {
        self.player_state = status.player_state;
        self.playback_rate = status.playback_rate;
        self.supported_media_commands = status.supported_media_commands;
        // these two clear when the frame omits them, stale values lie
        self.idle_reason = status.idle_reason;
        self.extended_status = status.extended_status.clone();
        // the loading item is transient, it mirrors the frame
        self.loading_item_id = status.loading_item_id;

        if let Some(time) = status.current_time {
            self.current_time = Some(time);
            self.position_updated_at = Some(now);
        }
        if let Some(volume) = &status.volume {
            self.volume.merge_from(volume);
        }
        if let Some(media) = &status.media {
            self.media = Some(media.clone());
        }
        if let Some(id) = status.current_item_id {
            self.current_item_id = Some(id);
        }
        if let Some(mode) = &status.repeat_mode {
            self.repeat_mode = Some(mode.clone());
        }

        self.reconcile_queue(status);
    }

    /// The queue rules: an idle player with nothing loading has no
    /// queue; otherwise an absent `items` leaves it alone, a present
    /// one replaces it, with media info backfilled from what we already
    /// know so minor updates need not repeat full metadata.
    fn reconcile_queue(&mut self, status: &MediaStatus) {
        if status.player_state == PlayerState::Idle && status.loading_item_id.is_none() {
            if !self.items.is_empty() {
                debug!(
                    "Media session {} idle, dropping {} queue items",
                    self.media_session_id,
                    self.items.len()
                );
            }
            self.items.clear();
            self.current_item_id = None;
            return;
        }
        let Some(incoming) = &status.items else {
            return;
        };
        self.items = incoming
            .iter()
            .map(|item| {
                let mut item = item.clone();
                if item.media.is_none() {
                    item.media = self.backfill_media(item.item_id);
                }
                item
            })
            .collect();
    }

    fn backfill_media(&self, item_id: i32) -> Option<MediaInformation> {
        if let Some(known) = self
            .items
            .iter()
            .find(|old| old.item_id == item_id)
            .and_then(|old| old.media.clone())
        {
            return Some(known);
        }
        if self.current_item_id == Some(item_id) {
            return self.media.clone();
        }
        None
    }
}

/// All media sessions of one cast session, keyed by receiver id.
#[derive(Debug, Default)]
pub struct MediaTable {
    sessions: BTreeMap<i32, MediaSession>,
}

impl MediaTable {
    pub fn new() -> Self {
        MediaTable::default()
    }

    /// Apply every status row of a frame, creating rows for ids seen
    /// for the first time. Returns the ids that were touched.
    pub fn apply_message(&mut self, message: &MediaStatusMessage, now: Instant) -> Vec<i32> {
        message
            .status
            .iter()
            .map(|status| {
                let row = self
                    .sessions
                    .entry(status.media_session_id)
                    .or_insert_with(|| {
                        debug!("New media session {}", status.media_session_id);
                        MediaSession::new(status.media_session_id)
                    });
                row.apply(status, now);
                status.media_session_id
            })
            .collect()
    }

    pub fn get(&self, media_session_id: i32) -> Option<&MediaSession> {
        self.sessions.get(&media_session_id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn playing(media_session_id: i32) -> MediaStatus {
        MediaStatus {
            player_state: PlayerState::Playing,
            ..MediaStatus::new(media_session_id)
        }
    }

    fn message(status: Vec<MediaStatus>) -> MediaStatusMessage {
        MediaStatusMessage {
            request_id: None,
            status,
        }
    }

    fn item(item_id: i32, content_id: Option<&str>) -> QueueItem {
        QueueItem {
            item_id,
            media: content_id.map(|id| MediaInformation {
                content_id: id.to_string(),
                ..Default::default()
            }),
            autoplay: None,
            start_time: None,
        }
    }

    #[test]
    fn test_fields_absent_from_a_frame_stay_untouched() {
        let mut table = MediaTable::new();
        let now = Instant::now();

        let mut first = playing(1);
        first.current_time = Some(30.0);
        table.apply_message(&message(vec![first]), now);

        let mut second = playing(1);
        second.volume = Some(ReceiverVolume {
            level: None,
            muted: Some(true),
        });
        table.apply_message(&message(vec![second]), now);

        let media = table.get(1).unwrap();
        assert_eq!(media.current_time, Some(30.0));
        assert_eq!(media.volume.muted, Some(true));
    }

    #[test]
    fn test_supported_commands_expand_to_names() {
        let mut table = MediaTable::new();
        let mut status = playing(1);
        status.supported_media_commands =
            MediaCommandFlags(MediaCommandFlags::PAUSE | MediaCommandFlags::SEEK);
        table.apply_message(&message(vec![status]), Instant::now());
        assert_eq!(
            table.get(1).unwrap().supported_commands(),
            vec!["pause", "seek"]
        );
    }

    #[test]
    fn test_idle_reason_clears_when_absent() {
        let mut table = MediaTable::new();
        let now = Instant::now();

        let mut idle = MediaStatus::new(1);
        idle.idle_reason = Some(IdleReason::Interrupted);
        idle.loading_item_id = Some(5);
        table.apply_message(&message(vec![idle]), now);
        assert_eq!(table.get(1).unwrap().idle_reason, Some(IdleReason::Interrupted));

        table.apply_message(&message(vec![playing(1)]), now);
        assert_eq!(table.get(1).unwrap().idle_reason, None);
    }

    #[test]
    fn test_absent_items_keep_queue_but_empty_items_clear_it() {
        let mut table = MediaTable::new();
        let now = Instant::now();

        let mut with_queue = playing(1);
        with_queue.items = Some(vec![item(10, Some("a")), item(11, Some("b"))]);
        table.apply_message(&message(vec![with_queue]), now);
        assert_eq!(table.get(1).unwrap().items.len(), 2);

        table.apply_message(&message(vec![playing(1)]), now);
        assert_eq!(table.get(1).unwrap().items.len(), 2);

        let mut cleared = playing(1);
        cleared.items = Some(Vec::new());
        table.apply_message(&message(vec![cleared]), now);
        assert!(table.get(1).unwrap().items.is_empty());
    }

    #[test]
    fn test_idle_with_nothing_loading_drops_the_queue() {
        let mut table = MediaTable::new();
        let now = Instant::now();

        let mut with_queue = playing(1);
        with_queue.items = Some(vec![item(10, Some("a"))]);
        with_queue.current_item_id = Some(10);
        table.apply_message(&message(vec![with_queue]), now);

        let mut finished = MediaStatus::new(1);
        finished.idle_reason = Some(IdleReason::Finished);
        table.apply_message(&message(vec![finished]), now);

        let media = table.get(1).unwrap();
        assert!(media.items.is_empty());
        assert_eq!(media.current_item_id, None);
    }

    #[test]
    fn test_idle_while_loading_keeps_the_queue() {
        let mut table = MediaTable::new();
        let now = Instant::now();

        let mut with_queue = playing(1);
        with_queue.items = Some(vec![item(10, Some("a")), item(11, Some("b"))]);
        table.apply_message(&message(vec![with_queue]), now);

        let mut loading = MediaStatus::new(1);
        loading.loading_item_id = Some(11);
        table.apply_message(&message(vec![loading]), now);

        assert_eq!(table.get(1).unwrap().items.len(), 2);
    }

    #[test]
    fn test_queue_backfills_media_from_known_items() {
        let mut table = MediaTable::new();
        let now = Instant::now();

        let mut with_queue = playing(1);
        with_queue.items = Some(vec![item(10, Some("a")), item(11, Some("b"))]);
        table.apply_message(&message(vec![with_queue]), now);

        let mut terse = playing(1);
        terse.items = Some(vec![item(10, None), item(11, None), item(12, Some("c"))]);
        table.apply_message(&message(vec![terse]), now);

        let items = &table.get(1).unwrap().items;
        assert_eq!(items[0].media.as_ref().unwrap().content_id, "a");
        assert_eq!(items[1].media.as_ref().unwrap().content_id, "b");
        assert_eq!(items[2].media.as_ref().unwrap().content_id, "c");
    }

    #[test]
    fn test_queue_backfills_current_item_from_session_media() {
        let mut table = MediaTable::new();
        let now = Instant::now();

        let mut first = playing(1);
        first.media = Some(MediaInformation {
            content_id: "primary".to_string(),
            ..Default::default()
        });
        first.current_item_id = Some(42);
        table.apply_message(&message(vec![first]), now);

        let mut update = playing(1);
        update.items = Some(vec![item(42, None)]);
        table.apply_message(&message(vec![update]), now);

        let items = &table.get(1).unwrap().items;
        assert_eq!(items[0].media.as_ref().unwrap().content_id, "primary");
    }

    #[test]
    fn test_position_extrapolates_only_while_playing() {
        let mut table = MediaTable::new();
        let start = Instant::now();

        let mut status = playing(1);
        status.current_time = Some(10.0);
        status.media = Some(MediaInformation {
            content_id: "x".to_string(),
            duration: Some(100.0),
            ..Default::default()
        });
        table.apply_message(&message(vec![status]), start);

        let later = start + Duration::from_secs(5);
        let pos = table.get(1).unwrap().estimated_position(later).unwrap();
        assert!((pos - 15.0).abs() < 0.01, "got {pos}");

        let mut paused = playing(1);
        paused.player_state = PlayerState::Paused;
        paused.current_time = Some(20.0);
        table.apply_message(&message(vec![paused]), later);
        let much_later = later + Duration::from_secs(60);
        let pos = table.get(1).unwrap().estimated_position(much_later).unwrap();
        assert!((pos - 20.0).abs() < f64::EPSILON, "got {pos}");
    }

    #[test]
    fn test_position_clamps_to_duration() {
        let mut table = MediaTable::new();
        let start = Instant::now();

        let mut status = playing(1);
        status.current_time = Some(95.0);
        status.playback_rate = 2.0;
        status.media = Some(MediaInformation {
            content_id: "x".to_string(),
            duration: Some(100.0),
            ..Default::default()
        });
        table.apply_message(&message(vec![status]), start);

        let later = start + Duration::from_secs(30);
        let pos = table.get(1).unwrap().estimated_position(later).unwrap();
        assert!((pos - 100.0).abs() < f64::EPSILON, "got {pos}");
    }

    #[test]
    fn test_rows_are_created_per_media_session_id() {
        let mut table = MediaTable::new();
        let now = Instant::now();
        let touched = table.apply_message(&message(vec![playing(1), playing(2)]), now);
        assert_eq!(touched, vec![1, 2]);
        assert_eq!(table.len(), 2);
        table.apply_message(&message(vec![playing(1)]), now);
        assert_eq!(table.len(), 2);
    }
}
