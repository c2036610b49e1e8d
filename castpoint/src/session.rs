//! Session lifecycle: one launched application on one device.
//!
//! A session is created speculatively when a cast starts, confirmed
//! when the device first reports the application, and removed when the
//! application closes, the device disappears, or the last member leaves
//! explicitly. A stopped session never comes back, a new cast makes a
//! new one. Each session owns the command channel to its device, which
//! is where the per-lane correlators live.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use castwire::{
    Application, AutoJoinPolicy, ContentContext, DeviceDescriptor, DeviceId, Namespace,
    ReceiverVolume, SessionDescriptor,
};

use crate::correlator::{Correlator, PendingAction};
use crate::media_sync::MediaTable;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionKey(pub u64);

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// Launch sent, no confirmation from the device yet.
    Pending,
    /// The device reported the application, `session_id` is set.
    Active,
    /// Terminal. Only seen on sessions already out of the table.
    Stopped,
}

/// Command channel to one device: a receiver lane and a media lane,
/// each with its own correlator. Ids are not unique across the lanes.
#[derive(Debug)]
pub struct DeviceChannel {
    pub device_id: DeviceId,
    pub receiver_lane: Correlator,
    pub media_lane: Correlator,
}

impl DeviceChannel {
    fn new(device_id: DeviceId, request_timeout: Duration) -> Self {
        DeviceChannel {
            device_id,
            receiver_lane: Correlator::new(request_timeout),
            media_lane: Correlator::new(request_timeout),
        }
    }

    /// The device channel dropped: both lanes fail everything.
    pub fn fail_all(&mut self) -> Vec<PendingAction> {
        let mut failed = self.receiver_lane.fail_all();
        failed.extend(self.media_lane.fail_all());
        failed
    }

    pub fn expire(&mut self, now: Instant) -> Vec<(u32, PendingAction)> {
        let mut expired = self.receiver_lane.expire(now);
        expired.extend(self.media_lane.expire(now));
        expired
    }

    pub fn pending_count(&self) -> usize {
        self.receiver_lane.pending_count() + self.media_lane.pending_count()
    }
}

#[derive(Debug)]
pub struct Session {
    pub key: SessionKey,
    pub app_id: String,
    pub state: SessionState,
    /// Receiver-assigned id, set on confirmation.
    pub session_id: Option<String>,
    pub transport_id: Option<String>,
    pub display_name: Option<String>,
    pub status_text: Option<String>,
    pub namespaces: Vec<Namespace>,
    pub receiver_volume: ReceiverVolume,
    /// Contexts of every member that ever attached, the candidate set
    /// auto-join matching scans.
    pub auto_join_contexts: HashSet<ContentContext>,
    pub channel: DeviceChannel,
    pub media: MediaTable,
    created_at: Instant,
}

impl Session {
    fn new(key: SessionKey, device_id: DeviceId, app_id: &str, request_timeout: Duration) -> Self {
        Session {
            key,
            app_id: app_id.to_string(),
            state: SessionState::Pending,
            session_id: None,
            transport_id: None,
            display_name: None,
            status_text: None,
            namespaces: Vec::new(),
            receiver_volume: ReceiverVolume::default(),
            auto_join_contexts: HashSet::new(),
            channel: DeviceChannel::new(device_id, request_timeout),
            media: MediaTable::new(),
            created_at: Instant::now(),
        }
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.channel.device_id
    }

    pub fn is_active(&self) -> bool {
        self.state == SessionState::Active
    }

    /// The device reported the launched application.
    pub fn confirm(&mut self, app: &Application) {
        self.session_id = Some(app.session_id.clone());
        self.apply_application(app);
        self.state = SessionState::Active;
    }

    /// Overlay a receiver-status application entry. Returns whether
    /// anything an instance can observe changed.
    pub fn apply_application(&mut self, app: &Application) -> bool {
        let mut changed = false;
        if self.transport_id != app.transport_id {
            self.transport_id = app.transport_id.clone();
            changed = true;
        }
        if self.display_name != app.display_name {
            self.display_name = app.display_name.clone();
            changed = true;
        }
        if self.status_text != app.status_text {
            self.status_text = app.status_text.clone();
            changed = true;
        }
        if self.namespaces != app.namespaces {
            self.namespaces = app.namespaces.clone();
            changed = true;
        }
        changed
    }

    /// Merge the device volume. Returns whether it changed.
    pub fn merge_volume(&mut self, volume: &ReceiverVolume) -> bool {
        let before = self.receiver_volume.clone();
        self.receiver_volume.merge_from(volume);
        before != self.receiver_volume
    }

    /// Instance-facing view. `None` until the session is confirmed.
    pub fn descriptor(&self, device: &DeviceDescriptor) -> Option<SessionDescriptor> {
        Some(SessionDescriptor {
            session_id: self.session_id.clone()?,
            app_id: self.app_id.clone(),
            device: device.clone(),
            transport_id: self.transport_id.clone(),
            display_name: self.display_name.clone(),
            status_text: self.status_text.clone(),
            namespaces: self.namespaces.clone(),
            receiver_volume: (self.receiver_volume != ReceiverVolume::default())
                .then(|| self.receiver_volume.clone()),
        })
    }

    pub fn launch_expired(&self, now: Instant, deadline: Duration) -> bool {
        self.state == SessionState::Pending && self.created_at + deadline <= now
    }
}

/// Does `candidate` get to silently join a session one of whose members
/// is `member`, under its own policy?
pub fn policy_matches(
    policy: AutoJoinPolicy,
    candidate: &ContentContext,
    member: &ContentContext,
) -> bool {
    match policy {
        AutoJoinPolicy::TabAndOriginScoped => {
            candidate.same_origin(member) && candidate.same_page(member)
        }
        AutoJoinPolicy::OriginScoped => candidate.same_origin(member),
        AutoJoinPolicy::PageScoped | AutoJoinPolicy::CustomControllerScoped => false,
    }
}

/// Every live session, indexed by internal key and, once confirmed, by
/// the receiver-assigned session id.
pub struct SessionTable {
    sessions: BTreeMap<SessionKey, Session>,
    by_session_id: HashMap<String, SessionKey>,
    next_key: u64,
}

impl SessionTable {
    pub fn new() -> Self {
        SessionTable {
            sessions: BTreeMap::new(),
            by_session_id: HashMap::new(),
            next_key: 1,
        }
    }

    pub fn create(
        &mut self,
        device_id: DeviceId,
        app_id: &str,
        request_timeout: Duration,
    ) -> SessionKey {
        let key = SessionKey(self.next_key);
        self.next_key += 1;
        debug!("Session {key} pending, app {app_id} on {device_id}");
        self.sessions
            .insert(key, Session::new(key, device_id, app_id, request_timeout));
        key
    }

    pub fn get(&self, key: SessionKey) -> Option<&Session> {
        self.sessions.get(&key)
    }

    pub fn get_mut(&mut self, key: SessionKey) -> Option<&mut Session> {
        self.sessions.get_mut(&key)
    }

    /// Remove a session. The returned value is in the terminal state.
    pub fn remove(&mut self, key: SessionKey) -> Option<Session> {
        let mut session = self.sessions.remove(&key)?;
        if let Some(session_id) = &session.session_id {
            self.by_session_id.remove(session_id);
        }
        session.state = SessionState::Stopped;
        Some(session)
    }

    pub fn find_by_session_id(&self, session_id: &str) -> Option<SessionKey> {
        self.by_session_id.get(session_id).copied()
    }

    /// Match a receiver-status application entry against the pending
    /// sessions on that device. The launch command carries no request
    /// id, the application id is the correlation. A session id confirms
    /// at most one session: an entry already in the index matches no
    /// further pending, which then runs out its launch deadline.
    pub fn confirm_pending(&mut self, device_id: &DeviceId, app: &Application) -> Option<SessionKey> {
        if self.by_session_id.contains_key(&app.session_id) {
            return None;
        }
        let key = self
            .sessions
            .values()
            .find(|s| {
                s.state == SessionState::Pending
                    && s.device_id() == device_id
                    && s.app_id == app.app_id
            })
            .map(|s| s.key)?;
        let session = self.sessions.get_mut(&key)?;
        session.confirm(app);
        self.by_session_id.insert(app.session_id.clone(), key);
        info!("Session {key} confirmed as {} on {device_id}", app.session_id);
        Some(key)
    }

    pub fn on_device(&self, device_id: &DeviceId) -> Vec<SessionKey> {
        self.sessions
            .values()
            .filter(|s| s.device_id() == device_id)
            .map(|s| s.key)
            .collect()
    }

    pub fn keys(&self) -> Vec<SessionKey> {
        self.sessions.keys().copied().collect()
    }

    /// First active session with this app id that one of the candidate
    /// policies' scoping rules lets the context join.
    pub fn find_auto_join_target(
        &self,
        app_id: &str,
        policy: AutoJoinPolicy,
        context: &ContentContext,
    ) -> Option<SessionKey> {
        if policy.never_joins() {
            return None;
        }
        self.sessions
            .values()
            .find(|s| {
                s.is_active()
                    && s.app_id == app_id
                    && s.auto_join_contexts
                        .iter()
                        .any(|member| policy_matches(policy, context, member))
            })
            .map(|s| s.key)
    }

    pub fn expired_pending(&self, now: Instant, deadline: Duration) -> Vec<SessionKey> {
        self.sessions
            .values()
            .filter(|s| s.launch_expired(now, deadline))
            .map(|s| s.key)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl Default for SessionTable {
    fn default() -> Self {
        SessionTable::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(30);

    fn application(app_id: &str, session_id: &str) -> Application {
        Application {
            app_id: app_id.to_string(),
            session_id: session_id.to_string(),
            transport_id: Some(format!("transport-{session_id}")),
            display_name: Some("Player".to_string()),
            status_text: None,
            namespaces: Vec::new(),
        }
    }

    fn context(tab_id: i32, frame_id: i32, origin: &str) -> ContentContext {
        ContentContext::new(tab_id, frame_id, Some(origin.to_string()))
    }

    #[test]
    fn test_pending_to_active() {
        let mut table = SessionTable::new();
        let device = DeviceId::new("d1");
        let key = table.create(device.clone(), "APP", TIMEOUT);
        assert_eq!(table.get(key).unwrap().state, SessionState::Pending);
        assert!(table.get(key).unwrap().session_id.is_none());

        let confirmed = table.confirm_pending(&device, &application("APP", "s-1"));
        assert_eq!(confirmed, Some(key));
        let session = table.get(key).unwrap();
        assert_eq!(session.state, SessionState::Active);
        assert_eq!(session.session_id.as_deref(), Some("s-1"));
        assert_eq!(table.find_by_session_id("s-1"), Some(key));
    }

    #[test]
    fn test_device_channel_fails_both_lanes() {
        let mut channel = DeviceChannel::new(DeviceId::new("d1"), TIMEOUT);
        channel.receiver_lane.register(PendingAction::InternalStatus);
        channel.media_lane.register(PendingAction::InternalStatus);
        assert_eq!(channel.pending_count(), 2);
        assert_eq!(channel.fail_all().len(), 2);
        assert_eq!(channel.pending_count(), 0);
    }

    #[test]
    fn test_confirm_ignores_other_apps_and_devices() {
        let mut table = SessionTable::new();
        let device = DeviceId::new("d1");
        table.create(device.clone(), "APP", TIMEOUT);

        assert!(table
            .confirm_pending(&device, &application("OTHER", "s-1"))
            .is_none());
        assert!(table
            .confirm_pending(&DeviceId::new("d2"), &application("APP", "s-1"))
            .is_none());
    }

    #[test]
    fn test_remove_is_terminal_and_unindexes() {
        let mut table = SessionTable::new();
        let device = DeviceId::new("d1");
        let key = table.create(device.clone(), "APP", TIMEOUT);
        table.confirm_pending(&device, &application("APP", "s-1"));

        let removed = table.remove(key).unwrap();
        assert_eq!(removed.state, SessionState::Stopped);
        assert!(table.find_by_session_id("s-1").is_none());
        assert!(table.get(key).is_none());
    }

    #[test]
    fn test_session_id_confirms_at_most_one_session() {
        let mut table = SessionTable::new();
        let device = DeviceId::new("d1");
        let first = table.create(device.clone(), "APP", TIMEOUT);
        let second = table.create(device.clone(), "APP", TIMEOUT);

        assert_eq!(
            table.confirm_pending(&device, &application("APP", "s-1")),
            Some(first)
        );
        // the next status report repeats the same entry
        assert!(table
            .confirm_pending(&device, &application("APP", "s-1"))
            .is_none());
        assert_eq!(table.get(second).unwrap().state, SessionState::Pending);
        assert_eq!(table.find_by_session_id("s-1"), Some(first));

        // a second launch confirms the second session under its own id
        assert_eq!(
            table.confirm_pending(&device, &application("APP", "s-2")),
            Some(second)
        );
        assert!(table.remove(first).is_some());
        assert!(table.find_by_session_id("s-1").is_none());
        assert_eq!(table.find_by_session_id("s-2"), Some(second));
    }

    #[test]
    fn test_auto_join_policy_scoping() {
        let mut table = SessionTable::new();
        let device = DeviceId::new("d1");
        let key = table.create(device.clone(), "APP", TIMEOUT);
        table.confirm_pending(&device, &application("APP", "s-1"));
        table
            .get_mut(key)
            .unwrap()
            .auto_join_contexts
            .insert(context(1, 0, "https://music.example"));

        let same = context(1, 0, "https://music.example");
        let other_frame = context(1, 7, "https://music.example");
        let other_tab = context(2, 0, "https://music.example");
        let other_origin = context(1, 0, "https://videos.example");

        let tab_scoped = AutoJoinPolicy::TabAndOriginScoped;
        assert_eq!(table.find_auto_join_target("APP", tab_scoped, &same), Some(key));
        assert_eq!(table.find_auto_join_target("APP", tab_scoped, &other_frame), None);
        assert_eq!(table.find_auto_join_target("APP", tab_scoped, &other_tab), None);

        let origin_scoped = AutoJoinPolicy::OriginScoped;
        assert_eq!(
            table.find_auto_join_target("APP", origin_scoped, &other_tab),
            Some(key)
        );
        assert_eq!(
            table.find_auto_join_target("APP", origin_scoped, &other_origin),
            None
        );

        assert_eq!(
            table.find_auto_join_target("APP", AutoJoinPolicy::PageScoped, &same),
            None
        );
        assert_eq!(table.find_auto_join_target("OTHER", tab_scoped, &same), None);
    }

    #[test]
    fn test_pending_sessions_are_not_auto_join_targets() {
        let mut table = SessionTable::new();
        let key = table.create(DeviceId::new("d1"), "APP", TIMEOUT);
        table
            .get_mut(key)
            .unwrap()
            .auto_join_contexts
            .insert(context(1, 0, "https://music.example"));
        assert_eq!(
            table.find_auto_join_target(
                "APP",
                AutoJoinPolicy::TabAndOriginScoped,
                &context(1, 0, "https://music.example")
            ),
            None
        );
    }

    #[test]
    fn test_launch_deadline_sweep() {
        let mut table = SessionTable::new();
        let device = DeviceId::new("d1");
        let pending = table.create(device.clone(), "APP", TIMEOUT);
        let confirmed = table.create(device.clone(), "OTHER", TIMEOUT);
        table.confirm_pending(&device, &application("OTHER", "s-2"));

        let deadline = Duration::from_secs(20);
        assert!(table.expired_pending(Instant::now(), deadline).is_empty());
        let later = Instant::now() + Duration::from_secs(21);
        assert_eq!(table.expired_pending(later, deadline), vec![pending]);
        assert!(table.get(confirmed).unwrap().is_active());
    }

    #[test]
    fn test_descriptor_needs_confirmation() {
        let mut table = SessionTable::new();
        let device = DeviceId::new("d1");
        let key = table.create(device.clone(), "APP", TIMEOUT);
        let descriptor = DeviceDescriptor {
            id: device.clone(),
            friendly_name: "Salon".to_string(),
            capabilities: Default::default(),
        };
        assert!(table.get(key).unwrap().descriptor(&descriptor).is_none());

        table.confirm_pending(&device, &application("APP", "s-1"));
        let view = table.get(key).unwrap().descriptor(&descriptor).unwrap();
        assert_eq!(view.session_id, "s-1");
        assert_eq!(view.transport_id.as_deref(), Some("transport-s-1"));
        assert_eq!(view.device.friendly_name, "Salon");
    }
}
