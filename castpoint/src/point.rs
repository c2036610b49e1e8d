//! The orchestration state machine.
//!
//! `CastPoint` owns the device directory, the instance registry, the
//! session table and the selection coordinator, and advances them in
//! response to events. It never blocks and keeps no thread of its own;
//! the runtime feeds it from a single thread, so nothing in here needs
//! a lock.

use std::time::Instant;

use crossbeam_channel::Sender;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use castwire::{
    ApiConfig, ApiInbound, ApiOutbound, DeviceId, DiscoveryCommand, DiscoveryEvent, ErrorCode,
    MediaStatusMessage, MediaTypeFlags, ReceiverActionKind, ReceiverStatusMessage, SelectorCommand,
    SelectorEvent, SessionDescriptor, SessionRequest,
};

use crate::config::CastPointConfig;
use crate::correlator::{restore_request_id, set_request_id, take_request_id, PendingAction};
use crate::directory::DeviceDirectory;
use crate::errors::CastError;
use crate::instances::{Instance, InstanceHello, InstanceId, InstanceRegistry};
use crate::selector::{SelectionCoordinator, SelectionOutcome};
use crate::session::{SessionKey, SessionTable, policy_matches};

/// Which correlator a passthrough command rides on.
#[derive(Clone, Copy, Debug)]
enum Lane {
    Receiver,
    Media,
}

/// Why a session is being torn down. Only matters for sessions that
/// never confirmed: their members get an error instead of sessionStopped.
#[derive(Clone, Copy, Debug)]
enum StopReason {
    ApplicationClosed,
    DeviceGone,
    ChannelLost,
    LaunchTimedOut,
    Stopped,
    Dropped,
}

pub struct CastPoint {
    config: CastPointConfig,
    directory: DeviceDirectory,
    instances: InstanceRegistry,
    sessions: SessionTable,
    selector: SelectionCoordinator,
    discovery: Option<Sender<DiscoveryCommand>>,
}

impl CastPoint {
    pub fn new(config: CastPointConfig, selector_commands: Sender<SelectorCommand>) -> Self {
        CastPoint {
            config,
            directory: DeviceDirectory::new(),
            instances: InstanceRegistry::new(),
            sessions: SessionTable::new(),
            selector: SelectionCoordinator::new(selector_commands),
            discovery: None,
        }
    }

    pub fn directory(&self) -> &DeviceDirectory {
        &self.directory
    }

    pub fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    pub fn instances(&self) -> &InstanceRegistry {
        &self.instances
    }

    pub fn selection_open(&self) -> bool {
        self.selector.is_open()
    }

    pub fn has_discovery(&self) -> bool {
        self.discovery.is_some()
    }

    // ---- discovery side ----------------------------------------------

    /// A discovery connection is live. Scanning starts immediately.
    pub fn handle_discovery_up(&mut self, commands: Sender<DiscoveryCommand>) {
        info!("Discovery channel up, starting scan");
        self.discovery = Some(commands);
        self.send_discovery(DiscoveryCommand::StartDiscovery {
            watch_status: self.config.watch_device_status,
        });
    }

    /// The discovery connection dropped. Every session dies with it and
    /// the directory empties as if each device had said goodbye.
    pub fn handle_discovery_lost(&mut self) {
        warn!(
            "Discovery channel lost, dropping {} session(s) and {} device(s)",
            self.sessions.len(),
            self.directory.len()
        );
        self.discovery = None;
        for key in self.sessions.keys() {
            self.teardown_session(key, StopReason::ChannelLost);
        }
        self.directory.clear();
        self.after_directory_change();
    }

    pub fn handle_discovery_event(&mut self, event: DiscoveryEvent) {
        match event {
            DiscoveryEvent::DeviceUp { device } => {
                self.directory.apply_up(device);
                self.after_directory_change();
            }
            DiscoveryEvent::DeviceDown { device_id } => {
                for key in self.sessions.on_device(&device_id) {
                    self.teardown_session(key, StopReason::DeviceGone);
                }
                self.directory.apply_down(&device_id);
                self.after_directory_change();
            }
            DiscoveryEvent::DeviceStatus { device_id, status } => {
                self.on_device_status(device_id, status);
            }
            DiscoveryEvent::DeviceMediaStatus { device_id, status } => {
                self.on_device_media_status(device_id, status);
            }
            DiscoveryEvent::DeviceConnectionClosed { device_id } => {
                debug!("Connection to {device_id} closed");
                for key in self.sessions.on_device(&device_id) {
                    self.teardown_session(key, StopReason::ChannelLost);
                }
            }
        }
    }

    fn on_device_status(&mut self, device_id: DeviceId, message: ReceiverStatusMessage) {
        if let Some(request_id) = message.request_id.filter(|id| *id != 0) {
            if let Some((key, action)) = self.resolve_on_device(&device_id, Lane::Receiver, request_id) {
                debug!("Receiver request {request_id} answered on session {key}");
                let payload = serde_json::to_value(&message).unwrap_or(Value::Null);
                self.dispatch_resolved(action, payload);
            }
        }

        if self.directory.apply_status(&device_id, &message.status).is_none() {
            debug!("Status from unknown device {device_id}");
        }

        // A pending launch is confirmed by the first matching application
        // to show up on its device.
        for app in &message.status.applications {
            if let Some(key) = self.sessions.confirm_pending(&device_id, app) {
                self.on_session_confirmed(key);
            }
        }

        // Refresh confirmed sessions; one whose application vanished from
        // the report is over.
        let mut updated = Vec::new();
        let mut closed = Vec::new();
        for key in self.sessions.on_device(&device_id) {
            let Some(session) = self.sessions.get_mut(key) else {
                continue;
            };
            let Some(session_id) = session.session_id.clone() else {
                continue;
            };
            match message.status.application(&session_id) {
                Some(app) => {
                    let mut changed = session.apply_application(app);
                    if let Some(volume) = &message.status.volume {
                        changed |= session.merge_volume(volume);
                    }
                    if changed {
                        updated.push(key);
                    }
                }
                None => closed.push(key),
            }
        }
        for key in updated {
            self.fan_session_updated(key);
        }
        for key in closed {
            info!("Application of session {key} no longer runs on {device_id}");
            self.teardown_session(key, StopReason::ApplicationClosed);
        }

        self.after_directory_change();
    }

    fn on_device_media_status(&mut self, device_id: DeviceId, message: MediaStatusMessage) {
        let mut target = None;
        if let Some(request_id) = message.request_id.filter(|id| *id != 0) {
            if let Some((key, action)) = self.resolve_on_device(&device_id, Lane::Media, request_id) {
                debug!("Media request {request_id} answered on session {key}");
                let payload = serde_json::to_value(&message).unwrap_or(Value::Null);
                self.dispatch_resolved(action, payload);
                target = Some(key);
            }
        }

        // Correlated frames belong to one session; broadcasts go to every
        // confirmed session on the device.
        let keys = match target {
            Some(key) => vec![key],
            None => self
                .sessions
                .on_device(&device_id)
                .into_iter()
                .filter(|key| self.sessions.get(*key).is_some_and(|s| s.is_active()))
                .collect(),
        };
        let now = Instant::now();
        for key in keys {
            let snapshots: Vec<_> = {
                let Some(session) = self.sessions.get_mut(key) else {
                    continue;
                };
                let touched = session.media.apply_message(&message, now);
                touched
                    .iter()
                    .filter_map(|id| session.media.get(*id))
                    .map(|row| row.snapshot())
                    .collect()
            };
            let members = self.instances.attached_to(key);
            for snapshot in snapshots {
                for id in &members {
                    self.send_to_instance(*id, ApiOutbound::MediaUpdated {
                        status: snapshot.clone(),
                    });
                }
            }
        }
    }

    // ---- instance side -----------------------------------------------

    /// Register a freshly connected instance. An untrusted hello without a
    /// content context is refused; an older instance on the same page slot
    /// is evicted first.
    pub fn handle_instance_connected(
        &mut self,
        hello: InstanceHello,
        sink: Sender<ApiOutbound>,
    ) -> Result<InstanceId, CastError> {
        let (id, evicted) = self.instances.register(hello, sink)?;
        if let Some(old) = evicted {
            self.cleanup_evicted(old);
        }
        info!("Instance {id} connected");
        self.send_to_instance(id, ApiOutbound::InstanceCreated { instance_id: id.0 });
        Ok(id)
    }

    /// The instance's frame channel closed. Its session membership ends,
    /// but any auto-join context it contributed stays, so a reloaded page
    /// can find its way back.
    pub fn handle_instance_disconnected(&mut self, id: InstanceId) {
        if self.instances.unregister(id).is_none() {
            return;
        }
        info!("Instance {id} disconnected");
        if self.selector.abandon(id, &mut self.directory) {
            debug!("Selection dialog of instance {id} abandoned");
        }
    }

    pub fn handle_instance_message(&mut self, id: InstanceId, frame: ApiInbound) {
        let allowed = match self.instances.get(id) {
            Some(instance) => instance.may_send(&frame),
            None => {
                debug!("Frame from unknown instance {id}");
                return;
            }
        };
        if !allowed {
            warn!("Instance {id} sent privileged frame '{}'", frame.kind());
            self.send_to_instance(id, CastError::forbidden(id.0, frame.kind()).into_frame());
            self.destroy_instance(id);
            return;
        }
        match frame {
            ApiInbound::InitializeSdk { api_config } => self.on_initialize(id, api_config),
            ApiInbound::RequestSession {
                session_request,
                receiver_device_id,
            } => match receiver_device_id {
                Some(device_id) => {
                    self.start_cast(id, session_request, device_id, MediaTypeFlags::default().with(MediaTypeFlags::APP));
                }
                None => self.open_selection(id, session_request),
            },
            ApiInbound::RequestSessionById { session_id } => {
                match self.sessions.find_by_session_id(&session_id) {
                    Some(key) => self.join_session(id, key),
                    None => {
                        self.send_to_instance(id, CastError::InvalidSession(session_id).into_frame());
                    }
                }
            }
            ApiInbound::LeaveSession => self.on_leave_session(id),
            ApiInbound::AppMessage { namespace, message } => {
                self.on_app_message(id, namespace, message);
            }
            ApiInbound::MediaCommand { payload } => self.on_passthrough(id, payload, Lane::Media),
            ApiInbound::DeviceCommand { payload } => {
                self.on_passthrough(id, payload, Lane::Receiver);
            }
            ApiInbound::OpenSelection { session_request } => {
                self.open_selection(id, session_request);
            }
            ApiInbound::StopAppOnDevice { device_id } => self.stop_apps_on_device(&device_id),
        }
    }

    fn on_initialize(&mut self, id: InstanceId, api_config: ApiConfig) {
        let Some(instance) = self.instances.get_mut(id) else {
            return;
        };
        let first = instance.api_config.is_none();
        let context = instance.context.clone();
        let app_id = api_config.session_request.app_id.clone();
        let policy = api_config.auto_join_policy;
        instance.api_config = Some(api_config);
        debug!("Instance {id} initialized for app {app_id}, policy {policy:?}");

        // The auto-join scan runs once per instance, on its first config.
        if first {
            if let Some(context) = context {
                if let Some(key) = self.sessions.find_auto_join_target(&app_id, policy, &context) {
                    info!("Instance {id} auto-joins session {key}");
                    self.join_session(id, key);
                }
            }
        }
        self.refresh_availability_for(id);
    }

    /// Attach an instance to a confirmed session and replay the session
    /// frame it would have received as the original requester.
    fn join_session(&mut self, id: InstanceId, key: SessionKey) {
        let Some(descriptor) = self.session_descriptor(key) else {
            self.send_to_instance(id, CastError::SessionNotReady.into_frame());
            return;
        };
        let context = self.instances.get(id).and_then(|i| i.context.clone());
        if let (Some(session), Some(context)) = (self.sessions.get_mut(key), context) {
            session.auto_join_contexts.insert(context);
        }
        if let Some(instance) = self.instances.get_mut(id) {
            instance.session = Some(key);
        }
        info!("Instance {id} attached to session {key}");
        self.send_to_instance(id, ApiOutbound::SessionCreated { session: descriptor });
    }

    /// Launch an application on a known device and park the new session
    /// in the table until a status report confirms it.
    fn start_cast(
        &mut self,
        id: InstanceId,
        request: SessionRequest,
        device_id: DeviceId,
        media_type: MediaTypeFlags,
    ) {
        if self.instances.get(id).is_none() {
            return;
        }
        if !self.directory.contains(&device_id) {
            self.send_to_instance(id, CastError::DeviceUnavailable(device_id).into_frame());
            return;
        }
        let key = self
            .sessions
            .create(device_id.clone(), &request.app_id, self.config.request_timeout());
        let context = self.instances.get(id).and_then(|i| i.context.clone());
        if let (Some(session), Some(context)) = (self.sessions.get_mut(key), context) {
            session.auto_join_contexts.insert(context);
        }
        if let Some(instance) = self.instances.get_mut(id) {
            instance.session = Some(key);
        }
        let launched = self.send_discovery(DiscoveryCommand::CreateSession {
            device_id: device_id.clone(),
            app_id: request.app_id.clone(),
        });
        if !launched {
            self.sessions.remove(key);
            if let Some(instance) = self.instances.get_mut(id) {
                instance.session = None;
            }
            self.send_to_instance(id, CastError::ConnectionError(device_id).into_frame());
            return;
        }
        info!(
            "Casting app {} to {device_id} for instance {id} ({media_type:?})",
            request.app_id
        );
        if let Some(device) = self.directory.get(&device_id) {
            self.send_to_instance(id, ApiOutbound::ReceiverAction {
                receiver: device.descriptor.clone(),
                action: ReceiverActionKind::Cast,
            });
        }
    }

    /// Detach the leaver and every co-member whose own auto-join policy
    /// binds it to the leaver's context. The session itself survives as
    /// long as someone stays attached; the last leaver drops it locally
    /// without stopping the receiver application.
    fn on_leave_session(&mut self, id: InstanceId) {
        let Some(instance) = self.instances.get(id) else {
            return;
        };
        let Some(key) = instance.session else {
            self.send_to_instance(id, CastError::NoSession.into_frame());
            return;
        };
        let leaver_context = instance.context.clone();
        let mut leavers = vec![id];
        if let Some(leaver_context) = &leaver_context {
            for other in self.instances.attached_to(key) {
                if other == id {
                    continue;
                }
                let Some(other_instance) = self.instances.get(other) else {
                    continue;
                };
                let (Some(other_context), Some(policy)) =
                    (other_instance.context.as_ref(), other_instance.auto_join_policy())
                else {
                    continue;
                };
                if policy_matches(policy, other_context, leaver_context) {
                    leavers.push(other);
                }
            }
        }
        let session_id = self
            .sessions
            .get(key)
            .and_then(|s| s.session_id.clone())
            .unwrap_or_default();
        info!("Instance {id} leaves session {key}, detaching {} instance(s)", leavers.len());
        for leaver in leavers {
            let context = self.instances.get_mut(leaver).and_then(|instance| {
                instance.session = None;
                instance.context.clone()
            });
            // Leaving is deliberate: the context goes too, or the next
            // initializeSdk would bounce straight back in.
            if let (Some(session), Some(context)) = (self.sessions.get_mut(key), context) {
                session.auto_join_contexts.remove(&context);
            }
            self.send_to_instance(leaver, ApiOutbound::SessionLeft {
                session_id: session_id.clone(),
            });
        }
        if self.instances.attached_to(key).is_empty() {
            debug!("Session {key} has no members left");
            self.teardown_session(key, StopReason::Dropped);
        }
    }

    fn on_app_message(&mut self, id: InstanceId, namespace: String, message: Value) {
        let Some(key) = self.instances.get(id).and_then(|i| i.session) else {
            self.send_to_instance(id, CastError::NoSession.into_frame());
            return;
        };
        let (device_id, transport_id) = {
            let Some(session) = self.sessions.get(key) else {
                self.send_to_instance(id, CastError::NoSession.into_frame());
                return;
            };
            if !session.is_active() {
                self.send_to_instance(id, CastError::SessionNotReady.into_frame());
                return;
            }
            (session.device_id().clone(), session.transport_id.clone())
        };
        let payload = json!({
            "namespace": namespace,
            "transportId": transport_id,
            "message": message,
        });
        if !self.send_discovery(DiscoveryCommand::SendDeviceMessage {
            device_id,
            message: payload,
        }) {
            self.send_to_instance(id, CastError::ChannelClosed.into_frame());
        }
    }

    /// Forward a raw command, swapping the client's requestId for one of
    /// ours so the answer can find its way back.
    fn on_passthrough(&mut self, id: InstanceId, mut payload: Value, lane: Lane) {
        let Some(key) = self.instances.get(id).and_then(|i| i.session) else {
            self.send_to_instance(id, CastError::NoSession.into_frame());
            return;
        };
        let (device_id, request_id) = {
            let Some(session) = self.sessions.get_mut(key) else {
                self.send_to_instance(id, CastError::NoSession.into_frame());
                return;
            };
            if !session.is_active() {
                self.send_to_instance(id, CastError::SessionNotReady.into_frame());
                return;
            }
            let client_request_id = take_request_id(&mut payload);
            let correlator = match lane {
                Lane::Receiver => &mut session.channel.receiver_lane,
                Lane::Media => &mut session.channel.media_lane,
            };
            let request_id = correlator.register(PendingAction::Forward {
                instance_id: id,
                client_request_id,
            });
            set_request_id(&mut payload, request_id);
            (session.device_id().clone(), request_id)
        };
        let command = match lane {
            Lane::Receiver => DiscoveryCommand::SendDeviceMessage {
                device_id,
                message: payload,
            },
            Lane::Media => DiscoveryCommand::SendMediaMessage {
                device_id,
                message: payload,
            },
        };
        if !self.send_discovery(command) {
            if let Some(session) = self.sessions.get_mut(key) {
                let correlator = match lane {
                    Lane::Receiver => &mut session.channel.receiver_lane,
                    Lane::Media => &mut session.channel.media_lane,
                };
                let _ = correlator.resolve(request_id);
            }
            self.send_to_instance(id, CastError::ChannelClosed.into_frame());
        }
    }

    fn open_selection(&mut self, id: InstanceId, request: SessionRequest) {
        let (context, trusted) = match self.instances.get(id) {
            Some(instance) => (instance.context.clone(), instance.is_trusted),
            None => return,
        };
        let cancelled = self.selector.open(
            id,
            request,
            context.as_ref(),
            trusted,
            &self.config,
            &mut self.directory,
        );
        for old in cancelled {
            self.send_to_instance(old, CastError::SelectionCancelled.into_frame());
        }
    }

    /// Stop whatever we know is running on the device. Sessions of our
    /// own go through their receiver channel; without one, the discovery
    /// backend is asked to stop the foreign application.
    fn stop_apps_on_device(&mut self, device_id: &DeviceId) {
        let keys = self.sessions.on_device(device_id);
        if keys.is_empty() {
            if self.directory.contains(device_id) {
                self.send_discovery(DiscoveryCommand::StopApp {
                    device_id: device_id.clone(),
                });
            } else {
                debug!("Stop requested for unknown device {device_id}");
            }
            return;
        }
        for key in keys {
            self.stop_session(key);
        }
    }

    fn stop_session(&mut self, key: SessionKey) {
        let stop = {
            let Some(session) = self.sessions.get_mut(key) else {
                return;
            };
            match session.session_id.clone() {
                Some(session_id) => {
                    let request_id = session
                        .channel
                        .receiver_lane
                        .register(PendingAction::ConfirmStop { session_key: key });
                    Some((session.device_id().clone(), session_id, request_id))
                }
                None => None,
            }
        };
        match stop {
            Some((device_id, session_id, request_id)) => {
                debug!("Stopping session {key} ({session_id}) on {device_id}");
                let sent = self.send_discovery(DiscoveryCommand::SendDeviceMessage {
                    device_id,
                    message: json!({
                        "type": "STOP",
                        "sessionId": session_id,
                        "requestId": request_id,
                    }),
                });
                if !sent {
                    self.teardown_session(key, StopReason::Stopped);
                }
            }
            None => {
                // Not confirmed yet. Ask the backend to clean the device
                // up anyway and fail the launch locally.
                if let Some(session) = self.sessions.get(key) {
                    let device_id = session.device_id().clone();
                    self.send_discovery(DiscoveryCommand::StopApp { device_id });
                }
                self.teardown_session(key, StopReason::Stopped);
            }
        }
    }

    // ---- selection side ----------------------------------------------

    pub fn handle_selector_event(&mut self, event: SelectorEvent) {
        let Some(outcome) = self.selector.handle_event(event, &mut self.directory) else {
            return;
        };
        match outcome {
            SelectionOutcome::Selected {
                requester,
                request,
                device_id,
                media_type,
            } => {
                if self.instances.get(requester).is_none() {
                    debug!("Selection landed after instance {requester} left");
                    return;
                }
                self.start_cast(requester, request, device_id, media_type);
            }
            SelectionOutcome::Stopped {
                requester,
                device_id,
            } => {
                if let Some(device) = self.directory.get(&device_id) {
                    self.send_to_instance(requester, ApiOutbound::ReceiverAction {
                        receiver: device.descriptor.clone(),
                        action: ReceiverActionKind::Stop,
                    });
                }
                self.stop_apps_on_device(&device_id);
                self.send_to_instance(requester, CastError::SelectionCancelled.into_frame());
            }
            SelectionOutcome::Cancelled { requester } => {
                self.send_to_instance(requester, CastError::SelectionCancelled.into_frame());
            }
        }
    }

    // ---- time --------------------------------------------------------

    /// Periodic sweep: unanswered requests and unconfirmed launches die
    /// here once their deadline passes.
    pub fn handle_tick(&mut self) {
        let now = Instant::now();
        for key in self.sessions.expired_pending(now, self.config.launch_deadline()) {
            warn!("Session {key} launch deadline passed");
            self.teardown_session(key, StopReason::LaunchTimedOut);
        }
        let mut expired = Vec::new();
        for key in self.sessions.keys() {
            if let Some(session) = self.sessions.get_mut(key) {
                expired.extend(session.channel.expire(now));
            }
        }
        for (request_id, action) in expired {
            warn!("Request {request_id} went unanswered");
            self.fail_action(action, ErrorCode::Timeout);
        }
    }

    // ---- internals ----------------------------------------------------

    fn cleanup_evicted(&mut self, old: Instance) {
        debug!("Instance {} evicted by a newer connection on its page", old.id);
        if self.selector.abandon(old.id, &mut self.directory) {
            debug!("Selection dialog of instance {} abandoned", old.id);
        }
    }

    fn destroy_instance(&mut self, id: InstanceId) {
        if self.instances.unregister(id).is_some() {
            self.selector.abandon(id, &mut self.directory);
            info!("Instance {id} destroyed");
        }
    }

    /// Find which session on the device has this request in flight.
    fn resolve_on_device(
        &mut self,
        device_id: &DeviceId,
        lane: Lane,
        request_id: u32,
    ) -> Option<(SessionKey, PendingAction)> {
        for key in self.sessions.on_device(device_id) {
            let Some(session) = self.sessions.get_mut(key) else {
                continue;
            };
            let correlator = match lane {
                Lane::Receiver => &mut session.channel.receiver_lane,
                Lane::Media => &mut session.channel.media_lane,
            };
            if let Some(action) = correlator.resolve(request_id) {
                return Some((key, action));
            }
        }
        None
    }

    fn dispatch_resolved(&mut self, action: PendingAction, payload: Value) {
        match action {
            PendingAction::Forward {
                instance_id,
                client_request_id,
            } => {
                let mut payload = payload;
                restore_request_id(&mut payload, client_request_id);
                self.send_to_instance(instance_id, ApiOutbound::CommandResponse { payload });
            }
            PendingAction::InternalStatus => debug!("Status poll answered"),
            PendingAction::ConfirmStop { session_key } => {
                info!("Receiver confirmed stop of session {session_key}");
                self.teardown_session(session_key, StopReason::Stopped);
            }
        }
    }

    /// Resolve a pending action with an error instead of an answer.
    fn fail_action(&mut self, action: PendingAction, code: ErrorCode) {
        match action {
            PendingAction::Forward {
                instance_id,
                client_request_id,
            } => {
                let mut payload = json!({ "type": "ERROR", "reason": code });
                restore_request_id(&mut payload, client_request_id);
                self.send_to_instance(instance_id, ApiOutbound::CommandResponse { payload });
            }
            PendingAction::InternalStatus => {}
            PendingAction::ConfirmStop { session_key } => {
                // The receiver never answered; drop the session locally.
                self.teardown_session(session_key, StopReason::Stopped);
            }
        }
    }

    fn on_session_confirmed(&mut self, key: SessionKey) {
        if let Some(descriptor) = self.session_descriptor(key) {
            for id in self.instances.attached_to(key) {
                self.send_to_instance(id, ApiOutbound::SessionCreated {
                    session: descriptor.clone(),
                });
            }
        }
        self.prime_media_status(key);
    }

    /// First media poll of a fresh session, so controllers do not wait
    /// for the receiver to feel like broadcasting.
    fn prime_media_status(&mut self, key: SessionKey) {
        let Some(session) = self.sessions.get_mut(key) else {
            return;
        };
        let request_id = session.channel.media_lane.register(PendingAction::InternalStatus);
        let device_id = session.device_id().clone();
        self.send_discovery(DiscoveryCommand::SendMediaMessage {
            device_id,
            message: json!({ "type": "GET_STATUS", "requestId": request_id }),
        });
    }

    fn fan_session_updated(&mut self, key: SessionKey) {
        if let Some(descriptor) = self.session_descriptor(key) {
            for id in self.instances.attached_to(key) {
                self.send_to_instance(id, ApiOutbound::SessionUpdated {
                    session: descriptor.clone(),
                });
            }
        }
    }

    fn session_descriptor(&self, key: SessionKey) -> Option<SessionDescriptor> {
        let session = self.sessions.get(key)?;
        let device = self.directory.get(session.device_id())?;
        session.descriptor(&device.descriptor)
    }

    fn teardown_session(&mut self, key: SessionKey, reason: StopReason) {
        let Some(mut session) = self.sessions.remove(key) else {
            return;
        };
        for action in session.channel.fail_all() {
            self.fail_action(action, ErrorCode::ChannelError);
        }
        let frame = match (&session.session_id, reason) {
            (Some(session_id), _) => ApiOutbound::SessionStopped {
                session_id: session_id.clone(),
            },
            (None, StopReason::DeviceGone) => {
                CastError::DeviceUnavailable(session.device_id().clone()).into_frame()
            }
            (None, StopReason::ChannelLost) => {
                CastError::ConnectionLost(session.device_id().clone()).into_frame()
            }
            (None, StopReason::LaunchTimedOut) => CastError::LaunchTimeout.into_frame(),
            (None, _) => CastError::SessionNotReady.into_frame(),
        };
        let members = self.instances.attached_to(key);
        for id in &members {
            if let Some(instance) = self.instances.get_mut(*id) {
                instance.session = None;
            }
            self.send_to_instance(*id, frame.clone());
        }
        info!(
            "Session {key} torn down ({reason:?}), {} member(s) notified",
            members.len()
        );
    }

    fn send_to_instance(&self, id: InstanceId, frame: ApiOutbound) {
        if let Some(instance) = self.instances.get(id) {
            if !instance.send(frame) {
                debug!("Frame for instance {id} dropped, sink closed");
            }
        }
    }

    fn send_discovery(&mut self, command: DiscoveryCommand) -> bool {
        match &self.discovery {
            Some(commands) => {
                if commands.send(command).is_ok() {
                    true
                } else {
                    warn!("Discovery channel rejected a command");
                    self.discovery = None;
                    false
                }
            }
            None => {
                debug!("No discovery channel, command dropped");
                false
            }
        }
    }

    fn refresh_availability(&mut self) {
        for id in self.instances.ids() {
            self.refresh_availability_for(id);
        }
    }

    /// Edge-triggered: an instance hears about availability when it first
    /// initializes and afterwards only when the answer changes.
    fn refresh_availability_for(&mut self, id: InstanceId) {
        let available = !self.directory.is_empty();
        let Some(instance) = self.instances.get_mut(id) else {
            return;
        };
        if instance.api_config.is_none() || instance.last_availability == Some(available) {
            return;
        }
        instance.last_availability = Some(available);
        self.send_to_instance(id, ApiOutbound::ReceiverAvailabilityUpdated {
            is_available: available,
        });
    }

    fn after_directory_change(&mut self) {
        self.refresh_availability();
        self.selector.pump(&self.directory);
    }
}
