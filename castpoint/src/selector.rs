//! Serializes access to the single device-selection dialog.
//!
//! At most one dialog is open system-wide. A newer request closes the
//! older one, the older requester hears a cancellation. While a dialog
//! is open the coordinator observes the device directory and forwards
//! changes into the UI; the observer is removed synchronously on the
//! first terminal outcome, whichever it is, so repeated open/close
//! cycles cannot leak observers.

use crossbeam_channel::{Receiver, Sender};
use tracing::debug;

use castwire::{
    ContentContext, DeviceDescriptor, DeviceId, MediaTypeFlags, SelectorAppInfo, SelectorCommand,
    SelectorEvent, SessionRequest,
};

use crate::config::CastPointConfig;
use crate::directory::{DeviceDirectory, DirectoryChange, ObserverId};
use crate::instances::InstanceId;

#[derive(Debug)]
struct OpenDialog {
    requester: InstanceId,
    request: SessionRequest,
    observer: ObserverId,
    updates: Receiver<DirectoryChange>,
}

/// Terminal result of one dialog, routed back to the state machine.
#[derive(Clone, Debug)]
pub enum SelectionOutcome {
    Selected {
        requester: InstanceId,
        request: SessionRequest,
        device_id: DeviceId,
        media_type: MediaTypeFlags,
    },
    Stopped {
        requester: InstanceId,
        device_id: DeviceId,
    },
    Cancelled {
        requester: InstanceId,
    },
}

pub struct SelectionCoordinator {
    commands: Sender<SelectorCommand>,
    current: Option<OpenDialog>,
}

impl SelectionCoordinator {
    pub fn new(commands: Sender<SelectorCommand>) -> Self {
        SelectionCoordinator {
            commands,
            current: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.current.is_some()
    }

    pub fn current_requester(&self) -> Option<InstanceId> {
        self.current.as_ref().map(|d| d.requester)
    }

    /// Open a dialog for `requester`. An already-open dialog is closed
    /// first, the newer request wins. Returns the requesters whose
    /// attempt ends cancelled: the superseded one, plus `requester`
    /// itself when the UI is unreachable and no dialog can open.
    pub fn open(
        &mut self,
        requester: InstanceId,
        request: SessionRequest,
        context: Option<&ContentContext>,
        trusted: bool,
        config: &CastPointConfig,
        directory: &mut DeviceDirectory,
    ) -> Vec<InstanceId> {
        let mut cancelled: Vec<InstanceId> = self.close_current(directory).into_iter().collect();
        let (default_media_type, available_media_types) = media_types(context, trusted, config);
        let app_info = SelectorAppInfo {
            app_id: request.app_id.clone(),
            origin: context.and_then(|c| c.origin.clone()),
        };
        let opened = self.commands.send(SelectorCommand::Open {
            devices: eligible(directory, &request),
            default_media_type,
            available_media_types,
            app_info: Some(app_info),
        });
        if opened.is_err() {
            debug!("Selection UI unreachable, request from instance {requester} cancelled");
            cancelled.push(requester);
            return cancelled;
        }
        let (observer, updates) = directory.add_observer();
        debug!("Selection dialog open for instance {requester}, app {}", request.app_id);
        self.current = Some(OpenDialog {
            requester,
            request,
            observer,
            updates,
        });
        cancelled
    }

    /// The requester disappeared: close its dialog if it owns the open
    /// one. Returns whether a dialog was closed.
    pub fn abandon(&mut self, requester: InstanceId, directory: &mut DeviceDirectory) -> bool {
        if self.current.as_ref().is_some_and(|d| d.requester == requester) {
            self.close_current(directory);
            true
        } else {
            false
        }
    }

    /// Route a UI event. Any event with no open dialog is stale and
    /// ignored. A terminal event removes the directory observer before
    /// the outcome is returned.
    pub fn handle_event(
        &mut self,
        event: SelectorEvent,
        directory: &mut DeviceDirectory,
    ) -> Option<SelectionOutcome> {
        let Some(dialog) = self.current.take() else {
            debug!("Selector event with no open dialog, ignored");
            return None;
        };
        directory.remove_observer(dialog.observer);
        let requester = dialog.requester;
        match event {
            SelectorEvent::Selected {
                device_id,
                media_type,
            } => Some(SelectionOutcome::Selected {
                requester,
                request: dialog.request,
                device_id,
                media_type,
            }),
            SelectorEvent::Stopped { device_id } => Some(SelectionOutcome::Stopped {
                requester,
                device_id,
            }),
            SelectorEvent::Cancelled => Some(SelectionOutcome::Cancelled { requester }),
        }
    }

    /// Drain observed directory changes into the open dialog.
    pub fn pump(&mut self, directory: &DeviceDirectory) {
        let Some(dialog) = &self.current else {
            return;
        };
        let mut dirty = false;
        while dialog.updates.try_recv().is_ok() {
            dirty = true;
        }
        if dirty {
            let _ = self.commands.send(SelectorCommand::Update {
                devices: eligible(directory, &dialog.request),
            });
        }
    }

    fn close_current(&mut self, directory: &mut DeviceDirectory) -> Option<InstanceId> {
        let dialog = self.current.take()?;
        directory.remove_observer(dialog.observer);
        let _ = self.commands.send(SelectorCommand::Close);
        debug!("Selection dialog for instance {} closed", dialog.requester);
        Some(dialog.requester)
    }
}

/// Devices offered in the dialog: those whose advertised capabilities
/// cover what the request asks for.
fn eligible(directory: &DeviceDirectory, request: &SessionRequest) -> Vec<DeviceDescriptor> {
    directory
        .descriptors()
        .into_iter()
        .filter(|d| d.capabilities.satisfies(request.capabilities))
        .collect()
}

/// Cast modes for the dialog. App casting is always on the table; tab
/// mirroring needs a secure origin; desktop mirroring is reserved for
/// trusted surfaces and has to be enabled in the configuration.
fn media_types(
    context: Option<&ContentContext>,
    trusted: bool,
    config: &CastPointConfig,
) -> (MediaTypeFlags, MediaTypeFlags) {
    let mut available = MediaTypeFlags::default().with(MediaTypeFlags::APP);
    let secure_origin = context
        .and_then(|c| c.origin.as_deref())
        .is_some_and(|origin| origin.starts_with("https://"));
    if secure_origin {
        available = available.with(MediaTypeFlags::TAB_MIRROR);
    }
    if trusted && config.desktop_mirroring {
        available = available.with(MediaTypeFlags::DESKTOP_MIRROR);
    }
    (MediaTypeFlags::default().with(MediaTypeFlags::APP), available)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;

    use castwire::DeviceCapabilities;

    fn directory_with(ids: &[&str]) -> DeviceDirectory {
        let mut directory = DeviceDirectory::new();
        for id in ids {
            directory.apply_up(DeviceDescriptor {
                id: DeviceId::new(*id),
                friendly_name: format!("Device {id}"),
                capabilities: DeviceCapabilities(DeviceCapabilities::VIDEO_OUT),
            });
        }
        directory
    }

    fn page_context() -> ContentContext {
        ContentContext::new(1, 0, Some("https://music.example".to_string()))
    }

    #[test]
    fn test_newer_request_supersedes_older_dialog() {
        let (tx, rx) = unbounded();
        let mut coordinator = SelectionCoordinator::new(tx);
        let mut directory = directory_with(&["d1"]);
        let config = CastPointConfig::default();

        let cancelled = coordinator.open(
            InstanceId(1),
            SessionRequest::new("APP"),
            Some(&page_context()),
            false,
            &config,
            &mut directory,
        );
        assert!(cancelled.is_empty());
        assert!(matches!(rx.try_recv().unwrap(), SelectorCommand::Open { .. }));
        assert_eq!(directory.observer_count(), 1);

        let cancelled = coordinator.open(
            InstanceId(2),
            SessionRequest::new("APP"),
            Some(&page_context()),
            false,
            &config,
            &mut directory,
        );
        assert_eq!(cancelled, vec![InstanceId(1)]);
        assert!(matches!(rx.try_recv().unwrap(), SelectorCommand::Close));
        assert!(matches!(rx.try_recv().unwrap(), SelectorCommand::Open { .. }));
        assert_eq!(directory.observer_count(), 1);
        assert_eq!(coordinator.current_requester(), Some(InstanceId(2)));
    }

    #[test]
    fn test_terminal_event_removes_the_observer() {
        let (tx, _rx) = unbounded();
        let mut coordinator = SelectionCoordinator::new(tx);
        let mut directory = directory_with(&["d1"]);
        let config = CastPointConfig::default();

        coordinator.open(
            InstanceId(1),
            SessionRequest::new("APP"),
            Some(&page_context()),
            false,
            &config,
            &mut directory,
        );
        assert_eq!(directory.observer_count(), 1);

        let outcome = coordinator
            .handle_event(SelectorEvent::Cancelled, &mut directory)
            .unwrap();
        assert!(matches!(
            outcome,
            SelectionOutcome::Cancelled {
                requester: InstanceId(1)
            }
        ));
        assert_eq!(directory.observer_count(), 0);
        assert!(!coordinator.is_open());
    }

    #[test]
    fn test_stale_events_are_ignored() {
        let (tx, _rx) = unbounded();
        let mut coordinator = SelectionCoordinator::new(tx);
        let mut directory = directory_with(&[]);
        assert!(coordinator
            .handle_event(SelectorEvent::Cancelled, &mut directory)
            .is_none());
    }

    #[test]
    fn test_unreachable_ui_cancels_the_request_immediately() {
        let (tx, rx) = unbounded();
        drop(rx);
        let mut coordinator = SelectionCoordinator::new(tx);
        let mut directory = directory_with(&["d1"]);
        let config = CastPointConfig::default();

        let cancelled = coordinator.open(
            InstanceId(1),
            SessionRequest::new("APP"),
            Some(&page_context()),
            false,
            &config,
            &mut directory,
        );
        assert_eq!(cancelled, vec![InstanceId(1)]);
        assert!(!coordinator.is_open());
        assert_eq!(directory.observer_count(), 0);
    }

    #[test]
    fn test_pump_updates_only_when_something_changed() {
        let (tx, rx) = unbounded();
        let mut coordinator = SelectionCoordinator::new(tx);
        let mut directory = directory_with(&["d1"]);
        let config = CastPointConfig::default();

        coordinator.open(
            InstanceId(1),
            SessionRequest::new("APP"),
            Some(&page_context()),
            false,
            &config,
            &mut directory,
        );
        let _ = rx.try_recv();

        coordinator.pump(&directory);
        assert!(rx.try_recv().is_err());

        directory.apply_up(DeviceDescriptor {
            id: DeviceId::new("d2"),
            friendly_name: "Device d2".to_string(),
            capabilities: Default::default(),
        });
        coordinator.pump(&directory);
        match rx.try_recv().unwrap() {
            SelectorCommand::Update { devices } => assert_eq!(devices.len(), 2),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_media_types_follow_trust_and_origin() {
        let mut config = CastPointConfig::default();
        config.desktop_mirroring = true;

        let insecure = ContentContext::new(1, 0, Some("http://music.example".to_string()));
        let (_, available) = media_types(Some(&insecure), false, &config);
        assert!(available.contains(MediaTypeFlags::APP));
        assert!(!available.contains(MediaTypeFlags::TAB_MIRROR));
        assert!(!available.contains(MediaTypeFlags::DESKTOP_MIRROR));

        let (_, available) = media_types(Some(&page_context()), false, &config);
        assert!(available.contains(MediaTypeFlags::TAB_MIRROR));
        assert!(!available.contains(MediaTypeFlags::DESKTOP_MIRROR));

        let (default, available) = media_types(None, true, &config);
        assert!(available.contains(MediaTypeFlags::DESKTOP_MIRROR));
        assert_eq!(default, MediaTypeFlags(MediaTypeFlags::APP));
    }

    #[test]
    fn test_devices_filtered_by_requested_capabilities() {
        let mut directory = DeviceDirectory::new();
        directory.apply_up(DeviceDescriptor {
            id: DeviceId::new("audio"),
            friendly_name: "Speaker".to_string(),
            capabilities: DeviceCapabilities(DeviceCapabilities::AUDIO_OUT),
        });
        directory.apply_up(DeviceDescriptor {
            id: DeviceId::new("tv"),
            friendly_name: "TV".to_string(),
            capabilities: DeviceCapabilities(
                DeviceCapabilities::AUDIO_OUT | DeviceCapabilities::VIDEO_OUT,
            ),
        });

        let mut request = SessionRequest::new("APP");
        request.capabilities = DeviceCapabilities(DeviceCapabilities::VIDEO_OUT);
        let offered = eligible(&directory, &request);
        assert_eq!(offered.len(), 1);
        assert_eq!(offered[0].id.as_str(), "tv");
    }
}
