//! Last-known set of discovered receivers.
//!
//! The directory is fed exclusively by discovery events and read by
//! everything else. Besides lookup it offers typed change observers:
//! each observer gets its own channel, registered and removed by id so
//! a consumer can prove it cleaned up after itself.

use std::collections::HashMap;

use crossbeam_channel::{Receiver, Sender, unbounded};
use tracing::{debug, info};

use castwire::{DeviceDescriptor, DeviceId, ReceiverStatus, ReceiverVolume};

/// One receiver as the directory knows it: the discovery descriptor
/// plus the latest receiver-channel snapshot.
#[derive(Clone, Debug)]
pub struct Device {
    pub descriptor: DeviceDescriptor,
    pub volume: ReceiverVolume,
    pub applications: Vec<castwire::Application>,
    pub is_active_input: Option<bool>,
}

impl Device {
    fn new(descriptor: DeviceDescriptor) -> Self {
        Device {
            descriptor,
            volume: ReceiverVolume::default(),
            applications: Vec::new(),
            is_active_input: None,
        }
    }

    /// Overlay a receiver status on the snapshot. The application list
    /// is replaced (a status enumerates what is running), the volume is
    /// merged field by field.
    fn apply_status(&mut self, status: &ReceiverStatus) {
        self.applications = status.applications.clone();
        if let Some(volume) = &status.volume {
            self.volume.merge_from(volume);
        }
        if let Some(active) = status.is_active_input {
            self.is_active_input = Some(active);
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum DirectoryChange {
    Added(DeviceDescriptor),
    Updated(DeviceDescriptor),
    Removed(DeviceId),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

#[derive(Default)]
pub struct DeviceDirectory {
    devices: HashMap<DeviceId, Device>,
    observers: Vec<(ObserverId, Sender<DirectoryChange>)>,
    next_observer: u64,
}

impl DeviceDirectory {
    pub fn new() -> Self {
        DeviceDirectory::default()
    }

    /// A device announced itself. Re-announcing a known id updates it in
    /// place, the set never holds two entries for one id.
    pub fn apply_up(&mut self, descriptor: DeviceDescriptor) -> DirectoryChange {
        let id = descriptor.id.clone();
        let change = match self.devices.get_mut(&id) {
            Some(device) => {
                device.descriptor = descriptor.clone();
                DirectoryChange::Updated(descriptor)
            }
            None => {
                info!("Device {} ({}) appeared", descriptor.friendly_name, id);
                self.devices.insert(id, Device::new(descriptor.clone()));
                DirectoryChange::Added(descriptor)
            }
        };
        self.notify(&change);
        change
    }

    /// A device said goodbye or expired. Unknown ids are ignored.
    pub fn apply_down(&mut self, id: &DeviceId) -> Option<DirectoryChange> {
        let device = self.devices.remove(id)?;
        info!("Device {} ({}) gone", device.descriptor.friendly_name, id);
        let change = DirectoryChange::Removed(id.clone());
        self.notify(&change);
        Some(change)
    }

    /// Overlay a receiver status on a known device. Returns the change
    /// when the device exists, `None` for statuses of unknown devices.
    pub fn apply_status(&mut self, id: &DeviceId, status: &ReceiverStatus) -> Option<DirectoryChange> {
        let device = self.devices.get_mut(id)?;
        device.apply_status(status);
        let change = DirectoryChange::Updated(device.descriptor.clone());
        self.notify(&change);
        Some(change)
    }

    /// Forget every device, synthesizing one removal per entry. Used
    /// when the discovery channel itself drops.
    pub fn clear(&mut self) -> Vec<DirectoryChange> {
        let ids: Vec<DeviceId> = self.devices.keys().cloned().collect();
        debug!("Clearing directory, {} devices", ids.len());
        ids.iter().filter_map(|id| self.apply_down(id)).collect()
    }

    pub fn get(&self, id: &DeviceId) -> Option<&Device> {
        self.devices.get(id)
    }

    pub fn contains(&self, id: &DeviceId) -> bool {
        self.devices.contains_key(id)
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// Descriptor snapshot, sorted by id so consumers see a stable order.
    pub fn descriptors(&self) -> Vec<DeviceDescriptor> {
        let mut all: Vec<DeviceDescriptor> =
            self.devices.values().map(|d| d.descriptor.clone()).collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    pub fn add_observer(&mut self) -> (ObserverId, Receiver<DirectoryChange>) {
        let id = ObserverId(self.next_observer);
        self.next_observer += 1;
        let (tx, rx) = unbounded();
        self.observers.push((id, tx));
        (id, rx)
    }

    pub fn remove_observer(&mut self, id: ObserverId) {
        self.observers.retain(|(oid, _)| *oid != id);
    }

    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }

    fn notify(&mut self, change: &DirectoryChange) {
        self.observers.retain(|(_, tx)| tx.send(change.clone()).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(id: &str, name: &str) -> DeviceDescriptor {
        DeviceDescriptor {
            id: DeviceId::new(id),
            friendly_name: name.to_string(),
            capabilities: Default::default(),
        }
    }

    #[test]
    fn test_reannounce_updates_in_place() {
        let mut dir = DeviceDirectory::new();
        assert!(matches!(
            dir.apply_up(descriptor("d1", "Salon")),
            DirectoryChange::Added(_)
        ));
        assert!(matches!(
            dir.apply_up(descriptor("d1", "Salon (renamed)")),
            DirectoryChange::Updated(_)
        ));
        assert_eq!(dir.len(), 1);
        assert_eq!(
            dir.get(&DeviceId::new("d1")).unwrap().descriptor.friendly_name,
            "Salon (renamed)"
        );
    }

    #[test]
    fn test_down_for_unknown_device_is_ignored() {
        let mut dir = DeviceDirectory::new();
        dir.apply_up(descriptor("d1", "Salon"));
        assert!(dir.apply_down(&DeviceId::new("nope")).is_none());
        assert!(dir.apply_down(&DeviceId::new("d1")).is_some());
        assert!(dir.apply_down(&DeviceId::new("d1")).is_none());
        assert!(dir.is_empty());
    }

    #[test]
    fn test_clear_synthesizes_one_removal_per_device() {
        let mut dir = DeviceDirectory::new();
        dir.apply_up(descriptor("d1", "Salon"));
        dir.apply_up(descriptor("d2", "Cuisine"));
        let changes = dir.clear();
        assert_eq!(changes.len(), 2);
        assert!(changes.iter().all(|c| matches!(c, DirectoryChange::Removed(_))));
        assert!(dir.is_empty());
    }

    #[test]
    fn test_observers_see_changes_and_can_be_removed() {
        let mut dir = DeviceDirectory::new();
        let (id, rx) = dir.add_observer();
        assert_eq!(dir.observer_count(), 1);

        dir.apply_up(descriptor("d1", "Salon"));
        assert!(matches!(rx.try_recv().unwrap(), DirectoryChange::Added(_)));

        dir.remove_observer(id);
        assert_eq!(dir.observer_count(), 0);
        dir.apply_up(descriptor("d2", "Cuisine"));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_dropped_observer_is_pruned_on_next_notify() {
        let mut dir = DeviceDirectory::new();
        let (_id, rx) = dir.add_observer();
        drop(rx);
        dir.apply_up(descriptor("d1", "Salon"));
        assert_eq!(dir.observer_count(), 0);
    }

    #[test]
    fn test_status_merges_volume_but_replaces_applications() {
        let mut dir = DeviceDirectory::new();
        dir.apply_up(descriptor("d1", "Salon"));
        let id = DeviceId::new("d1");

        let mut status = ReceiverStatus::default();
        status.volume = Some(ReceiverVolume {
            level: Some(0.5),
            muted: None,
        });
        status.is_active_input = Some(true);
        status.applications = vec![castwire::Application {
            app_id: "APP".to_string(),
            session_id: "s-1".to_string(),
            transport_id: None,
            display_name: None,
            status_text: None,
            namespaces: Vec::new(),
        }];
        dir.apply_status(&id, &status).unwrap();

        let mut status = ReceiverStatus::default();
        status.volume = Some(ReceiverVolume {
            level: None,
            muted: Some(true),
        });
        dir.apply_status(&id, &status).unwrap();

        let device = dir.get(&id).unwrap();
        assert_eq!(device.volume.level, Some(0.5));
        assert_eq!(device.volume.muted, Some(true));
        assert_eq!(device.is_active_input, Some(true));
        // a status enumerates what runs; the second one listed nothing
        assert!(device.applications.is_empty());
    }
}
