//! Registry of page-facing API instances.
//!
//! One instance per connected tab/frame. Registering a second instance
//! for a context destroys the first, so auto-join matching can rely on
//! context uniqueness. Untrusted instances get the allow-listed frame
//! subset and nothing else.

use std::collections::BTreeMap;
use std::fmt;

use crossbeam_channel::Sender;
use tracing::warn;

use castwire::{ApiConfig, ApiInbound, ApiOutbound, AutoJoinPolicy, ContentContext, DeviceId};

use crate::errors::CastError;
use crate::session::{SessionKey, SessionTable};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceId(pub u64);

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What the embedder knows about a connection when it hands it over.
#[derive(Clone, Debug)]
pub struct InstanceHello {
    pub context: Option<ContentContext>,
    pub is_trusted: bool,
}

impl InstanceHello {
    pub fn page(context: ContentContext) -> Self {
        InstanceHello {
            context: Some(context),
            is_trusted: false,
        }
    }

    pub fn trusted(context: Option<ContentContext>) -> Self {
        InstanceHello {
            context,
            is_trusted: true,
        }
    }
}

#[derive(Debug)]
pub struct Instance {
    pub id: InstanceId,
    pub context: Option<ContentContext>,
    pub is_trusted: bool,
    pub api_config: Option<ApiConfig>,
    pub session: Option<SessionKey>,
    /// Last availability flag sent, so updates stay edge-triggered.
    pub last_availability: Option<bool>,
    sink: Sender<ApiOutbound>,
}

impl Instance {
    /// Push a frame to the facade. `false` means the sink is gone and
    /// the instance should be torn down.
    pub fn send(&self, frame: ApiOutbound) -> bool {
        self.sink.send(frame).is_ok()
    }

    /// Fail-closed trust check.
    pub fn may_send(&self, frame: &ApiInbound) -> bool {
        self.is_trusted || frame.allowed_untrusted()
    }

    pub fn auto_join_policy(&self) -> Option<AutoJoinPolicy> {
        self.api_config.as_ref().map(|c| c.auto_join_policy)
    }
}

pub struct InstanceRegistry {
    instances: BTreeMap<InstanceId, Instance>,
    next_id: u64,
}

impl InstanceRegistry {
    pub fn new() -> Self {
        InstanceRegistry {
            instances: BTreeMap::new(),
            next_id: 1,
        }
    }

    /// Register a connection. An untrusted connection without a content
    /// context is rejected. A previous instance for the same
    /// `(tab_id, frame_id)` is removed and handed back to the caller
    /// for teardown.
    pub fn register(
        &mut self,
        hello: InstanceHello,
        sink: Sender<ApiOutbound>,
    ) -> Result<(InstanceId, Option<Instance>), CastError> {
        if !hello.is_trusted && hello.context.is_none() {
            return Err(CastError::InvalidContext);
        }

        let evicted = match &hello.context {
            Some(context) => {
                let previous = self
                    .instances
                    .values()
                    .find(|i| i.context.as_ref().is_some_and(|c| c.same_page(context)))
                    .map(|i| i.id);
                previous.and_then(|id| {
                    warn!("Instance {id} replaced by a new connection for the same context");
                    self.instances.remove(&id)
                })
            }
            None => None,
        };

        let id = InstanceId(self.next_id);
        self.next_id += 1;
        self.instances.insert(
            id,
            Instance {
                id,
                context: hello.context,
                is_trusted: hello.is_trusted,
                api_config: None,
                session: None,
                last_availability: None,
                sink,
            },
        );
        Ok((id, evicted))
    }

    pub fn unregister(&mut self, id: InstanceId) -> Option<Instance> {
        self.instances.remove(&id)
    }

    pub fn get(&self, id: InstanceId) -> Option<&Instance> {
        self.instances.get(&id)
    }

    pub fn get_mut(&mut self, id: InstanceId) -> Option<&mut Instance> {
        self.instances.get_mut(&id)
    }

    pub fn find_by_context(&self, tab_id: i32, frame_id: i32) -> Option<&Instance> {
        self.instances.values().find(|i| {
            i.context
                .as_ref()
                .is_some_and(|c| c.tab_id == tab_id && c.frame_id == frame_id)
        })
    }

    /// Ids in registration order.
    pub fn ids(&self) -> Vec<InstanceId> {
        self.instances.keys().copied().collect()
    }

    /// Instances attached to a session, in registration order.
    pub fn attached_to(&self, key: SessionKey) -> Vec<InstanceId> {
        self.instances
            .values()
            .filter(|i| i.session == Some(key))
            .map(|i| i.id)
            .collect()
    }

    /// Instances whose attached session runs on the given device.
    pub fn instances_on_device(
        &self,
        sessions: &SessionTable,
        device_id: &DeviceId,
    ) -> Vec<InstanceId> {
        self.instances
            .values()
            .filter(|i| {
                i.session
                    .and_then(|key| sessions.get(key))
                    .is_some_and(|s| s.device_id() == device_id)
            })
            .map(|i| i.id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}

impl Default for InstanceRegistry {
    fn default() -> Self {
        InstanceRegistry::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;

    fn context(tab_id: i32, frame_id: i32) -> ContentContext {
        ContentContext::new(tab_id, frame_id, Some("https://music.example".to_string()))
    }

    #[test]
    fn test_untrusted_without_context_is_rejected() {
        let mut registry = InstanceRegistry::new();
        let (tx, _rx) = unbounded();
        let hello = InstanceHello {
            context: None,
            is_trusted: false,
        };
        assert!(matches!(
            registry.register(hello, tx),
            Err(CastError::InvalidContext)
        ));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_duplicate_context_evicts_the_older_instance() {
        let mut registry = InstanceRegistry::new();
        let (tx, _rx) = unbounded();
        let (first, evicted) = registry
            .register(InstanceHello::page(context(1, 0)), tx.clone())
            .unwrap();
        assert!(evicted.is_none());

        let (second, evicted) = registry
            .register(InstanceHello::page(context(1, 0)), tx.clone())
            .unwrap();
        assert_eq!(evicted.unwrap().id, first);
        assert_ne!(first, second);
        assert_eq!(registry.len(), 1);

        let (_, evicted) = registry
            .register(InstanceHello::page(context(1, 7)), tx)
            .unwrap();
        assert!(evicted.is_none());
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_trust_gates_privileged_frames() {
        let mut registry = InstanceRegistry::new();
        let (tx, _rx) = unbounded();
        let (page, _) = registry
            .register(InstanceHello::page(context(1, 0)), tx.clone())
            .unwrap();
        let (ui, _) = registry
            .register(InstanceHello::trusted(None), tx)
            .unwrap();

        let privileged = ApiInbound::StopAppOnDevice {
            device_id: castwire::DeviceId::new("d1"),
        };
        assert!(!registry.get(page).unwrap().may_send(&privileged));
        assert!(registry.get(ui).unwrap().may_send(&privileged));
        assert!(registry.get(page).unwrap().may_send(&ApiInbound::LeaveSession));
    }

    #[test]
    fn test_attached_to_filters_by_session() {
        let mut registry = InstanceRegistry::new();
        let (tx, _rx) = unbounded();
        let (a, _) = registry
            .register(InstanceHello::page(context(1, 0)), tx.clone())
            .unwrap();
        let (b, _) = registry
            .register(InstanceHello::page(context(2, 0)), tx)
            .unwrap();

        registry.get_mut(a).unwrap().session = Some(SessionKey(3));
        assert_eq!(registry.attached_to(SessionKey(3)), vec![a]);
        registry.get_mut(b).unwrap().session = Some(SessionKey(3));
        assert_eq!(registry.attached_to(SessionKey(3)), vec![a, b]);
        assert!(registry.attached_to(SessionKey(4)).is_empty());
    }

    #[test]
    fn test_find_by_context() {
        let mut registry = InstanceRegistry::new();
        let (tx, _rx) = unbounded();
        let (a, _) = registry
            .register(InstanceHello::page(context(5, 2)), tx)
            .unwrap();
        assert_eq!(registry.find_by_context(5, 2).unwrap().id, a);
        assert!(registry.find_by_context(5, 3).is_none());
    }

    #[test]
    fn test_instances_on_device_follows_the_session() {
        let mut registry = InstanceRegistry::new();
        let mut sessions = SessionTable::new();
        let (tx, _rx) = unbounded();
        let (a, _) = registry
            .register(InstanceHello::page(context(1, 0)), tx.clone())
            .unwrap();
        let (_b, _) = registry
            .register(InstanceHello::page(context(2, 0)), tx)
            .unwrap();

        let d1 = DeviceId::new("d1");
        let key = sessions.create(d1.clone(), "APP", std::time::Duration::from_secs(30));
        registry.get_mut(a).unwrap().session = Some(key);

        assert_eq!(registry.instances_on_device(&sessions, &d1), vec![a]);
        assert!(registry
            .instances_on_device(&sessions, &DeviceId::new("d2"))
            .is_empty());
    }
}
