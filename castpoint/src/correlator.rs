//! Request/response correlation for one logical device lane.
//!
//! Every outbound command on a lane is stamped with the next id from
//! that lane's correlator; responses carry the id back. Ids are scoped
//! to the lane: the receiver lane and the media lane of one session use
//! independent counters and may collide with each other, matching only
//! ever happens within a lane. The counter starts at a pseudo-random
//! offset so a restarted orchestrator does not resolve responses meant
//! for its previous life.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use rand::Rng;
use serde_json::Value;
use tracing::debug;

use crate::instances::InstanceId;
use crate::session::SessionKey;

/// What to do when the response for a pending request arrives. An
/// explicit registry of actions, not stored callbacks, so pending work
/// stays inspectable and droppable.
#[derive(Clone, Debug, PartialEq)]
pub enum PendingAction {
    /// Forward the raw response to the instance that issued the
    /// command, restoring the request id the client chose.
    Forward {
        instance_id: InstanceId,
        client_request_id: Option<Value>,
    },
    /// Status refresh issued by the orchestrator itself; the response
    /// only feeds the synchronizer.
    InternalStatus,
    /// Stop issued by the orchestrator; the response confirms the
    /// session is gone.
    ConfirmStop { session_key: SessionKey },
}

#[derive(Debug)]
struct Pending {
    action: PendingAction,
    deadline: Instant,
}

#[derive(Debug)]
pub struct Correlator {
    next_id: u32,
    timeout: Duration,
    pending: HashMap<u32, Pending>,
}

impl Correlator {
    pub fn new(timeout: Duration) -> Self {
        Self::with_first_id(rand::rng().random_range(1..0x4000_0000), timeout)
    }

    /// Deterministic variant, the first registered request gets
    /// `first_id`.
    pub fn with_first_id(first_id: u32, timeout: Duration) -> Self {
        Correlator {
            next_id: first_id.max(1),
            timeout,
            pending: HashMap::new(),
        }
    }

    /// Reserve the next id and remember what to do with its response.
    pub fn register(&mut self, action: PendingAction) -> u32 {
        let id = self.next_id;
        // id 0 marks broadcast frames, never hand it out
        self.next_id = match self.next_id.wrapping_add(1) {
            0 => 1,
            n => n,
        };
        self.pending.insert(
            id,
            Pending {
                action,
                deadline: Instant::now() + self.timeout,
            },
        );
        id
    }

    /// Take the pending action for a response id. A second call with
    /// the same id finds nothing and returns `None`.
    pub fn resolve(&mut self, request_id: u32) -> Option<PendingAction> {
        self.pending.remove(&request_id).map(|p| p.action)
    }

    /// The lane dropped: every pending action fails, exactly once.
    pub fn fail_all(&mut self) -> Vec<PendingAction> {
        self.pending.drain().map(|(_, p)| p.action).collect()
    }

    /// Sweep out requests whose deadline has passed.
    pub fn expire(&mut self, now: Instant) -> Vec<(u32, PendingAction)> {
        let expired: Vec<u32> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        expired
            .into_iter()
            .filter_map(|id| {
                debug!("Request {id} expired");
                self.pending.remove(&id).map(|p| (id, p.action))
            })
            .collect()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

/// Pull the client-chosen `requestId` out of a passthrough payload, so
/// it can be restored on the response.
pub fn take_request_id(payload: &mut Value) -> Option<Value> {
    payload.as_object_mut()?.remove("requestId")
}

/// Stamp a payload with a lane id.
pub fn set_request_id(payload: &mut Value, request_id: u32) {
    if let Some(map) = payload.as_object_mut() {
        map.insert("requestId".to_string(), Value::from(request_id));
    }
}

/// Put the client's original `requestId` back on a response payload.
/// When the client sent none, the stamped id is removed again.
pub fn restore_request_id(payload: &mut Value, client_request_id: Option<Value>) {
    if let Some(map) = payload.as_object_mut() {
        match client_request_id {
            Some(id) => {
                map.insert("requestId".to_string(), id);
            }
            None => {
                map.remove("requestId");
            }
        }
    }
}
