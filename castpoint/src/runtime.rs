//! Threaded shell around [`CastPoint`].
//!
//! The state machine itself is single-threaded. Everything that blocks
//! lives in pump threads which funnel into one crossbeam channel: a
//! discovery pump that reconnects forever, one pump per instance, and a
//! pump for the selection UI. The core thread drains the funnel and
//! owns the `CastPoint` exclusively.

use std::io;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, select, tick, unbounded};
use tracing::{error, info, warn};

use castwire::{ApiInbound, ApiOutbound, DiscoveryCommand, DiscoveryEvent, SelectorCommand, SelectorEvent};

use crate::config::CastPointConfig;
use crate::errors::CastError;
use crate::instances::{InstanceHello, InstanceId};
use crate::point::CastPoint;

/// Both ends of one live discovery connection.
pub struct DiscoveryLink {
    pub commands: Sender<DiscoveryCommand>,
    pub events: Receiver<DiscoveryEvent>,
}

/// Supplies discovery connections, and fresh ones after a drop.
pub trait DiscoveryConnector: Send + 'static {
    fn connect(&mut self) -> Result<DiscoveryLink, CastError>;
}

impl<F> DiscoveryConnector for F
where
    F: FnMut() -> Result<DiscoveryLink, CastError> + Send + 'static,
{
    fn connect(&mut self) -> Result<DiscoveryLink, CastError> {
        self()
    }
}

/// Everything the core thread reacts to.
pub enum CoreEvent {
    DiscoveryUp(Sender<DiscoveryCommand>),
    Discovery(DiscoveryEvent),
    DiscoveryDown,
    InstanceConnected {
        hello: InstanceHello,
        frames: Receiver<ApiInbound>,
        sink: Sender<ApiOutbound>,
    },
    InstanceFrame {
        id: InstanceId,
        frame: ApiInbound,
    },
    InstanceGone {
        id: InstanceId,
    },
    Selector(SelectorEvent),
    Shutdown,
}

/// Handle onto a running orchestrator.
pub struct CastPointHandle {
    events: Sender<CoreEvent>,
    worker: thread::JoinHandle<()>,
}

impl CastPointHandle {
    /// Hand a new instance connection over. Frames arriving on `frames`
    /// are processed in order; responses come back on `sink`.
    pub fn connect_instance(
        &self,
        hello: InstanceHello,
        frames: Receiver<ApiInbound>,
        sink: Sender<ApiOutbound>,
    ) -> Result<(), CastError> {
        self.events
            .send(CoreEvent::InstanceConnected { hello, frames, sink })
            .map_err(|_| CastError::ChannelClosed)
    }

    /// Raw event injection, for embedders that already run their own pumps.
    pub fn events(&self) -> Sender<CoreEvent> {
        self.events.clone()
    }

    /// Stop the core thread and wait for it.
    pub fn shutdown(self) {
        let _ = self.events.send(CoreEvent::Shutdown);
        let _ = self.worker.join();
    }
}

/// Spin up the orchestrator: core thread, discovery pump, selector pump.
pub fn spawn_castpoint_runtime(
    config: CastPointConfig,
    connector: impl DiscoveryConnector,
    selector_commands: Sender<SelectorCommand>,
    selector_events: Receiver<SelectorEvent>,
) -> io::Result<CastPointHandle> {
    let (events_tx, events_rx) = unbounded();

    spawn_discovery_pump(connector, events_tx.clone(), config.discovery_retry())?;
    spawn_selector_pump(selector_events, events_tx.clone())?;

    let tick_interval = config.tick_interval();
    let point = CastPoint::new(config, selector_commands);
    let core_events = events_tx.clone();
    let worker = thread::Builder::new()
        .name("castpoint-core".to_string())
        .spawn(move || run_core(point, events_rx, core_events, tick_interval))?;

    Ok(CastPointHandle {
        events: events_tx,
        worker,
    })
}

fn run_core(
    mut point: CastPoint,
    events: Receiver<CoreEvent>,
    events_tx: Sender<CoreEvent>,
    tick_interval: Duration,
) {
    info!("CastPoint core running");
    let ticker = tick(tick_interval);
    loop {
        select! {
            recv(events) -> event => match event {
                Err(_) => break,
                Ok(CoreEvent::Shutdown) => {
                    info!("CastPoint core shutting down");
                    break;
                }
                Ok(event) => dispatch(&mut point, event, &events_tx),
            },
            recv(ticker) -> _ => point.handle_tick(),
        }
    }
}

fn dispatch(point: &mut CastPoint, event: CoreEvent, events_tx: &Sender<CoreEvent>) {
    match event {
        CoreEvent::DiscoveryUp(commands) => point.handle_discovery_up(commands),
        CoreEvent::Discovery(event) => point.handle_discovery_event(event),
        CoreEvent::DiscoveryDown => point.handle_discovery_lost(),
        CoreEvent::InstanceConnected { hello, frames, sink } => {
            match point.handle_instance_connected(hello, sink) {
                Ok(id) => spawn_instance_pump(id, frames, events_tx.clone()),
                Err(err) => warn!("Instance connection refused: {err}"),
            }
        }
        CoreEvent::InstanceFrame { id, frame } => point.handle_instance_message(id, frame),
        CoreEvent::InstanceGone { id } => point.handle_instance_disconnected(id),
        CoreEvent::Selector(event) => point.handle_selector_event(event),
        CoreEvent::Shutdown => {}
    }
}

/// Reconnect loop. A dropped events channel means the backend went away;
/// the core hears `DiscoveryDown` and the loop tries again after the
/// configured pause.
fn spawn_discovery_pump(
    mut connector: impl DiscoveryConnector,
    events: Sender<CoreEvent>,
    retry: Duration,
) -> io::Result<()> {
    thread::Builder::new()
        .name("castpoint-discovery".to_string())
        .spawn(move || {
            loop {
                match connector.connect() {
                    Ok(link) => {
                        if events.send(CoreEvent::DiscoveryUp(link.commands)).is_err() {
                            return;
                        }
                        for event in link.events.iter() {
                            if events.send(CoreEvent::Discovery(event)).is_err() {
                                return;
                            }
                        }
                        warn!("Discovery connection dropped, retrying in {retry:?}");
                        if events.send(CoreEvent::DiscoveryDown).is_err() {
                            return;
                        }
                    }
                    Err(err) => {
                        warn!("Discovery connection failed: {err}, retrying in {retry:?}");
                    }
                }
                thread::sleep(retry);
            }
        })
        .map(|_| ())
}

fn spawn_selector_pump(
    selector_events: Receiver<SelectorEvent>,
    events: Sender<CoreEvent>,
) -> io::Result<()> {
    thread::Builder::new()
        .name("castpoint-selector".to_string())
        .spawn(move || {
            for event in selector_events.iter() {
                if events.send(CoreEvent::Selector(event)).is_err() {
                    return;
                }
            }
            // The UI is gone. A cancellation resolves whatever dialog
            // is open, and is ignored when none is.
            warn!("Selection UI channel closed");
            let _ = events.send(CoreEvent::Selector(SelectorEvent::Cancelled));
        })
        .map(|_| ())
}

fn spawn_instance_pump(id: InstanceId, frames: Receiver<ApiInbound>, events: Sender<CoreEvent>) {
    let spawned = thread::Builder::new()
        .name(format!("castpoint-instance-{id}"))
        .spawn(move || {
            for frame in frames.iter() {
                if events.send(CoreEvent::InstanceFrame { id, frame }).is_err() {
                    return;
                }
            }
            let _ = events.send(CoreEvent::InstanceGone { id });
        });
    if let Err(err) = spawned {
        error!("Cannot spawn pump for instance {id}: {err}");
    }
}
