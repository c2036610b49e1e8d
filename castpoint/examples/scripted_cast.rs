//! End-to-end walkthrough against a scripted receiver.
//!
//! A fake discovery backend announces two devices and answers launches
//! and media polls; a fake selection UI always picks the first device.
//! One page instance then casts, sends a media command and leaves.

use std::thread;
use std::time::Duration;

use anyhow::Result;
use crossbeam_channel::unbounded;
use tracing::info;

use castpoint::{CastError, CastPointConfig, DiscoveryLink, InstanceHello, spawn_castpoint_runtime};
use castwire::{
    ApiConfig, ApiInbound, ApiOutbound, Application, AutoJoinPolicy, ContentContext,
    DeviceDescriptor, DeviceId, DiscoveryCommand, DiscoveryEvent, MediaStatus, MediaStatusMessage,
    Namespace, PlayerState, ReceiverStatus, ReceiverStatusMessage, SelectorCommand, SelectorEvent,
    SessionRequest,
};

const APP_ID: &str = "CC1AD845";

fn demo_app(session_id: &str) -> Application {
    Application {
        app_id: APP_ID.to_string(),
        session_id: session_id.to_string(),
        transport_id: Some(format!("t-{session_id}")),
        display_name: Some("Default Media Receiver".to_string()),
        status_text: Some("Ready".to_string()),
        namespaces: vec![Namespace {
            name: "urn:x-cast:com.google.cast.media".to_string(),
        }],
    }
}

/// Discovery backend that plays a receiver from a script.
fn scripted_receiver() -> DiscoveryLink {
    let (commands_tx, commands_rx) = unbounded();
    let (events_tx, events_rx) = unbounded::<DiscoveryEvent>();
    thread::spawn(move || {
        for command in commands_rx.iter() {
            match command {
                DiscoveryCommand::StartDiscovery { .. } => {
                    for (id, name) in [("d1", "Living Room"), ("d2", "Bedroom")] {
                        let _ = events_tx.send(DiscoveryEvent::DeviceUp {
                            device: DeviceDescriptor {
                                id: DeviceId::new(id),
                                friendly_name: name.to_string(),
                                capabilities: Default::default(),
                            },
                        });
                    }
                }
                DiscoveryCommand::CreateSession { device_id, .. } => {
                    let _ = events_tx.send(DiscoveryEvent::DeviceStatus {
                        device_id,
                        status: ReceiverStatusMessage {
                            request_id: None,
                            status: ReceiverStatus {
                                applications: vec![demo_app("s-demo")],
                                volume: None,
                                is_active_input: None,
                            },
                        },
                    });
                }
                DiscoveryCommand::SendMediaMessage { device_id, message } => {
                    let request_id = message["requestId"].as_u64().map(|id| id as u32);
                    let mut status = MediaStatus::new(1);
                    status.player_state = PlayerState::Playing;
                    status.current_time = Some(42.0);
                    let _ = events_tx.send(DiscoveryEvent::DeviceMediaStatus {
                        device_id,
                        status: MediaStatusMessage {
                            request_id,
                            status: vec![status],
                        },
                    });
                }
                DiscoveryCommand::SendDeviceMessage { device_id, message } => {
                    if message["type"] == "STOP" {
                        let request_id = message["requestId"].as_u64().map(|id| id as u32);
                        let _ = events_tx.send(DiscoveryEvent::DeviceStatus {
                            device_id,
                            status: ReceiverStatusMessage {
                                request_id,
                                status: ReceiverStatus::default(),
                            },
                        });
                    }
                }
                DiscoveryCommand::StopApp { .. } | DiscoveryCommand::StopDiscovery => {}
            }
        }
    });
    DiscoveryLink {
        commands: commands_tx,
        events: events_rx,
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    // selection UI that always picks the first offered device
    let (selector_commands_tx, selector_commands_rx) = unbounded();
    let (selector_events_tx, selector_events_rx) = unbounded();
    thread::spawn(move || {
        for command in selector_commands_rx.iter() {
            if let SelectorCommand::Open { devices, .. } = command {
                info!("dialog: {} device(s) on offer", devices.len());
                let _ = selector_events_tx.send(SelectorEvent::Selected {
                    device_id: devices[0].id.clone(),
                    media_type: Default::default(),
                });
            }
        }
    });

    let handle = spawn_castpoint_runtime(
        CastPointConfig::default(),
        move || Ok::<DiscoveryLink, CastError>(scripted_receiver()),
        selector_commands_tx,
        selector_events_rx,
    )?;

    let (frames_tx, frames_rx) = unbounded();
    let (sink_tx, sink_rx) = unbounded();
    let hello = InstanceHello::page(ContentContext::new(1, 0, Some("https://demo.app".to_string())));
    handle.connect_instance(hello, frames_rx, sink_tx)?;

    frames_tx.send(ApiInbound::InitializeSdk {
        api_config: ApiConfig {
            session_request: SessionRequest::new(APP_ID),
            auto_join_policy: AutoJoinPolicy::TabAndOriginScoped,
        },
    })?;
    frames_tx.send(ApiInbound::RequestSession {
        session_request: SessionRequest::new(APP_ID),
        receiver_device_id: None,
    })?;

    while let Ok(frame) = sink_rx.recv_timeout(Duration::from_secs(2)) {
        match &frame {
            ApiOutbound::SessionCreated { session } => {
                info!("page <- session {} on {}", session.session_id, session.device.friendly_name);
                frames_tx.send(ApiInbound::MediaCommand {
                    payload: serde_json::json!({"type": "PLAY", "requestId": 1}),
                })?;
            }
            ApiOutbound::CommandResponse { payload } => {
                info!("page <- answer to request {}", payload["requestId"]);
                frames_tx.send(ApiInbound::LeaveSession)?;
            }
            ApiOutbound::SessionLeft { session_id } => {
                info!("page <- left {session_id}");
                break;
            }
            other => info!("page <- {other:?}"),
        }
    }

    handle.shutdown();
    info!("done");
    Ok(())
}
