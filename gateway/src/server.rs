/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Top-level wiring: constructs every subsystem in dependency order,
//! runs the accept loop, and tears everything down on shutdown.
//!
//! Grounded on `device/src/emulator/emulator_impl/device.rs`'s
//! construction/shutdown handshake: one `Shutdown` signal cloned into every
//! long-running task, awaited at teardown rather than abandoned.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_std::net::{TcpListener, TcpStream};
use async_std::task;
use futures_channel::oneshot;
use gateway_protocol::demux::{DemuxConfig, Token};
use gateway_protocol::frame::normalize_0x82_payload;
use tracing::{info, warn};

use crate::config::GatewayConfig;
use crate::dispatch::{CommandDispatcher, DispatchConfig, FrameSink};
use crate::events::{Event, EventBus, EventSink};
use crate::facade::Gateway;
use crate::hooks::{self, ConnectionWriters};
use crate::registry::DeviceRegistry;
use crate::session::{ConnectionRegistry, SessionState};
use crate::storage::Storage;
use crate::waiter::ResponseWaiter;

/// Device registration command: a valid DNY frame with command 0x20.
/// A register frame always gets an automatic ack echoed back with the same
/// `physical_id`/`message_id`, distinct from the generic response-matching
/// path used by ordinary commands.
const REGISTER_COMMAND: u8 = 0x20;

/// Every shared subsystem, constructed once in `Server::build` and handed
/// out to tasks as `Arc` clones.
pub struct Server {
    pub config: GatewayConfig,
    pub connections: Arc<ConnectionRegistry>,
    pub devices: Arc<DeviceRegistry>,
    pub writers: Arc<ConnectionWriters>,
    pub dispatcher: Arc<CommandDispatcher>,
    pub waiter: Arc<ResponseWaiter>,
    pub events: Arc<EventBus>,
    pub gateway: Arc<Gateway>,
}

impl Server {
    /// Construction order: registries → storage → event bus → dispatcher
    /// workers → response waiter → (heartbeat/hooks are started separately
    /// by `run`, once the facade exists).
    #[must_use]
    pub fn build(config: GatewayConfig, storage: Option<Arc<dyn Storage>>) -> Self {
        let connections = Arc::new(ConnectionRegistry::new());
        let mut devices = DeviceRegistry::new();
        if let Some(storage) = storage {
            devices = devices.with_storage(storage);
        }
        let devices = Arc::new(devices);

        let events = Arc::new(EventBus::new(config.event_bus_capacity));
        let writers = Arc::new(ConnectionWriters::new(config.write_timeout));

        let dispatcher = Arc::new(CommandDispatcher::new(
            DispatchConfig {
                command_timeout: config.command_timeout,
                max_retries: config.command_retry,
                worker_count: config.dispatch_workers,
                queue_capacities: [
                    config.queue_capacities.urgent,
                    config.queue_capacities.high,
                    config.queue_capacities.normal,
                    config.queue_capacities.low,
                ],
            },
            writers.clone(),
            events.clone() as Arc<dyn EventSink>,
        ));
        dispatcher.spawn_workers();

        let waiter = Arc::new(ResponseWaiter::new());

        let gateway = Arc::new(Gateway::new(
            connections.clone(),
            devices.clone(),
            dispatcher.clone(),
            waiter.clone(),
            writers.clone(),
        ));

        Self {
            config,
            connections,
            devices,
            writers,
            dispatcher,
            waiter,
            events,
            gateway,
        }
    }

    /// Starts the heartbeat scanner and the accept loop, and blocks until
    /// `shutdown` fires.
    pub async fn run(self: Arc<Self>, listener: TcpListener, shutdown: oneshot::Receiver<()>) {
        let heartbeat_handle = task::spawn({
            let config = crate::heartbeat::HeartbeatConfig {
                check_interval: self.config.heartbeat_check_interval,
                timeout: self.config.heartbeat_timeout,
                grace: self.config.heartbeat_grace,
            };
            let devices = self.devices.clone();
            let connections = self.connections.clone();
            let writers = self.writers.clone();
            let dispatcher = self.dispatcher.clone();
            let events = self.events.clone() as Arc<dyn EventSink>;
            async move {
                crate::heartbeat::run(config, devices, connections, writers, dispatcher, events).await;
            }
        });

        let waiter_sweep_handle = task::spawn({
            let waiter = self.waiter.clone();
            let interval = self.config.heartbeat_check_interval;
            async move {
                loop {
                    task::sleep(interval).await;
                    waiter.sweep_expired().await;
                }
            }
        });

        let accept_handle = task::spawn({
            let server = self.clone();
            let tuning = hooks::SocketTuning {
                keep_alive_period: self.config.keep_alive_period,
                buffer_size: self.config.buffer_size,
            };
            async move {
                hooks::accept_loop(listener, tuning, move |stream| {
                    let server = server.clone();
                    async move {
                        server.handle_connection(stream).await;
                    }
                })
                .await;
            }
        });

        let _ = shutdown.await;
        info!("shutdown requested");
        heartbeat_handle.cancel().await;
        waiter_sweep_handle.cancel().await;
        accept_handle.cancel().await;
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream) {
        let remote_addr = match stream.peer_addr() {
            Ok(addr) => addr,
            Err(err) => {
                warn!(%err, "could not read peer address");
                return;
            }
        };
        let session = self.connections.accept(remote_addr).await;
        self.writers.register(session.conn_id, stream.clone()).await;
        self.events
            .emit(Event::ConnectionAccepted {
                conn_id: session.conn_id,
            })
            .await;

        let demux_config = DemuxConfig {
            iccid_length: self.config.iccid_length,
            link_token: "link",
            max_frame_length_field: self.config.max_frame_len,
            max_buffered_bytes: self.config.buffer_size,
        };

        let conn_id = session.conn_id;
        let server = self.clone();
        let registered = Arc::new(AtomicBool::new(false));
        let initial_read_deadline = self.config.initial_read_deadline;
        let read_deadline = self.config.read_deadline;
        let deadline_flag = registered.clone();
        hooks::read_loop(
            conn_id,
            stream,
            move || {
                if deadline_flag.load(Ordering::Relaxed) {
                    read_deadline
                } else {
                    initial_read_deadline
                }
            },
            demux_config,
            move |token| {
                let server = server.clone();
                let session = session.clone();
                let registered = registered.clone();
                async move {
                    server.handle_token(&session, token).await;
                    if matches!(session.state().await, SessionState::Registered | SessionState::Active) {
                        registered.store(true, Ordering::Relaxed);
                    }
                }
            },
        )
        .await;

        if let Ok(group) = self.devices.group_by_conn(conn_id).await {
            for device in group.devices().await {
                self.waiter.cleanup_device(&device.device_id).await;
                self.events
                    .emit(Event::DeviceStatusChanged {
                        device_id: device.device_id.clone(),
                        status: crate::registry::DeviceStatus::Offline,
                    })
                    .await;
            }
        }
        let _ = self.devices.unbind_connection(conn_id).await;
        self.dispatcher.clear_by_connection(conn_id).await;
        self.writers.remove(conn_id).await;
        self.connections.close(conn_id).await;
        self.events
            .emit(Event::ConnectionClosed { conn_id })
            .await;
    }

    async fn handle_token(&self, session: &Arc<crate::session::ConnectionSession>, token: Token) {
        session.touch().await;

        match token {
            Token::Iccid(iccid) => {
                let group = self.devices.bind_iccid(session.conn_id, &iccid).await;
                session.bind_iccid(group.iccid.clone()).await;
                let _ = session.advance_state(SessionState::IccidReceived).await;
            }
            Token::LinkHeartbeat => {
                // Keepalive only; `session.touch()` above already recorded it.
            }
            Token::BadFrame => {
                warn!(conn_id = session.conn_id, "dropped malformed frame");
            }
            Token::Frame(raw_frame) => {
                let normalized = normalize_0x82_payload(raw_frame.command(), raw_frame.data()).to_vec();
                let frame = gateway_protocol::frame::Frame::new(
                    raw_frame.physical_id(),
                    raw_frame.message_id(),
                    raw_frame.command(),
                    normalized,
                );
                let device_id = frame.device_id();

                if self.devices.get_by_device_id(&device_id).await.is_none() {
                    if self
                        .devices
                        .register_device(session.conn_id, frame.physical_id(), 0, String::new())
                        .await
                        .is_ok()
                    {
                        let _ = session.advance_state(SessionState::Registered).await;
                        let _ = session.advance_state(SessionState::Active).await;
                        self.events
                            .emit(Event::DeviceRegistered {
                                device_id: device_id.clone(),
                                iccid: session.iccid().await.unwrap_or_default(),
                            })
                            .await;
                        self.events
                            .emit(Event::DeviceStatusChanged {
                                device_id: device_id.clone(),
                                status: crate::registry::DeviceStatus::Online,
                            })
                            .await;
                    }
                }

                if self.devices.update_heartbeat(&device_id).await.is_ok() {
                    self.events
                        .emit(Event::Heartbeat {
                            device_id: device_id.clone(),
                        })
                        .await;
                }

                if frame.command() == REGISTER_COMMAND {
                    let ack = gateway_protocol::frame::Frame::new(
                        frame.physical_id(),
                        frame.message_id(),
                        REGISTER_COMMAND,
                        vec![0x00],
                    );
                    if let Err(err) = self.writers.write_frame(session.conn_id, &ack).await {
                        warn!(conn_id = session.conn_id, %err, "failed to send registration ack");
                    }
                }

                let delivered = self
                    .waiter
                    .deliver(&device_id, frame.message_id(), frame.clone())
                    .await;
                if !delivered {
                    self.dispatcher
                        .confirm(frame.physical_id(), frame.message_id(), frame.command())
                        .await;
                }
            }
        }
    }
}

