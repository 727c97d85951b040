/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! The `Gateway` facade: the one public entry point embedders talk to.
//! Grounded on `cameleon/src/camera.rs`'s `Camera` facade, which likewise
//! wraps a control handle, a params store, and a streaming handle behind a
//! handful of high-level methods.

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use gateway_protocol::frame::Frame;

use crate::dispatch::{CommandDispatcher, PendingCommand, Priority};
use crate::errors::{GatewayError, GatewayResult};
use crate::hooks::ConnectionWriters;
use crate::registry::{DeviceRegistry, DeviceStatus};
use crate::session::ConnectionRegistry;
use crate::waiter::ResponseWaiter;

#[derive(Debug, Clone, PartialEq)]
pub struct DeviceSnapshot {
    pub device_id: String,
    pub iccid: String,
    pub device_type: u16,
    pub device_version: String,
    pub status: DeviceStatus,
    pub seconds_since_heartbeat: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GatewayStats {
    pub connection_count: usize,
    pub device_count: usize,
    pub online_device_count: usize,
    /// Commands sent and awaiting confirmation or retry.
    pub pending_command_count: usize,
    /// Backlog per priority, in [`Priority::HIGH_TO_LOW`] order.
    pub queue_lengths: [(Priority, usize); 4],
    /// Connections whose write-buffer health probe is currently
    /// clean. `healthy_connection_count + unhealthy_connection_count` can be
    /// less than `connection_count`: a connection with no registered writer
    /// yet (mid-accept) counts toward neither.
    pub healthy_connection_count: usize,
    pub unhealthy_connection_count: usize,
    /// Devices the heartbeat scanner currently considers offline.
    pub offline_device_count: usize,
}

pub struct Gateway {
    connections: Arc<ConnectionRegistry>,
    devices: Arc<DeviceRegistry>,
    dispatcher: Arc<CommandDispatcher>,
    waiter: Arc<ResponseWaiter>,
    writers: Arc<ConnectionWriters>,
    next_message_id: AtomicU16,
}

impl Gateway {
    #[must_use]
    pub fn new(
        connections: Arc<ConnectionRegistry>,
        devices: Arc<DeviceRegistry>,
        dispatcher: Arc<CommandDispatcher>,
        waiter: Arc<ResponseWaiter>,
        writers: Arc<ConnectionWriters>,
    ) -> Self {
        Self {
            connections,
            devices,
            dispatcher,
            waiter,
            writers,
            next_message_id: AtomicU16::new(1),
        }
    }

    fn alloc_message_id(&self) -> u16 {
        self.next_message_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Fire-and-forget send: enqueues the command and returns as soon as it
    /// is accepted by a priority queue, without waiting for a reply.
    pub async fn send_command(
        &self,
        device_id: &str,
        command: u8,
        data: Vec<u8>,
        priority: Priority,
    ) -> GatewayResult<u16> {
        let device = self
            .devices
            .get_by_device_id(device_id)
            .await
            .ok_or_else(|| {
                GatewayError::Registry(crate::errors::RegistryError::NotFound {
                    entity: device_id.to_string(),
                })
            })?;
        let conn_id = device.conn_id().await.ok_or_else(|| {
            GatewayError::Registry(crate::errors::RegistryError::NotFound {
                entity: device_id.to_string(),
            })
        })?;

        let message_id = self.alloc_message_id();
        self.dispatcher.enqueue(PendingCommand {
            device_id: device_id.to_string(),
            physical_id: device.physical_id,
            conn_id,
            message_id,
            command,
            data,
            priority,
        })?;
        Ok(message_id)
    }

    /// Sends a command and blocks until the matching reply frame is
    /// delivered or `deadline` elapses.
    pub async fn send_command_and_wait(
        &self,
        device_id: &str,
        command: u8,
        data: Vec<u8>,
        priority: Priority,
        deadline: Duration,
    ) -> GatewayResult<Frame> {
        let message_id = self.send_command(device_id, command, data, priority).await?;
        Ok(self.waiter.wait(device_id, message_id, deadline).await?)
    }

    pub async fn is_online(&self, device_id: &str) -> bool {
        match self.devices.get_by_device_id(device_id).await {
            Some(device) => device.status().await == DeviceStatus::Online,
            None => false,
        }
    }

    pub async fn describe(&self, device_id: &str) -> Option<DeviceSnapshot> {
        let device = self.devices.get_by_device_id(device_id).await?;
        let seconds_since_heartbeat = device
            .last_heartbeat_at()
            .await
            .map(|at| Instant::now().duration_since(at).as_secs());
        Some(DeviceSnapshot {
            device_id: device.device_id.clone(),
            iccid: device.iccid.clone(),
            device_type: device.device_type,
            device_version: device.device_version.clone(),
            status: device.status().await,
            seconds_since_heartbeat,
        })
    }

    pub async fn list(&self) -> Vec<DeviceSnapshot> {
        let mut snapshots = Vec::new();
        for device in self.devices.all_devices().await {
            if let Some(snapshot) = self.describe(&device.device_id).await {
                snapshots.push(snapshot);
            }
        }
        snapshots
    }

    pub async fn stats(&self) -> GatewayStats {
        let devices = self.devices.all_devices().await;
        let mut online_device_count = 0;
        let mut offline_device_count = 0;
        for device in &devices {
            match device.status().await {
                DeviceStatus::Online => online_device_count += 1,
                DeviceStatus::Offline => offline_device_count += 1,
                DeviceStatus::Reconnecting | DeviceStatus::Unknown => {}
            }
        }

        let mut healthy_connection_count = 0;
        let mut unhealthy_connection_count = 0;
        for conn_id in self.writers.conn_ids().await {
            if self.writers.is_healthy(conn_id).await {
                healthy_connection_count += 1;
            } else {
                unhealthy_connection_count += 1;
            }
        }

        GatewayStats {
            connection_count: self.connections.len().await,
            device_count: devices.len(),
            online_device_count,
            pending_command_count: self.dispatcher.outstanding_count().await,
            queue_lengths: self.dispatcher.queue_lengths(),
            healthy_connection_count,
            unhealthy_connection_count,
            offline_device_count,
        }
    }
}
