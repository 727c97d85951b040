/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Pluggable persistence seam for device/port/protocol records.
//!
//! Writes from the device registry are asynchronous and best-effort; the
//! in-memory registries remain the source of truth. A durable backend is
//! out of scope here — this trait is the seam a caller would implement one
//! behind.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

#[derive(Debug, Clone, PartialEq)]
pub struct DeviceRecord {
    pub device_id: String,
    pub iccid: String,
    pub device_type: u16,
    pub device_version: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PortRecord {
    pub device_id: String,
    pub port_index: u8,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProtocolRecord {
    pub device_id: String,
    pub command: u8,
    pub last_seen_message_id: u16,
}

/// A minimal `Save`/`Load`/`Delete` surface per record kind, kept generic
/// over the record type rather than one trait per kind, since the three
/// operations are identical in shape.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn save_device(&self, record: DeviceRecord);
    async fn load_device(&self, device_id: &str) -> Option<DeviceRecord>;
    async fn delete_device(&self, device_id: &str);

    async fn save_port(&self, record: PortRecord);
    async fn load_port(&self, device_id: &str, port_index: u8) -> Option<PortRecord>;
    async fn delete_port(&self, device_id: &str, port_index: u8);

    async fn save_protocol(&self, record: ProtocolRecord);
    async fn load_protocol(&self, device_id: &str, command: u8) -> Option<ProtocolRecord>;
    async fn delete_protocol(&self, device_id: &str, command: u8);
}

/// Default in-memory implementation. Never returns an error: the contract is
/// best-effort and memory is always authoritative.
#[derive(Default)]
pub struct InMemoryStorage {
    devices: Mutex<HashMap<String, DeviceRecord>>,
    ports: Mutex<HashMap<(String, u8), PortRecord>>,
    protocols: Mutex<HashMap<(String, u8), ProtocolRecord>>,
}

impl InMemoryStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn save_device(&self, record: DeviceRecord) {
        self.devices
            .lock()
            .unwrap()
            .insert(record.device_id.clone(), record);
    }

    async fn load_device(&self, device_id: &str) -> Option<DeviceRecord> {
        self.devices.lock().unwrap().get(device_id).cloned()
    }

    async fn delete_device(&self, device_id: &str) {
        self.devices.lock().unwrap().remove(device_id);
    }

    async fn save_port(&self, record: PortRecord) {
        self.ports
            .lock()
            .unwrap()
            .insert((record.device_id.clone(), record.port_index), record);
    }

    async fn load_port(&self, device_id: &str, port_index: u8) -> Option<PortRecord> {
        self.ports
            .lock()
            .unwrap()
            .get(&(device_id.to_string(), port_index))
            .cloned()
    }

    async fn delete_port(&self, device_id: &str, port_index: u8) {
        self.ports
            .lock()
            .unwrap()
            .remove(&(device_id.to_string(), port_index));
    }

    async fn save_protocol(&self, record: ProtocolRecord) {
        self.protocols
            .lock()
            .unwrap()
            .insert((record.device_id.clone(), record.command), record);
    }

    async fn load_protocol(&self, device_id: &str, command: u8) -> Option<ProtocolRecord> {
        self.protocols
            .lock()
            .unwrap()
            .get(&(device_id.to_string(), command))
            .cloned()
    }

    async fn delete_protocol(&self, device_id: &str, command: u8) {
        self.protocols
            .lock()
            .unwrap()
            .remove(&(device_id.to_string(), command));
    }
}
