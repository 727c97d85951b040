/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Device registry: the canonical record of known devices, indexed both
//! by device id (formatted physical id) and by ICCID, plus the grouping of
//! sibling devices that share one physical connection.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_std::sync::RwLock;

use gateway_impl::PropertyBag;
use gateway_protocol::frame::format_device_id;

use crate::errors::{RegistryError, RegistryResult};
use crate::session::ConnId;
use crate::storage::{DeviceRecord, Storage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceStatus {
    Online,
    Offline,
    Reconnecting,
    Unknown,
}

impl DeviceStatus {
    /// Valid device status transitions: Online<->Offline directly, or via
    /// Offline->Reconnecting->Online. Every other pair (including anything
    /// originating from `Unknown`, which is only ever assigned directly by
    /// registration, never transitioned into) is rejected.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        use DeviceStatus::{Offline, Online, Reconnecting};
        matches!(
            (self, next),
            (Online, Online)
                | (Offline, Offline)
                | (Reconnecting, Reconnecting)
                | (Online, Offline)
                | (Offline, Online)
                | (Offline, Reconnecting)
                | (Reconnecting, Online)
        )
    }
}

pub struct Device {
    pub device_id: String,
    pub physical_id: u32,
    pub iccid: String,
    pub device_type: u16,
    pub device_version: String,
    pub properties: RwLock<PropertyBag>,
    status: RwLock<DeviceStatus>,
    last_heartbeat_at: RwLock<Option<Instant>>,
    conn_id: RwLock<Option<ConnId>>,
}

impl Device {
    #[must_use]
    fn new(physical_id: u32, iccid: String, device_type: u16, device_version: String) -> Self {
        Self {
            device_id: format_device_id(physical_id),
            physical_id,
            iccid,
            device_type,
            device_version,
            properties: RwLock::new(PropertyBag::new()),
            status: RwLock::new(DeviceStatus::Unknown),
            last_heartbeat_at: RwLock::new(None),
            conn_id: RwLock::new(None),
        }
    }

    pub async fn status(&self) -> DeviceStatus {
        *self.status.read().await
    }

    /// Unconditional status assignment, used by lifecycle effects that are
    /// specified as always succeeding (registration, heartbeat updates,
    /// connection unbinding) rather than the validated `SetStatus` op.
    pub(crate) async fn force_status(&self, status: DeviceStatus) {
        *self.status.write().await = status;
    }

    /// Validated status assignment backing the public `set_status` op:
    /// rejects anything `DeviceStatus::can_transition_to` doesn't allow.
    async fn try_set_status(&self, status: DeviceStatus) -> RegistryResult<()> {
        let mut guard = self.status.write().await;
        if !guard.can_transition_to(status) {
            return Err(RegistryError::InvalidTransition {
                from: format!("{:?}", *guard),
                to: format!("{status:?}"),
            });
        }
        *guard = status;
        Ok(())
    }

    pub async fn last_heartbeat_at(&self) -> Option<Instant> {
        *self.last_heartbeat_at.read().await
    }

    pub async fn update_heartbeat(&self) {
        *self.last_heartbeat_at.write().await = Some(Instant::now());
    }

    pub async fn conn_id(&self) -> Option<ConnId> {
        *self.conn_id.read().await
    }

    async fn bind_conn(&self, conn_id: ConnId) {
        *self.conn_id.write().await = Some(conn_id);
    }

    async fn unbind_conn(&self) {
        *self.conn_id.write().await = None;
    }
}

/// The set of devices multiplexed over a single physical connection
/// (identified by ICCID), e.g. the charging points behind one cellular
/// module.
#[derive(Default)]
pub struct DeviceGroup {
    pub iccid: String,
    devices: RwLock<HashMap<u32, Arc<Device>>>,
}

impl DeviceGroup {
    #[must_use]
    fn new(iccid: String) -> Self {
        Self {
            iccid,
            devices: RwLock::new(HashMap::new()),
        }
    }

    pub async fn devices(&self) -> Vec<Arc<Device>> {
        self.devices.read().await.values().cloned().collect()
    }
}

/// Indexes devices by device id and by ICCID, and tracks ICCID→connection
/// and device→group membership. All public operations take the registry by
/// shared reference; interior `RwLock`s serialize mutation.
#[derive(Default)]
pub struct DeviceRegistry {
    devices_by_id: RwLock<HashMap<String, Arc<Device>>>,
    groups_by_iccid: RwLock<HashMap<String, Arc<DeviceGroup>>>,
    iccid_by_conn: RwLock<HashMap<ConnId, String>>,
    /// Best-effort write-through target; absent in tests and in embedders
    /// that don't need persistence across restarts.
    storage: Option<Arc<dyn Storage>>,
}

impl DeviceRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Binds an ICCID to a connection, creating its `DeviceGroup` if this is
    /// the first time it has been seen. Re-binding the same ICCID to a new
    /// connection (reconnect) overwrites the previous mapping rather than
    /// erroring — this is the normal reconnect path, not a fault.
    pub async fn bind_iccid(&self, conn_id: ConnId, iccid: &str) -> Arc<DeviceGroup> {
        self.iccid_by_conn
            .write()
            .await
            .insert(conn_id, iccid.to_string());

        let mut groups = self.groups_by_iccid.write().await;
        groups
            .entry(iccid.to_string())
            .or_insert_with(|| Arc::new(DeviceGroup::new(iccid.to_string())))
            .clone()
    }

    pub async fn group_by_iccid(&self, iccid: &str) -> Option<Arc<DeviceGroup>> {
        self.groups_by_iccid.read().await.get(iccid).cloned()
    }

    pub async fn group_by_conn(&self, conn_id: ConnId) -> RegistryResult<Arc<DeviceGroup>> {
        let iccid = self
            .iccid_by_conn
            .read()
            .await
            .get(&conn_id)
            .cloned()
            .ok_or(RegistryError::GroupNotFound)?;
        self.group_by_iccid(&iccid)
            .await
            .ok_or(RegistryError::GroupNotFound)
    }

    /// Registers (or re-registers) a device under a physical id within the
    /// group bound to `conn_id`. A device id already registered under a
    /// different ICCID is rejected as [`RegistryError::IdConflict`].
    pub async fn register_device(
        &self,
        conn_id: ConnId,
        physical_id: u32,
        device_type: u16,
        device_version: String,
    ) -> RegistryResult<Arc<Device>> {
        let group = self.group_by_conn(conn_id).await?;

        if let Some(existing) = self.devices_by_id.read().await.get(&format_device_id(physical_id)) {
            if existing.iccid != group.iccid {
                return Err(RegistryError::IdConflict {
                    device_id: existing.device_id.clone(),
                });
            }
        }

        let device = Arc::new(Device::new(
            physical_id,
            group.iccid.clone(),
            device_type,
            device_version,
        ));
        device.bind_conn(conn_id).await;
        device.force_status(DeviceStatus::Online).await;
        device.update_heartbeat().await;

        self.devices_by_id
            .write()
            .await
            .insert(device.device_id.clone(), device.clone());
        group
            .devices
            .write()
            .await
            .insert(physical_id, device.clone());

        if let Some(storage) = &self.storage {
            storage
                .save_device(DeviceRecord {
                    device_id: device.device_id.clone(),
                    iccid: device.iccid.clone(),
                    device_type: device.device_type,
                    device_version: device.device_version.clone(),
                })
                .await;
        }

        Ok(device)
    }

    pub async fn get_by_device_id(&self, device_id: &str) -> Option<Arc<Device>> {
        self.devices_by_id.read().await.get(device_id).cloned()
    }

    pub async fn get_by_physical_id(&self, physical_id: u32) -> Option<Arc<Device>> {
        self.get_by_device_id(&format_device_id(physical_id)).await
    }

    pub async fn get_by_iccid(&self, iccid: &str) -> Vec<Arc<Device>> {
        match self.group_by_iccid(iccid).await {
            Some(group) => group.devices().await,
            None => Vec::new(),
        }
    }

    /// Enforces the valid device status transitions (Online<->Offline,
    /// Offline->Reconnecting->Online); any other pair is rejected as
    /// [`RegistryError::InvalidTransition`].
    pub async fn set_status(&self, device_id: &str, status: DeviceStatus) -> RegistryResult<()> {
        let device = self
            .get_by_device_id(device_id)
            .await
            .ok_or_else(|| RegistryError::NotFound {
                entity: device_id.to_string(),
            })?;
        device.try_set_status(status).await
    }

    pub async fn update_heartbeat(&self, device_id: &str) -> RegistryResult<()> {
        let device = self
            .get_by_device_id(device_id)
            .await
            .ok_or_else(|| RegistryError::NotFound {
                entity: device_id.to_string(),
            })?;
        device.update_heartbeat().await;
        device.force_status(DeviceStatus::Online).await;
        Ok(())
    }

    /// Marks every device in the connection's group as offline and releases
    /// the connection binding. Called from connection-close and from
    /// the heartbeat scanner's timeout path.
    pub async fn unbind_connection(&self, conn_id: ConnId) -> RegistryResult<()> {
        let group = self.group_by_conn(conn_id).await?;
        for device in group.devices().await {
            device.unbind_conn().await;
            device.force_status(DeviceStatus::Offline).await;
        }
        self.iccid_by_conn.write().await.remove(&conn_id);
        Ok(())
    }

    pub async fn all_devices(&self) -> Vec<Arc<Device>> {
        self.devices_by_id.read().await.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStorage;

    #[async_std::test]
    async fn bind_then_register_then_lookup_by_all_keys() {
        let registry = DeviceRegistry::new();
        let group = registry.bind_iccid(1, "89860000000000000001").await;
        assert_eq!(group.iccid, "89860000000000000001");

        let device = registry
            .register_device(1, 0x04A2_28CD, 1, "1.0".into())
            .await
            .unwrap();
        assert_eq!(device.device_id, format_device_id(0x04A2_28CD));

        assert!(registry.get_by_device_id(&device.device_id).await.is_some());
        assert!(registry.get_by_physical_id(0x04A2_28CD).await.is_some());
        assert_eq!(registry.get_by_iccid("89860000000000000001").await.len(), 1);
    }

    #[async_std::test]
    async fn id_conflict_across_iccids_is_rejected() {
        let registry = DeviceRegistry::new();
        registry.bind_iccid(1, "89860000000000000001").await;
        registry
            .register_device(1, 0x04A2_28CD, 1, "1.0".into())
            .await
            .unwrap();

        registry.bind_iccid(2, "89860000000000000002").await;
        let result = registry.register_device(2, 0x04A2_28CD, 1, "1.0".into()).await;
        assert!(matches!(result, Err(RegistryError::IdConflict { .. })));
    }

    #[async_std::test]
    async fn unbind_connection_marks_devices_offline() {
        let registry = DeviceRegistry::new();
        registry.bind_iccid(1, "89860000000000000001").await;
        let device = registry
            .register_device(1, 0x04A2_28CD, 1, "1.0".into())
            .await
            .unwrap();
        assert_eq!(device.status().await, DeviceStatus::Online);

        registry.unbind_connection(1).await.unwrap();
        assert_eq!(device.status().await, DeviceStatus::Offline);
        assert_eq!(device.conn_id().await, None);
    }

    #[async_std::test]
    async fn set_status_rejects_illegal_transition() {
        let registry = DeviceRegistry::new();
        registry.bind_iccid(1, "89860000000000000001").await;
        let device = registry
            .register_device(1, 0x04A2_28CD, 1, "1.0".into())
            .await
            .unwrap();
        assert_eq!(device.status().await, DeviceStatus::Online);

        let result = registry
            .set_status(&device.device_id, DeviceStatus::Reconnecting)
            .await;
        assert!(matches!(result, Err(RegistryError::InvalidTransition { .. })));
        assert_eq!(device.status().await, DeviceStatus::Online);
    }

    #[async_std::test]
    async fn set_status_allows_offline_then_reconnecting_then_online() {
        let registry = DeviceRegistry::new();
        registry.bind_iccid(1, "89860000000000000001").await;
        let device = registry
            .register_device(1, 0x04A2_28CD, 1, "1.0".into())
            .await
            .unwrap();

        registry
            .set_status(&device.device_id, DeviceStatus::Offline)
            .await
            .unwrap();
        registry
            .set_status(&device.device_id, DeviceStatus::Reconnecting)
            .await
            .unwrap();
        assert_eq!(device.status().await, DeviceStatus::Reconnecting);

        registry
            .set_status(&device.device_id, DeviceStatus::Online)
            .await
            .unwrap();
        assert_eq!(device.status().await, DeviceStatus::Online);
    }

    #[async_std::test]
    async fn reconnecting_cannot_go_straight_to_offline() {
        let registry = DeviceRegistry::new();
        registry.bind_iccid(1, "89860000000000000001").await;
        let device = registry
            .register_device(1, 0x04A2_28CD, 1, "1.0".into())
            .await
            .unwrap();
        registry
            .set_status(&device.device_id, DeviceStatus::Offline)
            .await
            .unwrap();
        registry
            .set_status(&device.device_id, DeviceStatus::Reconnecting)
            .await
            .unwrap();

        let result = registry
            .set_status(&device.device_id, DeviceStatus::Offline)
            .await;
        assert!(matches!(result, Err(RegistryError::InvalidTransition { .. })));
    }

    #[async_std::test]
    async fn registration_writes_through_to_storage() {
        let storage = Arc::new(InMemoryStorage::new());
        let registry = DeviceRegistry::new().with_storage(storage.clone());
        registry.bind_iccid(1, "89860000000000000001").await;
        registry
            .register_device(1, 0x04A2_28CD, 1, "1.0".into())
            .await
            .unwrap();

        let record = storage.load_device("04A228CD").await.unwrap();
        assert_eq!(record.iccid, "89860000000000000001");
    }
}
