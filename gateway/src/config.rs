/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Typed, serializable gateway configuration. Loading this from a file or
//! environment is out of scope for this crate; `Default` matches the
//! documented defaults verbatim so tests and embedders can construct a
//! `GatewayConfig` directly.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Socket read deadline before the first ICCID arrives.
    pub initial_read_deadline: Duration,
    /// Socket read deadline after registration.
    pub read_deadline: Duration,
    /// TCP keepalive probe interval.
    pub keep_alive_period: Duration,
    /// Per-write timeout.
    pub write_timeout: Duration,
    /// Heartbeat scanner period.
    pub heartbeat_check_interval: Duration,
    /// Maximum inactivity before a connection is force-closed.
    pub heartbeat_timeout: Duration,
    /// Startup grace window during which inactivity does not disconnect.
    pub heartbeat_grace: Duration,
    /// Per-command reply window.
    pub command_timeout: Duration,
    /// Retries after a command timeout.
    pub command_retry: u32,
    /// Per-priority queue capacities, in `Priority::ALL` order.
    pub queue_capacities: QueueCapacities,
    /// Expected ICCID digit count.
    pub iccid_length: usize,
    /// Socket `SO_RCVBUF`/`SO_SNDBUF`.
    pub buffer_size: usize,
    /// Hard cap on the DNY length field.
    pub max_frame_len: u16,
    /// Number of command-dispatch worker tasks.
    pub dispatch_workers: usize,
    /// Cap on the internal event bus's channel.
    pub event_bus_capacity: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueCapacities {
    pub urgent: usize,
    pub high: usize,
    pub normal: usize,
    pub low: usize,
}

impl Default for QueueCapacities {
    fn default() -> Self {
        Self {
            urgent: 100,
            high: 200,
            normal: 500,
            low: 1000,
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            initial_read_deadline: Duration::from_secs(60),
            read_deadline: Duration::from_secs(5 * 60),
            keep_alive_period: Duration::from_secs(2 * 60),
            write_timeout: Duration::from_secs(90),
            heartbeat_check_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(5 * 60),
            heartbeat_grace: Duration::from_secs(60),
            command_timeout: Duration::from_secs(15),
            command_retry: 1,
            queue_capacities: QueueCapacities::default(),
            iccid_length: 19,
            buffer_size: 262_144,
            max_frame_len: 1024,
            dispatch_workers: 4,
            event_bus_capacity: 1000,
        }
    }
}
