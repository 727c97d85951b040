/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

#![allow(
    clippy::module_name_repetitions,
    clippy::similar_names,
    clippy::missing_errors_doc
)]

//! Connection/device lifecycle, command dispatch, and heartbeat core of an
//! IoT gateway for cellular-attached charging stations speaking the DNY
//! frame protocol (see `gateway-protocol`).

pub mod config;
pub mod dispatch;
pub mod errors;
pub mod events;
pub mod facade;
pub mod heartbeat;
pub mod hooks;
pub mod registry;
pub mod server;
pub mod session;
pub mod storage;
pub mod waiter;

pub use config::GatewayConfig;
pub use errors::{GatewayError, GatewayResult};
pub use facade::{DeviceSnapshot, Gateway, GatewayStats};
pub use server::Server;
