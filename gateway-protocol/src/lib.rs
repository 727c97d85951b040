/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

#![allow(
    clippy::module_name_repetitions,
    clippy::similar_names,
    clippy::missing_errors_doc
)]

pub mod demux;
pub mod frame;

pub use demux::{DemuxConfig, DemuxError, Demultiplexer, Token};
pub use frame::{
    canonicalize_device_id, decode, encode, format_device_id, normalize_0x82_payload, Frame,
    FrameError,
};
