/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! The DNY frame codec.
//!
//! Wire layout, little-endian throughout:
//!
//! ```text
//! offset  size  field
//! 0       3     magic "DNY"
//! 3       2     length L (= 4 + 2 + 1 + dataLen + 2)
//! 5       4     physical_id
//! 9       2     message_id
//! 11      1     command
//! 12      L-9   data
//! 12+L-9  2     checksum
//! ```

use std::io;

use gateway_impl::bytes_io::WriteBytes;
use thiserror::Error;

pub const MAGIC: &[u8; 3] = b"DNY";

/// `L` is counted from `physical_id` through `checksum`, inclusive.
const LENGTH_FIELD_OVERHEAD: usize = 4 + 2 + 1 + 2;

/// Lower bound on `L`: a frame with zero-byte data.
pub const MIN_LENGTH_FIELD: u16 = LENGTH_FIELD_OVERHEAD as u16;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("fewer than {needed} bytes available, have {have}")]
    ShortRead { needed: usize, have: usize },

    #[error("magic bytes do not match \"DNY\"")]
    BadMagic,

    #[error("length field {0} is out of the allowed range")]
    LengthOutOfRange(u16),

    #[error("checksum mismatch: expected {expected:#06x}, computed {computed:#06x}")]
    BadChecksum { expected: u16, computed: u16 },
}

pub type Result<T> = std::result::Result<T, FrameError>;

/// A decoded DNY frame. Owns its data so it can outlive the read buffer it
/// was parsed from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    physical_id: u32,
    message_id: u16,
    command: u8,
    data: Vec<u8>,
}

impl Frame {
    #[must_use]
    pub fn new(physical_id: u32, message_id: u16, command: u8, data: Vec<u8>) -> Self {
        Self {
            physical_id,
            message_id,
            command,
            data,
        }
    }

    #[must_use]
    pub fn physical_id(&self) -> u32 {
        self.physical_id
    }

    #[must_use]
    pub fn message_id(&self) -> u16 {
        self.message_id
    }

    #[must_use]
    pub fn command(&self) -> u8 {
        self.command
    }

    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    #[must_use]
    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    /// `deviceID`: the 8-hex-digit uppercase canonical form of `physical_id`.
    #[must_use]
    pub fn device_id(&self) -> String {
        format_device_id(self.physical_id)
    }

    /// Re-encodes this frame to bytes, the `maxFrameLen`-independent inverse
    /// of [`decode`].
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        encode(self.physical_id, self.message_id, self.command, &self.data)
    }
}

/// `deviceID = uppercase(hex(physicalID, 8))`.
#[must_use]
pub fn format_device_id(physical_id: u32) -> String {
    format!("{physical_id:08X}")
}

/// Tolerates 6-hex or decimal device id strings by integer-parsing then
/// reformatting to the canonical 8-hex-digit form.
#[must_use]
pub fn canonicalize_device_id(input: &str) -> Option<String> {
    let trimmed = input.trim();
    let value = if let Ok(v) = u32::from_str_radix(trimmed, 16) {
        v
    } else {
        trimmed.parse::<u32>().ok()?
    };
    Some(format_device_id(value))
}

/// Encodes a DNY frame. Allocates `5 + 9 + data.len() + 2` bytes.
#[must_use]
pub fn encode(physical_id: u32, message_id: u16, command: u8, data: &[u8]) -> Vec<u8> {
    let length_field = (LENGTH_FIELD_OVERHEAD + data.len()) as u16;
    let mut buf = Vec::with_capacity(5 + 9 + data.len() + 2);

    buf.extend_from_slice(MAGIC);
    buf.write_bytes_le(length_field)
        .expect("writing to a Vec never fails");
    buf.write_bytes_le(physical_id)
        .expect("writing to a Vec never fails");
    buf.write_bytes_le(message_id)
        .expect("writing to a Vec never fails");
    buf.push(command);
    buf.extend_from_slice(data);

    let checksum = additive_checksum(&buf);
    buf.write_bytes_le(checksum)
        .expect("writing to a Vec never fails");
    buf
}

/// Decodes a single frame from the front of `bytes`.
///
/// Returns the frame and the number of bytes it consumed. Never mutates or
/// retains a borrow of `bytes`; never panics on truncated or garbage input.
pub fn decode(bytes: &[u8], max_length_field: u16) -> Result<(Frame, usize)> {
    if bytes.len() < 5 {
        return Err(FrameError::ShortRead {
            needed: 5,
            have: bytes.len(),
        });
    }
    if &bytes[0..3] != MAGIC {
        return Err(FrameError::BadMagic);
    }

    let length_field = u16::from_le_bytes([bytes[3], bytes[4]]);
    if length_field < MIN_LENGTH_FIELD || length_field > max_length_field {
        return Err(FrameError::LengthOutOfRange(length_field));
    }

    let total_len = 5 + length_field as usize;
    if bytes.len() < total_len {
        return Err(FrameError::ShortRead {
            needed: total_len,
            have: bytes.len(),
        });
    }

    let checksum_offset = total_len - 2;
    let expected = u16::from_le_bytes([bytes[checksum_offset], bytes[checksum_offset + 1]]);
    let computed = additive_checksum(&bytes[..checksum_offset]);
    if expected != computed {
        return Err(FrameError::BadChecksum { expected, computed });
    }

    let physical_id = u32::from_le_bytes([bytes[5], bytes[6], bytes[7], bytes[8]]);
    let message_id = u16::from_le_bytes([bytes[9], bytes[10]]);
    let command = bytes[11];
    let data = bytes[12..checksum_offset].to_vec();

    Ok((
        Frame::new(physical_id, message_id, command, data),
        total_len,
    ))
}

/// 16-bit additive checksum: the low 16 bits of the sum of every byte.
fn additive_checksum(bytes: &[u8]) -> u16 {
    bytes
        .iter()
        .fold(0u16, |acc, &b| acc.wrapping_add(u16::from(b)))
}

/// Command `0x82`'s leading-byte fixup: some devices prepend the command
/// byte to the 38-byte payload. Strips it only when the
/// first byte matches the command code, so legitimate shorter/longer
/// payloads are never touched.
pub const COMMAND_CHARGE_CONTROL: u8 = 0x82;
const COMMAND_0X82_FIXUP_LEN: usize = 38;

#[must_use]
pub fn normalize_0x82_payload(command: u8, data: &[u8]) -> &[u8] {
    if command == COMMAND_CHARGE_CONTROL
        && data.len() == COMMAND_0X82_FIXUP_LEN
        && data[0] == COMMAND_CHARGE_CONTROL
    {
        &data[1..]
    } else {
        data
    }
}

/// Writer-side helper so `io::Write` implementors (sockets, buffers) can
/// accept a `Frame` without going through an intermediate `Vec`.
pub fn write_frame(mut w: impl io::Write, frame: &Frame) -> io::Result<()> {
    w.write_all(&frame.to_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX_LEN: u16 = 1024;

    #[test]
    fn encode_decode_roundtrip() {
        let data = vec![0x01, 0x02, 0x03, 0x04, 0x05];
        let bytes = encode(0x04A2_28CD, 0x0007, 0x82, &data);
        let (frame, consumed) = decode(&bytes, MAX_LEN).unwrap();
        assert_eq!(consumed, bytes.len());
        assert_eq!(frame.physical_id(), 0x04A2_28CD);
        assert_eq!(frame.message_id(), 0x0007);
        assert_eq!(frame.command(), 0x82);
        assert_eq!(frame.data(), &data[..]);
        assert_eq!(frame.device_id(), "04A228CD");
    }

    #[test]
    fn empty_data_min_length() {
        let bytes = encode(1, 1, 0x20, &[]);
        let (frame, consumed) = decode(&bytes, MAX_LEN).unwrap();
        assert_eq!(consumed, 5 + MIN_LENGTH_FIELD as usize);
        assert!(frame.data().is_empty());
    }

    #[test]
    fn short_read_below_header() {
        let err = decode(&[b'D', b'N'], MAX_LEN).unwrap_err();
        assert_eq!(
            err,
            FrameError::ShortRead {
                needed: 5,
                have: 2
            }
        );
    }

    #[test]
    fn short_read_below_full_frame() {
        let full = encode(1, 1, 0x20, &[1, 2, 3]);
        let err = decode(&full[..full.len() - 1], MAX_LEN).unwrap_err();
        assert!(matches!(err, FrameError::ShortRead { .. }));
    }

    #[test]
    fn bad_magic() {
        let mut bytes = encode(1, 1, 0x20, &[]);
        bytes[0] = b'X';
        assert_eq!(decode(&bytes, MAX_LEN).unwrap_err(), FrameError::BadMagic);
    }

    #[test]
    fn bad_checksum() {
        let mut bytes = encode(1, 1, 0x20, &[1, 2, 3]);
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        assert!(matches!(
            decode(&bytes, MAX_LEN).unwrap_err(),
            FrameError::BadChecksum { .. }
        ));
    }

    #[test]
    fn length_out_of_range() {
        let mut bytes = encode(1, 1, 0x20, &[]);
        bytes[3] = 0xFF;
        bytes[4] = 0xFF;
        assert!(matches!(
            decode(&bytes, MAX_LEN).unwrap_err(),
            FrameError::LengthOutOfRange(_)
        ));
    }

    #[test]
    fn fixup_strips_leading_command_byte() {
        let mut payload = vec![0x82u8];
        payload.extend(std::iter::repeat(0u8).take(37));
        assert_eq!(payload.len(), 38);
        let stripped = normalize_0x82_payload(0x82, &payload);
        assert_eq!(stripped.len(), 37);

        let untouched = normalize_0x82_payload(0x82, &[0x01, 0x02, 0x03, 0x04, 0x05]);
        assert_eq!(untouched.len(), 5);
    }

    #[test]
    fn canonicalize_tolerates_hex_and_decimal() {
        assert_eq!(
            canonicalize_device_id("04a228cd"),
            Some("04A228CD".to_string())
        );
        assert_eq!(
            canonicalize_device_id(&78_135_245u32.to_string()),
            Some(format_device_id(78_135_245))
        );
    }
}
