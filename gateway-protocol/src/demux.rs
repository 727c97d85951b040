/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Splits non-framed in-band tokens (raw ICCID digit strings, the `"link"`
//! keepalive) from DNY frames on a single connection's inbound byte stream.
//!
//! A [`Demultiplexer`] owns one growable buffer per connection and is meant
//! to be driven exclusively by that connection's reader task — no internal
//! locking.

use thiserror::Error;
use tracing::warn;

use crate::frame::{self, Frame, FrameError};

#[derive(Debug, Error)]
pub enum DemuxError {
    #[error("inbound buffer exceeded {limit} bytes without yielding a token")]
    BufferOverflow { limit: usize },
}

/// One parsed unit of inbound traffic.
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Frame(Frame),
    BadFrame,
    Iccid(String),
    LinkHeartbeat,
}

#[derive(Debug, Clone)]
pub struct DemuxConfig {
    pub iccid_length: usize,
    pub link_token: &'static str,
    pub max_frame_length_field: u16,
    pub max_buffered_bytes: usize,
}

impl Default for DemuxConfig {
    fn default() -> Self {
        Self {
            iccid_length: 19,
            link_token: "link",
            max_frame_length_field: 1024,
            max_buffered_bytes: 64 * 1024,
        }
    }
}

pub struct Demultiplexer {
    config: DemuxConfig,
    buf: Vec<u8>,
}

impl Demultiplexer {
    #[must_use]
    pub fn new(config: DemuxConfig) -> Self {
        Self {
            config,
            buf: Vec::new(),
        }
    }

    /// Feeds newly-received bytes into the buffer and drains as many tokens
    /// as can be produced without further input.
    pub fn feed(&mut self, bytes: &[u8]) -> std::result::Result<Vec<Token>, DemuxError> {
        self.buf.extend_from_slice(bytes);
        if self.buf.len() > self.config.max_buffered_bytes {
            return Err(DemuxError::BufferOverflow {
                limit: self.config.max_buffered_bytes,
            });
        }

        let mut tokens = Vec::new();
        loop {
            match self.try_take_one() {
                TakeResult::Token(token) => tokens.push(token),
                TakeResult::NeedMoreData => break,
                TakeResult::Empty => break,
            }
        }
        Ok(tokens)
    }

    /// Attempts to consume exactly one token's worth of bytes from the front
    /// of the buffer.
    fn try_take_one(&mut self) -> TakeResult {
        if self.buf.is_empty() {
            return TakeResult::Empty;
        }

        if self.buf.starts_with(frame::MAGIC) {
            return match frame::decode(&self.buf, self.config.max_frame_length_field) {
                Ok((decoded_frame, consumed)) => {
                    self.buf.drain(..consumed);
                    TakeResult::Token(Token::Frame(decoded_frame))
                }
                Err(FrameError::ShortRead { .. }) => TakeResult::NeedMoreData,
                Err(_) => {
                    // Resync: drop the bogus magic byte and let the next
                    // feed() pass look for the following "DNY" occurrence.
                    self.buf.drain(..1);
                    TakeResult::Token(Token::BadFrame)
                }
            };
        }

        if let Some(len) = ascii_digit_run_len(&self.buf) {
            if len >= self.config.iccid_length {
                let iccid: String = self.buf[..len]
                    .iter()
                    .map(|&b| b as char)
                    .collect();
                self.buf.drain(..len);
                return TakeResult::Token(Token::Iccid(iccid));
            }
            // Might still grow into an ICCID with more bytes, unless the
            // whole buffer is already digits and nothing more is coming in
            // this feed() call — caller will feed again later.
            if len == self.buf.len() {
                return TakeResult::NeedMoreData;
            }
        }

        let link_len = self.config.link_token.len();
        if self.buf.len() >= link_len {
            if starts_with_ignore_case(&self.buf, self.config.link_token) {
                self.buf.drain(..link_len);
                return TakeResult::Token(Token::LinkHeartbeat);
            }
        } else if starts_with_ignore_case(&self.buf, &self.config.link_token[..self.buf.len()]) {
            return TakeResult::NeedMoreData;
        }

        warn!(byte = self.buf[0], "dropping unrecognized byte, resyncing");
        self.buf.drain(..1);
        TakeResult::Empty
    }

    #[must_use]
    pub fn buffered_len(&self) -> usize {
        self.buf.len()
    }
}

enum TakeResult {
    Token(Token),
    NeedMoreData,
    Empty,
}

fn ascii_digit_run_len(bytes: &[u8]) -> Option<usize> {
    let len = bytes.iter().take_while(|&&b| b.is_ascii_digit()).count();
    if len == 0 {
        None
    } else {
        Some(len)
    }
}

fn starts_with_ignore_case(bytes: &[u8], token: &str) -> bool {
    let token = token.as_bytes();
    bytes.len() >= token.len()
        && bytes[..token.len()]
            .iter()
            .zip(token)
            .all(|(b, t)| b.eq_ignore_ascii_case(t))
}
