/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Connection hooks: the accept loop, per-socket tuning, and the
//! read/write deadlines used while a connection is alive.
//!
//! `cameleon` talks to cameras over USB, so there is no direct counterpart
//! for TCP accept/tune; this module's shape instead follows the lifecycle of
//! `device/src/emulator/emulator_impl/device.rs`'s `run`/`shutdown` pair:
//! one task owns the connection end to end and tears it down on any error.

use std::os::unix::io::{AsRawFd, FromRawFd};
use std::sync::Arc;
use std::time::Duration;

use async_std::io::{ReadExt, WriteExt};
use async_std::net::{TcpListener, TcpStream};
use async_std::sync::Mutex;
use async_std::task;
use async_trait::async_trait;
use futures_util::StreamExt;
use socket2::Socket;
use tracing::{info, instrument, warn};

use gateway_protocol::demux::{DemuxConfig, Demultiplexer, Token};
use gateway_protocol::frame::Frame;

use crate::dispatch::FrameSink;
use crate::errors::TransportError;
use crate::session::ConnId;

/// The write half the dispatcher targets. Each live connection registers one
/// of these; closing the connection removes it so in-flight writes fail
/// fast with [`TransportError::Closed`] instead of hanging.
pub struct ConnectionWriters {
    streams: Mutex<std::collections::HashMap<ConnId, TcpStream>>,
    write_timeout: Duration,
}

impl ConnectionWriters {
    #[must_use]
    pub fn new(write_timeout: Duration) -> Self {
        Self {
            streams: Mutex::new(std::collections::HashMap::new()),
            write_timeout,
        }
    }

    pub async fn register(&self, conn_id: ConnId, stream: TcpStream) {
        self.streams.lock().await.insert(conn_id, stream);
    }

    pub async fn remove(&self, conn_id: ConnId) {
        self.streams.lock().await.remove(&conn_id);
    }

    /// Write-buffer health probe: checks whether the kernel has a
    /// pending socket error for this connection without consuming any data
    /// or blocking, via `SO_ERROR` (`socket2::Socket::take_error`). A
    /// connection with a pending error is stalled and should be force-closed
    /// by the caller; a connection already gone (no registered writer) is
    /// reported unhealthy too.
    pub async fn is_healthy(&self, conn_id: ConnId) -> bool {
        let streams = self.streams.lock().await;
        let Some(stream) = streams.get(&conn_id) else {
            return false;
        };
        let socket = unsafe { Socket::from_raw_fd(stream.as_raw_fd()) };
        let pending_error = socket.take_error();
        std::mem::forget(socket);
        matches!(pending_error, Ok(None))
    }

    /// Every connection id currently registered, for the health scanner to
    /// walk without holding the writers lock during each probe.
    pub async fn conn_ids(&self) -> Vec<ConnId> {
        self.streams.lock().await.keys().copied().collect()
    }

    /// Shuts down the real socket for a connection (both directions), if one
    /// is still registered. Used by the heartbeat scanner and the write-health
    /// probe to force a stalled or timed-out connection closed: this makes
    /// the owning read task's in-flight read return immediately instead of
    /// waiting out its full read deadline, so the connection's close sequence
    /// runs right away rather than minutes later. Does not remove the map
    /// entry; that happens once the read task's own teardown runs, same as
    /// any other close.
    pub async fn force_close(&self, conn_id: ConnId) -> bool {
        let streams = self.streams.lock().await;
        match streams.get(&conn_id) {
            Some(stream) => {
                let _ = stream.shutdown(std::net::Shutdown::Both);
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl FrameSink for ConnectionWriters {
    async fn write_frame(&self, conn_id: ConnId, frame: &Frame) -> Result<(), TransportError> {
        let mut streams = self.streams.lock().await;
        let stream = streams.get_mut(&conn_id).ok_or(TransportError::Closed)?;
        let bytes = frame.to_bytes();
        match async_std::future::timeout(self.write_timeout, stream.write_all(&bytes)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(TransportError::classify(&err)),
            Err(_elapsed) => Err(TransportError::WriteTimeout),
        }
    }
}

/// Socket tuning parameters applied once at accept time (never as a
/// recurring write deadline — a fixed deadline set here must never apply
/// to later writes, which get their own timeout per call).
#[derive(Debug, Clone, Copy)]
pub struct SocketTuning {
    pub keep_alive_period: Duration,
    pub buffer_size: usize,
}

/// Tunes a newly-accepted socket to the gateway's connection defaults:
/// `TCP_NODELAY` (DNY frames are small and latency-sensitive), TCP keepalive
/// probes at `keep_alive_period`, and `SO_RCVBUF`/`SO_SNDBUF` sized to
/// `buffer_size`. `async-std`'s `TcpStream` exposes `nodelay` directly but
/// not keepalive or buffer sizing, so those go through `socket2` on the raw
/// fd; the `Socket` wrapper is never allowed to close the fd it doesn't own.
pub fn tune_socket(stream: &TcpStream, tuning: SocketTuning) -> std::io::Result<()> {
    stream.set_nodelay(true)?;

    let socket = unsafe { Socket::from_raw_fd(stream.as_raw_fd()) };
    let result = (|| {
        socket.set_keepalive(true)?;
        socket.set_tcp_keepalive(
            &socket2::TcpKeepalive::new().with_time(tuning.keep_alive_period),
        )?;
        socket.set_recv_buffer_size(tuning.buffer_size)?;
        socket.set_send_buffer_size(tuning.buffer_size)?;
        std::io::Result::Ok(())
    })();
    // `socket` does not own `stream`'s fd; forget it instead of letting
    // `Drop` close the fd out from under the live `TcpStream`.
    std::mem::forget(socket);
    result
}

/// One full read-side pass over a connection: demultiplex inbound bytes into
/// tokens and hand each one to `on_token`. Returns when the peer closes the
/// connection or a read error occurs.
#[instrument(skip(stream, on_token, deadline), fields(conn_id))]
pub async fn read_loop<F, Fut>(
    conn_id: ConnId,
    mut stream: TcpStream,
    deadline: impl Fn() -> Duration,
    demux_config: DemuxConfig,
    mut on_token: F,
) where
    F: FnMut(Token) -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    let mut demux = Demultiplexer::new(demux_config);
    let mut buf = [0u8; 4096];

    loop {
        let read_result = async_std::future::timeout(deadline(), stream.read(&mut buf)).await;
        let n = match read_result {
            Ok(Ok(0)) => {
                info!(conn_id, "peer closed connection");
                return;
            }
            Ok(Ok(n)) => n,
            Ok(Err(err)) => {
                warn!(conn_id, %err, "read error, closing connection");
                return;
            }
            Err(_elapsed) => {
                info!(conn_id, "read deadline elapsed, closing connection");
                return;
            }
        };

        match demux.feed(&buf[..n]) {
            Ok(tokens) => {
                for token in tokens {
                    on_token(token).await;
                }
            }
            Err(err) => {
                warn!(conn_id, %err, "inbound buffer overflow, closing connection");
                return;
            }
        }
    }
}

/// Accepts connections forever, spawning one task per connection via
/// `on_accept`. The loop itself never touches protocol state — all of that
/// lives behind `on_accept`'s closure (typically `server::handle_connection`).
pub async fn accept_loop<F, Fut>(listener: TcpListener, tuning: SocketTuning, mut on_accept: F)
where
    F: FnMut(TcpStream) -> Fut,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let mut incoming = listener.incoming();
    while let Some(stream) = incoming.next().await {
        match stream {
            Ok(stream) => {
                if let Err(err) = tune_socket(&stream, tuning) {
                    warn!(%err, "failed to tune accepted socket");
                }
                task::spawn(on_accept(stream));
            }
            Err(err) => {
                warn!(%err, "accept() failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[async_std::test]
    async fn write_to_unregistered_connection_is_closed_error() {
        let writers = ConnectionWriters::new(Duration::from_secs(1));
        let frame = Frame::new(1, 1, 0x20, vec![]);
        let result = writers.write_frame(99, &frame).await;
        assert_eq!(result.unwrap_err(), TransportError::Closed);
    }
}
