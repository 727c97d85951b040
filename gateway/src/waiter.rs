/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Response waiter: bridges an asynchronously-delivered device reply
//! back to the caller awaiting it, keyed by `(device_id, message_id)`.
//!
//! Grounded on the emulator's one-shot shutdown handshake
//! (`device/src/emulator/emulator_impl/device.rs`): a caller registers a
//! one-shot channel before the triggering write goes out, and whoever
//! observes the matching reply frame delivers it into that channel.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_std::future::timeout;
use async_std::sync::Mutex;
use futures_channel::oneshot;
use gateway_protocol::frame::Frame;

use crate::errors::{WaitError, WaitResult};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WaitKey {
    pub device_id: String,
    pub message_id: u16,
}

impl WaitKey {
    #[must_use]
    pub fn new(device_id: &str, message_id: u16) -> Self {
        Self {
            device_id: device_id.to_string(),
            message_id,
        }
    }
}

struct Entry {
    sender: oneshot::Sender<Frame>,
    registered_at: Instant,
    deadline: Duration,
}

/// Tracks outstanding one-shot waiters. One entry per `(device_id,
/// message_id)` pair; registering a second waiter for the same pair before
/// the first resolves is rejected as [`WaitError::DuplicateWait`] rather than
/// silently replacing it, since that would strand the first caller forever.
#[derive(Default)]
pub struct ResponseWaiter {
    pending: Mutex<HashMap<WaitKey, Entry>>,
}

impl ResponseWaiter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a waiter and blocks until either the matching reply is
    /// delivered, `deadline` elapses, or the waiter is cancelled.
    pub async fn wait(
        &self,
        device_id: &str,
        message_id: u16,
        deadline: Duration,
    ) -> WaitResult<Frame> {
        let key = WaitKey::new(device_id, message_id);
        let (tx, rx) = oneshot::channel();

        {
            let mut pending = self.pending.lock().await;
            if pending.contains_key(&key) {
                return Err(WaitError::DuplicateWait);
            }
            pending.insert(
                key.clone(),
                Entry {
                    sender: tx,
                    registered_at: Instant::now(),
                    deadline,
                },
            );
        }

        let result = timeout(deadline, rx).await;
        self.pending.lock().await.remove(&key);

        match result {
            Ok(Ok(frame)) => Ok(frame),
            Ok(Err(_canceled)) => Err(WaitError::Cancelled),
            Err(_elapsed) => Err(WaitError::Timeout),
        }
    }

    /// Delivers a reply frame to its waiter, if one is still registered.
    /// Returns `true` if a waiter consumed it, `false` if no one was
    /// waiting (a late or unsolicited reply is simply dropped by the
    /// caller).
    pub async fn deliver(&self, device_id: &str, message_id: u16, frame: Frame) -> bool {
        let key = WaitKey::new(device_id, message_id);
        if let Some(entry) = self.pending.lock().await.remove(&key) {
            entry.sender.send(frame).is_ok()
        } else {
            false
        }
    }

    /// Drops every waiter for a device (e.g. on disconnect), causing each
    /// `wait` call to resolve as [`WaitError::Cancelled`].
    pub async fn cleanup_device(&self, device_id: &str) {
        self.pending
            .lock()
            .await
            .retain(|key, _| key.device_id != device_id);
    }

    /// Periodic safety-net sweep: drops any waiter whose own `deadline`
    /// already fired more than twice over, in case its `wait`
    /// caller was itself cancelled or dropped before `timeout()` ran.
    pub async fn sweep_expired(&self) {
        let now = Instant::now();
        self.pending.lock().await.retain(|_, entry| {
            now.duration_since(entry.registered_at) < entry.deadline.saturating_mul(2)
        });
    }

    pub async fn len(&self) -> usize {
        self.pending.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_std::task;

    fn frame() -> Frame {
        Frame::new(0x04A2_28CD, 7, 0x20, vec![1, 2, 3])
    }

    #[async_std::test]
    async fn deliver_wakes_waiter() {
        let waiter = std::sync::Arc::new(ResponseWaiter::new());
        let w = waiter.clone();
        let handle = task::spawn(async move {
            w.wait("04A228CD", 7, Duration::from_secs(5)).await
        });
        task::sleep(Duration::from_millis(10)).await;
        assert!(waiter.deliver("04A228CD", 7, frame()).await);
        let result = handle.await;
        assert_eq!(result.unwrap(), frame());
    }

    #[async_std::test]
    async fn duplicate_wait_is_rejected() {
        let waiter = std::sync::Arc::new(ResponseWaiter::new());
        let w = waiter.clone();
        let _handle = task::spawn(async move {
            let _ = w.wait("04A228CD", 7, Duration::from_secs(5)).await;
        });
        task::sleep(Duration::from_millis(10)).await;
        let result = waiter.wait("04A228CD", 7, Duration::from_millis(10)).await;
        assert_eq!(result.unwrap_err(), WaitError::DuplicateWait);
    }

    #[async_std::test]
    async fn unanswered_wait_times_out() {
        let waiter = ResponseWaiter::new();
        let result = waiter.wait("04A228CD", 9, Duration::from_millis(20)).await;
        assert_eq!(result.unwrap_err(), WaitError::Timeout);
    }

    #[async_std::test]
    async fn undelivered_reply_is_a_no_op() {
        let waiter = ResponseWaiter::new();
        assert!(!waiter.deliver("04A228CD", 1, frame()).await);
    }

    #[async_std::test]
    async fn cleanup_device_drops_only_that_devices_waiters() {
        let waiter = std::sync::Arc::new(ResponseWaiter::new());
        let w1 = waiter.clone();
        let h1 = task::spawn(async move { w1.wait("04A228CD", 1, Duration::from_secs(5)).await });
        let w2 = waiter.clone();
        let h2 = task::spawn(async move { w2.wait("04A228CE", 1, Duration::from_secs(5)).await });
        task::sleep(Duration::from_millis(10)).await;

        waiter.cleanup_device("04A228CD").await;
        assert_eq!(h1.await.unwrap_err(), WaitError::Cancelled);

        assert!(waiter.deliver("04A228CE", 1, frame()).await);
        let _ = h2.await;
    }

    #[async_std::test]
    async fn sweep_expired_removes_stale_entries_past_twice_their_deadline() {
        let waiter = ResponseWaiter::new();
        let key = WaitKey::new("04A228CD", 1);
        waiter.pending.lock().await.insert(
            key,
            Entry {
                sender: oneshot::channel().0,
                registered_at: Instant::now() - Duration::from_secs(10),
                deadline: Duration::from_secs(1),
            },
        );
        assert_eq!(waiter.len().await, 1);
        waiter.sweep_expired().await;
        assert_eq!(waiter.len().await, 0);
    }

    /// Scaled down for a fast test run: many concurrent waiters on
    /// distinct message ids for one device, half delivered and
    /// half left to time out. Exactly the delivered half returns bytes, the
    /// rest return `Timeout`, and no entries are left behind either way.
    #[async_std::test]
    async fn concurrent_waiters_resolve_independently() {
        let waiter = std::sync::Arc::new(ResponseWaiter::new());
        const N: u16 = 100;

        let mut handles = Vec::with_capacity(N as usize);
        for message_id in 0..N {
            let w = waiter.clone();
            handles.push(task::spawn(async move {
                w.wait("04A228CD", message_id, Duration::from_millis(150))
                    .await
            }));
        }

        task::sleep(Duration::from_millis(20)).await;
        for message_id in 0..N {
            if message_id % 2 == 0 {
                let f = Frame::new(0x04A2_28CD, message_id, 0x20, vec![message_id as u8]);
                assert!(waiter.deliver("04A228CD", message_id, f).await);
            }
        }

        for (message_id, handle) in handles.into_iter().enumerate() {
            let result = handle.await;
            if message_id % 2 == 0 {
                assert_eq!(result.unwrap().message_id(), message_id as u16);
            } else {
                assert_eq!(result.unwrap_err(), WaitError::Timeout);
            }
        }

        assert_eq!(waiter.len().await, 0);
    }
}
