/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Command dispatcher: four priority queues feeding a worker pool that
//! writes frames to their owning connection, retries unconfirmed commands
//! with backoff, and gives up after the configured retry count.
//!
//! Grounded on `cameleon/src/u3v/control_handle.rs::send_cmd`'s retry loop,
//! generalized from one in-flight command per control handle to many
//! in-flight commands tracked in a shared map.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_channel::{bounded, Receiver, Sender};
use async_std::sync::Mutex;
use async_std::task;
use async_trait::async_trait;
use futures_util::future::{select_all, FutureExt};
use rand::Rng;
use tracing::debug;

use gateway_protocol::frame::Frame;

use crate::errors::{DispatchError, DispatchResult, TransportError};
use crate::events::{Event, EventSink};
use crate::session::ConnId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    Low,
    Normal,
    High,
    Urgent,
}

impl Priority {
    /// Highest first: the order workers drain queues in.
    pub const HIGH_TO_LOW: [Priority; 4] = [
        Priority::Urgent,
        Priority::High,
        Priority::Normal,
        Priority::Low,
    ];
}

/// Write side the dispatcher depends on; implemented by the connection hooks
/// over the live socket. Kept as a trait object so `dispatch` never
/// depends on `async-std::net` directly.
#[async_trait]
pub trait FrameSink: Send + Sync {
    async fn write_frame(&self, conn_id: ConnId, frame: &Frame) -> Result<(), TransportError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommandKey {
    pub physical_id: u32,
    pub message_id: u16,
    pub command: u8,
}

pub struct PendingCommand {
    pub device_id: String,
    pub physical_id: u32,
    pub conn_id: ConnId,
    pub message_id: u16,
    pub command: u8,
    pub data: Vec<u8>,
    pub priority: Priority,
}

impl PendingCommand {
    fn key(&self) -> CommandKey {
        CommandKey {
            physical_id: self.physical_id,
            message_id: self.message_id,
            command: self.command,
        }
    }
}

struct Outstanding {
    conn_id: ConnId,
    device_id: String,
    command: u8,
    message_id: u16,
    frame: Frame,
    attempts: u32,
}

pub struct DispatchConfig {
    pub command_timeout: Duration,
    pub max_retries: u32,
    pub worker_count: usize,
    /// Capacities in [`Priority::HIGH_TO_LOW`] order: urgent, high, normal, low.
    pub queue_capacities: [usize; 4],
}

struct Queues {
    senders: HashMap<Priority, Sender<PendingCommand>>,
    receivers: [Receiver<PendingCommand>; 4],
}

pub struct CommandDispatcher {
    queues: Queues,
    outstanding: Arc<Mutex<HashMap<CommandKey, Outstanding>>>,
    sink: Arc<dyn FrameSink>,
    events: Arc<dyn EventSink>,
    config: DispatchConfig,
}

impl CommandDispatcher {
    #[must_use]
    pub fn new(config: DispatchConfig, sink: Arc<dyn FrameSink>, events: Arc<dyn EventSink>) -> Self {
        let mut senders = HashMap::new();
        let mut receivers = Vec::with_capacity(4);
        for (priority, capacity) in Priority::HIGH_TO_LOW
            .iter()
            .copied()
            .zip(config.queue_capacities.iter().copied())
        {
            let (tx, rx) = bounded(capacity);
            senders.insert(priority, tx);
            receivers.push(rx);
        }
        let receivers: [Receiver<PendingCommand>; 4] = receivers.try_into().unwrap_or_else(|_| {
            unreachable!("exactly four priorities are always pushed")
        });

        Self {
            queues: Queues { senders, receivers },
            outstanding: Arc::new(Mutex::new(HashMap::new())),
            sink,
            events,
            config,
        }
    }

    /// Enqueues a command for dispatch. Non-blocking: a full queue is
    /// reported as [`DispatchError::QueueFull`] rather than waited out.
    pub fn enqueue(&self, command: PendingCommand) -> DispatchResult<()> {
        let priority = command.priority;
        let sender = self
            .queues
            .senders
            .get(&priority)
            .expect("every Priority has a queue");
        sender.try_send(command).map_err(|_| DispatchError::QueueFull {
            priority: format!("{priority:?}"),
        })
    }

    /// Marks a command as acknowledged, cancelling its retry supervisor.
    /// Returns `true` if a matching outstanding command was found.
    pub async fn confirm(&self, physical_id: u32, message_id: u16, command: u8) -> bool {
        let key = CommandKey {
            physical_id,
            message_id,
            command,
        };
        let Some(pending) = self.outstanding.lock().await.remove(&key) else {
            return false;
        };
        self.events
            .emit(Event::CommandConfirmed {
                device_id: pending.device_id,
                command,
                message_id,
            })
            .await;
        true
    }

    pub async fn clear_by_connection(&self, conn_id: ConnId) {
        self.outstanding
            .lock()
            .await
            .retain(|_, pending| pending.conn_id != conn_id);
    }

    pub async fn clear_by_physical_id(&self, physical_id: u32) {
        self.outstanding
            .lock()
            .await
            .retain(|key, _| key.physical_id != physical_id);
    }

    /// Number of commands currently tracked as outstanding (sent, awaiting
    /// confirmation or retry).
    pub async fn outstanding_count(&self) -> usize {
        self.outstanding.lock().await.len()
    }

    /// Snapshot of each priority queue's current backlog, in
    /// [`Priority::HIGH_TO_LOW`] order.
    pub fn queue_lengths(&self) -> [(Priority, usize); 4] {
        let mut lengths = [(Priority::Urgent, 0usize); 4];
        for (slot, (priority, receiver)) in lengths
            .iter_mut()
            .zip(Priority::HIGH_TO_LOW.iter().zip(self.queues.receivers.iter()))
        {
            *slot = (*priority, receiver.len());
        }
        lengths
    }

    /// Spawns the configured number of worker tasks. Each pulls the highest
    /// priority command available, sends it, and hands retry supervision off
    /// to a detached task so the worker can immediately pick up the next
    /// command.
    pub fn spawn_workers(self: &Arc<Self>) {
        for worker_id in 0..self.config.worker_count {
            let dispatcher = self.clone();
            task::spawn(async move {
                dispatcher.run_worker(worker_id).await;
            });
        }
    }

    async fn run_worker(self: Arc<Self>, worker_id: usize) {
        loop {
            let command = recv_highest_priority(&self.queues.receivers).await;
            self.send_and_supervise(command, worker_id).await;
        }
    }

    async fn send_and_supervise(self: &Arc<Self>, command: PendingCommand, worker_id: usize) {
        let key = command.key();
        let frame = Frame::new(
            command.physical_id,
            command.message_id,
            command.command,
            command.data,
        );

        self.outstanding.lock().await.insert(
            key,
            Outstanding {
                conn_id: command.conn_id,
                device_id: command.device_id.clone(),
                command: command.command,
                message_id: command.message_id,
                frame: frame.clone(),
                attempts: 1,
            },
        );

        let device_id = command.device_id.clone();
        if let Err(err) = self.sink.write_frame(command.conn_id, &frame).await {
            debug!(worker_id, ?err, "initial command write failed");
            if !err.is_retryable() {
                self.outstanding.lock().await.remove(&key);
                self.events
                    .emit(Event::CommandFailed {
                        device_id,
                        command: key.command,
                        message_id: key.message_id,
                        reason: err.to_string(),
                    })
                    .await;
                return;
            }
        }
        self.events
            .emit(Event::CommandSent {
                device_id,
                command: key.command,
                message_id: key.message_id,
            })
            .await;

        let dispatcher = self.clone();
        task::spawn(async move {
            dispatcher.supervise_retries(key).await;
        });
    }

    async fn supervise_retries(self: Arc<Self>, key: CommandKey) {
        loop {
            let backoff = jittered_backoff(self.config.command_timeout, 1);
            task::sleep(backoff).await;

            let mut outstanding = self.outstanding.lock().await;
            let Some(pending) = outstanding.get_mut(&key) else {
                return;
            };

            if pending.attempts > self.config.max_retries {
                let device_id = pending.device_id.clone();
                let command = pending.command;
                let message_id = pending.message_id;
                outstanding.remove(&key);
                drop(outstanding);
                self.events
                    .emit(Event::CommandFailed {
                        device_id,
                        command,
                        message_id,
                        reason: "unconfirmed after exhausting retries".to_string(),
                    })
                    .await;
                return;
            }

            pending.attempts += 1;
            let conn_id = pending.conn_id;
            let device_id = pending.device_id.clone();
            let frame = pending.frame.clone();
            drop(outstanding);

            if let Err(err) = self.sink.write_frame(conn_id, &frame).await {
                if !err.is_retryable() {
                    self.outstanding.lock().await.remove(&key);
                    self.events
                        .emit(Event::CommandFailed {
                            device_id,
                            command: key.command,
                            message_id: key.message_id,
                            reason: err.to_string(),
                        })
                        .await;
                    return;
                }
            }
        }
    }
}

async fn recv_highest_priority(receivers: &[Receiver<PendingCommand>; 4]) -> PendingCommand {
    loop {
        for receiver in receivers {
            if let Ok(command) = receiver.try_recv() {
                return command;
            }
        }
        let waiters: Vec<_> = receivers.iter().map(|r| r.recv().boxed()).collect();
        let (result, _, _) = select_all(waiters).await;
        if let Ok(command) = result {
            return command;
        }
    }
}

fn jittered_backoff(base: Duration, attempt: u32) -> Duration {
    let mut rng = rand::thread_rng();
    let jitter_ms: u64 = rng.gen_range(0..=50);
    base.saturating_mul(attempt.max(1)) + Duration::from_millis(jitter_ms)
}
