/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Connection lifecycle manager: one [`ConnectionSession`] per accepted
//! TCP connection, indexed by a monotone `conn_id`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_std::sync::RwLock;

use crate::errors::{RegistryError, RegistryResult};

pub type ConnId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitingIccid,
    IccidReceived,
    Registered,
    Active,
    Closing,
    Closed,
}

impl SessionState {
    /// Enforces monotone progression through the connection lifecycle, with
    /// one explicit exception: `Closing`/`Closed` reuse is rejected, not
    /// "reset", since a closed session is never rebound.
    #[must_use]
    pub fn can_advance_to(self, next: Self) -> bool {
        use SessionState::{Active, AwaitingIccid, Closed, Closing, IccidReceived, Registered};
        matches!(
            (self, next),
            (AwaitingIccid, IccidReceived)
                | (IccidReceived, Registered)
                | (Registered, Active)
                | (Active, Active)
                | (Active, Closing)
                | (Registered, Closing)
                | (IccidReceived, Closing)
                | (AwaitingIccid, Closing)
                | (Closing, Closed)
        )
    }
}

pub struct ConnectionSession {
    pub conn_id: ConnId,
    pub remote_addr: SocketAddr,
    pub accepted_at: Instant,
    last_activity_at: RwLock<Instant>,
    state: RwLock<SessionState>,
    /// Set once the ICCID is received and the owning device group is known.
    /// Not a true `Weak` pointer (the group is looked up by key, not by
    /// pointer) but plays the same "doesn't keep the group alive" role.
    iccid: RwLock<Option<String>>,
}

impl ConnectionSession {
    #[must_use]
    fn new(conn_id: ConnId, remote_addr: SocketAddr) -> Self {
        let now = Instant::now();
        Self {
            conn_id,
            remote_addr,
            accepted_at: now,
            last_activity_at: RwLock::new(now),
            state: RwLock::new(SessionState::AwaitingIccid),
            iccid: RwLock::new(None),
        }
    }

    pub async fn touch(&self) {
        *self.last_activity_at.write().await = Instant::now();
    }

    pub async fn last_activity_at(&self) -> Instant {
        *self.last_activity_at.read().await
    }

    pub async fn state(&self) -> SessionState {
        *self.state.read().await
    }

    pub async fn advance_state(&self, next: SessionState) -> RegistryResult<()> {
        let mut guard = self.state.write().await;
        if !guard.can_advance_to(next) {
            return Err(RegistryError::InvalidTransition {
                from: format!("{:?}", *guard),
                to: format!("{next:?}"),
            });
        }
        *guard = next;
        Ok(())
    }

    pub async fn bind_iccid(&self, iccid: String) {
        *self.iccid.write().await = Some(iccid);
    }

    pub async fn iccid(&self) -> Option<String> {
        self.iccid.read().await.clone()
    }
}

/// Allocates `conn_id`s and indexes live sessions. Accept/close are each
/// at-most-once per session; a close racing an accept is never observable
/// (the session simply never gets inserted, see [`ConnectionRegistry::accept`]).
#[derive(Default)]
pub struct ConnectionRegistry {
    next_id: AtomicU64,
    sessions: RwLock<HashMap<ConnId, Arc<ConnectionSession>>>,
}

impl ConnectionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn accept(&self, remote_addr: SocketAddr) -> Arc<ConnectionSession> {
        let conn_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let session = Arc::new(ConnectionSession::new(conn_id, remote_addr));
        self.sessions
            .write()
            .await
            .insert(conn_id, session.clone());
        session
    }

    pub async fn get(&self, conn_id: ConnId) -> Option<Arc<ConnectionSession>> {
        self.sessions.read().await.get(&conn_id).cloned()
    }

    /// Idempotent: closing an already-removed session is a no-op.
    pub async fn close(&self, conn_id: ConnId) {
        self.sessions.write().await.remove(&conn_id);
    }

    /// Safe snapshot iteration: the callback sees a `Vec` clone of the live
    /// sessions at call time and cannot block the registry's lock.
    pub async fn snapshot(&self) -> Vec<Arc<ConnectionSession>> {
        self.sessions.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:9000".parse().unwrap()
    }

    #[async_std::test]
    async fn accept_indexes_by_conn_id() {
        let registry = ConnectionRegistry::new();
        let session = registry.accept(addr()).await;
        assert!(registry.get(session.conn_id).await.is_some());
    }

    #[async_std::test]
    async fn close_is_idempotent() {
        let registry = ConnectionRegistry::new();
        let session = registry.accept(addr()).await;
        registry.close(session.conn_id).await;
        registry.close(session.conn_id).await;
        assert!(registry.get(session.conn_id).await.is_none());
    }

    #[async_std::test]
    async fn closed_session_is_unreachable_by_conn_id() {
        let registry = ConnectionRegistry::new();
        let session = registry.accept(addr()).await;
        assert!(registry.get(session.conn_id).await.is_some());
        registry.close(session.conn_id).await;
        assert!(registry.get(session.conn_id).await.is_none());
    }

    #[async_std::test]
    async fn state_machine_rejects_illegal_transitions() {
        let session = ConnectionSession::new(0, addr());
        assert!(session.advance_state(SessionState::Registered).await.is_err());
        session.advance_state(SessionState::IccidReceived).await.unwrap();
        session.advance_state(SessionState::Registered).await.unwrap();
        session.advance_state(SessionState::Active).await.unwrap();
        session.advance_state(SessionState::Closing).await.unwrap();
        session.advance_state(SessionState::Closed).await.unwrap();
        assert!(session.advance_state(SessionState::Active).await.is_err());
    }
}
