// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Server-side session table (§4.8): `{Initial, Prepublish, Preread, Play,
//! Record}` per RFC 2326 session state, keyed by session id, with a
//! background sweep that times out idle sessions.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rand::RngCore;

use crate::sdp_types::MediaDescription;
use crate::transport::TransportSpec;

/// A session's direction/activity state (§3's `ServerSession` state table).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServerSessionState {
    Initial,
    Prepublish,
    Preread,
    Play,
    Record,
}

/// One SETUP'd track within a server session.
#[derive(Clone, Debug)]
pub struct ServerTrack {
    pub media: MediaDescription,
    pub transport: TransportSpec,
}

/// A server-side session: one per client that has issued a SETUP.
pub struct ServerSession {
    pub id: String,
    pub state: ServerSessionState,
    pub tracks: Vec<ServerTrack>,
    pub timeout: Duration,
    pub last_activity: Instant,
}

impl ServerSession {
    fn new(id: String, timeout: Duration) -> Self {
        Self {
            id,
            state: ServerSessionState::Initial,
            tracks: Vec::new(),
            timeout,
            last_activity: Instant::now(),
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn is_expired(&self) -> bool {
        self.last_activity.elapsed() > self.timeout
    }
}

/// Generates a session id the way this crate generates Digest nonces: 16
/// random bytes, hex-encoded (§4.8; reuses [`crate::auth::generate_nonce`]'s
/// shape but is a semantically distinct id space).
pub fn generate_session_id() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// The mutex-protected mapping from session id to session (§5 "shared
/// resources"): one table per listening server, shared by every connection
/// task.
#[derive(Clone, Default)]
pub struct SessionTable {
    inner: Arc<Mutex<HashMap<String, Arc<Mutex<ServerSession>>>>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, default_timeout: Duration) -> Arc<Mutex<ServerSession>> {
        loop {
            let id = generate_session_id();
            let mut map = self.inner.lock().unwrap();
            if map.contains_key(&id) {
                continue;
            }
            let session = Arc::new(Mutex::new(ServerSession::new(id.clone(), default_timeout)));
            map.insert(id, session.clone());
            return session;
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<Mutex<ServerSession>>> {
        self.inner.lock().unwrap().get(id).cloned()
    }

    pub fn remove(&self, id: &str) {
        self.inner.lock().unwrap().remove(id);
    }

    /// Closes and removes every session whose `last_activity` is more than
    /// its own `timeout` in the past, returning their ids so the caller can
    /// invoke `on_session_close` for each (§4.8).
    pub fn sweep_expired(&self) -> Vec<String> {
        let mut map = self.inner.lock().unwrap();
        let expired: Vec<String> = map
            .iter()
            .filter(|(_, s)| s.lock().unwrap().is_expired())
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            map.remove(id);
        }
        expired
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_then_get_round_trips() {
        let table = SessionTable::new();
        let session = table.create(Duration::from_secs(60));
        let id = session.lock().unwrap().id.clone();
        assert!(table.get(&id).is_some());
        table.remove(&id);
        assert!(table.get(&id).is_none());
    }

    #[test]
    fn sweep_expired_evicts_only_stale_sessions() {
        let table = SessionTable::new();
        let fresh = table.create(Duration::from_secs(60));
        let stale = table.create(Duration::from_millis(0));
        std::thread::sleep(Duration::from_millis(5));
        let fresh_id = fresh.lock().unwrap().id.clone();
        let stale_id = stale.lock().unwrap().id.clone();
        let evicted = table.sweep_expired();
        assert_eq!(evicted, vec![stale_id]);
        assert!(table.get(&fresh_id).is_some());
    }
}
