//! Client and discovery-session directory.
//!
//! Owns every [`Client`], [`Session`] and [`PeerHandle`] record plus the
//! id counters behind them.  The directory performs no HAL traffic; the
//! dispatcher decides when records are created or destroyed and this module
//! keeps the bookkeeping consistent.
//!
//! Id rules:
//!
//! - session ids come from a counter that never rewinds, so they strictly
//!   increase for the directory's lifetime;
//! - peer ids are allocated once per `(session, requestor instance id)` and
//!   survive MAC address changes of that peer.

use std::collections::{BTreeMap, HashMap};

use log::{debug, info};
use serde::Serialize;

use crate::request::{ConfigRequest, SessionConfig};
use crate::types::{
    CallbackId, ClientId, MacAddr, PeerId, PubSubId, RequestorInstanceId, Role, SessionId, Uid,
};

// ── Records ───────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct Client {
    pub client_id: ClientId,
    pub uid: Uid,
    pub pid: u32,
    pub package: String,
    pub config: ConfigRequest,
    pub wants_identity: bool,
    /// Owned sessions in creation order.
    pub sessions: Vec<SessionId>,
}

impl Client {
    pub fn new(
        client_id: ClientId,
        uid: Uid,
        pid: u32,
        package: impl Into<String>,
        config: ConfigRequest,
        wants_identity: bool,
    ) -> Self {
        Self {
            client_id,
            uid,
            pid,
            package: package.into(),
            config,
            wants_identity,
            sessions: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PeerHandle {
    pub peer_id: PeerId,
    pub mac: MacAddr,
    pub requestor_instance_id: RequestorInstanceId,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub session_id: SessionId,
    pub client_id: ClientId,
    pub callback: CallbackId,
    pub pub_sub_id: PubSubId,
    pub config: SessionConfig,
    pub suspended: bool,
    peers: BTreeMap<RequestorInstanceId, PeerHandle>,
}

impl Session {
    pub fn role(&self) -> Role {
        self.config.role()
    }

    pub fn peers(&self) -> impl Iterator<Item = &PeerHandle> {
        self.peers.values()
    }

    pub fn peer(&self, peer_id: PeerId) -> Option<&PeerHandle> {
        self.peers.values().find(|p| p.peer_id == peer_id)
    }
}

/// Session-scoped handshake (bootstrapping or pairing) awaiting confirmation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handshake {
    pub client_id: ClientId,
    pub session_id: SessionId,
    pub peer_id: PeerId,
}

// ── Directory ─────────────────────────────────────────────────

#[derive(Debug)]
pub struct Directory {
    /// Attach order matters for the merger.
    clients: Vec<Client>,
    sessions: BTreeMap<SessionId, Session>,
    next_session_id: SessionId,
    next_peer_id: PeerId,
    bootstraps: HashMap<u32, Handshake>,
    pairings: HashMap<u32, Handshake>,
}

impl Default for Directory {
    fn default() -> Self {
        Self::new()
    }
}

impl Directory {
    pub fn new() -> Self {
        Self {
            clients: Vec::new(),
            sessions: BTreeMap::new(),
            next_session_id: 1,
            next_peer_id: 1,
            bootstraps: HashMap::new(),
            pairings: HashMap::new(),
        }
    }

    // ── Clients ──────────────────────────────────────────────

    pub fn contains_client(&self, client_id: ClientId) -> bool {
        self.clients.iter().any(|c| c.client_id == client_id)
    }

    pub fn client(&self, client_id: ClientId) -> Option<&Client> {
        self.clients.iter().find(|c| c.client_id == client_id)
    }

    pub fn clients(&self) -> impl Iterator<Item = &Client> {
        self.clients.iter()
    }

    pub fn client_ids(&self) -> Vec<ClientId> {
        self.clients.iter().map(|c| c.client_id).collect()
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Merger input for the attached clients, in attach order.
    pub fn requests(&self) -> impl Iterator<Item = (&ConfigRequest, bool)> {
        self.clients.iter().map(|c| (&c.config, c.wants_identity))
    }

    /// Returns `false` if the id is already attached.
    pub fn insert_client(&mut self, client: Client) -> bool {
        if self.contains_client(client.client_id) {
            return false;
        }
        info!(
            "directory: client {} attached (uid {}, pid {}, {})",
            client.client_id, client.uid, client.pid, client.package
        );
        self.clients.push(client);
        true
    }

    /// Detach a client and hand back its sessions in creation order.
    pub fn remove_client(&mut self, client_id: ClientId) -> Option<(Client, Vec<Session>)> {
        let idx = self.clients.iter().position(|c| c.client_id == client_id)?;
        let client = self.clients.remove(idx);
        let sessions = client
            .sessions
            .iter()
            .filter_map(|sid| self.take_session(*sid))
            .collect();
        info!("directory: client {client_id} detached");
        Some((client, sessions))
    }

    pub fn clients_wanting_identity(&self) -> Vec<ClientId> {
        self.clients
            .iter()
            .filter(|c| c.wants_identity)
            .map(|c| c.client_id)
            .collect()
    }

    // ── Sessions ─────────────────────────────────────────────

    /// Bind a new session to `client_id`.  `None` if the client is gone.
    pub fn create_session(
        &mut self,
        client_id: ClientId,
        callback: CallbackId,
        pub_sub_id: PubSubId,
        config: SessionConfig,
    ) -> Option<SessionId> {
        let client = self.clients.iter_mut().find(|c| c.client_id == client_id)?;
        let session_id = self.next_session_id;
        self.next_session_id += 1;
        client.sessions.push(session_id);
        info!(
            "directory: session {session_id} ({:?}, pub/sub id {pub_sub_id}) started for client {client_id}",
            config.role()
        );
        self.sessions.insert(
            session_id,
            Session {
                session_id,
                client_id,
                callback,
                pub_sub_id,
                config,
                suspended: false,
                peers: BTreeMap::new(),
            },
        );
        Some(session_id)
    }

    pub fn session(&self, session_id: SessionId) -> Option<&Session> {
        self.sessions.get(&session_id)
    }

    pub fn session_mut(&mut self, session_id: SessionId) -> Option<&mut Session> {
        self.sessions.get_mut(&session_id)
    }

    /// The session, only if `client_id` owns it.
    pub fn owned_session(&self, client_id: ClientId, session_id: SessionId) -> Option<&Session> {
        self.sessions
            .get(&session_id)
            .filter(|s| s.client_id == client_id)
    }

    pub fn owned_session_mut(
        &mut self,
        client_id: ClientId,
        session_id: SessionId,
    ) -> Option<&mut Session> {
        self.sessions
            .get_mut(&session_id)
            .filter(|s| s.client_id == client_id)
    }

    pub fn sessions(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values()
    }

    pub fn session_ids(&self, client_id: ClientId) -> Vec<SessionId> {
        self.client(client_id)
            .map(|c| c.sessions.clone())
            .unwrap_or_default()
    }

    /// Look up by HAL id, optionally constrained to a role.
    pub fn session_by_pub_sub(&self, pub_sub_id: PubSubId, role: Option<Role>) -> Option<SessionId> {
        self.sessions
            .values()
            .find(|s| s.pub_sub_id == pub_sub_id && role.is_none_or(|r| s.role() == r))
            .map(|s| s.session_id)
    }

    pub fn count_role(&self, role: Role) -> usize {
        self.sessions.values().filter(|s| s.role() == role).count()
    }

    /// Remove a session and detach it from its client.
    pub fn remove_session(&mut self, session_id: SessionId) -> Option<Session> {
        let session = self.take_session(session_id)?;
        if let Some(client) = self
            .clients
            .iter_mut()
            .find(|c| c.client_id == session.client_id)
        {
            client.sessions.retain(|s| *s != session_id);
        }
        Some(session)
    }

    fn take_session(&mut self, session_id: SessionId) -> Option<Session> {
        let session = self.sessions.remove(&session_id)?;
        self.bootstraps.retain(|_, h| h.session_id != session_id);
        self.pairings.retain(|_, h| h.session_id != session_id);
        info!("directory: session {session_id} removed");
        Some(session)
    }

    // ── Peers ────────────────────────────────────────────────

    /// Resolve (or allocate) the peer id for a firmware notification.
    ///
    /// A known requestor keeps its id; only its MAC is refreshed.
    pub fn resolve_peer(
        &mut self,
        session_id: SessionId,
        requestor_instance_id: RequestorInstanceId,
        mac: MacAddr,
    ) -> Option<PeerId> {
        let session = self.sessions.get_mut(&session_id)?;
        if let Some(peer) = session.peers.get_mut(&requestor_instance_id) {
            if peer.mac != mac {
                debug!(
                    "directory: peer {} of session {session_id} moved {} -> {mac}",
                    peer.peer_id, peer.mac
                );
                peer.mac = mac;
            }
            return Some(peer.peer_id);
        }
        let peer_id = self.next_peer_id;
        self.next_peer_id += 1;
        session.peers.insert(
            requestor_instance_id,
            PeerHandle {
                peer_id,
                mac,
                requestor_instance_id,
            },
        );
        debug!("directory: new peer {peer_id} ({mac}) in session {session_id}");
        Some(peer_id)
    }

    /// Peer id already bound to `requestor_instance_id`, without allocating.
    pub fn known_peer(
        &self,
        session_id: SessionId,
        requestor_instance_id: RequestorInstanceId,
    ) -> Option<PeerId> {
        self.sessions
            .get(&session_id)?
            .peers
            .get(&requestor_instance_id)
            .map(|p| p.peer_id)
    }

    /// HAL addressing for a follow-up message to `peer_id`.
    pub fn transmit_target(
        &self,
        session_id: SessionId,
        peer_id: PeerId,
    ) -> Option<(PubSubId, RequestorInstanceId, MacAddr)> {
        let session = self.sessions.get(&session_id)?;
        let peer = session.peer(peer_id)?;
        Some((session.pub_sub_id, peer.requestor_instance_id, peer.mac))
    }

    /// MACs for the requested peers, restricted to sessions owned by `uid`.
    /// Foreign and unknown ids are left out.
    pub fn request_mac_addresses(&self, uid: Uid, peer_ids: &[PeerId]) -> BTreeMap<PeerId, MacAddr> {
        let mut out = BTreeMap::new();
        for session in self.sessions.values() {
            let same_uid = self
                .client(session.client_id)
                .is_some_and(|c| c.uid == uid);
            if !same_uid {
                continue;
            }
            for peer in session.peers.values() {
                if peer_ids.contains(&peer.peer_id) {
                    out.insert(peer.peer_id, peer.mac);
                }
            }
        }
        out
    }

    // ── Handshakes ───────────────────────────────────────────

    pub fn track_bootstrap(&mut self, bootstrap_id: u32, handshake: Handshake) {
        self.bootstraps.insert(bootstrap_id, handshake);
    }

    pub fn take_bootstrap(&mut self, bootstrap_id: u32) -> Option<Handshake> {
        self.bootstraps.remove(&bootstrap_id)
    }

    pub fn track_pairing(&mut self, pairing_id: u32, handshake: Handshake) {
        self.pairings.insert(pairing_id, handshake);
    }

    pub fn pairing(&self, pairing_id: u32) -> Option<&Handshake> {
        self.pairings.get(&pairing_id)
    }

    pub fn take_pairing(&mut self, pairing_id: u32) -> Option<Handshake> {
        self.pairings.remove(&pairing_id)
    }

    /// Drop everything; id counters keep running.
    pub fn clear(&mut self) -> Vec<(Client, Vec<Session>)> {
        let ids = self.client_ids();
        ids.into_iter()
            .filter_map(|id| self.remove_client(id))
            .collect()
    }
}
