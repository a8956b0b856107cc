use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{RwLock, mpsc};
use tracing::{debug, info};
use uuid::Uuid;

use peerlink_types::signal::{SignalCommand, SignalEvent};

/// One connected WebSocket.
pub type SessionId = Uuid;

struct Member {
    tx: mpsc::UnboundedSender<SignalEvent>,
    room: Option<String>,
}

#[derive(Default)]
struct RelayState {
    sessions: HashMap<SessionId, Member>,
    /// room_id -> members
    rooms: HashMap<String, HashSet<SessionId>>,
}

impl RelayState {
    fn send_to_room(&self, room_id: &str, except: SessionId, event: &SignalEvent) {
        let Some(members) = self.rooms.get(room_id) else {
            return;
        };
        for id in members.iter().filter(|id| **id != except) {
            if let Some(member) = self.sessions.get(id) {
                let _ = member.tx.send(event.clone());
            }
        }
    }

    /// Take `session` out of `room_id`, tell the others, drop the room if
    /// it is now empty. Returns false if it was not a member.
    fn remove_from_room(&mut self, session: SessionId, room_id: &str) -> bool {
        let Some(members) = self.rooms.get_mut(room_id) else {
            return false;
        };
        if !members.remove(&session) {
            return false;
        }
        if members.is_empty() {
            self.rooms.remove(room_id);
            debug!(room_id, "Room closed");
        } else {
            self.send_to_room(
                room_id,
                session,
                &SignalEvent::PeerLeft {
                    room_id: room_id.to_string(),
                },
            );
        }
        if let Some(member) = self.sessions.get_mut(&session) {
            if member.room.as_deref() == Some(room_id) {
                member.room = None;
            }
        }
        true
    }
}

/// Owns room membership for every connected session.
#[derive(Clone, Default)]
pub struct Relay {
    state: Arc<RwLock<RelayState>>,
}

impl Relay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new connection. Events for it arrive on the receiver.
    pub async fn register(&self) -> (SessionId, mpsc::UnboundedReceiver<SignalEvent>) {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        self.state
            .write()
            .await
            .sessions
            .insert(id, Member { tx, room: None });
        (id, rx)
    }

    pub async fn handle_command(&self, session: SessionId, cmd: SignalCommand) {
        match cmd {
            SignalCommand::Join { room_id } => self.join(session, room_id).await,
            SignalCommand::Leave { room_id } => {
                self.leave(session, &room_id).await;
            }
            relayed => {
                self.relay(session, relayed).await;
            }
        }
    }

    /// Put `session` in `room_id`, leaving its previous room.
    pub async fn join(&self, session: SessionId, room_id: String) {
        let mut state = self.state.write().await;

        let previous = match state.sessions.get(&session) {
            Some(member) => member.room.clone(),
            None => return,
        };
        if let Some(previous) = previous.filter(|r| *r != room_id) {
            state.remove_from_room(session, &previous);
        }

        let newly_joined = state
            .rooms
            .entry(room_id.clone())
            .or_default()
            .insert(session);
        if let Some(member) = state.sessions.get_mut(&session) {
            member.room = Some(room_id.clone());
            let _ = member.tx.send(SignalEvent::Joined {
                room_id: room_id.clone(),
            });
        }

        if newly_joined {
            state.send_to_room(
                &room_id,
                session,
                &SignalEvent::PeerJoined {
                    room_id: room_id.clone(),
                },
            );
            info!(%session, room_id, "Joined room");
        }
    }

    /// Forward an offer, answer or candidate to the other members of its
    /// room. Dropped unless the sender is in that room.
    pub async fn relay(&self, session: SessionId, cmd: SignalCommand) -> bool {
        let state = self.state.read().await;
        let room_id = cmd.room_id().to_string();

        let is_member = state
            .rooms
            .get(&room_id)
            .is_some_and(|members| members.contains(&session));
        if !is_member {
            debug!(%session, room_id, "Dropping signal from non-member");
            return false;
        }

        match SignalEvent::relayed(cmd) {
            Some(event) => {
                state.send_to_room(&room_id, session, &event);
                true
            }
            None => false,
        }
    }

    pub async fn leave(&self, session: SessionId, room_id: &str) -> bool {
        let left = self.state.write().await.remove_from_room(session, room_id);
        if left {
            info!(%session, room_id, "Left room");
        }
        left
    }

    /// Socket closed: leave the current room and forget the session.
    pub async fn disconnect(&self, session: SessionId) {
        let mut state = self.state.write().await;
        let room = state.sessions.get(&session).and_then(|m| m.room.clone());
        if let Some(room_id) = room {
            state.remove_from_room(session, &room_id);
        }
        state.sessions.remove(&session);
    }

    pub async fn room_size(&self, room_id: &str) -> usize {
        self.state
            .read()
            .await
            .rooms
            .get(room_id)
            .map_or(0, HashSet::len)
    }

    pub async fn room_count(&self) -> usize {
        self.state.read().await.rooms.len()
    }

    pub async fn session_count(&self) -> usize {
        self.state.read().await.sessions.len()
    }
}
