use std::sync::Arc;

use dashmap::mapref::one::RefMut;
use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::room::{spawn_room, RoomCommand, RoomEvent, RoomHandle, RoomSettings};
use crate::types::ConnectionId;

/// Trims and upper-cases a room code. Empty codes are rejected.
pub fn normalize_code(raw: &str) -> Option<String> {
    let code = raw.trim().to_uppercase();
    (!code.is_empty()).then_some(code)
}

/// Registry holds all active rooms, keyed by normalized code.
///
/// Rooms remove their own entry when their last player leaves; see
/// `room::retire`.
pub struct Registry {
    rooms: Arc<DashMap<String, RoomHandle>>,
    settings: RoomSettings,
}

impl Registry {
    pub fn new(settings: RoomSettings) -> Arc<Self> {
        Arc::new(Self {
            rooms: Arc::new(DashMap::new()),
            settings,
        })
    }

    /// Returns the room for `code`, spawning it if absent.
    ///
    /// The guard keeps the entry locked, so an emptied room cannot retire
    /// while a command is being queued through it. Drop it before awaiting.
    /// A room that is still empty after handling any command retires itself,
    /// so one created here without a join lasts only until its first command.
    pub fn get_or_create(&self, code: &str) -> RefMut<'_, String, RoomHandle> {
        self.rooms
            .entry(code.to_string())
            .or_insert_with(|| spawn_room(code.to_string(), self.settings.clone(), self.rooms.clone()))
    }

    /// Adds a connection to a room, creating the room on first join.
    ///
    /// The returned receiver is subscribed before the join is queued, so the
    /// caller sees the room update that announces it.
    pub fn join(
        &self,
        code: &str,
        connection_id: ConnectionId,
        username: String,
    ) -> broadcast::Receiver<RoomEvent> {
        let room = self.get_or_create(code);
        let events = room.subscribe();
        room.send(RoomCommand::Join {
            connection_id,
            username,
        });
        events
    }

    /// Routes a command to the room for `code`. Returns `false` if there is no such room.
    pub fn dispatch(&self, code: &str, cmd: RoomCommand) -> bool {
        match self.rooms.get(code) {
            Some(handle) => handle.send(cmd),
            None => {
                tracing::debug!(room = %code, ?cmd, "command for unknown room dropped");
                false
            }
        }
    }

    /// Detaches a room and stops its task, cancelling its timers.
    pub fn remove(&self, code: &str) -> bool {
        match self.rooms.remove(code) {
            Some((_, handle)) => {
                handle.send(RoomCommand::Shutdown);
                tracing::info!(room = %handle.code, "room removed");
                true
            }
            None => false,
        }
    }

    pub fn get(&self, code: &str) -> Option<RoomHandle> {
        self.rooms.get(code).map(|h| h.clone())
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Stops every room, used on shutdown.
    pub fn clear(&self) {
        let codes: Vec<String> = self.rooms.iter().map(|e| e.key().clone()).collect();
        for code in codes {
            self.remove(&code);
        }
    }
}
