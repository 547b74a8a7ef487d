use std::collections::{HashMap, HashSet};

use log::info;

use crate::connection::{ConnId, Connection, Identity};

/// Who is connected and which room each connection sits in.
///
/// `rooms[r]` contains `id` exactly when `connections[id].room == Some(r)`.
/// Every method keeps both sides in step; callers reach the registry only
/// through the coordinator's lock.
#[derive(Debug, Default)]
pub struct Registry {
    connections: HashMap<ConnId, Connection>,
    rooms: HashMap<String, HashSet<ConnId>>,
}

/// What is left of a connection after it has been unregistered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Departed {
    pub identity: Identity,
    pub room: Option<String>,
}

impl Registry {
    /// Adds a freshly upgraded connection that has not joined a room yet.
    pub fn attach(&mut self, connection: Connection) {
        info!(
            "connection {} attached as {}",
            connection.id(),
            connection.identity.username
        );
        self.connections.insert(connection.id(), connection);
    }

    /// Places `id` in `room`, creating the room if needed and leaving any
    /// previous room first. Returns the room that was left, if any.
    ///
    /// Unknown ids are ignored and yield `None`.
    pub fn register(&mut self, id: ConnId, room: &str) -> Option<String> {
        let connection = self.connections.get_mut(&id)?;
        let previous = connection.room.replace(room.to_string());
        if let Some(previous) = &previous {
            Self::leave(&mut self.rooms, previous, id);
        }
        self.rooms.entry(room.to_string()).or_default().insert(id);
        previous.filter(|previous| previous != room)
    }

    /// Removes `id` from its room and from the index, closing its outbound
    /// queue. A second call for the same id is a no-op returning `None`.
    pub fn unregister(&mut self, id: ConnId) -> Option<Departed> {
        let connection = self.connections.remove(&id)?;
        if let Some(room) = &connection.room {
            Self::leave(&mut self.rooms, room, id);
        }
        let Connection {
            identity,
            room,
            outbox,
            ..
        } = connection;
        outbox.close();
        info!("connection {} unregistered", identity.id);
        Some(Departed { identity, room })
    }

    fn leave(rooms: &mut HashMap<String, HashSet<ConnId>>, room: &str, id: ConnId) {
        if let Some(members) = rooms.get_mut(room) {
            members.remove(&id);
            if members.is_empty() {
                rooms.remove(room);
            }
        }
    }

    pub fn get(&self, id: ConnId) -> Option<&Connection> {
        self.connections.get(&id)
    }

    pub fn get_mut(&mut self, id: ConnId) -> Option<&mut Connection> {
        self.connections.get_mut(&id)
    }

    pub fn room_of(&self, id: ConnId) -> Option<&str> {
        self.connections.get(&id)?.room.as_deref()
    }

    /// Current members of `room`, in no particular order.
    pub fn members(&self, room: &str) -> Vec<ConnId> {
        self.rooms
            .get(room)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn member_count(&self, room: &str) -> usize {
        self.rooms.get(room).map_or(0, HashSet::len)
    }

    #[cfg(test)]
    pub fn is_member(&self, room: &str, id: ConnId) -> bool {
        self.rooms
            .get(room)
            .is_some_and(|members| members.contains(&id))
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }
}
