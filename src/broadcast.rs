//! Room fan-out. Delivery to one member never waits on another: each push is
//! non-blocking, and a member whose queue is full or closed is evicted from
//! the registry on the spot.

use log::{info, trace};

use crate::{
    protocol::ServerMessage,
    registry::{Departed, Registry},
};

/// Sends `message` to every member of `room` and returns the members evicted
/// along the way.
pub fn to_room(registry: &mut Registry, room: &str, message: &ServerMessage) -> Vec<Departed> {
    let Some(frame) = message.to_frame() else {
        return vec![];
    };
    let mut dead = vec![];
    for id in registry.members(room) {
        let Some(connection) = registry.get(id) else {
            continue;
        };
        if let Err(e) = connection.outbox.push(frame.clone()) {
            info!("evicting {id} from room {room}: {e}");
            dead.push(id);
        }
    }
    trace!("broadcast to {room}: {message:?}");
    dead.into_iter()
        .filter_map(|id| registry.unregister(id))
        .collect()
}
