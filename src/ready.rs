//! Ready-gate: readiness lives on each [`Connection`](crate::connection::Connection),
//! the gate only reads and resets it per room.

use std::collections::HashMap;

use crate::{connection::ConnId, registry::Registry};

/// Sets the flag for `id`. Returns the room to re-check, or `None` when the
/// connection has not joined one.
pub fn mark_ready(registry: &mut Registry, id: ConnId) -> Option<String> {
    let connection = registry.get_mut(id)?;
    connection.ready = true;
    connection.room.clone()
}

/// A room is all-ready when it has members and every one of them is ready.
pub fn all_ready(registry: &Registry, room: &str) -> bool {
    let members = registry.members(room);
    !members.is_empty()
        && members
            .iter()
            .all(|id| registry.get(*id).is_some_and(|c| c.ready))
}

/// Clears every member's flag so the next race needs fresh ready signals.
pub fn reset(registry: &mut Registry, room: &str) {
    for id in registry.members(room) {
        if let Some(connection) = registry.get_mut(id) {
            connection.ready = false;
        }
    }
}

pub fn snapshot(registry: &Registry, room: &str) -> HashMap<ConnId, bool> {
    registry
        .members(room)
        .into_iter()
        .filter_map(|id| registry.get(id).map(|c| (id, c.ready)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::tests::attach;

    #[test]
    fn empty_room_is_never_ready() {
        let registry = Registry::default();
        assert!(!all_ready(&registry, "r1"));
    }

    #[test]
    fn needs_every_member() {
        let mut registry = Registry::default();
        let (a, _ra) = attach(&mut registry, "a", 4);
        let (b, _rb) = attach(&mut registry, "b", 4);
        let (c, _rc) = attach(&mut registry, "c", 4);
        for id in [a, b, c] {
            registry.register(id, "r1");
        }

        assert_eq!(mark_ready(&mut registry, a).as_deref(), Some("r1"));
        mark_ready(&mut registry, b);
        assert!(!all_ready(&registry, "r1"));
        assert_eq!(
            snapshot(&registry, "r1"),
            HashMap::from([(a, true), (b, true), (c, false)])
        );

        mark_ready(&mut registry, c);
        assert!(all_ready(&registry, "r1"));

        reset(&mut registry, "r1");
        assert!(!all_ready(&registry, "r1"));
        assert!(snapshot(&registry, "r1").values().all(|ready| !ready));
    }

    #[test]
    fn ready_before_join_has_no_room() {
        let mut registry = Registry::default();
        let (a, _ra) = attach(&mut registry, "a", 4);
        assert_eq!(mark_ready(&mut registry, a), None);
        assert_eq!(mark_ready(&mut registry, ConnId::new_v4()), None);
    }
}
