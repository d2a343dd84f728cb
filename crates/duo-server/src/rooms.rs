//! Room manager.
//!
//! A room pairs exactly two connections for one stranger session. Rooms are
//! never persisted; they end when either member leaves, asks for a new
//! partner, or disconnects.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::{debug, info, warn};

use duo_shared::{ConnectionId, RoomId};

/// An ephemeral 1:1 stranger session.
#[derive(Debug, Clone)]
pub struct Room {
    pub room_id: RoomId,
    members: [ConnectionId; 2],
    pub created_at: DateTime<Utc>,
}

impl Room {
    fn new(room_id: RoomId, a: ConnectionId, b: ConnectionId) -> Self {
        Self {
            room_id,
            members: [a, b],
            created_at: Utc::now(),
        }
    }

    #[cfg(test)]
    pub fn members(&self) -> [ConnectionId; 2] {
        self.members
    }

    /// The other member, if `conn` belongs to this room.
    pub fn partner_of(&self, conn: ConnectionId) -> Option<ConnectionId> {
        match self.members {
            [a, b] if a == conn => Some(b),
            [a, b] if b == conn => Some(a),
            _ => None,
        }
    }
}

/// Result of tearing down a room on behalf of one member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Teardown {
    pub room_id: RoomId,
    pub partner: ConnectionId,
}

/// Tracks live rooms and which room each connection is in.
///
/// The room map is authoritative: a membership entry whose room has already
/// been removed is treated as "no room".
pub struct RoomManager {
    rooms: DashMap<RoomId, Room>,
    membership: DashMap<ConnectionId, RoomId>,
}

impl RoomManager {
    pub fn new() -> Self {
        Self {
            rooms: DashMap::new(),
            membership: DashMap::new(),
        }
    }

    /// Create a room for two distinct connections that are not already in a
    /// room. Returns `None` if either precondition fails.
    pub fn create_room(&self, a: ConnectionId, b: ConnectionId) -> Option<RoomId> {
        if a == b {
            warn!(conn = %a, "Refusing to pair a connection with itself");
            return None;
        }
        if self.room_of(a).is_some() || self.room_of(b).is_some() {
            warn!(a = %a, b = %b, "Refusing to pair a connection that is already in a room");
            return None;
        }

        let room_id = RoomId::new();
        self.rooms.insert(room_id, Room::new(room_id, a, b));
        self.membership.insert(a, room_id);
        self.membership.insert(b, room_id);

        info!(room = %room_id, a = %a, b = %b, rooms = self.rooms.len(), "Created room");
        Some(room_id)
    }

    /// Remove the room `conn` belongs to, clearing both members' mappings.
    /// Only one caller can win the removal, so the partner is reported once.
    pub fn teardown(&self, conn: ConnectionId) -> Option<Teardown> {
        let (_, room_id) = self.membership.remove(&conn)?;

        let Some((_, room)) = self.rooms.remove(&room_id) else {
            debug!(conn = %conn, room = %room_id, "Room already torn down");
            return None;
        };

        let partner = room.partner_of(conn)?;
        self.membership
            .remove_if(&partner, |_, current| *current == room_id);

        info!(
            room = %room_id,
            conn = %conn,
            partner = %partner,
            lifetime_secs = (Utc::now() - room.created_at).num_seconds(),
            "Room torn down"
        );

        Some(Teardown { room_id, partner })
    }

    pub fn room_of(&self, conn: ConnectionId) -> Option<RoomId> {
        let room_id = *self.membership.get(&conn)?;
        self.rooms.contains_key(&room_id).then_some(room_id)
    }

    pub fn partner_of(&self, conn: ConnectionId) -> Option<ConnectionId> {
        let room_id = *self.membership.get(&conn)?;
        self.rooms.get(&room_id)?.partner_of(conn)
    }

    #[cfg(test)]
    pub fn get(&self, room_id: &RoomId) -> Option<Room> {
        self.rooms.get(room_id).map(|r| r.value().clone())
    }

    #[cfg(test)]
    pub fn list_rooms(&self) -> Vec<RoomId> {
        self.rooms.iter().map(|r| *r.key()).collect()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}

impl Default for RoomManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: ConnectionId = ConnectionId(1);
    const B: ConnectionId = ConnectionId(2);
    const C: ConnectionId = ConnectionId(3);

    #[test]
    fn test_create_and_lookup() {
        let manager = RoomManager::new();
        let room_id = manager.create_room(A, B).unwrap();

        assert_eq!(manager.room_of(A), Some(room_id));
        assert_eq!(manager.room_of(B), Some(room_id));
        assert_eq!(manager.partner_of(A), Some(B));
        assert_eq!(manager.partner_of(B), Some(A));
        assert_eq!(manager.get(&room_id).unwrap().members(), [A, B]);
        assert_eq!(manager.room_count(), 1);
    }

    #[test]
    fn test_teardown_clears_both_members() {
        let manager = RoomManager::new();
        let room_id = manager.create_room(A, B).unwrap();

        let teardown = manager.teardown(A).unwrap();
        assert_eq!(teardown, Teardown { room_id, partner: B });

        assert_eq!(manager.room_of(A), None);
        assert_eq!(manager.room_of(B), None);
        assert!(manager.list_rooms().is_empty());

        // The partner tearing down afterwards finds nothing to report.
        assert_eq!(manager.teardown(B), None);
    }

    #[test]
    fn test_connection_in_at_most_one_room() {
        let manager = RoomManager::new();
        manager.create_room(A, B).unwrap();

        assert!(manager.create_room(A, C).is_none());
        assert!(manager.create_room(C, B).is_none());
        assert!(manager.create_room(C, C).is_none());
        assert_eq!(manager.room_count(), 1);
        assert_eq!(manager.room_of(C), None);
    }

    #[test]
    fn test_member_can_be_repaired_after_teardown() {
        let manager = RoomManager::new();
        let first = manager.create_room(A, B).unwrap();
        manager.teardown(B).unwrap();

        let second = manager.create_room(A, C).unwrap();
        assert_ne!(first, second);
        assert_eq!(manager.partner_of(A), Some(C));
        assert_eq!(manager.partner_of(B), None);
    }
}
