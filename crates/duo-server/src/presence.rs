//! Presence registry.
//!
//! Maps a stable [`UserId`] to its live profile and to the group of
//! connections currently bound to it. Every "send to user" goes through the
//! group, so all tabs/devices of a user receive the event; a user with no
//! live connections silently receives nothing.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info};

use duo_shared::constants::{DEFAULT_AGE, DEFAULT_AVATAR_SEED, DEFAULT_NICKNAME};
use duo_shared::protocol::ProfileFields;
use duo_shared::{ConnectionId, ServerEvent, UserId};

/// Sending half of a connection's outbound event queue.
pub type Outbound = mpsc::Sender<ServerEvent>;

/// Public profile of a user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Profile {
    pub nickname: String,
    pub age: String,
    pub avatar_seed: String,
}

/// In-memory record of a user. Survives disconnects for the lifetime of the
/// process.
#[derive(Debug)]
pub struct UserRecord {
    pub id: UserId,
    pub profile: Profile,
    pub friends: HashSet<UserId>,
}

impl UserRecord {
    fn new(id: UserId, fields: &ProfileFields) -> Self {
        let mut record = Self {
            id,
            profile: Profile {
                nickname: DEFAULT_NICKNAME.to_string(),
                age: DEFAULT_AGE.to_string(),
                avatar_seed: DEFAULT_AVATAR_SEED.to_string(),
            },
            friends: HashSet::new(),
        };
        record.merge(fields);
        record
    }

    /// Apply non-empty fields; absent or blank values keep the current one.
    pub fn merge(&mut self, fields: &ProfileFields) {
        if let Some(nickname) = non_empty(&fields.nickname) {
            self.profile.nickname = nickname;
        }
        if let Some(age) = non_empty(&fields.age) {
            self.profile.age = age;
        }
        if let Some(seed) = non_empty(&fields.avatar_seed) {
            self.profile.avatar_seed = seed;
        }
    }
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

struct ConnectionHandle {
    user_id: UserId,
    outbound: Outbound,
}

/// Registry of users, live connections, and per-user connection groups.
pub struct PresenceRegistry {
    users: DashMap<UserId, Arc<Mutex<UserRecord>>>,
    connections: DashMap<ConnectionId, ConnectionHandle>,
    groups: DashMap<UserId, HashSet<ConnectionId>>,
    next_connection: AtomicU64,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self {
            users: DashMap::new(),
            connections: DashMap::new(),
            groups: DashMap::new(),
            next_connection: AtomicU64::new(1),
        }
    }

    /// Bind a new connection to `user_id`, creating the user on first sight
    /// or merging the supplied profile fields into the existing record.
    pub async fn register(
        &self,
        user_id: UserId,
        fields: &ProfileFields,
        outbound: Outbound,
    ) -> ConnectionId {
        let conn = ConnectionId(self.next_connection.fetch_add(1, Ordering::Relaxed));

        let mut created = false;
        let record = Arc::clone(
            self.users
                .entry(user_id.clone())
                .or_insert_with(|| {
                    created = true;
                    Arc::new(Mutex::new(UserRecord::new(user_id.clone(), fields)))
                })
                .value(),
        );
        if !created {
            record.lock().await.merge(fields);
        }

        self.connections.insert(
            conn,
            ConnectionHandle {
                user_id: user_id.clone(),
                outbound,
            },
        );
        let group_size = {
            let mut group = self.groups.entry(user_id.clone()).or_default();
            group.insert(conn);
            group.len()
        };

        info!(
            conn = %conn,
            user = %user_id.short(),
            new_user = created,
            connections = group_size,
            "Connection registered"
        );

        conn
    }

    /// Remove a connection. The user record itself is kept.
    pub fn unregister(&self, conn: ConnectionId) -> Option<UserId> {
        let (_, handle) = self.connections.remove(&conn)?;
        let user_id = handle.user_id;

        if let Some(mut group) = self.groups.get_mut(&user_id) {
            group.remove(&conn);
        }
        self.groups.remove_if(&user_id, |_, group| group.is_empty());

        info!(conn = %conn, user = %user_id.short(), "Connection unregistered");
        Some(user_id)
    }

    /// Merge profile fields into the record of the user behind `conn`.
    pub async fn update_profile(&self, conn: ConnectionId, fields: &ProfileFields) -> Option<Profile> {
        let user_id = self.user_of(conn)?;
        let record = self.record(&user_id)?;
        let mut record = record.lock().await;
        record.merge(fields);
        debug!(user = %user_id.short(), "Profile updated");
        Some(record.profile.clone())
    }

    pub async fn lookup(&self, user_id: &UserId) -> Option<Profile> {
        let record = self.record(user_id)?;
        let profile = record.lock().await.profile.clone();
        Some(profile)
    }

    /// Shared handle to a user record, for compound updates that must hold
    /// the record lock.
    pub(crate) fn record(&self, user_id: &UserId) -> Option<Arc<Mutex<UserRecord>>> {
        self.users.get(user_id).map(|r| Arc::clone(r.value()))
    }

    pub fn user_of(&self, conn: ConnectionId) -> Option<UserId> {
        self.connections.get(&conn).map(|h| h.user_id.clone())
    }

    /// Live connections of a user, in allocation order. Empty if offline.
    pub fn connections_for(&self, user_id: &UserId) -> Vec<ConnectionId> {
        let mut conns: Vec<ConnectionId> = self
            .groups
            .get(user_id)
            .map(|group| group.iter().copied().collect())
            .unwrap_or_default();
        conns.sort();
        conns
    }

    /// A connection is live while it is registered and its outbound queue
    /// has not been closed by the transport.
    pub fn is_live(&self, conn: ConnectionId) -> bool {
        self.connections
            .get(&conn)
            .map(|h| !h.outbound.is_closed())
            .unwrap_or(false)
    }

    /// Push an event to one connection. Returns `false` if it could not be
    /// queued (connection gone, closed, or its buffer is full).
    pub fn send_to_connection(&self, conn: ConnectionId, event: ServerEvent) -> bool {
        let Some(outbound) = self.connections.get(&conn).map(|h| h.outbound.clone()) else {
            debug!(conn = %conn, "Dropping event for unknown connection");
            return false;
        };

        match outbound.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!(conn = %conn, "Dropping event for slow connection");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(conn = %conn, "Dropping event for closed connection");
                false
            }
        }
    }

    /// Fan an event out to every live connection of a user. Returns the
    /// number of connections it was queued for; zero means the user is
    /// offline and the event was dropped.
    pub fn send_to_user(&self, user_id: &UserId, event: &ServerEvent) -> usize {
        let delivered = self
            .connections_for(user_id)
            .into_iter()
            .filter(|conn| self.send_to_connection(*conn, event.clone()))
            .count();

        if delivered == 0 {
            debug!(user = %user_id.short(), "User offline, event dropped");
        }
        delivered
    }

    /// Number of users with at least one live connection.
    pub fn online_users(&self) -> usize {
        self.groups.len()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }
}

impl Default for PresenceRegistry {
    fn default() -> Self {
        Self::new()
    }
}
