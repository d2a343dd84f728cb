//! Session hub.
//!
//! Owns the presence registry, matchmaking queue, room manager, relay, and
//! friend graph, and applies one client event at a time for a connection.
//!
//! Lock order is queue → rooms → user records. Every operation that creates
//! or destroys a room (join, next partner, disconnect) runs under the queue
//! lock, so a pairing is never observed half-applied and a partner always
//! sees `chat_start` before any `partner_disconnected` for that room.
//! Messaging and friend events never take the queue lock.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info};

use duo_shared::constants::{DEFAULT_AGE, DEFAULT_AVATAR_SEED, UNKNOWN_PARTNER_NICKNAME};
use duo_shared::protocol::{ChatStart, PartnerInfo, ProfileFields};
use duo_shared::{ClientEvent, ConnectionId, RoomId, ServerEvent, UserId};

use crate::error::HubError;
use crate::friends::FriendGraph;
use crate::matchmaking::{EnqueueOutcome, MatchmakingQueue};
use crate::presence::{Outbound, PresenceRegistry};
use crate::relay::MessageRelay;
use crate::rooms::{RoomManager, Teardown};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HubStats {
    pub online_users: usize,
    pub connections: usize,
    pub queued: usize,
    pub rooms: usize,
}

pub struct Hub {
    presence: Arc<PresenceRegistry>,
    rooms: Arc<RoomManager>,
    queue: Mutex<MatchmakingQueue>,
    relay: MessageRelay,
    friends: FriendGraph,
}

impl Hub {
    pub fn new() -> Self {
        let presence = Arc::new(PresenceRegistry::new());
        let rooms = Arc::new(RoomManager::new());
        Self {
            relay: MessageRelay::new(Arc::clone(&presence), Arc::clone(&rooms)),
            friends: FriendGraph::new(Arc::clone(&presence)),
            queue: Mutex::new(MatchmakingQueue::new()),
            presence,
            rooms,
        }
    }

    pub fn presence(&self) -> &PresenceRegistry {
        &self.presence
    }

    #[cfg(test)]
    pub fn rooms(&self) -> &RoomManager {
        &self.rooms
    }

    #[cfg(test)]
    pub fn friends(&self) -> &FriendGraph {
        &self.friends
    }

    /// Register a freshly opened connection for `user_id`.
    pub async fn connect(
        &self,
        user_id: UserId,
        fields: &ProfileFields,
        outbound: Outbound,
    ) -> ConnectionId {
        self.presence.register(user_id, fields, outbound).await
    }

    /// Apply one client event on behalf of `conn`.
    pub async fn handle(&self, conn: ConnectionId, event: ClientEvent) -> Result<(), HubError> {
        debug!(conn = %conn, event = event.name(), "Handling client event");

        match event {
            ClientEvent::JoinQueue => {
                self.join_queue(conn).await?;
            }
            ClientEvent::NextPartner => {
                self.next_partner(conn).await?;
            }
            ClientEvent::SendMessage(message) => {
                self.relay.send(conn, message)?;
            }
            ClientEvent::MessageStatusUpdate(update) => {
                self.relay.update_status(conn, update)?;
            }
            ClientEvent::SendFriendRequest(req) => {
                let user = self.user_of(conn)?;
                self.friends.send_request(&user, &req.to_user_id).await?;
            }
            ClientEvent::RespondFriendRequest(resp) => {
                let user = self.user_of(conn)?;
                self.friends
                    .respond_request(&user, &resp.from_user_id, resp.accepted)
                    .await?;
            }
            ClientEvent::RemoveFriend(req) => {
                let user = self.user_of(conn)?;
                self.friends.remove_friend(&user, &req.friend_id).await?;
            }
            ClientEvent::UpdateProfile(fields) => {
                self.presence
                    .update_profile(conn, &fields)
                    .await
                    .ok_or(HubError::UnknownConnection(conn))?;
            }
        }

        Ok(())
    }

    /// Enter matchmaking. A connection still in a room is being re-paired,
    /// so that room is torn down first.
    pub async fn join_queue(&self, conn: ConnectionId) -> Result<EnqueueOutcome, HubError> {
        self.user_of(conn)?;
        let mut queue = self.queue.lock().await;
        Ok(self.enqueue_locked(&mut queue, conn).await)
    }

    /// Leave the current room (notifying the partner) and look for a new one.
    pub async fn next_partner(&self, conn: ConnectionId) -> Result<EnqueueOutcome, HubError> {
        self.user_of(conn)?;
        let mut queue = self.queue.lock().await;
        self.leave_room(conn);
        Ok(self.enqueue_locked(&mut queue, conn).await)
    }

    /// Release everything a closed connection holds.
    pub async fn disconnect(&self, conn: ConnectionId) {
        let user = self.presence.unregister(conn);

        let mut queue = self.queue.lock().await;
        let was_queued = queue.remove(conn);
        let teardown = self.leave_room(conn);
        drop(queue);

        info!(
            conn = %conn,
            user = ?user.as_ref().map(UserId::short),
            was_queued,
            room = ?teardown.map(|t| t.room_id),
            "Connection closed"
        );
    }

    pub async fn stats(&self) -> HubStats {
        HubStats {
            online_users: self.presence.online_users(),
            connections: self.presence.connection_count(),
            queued: self.queue.lock().await.len(),
            rooms: self.rooms.room_count(),
        }
    }

    async fn enqueue_locked(&self, queue: &mut MatchmakingQueue, conn: ConnectionId) -> EnqueueOutcome {
        if queue.contains(conn) {
            debug!(conn = %conn, "Already queued");
            return EnqueueOutcome::AlreadyQueued;
        }
        self.leave_room(conn);

        let outcome = queue.enqueue(conn, |candidate| self.presence.is_live(candidate));
        match outcome {
            EnqueueOutcome::Matched { partner } => match self.rooms.create_room(conn, partner) {
                Some(room_id) => self.start_chat(room_id, conn, partner).await,
                None => {
                    queue.push(partner);
                    queue.push(conn);
                    self.presence.send_to_connection(conn, ServerEvent::Searching);
                }
            },
            EnqueueOutcome::Waiting | EnqueueOutcome::ReplacedStale { .. } => {
                debug!(conn = %conn, queued = queue.len(), "Waiting for a partner");
                self.presence.send_to_connection(conn, ServerEvent::Searching);
            }
            EnqueueOutcome::AlreadyQueued => {}
        }
        outcome
    }

    async fn start_chat(&self, room_id: RoomId, a: ConnectionId, b: ConnectionId) {
        let start = ServerEvent::ChatStart(ChatStart { room_id });
        self.presence.send_to_connection(a, start.clone());
        self.presence.send_to_connection(b, start);

        let a_info = self.partner_info(a).await;
        let b_info = self.partner_info(b).await;
        self.presence
            .send_to_connection(a, ServerEvent::PartnerInfo(b_info));
        self.presence
            .send_to_connection(b, ServerEvent::PartnerInfo(a_info));

        info!(room = %room_id, a = %a, b = %b, "Matched strangers");
    }

    /// Profile of the user behind `conn`, as shown to their partner.
    async fn partner_info(&self, conn: ConnectionId) -> PartnerInfo {
        let user = self.presence.user_of(conn);
        let profile = match &user {
            Some(user) => self.presence.lookup(user).await,
            None => None,
        };

        match (user, profile) {
            (Some(user), Some(profile)) => PartnerInfo {
                partner_user_id: user,
                nickname: profile.nickname,
                age: profile.age,
                avatar_seed: profile.avatar_seed,
            },
            (user, _) => PartnerInfo {
                partner_user_id: user.unwrap_or_else(|| UserId::new("")),
                nickname: UNKNOWN_PARTNER_NICKNAME.to_string(),
                age: DEFAULT_AGE.to_string(),
                avatar_seed: DEFAULT_AVATAR_SEED.to_string(),
            },
        }
    }

    /// Tear down `conn`'s room, if any, and tell the partner exactly once.
    fn leave_room(&self, conn: ConnectionId) -> Option<Teardown> {
        let teardown = self.rooms.teardown(conn)?;
        self.presence
            .send_to_connection(teardown.partner, ServerEvent::PartnerDisconnected);
        Some(teardown)
    }

    fn user_of(&self, conn: ConnectionId) -> Result<UserId, HubError> {
        self.presence
            .user_of(conn)
            .ok_or(HubError::UnknownConnection(conn))
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use duo_shared::protocol::{
        FriendRequestTarget, FriendResponse, MessageKind, OutgoingMessage, RemoveFriendRequest,
        StatusUpdateRequest,
    };
    use duo_shared::MessageStatus;
    use tokio::sync::mpsc;

    struct Client {
        conn: ConnectionId,
        rx: mpsc::Receiver<ServerEvent>,
    }

    impl Client {
        fn drain(&mut self) -> Vec<ServerEvent> {
            std::iter::from_fn(|| self.rx.try_recv().ok()).collect()
        }
    }

    async fn connect(hub: &Hub, user: &str, nickname: &str) -> Client {
        let (tx, rx) = mpsc::channel(64);
        let fields = ProfileFields {
            nickname: Some(nickname.to_string()),
            age: Some("30".to_string()),
            avatar_seed: Some(format!("{user}-seed")),
        };
        let conn = hub.connect(UserId::new(user), &fields, tx).await;
        Client { conn, rx }
    }

    fn text(msg_id: &str, to: Option<&str>) -> ClientEvent {
        ClientEvent::SendMessage(OutgoingMessage {
            msg_id: msg_id.into(),
            message: "hello".into(),
            kind: MessageKind::Text,
            to_user_id: to.map(UserId::new),
        })
    }

    fn count(events: &[ServerEvent], wanted: &ServerEvent) -> usize {
        events.iter().filter(|e| *e == wanted).count()
    }

    #[tokio::test]
    async fn test_pairing_sends_start_then_partner_info() {
        let hub = Hub::new();
        let mut a = connect(&hub, "a", "Alice").await;
        let mut b = connect(&hub, "b", "Bob").await;

        assert_eq!(hub.join_queue(a.conn).await.unwrap(), EnqueueOutcome::Waiting);
        assert_eq!(
            hub.join_queue(b.conn).await.unwrap(),
            EnqueueOutcome::Matched { partner: a.conn }
        );

        let room_id = hub.rooms().room_of(a.conn).unwrap();
        assert_eq!(hub.rooms().room_of(b.conn), Some(room_id));

        let a_events = a.drain();
        assert_eq!(a_events[0], ServerEvent::Searching);
        assert_eq!(a_events[1], ServerEvent::ChatStart(ChatStart { room_id }));
        assert_eq!(
            a_events[2],
            ServerEvent::PartnerInfo(PartnerInfo {
                partner_user_id: UserId::new("b"),
                nickname: "Bob".into(),
                age: "30".into(),
                avatar_seed: "b-seed".into(),
            })
        );

        let b_events = b.drain();
        assert_eq!(b_events[0], ServerEvent::ChatStart(ChatStart { room_id }));
        assert!(matches!(
            &b_events[1],
            ServerEvent::PartnerInfo(info) if info.nickname == "Alice"
        ));
    }

    #[tokio::test]
    async fn test_arrival_pairs_with_last_waiter() {
        let hub = Hub::new();
        let a = connect(&hub, "a", "A").await;
        let b = connect(&hub, "b", "B").await;
        let c = connect(&hub, "c", "C").await;
        let d = connect(&hub, "d", "D").await;

        {
            let mut queue = hub.queue.lock().await;
            queue.push(a.conn);
            queue.push(b.conn);
            queue.push(c.conn);
        }

        assert_eq!(
            hub.join_queue(d.conn).await.unwrap(),
            EnqueueOutcome::Matched { partner: c.conn }
        );
        assert_eq!(hub.queue.lock().await.snapshot(), vec![a.conn, b.conn]);
        assert_eq!(hub.rooms().partner_of(d.conn), Some(c.conn));
    }

    #[tokio::test]
    async fn test_join_is_idempotent() {
        let hub = Hub::new();
        let a = connect(&hub, "a", "A").await;

        hub.join_queue(a.conn).await.unwrap();
        assert_eq!(
            hub.join_queue(a.conn).await.unwrap(),
            EnqueueOutcome::AlreadyQueued
        );
        assert_eq!(hub.stats().await.queued, 1);
    }

    #[tokio::test]
    async fn test_stale_waiter_is_discarded() {
        let hub = Hub::new();
        let a = connect(&hub, "a", "A").await;
        let mut b = connect(&hub, "b", "B").await;

        hub.join_queue(a.conn).await.unwrap();
        drop(a.rx);

        assert_eq!(
            hub.join_queue(b.conn).await.unwrap(),
            EnqueueOutcome::ReplacedStale { stale: a.conn }
        );
        assert_eq!(b.drain(), vec![ServerEvent::Searching]);
        assert_eq!(hub.queue.lock().await.snapshot(), vec![b.conn]);
        assert_eq!(hub.rooms().room_count(), 0);
    }

    #[tokio::test]
    async fn test_disconnect_notifies_partner_once_and_clears_room() {
        let hub = Hub::new();
        let a = connect(&hub, "a", "A").await;
        let mut b = connect(&hub, "b", "B").await;
        hub.join_queue(a.conn).await.unwrap();
        hub.join_queue(b.conn).await.unwrap();
        b.drain();

        hub.disconnect(a.conn).await;
        hub.disconnect(a.conn).await;

        let events = b.drain();
        assert_eq!(count(&events, &ServerEvent::PartnerDisconnected), 1);
        assert_eq!(hub.rooms().room_of(b.conn), None);
        assert_eq!(hub.rooms().room_count(), 0);

        // B is not re-queued automatically.
        assert_eq!(hub.stats().await.queued, 0);
    }

    #[tokio::test]
    async fn test_disconnect_leaves_queue() {
        let hub = Hub::new();
        let a = connect(&hub, "a", "A").await;
        hub.join_queue(a.conn).await.unwrap();

        hub.disconnect(a.conn).await;

        let stats = hub.stats().await;
        assert_eq!(stats.queued, 0);
        assert_eq!(stats.connections, 0);
        assert_eq!(stats.online_users, 0);
    }

    #[tokio::test]
    async fn test_next_partner_requeues_and_pairs_with_waiter() {
        let hub = Hub::new();
        let mut a = connect(&hub, "a", "A").await;
        let mut b = connect(&hub, "b", "B").await;
        let mut c = connect(&hub, "c", "C").await;
        hub.join_queue(a.conn).await.unwrap();
        hub.join_queue(b.conn).await.unwrap();
        hub.join_queue(c.conn).await.unwrap();
        a.drain();
        b.drain();
        c.drain();

        let outcome = hub.handle(b.conn, ClientEvent::NextPartner).await;
        assert!(outcome.is_ok());

        assert_eq!(a.drain(), vec![ServerEvent::PartnerDisconnected]);
        assert_eq!(hub.rooms().room_of(a.conn), None);
        assert_eq!(hub.rooms().partner_of(b.conn), Some(c.conn));
        assert!(matches!(c.drain()[0], ServerEvent::ChatStart(_)));
    }

    #[tokio::test]
    async fn test_rejoin_while_in_room_tears_it_down() {
        let hub = Hub::new();
        let a = connect(&hub, "a", "A").await;
        let mut b = connect(&hub, "b", "B").await;
        hub.join_queue(a.conn).await.unwrap();
        hub.join_queue(b.conn).await.unwrap();
        b.drain();

        assert_eq!(hub.join_queue(a.conn).await.unwrap(), EnqueueOutcome::Waiting);

        assert_eq!(b.drain(), vec![ServerEvent::PartnerDisconnected]);
        assert_eq!(hub.rooms().room_count(), 0);
        assert_eq!(hub.queue.lock().await.snapshot(), vec![a.conn]);
    }

    #[tokio::test]
    async fn test_concurrent_joins_form_disjoint_pairs() {
        let hub = Arc::new(Hub::new());
        let mut clients = Vec::new();
        for i in 0..40 {
            clients.push(connect(&hub, &format!("user-{i}"), "N").await);
        }

        let mut tasks = Vec::new();
        for client in &clients {
            let hub = Arc::clone(&hub);
            let conn = client.conn;
            tasks.push(tokio::spawn(async move {
                hub.join_queue(conn).await.unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let stats = hub.stats().await;
        assert_eq!(stats.rooms, 20);
        assert_eq!(stats.queued, 0);

        let mut seen = std::collections::HashSet::new();
        for room_id in hub.rooms().list_rooms() {
            let [x, y] = hub.rooms().get(&room_id).unwrap().members();
            assert_ne!(x, y);
            assert!(seen.insert(x));
            assert!(seen.insert(y));
        }
        assert_eq!(seen.len(), 40);
    }

    #[tokio::test]
    async fn test_room_chat_with_status_round_trip() {
        let hub = Hub::new();
        let mut a = connect(&hub, "a", "A").await;
        let mut b = connect(&hub, "b", "B").await;
        hub.join_queue(a.conn).await.unwrap();
        hub.join_queue(b.conn).await.unwrap();
        a.drain();
        b.drain();

        hub.handle(a.conn, text("m1", None)).await.unwrap();
        assert!(matches!(b.drain()[0], ServerEvent::ReceiveMessage(_)));

        for status in [MessageStatus::Delivered, MessageStatus::Seen] {
            hub.handle(
                b.conn,
                ClientEvent::MessageStatusUpdate(StatusUpdateRequest {
                    msg_id: "m1".into(),
                    status,
                    to_user_id: None,
                }),
            )
            .await
            .unwrap();
        }

        let statuses: Vec<MessageStatus> = a
            .drain()
            .into_iter()
            .filter_map(|event| match event {
                ServerEvent::MessageAck(ack) => Some(ack.status),
                ServerEvent::MessageStatusUpdate(notice) => Some(notice.status),
                _ => None,
            })
            .collect();
        assert_eq!(
            statuses,
            vec![MessageStatus::Sent, MessageStatus::Delivered, MessageStatus::Seen]
        );
    }

    #[tokio::test]
    async fn test_friend_flow_and_direct_messages() {
        let hub = Hub::new();
        let mut alice = connect(&hub, "alice", "Alice").await;
        let mut bob = connect(&hub, "bob", "Bob").await;
        let bob_id = UserId::new("bob");
        let alice_id = UserId::new("alice");

        hub.handle(
            alice.conn,
            ClientEvent::SendFriendRequest(FriendRequestTarget {
                to_user_id: bob_id.clone(),
            }),
        )
        .await
        .unwrap();
        assert!(matches!(bob.drain()[0], ServerEvent::IncomingFriendRequest(_)));

        hub.handle(
            bob.conn,
            ClientEvent::RespondFriendRequest(FriendResponse {
                from_user_id: alice_id.clone(),
                accepted: true,
            }),
        )
        .await
        .unwrap();
        assert!(hub.friends().are_friends(&alice_id, &bob_id).await);
        assert!(hub.friends().are_friends(&bob_id, &alice_id).await);
        assert!(matches!(alice.drain()[0], ServerEvent::FriendRequestAccepted(_)));
        assert!(matches!(bob.drain()[0], ServerEvent::FriendAdded(_)));

        // Bob goes offline; a direct message is dropped without error.
        hub.disconnect(bob.conn).await;
        hub.handle(alice.conn, text("m1", Some("bob"))).await.unwrap();
        assert!(matches!(alice.drain()[0], ServerEvent::MessageAck(_)));

        // Bob reconnects and is addressed again.
        let mut bob = connect(&hub, "bob", "").await;
        hub.handle(alice.conn, text("m2", Some("bob"))).await.unwrap();
        let ServerEvent::ReceiveMessage(msg) = &bob.drain()[0] else {
            panic!("expected receive_message");
        };
        assert_eq!(msg.msg_id, "m2");
        assert_eq!(hub.presence().lookup(&bob_id).await.unwrap().nickname, "Bob");

        hub.handle(
            alice.conn,
            ClientEvent::RemoveFriend(RemoveFriendRequest {
                friend_id: bob_id.clone(),
            }),
        )
        .await
        .unwrap();
        assert!(!hub.friends().are_friends(&alice_id, &bob_id).await);
        assert!(!hub.friends().are_friends(&bob_id, &alice_id).await);
    }

    #[tokio::test]
    async fn test_malformed_event_does_not_touch_other_state() {
        let hub = Hub::new();
        let a = connect(&hub, "a", "A").await;
        let b = connect(&hub, "b", "B").await;
        hub.join_queue(a.conn).await.unwrap();
        hub.join_queue(b.conn).await.unwrap();

        let err = hub.handle(a.conn, text("", None)).await.unwrap_err();
        assert!(err.is_client_facing());
        assert_eq!(hub.rooms().partner_of(a.conn), Some(b.conn));

        let err = hub
            .handle(ConnectionId(9_999), ClientEvent::JoinQueue)
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::UnknownConnection(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_statuses_never_overtake_ack() {
        let hub = Arc::new(Hub::new());
        let a = connect(&hub, "a", "A").await;
        let b = connect(&hub, "b", "B").await;
        hub.join_queue(a.conn).await.unwrap();
        hub.join_queue(b.conn).await.unwrap();
        let (a_conn, mut a_rx) = (a.conn, a.rx);
        let (b_conn, mut b_rx) = (b.conn, b.rx);
        while a_rx.try_recv().is_ok() {}
        while b_rx.try_recv().is_ok() {}

        for round in 0..300 {
            let msg_id = format!("m{round}");

            // B marks the message delivered then seen as soon as it arrives.
            let responder = {
                let hub = Arc::clone(&hub);
                tokio::spawn(async move {
                    let Some(ServerEvent::ReceiveMessage(msg)) = b_rx.recv().await else {
                        panic!("expected receive_message");
                    };
                    for status in [MessageStatus::Delivered, MessageStatus::Seen] {
                        hub.handle(
                            b_conn,
                            ClientEvent::MessageStatusUpdate(StatusUpdateRequest {
                                msg_id: msg.msg_id.clone(),
                                status,
                                to_user_id: None,
                            }),
                        )
                        .await
                        .unwrap();
                    }
                    b_rx
                })
            };

            let sender = {
                let hub = Arc::clone(&hub);
                let event = text(&msg_id, None);
                tokio::spawn(async move { hub.handle(a_conn, event).await.unwrap() })
            };

            sender.await.unwrap();
            b_rx = responder.await.unwrap();

            let mut statuses = Vec::new();
            for _ in 0..3 {
                match a_rx.recv().await.unwrap() {
                    ServerEvent::MessageAck(ack) if ack.msg_id == msg_id => statuses.push(ack.status),
                    ServerEvent::MessageStatusUpdate(notice) if notice.msg_id == msg_id => {
                        statuses.push(notice.status)
                    }
                    other => panic!("round {round}: unexpected {other:?}"),
                }
            }
            assert_eq!(
                statuses,
                vec![MessageStatus::Sent, MessageStatus::Delivered, MessageStatus::Seen],
                "round {round}"
            );
        }
    }
}
