//! Friend graph and request handling.
//!
//! Friend requests carry no server-side state: a request exists only as the
//! `incoming_friend_request` notification, and sending it again simply
//! notifies again. Declines are silent. The relation itself is the pair of
//! friend sets on the two user records, always mutated together while both
//! records are locked.

use std::sync::Arc;

use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use duo_shared::protocol::{FriendProfile, FriendRemoved, FriendRequestNotice};
use duo_shared::{ServerEvent, UserId};

use crate::error::HubError;
use crate::presence::{PresenceRegistry, UserRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    /// Target was notified on this many connections (zero if offline).
    Notified(usize),
    AlreadyFriends,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseOutcome {
    Accepted,
    Declined,
    UnknownRequester,
}

pub struct FriendGraph {
    presence: Arc<PresenceRegistry>,
}

impl FriendGraph {
    pub fn new(presence: Arc<PresenceRegistry>) -> Self {
        Self { presence }
    }

    pub async fn send_request(
        &self,
        requester: &UserId,
        target: &UserId,
    ) -> Result<RequestOutcome, HubError> {
        if target.is_blank() {
            return Err(HubError::Malformed("friend request without a target".into()));
        }
        if requester == target {
            return Err(HubError::Malformed("cannot befriend yourself".into()));
        }

        let record = self
            .presence
            .record(requester)
            .ok_or_else(|| HubError::UnknownUser(requester.clone()))?;
        let notice = {
            let record = record.lock().await;
            if record.friends.contains(target) {
                debug!(from = %requester.short(), to = %target.short(), "Already friends, request ignored");
                return Ok(RequestOutcome::AlreadyFriends);
            }
            FriendRequestNotice {
                from_user_id: requester.clone(),
                nickname: record.profile.nickname.clone(),
                avatar_seed: record.profile.avatar_seed.clone(),
            }
        };

        let notified = self
            .presence
            .send_to_user(target, &ServerEvent::IncomingFriendRequest(notice));
        info!(
            from = %requester.short(),
            to = %target.short(),
            connections = notified,
            "Friend request sent"
        );
        Ok(RequestOutcome::Notified(notified))
    }

    /// `responder` answers a request previously sent by `requester`.
    pub async fn respond_request(
        &self,
        responder: &UserId,
        requester: &UserId,
        accepted: bool,
    ) -> Result<ResponseOutcome, HubError> {
        if requester.is_blank() {
            return Err(HubError::Malformed("friend response without a requester".into()));
        }
        if responder == requester {
            return Err(HubError::Malformed("cannot befriend yourself".into()));
        }
        if !accepted {
            debug!(from = %requester.short(), by = %responder.short(), "Friend request declined");
            return Ok(ResponseOutcome::Declined);
        }

        let responder_record = self
            .presence
            .record(responder)
            .ok_or_else(|| HubError::UnknownUser(responder.clone()))?;
        let Some(requester_record) = self.presence.record(requester) else {
            debug!(from = %requester.short(), "Friend response for unknown requester");
            return Ok(ResponseOutcome::UnknownRequester);
        };

        let (accepted_notice, added_notice) = {
            let (mut me, mut them) =
                lock_pair((responder, &*responder_record), (requester, &*requester_record)).await;
            me.friends.insert(requester.clone());
            them.friends.insert(responder.clone());
            (profile_of(&me), profile_of(&them))
        };

        info!(a = %responder.short(), b = %requester.short(), "Friendship established");

        self.presence
            .send_to_user(requester, &ServerEvent::FriendRequestAccepted(accepted_notice));
        self.presence
            .send_to_user(responder, &ServerEvent::FriendAdded(added_notice));

        Ok(ResponseOutcome::Accepted)
    }

    /// Remove the relation in both directions. Both users are notified even
    /// when no edge existed, since clients keep their own friend lists.
    /// Returns whether an edge was removed.
    pub async fn remove_friend(&self, user: &UserId, friend: &UserId) -> Result<bool, HubError> {
        if friend.is_blank() {
            return Err(HubError::Malformed("remove_friend without a friend id".into()));
        }
        if user == friend {
            return Err(HubError::Malformed("cannot unfriend yourself".into()));
        }

        let user_record = self
            .presence
            .record(user)
            .ok_or_else(|| HubError::UnknownUser(user.clone()))?;

        let removed = match self.presence.record(friend) {
            Some(friend_record) => {
                let (mut me, mut them) =
                    lock_pair((user, &*user_record), (friend, &*friend_record)).await;
                let a = me.friends.remove(friend);
                let b = them.friends.remove(user);
                a || b
            }
            None => user_record.lock().await.friends.remove(friend),
        };

        if removed {
            info!(a = %user.short(), b = %friend.short(), "Friendship removed");
        } else {
            debug!(a = %user.short(), b = %friend.short(), "No friendship to remove");
        }

        self.presence.send_to_user(
            user,
            &ServerEvent::FriendRemoved(FriendRemoved {
                friend_id: friend.clone(),
            }),
        );
        self.presence.send_to_user(
            friend,
            &ServerEvent::FriendRemoved(FriendRemoved {
                friend_id: user.clone(),
            }),
        );

        Ok(removed)
    }

    #[cfg(test)]
    pub async fn are_friends(&self, a: &UserId, b: &UserId) -> bool {
        match self.presence.record(a) {
            Some(record) => record.lock().await.friends.contains(b),
            None => false,
        }
    }

    /// Friend ids of `user`, sorted.
    #[cfg(test)]
    pub async fn friends_of(&self, user: &UserId) -> Vec<UserId> {
        let Some(record) = self.presence.record(user) else {
            return Vec::new();
        };
        let mut friends: Vec<UserId> = record.lock().await.friends.iter().cloned().collect();
        friends.sort();
        friends
    }
}

fn profile_of(record: &UserRecord) -> FriendProfile {
    FriendProfile {
        friend_id: record.id.clone(),
        nickname: record.profile.nickname.clone(),
        avatar_seed: record.profile.avatar_seed.clone(),
    }
}

/// Lock two distinct user records in id order, returning the guards in
/// argument order.
async fn lock_pair<'a>(
    (first_id, first): (&UserId, &'a Mutex<UserRecord>),
    (second_id, second): (&UserId, &'a Mutex<UserRecord>),
) -> (MutexGuard<'a, UserRecord>, MutexGuard<'a, UserRecord>) {
    if first_id <= second_id {
        let a = first.lock().await;
        let b = second.lock().await;
        (a, b)
    } else {
        let b = second.lock().await;
        let a = first.lock().await;
        (a, b)
    }
}
