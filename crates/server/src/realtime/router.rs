//! Event router: works out who should see an event and queues it on every
//! live connection of each recipient.
//!
//! Delivery is best effort. An offline recipient is skipped, and a closed
//! connection is logged and skipped without affecting anyone else.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use kinship_shared::{
    Comment, FriendRequestUpdate, HasReactions, Identity, OnlineUser, Post, ReactionAction,
    ReactionCounts, ReactionKind, ReactionTarget, ServerEvent, SystemLevel, Visibility, WsEnvelope,
};
use tracing::{debug, warn};

use super::registry::{ConnectionHandle, ConnectionRegistry};
use crate::error::StoreError;
use crate::store::UserStore;

pub struct EventRouter {
    registry: Arc<ConnectionRegistry>,
    users: Arc<dyn UserStore>,
    batch_size: usize,
}

impl EventRouter {
    pub fn new(registry: Arc<ConnectionRegistry>, users: Arc<dyn UserStore>, batch_size: usize) -> Self {
        Self {
            registry,
            users,
            batch_size: batch_size.max(1),
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub async fn is_online(&self, identity_id: &str) -> bool {
        self.registry.is_online(identity_id).await
    }

    /// Queue `event` on every connection of one identity. Returns how many
    /// connections accepted it; zero for an offline identity.
    pub async fn send_to_identity(&self, identity_id: &str, event: ServerEvent) -> usize {
        self.deliver(identity_id, WsEnvelope::new(event)).await
    }

    /// Like [`EventRouter::send_to_identity`] with a caller-built envelope, so
    /// replies can carry a correlation id.
    pub async fn deliver(&self, identity_id: &str, envelope: WsEnvelope<ServerEvent>) -> usize {
        let handles = self.registry.handles_of(identity_id).await;
        if handles.is_empty() {
            debug!(user_id = %identity_id, event = envelope.payload.kind(), "recipient offline, live event skipped");
            return 0;
        }
        dispatch(&handles, &envelope)
    }

    /// Send one event to a set of identities, deduplicated, minus `exclude`.
    pub async fn send_to_many<I, S>(&self, identities: I, exclude: Option<&str>, event: ServerEvent) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let recipients = dedupe(identities, exclude);
        let envelope = WsEnvelope::new(event);
        debug!(recipients = recipients.len(), event = envelope.payload.kind(), "fan-out");

        let mut delivered = 0;
        for (i, batch) in recipients.chunks(self.batch_size).enumerate() {
            if i > 0 {
                tokio::task::yield_now().await;
            }
            for identity_id in batch {
                delivered += self.deliver(identity_id, envelope.clone()).await;
            }
        }
        delivered
    }

    /// Every registered connection, whoever owns it.
    pub async fn broadcast_all(&self, event: ServerEvent) -> usize {
        let handles = self.registry.all_handles().await;
        let envelope = WsEnvelope::new(event);
        debug!(connections = handles.len(), event = envelope.payload.kind(), "broadcast");

        let mut delivered = 0;
        for (i, batch) in handles.chunks(self.batch_size).enumerate() {
            if i > 0 {
                tokio::task::yield_now().await;
            }
            delivered += dispatch(batch, &envelope);
        }
        delivered
    }

    pub async fn send_to_room(&self, room: &str, event: ServerEvent) -> usize {
        let handles = self.registry.room_handles(room).await;
        dispatch(&handles, &WsEnvelope::new(event))
    }

    /// Recipients of a new post: online users for public posts, the author's
    /// friends for friends-only posts, plus group members when the post
    /// belongs to a group. Never the author.
    pub async fn compute_audience(&self, post: &Post) -> Result<Vec<String>, StoreError> {
        let friends = if post.visibility == Visibility::Friends {
            self.users.friends_of(&post.author_id).await?
        } else {
            Vec::new()
        };
        let members = match &post.group_id {
            Some(group_id) => self.users.group_members(group_id).await?,
            None => Vec::new(),
        };
        // FIXME: public posts reach every online user, not just followers.
        let online = if post.visibility == Visibility::Public {
            self.registry.online_ids().await
        } else {
            Vec::new()
        };

        Ok(audience_for(post, &friends, &members, &online))
    }

    pub async fn publish_post(&self, post: &Post) -> Result<usize, StoreError> {
        let audience = self.compute_audience(post).await?;
        let event = ServerEvent::PostCreated {
            post: post.clone(),
            timestamp: Utc::now(),
        };
        Ok(self.send_to_many(audience, None, event).await)
    }

    pub async fn post_reaction(
        &self,
        target: ReactionTarget,
        user_id: &str,
        reaction: ReactionKind,
        action: ReactionAction,
        counts: ReactionCounts,
    ) -> usize {
        self.broadcast_all(ServerEvent::PostReaction {
            target,
            user_id: user_id.to_string(),
            reaction,
            action,
            counts,
            timestamp: Utc::now(),
        })
        .await
    }

    /// Apply a reaction to a post or comment and broadcast the new totals.
    pub async fn react<T>(&self, item: &mut T, user_id: &str, reaction: ReactionKind, action: ReactionAction) -> usize
    where
        T: HasReactions + ?Sized,
    {
        let counts = item.react(reaction, action);
        let target = item.reaction_target();
        self.post_reaction(target, user_id, reaction, action, counts).await
    }

    pub async fn post_comment(&self, comment: &Comment) -> usize {
        self.broadcast_all(ServerEvent::PostComment {
            post_id: comment.post_id.clone(),
            comment: comment.clone(),
            timestamp: Utc::now(),
        })
        .await
    }

    pub async fn friend_request(&self, update: FriendRequestUpdate) -> usize {
        let recipient = update.recipient_id.clone();
        self.send_to_identity(&recipient, ServerEvent::FriendRequest(update)).await
    }

    pub async fn broadcast_system(&self, message: impl Into<String>, level: SystemLevel) -> usize {
        self.broadcast_all(ServerEvent::SystemMessage {
            message: message.into(),
            level,
            timestamp: Utc::now(),
        })
        .await
    }

    /// Tell an identity's friends that it came online or went offline.
    pub async fn notify_presence(&self, identity: &Identity, online: bool) -> Result<usize, StoreError> {
        let friends = self.users.friends_of(&identity.id).await?;
        let now = Utc::now();
        let event = if online {
            ServerEvent::PresenceOnline {
                user_id: identity.id.clone(),
                name: identity.name.clone(),
                avatar: identity.avatar.clone(),
                timestamp: now,
            }
        } else {
            ServerEvent::PresenceOffline {
                user_id: identity.id.clone(),
                timestamp: now,
            }
        };
        Ok(self.send_to_many(friends, Some(&identity.id), event).await)
    }

    pub async fn online_friends(&self, identity_id: &str) -> Result<Vec<OnlineUser>, StoreError> {
        let friends = self.users.friends_of(identity_id).await?;
        Ok(self.registry.online_among(&friends).await)
    }
}

fn dispatch(handles: &[ConnectionHandle], envelope: &WsEnvelope<ServerEvent>) -> usize {
    let mut delivered = 0;
    for handle in handles {
        match handle.send(envelope.clone()) {
            Ok(()) => delivered += 1,
            Err(_) => warn!(
                connection_id = %handle.id,
                user_id = %handle.identity_id,
                event = envelope.payload.kind(),
                "connection closed, event dropped"
            ),
        }
    }
    delivered
}

/// Order-preserving dedupe that also drops `exclude`.
fn dedupe<I, S>(ids: I, exclude: Option<&str>) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = HashSet::new();
    ids.into_iter()
        .filter(|id| Some(id.as_ref()) != exclude)
        .filter(|id| seen.insert(id.as_ref().to_string()))
        .map(|id| id.as_ref().to_string())
        .collect()
}

/// The audience of a post given already-loaded relationship data.
pub fn audience_for(post: &Post, friends: &[String], group_members: &[String], online: &[String]) -> Vec<String> {
    let base: &[String] = match post.visibility {
        Visibility::Public => online,
        Visibility::Friends => friends,
        Visibility::Private => &[],
    };
    dedupe(base.iter().chain(group_members), Some(&post.author_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::realtime::registry::ConnectionId;
    use crate::store::{MemoryStore, UserRecord};
    use kinship_shared::FriendRequestAction;
    use proptest::prelude::*;
    use tokio::sync::mpsc::UnboundedReceiver;

    type Inbox = UnboundedReceiver<WsEnvelope<ServerEvent>>;

    fn identity(id: &str) -> Identity {
        Identity {
            id: id.to_string(),
            name: id.to_uppercase(),
            avatar: None,
        }
    }

    async fn connect(registry: &ConnectionRegistry, id: &str) -> (ConnectionId, Inbox) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let handle = ConnectionHandle::new(id, tx);
        let conn = handle.id;
        registry.add_connection(&identity(id), handle).await;
        (conn, rx)
    }

    fn drain(rx: &mut Inbox) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(envelope) = rx.try_recv() {
            events.push(envelope.payload);
        }
        events
    }

    async fn setup(batch: usize) -> (Arc<MemoryStore>, Arc<ConnectionRegistry>, EventRouter) {
        let store = Arc::new(MemoryStore::new());
        let registry = Arc::new(ConnectionRegistry::new());
        let router = EventRouter::new(Arc::clone(&registry), store.clone(), batch);
        (store, registry, router)
    }

    fn post(author: &str, visibility: Visibility, group_id: Option<&str>) -> Post {
        Post {
            id: "p1".to_string(),
            author_id: author.to_string(),
            content: Some("hello".to_string()),
            visibility,
            group_id: group_id.map(str::to_string),
            reactions: ReactionCounts::default(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn sending_to_an_offline_identity_writes_nothing() {
        let (_store, registry, router) = setup(16).await;
        let (_c, mut bob) = connect(&registry, "bob").await;

        let delivered = router
            .send_to_identity("alice", ServerEvent::error("X", "nobody home"))
            .await;
        assert_eq!(delivered, 0);
        assert!(drain(&mut bob).is_empty());
    }

    #[tokio::test]
    async fn every_connection_of_an_identity_receives_the_event() {
        let (_store, registry, router) = setup(16).await;
        let (_c1, mut first) = connect(&registry, "alice").await;
        let (_c2, mut second) = connect(&registry, "alice").await;

        let delivered = router
            .broadcast_system("maintenance at noon", SystemLevel::Warning)
            .await;
        assert_eq!(delivered, 2);
        assert_eq!(drain(&mut first).len(), 1);
        assert_eq!(drain(&mut second).len(), 1);
    }

    #[tokio::test]
    async fn send_to_many_dedupes_and_excludes() {
        let (_store, registry, router) = setup(1).await;
        let (_a, mut alice) = connect(&registry, "alice").await;
        let (_b, mut bob) = connect(&registry, "bob").await;
        let (_c, mut carol) = connect(&registry, "carol").await;

        let delivered = router
            .send_to_many(["bob", "bob", "alice", "carol", "nobody"], Some("alice"), ServerEvent::error("X", "y"))
            .await;
        assert_eq!(delivered, 2);
        assert!(drain(&mut alice).is_empty());
        assert_eq!(drain(&mut bob).len(), 1);
        assert_eq!(drain(&mut carol).len(), 1);
    }

    #[tokio::test]
    async fn a_dead_connection_does_not_stop_other_recipients() {
        let (_store, registry, router) = setup(16).await;
        let (_a, alice) = connect(&registry, "alice").await;
        let (_b, mut bob) = connect(&registry, "bob").await;
        drop(alice);

        let delivered = router
            .send_to_many(["alice", "bob"], None, ServerEvent::error("X", "y"))
            .await;
        assert_eq!(delivered, 1);
        assert_eq!(drain(&mut bob).len(), 1);
    }

    #[tokio::test]
    async fn rooms_receive_only_their_members() {
        let (_store, registry, router) = setup(16).await;
        let (a, mut alice) = connect(&registry, "alice").await;
        let (_b, mut bob) = connect(&registry, "bob").await;
        registry.join_room(a, "post:p1").await;

        assert_eq!(router.send_to_room("post:p1", ServerEvent::error("X", "y")).await, 1);
        assert_eq!(drain(&mut alice).len(), 1);
        assert!(drain(&mut bob).is_empty());
    }

    #[tokio::test]
    async fn friends_only_posts_reach_online_friends() {
        let (store, registry, router) = setup(16).await;
        let mut author = UserRecord::new("alice", "Alice");
        author.friends = vec!["bob".to_string(), "carol".to_string()];
        store.insert_user(author).await;

        let (_a, mut alice) = connect(&registry, "alice").await;
        let (_b, mut bob) = connect(&registry, "bob").await;
        let (_d, mut dave) = connect(&registry, "dave").await;

        let delivered = router
            .publish_post(&post("alice", Visibility::Friends, None))
            .await
            .unwrap();
        assert_eq!(delivered, 1);
        assert!(matches!(drain(&mut bob).as_slice(), [ServerEvent::PostCreated { .. }]));
        assert!(drain(&mut alice).is_empty());
        assert!(drain(&mut dave).is_empty());
    }

    #[tokio::test]
    async fn group_posts_include_members() {
        let (store, registry, router) = setup(16).await;
        store
            .set_group_members("g1", vec!["alice".to_string(), "erin".to_string()])
            .await;
        let (_e, mut erin) = connect(&registry, "erin").await;

        let audience = router
            .compute_audience(&post("alice", Visibility::Private, Some("g1")))
            .await
            .unwrap();
        assert_eq!(audience, vec!["erin".to_string()]);

        router
            .publish_post(&post("alice", Visibility::Private, Some("g1")))
            .await
            .unwrap();
        assert_eq!(drain(&mut erin).len(), 1);
    }

    #[tokio::test]
    async fn presence_goes_to_friends_only() {
        let (store, registry, router) = setup(16).await;
        let mut alice = UserRecord::new("alice", "Alice");
        alice.friends = vec!["bob".to_string()];
        store.insert_user(alice.clone()).await;

        let (_b, mut bob) = connect(&registry, "bob").await;
        let (_c, mut carol) = connect(&registry, "carol").await;

        router.notify_presence(&alice.identity(), true).await.unwrap();
        match drain(&mut bob).as_slice() {
            [ServerEvent::PresenceOnline { user_id, name, .. }] => {
                assert_eq!(user_id, "alice");
                assert_eq!(name, "Alice");
            }
            other => panic!("unexpected events {other:?}"),
        }
        assert!(drain(&mut carol).is_empty());

        connect(&registry, "alice").await;
        let online = router.online_friends("bob").await.unwrap();
        assert!(online.is_empty(), "bob has no friends on record");
        let online = router.online_friends("alice").await.unwrap();
        assert_eq!(online.len(), 1);
        assert_eq!(online[0].user_id, "bob");
    }

    #[tokio::test]
    async fn reactions_broadcast_fresh_counts() {
        let (_store, registry, router) = setup(16).await;
        let (_b, mut bob) = connect(&registry, "bob").await;
        let mut p = post("alice", Visibility::Public, None);

        router.react(&mut p, "bob", ReactionKind::Like, ReactionAction::Added).await;
        assert_eq!(p.reactions.like, 1);
        match drain(&mut bob).as_slice() {
            [ServerEvent::PostReaction { target, counts, .. }] => {
                assert_eq!(target.post_id(), "p1");
                assert_eq!(counts.like, 1);
            }
            other => panic!("unexpected events {other:?}"),
        }
    }

    #[tokio::test]
    async fn friend_requests_go_to_the_recipient() {
        let (_store, registry, router) = setup(16).await;
        let (_a, mut alice) = connect(&registry, "alice").await;
        let (_b, mut bob) = connect(&registry, "bob").await;

        let update = FriendRequestUpdate {
            request_id: "r1".to_string(),
            sender_id: "alice".to_string(),
            recipient_id: "bob".to_string(),
            action: FriendRequestAction::Sent,
            timestamp: Utc::now(),
        };
        assert_eq!(router.friend_request(update).await, 1);
        assert!(drain(&mut alice).is_empty());
        assert_eq!(drain(&mut bob).len(), 1);
    }

    fn ids() -> impl Strategy<Value = Vec<String>> {
        prop::collection::vec("[a-e]", 0..10)
    }

    fn visibility() -> impl Strategy<Value = Visibility> {
        prop_oneof![
            Just(Visibility::Public),
            Just(Visibility::Friends),
            Just(Visibility::Private),
        ]
    }

    proptest! {
        #[test]
        fn audience_never_has_author_or_duplicates(
            author in "[a-e]",
            vis in visibility(),
            in_group in any::<bool>(),
            friends in ids(),
            members in ids(),
            online in ids(),
        ) {
            let p = post(&author, vis, in_group.then_some("g"));
            let members = if in_group { members } else { Vec::new() };
            let audience = audience_for(&p, &friends, &members, &online);

            prop_assert!(!audience.contains(&author));
            let unique: HashSet<_> = audience.iter().collect();
            prop_assert_eq!(unique.len(), audience.len());
        }

        #[test]
        fn public_audience_is_online_users_plus_members(
            author in "[a-e]",
            friends in ids(),
            online in ids(),
        ) {
            let p = post(&author, Visibility::Public, None);
            let audience = audience_for(&p, &friends, &[], &online);
            for id in &audience {
                prop_assert!(online.contains(id));
            }
            for id in &online {
                prop_assert!(id == &author || audience.contains(id));
            }
        }
    }
}
