//! Message delivery: persist first, then deliver live or fall back to a
//! stored notification.
//!
//! The online check before the live event races with the recipient
//! connecting or leaving. That is accepted: the stored message is the source
//! of truth and clients reconcile by fetching.

use std::sync::Arc;

use chrono::Utc;
use kinship_shared::{
    Identity, MessageReceived, NewMessage, NewNotification, NotificationData, NotificationKind,
    ServerEvent, StoredMessage, WsEnvelope,
};
use tracing::{debug, error, info};

use super::notify::Notifier;
use super::registry::{ConnectionId, ConnectionRegistry};
use super::router::EventRouter;
use crate::error::{BlockDirection, DeliveryError};
use crate::store::{Persistence, UserStore};

pub struct MessageDelivery {
    users: Arc<dyn UserStore>,
    store: Arc<dyn Persistence>,
    registry: Arc<ConnectionRegistry>,
    router: Arc<EventRouter>,
    notifier: Arc<Notifier>,
}

impl MessageDelivery {
    pub fn new(
        users: Arc<dyn UserStore>,
        store: Arc<dyn Persistence>,
        registry: Arc<ConnectionRegistry>,
        router: Arc<EventRouter>,
        notifier: Arc<Notifier>,
    ) -> Self {
        Self {
            users,
            store,
            registry,
            router,
            notifier,
        }
    }

    /// Send a direct message.
    ///
    /// Nothing is written until both parties exist and neither has blocked
    /// the other. Once stored, the recipient gets `message.received` if
    /// online, otherwise a notification record is created; failing to create
    /// it is logged and does not fail the send. Every connection
    /// of the sender then gets `message.delivered`, correlated with
    /// `correlation_id` when given.
    pub async fn send(
        &self,
        sender: &Identity,
        recipient_id: &str,
        message: NewMessage,
        correlation_id: Option<&str>,
    ) -> Result<StoredMessage, DeliveryError> {
        if message.content.trim().is_empty() && message.image.is_none() && message.file.is_none() {
            return Err(DeliveryError::InvalidRequest("message is empty".to_string()));
        }

        let recipient = self
            .users
            .find_user(recipient_id)
            .await?
            .ok_or(DeliveryError::NotFound("recipient"))?;
        let sender_record = self
            .users
            .find_user(&sender.id)
            .await?
            .ok_or(DeliveryError::NotFound("sender"))?;

        if recipient.has_blocked(&sender.id) {
            return Err(DeliveryError::Blocked(BlockDirection::BlockedByRecipient));
        }
        if sender_record.has_blocked(recipient_id) {
            return Err(DeliveryError::Blocked(BlockDirection::BlockedBySender));
        }

        let stored = self.store.create_message(&sender.id, recipient_id, &message).await?;
        let conversation = self.store.upsert_conversation(&stored).await?;

        if self.router.is_online(recipient_id).await {
            let event = MessageReceived::from_stored(&stored, &conversation.id, &sender.name);
            let delivered = self
                .router
                .send_to_identity(recipient_id, ServerEvent::MessageReceived(event))
                .await;
            debug!(message_id = %stored.id, recipient_id, delivered, "message delivered live");
        } else {
            let fallback = self
                .notifier
                .notify(NewNotification {
                    recipient_id: recipient_id.to_string(),
                    sender_id: sender.id.clone(),
                    kind: NotificationKind::Message,
                    title: "New message".to_string(),
                    message: format!("{} sent you a message", sender.name),
                    data: NotificationData {
                        message_id: Some(stored.id.clone()),
                        ..Default::default()
                    },
                })
                .await;
            // The message is stored at this point, so the send succeeds either way.
            match fallback {
                Ok(_) => debug!(message_id = %stored.id, recipient_id, "recipient offline, notification queued"),
                Err(e) => error!(message_id = %stored.id, recipient_id, error = %e, "failed to queue offline notification"),
            }
        }

        let ack = ServerEvent::MessageDelivered {
            message_id: stored.id.clone(),
            conversation_id: conversation.id.clone(),
            timestamp: stored.created_at,
        };
        let envelope = match correlation_id {
            Some(id) => WsEnvelope::correlated(ack, id),
            None => WsEnvelope::new(ack),
        };
        self.router.deliver(&sender.id, envelope).await;

        info!(message_id = %stored.id, sender_id = %sender.id, recipient_id, "message sent");
        Ok(stored)
    }

    /// Record that `reader` has read a message and tell its sender.
    pub async fn mark_read(&self, reader: &Identity, message_id: &str) -> Result<StoredMessage, DeliveryError> {
        let message = self
            .store
            .find_message(message_id)
            .await?
            .ok_or(DeliveryError::NotFound("message"))?;
        if message.recipient_id != reader.id {
            return Err(DeliveryError::InvalidRequest(
                "only the recipient can mark a message read".to_string(),
            ));
        }

        let now = Utc::now();
        let updated = self
            .store
            .mark_message_read(message_id, now)
            .await?
            .ok_or(DeliveryError::NotFound("message"))?;

        self.router
            .send_to_identity(
                &updated.sender_id,
                ServerEvent::MessageRead {
                    message_id: updated.id.clone(),
                    read_by: reader.id.clone(),
                    timestamp: updated.read_at.unwrap_or(now),
                },
            )
            .await;
        Ok(updated)
    }

    /// Mark `connection` as typing in a conversation and tell the other side.
    pub async fn typing_start(
        &self,
        connection: ConnectionId,
        typist: &Identity,
        recipient_id: &str,
        conversation_id: &str,
    ) -> usize {
        if !self
            .registry
            .set_typing(connection, &typist.id, &typist.name, conversation_id)
            .await
        {
            return 0;
        }
        self.router
            .send_to_identity(
                recipient_id,
                ServerEvent::TypingStarted {
                    user_id: typist.id.clone(),
                    name: typist.name.clone(),
                    conversation_id: conversation_id.to_string(),
                },
            )
            .await
    }

    pub async fn typing_stop(
        &self,
        connection: ConnectionId,
        typist: &Identity,
        recipient_id: &str,
        conversation_id: &str,
    ) -> usize {
        self.registry.clear_typing(connection).await;
        self.router
            .send_to_identity(
                recipient_id,
                ServerEvent::TypingStopped {
                    user_id: typist.id.clone(),
                    conversation_id: conversation_id.to_string(),
                },
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::realtime::registry::ConnectionHandle;
    use crate::error::StoreError;
    use crate::store::{MemoryStore, UserRecord};
    use async_trait::async_trait;
    use chrono::DateTime;
    use kinship_shared::{Conversation, Notification};
    use tokio::sync::mpsc::{self, UnboundedReceiver};

    type Inbox = UnboundedReceiver<WsEnvelope<ServerEvent>>;

    struct Harness {
        store: Arc<MemoryStore>,
        registry: Arc<ConnectionRegistry>,
        delivery: MessageDelivery,
    }

    /// Stores messages normally but cannot write notifications.
    struct NotificationsDown(Arc<MemoryStore>);

    #[async_trait]
    impl Persistence for NotificationsDown {
        async fn create_message(
            &self,
            sender_id: &str,
            recipient_id: &str,
            message: &NewMessage,
        ) -> Result<StoredMessage, StoreError> {
            self.0.create_message(sender_id, recipient_id, message).await
        }

        async fn upsert_conversation(&self, message: &StoredMessage) -> Result<Conversation, StoreError> {
            self.0.upsert_conversation(message).await
        }

        async fn find_message(&self, id: &str) -> Result<Option<StoredMessage>, StoreError> {
            self.0.find_message(id).await
        }

        async fn mark_message_read(
            &self,
            id: &str,
            at: DateTime<Utc>,
        ) -> Result<Option<StoredMessage>, StoreError> {
            self.0.mark_message_read(id, at).await
        }

        async fn create_notification(&self, _: NewNotification) -> Result<Notification, StoreError> {
            Err(StoreError::Backend("notifications down".to_string()))
        }

        async fn unread_notification_count(&self, recipient_id: &str) -> Result<u64, StoreError> {
            self.0.unread_notification_count(recipient_id).await
        }

        async fn mark_notifications_read(
            &self,
            recipient_id: &str,
            ids: &[String],
            mark_all: bool,
        ) -> Result<u64, StoreError> {
            self.0.mark_notifications_read(recipient_id, ids, mark_all).await
        }
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryStore::new());
        harness_with(store.clone(), store)
    }

    fn harness_with(store: Arc<MemoryStore>, persistence: Arc<dyn Persistence>) -> Harness {
        let registry = Arc::new(ConnectionRegistry::new());
        let router = Arc::new(EventRouter::new(Arc::clone(&registry), store.clone(), 64));
        let notifier = Arc::new(Notifier::new(Arc::clone(&persistence), Arc::clone(&router)));
        let delivery = MessageDelivery::new(
            store.clone(),
            persistence,
            Arc::clone(&registry),
            router,
            notifier,
        );
        Harness {
            store,
            registry,
            delivery,
        }
    }

    async fn user(h: &Harness, id: &str, name: &str) -> Identity {
        let record = UserRecord::new(id, name);
        let identity = record.identity();
        h.store.insert_user(record).await;
        identity
    }

    async fn connect(h: &Harness, identity: &Identity) -> (ConnectionId, Inbox) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = ConnectionHandle::new(&identity.id, tx);
        let id = handle.id;
        h.registry.add_connection(identity, handle).await;
        (id, rx)
    }

    fn drain(rx: &mut Inbox) -> Vec<WsEnvelope<ServerEvent>> {
        std::iter::from_fn(|| rx.try_recv().ok()).collect()
    }

    #[tokio::test]
    async fn live_delivery_reaches_recipient_and_acks_every_sender_connection() {
        let h = harness();
        let a = user(&h, "a", "Ann").await;
        let b = user(&h, "b", "Ben").await;
        let (_c1, mut c1) = connect(&h, &a).await;
        let (_c2, mut c2) = connect(&h, &a).await;
        let (_c3, mut c3) = connect(&h, &b).await;

        let stored = h
            .delivery
            .send(&a, "b", NewMessage::text("hi"), Some("nonce-1"))
            .await
            .unwrap();

        assert_eq!(h.store.message_writes(), 1);

        let received = drain(&mut c3);
        assert_eq!(received.len(), 1);
        match &received[0].payload {
            ServerEvent::MessageReceived(m) => {
                assert_eq!(m.message_id, stored.id);
                assert_eq!(m.sender_name, "Ann");
            }
            other => panic!("unexpected event {other:?}"),
        }

        for inbox in [&mut c1, &mut c2] {
            let acks = drain(inbox);
            assert_eq!(acks.len(), 1);
            assert!(matches!(acks[0].payload, ServerEvent::MessageDelivered { .. }));
            assert_eq!(acks[0].correlation_id.as_deref(), Some("nonce-1"));
        }
        assert!(h.store.notifications_for("b").await.is_empty());
    }

    #[tokio::test]
    async fn offline_recipient_gets_a_notification_instead() {
        let h = harness();
        let a = user(&h, "a", "Ann").await;
        user(&h, "b", "Ben").await;

        let stored = h.delivery.send(&a, "b", NewMessage::text("hi"), None).await.unwrap();

        let notifications = h.store.notifications_for("b").await;
        assert_eq!(notifications.len(), 1);
        assert_eq!(notifications[0].kind, NotificationKind::Message);
        assert_eq!(notifications[0].data.message_id.as_deref(), Some(stored.id.as_str()));
    }

    #[tokio::test]
    async fn failed_notification_still_acks_the_stored_message() {
        let store = Arc::new(MemoryStore::new());
        let h = harness_with(store.clone(), Arc::new(NotificationsDown(store)));
        let a = user(&h, "a", "Ann").await;
        user(&h, "b", "Ben").await;
        let (_c1, mut sender_inbox) = connect(&h, &a).await;

        let stored = h
            .delivery
            .send(&a, "b", NewMessage::text("hi"), Some("n1"))
            .await
            .unwrap();

        assert_eq!(h.store.message_writes(), 1);
        assert!(h.store.notifications_for("b").await.is_empty());
        let acks = drain(&mut sender_inbox);
        assert!(matches!(
            &acks[..],
            [WsEnvelope { payload: ServerEvent::MessageDelivered { message_id, .. }, .. }] if *message_id == stored.id
        ));
    }

    #[tokio::test]
    async fn blocked_sends_write_nothing() {
        let h = harness();
        let a = user(&h, "a", "Ann").await;
        let mut b = UserRecord::new("b", "Ben");
        b.blocked_users = vec!["a".to_string()];
        h.store.insert_user(b).await;
        let (_c3, mut c3) = connect(&h, &Identity { id: "b".into(), name: "Ben".into(), avatar: None }).await;

        let err = h.delivery.send(&a, "b", NewMessage::text("hi"), None).await.unwrap_err();
        assert_eq!(err, DeliveryError::Blocked(BlockDirection::BlockedByRecipient));
        assert_eq!(h.store.message_writes(), 0);
        assert!(drain(&mut c3).is_empty());

        let mut a_record = UserRecord::new("a", "Ann");
        a_record.blocked_users = vec!["c".to_string()];
        h.store.insert_user(a_record).await;
        user(&h, "c", "Cat").await;
        let err = h.delivery.send(&a, "c", NewMessage::text("hi"), None).await.unwrap_err();
        assert_eq!(err, DeliveryError::Blocked(BlockDirection::BlockedBySender));
        assert_eq!(h.store.message_writes(), 0);
    }

    #[tokio::test]
    async fn unknown_recipient_and_empty_body_are_rejected() {
        let h = harness();
        let a = user(&h, "a", "Ann").await;
        assert_eq!(
            h.delivery.send(&a, "ghost", NewMessage::text("hi"), None).await,
            Err(DeliveryError::NotFound("recipient"))
        );
        assert!(matches!(
            h.delivery.send(&a, "ghost", NewMessage::text("   "), None).await,
            Err(DeliveryError::InvalidRequest(_))
        ));
        assert_eq!(h.store.message_writes(), 0);
    }

    #[tokio::test]
    async fn only_the_recipient_can_mark_read() {
        let h = harness();
        let a = user(&h, "a", "Ann").await;
        let b = user(&h, "b", "Ben").await;
        let (_c1, mut sender_inbox) = connect(&h, &a).await;

        let stored = h.delivery.send(&a, "b", NewMessage::text("hi"), None).await.unwrap();
        drain(&mut sender_inbox);

        assert!(matches!(
            h.delivery.mark_read(&a, &stored.id).await,
            Err(DeliveryError::InvalidRequest(_))
        ));
        assert_eq!(
            h.delivery.mark_read(&b, "missing").await,
            Err(DeliveryError::NotFound("message"))
        );

        let read = h.delivery.mark_read(&b, &stored.id).await.unwrap();
        assert!(read.is_read);
        let events = drain(&mut sender_inbox);
        assert!(matches!(
            &events[..],
            [WsEnvelope { payload: ServerEvent::MessageRead { read_by, .. }, .. }] if read_by == "b"
        ));
    }

    #[tokio::test]
    async fn typing_follows_the_connection() {
        let h = harness();
        let a = user(&h, "a", "Ann").await;
        let b = user(&h, "b", "Ben").await;
        let (typist, _a_inbox) = connect(&h, &a).await;
        let (_c3, mut b_inbox) = connect(&h, &b).await;

        assert_eq!(h.delivery.typing_start(typist, &a, "b", "k").await, 1);
        assert_eq!(h.registry.typing_in("k").await.len(), 1);
        assert!(matches!(drain(&mut b_inbox)[0].payload, ServerEvent::TypingStarted { .. }));

        h.registry.remove_connection("a", typist).await;
        assert!(h.registry.typing_in("k").await.is_empty());
        assert_eq!(h.delivery.typing_start(typist, &a, "b", "k").await, 0);
    }
}
