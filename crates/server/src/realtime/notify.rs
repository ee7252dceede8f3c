//! Durable notifications with a live nudge when the recipient is connected.

use std::sync::Arc;

use kinship_shared::{NewNotification, Notification, ServerEvent};
use tracing::debug;

use super::router::EventRouter;
use crate::error::{DeliveryError, StoreError};
use crate::store::Persistence;

pub struct Notifier {
    store: Arc<dyn Persistence>,
    router: Arc<EventRouter>,
}

impl Notifier {
    pub fn new(store: Arc<dyn Persistence>, router: Arc<EventRouter>) -> Self {
        Self { store, router }
    }

    /// Persist a notification, then push it and the new unread count to the
    /// recipient if they are online.
    pub async fn notify(&self, notification: NewNotification) -> Result<Notification, StoreError> {
        let stored = self.store.create_notification(notification).await?;
        debug!(
            notification_id = %stored.id,
            recipient_id = %stored.recipient_id,
            kind = stored.kind.as_str(),
            "notification stored"
        );

        let recipient = stored.recipient_id.clone();
        self.router
            .send_to_identity(&recipient, ServerEvent::NotificationReceived(stored.clone()))
            .await;
        self.push_count(&recipient).await?;
        Ok(stored)
    }

    /// Mark the listed notifications, or all of them, read. Returns how many
    /// changed.
    pub async fn mark_read(&self, recipient_id: &str, ids: &[String], mark_all: bool) -> Result<u64, DeliveryError> {
        if !mark_all && ids.is_empty() {
            return Err(DeliveryError::InvalidRequest(
                "notification ids or mark_all are required".to_string(),
            ));
        }

        let changed = self
            .store
            .mark_notifications_read(recipient_id, ids, mark_all)
            .await?;
        self.push_count(recipient_id).await?;
        Ok(changed)
    }

    /// Send the current unread count to a connected recipient. Skips the
    /// count query entirely when nobody would receive it.
    pub async fn push_count(&self, recipient_id: &str) -> Result<(), StoreError> {
        if !self.router.is_online(recipient_id).await {
            return Ok(());
        }
        let unread = self.store.unread_notification_count(recipient_id).await?;
        self.router
            .send_to_identity(recipient_id, ServerEvent::NotificationCountUpdate { unread })
            .await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::realtime::registry::{ConnectionHandle, ConnectionRegistry};
    use crate::store::MemoryStore;
    use kinship_shared::{Identity, NotificationKind, WsEnvelope};
    use tokio::sync::mpsc;

    fn new_notification(to: &str) -> NewNotification {
        NewNotification {
            recipient_id: to.to_string(),
            sender_id: "bob".to_string(),
            kind: NotificationKind::FriendRequest,
            title: "Friend request".to_string(),
            message: "Bob sent you a friend request".to_string(),
            data: Default::default(),
        }
    }

    fn setup() -> (Arc<MemoryStore>, Arc<ConnectionRegistry>, Notifier) {
        let store = Arc::new(MemoryStore::new());
        let registry = Arc::new(ConnectionRegistry::new());
        let router = Arc::new(EventRouter::new(Arc::clone(&registry), store.clone(), 64));
        let notifier = Notifier::new(store.clone(), router);
        (store, registry, notifier)
    }

    #[tokio::test]
    async fn online_recipient_gets_notification_then_count() {
        let (_store, registry, notifier) = setup();
        let (tx, mut rx) = mpsc::unbounded_channel::<WsEnvelope<ServerEvent>>();
        let alice = Identity {
            id: "alice".to_string(),
            name: "Alice".to_string(),
            avatar: None,
        };
        registry.add_connection(&alice, ConnectionHandle::new("alice", tx)).await;

        notifier.notify(new_notification("alice")).await.unwrap();

        assert!(matches!(rx.try_recv().unwrap().payload, ServerEvent::NotificationReceived(_)));
        assert!(matches!(
            rx.try_recv().unwrap().payload,
            ServerEvent::NotificationCountUpdate { unread: 1 }
        ));
    }

    #[tokio::test]
    async fn offline_recipient_still_gets_the_record() {
        let (store, _registry, notifier) = setup();
        notifier.notify(new_notification("alice")).await.unwrap();
        assert_eq!(store.notifications_for("alice").await.len(), 1);
    }

    #[tokio::test]
    async fn mark_read_needs_ids_or_all() {
        let (store, _registry, notifier) = setup();
        let first = notifier.notify(new_notification("alice")).await.unwrap();
        notifier.notify(new_notification("alice")).await.unwrap();

        assert!(matches!(
            notifier.mark_read("alice", &[], false).await,
            Err(DeliveryError::InvalidRequest(_))
        ));
        assert_eq!(notifier.mark_read("alice", &[first.id], false).await.unwrap(), 1);
        assert_eq!(notifier.mark_read("alice", &[], true).await.unwrap(), 1);
        assert_eq!(store.unread_notification_count("alice").await.unwrap(), 0);
    }
}
