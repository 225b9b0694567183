use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info};
use uuid::Uuid;

use crate::models::booking::BookingStatus;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum Recipient {
    User(Uuid),
    Operators,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    NewBooking,
    BookingEdited,
    StatusChanged,
    LocationUpdated,
    ReviewPrompt,
    PaymentConfirmed,
    PaymentFailed,
    AwaitingSettlement,
    EscrowReleased,
    PaymentRefunded,
}

#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub recipient: Recipient,
    pub kind: NotificationKind,
    pub booking_id: Uuid,
    pub booking_status: BookingStatus,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl Notification {
    pub fn new(
        recipient: Recipient,
        kind: NotificationKind,
        booking_id: Uuid,
        booking_status: BookingStatus,
        message: impl Into<String>,
    ) -> Self {
        Self {
            recipient,
            kind,
            booking_id,
            booking_status,
            message: message.into(),
            at: Utc::now(),
        }
    }
}

/// Fire-and-forget delivery. Implementations must not block and must
/// swallow their own failures; callers never roll back on a lost message.
pub trait Notifier: Send + Sync {
    fn dispatch(&self, notification: Notification);
}

/// Publishes onto the in-process event bus that the websocket feed reads.
pub struct BroadcastNotifier {
    tx: broadcast::Sender<Notification>,
}

impl BroadcastNotifier {
    pub fn new(tx: broadcast::Sender<Notification>) -> Self {
        Self { tx }
    }
}

impl Notifier for BroadcastNotifier {
    fn dispatch(&self, notification: Notification) {
        info!(
            booking_id = %notification.booking_id,
            kind = ?notification.kind,
            recipient = ?notification.recipient,
            "notification dispatched"
        );

        if self.tx.send(notification).is_err() {
            debug!("no live subscribers for notification");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_without_subscribers_is_silent() {
        let (tx, _) = broadcast::channel(4);
        let notifier = BroadcastNotifier::new(tx);

        notifier.dispatch(Notification::new(
            Recipient::Operators,
            NotificationKind::AwaitingSettlement,
            Uuid::new_v4(),
            BookingStatus::Completed,
            "escrow awaiting release",
        ));
    }

    #[tokio::test]
    async fn subscribers_receive_dispatched_notifications() {
        let (tx, mut rx) = broadcast::channel(4);
        let notifier = BroadcastNotifier::new(tx);
        let carrier = Uuid::new_v4();
        let booking = Uuid::new_v4();

        notifier.dispatch(Notification::new(
            Recipient::User(carrier),
            NotificationKind::NewBooking,
            booking,
            BookingStatus::Pending,
            "new booking request",
        ));

        let received = rx.recv().await.unwrap();
        assert_eq!(received.recipient, Recipient::User(carrier));
        assert_eq!(received.booking_id, booking);
        assert_eq!(received.kind, NotificationKind::NewBooking);
    }

    #[test]
    fn recipient_serializes_with_type_tag() {
        let id = Uuid::nil();
        let json = serde_json::to_value(Recipient::User(id)).unwrap();
        assert_eq!(json["type"], "user");
        assert_eq!(json["id"], id.to_string());

        let json = serde_json::to_value(Recipient::Operators).unwrap();
        assert_eq!(json["type"], "operators");
    }
}
