use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::entities::OrderStatus;

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    /// Creates a new EventSender
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Sends an event asynchronously
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }
}

/// Creates a bounded event channel and the sender wrapper the services take.
pub fn channel(capacity: usize) -> (EventSender, mpsc::Receiver<Event>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (EventSender::new(tx), rx)
}

/// Domain events emitted after a unit of work commits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    OrderCreated {
        order_id: Uuid,
        order_number: String,
        total: Decimal,
    },
    /// A payment proof was accepted and the order moved to Confirmed.
    OrderConfirmed {
        order_id: Uuid,
        operation_number: String,
    },
    OrderStatusChanged {
        order_id: Uuid,
        old_status: OrderStatus,
        new_status: OrderStatus,
    },
    ProofRejected {
        order_id: Uuid,
        reason: String,
        at: DateTime<Utc>,
    },
    /// Net stock movement for one product; negative when stock left the shelf.
    StockAdjusted {
        product_id: Uuid,
        order_id: Uuid,
        delta: i32,
    },
    OrderDeleted {
        order_id: Uuid,
        order_number: String,
    },
}

impl Event {
    pub fn order_id(&self) -> Uuid {
        match self {
            Event::OrderCreated { order_id, .. }
            | Event::OrderConfirmed { order_id, .. }
            | Event::OrderStatusChanged { order_id, .. }
            | Event::ProofRejected { order_id, .. }
            | Event::StockAdjusted { order_id, .. }
            | Event::OrderDeleted { order_id, .. } => *order_id,
        }
    }
}

/// Sends an event if a sender is configured. Delivery failures are logged and
/// never fail the operation that produced the event.
pub async fn publish(sender: Option<&EventSender>, event: Event) {
    if let Some(sender) = sender {
        if let Err(e) = sender.send(event).await {
            warn!(error = %e, "Event could not be delivered");
        }
    }
}

/// Drains the event channel, logging every event. Returns once all senders
/// are dropped.
pub async fn process_events(mut rx: mpsc::Receiver<Event>) {
    info!("Starting event processing loop");

    while let Some(event) = rx.recv().await {
        match &event {
            Event::OrderCreated {
                order_id,
                order_number,
                total,
            } => info!(%order_id, %order_number, %total, "order created"),
            Event::OrderConfirmed {
                order_id,
                operation_number,
            } => info!(%order_id, %operation_number, "order confirmed by payment proof"),
            Event::OrderStatusChanged {
                order_id,
                old_status,
                new_status,
            } => info!(%order_id, %old_status, %new_status, "order status changed"),
            Event::ProofRejected {
                order_id,
                reason,
                at,
            } => warn!(%order_id, %reason, %at, "payment proof rejected"),
            Event::StockAdjusted {
                product_id,
                order_id,
                delta,
            } => info!(%product_id, %order_id, delta, "stock adjusted"),
            Event::OrderDeleted {
                order_id,
                order_number,
            } => info!(%order_id, %order_number, "order deleted"),
        }
    }

    info!("Event processing loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_delivers_to_the_channel() {
        let (sender, mut rx) = channel(4);
        let order_id = Uuid::new_v4();

        publish(
            Some(&sender),
            Event::OrderDeleted {
                order_id,
                order_number: "ORD-20240512-0001".into(),
            },
        )
        .await;

        let received = rx.recv().await.unwrap();
        assert_eq!(received.order_id(), order_id);
    }

    #[tokio::test]
    async fn publish_survives_a_closed_channel() {
        let (sender, rx) = channel(1);
        drop(rx);

        publish(
            Some(&sender),
            Event::OrderConfirmed {
                order_id: Uuid::new_v4(),
                operation_number: "123456789".into(),
            },
        )
        .await;
    }

    #[tokio::test]
    async fn process_events_returns_when_senders_drop() {
        let (sender, rx) = channel(2);
        sender
            .send(Event::StockAdjusted {
                product_id: Uuid::new_v4(),
                order_id: Uuid::new_v4(),
                delta: -2,
            })
            .await
            .unwrap();
        drop(sender);

        process_events(rx).await;
    }
}
