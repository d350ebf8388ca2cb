//! Domain events: transactional outbox, relay to the broker and the
//! in-process consumer that reacts to payment outcomes.

use serde::{Deserialize, Serialize};

use crate::entities::outbox_event;

pub mod consumer;
pub mod outbox;
pub mod publisher;

pub use outbox::{enqueue, NewOutboxEvent, OutboxRelay};
pub use publisher::{InMemoryPublisher, Publisher, RedisPublisher};

/// Topic names used by the pipeline.
pub mod topics {
    pub const ORDER_RECEIVED_FOR_FULFILLMENT: &str = "order.received_for_fulfillment";
    pub const ORDER_PAID: &str = "order.paid";
    pub const ORDER_PAYMENT_FAILED: &str = "order.payment_failed";
    pub const ORDER_PAYMENT_FAILED_NOTIFY: &str = "order.payment_failed.notify";
    pub const ORDER_CONFIRMED: &str = "order.confirmed";
    pub const INVENTORY_COMMITTED: &str = "inventory.committed";
}

/// Aggregate names recorded on outbox rows.
pub mod aggregates {
    pub const ORDER: &str = "order";
    pub const INVENTORY: &str = "inventory";
}

/// Wire shape of a relayed event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxMessage {
    pub outbox_id: i64,
    pub topic: String,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub payload: serde_json::Value,
}

impl From<&outbox_event::Model> for OutboxMessage {
    fn from(event: &outbox_event::Model) -> Self {
        Self {
            outbox_id: event.id,
            topic: event.topic.clone(),
            aggregate_type: event.aggregate_type.clone(),
            aggregate_id: event.aggregate_id.clone(),
            payload: event.payload.clone(),
        }
    }
}
