//! The order aggregate and the commands that drive it.

use eventide::types::EventType;
use eventide::{Aggregate, AggregateRoot, DomainEvent, EventStoreError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Everything that can happen to an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum OrderEvent {
    OrderPlaced {
        customer_id: String,
    },
    OrderItemAdded {
        sku: String,
        quantity: u32,
        unit_price_cents: i64,
    },
    OrderShipped,
    OrderCancelled {
        reason: String,
    },
}

impl DomainEvent for OrderEvent {
    fn event_type(&self) -> EventType {
        match self {
            Self::OrderPlaced { .. } => EventType::of("OrderPlaced"),
            Self::OrderItemAdded { .. } => EventType::of("OrderItemAdded"),
            Self::OrderShipped => EventType::of("OrderShipped"),
            Self::OrderCancelled { .. } => EventType::of("OrderCancelled"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderLine {
    pub sku: String,
    pub quantity: u32,
    pub unit_price_cents: i64,
}

impl OrderLine {
    pub fn total_cents(&self) -> i64 {
        self.unit_price_cents * i64::from(self.quantity)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OrderStatus {
    #[default]
    Draft,
    Placed,
    Shipped,
    Cancelled,
}

impl OrderStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Placed => "placed",
            Self::Shipped => "shipped",
            Self::Cancelled => "cancelled",
        }
    }
}

/// State folded from an order's stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Order {
    customer_id: Option<String>,
    status: OrderStatus,
    items: Vec<OrderLine>,
}

impl Order {
    pub fn customer_id(&self) -> Option<&str> {
        self.customer_id.as_deref()
    }

    pub const fn status(&self) -> OrderStatus {
        self.status
    }

    pub fn items(&self) -> &[OrderLine] {
        &self.items
    }

    pub fn total_cents(&self) -> i64 {
        self.items.iter().map(OrderLine::total_cents).sum()
    }
}

impl Aggregate for Order {
    type Event = OrderEvent;

    fn apply(&mut self, event: &OrderEvent) {
        match event {
            OrderEvent::OrderPlaced { customer_id } => {
                self.customer_id = Some(customer_id.clone());
                self.status = OrderStatus::Placed;
            }
            OrderEvent::OrderItemAdded {
                sku,
                quantity,
                unit_price_cents,
            } => self.items.push(OrderLine {
                sku: sku.clone(),
                quantity: *quantity,
                unit_price_cents: *unit_price_cents,
            }),
            OrderEvent::OrderShipped => self.status = OrderStatus::Shipped,
            OrderEvent::OrderCancelled { .. } => self.status = OrderStatus::Cancelled,
        }
    }
}

#[derive(Debug, Error)]
pub enum OrderError {
    #[error("order has already been placed")]
    AlreadyPlaced,

    #[error("order is {0:?}; expected it to be placed")]
    NotOpen(OrderStatus),

    #[error("quantity must be positive")]
    InvalidQuantity,

    #[error("order has no items to ship")]
    NothingToShip,

    #[error(transparent)]
    Store(#[from] EventStoreError),
}

pub fn place(order: &mut AggregateRoot<Order>, customer_id: &str) -> Result<(), OrderError> {
    if order.state().status != OrderStatus::Draft {
        return Err(OrderError::AlreadyPlaced);
    }
    order.record(OrderEvent::OrderPlaced {
        customer_id: customer_id.to_string(),
    });
    Ok(())
}

pub fn add_item(
    order: &mut AggregateRoot<Order>,
    sku: &str,
    quantity: u32,
    unit_price_cents: i64,
) -> Result<(), OrderError> {
    require_placed(order.state())?;
    if quantity == 0 {
        return Err(OrderError::InvalidQuantity);
    }
    order.record(OrderEvent::OrderItemAdded {
        sku: sku.to_string(),
        quantity,
        unit_price_cents,
    });
    Ok(())
}

pub fn ship(order: &mut AggregateRoot<Order>) -> Result<(), OrderError> {
    require_placed(order.state())?;
    if order.state().items.is_empty() {
        return Err(OrderError::NothingToShip);
    }
    order.record(OrderEvent::OrderShipped);
    Ok(())
}

pub fn cancel(order: &mut AggregateRoot<Order>, reason: &str) -> Result<(), OrderError> {
    require_placed(order.state())?;
    order.record(OrderEvent::OrderCancelled {
        reason: reason.to_string(),
    });
    Ok(())
}

fn require_placed(order: &Order) -> Result<(), OrderError> {
    match order.status {
        OrderStatus::Placed => Ok(()),
        other => Err(OrderError::NotOpen(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eventide::types::{AggregateId, PartitionKey};

    fn draft() -> AggregateRoot<Order> {
        AggregateRoot::new(
            AggregateId::try_new("order-1").unwrap(),
            PartitionKey::try_new("tenant-a").unwrap(),
        )
    }

    #[test]
    fn items_cannot_be_added_before_placing() {
        let mut order = draft();
        assert!(matches!(
            add_item(&mut order, "sku-1", 1, 100),
            Err(OrderError::NotOpen(OrderStatus::Draft))
        ));
        assert!(order.uncommitted_events().is_empty());
    }

    #[test]
    fn commands_record_and_apply_events() {
        let mut order = draft();
        place(&mut order, "c-1").unwrap();
        add_item(&mut order, "sku-1", 2, 250).unwrap();
        ship(&mut order).unwrap();

        assert_eq!(order.state().status(), OrderStatus::Shipped);
        assert_eq!(order.state().total_cents(), 500);
        assert_eq!(order.uncommitted_events().len(), 3);
        assert!(matches!(cancel(&mut order, "late"), Err(OrderError::NotOpen(_))));
    }
}
