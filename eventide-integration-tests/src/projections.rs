//! Read models over [`OrderEvent`]s.

use async_trait::async_trait;
use eventide::cqrs::{FieldKind, FieldSpec, ProjectionDocument, ProjectionSchema};
use eventide::types::{EventType, IndexName};
use eventide::{DocumentWriter, ProjectionBuilder, ProjectionResult, RecordedEvent};
use serde::{Deserialize, Serialize};

use crate::orders::OrderEvent;

/// One document per order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderSummary {
    pub customer_id: String,
    pub status: String,
    pub item_count: u32,
    pub total_cents: i64,
}

impl ProjectionSchema for OrderSummary {
    fn index_name() -> IndexName {
        IndexName::of("order-summaries")
    }

    fn fields() -> Vec<FieldSpec> {
        vec![
            FieldSpec::new("customer_id", FieldKind::String).filterable(),
            FieldSpec::new("status", FieldKind::String).filterable(),
            FieldSpec::new("item_count", FieldKind::Integer).filterable(),
            FieldSpec::new("total_cents", FieldKind::Integer),
        ]
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct OrderSummaryBuilder;

#[async_trait]
impl ProjectionBuilder<OrderEvent> for OrderSummaryBuilder {
    type Document = OrderSummary;

    fn name(&self) -> &str {
        "order-summary"
    }

    fn handled_event_types(&self) -> Vec<EventType> {
        vec![
            EventType::of("OrderPlaced"),
            EventType::of("OrderItemAdded"),
            EventType::of("OrderShipped"),
            EventType::of("OrderCancelled"),
        ]
    }

    async fn apply(
        &self,
        event: &RecordedEvent<OrderEvent>,
        documents: &DocumentWriter<'_, OrderSummary>,
    ) -> ProjectionResult<()> {
        let id: &str = event.aggregate_id.as_ref();
        let partition = &event.partition_key;
        match &event.payload {
            OrderEvent::OrderPlaced { customer_id } => {
                let summary = OrderSummary {
                    customer_id: customer_id.clone(),
                    status: "placed".to_string(),
                    item_count: 0,
                    total_cents: 0,
                };
                documents
                    .upsert_document(ProjectionDocument::new(
                        id,
                        partition.clone(),
                        event.timestamp,
                        summary,
                    ))
                    .await?;
            }
            OrderEvent::OrderItemAdded {
                quantity,
                unit_price_cents,
                ..
            } => {
                let line_total = unit_price_cents * i64::from(*quantity);
                documents
                    .update_document(id, partition, event.timestamp, |summary| {
                        summary.item_count += 1;
                        summary.total_cents += line_total;
                    })
                    .await?;
            }
            OrderEvent::OrderShipped => {
                documents
                    .update_document(id, partition, event.timestamp, |summary| {
                        summary.status = "shipped".to_string();
                    })
                    .await?;
            }
            OrderEvent::OrderCancelled { .. } => {
                documents
                    .update_document(id, partition, event.timestamp, |summary| {
                        summary.status = "cancelled".to_string();
                    })
                    .await?;
            }
        }
        Ok(())
    }
}

/// Orders placed per customer and partition.
///
/// Several order streams feed one document, so idempotence is tracked per
/// stream rather than per document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomerActivity {
    pub orders_placed: u32,
    pub last_order_id: String,
}

impl ProjectionSchema for CustomerActivity {
    fn index_name() -> IndexName {
        IndexName::of("customer-activity")
    }

    fn fields() -> Vec<FieldSpec> {
        vec![
            FieldSpec::new("orders_placed", FieldKind::Integer).filterable(),
            FieldSpec::new("last_order_id", FieldKind::String),
        ]
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CustomerActivityBuilder;

#[async_trait]
impl ProjectionBuilder<OrderEvent> for CustomerActivityBuilder {
    type Document = CustomerActivity;

    fn name(&self) -> &str {
        "customer-activity"
    }

    fn handled_event_types(&self) -> Vec<EventType> {
        vec![EventType::of("OrderPlaced")]
    }

    async fn apply(
        &self,
        event: &RecordedEvent<OrderEvent>,
        documents: &DocumentWriter<'_, CustomerActivity>,
    ) -> ProjectionResult<()> {
        let OrderEvent::OrderPlaced { customer_id } = &event.payload else {
            return Ok(());
        };
        let order_id = event.aggregate_id.to_string();
        let partition = &event.partition_key;

        if documents.get_document(customer_id, partition).await?.is_some() {
            documents
                .update_document(customer_id, partition, event.timestamp, |activity| {
                    activity.orders_placed += 1;
                    activity.last_order_id.clone_from(&order_id);
                })
                .await?;
        } else {
            let activity = CustomerActivity {
                orders_placed: 1,
                last_order_id: order_id,
            };
            documents
                .upsert_document(ProjectionDocument::new(
                    customer_id.as_str(),
                    partition.clone(),
                    event.timestamp,
                    activity,
                ))
                .await?;
        }
        Ok(())
    }
}
