//! Order fulfillment commands.
//!
//! Every command that changes an order runs as one transaction. The order row
//! is written with a compare-and-swap on `(id, version, status)` and stock
//! moves through the conditional updates in [`crate::services::inventory`],
//! so a lost race surfaces as a retryable error instead of a double effect.

pub mod apply_proof_decision_command;
pub mod delete_order_command;
pub mod set_order_status_command;
pub mod submit_order_command;

pub use apply_proof_decision_command::ApplyProofDecisionCommand;
pub use delete_order_command::DeleteOrderCommand;
pub use set_order_status_command::SetOrderStatusCommand;
pub use submit_order_command::{CreateOrderRequest, OrderLineRequest, SubmitOrderCommand};

use chrono::Utc;
use sea_orm::{
    ActiveValue::Set, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, QueryOrder,
};
use tracing::warn;
use uuid::Uuid;

use crate::{
    entities::{order, order_item, OrderStatus, OrderWithItems},
    errors::ServiceError,
    events::{self, Event, EventSender},
    services::inventory::StockMovement,
};

/// Fields written by a single order transition.
#[derive(Debug, Default)]
pub(crate) struct OrderChanges {
    pub status: Option<OrderStatus>,
    pub operation_number: Option<String>,
    pub note: Option<String>,
    pub payment_proof_ref: Option<String>,
}

pub(crate) async fn load_order_with_items<C>(
    conn: &C,
    order_id: Uuid,
) -> Result<OrderWithItems, ServiceError>
where
    C: ConnectionTrait,
{
    let order = order::Entity::find_by_id(order_id)
        .one(conn)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;

    let items = order_item::Entity::find()
        .filter(order_item::Column::OrderId.eq(order_id))
        .order_by_asc(order_item::Column::ProductName)
        .all(conn)
        .await?;

    Ok(OrderWithItems { order, items })
}

/// Finds an order other than `excluding` that already owns `operation_number`.
pub(crate) async fn find_bound_operation<C>(
    conn: &C,
    operation_number: &str,
    excluding: Uuid,
) -> Result<Option<order::Model>, ServiceError>
where
    C: ConnectionTrait,
{
    Ok(order::Entity::find()
        .filter(order::Column::OperationNumber.eq(operation_number))
        .filter(order::Column::Id.ne(excluding))
        .one(conn)
        .await?)
}

pub(crate) async fn ensure_operation_unbound<C>(
    conn: &C,
    operation_number: &str,
    order_id: Uuid,
) -> Result<(), ServiceError>
where
    C: ConnectionTrait,
{
    if let Some(owner) = find_bound_operation(conn, operation_number, order_id).await? {
        warn!(%order_id, operation_number, owner = %owner.order_number, "operation number already bound");
        return Err(ServiceError::Conflict(format!(
            "operation number {} already belongs to order {}",
            operation_number, owner.order_number
        )));
    }
    Ok(())
}

/// Applies `changes` only if the order still has the version and status that
/// `current` was read with. Returns the updated row.
pub(crate) async fn compare_and_swap<C>(
    conn: &C,
    current: &order::Model,
    changes: OrderChanges,
) -> Result<order::Model, ServiceError>
where
    C: ConnectionTrait,
{
    let binds_operation = changes.operation_number.is_some();

    let mut update = order::ActiveModel {
        version: Set(current.version + 1),
        updated_at: Set(Some(Utc::now())),
        ..Default::default()
    };
    if let Some(status) = changes.status {
        update.status = Set(status);
    }
    if let Some(operation_number) = changes.operation_number {
        update.operation_number = Set(Some(operation_number));
    }
    if let Some(note) = changes.note {
        update.notes = Set(Some(append_note(current.notes.as_deref(), &note)));
    }
    if let Some(reference) = changes.payment_proof_ref {
        update.payment_proof_ref = Set(Some(reference));
    }

    let result = order::Entity::update_many()
        .set(update)
        .filter(order::Column::Id.eq(current.id))
        .filter(order::Column::Version.eq(current.version))
        .filter(order::Column::Status.eq(current.status))
        .exec(conn)
        .await
        .map_err(|e| {
            if binds_operation {
                ServiceError::from_db_with_conflict(e, "operation number already bound")
            } else {
                ServiceError::DatabaseError(e)
            }
        })?;

    if result.rows_affected == 0 {
        warn!(order_id = %current.id, version = current.version, "order changed concurrently");
        return Err(ServiceError::Conflict(format!(
            "order {} was modified concurrently",
            current.id
        )));
    }

    order::Entity::find_by_id(current.id)
        .one(conn)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", current.id)))
}

/// Appends a line to the audit trail.
pub(crate) fn append_note(existing: Option<&str>, note: &str) -> String {
    match existing.map(str::trim_end).filter(|s| !s.is_empty()) {
        Some(existing) => format!("{}\n{}", existing, note),
        None => note.to_string(),
    }
}

pub(crate) async fn publish_movements(
    event_sender: Option<&EventSender>,
    order_id: Uuid,
    movements: &[StockMovement],
) {
    for movement in movements {
        events::publish(
            event_sender,
            Event::StockAdjusted {
                product_id: movement.product_id,
                order_id,
                delta: movement.delta,
            },
        )
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_note_starts_or_extends_the_trail() {
        assert_eq!(append_note(None, "first"), "first");
        assert_eq!(append_note(Some(""), "first"), "first");
        assert_eq!(append_note(Some("first\n"), "second"), "first\nsecond");
    }
}
