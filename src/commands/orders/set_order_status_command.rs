use std::sync::Arc;

use lazy_static::lazy_static;
use prometheus::IntCounter;
use sea_orm::{DatabaseTransaction, TransactionTrait};
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

use super::{compare_and_swap, ensure_operation_unbound, load_order_with_items, publish_movements, OrderChanges};
use crate::{
    commands::Command,
    db::{rollback_quietly, DbPool},
    entities::{OrderStatus, OrderWithItems},
    errors::ServiceError,
    events::{self, Event, EventSender},
    services::inventory::{self, StockMovement},
};

lazy_static! {
    static ref ORDER_STATUS_CHANGES: IntCounter = IntCounter::new(
        "order_status_changes_total",
        "Total number of administrative order status changes"
    )
    .expect("metric can be created");
    static ref ORDER_STATUS_CHANGE_FAILURES: IntCounter = IntCounter::new(
        "order_status_change_failures_total",
        "Total number of failed administrative order status changes"
    )
    .expect("metric can be created");
}

/// Administrative status transition.
///
/// Entering Confirmed binds `operation_number` and debits stock; leaving
/// Confirmed for Cancelled credits it back. Requesting the current status is
/// a no-op.
#[derive(Debug, Clone)]
pub struct SetOrderStatusCommand {
    pub order_id: Uuid,
    pub new_status: OrderStatus,
    /// Required when confirming
    pub operation_number: Option<String>,
    pub note: Option<String>,
}

enum Outcome {
    Unchanged(OrderWithItems),
    Changed {
        order: OrderWithItems,
        from: OrderStatus,
        movements: Vec<StockMovement>,
    },
}

#[async_trait::async_trait]
impl Command for SetOrderStatusCommand {
    type Result = OrderWithItems;

    #[instrument(skip(self, db_pool, event_sender), fields(order_id = %self.order_id, new_status = %self.new_status))]
    async fn execute(
        &self,
        db_pool: Arc<DbPool>,
        event_sender: Option<Arc<EventSender>>,
    ) -> Result<Self::Result, ServiceError> {
        let txn = db_pool.begin().await?;

        let outcome = match self.transition(&txn).await {
            Ok(outcome) => outcome,
            Err(e) => {
                rollback_quietly(txn).await;
                ORDER_STATUS_CHANGE_FAILURES.inc();
                error!(order_id = %self.order_id, error = %e, "Failed to change order status");
                return Err(e);
            }
        };

        match outcome {
            Outcome::Unchanged(order) => {
                rollback_quietly(txn).await;
                debug!(order_id = %self.order_id, "Order already in requested status");
                Ok(order)
            }
            Outcome::Changed {
                order,
                from,
                movements,
            } => {
                txn.commit().await?;
                ORDER_STATUS_CHANGES.inc();
                info!(
                    order_id = %self.order_id,
                    from = %from,
                    to = %self.new_status,
                    stock_movements = movements.len(),
                    "Order status changed"
                );

                let sender = event_sender.as_deref();
                if let Some(operation_number) = order
                    .order
                    .operation_number
                    .clone()
                    .filter(|_| self.new_status == OrderStatus::Confirmed)
                {
                    events::publish(
                        sender,
                        Event::OrderConfirmed {
                            order_id: self.order_id,
                            operation_number,
                        },
                    )
                    .await;
                }
                events::publish(
                    sender,
                    Event::OrderStatusChanged {
                        order_id: self.order_id,
                        old_status: from,
                        new_status: self.new_status,
                    },
                )
                .await;
                publish_movements(sender, self.order_id, &movements).await;

                Ok(order)
            }
        }
    }
}

impl SetOrderStatusCommand {
    pub fn new(order_id: Uuid, new_status: OrderStatus) -> Self {
        Self {
            order_id,
            new_status,
            operation_number: None,
            note: None,
        }
    }

    pub fn with_operation_number(mut self, operation_number: impl Into<String>) -> Self {
        self.operation_number = Some(operation_number.into());
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }

    async fn transition(&self, txn: &DatabaseTransaction) -> Result<Outcome, ServiceError> {
        let current = load_order_with_items(txn, self.order_id).await?;
        let from = current.order.status;
        let to = self.new_status;

        if from == to {
            let requested = self
                .operation_number
                .as_deref()
                .map(str::trim)
                .filter(|op| !op.is_empty());
            if let (Some(requested), Some(bound)) =
                (requested, current.order.operation_number.as_deref())
            {
                if requested != bound {
                    return Err(ServiceError::Conflict(format!(
                        "order {} is already confirmed with operation number {}",
                        current.order.order_number, bound
                    )));
                }
            }
            return Ok(Outcome::Unchanged(current));
        }
        if from.is_terminal() {
            return Err(ServiceError::InvariantViolation(format!(
                "order {} is {} and cannot change status",
                current.order.order_number, from
            )));
        }
        if !from.can_transition_to(to) {
            return Err(ServiceError::InvalidTransition { from, to });
        }

        let note = self
            .note
            .clone()
            .unwrap_or_else(|| format!("Status changed from {} to {} by administrator", from, to));

        let mut changes = OrderChanges {
            status: Some(to),
            note: Some(note),
            ..Default::default()
        };

        if to == OrderStatus::Confirmed {
            let operation_number = self
                .operation_number
                .as_deref()
                .map(str::trim)
                .filter(|op| !op.is_empty())
                .ok_or_else(|| {
                    ServiceError::ValidationError(
                        "An operation number is required to confirm an order".to_string(),
                    )
                })?;
            if current.order.operation_number.is_some() {
                return Err(ServiceError::InvariantViolation(format!(
                    "order {} already carries an operation number",
                    current.order.order_number
                )));
            }
            ensure_operation_unbound(txn, operation_number, self.order_id).await?;
            changes.operation_number = Some(operation_number.to_string());
        }

        let order = compare_and_swap(txn, &current.order, changes).await?;

        let movements = match (from.holds_stock(), to.holds_stock(), to) {
            (false, true, _) => inventory::debit_items(txn, &current.items).await?,
            (true, false, OrderStatus::Cancelled) => {
                inventory::credit_items(txn, &current.items).await?
            }
            _ => Vec::new(),
        };

        Ok(Outcome::Changed {
            order: OrderWithItems {
                order,
                items: current.items,
            },
            from,
            movements,
        })
    }
}
