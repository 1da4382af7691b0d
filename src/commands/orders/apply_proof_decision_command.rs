use std::sync::Arc;

use chrono::Utc;
use lazy_static::lazy_static;
use prometheus::IntCounter;
use sea_orm::{DatabaseTransaction, TransactionTrait};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use super::{compare_and_swap, ensure_operation_unbound, load_order_with_items, publish_movements, OrderChanges};
use crate::{
    commands::Command,
    db::{rollback_quietly, DbPool},
    entities::{OrderStatus, OrderWithItems},
    errors::ServiceError,
    events::{self, Event, EventSender},
    services::{
        inventory::{self, StockMovement},
        receipt_validator::{RejectReason, ValidationDecision},
    },
};

lazy_static! {
    static ref PROOFS_ACCEPTED: IntCounter = IntCounter::new(
        "payment_proofs_accepted_total",
        "Total number of payment proofs that confirmed an order"
    )
    .expect("metric can be created");
    static ref PROOFS_REJECTED: IntCounter = IntCounter::new(
        "payment_proofs_rejected_total",
        "Total number of payment proofs rejected by validation"
    )
    .expect("metric can be created");
    static ref STOCK_CONFLICTS: IntCounter = IntCounter::new(
        "order_confirm_stock_conflicts_total",
        "Total number of confirmations that failed for lack of stock"
    )
    .expect("metric can be created");
}

/// Applies a validator decision to an order.
///
/// `Accept` binds the operation number, confirms the order and debits stock
/// for every line in one transaction. `Reject` only annotates the order,
/// which stays Pending.
#[derive(Debug, Clone)]
pub struct ApplyProofDecisionCommand {
    pub order_id: Uuid,
    pub decision: ValidationDecision,
    /// Audit line appended to the order notes
    pub note: String,
    pub payment_proof_ref: Option<String>,
}

#[async_trait::async_trait]
impl Command for ApplyProofDecisionCommand {
    type Result = OrderWithItems;

    #[instrument(skip(self, db_pool, event_sender), fields(order_id = %self.order_id, accepted = self.decision.is_accept()))]
    async fn execute(
        &self,
        db_pool: Arc<DbPool>,
        event_sender: Option<Arc<EventSender>>,
    ) -> Result<Self::Result, ServiceError> {
        match &self.decision {
            ValidationDecision::Accept { operation_number } => {
                self.accept(&db_pool, event_sender.as_deref(), operation_number)
                    .await
            }
            ValidationDecision::Reject { reason } => {
                self.reject(&db_pool, event_sender.as_deref(), reason).await
            }
        }
    }
}

impl ApplyProofDecisionCommand {
    async fn accept(
        &self,
        db: &DbPool,
        event_sender: Option<&EventSender>,
        operation_number: &str,
    ) -> Result<OrderWithItems, ServiceError> {
        let txn = db.begin().await?;

        let (confirmed, movements) = match self.confirm(&txn, operation_number).await {
            Ok(result) => result,
            Err(e) => {
                rollback_quietly(txn).await;
                if matches!(e, ServiceError::InsufficientStock(_)) {
                    STOCK_CONFLICTS.inc();
                }
                error!(order_id = %self.order_id, error = %e, "Failed to confirm order from payment proof");
                return Err(e);
            }
        };

        txn.commit().await?;

        info!(
            order_id = %self.order_id,
            order_number = %confirmed.order.order_number,
            operation_number,
            "Order confirmed by payment proof"
        );
        PROOFS_ACCEPTED.inc();

        events::publish(
            event_sender,
            Event::OrderConfirmed {
                order_id: self.order_id,
                operation_number: operation_number.to_string(),
            },
        )
        .await;
        events::publish(
            event_sender,
            Event::OrderStatusChanged {
                order_id: self.order_id,
                old_status: OrderStatus::Pending,
                new_status: OrderStatus::Confirmed,
            },
        )
        .await;
        publish_movements(event_sender, self.order_id, &movements).await;

        Ok(confirmed)
    }

    async fn confirm(
        &self,
        txn: &DatabaseTransaction,
        operation_number: &str,
    ) -> Result<(OrderWithItems, Vec<StockMovement>), ServiceError> {
        let current = load_order_with_items(txn, self.order_id).await?;

        if current.order.status != OrderStatus::Pending {
            return Err(ServiceError::Conflict(format!(
                "order {} is {} and can no longer be confirmed by a payment proof",
                current.order.order_number, current.order.status
            )));
        }
        if let Some(existing) = &current.order.operation_number {
            return Err(ServiceError::InvariantViolation(format!(
                "pending order {} already carries operation number {}",
                current.order.order_number, existing
            )));
        }

        ensure_operation_unbound(txn, operation_number, self.order_id).await?;

        let order = compare_and_swap(
            txn,
            &current.order,
            OrderChanges {
                status: Some(OrderStatus::Confirmed),
                operation_number: Some(operation_number.to_string()),
                note: Some(self.note.clone()),
                payment_proof_ref: self.payment_proof_ref.clone(),
            },
        )
        .await?;

        let movements = inventory::debit_items(txn, &current.items).await?;

        Ok((
            OrderWithItems {
                order,
                items: current.items,
            },
            movements,
        ))
    }

    async fn reject(
        &self,
        db: &DbPool,
        event_sender: Option<&EventSender>,
        reason: &RejectReason,
    ) -> Result<OrderWithItems, ServiceError> {
        PROOFS_REJECTED.inc();

        let txn = db.begin().await?;
        let current = match load_order_with_items(&txn, self.order_id).await {
            Ok(current) => current,
            Err(e) => {
                rollback_quietly(txn).await;
                return Err(e);
            }
        };

        // Orders that left Pending keep their trail untouched.
        if current.order.status != OrderStatus::Pending {
            rollback_quietly(txn).await;
            warn!(order_id = %self.order_id, status = %current.order.status, %reason, "Proof rejected for non-pending order");
            return Ok(current);
        }

        let annotated = compare_and_swap(
            &txn,
            &current.order,
            OrderChanges {
                note: Some(self.note.clone()),
                payment_proof_ref: self.payment_proof_ref.clone(),
                ..Default::default()
            },
        )
        .await;
        let order = match annotated {
            Ok(order) => order,
            Err(e) => {
                rollback_quietly(txn).await;
                return Err(e);
            }
        };
        txn.commit().await?;

        warn!(order_id = %self.order_id, step = reason.step(), %reason, "Payment proof rejected");
        events::publish(
            event_sender,
            Event::ProofRejected {
                order_id: self.order_id,
                reason: reason.to_string(),
                at: Utc::now(),
            },
        )
        .await;

        Ok(OrderWithItems {
            order,
            items: current.items,
        })
    }
}
