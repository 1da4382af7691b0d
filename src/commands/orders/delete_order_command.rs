use std::sync::Arc;

use lazy_static::lazy_static;
use prometheus::IntCounter;
use sea_orm::{ColumnTrait, DatabaseTransaction, EntityTrait, QueryFilter, TransactionTrait};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use super::{load_order_with_items, publish_movements};
use crate::{
    commands::Command,
    db::{rollback_quietly, DbPool},
    entities::{order, order_item, OrderStatus, OrderWithItems},
    errors::ServiceError,
    events::{self, Event, EventSender},
    services::inventory::{self, StockMovement},
};

lazy_static! {
    static ref ORDERS_DELETED: IntCounter =
        IntCounter::new("orders_deleted_total", "Total number of orders deleted")
            .expect("metric can be created");
}

/// Physically removes an order and its items, returning stock first when
/// the order is Confirmed. Returns the order as it was before deletion.
#[derive(Debug, Clone)]
pub struct DeleteOrderCommand {
    pub order_id: Uuid,
}

#[async_trait::async_trait]
impl Command for DeleteOrderCommand {
    type Result = OrderWithItems;

    #[instrument(skip(self, db_pool, event_sender), fields(order_id = %self.order_id))]
    async fn execute(
        &self,
        db_pool: Arc<DbPool>,
        event_sender: Option<Arc<EventSender>>,
    ) -> Result<Self::Result, ServiceError> {
        let txn = db_pool.begin().await?;

        let (deleted, movements) = match self.delete(&txn).await {
            Ok(result) => result,
            Err(e) => {
                rollback_quietly(txn).await;
                error!(order_id = %self.order_id, error = %e, "Failed to delete order");
                return Err(e);
            }
        };
        txn.commit().await?;

        info!(
            order_id = %self.order_id,
            order_number = %deleted.order.order_number,
            status = %deleted.order.status,
            restocked = !movements.is_empty(),
            "Order deleted"
        );
        ORDERS_DELETED.inc();

        let sender = event_sender.as_deref();
        publish_movements(sender, self.order_id, &movements).await;
        events::publish(
            sender,
            Event::OrderDeleted {
                order_id: self.order_id,
                order_number: deleted.order.order_number.clone(),
            },
        )
        .await;

        Ok(deleted)
    }
}

impl DeleteOrderCommand {
    async fn delete(
        &self,
        txn: &DatabaseTransaction,
    ) -> Result<(OrderWithItems, Vec<StockMovement>), ServiceError> {
        let current = load_order_with_items(txn, self.order_id).await?;

        let movements = if current.order.status == OrderStatus::Confirmed {
            inventory::credit_items(txn, &current.items).await?
        } else {
            Vec::new()
        };

        order_item::Entity::delete_many()
            .filter(order_item::Column::OrderId.eq(self.order_id))
            .exec(txn)
            .await?;

        let removed = order::Entity::delete_many()
            .filter(order::Column::Id.eq(self.order_id))
            .filter(order::Column::Version.eq(current.order.version))
            .exec(txn)
            .await?;

        if removed.rows_affected == 0 {
            warn!(order_id = %self.order_id, "order changed while being deleted");
            return Err(ServiceError::Conflict(format!(
                "order {} was modified concurrently",
                self.order_id
            )));
        }

        Ok((current, movements))
    }
}
