//! Stock ledger for order line items.
//!
//! Debits and credits run on whatever connection the caller passes, which is
//! always an open transaction in the fulfillment commands. Quantities are
//! aggregated per product and applied in product-id order so that concurrent
//! units of work touch rows in the same sequence.

use std::collections::BTreeMap;

use chrono::Utc;
use sea_orm::sea_query::Expr;
use sea_orm::{ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter};
use serde::Serialize;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::entities::{order_item, product};
use crate::errors::ServiceError;

/// Net change applied to one product's stock.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct StockMovement {
    pub product_id: Uuid,
    pub delta: i32,
}

fn aggregate(items: &[order_item::Model]) -> Result<BTreeMap<Uuid, i32>, ServiceError> {
    let mut totals: BTreeMap<Uuid, i32> = BTreeMap::new();
    for item in items {
        if item.quantity <= 0 {
            return Err(ServiceError::InvariantViolation(format!(
                "order item {} has non-positive quantity {}",
                item.id, item.quantity
            )));
        }
        let entry = totals.entry(item.product_id).or_insert(0);
        *entry = entry.checked_add(item.quantity).ok_or_else(|| {
            ServiceError::InvariantViolation(format!(
                "quantity overflow for product {}",
                item.product_id
            ))
        })?;
    }
    Ok(totals)
}

/// Removes every line's quantity from stock. Fails as a whole if any product
/// is short; the caller's transaction must then be rolled back.
#[instrument(skip_all, fields(lines = items.len()))]
pub async fn debit_items<C>(
    conn: &C,
    items: &[order_item::Model],
) -> Result<Vec<StockMovement>, ServiceError>
where
    C: ConnectionTrait,
{
    let mut movements = Vec::new();

    for (product_id, quantity) in aggregate(items)? {
        let result = product::Entity::update_many()
            .col_expr(
                product::Column::Stock,
                Expr::col(product::Column::Stock).sub(quantity),
            )
            .col_expr(product::Column::UpdatedAt, Expr::value(Some(Utc::now())))
            .filter(product::Column::Id.eq(product_id))
            .filter(product::Column::Stock.gte(quantity))
            .exec(conn)
            .await?;

        if result.rows_affected == 0 {
            return Err(shortage(conn, product_id, quantity).await);
        }

        debug!(%product_id, quantity, "stock debited");
        movements.push(StockMovement {
            product_id,
            delta: -quantity,
        });
    }

    Ok(movements)
}

/// Returns every line's quantity to stock.
#[instrument(skip_all, fields(lines = items.len()))]
pub async fn credit_items<C>(
    conn: &C,
    items: &[order_item::Model],
) -> Result<Vec<StockMovement>, ServiceError>
where
    C: ConnectionTrait,
{
    let mut movements = Vec::new();

    for (product_id, quantity) in aggregate(items)? {
        let result = product::Entity::update_many()
            .col_expr(
                product::Column::Stock,
                Expr::col(product::Column::Stock).add(quantity),
            )
            .col_expr(product::Column::UpdatedAt, Expr::value(Some(Utc::now())))
            .filter(product::Column::Id.eq(product_id))
            .exec(conn)
            .await?;

        if result.rows_affected == 0 {
            warn!(%product_id, quantity, "cannot credit stock for missing product");
            return Err(ServiceError::NotFound(format!(
                "Product {} not found",
                product_id
            )));
        }

        debug!(%product_id, quantity, "stock credited");
        movements.push(StockMovement {
            product_id,
            delta: quantity,
        });
    }

    Ok(movements)
}

/// Informational availability check used at submission time. Nothing is
/// held; stock can still run out before confirmation.
pub fn ensure_available(product: &product::Model, requested: i32) -> Result<(), ServiceError> {
    if product.stock < requested {
        return Err(ServiceError::InsufficientStock(format!(
            "{}: requested {}, available {}",
            product.name, requested, product.stock
        )));
    }
    Ok(())
}

async fn shortage<C>(conn: &C, product_id: Uuid, requested: i32) -> ServiceError
where
    C: ConnectionTrait,
{
    match product::Entity::find_by_id(product_id).one(conn).await {
        Ok(Some(product)) => {
            warn!(%product_id, requested, available = product.stock, "insufficient stock");
            ServiceError::InsufficientStock(format!(
                "{}: requested {}, available {}",
                product.name, requested, product.stock
            ))
        }
        Ok(None) => ServiceError::NotFound(format!("Product {} not found", product_id)),
        Err(e) => ServiceError::DatabaseError(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn item(product_id: Uuid, quantity: i32) -> order_item::Model {
        order_item::Model {
            id: Uuid::new_v4(),
            order_id: Uuid::nil(),
            product_id,
            product_name: "Collar".into(),
            unit_price: dec!(10.00),
            quantity,
            subtotal: dec!(10.00) * rust_decimal::Decimal::from(quantity),
        }
    }

    #[test]
    fn aggregate_sums_repeated_products() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let totals = aggregate(&[item(a, 2), item(b, 1), item(a, 3)]).unwrap();
        assert_eq!(totals.get(&a), Some(&5));
        assert_eq!(totals.get(&b), Some(&1));
        assert_eq!(totals.len(), 2);
    }

    #[test]
    fn aggregate_rejects_non_positive_quantities() {
        let err = aggregate(&[item(Uuid::new_v4(), 0)]).unwrap_err();
        assert!(matches!(err, ServiceError::InvariantViolation(_)));
    }

    #[test]
    fn ensure_available_reports_the_shortfall() {
        let product = product::Model {
            id: Uuid::new_v4(),
            name: "Collar".into(),
            price: dec!(10.00),
            stock: 1,
            active: true,
            created_at: Utc::now(),
            updated_at: None,
        };
        assert!(ensure_available(&product, 1).is_ok());
        let err = ensure_available(&product, 2).unwrap_err();
        assert_eq!(err.to_string(), "Insufficient stock: Collar: requested 2, available 1");
    }
}
