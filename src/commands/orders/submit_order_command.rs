use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use lazy_static::lazy_static;
use prometheus::IntCounter;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ActiveValue::Set, ColumnTrait, DatabaseTransaction, EntityTrait,
    PaginatorTrait, QueryFilter, TransactionError, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument};
use uuid::Uuid;
use validator::Validate;

use crate::{
    commands::Command,
    db::DbPool,
    entities::{order, order_item, product, OrderStatus, OrderWithItems},
    errors::ServiceError,
    events::{self, Event, EventSender},
    services::inventory,
};

lazy_static! {
    static ref ORDERS_SUBMITTED: IntCounter =
        IntCounter::new("orders_submitted_total", "Total number of orders submitted")
            .expect("metric can be created");
    static ref ORDER_SUBMISSION_FAILURES: IntCounter = IntCounter::new(
        "order_submission_failures_total",
        "Total number of failed order submissions"
    )
    .expect("metric can be created");
}

/// Customer data and requested lines for a new order.
#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct CreateOrderRequest {
    #[validate(length(min = 1, max = 150, message = "Customer name is required"))]
    pub customer_name: String,
    #[validate(length(min = 6, max = 20, message = "Customer phone must be 6 to 20 characters"))]
    pub customer_phone: String,
    #[validate(email)]
    pub customer_email: Option<String>,
    #[validate(length(max = 300))]
    pub customer_address: Option<String>,
    #[validate(length(max = 100))]
    pub customer_city: Option<String>,
    #[validate(length(max = 20))]
    pub payment_method: Option<String>,
    #[validate(length(min = 1, message = "At least one item is required"))]
    pub items: Vec<OrderLineRequest>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OrderLineRequest {
    pub product_id: Uuid,
    pub quantity: i32,
}

/// Creates a Pending order with price snapshots of the live catalog.
#[derive(Debug, Clone)]
pub struct SubmitOrderCommand {
    pub request: CreateOrderRequest,
    /// Calendar day the order number is drawn from.
    pub business_date: NaiveDate,
}

#[async_trait::async_trait]
impl Command for SubmitOrderCommand {
    type Result = OrderWithItems;

    #[instrument(skip(self, db_pool, event_sender), fields(customer = %self.request.customer_name))]
    async fn execute(
        &self,
        db_pool: Arc<DbPool>,
        event_sender: Option<Arc<EventSender>>,
    ) -> Result<Self::Result, ServiceError> {
        self.validate_request().map_err(|e| {
            ORDER_SUBMISSION_FAILURES.inc();
            error!(error = %e, "Invalid order request");
            e
        })?;

        let request = self.request.clone();
        let business_date = self.business_date;

        let created = db_pool
            .transaction::<_, OrderWithItems, ServiceError>(move |txn| {
                Box::pin(async move { create_order(txn, &request, business_date).await })
            })
            .await
            .map_err(|e| {
                ORDER_SUBMISSION_FAILURES.inc();
                match e {
                    TransactionError::Connection(db_err) => ServiceError::DatabaseError(db_err),
                    TransactionError::Transaction(service_err) => service_err,
                }
            })?;

        info!(
            order_id = %created.order.id,
            order_number = %created.order.order_number,
            total = %created.order.total,
            items_count = created.items.len(),
            "Order submitted"
        );
        ORDERS_SUBMITTED.inc();

        events::publish(
            event_sender.as_deref(),
            Event::OrderCreated {
                order_id: created.order.id,
                order_number: created.order.order_number.clone(),
                total: created.order.total,
            },
        )
        .await;

        Ok(created)
    }
}

impl SubmitOrderCommand {
    pub fn new(request: CreateOrderRequest, business_date: NaiveDate) -> Self {
        Self {
            request,
            business_date,
        }
    }

    fn validate_request(&self) -> Result<(), ServiceError> {
        self.request.validate()?;
        if let Some(line) = self.request.items.iter().find(|line| line.quantity <= 0) {
            return Err(ServiceError::ValidationError(format!(
                "Quantity for product {} must be positive",
                line.product_id
            )));
        }
        Ok(())
    }
}

/// `ORD-<YYYYMMDD>-` prefix shared by all orders of a day.
pub fn order_number_prefix(date: NaiveDate) -> String {
    format!("ORD-{}-", date.format("%Y%m%d"))
}

/// Next display number for the day. Advisory: two concurrent submissions can
/// draw the same number.
async fn next_order_number(
    txn: &DatabaseTransaction,
    date: NaiveDate,
) -> Result<String, ServiceError> {
    let prefix = order_number_prefix(date);
    let existing = order::Entity::find()
        .filter(order::Column::OrderNumber.starts_with(prefix.as_str()))
        .count(txn)
        .await?;
    Ok(format!("{}{:04}", prefix, existing + 1))
}

async fn create_order(
    txn: &DatabaseTransaction,
    request: &CreateOrderRequest,
    business_date: NaiveDate,
) -> Result<OrderWithItems, ServiceError> {
    let mut requested: BTreeMap<Uuid, i32> = BTreeMap::new();
    for line in &request.items {
        let entry = requested.entry(line.product_id).or_insert(0);
        *entry = entry.checked_add(line.quantity).ok_or_else(|| {
            ServiceError::ValidationError(format!("Quantity too large for {}", line.product_id))
        })?;
    }

    let mut catalog: BTreeMap<Uuid, product::Model> = BTreeMap::new();
    for (product_id, quantity) in &requested {
        let product = product::Entity::find_by_id(*product_id)
            .one(txn)
            .await?
            .filter(|p| p.active)
            .ok_or_else(|| ServiceError::NotFound(format!("Product {} not found", product_id)))?;
        inventory::ensure_available(&product, *quantity)?;
        catalog.insert(*product_id, product);
    }

    let order_id = Uuid::new_v4();
    let mut lines = Vec::with_capacity(request.items.len());
    for line in &request.items {
        let product = catalog
            .get(&line.product_id)
            .ok_or_else(|| ServiceError::NotFound(format!("Product {} not found", line.product_id)))?;
        lines.push(order_item::Model {
            id: Uuid::new_v4(),
            order_id,
            product_id: product.id,
            product_name: product.name.clone(),
            unit_price: product.price,
            quantity: line.quantity,
            subtotal: order_item::Model::line_total(product.price, line.quantity),
        });
    }
    let total: Decimal = lines.iter().map(|line| line.subtotal).sum();

    let order_number = next_order_number(txn, business_date).await?;
    let order = order::ActiveModel {
        id: Set(order_id),
        order_number: Set(order_number),
        customer_name: Set(request.customer_name.trim().to_string()),
        customer_phone: Set(request.customer_phone.trim().to_string()),
        customer_email: Set(request.customer_email.clone()),
        customer_address: Set(request.customer_address.clone()),
        customer_city: Set(request.customer_city.clone()),
        payment_method: Set(request.payment_method.clone()),
        total: Set(total),
        status: Set(OrderStatus::Pending),
        operation_number: Set(None),
        payment_proof_ref: Set(None),
        notes: Set(None),
        created_at: Set(Utc::now()),
        updated_at: Set(None),
        version: Set(1),
    }
    .insert(txn)
    .await?;

    let mut items = Vec::with_capacity(lines.len());
    for line in lines {
        let saved = order_item::ActiveModel {
            id: Set(line.id),
            order_id: Set(line.order_id),
            product_id: Set(line.product_id),
            product_name: Set(line.product_name),
            unit_price: Set(line.unit_price),
            quantity: Set(line.quantity),
            subtotal: Set(line.subtotal),
        }
        .insert(txn)
        .await?;
        items.push(saved);
    }

    Ok(OrderWithItems { order, items })
}
