use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of an order.
///
/// `Pending -> {Confirmed, Cancelled}`, `Confirmed -> {Delivered, Cancelled}`.
/// `Delivered` and `Cancelled` are terminal.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    EnumIter,
    DeriveActiveEnum,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(20))")]
#[strum(ascii_case_insensitive)]
pub enum OrderStatus {
    #[sea_orm(string_value = "PENDING")]
    Pending,
    #[sea_orm(string_value = "CONFIRMED")]
    Confirmed,
    #[sea_orm(string_value = "DELIVERED")]
    Delivered,
    #[sea_orm(string_value = "CANCELLED")]
    Cancelled,
}

impl OrderStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, OrderStatus::Delivered | OrderStatus::Cancelled)
    }

    /// Whether an order in this status has its line items debited from stock.
    pub fn holds_stock(self) -> bool {
        matches!(self, OrderStatus::Confirmed | OrderStatus::Delivered)
    }

    /// Validates if a status transition is allowed. Same-status requests are
    /// treated separately as no-ops by the fulfillment commands.
    pub fn can_transition_to(self, next: OrderStatus) -> bool {
        use OrderStatus::*;
        matches!(
            (self, next),
            (Pending, Confirmed) | (Pending, Cancelled) | (Confirmed, Delivered) | (Confirmed, Cancelled)
        )
    }
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "orders")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Display sequence number (`ORD-YYYYMMDD-NNNN`). Best-effort unique only.
    pub order_number: String,

    pub customer_name: String,
    pub customer_phone: String,
    pub customer_email: Option<String>,
    pub customer_address: Option<String>,
    pub customer_city: Option<String>,
    pub payment_method: Option<String>,

    /// Sum of the line-item subtotals at creation time. Never recomputed.
    pub total: Decimal,
    pub status: OrderStatus,

    /// Payment provider transaction id. Set exactly when the order is first
    /// confirmed, unique across all orders, immutable afterwards.
    #[sea_orm(unique)]
    pub operation_number: Option<String>,

    pub payment_proof_ref: Option<String>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    pub version: i32,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::order_item::Entity")]
    OrderItem,
}

impl Related<super::order_item::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::OrderItem.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

/// An order together with its line items.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OrderWithItems {
    pub order: Model,
    pub items: Vec<super::order_item::Model>,
}

impl OrderWithItems {
    pub fn id(&self) -> Uuid {
        self.order.id
    }

    pub fn status(&self) -> OrderStatus {
        self.order.status
    }

    /// Sum of the item subtotals; equals `order.total` for every order created
    /// through submission.
    pub fn items_total(&self) -> Decimal {
        self.items.iter().map(|item| item.subtotal).sum()
    }
}
