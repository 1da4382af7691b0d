#![allow(dead_code)]

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use order_proof::{
    commands::orders::{CreateOrderRequest, OrderLineRequest},
    config::{AppConfig, PaymentConfig},
    db::{self, DbPool},
    entities::product,
    events::{self, Event},
    services::orders::OrderService,
};
use rust_decimal::Decimal;
use sea_orm::{sea_query::Expr, ActiveModelTrait, ActiveValue::Set, ColumnTrait, EntityTrait, QueryFilter};
use tempfile::TempDir;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Helper harness backed by a throwaway SQLite file.
///
/// The pool has a single connection, so transactions from concurrent tasks
/// queue behind each other the way row locks serialize them on Postgres.
pub struct TestApp {
    pub db: Arc<DbPool>,
    pub service: OrderService,
    pub config: AppConfig,
    events: mpsc::Receiver<Event>,
    _dir: TempDir,
}

impl TestApp {
    pub async fn new() -> Self {
        Self::with_payment(PaymentConfig::default()).await
    }

    pub async fn with_payment(payment: PaymentConfig) -> Self {
        let dir = tempfile::tempdir().expect("create temp dir");
        let db_path = dir.path().join("order_proof_test.db");

        let mut cfg = AppConfig::new(
            format!("sqlite://{}?mode=rwc", db_path.display()),
            "test".to_string(),
        );
        cfg.db_max_connections = 1;
        cfg.db_min_connections = 1;
        cfg.payment = payment;

        let pool = db::establish_connection_from_app_config(&cfg)
            .await
            .expect("failed to create test database");
        db::run_migrations(&pool)
            .await
            .expect("failed to run migrations in tests");

        let db = Arc::new(pool);
        let (sender, receiver) = events::channel(1024);
        let service = OrderService::new(db.clone(), Some(Arc::new(sender)), cfg.payment.clone());

        Self {
            db,
            service,
            config: cfg,
            events: receiver,
            _dir: dir,
        }
    }

    pub async fn seed_product(&self, name: &str, price: Decimal, stock: i32) -> product::Model {
        product::ActiveModel {
            id: Set(Uuid::new_v4()),
            name: Set(name.to_string()),
            price: Set(price),
            stock: Set(stock),
            active: Set(true),
            created_at: Set(Utc::now()),
            updated_at: Set(None),
        }
        .insert(self.db.as_ref())
        .await
        .expect("seed product")
    }

    pub async fn stock_of(&self, product_id: Uuid) -> i32 {
        product::Entity::find_by_id(product_id)
            .one(self.db.as_ref())
            .await
            .expect("query product")
            .expect("product exists")
            .stock
    }

    /// Overwrites stock directly, as a concurrent sale would.
    pub async fn set_stock(&self, product_id: Uuid, stock: i32) {
        product::Entity::update_many()
            .col_expr(product::Column::Stock, Expr::value(stock))
            .filter(product::Column::Id.eq(product_id))
            .exec(self.db.as_ref())
            .await
            .expect("update stock");
    }

    /// Events published so far, without waiting for more.
    pub fn drain_events(&mut self) -> Vec<Event> {
        let mut drained = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            drained.push(event);
        }
        drained
    }
}

pub fn order_request(lines: &[(Uuid, i32)]) -> CreateOrderRequest {
    CreateOrderRequest {
        customer_name: "Ana Torres".to_string(),
        customer_phone: "987654321".to_string(),
        customer_email: Some("ana@example.com".to_string()),
        customer_address: Some("Av. Arequipa 123".to_string()),
        customer_city: Some("Lima".to_string()),
        payment_method: Some("YAPE".to_string()),
        items: lines
            .iter()
            .map(|(product_id, quantity)| OrderLineRequest {
                product_id: *product_id,
                quantity: *quantity,
            })
            .collect(),
    }
}

/// Yape receipt text paid to the store account on 12/05/2024 14:30 Lima time.
pub fn receipt(amount: &str, operation_number: &str) -> String {
    format!(
        "¡Yapeaste!\nS/ {}\nPara\nLeslie Lopez\n12/05/2024 14:30\nNro. de operación\n{}",
        amount, operation_number
    )
}

/// Half an hour after the receipt time, in UTC.
pub fn receipt_now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 12, 20, 0, 0).unwrap()
}
