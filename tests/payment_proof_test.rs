mod common;

use std::sync::Arc;

use assert_matches::assert_matches;
use async_trait::async_trait;
use chrono::{FixedOffset, Utc};
use common::{order_request, receipt, receipt_now, TestApp};
use order_proof::{
    config::{PaymentConfig, RejectionPolicy},
    entities::OrderStatus,
    events::Event,
    services::{
        ocr::{OcrClient, ProofImage},
        receipt_validator::{RejectReason, ValidationDecision},
        storage::InMemoryObjectStorage,
    },
    ServiceError,
};
use rust_decimal_macros::dec;

#[tokio::test]
async fn matching_receipt_confirms_the_order_and_debits_stock() {
    let mut app = TestApp::new().await;
    let product = app.seed_product("Polo Alianza", dec!(45.00), 5).await;
    let order = app
        .service
        .submit_order(order_request(&[(product.id, 1)]))
        .await
        .unwrap();

    let outcome = app
        .service
        .process_payment_proof_at(order.id(), &receipt("45.00", "123456789"), receipt_now())
        .await
        .expect("process proof");

    assert!(outcome.is_confirmed());
    assert_eq!(
        outcome.decision,
        ValidationDecision::Accept {
            operation_number: "123456789".to_string()
        }
    );
    assert_eq!(outcome.order.status(), OrderStatus::Confirmed);
    assert_eq!(outcome.order.order.operation_number.as_deref(), Some("123456789"));
    assert!(outcome
        .order
        .order
        .notes
        .as_deref()
        .unwrap_or_default()
        .contains("validated automatically. Date/time: 12/05/2024 14:30"));
    assert_eq!(app.stock_of(product.id).await, 4);

    let events = app.drain_events();
    assert!(events.iter().any(|e| matches!(
        e,
        Event::OrderConfirmed { operation_number, .. } if operation_number == "123456789"
    )));
    assert!(events
        .iter()
        .any(|e| matches!(e, Event::StockAdjusted { delta: -1, .. })));
}

#[tokio::test]
async fn amount_mismatch_rejects_and_keeps_the_order_pending() {
    let mut app = TestApp::new().await;
    let product = app.seed_product("Polo Alianza", dec!(45.00), 5).await;
    let order = app
        .service
        .submit_order(order_request(&[(product.id, 1)]))
        .await
        .unwrap();

    let outcome = app
        .service
        .process_payment_proof_at(order.id(), &receipt("40.00", "123456789"), receipt_now())
        .await
        .unwrap();

    assert!(!outcome.is_confirmed());
    let reason = outcome.reject_reason().expect("rejected").clone();
    assert_eq!(reason.step(), 4);
    assert!(reason.to_string().contains("amount mismatch"));

    let notes = outcome.order.order.notes.clone().unwrap_or_default();
    assert!(notes.starts_with("Payment proof rejected: amount mismatch"));
    assert!(notes.contains("Extracted text: ¡Yapeaste!"));
    assert_eq!(outcome.order.status(), OrderStatus::Pending);
    assert_eq!(outcome.order.order.operation_number, None);
    assert_eq!(app.stock_of(product.id).await, 5);

    assert!(app
        .drain_events()
        .iter()
        .any(|e| matches!(e, Event::ProofRejected { .. })));

    assert_matches!(
        outcome.into_result(),
        Err(ServiceError::ValidationRejected(RejectReason::AmountMismatch { .. }))
    );
}

#[tokio::test]
async fn amount_within_ten_cents_is_accepted() {
    let app = TestApp::new().await;
    let product = app.seed_product("Polo Alianza", dec!(45.00), 5).await;
    let order = app
        .service
        .submit_order(order_request(&[(product.id, 1)]))
        .await
        .unwrap();

    let outcome = app
        .service
        .process_payment_proof_at(order.id(), &receipt("44.90", "123456789"), receipt_now())
        .await
        .unwrap();
    assert!(outcome.is_confirmed());
}

#[tokio::test]
async fn rejected_proof_can_be_followed_by_a_good_one() {
    let app = TestApp::new().await;
    let product = app.seed_product("Polo Alianza", dec!(45.00), 5).await;
    let order = app
        .service
        .submit_order(order_request(&[(product.id, 2)]))
        .await
        .unwrap();

    let first = app
        .service
        .process_payment_proof_at(order.id(), "foto borrosa", receipt_now())
        .await
        .unwrap();
    assert_eq!(first.reject_reason().map(RejectReason::step), Some(2));

    let second = app
        .service
        .process_payment_proof_at(order.id(), &receipt("90.00", "223344556"), receipt_now())
        .await
        .unwrap();
    assert!(second.is_confirmed());
    assert_eq!(second.order.order.version, 3);
    assert_eq!(app.stock_of(product.id).await, 3);
}

#[tokio::test]
async fn reused_operation_number_is_a_duplicate() {
    let app = TestApp::new().await;
    let product = app.seed_product("Polo Alianza", dec!(45.00), 5).await;
    let first = app
        .service
        .submit_order(order_request(&[(product.id, 1)]))
        .await
        .unwrap();
    let second = app
        .service
        .submit_order(order_request(&[(product.id, 1)]))
        .await
        .unwrap();

    let text = receipt("45.00", "123456789");
    let accepted = app
        .service
        .process_payment_proof_at(first.id(), &text, receipt_now())
        .await
        .unwrap();
    assert!(accepted.is_confirmed());

    let duplicate = app
        .service
        .process_payment_proof_at(second.id(), &text, receipt_now())
        .await
        .unwrap();
    assert_matches!(
        duplicate.reject_reason(),
        Some(RejectReason::DuplicateOperationNumber { order_number, .. })
            if *order_number == first.order.order_number
    );
    assert_eq!(duplicate.order.status(), OrderStatus::Pending);
    assert_eq!(duplicate.order.order.operation_number, None);
    assert_eq!(app.stock_of(product.id).await, 4);
}

#[tokio::test]
async fn proofs_for_settled_orders_leave_them_untouched() {
    let app = TestApp::new().await;
    let product = app.seed_product("Polo Alianza", dec!(45.00), 5).await;
    let order = app
        .service
        .submit_order(order_request(&[(product.id, 1)]))
        .await
        .unwrap();
    let confirmed = app
        .service
        .process_payment_proof_at(order.id(), &receipt("45.00", "123456789"), receipt_now())
        .await
        .unwrap()
        .order;

    let late = app
        .service
        .process_payment_proof_at(order.id(), &receipt("45.00", "998877665"), receipt_now())
        .await
        .unwrap();
    assert_matches!(
        late.reject_reason(),
        Some(RejectReason::OrderNotPending {
            status: OrderStatus::Confirmed
        })
    );
    assert_eq!(late.order.order.version, confirmed.order.version);
    assert_eq!(late.order.order.notes, confirmed.order.notes);
    assert_eq!(late.order.order.operation_number.as_deref(), Some("123456789"));
    assert_eq!(app.stock_of(product.id).await, 4);
}

#[tokio::test]
async fn stale_receipt_is_outside_the_window() {
    let app = TestApp::new().await;
    let product = app.seed_product("Polo Alianza", dec!(45.00), 5).await;
    let order = app
        .service
        .submit_order(order_request(&[(product.id, 1)]))
        .await
        .unwrap();

    let two_days_later = receipt_now() + chrono::Duration::days(2);
    let outcome = app
        .service
        .process_payment_proof_at(order.id(), &receipt("45.00", "123456789"), two_days_later)
        .await
        .unwrap();
    assert_eq!(outcome.reject_reason().map(RejectReason::step), Some(7));
}

#[tokio::test]
async fn manual_review_policy_words_the_note_for_an_administrator() {
    let app = TestApp::with_payment(PaymentConfig {
        rejection_policy: RejectionPolicy::ManualReview,
        ..PaymentConfig::default()
    })
    .await;
    let product = app.seed_product("Polo Alianza", dec!(45.00), 5).await;
    let order = app
        .service
        .submit_order(order_request(&[(product.id, 1)]))
        .await
        .unwrap();

    let outcome = app
        .service
        .process_payment_proof_at(order.id(), &receipt("40.00", "123456789"), receipt_now())
        .await
        .unwrap();

    let notes = outcome.order.order.notes.unwrap_or_default();
    assert!(notes.starts_with("Payment proof uploaded but could not be validated automatically"));
    assert!(notes.contains("Requires manual review"));
    assert_eq!(outcome.order.order.status, OrderStatus::Pending);

    let confirmed = app
        .service
        .validate_proof_manually(order.id(), "123456789")
        .await
        .unwrap();
    assert_eq!(confirmed.status(), OrderStatus::Confirmed);
    assert_eq!(app.stock_of(product.id).await, 4);
}

struct FakeOcr {
    text: Option<String>,
}

#[async_trait]
impl OcrClient for FakeOcr {
    async fn extract_text(&self, _image: &ProofImage) -> Result<String, ServiceError> {
        self.text
            .clone()
            .ok_or_else(|| ServiceError::ExternalServiceError("OCR service unavailable".to_string()))
    }
}

/// The scenario receipt stamped with the current Lima wall-clock time.
fn receipt_paid_just_now(amount: &str, operation_number: &str) -> String {
    let lima = FixedOffset::west_opt(5 * 3600).unwrap();
    let stamp = Utc::now().with_timezone(&lima).format("%d/%m/%Y %H:%M");
    receipt(amount, operation_number).replace("12/05/2024 14:30", &stamp.to_string())
}

#[tokio::test]
async fn image_pipeline_stores_transcribes_and_confirms() {
    let app = TestApp::new().await;
    let storage = Arc::new(InMemoryObjectStorage::new());
    let service = app.service.clone().with_collaborators(
        Arc::new(FakeOcr {
            text: Some(receipt_paid_just_now("45.00", "123456789")),
        }),
        storage.clone(),
    );
    let product = app.seed_product("Polo Alianza", dec!(45.00), 5).await;
    let order = service
        .submit_order(order_request(&[(product.id, 1)]))
        .await
        .unwrap();

    let outcome = service
        .process_payment_proof_image(order.id(), ProofImage::new("yape.png", vec![0x89, 0x50, 0x4e, 0x47]))
        .await
        .unwrap();

    assert!(outcome.is_confirmed());
    let reference = outcome
        .order
        .order
        .payment_proof_ref
        .clone()
        .expect("proof reference recorded");
    assert!(reference.starts_with("memory://payment-proofs/"));
    assert!(reference.ends_with(".png"));
    assert!(storage.contains(&reference));
    assert_eq!(app.stock_of(product.id).await, 4);

    service.delete_order(order.id()).await.unwrap();
    assert!(storage.is_empty());
    assert_eq!(app.stock_of(product.id).await, 5);
}

#[tokio::test]
async fn ocr_failure_discards_the_stored_image() {
    let app = TestApp::new().await;
    let storage = Arc::new(InMemoryObjectStorage::new());
    let service = app
        .service
        .clone()
        .with_collaborators(Arc::new(FakeOcr { text: None }), storage.clone());
    let product = app.seed_product("Polo Alianza", dec!(45.00), 5).await;
    let order = service
        .submit_order(order_request(&[(product.id, 1)]))
        .await
        .unwrap();

    let result = service
        .process_payment_proof_image(order.id(), ProofImage::new("yape.jpg", vec![0xff, 0xd8]))
        .await;
    assert_matches!(result, Err(ServiceError::ExternalServiceError(_)));
    assert!(storage.is_empty());

    let order = service.get_order(order.id()).await.unwrap();
    assert_eq!(order.status(), OrderStatus::Pending);
    assert_eq!(order.order.payment_proof_ref, None);
}

#[tokio::test]
async fn failed_confirmation_discards_the_stored_image() {
    let app = TestApp::new().await;
    let storage = Arc::new(InMemoryObjectStorage::new());
    let service = app.service.clone().with_collaborators(
        Arc::new(FakeOcr {
            text: Some(receipt_paid_just_now("45.00", "123456789")),
        }),
        storage.clone(),
    );
    let product = app.seed_product("Polo Alianza", dec!(45.00), 5).await;
    let order = service
        .submit_order(order_request(&[(product.id, 1)]))
        .await
        .unwrap();
    app.set_stock(product.id, 0).await;

    let result = service
        .process_payment_proof_image(order.id(), ProofImage::new("yape.png", vec![0x89, 0x50]))
        .await;
    assert_matches!(result, Err(ServiceError::InsufficientStock(_)));
    assert!(storage.is_empty());

    let order = service.get_order(order.id()).await.unwrap();
    assert_eq!(order.status(), OrderStatus::Pending);
    assert_eq!(order.order.payment_proof_ref, None);
}

#[tokio::test]
async fn one_short_line_fails_the_whole_proof_confirmation() {
    let app = TestApp::new().await;
    let shirt = app.seed_product("Polo Alianza", dec!(30.00), 5).await;
    let cap = app.seed_product("Gorra", dec!(15.00), 5).await;
    let order = app
        .service
        .submit_order(order_request(&[(shirt.id, 2), (cap.id, 1)]))
        .await
        .unwrap();
    assert_eq!(order.order.total, dec!(75.00));
    app.set_stock(cap.id, 0).await;

    let result = app
        .service
        .process_payment_proof_at(order.id(), &receipt("75.00", "123456789"), receipt_now())
        .await;
    assert_matches!(result, Err(ServiceError::InsufficientStock(msg)) if msg.contains("Gorra"));

    assert_eq!(app.stock_of(shirt.id).await, 5);
    assert_eq!(app.stock_of(cap.id).await, 0);
    let order = app.service.get_order(order.id()).await.unwrap();
    assert_eq!(order.status(), OrderStatus::Pending);
    assert_eq!(order.order.operation_number, None);
    assert_eq!(order.order.version, 1);
}

#[tokio::test]
async fn image_pipeline_needs_collaborators_and_a_pending_order() {
    let app = TestApp::new().await;
    let product = app.seed_product("Polo Alianza", dec!(45.00), 5).await;
    let order = app
        .service
        .submit_order(order_request(&[(product.id, 1)]))
        .await
        .unwrap();

    let unconfigured = app
        .service
        .process_payment_proof_image(order.id(), ProofImage::new("yape.png", vec![1]))
        .await;
    assert_matches!(unconfigured, Err(ServiceError::InternalError(_)));

    let storage = Arc::new(InMemoryObjectStorage::new());
    let service = app.service.clone().with_collaborators(
        Arc::new(FakeOcr {
            text: Some(String::new()),
        }),
        storage.clone(),
    );
    service
        .set_order_status(order.id(), OrderStatus::Cancelled, None)
        .await
        .unwrap();

    let cancelled = service
        .process_payment_proof_image(order.id(), ProofImage::new("yape.png", vec![1]))
        .await;
    assert_matches!(cancelled, Err(ServiceError::Conflict(_)));
    assert!(storage.is_empty());
}
