mod common;

use common::{order_request, receipt, receipt_now, TestApp};
use order_proof::{entities::OrderStatus, ServiceError};
use rust_decimal_macros::dec;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn last_unit_goes_to_exactly_one_of_two_racing_proofs() {
    let app = TestApp::new().await;
    let product = app.seed_product("Edicion limitada", dec!(45.00), 1).await;
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

    let tasks = [(first.id(), "111111111"), (second.id(), "222222222")].map(|(id, op)| {
        let service = app.service.clone();
        let text = receipt("45.00", op);
        tokio::spawn(async move { service.process_payment_proof_at(id, &text, receipt_now()).await })
    });

    let mut confirmed = 0;
    let mut out_of_stock = 0;
    for task in tasks {
        match task.await.expect("task panicked") {
            Ok(outcome) if outcome.is_confirmed() => confirmed += 1,
            Err(ServiceError::InsufficientStock(_)) => out_of_stock += 1,
            other => panic!("unexpected outcome: {:?}", other.map(|o| o.decision)),
        }
    }
    assert_eq!(confirmed, 1);
    assert_eq!(out_of_stock, 1);
    assert_eq!(app.stock_of(product.id).await, 0);

    let statuses = [
        app.service.get_order(first.id()).await.unwrap(),
        app.service.get_order(second.id()).await.unwrap(),
    ];
    let pending: Vec<_> = statuses
        .iter()
        .filter(|o| o.status() == OrderStatus::Pending)
        .collect();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].order.operation_number, None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn one_operation_number_confirms_at_most_one_order() {
    let app = TestApp::new().await;
    let product = app.seed_product("Polo Alianza", dec!(45.00), 10).await;
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

    let tasks = [first.id(), second.id()].map(|id| {
        let service = app.service.clone();
        let text = receipt("45.00", "123456789");
        tokio::spawn(async move { service.process_payment_proof_at(id, &text, receipt_now()).await })
    });

    let mut confirmed = 0;
    for task in tasks {
        match task.await.expect("task panicked") {
            Ok(outcome) if outcome.is_confirmed() => confirmed += 1,
            Ok(outcome) => assert_eq!(outcome.reject_reason().map(|r| r.step()), Some(6)),
            Err(ServiceError::Conflict(_)) => {}
            Err(other) => panic!("unexpected error: {}", other),
        }
    }
    assert_eq!(confirmed, 1);
    assert_eq!(app.stock_of(product.id).await, 9);

    let bound = [
        app.service.get_order(first.id()).await.unwrap(),
        app.service.get_order(second.id()).await.unwrap(),
    ]
    .into_iter()
    .filter(|o| o.order.operation_number.as_deref() == Some("123456789"))
    .count();
    assert_eq!(bound, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn racing_admin_confirmations_debit_once() {
    let app = TestApp::new().await;
    let product = app.seed_product("Polo Alianza", dec!(45.00), 3).await;
    let order = app
        .service
        .submit_order(order_request(&[(product.id, 2)]))
        .await
        .unwrap();

    let tasks = ["333333333", "444444444"].map(|op| {
        let service = app.service.clone();
        let id = order.id();
        tokio::spawn(async move {
            service
                .set_order_status(id, OrderStatus::Confirmed, Some(op.to_string()))
                .await
        })
    });

    let mut changed = 0;
    for task in tasks {
        let result = task.await.expect("task panicked");
        // The loser either sees the order already Confirmed or loses the swap.
        match result {
            Ok(order) => {
                assert_eq!(order.status(), OrderStatus::Confirmed);
                changed += 1;
            }
            Err(ServiceError::Conflict(_)) => {}
            Err(other) => panic!("unexpected error: {}", other),
        }
    }
    assert!(changed >= 1);
    assert_eq!(app.stock_of(product.id).await, 1);

    let order = app.service.get_order(order.id()).await.unwrap();
    assert_eq!(order.order.version, 2);
}
