//! End-to-end checkout scenarios
//!
//! Drives the full service set over HTTP: the happy path, both saga
//! failure branches with their compensations, the round-trip laws on
//! single-service operations, and the boundary behaviors (underflow,
//! empty order, duplicate-item coalescing).

mod common;

use common::TestCluster;

#[tokio::test]
async fn test_happy_path_checkout() {
    let cluster = TestCluster::start().await;

    let user_id = cluster.create_user().await;
    cluster.add_funds(&user_id, 100).await;
    let item_id = cluster.create_item(10).await;
    cluster.add_stock(&item_id, 20).await;

    let order_id = cluster.create_order(&user_id).await;
    cluster.add_item(&order_id, &item_id, 3).await;

    let body = cluster.post_ok(&format!("/orders/checkout/{order_id}")).await;
    assert_eq!(body["msg"], "Checkout successful");
    assert!(body["log_id"].is_string());

    assert_eq!(cluster.stock_of(&item_id).await, 17);
    assert_eq!(cluster.credit_of(&user_id).await, 70);
    let order = cluster.order_of(&order_id).await;
    assert_eq!(order["paid"], true);
    assert_eq!(order["total_cost"], 30);
}

#[tokio::test]
async fn test_insufficient_stock_rolls_back() {
    let cluster = TestCluster::start().await;

    let user_id = cluster.create_user().await;
    cluster.add_funds(&user_id, 100).await;
    let item_in_stock = cluster.create_item(2).await;
    cluster.add_stock(&item_in_stock, 5).await;
    let item_out_of_stock = cluster.create_item(3).await;

    let order_id = cluster.create_order(&user_id).await;
    cluster.add_item(&order_id, &item_in_stock, 5).await;
    cluster.add_item(&order_id, &item_out_of_stock, 1).await;

    let response = cluster.post(&format!("/orders/checkout/{order_id}")).await;
    assert_eq!(response.status(), 400);
    let body: serde_json::Value = response.json().await.unwrap();
    let error = body["error"].as_str().unwrap();
    assert!(error.contains(&format!("OutOfStock:{item_out_of_stock}")), "got: {error}");

    // The synchronous rollback already restored stock; a sweep afterwards
    // must find nothing left to do.
    cluster.get_ok("/orders/fault_tolerance/5").await;

    assert_eq!(cluster.stock_of(&item_in_stock).await, 5);
    assert_eq!(cluster.stock_of(&item_out_of_stock).await, 0);
    assert_eq!(cluster.credit_of(&user_id).await, 100);
    assert_eq!(cluster.order_of(&order_id).await["paid"], false);
}

#[tokio::test]
async fn test_insufficient_credit_rolls_back() {
    let cluster = TestCluster::start().await;

    let user_id = cluster.create_user().await;
    cluster.add_funds(&user_id, 20).await;
    let item_id = cluster.create_item(50).await;
    cluster.add_stock(&item_id, 10).await;

    let order_id = cluster.create_order(&user_id).await;
    cluster.add_item(&order_id, &item_id, 1).await;

    let response = cluster.post(&format!("/orders/checkout/{order_id}")).await;
    assert_eq!(response.status(), 400);
    let body: serde_json::Value = response.json().await.unwrap();
    assert!(body["error"].as_str().unwrap().contains("OutOfCredit"));

    cluster.get_ok("/orders/fault_tolerance/5").await;

    assert_eq!(cluster.stock_of(&item_id).await, 10);
    assert_eq!(cluster.credit_of(&user_id).await, 20);
    assert_eq!(cluster.order_of(&order_id).await["paid"], false);
}

#[tokio::test]
async fn test_round_trip_laws() {
    let cluster = TestCluster::start().await;

    // Create → find returns the created value.
    let item_id = cluster.create_item(7).await;
    let found = cluster.get_ok(&format!("/stock/find/{item_id}")).await;
    assert_eq!(found["stock"], 0);
    assert_eq!(found["price"], 7);

    // Add then subtract the same amount returns stock to its prior value.
    cluster.add_stock(&item_id, 12).await;
    cluster.post_ok(&format!("/stock/subtract/{item_id}/12")).await;
    assert_eq!(cluster.stock_of(&item_id).await, 0);

    // Add-funds then pay the same amount returns credit to its prior value.
    let user_id = cluster.create_user().await;
    cluster.add_funds(&user_id, 40).await;
    cluster.post_ok(&format!("/payment/pay/{user_id}/40")).await;
    assert_eq!(cluster.credit_of(&user_id).await, 0);

    // Add-item raises total_cost by exactly qty × price.
    let order_id = cluster.create_order(&user_id).await;
    cluster.add_item(&order_id, &item_id, 4).await;
    assert_eq!(cluster.order_of(&order_id).await["total_cost"], 28);
}

#[tokio::test]
async fn test_subtract_below_zero_is_rejected() {
    let cluster = TestCluster::start().await;

    let item_id = cluster.create_item(5).await;
    cluster.add_stock(&item_id, 3).await;

    let response = cluster.post(&format!("/stock/subtract/{item_id}/4")).await;
    assert_eq!(response.status(), 400);
    let body: serde_json::Value = response.json().await.unwrap();
    assert!(body["error"].as_str().unwrap().contains("StockUnderflow"));

    assert_eq!(cluster.stock_of(&item_id).await, 3);
}

#[tokio::test]
async fn test_pay_below_zero_is_rejected() {
    let cluster = TestCluster::start().await;

    let user_id = cluster.create_user().await;
    cluster.add_funds(&user_id, 10).await;

    let response = cluster.post(&format!("/payment/pay/{user_id}/11")).await;
    assert_eq!(response.status(), 400);
    let body: serde_json::Value = response.json().await.unwrap();
    assert!(body["error"].as_str().unwrap().contains("InsufficientCredit"));

    assert_eq!(cluster.credit_of(&user_id).await, 10);
}

#[tokio::test]
async fn test_empty_order_checkout_succeeds() {
    let cluster = TestCluster::start().await;

    let user_id = cluster.create_user().await;
    let order_id = cluster.create_order(&user_id).await;

    cluster.post_ok(&format!("/orders/checkout/{order_id}")).await;

    let order = cluster.order_of(&order_id).await;
    assert_eq!(order["paid"], true);
    assert_eq!(order["total_cost"], 0);
    assert_eq!(cluster.credit_of(&user_id).await, 0);
}

#[tokio::test]
async fn test_duplicate_items_cause_single_subtract() {
    let cluster = TestCluster::start().await;

    let user_id = cluster.create_user().await;
    cluster.add_funds(&user_id, 100).await;
    let item_id = cluster.create_item(1).await;
    cluster.add_stock(&item_id, 2).await;

    // Two lines of the same item, exactly covering available stock: only a
    // coalesced single subtract of the summed quantity can succeed cleanly.
    let order_id = cluster.create_order(&user_id).await;
    cluster.add_item(&order_id, &item_id, 1).await;
    cluster.add_item(&order_id, &item_id, 1).await;

    let body = cluster.post_ok(&format!("/orders/checkout/{order_id}")).await;
    let checkout_log_id = body["log_id"].as_str().unwrap().to_string();

    assert_eq!(cluster.stock_of(&item_id).await, 0);
    assert_eq!(cluster.order_of(&order_id).await["paid"], true);

    // The stock service saw exactly one Update for the checkout's
    // correlation id, carrying the summed quantity.
    let sorted: serde_json::Value = cluster.get_ok("/stock/sorted_logs/5").await;
    let group = sorted[&checkout_log_id]
        .as_array()
        .expect("stock log group for checkout correlation id");
    let updates: Vec<_> = group
        .iter()
        .filter(|entry| entry["log"]["kind"].get("Update").is_some())
        .collect();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0]["log"]["kind"]["Update"]["old_value"]["stock"], 2);
    assert_eq!(updates[0]["log"]["kind"]["Update"]["new_value"]["stock"], 0);
}

#[tokio::test]
async fn test_checkout_of_missing_order_is_rejected() {
    let cluster = TestCluster::start().await;

    let response = cluster.post("/orders/checkout/no-such-order").await;
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn test_create_order_requires_existing_user() {
    let cluster = TestCluster::start().await;

    let response = cluster.post("/orders/create/no-such-user").await;
    assert_eq!(response.status(), 400);
    let body: serde_json::Value = response.json().await.unwrap();
    assert!(body["error"].as_str().unwrap().contains("does not exist"));
}
