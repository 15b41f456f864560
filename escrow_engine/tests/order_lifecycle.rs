use escrow_engine::{
    api::order_objects::{Actor, ItemStatusUpdate, NewOrderRequest, PaymentProof},
    db_types::{
        EscrowMovement,
        EscrowStatus,
        FeeTier,
        ItemStatus,
        LedgerDirection,
        OrderStatusType,
        PaymentMethod,
        ProductStatus,
    },
    traits::{CancelledItem, CatalogManagement, MarketplaceDbError, ProfileManagement},
    MarketplaceDatabase,
    OrderFlowError,
};
use market_common::{FeeRate, Money};

use crate::support::*;

mod support;

#[tokio::test]
async fn new_order_is_pending_with_fees_per_item() {
    let market = setup().await;
    let order = two_item_order(&market).await;
    let details = &order.created.details;
    assert_eq!(details.order.status, OrderStatusType::Pending);
    assert_eq!(details.order.total_amount, Money::from_cents(15_000));
    assert_eq!(details.order.buyer_id, BUYER);
    assert!(details.order.paid_at.is_none());
    assert_eq!(details.items.len(), 2);
    let fees = details.items.iter().map(|i| i.item.platform_fee).collect::<Vec<_>>();
    assert_eq!(fees, vec![Money::from_cents(500), Money::from_cents(250)]);
    for i in &details.items {
        assert_eq!(i.item.status, ItemStatus::Pending);
        assert_eq!(i.item.escrow_status, EscrowStatus::Holding);
        assert_eq!(i.item.fee_rate, FeeRate::from_bps(500));
        assert_eq!(i.transaction.amount, i.item.price);
        assert_eq!(i.transaction.platform_fee, i.item.platform_fee);
        assert_eq!(i.transaction.charge_id, order.charge_id());
        assert_eq!(i.transaction.gateway_order_code, details.order.order_ref);
        assert!(i.transaction.shipping_snapshot.contains("Market Street"));
    }
    assert_total_matches_items(details);
    let charge = market.gateway.charge(&order.charge_id()).unwrap();
    assert_eq!(charge.amount, Money::from_cents(15_000));
    assert_eq!(charge.order_ref, details.order.order_ref);
    assert!(order.created.redirect.ends_with(&order.charge_id()));
    tear_down(market).await;
}

#[tokio::test]
async fn order_references_are_unique() {
    let market = setup().await;
    let first = two_item_order(&market).await;
    let p = market.product(SELLER_A, "Lens cap", 1_000).await;
    let address = market.address(BUYER).await;
    let request =
        NewOrderRequest { shipping_address_id: address.id, payment_method: PaymentMethod::Card, product_ids: vec![p.id] };
    let second = market.orders.create_order(BUYER, request).await.unwrap();
    assert_ne!(first.created.order().order_ref, second.order().order_ref);
    assert_eq!(first.created.order().order_ref.len(), 36);
    tear_down(market).await;
}

#[tokio::test]
async fn verified_member_gets_both_discounts() {
    let market = setup().await;
    market.seller(SELLER_A, true, true).await;
    let p = market.product(SELLER_A, "Tripod", 10_000).await;
    let address = market.address(BUYER).await;
    let request =
        NewOrderRequest { shipping_address_id: address.id, payment_method: PaymentMethod::Card, product_ids: vec![p.id] };
    let created = market.orders.create_order(BUYER, request).await.unwrap();
    let item = &created.details.items[0].item;
    assert_eq!(item.fee_rate, FeeRate::from_bps(350));
    assert_eq!(item.platform_fee, Money::from_cents(350));
    assert_eq!(item.seller_payout(), Money::from_cents(9_650));
    tear_down(market).await;
}

#[tokio::test]
async fn fees_follow_the_stored_tier_for_each_price() {
    let market = setup().await;
    let tiers = [
        FeeTier {
            id: 0,
            min_amount: Money::from_major(0),
            max_amount: Some(Money::from_major(80)),
            base_rate: FeeRate::from_bps(600),
            legit_discount: None,
            membership_discount: None,
        },
        FeeTier {
            id: 0,
            min_amount: Money::from_major(80),
            max_amount: None,
            base_rate: FeeRate::from_bps(400),
            legit_discount: None,
            membership_discount: None,
        },
    ];
    market.db.replace_fee_tiers(&tiers).await.unwrap();
    let stored = market.db.fetch_fee_tiers().await.unwrap();
    assert_eq!(stored.iter().map(|t| t.base_rate).collect::<Vec<_>>(), vec![
        FeeRate::from_bps(600),
        FeeRate::from_bps(400)
    ]);

    let order = two_item_order(&market).await;
    let [item1, item2] = order.item_ids();
    let d = &order.created.details;
    assert_eq!(d.item(item1).unwrap().item.fee_rate, FeeRate::from_bps(400));
    assert_eq!(d.item(item1).unwrap().item.platform_fee, Money::from_cents(400));
    assert_eq!(d.item(item2).unwrap().item.fee_rate, FeeRate::from_bps(600));
    assert_eq!(d.item(item2).unwrap().item.platform_fee, Money::from_cents(300));

    // Rates are fixed when the order is placed
    market.db.replace_fee_tiers(&tiers[..1]).await.unwrap();
    let d = details(&market, order.order_id()).await;
    assert_eq!(d.item(item1).unwrap().item.fee_rate, FeeRate::from_bps(400));
    assert_eq!(d.item(item1).unwrap().transaction.platform_fee, Money::from_cents(400));
    tear_down(market).await;
}

#[tokio::test]
async fn accepted_offer_overrides_list_price() {
    let market = setup().await;
    market.seller(SELLER_A, false, false).await;
    let p = market.product(SELLER_A, "Film scanner", 20_000).await;
    market.db.insert_offer(p.id, BUYER, Money::from_cents(16_000), true).await.unwrap();
    market.db.insert_offer(p.id, 2, Money::from_cents(12_000), true).await.unwrap();
    let address = market.address(BUYER).await;
    let request =
        NewOrderRequest { shipping_address_id: address.id, payment_method: PaymentMethod::Card, product_ids: vec![p.id] };
    let created = market.orders.create_order(BUYER, request).await.unwrap();
    assert_eq!(created.order().total_amount, Money::from_cents(16_000));
    assert_eq!(created.details.items[0].item.platform_fee, Money::from_cents(800));
    tear_down(market).await;
}

#[tokio::test]
async fn invalid_orders_are_rejected_without_side_effects() {
    let market = setup().await;
    market.seller(SELLER_A, false, false).await;
    let p = market.product(SELLER_A, "Flash", 3_000).await;
    let own = market.product(BUYER, "My old flash", 2_000).await;
    market.seller(BUYER, false, false).await;
    let address = market.address(BUYER).await;
    let someone_elses = market.address(2).await;
    let request = |address_id: i64, product_ids: Vec<i64>| NewOrderRequest {
        shipping_address_id: address_id,
        payment_method: PaymentMethod::Card,
        product_ids,
    };

    let err = market.orders.create_order(BUYER, request(address.id, vec![])).await.unwrap_err();
    assert!(matches!(err, OrderFlowError::Validation(_)), "{err}");
    let err = market.orders.create_order(BUYER, request(address.id, vec![p.id, p.id])).await.unwrap_err();
    assert!(matches!(err, OrderFlowError::Validation(_)), "{err}");
    let err = market.orders.create_order(BUYER, request(someone_elses.id, vec![p.id])).await.unwrap_err();
    assert!(matches!(err, OrderFlowError::BusinessRule(_)), "{err}");
    let err = market.orders.create_order(BUYER, request(address.id, vec![p.id, own.id])).await.unwrap_err();
    assert!(matches!(err, OrderFlowError::BusinessRule(_)), "{err}");
    let err = market.orders.create_order(BUYER, request(address.id, vec![9_999])).await.unwrap_err();
    assert!(matches!(err, OrderFlowError::NotFound(_)), "{err}");
    let err = market.orders.create_order(BUYER, request(9_999, vec![p.id])).await.unwrap_err();
    assert!(matches!(err, OrderFlowError::NotFound(_)), "{err}");

    assert_eq!(market.gateway.charge_count(), 0);
    assert!(market.db.fetch_order(1).await.unwrap().is_none());
    tear_down(market).await;
}

#[tokio::test]
async fn sellers_must_be_able_to_receive_payouts() {
    let market = setup().await;
    let mut profile = market.seller(SELLER_A, true, false).await;
    profile.payout_enabled = false;
    market.db.upsert_seller_profile(&profile).await.unwrap();
    let p = market.product(SELLER_A, "Light meter", 4_000).await;
    let address = market.address(BUYER).await;
    let request =
        NewOrderRequest { shipping_address_id: address.id, payment_method: PaymentMethod::Card, product_ids: vec![p.id] };
    let err = market.orders.create_order(BUYER, request).await.unwrap_err();
    assert!(matches!(err, OrderFlowError::BusinessRule(_)), "{err}");
    assert_eq!(market.gateway.charge_count(), 0);
    tear_down(market).await;
}

#[tokio::test]
async fn gateway_failure_persists_nothing() {
    let market = setup().await;
    market.seller(SELLER_A, false, false).await;
    let p = market.product(SELLER_A, "Bag", 2_500).await;
    let address = market.address(BUYER).await;
    market.gateway.fail_charges(true);
    let request =
        NewOrderRequest { shipping_address_id: address.id, payment_method: PaymentMethod::Card, product_ids: vec![p.id] };
    let err = market.orders.create_order(BUYER, request.clone()).await.unwrap_err();
    assert!(matches!(err, OrderFlowError::Gateway(_)), "{err}");
    assert!(market.db.fetch_order(1).await.unwrap().is_none());

    market.gateway.fail_charges(false);
    market.gateway.disable(PaymentMethod::QrTransfer);
    let qr = NewOrderRequest { payment_method: PaymentMethod::QrTransfer, ..request };
    let err = market.orders.create_order(BUYER, qr).await.unwrap_err();
    assert!(matches!(err, OrderFlowError::Gateway(_)), "{err}");
    assert!(market.db.fetch_order(1).await.unwrap().is_none());
    tear_down(market).await;
}

#[tokio::test]
async fn payment_moves_items_to_processing_and_shipping_derives_order_status() {
    let market = setup().await;
    let order = two_item_order(&market).await;
    let [item1, item2] = order.item_ids();
    let proof = PaymentProof { charge_id: order.charge_id() };

    // Not yet paid at the provider
    let err = market.orders.confirm_payment(order.order_id(), Actor::User(BUYER), proof.clone()).await.unwrap_err();
    assert!(matches!(err, OrderFlowError::BusinessRule(_)), "{err}");
    assert_eq!(details(&market, order.order_id()).await.order.status, OrderStatusType::Pending);

    market.gateway.mark_paid(&order.charge_id());
    let wrong = PaymentProof { charge_id: "ch_bogus".into() };
    let err = market.orders.confirm_payment(order.order_id(), Actor::User(BUYER), wrong).await.unwrap_err();
    assert!(matches!(err, OrderFlowError::Validation(_)), "{err}");
    let err = market.orders.confirm_payment(order.order_id(), Actor::User(SELLER_A), proof.clone()).await.unwrap_err();
    assert!(matches!(err, OrderFlowError::BusinessRule(_)), "{err}");

    let paid = market.orders.confirm_payment(order.order_id(), Actor::User(BUYER), proof.clone()).await.unwrap();
    assert_eq!(paid.status, OrderStatusType::Processing);
    assert!(paid.paid_at.is_some());
    let d = details(&market, order.order_id()).await;
    assert_eq!(d.item_statuses(), vec![ItemStatus::Processing, ItemStatus::Processing]);
    assert!(d.items.iter().all(|i| i.transaction.paid_at.is_some()));
    for p in &order.products {
        assert_eq!(market.db.fetch_product(p.id).await.unwrap().unwrap().status, ProductStatus::Sold);
    }
    // Only once
    let err = market.orders.confirm_payment(order.order_id(), Actor::User(BUYER), proof).await.unwrap_err();
    assert!(matches!(err, OrderFlowError::BusinessRule(_)), "{err}");

    let ship = ItemStatusUpdate::new(ItemStatus::Shipped);
    let err = market.orders.update_item_status(item1, Actor::User(SELLER_A), ship.clone()).await.unwrap_err();
    assert!(matches!(err, OrderFlowError::Validation(_)), "{err}");
    let with_tracking = ship.with_tracking_number("X123");
    let err = market.orders.update_item_status(item1, Actor::User(BUYER), with_tracking.clone()).await.unwrap_err();
    assert!(matches!(err, OrderFlowError::BusinessRule(_)), "{err}");
    let err = market.orders.update_item_status(item1, Actor::User(SELLER_B), with_tracking.clone()).await.unwrap_err();
    assert!(matches!(err, OrderFlowError::BusinessRule(_)), "{err}");

    let shipped = market.orders.update_item_status(item1, Actor::User(SELLER_A), with_tracking).await.unwrap();
    assert_eq!(shipped.item.status, ItemStatus::Shipped);
    assert_eq!(shipped.order.status, OrderStatusType::Shipped);
    assert!(shipped.ledger_entry.is_none());
    let d = details(&market, order.order_id()).await;
    let tx = &d.item(item1).unwrap().transaction;
    assert_eq!(tx.tracking_number.as_deref(), Some("X123"));
    assert!(tx.shipped_at.is_some());
    assert_eq!(d.item(item2).unwrap().item.status, ItemStatus::Processing);
    assert_total_matches_items(&d);
    tear_down(market).await;
}

#[tokio::test]
async fn items_cannot_skip_or_reverse_states() {
    let market = setup().await;
    let order = two_item_order(&market).await;
    let [item1, _] = order.item_ids();
    let deliver = ItemStatusUpdate::new(ItemStatus::Delivered);
    let err = market.orders.update_item_status(item1, Actor::User(BUYER), deliver).await.unwrap_err();
    assert!(matches!(err, OrderFlowError::BusinessRule(_)), "{err}");
    let processing = ItemStatusUpdate::new(ItemStatus::Processing);
    let err = market.orders.update_item_status(item1, Actor::Admin, processing).await.unwrap_err();
    assert!(matches!(err, OrderFlowError::BusinessRule(_)), "{err}");
    let ship = ItemStatusUpdate::new(ItemStatus::Shipped).with_tracking_number("X1");
    let err = market.orders.update_item_status(item1, Actor::Admin, ship).await.unwrap_err();
    assert!(matches!(err, OrderFlowError::BusinessRule(_)), "{err}");
    let err = market.orders.update_item_status(9_999, Actor::Admin, ItemStatusUpdate::new(ItemStatus::Cancelled)).await;
    assert!(matches!(err, Err(OrderFlowError::NotFound(_))));
    tear_down(market).await;
}

#[tokio::test]
async fn delivery_releases_escrow_once() {
    let market = setup().await;
    let order = two_item_order(&market).await;
    let [item1, _] = order.item_ids();
    market.gateway.mark_paid(&order.charge_id());
    let proof = PaymentProof { charge_id: order.charge_id() };
    market.orders.confirm_payment(order.order_id(), Actor::User(BUYER), proof).await.unwrap();
    let ship = ItemStatusUpdate::new(ItemStatus::Shipped).with_tracking_number("X123");
    market.orders.update_item_status(item1, Actor::User(SELLER_A), ship).await.unwrap();

    let err = market
        .orders
        .update_item_status(item1, Actor::User(SELLER_A), ItemStatusUpdate::new(ItemStatus::Delivered))
        .await
        .unwrap_err();
    assert!(matches!(err, OrderFlowError::BusinessRule(_)), "{err}");
    let delivered = market
        .orders
        .update_item_status(item1, Actor::User(BUYER), ItemStatusUpdate::new(ItemStatus::Delivered))
        .await
        .unwrap();
    assert_eq!(delivered.item.status, ItemStatus::Delivered);
    assert_eq!(delivered.item.escrow_status, EscrowStatus::Released);
    assert_eq!(delivered.order.status, OrderStatusType::Shipped);
    let entry = delivered.ledger_entry.unwrap();
    assert_eq!(entry.amount, Money::from_cents(9_500));
    assert_eq!(entry.direction, LedgerDirection::ToSeller);
    assert_eq!(entry.movement, EscrowMovement::Release);

    let again = market.escrow.release(item1, "Operator release").await.unwrap();
    assert!(again.is_none());
    let ledger = market.escrow.ledger_for(item1).await.unwrap();
    assert_eq!(ledger.len(), 1);
    let seller = market.db.fetch_seller_profile(SELLER_A).await.unwrap().unwrap();
    assert_eq!(seller.completed_transactions, 1);
    tear_down(market).await;
}

#[tokio::test]
async fn cancelling_a_pending_order_refunds_every_item() {
    let market = setup().await;
    let order = two_item_order(&market).await;
    let cancelled = market.orders.cancel_order(order.order_id(), Actor::User(BUYER)).await.unwrap();
    assert_eq!(cancelled.order.status, OrderStatusType::Cancelled);
    for i in &cancelled.items {
        assert_eq!(i.item.status, ItemStatus::Cancelled);
        assert_eq!(i.item.escrow_status, EscrowStatus::Refunded);
        let ledger = market.escrow.ledger_for(i.item.id).await.unwrap();
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger[0].movement, EscrowMovement::Refund);
        assert_eq!(ledger[0].direction, LedgerDirection::ToBuyer);
        assert_eq!(ledger[0].amount, i.item.price);
    }
    let refunds = market.gateway.refunds();
    assert_eq!(refunds.len(), 1);
    assert_eq!(refunds[0].amount, Money::from_cents(15_000));
    assert_eq!(refunds[0].charge_id, order.charge_id());
    for p in &order.products {
        assert_eq!(market.db.fetch_product(p.id).await.unwrap().unwrap().status, ProductStatus::Active);
    }
    assert_total_matches_items(&cancelled);

    let err = market.orders.cancel_order(order.order_id(), Actor::User(BUYER)).await.unwrap_err();
    assert!(matches!(err, OrderFlowError::BusinessRule(_)), "{err}");
    assert_eq!(market.gateway.refunds().len(), 1);
    tear_down(market).await;
}

#[tokio::test]
async fn failed_refund_changes_nothing() {
    let market = setup().await;
    let order = two_item_order(&market).await;
    market.gateway.fail_refunds(true);
    let err = market.orders.cancel_order(order.order_id(), Actor::User(BUYER)).await.unwrap_err();
    assert!(matches!(err, OrderFlowError::Gateway(_)), "{err}");
    let d = details(&market, order.order_id()).await;
    assert_eq!(d.order.status, OrderStatusType::Pending);
    for i in &d.items {
        assert_eq!(i.item.status, ItemStatus::Pending);
        assert_eq!(i.item.escrow_status, EscrowStatus::Holding);
        assert!(market.escrow.ledger_for(i.item.id).await.unwrap().is_empty());
    }
    tear_down(market).await;
}

#[tokio::test]
async fn rejected_refund_can_be_retried() {
    let market = setup().await;
    let order = two_item_order(&market).await;
    let [item1, _] = order.item_ids();
    market.gateway.fail_refunds(true);
    let err = market.orders.cancel_order(order.order_id(), Actor::User(BUYER)).await.unwrap_err();
    assert!(matches!(err, OrderFlowError::Gateway(_)), "{err}");

    // Nothing is left claimed, so a different cancellation of the same items goes through
    market.gateway.fail_refunds(false);
    let cancelled = market
        .orders
        .update_item_status(item1, Actor::User(BUYER), ItemStatusUpdate::new(ItemStatus::Cancelled))
        .await
        .unwrap();
    assert_eq!(cancelled.item.status, ItemStatus::Cancelled);
    let cancelled = market.orders.cancel_order(order.order_id(), Actor::User(BUYER)).await.unwrap();
    assert_eq!(cancelled.order.status, OrderStatusType::Cancelled);
    let amounts = market.gateway.refunds().iter().map(|r| r.amount).collect::<Vec<_>>();
    assert_eq!(amounts, vec![Money::from_cents(10_000), Money::from_cents(5_000)]);
    tear_down(market).await;
}

#[tokio::test]
async fn timed_out_refund_holds_the_items_until_retried() {
    let market = setup().await;
    let order = two_item_order(&market).await;
    let [item1, _] = order.item_ids();
    market.gateway.time_out_refunds(true);
    let err = market.orders.cancel_order(order.order_id(), Actor::User(BUYER)).await.unwrap_err();
    assert!(matches!(err, OrderFlowError::Gateway(_)), "{err}");
    assert_eq!(market.gateway.refunds().len(), 1);
    let d = details(&market, order.order_id()).await;
    assert_eq!(d.item_statuses(), vec![ItemStatus::Pending, ItemStatus::Pending]);

    // The provider may have refunded already, so the items cannot move or be refunded under another key
    market.gateway.time_out_refunds(false);
    let err = market
        .orders
        .update_item_status(item1, Actor::User(BUYER), ItemStatusUpdate::new(ItemStatus::Cancelled))
        .await
        .unwrap_err();
    assert!(matches!(err, OrderFlowError::ConcurrencyConflict(_)), "{err}");
    market.gateway.mark_paid(&order.charge_id());
    let proof = PaymentProof { charge_id: order.charge_id() };
    let err = market.orders.confirm_payment(order.order_id(), Actor::User(BUYER), proof).await.unwrap_err();
    assert!(matches!(err, OrderFlowError::ConcurrencyConflict(_)), "{err}");
    assert_eq!(market.gateway.refunds().len(), 1);

    let cancelled = market.orders.cancel_order(order.order_id(), Actor::User(BUYER)).await.unwrap();
    assert_eq!(cancelled.order.status, OrderStatusType::Cancelled);
    let refunds = market.gateway.refunds();
    assert_eq!(refunds.len(), 1);
    assert_eq!(refunds[0].amount, Money::from_cents(15_000));
    for i in &cancelled.items {
        let ledger = market.escrow.ledger_for(i.item.id).await.unwrap();
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger[0].external_ref.as_deref(), Some(refunds[0].refund_id.as_str()));
    }
    tear_down(market).await;
}

#[tokio::test]
async fn concurrent_order_cancellations_refund_once() {
    let market = setup().await;
    let order = two_item_order(&market).await;
    let (a, b) = tokio::join!(
        market.orders.cancel_order(order.order_id(), Actor::User(BUYER)),
        market.orders.cancel_order(order.order_id(), Actor::Admin),
    );
    let (ok, err) = match (a, b) {
        (Ok(ok), Err(err)) | (Err(err), Ok(ok)) => (ok, err),
        (a, b) => panic!("Expected exactly one cancellation to succeed, got {a:?} and {b:?}"),
    };
    assert_eq!(ok.order.status, OrderStatusType::Cancelled);
    assert!(matches!(err, OrderFlowError::ConcurrencyConflict(_) | OrderFlowError::BusinessRule(_)), "{err}");
    let refunds = market.gateway.refunds();
    assert_eq!(refunds.len(), 1);
    assert_eq!(refunds[0].amount, Money::from_cents(15_000));
    for i in &ok.items {
        assert_eq!(market.escrow.ledger_for(i.item.id).await.unwrap().len(), 1);
    }
    tear_down(market).await;
}

#[tokio::test]
async fn item_and_order_cancellations_never_refund_an_item_twice() {
    let market = setup().await;
    let order = two_item_order(&market).await;
    let [item1, _] = order.item_ids();
    let (_, _) = tokio::join!(
        market.orders.update_item_status(item1, Actor::User(BUYER), ItemStatusUpdate::new(ItemStatus::Cancelled)),
        market.orders.cancel_order(order.order_id(), Actor::User(BUYER)),
    );
    let d = details(&market, order.order_id()).await;
    let cancelled_total = d
        .items
        .iter()
        .filter(|i| i.item.status == ItemStatus::Cancelled)
        .map(|i| i.item.price)
        .sum::<Money>();
    let refunded_total = market.gateway.refunds().iter().map(|r| r.amount).sum::<Money>();
    assert_eq!(refunded_total, cancelled_total);
    assert_eq!(d.item(item1).unwrap().item.status, ItemStatus::Cancelled);
    for i in &d.items {
        let refunds = market.escrow.ledger_for(i.item.id).await.unwrap();
        assert!(refunds.len() <= 1, "Item #{} was refunded {} times", i.item.id, refunds.len());
    }
    tear_down(market).await;
}

#[tokio::test]
async fn refund_claims_are_exclusive() {
    let market = setup().await;
    let order = two_item_order(&market).await;
    let [item1, item2] = order.item_ids();
    let both = [
        CancelledItem { item_id: item1, expected_status: ItemStatus::Pending },
        CancelledItem { item_id: item2, expected_status: ItemStatus::Pending },
    ];
    let (a, b) = tokio::join!(
        market.db.claim_items_for_refund(order.order_id(), &both, "refund:a"),
        market.db.claim_items_for_refund(order.order_id(), &both[..1], "refund:b"),
    );
    assert!(a.is_ok() != b.is_ok(), "{a:?} {b:?}");
    let err = a.err().or(b.err()).unwrap();
    assert!(matches!(err, MarketplaceDbError::ConcurrencyConflict(_)), "{err}");
    let winner = if market.db.claim_items_for_refund(order.order_id(), &both[..1], "refund:a").await.is_ok() {
        "refund:a"
    } else {
        "refund:b"
    };
    // Claiming again under the same key is allowed
    market.db.claim_items_for_refund(order.order_id(), &both[..1], winner).await.unwrap();

    let err = market.orders.cancel_order(order.order_id(), Actor::User(BUYER)).await.unwrap_err();
    assert!(matches!(err, OrderFlowError::ConcurrencyConflict(_)), "{err}");
    assert!(market.gateway.refunds().is_empty());
    let err = market.db.cancel_items(order.order_id(), &both, "refund:c", "re_x", "Test", chrono::Utc::now()).await;
    assert!(matches!(err, Err(MarketplaceDbError::ConcurrencyConflict(_))), "{err:?}");

    assert!(market.db.release_refund_claim(winner).await.unwrap() >= 1);
    let cancelled = market.orders.cancel_order(order.order_id(), Actor::User(BUYER)).await.unwrap();
    assert_eq!(cancelled.order.status, OrderStatusType::Cancelled);
    assert_eq!(market.gateway.refunds().len(), 1);
    tear_down(market).await;
}

#[tokio::test]
async fn concurrent_shipments_of_one_item_succeed_once() {
    let market = setup().await;
    let order = two_item_order(&market).await;
    let [item1, _] = order.item_ids();
    market.gateway.mark_paid(&order.charge_id());
    let proof = PaymentProof { charge_id: order.charge_id() };
    market.orders.confirm_payment(order.order_id(), Actor::User(BUYER), proof).await.unwrap();

    let now = chrono::Utc::now();
    let (a, b) = tokio::join!(market.db.ship_item(item1, "FIRST", now), market.db.ship_item(item1, "SECOND", now));
    let (shipped, err) = match (a, b) {
        (Ok(shipped), Err(err)) | (Err(err), Ok(shipped)) => (shipped, err),
        (a, b) => panic!("Expected exactly one shipment to succeed, got {a:?} and {b:?}"),
    };
    assert!(matches!(err, MarketplaceDbError::ConcurrencyConflict(_)), "{err}");
    assert_eq!(shipped.item.status, ItemStatus::Shipped);
    let d = details(&market, order.order_id()).await;
    let tracking = d.item(item1).unwrap().transaction.tracking_number.clone().unwrap();
    assert!(tracking == "FIRST" || tracking == "SECOND");

    // Through the order flow, a stale read surfaces as a conflict or a rejected transition
    let ship = ItemStatusUpdate::new(ItemStatus::Shipped).with_tracking_number("X1");
    let err = market.orders.update_item_status(item1, Actor::User(SELLER_A), ship).await.unwrap_err();
    assert!(matches!(err, OrderFlowError::BusinessRule(_) | OrderFlowError::ConcurrencyConflict(_)), "{err}");
    tear_down(market).await;
}

#[tokio::test]
async fn cancelling_one_item_keeps_the_rest_of_the_order_alive() {
    let market = setup().await;
    let order = two_item_order(&market).await;
    let [item1, item2] = order.item_ids();
    market.gateway.mark_paid(&order.charge_id());
    let proof = PaymentProof { charge_id: order.charge_id() };
    market.orders.confirm_payment(order.order_id(), Actor::User(BUYER), proof).await.unwrap();

    let err = market
        .orders
        .update_item_status(item2, Actor::User(SELLER_A), ItemStatusUpdate::new(ItemStatus::Cancelled))
        .await
        .unwrap_err();
    assert!(matches!(err, OrderFlowError::BusinessRule(_)), "{err}");
    let result = market
        .orders
        .update_item_status(item2, Actor::User(SELLER_B), ItemStatusUpdate::new(ItemStatus::Cancelled))
        .await
        .unwrap();
    assert_eq!(result.item.status, ItemStatus::Cancelled);
    assert_eq!(result.item.escrow_status, EscrowStatus::Refunded);
    assert_eq!(result.order.status, OrderStatusType::Processing);
    assert_eq!(result.ledger_entry.unwrap().amount, Money::from_cents(5_000));
    assert_eq!(market.gateway.refunds()[0].amount, Money::from_cents(5_000));
    assert_eq!(market.db.fetch_product(order.products[1].id).await.unwrap().unwrap().status, ProductStatus::Active);

    // The surviving item runs to completion, and the order is delivered
    let ship = ItemStatusUpdate::new(ItemStatus::Shipped).with_tracking_number("X123");
    market.orders.update_item_status(item1, Actor::User(SELLER_A), ship).await.unwrap();
    let err = market.orders.cancel_order(order.order_id(), Actor::Admin).await.unwrap_err();
    assert!(matches!(err, OrderFlowError::BusinessRule(_)), "{err}");
    let delivered = market
        .orders
        .update_item_status(item1, Actor::User(BUYER), ItemStatusUpdate::new(ItemStatus::Delivered))
        .await
        .unwrap();
    assert_eq!(delivered.order.status, OrderStatusType::Delivered);
    let d = details(&market, order.order_id()).await;
    assert!(d.order.delivered_at.is_some());
    assert_total_matches_items(&d);
    tear_down(market).await;
}

#[tokio::test]
async fn only_parties_to_an_order_can_see_it() {
    let market = setup().await;
    let order = two_item_order(&market).await;
    let id = order.order_id();
    assert!(market.orders.order_details(id, Actor::User(BUYER)).await.is_ok());
    assert!(market.orders.order_details(id, Actor::User(SELLER_B)).await.is_ok());
    assert!(market.orders.order_details(id, Actor::Admin).await.is_ok());
    let err = market.orders.order_details(id, Actor::User(99)).await.unwrap_err();
    assert!(matches!(err, OrderFlowError::NotFound(_)), "{err}");
    let err = market.orders.cancel_order(id, Actor::User(99)).await.unwrap_err();
    assert!(matches!(err, OrderFlowError::BusinessRule(_)), "{err}");
    tear_down(market).await;
}
