/*
[INPUT]:  SimExchange behind the ExchangeDriver trait object
[OUTPUT]: Contract checks for the driver event flow
[POS]:    Integration tests - adapter surface
[UPDATE]: When the driver trait or event contract changes
*/

use std::str::FromStr;
use std::sync::Arc;

use rstest::rstest;
use rust_decimal::Decimal;
use tokio::sync::mpsc;

use umfutures_adapter::{
    CancelRequest, DriverEvent, ExchangeDriver, FillMode, OrderRequest, OrderStatus, SimExchange,
    Side,
};

fn dec(value: &str) -> Decimal {
    Decimal::from_str(value).expect("valid decimal")
}

fn setup() -> (Arc<dyn ExchangeDriver>, Arc<SimExchange>, mpsc::UnboundedReceiver<DriverEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let sim = Arc::new(SimExchange::new(tx));
    (sim.clone(), sim, rx)
}

fn order_statuses(events: &mut mpsc::UnboundedReceiver<DriverEvent>) -> Vec<OrderStatus> {
    let mut statuses = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let DriverEvent::Order(resp) = event {
            if let Some(status) = resp.status {
                statuses.push(status);
            }
        }
    }
    statuses
}

#[tokio::test]
async fn market_order_reports_new_then_filled() {
    let (driver, sim, mut events) = setup();
    sim.set_book("BTCUSDT", dec("99"), dec("100"));

    driver
        .submit_order(OrderRequest::market("BTCUSDT", Side::Buy, dec("3"), false, "cl-1"))
        .await
        .unwrap();

    assert_eq!(
        order_statuses(&mut events),
        vec![OrderStatus::New, OrderStatus::Filled]
    );
}

#[rstest]
#[case(FillMode::Reject, vec![OrderStatus::Rejected])]
#[case(FillMode::Ignore, vec![])]
#[case(FillMode::Mute, vec![OrderStatus::New])]
#[tokio::test]
async fn scripted_failure_modes_shape_the_event_stream(
    #[case] mode: FillMode,
    #[case] expected: Vec<OrderStatus>,
) {
    let (driver, sim, mut events) = setup();
    sim.set_book("BTCUSDT", dec("99"), dec("100"));
    sim.script_fills("BTCUSDT", [mode]);

    driver
        .submit_order(OrderRequest::market("BTCUSDT", Side::Buy, dec("3"), false, "cl-1"))
        .await
        .unwrap();

    assert_eq!(order_statuses(&mut events), expected);
}

#[tokio::test]
async fn cancel_needs_some_order_id() {
    let (driver, _sim, mut events) = setup();

    let err = driver
        .cancel_order(CancelRequest {
            client_order_id: None,
            exchange_order_id: None,
        })
        .await
        .unwrap_err();
    assert!(err.to_string().contains("order id"));

    driver
        .cancel_order(CancelRequest {
            client_order_id: Some("cl-1".to_string()),
            exchange_order_id: None,
        })
        .await
        .unwrap();

    assert_eq!(order_statuses(&mut events), vec![OrderStatus::Canceled]);
}

#[tokio::test]
async fn position_info_replays_each_position() {
    let (driver, sim, mut events) = setup();
    sim.set_position("BTCUSDT", dec("1.5"));
    sim.set_position("ETHUSDT", dec("-2"));

    driver.request_position_info().await.unwrap();

    let mut symbols = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let DriverEvent::PositionUpdate(row) = event {
            symbols.push(row.symbol);
        }
    }
    symbols.sort();
    assert_eq!(symbols, vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()]);
}

#[tokio::test]
async fn depth_subscription_replays_seeded_book() {
    let (driver, sim, mut events) = setup();
    sim.set_book("ETHUSDT", dec("2999"), dec("3000"));

    driver.subscribe_depth("ETHUSDT", 5, 100).await.unwrap();

    match events.try_recv().unwrap() {
        DriverEvent::Depth(top) => {
            assert_eq!(top.symbol, "ETHUSDT");
            assert_eq!(top.bid_price, dec("2999"));
        }
        other => panic!("unexpected event: {other:?}"),
    }
}
