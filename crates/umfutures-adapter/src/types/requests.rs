/*
[INPUT]:  API schema definitions and serde requirements
[OUTPUT]: Typed Rust request structs with serialization support
[POS]:    Data layer - type definitions for API communication
[UPDATE]: When API schema changes or new types added
*/

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::enums::{OrderType, PositionSide, Side, TimeInForce};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: Side,
    #[serde(rename = "type")]
    pub order_type: OrderType,
    #[serde(with = "rust_decimal::serde::str")]
    pub quantity: Decimal,
    #[serde(rename = "reduceOnly")]
    pub reduce_only: bool,
    #[serde(rename = "newClientOrderId")]
    pub client_order_id: String,
    #[serde(rename = "positionSide")]
    pub position_side: PositionSide,
    // Market orders omit timeInForce; the venue accepts either but the
    // gateway standardises on omission.
    #[serde(rename = "timeInForce", default, skip_serializing_if = "Option::is_none")]
    pub time_in_force: Option<TimeInForce>,
    #[serde(rename = "price", default, with = "rust_decimal::serde::str_option")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<Decimal>,
}

impl OrderRequest {
    /// Build a single-position-mode market order.
    pub fn market(
        symbol: impl Into<String>,
        side: Side,
        quantity: Decimal,
        reduce_only: bool,
        client_order_id: impl Into<String>,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            order_type: OrderType::Market,
            quantity,
            reduce_only,
            client_order_id: client_order_id.into(),
            position_side: PositionSide::Both,
            time_in_force: None,
            price: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancelRequest {
    #[serde(rename = "origClientOrderId", skip_serializing_if = "Option::is_none")]
    pub client_order_id: Option<String>,
    #[serde(rename = "orderId", skip_serializing_if = "Option::is_none")]
    pub exchange_order_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn market_order_serialises_without_time_in_force() {
        let req = OrderRequest::market(
            "BTCUSDT",
            Side::Buy,
            Decimal::from_str("0.5").unwrap(),
            false,
            "cl-1",
        );

        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(value["type"], "MARKET");
        assert_eq!(value["positionSide"], "BOTH");
        assert_eq!(value["quantity"], "0.5");
        assert!(value.get("timeInForce").is_none());
        assert!(value.get("price").is_none());
    }
}
