/*
[INPUT]:  API schema definitions and serde requirements
[OUTPUT]: Typed Rust response structs with deserialization support
[POS]:    Data layer - type definitions for API communication
[UPDATE]: When API schema changes or new types added
*/

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use super::enums::OrderStatus;
use super::models::AccountPosition;

/// Order lifecycle report delivered by the venue. A completely blank
/// response is how the wire layer surfaces a failed submission, so the
/// quantity fields stay as raw strings here and parse on demand.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrderResponse {
    #[serde(rename = "clientOrderId", default)]
    pub client_order_id: String,
    #[serde(rename = "orderId", default)]
    pub exchange_order_id: String,
    #[serde(default)]
    pub symbol: String,
    #[serde(default)]
    pub side: String,
    #[serde(rename = "origQty", default)]
    pub orig_qty: String,
    #[serde(rename = "executedQty", default)]
    pub executed_qty: String,
    #[serde(rename = "avgPrice", default)]
    pub avg_price: String,
    #[serde(default)]
    pub status: Option<OrderStatus>,
    #[serde(rename = "errorCode", default)]
    pub error_code: Option<i64>,
    #[serde(rename = "errorMessage", default)]
    pub error_message: Option<String>,
}

impl OrderResponse {
    /// A response with every material field blank signals a submission
    /// failure rather than a lifecycle event.
    pub fn is_empty(&self) -> bool {
        self.symbol.is_empty() && self.side.is_empty() && self.status.is_none()
    }

    /// Parsed original quantity, zero when absent or malformed.
    pub fn orig_qty_decimal(&self) -> Decimal {
        Decimal::from_str(&self.orig_qty).unwrap_or(Decimal::ZERO)
    }

    /// Parsed executed quantity, falling back to the original quantity the
    /// way the venue does for terse FILLED reports.
    pub fn executed_qty_decimal(&self) -> Decimal {
        if self.executed_qty.is_empty() {
            return self.orig_qty_decimal();
        }
        Decimal::from_str(&self.executed_qty).unwrap_or(Decimal::ZERO)
    }

    /// Parsed average fill price, zero when absent.
    pub fn avg_price_decimal(&self) -> Decimal {
        Decimal::from_str(&self.avg_price).unwrap_or(Decimal::ZERO)
    }
}

/// Full account snapshot returned for `request_account_info`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AccountInfoResponse {
    #[serde(default)]
    pub positions: Vec<AccountPosition>,
}
