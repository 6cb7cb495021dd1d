/*
[INPUT]:  API schema definitions and serde requirements
[OUTPUT]: Typed Rust structs with serialization support
[POS]:    Data layer - type definitions for API communication
[UPDATE]: When API schema changes or new types added
*/

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::enums::PositionSide;

/// Per-symbol trading constraints distilled from the venue's exchange-info
/// filters. Immutable after load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolRule {
    pub symbol: String,
    pub quantity_precision: u32,
    pub price_precision: u32,
    #[serde(with = "rust_decimal::serde::str")]
    pub min_qty: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub max_qty: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub step_size: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub tick_size: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub min_notional: Decimal,
}

/// One entry of a symbol's `filters` array in the exchange-info blob.
/// Only the filter types the rule table consumes are modelled; everything
/// else falls into `Other`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "filterType")]
pub enum SymbolFilter {
    #[serde(rename = "LOT_SIZE")]
    LotSize {
        #[serde(rename = "minQty", with = "rust_decimal::serde::str")]
        min_qty: Decimal,
        #[serde(rename = "maxQty", with = "rust_decimal::serde::str")]
        max_qty: Decimal,
        #[serde(rename = "stepSize", with = "rust_decimal::serde::str")]
        step_size: Decimal,
    },
    #[serde(rename = "PRICE_FILTER")]
    PriceFilter {
        #[serde(rename = "tickSize", with = "rust_decimal::serde::str")]
        tick_size: Decimal,
    },
    #[serde(rename = "MIN_NOTIONAL")]
    MinNotional {
        #[serde(rename = "notional", with = "rust_decimal::serde::str")]
        notional: Decimal,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeSymbol {
    pub symbol: String,
    #[serde(rename = "quantityPrecision")]
    pub quantity_precision: u32,
    #[serde(rename = "pricePrecision")]
    pub price_precision: u32,
    #[serde(default)]
    pub filters: Vec<SymbolFilter>,
}

/// The exchange-info blob as fetched (and cached to disk) at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeInfo {
    pub symbols: Vec<ExchangeSymbol>,
}

impl ExchangeSymbol {
    /// Collapse the filter array into a flat rule. Returns `None` when the
    /// mandatory LOT_SIZE or PRICE_FILTER entries are missing.
    pub fn to_rule(&self) -> Option<SymbolRule> {
        let mut min_qty = None;
        let mut max_qty = None;
        let mut step_size = None;
        let mut tick_size = None;
        let mut min_notional = Decimal::ZERO;

        for filter in &self.filters {
            match filter {
                SymbolFilter::LotSize {
                    min_qty: min,
                    max_qty: max,
                    step_size: step,
                } => {
                    min_qty = Some(*min);
                    max_qty = Some(*max);
                    step_size = Some(*step);
                }
                SymbolFilter::PriceFilter { tick_size: tick } => {
                    tick_size = Some(*tick);
                }
                SymbolFilter::MinNotional { notional } => {
                    min_notional = *notional;
                }
                SymbolFilter::Other => {}
            }
        }

        Some(SymbolRule {
            symbol: self.symbol.clone(),
            quantity_precision: self.quantity_precision,
            price_precision: self.price_precision,
            min_qty: min_qty?,
            max_qty: max_qty?,
            step_size: step_size?,
            tick_size: tick_size?,
            min_notional,
        })
    }
}

/// A single position row from an account snapshot or incremental update.
/// Quantities are decimal strings on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountPosition {
    pub symbol: String,
    #[serde(rename = "positionSide")]
    pub position_side: PositionSide,
    #[serde(rename = "positionAmt", with = "rust_decimal::serde::str")]
    pub position_amount: Decimal,
    #[serde(rename = "entryPrice", default, with = "rust_decimal::serde::str")]
    pub entry_price: Decimal,
    #[serde(rename = "unRealizedProfit", default, with = "rust_decimal::serde::str")]
    pub unrealized_pnl: Decimal,
}

/// Best bid/ask extracted from a depth update (level 0 only).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookTop {
    pub symbol: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub bid_price: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub ask_price: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub bid_qty: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub ask_qty: Decimal,
}
