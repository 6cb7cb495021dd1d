/*
[INPUT]:  Exchange-info blob (cached JSON) with per-symbol filters
[OUTPUT]: RuleTable - quantity/price formatting and order validation
[POS]:    Reference-data layer - read-only after load
[UPDATE]: When the venue adds filter types the gateway must honor
*/

use std::collections::HashMap;

use rust_decimal::Decimal;
use thiserror::Error;
use tracing::warn;

use umfutures_adapter::{ExchangeInfo, SymbolRule};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RuleError {
    #[error("no trading rule for {symbol}")]
    UnknownSymbol { symbol: String },

    #[error("quantity {quantity} below minimum {min_qty} for {symbol}")]
    BelowMinQty {
        symbol: String,
        quantity: Decimal,
        min_qty: Decimal,
    },

    #[error("quantity {quantity} above maximum {max_qty} for {symbol}")]
    AboveMaxQty {
        symbol: String,
        quantity: Decimal,
        max_qty: Decimal,
    },

    #[error("notional {notional} below minimum {min_notional} for {symbol}")]
    BelowMinNotional {
        symbol: String,
        notional: Decimal,
        min_notional: Decimal,
    },

    #[error("rule for {symbol} has a non-positive step or tick size")]
    DegenerateRule { symbol: String },
}

/// Per-symbol trading rules, read-only after construction. Publication via
/// `Arc` is the only synchronisation needed.
#[derive(Debug, Clone, Default)]
pub struct RuleTable {
    rules: HashMap<String, SymbolRule>,
}

impl RuleTable {
    /// Build the table from an exchange-info blob. Symbols with missing or
    /// degenerate filters are skipped with a warning rather than poisoning
    /// the whole table.
    pub fn from_exchange_info(info: &ExchangeInfo) -> Self {
        let mut rules = HashMap::new();
        for symbol in &info.symbols {
            match symbol.to_rule() {
                Some(rule) if rule.step_size > Decimal::ZERO && rule.tick_size > Decimal::ZERO => {
                    rules.insert(rule.symbol.clone(), rule);
                }
                Some(_) => {
                    warn!(symbol = %symbol.symbol, "skipping rule with non-positive step/tick");
                }
                None => {
                    warn!(symbol = %symbol.symbol, "skipping symbol with incomplete filters");
                }
            }
        }
        Self { rules }
    }

    /// Parse a cached exchange-info JSON blob and build the table.
    pub fn from_json(blob: &str) -> serde_json::Result<Self> {
        let info: ExchangeInfo = serde_json::from_str(blob)?;
        Ok(Self::from_exchange_info(&info))
    }

    #[cfg(test)]
    pub fn from_rules(rules: impl IntoIterator<Item = SymbolRule>) -> Self {
        Self {
            rules: rules
                .into_iter()
                .map(|rule| (rule.symbol.clone(), rule))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn get(&self, symbol: &str) -> Option<&SymbolRule> {
        self.rules.get(symbol)
    }

    /// Floor the quantity to the symbol's step size, then round to its
    /// quantity precision. Idempotent: formatting a formatted quantity is a
    /// no-op.
    pub fn format_quantity(&self, symbol: &str, quantity: Decimal) -> Result<Decimal, RuleError> {
        let rule = self.require(symbol)?;
        let steps = (quantity / rule.step_size).floor();
        let formatted = steps * rule.step_size;
        Ok(formatted.round_dp(rule.quantity_precision))
    }

    /// Snap the price to the nearest tick, then round to the symbol's price
    /// precision.
    pub fn format_price(&self, symbol: &str, price: Decimal) -> Result<Decimal, RuleError> {
        let rule = self.require(symbol)?;
        let ticks = (price / rule.tick_size).round();
        let formatted = ticks * rule.tick_size;
        Ok(formatted.round_dp(rule.price_precision))
    }

    /// Validate a formatted quantity/price pair against the symbol's limits.
    pub fn validate(&self, symbol: &str, quantity: Decimal, price: Decimal) -> Result<(), RuleError> {
        let rule = self.require(symbol)?;

        if quantity < rule.min_qty {
            return Err(RuleError::BelowMinQty {
                symbol: symbol.to_string(),
                quantity,
                min_qty: rule.min_qty,
            });
        }
        if quantity > rule.max_qty {
            return Err(RuleError::AboveMaxQty {
                symbol: symbol.to_string(),
                quantity,
                max_qty: rule.max_qty,
            });
        }

        let notional = quantity * price;
        if notional < rule.min_notional {
            return Err(RuleError::BelowMinNotional {
                symbol: symbol.to_string(),
                notional,
                min_notional: rule.min_notional,
            });
        }

        Ok(())
    }

    fn require(&self, symbol: &str) -> Result<&SymbolRule, RuleError> {
        let rule = self.rules.get(symbol).ok_or_else(|| RuleError::UnknownSymbol {
            symbol: symbol.to_string(),
        })?;
        if rule.step_size <= Decimal::ZERO || rule.tick_size <= Decimal::ZERO {
            return Err(RuleError::DegenerateRule {
                symbol: symbol.to_string(),
            });
        }
        Ok(rule)
    }
}
