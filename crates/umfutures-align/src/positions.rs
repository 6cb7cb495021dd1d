/*
[INPUT]:  Account snapshots and incremental position events from the venue
[OUTPUT]: Authoritative net position per symbol (zero rows retained)
[POS]:    State layer - the planner's only source of current positions
[UPDATE]: When snapshot/merge semantics change
*/

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use rust_decimal::Decimal;

use umfutures_adapter::AccountPosition;

/// One net position in single-position mode. Created lazily, never deleted:
/// a zero row still matters when the target for that symbol is zero.
#[derive(Debug, Clone, PartialEq)]
pub struct Position {
    pub symbol: String,
    pub net_quantity: Decimal,
    pub entry_price: Decimal,
    pub unrealized_pnl: Decimal,
    pub last_update: Instant,
}

impl Position {
    fn flat(symbol: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            net_quantity: Decimal::ZERO,
            entry_price: Decimal::ZERO,
            unrealized_pnl: Decimal::ZERO,
            last_update: Instant::now(),
        }
    }
}

/// Position cache mirroring the last exchange-acknowledged state. Only the
/// snapshot handler and incremental callbacks write here; local predictions
/// never do.
#[derive(Debug, Default)]
pub struct PositionBook {
    positions: Mutex<HashMap<String, Position>>,
}

impl PositionBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole cache from a full snapshot. Venue rows with
    /// `positionSide == BOTH` carry the signed net quantity directly; zero
    /// quantities are kept. Symbols the current target file mentions but the
    /// snapshot does not get explicit zero rows so the planner can compare
    /// against them.
    pub fn apply_snapshot<'a>(
        &self,
        rows: &[AccountPosition],
        target_symbols: impl IntoIterator<Item = &'a str>,
    ) {
        let now = Instant::now();
        let mut positions = self.positions.lock().expect("positions lock");
        positions.clear();

        for row in rows {
            positions.insert(
                row.symbol.clone(),
                Position {
                    symbol: row.symbol.clone(),
                    net_quantity: row.position_amount,
                    entry_price: row.entry_price,
                    unrealized_pnl: row.unrealized_pnl,
                    last_update: now,
                },
            );
        }

        for symbol in target_symbols {
            positions
                .entry(symbol.to_string())
                .or_insert_with(|| Position::flat(symbol));
        }
    }

    /// Merge one incremental row, overwriting quantity, entry price and
    /// unrealized PnL.
    pub fn upsert(&self, row: &AccountPosition) {
        let mut positions = self.positions.lock().expect("positions lock");
        let entry = positions
            .entry(row.symbol.clone())
            .or_insert_with(|| Position::flat(&row.symbol));
        entry.net_quantity = row.position_amount;
        entry.entry_price = row.entry_price;
        entry.unrealized_pnl = row.unrealized_pnl;
        entry.last_update = Instant::now();
    }

    /// Current position, flat when the symbol has never been observed.
    pub fn get(&self, symbol: &str) -> Position {
        let positions = self.positions.lock().expect("positions lock");
        positions
            .get(symbol)
            .cloned()
            .unwrap_or_else(|| Position::flat(symbol))
    }

    pub fn net_quantity(&self, symbol: &str) -> Decimal {
        self.get(symbol).net_quantity
    }

    pub fn len(&self) -> usize {
        self.positions.lock().expect("positions lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;
    use umfutures_adapter::PositionSide;

    fn dec(value: &str) -> Decimal {
        Decimal::from_str(value).expect("valid decimal")
    }

    fn row(symbol: &str, amount: &str) -> AccountPosition {
        AccountPosition {
            symbol: symbol.to_string(),
            position_side: PositionSide::Both,
            position_amount: dec(amount),
            entry_price: dec("100"),
            unrealized_pnl: Decimal::ZERO,
        }
    }

    #[test]
    fn snapshot_replaces_previous_state() {
        let book = PositionBook::new();
        book.apply_snapshot(&[row("BTCUSDT", "2.5"), row("ETHUSDT", "0")], []);
        assert_eq!(book.net_quantity("BTCUSDT"), dec("2.5"));
        // Zero rows are retained, not dropped
        assert_eq!(book.len(), 2);

        book.apply_snapshot(&[row("ETHUSDT", "-1")], []);
        assert_eq!(book.net_quantity("BTCUSDT"), Decimal::ZERO);
        assert_eq!(book.net_quantity("ETHUSDT"), dec("-1"));
        assert_eq!(book.len(), 1);
    }

    #[test]
    fn snapshot_seeds_zero_rows_for_target_symbols() {
        let book = PositionBook::new();
        book.apply_snapshot(&[row("BTCUSDT", "1")], ["APRUSDT", "BTCUSDT"]);

        assert_eq!(book.len(), 2);
        assert_eq!(book.net_quantity("APRUSDT"), Decimal::ZERO);
        assert_eq!(book.net_quantity("BTCUSDT"), dec("1"));
    }

    #[test]
    fn upsert_overwrites_quantities() {
        let book = PositionBook::new();
        book.upsert(&row("BTCUSDT", "1"));
        book.upsert(&row("BTCUSDT", "-0.5"));
        assert_eq!(book.net_quantity("BTCUSDT"), dec("-0.5"));
    }

    #[test]
    fn unknown_symbol_reads_flat() {
        let book = PositionBook::new();
        let position = book.get("SOLUSDT");
        assert_eq!(position.net_quantity, Decimal::ZERO);
        // Reads do not create rows
        assert!(book.is_empty());
    }
}
