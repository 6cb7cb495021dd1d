/*
[INPUT]:  Depth-stream events (level 0 only)
[OUTPUT]: Latest best bid/ask per symbol with an update timestamp
[POS]:    Data layer - market data cache (no trading logic)
[UPDATE]: When staleness policy or depth handling changes
*/

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use rust_decimal::Decimal;

use umfutures_adapter::BookTop;

#[derive(Debug, Clone)]
struct Entry {
    top: BookTop,
    updated_at: Instant,
}

/// Per-symbol top-of-book cache fed from depth callbacks. Staleness is a
/// caller decision; the cache only records when an entry last changed.
#[derive(Debug, Default)]
pub struct TopOfBook {
    entries: Mutex<HashMap<String, Entry>>,
}

impl TopOfBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&self, top: BookTop) {
        let mut entries = self.entries.lock().expect("book lock");
        entries.insert(
            top.symbol.clone(),
            Entry {
                top,
                updated_at: Instant::now(),
            },
        );
    }

    pub fn get(&self, symbol: &str) -> Option<BookTop> {
        let entries = self.entries.lock().expect("book lock");
        entries.get(symbol).map(|entry| entry.top.clone())
    }

    /// A book with both sides priced; missing or one-sided books are
    /// unusable for planning.
    pub fn get_priced(&self, symbol: &str) -> Option<BookTop> {
        self.get(symbol).filter(|top| {
            top.bid_price > Decimal::ZERO && top.ask_price > Decimal::ZERO
        })
    }

    pub fn is_stale(&self, symbol: &str, max_age: Duration) -> bool {
        let entries = self.entries.lock().expect("book lock");
        match entries.get(symbol) {
            Some(entry) => entry.updated_at.elapsed() > max_age,
            None => true,
        }
    }
}
