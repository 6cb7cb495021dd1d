/*
[INPUT]:  Signed net adjustments from the planner, slice fill/failure events
[OUTPUT]: Time-sliced order plans with unfilled-quantity compensation
[POS]:    Execution layer - TWAP slicing state (timers live in the engine)
[UPDATE]: When slice sizing, compensation or completion guarantees change
*/

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use tracing::{debug, info};

use umfutures_adapter::Side;

/// Fraction of the total adjustment a single slice may not exceed.
const MAX_SLICE_FRACTION: &str = "0.4";

/// One slicing job. `remaining_quantity` is the submission budget not yet
/// carved into a slice; `unfilled_pool` accumulates quantity that failed to
/// execute in earlier slices and rides along on the next one.
#[derive(Debug, Clone)]
pub struct TwapExecution {
    pub symbol: String,
    pub side: Side,
    pub total_quantity: Decimal,
    pub remaining_quantity: Decimal,
    pub unfilled_pool: Decimal,
    pub base_slice: Decimal,
    pub slice_count: u32,
    pub current_slice_index: u32,
    pub slice_interval: Duration,
    pub target_price_hint: Decimal,
    pub pending_orders: HashMap<String, Decimal>,
    pub is_active: bool,
    pub is_final_slice: bool,
}

impl TwapExecution {
    fn settle_if_done(&mut self) {
        if self.is_active
            && self.remaining_quantity.is_zero()
            && self.unfilled_pool.is_zero()
            && self.pending_orders.is_empty()
        {
            self.is_active = false;
            info!(symbol = %self.symbol, "twap execution completed");
        }
    }
}

/// What the engine should submit next for an execution.
#[derive(Debug, Clone, PartialEq)]
pub struct SlicePlan {
    pub symbol: String,
    pub side: Side,
    pub quantity: Decimal,
    pub is_final: bool,
}

/// All TWAP executions, one per symbol, behind a single mutex.
#[derive(Debug, Default)]
pub struct TwapBook {
    executions: Mutex<HashMap<String, TwapExecution>>,
}

impl TwapBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an execution for a signed adjustment and carve its first
    /// slice. Returns `None` when an execution is already active for the
    /// symbol or the adjustment is zero.
    pub fn start(
        &self,
        symbol: &str,
        signed_delta: Decimal,
        price_hint: Decimal,
        min_slice_size: Decimal,
        slice_interval: Duration,
    ) -> Option<SlicePlan> {
        if signed_delta.is_zero() {
            return None;
        }

        let total = signed_delta.abs();
        let side = if signed_delta > Decimal::ZERO {
            Side::Buy
        } else {
            Side::Sell
        };

        let max_fraction: Decimal = MAX_SLICE_FRACTION.parse().expect("valid fraction");
        let base_slice = min_slice_size.min(total * max_fraction);
        if base_slice <= Decimal::ZERO {
            return None;
        }
        let slice_count = (total / base_slice)
            .ceil()
            .to_u32()
            .unwrap_or(u32::MAX)
            .max(1);

        {
            let mut executions = self.executions.lock().expect("twap lock");
            if executions.get(symbol).is_some_and(|exec| exec.is_active) {
                return None;
            }

            executions.insert(
                symbol.to_string(),
                TwapExecution {
                    symbol: symbol.to_string(),
                    side,
                    total_quantity: total,
                    remaining_quantity: total,
                    unfilled_pool: Decimal::ZERO,
                    base_slice,
                    slice_count,
                    current_slice_index: 0,
                    slice_interval,
                    target_price_hint: price_hint,
                    pending_orders: HashMap::new(),
                    is_active: true,
                    is_final_slice: false,
                },
            );
        }

        info!(
            %symbol, %total, %base_slice, slice_count,
            "twap execution created"
        );
        self.carve_slice(symbol)
    }

    /// Carve the next slice out of the submission budget: base size plus the
    /// accumulated unfilled pool, capped at what is left. The final slice
    /// carries everything and zeroes both accumulators up front, so the
    /// alignment loop sees a bounded execution whatever happens to it.
    pub fn carve_slice(&self, symbol: &str) -> Option<SlicePlan> {
        let mut executions = self.executions.lock().expect("twap lock");
        let exec = executions.get_mut(symbol).filter(|exec| exec.is_active)?;

        let is_final = exec.current_slice_index + 1 >= exec.slice_count
            || exec.remaining_quantity <= exec.base_slice;

        let quantity = if is_final {
            let quantity = exec.remaining_quantity + exec.unfilled_pool;
            exec.remaining_quantity = Decimal::ZERO;
            exec.unfilled_pool = Decimal::ZERO;
            exec.is_final_slice = true;
            quantity
        } else {
            // The pool rides on top of the base: that quantity already left
            // the budget when its original slice was carved.
            let new_part = exec.base_slice.min(exec.remaining_quantity);
            let quantity = new_part + exec.unfilled_pool;
            exec.remaining_quantity -= new_part;
            exec.unfilled_pool = Decimal::ZERO;
            quantity
        };

        if quantity <= Decimal::ZERO {
            exec.settle_if_done();
            return None;
        }

        exec.current_slice_index += 1;
        debug!(
            %symbol,
            slice = exec.current_slice_index,
            of = exec.slice_count,
            %quantity,
            is_final,
            "twap slice carved"
        );

        Some(SlicePlan {
            symbol: symbol.to_string(),
            side: exec.side,
            quantity,
            is_final,
        })
    }

    /// Attribute a submitted child order to the execution.
    pub fn record_submission(&self, symbol: &str, order_id: &str, nominal: Decimal) {
        let mut executions = self.executions.lock().expect("twap lock");
        if let Some(exec) = executions.get_mut(symbol) {
            exec.pending_orders.insert(order_id.to_string(), nominal);
        }
    }

    /// Whether the order belongs to the symbol's execution.
    pub fn owns_order(&self, symbol: &str, order_id: &str) -> bool {
        let executions = self.executions.lock().expect("twap lock");
        executions
            .get(symbol)
            .is_some_and(|exec| exec.pending_orders.contains_key(order_id))
    }

    /// Fill accounting for a child order. The executed part is done; any
    /// shortfall against the slice nominal joins the pool for the next
    /// slice. Returns whether the execution is still active.
    pub fn on_order_filled(&self, symbol: &str, order_id: &str, executed: Decimal) -> bool {
        let mut executions = self.executions.lock().expect("twap lock");
        let Some(exec) = executions.get_mut(symbol) else {
            return false;
        };
        let Some(nominal) = exec.pending_orders.remove(order_id) else {
            return exec.is_active;
        };

        if executed < nominal {
            exec.unfilled_pool += nominal - executed;
        }
        exec.settle_if_done();
        exec.is_active
    }

    /// A rejected/cancelled/expired child order returns its whole nominal
    /// to the pool for the next slice.
    pub fn on_order_failed(&self, symbol: &str, order_id: &str) -> bool {
        let mut executions = self.executions.lock().expect("twap lock");
        let Some(exec) = executions.get_mut(symbol) else {
            return false;
        };
        let Some(nominal) = exec.pending_orders.remove(order_id) else {
            return exec.is_active;
        };

        exec.unfilled_pool += nominal;
        debug!(%symbol, %nominal, pool = %exec.unfilled_pool, "failed slice rejoined pool");
        exec.is_active
    }

    /// Return a carved-but-never-submitted slice to the pool (duplicate
    /// suppression or a transient driver failure swallowed it).
    pub fn refund(&self, symbol: &str, quantity: Decimal) {
        let mut executions = self.executions.lock().expect("twap lock");
        if let Some(exec) = executions.get_mut(symbol) {
            if exec.is_active {
                exec.unfilled_pool += quantity;
            }
        }
    }

    /// Watchdog path: mark the execution inactive whatever its state so the
    /// alignment loop cannot stall on a stuck final slice.
    pub fn force_complete(&self, symbol: &str) -> bool {
        let mut executions = self.executions.lock().expect("twap lock");
        let Some(exec) = executions.get_mut(symbol) else {
            return false;
        };
        if !exec.is_active {
            return false;
        }
        exec.is_active = false;
        exec.remaining_quantity = Decimal::ZERO;
        exec.unfilled_pool = Decimal::ZERO;
        true
    }

    pub fn is_active(&self, symbol: &str) -> bool {
        let executions = self.executions.lock().expect("twap lock");
        executions.get(symbol).is_some_and(|exec| exec.is_active)
    }

    pub fn active_symbols(&self) -> Vec<String> {
        let executions = self.executions.lock().expect("twap lock");
        executions
            .values()
            .filter(|exec| exec.is_active)
            .map(|exec| exec.symbol.clone())
            .collect()
    }

    pub fn get(&self, symbol: &str) -> Option<TwapExecution> {
        let executions = self.executions.lock().expect("twap lock");
        executions.get(symbol).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn dec(value: &str) -> Decimal {
        Decimal::from_str(value).expect("valid decimal")
    }

    fn interval() -> Duration {
        Duration::from_secs(3)
    }

    #[test]
    fn start_computes_even_slices() {
        let book = TwapBook::new();
        let plan = book
            .start("BTCUSDT", dec("1000"), dec("100"), dec("100"), interval())
            .unwrap();

        assert_eq!(plan.side, Side::Buy);
        assert_eq!(plan.quantity, dec("100"));
        assert!(!plan.is_final);

        let exec = book.get("BTCUSDT").unwrap();
        assert_eq!(exec.slice_count, 10);
        assert_eq!(exec.base_slice, dec("100"));
        assert_eq!(exec.current_slice_index, 1);
        assert_eq!(exec.remaining_quantity, dec("900"));
    }

    #[test]
    fn first_slice_never_exceeds_forty_percent() {
        let book = TwapBook::new();
        let plan = book
            .start("BTCUSDT", dec("-150"), dec("100"), dec("100"), interval())
            .unwrap();

        assert_eq!(plan.side, Side::Sell);
        // base = min(100, 150 * 0.4) = 60
        assert_eq!(plan.quantity, dec("60"));
        assert_eq!(book.get("BTCUSDT").unwrap().slice_count, 3);
    }

    #[test]
    fn partial_fill_carries_into_next_slice() {
        let book = TwapBook::new();
        let plan = book
            .start("BTCUSDT", dec("1000"), dec("100"), dec("100"), interval())
            .unwrap();
        book.record_submission("BTCUSDT", "order-1", plan.quantity);

        // Slice 1 fills only 60 of 100
        assert!(book.on_order_filled("BTCUSDT", "order-1", dec("60")));

        let exec = book.get("BTCUSDT").unwrap();
        assert_eq!(exec.remaining_quantity, dec("900"));
        assert_eq!(exec.unfilled_pool, dec("40"));

        // Slice 2 carries the 40 on top of its base; only the base part
        // draws down the budget
        let plan = book.carve_slice("BTCUSDT").unwrap();
        assert_eq!(plan.quantity, dec("140"));

        let exec = book.get("BTCUSDT").unwrap();
        assert_eq!(exec.unfilled_pool, Decimal::ZERO);
        assert_eq!(exec.remaining_quantity, dec("800"));
    }

    #[test]
    fn rejected_slice_rejoins_the_pool() {
        let book = TwapBook::new();
        let plan = book
            .start("BTCUSDT", dec("1000"), dec("100"), dec("100"), interval())
            .unwrap();
        book.record_submission("BTCUSDT", "order-1", plan.quantity);

        assert!(book.on_order_failed("BTCUSDT", "order-1"));

        let exec = book.get("BTCUSDT").unwrap();
        assert_eq!(exec.unfilled_pool, dec("100"));
        assert_eq!(exec.remaining_quantity, dec("900"));

        let plan = book.carve_slice("BTCUSDT").unwrap();
        assert_eq!(plan.quantity, dec("200"));
        assert_eq!(book.get("BTCUSDT").unwrap().remaining_quantity, dec("800"));
    }

    #[test]
    fn final_slice_carries_remaining_and_pool() {
        let book = TwapBook::new();
        let plan = book
            .start("BTCUSDT", dec("250"), dec("100"), dec("100"), interval())
            .unwrap();
        // base = min(100, 250*0.4) = 100, 3 slices
        assert_eq!(plan.quantity, dec("100"));
        book.record_submission("BTCUSDT", "order-1", plan.quantity);
        book.on_order_filled("BTCUSDT", "order-1", dec("100"));

        let plan = book.carve_slice("BTCUSDT").unwrap();
        assert_eq!(plan.quantity, dec("100"));
        book.record_submission("BTCUSDT", "order-2", plan.quantity);
        // Partial: 70 executed, 30 pooled
        book.on_order_filled("BTCUSDT", "order-2", dec("70"));

        let exec = book.get("BTCUSDT").unwrap();
        assert_eq!(exec.remaining_quantity, dec("50"));
        assert_eq!(exec.unfilled_pool, dec("30"));

        // Third slice is final: 50 budget + 30 pool
        let plan = book.carve_slice("BTCUSDT").unwrap();
        assert!(plan.is_final);
        assert_eq!(plan.quantity, dec("80"));

        let exec = book.get("BTCUSDT").unwrap();
        assert_eq!(exec.remaining_quantity, Decimal::ZERO);
        assert_eq!(exec.unfilled_pool, Decimal::ZERO);
        assert!(exec.is_final_slice);

        // Filling the final slice settles the execution
        book.record_submission("BTCUSDT", "order-3", plan.quantity);
        assert!(!book.on_order_filled("BTCUSDT", "order-3", dec("80")));
    }

    #[test]
    fn fill_sum_reaches_total_at_quiescence() {
        let book = TwapBook::new();
        let mut filled = Decimal::ZERO;
        let mut plan = book.start("BTCUSDT", dec("300"), dec("100"), dec("100"), interval());

        let mut order_seq = 0;
        while let Some(slice) = plan {
            order_seq += 1;
            let order_id = format!("order-{order_seq}");
            book.record_submission("BTCUSDT", &order_id, slice.quantity);
            filled += slice.quantity;
            let active = book.on_order_filled("BTCUSDT", &order_id, slice.quantity);
            plan = if active { book.carve_slice("BTCUSDT") } else { None };
        }

        assert_eq!(filled, dec("300"));
        assert!(!book.is_active("BTCUSDT"));
    }

    #[test]
    fn executed_sum_reaches_total_despite_partials() {
        let book = TwapBook::new();
        let mut executed_total = Decimal::ZERO;
        let mut plan = book.start("BTCUSDT", dec("1000"), dec("100"), dec("100"), interval());

        let mut order_seq = 0;
        while let Some(slice) = plan {
            order_seq += 1;
            let order_id = format!("order-{order_seq}");
            book.record_submission("BTCUSDT", &order_id, slice.quantity);
            // The very first slice only fills 60; everything else fills whole
            let executed = if order_seq == 1 { dec("60") } else { slice.quantity };
            executed_total += executed;
            let active = book.on_order_filled("BTCUSDT", &order_id, executed);
            plan = if active { book.carve_slice("BTCUSDT") } else { None };
        }

        assert_eq!(executed_total, dec("1000"));
        assert_eq!(order_seq, 10);
        assert!(!book.is_active("BTCUSDT"));
    }

    #[test]
    fn refund_feeds_the_next_slice() {
        let book = TwapBook::new();
        let plan = book
            .start("BTCUSDT", dec("1000"), dec("100"), dec("100"), interval())
            .unwrap();

        // Slice never reached the venue; its quantity comes back whole
        book.refund("BTCUSDT", plan.quantity);
        let plan = book.carve_slice("BTCUSDT").unwrap();
        assert_eq!(plan.quantity, dec("200"));
    }

    #[test]
    fn force_complete_stops_a_stuck_execution() {
        let book = TwapBook::new();
        book.start("BTCUSDT", dec("1000"), dec("100"), dec("100"), interval())
            .unwrap();

        assert!(book.is_active("BTCUSDT"));
        assert!(book.force_complete("BTCUSDT"));
        assert!(!book.is_active("BTCUSDT"));

        let exec = book.get("BTCUSDT").unwrap();
        assert_eq!(exec.remaining_quantity, Decimal::ZERO);
        assert_eq!(exec.unfilled_pool, Decimal::ZERO);

        // Already inactive: a second force is a no-op
        assert!(!book.force_complete("BTCUSDT"));
    }

    #[test]
    fn second_start_on_active_symbol_is_refused() {
        let book = TwapBook::new();
        assert!(
            book.start("BTCUSDT", dec("1000"), dec("100"), dec("100"), interval())
                .is_some()
        );
        assert!(
            book.start("BTCUSDT", dec("500"), dec("100"), dec("100"), interval())
                .is_none()
        );
    }
}
