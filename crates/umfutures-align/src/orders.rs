/*
[INPUT]:  Local order intents, lifecycle events mapped from venue reports
[OUTPUT]: Tracked order records, duplicate suppression, timeout sweeps
[POS]:    State layer - order lifecycle and fill accounting
[UPDATE]: When the transition table or supervision timeouts change
*/

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rust_decimal::Decimal;
use thiserror::Error;
use tokio::time::Instant;
use tracing::warn;
use uuid::Uuid;

use umfutures_adapter::Side;

use crate::config::OrderConfig;

/// Order lifecycle states. The active set can still receive events; the
/// terminal set is retained for duplicate suppression until reaped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OrderState {
    Created,
    PendingSubmit,
    Submitted,
    Acknowledged,
    PartiallyFilled,
    Filled,
    PendingCancel,
    Cancelled,
    Rejected,
    Expired,
    Error,
}

impl OrderState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OrderState::Filled
                | OrderState::Cancelled
                | OrderState::Rejected
                | OrderState::Expired
                | OrderState::Error
        )
    }

    pub fn is_active(self) -> bool {
        matches!(
            self,
            OrderState::PendingSubmit
                | OrderState::Submitted
                | OrderState::Acknowledged
                | OrderState::PartiallyFilled
                | OrderState::PendingCancel
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            OrderState::Created => "Created",
            OrderState::PendingSubmit => "PendingSubmit",
            OrderState::Submitted => "Submitted",
            OrderState::Acknowledged => "Acknowledged",
            OrderState::PartiallyFilled => "PartiallyFilled",
            OrderState::Filled => "Filled",
            OrderState::PendingCancel => "PendingCancel",
            OrderState::Cancelled => "Cancelled",
            OrderState::Rejected => "Rejected",
            OrderState::Expired => "Expired",
            OrderState::Error => "Error",
        }
    }
}

/// Events that drive the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderEvent {
    Submit,
    Acknowledge,
    PartialFill,
    Fill,
    CancelRequest,
    CancelConfirm,
    Reject,
    Expire,
    ErrorOccurred,
}

impl OrderEvent {
    fn target_state(self) -> OrderState {
        match self {
            OrderEvent::Submit => OrderState::PendingSubmit,
            OrderEvent::Acknowledge => OrderState::Submitted,
            OrderEvent::PartialFill => OrderState::PartiallyFilled,
            OrderEvent::Fill => OrderState::Filled,
            OrderEvent::CancelRequest => OrderState::PendingCancel,
            OrderEvent::CancelConfirm => OrderState::Cancelled,
            OrderEvent::Reject => OrderState::Rejected,
            OrderEvent::Expire => OrderState::Expired,
            OrderEvent::ErrorOccurred => OrderState::Error,
        }
    }
}

/// Only the listed transitions are legal; everything else is rejected with
/// `OrderError::InvalidTransition` and leaves the record untouched.
pub fn transition_allowed(from: OrderState, to: OrderState) -> bool {
    use OrderState::*;
    match from {
        Created => matches!(to, PendingSubmit | Error),
        PendingSubmit => matches!(to, Submitted | Rejected | Expired | Error),
        Submitted => matches!(
            to,
            Acknowledged | PartiallyFilled | Filled | PendingCancel | Cancelled | Rejected | Expired | Error
        ),
        Acknowledged => matches!(
            to,
            PartiallyFilled | Filled | PendingCancel | Cancelled | Expired | Error
        ),
        PartiallyFilled => matches!(to, Filled | PendingCancel | Cancelled | Expired | Error),
        PendingCancel => matches!(to, Cancelled | Filled | Error),
        Filled | Cancelled | Rejected | Expired | Error => false,
    }
}

/// One submitted order. `client_order_id` is what the venue sees and equals
/// the locally generated `order_id`.
#[derive(Debug, Clone)]
pub struct OrderRecord {
    pub order_id: String,
    pub client_order_id: String,
    pub exchange_order_id: Option<String>,
    pub symbol: String,
    pub side: Side,
    pub quantity: Decimal,
    pub price: Decimal,
    pub filled_quantity: Decimal,
    pub average_price: Decimal,
    pub state: OrderState,
    pub previous_state: OrderState,
    pub create_time: Instant,
    pub state_change_time: Instant,
    pub last_update_time: Instant,
    pub submit_timeout: Duration,
    pub cancel_timeout: Duration,
    pub retry_count: u32,
    pub state_change_count: u32,
    pub last_error_message: Option<String>,
    pub strategy_tag: String,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum OrderError {
    #[error("unknown order {order_id}")]
    UnknownOrder { order_id: String },

    #[error("invalid transition for {order_id}: {from} -> {to}")]
    InvalidTransition {
        order_id: String,
        from: &'static str,
        to: &'static str,
    },
}

/// Listener invoked on every state change, outside the orders lock. A
/// panicking listener is contained and logged; the transition stands.
pub type StateChangeListener = Arc<dyn Fn(&OrderRecord, OrderState, OrderState) + Send + Sync>;

/// Order state machine guarding all records behind a single mutex.
pub struct OrderStateMachine {
    orders: Mutex<HashMap<String, OrderRecord>>,
    listener: Mutex<Option<StateChangeListener>>,
    config: OrderConfig,
}

impl OrderStateMachine {
    pub fn new(config: OrderConfig) -> Self {
        Self {
            orders: Mutex::new(HashMap::new()),
            listener: Mutex::new(None),
            config,
        }
    }

    pub fn set_listener(&self, listener: StateChangeListener) {
        *self.listener.lock().expect("listener lock") = Some(listener);
    }

    /// Create a new order in `Created` state and return its id.
    pub fn create_order(
        &self,
        symbol: &str,
        side: Side,
        quantity: Decimal,
        price: Decimal,
        strategy_tag: &str,
    ) -> String {
        let order_id = format!("UMF{}", Uuid::new_v4().simple());
        let now = Instant::now();

        let record = OrderRecord {
            order_id: order_id.clone(),
            client_order_id: order_id.clone(),
            exchange_order_id: None,
            symbol: symbol.to_string(),
            side,
            quantity,
            price,
            filled_quantity: Decimal::ZERO,
            average_price: Decimal::ZERO,
            state: OrderState::Created,
            previous_state: OrderState::Created,
            create_time: now,
            state_change_time: now,
            last_update_time: now,
            submit_timeout: self.config.submit_timeout(),
            cancel_timeout: self.config.cancel_timeout(),
            retry_count: 0,
            state_change_count: 0,
            last_error_message: None,
            strategy_tag: strategy_tag.to_string(),
        };

        let mut orders = self.orders.lock().expect("orders lock");
        orders.insert(order_id.clone(), record);
        order_id
    }

    /// Apply a lifecycle event. The exchange order id is stored on
    /// acknowledge; an error message (reject/error paths) is recorded on the
    /// record before the transition fires.
    pub fn process_event(
        &self,
        order_id: &str,
        event: OrderEvent,
        exchange_order_id: Option<&str>,
        error_message: Option<&str>,
    ) -> Result<OrderState, OrderError> {
        let (record, old_state, new_state) = {
            let mut orders = self.orders.lock().expect("orders lock");
            let record = orders
                .get_mut(order_id)
                .ok_or_else(|| OrderError::UnknownOrder {
                    order_id: order_id.to_string(),
                })?;

            let from = record.state;
            let to = event.target_state();
            if !transition_allowed(from, to) {
                return Err(OrderError::InvalidTransition {
                    order_id: order_id.to_string(),
                    from: from.name(),
                    to: to.name(),
                });
            }

            if let Some(exchange_id) = exchange_order_id {
                if !exchange_id.is_empty() {
                    record.exchange_order_id = Some(exchange_id.to_string());
                }
            }
            if let Some(message) = error_message {
                record.last_error_message = Some(message.to_string());
            }
            if event == OrderEvent::Expire {
                record.retry_count += 1;
            }

            Self::change_state(record, to);
            (record.clone(), from, to)
        };

        self.notify_listener(&record, old_state, new_state);
        Ok(new_state)
    }

    /// Update fill accounting and emit the matching fill event. The filled
    /// quantity never exceeds the order quantity.
    pub fn update_fill(
        &self,
        order_id: &str,
        filled_qty: Decimal,
        avg_price: Decimal,
    ) -> Result<OrderState, OrderError> {
        let fully_filled = {
            let mut orders = self.orders.lock().expect("orders lock");
            let record = orders
                .get_mut(order_id)
                .ok_or_else(|| OrderError::UnknownOrder {
                    order_id: order_id.to_string(),
                })?;

            record.filled_quantity = filled_qty.min(record.quantity);
            if avg_price > Decimal::ZERO {
                record.average_price = avg_price;
            }
            record.last_update_time = Instant::now();
            record.filled_quantity >= record.quantity
        };

        let event = if fully_filled {
            OrderEvent::Fill
        } else {
            OrderEvent::PartialFill
        };
        self.process_event(order_id, event, None, None)
    }

    pub fn get(&self, order_id: &str) -> Option<OrderRecord> {
        self.orders.lock().expect("orders lock").get(order_id).cloned()
    }

    pub fn active_orders(&self) -> Vec<OrderRecord> {
        self.orders
            .lock()
            .expect("orders lock")
            .values()
            .filter(|record| record.state.is_active())
            .cloned()
            .collect()
    }

    /// True when any record for the symbol is still in an active state.
    pub fn has_active_for_symbol(&self, symbol: &str) -> bool {
        self.orders
            .lock()
            .expect("orders lock")
            .values()
            .any(|record| record.symbol == symbol && record.state.is_active())
    }

    /// Duplicate suppression: an active record matching on symbol, side,
    /// quantity and price within the configured tolerance.
    pub fn has_pending_order(
        &self,
        symbol: &str,
        side: Side,
        quantity: Decimal,
        price: Decimal,
    ) -> bool {
        let tolerance = self.config.duplicate_tolerance;
        self.orders
            .lock()
            .expect("orders lock")
            .values()
            .any(|record| {
                record.state.is_active()
                    && record.symbol == symbol
                    && record.side == side
                    && (record.quantity - quantity).abs() <= tolerance
                    && (record.price - price).abs() <= tolerance
            })
    }

    /// Recent-fill suppression: a Filled/PartiallyFilled record matching on
    /// the same keys whose last state change is inside the window.
    pub fn has_recent_executed_order(
        &self,
        symbol: &str,
        side: Side,
        quantity: Decimal,
        price: Decimal,
    ) -> bool {
        let tolerance = self.config.duplicate_tolerance;
        let window = self.config.recent_fill_window();
        let now = Instant::now();
        self.orders
            .lock()
            .expect("orders lock")
            .values()
            .any(|record| {
                matches!(record.state, OrderState::Filled | OrderState::PartiallyFilled)
                    && record.symbol == symbol
                    && record.side == side
                    && (record.quantity - quantity).abs() <= tolerance
                    && (record.price - price).abs() <= tolerance
                    && now.saturating_duration_since(record.state_change_time) <= window
            })
    }

    /// Janitor body: expire stale PendingSubmit records, error out stale
    /// PendingCancel records, reap terminal records past retention. Returns
    /// the transitions applied so the caller can log and react.
    pub fn sweep(&self, now: Instant) -> Vec<(String, OrderEvent)> {
        let mut transitions = Vec::new();
        let mut reaped = 0usize;

        {
            let mut orders = self.orders.lock().expect("orders lock");
            let retention = self.config.retention();

            for record in orders.values() {
                let age = now.saturating_duration_since(record.state_change_time);
                match record.state {
                    OrderState::PendingSubmit if age > record.submit_timeout => {
                        transitions.push((record.order_id.clone(), OrderEvent::Expire));
                    }
                    OrderState::PendingCancel if age > record.cancel_timeout => {
                        transitions.push((record.order_id.clone(), OrderEvent::ErrorOccurred));
                    }
                    _ => {}
                }
            }

            orders.retain(|_, record| {
                let expired = record.state.is_terminal()
                    && now.saturating_duration_since(record.state_change_time) > retention;
                if expired {
                    reaped += 1;
                }
                !expired
            });
        }

        if reaped > 0 {
            warn!(count = reaped, "reaped terminal orders past retention");
        }

        for (order_id, event) in &transitions {
            let message = match event {
                OrderEvent::ErrorOccurred => Some("cancel timeout"),
                _ => None,
            };
            if let Err(err) = self.process_event(order_id, *event, None, message) {
                warn!(%order_id, error = %err, "sweep transition failed");
            }
        }

        transitions
    }

    fn change_state(record: &mut OrderRecord, new_state: OrderState) {
        let now = Instant::now();
        record.previous_state = record.state;
        record.state = new_state;
        record.state_change_time = now;
        record.last_update_time = now;
        record.state_change_count += 1;
    }

    fn notify_listener(&self, record: &OrderRecord, old_state: OrderState, new_state: OrderState) {
        let listener = self.listener.lock().expect("listener lock").clone();
        if let Some(listener) = listener {
            let result = catch_unwind(AssertUnwindSafe(|| {
                listener(record, old_state, new_state);
            }));
            if result.is_err() {
                warn!(
                    order_id = %record.order_id,
                    from = old_state.name(),
                    to = new_state.name(),
                    "order state listener panicked"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::str::FromStr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn dec(value: &str) -> Decimal {
        Decimal::from_str(value).expect("valid decimal")
    }

    fn machine() -> OrderStateMachine {
        OrderStateMachine::new(OrderConfig::default())
    }

    fn submitted_order(osm: &OrderStateMachine, symbol: &str, qty: &str, price: &str) -> String {
        let order_id = osm.create_order(symbol, Side::Buy, dec(qty), dec(price), "align");
        osm.process_event(&order_id, OrderEvent::Submit, None, None).unwrap();
        osm.process_event(&order_id, OrderEvent::Acknowledge, Some("ex-1"), None)
            .unwrap();
        order_id
    }

    #[rstest]
    #[case(OrderState::Created, OrderState::PendingSubmit, true)]
    #[case(OrderState::Created, OrderState::Submitted, false)]
    #[case(OrderState::Created, OrderState::Filled, false)]
    #[case(OrderState::PendingSubmit, OrderState::Submitted, true)]
    #[case(OrderState::PendingSubmit, OrderState::Rejected, true)]
    #[case(OrderState::PendingSubmit, OrderState::Filled, false)]
    #[case(OrderState::PendingSubmit, OrderState::Cancelled, false)]
    #[case(OrderState::Submitted, OrderState::Acknowledged, true)]
    #[case(OrderState::Submitted, OrderState::Filled, true)]
    #[case(OrderState::Submitted, OrderState::Cancelled, true)]
    #[case(OrderState::Acknowledged, OrderState::PartiallyFilled, true)]
    #[case(OrderState::Acknowledged, OrderState::Rejected, false)]
    #[case(OrderState::PartiallyFilled, OrderState::Filled, true)]
    #[case(OrderState::PartiallyFilled, OrderState::Submitted, false)]
    #[case(OrderState::PendingCancel, OrderState::Cancelled, true)]
    #[case(OrderState::PendingCancel, OrderState::Filled, true)]
    #[case(OrderState::PendingCancel, OrderState::Expired, false)]
    #[case(OrderState::Filled, OrderState::Cancelled, false)]
    #[case(OrderState::Rejected, OrderState::Error, false)]
    #[case(OrderState::Error, OrderState::PendingSubmit, false)]
    fn transition_table(
        #[case] from: OrderState,
        #[case] to: OrderState,
        #[case] allowed: bool,
    ) {
        assert_eq!(transition_allowed(from, to), allowed);
    }

    #[test]
    fn lifecycle_happy_path() {
        let osm = machine();
        let order_id = osm.create_order("BTCUSDT", Side::Buy, dec("1"), dec("100"), "align");

        osm.process_event(&order_id, OrderEvent::Submit, None, None).unwrap();
        osm.process_event(&order_id, OrderEvent::Acknowledge, Some("ex-9"), None)
            .unwrap();

        let state = osm.update_fill(&order_id, dec("1"), dec("100.5")).unwrap();
        assert_eq!(state, OrderState::Filled);

        let record = osm.get(&order_id).unwrap();
        assert_eq!(record.exchange_order_id.as_deref(), Some("ex-9"));
        assert_eq!(record.filled_quantity, dec("1"));
        assert_eq!(record.average_price, dec("100.5"));
        assert_eq!(record.previous_state, OrderState::Submitted);
        assert_eq!(record.state_change_count, 3);
    }

    #[test]
    fn invalid_transition_is_rejected_and_state_kept() {
        let osm = machine();
        let order_id = osm.create_order("BTCUSDT", Side::Buy, dec("1"), dec("100"), "align");

        let err = osm
            .process_event(&order_id, OrderEvent::Fill, None, None)
            .unwrap_err();
        assert!(matches!(err, OrderError::InvalidTransition { .. }));
        assert_eq!(osm.get(&order_id).unwrap().state, OrderState::Created);
    }

    #[test]
    fn fill_is_clamped_to_order_quantity() {
        let osm = machine();
        let order_id = submitted_order(&osm, "BTCUSDT", "2", "100");

        let state = osm.update_fill(&order_id, dec("5"), dec("100")).unwrap();
        assert_eq!(state, OrderState::Filled);
        assert_eq!(osm.get(&order_id).unwrap().filled_quantity, dec("2"));
    }

    #[test]
    fn partial_fill_keeps_order_active() {
        let osm = machine();
        let order_id = submitted_order(&osm, "BTCUSDT", "10", "100");

        let state = osm.update_fill(&order_id, dec("4"), dec("100")).unwrap();
        assert_eq!(state, OrderState::PartiallyFilled);
        assert!(osm.has_active_for_symbol("BTCUSDT"));

        let state = osm.update_fill(&order_id, dec("10"), dec("100")).unwrap();
        assert_eq!(state, OrderState::Filled);
        assert!(!osm.has_active_for_symbol("BTCUSDT"));
    }

    #[test]
    fn pending_duplicate_detection_respects_tolerance() {
        let osm = machine();
        submitted_order(&osm, "BTCUSDT", "1.5", "100");

        assert!(osm.has_pending_order("BTCUSDT", Side::Buy, dec("1.5"), dec("100")));
        assert!(osm.has_pending_order("BTCUSDT", Side::Buy, dec("1.5000000001"), dec("100")));
        assert!(!osm.has_pending_order("BTCUSDT", Side::Sell, dec("1.5"), dec("100")));
        assert!(!osm.has_pending_order("BTCUSDT", Side::Buy, dec("1.6"), dec("100")));
        assert!(!osm.has_pending_order("ETHUSDT", Side::Buy, dec("1.5"), dec("100")));
    }

    #[test]
    fn recent_executed_detection_matches_filled_orders() {
        let osm = machine();
        let order_id = submitted_order(&osm, "BTCUSDT", "1", "100");
        osm.update_fill(&order_id, dec("1"), dec("100")).unwrap();

        assert!(osm.has_recent_executed_order("BTCUSDT", Side::Buy, dec("1"), dec("100")));
        assert!(!osm.has_recent_executed_order("BTCUSDT", Side::Sell, dec("1"), dec("100")));
        // Pending orders are not "executed"
        submitted_order(&osm, "ETHUSDT", "2", "50");
        assert!(!osm.has_recent_executed_order("ETHUSDT", Side::Buy, dec("2"), dec("50")));
    }

    #[test]
    fn sweep_expires_stale_pending_submit() {
        let osm = machine();
        let order_id = osm.create_order("BTCUSDT", Side::Buy, dec("1"), dec("100"), "align");
        osm.process_event(&order_id, OrderEvent::Submit, None, None).unwrap();

        // Young order: untouched
        assert!(osm.sweep(Instant::now()).is_empty());
        assert_eq!(osm.get(&order_id).unwrap().state, OrderState::PendingSubmit);

        let transitions = osm.sweep(Instant::now() + Duration::from_secs(6));
        assert_eq!(transitions.len(), 1);
        assert_eq!(transitions[0].1, OrderEvent::Expire);

        let record = osm.get(&order_id).unwrap();
        assert_eq!(record.state, OrderState::Expired);
        assert_eq!(record.retry_count, 1);
    }

    #[test]
    fn sweep_errors_stale_pending_cancel() {
        let osm = machine();
        let order_id = submitted_order(&osm, "BTCUSDT", "1", "100");
        osm.process_event(&order_id, OrderEvent::CancelRequest, None, None)
            .unwrap();

        let transitions = osm.sweep(Instant::now() + Duration::from_secs(4));
        assert_eq!(transitions.len(), 1);

        let record = osm.get(&order_id).unwrap();
        assert_eq!(record.state, OrderState::Error);
        assert_eq!(record.last_error_message.as_deref(), Some("cancel timeout"));
    }

    #[test]
    fn sweep_reaps_terminal_orders_past_retention() {
        let osm = machine();
        let order_id = submitted_order(&osm, "BTCUSDT", "1", "100");
        osm.update_fill(&order_id, dec("1"), dec("100")).unwrap();

        osm.sweep(Instant::now() + Duration::from_secs(23 * 3600));
        assert!(osm.get(&order_id).is_some());

        osm.sweep(Instant::now() + Duration::from_secs(25 * 3600));
        assert!(osm.get(&order_id).is_none());
    }

    #[test]
    fn listener_fires_on_every_transition() {
        let osm = machine();
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        osm.set_listener(Arc::new(move |_, _, _| {
            seen.fetch_add(1, Ordering::SeqCst);
        }));

        let order_id = submitted_order(&osm, "BTCUSDT", "1", "100");
        osm.update_fill(&order_id, dec("1"), dec("100")).unwrap();

        // Submit, Acknowledge, Fill
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn panicking_listener_does_not_abort_the_transition() {
        let osm = machine();
        osm.set_listener(Arc::new(|_, _, _| panic!("listener bug")));

        let order_id = osm.create_order("BTCUSDT", Side::Buy, dec("1"), dec("100"), "align");
        let state = osm.process_event(&order_id, OrderEvent::Submit, None, None).unwrap();
        assert_eq!(state, OrderState::PendingSubmit);
    }
}
