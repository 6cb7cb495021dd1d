/*
[INPUT]:  OrderRequest/CancelRequest submissions + scripted fill behavior
[OUTPUT]: DriverEvents mimicking a single-position-mode futures venue
[POS]:    Test/paper layer - in-process venue behind the ExchangeDriver trait
[UPDATE]: When the driver trait or the scripted behaviors change
*/

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use rust_decimal::Decimal;
use tracing::debug;

use crate::driver::{DriverEvent, EventSender, ExchangeDriver};
use crate::error::{DriverError, Result};
use crate::types::{
    AccountInfoResponse, AccountPosition, BookTop, CancelRequest, OrderRequest, OrderResponse,
    OrderStatus, PositionSide, Side,
};

/// How the simulated venue answers the next order on a symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillMode {
    /// Acknowledge, fill the whole quantity, report FILLED.
    Fill,
    /// Acknowledge, fill a fraction (numerator/denominator applied to the
    /// order quantity), report PARTIALLY_FILLED. The remainder lapses, as a
    /// market order against thin liquidity would.
    Partial(u32, u32),
    /// Report REJECTED; the position does not move.
    Reject,
    /// Swallow the order entirely: no response, no position change.
    Ignore,
    /// Fill the position but only report NEW - the fill report is lost.
    Mute,
    /// Reply with an all-blank order response, the wire layer's shape for
    /// a failed submission.
    Empty,
}

#[derive(Debug, Default)]
struct SimState {
    positions: HashMap<String, Decimal>,
    books: HashMap<String, BookTop>,
    scripts: HashMap<String, VecDeque<FillMode>>,
    submitted: Vec<OrderRequest>,
    subscriptions: HashSet<String>,
}

/// In-process venue used by the integration tests and the binary's paper
/// mode. Behavior is scripted per symbol; unscripted orders fill in full.
pub struct SimExchange {
    state: Mutex<SimState>,
    events: EventSender,
}

impl SimExchange {
    pub fn new(events: EventSender) -> Self {
        Self {
            state: Mutex::new(SimState::default()),
            events,
        }
    }

    /// Seed a net position before the engine starts.
    pub fn set_position(&self, symbol: &str, quantity: Decimal) {
        let mut state = self.state.lock().expect("sim state lock");
        state.positions.insert(symbol.to_string(), quantity);
    }

    /// Seed the book used for fill prices and depth events.
    pub fn set_book(&self, symbol: &str, bid: Decimal, ask: Decimal) {
        let top = BookTop {
            symbol: symbol.to_string(),
            bid_price: bid,
            ask_price: ask,
            bid_qty: Decimal::from(1_000),
            ask_qty: Decimal::from(1_000),
        };
        let mut state = self.state.lock().expect("sim state lock");
        state.books.insert(symbol.to_string(), top);
    }

    /// Queue fill behaviors for the next orders on a symbol, consumed in
    /// submission order. Once the script runs dry, orders fill in full.
    pub fn script_fills(&self, symbol: &str, modes: impl IntoIterator<Item = FillMode>) {
        let mut state = self.state.lock().expect("sim state lock");
        state
            .scripts
            .entry(symbol.to_string())
            .or_default()
            .extend(modes);
    }

    /// Every order request the engine has submitted, in order.
    pub fn submitted_orders(&self) -> Vec<OrderRequest> {
        self.state.lock().expect("sim state lock").submitted.clone()
    }

    /// Current net position on the simulated account.
    pub fn position(&self, symbol: &str) -> Decimal {
        self.state
            .lock()
            .expect("sim state lock")
            .positions
            .get(symbol)
            .copied()
            .unwrap_or(Decimal::ZERO)
    }

    /// Push a fresh top-of-book through the depth stream.
    pub fn push_book(&self, symbol: &str, bid: Decimal, ask: Decimal) {
        self.set_book(symbol, bid, ask);
        let top = {
            let state = self.state.lock().expect("sim state lock");
            state.books.get(symbol).cloned()
        };
        if let Some(top) = top {
            let _ = self.events.send(DriverEvent::Depth(top));
        }
    }

    fn send(&self, event: DriverEvent) {
        // The receiver dropping just means the engine is gone.
        let _ = self.events.send(event);
    }

    fn fill_price(state: &SimState, symbol: &str, side: Side) -> Decimal {
        match state.books.get(symbol) {
            Some(top) => match side {
                Side::Buy => top.ask_price,
                Side::Sell => top.bid_price,
            },
            None => Decimal::ONE,
        }
    }

    fn apply_fill(state: &mut SimState, req: &OrderRequest, quantity: Decimal) -> Decimal {
        let current = state
            .positions
            .get(&req.symbol)
            .copied()
            .unwrap_or(Decimal::ZERO);

        let mut executable = quantity;
        if req.reduce_only {
            // reduce_only never increases absolute exposure.
            let closable = match req.side {
                Side::Buy if current < Decimal::ZERO => current.abs(),
                Side::Sell if current > Decimal::ZERO => current,
                _ => Decimal::ZERO,
            };
            executable = executable.min(closable);
        }

        let delta = match req.side {
            Side::Buy => executable,
            Side::Sell => -executable,
        };
        state.positions.insert(req.symbol.clone(), current + delta);
        executable
    }

    fn order_response(req: &OrderRequest, status: OrderStatus, executed: Decimal, price: Decimal) -> OrderResponse {
        OrderResponse {
            client_order_id: req.client_order_id.clone(),
            exchange_order_id: format!("sim-{}", req.client_order_id),
            symbol: req.symbol.clone(),
            side: req.side.to_string(),
            orig_qty: req.quantity.to_string(),
            executed_qty: executed.to_string(),
            avg_price: price.to_string(),
            status: Some(status),
            error_code: None,
            error_message: None,
        }
    }

    fn account_update(symbol: &str, quantity: Decimal) -> AccountPosition {
        AccountPosition {
            symbol: symbol.to_string(),
            position_side: PositionSide::Both,
            position_amount: quantity,
            entry_price: Decimal::ZERO,
            unrealized_pnl: Decimal::ZERO,
        }
    }
}

#[async_trait]
impl ExchangeDriver for SimExchange {
    async fn submit_order(&self, req: OrderRequest) -> Result<()> {
        let mode;
        let price;
        {
            let mut state = self.state.lock().expect("sim state lock");
            state.submitted.push(req.clone());
            mode = state
                .scripts
                .get_mut(&req.symbol)
                .and_then(|queue| queue.pop_front())
                .unwrap_or(FillMode::Fill);
            price = Self::fill_price(&state, &req.symbol, req.side);
        }

        debug!(symbol = %req.symbol, side = %req.side, quantity = %req.quantity, ?mode, "sim order");

        match mode {
            FillMode::Fill => {
                self.send(DriverEvent::Order(Self::order_response(
                    &req,
                    OrderStatus::New,
                    Decimal::ZERO,
                    Decimal::ZERO,
                )));
                let (executed, position) = {
                    let mut state = self.state.lock().expect("sim state lock");
                    let executed = Self::apply_fill(&mut state, &req, req.quantity);
                    let position = state.positions[&req.symbol];
                    (executed, position)
                };
                self.send(DriverEvent::Order(Self::order_response(
                    &req,
                    OrderStatus::Filled,
                    executed,
                    price,
                )));
                self.send(DriverEvent::AccountUpdate(vec![Self::account_update(
                    &req.symbol,
                    position,
                )]));
            }
            FillMode::Partial(numerator, denominator) => {
                self.send(DriverEvent::Order(Self::order_response(
                    &req,
                    OrderStatus::New,
                    Decimal::ZERO,
                    Decimal::ZERO,
                )));
                let fraction = Decimal::from(numerator) / Decimal::from(denominator.max(1));
                let target = req.quantity * fraction;
                let (executed, position) = {
                    let mut state = self.state.lock().expect("sim state lock");
                    let executed = Self::apply_fill(&mut state, &req, target);
                    let position = state.positions[&req.symbol];
                    (executed, position)
                };
                self.send(DriverEvent::Order(Self::order_response(
                    &req,
                    OrderStatus::PartiallyFilled,
                    executed,
                    price,
                )));
                self.send(DriverEvent::AccountUpdate(vec![Self::account_update(
                    &req.symbol,
                    position,
                )]));
            }
            FillMode::Reject => {
                let mut resp = Self::order_response(
                    &req,
                    OrderStatus::Rejected,
                    Decimal::ZERO,
                    Decimal::ZERO,
                );
                resp.error_code = Some(-2019);
                resp.error_message = Some("margin is insufficient".to_string());
                self.send(DriverEvent::Order(resp));
            }
            FillMode::Ignore => {}
            FillMode::Empty => {
                self.send(DriverEvent::Order(OrderResponse::default()));
            }
            FillMode::Mute => {
                self.send(DriverEvent::Order(Self::order_response(
                    &req,
                    OrderStatus::New,
                    Decimal::ZERO,
                    Decimal::ZERO,
                )));
                let mut state = self.state.lock().expect("sim state lock");
                Self::apply_fill(&mut state, &req, req.quantity);
                // Fill report lost on the wire.
            }
        }

        Ok(())
    }

    async fn cancel_order(&self, req: CancelRequest) -> Result<()> {
        let client_order_id = req
            .client_order_id
            .or(req.exchange_order_id)
            .ok_or_else(|| DriverError::InvalidRequest("cancel needs an order id".to_string()))?;

        self.send(DriverEvent::Order(OrderResponse {
            client_order_id,
            status: Some(OrderStatus::Canceled),
            ..OrderResponse::default()
        }));
        Ok(())
    }

    async fn request_account_info(&self) -> Result<()> {
        let positions = {
            let state = self.state.lock().expect("sim state lock");
            state
                .positions
                .iter()
                .map(|(symbol, quantity)| Self::account_update(symbol, *quantity))
                .collect()
        };
        self.send(DriverEvent::AccountInfo(AccountInfoResponse { positions }));
        Ok(())
    }

    async fn request_account_balance(&self) -> Result<()> {
        // Balances are not modelled by the simulated account.
        Ok(())
    }

    async fn request_position_info(&self) -> Result<()> {
        let rows: Vec<AccountPosition> = {
            let state = self.state.lock().expect("sim state lock");
            state
                .positions
                .iter()
                .map(|(symbol, quantity)| Self::account_update(symbol, *quantity))
                .collect()
        };
        for row in rows {
            self.send(DriverEvent::PositionUpdate(row));
        }
        Ok(())
    }

    async fn subscribe_depth(&self, symbol: &str, _levels: u32, _update_speed_ms: u32) -> Result<()> {
        let top = {
            let mut state = self.state.lock().expect("sim state lock");
            state.subscriptions.insert(symbol.to_string());
            state.books.get(symbol).cloned()
        };
        // Seeded books replay immediately so a fresh subscriber sees a top.
        if let Some(top) = top {
            self.send(DriverEvent::Depth(top));
        }
        Ok(())
    }

    async fn unsubscribe_depth(&self, symbol: &str) -> Result<()> {
        let mut state = self.state.lock().expect("sim state lock");
        state.subscriptions.remove(symbol);
        Ok(())
    }
}
