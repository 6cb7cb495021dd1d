/*
[INPUT]:  Target-file state, driver events, timers
[OUTPUT]: Alignment cycles: plan -> submit -> wait -> verify -> report
[POS]:    Orchestration layer - controller, dispatcher and worker tasks
[UPDATE]: When cycle semantics, worker topology or shutdown change
*/

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Result, anyhow};
use rust_decimal::Decimal;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use umfutures_adapter::{
    DriverEvent, ExchangeDriver, OrderRequest, OrderResponse, OrderStatus, Side,
};

use crate::book::TopOfBook;
use crate::config::GatewayConfig;
use crate::feedback::FeedbackWriter;
use crate::orders::{OrderEvent, OrderState, OrderStateMachine};
use crate::planner::{Decision, PlannerConfig, SkipReason, dynamic_tolerance, plan_symbol};
use crate::positions::PositionBook;
use crate::rules::RuleTable;
use crate::sync::Gate;
use crate::target_file::{FinishedState, TargetPosition, TargetSnapshot, TargetStore};
use crate::twap::{SlicePlan, TwapBook};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);
const DEPTH_LEVELS: u32 = 5;
const DEPTH_SPEED_MS: u32 = 100;

/// Position-change detector cadence: initial grace, then periodic probes.
const DETECTOR_INITIAL_DELAY: Duration = Duration::from_secs(5);
const DETECTOR_PROBES: u32 = 6;
const DETECTOR_PROBE_INTERVAL: Duration = Duration::from_secs(4);
const DETECTOR_SETTLE: Duration = Duration::from_secs(1);

/// Result of pushing one market order through formatting, validation,
/// duplicate suppression and the wire.
#[derive(Debug, Clone, PartialEq)]
enum SubmitOutcome {
    Submitted { order_id: String },
    Duplicate,
    Invalid,
    DriverFailed,
}

/// The alignment engine. Construction wires the pieces together in
/// dependency order; `start` spawns the worker tasks.
pub struct Engine {
    inner: Arc<EngineInner>,
    events: mpsc::UnboundedReceiver<DriverEvent>,
}

/// Running engine: worker handles plus the shared core.
pub struct EngineHandle {
    inner: Arc<EngineInner>,
    workers: Vec<JoinHandle<()>>,
}

struct EngineInner {
    config: GatewayConfig,
    planner_config: PlannerConfig,
    driver: Arc<dyn ExchangeDriver>,
    rules: Arc<RuleTable>,
    positions: PositionBook,
    book: TopOfBook,
    orders: OrderStateMachine,
    twaps: TwapBook,
    target_store: TargetStore,
    feedback: FeedbackWriter,
    snapshot_gate: Gate,
    completion_gate: Gate,
    /// Symbols from the most recent target-file read; the snapshot handler
    /// seeds zero rows for them.
    targets: Mutex<Vec<TargetPosition>>,
    /// Per-symbol error slot surfaced in the next feedback report.
    order_errors: Mutex<HashMap<String, String>>,
    /// Net position captured just before each submission, for the
    /// position-change detector.
    pre_submit: Mutex<HashMap<String, Decimal>>,
    subscribed: Mutex<HashSet<String>>,
    shutdown: CancellationToken,
}

impl Engine {
    pub fn new(
        config: GatewayConfig,
        rules: Arc<RuleTable>,
        driver: Arc<dyn ExchangeDriver>,
        events: mpsc::UnboundedReceiver<DriverEvent>,
    ) -> Self {
        let planner_config = PlannerConfig {
            tolerance_threshold: config.tolerance_threshold,
            relative_tolerance: config.relative_tolerance,
            twap_min_slice_size: config.twap_min_slice_size,
        };

        let inner = Arc::new(EngineInner {
            planner_config,
            driver,
            rules,
            positions: PositionBook::new(),
            book: TopOfBook::new(),
            orders: OrderStateMachine::new(config.orders.clone()),
            twaps: TwapBook::new(),
            target_store: TargetStore::new(&config.target_file),
            feedback: FeedbackWriter::new(&config.results_dir),
            snapshot_gate: Gate::new(),
            completion_gate: Gate::new(),
            targets: Mutex::new(Vec::new()),
            order_errors: Mutex::new(HashMap::new()),
            pre_submit: Mutex::new(HashMap::new()),
            subscribed: Mutex::new(HashSet::new()),
            shutdown: CancellationToken::new(),
            config,
        });

        // Any transition into a terminal state wakes the controller.
        let completion_gate = inner.completion_gate.clone();
        inner
            .orders
            .set_listener(Arc::new(move |_record, _old, new_state| {
                if new_state.is_terminal() {
                    completion_gate.open();
                }
            }));

        Self { inner, events }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    /// Spawn the dispatcher, file monitor, account refresher and janitor.
    pub fn start(self) -> EngineHandle {
        let Engine { inner, events } = self;

        let workers = vec![
            tokio::spawn(inner.clone().run_dispatcher(events)),
            tokio::spawn(inner.clone().run_file_monitor()),
            tokio::spawn(inner.clone().run_account_refresher()),
            tokio::spawn(inner.clone().run_janitor()),
        ];

        info!("alignment engine started");
        EngineHandle { inner, workers }
    }
}

impl EngineHandle {
    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    /// Request shutdown and wait for every worker, with a bounded deadline;
    /// stragglers are aborted.
    pub async fn shutdown_and_wait(mut self) -> Result<()> {
        self.inner.shutdown.cancel();
        self.inner.snapshot_gate.open();
        self.inner.completion_gate.open();

        let deadline = Instant::now() + SHUTDOWN_TIMEOUT;
        while let Some(mut handle) = self.workers.pop() {
            tokio::select! {
                res = &mut handle => {
                    if let Err(join_err) = res {
                        if join_err.is_panic() {
                            abort_all(self.workers);
                            return Err(anyhow!("engine worker panicked: {join_err}"));
                        }
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    handle.abort();
                    abort_all(self.workers);
                    return Err(anyhow!("engine shutdown timed out after {SHUTDOWN_TIMEOUT:?}"));
                }
            }
        }
        Ok(())
    }
}

fn abort_all(handles: Vec<JoinHandle<()>>) {
    for handle in handles {
        handle.abort();
    }
}

impl EngineInner {
    // ------------------------------------------------------------------
    // Workers
    // ------------------------------------------------------------------

    /// Single consumer of driver events: the one choke point where every
    /// venue callback lands.
    async fn run_dispatcher(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<DriverEvent>) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                event = events.recv() => {
                    match event {
                        Some(event) => self.clone().handle_event(event).await,
                        None => {
                            warn!("driver event stream closed");
                            break;
                        }
                    }
                }
            }
        }
        debug!("dispatcher stopped");
    }

    /// Poll the target file; a pending state runs one alignment cycle.
    async fn run_file_monitor(self: Arc<Self>) {
        let interval = self.config.file_poll_interval();
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }

            let snapshot = match self.target_store.read().await {
                Ok(snapshot) => snapshot,
                Err(err) => {
                    // Transient parse/io errors retry on the next poll
                    debug!(error = %err, "target file unreadable this poll");
                    continue;
                }
            };

            match snapshot.state() {
                FinishedState::Pending => {
                    info!(
                        targets = snapshot.targets.len(),
                        "pending target detected, starting alignment"
                    );
                    self.clone().run_alignment_cycle(snapshot).await;
                }
                FinishedState::Done => {}
                FinishedState::Error => {}
                FinishedState::Unknown => {
                    debug!("target file carries no usable isFinished field");
                }
            }
        }
        debug!("file monitor stopped");
    }

    /// Periodic snapshot requests independent of alignment cycles, plus
    /// depth-subscription maintenance.
    async fn run_account_refresher(self: Arc<Self>) {
        let interval = self.config.account_refresh_interval();
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }

            if let Err(err) = self.driver.request_account_info().await {
                warn!(error = %err, "periodic account refresh failed");
            }

            if let Ok(snapshot) = self.target_store.read().await {
                let required: HashSet<String> = snapshot
                    .targets
                    .iter()
                    .map(|t| t.symbol.clone())
                    .collect();
                self.sync_subscriptions(&required).await;
            }
        }
        debug!("account refresher stopped");
    }

    /// Timeout supervision and retention reaping for the order machine.
    async fn run_janitor(self: Arc<Self>) {
        let interval = self.config.orders.cleanup_interval();
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }

            let transitions = self.orders.sweep(Instant::now());
            for (order_id, event) in transitions {
                let Some(record) = self.orders.get(&order_id) else {
                    continue;
                };
                warn!(
                    %order_id,
                    symbol = %record.symbol,
                    ?event,
                    "order supervision transition"
                );
                if event == OrderEvent::Expire
                    && self.twaps.owns_order(&record.symbol, &order_id)
                    && self.twaps.on_order_failed(&record.symbol, &order_id)
                {
                    self.clone().schedule_next_slice(record.symbol.clone());
                }
            }
        }
        debug!("janitor stopped");
    }

    // ------------------------------------------------------------------
    // Event handling
    // ------------------------------------------------------------------

    async fn handle_event(self: Arc<Self>, event: DriverEvent) {
        match event {
            DriverEvent::AccountInfo(info) => {
                let target_symbols: Vec<String> = {
                    let targets = self.targets.lock().expect("targets lock");
                    targets.iter().map(|t| t.symbol.clone()).collect()
                };
                self.positions.apply_snapshot(
                    &info.positions,
                    target_symbols.iter().map(String::as_str),
                );
                self.snapshot_gate.open();
            }
            DriverEvent::AccountUpdate(rows) => {
                for row in &rows {
                    self.positions.upsert(row);
                }
            }
            DriverEvent::PositionUpdate(row) => {
                self.positions.upsert(&row);
            }
            DriverEvent::Depth(top) => {
                self.book.update(top);
            }
            DriverEvent::Order(response) => {
                self.handle_order_response(response).await;
            }
            DriverEvent::Error(message) => {
                warn!(%message, "driver error");
            }
        }
    }

    async fn handle_order_response(self: Arc<Self>, response: OrderResponse) {
        // An all-blank response is the wire layer's way of reporting a
        // failed submission: fail what is in flight and retry next cycle.
        if response.is_empty() {
            warn!("empty order response, failing in-flight submissions");
            self.fail_active_submissions("empty order response");
            self.completion_gate.open();
            return;
        }

        let Some(record) = self.orders.get(&response.client_order_id) else {
            debug!(client_order_id = %response.client_order_id, "order response for unknown order");
            return;
        };
        let order_id = record.order_id.clone();
        let symbol = record.symbol.clone();

        // Any response implies the venue saw the order.
        if record.state == OrderState::PendingSubmit {
            let exchange_id = (!response.exchange_order_id.is_empty())
                .then_some(response.exchange_order_id.as_str());
            if let Err(err) =
                self.orders
                    .process_event(&order_id, OrderEvent::Acknowledge, exchange_id, None)
            {
                debug!(%order_id, error = %err, "acknowledge skipped");
            }
        }

        match response.status {
            Some(OrderStatus::New) => {
                self.spawn_position_detector(order_id);
            }
            Some(OrderStatus::Filled) | Some(OrderStatus::PartiallyFilled) => {
                let executed = response.executed_qty_decimal();
                let avg_price = response.avg_price_decimal();

                if let Err(err) = self.orders.update_fill(&order_id, executed, avg_price) {
                    debug!(%order_id, error = %err, "fill update skipped");
                }
                if response.status == Some(OrderStatus::PartiallyFilled)
                    && executed < record.quantity
                {
                    // Market-order remainder cannot execute later; retire it
                    if let Err(err) =
                        self.orders
                            .process_event(&order_id, OrderEvent::Expire, None, None)
                    {
                        debug!(%order_id, error = %err, "remainder expiry skipped");
                    }
                }

                // Fresh baseline right after an execution
                if let Err(err) = self.driver.request_account_info().await {
                    warn!(error = %err, "account refresh after fill failed");
                }

                if self.twaps.owns_order(&symbol, &order_id) {
                    if self.twaps.on_order_filled(&symbol, &order_id, executed) {
                        self.clone().schedule_next_slice(symbol.clone());
                    } else {
                        // Execution settled; wake the controller
                        self.completion_gate.open();
                    }
                }
                self.pre_submit
                    .lock()
                    .expect("pre-submit lock")
                    .remove(&order_id);
            }
            Some(OrderStatus::Canceled) => {
                if let Err(err) =
                    self.orders
                        .process_event(&order_id, OrderEvent::CancelConfirm, None, None)
                {
                    debug!(%order_id, error = %err, "cancel confirm skipped");
                }
                self.handle_failed_slice(&symbol, &order_id);
            }
            Some(OrderStatus::Rejected) => {
                let mut message = format!(
                    "Order rejected for {symbol}: {} {}",
                    response.side, response.orig_qty
                );
                if let Some(venue_message) = &response.error_message {
                    message = format!("{message} ({venue_message})");
                }
                if let Err(err) =
                    self.orders
                        .process_event(&order_id, OrderEvent::Reject, None, Some(&message))
                {
                    debug!(%order_id, error = %err, "reject transition skipped");
                }
                self.record_error(&symbol, message);
                self.handle_failed_slice(&symbol, &order_id);
            }
            Some(OrderStatus::Expired) => {
                if let Err(err) =
                    self.orders
                        .process_event(&order_id, OrderEvent::Expire, None, None)
                {
                    debug!(%order_id, error = %err, "expire transition skipped");
                }
                self.handle_failed_slice(&symbol, &order_id);
            }
            None => {
                debug!(%order_id, "order response without status ignored");
            }
        }
    }

    /// Rejected/cancelled/expired slices return their quantity to the pool
    /// and the execution moves on.
    fn handle_failed_slice(self: Arc<Self>, symbol: &str, order_id: &str) {
        self.pre_submit
            .lock()
            .expect("pre-submit lock")
            .remove(order_id);
        if self.twaps.owns_order(symbol, order_id) && self.twaps.on_order_failed(symbol, order_id)
        {
            self.clone().schedule_next_slice(symbol.to_string());
        }
    }

    fn fail_active_submissions(&self, reason: &str) {
        for record in self.orders.active_orders() {
            if let Err(err) = self.orders.process_event(
                &record.order_id,
                OrderEvent::ErrorOccurred,
                None,
                Some(reason),
            ) {
                debug!(order_id = %record.order_id, error = %err, "error transition skipped");
            }
            if self.twaps.owns_order(&record.symbol, &record.order_id) {
                self.twaps.on_order_failed(&record.symbol, &record.order_id);
            }
            self.pre_submit
                .lock()
                .expect("pre-submit lock")
                .remove(&record.order_id);
        }
    }

    fn record_error(&self, symbol: &str, message: String) {
        warn!(%symbol, %message, "recording order error");
        self.order_errors
            .lock()
            .expect("order errors lock")
            .insert(symbol.to_string(), message);
    }

    // ------------------------------------------------------------------
    // Alignment cycle
    // ------------------------------------------------------------------

    async fn run_alignment_cycle(self: Arc<Self>, snapshot: TargetSnapshot) {
        let targets = snapshot.targets.clone();
        if targets.is_empty() {
            warn!("pending target file carries no position elements");
            return;
        }

        // A file that names only unknown symbols can never align; park it
        // for human intervention instead of spinning.
        if targets.iter().all(|t| self.rules.get(&t.symbol).is_none()) {
            warn!("no trading rules cover any target symbol, marking file errored");
            if let Err(err) = self
                .target_store
                .write_finished(2, Some("no trading rules for target symbols"))
                .await
            {
                warn!(error = %err, "failed to mark target file errored");
            }
            return;
        }

        let symbols: Vec<String> = targets.iter().map(|t| t.symbol.clone()).collect();
        *self.targets.lock().expect("targets lock") = targets.clone();

        // Depth subscriptions first so the book fills while we wait on the
        // snapshot below.
        let required: HashSet<String> = symbols.iter().cloned().collect();
        self.sync_subscriptions(&required).await;

        // Step 1: trusted baseline
        self.refresh_positions().await;

        // Steps 2-3: plan and submit
        for target in &targets {
            let current = self.positions.net_quantity(&target.symbol);
            let book = self.book.get_priced(&target.symbol);
            let decision = plan_symbol(
                &self.planner_config,
                target.quantity,
                current,
                book.as_ref(),
                self.orders.has_active_for_symbol(&target.symbol),
                self.twaps.is_active(&target.symbol),
            );

            match decision {
                Decision::Skip(reason) => {
                    if reason == SkipReason::NoMarketData {
                        warn!(symbol = %target.symbol, "no market data, skipping symbol");
                    } else {
                        debug!(symbol = %target.symbol, ?reason, "skipping symbol");
                    }
                }
                Decision::Market {
                    side,
                    quantity,
                    reduce_only,
                    reference_price,
                } => {
                    info!(
                        symbol = %target.symbol, %side, %quantity, reduce_only,
                        %current, target = %target.quantity,
                        "direct alignment order"
                    );
                    let outcome = self
                        .submit_market(
                            &target.symbol,
                            side,
                            quantity,
                            reference_price,
                            reduce_only,
                            "align",
                            false,
                        )
                        .await;
                    debug!(symbol = %target.symbol, ?outcome, "direct order outcome");
                }
                Decision::Twap {
                    signed_delta,
                    price_hint,
                } => {
                    info!(
                        symbol = %target.symbol, %signed_delta,
                        "large adjustment, starting twap"
                    );
                    if let Some(plan) = self.twaps.start(
                        &target.symbol,
                        signed_delta,
                        price_hint,
                        self.config.twap_min_slice_size,
                        self.config.twap_interval(),
                    ) {
                        self.clone().submit_twap_slice(plan).await;
                    }
                }
            }
        }

        // Step 4: wait for the submitted work to resolve
        self.clone().wait_for_completion(&symbols).await;

        // Step 5: fresh baseline for the verdict
        self.refresh_positions().await;

        // Step 6: verdict
        if self.check_aligned(&targets) {
            let current: HashMap<String, Decimal> = targets
                .iter()
                .map(|t| (t.symbol.clone(), self.positions.net_quantity(&t.symbol)))
                .collect();
            let errors = self.order_errors.lock().expect("order errors lock").clone();

            match self
                .feedback
                .write(&targets, &current, &errors, &snapshot.meta)
                .await
            {
                Ok(path) => debug!(path = %path.display(), "feedback written"),
                Err(err) => warn!(error = %err, "feedback report failed"),
            }

            match self.target_store.write_finished(1, None).await {
                Ok(()) => {
                    info!("alignment complete, target file marked done");
                    self.order_errors.lock().expect("order errors lock").clear();
                }
                Err(err) => warn!(error = %err, "failed to mark target file done"),
            }
        } else {
            warn!("positions not aligned, retrying on next poll");
        }
    }

    /// Request a snapshot and wait on the gate; a timeout downgrades to
    /// planning against cached positions.
    async fn refresh_positions(&self) {
        self.snapshot_gate.clear();
        if let Err(err) = self.driver.request_account_info().await {
            warn!(error = %err, "snapshot request failed");
            return;
        }
        if !self.snapshot_gate.wait(self.config.snapshot_timeout()).await {
            warn!("account snapshot timeout, proceeding with cached positions");
        }
    }

    /// Block until no targeted symbol has active orders or TWAP work, or
    /// the completion timeout forces progress.
    async fn wait_for_completion(self: Arc<Self>, symbols: &[String]) {
        let deadline = Instant::now() + self.config.completion_timeout();
        loop {
            self.completion_gate.clear();
            if !self.has_activity(symbols) {
                return;
            }

            let now = Instant::now();
            if now >= deadline {
                warn!("order completion timeout, forcing twap progress");
                for symbol in symbols {
                    if self.twaps.is_active(symbol) {
                        let inner = self.clone();
                        let symbol = symbol.clone();
                        tokio::spawn(async move {
                            tokio::select! {
                                _ = inner.shutdown.cancelled() => return,
                                _ = tokio::time::sleep(Duration::from_millis(500)) => {}
                            }
                            inner.advance_twap(&symbol).await;
                        });
                    }
                }
                return;
            }

            self.completion_gate.wait(deadline - now).await;
            if self.shutdown.is_cancelled() {
                return;
            }
        }
    }

    fn has_activity(&self, symbols: &[String]) -> bool {
        symbols
            .iter()
            .any(|s| self.orders.has_active_for_symbol(s) || self.twaps.is_active(s))
    }

    fn check_aligned(&self, targets: &[TargetPosition]) -> bool {
        targets.iter().all(|target| {
            let current = self.positions.net_quantity(&target.symbol);
            let diff = (current - target.quantity).abs();
            let tolerance = dynamic_tolerance(&self.planner_config, target.quantity);
            if diff > tolerance {
                debug!(
                    symbol = %target.symbol, %current, target = %target.quantity,
                    %diff, %tolerance, "not aligned"
                );
                false
            } else {
                true
            }
        })
    }

    /// Diff the wanted depth subscriptions against what is held.
    async fn sync_subscriptions(&self, required: &HashSet<String>) {
        let (to_add, to_remove) = {
            let subscribed = self.subscribed.lock().expect("subscribed lock");
            let to_add: Vec<String> = required.difference(&subscribed).cloned().collect();
            let to_remove: Vec<String> = subscribed.difference(required).cloned().collect();
            (to_add, to_remove)
        };

        for symbol in &to_remove {
            debug!(%symbol, "unsubscribing depth");
            if let Err(err) = self.driver.unsubscribe_depth(symbol).await {
                warn!(%symbol, error = %err, "depth unsubscribe failed");
            }
        }
        for symbol in &to_add {
            debug!(%symbol, "subscribing depth");
            if let Err(err) = self
                .driver
                .subscribe_depth(symbol, DEPTH_LEVELS, DEPTH_SPEED_MS)
                .await
            {
                warn!(%symbol, error = %err, "depth subscribe failed");
            }
        }

        let mut subscribed = self.subscribed.lock().expect("subscribed lock");
        *subscribed = required.clone();
    }

    // ------------------------------------------------------------------
    // Submission path
    // ------------------------------------------------------------------

    /// Format, validate, suppress duplicates, then hand the market order to
    /// the driver. TWAP slices register with their execution before the
    /// wire send so the response handler always finds the attribution.
    #[allow(clippy::too_many_arguments)]
    async fn submit_market(
        &self,
        symbol: &str,
        side: Side,
        quantity: Decimal,
        reference_price: Decimal,
        reduce_only: bool,
        strategy_tag: &str,
        for_twap: bool,
    ) -> SubmitOutcome {
        let formatted_qty = match self.rules.format_quantity(symbol, quantity) {
            Ok(formatted) => formatted,
            Err(err) => {
                warn!(%symbol, error = %err, "quantity formatting failed");
                return SubmitOutcome::Invalid;
            }
        };
        let formatted_price = match self.rules.format_price(symbol, reference_price) {
            Ok(formatted) => formatted,
            Err(err) => {
                warn!(%symbol, error = %err, "price formatting failed");
                return SubmitOutcome::Invalid;
            }
        };

        if formatted_qty <= Decimal::ZERO {
            warn!(%symbol, %quantity, "quantity formats to zero, skipping");
            return SubmitOutcome::Invalid;
        }
        if let Err(err) = self.rules.validate(symbol, formatted_qty, formatted_price) {
            warn!(%symbol, error = %err, "order validation failed, skipping symbol this cycle");
            return SubmitOutcome::Invalid;
        }

        if self
            .orders
            .has_pending_order(symbol, side, formatted_qty, formatted_price)
        {
            debug!(%symbol, %side, %formatted_qty, "duplicate pending order, skipping");
            return SubmitOutcome::Duplicate;
        }
        if self
            .orders
            .has_recent_executed_order(symbol, side, formatted_qty, formatted_price)
        {
            debug!(%symbol, %side, %formatted_qty, "recently executed twin, skipping");
            return SubmitOutcome::Duplicate;
        }

        let order_id =
            self.orders
                .create_order(symbol, side, formatted_qty, formatted_price, strategy_tag);
        if let Err(err) = self
            .orders
            .process_event(&order_id, OrderEvent::Submit, None, None)
        {
            warn!(%order_id, error = %err, "submit transition failed");
            return SubmitOutcome::Invalid;
        }

        // Publish everything the callbacks will need before the wire send.
        self.pre_submit
            .lock()
            .expect("pre-submit lock")
            .insert(order_id.clone(), self.positions.net_quantity(symbol));
        if for_twap {
            self.twaps.record_submission(symbol, &order_id, formatted_qty);
        }

        let request =
            OrderRequest::market(symbol, side, formatted_qty, reduce_only, order_id.as_str());
        if let Err(err) = self.driver.submit_order(request).await {
            warn!(%symbol, %order_id, error = %err, "order submission failed");
            let _ = self.orders.process_event(
                &order_id,
                OrderEvent::ErrorOccurred,
                None,
                Some(&err.to_string()),
            );
            self.pre_submit
                .lock()
                .expect("pre-submit lock")
                .remove(&order_id);
            if for_twap {
                self.twaps.on_order_failed(symbol, &order_id);
            }
            return SubmitOutcome::DriverFailed;
        }

        info!(
            %symbol, %side, quantity = %formatted_qty,
            reference_price = %formatted_price, reduce_only, %order_id, strategy_tag,
            "market order submitted"
        );
        SubmitOutcome::Submitted { order_id }
    }

    // ------------------------------------------------------------------
    // TWAP orchestration
    // ------------------------------------------------------------------

    async fn submit_twap_slice(self: Arc<Self>, plan: SlicePlan) {
        let price_hint = self
            .book
            .get_priced(&plan.symbol)
            .map(|top| match plan.side {
                Side::Buy => top.ask_price,
                Side::Sell => top.bid_price,
            })
            .or_else(|| {
                self.twaps
                    .get(&plan.symbol)
                    .map(|exec| exec.target_price_hint)
            })
            .unwrap_or(Decimal::ZERO);

        let outcome = self
            .submit_market(
                &plan.symbol,
                plan.side,
                plan.quantity,
                price_hint,
                false,
                "twap",
                true,
            )
            .await;

        match outcome {
            SubmitOutcome::Submitted { order_id } => {
                self.clone()
                    .spawn_slice_fallback(plan.symbol.clone(), order_id);
                if plan.is_final {
                    self.clone().spawn_final_watchdog(plan.symbol.clone());
                }
            }
            SubmitOutcome::Duplicate => {
                // The twin in flight carries the same quantity; feed this
                // carve back and try again next interval.
                self.twaps.refund(&plan.symbol, plan.quantity);
                self.clone().schedule_next_slice(plan.symbol.clone());
            }
            SubmitOutcome::DriverFailed => {
                self.clone().schedule_next_slice(plan.symbol.clone());
            }
            SubmitOutcome::Invalid => {
                warn!(symbol = %plan.symbol, "slice cannot be made valid, completing execution");
                if self.twaps.force_complete(&plan.symbol) {
                    self.completion_gate.open();
                }
            }
        }
    }

    async fn advance_twap(self: Arc<Self>, symbol: &str) {
        if let Some(plan) = self.twaps.carve_slice(symbol) {
            self.submit_twap_slice(plan).await;
        }
    }

    /// Schedule the next slice one interval out.
    fn schedule_next_slice(self: Arc<Self>, symbol: String) {
        let interval = self
            .twaps
            .get(&symbol)
            .map(|exec| exec.slice_interval)
            .unwrap_or_else(|| self.config.twap_interval());
        tokio::spawn(async move {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = tokio::time::sleep(interval) => {}
            }
            self.advance_twap(&symbol).await;
        });
    }

    /// Per-slice fallback: if neither a fill nor a failure resolved the
    /// slice in time, force progress with timeout semantics.
    fn spawn_slice_fallback(self: Arc<Self>, symbol: String, order_id: String) {
        let timeout = self.config.twap_slice_timeout();
        tokio::spawn(async move {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = tokio::time::sleep(timeout) => {}
            }
            let order_active = self
                .orders
                .get(&order_id)
                .is_some_and(|record| record.state.is_active());
            if order_active && self.twaps.is_active(&symbol) {
                warn!(%symbol, %order_id, "slice timeout, forcing twap progress");
                self.advance_twap(&symbol).await;
            }
        });
    }

    /// Final-slice watchdog: whatever happened to the last order, the
    /// execution ends so the alignment loop cannot stall on it.
    fn spawn_final_watchdog(self: Arc<Self>, symbol: String) {
        let timeout = self.config.twap_final_watchdog();
        tokio::spawn(async move {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = tokio::time::sleep(timeout) => {}
            }
            if self.twaps.force_complete(&symbol) {
                warn!(%symbol, "final slice watchdog fired, execution force-completed");
                self.completion_gate.open();
            }
        });
    }

    // ------------------------------------------------------------------
    // Position-change detection
    // ------------------------------------------------------------------

    /// Defence in depth against lost order callbacks: poll the position
    /// cache against the pre-submission baseline and synthesize a fill when
    /// the expected delta shows up.
    fn spawn_position_detector(self: Arc<Self>, order_id: String) {
        let initial = {
            let pre_submit = self.pre_submit.lock().expect("pre-submit lock");
            pre_submit.get(&order_id).copied()
        };
        let Some(initial) = initial else {
            return;
        };
        let Some(record) = self.orders.get(&order_id) else {
            return;
        };

        tokio::spawn(async move {
            let inner = self;
            let symbol = record.symbol.clone();
            let expected = record.quantity;
            let expected_change = match record.side {
                Side::Buy => expected,
                Side::Sell => -expected,
            };

            tokio::select! {
                _ = inner.shutdown.cancelled() => return,
                _ = tokio::time::sleep(DETECTOR_INITIAL_DELAY) => {}
            }

            for _probe in 0..DETECTOR_PROBES {
                let resolved = inner
                    .orders
                    .get(&order_id)
                    .is_none_or(|r| !r.state.is_active());
                if resolved {
                    break;
                }

                if let Err(err) = inner.driver.request_account_info().await {
                    warn!(error = %err, "detector snapshot request failed");
                }
                tokio::select! {
                    _ = inner.shutdown.cancelled() => return,
                    _ = tokio::time::sleep(DETECTOR_SETTLE) => {}
                }

                let current = inner.positions.net_quantity(&symbol);
                let change = current - initial;
                if (change - expected_change).abs() < Decimal::ONE {
                    info!(
                        %symbol, %order_id, %change,
                        "fill inferred from position change"
                    );
                    let price = inner
                        .book
                        .get(&symbol)
                        .map(|top| match record.side {
                            Side::Buy => top.ask_price,
                            Side::Sell => top.bid_price,
                        })
                        .unwrap_or(Decimal::ZERO);
                    if let Err(err) = inner.orders.update_fill(&order_id, expected, price) {
                        debug!(%order_id, error = %err, "synthesized fill skipped");
                    }
                    if inner.twaps.owns_order(&symbol, &order_id) {
                        if inner.twaps.on_order_filled(&symbol, &order_id, expected) {
                            inner.clone().schedule_next_slice(symbol.clone());
                        } else {
                            inner.completion_gate.open();
                        }
                    }
                    break;
                }

                tokio::select! {
                    _ = inner.shutdown.cancelled() => return,
                    _ = tokio::time::sleep(DETECTOR_PROBE_INTERVAL) => {}
                }
            }

            inner
                .pre_submit
                .lock()
                .expect("pre-submit lock")
                .remove(&order_id);

            // Still unresolved after all probes: keep the twap moving.
            let still_active = inner
                .orders
                .get(&order_id)
                .is_some_and(|r| r.state.is_active());
            if still_active && inner.twaps.is_active(&symbol) {
                warn!(%symbol, %order_id, "order unresolved after position checks, forcing twap progress");
                inner.clone().advance_twap(&symbol).await;
            }
        });
    }
}
