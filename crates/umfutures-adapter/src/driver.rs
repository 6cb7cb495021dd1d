/*
[INPUT]:  Outbound operations from the engine, inbound wire events
[OUTPUT]: ExchangeDriver trait + DriverEvent enum over an mpsc channel
[POS]:    Interface layer - the seam between the engine and any venue
[UPDATE]: When the callback surface or outbound operation set changes
*/

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::types::{
    AccountInfoResponse, AccountPosition, BookTop, CancelRequest, OrderRequest, OrderResponse,
};

/// Everything the venue pushes back at the engine. Each wire event maps to
/// exactly one variant; the engine runs a single dispatcher over the
/// receiving end so callback handling has one choke point.
#[derive(Debug, Clone)]
pub enum DriverEvent {
    /// Full account snapshot (response to `request_account_info`)
    AccountInfo(AccountInfoResponse),
    /// Incremental account update (several positions at once)
    AccountUpdate(Vec<AccountPosition>),
    /// Incremental single-symbol position update
    PositionUpdate(AccountPosition),
    /// Top-of-book refresh from the depth stream
    Depth(BookTop),
    /// Order lifecycle report
    Order(OrderResponse),
    /// Driver-level error with no state attached
    Error(String),
}

/// Sender half the driver uses to deliver events.
pub type EventSender = mpsc::UnboundedSender<DriverEvent>;

/// Outbound operations on a venue. Implementations own wire serialisation,
/// signing and sending; every call returns as soon as the request is on its
/// way. Acknowledgements arrive as [`DriverEvent`]s.
#[async_trait]
pub trait ExchangeDriver: Send + Sync {
    /// Submit a new order. The lifecycle unfolds via `DriverEvent::Order`.
    async fn submit_order(&self, req: OrderRequest) -> Result<()>;

    /// Cancel an order by client or exchange id.
    async fn cancel_order(&self, req: CancelRequest) -> Result<()>;

    /// Request a full account snapshot, answered by `DriverEvent::AccountInfo`.
    async fn request_account_info(&self) -> Result<()>;

    /// Request account balances. No core event maps to the reply; the
    /// driver may surface it through its own channels.
    async fn request_account_balance(&self) -> Result<()>;

    /// Request per-symbol position rows, answered by
    /// `DriverEvent::PositionUpdate` per position.
    async fn request_position_info(&self) -> Result<()>;

    /// Subscribe to the depth stream for a symbol.
    async fn subscribe_depth(&self, symbol: &str, levels: u32, update_speed_ms: u32) -> Result<()>;

    /// Drop the depth subscription for a symbol.
    async fn unsubscribe_depth(&self, symbol: &str) -> Result<()>;
}
