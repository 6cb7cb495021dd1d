/*
[INPUT]:  Crate modules and public type definitions
[OUTPUT]: Public USDⓈ-M futures adapter crate surface
[POS]:    Crate root - module wiring
[UPDATE]: When public modules or exports change
*/

pub mod driver;
pub mod error;
pub mod sim;
pub mod types;

// Re-export the driver surface
pub use driver::{DriverEvent, EventSender, ExchangeDriver};

// Re-export the error type
pub use error::{DriverError, Result};

// Re-export the simulated venue
pub use sim::{FillMode, SimExchange};

// Re-export all wire types
pub use types::*;
