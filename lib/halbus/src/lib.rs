//! `halbus` connects manager applications to vendor HAL processes over a
//! loopback JSON-over-TCP bus. The two halves are symmetric: the client half
//! issues synchronous parameter requests and receives published events, the
//! server half dispatches requests to registered action handlers and fans
//! events out to its subscribers, all over a single multiplexed connection.

pub mod shared;
pub mod logging;
pub mod config;
pub mod message;
pub mod framing;
pub mod client;
pub mod server;

pub use crate::client::HalClient;
pub use crate::config::HalConfig;
pub use crate::server::HalServer;
pub use crate::shared::{HalError, HalResult};
