//! DTC-style binary protocol client.
//!
//! Keeps a single logged-on TCP connection to a charting/trading terminal and
//! republishes canonical ticks as `MARKET_DATA_UPDATE_TRADE` frames.

pub mod client;
pub mod error;
pub mod protocol;

pub use client::{ConnectionState, DtcClient, DtcConfig};
pub use error::DtcError;
