//! Application protocols the daemon registers with its factory.

pub mod exchange;
pub mod ping;

pub use exchange::{PeerExchange, EXCHANGE_PROTOCOL_ID};
pub use ping::{Ping, PING_PROTOCOL_ID};
