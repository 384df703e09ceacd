//! Peerlink Linux daemon: TCP transport, LAN discovery, peer exchange and ping on top of peerlink-core.

pub mod config;
pub mod discovery;
pub mod node;
pub mod protocols;
pub mod routing;
pub mod transport;

pub use node::{build_factory, Node};
