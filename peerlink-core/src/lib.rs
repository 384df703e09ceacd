//! Peerlink core: peer connection lifecycle and protocol multiplexing.
//!
//! A [`PeerFactory`] is configured once with an outer protocol and the
//! sub-protocols it may multiplex. [`LocalPeer::dial`] and [`LocalPeer::listen`]
//! hand a fresh [`Channel`] and [`PeerContext`] to the outer protocol and return
//! once the connection is usable. Additional sub-protocols are opened over the
//! same connection with [`RemotePeer::dial`].
//!
//! Transports, discovery and application protocols plug in through the
//! [`Transport`], [`Discovery`] and [`Protocol`] traits.

pub mod address;
pub mod channel;
pub mod context;
pub mod discovery;
pub mod error;
pub mod factory;
pub mod identity;
pub mod listener;
pub mod mux;
pub mod peer;
pub mod protocol;
pub mod transport;
pub mod wire;

pub use address::{AddressError, Kind, Multiaddr, Protocol as AddrComponent};
pub use channel::{Channel, ChannelError, ChannelState, ReadMode};
pub use context::{ChannelRequest, ContextId, PeerContext, RequestQueue};
pub use discovery::{Discovery, DiscoveryEvent, DiscoverySink, StaticDiscovery};
pub use error::{PeerError, PeerResult};
pub use factory::{ConnectionHook, NoopHook, PeerFactory, PeerFactoryBuilder};
pub use identity::{Identity, PeerId, PublicKey};
pub use listener::Listener;
pub use mux::{MuxConfig, Multiplexer, MUX_PROTOCOL_ID};
pub use peer::{LocalPeer, RemotePeer};
pub use protocol::{ChannelFactory, Protocol, ProtocolRegistry};
pub use transport::{MemoryHub, MemoryTransport, Transport, TransportListener, Transports};
pub use wire::{decode_frame, encode_frame, Frame, FrameDecodeError, FrameEncodeError};

pub use tokio_util::sync::CancellationToken;
