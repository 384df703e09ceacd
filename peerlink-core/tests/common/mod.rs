#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use peerlink_core::{
    Channel, ChannelFactory, ConnectionHook, MemoryHub, MemoryTransport, Multiaddr, Multiplexer,
    PeerContext, PeerError, PeerFactory, PeerResult, Protocol, ReadMode, Transport,
    TransportListener, Transports,
};

pub const ECHO: &str = "/test/echo/1.0.0";
pub const HOLD: &str = "/test/hold/1.0.0";

pub const WAIT: Duration = Duration::from_secs(5);

/// Dialer writes "hello" and expects it back; listener echoes 5 bytes.
pub struct Echo;

#[async_trait]
impl Protocol for Echo {
    fn id(&self) -> &str {
        ECHO
    }

    async fn dial(
        &self,
        channel: Channel,
        _upgrader: Arc<ChannelFactory>,
        _context: Arc<PeerContext>,
    ) -> PeerResult<()> {
        channel.write(&b"hello"[..]).await?;
        let reply = channel.read(5, ReadMode::WaitAll).await?;
        if &reply[..] != b"hello" {
            return Err(PeerError::ProtocolViolation("bad echo".into()));
        }
        Ok(())
    }

    async fn listen(
        &self,
        channel: Channel,
        _upgrader: Arc<ChannelFactory>,
        _context: Arc<PeerContext>,
    ) -> PeerResult<()> {
        let data = channel.read(5, ReadMode::WaitAll).await?;
        channel.write(data).await?;
        // wait for the dialer to finish reading
        channel.closed().await;
        Ok(())
    }
}

/// Both sides block until the stream closes, then report it.
pub struct Hold;

#[async_trait]
impl Protocol for Hold {
    fn id(&self) -> &str {
        HOLD
    }

    async fn dial(
        &self,
        channel: Channel,
        _upgrader: Arc<ChannelFactory>,
        _context: Arc<PeerContext>,
    ) -> PeerResult<()> {
        channel.read(0, ReadMode::WaitAny).await?;
        Ok(())
    }

    async fn listen(
        &self,
        channel: Channel,
        _upgrader: Arc<ChannelFactory>,
        _context: Arc<PeerContext>,
    ) -> PeerResult<()> {
        channel.closed().await;
        Ok(())
    }
}

/// Transport whose dials and listens never complete.
pub struct StallTransport;

#[async_trait]
impl Transport for StallTransport {
    fn name(&self) -> &'static str {
        "stall"
    }

    fn handles(&self, address: &Multiaddr) -> bool {
        address.to_string().starts_with("/dns/stall")
    }

    async fn dial(&self, _address: &Multiaddr) -> PeerResult<Channel> {
        std::future::pending().await
    }

    async fn listen(&self, _address: &Multiaddr) -> PeerResult<Box<dyn TransportListener>> {
        std::future::pending().await
    }
}

/// Memory transport whose listeners fail their first accept.
pub struct FlakyTransport {
    inner: MemoryTransport,
}

impl FlakyTransport {
    pub fn new(hub: &MemoryHub) -> Self {
        Self {
            inner: MemoryTransport::new(hub.clone()),
        }
    }
}

#[async_trait]
impl Transport for FlakyTransport {
    fn name(&self) -> &'static str {
        "flaky"
    }

    fn handles(&self, address: &Multiaddr) -> bool {
        self.inner.handles(address)
    }

    async fn dial(&self, address: &Multiaddr) -> PeerResult<Channel> {
        self.inner.dial(address).await
    }

    async fn listen(&self, address: &Multiaddr) -> PeerResult<Box<dyn TransportListener>> {
        let inner = self.inner.listen(address).await?;
        Ok(Box::new(FlakyListener {
            inner,
            failed: false,
        }))
    }
}

struct FlakyListener {
    inner: Box<dyn TransportListener>,
    failed: bool,
}

#[async_trait]
impl TransportListener for FlakyListener {
    fn local_addr(&self) -> Multiaddr {
        self.inner.local_addr()
    }

    async fn accept(&mut self) -> PeerResult<(Channel, Multiaddr)> {
        if !self.failed {
            self.failed = true;
            return Err(PeerError::Transport("accept failed".into()));
        }
        self.inner.accept().await
    }
}

pub fn transports(hub: &MemoryHub) -> Transports {
    Transports::new()
        .with(MemoryTransport::new(hub.clone()))
        .with(StallTransport)
}

pub fn factory(hub: &MemoryHub) -> PeerFactory {
    factory_with_hook(hub, None)
}

pub fn factory_with_hook(hub: &MemoryHub, hook: Option<Arc<dyn ConnectionHook>>) -> PeerFactory {
    let mut builder = PeerFactory::builder()
        .outer_protocol(Arc::new(Multiplexer::new(transports(hub))))
        .app_protocol(Arc::new(Echo))
        .app_protocol_with(HOLD, || Arc::new(Hold) as Arc<dyn Protocol>);
    if let Some(hook) = hook {
        builder = builder.hook(hook);
    }
    builder.build().unwrap()
}

pub fn flaky_factory(hub: &MemoryHub) -> PeerFactory {
    PeerFactory::builder()
        .outer_protocol(Arc::new(Multiplexer::new(
            Transports::new().with(FlakyTransport::new(hub)),
        )))
        .app_protocol(Arc::new(Echo))
        .build()
        .unwrap()
}

pub fn memory_any() -> Multiaddr {
    Multiaddr::memory(0)
}
