//! `/ping/1.0.0`: the dialer sends random payloads and expects them echoed back.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use peerlink_core::{
    Channel, ChannelFactory, PeerContext, PeerError, PeerResult, Protocol, ReadMode,
};
use rand::RngCore;
use tracing::debug;

pub const PING_PROTOCOL_ID: &str = "/ping/1.0.0";
const PING_SIZE: usize = 32;

pub struct Ping {
    interval: Duration,
    count: Option<u32>,
    last_rtt: Mutex<Option<Duration>>,
}

impl Ping {
    /// Ping forever, waiting `interval` between round trips.
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            count: None,
            last_rtt: Mutex::new(None),
        }
    }

    /// Stop after `count` successful round trips.
    pub fn with_count(mut self, count: u32) -> Self {
        self.count = Some(count);
        self
    }

    /// Most recent round-trip time across all sessions.
    pub fn last_rtt(&self) -> Option<Duration> {
        *self.last_rtt.lock()
    }
}

#[async_trait]
impl Protocol for Ping {
    fn id(&self) -> &str {
        PING_PROTOCOL_ID
    }

    async fn dial(
        &self,
        channel: Channel,
        _upgrader: Arc<ChannelFactory>,
        context: Arc<PeerContext>,
    ) -> PeerResult<()> {
        let mut sent = 0u32;
        loop {
            let mut payload = [0u8; PING_SIZE];
            rand::thread_rng().fill_bytes(&mut payload);
            let start = Instant::now();
            channel.write(payload.to_vec()).await?;
            let echo = channel.read(PING_SIZE, ReadMode::WaitAll).await?;
            if echo[..] != payload[..] {
                return Err(PeerError::ProtocolViolation("ping payload mismatch".into()));
            }
            let rtt = start.elapsed();
            *self.last_rtt.lock() = Some(rtt);
            debug!(ctx = %context.id(), rtt_ms = rtt.as_secs_f64() * 1000.0, "ping");

            sent += 1;
            if self.count.is_some_and(|count| sent >= count) {
                return Ok(());
            }
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = channel.closed() => return Err(PeerError::ConnectionClosed),
            }
        }
    }

    async fn listen(
        &self,
        channel: Channel,
        _upgrader: Arc<ChannelFactory>,
        _context: Arc<PeerContext>,
    ) -> PeerResult<()> {
        while let Ok(payload) = channel.read(PING_SIZE, ReadMode::WaitAll).await {
            channel.write(payload).await?;
        }
        Ok(())
    }
}
