//! Reference outer protocol: one transport connection, many sub-protocol streams.
//!
//! After a `Hello` exchange each side may open streams by protocol id. The
//! dialer numbers its streams odd, the listener even. Each stream is bridged
//! into its own [`Channel`] and handed to the sub-protocol.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::address::{Kind, Multiaddr};
use crate::channel::{Channel, ChannelError, ReadMode};
use crate::context::{ChannelRequest, PeerContext, RequestQueue};
use crate::error::{PeerError, PeerResult};
use crate::identity::{PeerId, PublicKey};
use crate::protocol::{ChannelFactory, Protocol};
use crate::transport::Transports;
use crate::wire::{decode_frame, encode_frame, Frame, FrameDecodeError};

pub const MUX_PROTOCOL_ID: &str = "/peerlink/mux/1.0.0";
const MUX_VERSION: u8 = 1;

const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_MAX_PAYLOAD: usize = 64 * 1024;
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct MuxConfig {
    /// Time allowed for the remote `Hello`.
    pub handshake_timeout: Duration,
    /// Largest `Data` payload sent per frame.
    pub max_payload: usize,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            max_payload: DEFAULT_MAX_PAYLOAD,
        }
    }
}

impl MuxConfig {
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_max_payload(mut self, max_payload: usize) -> Self {
        self.max_payload = max_payload.max(1);
        self
    }
}

pub struct Multiplexer {
    transports: Transports,
    config: MuxConfig,
}

impl Multiplexer {
    pub fn new(transports: Transports) -> Self {
        Self {
            transports,
            config: MuxConfig::default(),
        }
    }

    pub fn with_config(mut self, config: MuxConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &MuxConfig {
        &self.config
    }
}

#[async_trait]
impl Protocol for Multiplexer {
    fn id(&self) -> &str {
        MUX_PROTOCOL_ID
    }

    async fn dial(
        &self,
        channel: Channel,
        upgrader: Arc<ChannelFactory>,
        context: Arc<PeerContext>,
    ) -> PeerResult<()> {
        let address = context
            .remote_address()
            .ok_or(PeerError::NotConfigured("remote address"))?;
        let transport = self.transports.resolve(&address)?;
        let conn = tokio::select! {
            conn = transport.dial(&address) => conn?,
            _ = channel.closed() => return Err(PeerError::ConnectionClosed),
        };
        conn.link(&channel);

        let mut reader = FrameReader::new(conn.clone());
        let local_key = *context.local_peer().identity().public_key();
        let remote_key =
            handshake(&conn, &mut reader, local_key, self.config.handshake_timeout).await?;
        let remote_id = PeerId::from_public_key(&remote_key);
        if let Some(expected) = address.peer_id() {
            if expected != remote_id {
                warn!(ctx = %context.id(), %expected, reached = %remote_id, "peer id mismatch");
                return Err(PeerError::ProtocolViolation(format!(
                    "dialed {} but reached {}",
                    expected.short(),
                    remote_id.short()
                )));
            }
        }
        context.connected(&address, remote_key)?;
        Session::new(true, conn, reader, upgrader, context, self.config.clone())
            .run()
            .await
    }

    async fn listen(
        &self,
        channel: Channel,
        upgrader: Arc<ChannelFactory>,
        context: Arc<PeerContext>,
    ) -> PeerResult<()> {
        let address = context
            .listen_address()
            .ok_or(PeerError::NotConfigured("listen address"))?
            .without(Kind::P2p);
        let transport = self.transports.resolve(&address)?;
        let mut listener = tokio::select! {
            listener = transport.listen(&address) => listener?,
            _ = channel.closed() => return Err(PeerError::ConnectionClosed),
        };
        let bound = listener
            .local_addr()
            .with_peer_id(context.local_peer().peer_id());
        context.listener_ready(bound.clone())?;
        info!(ctx = %context.id(), addr = %bound, transport = transport.name(), "accepting connections");

        let close = channel.close_signal();
        loop {
            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                _ = channel.closed() => break,
            };
            let (conn, remote_addr) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(ctx = %context.id(), addr = %bound, error = %e, "accept failed");
                    tokio::select! {
                        _ = tokio::time::sleep(ACCEPT_RETRY_DELAY) => continue,
                        _ = channel.closed() => break,
                    }
                }
            };
            let (handle, session_channel) = Channel::pair();
            session_channel.link(&conn);
            handle.close_on(&close);
            let inbound = match context.fork_inbound(handle, remote_addr.clone()) {
                Ok(inbound) => inbound,
                Err(e) => {
                    session_channel.close();
                    return Err(e);
                }
            };
            let upgrader = upgrader.clone();
            let config = self.config.clone();
            tokio::spawn(async move {
                let ctx = inbound.id();
                let result =
                    serve_inbound(conn, remote_addr.clone(), inbound.clone(), upgrader, config).await;
                if let Err(e) = result {
                    debug!(%ctx, addr = %remote_addr, error = %e, "inbound session ended");
                }
                inbound.fail_pending(PeerError::ConnectionClosed);
                session_channel.close();
            });
        }
        debug!(ctx = %context.id(), addr = %bound, "listener closed");
        Ok(())
    }
}

async fn serve_inbound(
    conn: Channel,
    remote_addr: Multiaddr,
    context: Arc<PeerContext>,
    upgrader: Arc<ChannelFactory>,
    config: MuxConfig,
) -> PeerResult<()> {
    let mut reader = FrameReader::new(conn.clone());
    let local_key = *context.local_peer().identity().public_key();
    let remote_key = handshake(&conn, &mut reader, local_key, config.handshake_timeout).await?;
    context.connected(&remote_addr, remote_key)?;
    Session::new(false, conn, reader, upgrader, context, config)
        .run()
        .await
}

async fn write_frame(conn: &Channel, frame: &Frame) -> PeerResult<()> {
    conn.write(encode_frame(frame)?).await?;
    Ok(())
}

/// Send our `Hello`, then wait for the remote one.
async fn handshake(
    conn: &Channel,
    reader: &mut FrameReader,
    local_key: PublicKey,
    timeout: Duration,
) -> PeerResult<PublicKey> {
    let hello = Frame::Hello {
        version: MUX_VERSION,
        public_key: local_key,
    };
    write_frame(conn, &hello).await?;
    let frame = tokio::time::timeout(timeout, reader.next())
        .await
        .map_err(|_| PeerError::ProtocolViolation("handshake timed out".into()))??;
    match frame {
        Some(Frame::Hello {
            version: MUX_VERSION,
            public_key,
        }) => Ok(public_key),
        Some(Frame::Hello { version, .. }) => Err(PeerError::ProtocolViolation(format!(
            "unsupported mux version {}",
            version
        ))),
        Some(other) => Err(PeerError::ProtocolViolation(format!(
            "expected hello, got {}",
            other.kind()
        ))),
        None => Err(PeerError::ConnectionClosed),
    }
}

/// Incremental frame decoder over a connection channel. Cancel safe.
struct FrameReader {
    conn: Channel,
    buffer: BytesMut,
}

impl FrameReader {
    fn new(conn: Channel) -> Self {
        Self {
            conn,
            buffer: BytesMut::new(),
        }
    }

    /// Next frame, or `None` once the connection is closed.
    async fn next(&mut self) -> PeerResult<Option<Frame>> {
        loop {
            match decode_frame(&self.buffer) {
                Ok((frame, used)) => {
                    self.buffer.advance(used);
                    return Ok(Some(frame));
                }
                Err(FrameDecodeError::NeedMore) => {}
                Err(e) => return Err(PeerError::ProtocolViolation(e.to_string())),
            }
            match self.conn.read(0, ReadMode::WaitAny).await {
                Ok(bytes) => self.buffer.extend_from_slice(&bytes),
                Err(ChannelError::Closed) => return Ok(None),
            }
        }
    }
}

enum StreamSlot {
    /// We sent `Open`, waiting for `Accept` or `Reject`.
    Opening(ChannelRequest),
    Open(Channel),
}

struct Session {
    dialer: bool,
    conn: Channel,
    reader: FrameReader,
    upgrader: Arc<ChannelFactory>,
    context: Arc<PeerContext>,
    config: MuxConfig,
    streams: HashMap<u64, StreamSlot>,
    next_stream: u64,
    frames: mpsc::UnboundedSender<Frame>,
}

impl Session {
    fn new(
        dialer: bool,
        conn: Channel,
        reader: FrameReader,
        upgrader: Arc<ChannelFactory>,
        context: Arc<PeerContext>,
        config: MuxConfig,
    ) -> Self {
        let (frames, rx) = mpsc::unbounded_channel();
        spawn_writer(conn.clone(), rx);
        Self {
            dialer,
            conn,
            reader,
            upgrader,
            context,
            config,
            streams: HashMap::new(),
            next_stream: if dialer { 1 } else { 2 },
            frames,
        }
    }

    async fn run(mut self) -> PeerResult<()> {
        let mut requests = self
            .context
            .take_requests()
            .ok_or(PeerError::AlreadyConfigured("request queue"))?;
        let result = loop {
            tokio::select! {
                frame = self.reader.next() => match frame {
                    Ok(Some(frame)) => {
                        if let Err(e) = self.on_frame(frame).await {
                            break Err(e);
                        }
                    }
                    Ok(None) => break Ok(()),
                    Err(e) => break Err(e),
                },
                Some(request) = requests.next() => self.open_stream(request),
            }
        };
        if let Err(e) = &result {
            warn!(ctx = %self.context.id(), error = %e, "connection failed");
        }
        self.shutdown(&mut requests);
        result
    }

    fn send(&self, frame: Frame) {
        let _ = self.frames.send(frame);
    }

    fn open_stream(&mut self, request: ChannelRequest) {
        let stream = self.next_stream;
        self.next_stream += 2;
        debug!(ctx = %self.context.id(), stream, protocol = request.protocol_id(), "opening stream");
        let protocol = request.protocol_id().to_string();
        self.streams.insert(stream, StreamSlot::Opening(request));
        self.send(Frame::Open { stream, protocol });
    }

    /// Handle one inbound frame. Only connection-level violations are errors;
    /// stream-level ones affect that stream alone.
    async fn on_frame(&mut self, frame: Frame) -> PeerResult<()> {
        let ctx = self.context.id();
        match frame {
            Frame::Hello { .. } => {
                return Err(PeerError::ProtocolViolation("hello after handshake".into()));
            }
            Frame::Open { stream, protocol } => self.accept_stream(stream, protocol),
            Frame::Accept { stream } => match self.streams.remove(&stream) {
                Some(StreamSlot::Opening(request)) => {
                    debug!(%ctx, stream, protocol = request.protocol_id(), "stream accepted");
                    let channel = self.spawn_stream(stream);
                    self.upgrader.sub_dial(self.context.clone(), request, channel);
                }
                Some(open) => {
                    warn!(%ctx, stream, "duplicate accept");
                    self.streams.insert(stream, open);
                }
                None => warn!(%ctx, stream, "accept for unknown stream"),
            },
            Frame::Reject { stream, reason } => match self.streams.remove(&stream) {
                Some(StreamSlot::Opening(request)) => {
                    debug!(%ctx, stream, %reason, "stream rejected");
                    let id = request.protocol_id().to_string();
                    request.fail(PeerError::UnknownProtocol(id));
                }
                Some(open) => {
                    warn!(%ctx, stream, "reject for open stream");
                    self.streams.insert(stream, open);
                }
                None => warn!(%ctx, stream, "reject for unknown stream"),
            },
            Frame::Data { stream, payload } => match self.streams.get(&stream) {
                Some(StreamSlot::Open(channel)) => {
                    // closed locally; the pump already sent Close
                    let _ = channel.write(payload).await;
                }
                Some(StreamSlot::Opening(_)) => {
                    warn!(%ctx, stream, "data before accept");
                    if let Some(StreamSlot::Opening(request)) = self.streams.remove(&stream) {
                        request.fail(PeerError::ProtocolViolation("data before accept".into()));
                    }
                    self.send(Frame::Close { stream });
                }
                None => debug!(%ctx, stream, "data for unknown stream dropped"),
            },
            Frame::Close { stream } => match self.streams.remove(&stream) {
                Some(StreamSlot::Open(channel)) => channel.close(),
                Some(StreamSlot::Opening(request)) => request.fail(PeerError::ConnectionClosed),
                None => {}
            },
        }
        Ok(())
    }

    fn accept_stream(&mut self, stream: u64, protocol: String) {
        let ctx = self.context.id();
        // remote numbering: odd when the remote dialed
        let remote_odd = !self.dialer;
        if (stream % 2 == 1) != remote_odd || self.streams.contains_key(&stream) {
            warn!(%ctx, stream, "invalid stream id");
            self.send(Frame::Reject {
                stream,
                reason: "invalid stream id".into(),
            });
            return;
        }
        if !self.upgrader.supports(&protocol) {
            debug!(%ctx, stream, %protocol, "rejecting unknown protocol");
            self.send(Frame::Reject {
                stream,
                reason: format!("unknown protocol {}", protocol),
            });
            return;
        }
        let channel = self.spawn_stream(stream);
        self.send(Frame::Accept { stream });
        debug!(%ctx, stream, %protocol, "stream opened by remote");
        if let Err(e) = self
            .upgrader
            .sub_listen(self.context.clone(), &protocol, channel)
        {
            warn!(%ctx, stream, error = %e, "sub-protocol listener not started");
        }
    }

    /// Register an open stream and start pumping what the sub-protocol writes
    /// into `Data` frames. Returns the sub-protocol's end.
    fn spawn_stream(&mut self, stream: u64) -> Channel {
        let (mux_end, protocol_end) = Channel::pair();
        self.streams.insert(stream, StreamSlot::Open(mux_end.clone()));
        let frames = self.frames.clone();
        let max_payload = self.config.max_payload;
        tokio::spawn(async move {
            while let Ok(bytes) = mux_end.read(max_payload, ReadMode::WaitAny).await {
                let frame = Frame::Data {
                    stream,
                    payload: bytes.to_vec(),
                };
                if frames.send(frame).is_err() {
                    return;
                }
            }
            let _ = frames.send(Frame::Close { stream });
        });
        protocol_end
    }

    fn shutdown(&mut self, requests: &mut RequestQueue) {
        for (_, slot) in self.streams.drain() {
            match slot {
                StreamSlot::Open(channel) => channel.close(),
                StreamSlot::Opening(request) => request.fail(PeerError::ConnectionClosed),
            }
        }
        requests.fail_all();
        self.conn.close();
        debug!(ctx = %self.context.id(), "connection closed");
    }
}

fn spawn_writer(conn: Channel, mut frames: mpsc::UnboundedReceiver<Frame>) {
    tokio::spawn(async move {
        while let Some(frame) = frames.recv().await {
            match write_frame(&conn, &frame).await {
                Ok(()) => {}
                Err(PeerError::ConnectionClosed) => break,
                Err(e) => warn!(kind = frame.kind(), error = %e, "frame dropped"),
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Identity;

    #[tokio::test]
    async fn reader_reassembles_split_frames() {
        let (a, b) = Channel::pair();
        let frame = Frame::Open {
            stream: 3,
            protocol: "/x/1".into(),
        };
        let bytes = encode_frame(&frame).unwrap();
        let (head, tail) = bytes.split_at(3);
        a.write(head.to_vec()).await.unwrap();
        a.write(tail.to_vec()).await.unwrap();
        let mut reader = FrameReader::new(b);
        assert_eq!(reader.next().await.unwrap(), Some(frame));
        a.close();
        assert_eq!(reader.next().await.unwrap(), None);
    }

    #[tokio::test]
    async fn handshake_exchanges_keys() {
        let (a, b) = Channel::pair();
        let left = Identity::generate();
        let right = Identity::generate();
        let timeout = Duration::from_secs(1);
        let mut left_reader = FrameReader::new(a.clone());
        let mut right_reader = FrameReader::new(b.clone());
        let (l, r) = tokio::join!(
            handshake(&a, &mut left_reader, *left.public_key(), timeout),
            handshake(&b, &mut right_reader, *right.public_key(), timeout),
        );
        assert_eq!(l.unwrap(), *right.public_key());
        assert_eq!(r.unwrap(), *left.public_key());
    }

    #[tokio::test]
    async fn handshake_rejects_other_frames() {
        let (a, b) = Channel::pair();
        write_frame(&b, &Frame::Close { stream: 1 }).await.unwrap();
        let mut reader = FrameReader::new(a.clone());
        let key = *Identity::generate().public_key();
        let result = handshake(&a, &mut reader, key, Duration::from_secs(1)).await;
        assert!(matches!(result, Err(PeerError::ProtocolViolation(_))));
    }

    #[tokio::test]
    async fn handshake_times_out() {
        let (a, _b) = Channel::pair();
        let mut reader = FrameReader::new(a.clone());
        let key = *Identity::generate().public_key();
        let result = handshake(&a, &mut reader, key, Duration::from_millis(20)).await;
        assert!(matches!(result, Err(PeerError::ProtocolViolation(_))));
    }

    #[tokio::test]
    async fn garbage_is_protocol_violation() {
        let (a, b) = Channel::pair();
        let mut bad = 4u32.to_le_bytes().to_vec();
        bad.extend_from_slice(&[0xff; 4]);
        a.write(bad).await.unwrap();
        let mut reader = FrameReader::new(b);
        assert!(matches!(
            reader.next().await,
            Err(PeerError::ProtocolViolation(_))
        ));
    }
}
