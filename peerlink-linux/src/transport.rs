//! TCP transport: each socket is bridged into a core `Channel`.

use std::net::SocketAddr;

use async_trait::async_trait;
use bytes::Bytes;
use peerlink_core::{
    AddrComponent, Channel, Multiaddr, PeerError, PeerResult, ReadMode, Transport,
    TransportListener,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, trace};

const READ_BUF: usize = 16 * 1024;

/// Handles `/ip4|ip6/<ip>/tcp/<port>` addresses (a trailing `/p2p` is ignored).
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpTransport;

fn tcp_socket_addr(address: &Multiaddr) -> Option<SocketAddr> {
    let mut parts = address.iter();
    match (parts.next(), parts.next()) {
        (Some(AddrComponent::Ip4(_) | AddrComponent::Ip6(_)), Some(AddrComponent::Tcp(_))) => {
            address.socket_addr()
        }
        _ => None,
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn name(&self) -> &'static str {
        "tcp"
    }

    fn handles(&self, address: &Multiaddr) -> bool {
        tcp_socket_addr(address).is_some()
    }

    async fn dial(&self, address: &Multiaddr) -> PeerResult<Channel> {
        let target =
            tcp_socket_addr(address).ok_or_else(|| PeerError::UnsupportedAddress(address.clone()))?;
        let stream = TcpStream::connect(target)
            .await
            .map_err(|e| PeerError::Transport(format!("connect {}: {}", target, e)))?;
        stream.set_nodelay(true)?;
        debug!(%target, "tcp connected");
        Ok(bridge(stream))
    }

    async fn listen(&self, address: &Multiaddr) -> PeerResult<Box<dyn TransportListener>> {
        let bind =
            tcp_socket_addr(address).ok_or_else(|| PeerError::UnsupportedAddress(address.clone()))?;
        let listener = TcpListener::bind(bind)
            .await
            .map_err(|e| PeerError::Transport(format!("bind {}: {}", bind, e)))?;
        let local = Multiaddr::tcp(listener.local_addr()?);
        debug!(addr = %local, "tcp listener bound");
        Ok(Box::new(TcpAcceptor { listener, local }))
    }
}

struct TcpAcceptor {
    listener: TcpListener,
    local: Multiaddr,
}

#[async_trait]
impl TransportListener for TcpAcceptor {
    fn local_addr(&self) -> Multiaddr {
        self.local.clone()
    }

    async fn accept(&mut self) -> PeerResult<(Channel, Multiaddr)> {
        let (stream, peer) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        trace!(%peer, "tcp accepted");
        Ok((bridge(stream), Multiaddr::tcp(peer)))
    }
}

/// Move bytes between `stream` and a channel pair; returns the caller's end.
/// Closing the channel shuts the socket down once queued writes are flushed.
fn bridge(stream: TcpStream) -> Channel {
    let (user, io) = Channel::pair();
    let (mut rd, mut wr) = stream.into_split();

    let inbound = io.clone();
    tokio::spawn(async move {
        let mut buf = vec![0u8; READ_BUF];
        loop {
            tokio::select! {
                n = rd.read(&mut buf) => match n {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if inbound.write(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
                            break;
                        }
                    }
                },
                _ = inbound.closed() => break,
            }
        }
        inbound.close();
    });

    tokio::spawn(async move {
        while let Ok(bytes) = io.read(0, ReadMode::WaitAny).await {
            if wr.write_all(&bytes).await.is_err() {
                break;
            }
        }
        let _ = wr.shutdown().await;
        io.close();
    });

    user
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handles_ip_tcp_only() {
        let t = TcpTransport;
        assert!(t.handles(&"/ip4/127.0.0.1/tcp/1".parse().unwrap()));
        assert!(t.handles(&"/ip6/::1/tcp/1".parse().unwrap()));
        assert!(!t.handles(&"/ip4/127.0.0.1/udp/1".parse().unwrap()));
        assert!(!t.handles(&Multiaddr::memory(1)));
        assert!(!t.handles(&"/dns/example.com/tcp/1".parse().unwrap()));
    }

    #[tokio::test]
    async fn bytes_cross_the_socket() {
        let t = TcpTransport;
        let mut listener = t.listen(&"/ip4/127.0.0.1/tcp/0".parse().unwrap()).await.unwrap();
        let bound = listener.local_addr();
        assert_ne!(bound.socket_addr().unwrap().port(), 0);

        let client = t.dial(&bound).await.unwrap();
        let (server, _peer) = listener.accept().await.unwrap();
        client.write(&b"over tcp"[..]).await.unwrap();
        let got = server.read(8, ReadMode::WaitAll).await.unwrap();
        assert_eq!(&got[..], b"over tcp");

        client.close();
        let closed = tokio::time::timeout(std::time::Duration::from_secs(5), server.closed()).await;
        assert!(closed.is_ok());
    }
}
