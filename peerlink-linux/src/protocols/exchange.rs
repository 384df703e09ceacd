//! `/peer-exchange/1.0.0`: swap listener addresses, then known peers.
//!
//! Each side sends two sections. A section opens and closes with a `SIGNAL`
//! byte and carries `ADDRESS` records (`0x01`, u16 LE length, UTF-8
//! multiaddr). The listener section carries exactly one record. The listening
//! side sends first in each round.

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use peerlink_core::{
    Channel, ChannelFactory, Multiaddr, PeerContext, PeerError, PeerResult, Protocol, ReadMode,
};
use tracing::{debug, info};

use crate::routing::RoutingTable;

pub const EXCHANGE_PROTOCOL_ID: &str = "/peer-exchange/1.0.0";

const SIGNAL: u8 = 0x00;
const ADDRESS: u8 = 0x01;

pub struct PeerExchange {
    table: Arc<RoutingTable>,
}

impl PeerExchange {
    pub fn new(table: Arc<RoutingTable>) -> Self {
        Self { table }
    }

    async fn send_listener(&self, channel: &Channel) -> PeerResult<()> {
        let own = self.table.local_listener_address()?.clone();
        send_section(channel, &[own]).await
    }

    async fn receive_listener(&self, channel: &Channel, context: &PeerContext) -> PeerResult<()> {
        let mut addresses = receive_section(channel).await?;
        if addresses.len() != 1 {
            return Err(PeerError::ProtocolViolation(format!(
                "expected one listener address, got {}",
                addresses.len()
            )));
        }
        let mut address = addresses.remove(0);
        if let Some(seen) = context.remote_address().and_then(|a| a.socket_addr()) {
            address = with_observed_ip(address, seen.ip());
        }
        debug!(ctx = %context.id(), addr = %address, "received listener address");
        self.table.add(address);
        Ok(())
    }

    async fn send_peers(&self, channel: &Channel) -> PeerResult<()> {
        send_section(channel, &self.table.peers()).await
    }

    async fn receive_peers(&self, channel: &Channel, context: &PeerContext) -> PeerResult<()> {
        let addresses = receive_section(channel).await?;
        info!(ctx = %context.id(), count = addresses.len(), "received peers");
        for address in addresses {
            self.table.add(address);
        }
        Ok(())
    }
}

#[async_trait]
impl Protocol for PeerExchange {
    fn id(&self) -> &str {
        EXCHANGE_PROTOCOL_ID
    }

    async fn dial(
        &self,
        channel: Channel,
        _upgrader: Arc<ChannelFactory>,
        context: Arc<PeerContext>,
    ) -> PeerResult<()> {
        self.receive_listener(&channel, &context).await?;
        self.send_listener(&channel).await?;
        self.receive_peers(&channel, &context).await?;
        self.send_peers(&channel).await
    }

    async fn listen(
        &self,
        channel: Channel,
        _upgrader: Arc<ChannelFactory>,
        context: Arc<PeerContext>,
    ) -> PeerResult<()> {
        self.send_listener(&channel).await?;
        self.receive_listener(&channel, &context).await?;
        self.send_peers(&channel).await?;
        self.receive_peers(&channel, &context).await
    }
}

/// An unspecified listener IP is replaced by the IP the connection came from.
fn with_observed_ip(address: Multiaddr, seen: IpAddr) -> Multiaddr {
    let unspecified = address
        .socket_addr()
        .is_some_and(|a| a.ip().is_unspecified());
    if !unspecified {
        return address;
    }
    address.with_ip(seen)
}

fn encode_section(addresses: &[Multiaddr]) -> PeerResult<Vec<u8>> {
    let mut out = vec![SIGNAL];
    for address in addresses {
        let text = address.to_string();
        let len = u16::try_from(text.len()).map_err(|_| {
            PeerError::ProtocolViolation(format!("address too long: {} bytes", text.len()))
        })?;
        out.push(ADDRESS);
        out.extend_from_slice(&len.to_le_bytes());
        out.extend_from_slice(text.as_bytes());
    }
    out.push(SIGNAL);
    Ok(out)
}

async fn send_section(channel: &Channel, addresses: &[Multiaddr]) -> PeerResult<()> {
    channel.write(encode_section(addresses)?).await?;
    Ok(())
}

async fn read_byte(channel: &Channel) -> PeerResult<u8> {
    let b = channel.read(1, ReadMode::WaitAll).await?;
    Ok(b[0])
}

async fn receive_section(channel: &Channel) -> PeerResult<Vec<Multiaddr>> {
    if read_byte(channel).await? != SIGNAL {
        return Err(PeerError::ProtocolViolation("missing section marker".into()));
    }
    let mut addresses = Vec::new();
    loop {
        match read_byte(channel).await? {
            SIGNAL => return Ok(addresses),
            ADDRESS => {
                let len = channel.read(2, ReadMode::WaitAll).await?;
                let len = u16::from_le_bytes([len[0], len[1]]) as usize;
                let text = channel.read(len, ReadMode::WaitAll).await?;
                let text = std::str::from_utf8(&text)
                    .map_err(|_| PeerError::ProtocolViolation("address is not utf-8".into()))?;
                let address: Multiaddr = text.parse().map_err(|e| {
                    PeerError::ProtocolViolation(format!("bad address {:?}: {}", text, e))
                })?;
                addresses.push(address);
            }
            other => {
                return Err(PeerError::ProtocolViolation(format!(
                    "unexpected record type {:#04x}",
                    other
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use peerlink_core::Identity;

    fn addr(s: &str) -> Multiaddr {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn section_crosses_a_channel() {
        let (a, b) = Channel::pair();
        let id = Identity::generate().peer_id();
        let sent = vec![
            addr("/ip4/10.0.0.1/tcp/1").with_peer_id(id),
            addr("/ip6/::1/tcp/2"),
        ];
        send_section(&a, &sent).await.unwrap();
        send_section(&a, &[]).await.unwrap();
        assert_eq!(receive_section(&b).await.unwrap(), sent);
        assert!(receive_section(&b).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_marker_is_a_violation() {
        let (a, b) = Channel::pair();
        a.write(vec![ADDRESS, 1, 0, b'/']).await.unwrap();
        let err = receive_section(&b).await.unwrap_err();
        assert!(matches!(err, PeerError::ProtocolViolation(_)));
    }

    #[tokio::test]
    async fn garbage_address_is_a_violation() {
        let (a, b) = Channel::pair();
        let mut bytes = vec![SIGNAL, ADDRESS, 3, 0];
        bytes.extend_from_slice(b"abc");
        bytes.push(SIGNAL);
        a.write(bytes).await.unwrap();
        let err = receive_section(&b).await.unwrap_err();
        assert!(matches!(err, PeerError::ProtocolViolation(_)));
    }

    #[tokio::test]
    async fn truncated_section_reports_close() {
        let (a, b) = Channel::pair();
        a.write(vec![SIGNAL, ADDRESS, 9]).await.unwrap();
        a.close();
        let err = receive_section(&b).await.unwrap_err();
        assert!(err.is_connection_closed());
    }

    #[test]
    fn observed_ip_only_replaces_unspecified() {
        let seen: IpAddr = "192.168.0.9".parse().unwrap();
        let wildcard = with_observed_ip(addr("/ip4/0.0.0.0/tcp/7"), seen);
        assert_eq!(wildcard, addr("/ip4/192.168.0.9/tcp/7"));
        let concrete = with_observed_ip(addr("/ip4/10.0.0.2/tcp/7"), seen);
        assert_eq!(concrete, addr("/ip4/10.0.0.2/tcp/7"));
        let over_v6 = with_observed_ip(addr("/ip4/0.0.0.0/tcp/7"), "fd00::9".parse().unwrap());
        assert_eq!(over_v6, addr("/ip6/fd00::9/tcp/7"));
        assert_eq!(over_v6.socket_addr(), Some("[fd00::9]:7".parse().unwrap()));
    }
}
