//! Protocol plug-ins and the registry that instantiates them by id.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::channel::Channel;
use crate::context::{ChannelRequest, PeerContext};
use crate::error::{PeerError, PeerResult};

/// A unit of protocol logic. `dial` and `listen` run until the session over
/// `channel` ends.
#[async_trait]
pub trait Protocol: Send + Sync {
    /// Stable identifier exchanged during negotiation, e.g. `/ping/1.0.0`.
    fn id(&self) -> &str;

    async fn dial(
        &self,
        channel: Channel,
        upgrader: Arc<ChannelFactory>,
        context: Arc<PeerContext>,
    ) -> PeerResult<()>;

    async fn listen(
        &self,
        channel: Channel,
        upgrader: Arc<ChannelFactory>,
        context: Arc<PeerContext>,
    ) -> PeerResult<()>;
}

type Constructor = Arc<dyn Fn() -> Arc<dyn Protocol> + Send + Sync>;

/// Protocol id to constructor map. Fixed once the factory is built.
#[derive(Clone, Default)]
pub struct ProtocolRegistry {
    constructors: BTreeMap<String, Constructor>,
}

impl ProtocolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a constructor called once per session.
    pub fn register<F>(&mut self, id: impl Into<String>, constructor: F) -> PeerResult<()>
    where
        F: Fn() -> Arc<dyn Protocol> + Send + Sync + 'static,
    {
        let id = id.into();
        if self.constructors.contains_key(&id) {
            return Err(PeerError::AlreadyConfigured("protocol id"));
        }
        self.constructors.insert(id, Arc::new(constructor));
        Ok(())
    }

    /// Register a shared instance under its own id.
    pub fn register_instance(&mut self, protocol: Arc<dyn Protocol>) -> PeerResult<()> {
        let id = protocol.id().to_string();
        self.register(id, move || protocol.clone())
    }

    pub fn instantiate(&self, id: &str) -> PeerResult<Arc<dyn Protocol>> {
        self.constructors
            .get(id)
            .map(|constructor| constructor())
            .ok_or_else(|| PeerError::UnknownProtocol(id.to_string()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.constructors.contains_key(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.constructors.keys().map(String::as_str)
    }
}

/// Runs sub-protocol sessions over negotiated sub-streams. Handed to the
/// outer protocol as its upgrade factory.
pub struct ChannelFactory {
    registry: ProtocolRegistry,
}

impl ChannelFactory {
    pub fn new(registry: ProtocolRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &ProtocolRegistry {
        &self.registry
    }

    pub fn supports(&self, id: &str) -> bool {
        self.registry.contains(id)
    }

    /// Run the dialer side of `request` over `channel` and resolve the request
    /// with the session result. The channel is closed when the session ends.
    pub fn sub_dial(
        self: &Arc<Self>,
        context: Arc<PeerContext>,
        request: ChannelRequest,
        channel: Channel,
    ) -> JoinHandle<()> {
        let upgrader = self.clone();
        tokio::spawn(async move {
            let protocol = match upgrader.registry.instantiate(request.protocol_id()) {
                Ok(protocol) => protocol,
                Err(e) => {
                    channel.close();
                    request.fail(e);
                    return;
                }
            };
            let token = request.token().clone();
            channel.close_on(&token);
            let ctx = context.id();
            let result = tokio::select! {
                result = protocol.dial(channel.clone(), upgrader.clone(), context) => result,
                _ = token.cancelled() => Err(PeerError::Cancelled),
            };
            channel.close();
            match &result {
                Ok(()) => debug!(%ctx, protocol = protocol.id(), "sub-protocol dialer finished"),
                Err(e) => debug!(%ctx, protocol = protocol.id(), error = %e, "sub-protocol dialer failed"),
            }
            request.complete(result);
        })
    }

    /// Run the listener side of `protocol_id` over `channel`.
    pub fn sub_listen(
        self: &Arc<Self>,
        context: Arc<PeerContext>,
        protocol_id: &str,
        channel: Channel,
    ) -> PeerResult<JoinHandle<PeerResult<()>>> {
        let protocol = match self.registry.instantiate(protocol_id) {
            Ok(protocol) => protocol,
            Err(e) => {
                channel.close();
                return Err(e);
            }
        };
        let upgrader = self.clone();
        Ok(tokio::spawn(async move {
            let ctx = context.id();
            let result = protocol.listen(channel.clone(), upgrader, context).await;
            channel.close();
            if let Err(e) = &result {
                warn!(%ctx, protocol = protocol.id(), error = %e, "sub-protocol listener failed");
            }
            result
        }))
    }
}
