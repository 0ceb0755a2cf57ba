use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;

use crate::{
    codec::Codecs,
    msg::{ProtocolMessage, Step},
};

/// An ordered, point-to-point message channel.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Queues `msg` for delivery without waiting for it to be written.
    fn send(&self, msg: ProtocolMessage) -> Result<()>;

    /// The next inbound message, or `None` once the channel has closed.
    async fn recv(&self) -> Option<ProtocolMessage>;

    /// Closes the outbound side; the peer sees `None` after draining.
    fn close(&self);
}

/// One end of an in-process channel pair.
pub struct MemoryChannel {
    tx: async_channel::Sender<ProtocolMessage>,
    rx: async_channel::Receiver<ProtocolMessage>,
}

pub fn pair() -> (MemoryChannel, MemoryChannel) {
    let (left_tx, left_rx) = async_channel::unbounded();
    let (right_tx, right_rx) = async_channel::unbounded();
    (
        MemoryChannel {
            tx: left_tx,
            rx: right_rx,
        },
        MemoryChannel {
            tx: right_tx,
            rx: left_rx,
        },
    )
}

impl MemoryChannel {
    pub fn try_recv(&self) -> Option<ProtocolMessage> {
        self.rx.try_recv().ok()
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    fn send(&self, msg: ProtocolMessage) -> Result<()> {
        self.tx
            .try_send(msg)
            .map_err(|_| anyhow!("channel closed"))
    }

    async fn recv(&self) -> Option<ProtocolMessage> {
        self.rx.recv().await.ok()
    }

    fn close(&self) {
        self.tx.close();
    }
}

/// Builds and sends messages from one service to another, encoding bodies
/// with a codec the destination understands.
pub(crate) struct Outbox {
    channel: Arc<dyn Channel>,
    codecs: Arc<Codecs>,
    remote_codecs: Vec<String>,
    from_service: String,
    to_service: String,
}

impl Outbox {
    pub(crate) fn new(
        channel: Arc<dyn Channel>,
        codecs: Arc<Codecs>,
        remote_codecs: Vec<String>,
        from_service: &str,
        to_service: &str,
    ) -> Self {
        Self {
            channel,
            codecs,
            remote_codecs,
            from_service: from_service.to_owned(),
            to_service: to_service.to_owned(),
        }
    }

    pub(crate) fn message<T: Serialize + ?Sized>(
        &self,
        step: Step,
        body: &T,
    ) -> Result<ProtocolMessage> {
        let encoded = self.codecs.encode(body, &self.remote_codecs)?;
        Ok(ProtocolMessage::new(
            step,
            &self.from_service,
            &self.to_service,
            encoded,
        ))
    }

    pub(crate) fn deliver(&self, msg: ProtocolMessage) -> Result<()> {
        debug!("send {} [{}] to {}", msg.step, msg.id, msg.to_service);
        self.channel.send(msg)
    }

    pub(crate) fn send<T: Serialize + ?Sized>(&self, step: Step, body: &T) -> Result<()> {
        let msg = self.message(step, body)?;
        self.deliver(msg)
    }
}
