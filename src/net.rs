//! TCP transport: one subscription per connection, each message framed as
//! a little-endian `u32` length followed by the MessagePack-encoded
//! [`ProtocolMessage`].

use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::{
    io::AsyncWriteExt,
    net::{TcpListener, TcpStream, ToSocketAddrs},
};
use tracing::{debug, error, info};

use crate::{
    io::{read_packet, write_packet},
    msg::{ProtocolMessage, Step},
    server::ServerStack,
    transport::Channel,
};

pub struct TcpChannel {
    tx: async_channel::Sender<ProtocolMessage>,
    rx: async_channel::Receiver<ProtocolMessage>,
    remote_addr: String,
}

impl TcpChannel {
    /// Splits `stream` into a writer task fed by [`Channel::send`] and a
    /// reader task feeding [`Channel::recv`]. A read failure is reported as
    /// one `ConnectionFailure` event before the channel closes.
    pub fn new(stream: TcpStream) -> Result<Self> {
        let remote_addr = stream.peer_addr()?.to_string();
        let (mut reader, mut writer) = stream.into_split();
        let (out_tx, out_rx) = async_channel::unbounded::<ProtocolMessage>();
        let (in_tx, in_rx) = async_channel::unbounded::<ProtocolMessage>();
        info!("connection ++: {}", remote_addr);

        let addr = remote_addr.clone();
        tokio::spawn(async move {
            while let Ok(msg) = out_rx.recv().await {
                debug!("send {} [{}] to {}", msg.step, msg.id, addr);
                if let Err(e) = write_packet(&mut writer, &msg).await {
                    error!("write to {}: {}", addr, e);
                    break;
                }
            }
            if let Err(e) = writer.shutdown().await {
                debug!("shutdown {}: {}", addr, e);
            }
        });

        let addr = remote_addr.clone();
        tokio::spawn(async move {
            loop {
                match read_packet::<_, ProtocolMessage>(&mut reader).await {
                    Ok(Some(msg)) => {
                        if in_tx.send(msg).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        error!("read from {}: {}", addr, e);
                        let event = ProtocolMessage::transport_event(Step::ConnectionFailure, &addr);
                        if in_tx.send(event).await.is_err() {
                            debug!("no reader left for {}", addr);
                        }
                        break;
                    }
                }
            }
            in_tx.close();
            info!("connection --: {}", addr);
        });

        Ok(Self {
            tx: out_tx,
            rx: in_rx,
            remote_addr,
        })
    }

    pub fn remote_addr(&self) -> &str {
        &self.remote_addr
    }
}

#[async_trait]
impl Channel for TcpChannel {
    fn send(&self, msg: ProtocolMessage) -> Result<()> {
        self.tx
            .try_send(msg)
            .map_err(|_| anyhow!("connection to {} closed", self.remote_addr))
    }

    async fn recv(&self) -> Option<ProtocolMessage> {
        self.rx.recv().await.ok()
    }

    fn close(&self) {
        self.tx.close();
    }
}

pub async fn connect<A: ToSocketAddrs>(addr: A) -> Result<TcpChannel> {
    let stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    TcpChannel::new(stream)
}

/// Accepts connections forever, handing each to `stack`.
pub async fn serve(listener: TcpListener, stack: Arc<ServerStack>) -> Result<()> {
    info!("listening on {}", listener.local_addr()?);
    loop {
        let (stream, _) = listener.accept().await?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!("set_nodelay: {}", e);
        }
        match TcpChannel::new(stream) {
            Ok(channel) => {
                stack.accept(Arc::new(channel));
            }
            Err(e) => error!("accept: {}", e),
        }
    }
}
