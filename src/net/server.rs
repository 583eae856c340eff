//! Gossip Server
//!
//! TCP listener accepting gossip connections from other nodes. Each
//! decoded envelope is forwarded into the inbound channel; the backlog
//! counter lets the gossiper's status check notice pile-ups.

use std::net::SocketAddr;
use std::sync::{Arc, RwLock};

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use super::read_envelope;
use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use crate::gossip::{GossipMessage, MessageBacklog};

pub struct GossipServer {
    bind_address: String,
    incoming_tx: mpsc::Sender<(Endpoint, GossipMessage)>,
    backlog: Arc<MessageBacklog>,
    local_addr: RwLock<Option<SocketAddr>>,
    shutdown: tokio::sync::watch::Sender<bool>,
}

impl GossipServer {
    pub fn new(
        bind_address: String,
        incoming_tx: mpsc::Sender<(Endpoint, GossipMessage)>,
        backlog: Arc<MessageBacklog>,
    ) -> Self {
        let (shutdown_tx, _) = tokio::sync::watch::channel(false);
        Self {
            bind_address,
            incoming_tx,
            backlog,
            local_addr: RwLock::new(None),
            shutdown: shutdown_tx,
        }
    }

    /// The address actually bound, available once `start` is listening
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.read().unwrap()
    }

    /// Accept connections until `stop` is called
    pub async fn start(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.bind_address).await?;
        let bound = listener.local_addr()?;
        *self.local_addr.write().unwrap() = Some(bound);
        tracing::info!("gossip server listening on {}", bound);

        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((socket, addr)) => {
                            let peer_addr = addr.to_string();
                            let incoming_tx = self.incoming_tx.clone();
                            let backlog = self.backlog.clone();

                            tokio::spawn(async move {
                                if let Err(e) =
                                    handle_connection(socket, &peer_addr, incoming_tx, backlog).await
                                {
                                    tracing::warn!("connection error from {}: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("gossip server stopped");
        Ok(())
    }

    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }
}

async fn handle_connection(
    socket: TcpStream,
    peer_addr: &str,
    incoming_tx: mpsc::Sender<(Endpoint, GossipMessage)>,
    backlog: Arc<MessageBacklog>,
) -> Result<()> {
    let (mut reader, _writer) = socket.into_split();

    loop {
        match read_envelope(&mut reader).await {
            Ok(envelope) => {
                tracing::trace!(
                    "received {} from {} ({})",
                    envelope.message.verb_name(),
                    envelope.from,
                    peer_addr
                );
                backlog.enqueued();
                if incoming_tx
                    .send((envelope.from, envelope.message))
                    .await
                    .is_err()
                {
                    break;
                }
            }
            Err(Error::Io(ref e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                // connection closed
                break;
            }
            Err(e) => {
                tracing::warn!("error reading gossip frame from {}: {}", peer_addr, e);
                break;
            }
        }
    }

    Ok(())
}
