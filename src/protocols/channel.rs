//! Full-duplex channel to a connected back-end peer.
//!
//! Peers connect over TCP and speak newline-delimited JSON hub messages.
//! One channel task owns the transport: it drains an unbounded outbound
//! queue in enqueue order and dispatches inbound messages, matching replies
//! to waiters by id. When the transport goes away every pending reply fails
//! with a peer-gone error and the peer is unregistered.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{Framed, LinesCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::protocols::messages::{
    AskRequestMsg, FileUploadRequest, HubMessage,
};
use crate::protocols::registry::Registry;
use crate::utils::{ident, BridgeError, BridgeResult};

/// Longest accepted NDJSON line, aligned with the plist cap.
const MAX_LINE_BYTES: usize = 1024 * 1024;

static NEXT_MESSAGE_ID: AtomicU64 = AtomicU64::new(1);

fn next_message_id() -> u64 {
    NEXT_MESSAGE_ID.fetch_add(1, Ordering::Relaxed)
}

/// A connected back-end peer as the rest of the bridge sees it.
pub struct Peer {
    /// Receiver id: mDNS instance label and `Host` header routing key.
    pub id: String,
    /// URL prefix the peer downloads delivered files from.
    pub base_url: String,
    display_name: RwLock<String>,
    outbound: mpsc::UnboundedSender<Outbound>,
}

struct Outbound {
    message: HubMessage,
    reply: Option<oneshot::Sender<HubMessage>>,
}

impl Peer {
    /// Create a peer and the channel half that drives its transport. The
    /// display name starts out as the id until the peer's `connect` message
    /// renames it.
    pub fn new(id: String, base_url: String) -> (Arc<Peer>, PeerChannel) {
        let (tx, rx) = mpsc::unbounded_channel();
        let peer = Arc::new(Peer {
            display_name: RwLock::new(id.clone()),
            id,
            base_url,
            outbound: tx,
        });
        let channel = PeerChannel {
            peer: peer.clone(),
            outbound: rx,
        };
        (peer, channel)
    }

    pub fn display_name(&self) -> String {
        self.display_name
            .read()
            .expect("display name lock poisoned")
            .clone()
    }

    fn set_display_name(&self, name: String) {
        *self
            .display_name
            .write()
            .expect("display name lock poisoned") = name;
    }

    /// Forward an ask to the peer and wait for its decision.
    pub async fn ask(&self, request: AskRequestMsg) -> BridgeResult<bool> {
        let message = HubMessage::AskRequest(AskRequestMsg {
            id: next_message_id(),
            reply_to: None,
            ..request
        });
        match self.request(message).await? {
            HubMessage::AskResponse(response) => Ok(response.accepted),
            other => Err(BridgeError::Channel(format!(
                "unexpected {} reply to askRequest",
                other.variant()
            ))),
        }
    }

    /// Tell the peer a delivered file is ready at `url`; resolves once the
    /// peer acknowledges it.
    pub async fn notify_uploaded(&self, name: String, url: String) -> BridgeResult<()> {
        let message = HubMessage::FileUploadRequest(FileUploadRequest {
            id: next_message_id(),
            reply_to: None,
            name,
            url,
        });
        match self.request(message).await? {
            HubMessage::FileUploadResponse(_) => Ok(()),
            other => Err(BridgeError::Channel(format!(
                "unexpected {} reply to fileUploadRequest",
                other.variant()
            ))),
        }
    }

    /// Enqueue a message without waiting for a reply.
    pub fn push(&self, message: HubMessage) -> BridgeResult<()> {
        self.outbound
            .send(Outbound {
                message,
                reply: None,
            })
            .map_err(|_| BridgeError::PeerGone)
    }

    async fn request(&self, message: HubMessage) -> BridgeResult<HubMessage> {
        let (tx, rx) = oneshot::channel();
        self.outbound
            .send(Outbound {
                message,
                reply: Some(tx),
            })
            .map_err(|_| BridgeError::PeerGone)?;
        rx.await.map_err(|_| BridgeError::PeerGone)
    }
}

/// The transport-driving half of a peer connection.
pub struct PeerChannel {
    peer: Arc<Peer>,
    outbound: mpsc::UnboundedReceiver<Outbound>,
}

impl PeerChannel {
    /// Drive the channel until the transport closes or `cancel` fires.
    ///
    /// Outbound messages hit the wire in enqueue order. Dropping the
    /// pending-reply table on exit is what fails every waiter.
    pub async fn run<T>(mut self, io: T, cancel: CancellationToken)
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        let mut framed = Framed::new(io, LinesCodec::new_with_max_length(MAX_LINE_BYTES));
        let mut pending: HashMap<u64, oneshot::Sender<HubMessage>> = HashMap::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                outbound = self.outbound.recv() => match outbound {
                    Some(Outbound { message, reply }) => {
                        let line = match serde_json::to_string(&message) {
                            Ok(line) => line,
                            Err(e) => {
                                warn!(peer = %self.peer.id, error = %e, "dropping unserialisable message");
                                continue;
                            }
                        };
                        // Record the waiter before the bytes can leave, so a
                        // fast reply always finds it.
                        if let Some(tx) = reply {
                            pending.insert(message.id(), tx);
                        }
                        if let Err(e) = framed.send(line).await {
                            warn!(peer = %self.peer.id, error = %e, "transport write failed");
                            break;
                        }
                    }
                    None => break,
                },
                inbound = framed.next() => match inbound {
                    Some(Ok(line)) => self.handle_line(&line, &mut pending),
                    Some(Err(e)) => {
                        warn!(peer = %self.peer.id, error = %e, "transport read failed");
                        break;
                    }
                    None => {
                        info!(peer = %self.peer.id, "peer disconnected");
                        break;
                    }
                },
            }
        }
    }

    fn handle_line(&self, line: &str, pending: &mut HashMap<u64, oneshot::Sender<HubMessage>>) {
        let message: HubMessage = match serde_json::from_str(line) {
            Ok(message) => message,
            Err(e) => {
                warn!(peer = %self.peer.id, error = %e, "dropping undecodable message");
                return;
            }
        };

        if let Some(reply_to) = message.reply_to() {
            match pending.remove(&reply_to) {
                // The waiter may have been cancelled; a dead oneshot is fine.
                Some(tx) => {
                    let _ = tx.send(message);
                }
                None => {
                    warn!(peer = %self.peer.id, reply_to, "reply for unknown request id")
                }
            }
            return;
        }

        match message {
            HubMessage::Connect(connect) => {
                if connect.name.is_empty() {
                    debug!(peer = %self.peer.id, "connect without a name, keeping id");
                } else {
                    info!(peer = %self.peer.id, name = %connect.name, "peer introduced itself");
                    self.peer.set_display_name(connect.name);
                }
            }
            other => {
                debug!(peer = %self.peer.id, variant = other.variant(), "unhandled unsolicited message")
            }
        }
    }
}

/// Accept loop for the peer transport: one TCP connection is one peer,
/// registered for its lifetime and unregistered when the channel ends.
/// Files delivered for the peer are removed with it, best-effort.
pub async fn serve_peers(
    listener: TcpListener,
    registry: Arc<Registry>,
    https_port: u16,
    upload_root: std::path::PathBuf,
    cancel: CancellationToken,
) {
    info!("peer transport listening");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, remote)) => {
                    let registry = registry.clone();
                    let cancel = cancel.clone();
                    let upload_root = upload_root.clone();
                    tokio::spawn(async move {
                        let id = ident::random_id();
                        let base_url = match stream.local_addr() {
                            Ok(addr) => {
                                format!("https://{}:{https_port}/uploads/{id}", url_host(&addr.ip()))
                            }
                            Err(_) => format!("https://localhost:{https_port}/uploads/{id}"),
                        };
                        let (peer, channel) = Peer::new(id, base_url);
                        info!(peer = %peer.id, %remote, "peer connected");
                        registry.register_peer(peer.clone()).await;
                        channel.run(stream, cancel).await;
                        registry.unregister_peer(&peer.id).await;
                        if let Err(e) = tokio::fs::remove_dir_all(upload_root.join(&peer.id)).await {
                            if e.kind() != std::io::ErrorKind::NotFound {
                                debug!(peer = %peer.id, error = %e, "could not remove delivered files");
                            }
                        }
                    });
                }
                Err(e) => {
                    warn!(error = %e, "peer accept failed");
                    break;
                }
            },
        }
    }
    debug!("peer transport stopped");
}

fn url_host(ip: &IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) => format!("[{v6}]"),
    }
}
