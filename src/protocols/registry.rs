//! Registry of connected peers and the mDNS services advertised for them.
//!
//! Each peer is published as an `_airdrop._tcp` instance named by its
//! receiver id; the bridge itself is published once as `_airdrop_proxy._tcp`
//! so companion clients can find the server without configuration. HTTP
//! requests are routed back to peers by the first label of the `Host`
//! header.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::mdns::{Responder, ServiceInstance};
use crate::net::BridgeInterface;
use crate::protocols::channel::Peer;
use crate::protocols::flags::ReceiverFlags;

pub const AIRDROP_SERVICE: &str = "_airdrop._tcp.local";
pub const PROXY_SERVICE: &str = "_airdrop_proxy._tcp.local";

struct RegisteredPeer {
    peer: Arc<Peer>,
    service: ServiceInstance,
}

pub struct Registry {
    responder: Arc<Responder>,
    peers: RwLock<HashMap<String, RegisteredPeer>>,
    /// Endpoints advertised per peer instance: AWDL addresses at the HTTPS
    /// port, or every selected interface when no AWDL address exists.
    peer_endpoints: Vec<SocketAddr>,
    /// Endpoints for the proxy service: every selected interface.
    proxy_endpoints: Vec<SocketAddr>,
    proxy: ServiceInstance,
}

impl Registry {
    pub fn new(
        responder: Arc<Responder>,
        interfaces: &[BridgeInterface],
        listen_port: u16,
    ) -> Self {
        let proxy_endpoints: Vec<SocketAddr> = interfaces
            .iter()
            .flat_map(|iface| iface.unicast_addrs())
            .map(|ip| SocketAddr::new(ip, listen_port))
            .collect();
        let mut peer_endpoints: Vec<SocketAddr> = interfaces
            .iter()
            .filter(|iface| iface.is_awdl())
            .flat_map(|iface| iface.unicast_addrs())
            .map(|ip| SocketAddr::new(ip, listen_port))
            .collect();
        if peer_endpoints.is_empty() {
            peer_endpoints = proxy_endpoints.clone();
        }

        let proxy_name = proxy_instance_name();
        let proxy = ServiceInstance {
            service_name: PROXY_SERVICE.into(),
            instance_name: proxy_name.clone(),
            host_name: proxy_name,
            endpoints: proxy_endpoints.clone(),
            txt: Vec::new(),
        };

        Registry {
            responder,
            peers: RwLock::new(HashMap::new()),
            peer_endpoints,
            proxy_endpoints,
            proxy,
        }
    }

    /// Publish the peer's `_airdrop._tcp` instance and remember it for
    /// `Host`-header routing. Registering the same id again overwrites.
    pub async fn register_peer(&self, peer: Arc<Peer>) {
        let service = ServiceInstance {
            service_name: AIRDROP_SERVICE.into(),
            instance_name: peer.id.clone(),
            host_name: peer.id.clone(),
            endpoints: self.peer_endpoints.clone(),
            txt: vec![("flags".into(), ReceiverFlags::advertised().txt_value())],
        };
        self.responder.register(&service).await;
        info!(peer = %peer.id, endpoints = service.endpoints.len(), "peer advertised");
        self.peers
            .write()
            .await
            .insert(peer.id.clone(), RegisteredPeer { peer, service });
    }

    /// Withdraw the peer's advertisement. Unknown ids are a no-op.
    pub async fn unregister_peer(&self, id: &str) {
        let removed = self.peers.write().await.remove(id);
        if let Some(entry) = removed {
            self.responder.unregister(&entry.service).await;
            info!(peer = %id, "peer withdrawn");
        }
    }

    pub async fn lookup(&self, id: &str) -> Option<Arc<Peer>> {
        self.peers.read().await.get(id).map(|entry| entry.peer.clone())
    }

    /// Route an HTTP `Host` header value to its peer: the first label,
    /// before any dot or port, is the receiver id.
    pub async fn lookup_host(&self, host: &str) -> Option<Arc<Peer>> {
        let label = host_label(host);
        if label.is_empty() {
            return None;
        }
        let peer = self.lookup(label).await;
        if peer.is_none() {
            debug!(host, "no peer for host");
        }
        peer
    }

    /// Advertise the bridge's own HTTPS endpoint.
    pub async fn publish_proxy(&self) {
        self.responder.register(&self.proxy).await;
        info!(
            instance = %self.proxy.instance_name,
            endpoints = self.proxy_endpoints.len(),
            "proxy service advertised"
        );
    }

    pub async fn unpublish_proxy(&self) {
        self.responder.unregister(&self.proxy).await;
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }
}

fn host_label(host: &str) -> &str {
    host.split(['.', ':']).next().unwrap_or("")
}

fn proxy_instance_name() -> String {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .map(|name| name.trim().replace(' ', "-").to_ascii_lowercase())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "airbridge".to_string())
}
