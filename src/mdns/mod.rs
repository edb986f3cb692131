//! Multicast DNS responder and resolver.
//!
//! The responder owns a fleet of sockets (one trio per interface address),
//! answers queries for records in its authoritative catalog and fans
//! incoming responses out to any in-flight discovery. Registration pushes
//! unsolicited announcements; unregistration pushes TTL-zero goodbyes.

pub mod catalog;
pub mod service;
pub mod socket;
pub mod wire;

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::net::{platform, BridgeInterface};
use crate::utils::BridgeResult;

pub use catalog::Catalog;
pub use service::{ServiceInstance, RECORD_TTL};
pub use socket::{SocketUnit, MDNS_GROUP_V4, MDNS_GROUP_V6, MDNS_PORT};
pub use wire::{Message, Question, Record, RecordData};

/// How long an active discovery keeps listening for answers.
pub const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(30);

/// A `(host, port)` pair resolved by walking PTR to SRV.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceEndpoint {
    pub instance: String,
    pub host: String,
    pub port: u16,
}

pub struct Responder {
    catalog: Catalog,
    units: Vec<Arc<SocketUnit>>,
    subscribers: Mutex<HashMap<u64, mpsc::UnboundedSender<Message>>>,
    next_subscriber: AtomicU64,
}

impl Responder {
    /// Build the socket fleet for the selected interfaces. Addresses that
    /// fail socket setup are skipped with a warning; whether zero units is
    /// fatal is the caller's decision.
    pub fn new(interfaces: &[BridgeInterface]) -> Self {
        let mut units = Vec::new();
        for iface in interfaces {
            for addr in iface.unicast_addrs() {
                match socket::build_unit(&iface.name, iface.index, addr) {
                    Ok(unit) => units.push(Arc::new(unit)),
                    Err(e) => {
                        warn!(interface = %iface.name, %addr, error = %e, "skipping address")
                    }
                }
            }
        }
        Responder {
            catalog: Catalog::new(),
            units,
            subscribers: Mutex::new(HashMap::new()),
            next_subscriber: AtomicU64::new(0),
        }
    }

    pub fn unit_count(&self) -> usize {
        self.units.len()
    }

    /// Start one listener task per socket unit. All of them stop when
    /// `cancel` fires; the AWDL platform hook is held for the same window.
    pub fn spawn(self: Arc<Self>, cancel: &CancellationToken) {
        platform::start_awdl();
        for unit in &self.units {
            let responder = self.clone();
            let unit = unit.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                responder.listen(unit, cancel).await;
            });
        }
        let cancel = cancel.clone();
        tokio::spawn(async move {
            cancel.cancelled().await;
            platform::stop_awdl();
        });
    }

    async fn listen(&self, unit: Arc<SocketUnit>, cancel: CancellationToken) {
        info!(interface = %unit.interface, addr = %unit.local_addr, "mdns listener up");
        let mut buf = vec![0u8; wire::MAX_PACKET_BYTES];
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                received = unit.listener.recv_from(&mut buf) => match received {
                    Ok((len, src)) => self.handle_datagram(&unit, &buf[..len], src).await,
                    Err(e) => {
                        error!(interface = %unit.interface, error = %e, "mdns receive failed");
                        break;
                    }
                },
            }
        }
        debug!(interface = %unit.interface, "mdns listener stopped");
    }

    async fn handle_datagram(&self, unit: &SocketUnit, bytes: &[u8], src: SocketAddr) {
        let message = match Message::decode(bytes) {
            Ok(message) => message,
            Err(e) => {
                debug!(%src, error = %e, "dropping undecodable datagram");
                return;
            }
        };

        if message.is_response {
            self.fan_out(message);
            return;
        }
        if message.questions.is_empty() {
            return;
        }

        let (answers, unicast) = resolve_questions(&self.catalog, &message.questions);
        if answers.is_empty() {
            // A NoError resolution with nothing to say is dropped, not sent.
            return;
        }
        let bytes = match Message::response(answers).encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "mdns response suppressed");
                return;
            }
        };

        let sent = if unicast {
            unit.unicast.send_to(&bytes, src).await
        } else {
            unit.multicast.send_to(&bytes, unit.multicast_target).await
        };
        if let Err(e) = sent {
            warn!(interface = %unit.interface, error = %e, "failed to send mdns response");
        }
    }

    /// Add the instance's records to the catalog and announce them.
    /// Registering the same instance again overwrites its records.
    pub async fn register(&self, service: &ServiceInstance) {
        let records = service.records();
        self.catalog.register(&service.fullname(), records.clone());
        info!(instance = %service.fullname(), records = records.len(), "service registered");
        self.announce(records).await;
    }

    /// Remove the instance's records and say goodbye with TTL zero. A
    /// second unregister of the same instance is a no-op.
    pub async fn unregister(&self, service: &ServiceInstance) {
        let mut removed = self.catalog.unregister(&service.fullname());
        if removed.is_empty() {
            return;
        }
        for record in &mut removed {
            record.ttl = 0;
        }
        info!(instance = %service.fullname(), "service unregistered");
        self.announce(removed).await;
    }

    /// Best-effort unsolicited multicast on every interface. mDNS tolerates
    /// duplicates, so failures only warn.
    async fn announce(&self, records: Vec<Record>) {
        if records.is_empty() {
            return;
        }
        let bytes = match Message::response(records).encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "announcement suppressed");
                return;
            }
        };
        for unit in &self.units {
            if let Err(e) = unit.multicast.send_to(&bytes, unit.multicast_target).await {
                warn!(interface = %unit.interface, error = %e, "announcement failed");
            }
        }
    }

    /// Resolve instances of `service_name`, yielding `(host, port)` pairs as
    /// answers arrive. The stream ends after [`DISCOVERY_TIMEOUT`].
    pub fn discover(self: Arc<Self>, service_name: &str) -> mpsc::UnboundedReceiver<ServiceEndpoint> {
        let (tx, rx) = mpsc::unbounded_channel();
        let responder = self;
        let service = wire::normalize_name(service_name);
        tokio::spawn(async move {
            let (key, mut messages) = responder.subscribe();
            match Message::query(&service, wire::TYPE_PTR).encode() {
                Ok(bytes) => responder.send_query(&bytes).await,
                Err(e) => warn!(error = %e, "discovery query not sent"),
            }

            let mut walk = DiscoveryWalk::new(&service);
            let deadline = tokio::time::sleep(DISCOVERY_TIMEOUT);
            tokio::pin!(deadline);
            loop {
                tokio::select! {
                    _ = &mut deadline => break,
                    message = messages.recv() => match message {
                        Some(message) => {
                            for endpoint in walk.absorb(&message) {
                                let _ = tx.send(endpoint);
                            }
                            if tx.is_closed() {
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
            responder.unsubscribe(key);
        });
        rx
    }

    async fn send_query(&self, bytes: &[u8]) {
        for unit in &self.units {
            if let Err(e) = unit.unicast.send_to(bytes, unit.multicast_target).await {
                warn!(interface = %unit.interface, error = %e, "query send failed");
            }
        }
    }

    fn subscribe(&self) -> (u64, mpsc::UnboundedReceiver<Message>) {
        let key = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .expect("subscriber lock poisoned")
            .insert(key, tx);
        (key, rx)
    }

    fn unsubscribe(&self, key: u64) {
        self.subscribers
            .lock()
            .expect("subscriber lock poisoned")
            .remove(&key);
    }

    fn fan_out(&self, message: Message) {
        let mut subscribers = self.subscribers.lock().expect("subscriber lock poisoned");
        subscribers.retain(|_, tx| tx.send(message.clone()).is_ok());
    }

    /// Catalog lookup, exposed for the registry and tests.
    pub fn lookup(&self, name: &str, qtype: u16) -> Vec<Record> {
        self.catalog.lookup(name, qtype)
    }
}

/// Assemble answers for a query's questions from the catalog and report
/// whether any question requested a unicast reply.
fn resolve_questions(catalog: &Catalog, questions: &[Question]) -> (Vec<Record>, bool) {
    let mut answers: Vec<Record> = Vec::new();
    let mut unicast = false;
    for question in questions {
        unicast |= question.unicast_reply;
        for record in catalog.lookup(&question.name, question.qtype) {
            if !answers.contains(&record) {
                answers.push(record);
            }
        }
    }
    (answers, unicast)
}

/// Incremental PTR to SRV walk over received answer records.
struct DiscoveryWalk {
    service: String,
    instances: HashSet<String>,
    srv: HashMap<String, (String, u16)>,
    emitted: HashSet<String>,
}

impl DiscoveryWalk {
    fn new(service: &str) -> Self {
        DiscoveryWalk {
            service: service.to_string(),
            instances: HashSet::new(),
            srv: HashMap::new(),
            emitted: HashSet::new(),
        }
    }

    fn absorb(&mut self, message: &Message) -> Vec<ServiceEndpoint> {
        for record in message
            .answers
            .iter()
            .chain(&message.authority)
            .chain(&message.additionals)
        {
            match &record.data {
                RecordData::Ptr(target) if record.name == self.service => {
                    self.instances.insert(target.clone());
                }
                RecordData::Srv { port, target, .. } => {
                    self.srv
                        .insert(record.name.clone(), (target.clone(), *port));
                }
                _ => {}
            }
        }

        let mut found = Vec::new();
        for instance in &self.instances {
            if self.emitted.contains(instance) {
                continue;
            }
            if let Some((host, port)) = self.srv.get(instance) {
                found.push(ServiceEndpoint {
                    instance: instance.clone(),
                    host: host.clone(),
                    port: *port,
                });
            }
        }
        for endpoint in &found {
            self.emitted.insert(endpoint.instance.clone());
        }
        found
    }
}

/// Convenience used by startup code: a responder is useful only with at
/// least one bound socket.
pub fn require_units(responder: &Responder) -> BridgeResult<()> {
    if responder.unit_count() == 0 {
        return Err(crate::utils::BridgeError::Platform(
            "no multicast-capable interface address could be bound".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn a_record(name: &str) -> Record {
        Record {
            name: name.into(),
            ttl: RECORD_TTL,
            cache_flush: true,
            data: RecordData::A(Ipv4Addr::new(169, 254, 0, 1)),
        }
    }

    fn question(name: &str, qtype: u16, unicast_reply: bool) -> Question {
        Question {
            name: name.into(),
            qtype,
            unicast_reply,
        }
    }

    #[test]
    fn resolves_matching_questions_and_unicast_flag() {
        let catalog = Catalog::new();
        catalog.register("owner", vec![a_record("host.local")]);

        let (answers, unicast) = resolve_questions(
            &catalog,
            &[question("host.local", wire::TYPE_A, false)],
        );
        assert_eq!(answers.len(), 1);
        assert!(!unicast);

        let (answers, unicast) = resolve_questions(
            &catalog,
            &[
                question("host.local", wire::TYPE_A, false),
                question("absent.local", wire::TYPE_A, true),
            ],
        );
        assert_eq!(answers.len(), 1);
        assert!(unicast);
    }

    #[test]
    fn duplicate_questions_do_not_duplicate_answers() {
        let catalog = Catalog::new();
        catalog.register("owner", vec![a_record("host.local")]);

        let (answers, _) = resolve_questions(
            &catalog,
            &[
                question("host.local", wire::TYPE_A, false),
                question("host.local", wire::TYPE_ANY, false),
            ],
        );
        assert_eq!(answers.len(), 1);
    }

    #[test]
    fn walk_pairs_ptr_with_srv_in_either_order() {
        let mut walk = DiscoveryWalk::new("_airdrop._tcp.local");

        // SRV first: nothing to emit yet.
        let srv_only = Message::response(vec![Record {
            name: "peer._airdrop._tcp.local".into(),
            ttl: RECORD_TTL,
            cache_flush: true,
            data: RecordData::Srv {
                priority: 0,
                weight: 0,
                port: 8771,
                target: "peer.local".into(),
            },
        }]);
        assert!(walk.absorb(&srv_only).is_empty());

        let ptr = Message::response(vec![Record {
            name: "_airdrop._tcp.local".into(),
            ttl: RECORD_TTL,
            cache_flush: false,
            data: RecordData::Ptr("peer._airdrop._tcp.local".into()),
        }]);
        let endpoints = walk.absorb(&ptr);
        assert_eq!(
            endpoints,
            vec![ServiceEndpoint {
                instance: "peer._airdrop._tcp.local".into(),
                host: "peer.local".into(),
                port: 8771,
            }]
        );

        // Replayed answers do not re-emit.
        assert!(walk.absorb(&ptr).is_empty());
    }

    #[test]
    fn walk_ignores_other_services() {
        let mut walk = DiscoveryWalk::new("_airdrop._tcp.local");
        let other = Message::response(vec![Record {
            name: "_airplay._tcp.local".into(),
            ttl: RECORD_TTL,
            cache_flush: false,
            data: RecordData::Ptr("tv._airplay._tcp.local".into()),
        }]);
        assert!(walk.absorb(&other).is_empty());
    }

    #[tokio::test]
    async fn register_and_unregister_round_trip_catalog_state() {
        let responder = Responder::new(&[]);
        let service = ServiceInstance {
            service_name: "_airdrop._tcp.local".into(),
            instance_name: "abcdefabcdef".into(),
            host_name: "abcdefabcdef".into(),
            endpoints: vec!["169.254.1.2:8771".parse().unwrap()],
            txt: vec![("flags".into(), "653".into())],
        };

        responder.register(&service).await;
        responder.register(&service).await;
        assert_eq!(
            responder
                .lookup("_airdrop._tcp.local", wire::TYPE_PTR)
                .len(),
            1
        );

        responder.unregister(&service).await;
        responder.unregister(&service).await;
        assert!(responder
            .lookup("_airdrop._tcp.local", wire::TYPE_PTR)
            .is_empty());
    }
}
