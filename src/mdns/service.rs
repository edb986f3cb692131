//! Service instances and the DNS-SD records they advertise.

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};

use super::wire::{normalize_name, Record, RecordData};

/// TTL on every advertised record.
pub const RECORD_TTL: u32 = 300;

/// Meta-query name for service enumeration.
const SERVICE_ENUMERATION: &str = "_services._dns-sd._udp.local";

/// An advertised DNS-SD service instance. Immutable once built; register
/// and unregister work on the record sets derived from it.
#[derive(Debug, Clone)]
pub struct ServiceInstance {
    /// Service name, e.g. `_airdrop._tcp.local`.
    pub service_name: String,
    /// Instance label, e.g. the receiver id.
    pub instance_name: String,
    /// Host label the SRV record points at (no `.local` suffix).
    pub host_name: String,
    /// Endpoints the service is reachable on. All share one port.
    pub endpoints: Vec<SocketAddr>,
    pub txt: Vec<(String, String)>,
}

impl ServiceInstance {
    /// `<instance>.<service>`, the owner of SRV and TXT records.
    pub fn fullname(&self) -> String {
        normalize_name(&format!("{}.{}", self.instance_name, self.service_name))
    }

    /// `<host>.local`, the owner of address records.
    pub fn host_fqdn(&self) -> String {
        normalize_name(&format!("{}.local", self.host_name))
    }

    /// The records this instance owns: two PTRs (service enumeration and
    /// service to instance), one SRV, one TXT and one address record per
    /// distinct endpoint address. Address, SRV and TXT records carry the
    /// cache-flush bit; shared PTR sets do not.
    pub fn records(&self) -> Vec<Record> {
        let service_name = normalize_name(&self.service_name);
        let fullname = self.fullname();
        let host = self.host_fqdn();

        let mut records = vec![
            Record {
                name: SERVICE_ENUMERATION.into(),
                ttl: RECORD_TTL,
                cache_flush: false,
                data: RecordData::Ptr(service_name.clone()),
            },
            Record {
                name: service_name,
                ttl: RECORD_TTL,
                cache_flush: false,
                data: RecordData::Ptr(fullname.clone()),
            },
            Record {
                name: fullname.clone(),
                ttl: RECORD_TTL,
                cache_flush: true,
                data: RecordData::Txt(self.txt.clone()),
            },
        ];

        if let Some(endpoint) = self.endpoints.first() {
            records.push(Record {
                name: fullname,
                ttl: RECORD_TTL,
                cache_flush: true,
                data: RecordData::Srv {
                    priority: 0,
                    weight: 0,
                    port: endpoint.port(),
                    target: host.clone(),
                },
            });
        }

        let mut seen = HashSet::new();
        for endpoint in &self.endpoints {
            let ip = endpoint.ip();
            if !seen.insert(ip) {
                continue;
            }
            let data = match ip {
                IpAddr::V4(addr) => RecordData::A(addr),
                IpAddr::V6(addr) => RecordData::Aaaa(addr),
            };
            records.push(Record {
                name: host.clone(),
                ttl: RECORD_TTL,
                cache_flush: true,
                data,
            });
        }

        records
    }

    /// The same record set with TTL zero, announced when the instance goes
    /// away.
    pub fn goodbye_records(&self) -> Vec<Record> {
        let mut records = self.records();
        for record in &mut records {
            record.ttl = 0;
        }
        records
    }
}
