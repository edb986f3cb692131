//! Authoritative record catalog for the responder.
//!
//! Every record in the catalog is owned by a registered instance and is
//! answered without recursion. One writer mutates the map; query resolution
//! reads under the lock so each answer set is a consistent snapshot.

use std::collections::HashMap;
use std::sync::RwLock;

use super::wire::{normalize_name, Record, TYPE_ANY};

#[derive(Default)]
pub struct Catalog {
    owners: RwLock<HashMap<String, Vec<Record>>>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert (or replace) the records owned by `owner`. Re-registering an
    /// owner leaves the catalog as if it had been registered once.
    pub fn register(&self, owner: &str, records: Vec<Record>) {
        let mut owners = self.owners.write().expect("catalog lock poisoned");
        owners.insert(owner.to_string(), records);
    }

    /// Remove every record owned by `owner`, returning what was removed so
    /// the responder can emit goodbyes. Unknown owners yield an empty set.
    pub fn unregister(&self, owner: &str) -> Vec<Record> {
        let mut owners = self.owners.write().expect("catalog lock poisoned");
        owners.remove(owner).unwrap_or_default()
    }

    /// All records matching `name` and `qtype` (or `ANY`), across owners.
    pub fn lookup(&self, name: &str, qtype: u16) -> Vec<Record> {
        let name = normalize_name(name);
        let owners = self.owners.read().expect("catalog lock poisoned");
        let mut matches = Vec::new();
        for records in owners.values() {
            for record in records {
                if record.name == name
                    && (qtype == TYPE_ANY || record.data.rr_type() == qtype)
                    && !matches.contains(record)
                {
                    matches.push(record.clone());
                }
            }
        }
        matches
    }

    pub fn is_empty(&self) -> bool {
        self.owners.read().expect("catalog lock poisoned").is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mdns::wire::{RecordData, TYPE_A, TYPE_PTR};
    use std::net::Ipv4Addr;

    fn a_record(name: &str, last_octet: u8) -> Record {
        Record {
            name: name.into(),
            ttl: 300,
            cache_flush: true,
            data: RecordData::A(Ipv4Addr::new(10, 0, 0, last_octet)),
        }
    }

    #[test]
    fn lookup_filters_by_name_and_type() {
        let catalog = Catalog::new();
        catalog.register("peer1", vec![a_record("peer1.local", 1)]);
        catalog.register("peer2", vec![a_record("peer2.local", 2)]);

        assert_eq!(catalog.lookup("peer1.local", TYPE_A).len(), 1);
        assert_eq!(catalog.lookup("peer1.local", TYPE_PTR).len(), 0);
        assert_eq!(catalog.lookup("peer1.local", TYPE_ANY).len(), 1);
        assert_eq!(catalog.lookup("peer3.local", TYPE_A).len(), 0);
    }

    #[test]
    fn lookup_normalizes_query_names() {
        let catalog = Catalog::new();
        catalog.register("peer1", vec![a_record("peer1.local", 1)]);
        assert_eq!(catalog.lookup("Peer1.Local.", TYPE_A).len(), 1);
    }

    #[test]
    fn reregistration_is_idempotent() {
        let catalog = Catalog::new();
        catalog.register("peer1", vec![a_record("peer1.local", 1)]);
        catalog.register("peer1", vec![a_record("peer1.local", 1)]);

        assert_eq!(catalog.lookup("peer1.local", TYPE_A).len(), 1);
    }

    #[test]
    fn reregistration_overwrites() {
        let catalog = Catalog::new();
        catalog.register("peer1", vec![a_record("peer1.local", 1)]);
        catalog.register("peer1", vec![a_record("peer1.local", 9)]);

        let records = catalog.lookup("peer1.local", TYPE_A);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].data, RecordData::A(Ipv4Addr::new(10, 0, 0, 9)));
    }

    #[test]
    fn unregister_twice_is_a_noop() {
        let catalog = Catalog::new();
        catalog.register("peer1", vec![a_record("peer1.local", 1)]);

        assert_eq!(catalog.unregister("peer1").len(), 1);
        assert!(catalog.unregister("peer1").is_empty());
        assert!(catalog.is_empty());
    }

    #[test]
    fn shared_names_survive_other_owners_unregistering() {
        let catalog = Catalog::new();
        catalog.register("peer1", vec![a_record("shared.local", 1)]);
        catalog.register("peer2", vec![a_record("shared.local", 2)]);

        catalog.unregister("peer1");
        let remaining = catalog.lookup("shared.local", TYPE_A);
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].data, RecordData::A(Ipv4Addr::new(10, 0, 0, 2)));
    }
}
