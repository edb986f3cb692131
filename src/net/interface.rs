//! Network interface enumeration and selection.
//!
//! The responder binds one socket fleet per selected interface. Selection
//! policy: up, multicast-capable, not loopback, not point-to-point. The
//! AWDL interface is always eligible; macOS reports it down until the
//! platform hook kicks it awake.

use std::net::IpAddr;

use pnet::datalink;
use tracing::{debug, info};

/// Name of Apple's peer-to-peer interface.
pub const AWDL_INTERFACE: &str = "awdl0";

/// An interface the responder will bind on.
#[derive(Debug, Clone)]
pub struct BridgeInterface {
    pub name: String,
    pub index: u32,
    pub addrs: Vec<IpAddr>,
}

impl BridgeInterface {
    pub fn is_awdl(&self) -> bool {
        self.name == AWDL_INTERFACE
    }

    /// Non-loopback unicast addresses, the ones worth advertising.
    pub fn unicast_addrs(&self) -> impl Iterator<Item = IpAddr> + '_ {
        self.addrs
            .iter()
            .copied()
            .filter(|ip| !ip.is_loopback() && !ip.is_multicast() && !ip.is_unspecified())
    }
}

fn eligible(iface: &datalink::NetworkInterface) -> bool {
    if iface.name == AWDL_INTERFACE {
        return true;
    }
    iface.is_up() && iface.is_multicast() && !iface.is_loopback() && !iface.is_point_to_point()
}

/// Enumerate interfaces matching the policy. A non-empty `names` list
/// narrows the result to exactly those interfaces, bypassing the policy.
pub fn select_interfaces(names: &[String]) -> Vec<BridgeInterface> {
    let mut selected = Vec::new();
    for iface in datalink::interfaces() {
        let wanted = if names.is_empty() {
            eligible(&iface)
        } else {
            names.iter().any(|n| *n == iface.name)
        };
        if !wanted {
            debug!(name = %iface.name, "skipping interface");
            continue;
        }

        let addrs: Vec<IpAddr> = iface.ips.iter().map(|net| net.ip()).collect();
        info!(name = %iface.name, index = iface.index, addrs = ?addrs, "selected interface");
        selected.push(BridgeInterface {
            name: iface.name,
            index: iface.index,
            addrs,
        });
    }
    selected
}

/// Whether an AWDL interface is present in the selection.
pub fn has_awdl(interfaces: &[BridgeInterface]) -> bool {
    interfaces.iter().any(BridgeInterface::is_awdl)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn iface(name: &str, addrs: Vec<IpAddr>) -> BridgeInterface {
        BridgeInterface {
            name: name.into(),
            index: 1,
            addrs,
        }
    }

    #[test]
    fn awdl_detection_is_by_name() {
        assert!(iface("awdl0", vec![]).is_awdl());
        assert!(!iface("en0", vec![]).is_awdl());
        assert!(has_awdl(&[iface("en0", vec![]), iface("awdl0", vec![])]));
        assert!(!has_awdl(&[iface("en0", vec![])]));
    }

    #[test]
    fn unicast_addrs_drops_loopback_and_unspecified() {
        let selected = iface(
            "en0",
            vec![
                IpAddr::V4(Ipv4Addr::LOCALHOST),
                IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                IpAddr::V4(Ipv4Addr::new(192, 168, 1, 5)),
            ],
        );
        let addrs: Vec<IpAddr> = selected.unicast_addrs().collect();
        assert_eq!(addrs, vec![IpAddr::V4(Ipv4Addr::new(192, 168, 1, 5))]);
    }
}
