// SPDX-License-Identifier: Apache-2.0 OR MIT
//! The link-layer interface consumed by the engine.
//!
//! The network link itself is externally owned; the engine only needs an
//! identity for registry keying, the MTU for report packing, the up/down
//! state, and a way to hand off a finished frame. Physical address
//! resolution for multicast destinations is the implementation's concern.

use std::fmt;
use std::io;
use std::net::Ipv4Addr;
use std::sync::Arc;

/// Opaque identity of a network link, assigned by the link's owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkId(pub u64);

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link{}", self.0)
    }
}

/// The IPv4 address configuration the engine uses on a link: the outbound
/// source address and the subnet used to validate report sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalAddress {
    pub address: Ipv4Addr,
    pub subnet_mask: Ipv4Addr,
}

impl LocalAddress {
    pub fn new(address: Ipv4Addr, subnet_mask: Ipv4Addr) -> Self {
        Self {
            address,
            subnet_mask,
        }
    }

    /// Whether the given address falls within this link's local subnet.
    pub fn on_local_subnet(&self, other: Ipv4Addr) -> bool {
        let mask = u32::from(self.subnet_mask);
        u32::from(self.address) & mask == u32::from(other) & mask
    }
}

/// A network link the engine can send IGMP packets over.
pub trait NetworkLink: Send + Sync {
    /// Stable identity for registry lookups.
    fn id(&self) -> LinkId;

    /// Link MTU in bytes, bounding the size of a single report packet.
    fn mtu(&self) -> usize;

    /// Whether the link is currently up. A down link suppresses leave
    /// transmissions entirely.
    fn is_up(&self) -> bool;

    /// Transmit a finished IPv4 frame to the given multicast destination.
    /// The implementation resolves the physical multicast address.
    fn send(&self, destination: Ipv4Addr, frame: Vec<u8>) -> io::Result<()>;
}

/// Shared handle to a link.
pub type LinkHandle = Arc<dyn NetworkLink>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_on_local_subnet() {
        let local = LocalAddress::new(
            "192.168.1.10".parse().unwrap(),
            "255.255.255.0".parse().unwrap(),
        );
        assert!(local.on_local_subnet("192.168.1.200".parse().unwrap()));
        assert!(!local.on_local_subnet("192.168.2.1".parse().unwrap()));
        assert!(!local.on_local_subnet("10.0.0.1".parse().unwrap()));
    }

    #[test]
    fn test_link_id_display() {
        assert_eq!(LinkId(7).to_string(), "link7");
    }
}
