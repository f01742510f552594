use std::fmt;

use dataplane_agent_common::{NODE_MAC, node_id_from_octets};

use crate::address::NodeAddress;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

/// Dataplane identity of this node.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct NodeIdentity {
    pub mac: MacAddr,
    pub node_id: u32,
}

/// Pure function of the node address, so re-bootstrapping the same node
/// always converges on the same configuration.
pub fn derive(addr: &NodeAddress) -> NodeIdentity {
    NodeIdentity {
        mac: MacAddr(NODE_MAC),
        node_id: node_id_from_octets(&addr.addr().octets()),
    }
}
