use std::{
    fmt, io,
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
    ptr,
};

use ipnet::Ipv6Net;
use tracing::info;

use dataplane_agent_common::{DEFAULT_IPV6_PREFIX, NODE_ID_OFFSET};

use crate::error::BootstrapError;

pub const NODE_PREFIX_LEN: u8 = 64;

/// This node's address together with the /64 network it owns.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct NodeAddress {
    addr: Ipv6Addr,
    network: Ipv6Net,
}

impl NodeAddress {
    pub fn addr(&self) -> Ipv6Addr {
        self.addr
    }

    pub fn network(&self) -> Ipv6Net {
        self.network
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.addr)
    }
}

/// Source of a node-unique prefix when the operator did not supply one.
pub trait PrefixGenerator: Send + Sync {
    fn generate(&self) -> Result<String, BootstrapError>;
}

/// Builds the prefix from the first usable IPv4 address of the host.
#[derive(Clone, Copy, Debug, Default)]
pub struct HostPrefixGenerator;

impl PrefixGenerator for HostPrefixGenerator {
    fn generate(&self) -> Result<String, BootstrapError> {
        let addrs = host_ipv4_addrs()
            .map_err(|e| BootstrapError::PrefixGeneration(format!("getifaddrs: {e}")))?;
        let v4 = addrs
            .into_iter()
            .find(|a| !a.is_loopback() && !a.is_unspecified() && !a.is_link_local())
            .ok_or_else(|| {
                BootstrapError::PrefixGeneration("no usable IPv4 address on this host".into())
            })?;
        Ok(prefix_from_ipv4(v4).to_string())
    }
}

pub fn prefix_from_ipv4(v4: Ipv4Addr) -> Ipv6Addr {
    let mut octets = [0u8; 16];
    octets[..DEFAULT_IPV6_PREFIX.len()].copy_from_slice(&DEFAULT_IPV6_PREFIX);
    octets[NODE_ID_OFFSET..NODE_ID_OFFSET + 4].copy_from_slice(&v4.octets());
    Ipv6Addr::from(octets)
}

fn host_ipv4_addrs() -> io::Result<Vec<Ipv4Addr>> {
    let mut ifap: *mut libc::ifaddrs = ptr::null_mut();
    if unsafe { libc::getifaddrs(&mut ifap) } != 0 {
        return Err(io::Error::last_os_error());
    }

    let mut addrs = Vec::new();
    let mut cursor = ifap;
    while !cursor.is_null() {
        let entry = unsafe { &*cursor };
        let sa = entry.ifa_addr;
        if !sa.is_null() && unsafe { (*sa).sa_family } as libc::c_int == libc::AF_INET {
            let sin = unsafe { &*(sa as *const libc::sockaddr_in) };
            addrs.push(Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr)));
        }
        cursor = entry.ifa_next;
    }

    unsafe { libc::freeifaddrs(ifap) };
    Ok(addrs)
}

/// Cluster addressing policy for node addresses.
pub fn valid_node_address(addr: &IpAddr) -> bool {
    let IpAddr::V6(v6) = addr else {
        return false;
    };
    let octets = v6.octets();
    // ::/96 covers unspecified, loopback and IPv4-compatible addresses.
    if octets[..12].iter().all(|b| *b == 0) {
        return false;
    }
    if v6.is_multicast() || v6.to_ipv4_mapped().is_some() {
        return false;
    }
    // fe80::/10
    (v6.segments()[0] & 0xffc0) != 0xfe80
}

/// Resolves the node address from the operator-supplied value, generating a
/// prefix first when the value is empty. Every failure here is fatal.
pub fn resolve(
    explicit: &str,
    generator: &dyn PrefixGenerator,
) -> Result<NodeAddress, BootstrapError> {
    let candidate = match explicit.trim() {
        "" => {
            let generated = generator.generate()?;
            info!(prefix = %generated, "generated IPv6 prefix");
            generated
        }
        value => value.to_string(),
    };

    let addr: IpAddr = candidate
        .parse()
        .map_err(|_| BootstrapError::InvalidAddressFormat {
            value: candidate.clone(),
        })?;

    if !valid_node_address(&addr) {
        return Err(BootstrapError::InvalidNodeAddress { value: candidate });
    }
    let IpAddr::V6(addr) = addr else {
        return Err(BootstrapError::InvalidNodeAddress { value: candidate });
    };

    let network = Ipv6Net::new(addr, NODE_PREFIX_LEN)
        .map_err(|e| BootstrapError::InvalidNetworkPrefix {
            value: addr.to_string(),
            reason: e.to_string(),
        })?
        .trunc();

    Ok(NodeAddress { addr, network })
}
