#![cfg_attr(not(test), no_std)]

// Types and constants shared between the agent and the kernel-side forwarding
// program. Keep this crate `no_std` friendly so it can be used from eBPF code.

/// Pin path of the shared forwarding table created by the loader.
pub const ENDPOINT_MAP_PIN: &str = "/sys/fs/bpf/tc/globals/dataplane_endpoints";

/// Link-layer address every node presents on the dataplane.
pub const NODE_MAC: [u8; 6] = [0xde, 0xad, 0xbe, 0xef, 0xc0, 0xde];

/// Leading bits used when a node prefix has to be generated.
pub const DEFAULT_IPV6_PREFIX: [u8; 2] = [0xbe, 0xef];

/// Byte range of an IPv6 node address that carries the node ID (bits 64..95).
pub const NODE_ID_OFFSET: usize = 8;

/// Packs the node ID out of a node address.
///
/// The ID is the big-endian 32-bit word following the /64 network prefix.
pub const fn node_id_from_octets(octets: &[u8; 16]) -> u32 {
    u32::from_be_bytes([
        octets[NODE_ID_OFFSET],
        octets[NODE_ID_OFFSET + 1],
        octets[NODE_ID_OFFSET + 2],
        octets[NODE_ID_OFFSET + 3],
    ])
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct EndpointKey {
    pub id: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct EndpointInfo {
    pub ifindex: u32,
    pub node_id: u32,
    pub mac: [u8; 6],
    pub pad: [u8; 2],
    pub ip6: [u8; 16],
}

// When compiled for userspace with the `user` feature enabled the crate
// exposes an implementation of `aya::Pod` for the table layouts so they can be
// used with aya's typed map APIs.
#[cfg(feature = "user")]
mod user_impls {
    extern crate aya;

    use super::{EndpointInfo, EndpointKey};
    use aya::Pod;

    unsafe impl Pod for EndpointKey {}
    unsafe impl Pod for EndpointInfo {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_uses_bits_after_prefix() {
        let mut octets = [0u8; 16];
        octets[0] = 0xbe;
        octets[1] = 0xef;
        octets[8..12].copy_from_slice(&[0xc0, 0xa8, 0x21, 0x0b]);
        octets[15] = 0x01;
        assert_eq!(node_id_from_octets(&octets), 0xc0a8_210b);
    }

    #[test]
    fn table_layouts_have_no_implicit_padding() {
        assert_eq!(core::mem::size_of::<EndpointKey>(), 4);
        assert_eq!(core::mem::size_of::<EndpointInfo>(), 4 + 4 + 6 + 2 + 16);
    }
}
