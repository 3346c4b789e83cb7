use std::fmt;

use crate::rdma::type_alias::Lid;

/// Attributes of a physical port, as returned by the transport provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortAttr {
    pub state: PortState,
    pub lid: Lid,
    pub active_mtu: PortMtu,
    pub link_layer: PortLinkLayer,
    pub gid_tbl_len: u32,
}

/// Port state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortState {
    /// Logical link is down. The physical link of the port isn't up.
    Down,

    /// The physical link is up, but the SM hasn't configured the logical link yet.
    Init,

    /// The physical link is up, but the SM hasn't fully configured the logical link yet.
    Armed,

    /// Logical link is Active. TX/RX all packets.
    Active,

    /// The physical link is suffering from a failure and may recover.
    ActiveDefer,
}

impl From<u32> for PortState {
    fn from(state: u32) -> Self {
        // Values of `enum ibv_port_state`; NOP (0) reads as down.
        match state {
            2 => PortState::Init,
            3 => PortState::Armed,
            4 => PortState::Active,
            5 => PortState::ActiveDefer,
            _ => PortState::Down,
        }
    }
}

/// Port link layer protocol type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortLinkLayer {
    /// Infiniband.
    Infiniband,

    /// Ethernet (RoCE). LIDs are meaningless and a GID index is required.
    Ethernet,
}

/// Port MTU size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PortMtu {
    /// 256 bytes.
    Mtu256 = 1,

    /// 512 bytes.
    Mtu512 = 2,

    /// 1024 bytes.
    Mtu1024 = 3,

    /// 2048 bytes.
    Mtu2048 = 4,

    /// 4096 bytes.
    Mtu4096 = 5,
}

impl PortMtu {
    /// Get the MTU in bytes.
    pub fn bytes(self) -> usize {
        128 << (self as usize)
    }
}

impl From<u32> for PortMtu {
    fn from(mtu: u32) -> Self {
        match mtu {
            2 => PortMtu::Mtu512,
            3 => PortMtu::Mtu1024,
            4 => PortMtu::Mtu2048,
            5 => PortMtu::Mtu4096,
            _ => PortMtu::Mtu256,
        }
    }
}

impl fmt::Display for PortMtu {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}B", self.bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mtu_bytes() {
        assert_eq!(PortMtu::Mtu256.bytes(), 256);
        assert_eq!(PortMtu::Mtu4096.bytes(), 4096);
        assert_eq!(PortMtu::from(3).to_string(), "1024B");
    }
}
