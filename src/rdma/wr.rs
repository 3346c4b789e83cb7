//! Work requests.

use std::fmt;

use super::mr::MrRemote;
use super::type_alias::{LKey, WrId};

/// Opcode of a send work request.
///
/// Discriminants are identical to `enum ibv_wr_opcode`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WrOpcode {
    RdmaWrite = 0,
    Send = 2,
    RdmaRead = 4,
}

impl WrOpcode {
    /// Return `true` for one-sided opcodes, which need a remote memory area.
    #[inline]
    pub fn is_rdma(self) -> bool {
        matches!(self, WrOpcode::RdmaRead | WrOpcode::RdmaWrite)
    }
}

impl fmt::Display for WrOpcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            WrOpcode::Send => "Send",
            WrOpcode::RdmaRead => "RDMA Read",
            WrOpcode::RdmaWrite => "RDMA Write",
        })
    }
}

/// Scatter/gather element: a local registered memory area.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Sge {
    pub addr: u64,
    pub length: u32,
    pub lkey: LKey,
}

/// Send work request with a single SGE.
#[derive(Clone, Copy, Debug)]
pub struct SendWr {
    pub wr_id: WrId,
    pub opcode: WrOpcode,
    pub sge: Sge,

    /// Remote memory area, required by RDMA READ and WRITE.
    pub remote: Option<MrRemote>,
    pub signaled: bool,
}

/// Receive work request with a single SGE.
#[derive(Clone, Copy, Debug)]
pub struct RecvWr {
    pub wr_id: WrId,
    pub sge: Sge,
}
