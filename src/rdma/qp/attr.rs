use crate::rdma::gid::Gid;
use crate::rdma::mr::Permission;
use crate::rdma::nic::PortMtu;
use crate::rdma::provider::CqHandle;
use crate::rdma::type_alias::*;

use super::QpState;

/// Queue pair capability attributes.
///
/// This type corresponds to `struct ibv_qp_cap`. See
/// [RDMAmojo](https://www.rdmamojo.com/2012/12/21/ibv_create_qp/).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QpCaps {
    /// Outstanding work requests allowed in the send queue.
    pub max_send_wr: u32,

    /// Outstanding work requests allowed in the receive queue.
    pub max_recv_wr: u32,

    /// Scatter/gather elements per send work request.
    pub max_send_sge: u32,

    /// Scatter/gather elements per receive work request.
    pub max_recv_sge: u32,
}

impl QpCaps {
    /// One outstanding work request with one SGE on each queue.
    pub const SINGLE: QpCaps = QpCaps {
        max_send_wr: 1,
        max_recv_wr: 1,
        max_send_sge: 1,
        max_recv_sge: 1,
    };
}

/// Creation attributes of an RC queue pair.
#[derive(Clone, Copy, Debug)]
pub struct QpInitAttr {
    pub send_cq: CqHandle,
    pub recv_cq: CqHandle,
    pub caps: QpCaps,

    /// Generate a completion for every send work request.
    pub sq_sig_all: bool,
}

/// Global routing header attributes, used when the peer is addressed by GID.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GlobalRoute {
    pub dgid: Gid,
    pub flow_label: u32,
    pub sgid_index: GidIndex,
    pub hop_limit: u8,
    pub traffic_class: u8,
}

/// Address vector describing the path to the remote queue pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AddressVector {
    pub dlid: Lid,
    pub sl: u8,
    pub src_path_bits: u8,
    pub port_num: PortNum,

    /// `Some` makes the address vector global.
    pub grh: Option<GlobalRoute>,
}

/// Attributes of one queue pair state transition.
///
/// Every variant is applied as a single modify request carrying all of its
/// attributes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QpAttr {
    /// RESET to INIT.
    Init {
        port_num: PortNum,
        pkey_index: u16,
        access: Permission,
    },

    /// INIT to RTR.
    Rtr {
        path_mtu: PortMtu,
        dest_qp_num: Qpn,
        rq_psn: Psn,
        max_dest_rd_atomic: u8,
        min_rnr_timer: u8,
        ah: AddressVector,
    },

    /// RTR to RTS.
    Rts {
        sq_psn: Psn,
        timeout: u8,
        retry_cnt: u8,
        rnr_retry: u8,
        max_rd_atomic: u8,
    },
}

impl QpAttr {
    /// Get the state this transition moves the queue pair into.
    pub fn target_state(&self) -> QpState {
        match self {
            QpAttr::Init { .. } => QpState::Init,
            QpAttr::Rtr { .. } => QpState::Rtr,
            QpAttr::Rts { .. } => QpState::Rts,
        }
    }
}
