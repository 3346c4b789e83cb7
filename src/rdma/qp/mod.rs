//! Reliable-connected queue pair.

mod attr;
mod state;

use std::{fmt, io};

use log::{debug, warn};
use thiserror::Error;

pub use self::attr::*;
pub use self::state::*;
use super::cq::Cq;
use super::gid::Gid;
use super::mr::{MrRemote, Permission};
use super::nic::PortMtu;
use super::pd::Pd;
use super::provider::QpHandle;
use super::type_alias::*;
use super::wr::{RecvWr, SendWr, Sge, WrOpcode};

/// Queue pair state transition error type.
#[derive(Debug, Error)]
pub enum QpTransitionError {
    /// The transition does not start from the current state.
    #[error("QP in state {current} cannot be modified to {target}")]
    OutOfOrder { current: QpState, target: QpState },

    /// The provider rejected the transition. The QP stays in `from`.
    #[error("failed to modify QP state from {from} to {to}")]
    Rejected {
        from: QpState,
        to: QpState,
        #[source]
        source: io::Error,
    },
}

/// Work request posting error type.
#[derive(Debug, Error)]
pub enum PostError {
    /// An RDMA READ or WRITE needs the peer's memory region.
    #[error("failed to post {0} Request: remote memory is unknown before connecting")]
    NotConnected(WrOpcode),

    #[error("failed to post {request}: {}", post_err_explanation(.source))]
    Rejected {
        request: &'static str,
        #[source]
        source: io::Error,
    },
}

fn post_err_explanation(err: &io::Error) -> String {
    match err.raw_os_error() {
        Some(libc::EINVAL) => "invalid work request or QP state".to_owned(),
        Some(libc::ENOMEM) => "queue is full or not enough resources to complete this operation".to_owned(),
        Some(libc::EFAULT) => "invalid QP".to_owned(),
        _ => err.to_string(),
    }
}

/// Path MTU requested when moving to RTR.
pub const PATH_MTU: PortMtu = PortMtu::Mtu256;

/// Initial packet sequence number of both directions.
pub const INIT_PSN: Psn = 0;

/// Minimum RNR NAK timer (RTR).
pub const MIN_RNR_TIMER: u8 = 0x12;

/// Local ACK timeout (RTS).
pub const TIMEOUT: u8 = 0x12;

/// Transport retry count (RTS).
pub const RETRY_CNT: u8 = 6;

/// RNR retry count (RTS).
pub const RNR_RETRY: u8 = 0;

/// Outstanding RDMA reads and atomics, as initiator and as target.
pub const MAX_RD_ATOMIC: u8 = 1;

/// Hop limit of the global route header.
pub const HOP_LIMIT: u8 = 1;

/// Where the remote queue pair is, as learned from its connection metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QpPeer {
    pub qp_num: Qpn,
    pub lid: Lid,
    pub gid: Gid,
}

/// Reliable-connected queue pair.
///
/// Holds its [`Pd`] and [`Cq`] alive. The state is tracked locally and
/// only advanced when the provider accepts a transition.
pub struct Qp {
    pd: Pd,
    cq: Cq,
    qp: QpHandle,
    qp_num: Qpn,
    state: QpState,
    closed: bool,
}

impl fmt::Debug for Qp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Qp")
            .field("qp_num", &self.qp_num)
            .field("state", &self.state)
            .finish()
    }
}

impl Qp {
    /// Create an RC queue pair that uses `cq` for both its send and receive
    /// completions and signals every send.
    pub fn new(pd: &Pd, cq: &Cq, caps: QpCaps) -> io::Result<Self> {
        let init_attr = QpInitAttr {
            send_cq: cq.handle(),
            recv_cq: cq.handle(),
            caps,
            sq_sig_all: true,
        };
        let raw = pd.context().provider().create_qp(pd.handle(), &init_attr)?;
        Ok(Self {
            pd: pd.clone(),
            cq: cq.clone(),
            qp: raw.handle,
            qp_num: raw.qp_num,
            state: QpState::Reset,
            closed: false,
        })
    }

    /// Get the queue pair number.
    #[inline]
    pub fn qp_num(&self) -> Qpn {
        self.qp_num
    }

    /// Get the current state.
    #[inline]
    pub fn state(&self) -> QpState {
        self.state
    }

    /// Get the completion queue of both directions.
    #[inline]
    pub fn cq(&self) -> &Cq {
        &self.cq
    }

    fn modify(&mut self, attr: &QpAttr) -> Result<(), QpTransitionError> {
        let target = attr.target_state();
        if target.predecessor() != Some(self.state) {
            return Err(QpTransitionError::OutOfOrder {
                current: self.state,
                target,
            });
        }
        self.pd
            .context()
            .provider()
            .modify_qp(self.qp, attr)
            .map_err(|source| QpTransitionError::Rejected {
                from: self.state,
                to: target,
                source,
            })?;
        debug!("QP {:#x}: {} -> {}", self.qp_num, self.state, target);
        self.state = target;
        Ok(())
    }

    /// RESET to INIT, allowing local write and remote read/write.
    pub fn modify_reset2init(&mut self, port_num: PortNum) -> Result<(), QpTransitionError> {
        self.modify(&QpAttr::Init {
            port_num,
            pkey_index: 0,
            access: Permission::LOCAL_WRITE | Permission::REMOTE_READ | Permission::REMOTE_WRITE,
        })
    }

    /// INIT to RTR, targeting the given peer.
    ///
    /// With `gid_index` set, the address vector is global and routes to the
    /// peer's GID; otherwise it routes to the peer's LID.
    pub fn modify_init2rtr(
        &mut self,
        peer: &QpPeer,
        port_num: PortNum,
        gid_index: Option<GidIndex>,
    ) -> Result<(), QpTransitionError> {
        let grh = gid_index.map(|sgid_index| GlobalRoute {
            dgid: peer.gid,
            flow_label: 0,
            sgid_index,
            hop_limit: HOP_LIMIT,
            traffic_class: 0,
        });
        self.modify(&QpAttr::Rtr {
            path_mtu: PATH_MTU,
            dest_qp_num: peer.qp_num,
            rq_psn: INIT_PSN,
            max_dest_rd_atomic: MAX_RD_ATOMIC,
            min_rnr_timer: MIN_RNR_TIMER,
            ah: AddressVector {
                dlid: peer.lid,
                sl: 0,
                src_path_bits: 0,
                port_num,
                grh,
            },
        })
    }

    /// RTR to RTS.
    pub fn modify_rtr2rts(&mut self) -> Result<(), QpTransitionError> {
        self.modify(&QpAttr::Rts {
            sq_psn: INIT_PSN,
            timeout: TIMEOUT,
            retry_cnt: RETRY_CNT,
            rnr_retry: RNR_RETRY,
            max_rd_atomic: MAX_RD_ATOMIC,
        })
    }

    /// Post a receive work request with one SGE.
    pub fn post_recv(&self, sge: Sge, wr_id: WrId) -> Result<(), PostError> {
        let wr = RecvWr { wr_id, sge };
        self.pd
            .context()
            .provider()
            .post_recv(self.qp, &wr)
            .map_err(|source| PostError::Rejected {
                request: "Receive Request",
                source,
            })
    }

    /// Post a signaled send work request with one SGE.
    ///
    /// `remote` is required by RDMA READ and WRITE, and ignored by SEND.
    pub fn post_send(
        &self,
        opcode: WrOpcode,
        sge: Sge,
        remote: Option<MrRemote>,
        wr_id: WrId,
    ) -> Result<(), PostError> {
        if opcode.is_rdma() && remote.is_none() {
            return Err(PostError::NotConnected(opcode));
        }
        let wr = SendWr {
            wr_id,
            opcode,
            sge,
            remote: remote.filter(|_| opcode.is_rdma()),
            signaled: true,
        };
        self.pd
            .context()
            .provider()
            .post_send(self.qp, &wr)
            .map_err(|source| PostError::Rejected {
                request: match opcode {
                    WrOpcode::Send => "Send Request",
                    WrOpcode::RdmaRead => "RDMA Read Request",
                    WrOpcode::RdmaWrite => "RDMA Write Request",
                },
                source,
            })
    }

    /// Destroy the queue pair.
    pub fn close(mut self) -> io::Result<()> {
        self.closed = true;
        self.pd.context().provider().destroy_qp(self.qp)
    }
}

impl Drop for Qp {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(e) = self.pd.context().provider().destroy_qp(self.qp) {
                warn!("cannot destroy QP {:#x} on drop: {}", self.qp_num, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::rdma::context::Context;
    use crate::rdma::provider::{SoftFabric, Verb};

    fn qp(fabric: &Arc<SoftFabric>) -> Qp {
        let ctx = Context::open(fabric.clone(), None, 1).unwrap();
        let pd = Pd::alloc(&ctx).unwrap();
        let cq = Cq::new(&ctx, 1).unwrap();
        Qp::new(&pd, &cq, QpCaps::SINGLE).unwrap()
    }

    fn peer() -> QpPeer {
        QpPeer {
            qp_num: 0x99,
            lid: 1,
            gid: Gid::ZERO,
        }
    }

    #[test]
    fn rtr_before_init_is_rejected() {
        let fabric = Arc::new(SoftFabric::new());
        let mut qp = qp(&fabric);
        let err = qp.modify_init2rtr(&peer(), 1, None).unwrap_err();
        assert!(matches!(
            err,
            QpTransitionError::OutOfOrder {
                current: QpState::Reset,
                target: QpState::Rtr
            }
        ));
        assert_eq!(qp.state(), QpState::Reset);
    }

    #[test]
    fn rts_before_rtr_is_rejected() {
        let fabric = Arc::new(SoftFabric::new());
        let mut qp = qp(&fabric);
        qp.modify_reset2init(1).unwrap();
        assert!(qp.modify_rtr2rts().is_err());
        assert!(qp.modify_reset2init(1).is_err());
        assert_eq!(qp.state(), QpState::Init);
    }

    #[test]
    fn provider_rejection_keeps_state() {
        let fabric = Arc::new(SoftFabric::new());
        let mut qp = qp(&fabric);
        fabric.fail_next(Verb::ModifyQp, libc::EINVAL);
        let err = qp.modify_reset2init(1).unwrap_err();
        assert!(matches!(
            err,
            QpTransitionError::Rejected {
                from: QpState::Reset,
                to: QpState::Init,
                ..
            }
        ));
        assert_eq!(qp.state(), QpState::Reset);

        qp.modify_reset2init(1).unwrap();
        qp.modify_init2rtr(&peer(), 1, None).unwrap();
        qp.modify_rtr2rts().unwrap();
        assert_eq!(qp.state(), QpState::Rts);
        assert_eq!(fabric.qp_state(qp.qp), Some(QpState::Rts));
    }

    #[test]
    fn rdma_post_needs_remote() {
        let fabric = Arc::new(SoftFabric::new());
        let qp = qp(&fabric);
        let sge = Sge {
            addr: 0,
            length: 0,
            lkey: 0,
        };
        let err = qp.post_send(WrOpcode::RdmaRead, sge, None, 0).unwrap_err();
        assert!(matches!(err, PostError::NotConnected(WrOpcode::RdmaRead)));

        let err = qp.post_send(WrOpcode::Send, sge, None, 0).unwrap_err();
        assert_eq!(
            err.to_string(),
            "failed to post Send Request: invalid work request or QP state"
        );
    }
}
