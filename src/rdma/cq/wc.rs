use thiserror::Error;

use crate::rdma::type_alias::WrId;

/// Opcode of a completion queue entry.
///
/// Discriminants are identical to `enum ibv_wc_opcode`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WcOpcode {
    /// Send request.
    Send = 0,
    /// RDMA write request.
    RdmaWrite = 1,
    /// RDMA read request.
    RdmaRead = 2,
    /// RDMA compare-and-swap request.
    CompSwap = 3,
    /// RDMA fetch-and-add request.
    FetchAdd = 4,
    /// Memory window bind request.
    BindMw = 5,
    /// Receive request.
    Recv = 128,
    /// Receive request with immediate data.
    RecvRdmaImm = 129,
}

impl TryFrom<u32> for WcOpcode {
    type Error = u32;

    fn try_from(wc_opcode: u32) -> Result<Self, u32> {
        Ok(match wc_opcode {
            0 => WcOpcode::Send,
            1 => WcOpcode::RdmaWrite,
            2 => WcOpcode::RdmaRead,
            3 => WcOpcode::CompSwap,
            4 => WcOpcode::FetchAdd,
            5 => WcOpcode::BindMw,
            128 => WcOpcode::Recv,
            129 => WcOpcode::RecvRdmaImm,
            x => return Err(x),
        })
    }
}

/// Status of a completion queue entry.
///
/// Discriminants are identical to `enum ibv_wc_status`. See
/// [RDMAmojo](https://www.rdmamojo.com/2013/02/15/ibv_poll_cq/) for the
/// detailed meaning of each status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[repr(u32)]
pub enum WcStatus {
    /// The work request and its buffers are done.
    #[error("success")]
    Success = 0,

    /// The message does not fit the port's maximum message size, or a posted
    /// receive buffer is too small for the incoming message.
    #[error("local length error")]
    LocLenErr = 1,

    /// Internal QP consistency error, e.g. an opcode unsupported by the QP
    /// transport type.
    #[error("local QP operation error")]
    LocQpOpErr = 2,

    /// Unused (RD only).
    #[error("local EE context operation error")]
    LocEecOpErr = 3,

    /// The local scatter/gather list does not reference an MR valid for the
    /// requested operation.
    #[error("local protection error")]
    LocProtErr = 4,

    /// The work request was outstanding when the QP entered the error state.
    #[error("WR flush error")]
    WrFlushErr = 5,

    #[error("memory window bind error")]
    MwBindErr = 6,

    /// The responder returned an unexpected transport opcode.
    #[error("bad response error")]
    BadRespErr = 7,

    #[error("local access error")]
    LocAccessErr = 8,

    /// The responder rejected the request, e.g. its receive buffer was too
    /// small or its QP access flags forbid the operation.
    #[error("remote invalid request error")]
    RemInvReqErr = 9,

    /// The remote buffer is out of the MR bounds, or the rkey or MR access
    /// flags do not allow the operation.
    #[error("remote access error")]
    RemAccessErr = 10,

    #[error("remote operation error")]
    RemOpErr = 11,

    /// No ACK or NAK from the remote side. On the first message this usually
    /// means wrong connection attributes; later it means the remote QP is
    /// gone.
    #[error("transport retry counter exceeded")]
    RetryExcErr = 12,

    /// The remote side did not post a receive in time.
    #[error("RNR retry counter exceeded")]
    RnrRetryExcErr = 13,

    /// Unused (RD only).
    #[error("local RDD violation error")]
    LocRddViolErr = 14,

    /// Unused (RD only).
    #[error("remote invalid RD request")]
    RemInvRdReqErr = 15,

    #[error("remote aborted error")]
    RemAbortErr = 16,

    /// Unused (RD only).
    #[error("invalid EE context number")]
    InvEecnErr = 17,

    /// Unused (RD only).
    #[error("invalid EE context state error")]
    InvEecStateErr = 18,

    #[error("fatal error")]
    FatalErr = 19,

    #[error("response timeout error")]
    RespTimeoutErr = 20,

    /// Any other error.
    #[error("general error")]
    GeneralErr = 21,
}

impl WcStatus {
    const ALL: [WcStatus; 22] = [
        WcStatus::Success,
        WcStatus::LocLenErr,
        WcStatus::LocQpOpErr,
        WcStatus::LocEecOpErr,
        WcStatus::LocProtErr,
        WcStatus::WrFlushErr,
        WcStatus::MwBindErr,
        WcStatus::BadRespErr,
        WcStatus::LocAccessErr,
        WcStatus::RemInvReqErr,
        WcStatus::RemAccessErr,
        WcStatus::RemOpErr,
        WcStatus::RetryExcErr,
        WcStatus::RnrRetryExcErr,
        WcStatus::LocRddViolErr,
        WcStatus::RemInvRdReqErr,
        WcStatus::RemAbortErr,
        WcStatus::InvEecnErr,
        WcStatus::InvEecStateErr,
        WcStatus::FatalErr,
        WcStatus::RespTimeoutErr,
        WcStatus::GeneralErr,
    ];

    /// Get the raw status code.
    #[inline]
    pub fn code(self) -> u32 {
        self as u32
    }
}

/// Status codes unknown to this crate map to [`WcStatus::GeneralErr`]; the
/// raw code is still kept in [`Wc::status_code`].
impl From<u32> for WcStatus {
    fn from(wc_status: u32) -> Self {
        WcStatus::ALL
            .get(wc_status as usize)
            .copied()
            .unwrap_or(WcStatus::GeneralErr)
    }
}

/// Work completion entry, as polled from a completion queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Wc {
    pub wr_id: WrId,
    pub status_code: u32,
    pub opcode: WcOpcode,
    pub vendor_err: u32,
    pub byte_len: u32,
}

impl Wc {
    /// Get the work request ID.
    #[inline]
    pub fn wr_id(&self) -> WrId {
        self.wr_id
    }

    /// Get the completion status.
    #[inline]
    pub fn status(&self) -> WcStatus {
        WcStatus::from(self.status_code)
    }

    /// Get the completion status as a `Result`.
    ///
    /// - If the status is `IBV_WC_SUCCESS`, return the number of bytes processed or transferred.
    /// - Otherwise, return an error.
    #[inline]
    pub fn ok(&self) -> Result<usize, WcStatus> {
        match self.status() {
            WcStatus::Success => Ok(self.bytes()),
            _ => Err(self.status()),
        }
    }

    /// Get the opcode of the work request.
    #[inline]
    pub fn opcode(&self) -> WcOpcode {
        self.opcode
    }

    /// Get the number of bytes processed or transferred.
    #[inline]
    pub fn bytes(&self) -> usize {
        self.byte_len as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_follow_ibverbs() {
        assert_eq!(WcStatus::from(0), WcStatus::Success);
        assert_eq!(WcStatus::from(10), WcStatus::RemAccessErr);
        assert_eq!(WcStatus::from(12), WcStatus::RetryExcErr);
        assert_eq!(WcStatus::from(21), WcStatus::GeneralErr);
        assert_eq!(WcStatus::from(999), WcStatus::GeneralErr);
        for (i, s) in WcStatus::ALL.iter().enumerate() {
            assert_eq!(s.code(), i as u32);
        }
    }

    #[test]
    fn ok_reports_bytes_or_status() {
        let mut wc = Wc {
            wr_id: 7,
            status_code: 0,
            opcode: WcOpcode::Recv,
            vendor_err: 0,
            byte_len: 16,
        };
        assert_eq!(wc.ok(), Ok(16));
        wc.status_code = WcStatus::LocLenErr.code();
        assert_eq!(wc.ok(), Err(WcStatus::LocLenErr));
    }
}
