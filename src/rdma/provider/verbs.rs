//! Transport provider backed by `libibverbs`.

use std::ffi::CStr;
use std::os::raw::{c_int, c_void};
use std::{io, mem, ptr};

use log::debug;

use super::*;
use crate::bindings::*;
use crate::rdma::cq::WcOpcode;
use crate::rdma::nic::{PortLinkLayer, PortMtu, PortState};
use crate::rdma::qp::{AddressVector, QpAttr};
use crate::rdma::wr::WrOpcode;
use crate::utils::interop::{from_c_errno, from_c_ptr, from_c_ret};

/// `IBV_LINK_LAYER_ETHERNET`, an anonymous enum constant in `verbs.h`.
const LINK_LAYER_ETHERNET: u8 = 2;

/// Owner of the array returned by `ibv_get_device_list`.
struct DeviceList {
    list: *mut *mut ibv_device,
    len: usize,
}

impl DeviceList {
    fn get() -> io::Result<Self> {
        let mut num = 0 as c_int;
        // SAFETY: FFI.
        let list = unsafe { ibv_get_device_list(&mut num) };
        let list = from_c_ptr(list)?.as_ptr();
        Ok(Self {
            list,
            len: num as usize,
        })
    }

    fn iter(&self) -> impl Iterator<Item = (String, *mut ibv_device)> + '_ {
        (0..self.len).map(move |i| {
            // SAFETY: `i` is within the array, whose entries are valid devices
            // until the list is freed.
            unsafe {
                let dev = *self.list.add(i);
                let name = CStr::from_ptr(ibv_get_device_name(dev))
                    .to_string_lossy()
                    .into_owned();
                (name, dev)
            }
        })
    }
}

impl Drop for DeviceList {
    fn drop(&mut self) {
        // SAFETY: FFI; the list came from `ibv_get_device_list`.
        unsafe { ibv_free_device_list(self.list) };
    }
}

#[inline]
fn ctx_ptr(ctx: CtxHandle) -> *mut ibv_context {
    ctx.raw() as *mut ibv_context
}

#[inline]
fn pd_ptr(pd: PdHandle) -> *mut ibv_pd {
    pd.raw() as *mut ibv_pd
}

#[inline]
fn cq_ptr(cq: CqHandle) -> *mut ibv_cq {
    cq.raw() as *mut ibv_cq
}

#[inline]
fn qp_ptr(qp: QpHandle) -> *mut ibv_qp {
    qp.raw() as *mut ibv_qp
}

fn ah_attr(av: &AddressVector) -> ibv_ah_attr {
    // SAFETY: POD type.
    let mut ah = unsafe { mem::zeroed::<ibv_ah_attr>() };
    ah.dlid = av.dlid;
    ah.sl = av.sl;
    ah.src_path_bits = av.src_path_bits;
    ah.port_num = av.port_num;
    if let Some(grh) = av.grh {
        ah.is_global = 1;
        ah.grh.dgid.raw = grh.dgid.0;
        ah.grh.flow_label = grh.flow_label;
        ah.grh.sgid_index = grh.sgid_index;
        ah.grh.hop_limit = grh.hop_limit;
        ah.grh.traffic_class = grh.traffic_class;
    }
    ah
}

/// Transport provider that drives real RDMA NICs through `libibverbs`.
///
/// Handles carry the addresses of the `libibverbs` objects.
#[derive(Debug, Default, Clone, Copy)]
pub struct VerbsProvider;

impl VerbsProvider {
    pub fn new() -> Self {
        Self
    }
}

impl Provider for VerbsProvider {
    fn name(&self) -> &str {
        "verbs"
    }

    fn device_names(&self) -> io::Result<Vec<String>> {
        Ok(DeviceList::get()?.iter().map(|(name, _)| name).collect())
    }

    fn open_device(&self, name: &str) -> io::Result<CtxHandle> {
        let list = DeviceList::get()?;
        let (_, dev) = list
            .iter()
            .find(|(dev_name, _)| dev_name == name)
            .ok_or_else(|| io::Error::from_raw_os_error(libc::ENODEV))?;

        // SAFETY: FFI; `dev` is valid while `list` is alive.
        let ctx = from_c_ptr(unsafe { ibv_open_device(dev) })?;
        debug!("opened device {} at {:p}", name, ctx);
        Ok(CtxHandle::from_raw(ctx.as_ptr() as usize))
    }

    fn close_device(&self, ctx: CtxHandle) -> io::Result<()> {
        // SAFETY: FFI.
        from_c_ret(unsafe { ibv_close_device(ctx_ptr(ctx)) })
    }

    fn query_port(&self, ctx: CtxHandle, port_num: PortNum) -> io::Result<PortAttr> {
        // SAFETY: POD type.
        let mut attr = unsafe { mem::zeroed::<ibv_port_attr>() };
        // SAFETY: FFI.
        from_c_ret(unsafe { ___ibv_query_port(ctx_ptr(ctx), port_num, &mut attr) })?;
        Ok(PortAttr {
            state: PortState::from(attr.state),
            lid: attr.lid,
            active_mtu: PortMtu::from(attr.active_mtu),
            link_layer: if attr.link_layer == LINK_LAYER_ETHERNET {
                PortLinkLayer::Ethernet
            } else {
                PortLinkLayer::Infiniband
            },
            gid_tbl_len: attr.gid_tbl_len.max(0) as u32,
        })
    }

    fn query_gid(&self, ctx: CtxHandle, port_num: PortNum, index: GidIndex) -> io::Result<Gid> {
        // SAFETY: POD type.
        let mut gid = unsafe { mem::zeroed::<ibv_gid>() };
        // SAFETY: FFI.
        from_c_errno(unsafe { ibv_query_gid(ctx_ptr(ctx), port_num, index as c_int, &mut gid) })?;
        // SAFETY: every bit pattern is a valid `raw`.
        Ok(Gid(unsafe { gid.raw }))
    }

    fn alloc_pd(&self, ctx: CtxHandle) -> io::Result<PdHandle> {
        // SAFETY: FFI.
        let pd = from_c_ptr(unsafe { ibv_alloc_pd(ctx_ptr(ctx)) })?;
        Ok(PdHandle::from_raw(pd.as_ptr() as usize))
    }

    fn dealloc_pd(&self, pd: PdHandle) -> io::Result<()> {
        // SAFETY: FFI.
        from_c_ret(unsafe { ibv_dealloc_pd(pd_ptr(pd)) })
    }

    fn create_cq(&self, ctx: CtxHandle, cqe: u32) -> io::Result<CqHandle> {
        // SAFETY: FFI.
        let cq = from_c_ptr(unsafe {
            ibv_create_cq(
                ctx_ptr(ctx),
                cqe as c_int,
                ptr::null_mut(),
                ptr::null_mut(),
                0,
            )
        })?;
        Ok(CqHandle::from_raw(cq.as_ptr() as usize))
    }

    fn destroy_cq(&self, cq: CqHandle) -> io::Result<()> {
        // SAFETY: FFI.
        from_c_ret(unsafe { ibv_destroy_cq(cq_ptr(cq)) })
    }

    unsafe fn reg_mr(
        &self,
        pd: PdHandle,
        addr: *mut u8,
        len: usize,
        access: Permission,
    ) -> io::Result<RawMr> {
        // SAFETY: FFI; validity of the memory is up to the caller.
        let mr = from_c_ptr(unsafe {
            ibv_reg_mr(pd_ptr(pd), addr as *mut c_void, len, access.bits() as c_int)
        })?;
        // SAFETY: `mr` points to a registered MR.
        let (lkey, rkey) = unsafe { ((*mr.as_ptr()).lkey, (*mr.as_ptr()).rkey) };
        Ok(RawMr {
            handle: MrHandle::from_raw(mr.as_ptr() as usize),
            lkey,
            rkey,
        })
    }

    fn dereg_mr(&self, mr: MrHandle) -> io::Result<()> {
        // SAFETY: FFI.
        from_c_ret(unsafe { ibv_dereg_mr(mr.raw() as *mut ibv_mr) })
    }

    fn create_qp(&self, pd: PdHandle, init_attr: &QpInitAttr) -> io::Result<RawQp> {
        // SAFETY: POD type.
        let mut attr = unsafe { mem::zeroed::<ibv_qp_init_attr>() };
        attr.send_cq = cq_ptr(init_attr.send_cq);
        attr.recv_cq = cq_ptr(init_attr.recv_cq);
        attr.cap.max_send_wr = init_attr.caps.max_send_wr;
        attr.cap.max_recv_wr = init_attr.caps.max_recv_wr;
        attr.cap.max_send_sge = init_attr.caps.max_send_sge;
        attr.cap.max_recv_sge = init_attr.caps.max_recv_sge;
        attr.qp_type = ibv_qp_type::IBV_QPT_RC;
        attr.sq_sig_all = init_attr.sq_sig_all as c_int;

        // SAFETY: FFI.
        let qp = from_c_ptr(unsafe { ibv_create_qp(pd_ptr(pd), &mut attr) })?;
        // SAFETY: `qp` points to a created QP.
        let qp_num = unsafe { (*qp.as_ptr()).qp_num };
        Ok(RawQp {
            handle: QpHandle::from_raw(qp.as_ptr() as usize),
            qp_num,
        })
    }

    fn destroy_qp(&self, qp: QpHandle) -> io::Result<()> {
        // SAFETY: FFI.
        from_c_ret(unsafe { ibv_destroy_qp(qp_ptr(qp)) })
    }

    fn modify_qp(&self, qp: QpHandle, qp_attr: &QpAttr) -> io::Result<()> {
        // SAFETY: POD type.
        let mut attr = unsafe { mem::zeroed::<ibv_qp_attr>() };
        let mask = match *qp_attr {
            QpAttr::Init {
                port_num,
                pkey_index,
                access,
            } => {
                attr.qp_state = ibv_qp_state::IBV_QPS_INIT;
                attr.port_num = port_num;
                attr.pkey_index = pkey_index;
                attr.qp_access_flags = access.bits();
                ibv_qp_attr_mask::IBV_QP_STATE
                    | ibv_qp_attr_mask::IBV_QP_PKEY_INDEX
                    | ibv_qp_attr_mask::IBV_QP_PORT
                    | ibv_qp_attr_mask::IBV_QP_ACCESS_FLAGS
            }
            QpAttr::Rtr {
                path_mtu,
                dest_qp_num,
                rq_psn,
                max_dest_rd_atomic,
                min_rnr_timer,
                ah,
            } => {
                attr.qp_state = ibv_qp_state::IBV_QPS_RTR;
                attr.path_mtu = path_mtu as ibv_mtu::Type;
                attr.dest_qp_num = dest_qp_num;
                attr.rq_psn = rq_psn;
                attr.max_dest_rd_atomic = max_dest_rd_atomic;
                attr.min_rnr_timer = min_rnr_timer;
                attr.ah_attr = ah_attr(&ah);
                ibv_qp_attr_mask::IBV_QP_STATE
                    | ibv_qp_attr_mask::IBV_QP_AV
                    | ibv_qp_attr_mask::IBV_QP_PATH_MTU
                    | ibv_qp_attr_mask::IBV_QP_DEST_QPN
                    | ibv_qp_attr_mask::IBV_QP_RQ_PSN
                    | ibv_qp_attr_mask::IBV_QP_MAX_DEST_RD_ATOMIC
                    | ibv_qp_attr_mask::IBV_QP_MIN_RNR_TIMER
            }
            QpAttr::Rts {
                sq_psn,
                timeout,
                retry_cnt,
                rnr_retry,
                max_rd_atomic,
            } => {
                attr.qp_state = ibv_qp_state::IBV_QPS_RTS;
                attr.sq_psn = sq_psn;
                attr.timeout = timeout;
                attr.retry_cnt = retry_cnt;
                attr.rnr_retry = rnr_retry;
                attr.max_rd_atomic = max_rd_atomic;
                ibv_qp_attr_mask::IBV_QP_STATE
                    | ibv_qp_attr_mask::IBV_QP_TIMEOUT
                    | ibv_qp_attr_mask::IBV_QP_RETRY_CNT
                    | ibv_qp_attr_mask::IBV_QP_RNR_RETRY
                    | ibv_qp_attr_mask::IBV_QP_SQ_PSN
                    | ibv_qp_attr_mask::IBV_QP_MAX_QP_RD_ATOMIC
            }
        };

        // SAFETY: FFI.
        from_c_ret(unsafe { ibv_modify_qp(qp_ptr(qp), &mut attr, mask.0 as c_int) })
    }

    fn post_recv(&self, qp: QpHandle, wr: &RecvWr) -> io::Result<()> {
        let mut sge = ibv_sge {
            addr: wr.sge.addr,
            length: wr.sge.length,
            lkey: wr.sge.lkey,
        };
        // SAFETY: POD type.
        let mut recv_wr = unsafe { mem::zeroed::<ibv_recv_wr>() };
        recv_wr.wr_id = wr.wr_id;
        recv_wr.sg_list = &mut sge;
        recv_wr.num_sge = 1;

        let mut bad_wr = ptr::null_mut();
        // SAFETY: FFI; `sge` outlives the call.
        from_c_ret(unsafe { ibv_post_recv(qp_ptr(qp), &mut recv_wr, &mut bad_wr) })
    }

    fn post_send(&self, qp: QpHandle, wr: &SendWr) -> io::Result<()> {
        let mut sge = ibv_sge {
            addr: wr.sge.addr,
            length: wr.sge.length,
            lkey: wr.sge.lkey,
        };
        // SAFETY: POD type.
        let mut send_wr = unsafe { mem::zeroed::<ibv_send_wr>() };
        send_wr.wr_id = wr.wr_id;
        send_wr.sg_list = &mut sge;
        send_wr.num_sge = 1;
        send_wr.opcode = match wr.opcode {
            WrOpcode::Send => ibv_wr_opcode::IBV_WR_SEND,
            WrOpcode::RdmaRead => ibv_wr_opcode::IBV_WR_RDMA_READ,
            WrOpcode::RdmaWrite => ibv_wr_opcode::IBV_WR_RDMA_WRITE,
        };
        if wr.signaled {
            send_wr.send_flags = ibv_send_flags::IBV_SEND_SIGNALED.0;
        }
        if let Some(remote) = wr.remote {
            // SAFETY: `rdma` is the active member for RDMA opcodes.
            unsafe {
                send_wr.wr.rdma.remote_addr = remote.addr;
                send_wr.wr.rdma.rkey = remote.rkey;
            }
        }

        let mut bad_wr = ptr::null_mut();
        // SAFETY: FFI; `sge` outlives the call.
        from_c_ret(unsafe { ibv_post_send(qp_ptr(qp), &mut send_wr, &mut bad_wr) })
    }

    fn poll_cq(&self, cq: CqHandle) -> io::Result<Option<Wc>> {
        // SAFETY: POD type.
        let mut wc = unsafe { mem::zeroed::<ibv_wc>() };
        // SAFETY: FFI.
        let num = unsafe { ibv_poll_cq(cq_ptr(cq), 1, &mut wc) };
        if num < 0 {
            return Err(io::Error::from_raw_os_error(-num));
        }
        if num == 0 {
            return Ok(None);
        }
        Ok(Some(Wc {
            wr_id: wc.wr_id,
            status_code: wc.status,
            // The opcode is undefined in error completions.
            opcode: WcOpcode::try_from(wc.opcode).unwrap_or(WcOpcode::Send),
            vendor_err: wc.vendor_err,
            byte_len: wc.byte_len,
        }))
    }
}
