//! In-process software RDMA fabric.
//!
//! Every context opened on a [`SoftFabric`] behaves like one port of one host
//! on a shared InfiniBand subnet: it gets its own LID and GID, and queue pairs
//! of different contexts reach each other by QPN. Memory is moved by copying
//! through the registered addresses, exactly like a NIC would DMA it, so both
//! sides must order their buffer accesses (e.g. with barriers).

use std::collections::{HashMap, VecDeque};
use std::net::Ipv6Addr;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::{io, ptr, slice};

use log::debug;

use super::*;
use crate::rdma::cq::{WcOpcode, WcStatus};
use crate::rdma::nic::{PortLinkLayer, PortMtu, PortState};
use crate::rdma::qp::{AddressVector, QpCaps, QpState};
use crate::rdma::wr::WrOpcode;

/// The only port of every software device.
const PORT_NUM: PortNum = 1;

/// GIDs per port.
const GID_TBL_LEN: u32 = 1;

/// Largest queue depth a software queue pair accepts.
const MAX_QP_WR: u32 = 16;

/// Largest SGE count a software queue pair accepts.
const MAX_SGE: u32 = 1;

/// A verb of [`Provider`] that [`SoftFabric::fail_next`] can make fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    OpenDevice,
    CloseDevice,
    QueryPort,
    QueryGid,
    AllocPd,
    DeallocPd,
    CreateCq,
    DestroyCq,
    RegMr,
    DeregMr,
    CreateQp,
    DestroyQp,
    ModifyQp,
    PostRecv,
    PostSend,
    PollCq,
}

struct SoftContext {
    lid: Lid,
    gid: Gid,
}

struct SoftPd {
    ctx: usize,
}

struct SoftCq {
    ctx: usize,
    capacity: usize,
    entries: VecDeque<Wc>,
    overrun: bool,
}

struct SoftMr {
    pd: usize,
    addr: u64,
    len: usize,
    lkey: LKey,
    rkey: RKey,
    access: Permission,
}

impl SoftMr {
    fn covers(&self, addr: u64, len: usize) -> bool {
        let end = self.addr + self.len as u64;
        addr >= self.addr && addr.checked_add(len as u64).is_some_and(|e| e <= end)
    }
}

/// A SEND that arrived before the target posted a receive.
struct Inbound {
    src_qp: usize,
    wr_id: WrId,
    signaled: bool,
    data: Vec<u8>,
}

struct SoftQp {
    ctx: usize,
    pd: usize,
    send_cq: usize,
    recv_cq: usize,
    caps: QpCaps,
    sig_all: bool,
    qp_num: Qpn,
    state: QpState,
    access: Permission,
    dest: Option<(Qpn, AddressVector)>,
    send_outstanding: u32,
    recv_queue: VecDeque<RecvWr>,
    inbound: VecDeque<Inbound>,
}

struct FabricState {
    next_id: usize,
    next_lid: Lid,
    next_qpn: Qpn,
    next_key: u32,
    contexts: HashMap<usize, SoftContext>,
    pds: HashMap<usize, SoftPd>,
    cqs: HashMap<usize, SoftCq>,
    mrs: HashMap<usize, SoftMr>,
    qps: HashMap<usize, SoftQp>,
    faults: HashMap<Verb, i32>,
    posted: u64,
    polled: u64,
}

#[inline]
fn errno(code: i32) -> io::Error {
    io::Error::from_raw_os_error(code)
}

impl FabricState {
    fn new() -> Self {
        Self {
            next_id: 1,
            next_lid: 1,
            next_qpn: 0x11,
            next_key: 0x1000,
            contexts: HashMap::new(),
            pds: HashMap::new(),
            cqs: HashMap::new(),
            mrs: HashMap::new(),
            qps: HashMap::new(),
            faults: HashMap::new(),
            posted: 0,
            polled: 0,
        }
    }

    fn alloc_id(&mut self) -> usize {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn check_fault(&mut self, verb: Verb) -> io::Result<()> {
        match self.faults.remove(&verb) {
            Some(code) => {
                debug!("soft: injected failure of {:?} (errno {})", verb, code);
                Err(errno(code))
            }
            None => Ok(()),
        }
    }

    fn find_local_mr(&self, pd: usize, lkey: LKey, addr: u64, len: usize) -> Option<&SoftMr> {
        self.mrs
            .values()
            .find(|mr| mr.pd == pd && mr.lkey == lkey && mr.covers(addr, len))
    }

    fn find_remote_mr(&self, pd: usize, rkey: RKey, addr: u64, len: usize) -> Option<&SoftMr> {
        self.mrs
            .values()
            .find(|mr| mr.pd == pd && mr.rkey == rkey && mr.covers(addr, len))
    }

    /// Find the queue pair the address vector and QPN lead to.
    fn route(&self, dest_qpn: Qpn, av: &AddressVector) -> Option<usize> {
        self.qps.iter().find_map(|(&id, qp)| {
            if qp.qp_num != dest_qpn || !matches!(qp.state, QpState::Rtr | QpState::Rts) {
                return None;
            }
            let ctx = self.contexts.get(&qp.ctx)?;
            let reachable = match &av.grh {
                Some(grh) => grh.dgid == ctx.gid,
                None => av.dlid == ctx.lid,
            };
            reachable.then_some(id)
        })
    }

    fn push_cq(&mut self, cq: usize, wc: Wc) {
        if let Some(cq) = self.cqs.get_mut(&cq) {
            if cq.entries.len() >= cq.capacity {
                cq.overrun = true;
            } else {
                cq.entries.push_back(wc);
            }
        }
    }

    fn complete_send(
        &mut self,
        qp: usize,
        wr_id: WrId,
        opcode: WcOpcode,
        status: WcStatus,
        byte_len: u32,
        signaled: bool,
    ) {
        let Some(sq) = self.qps.get_mut(&qp) else {
            return;
        };
        sq.send_outstanding = sq.send_outstanding.saturating_sub(1);
        let cq = sq.send_cq;
        if signaled || sq.sig_all || status != WcStatus::Success {
            self.push_cq(
                cq,
                Wc {
                    wr_id,
                    status_code: status.code(),
                    opcode,
                    vendor_err: 0,
                    byte_len,
                },
            );
        }
    }

    /// Match an inbound SEND with a posted receive and complete both sides.
    fn deliver(&mut self, target: usize, recv: RecvWr, msg: Inbound) {
        let Some(tq) = self.qps.get(&target) else {
            return;
        };
        let (pd, recv_cq) = (tq.pd, tq.recv_cq);
        let len = msg.data.len();

        let sge = recv.sge;
        let (recv_status, send_status) = match self.find_local_mr(pd, sge.lkey, sge.addr, sge.length as usize) {
            Some(mr) if !mr.access.contains(Permission::LOCAL_WRITE) => {
                (WcStatus::LocProtErr, WcStatus::RemOpErr)
            }
            None => (WcStatus::LocProtErr, WcStatus::RemOpErr),
            Some(_) if len > sge.length as usize => {
                (WcStatus::LocLenErr, WcStatus::RemInvReqErr)
            }
            Some(_) => {
                // SAFETY: the range lies in a registered MR, whose memory is
                // valid until deregistration, which needs this lock.
                unsafe { ptr::copy(msg.data.as_ptr(), sge.addr as *mut u8, len) };
                (WcStatus::Success, WcStatus::Success)
            }
        };

        self.push_cq(
            recv_cq,
            Wc {
                wr_id: recv.wr_id,
                status_code: recv_status.code(),
                opcode: WcOpcode::Recv,
                vendor_err: 0,
                byte_len: len as u32,
            },
        );
        self.complete_send(
            msg.src_qp,
            msg.wr_id,
            WcOpcode::Send,
            send_status,
            len as u32,
            msg.signaled,
        );
    }

    fn execute_send(&mut self, qp: usize, wr: &SendWr) -> io::Result<()> {
        let sq = self.qps.get(&qp).ok_or_else(|| errno(libc::EINVAL))?;
        let (pd, dest) = (sq.pd, sq.dest);
        let len = wr.sge.length as usize;
        let wc_opcode = match wr.opcode {
            WrOpcode::Send => WcOpcode::Send,
            WrOpcode::RdmaRead => WcOpcode::RdmaRead,
            WrOpcode::RdmaWrite => WcOpcode::RdmaWrite,
        };
        let fail = |this: &mut Self, status: WcStatus| -> io::Result<()> {
            this.complete_send(qp, wr.wr_id, wc_opcode, status, 0, wr.signaled);
            Ok(())
        };

        let local_ok = match self.find_local_mr(pd, wr.sge.lkey, wr.sge.addr, len) {
            Some(mr) => wr.opcode != WrOpcode::RdmaRead || mr.access.contains(Permission::LOCAL_WRITE),
            None => false,
        };
        if !local_ok {
            return fail(self, WcStatus::LocProtErr);
        }

        let Some(target) = dest.and_then(|(qpn, av)| self.route(qpn, &av)) else {
            return fail(self, WcStatus::RetryExcErr);
        };

        if wr.opcode == WrOpcode::Send {
            // SAFETY: the range lies in a registered MR.
            let data = unsafe { slice::from_raw_parts(wr.sge.addr as *const u8, len) }.to_vec();
            let msg = Inbound {
                src_qp: qp,
                wr_id: wr.wr_id,
                signaled: wr.signaled,
                data,
            };
            let tq = self.qps.get_mut(&target).ok_or_else(|| errno(libc::EINVAL))?;
            match tq.recv_queue.pop_front() {
                Some(recv) => self.deliver(target, recv, msg),
                None => tq.inbound.push_back(msg),
            }
            return Ok(());
        }

        let Some(remote) = wr.remote else {
            return Err(errno(libc::EINVAL));
        };
        let needed = match wr.opcode {
            WrOpcode::RdmaRead => Permission::REMOTE_READ,
            _ => Permission::REMOTE_WRITE,
        };
        let tq = self.qps.get(&target).ok_or_else(|| errno(libc::EINVAL))?;
        let allowed = tq.access.contains(needed)
            && self
                .find_remote_mr(tq.pd, remote.rkey, remote.addr, len)
                .is_some_and(|mr| mr.access.contains(needed));
        if !allowed {
            return fail(self, WcStatus::RemAccessErr);
        }

        let (src, dst) = match wr.opcode {
            WrOpcode::RdmaRead => (remote.addr, wr.sge.addr),
            _ => (wr.sge.addr, remote.addr),
        };
        // SAFETY: both ranges lie in registered MRs.
        unsafe { ptr::copy(src as *const u8, dst as *mut u8, len) };
        self.complete_send(qp, wr.wr_id, wc_opcode, WcStatus::Success, len as u32, wr.signaled);
        Ok(())
    }
}

/// In-process software RDMA fabric.
///
/// Share one fabric (through an `Arc`) between every endpoint that should be
/// able to reach each other.
pub struct SoftFabric {
    devices: Vec<String>,
    state: Mutex<FabricState>,
}

impl Default for SoftFabric {
    fn default() -> Self {
        Self::new()
    }
}

impl SoftFabric {
    /// Name of the device of [`SoftFabric::new`].
    pub const DEFAULT_DEVICE: &'static str = "soft0";

    /// Create a fabric with a single device named `soft0`.
    pub fn new() -> Self {
        Self::with_devices([Self::DEFAULT_DEVICE])
    }

    /// Create a fabric with the given device names. Every device may be
    /// opened any number of times.
    pub fn with_devices<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            devices: names.into_iter().map(Into::into).collect(),
            state: Mutex::new(FabricState::new()),
        }
    }

    fn state(&self) -> MutexGuard<'_, FabricState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make the next call of `verb` fail with the given errno.
    pub fn fail_next(&self, verb: Verb, code: i32) {
        self.state().faults.insert(verb, code);
    }

    /// Count the live contexts, PDs, CQs, MRs and QPs.
    pub fn live_resources(&self) -> usize {
        let st = self.state();
        st.contexts.len() + st.pds.len() + st.cqs.len() + st.mrs.len() + st.qps.len()
    }

    /// Count the work requests accepted by `post_send` and `post_recv` on
    /// any queue pair of the fabric.
    pub fn posted(&self) -> u64 {
        self.state().posted
    }

    /// Count the completions taken out of any CQ of the fabric.
    pub fn polled(&self) -> u64 {
        self.state().polled
    }

    /// Get the current state of a queue pair.
    pub fn qp_state(&self, qp: QpHandle) -> Option<QpState> {
        self.state().qps.get(&qp.raw()).map(|qp| qp.state)
    }
}

impl Provider for SoftFabric {
    fn name(&self) -> &str {
        "soft"
    }

    fn device_names(&self) -> io::Result<Vec<String>> {
        Ok(self.devices.clone())
    }

    fn open_device(&self, name: &str) -> io::Result<CtxHandle> {
        let mut st = self.state();
        st.check_fault(Verb::OpenDevice)?;
        if !self.devices.iter().any(|d| d == name) {
            return Err(errno(libc::ENODEV));
        }

        let lid = st.next_lid;
        st.next_lid += 1;
        let gid = Gid::from(Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, lid));
        let id = st.alloc_id();
        st.contexts.insert(id, SoftContext { lid, gid });
        debug!("soft: opened {} as context {} (LID {:#x})", name, id, lid);
        Ok(CtxHandle::from_raw(id))
    }

    fn close_device(&self, ctx: CtxHandle) -> io::Result<()> {
        let mut st = self.state();
        st.check_fault(Verb::CloseDevice)?;
        let id = ctx.raw();
        if !st.contexts.contains_key(&id) {
            return Err(errno(libc::EINVAL));
        }
        if st.pds.values().any(|pd| pd.ctx == id) || st.cqs.values().any(|cq| cq.ctx == id) {
            return Err(errno(libc::EBUSY));
        }
        st.contexts.remove(&id);
        Ok(())
    }

    fn query_port(&self, ctx: CtxHandle, port_num: PortNum) -> io::Result<PortAttr> {
        let mut st = self.state();
        st.check_fault(Verb::QueryPort)?;
        let ctx = st.contexts.get(&ctx.raw()).ok_or_else(|| errno(libc::EINVAL))?;
        if port_num != PORT_NUM {
            return Err(errno(libc::EINVAL));
        }
        Ok(PortAttr {
            state: PortState::Active,
            lid: ctx.lid,
            active_mtu: PortMtu::Mtu4096,
            link_layer: PortLinkLayer::Infiniband,
            gid_tbl_len: GID_TBL_LEN,
        })
    }

    fn query_gid(&self, ctx: CtxHandle, port_num: PortNum, index: GidIndex) -> io::Result<Gid> {
        let mut st = self.state();
        st.check_fault(Verb::QueryGid)?;
        let ctx = st.contexts.get(&ctx.raw()).ok_or_else(|| errno(libc::EINVAL))?;
        if port_num != PORT_NUM || index as u32 >= GID_TBL_LEN {
            return Err(errno(libc::EINVAL));
        }
        Ok(ctx.gid)
    }

    fn alloc_pd(&self, ctx: CtxHandle) -> io::Result<PdHandle> {
        let mut st = self.state();
        st.check_fault(Verb::AllocPd)?;
        if !st.contexts.contains_key(&ctx.raw()) {
            return Err(errno(libc::EINVAL));
        }
        let id = st.alloc_id();
        st.pds.insert(id, SoftPd { ctx: ctx.raw() });
        Ok(PdHandle::from_raw(id))
    }

    fn dealloc_pd(&self, pd: PdHandle) -> io::Result<()> {
        let mut st = self.state();
        st.check_fault(Verb::DeallocPd)?;
        let id = pd.raw();
        if !st.pds.contains_key(&id) {
            return Err(errno(libc::EINVAL));
        }
        if st.mrs.values().any(|mr| mr.pd == id) || st.qps.values().any(|qp| qp.pd == id) {
            return Err(errno(libc::EBUSY));
        }
        st.pds.remove(&id);
        Ok(())
    }

    fn create_cq(&self, ctx: CtxHandle, cqe: u32) -> io::Result<CqHandle> {
        let mut st = self.state();
        st.check_fault(Verb::CreateCq)?;
        if !st.contexts.contains_key(&ctx.raw()) || cqe == 0 {
            return Err(errno(libc::EINVAL));
        }
        let id = st.alloc_id();
        st.cqs.insert(
            id,
            SoftCq {
                ctx: ctx.raw(),
                capacity: cqe as usize,
                entries: VecDeque::new(),
                overrun: false,
            },
        );
        Ok(CqHandle::from_raw(id))
    }

    fn destroy_cq(&self, cq: CqHandle) -> io::Result<()> {
        let mut st = self.state();
        st.check_fault(Verb::DestroyCq)?;
        let id = cq.raw();
        if !st.cqs.contains_key(&id) {
            return Err(errno(libc::EINVAL));
        }
        if st.qps.values().any(|qp| qp.send_cq == id || qp.recv_cq == id) {
            return Err(errno(libc::EBUSY));
        }
        st.cqs.remove(&id);
        Ok(())
    }

    unsafe fn reg_mr(
        &self,
        pd: PdHandle,
        addr: *mut u8,
        len: usize,
        access: Permission,
    ) -> io::Result<RawMr> {
        let mut st = self.state();
        st.check_fault(Verb::RegMr)?;
        if !st.pds.contains_key(&pd.raw()) || addr.is_null() || len == 0 {
            return Err(errno(libc::EINVAL));
        }
        // Remote write requires local write, as with real hardware.
        if access.contains(Permission::REMOTE_WRITE) && !access.contains(Permission::LOCAL_WRITE) {
            return Err(errno(libc::EINVAL));
        }

        let (lkey, rkey) = (st.next_key, st.next_key + 1);
        st.next_key += 2;
        let id = st.alloc_id();
        st.mrs.insert(
            id,
            SoftMr {
                pd: pd.raw(),
                addr: addr as u64,
                len,
                lkey,
                rkey,
                access,
            },
        );
        Ok(RawMr {
            handle: MrHandle::from_raw(id),
            lkey,
            rkey,
        })
    }

    fn dereg_mr(&self, mr: MrHandle) -> io::Result<()> {
        let mut st = self.state();
        st.check_fault(Verb::DeregMr)?;
        st.mrs
            .remove(&mr.raw())
            .map(|_| ())
            .ok_or_else(|| errno(libc::EINVAL))
    }

    fn create_qp(&self, pd: PdHandle, init_attr: &QpInitAttr) -> io::Result<RawQp> {
        let mut st = self.state();
        st.check_fault(Verb::CreateQp)?;
        let ctx = st.pds.get(&pd.raw()).ok_or_else(|| errno(libc::EINVAL))?.ctx;
        let caps = init_attr.caps;
        if !st.cqs.contains_key(&init_attr.send_cq.raw())
            || !st.cqs.contains_key(&init_attr.recv_cq.raw())
            || caps.max_send_wr > MAX_QP_WR
            || caps.max_recv_wr > MAX_QP_WR
            || caps.max_send_sge > MAX_SGE
            || caps.max_recv_sge > MAX_SGE
        {
            return Err(errno(libc::EINVAL));
        }

        let qp_num = st.next_qpn;
        st.next_qpn += 1;
        let id = st.alloc_id();
        st.qps.insert(
            id,
            SoftQp {
                ctx,
                pd: pd.raw(),
                send_cq: init_attr.send_cq.raw(),
                recv_cq: init_attr.recv_cq.raw(),
                caps,
                sig_all: init_attr.sq_sig_all,
                qp_num,
                state: QpState::Reset,
                access: Permission::EMPTY,
                dest: None,
                send_outstanding: 0,
                recv_queue: VecDeque::new(),
                inbound: VecDeque::new(),
            },
        );
        Ok(RawQp {
            handle: QpHandle::from_raw(id),
            qp_num,
        })
    }

    fn destroy_qp(&self, qp: QpHandle) -> io::Result<()> {
        let mut st = self.state();
        st.check_fault(Verb::DestroyQp)?;
        st.qps
            .remove(&qp.raw())
            .map(|_| ())
            .ok_or_else(|| errno(libc::EINVAL))
    }

    fn modify_qp(&self, qp: QpHandle, attr: &QpAttr) -> io::Result<()> {
        let mut st = self.state();
        st.check_fault(Verb::ModifyQp)?;
        let qp = st.qps.get_mut(&qp.raw()).ok_or_else(|| errno(libc::EINVAL))?;

        let target = attr.target_state();
        if target.predecessor() != Some(qp.state) {
            return Err(errno(libc::EINVAL));
        }
        match *attr {
            QpAttr::Init {
                port_num, access, ..
            } => {
                if port_num != PORT_NUM {
                    return Err(errno(libc::EINVAL));
                }
                qp.access = access;
            }
            QpAttr::Rtr {
                dest_qp_num, ah, ..
            } => {
                let bad_gid = ah
                    .grh
                    .is_some_and(|grh| grh.sgid_index as u32 >= GID_TBL_LEN);
                if ah.port_num != PORT_NUM || bad_gid {
                    return Err(errno(libc::EINVAL));
                }
                qp.dest = Some((dest_qp_num, ah));
            }
            QpAttr::Rts { .. } => {}
        }
        debug!("soft: QP {:#x} {} -> {}", qp.qp_num, qp.state, target);
        qp.state = target;
        Ok(())
    }

    fn post_recv(&self, qp: QpHandle, wr: &RecvWr) -> io::Result<()> {
        let mut st = self.state();
        st.check_fault(Verb::PostRecv)?;
        let id = qp.raw();
        let rq = st.qps.get_mut(&id).ok_or_else(|| errno(libc::EINVAL))?;
        if matches!(rq.state, QpState::Reset | QpState::Error) {
            return Err(errno(libc::EINVAL));
        }
        if rq.recv_queue.len() >= rq.caps.max_recv_wr as usize {
            return Err(errno(libc::ENOMEM));
        }
        match rq.inbound.pop_front() {
            Some(msg) => st.deliver(id, *wr, msg),
            None => rq.recv_queue.push_back(*wr),
        }
        st.posted += 1;
        Ok(())
    }

    fn post_send(&self, qp: QpHandle, wr: &SendWr) -> io::Result<()> {
        let mut st = self.state();
        st.check_fault(Verb::PostSend)?;
        let id = qp.raw();
        let sq = st.qps.get_mut(&id).ok_or_else(|| errno(libc::EINVAL))?;
        if sq.state != QpState::Rts || (wr.opcode.is_rdma() && wr.remote.is_none()) {
            return Err(errno(libc::EINVAL));
        }
        if sq.send_outstanding >= sq.caps.max_send_wr {
            return Err(errno(libc::ENOMEM));
        }
        sq.send_outstanding += 1;
        st.posted += 1;
        st.execute_send(id, wr)
    }

    fn poll_cq(&self, cq: CqHandle) -> io::Result<Option<Wc>> {
        let mut st = self.state();
        st.check_fault(Verb::PollCq)?;
        let cq = st.cqs.get_mut(&cq.raw()).ok_or_else(|| errno(libc::EINVAL))?;
        if cq.overrun {
            return Err(errno(libc::EOVERFLOW));
        }
        let wc = cq.entries.pop_front();
        if wc.is_some() {
            st.polled += 1;
        }
        Ok(wc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rdma::mr::MrRemote;
    use crate::rdma::qp::GlobalRoute;
    use crate::rdma::wr::Sge;

    struct Host {
        ctx: CtxHandle,
        pd: PdHandle,
        cq: CqHandle,
        mr: RawMr,
        qp: RawQp,
        lid: Lid,
        buf: Box<[u8]>,
    }

    impl Host {
        fn new(fabric: &SoftFabric, access: Permission) -> Host {
            let ctx = fabric.open_device("soft0").unwrap();
            let lid = fabric.query_port(ctx, 1).unwrap().lid;
            let pd = fabric.alloc_pd(ctx).unwrap();
            let cq = fabric.create_cq(ctx, 1).unwrap();
            let mut buf = vec![0u8; 32].into_boxed_slice();
            let mr = unsafe { fabric.reg_mr(pd, buf.as_mut_ptr(), buf.len(), access) }.unwrap();
            let init = QpInitAttr {
                send_cq: cq,
                recv_cq: cq,
                caps: QpCaps::SINGLE,
                sq_sig_all: true,
            };
            let qp = fabric.create_qp(pd, &init).unwrap();
            Host {
                ctx,
                pd,
                cq,
                mr,
                qp,
                lid,
                buf,
            }
        }

        fn sge(&self) -> Sge {
            Sge {
                addr: self.buf.as_ptr() as u64,
                length: self.buf.len() as u32,
                lkey: self.mr.lkey,
            }
        }

        fn remote(&self) -> MrRemote {
            MrRemote::new(self.buf.as_ptr() as u64, self.buf.len(), self.mr.rkey)
        }

        fn bring_up(&self, fabric: &SoftFabric, dest_qpn: Qpn, dlid: Lid, grh: Option<GlobalRoute>) {
            let steps = [
                QpAttr::Init {
                    port_num: 1,
                    pkey_index: 0,
                    access: Permission::default(),
                },
                QpAttr::Rtr {
                    path_mtu: PortMtu::Mtu256,
                    dest_qp_num: dest_qpn,
                    rq_psn: 0,
                    max_dest_rd_atomic: 1,
                    min_rnr_timer: 0x12,
                    ah: AddressVector {
                        dlid,
                        sl: 0,
                        src_path_bits: 0,
                        port_num: 1,
                        grh,
                    },
                },
                QpAttr::Rts {
                    sq_psn: 0,
                    timeout: 0x12,
                    retry_cnt: 6,
                    rnr_retry: 0,
                    max_rd_atomic: 1,
                },
            ];
            for attr in &steps {
                fabric.modify_qp(self.qp.handle, attr).unwrap();
            }
        }

        fn teardown(self, fabric: &SoftFabric) {
            fabric.destroy_qp(self.qp.handle).unwrap();
            fabric.dereg_mr(self.mr.handle).unwrap();
            fabric.destroy_cq(self.cq).unwrap();
            fabric.dealloc_pd(self.pd).unwrap();
            fabric.close_device(self.ctx).unwrap();
        }
    }

    fn pair(fabric: &SoftFabric) -> (Host, Host) {
        let a = Host::new(fabric, Permission::default());
        let b = Host::new(fabric, Permission::default());
        a.bring_up(fabric, b.qp.qp_num, b.lid, None);
        b.bring_up(fabric, a.qp.qp_num, a.lid, None);
        (a, b)
    }

    fn send_wr(host: &Host, opcode: WrOpcode, remote: Option<MrRemote>) -> SendWr {
        SendWr {
            wr_id: 1,
            opcode,
            sge: host.sge(),
            remote,
            signaled: true,
        }
    }

    #[test]
    fn contexts_get_distinct_lids() {
        let fabric = SoftFabric::new();
        let a = fabric.open_device("soft0").unwrap();
        let b = fabric.open_device("soft0").unwrap();
        let pa = fabric.query_port(a, 1).unwrap();
        let pb = fabric.query_port(b, 1).unwrap();
        assert_ne!(pa.lid, pb.lid);
        assert_ne!(fabric.query_gid(a, 1, 0).unwrap(), fabric.query_gid(b, 1, 0).unwrap());
        assert!(fabric.query_gid(a, 1, 1).is_err());
        assert_eq!(
            fabric.open_device("mlx5_0").unwrap_err().raw_os_error(),
            Some(libc::ENODEV)
        );
    }

    #[test]
    fn out_of_order_transitions_are_rejected() {
        let fabric = SoftFabric::new();
        let host = Host::new(&fabric, Permission::default());
        let rts = QpAttr::Rts {
            sq_psn: 0,
            timeout: 0x12,
            retry_cnt: 6,
            rnr_retry: 0,
            max_rd_atomic: 1,
        };
        let err = fabric.modify_qp(host.qp.handle, &rts).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EINVAL));
        assert_eq!(fabric.qp_state(host.qp.handle), Some(QpState::Reset));
    }

    #[test]
    fn send_waits_for_receive() {
        let fabric = SoftFabric::new();
        let (mut a, b) = pair(&fabric);
        a.buf[..5].copy_from_slice(b"hello");

        fabric.post_send(a.qp.handle, &send_wr(&a, WrOpcode::Send, None)).unwrap();
        assert!(fabric.poll_cq(a.cq).unwrap().is_none());

        let recv = RecvWr {
            wr_id: 2,
            sge: b.sge(),
        };
        fabric.post_recv(b.qp.handle, &recv).unwrap();
        let wc = fabric.poll_cq(b.cq).unwrap().unwrap();
        assert_eq!((wc.opcode, wc.status(), wc.wr_id), (WcOpcode::Recv, WcStatus::Success, 2));
        assert_eq!(&b.buf[..5], b"hello");
        let wc = fabric.poll_cq(a.cq).unwrap().unwrap();
        assert_eq!((wc.opcode, wc.status()), (WcOpcode::Send, WcStatus::Success));

        a.teardown(&fabric);
        b.teardown(&fabric);
        assert_eq!(fabric.live_resources(), 0);
    }

    #[test]
    fn rdma_write_and_read() {
        let fabric = SoftFabric::new();
        let (mut a, mut b) = pair(&fabric);

        a.buf[..4].copy_from_slice(b"ping");
        let wr = send_wr(&a, WrOpcode::RdmaWrite, Some(b.remote()));
        fabric.post_send(a.qp.handle, &wr).unwrap();
        let wc = fabric.poll_cq(a.cq).unwrap().unwrap();
        assert_eq!(wc.ok(), Ok(32));
        assert_eq!(&b.buf[..4], b"ping");
        assert!(fabric.poll_cq(b.cq).unwrap().is_none());

        b.buf[..4].copy_from_slice(b"pong");
        let wr = send_wr(&a, WrOpcode::RdmaRead, Some(b.remote()));
        fabric.post_send(a.qp.handle, &wr).unwrap();
        assert_eq!(fabric.poll_cq(a.cq).unwrap().unwrap().opcode, WcOpcode::RdmaRead);
        assert_eq!(&a.buf[..4], b"pong");
    }

    #[test]
    fn remote_access_is_checked() {
        let fabric = SoftFabric::new();
        let a = Host::new(&fabric, Permission::default());
        let b = Host::new(&fabric, Permission::LOCAL_WRITE);
        a.bring_up(&fabric, b.qp.qp_num, b.lid, None);
        b.bring_up(&fabric, a.qp.qp_num, a.lid, None);

        let wr = send_wr(&a, WrOpcode::RdmaWrite, Some(b.remote()));
        fabric.post_send(a.qp.handle, &wr).unwrap();
        assert_eq!(fabric.poll_cq(a.cq).unwrap().unwrap().status(), WcStatus::RemAccessErr);

        let mut bad_key = b.remote();
        bad_key.rkey ^= 0xff;
        let wr = send_wr(&a, WrOpcode::RdmaRead, Some(bad_key));
        fabric.post_send(a.qp.handle, &wr).unwrap();
        assert_eq!(fabric.poll_cq(a.cq).unwrap().unwrap().status(), WcStatus::RemAccessErr);
    }

    #[test]
    fn unreachable_destination_exceeds_retries() {
        let fabric = SoftFabric::new();
        let a = Host::new(&fabric, Permission::default());
        let b = Host::new(&fabric, Permission::default());
        a.bring_up(&fabric, b.qp.qp_num + 100, b.lid, None);
        b.bring_up(&fabric, a.qp.qp_num, a.lid, None);

        fabric.post_send(a.qp.handle, &send_wr(&a, WrOpcode::Send, None)).unwrap();
        assert_eq!(fabric.poll_cq(a.cq).unwrap().unwrap().status(), WcStatus::RetryExcErr);
    }

    #[test]
    fn global_routing_uses_gid() {
        let fabric = SoftFabric::new();
        let a = Host::new(&fabric, Permission::default());
        let b = Host::new(&fabric, Permission::default());
        let grh = |ctx| GlobalRoute {
            dgid: fabric.query_gid(ctx, 1, 0).unwrap(),
            flow_label: 0,
            sgid_index: 0,
            hop_limit: 1,
            traffic_class: 0,
        };
        // A bogus LID does not matter when a GRH is present.
        a.bring_up(&fabric, b.qp.qp_num, 0, Some(grh(b.ctx)));
        b.bring_up(&fabric, a.qp.qp_num, 0, Some(grh(a.ctx)));

        let wr = send_wr(&a, WrOpcode::RdmaWrite, Some(b.remote()));
        fabric.post_send(a.qp.handle, &wr).unwrap();
        assert_eq!(fabric.poll_cq(a.cq).unwrap().unwrap().status(), WcStatus::Success);
    }

    #[test]
    fn posting_checks_state_and_depth() {
        let fabric = SoftFabric::new();
        let host = Host::new(&fabric, Permission::default());
        let wr = send_wr(&host, WrOpcode::Send, None);
        assert_eq!(
            fabric.post_send(host.qp.handle, &wr).unwrap_err().raw_os_error(),
            Some(libc::EINVAL)
        );
        let recv = RecvWr {
            wr_id: 0,
            sge: host.sge(),
        };
        assert!(fabric.post_recv(host.qp.handle, &recv).is_err());

        let (a, _b) = pair(&fabric);
        let recv = RecvWr {
            wr_id: 0,
            sge: a.sge(),
        };
        fabric.post_recv(a.qp.handle, &recv).unwrap();
        assert_eq!(
            fabric.post_recv(a.qp.handle, &recv).unwrap_err().raw_os_error(),
            Some(libc::ENOMEM)
        );
    }

    #[test]
    fn busy_parents_and_injected_faults() {
        let fabric = SoftFabric::new();
        let host = Host::new(&fabric, Permission::default());
        assert_eq!(fabric.dealloc_pd(host.pd).unwrap_err().raw_os_error(), Some(libc::EBUSY));
        assert_eq!(fabric.destroy_cq(host.cq).unwrap_err().raw_os_error(), Some(libc::EBUSY));
        assert_eq!(fabric.close_device(host.ctx).unwrap_err().raw_os_error(), Some(libc::EBUSY));

        fabric.fail_next(Verb::DestroyQp, libc::EIO);
        assert_eq!(fabric.destroy_qp(host.qp.handle).unwrap_err().raw_os_error(), Some(libc::EIO));
        host.teardown(&fabric);
        assert_eq!(fabric.live_resources(), 0);
    }
}
