//! Transport providers.
//!
//! A [`Provider`] is the table of verbs the rest of the crate is written
//! against. [`SoftFabric`] implements it in software and is always available;
//! [`VerbsProvider`] talks to `libibverbs` and needs the `verbs` feature.

mod soft;
#[cfg(feature = "verbs")]
mod verbs;

use std::io;

pub use self::soft::*;
#[cfg(feature = "verbs")]
pub use self::verbs::VerbsProvider;

use super::cq::Wc;
use super::gid::Gid;
use super::mr::Permission;
use super::nic::PortAttr;
use super::qp::{QpAttr, QpInitAttr};
use super::type_alias::*;
use super::wr::{RecvWr, SendWr};

define_provider_handle!(
    /// Opened device context.
    CtxHandle
);
define_provider_handle!(
    /// Protection domain.
    PdHandle
);
define_provider_handle!(
    /// Completion queue.
    CqHandle
);
define_provider_handle!(
    /// Memory region.
    MrHandle
);
define_provider_handle!(
    /// Queue pair.
    QpHandle
);

/// A registered memory region as returned by [`Provider::reg_mr`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawMr {
    pub handle: MrHandle,
    pub lkey: LKey,
    pub rkey: RKey,
}

/// A created queue pair as returned by [`Provider::create_qp`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawQp {
    pub handle: QpHandle,
    pub qp_num: Qpn,
}

/// RDMA verbs used by this crate.
///
/// All methods report failures as [`io::Error`]s carrying the errno the
/// verb failed with. Handles passed in must have been returned by the same
/// provider and not yet destroyed.
pub trait Provider: Send + Sync {
    /// Short provider name for logs.
    fn name(&self) -> &str;

    /// List the names of the devices currently available.
    fn device_names(&self) -> io::Result<Vec<String>>;

    /// Open the device with the given name.
    fn open_device(&self, name: &str) -> io::Result<CtxHandle>;

    fn close_device(&self, ctx: CtxHandle) -> io::Result<()>;

    fn query_port(&self, ctx: CtxHandle, port_num: PortNum) -> io::Result<PortAttr>;

    fn query_gid(&self, ctx: CtxHandle, port_num: PortNum, index: GidIndex) -> io::Result<Gid>;

    fn alloc_pd(&self, ctx: CtxHandle) -> io::Result<PdHandle>;

    fn dealloc_pd(&self, pd: PdHandle) -> io::Result<()>;

    fn create_cq(&self, ctx: CtxHandle, cqe: u32) -> io::Result<CqHandle>;

    fn destroy_cq(&self, cq: CqHandle) -> io::Result<()>;

    /// Register a memory region.
    ///
    /// # Safety
    ///
    /// `addr..addr + len` must stay valid for reads and writes until the
    /// region is deregistered. The provider, and the remote peer through the
    /// provider, may access it at any time in between.
    unsafe fn reg_mr(
        &self,
        pd: PdHandle,
        addr: *mut u8,
        len: usize,
        access: Permission,
    ) -> io::Result<RawMr>;

    fn dereg_mr(&self, mr: MrHandle) -> io::Result<()>;

    /// Create an RC queue pair in the RESET state.
    fn create_qp(&self, pd: PdHandle, init_attr: &QpInitAttr) -> io::Result<RawQp>;

    fn destroy_qp(&self, qp: QpHandle) -> io::Result<()>;

    /// Apply one state transition. On failure the queue pair stays in its
    /// previous state.
    fn modify_qp(&self, qp: QpHandle, attr: &QpAttr) -> io::Result<()>;

    fn post_recv(&self, qp: QpHandle, wr: &RecvWr) -> io::Result<()>;

    fn post_send(&self, qp: QpHandle, wr: &SendWr) -> io::Result<()>;

    /// Poll at most one completion without blocking.
    fn poll_cq(&self, cq: CqHandle) -> io::Result<Option<Wc>>;
}
