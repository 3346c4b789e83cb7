mod perm;
mod remote;

use std::io;

use log::warn;

pub use self::perm::*;
pub use self::remote::*;
use super::pd::Pd;
use super::provider::RawMr;
use super::type_alias::{LKey, RKey};
use super::wr::Sge;

/// Local memory region.
///
/// Holds its [`Pd`] alive. The registered memory does not belong to this
/// type; see [`RegisteredMem`] for an owning wrapper.
pub struct Mr {
    pd: Pd,
    mr: RawMr,
    addr: *mut u8,
    len: usize,
    perm: Permission,
    closed: bool,
}

// SAFETY: the raw address is only handed to the provider, never dereferenced
// by `Mr` itself.
unsafe impl Send for Mr {}
unsafe impl Sync for Mr {}

impl Mr {
    /// Register a memory region with the given protection domain.
    ///
    /// # Safety
    ///
    /// `addr..addr + len` must stay valid until the returned `Mr` is closed
    /// or dropped.
    pub unsafe fn reg(pd: &Pd, addr: *mut u8, len: usize, perm: Permission) -> io::Result<Self> {
        let provider = pd.context().provider();
        // SAFETY: forwarded to the caller.
        let mr = unsafe { provider.reg_mr(pd.handle(), addr, len, perm) }?;
        Ok(Self {
            pd: pd.clone(),
            mr,
            addr,
            len,
            perm,
            closed: false,
        })
    }

    /// Get the local key of the memory region.
    #[inline]
    pub fn lkey(&self) -> LKey {
        self.mr.lkey
    }

    /// Get the remote key of the memory region.
    #[inline]
    pub fn rkey(&self) -> RKey {
        self.mr.rkey
    }

    /// Get the start address of the registered memory area.
    #[inline]
    pub fn addr(&self) -> *mut u8 {
        self.addr
    }

    /// Get the length of the registered memory area.
    #[allow(clippy::len_without_is_empty)]
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Get the access permissions the region was registered with.
    #[inline]
    pub fn perm(&self) -> Permission {
        self.perm
    }

    /// Get an SGE covering the whole memory region.
    #[inline]
    pub fn sge(&self) -> Sge {
        Sge {
            addr: self.addr as u64,
            length: self.len as u32,
            lkey: self.mr.lkey,
        }
    }

    /// Get the remote-side view of the whole memory region.
    #[inline]
    pub fn as_remote(&self) -> MrRemote {
        MrRemote::new(self.addr as u64, self.len, self.mr.rkey)
    }

    /// Deregister the memory region.
    pub fn close(mut self) -> io::Result<()> {
        self.closed = true;
        self.pd.context().provider().dereg_mr(self.mr.handle)
    }
}

impl Drop for Mr {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(e) = self.pd.context().provider().dereg_mr(self.mr.handle) {
                warn!("cannot deregister MR on drop: {}", e);
            }
        }
    }
}

/// A wrapper around an owned memory area that is registered as an RDMA MR.
///
/// The MR is deregistered before the memory is freed.
pub struct RegisteredMem {
    mr: Mr,
    buf: Box<[u8]>,
}

impl RegisteredMem {
    /// Register a memory region on the given buffer, taking its ownership.
    pub fn new(pd: &Pd, mut buf: Box<[u8]>, perm: Permission) -> io::Result<Self> {
        // SAFETY: the buffer is owned by the returned value and outlives `mr`
        // by field order; moving a `Box` does not move its heap allocation.
        let mr = unsafe { Mr::reg(pd, buf.as_mut_ptr(), buf.len(), perm) }?;
        Ok(Self { mr, buf })
    }

    /// Get the memory region.
    #[inline]
    pub fn mr(&self) -> &Mr {
        &self.mr
    }

    /// Get the registered memory.
    ///
    /// The peer may access this memory through RDMA at any time it has been
    /// granted to; order accesses with the peer (e.g. with barriers).
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    /// Get the registered memory mutably. See [`RegisteredMem::as_slice`].
    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    /// Deregister the memory region, then free the memory.
    pub fn close(self) -> io::Result<()> {
        let Self { mr, buf } = self;
        let ret = mr.close();
        drop(buf);
        ret
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::rdma::context::Context;
    use crate::rdma::provider::{SoftFabric, Verb};

    #[test]
    fn register_and_close() {
        let fabric = Arc::new(SoftFabric::new());
        let ctx = Context::open(fabric.clone(), None, 1).unwrap();
        let pd = Pd::alloc(&ctx).unwrap();

        let mem = RegisteredMem::new(&pd, vec![0u8; 64].into_boxed_slice(), Permission::default()).unwrap();
        let sge = mem.mr().sge();
        assert_eq!(sge.addr, mem.as_slice().as_ptr() as u64);
        assert_eq!(sge.length, 64);
        assert_eq!(mem.mr().as_remote().rkey, mem.mr().rkey());
        assert!(mem.mr().perm().contains(Permission::REMOTE_READ));

        mem.close().unwrap();
        drop((pd, ctx));
        assert_eq!(fabric.live_resources(), 0);
    }

    #[test]
    fn failed_registration() {
        let fabric = Arc::new(SoftFabric::new());
        let ctx = Context::open(fabric.clone(), None, 1).unwrap();
        let pd = Pd::alloc(&ctx).unwrap();
        fabric.fail_next(Verb::RegMr, libc::ENOMEM);
        let err = RegisteredMem::new(&pd, vec![0u8; 8].into_boxed_slice(), Permission::default())
            .err()
            .unwrap();
        assert_eq!(err.raw_os_error(), Some(libc::ENOMEM));
    }
}
