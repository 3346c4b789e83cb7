//! Local resources of one side of the connection.

use std::fmt;
use std::io::{self, ErrorKind};
use std::sync::Arc;

use log::{error, info};
use thiserror::Error;

use crate::config::Config;
use crate::ctrl::{Channel, ConnMeta};
use crate::error::{Error, Result};
use crate::rdma::context::Context;
use crate::rdma::cq::{CompletionError, Cq, Poller, Wc};
use crate::rdma::gid::Gid;
use crate::rdma::mr::{Permission, RegisteredMem};
use crate::rdma::pd::Pd;
use crate::rdma::provider::Provider;
use crate::rdma::qp::{PostError, Qp, QpCaps};
use crate::rdma::type_alias::WrId;
use crate::rdma::wr::WrOpcode;

/// Entries of the completion queue. At most one work request is outstanding.
pub const CQ_SIZE: u32 = 1;

/// Work request ID of every posted request.
const WR_ID: WrId = 0;

/// A step of [`Resources::create`] after the device is open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceStep {
    AllocPd,
    CreateCq,
    AllocBuffer,
    RegMr,
    CreateQp,
}

impl fmt::Display for ResourceStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceStep::AllocPd => f.write_str("allocate PD"),
            ResourceStep::CreateCq => write!(f, "create CQ with {} entries", CQ_SIZE),
            ResourceStep::AllocBuffer => f.write_str("allocate memory buffer"),
            ResourceStep::RegMr => f.write_str("register MR"),
            ResourceStep::CreateQp => f.write_str("create QP"),
        }
    }
}

/// Teardown error type.
///
/// Teardown goes on after a failing step; this reports the first failure.
#[derive(Debug, Error)]
#[error("failed to {step} ({failures} teardown step(s) failed)")]
pub struct TeardownError {
    pub step: &'static str,
    pub failures: usize,
    #[source]
    pub source: io::Error,
}

/// Collects the outcome of teardown steps.
#[derive(Default)]
struct Teardown {
    first: Option<(&'static str, io::Error)>,
    failures: usize,
}

impl Teardown {
    fn step(&mut self, step: &'static str, res: io::Result<()>) {
        if let Err(e) = res {
            error!("failed to {}: {}", step, e);
            self.failures += 1;
            if self.first.is_none() {
                self.first = Some((step, e));
            }
        }
    }

    fn finish(self) -> Result<(), TeardownError> {
        match self.first {
            None => Ok(()),
            Some((step, source)) => Err(TeardownError {
                step,
                failures: self.failures,
                source,
            }),
        }
    }
}

fn alloc_buffer(len: usize) -> io::Result<Box<[u8]>> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(len)
        .map_err(|e| io::Error::new(ErrorKind::OutOfMemory, e))?;
    buf.resize(len, 0);
    Ok(buf.into_boxed_slice())
}

/// Everything one side needs to run: the exchange channel, the opened device,
/// a PD, a CQ, a registered buffer, and an RC QP.
///
/// Resources are released in field order when dropped, and in the same order
/// by [`Resources::destroy`].
pub struct Resources {
    qp: Qp,
    mem: RegisteredMem,
    cq: Cq,
    pd: Pd,
    ctx: Context,
    channel: Channel,
    remote: Option<ConnMeta>,
    poller: Poller,
}

impl fmt::Debug for Resources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resources")
            .field("ctx", &self.ctx)
            .field("qp", &self.qp)
            .field("remote", &self.remote)
            .finish()
    }
}

impl Resources {
    /// Connect the exchange channel to the peer, then create the RDMA
    /// resources.
    pub fn create(cfg: &Config, provider: Arc<dyn Provider>) -> Result<Self> {
        let channel = Channel::establish(
            cfg.server_name.as_deref(),
            cfg.tcp_port,
            cfg.connect_timeout(),
        )?;
        Self::with_channel(channel, cfg, provider)
    }

    /// Create the RDMA resources over an established exchange channel.
    ///
    /// On failure, everything created so far is released before returning.
    pub fn with_channel(channel: Channel, cfg: &Config, provider: Arc<dyn Provider>) -> Result<Self> {
        let ctx = Context::open(provider, cfg.dev_name.as_deref(), cfg.ib_port)?;

        let pd = Pd::alloc(&ctx).map_err(|source| Error::Resource {
            step: ResourceStep::AllocPd,
            source,
        })?;
        let cq = Cq::new(&ctx, CQ_SIZE).map_err(|source| Error::Resource {
            step: ResourceStep::CreateCq,
            source,
        })?;
        let buf = alloc_buffer(cfg.msg_size).map_err(|source| Error::Resource {
            step: ResourceStep::AllocBuffer,
            source,
        })?;

        let perm = Permission::LOCAL_WRITE | Permission::REMOTE_READ | Permission::REMOTE_WRITE;
        let mem = RegisteredMem::new(&pd, buf, perm).map_err(|source| Error::Resource {
            step: ResourceStep::RegMr,
            source,
        })?;
        info!(
            "MR was registered with addr={:p}, lkey={:#x}, rkey={:#x}, flags={:?}",
            mem.mr().addr(),
            mem.mr().lkey(),
            mem.mr().rkey(),
            perm
        );

        let qp = Qp::new(&pd, &cq, QpCaps::SINGLE).map_err(|source| Error::Resource {
            step: ResourceStep::CreateQp,
            source,
        })?;
        info!("QP was created, QP number={:#x}", qp.qp_num());

        Ok(Self {
            qp,
            mem,
            cq,
            pd,
            ctx,
            channel,
            remote: None,
            poller: cfg.poller(),
        })
    }

    #[inline]
    pub fn context(&self) -> &Context {
        &self.ctx
    }

    #[inline]
    pub fn qp(&self) -> &Qp {
        &self.qp
    }

    #[inline]
    pub fn qp_mut(&mut self) -> &mut Qp {
        &mut self.qp
    }

    #[inline]
    pub fn channel_mut(&mut self) -> &mut Channel {
        &mut self.channel
    }

    /// Get the registered buffer.
    #[inline]
    pub fn buf(&self) -> &[u8] {
        self.mem.as_slice()
    }

    /// Get the registered buffer mutably.
    #[inline]
    pub fn buf_mut(&mut self) -> &mut [u8] {
        self.mem.as_mut_slice()
    }

    /// Metadata to send to the peer, with the given local GID.
    pub fn local_meta(&self, gid: Gid) -> ConnMeta {
        ConnMeta {
            addr: self.mem.mr().addr() as u64,
            rkey: self.mem.mr().rkey(),
            qp_num: self.qp.qp_num(),
            lid: self.ctx.lid(),
            gid,
        }
    }

    /// Get the peer's metadata, known after connecting.
    #[inline]
    pub fn remote(&self) -> Option<&ConnMeta> {
        self.remote.as_ref()
    }

    pub(crate) fn set_remote(&mut self, remote: ConnMeta) {
        self.remote = Some(remote);
    }

    /// Post a receive request covering the whole buffer.
    pub fn post_receive(&self) -> Result<(), PostError> {
        self.qp.post_recv(self.mem.mr().sge(), WR_ID)?;
        info!("Receive Request was posted");
        Ok(())
    }

    /// Post a signaled send request covering the whole buffer. RDMA READ and
    /// WRITE target the peer's buffer assuming it has the same length as ours.
    pub fn post_send(&self, opcode: WrOpcode) -> Result<(), PostError> {
        let remote = self.remote.map(|meta| meta.remote_mem(self.mem.mr().len()));
        self.qp.post_send(opcode, self.mem.mr().sge(), remote, WR_ID)?;
        info!("{} Request was posted", opcode);
        Ok(())
    }

    /// Wait for the completion of the outstanding request.
    #[inline]
    pub fn poll_completion(&self) -> Result<Wc, CompletionError> {
        self.poller.poll(&self.cq)
    }

    /// Release everything in reverse creation order: QP, MR, buffer, CQ, PD,
    /// device, and finally the exchange channel.
    ///
    /// Every step runs even if an earlier one failed.
    pub fn destroy(self) -> Result<(), TeardownError> {
        let Self {
            qp,
            mem,
            cq,
            pd,
            ctx,
            channel,
            ..
        } = self;

        let mut teardown = Teardown::default();
        teardown.step("destroy QP", qp.close());
        // The buffer is freed right after its MR is deregistered.
        teardown.step("deregister MR", mem.close());
        teardown.step("destroy CQ", cq.close());
        teardown.step("deallocate PD", pd.close());
        teardown.step("close device", ctx.close());
        teardown.step("close TCP channel", channel.close());
        teardown.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_is_zeroed() {
        let buf = alloc_buffer(64).unwrap();
        assert_eq!(buf.len(), 64);
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn huge_buffer_fails() {
        let err = alloc_buffer(usize::MAX).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OutOfMemory);
    }

    #[test]
    fn teardown_reports_first_failure() {
        let mut t = Teardown::default();
        t.step("a", Ok(()));
        t.step("b", Err(io::Error::from_raw_os_error(libc::EBUSY)));
        t.step("c", Err(io::Error::from_raw_os_error(libc::EIO)));
        let err = t.finish().unwrap_err();
        assert_eq!(err.step, "b");
        assert_eq!(err.failures, 2);
        assert_eq!(err.source.raw_os_error(), Some(libc::EBUSY));
    }
}
