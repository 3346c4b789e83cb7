use std::io;
use std::sync::Arc;

use log::warn;

use super::context::Context;
use super::provider::PdHandle;

/// Ownership holder of protection domain.
struct PdInner {
    ctx: Context,
    pd: PdHandle,
    closed: bool,
}

impl PdInner {
    fn close(mut self) -> io::Result<()> {
        self.closed = true;
        self.ctx.provider().dealloc_pd(self.pd)
    }
}

impl Drop for PdInner {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(e) = self.ctx.provider().dealloc_pd(self.pd) {
                warn!("cannot deallocate PD on drop: {}", e);
            }
        }
    }
}

/// Protection domain.
///
/// Holds its [`Context`] alive.
#[derive(Clone)]
pub struct Pd {
    inner: Arc<PdInner>,
}

impl Pd {
    /// Allocate a protection domain in the given context.
    pub fn alloc(ctx: &Context) -> io::Result<Self> {
        let pd = ctx.provider().alloc_pd(ctx.handle())?;
        Ok(Self {
            inner: Arc::new(PdInner {
                ctx: ctx.clone(),
                pd,
                closed: false,
            }),
        })
    }

    /// Get the provider handle of this PD.
    #[inline]
    pub fn handle(&self) -> PdHandle {
        self.inner.pd
    }

    /// Get the underlying [`Context`].
    #[inline]
    pub fn context(&self) -> &Context {
        &self.inner.ctx
    }

    /// Deallocate the protection domain if this is its last reference.
    pub fn close(self) -> io::Result<()> {
        match Arc::try_unwrap(self.inner) {
            Ok(inner) => inner.close(),
            Err(_) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rdma::provider::SoftFabric;

    #[test]
    fn test_alloc() {
        let fabric = Arc::new(SoftFabric::new());
        let ctx = Context::open(fabric.clone(), None, 1).unwrap();
        let pd = Pd::alloc(&ctx).unwrap();
        assert_eq!(pd.context().handle(), ctx.handle());

        // The PD keeps the context alive.
        drop(ctx);
        assert_eq!(fabric.live_resources(), 2);
        pd.close().unwrap();
        assert_eq!(fabric.live_resources(), 0);
    }
}
