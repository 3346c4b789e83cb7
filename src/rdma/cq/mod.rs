//! Completion queue and Work completion.

mod poller;
mod wc;

use std::io;
use std::sync::Arc;

use log::warn;

pub use self::poller::*;
pub use self::wc::*;
use super::context::Context;
use super::provider::CqHandle;

/// Ownership holder of completion queue.
struct CqInner {
    ctx: Context,
    cq: CqHandle,
    capacity: u32,
    closed: bool,
}

impl CqInner {
    fn close(mut self) -> io::Result<()> {
        self.closed = true;
        self.ctx.provider().destroy_cq(self.cq)
    }
}

impl Drop for CqInner {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(e) = self.ctx.provider().destroy_cq(self.cq) {
                warn!("cannot destroy CQ on drop: {}", e);
            }
        }
    }
}

/// Completion queue.
#[derive(Clone)]
pub struct Cq {
    inner: Arc<CqInner>,
}

impl Cq {
    /// Create a new completion queue.
    pub fn new(ctx: &Context, capacity: u32) -> io::Result<Cq> {
        let cq = ctx.provider().create_cq(ctx.handle(), capacity)?;
        Ok(Self {
            inner: Arc::new(CqInner {
                ctx: ctx.clone(),
                cq,
                capacity,
                closed: false,
            }),
        })
    }

    /// Get the provider handle of this CQ.
    #[inline]
    pub fn handle(&self) -> CqHandle {
        self.inner.cq
    }

    /// Get the underlying [`Context`].
    pub fn context(&self) -> &Context {
        &self.inner.ctx
    }

    /// Get the capacity of the completion queue.
    #[inline]
    pub fn capacity(&self) -> u32 {
        self.inner.capacity
    }

    /// Non-blockingly poll one work completion.
    ///
    /// It is the caller's responsibility to check the status code of the
    /// returned work completion entry.
    #[inline]
    pub fn poll_one(&self) -> io::Result<Option<Wc>> {
        self.inner.ctx.provider().poll_cq(self.inner.cq)
    }

    /// Destroy the CQ if this is its last reference.
    pub fn close(self) -> io::Result<()> {
        match Arc::try_unwrap(self.inner) {
            Ok(inner) => inner.close(),
            Err(_) => Ok(()),
        }
    }
}
