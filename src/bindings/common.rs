//! Verbs that `<infiniband/verbs.h>` defines as `static inline`, which
//! bindgen cannot generate.

use std::mem;
use std::os::raw::c_int;

use super::private::*;

/// Value of `ibv_context::abi_compat` for contexts embedded in a
/// `verbs_context`.
const VERBS_ABI_IS_EXTENDED: usize = usize::MAX;

macro_rules! container_of {
    ($ptr:expr, $container:path, $field:ident) => {{
        ($ptr as *const _ as *const u8 as *mut u8).sub(memoffset::offset_of!($container, $field))
            as *mut $container
    }};
}

/// Get the extended context of a device context, or null if the provider
/// does not have one.
#[inline]
pub unsafe fn verbs_get_ctx(ctx: *mut ibv_context) -> *mut verbs_context {
    if (*ctx).abi_compat as usize != VERBS_ABI_IS_EXTENDED {
        std::ptr::null_mut()
    } else {
        container_of!(ctx, verbs_context, context)
    }
}

/// Query the attributes of a port.
///
/// Uses the extended `query_port` op when the provider has one, and falls
/// back to the compatibility entry point otherwise.
#[inline]
pub unsafe fn ___ibv_query_port(
    context: *mut ibv_context,
    port_num: u8,
    port_attr: *mut ibv_port_attr,
) -> c_int {
    let vctx = verbs_get_ctx(context);
    if !vctx.is_null()
        && (*vctx).sz >= mem::size_of::<verbs_context>() - memoffset::offset_of!(verbs_context, query_port)
    {
        if let Some(query_port) = (*vctx).query_port {
            return query_port(context, port_num, port_attr, mem::size_of::<ibv_port_attr>());
        }
    }

    std::ptr::write_bytes(port_attr, 0, 1);
    ibv_query_port(context, port_num, port_attr as *mut _compat_ibv_port_attr)
}

/// Poll a CQ for at most `num_entries` completions.
///
/// Returns the number of completions polled, or a negative value on error.
#[inline]
pub unsafe fn ibv_poll_cq(cq: *mut ibv_cq, num_entries: c_int, wc: *mut ibv_wc) -> c_int {
    match (*(*cq).context).ops.poll_cq {
        Some(poll_cq) => poll_cq(cq, num_entries, wc),
        None => -libc::EOPNOTSUPP,
    }
}

/// Post a list of work requests to a send queue.
#[inline]
pub unsafe fn ibv_post_send(
    qp: *mut ibv_qp,
    wr: *mut ibv_send_wr,
    bad_wr: *mut *mut ibv_send_wr,
) -> c_int {
    match (*(*qp).context).ops.post_send {
        Some(post_send) => post_send(qp, wr, bad_wr),
        None => libc::EOPNOTSUPP,
    }
}

/// Post a list of work requests to a receive queue.
#[inline]
pub unsafe fn ibv_post_recv(
    qp: *mut ibv_qp,
    wr: *mut ibv_recv_wr,
    bad_wr: *mut *mut ibv_recv_wr,
) -> c_int {
    match (*(*qp).context).ops.post_recv {
        Some(post_recv) => post_recv(qp, wr, bad_wr),
        None => libc::EOPNOTSUPP,
    }
}
