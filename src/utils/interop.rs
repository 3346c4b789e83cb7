use std::io;
use std::ptr::NonNull;

/// Converts a C return value that is zero on success and an errno otherwise.
///
/// Some verbs return the errno negated; both signs are accepted.
#[inline(always)]
pub(crate) fn from_c_ret(ret: i32) -> io::Result<()> {
    if ret == 0 {
        Ok(())
    } else {
        Err(io::Error::from_raw_os_error(ret.abs()))
    }
}

/// Converts a returned pointer that is null on failure, with the reason in
/// `errno`.
#[inline(always)]
pub(crate) fn from_c_ptr<T>(ptr: *mut T) -> io::Result<NonNull<T>> {
    NonNull::new(ptr).ok_or_else(io::Error::last_os_error)
}

/// Converts a C return value that is `-1` on failure, with the reason in
/// `errno`.
#[inline(always)]
pub(crate) fn from_c_errno(ret: i32) -> io::Result<()> {
    if ret == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}
