/// Macros that define repetitive types.
#[macro_use]
mod boilerplate;

/// Provide interoperability with C return values.
#[cfg(feature = "verbs")]
pub(crate) mod interop;
