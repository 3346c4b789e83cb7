/// Define an opaque, copyable handle to a provider-owned resource.
///
/// Hardware providers store a pointer in it, the software provider an ID.
macro_rules! define_provider_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(transparent)]
        pub struct $name(usize);

        impl $name {
            /// Wrap a provider-specific raw value.
            #[inline]
            pub fn from_raw(raw: usize) -> Self {
                Self(raw)
            }

            /// Get the provider-specific raw value.
            #[inline]
            pub fn raw(self) -> usize {
                self.0
            }
        }
    };
}
