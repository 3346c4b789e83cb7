mod channel;
mod connecter;
mod meta;

pub use self::channel::*;
pub use self::connecter::*;
pub use self::meta::*;
