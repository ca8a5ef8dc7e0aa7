mod arrayvec;
mod assert;
pub mod directories;
mod namespace;
pub mod thread;
pub mod vsync;

pub use arrayvec::{ArrayStr, ArrayStrTooLong, ArrayVec};
pub use namespace::{SHORT_TYPENAME_CAP, ShortTypename, short_typename};
pub use thread::{ThreadPriority, thread_boot};
