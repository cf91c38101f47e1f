pub mod mock;
pub mod runtime;
pub mod sync;
pub mod utils;

pub use runtime::{Runtime, RuntimeBuilder, ScopedSuspendAll};
