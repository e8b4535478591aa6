//! Utility types for interacting with the runtime.

mod handle;
pub use handle::Handle;
