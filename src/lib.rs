pub mod common;
pub mod dialect;
pub mod ir;
pub mod matchers;
pub mod passes;
pub mod transform;
pub mod utils;
#[cfg(feature = "verification")]
pub mod verification;

// Exported for the `shape!` macro.
pub use smallvec;
