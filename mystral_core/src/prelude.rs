//! Prelude.

pub use crate::err::*;

// Re-export `ahash`.
pub use ahash::AHashMap as HashMap;
pub use ahash::AHashSet as HashSet;

// Re-export `tracing` macros used across the crate.
pub use tracing::{debug, error, trace, warn};
