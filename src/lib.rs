//! A cooperative, mechanism-aware command scheduler for fixed-period control loops.
//!

pub use cadence_internal::*;

/// Re-export all common types for easy access.
pub mod prelude {
    pub use cadence_internal::prelude::*;
}
