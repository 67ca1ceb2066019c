//! # MAGMA Core
//!
//! Foundational types and synchronization primitives for the MAGMA GPU
//! memory stack.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      magma-core                             │
//! │  ┌─────────────┐  ┌──────────────────┐  ┌───────────────┐   │
//! │  │   Types     │  │      Sync        │  │    Error      │   │
//! │  │ (GpuAddr,   │  │ (CompletionSignal│  │   Handling    │   │
//! │  │  Handle)    │  │  Reservation)    │  │               │   │
//! │  └─────────────┘  └──────────────────┘  └───────────────┘   │
//! └─────────────────────────────────────────────────────────────┘
//! ```

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::new_without_default)]

extern crate alloc;

#[cfg(any(test, feature = "std"))]
extern crate std;

// =============================================================================
// MODULE EXPORTS
// =============================================================================

pub mod error;
pub mod sync;
pub mod types;

// Re-exports for convenience
pub use error::{BackendError, Error, Result};
pub use sync::{Clock, CompletionSignal, FenceUsage, Registration, Reservation, ReservationGuard};
pub use types::*;
