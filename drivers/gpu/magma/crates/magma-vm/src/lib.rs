//! # MAGMA VM
//!
//! Per-process GPU virtual address spaces: mapping bookkeeping, multi-level
//! page tables, TLB flush sequencing and hardware VMID assignment.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          VmManager                              │
//! │   PASID registry · buffer→binding links · PRT · VMID table      │
//! │                              │                                  │
//! │  ┌───────────────────────────┴───────────────────────────────┐  │
//! │  │                         GpuVm                             │  │
//! │  │  ┌──────────────┐  ┌──────────────┐  ┌────────────────┐   │  │
//! │  │  │ IntervalIndex│  │ StatusLists  │  │  TlbSequence   │   │  │
//! │  │  │  (mappings)  │  │ (6 states)   │  │                │   │  │
//! │  │  └──────────────┘  └──────────────┘  └────────────────┘   │  │
//! │  │                 ┌──────────────────┐                      │  │
//! │  │                 │ PtArena (PDB2..  │                      │  │
//! │  │                 │        ..PTB)    │                      │  │
//! │  │                 └────────┬─────────┘                      │  │
//! │  └──────────────────────────┼────────────────────────────────┘  │
//! │                             ▼                                   │
//! │            UpdateBackend: prepare → update* → commit            │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Locking
//!
//! Everything that mutates an address space goes through a [`VmGuard`],
//! obtained by locking the root reservation with [`GpuVm::reserve`].
//! Updates flagged `unlocked` only write directory nodes that already
//! exist.

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

pub mod backend;
pub mod binding;
pub mod buffer;
pub mod config;
pub mod cursor;
pub mod device;
pub mod flush;
pub mod interval;
pub mod manager;
pub mod mapping;
pub mod prt;
pub mod pt;
pub mod status;
pub mod tlb;
pub mod update;
pub mod vm;

#[cfg(test)]
mod mock;

// Re-exports for convenience
pub use backend::{SyncMode, UpdateBackend, UpdateParams};
pub use binding::{BindingId, BindingInfo};
pub use buffer::{Buffer, BufferDesc, BufferId, BufferKind, MemDomains, Residency, VramBlock};
pub use config::{FaultStop, UpdateMode, VmGeometry, VmManagerConfig};
pub use cursor::{map_gart, ResCursor};
pub use device::VmDevice;
pub use flush::{FlushActions, GdsWindow, Job, RingCaps, RingEmitter, VmidManager};
pub use interval::{Interval, IntervalIndex};
pub use manager::VmManager;
pub use mapping::{Mapping, MappingId, PteFlags};
pub use prt::PrtTracker;
pub use pt::{Level, PageTable, TableId};
pub use status::BindingStatus;
pub use tlb::TlbSequence;
pub use update::{PteSource, RangeUpdate, Validator};
pub use vm::{GpuVm, TaskInfo, VmGuard, VmId};
