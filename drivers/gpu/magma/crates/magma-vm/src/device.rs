//! # Device Hooks
//!
//! Hardware-specific behaviour the VM manager needs from the device.

use alloc::boxed::Box;

use magma_core::{Clock, Result};

use crate::backend::UpdateBackend;
use crate::buffer::Residency;
use crate::config::UpdateMode;
use crate::mapping::PteFlags;
use crate::pt::Level;

/// Device collaborator of the VM manager
pub trait VmDevice: Send + Sync {
    /// Device was surprise-removed
    fn is_unplugged(&self) -> bool {
        false
    }

    /// Monotonic time in nanoseconds
    fn now_ns(&self) -> u64;

    /// Device has a global PRT mode bit
    fn supports_prt(&self) -> bool {
        false
    }

    /// Enable or disable PRT mode device wide
    fn set_prt(&self, _enable: bool) {}

    /// Offset added to VRAM addresses in page-table entries
    fn vram_base_offset(&self) -> u64 {
        0
    }

    /// Address of the page faults are redirected to
    fn dummy_page_addr(&self) -> u64;

    /// Allocate backing memory for a directory node of `size` bytes
    fn table_resource(&self, size: u64) -> Result<Residency>;

    /// Create a page-table writer for `mode`
    fn update_backend(&self, mode: UpdateMode) -> Box<dyn UpdateBackend>;

    /// Apply mapping-specific bits to the entry flags
    ///
    /// The default takes the executable bit from the mapping and turns PRT
    /// mappings into invalid PRT entries.
    fn adjust_pte_flags(&self, mapping: PteFlags, flags: &mut PteFlags) {
        flags.remove(PteFlags::EXECUTABLE);
        flags.insert(mapping & PteFlags::EXECUTABLE);
        if mapping.contains(PteFlags::PRT) {
            flags.insert(PteFlags::PRT);
            flags.remove(PteFlags::VALID);
        }
    }

    /// Adjust the flags of a directory entry living in a `level` table
    fn pde_flags(&self, _level: Level, _flags: &mut PteFlags) {}

    /// Every range update must flush the TLB
    fn needs_full_tlb_flush(&self) -> bool {
        false
    }

    /// Compute contexts route unmapped addresses through ATS
    fn compute_pte_support_ats(&self) -> bool {
        false
    }

    /// Number of GPU resets so far
    fn gpu_reset_count(&self) -> u64 {
        0
    }

    /// Let the SVM layer resolve a compute fault
    fn restore_svm_pages(&self, _pasid: u32, _pfn: u64, _write_fault: bool) -> bool {
        false
    }
}

/// Adapter exposing a device's clock to the wait primitives
pub(crate) struct DeviceClock<'a>(pub &'a dyn VmDevice);

impl Clock for DeviceClock<'_> {
    fn now_ns(&self) -> u64 {
        self.0.now_ns()
    }
}
