//! # VM Manager Configuration
//!
//! Tunables for the address-space manager and the derived page-table
//! geometry.

use magma_core::{ByteSize, Error, Result, GPU_PAGE_SHIFT};

use crate::pt::Level;

/// Bits resolved by one directory level
pub const BITS_PER_LEVEL: u32 = 9;

/// Entries in one non-root directory
pub const DIRECTORY_ENTRIES: u32 = 1 << BITS_PER_LEVEL;

/// Largest page-table block size in bits
pub const MAX_BLOCK_SIZE: u32 = 31;

/// Largest supported CPU page shift
pub const MAX_CPU_PAGE_SHIFT: u32 = 30;

/// Smallest supported VM size in GiB
pub const MIN_VM_SIZE_GIB: u32 = 1;

/// Start of the translation hole, in GPU pages
///
/// Addresses below the hole can be routed through ATS on parts that
/// support it.
pub const HOLE_START_PFN: u64 = 0x0000_8000_0000_0000 >> GPU_PAGE_SHIFT;

static_assertions::const_assert_eq!(DIRECTORY_ENTRIES, 512);

// =============================================================================
// MODES
// =============================================================================

/// How page-table entries are written
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateMode {
    /// CPU writes the tables directly
    Cpu,
    /// Updates are recorded into a command stream and executed by the GPU
    CommandStream,
}

/// What to install when a page fault cannot be resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultStop {
    /// Never stop: redirect faulting pages to the dummy page
    Never,
    /// Stop on the first fault of a context
    FirstOnly,
    /// Always stop: install an invalid entry so the fault repeats
    Always,
}

// =============================================================================
// CONFIG
// =============================================================================

/// VM manager configuration
#[derive(Debug, Clone, Copy)]
pub struct VmManagerConfig {
    /// Requested VM size in GiB, `None` to size from system memory
    pub vm_size_gib: Option<u32>,
    /// Lower bound when sizing automatically
    pub min_vm_size_gib: u32,
    /// Installed system memory, used for automatic sizing
    pub system_memory: ByteSize,
    /// Page-table block size in bits, `None` for automatic
    pub block_size: Option<u32>,
    /// Largest fragment size in bits
    pub fragment_size: u32,
    /// Maximum number of directory levels above the page table
    pub max_level: u32,
    /// Address bits supported by the hardware
    pub max_bits: u32,
    /// CPU page shift
    pub cpu_page_shift: u32,
    /// Update mode for graphics contexts
    pub graphics_update: UpdateMode,
    /// Update mode for compute contexts
    pub compute_update: UpdateMode,
    /// Fault stop policy
    pub fault_stop: FaultStop,
    /// Hardware can flush one VMID while another is in use
    pub concurrent_flush: bool,
    /// Hardware VM ids available to each hub
    pub num_vmids: usize,
}

impl VmManagerConfig {
    /// Four-level tables with 48 address bits
    pub const fn four_level() -> Self {
        Self {
            vm_size_gib: Some(256 * 1024),
            min_vm_size_gib: MIN_VM_SIZE_GIB,
            system_memory: ByteSize::from_gib(16),
            block_size: None,
            fragment_size: 9,
            max_level: 3,
            max_bits: 48,
            cpu_page_shift: 12,
            graphics_update: UpdateMode::CommandStream,
            compute_update: UpdateMode::CommandStream,
            fault_stop: FaultStop::Never,
            concurrent_flush: true,
            num_vmids: 16,
        }
    }

    /// Two-level tables with 40 address bits and a 64 GiB space
    pub const fn two_level() -> Self {
        Self {
            vm_size_gib: Some(64),
            min_vm_size_gib: MIN_VM_SIZE_GIB,
            system_memory: ByteSize::from_gib(16),
            block_size: Some(9),
            fragment_size: 4,
            max_level: 1,
            max_bits: 40,
            cpu_page_shift: 12,
            graphics_update: UpdateMode::CommandStream,
            compute_update: UpdateMode::Cpu,
            fault_stop: FaultStop::Never,
            concurrent_flush: false,
            num_vmids: 8,
        }
    }

    /// CPU page size in bytes
    pub const fn cpu_page_size(&self) -> u64 {
        1 << self.cpu_page_shift
    }

    /// Derive the page-table geometry
    ///
    /// Clamps the VM size to what the hardware can address and picks
    /// directory depth and block size for it.
    pub fn adjust_size(&self) -> Result<VmGeometry> {
        if self.max_bits <= 30 + GPU_PAGE_SHIFT || self.max_bits > 64 {
            return Err(Error::InvalidArgument);
        }
        if self.cpu_page_shift < GPU_PAGE_SHIFT || self.cpu_page_shift > MAX_CPU_PAGE_SHIFT {
            return Err(Error::InvalidArgument);
        }
        if self.num_vmids == 0 || self.block_size.map_or(false, |b| b > MAX_BLOCK_SIZE) {
            return Err(Error::InvalidArgument);
        }

        let max_size = 1u64 << (self.max_bits - 30);

        let vm_size = match self.vm_size_gib {
            Some(requested) => {
                let requested = u64::from(requested.max(self.min_vm_size_gib));
                if requested > max_size {
                    log::warn!("VM size {}GB clamped to {}GB", requested, max_size);
                }
                requested.min(max_size)
            }
            None => {
                let phys_gib = self.system_memory.as_gib_ceil();
                let wanted = (phys_gib * 3).max(u64::from(self.min_vm_size_gib));
                wanted.min(max_size).next_power_of_two().min(max_size)
            }
        };

        let max_pfn = vm_size << (30 - GPU_PAGE_SHIFT);

        let mut tmp = max_pfn.next_power_of_two();
        if let Some(block_size) = self.block_size {
            tmp >>= block_size.saturating_sub(BITS_PER_LEVEL);
        }
        let fls = 64 - tmp.leading_zeros();
        let levels = (fls.saturating_sub(1)).div_ceil(BITS_PER_LEVEL).saturating_sub(1);
        let num_level = self.max_level.min(levels);

        let root_level = match num_level {
            3 => Level::Pdb2,
            2 => Level::Pdb1,
            1 => Level::Pdb0,
            _ => {
                log::error!("VM size {}GB is not supported", vm_size);
                return Err(Error::InvalidArgument);
            }
        };

        let block_size = match self.block_size {
            Some(requested) => {
                let room = self
                    .max_bits
                    .saturating_sub(GPU_PAGE_SHIFT + BITS_PER_LEVEL * num_level);
                requested.min(room)
            }
            None if num_level > 1 => BITS_PER_LEVEL,
            None => default_block_size(vm_size),
        };

        if block_size < BITS_PER_LEVEL {
            return Err(Error::InvalidArgument);
        }

        let fragment_size = self.fragment_size.min(31);

        log::info!(
            "vm size is {} GB, {} levels, block size is {}-bit, fragment size is {}-bit",
            vm_size,
            num_level + 1,
            block_size,
            fragment_size
        );

        Ok(VmGeometry {
            vm_size_gib: vm_size,
            max_pfn,
            num_level,
            root_level,
            block_size,
            fragment_size,
            cpu_page_shift: self.cpu_page_shift,
        })
    }
}

impl Default for VmManagerConfig {
    fn default() -> Self {
        Self {
            vm_size_gib: None,
            ..Self::four_level()
        }
    }
}

/// Default block size for single-level setups
///
/// Splits the address bits evenly between the directory and the table.
fn default_block_size(vm_size_gib: u64) -> u32 {
    let bits = 63 - vm_size_gib.max(1).leading_zeros() + (30 - GPU_PAGE_SHIFT);
    if vm_size_gib <= 8 {
        bits - BITS_PER_LEVEL
    } else {
        (bits + 3) / 2
    }
}

// =============================================================================
// GEOMETRY
// =============================================================================

/// Page-table geometry derived from [`VmManagerConfig::adjust_size`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmGeometry {
    /// Address space size in GiB
    pub vm_size_gib: u64,
    /// Number of GPU pages in the address space
    pub max_pfn: u64,
    /// Directory levels above the page table
    pub num_level: u32,
    /// Level of the root directory
    pub root_level: Level,
    /// Page-table block size in bits
    pub block_size: u32,
    /// Largest fragment size in bits
    pub fragment_size: u32,
    /// CPU page shift
    pub cpu_page_shift: u32,
}

impl VmGeometry {
    /// Address bits translated below `level`
    pub fn level_shift(&self, level: Level) -> u32 {
        match level {
            Level::Pdb2 | Level::Pdb1 | Level::Pdb0 => {
                BITS_PER_LEVEL * (Level::Pdb0 as u32 - level as u32) + self.block_size
            }
            Level::Ptb => 0,
        }
    }

    /// Number of entries in a table of `level`
    pub fn num_entries(&self, level: Level) -> u32 {
        let shift = self.level_shift(level);
        if level == self.root_level {
            (self.max_pfn.div_ceil(1u64 << shift)) as u32
        } else if level != Level::Ptb {
            DIRECTORY_ENTRIES
        } else {
            1 << self.block_size
        }
    }

    /// Mask applied to a page number to find the entry in `level`
    pub fn entries_mask(&self, level: Level) -> u64 {
        if level == self.root_level {
            0xffff_ffff
        } else if level != Level::Ptb {
            u64::from(DIRECTORY_ENTRIES - 1)
        } else {
            (1u64 << self.block_size) - 1
        }
    }

    /// Entry of a `level` table that covers `pfn`
    pub fn entry_index(&self, level: Level, pfn: u64) -> u32 {
        ((pfn >> self.level_shift(level)) & self.entries_mask(level)) as u32
    }

    /// Size in bytes of a table of `level`
    pub fn table_bytes(&self, level: Level) -> u64 {
        u64::from(self.num_entries(level)) * 8
    }

    /// GPU pages per CPU page
    pub fn gpu_pages_per_cpu_page(&self) -> u64 {
        1 << (self.cpu_page_shift - GPU_PAGE_SHIFT)
    }

    /// CPU page size in bytes
    pub fn cpu_page_size(&self) -> u64 {
        1 << self.cpu_page_shift
    }
}
