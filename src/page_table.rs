//! Legacy (non-PAE) 32-bit two-level page tables: a 1024-entry page
//! directory whose entries point to 1024-entry page tables of 4 KiB pages.

use core::fmt;

use axerrno::{AxResult, ax_err};
use bitflags::bitflags;

use crate::hal::SvmVCpuHal;
use crate::mem::{HostPhysAddr, read_host_u32};

pub const ENTRY_COUNT: usize = 1024;
const ENTRY_SIZE: usize = 4;
const FRAME_MASK: u32 = 0xffff_f000;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Legacy32Flags: u32 {
        const PRESENT = 1 << 0;
        const WRITABLE = 1 << 1;
        const USER = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const NO_CACHE = 1 << 4;
        const ACCESSED = 1 << 5;
        const DIRTY = 1 << 6;
        const HUGE_PAGE = 1 << 7;
        const GLOBAL = 1 << 8;
    }
}

/// A page-directory or page-table entry: flags in bits 0..12, a 20-bit
/// frame number in bits 12..32.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct Legacy32Entry(u32);

impl Legacy32Entry {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Builds an entry pointing at `paddr`.
    ///
    /// Returns `InvalidInput` if `paddr` is not below 4 GiB, which a 20-bit
    /// frame number cannot express.
    pub fn new(paddr: HostPhysAddr, flags: Legacy32Flags) -> AxResult<Self> {
        let paddr = paddr.as_usize();
        if paddr > u32::MAX as usize {
            return ax_err!(InvalidInput, "frame above 4 GiB in a 32-bit entry");
        }
        Ok(Self((paddr as u32 & FRAME_MASK) | flags.bits()))
    }

    pub const fn raw(&self) -> u32 {
        self.0
    }

    pub fn flags(&self) -> Legacy32Flags {
        Legacy32Flags::from_bits_truncate(self.0)
    }

    pub fn is_present(&self) -> bool {
        self.flags().contains(Legacy32Flags::PRESENT)
    }

    pub fn frame(&self) -> HostPhysAddr {
        HostPhysAddr::from((self.0 & FRAME_MASK) as usize)
    }
}

impl fmt::Debug for Legacy32Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Legacy32Entry")
            .field("raw", &format_args!("{:#010x}", self.0))
            .field("frame", &self.frame())
            .field("flags", &self.flags())
            .finish()
    }
}

pub const fn pd_index(addr: usize) -> usize {
    (addr >> 22) & (ENTRY_COUNT - 1)
}

pub const fn pt_index(addr: usize) -> usize {
    (addr >> 12) & (ENTRY_COUNT - 1)
}

/// Host-physical address of entry `index` of the table at `table`.
pub fn entry_paddr(table: HostPhysAddr, index: usize) -> HostPhysAddr {
    HostPhysAddr::from(table.as_usize() + index * ENTRY_SIZE)
}

/// Reads entry `index` of the table at host-physical address `table`.
///
/// # Safety
///
/// `table` must be a live page-table frame.
pub unsafe fn read_entry<H: SvmVCpuHal>(table: HostPhysAddr, index: usize) -> Legacy32Entry {
    Legacy32Entry(unsafe { read_host_u32::<H>(entry_paddr(table, index)) })
}

/// Translates `addr` through the two-level table rooted at `cr3`.
///
/// Only the present bit is consulted: no accessed/dirty updates, no large
/// pages. A missing directory entry fails before any table is read.
pub fn walk<H: SvmVCpuHal>(cr3: u64, addr: usize) -> AxResult<HostPhysAddr> {
    let root = HostPhysAddr::from((cr3 as usize) & FRAME_MASK as usize);

    let pde = unsafe { read_entry::<H>(root, pd_index(addr)) };
    if !pde.is_present() {
        trace!("walk({:#x}): PDE {:?} not present", addr, pde);
        return ax_err!(NotFound, "page directory entry not present");
    }

    let pte = unsafe { read_entry::<H>(pde.frame(), pt_index(addr)) };
    if !pte.is_present() {
        trace!("walk({:#x}): PTE {:?} not present", addr, pte);
        return ax_err!(NotFound, "page table entry not present");
    }

    Ok(HostPhysAddr::from(pte.frame().as_usize() | (addr & 0xfff)))
}
