//! Shadow page tables for a guest running in real mode.
//!
//! Before the guest enables paging, the VMCB `CR3` points at a per-vCPU
//! legacy two-level table built here. Pages are mapped lazily from the
//! page-fault handler, one 4 KiB page at a time. Page-table frames come from
//! a fixed pool reserved when the vCPU is created.

use alloc::vec::Vec;

use axerrno::{AxResult, ax_err, ax_err_type};
use bit_field::BitArray;

use crate::frame::PhysFrame;
use crate::hal::SvmVCpuHal;
use crate::mem::{GuestVirtAddr, HostPhysAddr, write_host_u32};
use crate::page_table::{Legacy32Entry, Legacy32Flags, entry_paddr, pd_index, pt_index, read_entry};

/// Number of page-table frames each vCPU may use for its shadow tables.
pub const SHADOW_POOL_PAGES: usize = 64;

const BITMAP_WORDS: usize = SHADOW_POOL_PAGES.div_ceil(64);

pub struct ShadowPageTable<H: SvmVCpuHal> {
    root: PhysFrame<H>,
    pool: Vec<PhysFrame<H>>,
    /// One bit per pool frame, set once the frame is linked into the tree.
    used: [u64; BITMAP_WORDS],
    /// Index that is expected to be free, checked against `used` before use.
    pending: Option<usize>,
    use_hint: bool,
}

impl<H: SvmVCpuHal> ShadowPageTable<H> {
    /// Allocates the root directory and the frame pool.
    pub fn new() -> AxResult<Self> {
        let root = PhysFrame::alloc_zero()?;
        let pool = (0..SHADOW_POOL_PAGES)
            .map(|_| PhysFrame::alloc())
            .collect::<AxResult<Vec<_>>>()?;
        debug!(
            "[SVM] shadow page table root {:#x}, {} pool frames",
            root.start_paddr(),
            pool.len()
        );
        Ok(Self {
            root,
            pool,
            used: [0; BITMAP_WORDS],
            pending: Some(0),
            use_hint: true,
        })
    }

    /// Disables the one-entry allocation hint; every allocation then scans
    /// the bitmap from the start.
    pub fn without_hint(mut self) -> Self {
        self.use_hint = false;
        self.pending = None;
        self
    }

    /// Host-physical address of the page directory, the value loaded into
    /// the guest `CR3` while it runs in real mode.
    pub fn root_paddr(&self) -> HostPhysAddr {
        self.root.start_paddr()
    }

    /// Number of pool frames already linked into the tree.
    pub fn used_frames(&self) -> usize {
        self.used.iter().map(|w| w.count_ones() as usize).sum()
    }

    fn pick_free(&self) -> Option<usize> {
        if let Some(hint) = self.pending.filter(|&i| i < SHADOW_POOL_PAGES) {
            if !self.used.get_bit(hint) {
                return Some(hint);
            }
        }
        (0..SHADOW_POOL_PAGES).find(|&i| !self.used.get_bit(i))
    }

    /// Takes a zeroed frame from the pool and returns the physical address
    /// to link into a directory entry.
    fn alloc_table(&mut self) -> AxResult<HostPhysAddr> {
        let index = self
            .pick_free()
            .ok_or_else(|| ax_err_type!(NoMemory, "shadow page-table pool exhausted"))?;
        self.used.set_bit(index, true);
        if self.use_hint {
            self.pending = Some(index + 1);
        }

        let frame = &mut self.pool[index];
        frame.fill(0);
        let paddr = H::virt_to_phys(frame.start_vaddr());
        trace!("[SVM] shadow table frame #{} at {:#x}", index, paddr);
        Ok(paddr)
    }

    /// Maps the 4 KiB page containing `gva` to the host page at `hpa`.
    ///
    /// Directory entries are created on demand and shared by every page they
    /// cover. An existing table entry is never replaced: mapping an already
    /// mapped page fails with `AlreadyExists`.
    pub fn map_page(&mut self, gva: GuestVirtAddr, hpa: HostPhysAddr) -> AxResult {
        let addr = gva.as_usize();
        let flags = Legacy32Flags::PRESENT | Legacy32Flags::WRITABLE;
        let root = self.root_paddr();

        let pde = unsafe { read_entry::<H>(root, pd_index(addr)) };
        let table = if pde.is_present() {
            pde.frame()
        } else {
            // Validate the page before consuming a pool frame.
            Legacy32Entry::new(hpa, flags)?;
            let table = self.alloc_table()?;
            let pde = Legacy32Entry::new(table, flags)?;
            unsafe { write_host_u32::<H>(entry_paddr(root, pd_index(addr)), pde.raw()) };
            table
        };

        let pte = unsafe { read_entry::<H>(table, pt_index(addr)) };
        if pte.is_present() {
            warn!(
                "[SVM] shadow map {:?} -> {:#x}: already mapped by {:?}",
                gva, hpa, pte
            );
            return ax_err!(AlreadyExists, "shadow page already mapped");
        }
        let pte = Legacy32Entry::new(hpa, flags)?;
        unsafe { write_host_u32::<H>(entry_paddr(table, pt_index(addr)), pte.raw()) };
        debug!("[SVM] shadow map {:?} -> {:#x}", gva, hpa);
        Ok(())
    }
}

impl<H: SvmVCpuHal> core::fmt::Debug for ShadowPageTable<H> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ShadowPageTable")
            .field("root", &self.root_paddr())
            .field("used_frames", &self.used_frames())
            .field("pending", &self.pending)
            .finish()
    }
}
