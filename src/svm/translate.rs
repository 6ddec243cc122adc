//! Guest address translation while the guest runs without its own paging.

use axerrno::{AxResult, ax_err};
use tock_registers::interfaces::Readable;
use x86_64::registers::control::Cr0Flags;

use super::vcpu::SvmVcpu;
use crate::hal::SvmVCpuHal;
use crate::mem::{GuestPhysAddr, GuestVirtAddr, HostPhysAddr};
use crate::page_table;

impl<H: SvmVCpuHal> SvmVcpu<H> {
    /// Translates a guest virtual address using the guest's view of CR0.
    ///
    /// Without paging the address is physical, offset by `CS << 4` in real
    /// mode. Once the guest enables paging this fails with `Unsupported`.
    pub fn gva_to_gpa(&self, gva: GuestVirtAddr) -> AxResult<GuestPhysAddr> {
        let cr0 = Cr0Flags::from_bits_truncate(self.cr.cr0);
        if cr0.contains(Cr0Flags::PAGING) {
            return ax_err!(Unsupported, "guest page-table walk not supported");
        }

        let mut addr = gva.as_usize();
        if !cr0.contains(Cr0Flags::PROTECTED_MODE_ENABLE) {
            addr += (self.vmcb().state.cs.selector.get() as usize) << 4;
        }
        Ok(GuestPhysAddr::from(addr))
    }

    /// Translates a guest physical address through the legacy two-level
    /// shadow table, which is also what the VMCB `CR3` points at.
    pub fn gpa_to_hpa(&self, gpa: GuestPhysAddr) -> AxResult<HostPhysAddr> {
        let root = self.shadow.root_paddr().as_usize() as u64;
        page_table::walk::<H>(root, gpa.as_usize())
    }
}
