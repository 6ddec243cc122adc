//! Address types and raw host-physical memory access.

use memory_addr::{def_usize_addr, def_usize_addr_formatter};

use crate::hal::SvmVCpuHal;

pub use memory_addr::{PhysAddr as HostPhysAddr, VirtAddr as HostVirtAddr};

def_usize_addr! {
    /// Guest virtual address.
    pub type GuestVirtAddr;
    /// Guest physical address.
    pub type GuestPhysAddr;
}

def_usize_addr_formatter! {
    GuestVirtAddr = "GVA:{}";
    GuestPhysAddr = "GPA:{}";
}

/// Reads a 32-bit little-endian word at a host-physical address.
///
/// # Safety
///
/// `paddr` must be 4-byte aligned and lie inside a frame owned by the caller.
pub(crate) unsafe fn read_host_u32<H: SvmVCpuHal>(paddr: HostPhysAddr) -> u32 {
    let ptr = H::phys_to_virt(paddr).as_ptr() as *const u32;
    unsafe { core::ptr::read_volatile(ptr) }
}

/// Writes a 32-bit word at a host-physical address.
///
/// # Safety
///
/// Same requirements as [`read_host_u32`].
pub(crate) unsafe fn write_host_u32<H: SvmVCpuHal>(paddr: HostPhysAddr, value: u32) {
    let ptr = H::phys_to_virt(paddr).as_mut_ptr() as *mut u32;
    unsafe { core::ptr::write_volatile(ptr, value) }
}
