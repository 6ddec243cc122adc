use axerrno::AxResult;

use crate::mem::{HostPhysAddr, HostVirtAddr};

/// The interfaces which the underlying software (kernel or hypervisor) must
/// implement for SVM vCPUs and guests.
///
/// All functions are static: the HAL is a type-level parameter of
/// [`SvmVcpu`](crate::SvmVcpu) and [`SvmGuest`](crate::SvmGuest).
pub trait SvmVCpuHal: Send + Sync + Sized + 'static {
    /// Allocates a 4 KiB physical frame, returning its host-physical address.
    fn alloc_frame() -> Option<HostPhysAddr>;

    /// Frees a frame previously returned by [`SvmVCpuHal::alloc_frame`].
    fn dealloc_frame(paddr: HostPhysAddr);

    /// Allocates `num_frames` physically contiguous 4 KiB frames.
    ///
    /// Used for the IOPM (three frames) and the MSRPM (two frames).
    fn alloc_contiguous_frames(num_frames: usize) -> Option<HostPhysAddr>;

    /// Frees frames previously returned by
    /// [`SvmVCpuHal::alloc_contiguous_frames`].
    fn dealloc_contiguous_frames(paddr: HostPhysAddr, num_frames: usize);

    /// Converts a host physical address to a host virtual address the
    /// hypervisor can dereference.
    fn phys_to_virt(paddr: HostPhysAddr) -> HostVirtAddr;

    /// Converts a host virtual address back to its host physical address.
    fn virt_to_phys(vaddr: HostVirtAddr) -> HostPhysAddr;

    /// Allocates the root of a guest's nested page table.
    fn alloc_nested_page_table() -> Option<HostPhysAddr>;

    /// Frees a nested page table root.
    ///
    /// A failure is reported to the caller, which logs it and leaks the table.
    fn free_nested_page_table(root: HostPhysAddr) -> AxResult;
}
