//! Per-guest state shared by all vCPUs of one virtual machine.
//!
//! A guest owns its nested page-table root, the list of attached vCPUs'
//! I/O permission maps, the I/O port regions that must be intercepted, the
//! RAM accounting and the CMOS/RTC memory-size report.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};

use axerrno::{AxResult, ax_err_type};
use bitflags::bitflags;
use spin::RwLock;

use crate::hal::SvmVCpuHal;
use crate::mem::{GuestPhysAddr, HostPhysAddr};
use crate::svm::{IOPm, SvmVcpu};

bitflags! {
    /// Kind of a guest region.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RegionFlags: u32 {
        /// Guest-physical memory.
        const MEMORY = 1 << 0;
        /// A range of I/O ports; `gphys_addr` holds the first port.
        const IO = 1 << 1;
        /// Backed by host RAM.
        const REAL = 1 << 2;
        /// Emulated by a device model.
        const VIRTUAL = 1 << 3;
    }
}

/// Which address space a region lookup searches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionSpace {
    Memory,
    Io,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuestRegion {
    pub gphys_addr: GuestPhysAddr,
    pub hphys_addr: HostPhysAddr,
    pub size: usize,
    pub flags: RegionFlags,
}

impl GuestRegion {
    pub fn contains(&self, gpa: GuestPhysAddr) -> bool {
        let start = self.gphys_addr.as_usize();
        (start..start + self.size).contains(&gpa.as_usize())
    }

    /// Host-physical address backing `gpa`, which must lie in the region.
    pub fn host_addr_of(&self, gpa: GuestPhysAddr) -> HostPhysAddr {
        debug_assert!(self.contains(gpa));
        let offset = gpa.as_usize() - self.gphys_addr.as_usize();
        HostPhysAddr::from(self.hphys_addr.as_usize() + offset)
    }

    /// A region of host RAM the guest accesses directly.
    pub fn is_ram(&self) -> bool {
        self.flags.contains(RegionFlags::MEMORY | RegionFlags::REAL)
    }

    pub fn is_io(&self) -> bool {
        self.flags.contains(RegionFlags::IO)
    }
}

/// The guest's region bookkeeping, as seen by exit handlers.
pub trait GuestMemory {
    /// Returns the region of `space` that contains `gpa`.
    fn find_region(&self, gpa: GuestPhysAddr, space: RegionSpace) -> Option<GuestRegion>;

    /// Reads guest-physical memory into `buf`, returning the number of bytes
    /// read. Reads may be short at the end of a region.
    fn read_guest_memory(&self, gpa: GuestPhysAddr, buf: &mut [u8]) -> AxResult<usize>;
}

/// Write access to the emulated CMOS/RTC registers.
pub trait CmosRtc: Send + Sync {
    fn cmos_write(&self, reg: u8, value: u8);
}

/// CMOS register indices of the memory-size report.
pub mod cmos {
    pub const BASE_MEM_LO: u8 = 0x15;
    pub const BASE_MEM_HI: u8 = 0x16;
    pub const EXT_MEM_LO: u8 = 0x17;
    pub const EXT_MEM_HI: u8 = 0x18;
    pub const EXT_MEM_COPY_LO: u8 = 0x30;
    pub const EXT_MEM_COPY_HI: u8 = 0x31;
    pub const EXT_MEM_64K_LO: u8 = 0x34;
    pub const EXT_MEM_64K_HI: u8 = 0x35;
    pub const NR_PROCESSORS: u8 = 0x5f;
}

const KIB: usize = 1024;
const MIB: usize = 1024 * KIB;

/// Memory sizes in the units the BIOS reads from CMOS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CmosMemoryLayout {
    /// Conventional memory in KiB, at most 640.
    pub base_kib: u16,
    /// Memory above 1 MiB in KiB, saturated at 65535.
    pub ext_kib: u16,
    /// Memory above 16 MiB in 64 KiB units, saturated at 65535.
    pub ext_64k: u16,
    pub nr_processors: u8,
}

impl CmosMemoryLayout {
    pub fn new(total_ram: usize, nr_processors: usize) -> Self {
        let saturate = |v: usize| v.min(u16::MAX as usize) as u16;
        Self {
            base_kib: (total_ram / KIB).min(640) as u16,
            ext_kib: saturate(total_ram.saturating_sub(MIB) / KIB),
            ext_64k: saturate(total_ram.saturating_sub(16 * MIB) / (64 * KIB)),
            nr_processors: nr_processors.clamp(1, u8::MAX as usize) as u8,
        }
    }

    pub fn write_to(&self, rtc: &dyn CmosRtc) {
        let write16 = |lo: u8, hi: u8, value: u16| {
            let [l, h] = value.to_le_bytes();
            rtc.cmos_write(lo, l);
            rtc.cmos_write(hi, h);
        };
        write16(cmos::BASE_MEM_LO, cmos::BASE_MEM_HI, self.base_kib);
        write16(cmos::EXT_MEM_LO, cmos::EXT_MEM_HI, self.ext_kib);
        write16(cmos::EXT_MEM_COPY_LO, cmos::EXT_MEM_COPY_HI, self.ext_kib);
        write16(cmos::EXT_MEM_64K_LO, cmos::EXT_MEM_64K_HI, self.ext_64k);
        rtc.cmos_write(cmos::NR_PROCESSORS, self.nr_processors);
    }
}

struct AttachedVcpu<H: SvmVCpuHal> {
    id: usize,
    iopm: Arc<IOPm<H>>,
}

/// Guest-wide SVM state.
pub struct SvmGuest<H: SvmVCpuHal> {
    npt_root: HostPhysAddr,
    io_regions: RwLock<Vec<GuestRegion>>,
    vcpus: RwLock<Vec<AttachedVcpu<H>>>,
    next_vcpu_id: AtomicUsize,
    total_ram: AtomicUsize,
    cmos: RwLock<Option<Box<dyn CmosRtc>>>,
}

impl<H: SvmVCpuHal> SvmGuest<H> {
    /// Creates the guest and its nested page-table root.
    pub fn new() -> AxResult<Self> {
        let npt_root = H::alloc_nested_page_table()
            .ok_or_else(|| ax_err_type!(NoMemory, "allocate nested page table failed"))?;
        info!("[SVM] created guest, nested page table at {:#x}", npt_root);
        Ok(Self {
            npt_root,
            io_regions: RwLock::new(Vec::new()),
            vcpus: RwLock::new(Vec::new()),
            next_vcpu_id: AtomicUsize::new(0),
            total_ram: AtomicUsize::new(0),
            cmos: RwLock::new(None),
        })
    }

    pub fn npt_root(&self) -> HostPhysAddr {
        self.npt_root
    }

    /// Bytes of host RAM currently registered as guest memory.
    pub fn total_ram(&self) -> usize {
        self.total_ram.load(Ordering::Acquire)
    }

    pub fn nr_vcpus(&self) -> usize {
        self.vcpus.read().len()
    }

    /// Registers a region.
    ///
    /// I/O regions start being intercepted on every attached vCPU, and on
    /// every vCPU attached later. RAM regions count towards the memory size
    /// reported through CMOS.
    pub fn add_region(&self, region: GuestRegion) {
        debug!("[SVM] add region {:x?}", region);
        if region.is_io() {
            let mut regions = self.io_regions.write();
            regions.push(region);
            self.set_io_intercept_all(&region, true);
        }
        if region.is_ram() {
            self.total_ram.fetch_add(region.size, Ordering::AcqRel);
            self.refresh_cmos();
        }
    }

    /// Unregisters a region previously passed to [`SvmGuest::add_region`].
    pub fn del_region(&self, region: GuestRegion) {
        debug!("[SVM] del region {:x?}", region);
        if region.is_io() {
            let mut regions = self.io_regions.write();
            regions.retain(|r| *r != region);
            self.set_io_intercept_all(&region, false);
        }
        if region.is_ram() {
            let prev = self
                .total_ram
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |total| {
                    Some(total.saturating_sub(region.size))
                })
                .unwrap_or_default();
            if prev < region.size {
                warn!(
                    "[SVM] deleting {:#x} bytes of RAM with only {:#x} registered",
                    region.size, prev
                );
            }
            self.refresh_cmos();
        }
    }

    fn set_io_intercept_all(&self, region: &GuestRegion, intercept: bool) {
        let vcpus = self.vcpus.read();
        for vcpu in vcpus.iter() {
            trace!(
                "[SVM] vcpu {}: ports {:#x}+{:#x} intercept={}",
                vcpu.id,
                region.gphys_addr.as_usize(),
                region.size,
                intercept
            );
            vcpu.iopm.set_intercept_of_range(
                region.gphys_addr.as_usize() as u32,
                region.size as u32,
                intercept,
            );
        }
    }

    /// Attaches a vCPU, applying the intercepts of every I/O region added so
    /// far. Returns the id to pass to [`SvmGuest::detach_vcpu`].
    pub fn attach_vcpu(&self, vcpu: &SvmVcpu<H>) -> usize {
        let id = self.next_vcpu_id.fetch_add(1, Ordering::Relaxed);
        let iopm = vcpu.iopm();
        let regions = self.io_regions.read();
        let mut vcpus = self.vcpus.write();
        for region in regions.iter() {
            iopm.set_intercept_of_range(
                region.gphys_addr.as_usize() as u32,
                region.size as u32,
                true,
            );
        }
        vcpus.push(AttachedVcpu { id, iopm });
        drop(vcpus);
        drop(regions);
        info!("[SVM] attached vcpu {}", id);
        self.refresh_cmos();
        id
    }

    pub fn detach_vcpu(&self, id: usize) {
        self.vcpus.write().retain(|v| v.id != id);
        info!("[SVM] detached vcpu {}", id);
    }

    /// Connects the CMOS/RTC device and writes the current memory layout.
    pub fn set_cmos(&self, rtc: Box<dyn CmosRtc>) {
        *self.cmos.write() = Some(rtc);
        self.refresh_cmos();
    }

    pub fn cmos_layout(&self) -> CmosMemoryLayout {
        CmosMemoryLayout::new(self.total_ram(), self.nr_vcpus())
    }

    fn refresh_cmos(&self) {
        if let Some(rtc) = self.cmos.read().as_deref() {
            let layout = self.cmos_layout();
            debug!("[SVM] CMOS memory layout {:?}", layout);
            layout.write_to(rtc);
        }
    }
}

impl<H: SvmVCpuHal> Drop for SvmGuest<H> {
    fn drop(&mut self) {
        if let Err(e) = H::free_nested_page_table(self.npt_root) {
            error!(
                "[SVM] failed to free nested page table {:#x}: {:?}, will leak",
                self.npt_root, e
            );
        }
    }
}
