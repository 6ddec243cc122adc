//! AMD-SVM helper structs
//! https://www.amd.com/content/dam/amd/en/documents/processor-tech-docs/programmer-references/24593.pdf

use core::sync::atomic::{AtomicU8, Ordering};

use axerrno::AxResult;

use super::vmcb::VmcbStruct;
use crate::frame::{ContiguousPhysFrames, PAGE_SIZE, PhysFrame};
use crate::hal::SvmVCpuHal;
use crate::mem::HostPhysAddr;

/// Virtual-Machine Control Block (VMCB).
/// One 4 KiB page per vCPU: [control-area | save-area].
#[derive(Debug)]
pub struct VmcbFrame<H: SvmVCpuHal> {
    page: PhysFrame<H>,
}

impl<H: SvmVCpuHal> VmcbFrame<H> {
    pub fn new() -> AxResult<Self> {
        Ok(Self {
            page: PhysFrame::alloc_zero()?,
        })
    }

    pub fn phys_addr(&self) -> HostPhysAddr {
        self.page.start_paddr()
    }

    /// All VMCB fields are interior-mutable register proxies, so a shared
    /// reference is enough to update them.
    pub fn vmcb(&self) -> &VmcbStruct {
        unsafe { &*(self.page.as_mut_ptr() as *const VmcbStruct) }
    }
}

// (AMD64 APM Vol.2, Section 15.10.1)
// The IOPM occupies 12 Kbytes of contiguous physical memory: one bit per port
// for 64K ports, plus three bits in the third page for accesses that wrap
// past port 0xFFFF.
const IOPM_FRAMES: usize = 3;

/// The I/O Permissions Map.
///
/// Each bit is updated with an atomic read-modify-write on its byte, so the
/// map may be changed by an administrative thread while the owning vCPU runs.
#[derive(Debug)]
pub struct IOPm<H: SvmVCpuHal> {
    frames: ContiguousPhysFrames<H>,
}

impl<H: SvmVCpuHal> IOPm<H> {
    pub fn passthrough_all() -> AxResult<Self> {
        let frames = ContiguousPhysFrames::<H>::alloc_zero(IOPM_FRAMES)?;
        let iopm = Self { frames };
        // Ports beyond 0xFFFF are always intercepted.
        iopm.byte(2 * PAGE_SIZE).fetch_or(0x07, Ordering::SeqCst);
        Ok(iopm)
    }

    pub fn phys_addr(&self) -> HostPhysAddr {
        self.frames.start_paddr()
    }

    fn byte(&self, index: usize) -> &AtomicU8 {
        debug_assert!(index < IOPM_FRAMES * PAGE_SIZE);
        unsafe { &*(self.frames.as_mut_ptr().add(index) as *const AtomicU8) }
    }

    pub fn set_intercept(&self, port: u16, intercept: bool) {
        let mask = 1u8 << (port % 8);
        let byte = self.byte(port as usize / 8);
        if intercept {
            byte.fetch_or(mask, Ordering::SeqCst);
        } else {
            byte.fetch_and(!mask, Ordering::SeqCst);
        }
    }

    pub fn is_intercepted(&self, port: u16) -> bool {
        self.byte(port as usize / 8).load(Ordering::SeqCst) & (1 << (port % 8)) != 0
    }

    /// Sets interception for `count` ports starting at `port_base`, stopping
    /// at port 0xFFFF.
    pub fn set_intercept_of_range(&self, port_base: u32, count: u32, intercept: bool) {
        let end = port_base.saturating_add(count).min(0x1_0000);
        for port in port_base..end {
            self.set_intercept(port as u16, intercept)
        }
    }
}

// (AMD64 APM Vol.2, Section 15.11)
// The MSRPM holds two bits (read, write) per MSR for three MSR ranges, packed
// into two contiguous pages.
#[derive(Debug)]
pub struct MSRPm<H: SvmVCpuHal> {
    frames: ContiguousPhysFrames<H>,
}

impl<H: SvmVCpuHal> MSRPm<H> {
    pub fn intercept_all() -> AxResult<Self> {
        let mut frames = ContiguousPhysFrames::alloc(2)?;
        frames.fill(0xff);
        Ok(Self { frames })
    }

    pub fn phys_addr(&self) -> HostPhysAddr {
        self.frames.start_paddr()
    }

    /// Returns the byte offset and the bit within it for one access to `msr`,
    /// or `None` for MSRs outside the three mapped ranges (always
    /// intercepted by hardware).
    fn locate(msr: u32, is_write: bool) -> Option<(usize, u8)> {
        let (segment, msr_low) = match msr {
            0..=0x1fff => (0, msr),
            0xc000_0000..=0xc000_1fff => (1, msr & 0x1fff),
            0xc001_0000..=0xc001_1fff => (2, msr & 0x1fff),
            _ => return None,
        };
        let offset = segment * 2048 + msr_low as usize / 4;
        let bit = ((msr_low & 0b11) * 2) as u8 + is_write as u8;
        Some((offset, bit))
    }

    pub fn set_intercept(&mut self, msr: u32, is_write: bool, intercept: bool) {
        let Some((offset, bit)) = Self::locate(msr, is_write) else {
            warn!("MSR {:#x} is outside the MSRPM and always intercepted", msr);
            return;
        };
        unsafe {
            let byte_ptr = self.frames.as_mut_ptr().add(offset);
            let old = core::ptr::read_volatile(byte_ptr);
            let new = if intercept {
                old | (1 << bit)
            } else {
                old & !(1 << bit)
            };
            core::ptr::write_volatile(byte_ptr, new);
        }
    }

    pub fn is_intercepted(&self, msr: u32, is_write: bool) -> bool {
        match Self::locate(msr, is_write) {
            Some((offset, bit)) => unsafe {
                core::ptr::read_volatile(self.frames.as_mut_ptr().add(offset)) & (1 << bit) != 0
            },
            None => true,
        }
    }
}
