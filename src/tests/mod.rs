//! Unit tests for the SVM vCPU crate.
//!
//! Host memory is simulated: every frame handed out by [`MockHal`] is a
//! page-aligned heap allocation registered under a fake physical address
//! below 4 GiB, so page-table frames can be linked by 32-bit entries.

mod translate;

use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::string::String;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::vec::Vec;

use axerrno::{AxResult, ax_err};

use crate::cpuid::CpuidTable;
use crate::decode::{DecodedInstruction, InstructionDecoder};
use crate::device::{AccessWidth, DeviceEmulator, Endianness};
use crate::guest::{CmosRtc, GuestMemory, GuestRegion, RegionSpace};
use crate::hal::SvmVCpuHal;
use crate::mem::{GuestPhysAddr, HostPhysAddr, HostVirtAddr};
use crate::svm::{EmergencyShutdown, SvmCapabilities, SvmVcpu};

const PAGE: usize = 0x1000;

/// Fake physical address -> (host pointer, length).
static HOST_MEMORY: Mutex<BTreeMap<usize, (usize, usize)>> = Mutex::new(BTreeMap::new());
static NEXT_PADDR: AtomicUsize = AtomicUsize::new(0x10_0000);

/// Tests that expect a panic must not poison the map for everyone else.
fn host_memory() -> MutexGuard<'static, BTreeMap<usize, (usize, usize)>> {
    HOST_MEMORY.lock().unwrap_or_else(PoisonError::into_inner)
}

fn mock_alloc(frames: usize) -> HostPhysAddr {
    let len = frames * PAGE;
    let ptr = unsafe { alloc_zeroed(Layout::from_size_align(len, PAGE).unwrap()) };
    assert!(!ptr.is_null());
    let paddr = NEXT_PADDR.fetch_add(len, Ordering::Relaxed);
    assert!(paddr + len <= u32::MAX as usize);
    host_memory().insert(paddr, (ptr as usize, len));
    HostPhysAddr::from(paddr)
}

fn mock_dealloc(paddr: HostPhysAddr) {
    let entry = host_memory().remove(&paddr.as_usize());
    let (ptr, len) = entry.expect("dealloc of unknown frame");
    unsafe { dealloc(ptr as *mut u8, Layout::from_size_align(len, PAGE).unwrap()) };
}

pub(crate) struct MockHal;

impl SvmVCpuHal for MockHal {
    fn alloc_frame() -> Option<HostPhysAddr> {
        Some(mock_alloc(1))
    }

    fn dealloc_frame(paddr: HostPhysAddr) {
        mock_dealloc(paddr)
    }

    fn alloc_contiguous_frames(num_frames: usize) -> Option<HostPhysAddr> {
        Some(mock_alloc(num_frames))
    }

    fn dealloc_contiguous_frames(paddr: HostPhysAddr, _num_frames: usize) {
        mock_dealloc(paddr)
    }

    fn phys_to_virt(paddr: HostPhysAddr) -> HostVirtAddr {
        let paddr = paddr.as_usize();
        let vaddr = match host_memory().range(..=paddr).next_back() {
            Some((&base, &(ptr, len))) if paddr < base + len => Some(ptr + (paddr - base)),
            _ => None,
        };
        match vaddr {
            Some(vaddr) => HostVirtAddr::from(vaddr),
            None => panic!("phys_to_virt: {:#x} is not mock host memory", paddr),
        }
    }

    fn virt_to_phys(vaddr: HostVirtAddr) -> HostPhysAddr {
        let vaddr = vaddr.as_usize();
        let paddr = host_memory()
            .iter()
            .find(|&(_, &(ptr, len))| (ptr..ptr + len).contains(&vaddr))
            .map(|(&base, &(ptr, _))| base + (vaddr - ptr));
        match paddr {
            Some(paddr) => HostPhysAddr::from(paddr),
            None => panic!("virt_to_phys: {:#x} is not mock host memory", vaddr),
        }
    }

    fn alloc_nested_page_table() -> Option<HostPhysAddr> {
        Some(mock_alloc(1))
    }

    fn free_nested_page_table(root: HostPhysAddr) -> AxResult {
        mock_dealloc(root);
        Ok(())
    }
}

/// A HAL whose nested page table can never be freed.
pub(crate) struct LeakyNptHal;

/// A HAL without memory for nested page tables.
pub(crate) struct NoNptHal;

macro_rules! delegate_frames_to_mock {
    () => {
        fn alloc_frame() -> Option<HostPhysAddr> {
            MockHal::alloc_frame()
        }
        fn dealloc_frame(paddr: HostPhysAddr) {
            MockHal::dealloc_frame(paddr)
        }
        fn alloc_contiguous_frames(num_frames: usize) -> Option<HostPhysAddr> {
            MockHal::alloc_contiguous_frames(num_frames)
        }
        fn dealloc_contiguous_frames(paddr: HostPhysAddr, num_frames: usize) {
            MockHal::dealloc_contiguous_frames(paddr, num_frames)
        }
        fn phys_to_virt(paddr: HostPhysAddr) -> HostVirtAddr {
            MockHal::phys_to_virt(paddr)
        }
        fn virt_to_phys(vaddr: HostVirtAddr) -> HostPhysAddr {
            MockHal::virt_to_phys(vaddr)
        }
    };
}

impl SvmVCpuHal for LeakyNptHal {
    delegate_frames_to_mock!();

    fn alloc_nested_page_table() -> Option<HostPhysAddr> {
        MockHal::alloc_nested_page_table()
    }

    fn free_nested_page_table(_root: HostPhysAddr) -> AxResult {
        ax_err!(BadState, "nested page table still in use")
    }
}

impl SvmVCpuHal for NoNptHal {
    delegate_frames_to_mock!();

    fn alloc_nested_page_table() -> Option<HostPhysAddr> {
        None
    }

    fn free_nested_page_table(_root: HostPhysAddr) -> AxResult {
        unreachable!("no nested page table was allocated")
    }
}

/// Guest memory with a list of regions and one block of readable bytes.
#[derive(Default)]
pub(crate) struct MockGuestMemory {
    pub regions: Vec<(RegionSpace, GuestRegion)>,
    pub bytes_at: usize,
    pub bytes: Vec<u8>,
}

impl MockGuestMemory {
    pub fn with_code(gpa: usize, code: &[u8]) -> Self {
        Self {
            regions: Vec::new(),
            bytes_at: gpa,
            bytes: code.to_vec(),
        }
    }

    pub fn region(mut self, space: RegionSpace, region: GuestRegion) -> Self {
        self.regions.push((space, region));
        self
    }
}

impl GuestMemory for MockGuestMemory {
    fn find_region(&self, gpa: GuestPhysAddr, space: RegionSpace) -> Option<GuestRegion> {
        self.regions
            .iter()
            .find(|(s, r)| *s == space && r.contains(gpa))
            .map(|(_, r)| *r)
    }

    fn read_guest_memory(&self, gpa: GuestPhysAddr, buf: &mut [u8]) -> AxResult<usize> {
        let gpa = gpa.as_usize();
        let end = self.bytes_at + self.bytes.len();
        if !(self.bytes_at..end).contains(&gpa) {
            return Ok(0);
        }
        let src = &self.bytes[gpa - self.bytes_at..];
        let len = src.len().min(buf.len());
        buf[..len].copy_from_slice(&src[..len]);
        Ok(len)
    }
}

/// Decodes every instruction as the same one, remembering what was fetched.
pub(crate) struct MockDecoder {
    pub insn: AxResult<DecodedInstruction>,
    pub fetched: RefCell<Vec<Vec<u8>>>,
}

impl MockDecoder {
    pub fn returning(insn: DecodedInstruction) -> Self {
        Self {
            insn: Ok(insn),
            fetched: RefCell::new(Vec::new()),
        }
    }

    pub fn unused() -> Self {
        Self {
            insn: ax_err!(Unsupported, "decoder not expected to run"),
            fetched: RefCell::new(Vec::new()),
        }
    }
}

impl InstructionDecoder for MockDecoder {
    fn decode(&self, bytes: &[u8]) -> AxResult<DecodedInstruction> {
        self.fetched.borrow_mut().push(bytes.to_vec());
        self.insn
    }
}

/// Records every device access; reads return `read_value`.
#[derive(Default)]
pub(crate) struct MockDevices {
    pub read_value: u64,
    pub fail: bool,
    pub log: RefCell<Vec<String>>,
}

impl MockDevices {
    pub fn reading(read_value: u64) -> Self {
        Self {
            read_value,
            ..Default::default()
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    fn record(&self, entry: String) -> AxResult {
        self.log.borrow_mut().push(entry);
        if self.fail {
            return ax_err!(Io, "device failure");
        }
        Ok(())
    }
}

impl DeviceEmulator for MockDevices {
    fn emulate_mmio_read(
        &self,
        addr: GuestPhysAddr,
        width: AccessWidth,
        _endianness: Endianness,
    ) -> AxResult<u64> {
        self.record(format!("mmio read {:#x} {:?}", addr.as_usize(), width))?;
        Ok(self.read_value)
    }

    fn emulate_mmio_write(
        &self,
        addr: GuestPhysAddr,
        width: AccessWidth,
        value: u64,
        _endianness: Endianness,
    ) -> AxResult {
        self.record(format!("mmio write {:#x} {:?} {:#x}", addr.as_usize(), width, value))
    }

    fn emulate_io_read(
        &self,
        port: u16,
        width: AccessWidth,
        _endianness: Endianness,
    ) -> AxResult<u32> {
        self.record(format!("in {:#x} {:?}", port, width))?;
        Ok(self.read_value as u32)
    }

    fn emulate_io_write(
        &self,
        port: u16,
        width: AccessWidth,
        value: u32,
        _endianness: Endianness,
    ) -> AxResult {
        self.record(format!("out {:#x} {:?} {:#x}", port, width, value))
    }
}

/// Counts emergency shutdowns.
#[derive(Clone, Default)]
pub(crate) struct ShutdownCounter(pub Arc<AtomicUsize>);

impl ShutdownCounter {
    pub fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

impl<H: SvmVCpuHal> EmergencyShutdown<H> for ShutdownCounter {
    fn emergency_shutdown(&self, _vcpu: &SvmVcpu<H>) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

/// Records CMOS register writes; later writes overwrite earlier ones.
#[derive(Clone, Default)]
pub(crate) struct MockCmos(pub Arc<Mutex<BTreeMap<u8, u8>>>);

impl MockCmos {
    pub fn get(&self, reg: u8) -> Option<u8> {
        self.0.lock().unwrap().get(&reg).copied()
    }

    pub fn get16(&self, lo: u8, hi: u8) -> Option<u16> {
        Some(u16::from_le_bytes([self.get(lo)?, self.get(hi)?]))
    }
}

impl CmosRtc for MockCmos {
    fn cmos_write(&self, reg: u8, value: u8) {
        self.0.lock().unwrap().insert(reg, value);
    }
}

/// BIOS reset vector: `CS = 0xf000`, `RIP = 0xfff0`.
pub(crate) const RESET_ENTRY: usize = 0xf_fff0;

pub(crate) fn test_cpuid() -> CpuidTable {
    CpuidTable::new(b"AuthenticAMD", "Mock SVM CPU")
}

pub(crate) fn new_vcpu(caps: SvmCapabilities) -> SvmVcpu<MockHal> {
    let mut vcpu = SvmVcpu::<MockHal>::new(caps, test_cpuid()).unwrap();
    vcpu.setup(GuestPhysAddr::from(RESET_ENTRY)).unwrap();
    vcpu
}
