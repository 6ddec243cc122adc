use alloc::boxed::Box;
use alloc::sync::Arc;
use core::fmt::{Debug, Formatter, Result};

use axerrno::{AxResult, ax_err};
use tock_registers::interfaces::{ReadWriteable, Readable, Writeable};
use x86_64::registers::control::{Cr0Flags, EferFlags};

use super::structs::{IOPm, MSRPm, VmcbFrame};
use super::vmcb::{
    InterceptCrRw, InterceptExceptions, InterceptVec3, InterceptVec4, SvmExitInfo, VmcbStruct,
    VmcbTlbControl, set_vmcb_segment,
};
use crate::cpuid::CpuidTable;
use crate::decode::InstructionDecoder;
use crate::device::DeviceEmulator;
use crate::guest::GuestMemory;
use crate::hal::SvmVCpuHal;
use crate::mem::{GuestPhysAddr, HostPhysAddr};
use crate::regs::GeneralRegisters;
use crate::shadow::ShadowPageTable;

/// SVM features of the host processor the exit handlers can rely on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SvmCapabilities {
    /// EXITINFO1 of CR-access intercepts carries the GPR operand.
    pub decode_assist: bool,
    /// The VMCB next-RIP field is filled on instruction intercepts.
    pub next_rip: bool,
}

impl SvmCapabilities {
    /// Queries CPUID leaf `0x8000_000A`.
    #[cfg(target_arch = "x86_64")]
    pub fn detect() -> Self {
        match raw_cpuid::CpuId::new().get_svm_info() {
            Some(svm) => Self {
                decode_assist: svm.has_decode_assists(),
                next_rip: svm.has_nrip(),
            },
            None => Self::default(),
        }
    }
}

/// Guest-visible control registers.
///
/// The hardware CR0 and CR3 in the VMCB are owned by the hypervisor; the
/// guest reads and writes these copies through intercepted `MOV CRx`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuestControlRegs {
    pub cr0: u64,
    pub cr1: u64,
    pub cr2: u64,
    pub cr3: u64,
}

impl Default for GuestControlRegs {
    /// The values after `RESET`.
    fn default() -> Self {
        Self {
            cr0: (Cr0Flags::EXTENSION_TYPE | Cr0Flags::NOT_WRITE_THROUGH | Cr0Flags::CACHE_DISABLE)
                .bits(),
            cr1: 0,
            cr2: 0,
            cr3: 0,
        }
    }
}

impl GuestControlRegs {
    /// The shadow copy of `CRn`, for the registers that have one.
    pub fn get(&self, n: u8) -> Option<u64> {
        match n {
            0 => Some(self.cr0),
            1 => Some(self.cr1),
            2 => Some(self.cr2),
            3 => Some(self.cr3),
            _ => None,
        }
    }
}

/// The terminal error sink of a vCPU.
///
/// Invoked from exit handling, on the vCPU thread, whenever an exit cannot be
/// resolved. Implementations decide how the guest is torn down and must not
/// block.
pub trait EmergencyShutdown<H: SvmVCpuHal>: Send {
    fn emergency_shutdown(&self, vcpu: &SvmVcpu<H>);
}

/// The collaborators an exit handler may call.
#[derive(Clone, Copy)]
pub struct VmExitEnv<'a> {
    pub guest: &'a dyn GuestMemory,
    pub decoder: &'a dyn InstructionDecoder,
    pub devices: &'a dyn DeviceEmulator,
}

/// What the scheduler should do after an exit was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SvmExitOutcome {
    /// The exit was resolved; the vCPU may re-enter the guest.
    Resumed,
    /// The exit could not be resolved and the shutdown handler was invoked.
    /// The vCPU should not be scheduled again.
    ShutdownRequested,
    /// The guest triple-faulted. The vCPU is permanently halted.
    Halted,
}

/// A virtual CPU within a guest, running in SVM guest mode.
pub struct SvmVcpu<H: SvmVCpuHal> {
    pub(super) guest_regs: GeneralRegisters,
    pub(super) vmcb: VmcbFrame<H>,
    iopm: Arc<IOPm<H>>,
    msrpm: MSRPm<H>,
    pub(super) cr: GuestControlRegs,
    pub(super) shadow: ShadowPageTable<H>,
    pub(super) caps: SvmCapabilities,
    pub(super) cpuid: CpuidTable,
    shutdown: Option<Box<dyn EmergencyShutdown<H>>>,
    pub(super) halted: bool,
}

impl<H: SvmVCpuHal> SvmVcpu<H> {
    /// Create a new [`SvmVcpu`].
    pub fn new(caps: SvmCapabilities, cpuid: CpuidTable) -> AxResult<Self> {
        let vcpu = Self {
            guest_regs: GeneralRegisters::default(),
            vmcb: VmcbFrame::new()?,
            iopm: Arc::new(IOPm::passthrough_all()?),
            msrpm: MSRPm::intercept_all()?,
            cr: GuestControlRegs::default(),
            shadow: ShadowPageTable::new()?,
            caps,
            cpuid,
            shutdown: None,
            halted: false,
        };
        info!("[SVM] created SvmVcpu(vmcb: {:#x})", vcpu.vmcb.phys_addr());
        Ok(vcpu)
    }

    /// Replaces the shadow page table, e.g. with one built
    /// [`without_hint`](ShadowPageTable::without_hint).
    pub fn with_shadow_page_table(mut self, shadow: ShadowPageTable<H>) -> Self {
        self.shadow = shadow;
        self.vmcb().state.cr3.set(self.shadow.root_paddr().as_usize() as u64);
        self
    }

    pub fn set_shutdown_handler(&mut self, handler: Box<dyn EmergencyShutdown<H>>) {
        self.shutdown = Some(handler);
    }

    /// Prepares the VMCB to start a real-mode guest at `entry`, which is split
    /// into a `CS` selector and an offset the way a far jump would.
    pub fn setup(&mut self, entry: GuestPhysAddr) -> AxResult {
        self.setup_vmcb_guest(entry);
        self.setup_vmcb_control();
        Ok(())
    }

    fn setup_vmcb_guest(&mut self, entry: GuestPhysAddr) {
        let entry = entry.as_usize() as u64;
        let cs = ((entry >> 4) & 0xf000) as u16;
        info!("[SVM] setting up VMCB for real-mode guest at {:#x}", entry);

        self.cr = GuestControlRegs::default();
        let st = &self.vmcb().state;

        // Paged real mode: the guest runs unprotected while the hardware
        // translates through the shadow table.
        st.cr0.set((Cr0Flags::PAGING | Cr0Flags::from_bits_retain(self.cr.cr0)).bits());
        st.cr3.set(self.shadow.root_paddr().as_usize() as u64);
        st.cr4.set(0);
        st.efer.set(EferFlags::SECURE_VIRTUAL_MACHINE_ENABLE.bits());

        set_vmcb_segment(&st.cs, cs, 0x9b);
        for seg in [&st.ds, &st.es, &st.fs, &st.gs, &st.ss] {
            set_vmcb_segment(seg, 0, 0x93);
        }
        set_vmcb_segment(&st.ldtr, 0, 0x82);
        set_vmcb_segment(&st.tr, 0, 0x8b);
        st.gdtr.base.set(0);
        st.gdtr.limit.set(0xffff);
        st.idtr.base.set(0);
        st.idtr.limit.set(0x3ff);

        st.rip.set(entry & 0xffff);
        st.rsp.set(0);
        st.rax.set(0);
        st.rflags.set(0x2);
        st.dr6.set(0xffff_0ff0);
        st.dr7.set(0x400);
    }

    fn setup_vmcb_control(&mut self) {
        let ct = &self.vmcb().control;

        // CR3 must stay on the shadow root while nested paging is off.
        ct.intercept_cr.write(
            InterceptCrRw::READ_CR0::SET
                + InterceptCrRw::WRITE_CR0::SET
                + InterceptCrRw::READ_CR3::SET
                + InterceptCrRw::WRITE_CR3::SET,
        );
        ct.intercept_exceptions.write(InterceptExceptions::PF::SET);
        ct.intercept_vector3.write(
            InterceptVec3::INTR::SET
                + InterceptVec3::CPUID::SET
                + InterceptVec3::IOIO_PROT::SET
                + InterceptVec3::MSR_PROT::SET
                + InterceptVec3::SHUTDOWN::SET,
        );
        // VMRUN must always be intercepted.
        ct.intercept_vector4
            .write(InterceptVec4::VMRUN::SET + InterceptVec4::VMMCALL::SET);

        ct.iopm_base_pa.set(self.iopm.phys_addr().as_usize() as u64);
        ct.msrpm_base_pa.set(self.msrpm.phys_addr().as_usize() as u64);
        ct.guest_asid.set(1);
        ct.tlb_control.modify(VmcbTlbControl::CONTROL::FlushGuestTlb);
        ct.clean_bits.set(0);
    }

    pub fn vmcb(&self) -> &VmcbStruct {
        self.vmcb.vmcb()
    }

    pub fn vmcb_paddr(&self) -> HostPhysAddr {
        self.vmcb.phys_addr()
    }

    pub fn exit_info(&self) -> SvmExitInfo {
        self.vmcb().exit_info()
    }

    pub fn regs(&self) -> &GeneralRegisters {
        &self.guest_regs
    }

    pub fn regs_mut(&mut self) -> &mut GeneralRegisters {
        &mut self.guest_regs
    }

    pub fn guest_cr(&self) -> &GuestControlRegs {
        &self.cr
    }

    pub fn capabilities(&self) -> SvmCapabilities {
        self.caps
    }

    pub fn shadow_page_table(&self) -> &ShadowPageTable<H> {
        &self.shadow
    }

    pub fn shadow_page_table_mut(&mut self) -> &mut ShadowPageTable<H> {
        &mut self.shadow
    }

    /// The I/O permission map, shared with the guest for region intercepts.
    pub fn iopm(&self) -> Arc<IOPm<H>> {
        self.iopm.clone()
    }

    pub fn set_io_intercept_of_range(&self, port_base: u32, count: u32, intercept: bool) {
        self.iopm.set_intercept_of_range(port_base, count, intercept)
    }

    pub fn set_msr_intercept(&mut self, msr: u32, intercept: bool) {
        self.msrpm.set_intercept(msr, false, intercept);
        self.msrpm.set_intercept(msr, true, intercept);
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    pub fn rip(&self) -> u64 {
        self.vmcb().state.rip.get()
    }

    pub fn set_rip(&mut self, rip: u64) {
        self.vmcb().state.rip.set(rip)
    }

    /// Advance guest `RIP` by `instr_len` bytes.
    pub fn advance_rip(&mut self, instr_len: u8) {
        self.set_rip(self.rip().wrapping_add(instr_len as u64))
    }

    /// Reads a GPR by architectural number. `RAX` and `RSP` come from the
    /// VMCB, which holds their current values after `#VMEXIT`.
    pub fn gpr(&self, index: u8) -> AxResult<u64> {
        match index {
            0 => Ok(self.vmcb().state.rax.get()),
            4 => Ok(self.vmcb().state.rsp.get()),
            1..=15 => Ok(self.guest_regs.get_reg_of_index(index)),
            _ => invalid_gpr(index),
        }
    }

    /// Writes a GPR by architectural number, keeping the register file and
    /// the VMCB copy of `RAX` in step.
    pub fn set_gpr(&mut self, index: u8, value: u64) -> AxResult {
        match index {
            0 => {
                self.guest_regs.rax = value;
                self.vmcb().state.rax.set(value);
            }
            4 => self.vmcb().state.rsp.set(value),
            1..=15 => self.guest_regs.set_reg_of_index(index, value),
            _ => return invalid_gpr(index),
        }
        Ok(())
    }

    /// Invokes the shutdown handler, if one is registered.
    pub(super) fn emergency_shutdown(&self) -> bool {
        match self.shutdown.as_deref() {
            Some(handler) => {
                handler.emergency_shutdown(self);
                true
            }
            None => false,
        }
    }
}

/// Register numbers come from the decoder, so a bad one fails the exit.
fn invalid_gpr<T>(index: u8) -> AxResult<T> {
    error!("general-purpose register {} does not exist", index);
    ax_err!(InvalidInput, "general-purpose register number out of range")
}

impl<H: SvmVCpuHal> Debug for SvmVcpu<H> {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        let st = &self.vmcb().state;
        f.debug_struct("SvmVcpu")
            .field("guest_regs", &self.guest_regs)
            .field("rip", &st.rip.get())
            .field("rax", &st.rax.get())
            .field("rsp", &st.rsp.get())
            .field("rflags", &st.rflags.get())
            .field("cs", &st.cs.selector.get())
            .field("hw_cr0", &st.cr0.get())
            .field("hw_cr3", &st.cr3.get())
            .field("guest_cr", &self.cr)
            .field("shadow", &self.shadow)
            .field("halted", &self.halted)
            .finish()
    }
}
