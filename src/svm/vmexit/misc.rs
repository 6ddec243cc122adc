use axerrno::{AxResult, ax_err};

use crate::hal::SvmVCpuHal;
use crate::svm::definitions::SvmExitCode;
use crate::svm::vcpu::SvmVcpu;
use crate::svm::vmcb::SvmExitInfo;

impl<H: SvmVCpuHal> SvmVcpu<H> {
    pub(super) fn handle_cpuid(&mut self) -> AxResult {
        const VM_EXIT_INSTR_LEN_CPUID: u8 = 2;

        let function = self.gpr(0)? as u32;
        let Some(res) = self.cpuid.lookup(function) else {
            error!("Unsupported CPUID function {:#x}", function);
            return ax_err!(Unsupported, "CPUID function not provided");
        };
        trace!("VM exit: CPUID({:#x}): {:?}", function, res);

        self.set_gpr(0, res.eax as u64)?;
        let regs = self.regs_mut();
        regs.rbx = res.ebx as _;
        regs.rcx = res.ecx as _;
        regs.rdx = res.edx as _;
        self.advance_rip(VM_EXIT_INSTR_LEN_CPUID);
        Ok(())
    }

    /// `RDMSR`/`WRMSR`. No MSR is emulated, so every access escalates.
    pub(super) fn handle_msr(&mut self, exit_info: &SvmExitInfo) -> AxResult {
        let msr = self.guest_regs.rcx as u32;
        let rax = self.gpr(0)?;
        match exit_info.exit_info_1 {
            0 => info!("Unhandled Intercept: RDMSR({:#x})", msr),
            1 => info!(
                "Unhandled Intercept: WRMSR({:#x}, {:#x})",
                msr,
                (self.guest_regs.rdx << 32) | (rax & 0xffff_ffff)
            ),
            other => error!("MSR intercept with EXITINFO1 {:#x}", other),
        }
        ax_err!(Unsupported, "MSR access")
    }

    /// Intercepts that are recognised but not emulated: software interrupts,
    /// `VMMCALL`, `IRET`, `POPF` and nested page faults.
    pub(super) fn handle_unemulated(
        &mut self,
        code: SvmExitCode,
        exit_info: &SvmExitInfo,
    ) -> AxResult {
        info!(
            "Unhandled Intercept: {:?} @ RIP {:#x} ({:#x}, {:#x})",
            code, exit_info.guest_rip, exit_info.exit_info_1, exit_info.exit_info_2
        );
        ax_err!(Unsupported, "intercept not emulated")
    }

    /// A triple fault is terminal for the guest. Without a shutdown handler
    /// there is no way to contain it.
    pub(super) fn handle_triple_fault(&mut self, exit_info: &SvmExitInfo) -> AxResult {
        error!("Triple fault in guest @ RIP {:#x}!!", exit_info.guest_rip);
        if !self.emergency_shutdown() {
            panic!("guest triple fault with no emergency shutdown handler: {:#x?}", self);
        }
        self.halted = true;
        Ok(())
    }
}
