//! #VMEXIT dispatch.
//!
//! Every exit is decoded into an [`SvmExitReason`] and handed to exactly one
//! handler. Handlers return `AxResult`; any error is funnelled into the
//! vCPU's emergency-shutdown handler here and nowhere else.

mod cr;
mod exception;
mod ioio;
mod misc;

use axerrno::{AxResult, ax_err};

use super::definitions::{SvmExitCode, SvmExitReason};
use super::vcpu::{SvmExitOutcome, SvmVcpu, VmExitEnv};
use super::vmcb::SvmExitInfo;
use crate::hal::SvmVCpuHal;

impl<H: SvmVCpuHal> SvmVcpu<H> {
    /// Handles the #VMEXIT currently recorded in the VMCB.
    ///
    /// Returns [`SvmExitOutcome::Resumed`] when the guest may be re-entered.
    /// Once a vCPU has halted, no handler runs again.
    pub fn handle_vmexit(&mut self, env: &VmExitEnv) -> SvmExitOutcome {
        if self.halted {
            return SvmExitOutcome::Halted;
        }

        let exit_info = self.exit_info();
        trace!(
            "#VMEXIT({:#x}) {:?} @ RIP {:#x}",
            exit_info.raw_exit_code, exit_info.exit_reason, exit_info.guest_rip
        );

        #[cfg(feature = "tracing")]
        let regs_before = self.guest_regs;

        let res = self.dispatch_vmexit(&exit_info, env);

        #[cfg(feature = "tracing")]
        {
            let diff = crate::regs::GeneralRegistersDiff::new(regs_before, self.guest_regs);
            if !diff.is_same() {
                trace!("#VMEXIT({:#x}) changed {:?}", exit_info.raw_exit_code, diff);
            }
        }

        match res {
            Ok(()) if self.halted => SvmExitOutcome::Halted,
            Ok(()) => SvmExitOutcome::Resumed,
            Err(err) => {
                error!(
                    "#VMEXIT({:#x}) {:?} @ RIP {:#x} not resolved: {:?}",
                    exit_info.raw_exit_code, exit_info.exit_reason, exit_info.guest_rip, err
                );
                error!("{:#x?}", self);
                if !self.emergency_shutdown() {
                    warn!("no emergency shutdown handler registered");
                }
                SvmExitOutcome::ShutdownRequested
            }
        }
    }

    fn dispatch_vmexit(&mut self, exit_info: &SvmExitInfo, env: &VmExitEnv) -> AxResult {
        let reason = match exit_info.exit_reason {
            Ok(reason) => reason,
            Err(raw) => {
                error!("Unknown #VMEXIT exit code: {:#x}", raw);
                return ax_err!(Unsupported, "unknown exit code");
            }
        };

        match reason {
            SvmExitReason::CrRead(cr) => self.handle_cr_read(cr, exit_info, env),
            SvmExitReason::CrWrite(cr) => self.handle_cr_write(cr, exit_info, env),
            SvmExitReason::Exception(vector) => self.handle_exception(vector, exit_info, env),
            SvmExitReason::Code(code) => match code {
                SvmExitCode::INTR => Ok(()),
                SvmExitCode::CPUID => self.handle_cpuid(),
                SvmExitCode::IOIO => self.handle_ioio(exit_info, env),
                SvmExitCode::MSR => self.handle_msr(exit_info),
                SvmExitCode::SHUTDOWN => self.handle_triple_fault(exit_info),
                SvmExitCode::SWINT
                | SvmExitCode::VMMCALL
                | SvmExitCode::IRET
                | SvmExitCode::POPF
                | SvmExitCode::NPF => self.handle_unemulated(code, exit_info),
                _ => {
                    error!("#VMEXIT: Unhandled exit code: {:?}", code);
                    ax_err!(Unsupported, "unhandled exit code")
                }
            },
            SvmExitReason::DrRead(_) | SvmExitReason::DrWrite(_) => {
                error!("#VMEXIT: Unhandled debug-register access: {:?}", reason);
                ax_err!(Unsupported, "debug-register access")
            }
        }
    }
}
