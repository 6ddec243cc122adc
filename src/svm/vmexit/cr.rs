use axerrno::{AxResult, ax_err, ax_err_type};
use tock_registers::interfaces::{Readable, Writeable};

use crate::decode::{CrOperand, DecodedInstruction, InsnKind};
use crate::hal::SvmVCpuHal;
use crate::regs::{Cr0Diff, GeneralRegisters};
use crate::svm::vcpu::{SvmVcpu, VmExitEnv};
use crate::svm::vmcb::{SvmCrAccessInfo, SvmExitInfo};

/// The control registers whose intercepts are resolved here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CrAccess {
    Cr0,
    /// Moves only reach the guest's copy. The hardware CR3 stays on the
    /// shadow root.
    Cr3,
}

impl CrAccess {
    fn classify(cr: u8, is_write: bool) -> AxResult<Self> {
        match cr {
            0 => Ok(Self::Cr0),
            3 => Ok(Self::Cr3),
            n => {
                error!(
                    "Unhandled intercept cr{} {}",
                    n,
                    if is_write { "write" } else { "read" }
                );
                ax_err!(Unsupported, "unhandled control register")
            }
        }
    }

    fn number(self) -> u8 {
        match self {
            Self::Cr0 => 0,
            Self::Cr3 => 3,
        }
    }
}

fn decode_mismatch(access: CrAccess, insn: &DecodedInstruction) -> AxResult {
    error!(
        "cr{} intercept decoded as a move of another register: {:x?}",
        access.number(),
        insn
    );
    ax_err!(InvalidData, "decoded control register does not match the intercept")
}

impl<H: SvmVCpuHal> SvmVcpu<H> {
    /// The GPR operand reported by decode assists. Only used when the
    /// hardware also provides next-RIP, since nothing else gives the
    /// instruction length.
    fn assisted_gpr(&self, exit_info: &SvmExitInfo) -> Option<u8> {
        if !(self.caps.decode_assist && self.caps.next_rip) {
            return None;
        }
        SvmCrAccessInfo::decode(exit_info.exit_info_1).gpr
    }

    pub(super) fn handle_cr_read(
        &mut self,
        cr: u8,
        exit_info: &SvmExitInfo,
        env: &VmExitEnv,
    ) -> AxResult {
        let access = CrAccess::classify(cr, false)?;
        let value = self.read_guest_cr(access);

        if let Some(gpr) = self.assisted_gpr(exit_info) {
            trace!(
                "CR{} read into {} (decode assist)",
                access.number(),
                GeneralRegisters::register_name(gpr)
            );
            self.set_gpr(gpr, value)?;
            self.set_rip(exit_info.guest_next_rip);
            return Ok(());
        }

        let insn = self.fetch_instruction(env)?;
        let InsnKind::MovCr {
            src: CrOperand::Cr(src),
            dst: CrOperand::Gpr(dst),
        } = insn.kind
        else {
            error!(
                "CR{} read intercept decoded as {:x?}, guest CR {:x?}",
                access.number(),
                insn,
                self.cr
            );
            return ax_err!(Unsupported, "unexpected instruction for CR read");
        };
        if src != access.number() {
            return decode_mismatch(access, &insn);
        }

        self.set_gpr(dst, value)?;
        self.advance_rip(insn.length);
        Ok(())
    }

    pub(super) fn handle_cr_write(
        &mut self,
        cr: u8,
        exit_info: &SvmExitInfo,
        env: &VmExitEnv,
    ) -> AxResult {
        let access = CrAccess::classify(cr, true)?;

        if let Some(gpr) = self.assisted_gpr(exit_info) {
            trace!(
                "CR{} write from {} (decode assist)",
                access.number(),
                GeneralRegisters::register_name(gpr)
            );
            let value = self.gpr(gpr)?;
            self.write_guest_cr(access, value);
            self.set_rip(exit_info.guest_next_rip);
            return Ok(());
        }

        let insn = self.fetch_instruction(env)?;
        let InsnKind::MovCr {
            src,
            dst: CrOperand::Cr(dst),
        } = insn.kind
        else {
            error!(
                "CR{} write intercept decoded as {:x?}, guest CR {:x?}",
                access.number(),
                insn,
                self.cr
            );
            return ax_err!(Unsupported, "unexpected instruction for CR write");
        };
        if dst != access.number() {
            return decode_mismatch(access, &insn);
        }
        let value = match src {
            CrOperand::Gpr(reg) => self.gpr(reg)?,
            CrOperand::Cr(n) => self.cr.get(n).ok_or_else(|| {
                error!("cr{} has no shadow copy, decoded {:x?}", n, insn);
                ax_err_type!(Unsupported, "unsupported CR source")
            })?,
        };

        self.write_guest_cr(access, value);
        self.advance_rip(insn.length);
        Ok(())
    }

    fn read_guest_cr(&self, access: CrAccess) -> u64 {
        match access {
            CrAccess::Cr0 => self.cr.cr0,
            CrAccess::Cr3 => self.cr.cr3,
        }
    }

    fn write_guest_cr(&mut self, access: CrAccess, value: u64) {
        match access {
            CrAccess::Cr0 => self.write_guest_cr0(value),
            CrAccess::Cr3 => {
                debug!(
                    "guest CR3 <- {:#x}, hardware CR3 stays {:#x}",
                    value,
                    self.vmcb().state.cr3.get()
                );
                self.cr.cr3 = value;
            }
        }
    }

    /// Stores the guest's CR0 and mirrors the allowed part of the change into
    /// the hardware CR0.
    fn write_guest_cr0(&mut self, value: u64) {
        let diff = Cr0Diff::new(self.cr.cr0, value);
        self.cr.cr0 = value;

        let hw_cr0 = &self.vmcb().state.cr0;
        let old_hw = hw_cr0.get();
        let new_hw = diff.apply_to_hardware(old_hw);
        hw_cr0.set(new_hw);
        debug!(
            "guest CR0 <- {:#x} {:?}, hardware CR0 {:#x} -> {:#x}",
            value, diff, old_hw, new_hw
        );
    }
}
