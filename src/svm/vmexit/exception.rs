use axerrno::{AxResult, ax_err, ax_err_type};
use memory_addr::align_down_4k;
use tock_registers::interfaces::Writeable;
use x86::irq::PAGE_FAULT_VECTOR;

use crate::decode::{DecodedInstruction, InsnKind, MAX_INSN_LEN, MovOperand};
use crate::device::Endianness;
use crate::guest::{GuestRegion, RegionSpace};
use crate::hal::SvmVCpuHal;
use crate::mem::{GuestPhysAddr, GuestVirtAddr, HostPhysAddr};
use crate::svm::definitions::EXCEPTION_NAMES;
use crate::svm::vcpu::{SvmVcpu, VmExitEnv};
use crate::svm::vmcb::SvmExitInfo;

impl<H: SvmVCpuHal> SvmVcpu<H> {
    pub(super) fn handle_exception(
        &mut self,
        vector: u8,
        exit_info: &SvmExitInfo,
        env: &VmExitEnv,
    ) -> AxResult {
        match vector {
            PAGE_FAULT_VECTOR => self.handle_page_fault(exit_info, env),
            v => {
                error!(
                    "Unhandled guest exception {} (vector {}) @ RIP {:#x}, error code {:#x}",
                    EXCEPTION_NAMES[v as usize], v, exit_info.guest_rip, exit_info.exit_info_1
                );
                ax_err!(Unsupported, "unhandled guest exception")
            }
        }
    }

    /// In real mode the fault address in EXITINFO2 is a guest-physical
    /// address. RAM faults are resolved by extending the shadow table; other
    /// regions are MMIO and the faulting `MOV` is emulated.
    fn handle_page_fault(&mut self, exit_info: &SvmExitInfo, env: &VmExitEnv) -> AxResult {
        let fault_addr = exit_info.exit_info_2;
        let gpa = GuestPhysAddr::from(fault_addr as usize);

        let region = env
            .guest
            .find_region(gpa, RegionSpace::Memory)
            .ok_or_else(|| {
                error!(
                    "#PF at {:?} (RIP {:#x}) outside every guest region",
                    gpa, exit_info.guest_rip
                );
                ax_err_type!(NotFound, "no guest region for faulting address")
            })?;

        if region.is_ram() {
            let page = align_down_4k(gpa.as_usize());
            let hpa = HostPhysAddr::from(align_down_4k(region.host_addr_of(gpa).as_usize()));
            self.shadow.map_page(GuestVirtAddr::from(page), hpa)?;
            self.cr.cr2 = fault_addr;
            self.vmcb().state.cr2.set(fault_addr);
            return Ok(());
        }

        self.emulate_mmio(&region, gpa, env)
    }

    fn emulate_mmio(
        &mut self,
        region: &GuestRegion,
        gpa: GuestPhysAddr,
        env: &VmExitEnv,
    ) -> AxResult {
        let insn = self.fetch_instruction(env)?;
        let InsnKind::Mov { src, dst, width } = insn.kind else {
            error!("MMIO access at {:?} by a non-MOV instruction {:x?}", gpa, insn);
            return ax_err!(Unsupported, "non-MOV instruction at MMIO address");
        };
        let in_region =
            |op: MovOperand| matches!(op, MovOperand::Memory(addr) if region.contains(addr));

        if in_region(src) {
            let MovOperand::Register(reg) = dst else {
                error!("MMIO read at {:?} into non-register {:x?}", gpa, dst);
                return ax_err!(Unsupported, "MMIO read into memory");
            };
            // Checked before the device sees the read.
            let old = self.gpr(reg)?;
            let value = env.devices.emulate_mmio_read(gpa, width, Endianness::Little)?;
            trace!("MMIO read {:?} {:?} = {:#x}", gpa, width, value);
            self.set_gpr(reg, width.merge_into(old, value))?;
        } else if in_region(dst) {
            let value = match src {
                MovOperand::Immediate(imm) => imm,
                MovOperand::Register(reg) => self.gpr(reg)?,
                MovOperand::Memory(addr) => {
                    error!("memory-to-memory MOV {:?} -> {:?}", addr, gpa);
                    return ax_err!(Unsupported, "memory-to-memory MOV");
                }
            };
            trace!("MMIO write {:?} {:?} = {:#x}", gpa, width, value);
            env.devices
                .emulate_mmio_write(gpa, width, value & width.mask(), Endianness::Little)?;
        } else {
            error!(
                "decoded {:x?} does not access MMIO region {:x?} (fault at {:?})",
                insn, region, gpa
            );
            return ax_err!(InvalidData, "decoded operands outside the MMIO region");
        }

        self.advance_rip(insn.length);
        Ok(())
    }

    /// Reads and decodes the instruction at the guest `CS:RIP`.
    pub(super) fn fetch_instruction(&self, env: &VmExitEnv) -> AxResult<DecodedInstruction> {
        let rip = self.rip();
        let gpa = self
            .gva_to_gpa(GuestVirtAddr::from(rip as usize))
            .inspect_err(|_| error!("failed to translate guest RIP {:#x}", rip))?;

        let mut bytes = [0u8; MAX_INSN_LEN];
        let len = env
            .guest
            .read_guest_memory(gpa, &mut bytes)
            .inspect_err(|e| error!("failed to read instruction at {:?}: {:?}", gpa, e))?;
        if len == 0 {
            return ax_err!(BadAddress, "no guest memory at the instruction pointer");
        }

        let insn = env.decoder.decode(&bytes[..len]).inspect_err(|e| {
            error!("failed to decode {:02x?} at {:?}: {:?}", &bytes[..len], gpa, e)
        })?;
        trace!("decoded {:x?} at {:?}", insn, gpa);
        Ok(insn)
    }
}
