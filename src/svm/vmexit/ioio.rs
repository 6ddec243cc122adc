use axerrno::AxResult;

use crate::device::Endianness;
use crate::hal::SvmVCpuHal;
use crate::svm::vcpu::{SvmVcpu, VmExitEnv};
use crate::svm::vmcb::{SvmExitInfo, SvmIoExitInfo};

impl<H: SvmVCpuHal> SvmVcpu<H> {
    /// `IN`/`OUT` through the accumulator. String and `REP` forms are
    /// emulated as a single access.
    pub(super) fn handle_ioio(&mut self, exit_info: &SvmExitInfo, env: &VmExitEnv) -> AxResult {
        let io = SvmIoExitInfo::decode(exit_info.exit_info_1);
        trace!("VM exit: IOIO {:x?}", io);
        if io.is_string || io.is_repeat {
            debug!(
                "port {:#x}: string={} rep={} segment={} handled as one access",
                io.port, io.is_string, io.is_repeat, io.segment
            );
        }

        if io.is_in {
            let value = env
                .devices
                .emulate_io_read(io.port, io.access_width, Endianness::Little)
                .inspect_err(|e| {
                    error!("IN {:?} from port {:#x} failed: {:?}", io.access_width, io.port, e)
                })?;
            let rax = io.access_width.merge_into(self.gpr(0)?, value as u64);
            self.set_gpr(0, rax)?;
        } else {
            let value = (self.gpr(0)? & io.access_width.mask()) as u32;
            env.devices
                .emulate_io_write(io.port, io.access_width, value, Endianness::Little)
                .inspect_err(|e| {
                    error!("OUT {:?} to port {:#x} failed: {:?}", io.access_width, io.port, e)
                })?;
        }

        // EXITINFO2 holds the RIP of the following instruction.
        self.set_rip(exit_info.exit_info_2);
        Ok(())
    }
}
