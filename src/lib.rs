#![cfg_attr(not(test), no_std)]
#![doc = include_str!("../README.md")]

#[macro_use]
extern crate log;

extern crate alloc;

mod cpuid;
mod decode;
mod device;
mod frame;
mod guest;
mod hal;
mod mem;
mod page_table;
mod regs;
mod shadow;
mod svm;

#[cfg(test)]
mod tests;

pub use cpuid::CpuidTable;
pub use decode::{
    CrOperand, DecodedInstruction, InsnKind, InstructionDecoder, MAX_INSN_LEN, MovOperand,
};
pub use device::{AccessWidth, DeviceEmulator, Endianness};
pub use guest::{
    CmosMemoryLayout, CmosRtc, GuestMemory, GuestRegion, RegionFlags, RegionSpace, SvmGuest, cmos,
};
pub use hal::SvmVCpuHal;
pub use mem::{GuestPhysAddr, GuestVirtAddr, HostPhysAddr, HostVirtAddr};
pub use page_table::{Legacy32Entry, Legacy32Flags};
pub use regs::{Cr0Diff, GeneralRegisters, GeneralRegistersDiff};
pub use shadow::{SHADOW_POOL_PAGES, ShadowPageTable};
pub use svm::{
    EmergencyShutdown, GuestControlRegs, IOPm, MSRPm, SvmCapabilities, SvmCrAccessInfo,
    SvmExitCode, SvmExitInfo, SvmExitOutcome, SvmExitReason, SvmIoExitInfo, SvmVcpu, VmExitEnv,
    VmcbStruct, has_hardware_support,
};
