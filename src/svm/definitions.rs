//! SVM #VMEXIT codes.
//!
//! Reference: AMD64 APM Vol.2, Appendix C "SVM Intercept Exit Codes".

#![allow(non_camel_case_types)]

use core::ops::Range;

numeric_enum_macro::numeric_enum! {
#[repr(u64)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
/// Exit codes of the intercepts that are not parameterized by a register
/// number or exception vector.
pub enum SvmExitCode {
    INTR = 0x60,
    NMI = 0x61,
    SMI = 0x62,
    INIT = 0x63,
    VINTR = 0x64,
    CR0_SEL_WRITE = 0x65,
    IDTR_READ = 0x66,
    GDTR_READ = 0x67,
    LDTR_READ = 0x68,
    TR_READ = 0x69,
    IDTR_WRITE = 0x6a,
    GDTR_WRITE = 0x6b,
    LDTR_WRITE = 0x6c,
    TR_WRITE = 0x6d,
    RDTSC = 0x6e,
    RDPMC = 0x6f,
    PUSHF = 0x70,
    POPF = 0x71,
    CPUID = 0x72,
    RSM = 0x73,
    IRET = 0x74,
    SWINT = 0x75,
    INVD = 0x76,
    PAUSE = 0x77,
    HLT = 0x78,
    INVLPG = 0x79,
    INVLPGA = 0x7a,
    IOIO = 0x7b,
    MSR = 0x7c,
    TASK_SWITCH = 0x7d,
    FERR_FREEZE = 0x7e,
    SHUTDOWN = 0x7f,
    VMRUN = 0x80,
    VMMCALL = 0x81,
    VMLOAD = 0x82,
    VMSAVE = 0x83,
    STGI = 0x84,
    CLGI = 0x85,
    SKINIT = 0x86,
    RDTSCP = 0x87,
    ICEBP = 0x88,
    WBINVD = 0x89,
    MONITOR = 0x8a,
    MWAIT = 0x8b,
    MWAIT_CONDITIONAL = 0x8c,
    XSETBV = 0x8d,
    RDPRU = 0x8e,
    EFER_WRITE_TRAP = 0x8f,
    NPF = 0x400,
    INVALID = 0xffff_ffff_ffff_ffff,
}
}

const CR_READ: Range<u64> = 0x00..0x10;
const CR_WRITE: Range<u64> = 0x10..0x20;
const DR_READ: Range<u64> = 0x20..0x30;
const DR_WRITE: Range<u64> = 0x30..0x40;
const EXCEPTION: Range<u64> = 0x40..0x60;

/// A decoded #VMEXIT reason.
///
/// Exit codes come in contiguous runs for the 16 control registers, the 16
/// debug registers and the 32 exception vectors. Those runs are split into a
/// tag and the index within the run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SvmExitReason {
    CrRead(u8),
    CrWrite(u8),
    DrRead(u8),
    DrWrite(u8),
    Exception(u8),
    Code(SvmExitCode),
}

impl SvmExitReason {
    /// Decodes a raw exit code. Codes outside every known run are handed
    /// back as `Err`.
    pub fn decode(raw: u64) -> Result<Self, u64> {
        let index = |run: Range<u64>| (raw - run.start) as u8;
        Ok(match raw {
            r if CR_READ.contains(&r) => Self::CrRead(index(CR_READ)),
            r if CR_WRITE.contains(&r) => Self::CrWrite(index(CR_WRITE)),
            r if DR_READ.contains(&r) => Self::DrRead(index(DR_READ)),
            r if DR_WRITE.contains(&r) => Self::DrWrite(index(DR_WRITE)),
            r if EXCEPTION.contains(&r) => Self::Exception(index(EXCEPTION)),
            r => Self::Code(SvmExitCode::try_from(r)?),
        })
    }
}

/// Mnemonics of the 32 exception vectors, used in diagnostics.
pub(crate) const EXCEPTION_NAMES: [&str; 32] = [
    "#DE", "#DB", "NMI", "#BP", "#OF", "#BR", "#UD", "#NM", "#DF", "CSO", "#TS", "#NP", "#SS",
    "#GP", "#PF", "RSV", "#MF", "#AC", "#MC", "#XF", "#VE", "#CP", "RSV", "RSV", "RSV", "RSV",
    "RSV", "RSV", "#HV", "#VC", "#SX", "RSV",
];
