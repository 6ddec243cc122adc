//! The instruction decoder seam.
//!
//! Exits without decode assists (MMIO page faults, CR accesses on older
//! parts) carry no operand information, so the faulting instruction is
//! fetched from guest memory and handed to an external decoder.

use axerrno::AxResult;

use crate::device::AccessWidth;
use crate::mem::GuestPhysAddr;

/// Longest legal x86 instruction.
pub const MAX_INSN_LEN: usize = 15;

/// An operand of a decoded `MOV`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MovOperand {
    /// A general-purpose register, by architectural number.
    Register(u8),
    /// A memory operand, already resolved to its guest-physical address.
    Memory(GuestPhysAddr),
    Immediate(u64),
}

/// An operand of a decoded `MOV` to or from a control register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrOperand {
    Gpr(u8),
    Cr(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsnKind {
    Mov {
        src: MovOperand,
        dst: MovOperand,
        width: AccessWidth,
    },
    MovCr {
        src: CrOperand,
        dst: CrOperand,
    },
    /// Anything the exit handlers do not emulate.
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedInstruction {
    pub kind: InsnKind,
    /// Encoded length in bytes, used to advance `RIP`.
    pub length: u8,
}

/// Decodes one instruction from the start of `bytes`.
///
/// `bytes` holds up to [`MAX_INSN_LEN`] bytes fetched at the guest `RIP`; it
/// may be shorter near the end of guest memory.
pub trait InstructionDecoder {
    fn decode(&self, bytes: &[u8]) -> AxResult<DecodedInstruction>;
}
