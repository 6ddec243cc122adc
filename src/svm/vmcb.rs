// VMCB layout and #VMEXIT information decoding.
//
// A VMCB is a single 4 KiB page: the control area at offset 0x000 and the
// state-save area at offset 0x400. Every field sits at a fixed offset, so it
// is accessed with plain loads and stores through tock-registers proxies.
//
// Reference: AMD64 APM Vol.2, Appendix B "Layout of VMCB".

#![allow(non_camel_case_types)]
#![allow(non_snake_case)]

use bit_field::BitField;
use tock_registers::interfaces::{Readable, Writeable};
use tock_registers::registers::ReadWrite;
use tock_registers::{register_bitfields, register_structs};

use super::definitions::SvmExitReason;
use crate::device::AccessWidth;

register_bitfields![u32,
    pub InterceptCrRw [
        READ_CR0   0,  READ_CR3   3,  READ_CR4   4,
        WRITE_CR0 16,  WRITE_CR3 19,  WRITE_CR4 20,
    ],

    pub InterceptExceptions [
        DE 0, DB 1, BP 3, UD 6, DF 8, GP 13, PF 14, MC 18,
    ],

    pub InterceptVec3 [
        INTR       0,  NMI        1,  SMI        2,  INIT       3,
        PUSHF     16,  POPF      17,  CPUID     18,  RSM       19,
        IRET      20,  SWINT     21,  INVD      22,  HLT       24,
        IOIO_PROT 27,  MSR_PROT  28,  SHUTDOWN  31,
    ],

    pub InterceptVec4 [
        VMRUN    0,  VMMCALL  1,  VMLOAD   2,  VMSAVE   3,
        STGI     4,  CLGI     5,  SKINIT   6,
    ],

    pub VmcbCleanBits [
        INTERCEPTS 0,  IOPM 1,  ASID 2,  TPR 3,  NP 4,  CRx 5,
        DRx        6,  DT   7,  SEG  8,  CR2 9,
    ],
];

register_bitfields![u64,
    pub NestedCtl [
        NP_ENABLE 0,
    ],
];

register_bitfields![u8,
    pub VmcbTlbControl [
        CONTROL OFFSET(0) NUMBITS(3) [
            DoNothing = 0,
            FlushAllOnVmrun = 1,
            FlushGuestTlb = 3,
            FlushGuestNonGlobalTlb = 7,
        ]
    ]
];

register_structs![
    pub VmcbControlArea {
        (0x0000 => pub intercept_cr:         ReadWrite<u32, InterceptCrRw::Register>),
        (0x0004 => pub intercept_dr:         ReadWrite<u32>),
        (0x0008 => pub intercept_exceptions: ReadWrite<u32, InterceptExceptions::Register>),
        (0x000C => pub intercept_vector3:    ReadWrite<u32, InterceptVec3::Register>),
        (0x0010 => pub intercept_vector4:    ReadWrite<u32, InterceptVec4::Register>),
        (0x0014 => pub intercept_vector5:    ReadWrite<u32>),
        (0x0018 => _reserved_0018),
        (0x0040 => pub iopm_base_pa:         ReadWrite<u64>),
        (0x0048 => pub msrpm_base_pa:        ReadWrite<u64>),
        (0x0050 => pub tsc_offset:           ReadWrite<u64>),
        (0x0058 => pub guest_asid:           ReadWrite<u32>),
        (0x005C => pub tlb_control:          ReadWrite<u8, VmcbTlbControl::Register>),
        (0x005D => _reserved_005D),
        (0x0060 => pub int_control:          ReadWrite<u32>),
        (0x0064 => pub int_vector:           ReadWrite<u32>),
        (0x0068 => pub int_state:            ReadWrite<u32>),
        (0x006C => _reserved_006C),
        (0x0070 => pub exit_code:            ReadWrite<u64>),
        (0x0078 => pub exit_info_1:          ReadWrite<u64>),
        (0x0080 => pub exit_info_2:          ReadWrite<u64>),
        (0x0088 => pub exit_int_info:        ReadWrite<u32>),
        (0x008C => pub exit_int_info_err:    ReadWrite<u32>),
        (0x0090 => pub nested_ctl:           ReadWrite<u64, NestedCtl::Register>),
        (0x0098 => _reserved_0098),
        (0x00A8 => pub event_inj:            ReadWrite<u32>),
        (0x00AC => pub event_inj_err:        ReadWrite<u32>),
        (0x00B0 => pub nested_cr3:           ReadWrite<u64>),
        (0x00B8 => pub virt_ext:             ReadWrite<u64>),
        (0x00C0 => pub clean_bits:           ReadWrite<u32, VmcbCleanBits::Register>),
        (0x00C4 => _reserved_00C4),
        (0x00C8 => pub next_rip:             ReadWrite<u64>),
        (0x00D0 => pub insn_len:             ReadWrite<u8>),
        (0x00D1 => pub insn_bytes:           [ReadWrite<u8>; 15]),
        (0x00E0 => _reserved_00E0),
        (0x0400 => @END),
    }
];

register_structs![
    pub VmcbSegment {
        (0x0 => pub selector: ReadWrite<u16>),
        (0x2 => pub attr:     ReadWrite<u16>),
        (0x4 => pub limit:    ReadWrite<u32>),
        (0x8 => pub base:     ReadWrite<u64>),
        (0x10 => @END),
    }
];

register_structs![
    pub VmcbStateSaveArea {
        (0x0000 => pub es:   VmcbSegment),
        (0x0010 => pub cs:   VmcbSegment),
        (0x0020 => pub ss:   VmcbSegment),
        (0x0030 => pub ds:   VmcbSegment),
        (0x0040 => pub fs:   VmcbSegment),
        (0x0050 => pub gs:   VmcbSegment),
        (0x0060 => pub gdtr: VmcbSegment),
        (0x0070 => pub ldtr: VmcbSegment),
        (0x0080 => pub idtr: VmcbSegment),
        (0x0090 => pub tr:   VmcbSegment),
        (0x00A0 => _reserved_00A0),
        (0x00CB => pub cpl:  ReadWrite<u8>),
        (0x00CC => _reserved_00CC),
        (0x00D0 => pub efer: ReadWrite<u64>),
        (0x00D8 => _reserved_00D8),
        (0x0148 => pub cr4:    ReadWrite<u64>),
        (0x0150 => pub cr3:    ReadWrite<u64>),
        (0x0158 => pub cr0:    ReadWrite<u64>),
        (0x0160 => pub dr7:    ReadWrite<u64>),
        (0x0168 => pub dr6:    ReadWrite<u64>),
        (0x0170 => pub rflags: ReadWrite<u64>),
        (0x0178 => pub rip:    ReadWrite<u64>),
        (0x0180 => _reserved_0180),
        (0x01D8 => pub rsp:    ReadWrite<u64>),
        (0x01E0 => _reserved_01E0),
        (0x01F8 => pub rax:    ReadWrite<u64>),
        (0x0200 => _reserved_0200),
        (0x0240 => pub cr2:    ReadWrite<u64>),
        (0x0248 => _reserved_0248),
        (0x0268 => pub g_pat:  ReadWrite<u64>),
        (0x0270 => _reserved_0270),
        (0x0C00 => @END),
    }
];

register_structs![
    pub VmcbStruct {
        (0x0000 => pub control: VmcbControlArea),
        (0x0400 => pub state:   VmcbStateSaveArea),
        (0x1000 => @END),
    }
];

/// Loads a real-mode segment: base = selector << 4, 64 KiB limit.
pub fn set_vmcb_segment(seg: &VmcbSegment, selector: u16, attr: u16) {
    seg.selector.set(selector);
    seg.base.set((selector as u64) << 4);
    seg.limit.set(0xffff);
    seg.attr.set(attr);
}

/// Snapshot of the fields describing one #VMEXIT. Taken once, never mutated.
#[derive(Debug, Clone, Copy)]
pub struct SvmExitInfo {
    pub raw_exit_code: u64,
    pub exit_reason: Result<SvmExitReason, u64>,
    pub exit_info_1: u64,
    pub exit_info_2: u64,
    pub guest_rip: u64,
    pub guest_next_rip: u64,
}

impl VmcbStruct {
    pub fn exit_info(&self) -> SvmExitInfo {
        let raw_exit_code = self.control.exit_code.get();
        SvmExitInfo {
            raw_exit_code,
            exit_reason: SvmExitReason::decode(raw_exit_code),
            exit_info_1: self.control.exit_info_1.get(),
            exit_info_2: self.control.exit_info_2.get(),
            guest_rip: self.state.rip.get(),
            guest_next_rip: self.control.next_rip.get(),
        }
    }
}

/// EXITINFO1 of an `IOIO` intercept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SvmIoExitInfo {
    pub port: u16,
    pub is_in: bool,
    pub is_string: bool,
    pub is_repeat: bool,
    pub access_width: AccessWidth,
    /// Effective segment of a string instruction (0 = ES .. 5 = GS).
    pub segment: u8,
}

impl SvmIoExitInfo {
    pub fn decode(exit_info_1: u64) -> Self {
        let access_width = if exit_info_1.get_bit(4) {
            AccessWidth::Byte
        } else if exit_info_1.get_bit(5) {
            AccessWidth::Word
        } else {
            AccessWidth::Dword
        };
        Self {
            port: exit_info_1.get_bits(16..32) as u16,
            is_in: exit_info_1.get_bit(0),
            is_string: exit_info_1.get_bit(2),
            is_repeat: exit_info_1.get_bit(3),
            access_width,
            segment: exit_info_1.get_bits(10..13) as u8,
        }
    }
}

/// EXITINFO1 of a `MOV CRx` intercept when decode assists are available.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SvmCrAccessInfo {
    /// The GPR operand; `None` when the hardware did not provide decode
    /// information for this exit (e.g. CLTS, LMSW).
    pub gpr: Option<u8>,
}

impl SvmCrAccessInfo {
    const VALID_BIT: usize = 63;

    pub fn decode(exit_info_1: u64) -> Self {
        let gpr = exit_info_1
            .get_bit(Self::VALID_BIT)
            .then(|| exit_info_1.get_bits(0..4) as u8);
        Self { gpr }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn vmcb_size_check() {
        use core::mem::size_of;

        assert_eq!(size_of::<VmcbControlArea>(), 0x400);
        assert_eq!(size_of::<VmcbStateSaveArea>(), 0xC00);
        assert_eq!(size_of::<VmcbStruct>(), 0x1000);
    }

    #[test]
    fn vmcb_offset_check() {
        use memoffset::offset_of;

        assert_eq!(offset_of!(VmcbStruct, control), 0x0000);
        assert_eq!(offset_of!(VmcbStruct, state), 0x0400);

        macro_rules! assert_ctrl {
            ($($field:ident = $offset:expr),* $(,)?) => {
                $(assert_eq!(offset_of!(VmcbControlArea, $field), $offset, stringify!($field));)*
            };
        }
        macro_rules! assert_save {
            ($($field:ident = $offset:expr),* $(,)?) => {
                $(assert_eq!(offset_of!(VmcbStateSaveArea, $field), $offset, stringify!($field));)*
            };
        }

        assert_ctrl!(
            intercept_cr = 0x00,
            intercept_exceptions = 0x08,
            intercept_vector3 = 0x0C,
            intercept_vector4 = 0x10,
            iopm_base_pa = 0x40,
            msrpm_base_pa = 0x48,
            guest_asid = 0x58,
            tlb_control = 0x5C,
            exit_code = 0x70,
            exit_info_1 = 0x78,
            exit_info_2 = 0x80,
            nested_ctl = 0x90,
            nested_cr3 = 0xB0,
            clean_bits = 0xC0,
            next_rip = 0xC8,
            insn_len = 0xD0,
            insn_bytes = 0xD1,
        );
        assert_save!(
            cs = 0x10,
            tr = 0x90,
            efer = 0xD0,
            cr3 = 0x150,
            cr0 = 0x158,
            rflags = 0x170,
            rip = 0x178,
            rsp = 0x1D8,
            rax = 0x1F8,
            cr2 = 0x240,
            g_pat = 0x268,
        );
    }

    #[test]
    fn io_exit_info_decode() {
        // IN AX, DX with DX = 0x3f8
        let info = SvmIoExitInfo::decode((0x3f8 << 16) | (1 << 5) | 1);
        assert_eq!(info.port, 0x3f8);
        assert!(info.is_in);
        assert!(!info.is_string);
        assert_eq!(info.access_width, AccessWidth::Word);

        // REP OUTSB through DS
        let info = SvmIoExitInfo::decode((0x80 << 16) | (3 << 10) | (1 << 4) | (1 << 3) | (1 << 2));
        assert_eq!(info.port, 0x80);
        assert!(!info.is_in);
        assert!(info.is_string && info.is_repeat);
        assert_eq!(info.access_width, AccessWidth::Byte);
        assert_eq!(info.segment, 3);

        let info = SvmIoExitInfo::decode(0x71 << 16);
        assert_eq!(info.access_width, AccessWidth::Dword);
    }

    #[test]
    fn cr_access_info_decode() {
        assert_eq!(SvmCrAccessInfo::decode((1 << 63) | 3).gpr, Some(3));
        assert_eq!(SvmCrAccessInfo::decode(3).gpr, None);
    }
}
