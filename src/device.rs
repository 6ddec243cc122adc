//! Device-emulation backends for MMIO and port I/O.

use axerrno::AxResult;

use crate::mem::GuestPhysAddr;

/// Width of an emulated access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessWidth {
    Byte,
    Word,
    Dword,
    Qword,
}

impl AccessWidth {
    pub const fn size(self) -> usize {
        match self {
            Self::Byte => 1,
            Self::Word => 2,
            Self::Dword => 4,
            Self::Qword => 8,
        }
    }

    /// Mask selecting the low `size()` bytes of a value.
    pub const fn mask(self) -> u64 {
        match self {
            Self::Qword => u64::MAX,
            w => (1u64 << (w.size() * 8)) - 1,
        }
    }

    /// Stores `value` into a register that held `old`, the way a
    /// register-destination write of this width does on x86-64: 8- and
    /// 16-bit writes keep the untouched upper bits, 32-bit writes
    /// zero-extend.
    pub const fn merge_into(self, old: u64, value: u64) -> u64 {
        match self {
            Self::Byte | Self::Word => (old & !self.mask()) | (value & self.mask()),
            Self::Dword | Self::Qword => value & self.mask(),
        }
    }
}

impl TryFrom<usize> for AccessWidth {
    type Error = usize;

    fn try_from(size: usize) -> Result<Self, usize> {
        match size {
            1 => Ok(Self::Byte),
            2 => Ok(Self::Word),
            4 => Ok(Self::Dword),
            8 => Ok(Self::Qword),
            s => Err(s),
        }
    }
}

/// Byte order of an emulated MMIO access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Endianness {
    #[default]
    Little,
    Big,
}

/// Device models backing the regions and ports the guest traps on.
///
/// Implementations are invoked from the vCPU thread during exit handling and
/// must not block.
pub trait DeviceEmulator {
    /// Emulates a read of `width` bytes at a guest-physical MMIO address.
    fn emulate_mmio_read(
        &self,
        addr: GuestPhysAddr,
        width: AccessWidth,
        endianness: Endianness,
    ) -> AxResult<u64>;

    /// Emulates a write of the low `width` bytes of `value`.
    fn emulate_mmio_write(
        &self,
        addr: GuestPhysAddr,
        width: AccessWidth,
        value: u64,
        endianness: Endianness,
    ) -> AxResult;

    /// Emulates an `IN` instruction.
    fn emulate_io_read(&self, port: u16, width: AccessWidth, endianness: Endianness)
    -> AxResult<u32>;

    /// Emulates an `OUT` instruction.
    fn emulate_io_write(
        &self,
        port: u16,
        width: AccessWidth,
        value: u32,
        endianness: Endianness,
    ) -> AxResult;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_keeps_upper_bits_for_narrow_widths() {
        let old = 0xfedc_ba98_7654_3210;
        assert_eq!(AccessWidth::Byte.merge_into(old, 0xef), 0xfedc_ba98_7654_32ef);
        assert_eq!(AccessWidth::Word.merge_into(old, 0x1_abcd), 0xfedc_ba98_7654_abcd);
        assert_eq!(AccessWidth::Dword.merge_into(old, 0x1234_5678), 0x1234_5678);
        assert_eq!(AccessWidth::Qword.merge_into(old, 1), 1);
    }

    #[test]
    fn width_from_size() {
        assert_eq!(AccessWidth::try_from(2), Ok(AccessWidth::Word));
        assert_eq!(AccessWidth::try_from(3), Err(3));
        assert_eq!(AccessWidth::Dword.mask(), 0xffff_ffff);
    }
}
