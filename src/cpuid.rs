//! The CPUID responses presented to a guest.

use raw_cpuid::CpuIdResult;

pub const LEAF_VENDOR: u32 = 0x0;
pub const LEAF_FEATURE_INFO: u32 = 0x1;
pub const LEAF_EXTENDED_BASE: u32 = 0x8000_0000;
pub const LEAF_BRAND_STRING_1: u32 = 0x8000_0002;
pub const LEAF_BRAND_STRING_2: u32 = 0x8000_0003;

const EMPTY: CpuIdResult = CpuIdResult {
    eax: 0,
    ebx: 0,
    ecx: 0,
    edx: 0,
};

/// Responses for the leaves a guest may query, built once when the guest is
/// created. Any other leaf is unsupported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuidTable {
    pub vendor: CpuIdResult,
    pub feature_info: CpuIdResult,
    pub extended_base: CpuIdResult,
    pub brand: [CpuIdResult; 2],
}

/// Packs up to 16 bytes of ASCII into the `eax, ebx, ecx, edx` order used by
/// the brand-string leaves.
fn pack_brand(bytes: &[u8]) -> CpuIdResult {
    let mut buf = [0u8; 16];
    let len = bytes.len().min(16);
    buf[..len].copy_from_slice(&bytes[..len]);
    let word = |i: usize| u32::from_le_bytes([buf[i], buf[i + 1], buf[i + 2], buf[i + 3]]);
    CpuIdResult {
        eax: word(0),
        ebx: word(4),
        ecx: word(8),
        edx: word(12),
    }
}

impl CpuidTable {
    /// Builds a table with the given 12-byte vendor id and up to 32 bytes of
    /// brand string. Feature flags are left empty.
    pub fn new(vendor: &[u8; 12], brand: &str) -> Self {
        let word = |i: usize| {
            u32::from_le_bytes([vendor[i], vendor[i + 1], vendor[i + 2], vendor[i + 3]])
        };
        let brand = brand.as_bytes();
        let split = brand.len().min(16);
        Self {
            // The vendor string is returned in ebx, edx, ecx order.
            vendor: CpuIdResult {
                eax: LEAF_FEATURE_INFO,
                ebx: word(0),
                ecx: word(8),
                edx: word(4),
            },
            feature_info: EMPTY,
            extended_base: CpuIdResult {
                eax: LEAF_BRAND_STRING_2,
                ..EMPTY
            },
            brand: [pack_brand(&brand[..split]), pack_brand(&brand[split..])],
        }
    }

    pub fn with_feature_info(mut self, feature_info: CpuIdResult) -> Self {
        self.feature_info = feature_info;
        self
    }

    /// Builds a table from the host processor, hiding SVM and advertising a
    /// hypervisor.
    #[cfg(target_arch = "x86_64")]
    pub fn from_host() -> Self {
        use bit_field::BitField;
        use raw_cpuid::cpuid;

        const FEATURE_HYPERVISOR: usize = 31;

        let mut vendor = cpuid!(LEAF_VENDOR);
        vendor.eax = vendor.eax.min(LEAF_FEATURE_INFO);
        let mut feature_info = cpuid!(LEAF_FEATURE_INFO);
        feature_info.ecx.set_bit(FEATURE_HYPERVISOR, true);
        let mut extended_base = cpuid!(LEAF_EXTENDED_BASE);
        extended_base.eax = extended_base.eax.min(LEAF_BRAND_STRING_2);
        extended_base.ebx = 0;
        extended_base.ecx = 0;
        extended_base.edx = 0;

        Self {
            vendor,
            feature_info,
            extended_base,
            brand: [cpuid!(LEAF_BRAND_STRING_1), cpuid!(LEAF_BRAND_STRING_2)],
        }
    }

    /// Response for `function`, or `None` if the leaf is not provided.
    pub fn lookup(&self, function: u32) -> Option<CpuIdResult> {
        match function {
            LEAF_VENDOR => Some(self.vendor),
            LEAF_FEATURE_INFO => Some(self.feature_info),
            LEAF_EXTENDED_BASE => Some(self.extended_base),
            LEAF_BRAND_STRING_1 => Some(self.brand[0]),
            LEAF_BRAND_STRING_2 => Some(self.brand[1]),
            _ => None,
        }
    }
}
