mod definitions; // SvmExitCode / SvmExitReason
mod structs; // VmcbFrame / IOPm / MSRPm
mod translate; // gva_to_gpa / gpa_to_hpa
mod vcpu; // SvmVcpu
mod vmcb; // VMCB layout & #VMEXIT info
mod vmexit; // #VMEXIT dispatch & handlers

pub use self::definitions::{SvmExitCode, SvmExitReason};
pub use self::structs::{IOPm, MSRPm};
pub use self::vcpu::{
    EmergencyShutdown, GuestControlRegs, SvmCapabilities, SvmExitOutcome, SvmVcpu, VmExitEnv,
};
pub use self::vmcb::{SvmCrAccessInfo, SvmExitInfo, SvmIoExitInfo, VmcbStruct};

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        /// Return if current platform support virtualization extension.
        pub fn has_hardware_support() -> bool {
            raw_cpuid::CpuId::new()
                .get_extended_processor_and_feature_identifiers()
                .is_some_and(|ext| ext.has_svm())
        }
    } else {
        /// Return if current platform support virtualization extension.
        pub fn has_hardware_support() -> bool {
            false
        }
    }
}
