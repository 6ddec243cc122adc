//! Guest address translation.

use alloc::boxed::Box;

use axerrno::AxError;
use tock_registers::interfaces::{Readable, Writeable};
use x86_64::registers::control::Cr0Flags;

use super::*;
use crate::mem::{GuestVirtAddr, write_host_u32};
use crate::svm::{SvmExitOutcome, VmExitEnv};

/// Loads the guest CR0 the way the guest would, through an intercepted
/// `MOV CR0, RBX` with decode assists.
fn load_guest_cr0(vcpu: &mut SvmVcpu<MockHal>, cr0: Cr0Flags) {
    let shutdown = ShutdownCounter::default();
    vcpu.set_shutdown_handler(Box::new(shutdown.clone()));
    vcpu.regs_mut().rbx = cr0.bits();
    let ct = &vcpu.vmcb().control;
    ct.exit_code.set(0x10);
    ct.exit_info_1.set((1 << 63) | 3);
    ct.next_rip.set(vcpu.rip());

    let mem = MockGuestMemory::default();
    let decoder = MockDecoder::unused();
    let devices = MockDevices::default();
    let env = VmExitEnv {
        guest: &mem,
        decoder: &decoder,
        devices: &devices,
    };
    assert_eq!(vcpu.handle_vmexit(&env), SvmExitOutcome::Resumed);
    assert_eq!(shutdown.count(), 0);
}

fn assisted_vcpu() -> SvmVcpu<MockHal> {
    new_vcpu(SvmCapabilities {
        decode_assist: true,
        next_rip: true,
    })
}

#[test]
fn real_mode_adds_the_code_segment_base() {
    let vcpu = assisted_vcpu();
    assert_eq!(
        vcpu.gva_to_gpa(GuestVirtAddr::from(0xfff0)).unwrap(),
        GuestPhysAddr::from(0xf_fff0)
    );

    // The segment is taken from the live VMCB, not from the entry point.
    vcpu.vmcb().state.cs.selector.set(0x07c0);
    assert_eq!(
        vcpu.gva_to_gpa(GuestVirtAddr::from(0x10)).unwrap(),
        GuestPhysAddr::from(0x7c10)
    );
}

#[test]
fn protected_mode_without_paging_is_identity() {
    let mut vcpu = assisted_vcpu();
    load_guest_cr0(&mut vcpu, Cr0Flags::PROTECTED_MODE_ENABLE | Cr0Flags::EXTENSION_TYPE);
    assert_eq!(
        vcpu.gva_to_gpa(GuestVirtAddr::from(0x12_3456)).unwrap(),
        GuestPhysAddr::from(0x12_3456)
    );
}

#[test]
fn guest_paging_is_unsupported() {
    let mut vcpu = assisted_vcpu();
    load_guest_cr0(
        &mut vcpu,
        Cr0Flags::PROTECTED_MODE_ENABLE | Cr0Flags::PAGING | Cr0Flags::EXTENSION_TYPE,
    );
    assert_eq!(
        vcpu.gva_to_gpa(GuestVirtAddr::from(0x1000)),
        Err(AxError::Unsupported)
    );
}

#[test]
fn gpa_to_hpa_follows_the_shadow_table() {
    let mut vcpu = assisted_vcpu();
    vcpu.shadow_page_table_mut()
        .map_page(GuestVirtAddr::from(0x8000), HostPhysAddr::from(0x3000_0000))
        .unwrap();
    assert_eq!(
        vcpu.gpa_to_hpa(GuestPhysAddr::from(0x8123)).unwrap(),
        HostPhysAddr::from(0x3000_0123)
    );
    // Same directory entry, no table entry.
    assert_eq!(
        vcpu.gpa_to_hpa(GuestPhysAddr::from(0x9000)),
        Err(AxError::NotFound)
    );
}

#[test]
fn absent_directory_entry_is_not_followed() {
    let vcpu = assisted_vcpu();
    let root = vcpu.shadow_page_table().root_paddr();
    // Not present, but the frame bits point outside mock memory: following
    // them would panic in `phys_to_virt`.
    unsafe { write_host_u32::<MockHal>(root, 0xdead_0000) };
    assert_eq!(vcpu.gpa_to_hpa(GuestPhysAddr::from(0x42)), Err(AxError::NotFound));
    assert_eq!(vcpu.vmcb().state.cr3.get(), root.as_usize() as u64);
}
