//! Event injection through the VM-entry interruption-information field.

use {
    crate::intel::{vmcs::VmcsAccess, vmerror::InterruptionType},
    bitfield::bitfield,
    x86::vmx::vmcs,
};

bitfield! {
    /// Represents the VM-Entry Interruption-Information Field.
    ///
    /// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: Table 25-17. Format of the VM-Entry Interruption-Information Field
    pub struct EventInjection(u32);

    impl Debug;

    /// Vector of interrupt or exception
    pub get_vector, set_vector: 7, 0;

    /// Interruption type (see `InterruptionType`)
    pub get_type, set_type: 10, 8;

    /// Deliver error code (0 = do not deliver; 1 = deliver)
    pub get_deliver_error_code, set_deliver_error_code: 11, 11;

    // Reserved: 30:12

    /// Valid
    pub get_valid, set_valid: 31, 31;
}

const VALID: u32 = 1;

/// #GP
const GENERAL_PROTECTION_FAULT: u32 = 13;

impl EventInjection {
    fn new(vector: u32, interruption_type: InterruptionType) -> Self {
        let mut event = EventInjection(0);

        event.set_vector(vector);
        event.set_type(interruption_type as u32);
        event.set_valid(VALID);

        event
    }

    /// Injects an external interrupt into the guest on the next VM-entry.
    ///
    /// Used to hand an interrupt acknowledged on exit back to the guest.
    ///
    /// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 27.6 EVENT INJECTION
    pub fn inject_external_interrupt(vmcs: &mut dyn VmcsAccess, vector: u8) {
        let event = EventInjection::new(vector as u32, InterruptionType::ExternalInterrupt);

        log::trace!("Injecting external interrupt vector={}: info={:#x}", vector, event.0);

        vmcs.write(vmcs::control::VMENTRY_INTERRUPTION_INFO_FIELD, event.0 as u64);
    }

    /// Injects a general protection fault (#GP) with `error_code` into the guest.
    pub fn vmentry_inject_gp(vmcs: &mut dyn VmcsAccess, error_code: u32) {
        let mut event = EventInjection::new(GENERAL_PROTECTION_FAULT, InterruptionType::HardwareException);
        event.set_deliver_error_code(1);

        log::debug!("Injecting #GP: info={:#x} error_code={:#x}", event.0, error_code);

        vmcs.write(vmcs::control::VMENTRY_EXCEPTION_ERR_CODE, error_code as u64);
        vmcs.write(vmcs::control::VMENTRY_INTERRUPTION_INFO_FIELD, event.0 as u64);
    }
}
