//! VM-exit entry point.
//!
//! Reads the exit reason of the current exit, routes it through the vCPU's
//! [`Vm`], and turns the result into what the exit loop does next. Every
//! exit is resolved here: either the guest resumes with consistent state or
//! the hypervisor stops.

use {
    crate::{
        error::HypervisorError,
        intel::{
            vm::Vm,
            vmcs::VmcsAccess,
            vmerror::{ControlRegAccessExitQualification, VmxBasicExitReason},
            vmexit::ExitType,
        },
    },
    log::*,
    x86::vmx::vmcs::{guest, ro},
};

/// Central VM-exit dispatcher.
///
/// Claimed exits resume the guest. Unclaimed control register accesses,
/// unclaimed interrupts and exits nothing is registered for all stop the
/// hypervisor: resuming would leave the trapped access unresolved.
pub fn handle_vmexit<V: VmcsAccess>(vm: &mut Vm<V>) -> ExitType {
    let exit_reason = vm.vmcs.read(ro::EXIT_REASON) as u32;

    let result = VmxBasicExitReason::from_u32(exit_reason)
        .ok_or(HypervisorError::UnknownVMExitReason(exit_reason))
        .and_then(|reason| route(vm, reason));

    match result {
        Ok(()) => ExitType::Continue,
        Err(err) => {
            error!("Fatal VM exit: {}", err);
            error!("  Exit reason: {:#x}", exit_reason);
            error!("  Exit qualification: {:#x}", vm.vmcs.read(ro::EXIT_QUALIFICATION));
            error!("  Guest RIP: {:#x}", vm.vmcs.read(guest::RIP));
            ExitType::ExitHypervisor
        }
    }
}

fn route<V: VmcsAccess>(vm: &mut Vm<V>, reason: VmxBasicExitReason) -> Result<(), HypervisorError> {
    trace!("VM exit: {:?}", reason);

    if vm.handle_exit(reason)? {
        return Ok(());
    }

    // Only the control register virtualizer reports an unclaimed exit
    // instead of failing itself.
    let qualification = vm.vmcs.read(ro::EXIT_QUALIFICATION);
    let cr = ControlRegAccessExitQualification::from_exit_qualification(qualification)?;

    Err(HypervisorError::UnclaimedControlRegisterAccess {
        cr: cr.control_reg,
        access: cr.access_type,
    })
}

/// Handles one VM-exit and stops the hypervisor if it cannot be resolved.
///
/// # Panics
///
/// Panics when the exit is fatal (see [`handle_vmexit`]). The panic handler
/// of the hypervisor image halts the processor.
pub fn vmexit<V: VmcsAccess>(vm: &mut Vm<V>) {
    if handle_vmexit(vm) == ExitType::ExitHypervisor {
        vm.dump_log();

        // Already dumped; keep unwinding drops quiet.
        vm.control_register.disable_log();
        vm.external_interrupt.disable_log();

        panic!("Unrecoverable VM exit, stopping the hypervisor");
    }
}
