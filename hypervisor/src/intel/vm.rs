//! Per-vCPU exit routing.
//!
//! A [`Vm`] owns everything one virtual CPU needs to handle its exits: the
//! VMCS accessor, the register snapshot and the virtualizers. Each
//! virtualizer claims its exit reasons in the [`ExitRegistry`] when it is
//! constructed; routing an exit is a lookup in that registry.

use {
    crate::{
        error::HypervisorError,
        intel::{
            capture::GuestRegisters,
            vmcs::VmcsAccess,
            vmerror::VmxBasicExitReason,
            vmexit::{ExitContext, cr::ControlRegisterHandler, external_interrupt::ExternalInterruptHandler},
        },
    },
    alloc::collections::BTreeMap,
    log::*,
};

/// Virtualizers an exit reason can be routed to.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Virtualizer {
    ControlRegister,
    ExternalInterrupt,
}

/// Exit reason to virtualizer routing table.
#[derive(Debug, Default)]
pub struct ExitRegistry {
    routes: BTreeMap<VmxBasicExitReason, Virtualizer>,
}

impl ExitRegistry {
    pub const fn new() -> Self {
        Self { routes: BTreeMap::new() }
    }

    /// Routes `reason` to `virtualizer`. A later registration for the same
    /// reason replaces the earlier one.
    pub fn register(&mut self, reason: VmxBasicExitReason, virtualizer: Virtualizer) {
        trace!("Routing {:?} exits to {:?}", reason, virtualizer);

        if let Some(previous) = self.routes.insert(reason, virtualizer) {
            warn!("{:?} exits were routed to {:?}, now to {:?}", reason, previous, virtualizer);
        }
    }

    pub fn lookup(&self, reason: VmxBasicExitReason) -> Option<Virtualizer> {
        self.routes.get(&reason).copied()
    }
}

/// Per-vCPU virtual machine state.
pub struct Vm<V: VmcsAccess> {
    /// Accessor for this vCPU's VMCS.
    pub vmcs: V,

    /// General-purpose registers saved/restored by the VM-entry/exit stubs.
    pub guest_registers: GuestRegisters,

    /// Control register virtualizer (CR0/CR4 writes, CR3 reads and writes).
    pub control_register: ControlRegisterHandler,

    /// External interrupt virtualizer.
    pub external_interrupt: ExternalInterruptHandler,

    exits: ExitRegistry,
}

impl<V: VmcsAccess> Vm<V> {
    /// Creates the vCPU state and brings up its virtualizers. Exiting stays
    /// disabled until a virtualizer's `enable_*` call.
    pub fn new(vmcs: V, guest_registers: GuestRegisters) -> Self {
        let mut exits = ExitRegistry::new();

        let control_register = ControlRegisterHandler::new(&mut exits);
        let external_interrupt = ExternalInterruptHandler::new(&mut exits);

        Self {
            vmcs,
            guest_registers,
            control_register,
            external_interrupt,
            exits,
        }
    }

    pub fn exits(&self) -> &ExitRegistry {
        &self.exits
    }

    /// Routes one VM-exit to the virtualizer registered for `reason`.
    ///
    /// `Ok(false)` means the virtualizer ran but nothing claimed the exit.
    pub fn handle_exit(&mut self, reason: VmxBasicExitReason) -> Result<bool, HypervisorError> {
        let Some(virtualizer) = self.exits.lookup(reason) else {
            return Err(HypervisorError::UnhandledVmExit);
        };

        let mut ctx = ExitContext::new(&mut self.vmcs, &mut self.guest_registers);

        match virtualizer {
            Virtualizer::ControlRegister => self.control_register.handle(&mut ctx),
            Virtualizer::ExternalInterrupt => self.external_interrupt.handle(&mut ctx),
        }
    }

    /// Dumps the logs of every virtualizer.
    pub fn dump_log(&self) {
        self.control_register.dump_log();
        self.external_interrupt.dump_log();
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::intel::vmcs::mock::MockVmcs,
        x86::vmx::vmcs::{guest, ro},
    };

    #[test]
    fn test_virtualizers_register_their_exits() {
        let vm = Vm::new(MockVmcs::default(), GuestRegisters::default());

        assert_eq!(vm.exits().lookup(VmxBasicExitReason::ControlRegisterAccesses), Some(Virtualizer::ControlRegister));
        assert_eq!(vm.exits().lookup(VmxBasicExitReason::ExternalInterrupt), Some(Virtualizer::ExternalInterrupt));
        assert_eq!(vm.exits().lookup(VmxBasicExitReason::Cpuid), None);
    }

    #[test]
    fn test_unrouted_exit() {
        let mut vm = Vm::new(MockVmcs::default(), GuestRegisters::default());
        assert_eq!(vm.handle_exit(VmxBasicExitReason::Hlt), Err(HypervisorError::UnhandledVmExit));
    }

    #[test]
    fn test_routes_cr_exit_with_guest_registers() {
        let vmcs = MockVmcs::default().with(ro::EXIT_QUALIFICATION, 0x313).with(guest::CR3, 0x7000);
        let mut vm = Vm::new(vmcs, GuestRegisters::default());

        vm.control_register.enable_rdcr3_exiting(&mut vm.vmcs);
        vm.control_register.add_rdcr3_handler(|_, _| true);

        assert_eq!(vm.handle_exit(VmxBasicExitReason::ControlRegisterAccesses), Ok(true));
        assert_eq!(vm.guest_registers.rbx, 0x7000);
    }

    #[test]
    fn test_later_registration_replaces_route() {
        let mut exits = ExitRegistry::new();
        exits.register(VmxBasicExitReason::ExternalInterrupt, Virtualizer::ControlRegister);
        exits.register(VmxBasicExitReason::ExternalInterrupt, Virtualizer::ExternalInterrupt);

        assert_eq!(exits.lookup(VmxBasicExitReason::ExternalInterrupt), Some(Virtualizer::ExternalInterrupt));
    }
}
