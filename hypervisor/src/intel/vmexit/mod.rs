//! VM-exit virtualizers and the plumbing they share.
//!
//! Every virtualizer receives an [`ExitContext`] for the duration of one exit:
//! the VMCS accessor plus the general-purpose registers saved by the exit
//! stub. Handlers registered into a [`chain::HandlerChain`] see the same
//! context.

use {
    crate::intel::{
        capture::{GPR_RSP, GuestRegisters},
        vmcs::VmcsAccess,
    },
    log::*,
    x86::vmx::vmcs::guest,
};

pub mod chain;
pub mod cr;
pub mod external_interrupt;

/// VMCS field encoding of the VM-exit instruction length.
pub const VM_EXIT_INSTRUCTION_LEN: u32 = 0x440C;

/// What the exit loop does once a VM-exit has been routed.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExitType {
    /// Resume the guest. Any RIP adjustment has already been applied.
    Continue,
    /// A fatal condition was raised, the hypervisor must not resume the guest.
    ExitHypervisor,
}

/// Live machine state of the exit being handled.
pub struct ExitContext<'a> {
    pub vmcs: &'a mut dyn VmcsAccess,
    pub registers: &'a mut GuestRegisters,
}

impl<'a> ExitContext<'a> {
    pub fn new(vmcs: &'a mut dyn VmcsAccess, registers: &'a mut GuestRegisters) -> Self {
        Self { vmcs, registers }
    }

    /// Emulated read of the GPR operand of the trapping instruction.
    pub fn emulate_rdgpr(&self, index: u64) -> u64 {
        match index & 0xF {
            GPR_RSP => self.vmcs.read(guest::RSP),
            _ => self.registers.gpr(index),
        }
    }

    /// Emulated write of the GPR operand of the trapping instruction.
    pub fn emulate_wrgpr(&mut self, index: u64, value: u64) {
        match index & 0xF {
            GPR_RSP => {
                self.registers.rsp = value;
                self.vmcs.write(guest::RSP, value);
            }
            _ => self.registers.set_gpr(index, value),
        }
    }

    /// Advances the guest's RIP past the trapping instruction.
    pub fn advance_rip(&mut self) {
        let instruction_length = self.vmcs.read(VM_EXIT_INSTRUCTION_LEN);
        let rip = self.vmcs.read(guest::RIP);

        // Instruction length must be 1 to 15 bytes
        let delta = if (1..=15).contains(&instruction_length) {
            instruction_length
        } else {
            #[cfg(feature = "vmware")]
            warn!("Invalid instruction length {} at RIP {:#x} - defaulting to 1", instruction_length, rip);
            #[cfg(not(feature = "vmware"))]
            error!("Invalid instruction length {} at RIP {:#x} - defaulting to 1", instruction_length, rip);
            1
        };

        let new_rip = rip.wrapping_add(delta);

        self.registers.rip = new_rip;
        self.vmcs.write(guest::RIP, new_rip);

        trace!("Advanced guest RIP {:#x} -> {:#x}", rip, new_rip);
    }
}

#[cfg(test)]
mod tests {
    use {super::*, crate::intel::vmcs::mock::MockVmcs};

    #[test]
    fn test_rsp_operand_goes_through_vmcs() {
        let mut vmcs = MockVmcs::default().with(guest::RSP, 0xFFFF_8000_0000_1000);
        let mut regs = GuestRegisters::default();
        let mut ctx = ExitContext::new(&mut vmcs, &mut regs);

        assert_eq!(ctx.emulate_rdgpr(4), 0xFFFF_8000_0000_1000);

        ctx.emulate_wrgpr(4, 0x2000);
        ctx.emulate_wrgpr(1, 0x3000);

        assert_eq!(vmcs.read(guest::RSP), 0x2000);
        assert_eq!(regs.rcx, 0x3000);
    }

    #[test]
    fn test_advance_rip() {
        let mut vmcs = MockVmcs::default().with(guest::RIP, 0x1000).with(VM_EXIT_INSTRUCTION_LEN, 3);
        let mut regs = GuestRegisters::default();

        ExitContext::new(&mut vmcs, &mut regs).advance_rip();

        assert_eq!(vmcs.read(guest::RIP), 0x1003);
        assert_eq!(regs.rip, 0x1003);
    }

    #[test]
    fn test_advance_rip_with_bogus_length() {
        let mut vmcs = MockVmcs::default().with(guest::RIP, 0x1000).with(VM_EXIT_INSTRUCTION_LEN, 0);
        let mut regs = GuestRegisters::default();

        ExitContext::new(&mut vmcs, &mut regs).advance_rip();

        assert_eq!(vmcs.read(guest::RIP), 0x1001);
    }
}
