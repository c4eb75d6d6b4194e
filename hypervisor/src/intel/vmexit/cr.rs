//! Control register access virtualization.
//!
//! Traps guest writes to CR0/CR4 (through the guest/host masks), and reads
//! and writes of CR3 (through the CR3-store/CR3-load exiting controls), then
//! lets registered handlers decide the value the guest ends up with.
//!
//! Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 26.1.3 Instructions That Cause VM Exits Conditionally

use {
    crate::{
        error::HypervisorError,
        intel::{
            events::EventInjection,
            vmcs::VmcsAccess,
            vmerror::{ControlRegAccessExitQualification, CrAccessReg, CrAccessType, VmxBasicExitReason},
            vm::{ExitRegistry, Virtualizer},
            vmexit::{ExitContext, chain::HandlerChain},
        },
    },
    alloc::{string::String, vec::Vec},
    core::fmt::{self, Write},
    log::*,
    x86::vmx::vmcs::{
        control::{self, PrimaryControls},
        guest, ro,
    },
    x86_64::registers::control::Cr4Flags,
};

/// Per-exit descriptor handed to every control register handler.
///
/// Built by [`ControlRegisterHandler::handle`] with these defaults:
///
/// | exit      | `value`               | `shadow`               |
/// |-----------|-----------------------|------------------------|
/// | write CR0 | source GPR            | `CR0_READ_SHADOW`      |
/// | read CR3  | guest CR3             | 0                      |
/// | write CR3 | source GPR            | 0                      |
/// | write CR4 | source GPR            | `CR4_READ_SHADOW`      |
///
/// Handlers may overwrite any subset of the fields before returning `true`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CrInfo {
    /// Value (in/out)
    pub value: u64,

    /// Read shadow to install (out). Only used for CR0 and CR4 writes.
    pub shadow: u64,

    /// Set if the handler already updated the guest register state itself.
    pub ignore_write: bool,

    /// Set if the handler already advanced the guest RIP itself.
    pub ignore_advance: bool,
}

impl CrInfo {
    fn new(value: u64, shadow: u64) -> Self {
        Self {
            value,
            shadow,
            ignore_write: false,
            ignore_advance: false,
        }
    }
}

/// One entry of a per-register exit log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrRecord {
    pub value: u64,
    pub shadow: u64,
}

impl From<&CrInfo> for CrRecord {
    fn from(info: &CrInfo) -> Self {
        Self {
            value: info.value,
            shadow: info.shadow,
        }
    }
}

pub struct ControlRegisterHandler {
    wrcr0_handlers: HandlerChain<CrInfo>,
    rdcr3_handlers: HandlerChain<CrInfo>,
    wrcr3_handlers: HandlerChain<CrInfo>,
    wrcr4_handlers: HandlerChain<CrInfo>,

    cr0_log: Vec<CrRecord>,
    cr3_log: Vec<CrRecord>,
    cr4_log: Vec<CrRecord>,

    log_enabled: bool,
}

impl ControlRegisterHandler {
    /// Creates the virtualizer and routes `ControlRegisterAccesses` exits to it.
    ///
    /// No exiting is enabled and every chain starts empty.
    ///
    /// # Arguments
    ///
    /// * `exits` - The exit-reason registry of the vCPU that owns this virtualizer.
    pub fn new(exits: &mut ExitRegistry) -> Self {
        exits.register(VmxBasicExitReason::ControlRegisterAccesses, Virtualizer::ControlRegister);

        Self {
            wrcr0_handlers: HandlerChain::new(),
            rdcr3_handlers: HandlerChain::new(),
            wrcr3_handlers: HandlerChain::new(),
            wrcr4_handlers: HandlerChain::new(),
            cr0_log: Vec::new(),
            cr3_log: Vec::new(),
            cr4_log: Vec::new(),
            log_enabled: false,
        }
    }

    /// Registers a handler for guest writes to CR0.
    ///
    /// The handler runs before every handler registered earlier for the same
    /// access. It may change `value`, `shadow`, `ignore_write` and
    /// `ignore_advance` of the [`CrInfo`] it receives.
    ///
    /// # Arguments
    ///
    /// * `handler` - Returns `true` to claim the access, `false` to pass it on.
    pub fn add_wrcr0_handler<F>(&mut self, handler: F)
    where
        F: FnMut(&mut ExitContext<'_>, &mut CrInfo) -> bool + 'static,
    {
        self.wrcr0_handlers.register(handler);
    }

    /// Registers a handler for guest reads of CR3.
    ///
    /// The handler runs before every handler registered earlier for the same
    /// access. It may change `value`, `shadow`, `ignore_write` and
    /// `ignore_advance` of the [`CrInfo`] it receives.
    ///
    /// # Arguments
    ///
    /// * `handler` - Returns `true` to claim the access, `false` to pass it on.
    pub fn add_rdcr3_handler<F>(&mut self, handler: F)
    where
        F: FnMut(&mut ExitContext<'_>, &mut CrInfo) -> bool + 'static,
    {
        self.rdcr3_handlers.register(handler);
    }

    /// Registers a handler for guest writes to CR3.
    ///
    /// The handler runs before every handler registered earlier for the same
    /// access. It may change `value`, `shadow`, `ignore_write` and
    /// `ignore_advance` of the [`CrInfo`] it receives.
    ///
    /// # Arguments
    ///
    /// * `handler` - Returns `true` to claim the access, `false` to pass it on.
    pub fn add_wrcr3_handler<F>(&mut self, handler: F)
    where
        F: FnMut(&mut ExitContext<'_>, &mut CrInfo) -> bool + 'static,
    {
        self.wrcr3_handlers.register(handler);
    }

    /// Registers a handler for guest writes to CR4.
    ///
    /// The handler runs before every handler registered earlier for the same
    /// access. It may change `value`, `shadow`, `ignore_write` and
    /// `ignore_advance` of the [`CrInfo`] it receives.
    ///
    /// # Arguments
    ///
    /// * `handler` - Returns `true` to claim the access, `false` to pass it on.
    pub fn add_wrcr4_handler<F>(&mut self, handler: F)
    where
        F: FnMut(&mut ExitContext<'_>, &mut CrInfo) -> bool + 'static,
    {
        self.wrcr4_handlers.register(handler);
    }

    /// Makes guest writes to the CR0 bits in `mask` exit.
    ///
    /// # Arguments
    ///
    /// * `vmcs` - The VMCS of the vCPU.
    /// * `mask` - CR0 guest/host mask. Bits set here are owned by the hypervisor.
    /// * `shadow` - CR0 read shadow. Guest reads of owned bits return these bits.
    pub fn enable_wrcr0_exiting(&mut self, vmcs: &mut dyn VmcsAccess, mask: u64, shadow: u64) {
        vmcs.write(control::CR0_GUEST_HOST_MASK, mask);
        vmcs.write(control::CR0_READ_SHADOW, shadow);
        debug!("CR0 write exiting enabled: mask={:#x} shadow={:#x}", mask, shadow);
    }

    /// Sets CR3-store exiting so every `MOV r64, CR3` exits.
    pub fn enable_rdcr3_exiting(&mut self, vmcs: &mut dyn VmcsAccess) {
        vmcs.set_bits(control::PRIMARY_PROCBASED_EXEC_CONTROLS, PrimaryControls::CR3_STORE_EXITING.bits() as u64);
        debug!("CR3 read exiting enabled");
    }

    /// Sets CR3-load exiting so every `MOV CR3, r64` exits.
    pub fn enable_wrcr3_exiting(&mut self, vmcs: &mut dyn VmcsAccess) {
        vmcs.set_bits(control::PRIMARY_PROCBASED_EXEC_CONTROLS, PrimaryControls::CR3_LOAD_EXITING.bits() as u64);
        debug!("CR3 write exiting enabled");
    }

    /// Same as [`Self::enable_wrcr0_exiting`] for CR4.
    pub fn enable_wrcr4_exiting(&mut self, vmcs: &mut dyn VmcsAccess, mask: u64, shadow: u64) {
        vmcs.write(control::CR4_GUEST_HOST_MASK, mask);
        vmcs.write(control::CR4_READ_SHADOW, shadow);
        debug!("CR4 write exiting enabled: mask={:#x} shadow={:#x}", mask, shadow);
    }

    /// Starts recording a [`CrRecord`] per exit.
    pub fn enable_log(&mut self) {
        self.log_enabled = true;
    }

    pub fn disable_log(&mut self) {
        self.log_enabled = false;
    }

    /// Records of every exit seen on `reg` while logging was enabled.
    pub fn cr_log(&self, reg: CrAccessReg) -> &[CrRecord] {
        match reg {
            CrAccessReg::Cr0 => &self.cr0_log,
            CrAccessReg::Cr3 => &self.cr3_log,
            CrAccessReg::Cr4 => &self.cr4_log,
            _ => &[],
        }
    }

    /// Handles a `ControlRegisterAccesses` VM-exit.
    ///
    /// # Arguments
    ///
    /// * `ctx` - The VMCS and guest registers of the exit.
    ///
    /// # Returns
    ///
    /// * `Ok(true)` if a handler claimed the access and the default emulation ran.
    /// * `Ok(false)` if the matching chain declined it. Nothing was applied.
    /// * `Err` for an invalid qualification or an access shape with no chain.
    pub fn handle(&mut self, ctx: &mut ExitContext<'_>) -> Result<bool, HypervisorError> {
        let qualification = ctx.vmcs.read(ro::EXIT_QUALIFICATION);
        let cr = ControlRegAccessExitQualification::from_exit_qualification(qualification)?;

        trace!("CR access: {:?} {:?}, GPR={}", cr.access_type, cr.control_reg, cr.gpr_mov_cr);

        let log_enabled = self.log_enabled;

        let claimed = match (cr.access_type, cr.control_reg) {
            (CrAccessType::MovToCr, CrAccessReg::Cr0) => {
                let info = CrInfo::new(ctx.emulate_rdgpr(cr.gpr_mov_cr), ctx.vmcs.read(control::CR0_READ_SHADOW));
                let log = log_enabled.then_some(&mut self.cr0_log);

                run_chain(&mut self.wrcr0_handlers, log, ctx, info, |ctx, info| {
                    ctx.vmcs.write(guest::CR0, info.value);
                    ctx.vmcs.write(control::CR0_READ_SHADOW, info.shadow);
                })
            }
            (CrAccessType::MovFromCr, CrAccessReg::Cr3) => {
                let info = CrInfo::new(ctx.vmcs.read(guest::CR3), 0);
                let log = log_enabled.then_some(&mut self.cr3_log);
                let gpr = cr.gpr_mov_cr;

                run_chain(&mut self.rdcr3_handlers, log, ctx, info, |ctx, info| {
                    ctx.emulate_wrgpr(gpr, info.value);
                })
            }
            (CrAccessType::MovToCr, CrAccessReg::Cr3) => {
                let info = CrInfo::new(ctx.emulate_rdgpr(cr.gpr_mov_cr), 0);
                let log = log_enabled.then_some(&mut self.cr3_log);

                run_chain(&mut self.wrcr3_handlers, log, ctx, info, |ctx, info| {
                    ctx.vmcs.write(guest::CR3, info.value);
                })
            }
            (CrAccessType::MovToCr, CrAccessReg::Cr4) => {
                let info = CrInfo::new(ctx.emulate_rdgpr(cr.gpr_mov_cr), ctx.vmcs.read(control::CR4_READ_SHADOW));
                let log = log_enabled.then_some(&mut self.cr4_log);

                run_chain(&mut self.wrcr4_handlers, log, ctx, info, |ctx, info| {
                    ctx.vmcs.write(guest::CR4, info.value);
                    ctx.vmcs.write(control::CR4_READ_SHADOW, info.shadow);
                })
            }
            (CrAccessType::Lmsw, reg) => {
                warn!(
                    "Unsupported LMSW: source data {:#x}, memory operand: {}",
                    cr.lmsw_source_data, cr.lmsw_memory_operand
                );
                return Err(HypervisorError::UnsupportedControlRegisterAccess {
                    cr: reg,
                    access: CrAccessType::Lmsw,
                });
            }
            (access, reg) => {
                warn!("Unsupported control register access: {:?} {:?}", access, reg);
                return Err(HypervisorError::UnsupportedControlRegisterAccess { cr: reg, access });
            }
        };

        if !claimed {
            warn!("No handler claimed {:?} {:?}", cr.access_type, cr.control_reg);
        }

        Ok(claimed)
    }

    /// Formats the per-register logs.
    pub fn write_log(&self, out: &mut impl Write) -> fmt::Result {
        writeln!(out, "Control register exit log")?;

        for (name, log) in [("CR0", &self.cr0_log), ("CR3", &self.cr3_log), ("CR4", &self.cr4_log)] {
            writeln!(out, "  {} ({} exits)", name, log.len())?;
            for record in log {
                writeln!(out, "    value={:#018x} shadow={:#018x}", record.value, record.shadow)?;
            }
        }

        Ok(())
    }

    /// Emits the per-register logs through the logger.
    pub fn dump_log(&self) {
        let mut text = String::new();
        if self.write_log(&mut text).is_ok() {
            text.lines().for_each(|line| info!("{}", line));
        }
    }
}

#[cfg(feature = "dump_on_drop")]
impl Drop for ControlRegisterHandler {
    fn drop(&mut self) {
        if self.log_enabled {
            self.dump_log();
        }
    }
}

/// Dispatches `info` through `chain` and applies the default emulation to a
/// claimed exit.
fn run_chain(
    chain: &mut HandlerChain<CrInfo>,
    log: Option<&mut Vec<CrRecord>>,
    ctx: &mut ExitContext<'_>,
    mut info: CrInfo,
    apply: impl FnOnce(&mut ExitContext<'_>, &CrInfo),
) -> bool {
    let claimed = chain.dispatch(ctx, &mut info);

    if let Some(log) = log {
        log.push(CrRecord::from(&info));
    }

    if !claimed {
        return false;
    }

    if !info.ignore_write {
        apply(ctx, &info);
    }

    if !info.ignore_advance {
        ctx.advance_rip();
    }

    true
}

/// Write-CR4 handler that keeps CR4.VMXE set in the real CR4 while the guest
/// always reads it as clear.
///
/// Meant to be combined with a CR4 guest/host mask covering VMXE.
pub fn hide_vmxe(_ctx: &mut ExitContext<'_>, info: &mut CrInfo) -> bool {
    let vmxe = Cr4Flags::VIRTUAL_MACHINE_EXTENSIONS.bits();

    info.shadow = info.value & !vmxe;
    info.value |= vmxe;

    true
}

/// Write-CR4 handler that raises #GP(0) in the guest when the new value sets
/// a reserved CR4 bit, as the processor would.
///
/// The write is dropped and RIP stays on the faulting instruction. Values
/// without reserved bits are passed on to the next handler.
pub fn reject_reserved_cr4_bits(ctx: &mut ExitContext<'_>, info: &mut CrInfo) -> bool {
    let reserved = info.value & !Cr4Flags::all().bits();

    if reserved == 0 {
        return false;
    }

    debug!("MOV to CR4: #GP - reserved bits {:#x} set", reserved);
    EventInjection::vmentry_inject_gp(ctx.vmcs, 0);

    info.ignore_write = true;
    info.ignore_advance = true;

    true
}
