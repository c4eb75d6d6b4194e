//! External interrupt virtualization.
//!
//! With external-interrupt exiting and acknowledge-interrupt-on-exit enabled,
//! every interrupt arriving while the guest runs causes a VM-exit that
//! already carries the acknowledged vector. A registered handler must take
//! ownership of that vector; nobody else will.

use {
    crate::{
        error::HypervisorError,
        intel::{
            events::EventInjection,
            vmcs::VmcsAccess,
            vmerror::{VmExitInterruptionInformation, VmxBasicExitReason},
            vm::{ExitRegistry, Virtualizer},
            vmexit::{ExitContext, chain::HandlerChain},
        },
    },
    alloc::string::String,
    core::fmt::{self, Write},
    log::*,
    x86::vmx::vmcs::{
        control::{self, ExitControls, PinbasedControls},
        ro,
    },
};

const VECTOR_COUNT: usize = 256;

/// Per-exit descriptor handed to every external interrupt handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterruptInfo {
    /// Vector acknowledged by the processor on exit.
    pub vector: u8,
}

pub struct ExternalInterruptHandler {
    handlers: HandlerChain<InterruptInfo>,
    log: [u64; VECTOR_COUNT],
    log_enabled: bool,
}

impl ExternalInterruptHandler {
    /// Creates the virtualizer and routes `ExternalInterrupt` exits to it.
    ///
    /// # Arguments
    ///
    /// * `exits` - The exit-reason registry of the vCPU that owns this virtualizer.
    pub fn new(exits: &mut ExitRegistry) -> Self {
        exits.register(VmxBasicExitReason::ExternalInterrupt, Virtualizer::ExternalInterrupt);

        Self {
            handlers: HandlerChain::new(),
            log: [0; VECTOR_COUNT],
            log_enabled: false,
        }
    }

    /// Registers a handler for every external interrupt exit.
    ///
    /// The handler runs before every handler registered earlier.
    ///
    /// # Arguments
    ///
    /// * `handler` - Returns `true` once it has taken ownership of the vector.
    pub fn add_handler<F>(&mut self, handler: F)
    where
        F: FnMut(&mut ExitContext<'_>, &mut InterruptInfo) -> bool + 'static,
    {
        self.handlers.register(handler);
    }

    /// Registers a handler that hands every vector back to the guest through
    /// VM-entry event injection.
    pub fn add_reinjection_handler(&mut self) {
        self.add_handler(|ctx, info| {
            EventInjection::inject_external_interrupt(ctx.vmcs, info.vector);
            true
        });
    }

    /// Turns on external-interrupt exiting together with acknowledge
    /// interrupt on exit.
    ///
    /// # Arguments
    ///
    /// * `vmcs` - The VMCS of the vCPU. Other pin-based and exit controls are kept.
    pub fn enable_exiting(&mut self, vmcs: &mut dyn VmcsAccess) {
        vmcs.set_bits(control::PINBASED_EXEC_CONTROLS, PinbasedControls::EXTERNAL_INTERRUPT_EXITING.bits() as u64);
        vmcs.set_bits(control::VMEXIT_CONTROLS, ExitControls::ACK_INTERRUPT_ON_EXIT.bits() as u64);
        debug!("External interrupt exiting enabled");
    }

    /// Turns off both controls turned on by [`Self::enable_exiting`].
    pub fn disable_exiting(&mut self, vmcs: &mut dyn VmcsAccess) {
        vmcs.clear_bits(control::PINBASED_EXEC_CONTROLS, PinbasedControls::EXTERNAL_INTERRUPT_EXITING.bits() as u64);
        vmcs.clear_bits(control::VMEXIT_CONTROLS, ExitControls::ACK_INTERRUPT_ON_EXIT.bits() as u64);
        debug!("External interrupt exiting disabled");
    }

    /// Starts counting exits per vector.
    pub fn enable_log(&mut self) {
        self.log_enabled = true;
    }

    pub fn disable_log(&mut self) {
        self.log_enabled = false;
    }

    /// Number of exits seen for `vector` while logging was enabled.
    pub fn vector_count(&self, vector: u8) -> u64 {
        self.log[vector as usize]
    }

    /// Handles an `ExternalInterrupt` VM-exit.
    ///
    /// An interrupt no handler claims is fatal: it has already been
    /// acknowledged, so resuming the guest would lose it.
    ///
    /// # Arguments
    ///
    /// * `ctx` - The VMCS and guest registers of the exit.
    ///
    /// # Returns
    ///
    /// * `Ok(true)` once a handler claimed the vector.
    /// * `Err(HypervisorError::UnhandledInterruptVector)` otherwise.
    pub fn handle(&mut self, ctx: &mut ExitContext<'_>) -> Result<bool, HypervisorError> {
        let raw = ctx.vmcs.read(ro::VMEXIT_INTERRUPTION_INFO);

        let vector = match VmExitInterruptionInformation::from_u32(raw as u32) {
            Some(interruption) => interruption.vector,
            None => {
                warn!("External interrupt exit without valid interruption information: {:#x}", raw);
                raw as u8
            }
        };

        let mut info = InterruptInfo { vector };

        if self.log_enabled {
            self.log[vector as usize] += 1;
        }

        if self.handlers.dispatch(ctx, &mut info) {
            return Ok(true);
        }

        error!("Unhandled interrupt vector: {}", vector);
        Err(HypervisorError::UnhandledInterruptVector(vector))
    }

    /// Formats the non-zero per-vector counts.
    pub fn write_log(&self, out: &mut impl Write) -> fmt::Result {
        writeln!(out, "External interrupt counts")?;

        for (vector, count) in self.log.iter().enumerate().filter(|(_, count)| **count > 0) {
            writeln!(out, "  {:>3}: {:#x}", vector, count)?;
        }

        Ok(())
    }

    /// Emits the non-zero per-vector counts through the logger.
    pub fn dump_log(&self) {
        let mut text = String::new();
        if self.write_log(&mut text).is_ok() {
            text.lines().for_each(|line| info!("{}", line));
        }
    }
}

#[cfg(feature = "dump_on_drop")]
impl Drop for ExternalInterruptHandler {
    fn drop(&mut self) {
        if self.log_enabled {
            self.dump_log();
        }
    }
}
