use {
    crate::intel::vmerror::{CrAccessReg, CrAccessType},
    thiserror_no_std::Error,
};

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum HypervisorError {
    #[error("Unknown VM exit reason: {0:#x}")]
    UnknownVMExitReason(u32),

    #[error("No virtualizer is registered for this VM exit")]
    UnhandledVmExit,

    #[error("Invalid control register access exit qualification: {0:#x}")]
    InvalidExitQualification(u64),

    #[error("Unsupported control register access: {access:?} {cr:?}")]
    UnsupportedControlRegisterAccess { cr: CrAccessReg, access: CrAccessType },

    #[error("No handler claimed control register access: {access:?} {cr:?}")]
    UnclaimedControlRegisterAccess { cr: CrAccessReg, access: CrAccessType },

    #[error("Unhandled interrupt vector: {0}")]
    UnhandledInterruptVector(u8),
}
