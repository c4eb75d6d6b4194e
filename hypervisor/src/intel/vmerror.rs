//! Decoders for the read-only VM-exit information fields: the basic exit
//! reason, the control-register access exit qualification and the VM-exit
//! interruption-information field.

use {crate::error::HypervisorError, bitfield::bitfield};

/// Represents the basic VM exit reasons.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: Table C-1. Basic Exit Reasons
#[repr(u16)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum VmxBasicExitReason {
    ExceptionOrNmi = 0,
    ExternalInterrupt = 1,
    TripleFault = 2,
    InitSignal = 3,
    StartupIpi = 4,
    IoSystemManagementInterrupt = 5,
    OtherSmi = 6,
    InterruptWindow = 7,
    NmiWindow = 8,
    TaskSwitch = 9,
    Cpuid = 10,
    Getsec = 11,
    Hlt = 12,
    Invd = 13,
    Invlpg = 14,
    Rdpmc = 15,
    Rdtsc = 16,
    Rsm = 17,
    Vmcall = 18,
    Vmclear = 19,
    Vmlaunch = 20,
    Vmptrld = 21,
    Vmptrst = 22,
    Vmread = 23,
    Vmresume = 24,
    Vmwrite = 25,
    Vmxoff = 26,
    Vmxon = 27,
    ControlRegisterAccesses = 28,
    MovDr = 29,
    IoInstruction = 30,
    Rdmsr = 31,
    Wrmsr = 32,
    VmEntryFailureInvalidGuestState = 33,
    VmEntryFailureMsrLoading = 34,
    Mwait = 36,
    MonitorTrapFlag = 37,
    Monitor = 39,
    Pause = 40,
    VmEntryFailureMachineCheckEvent = 41,
    TprBelowThreshold = 43,
    ApicAccess = 44,
    VirtualizedEoi = 45,
    AccessToGdtrOrIdtr = 46,
    AccessToLdtrOrTr = 47,
    EptViolation = 48,
    EptMisconfiguration = 49,
    Invept = 50,
    Rdtscp = 51,
    VmxPreemptionTimerExpired = 52,
    Invvpid = 53,
    WbinvdOrWbnoinvd = 54,
    Xsetbv = 55,
    ApicWrite = 56,
    Rdrand = 57,
    Invpcid = 58,
    Vmfunc = 59,
    Encls = 60,
    Rdseed = 61,
    PageModificationLogFull = 62,
    Xsaves = 63,
    Xrstors = 64,
}

impl VmxBasicExitReason {
    /// Decodes the 32-bit exit reason field. Only the lower 16 bits carry the
    /// basic exit reason.
    ///
    /// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 25.9.1 VM Exit Reason
    pub fn from_u32(value: u32) -> Option<Self> {
        use VmxBasicExitReason::*;

        let reason = match value & 0xFFFF {
            0 => ExceptionOrNmi,
            1 => ExternalInterrupt,
            2 => TripleFault,
            3 => InitSignal,
            4 => StartupIpi,
            5 => IoSystemManagementInterrupt,
            6 => OtherSmi,
            7 => InterruptWindow,
            8 => NmiWindow,
            9 => TaskSwitch,
            10 => Cpuid,
            11 => Getsec,
            12 => Hlt,
            13 => Invd,
            14 => Invlpg,
            15 => Rdpmc,
            16 => Rdtsc,
            17 => Rsm,
            18 => Vmcall,
            19 => Vmclear,
            20 => Vmlaunch,
            21 => Vmptrld,
            22 => Vmptrst,
            23 => Vmread,
            24 => Vmresume,
            25 => Vmwrite,
            26 => Vmxoff,
            27 => Vmxon,
            28 => ControlRegisterAccesses,
            29 => MovDr,
            30 => IoInstruction,
            31 => Rdmsr,
            32 => Wrmsr,
            33 => VmEntryFailureInvalidGuestState,
            34 => VmEntryFailureMsrLoading,
            36 => Mwait,
            37 => MonitorTrapFlag,
            39 => Monitor,
            40 => Pause,
            41 => VmEntryFailureMachineCheckEvent,
            43 => TprBelowThreshold,
            44 => ApicAccess,
            45 => VirtualizedEoi,
            46 => AccessToGdtrOrIdtr,
            47 => AccessToLdtrOrTr,
            48 => EptViolation,
            49 => EptMisconfiguration,
            50 => Invept,
            51 => Rdtscp,
            52 => VmxPreemptionTimerExpired,
            53 => Invvpid,
            54 => WbinvdOrWbnoinvd,
            55 => Xsetbv,
            56 => ApicWrite,
            57 => Rdrand,
            58 => Invpcid,
            59 => Vmfunc,
            60 => Encls,
            61 => Rdseed,
            62 => PageModificationLogFull,
            63 => Xsaves,
            64 => Xrstors,
            _ => return None,
        };

        Some(reason)
    }
}

bitfield! {
    /// Raw exit qualification for control-register accesses.
    ///
    /// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: Table 28-3. Exit Qualification for Control-Register Accesses
    struct CrQualification(u64);

    impl Debug;

    /// Number of the control register (0 for CLTS and LMSW)
    control_register, _: 3, 0;

    /// 0 = MOV to CR, 1 = MOV from CR, 2 = CLTS, 3 = LMSW
    access_type, _: 5, 4;

    /// LMSW operand type (0 = register, 1 = memory)
    lmsw_operand_memory, _: 6;

    // Reserved: 7

    /// General-purpose register operand of MOV CR
    general_purpose_register, _: 11, 8;

    // Reserved: 15:12

    /// Source data of LMSW
    lmsw_source_data, _: 31, 16;
}

/// Access direction reported in the control-register exit qualification.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CrAccessType {
    MovToCr,
    MovFromCr,
    Clts,
    Lmsw,
}

/// Control register reported in the control-register exit qualification.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CrAccessReg {
    Cr0,
    Cr2,
    Cr3,
    Cr4,
    Cr8,
}

/// Decoded control-register access exit qualification.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ControlRegAccessExitQualification {
    pub control_reg: CrAccessReg,
    pub access_type: CrAccessType,
    /// Architectural GPR index (0 = RAX ... 15 = R15) used by MOV CR.
    pub gpr_mov_cr: u64,
    pub lmsw_memory_operand: bool,
    pub lmsw_source_data: u64,
}

impl ControlRegAccessExitQualification {
    pub fn from_exit_qualification(qualification: u64) -> Result<Self, HypervisorError> {
        let raw = CrQualification(qualification);

        let control_reg = match raw.control_register() {
            0 => CrAccessReg::Cr0,
            2 => CrAccessReg::Cr2,
            3 => CrAccessReg::Cr3,
            4 => CrAccessReg::Cr4,
            8 => CrAccessReg::Cr8,
            _ => return Err(HypervisorError::InvalidExitQualification(qualification)),
        };

        let access_type = match raw.access_type() {
            0 => CrAccessType::MovToCr,
            1 => CrAccessType::MovFromCr,
            2 => CrAccessType::Clts,
            _ => CrAccessType::Lmsw,
        };

        Ok(Self {
            control_reg,
            access_type,
            gpr_mov_cr: raw.general_purpose_register(),
            lmsw_memory_operand: raw.lmsw_operand_memory(),
            lmsw_source_data: raw.lmsw_source_data(),
        })
    }
}

/// Event types of the interruption-information fields.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: Table 25-19. Format of the VM-Exit Interruption-Information Field
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum InterruptionType {
    ExternalInterrupt = 0,
    NonMaskableInterrupt = 2,
    HardwareException = 3,
    SoftwareInterrupt = 4,
    PrivilegedSoftwareException = 5,
    SoftwareException = 6,
    OtherEvent = 7,
}

impl InterruptionType {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::ExternalInterrupt),
            2 => Some(Self::NonMaskableInterrupt),
            3 => Some(Self::HardwareException),
            4 => Some(Self::SoftwareInterrupt),
            5 => Some(Self::PrivilegedSoftwareException),
            6 => Some(Self::SoftwareException),
            7 => Some(Self::OtherEvent),
            _ => None,
        }
    }
}

bitfield! {
    struct InterruptionInformation(u32);

    impl Debug;

    vector, _: 7, 0;
    interruption_type, _: 10, 8;
    error_code_valid, _: 11;
    nmi_unblocking, _: 12;
    // Reserved: 30:13
    valid, _: 31;
}

/// Decoded VM-exit interruption-information field.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct VmExitInterruptionInformation {
    pub vector: u8,
    pub interruption_type: InterruptionType,
    pub error_code_valid: bool,
    pub nmi_unblocking: bool,
}

impl VmExitInterruptionInformation {
    /// Returns `None` if the valid bit is clear or the type is reserved.
    pub fn from_u32(value: u32) -> Option<Self> {
        let raw = InterruptionInformation(value);

        if !raw.valid() {
            return None;
        }

        Some(Self {
            vector: raw.vector() as u8,
            interruption_type: InterruptionType::from_u32(raw.interruption_type())?,
            error_code_valid: raw.error_code_valid(),
            nmi_unblocking: raw.nmi_unblocking(),
        })
    }
}
