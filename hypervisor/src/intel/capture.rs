// hypervisor/src/intel/capture.rs

/// General-purpose register snapshot saved by the VM-exit stub.
///
/// The first sixteen fields follow the architectural register encoding used
/// by instruction operands and exit qualifications (0 = RAX ... 15 = R15).
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GuestRegisters {
    pub rax: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rbx: u64,
    pub rsp: u64,
    pub rbp: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rflags: u64,
    pub rip: u64,
}

/// Architectural index of RSP. The guest RSP lives in the VMCS, not here.
pub const GPR_RSP: u64 = 4;

impl GuestRegisters {
    /// Reads a GPR by architectural index. Only the low four bits are used.
    pub fn gpr(&self, index: u64) -> u64 {
        match index & 0xF {
            0 => self.rax,
            1 => self.rcx,
            2 => self.rdx,
            3 => self.rbx,
            4 => self.rsp,
            5 => self.rbp,
            6 => self.rsi,
            7 => self.rdi,
            8 => self.r8,
            9 => self.r9,
            10 => self.r10,
            11 => self.r11,
            12 => self.r12,
            13 => self.r13,
            14 => self.r14,
            _ => self.r15,
        }
    }

    /// Writes a GPR by architectural index. Only the low four bits are used.
    pub fn set_gpr(&mut self, index: u64, value: u64) {
        let slot = match index & 0xF {
            0 => &mut self.rax,
            1 => &mut self.rcx,
            2 => &mut self.rdx,
            3 => &mut self.rbx,
            4 => &mut self.rsp,
            5 => &mut self.rbp,
            6 => &mut self.rsi,
            7 => &mut self.rdi,
            8 => &mut self.r8,
            9 => &mut self.r9,
            10 => &mut self.r10,
            11 => &mut self.r11,
            12 => &mut self.r12,
            13 => &mut self.r13,
            14 => &mut self.r14,
            _ => &mut self.r15,
        };

        *slot = value;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gpr_index_matches_encoding() {
        let mut regs = GuestRegisters::default();

        regs.set_gpr(3, 0x1234);
        regs.set_gpr(9, 0x5678);

        assert_eq!(regs.rbx, 0x1234);
        assert_eq!(regs.r9, 0x5678);
        assert_eq!(regs.gpr(3), 0x1234);
        assert_eq!(regs.gpr(9), 0x5678);
    }
}
