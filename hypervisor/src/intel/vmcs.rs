//! Access to VMCS fields.
//!
//! Virtualizers never touch VMREAD/VMWRITE directly; they go through
//! [`VmcsAccess`] so the same exit logic drives the current hardware VMCS
//! or an in-memory one.

use crate::intel::support::{vmread, vmwrite};

/// Get/set access to named VMCS fields (encodings from `x86::vmx::vmcs`).
pub trait VmcsAccess {
    fn read(&self, field: u32) -> u64;

    fn write(&mut self, field: u32, value: u64);

    /// Sets `bits` in a control field, leaving the other bits untouched.
    fn set_bits(&mut self, field: u32, bits: u64) {
        let value = self.read(field);
        self.write(field, value | bits);
    }

    /// Clears `bits` in a control field, leaving the other bits untouched.
    fn clear_bits(&mut self, field: u32, bits: u64) {
        let value = self.read(field);
        self.write(field, value & !bits);
    }
}

/// The VMCS currently loaded on this logical processor.
#[derive(Debug, Default, Clone, Copy)]
pub struct CurrentVmcs;

impl VmcsAccess for CurrentVmcs {
    fn read(&self, field: u32) -> u64 {
        vmread(field)
    }

    fn write(&mut self, field: u32, value: u64) {
        vmwrite(field, value)
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use {super::VmcsAccess, std::collections::BTreeMap};

    /// Field map standing in for a VMCS in host tests. Unwritten fields read
    /// as zero.
    #[derive(Debug, Default)]
    pub struct MockVmcs {
        pub fields: BTreeMap<u32, u64>,
    }

    impl MockVmcs {
        pub fn with(mut self, field: u32, value: u64) -> Self {
            self.fields.insert(field, value);
            self
        }
    }

    impl VmcsAccess for MockVmcs {
        fn read(&self, field: u32) -> u64 {
            self.fields.get(&field).copied().unwrap_or(0)
        }

        fn write(&mut self, field: u32, value: u64) {
            self.fields.insert(field, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use {super::*, mock::MockVmcs, x86::vmx::vmcs::control};

    #[test]
    fn test_set_and_clear_bits() {
        let mut vmcs = MockVmcs::default().with(control::VMEXIT_CONTROLS, 0x0000_0200);

        vmcs.set_bits(control::VMEXIT_CONTROLS, 1 << 15);
        assert_eq!(vmcs.read(control::VMEXIT_CONTROLS), 0x0000_8200);

        vmcs.clear_bits(control::VMEXIT_CONTROLS, 1 << 15);
        assert_eq!(vmcs.read(control::VMEXIT_CONTROLS), 0x0000_0200);
    }
}
