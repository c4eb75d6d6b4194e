//! Thin wrappers around the privileged instructions used by this crate.

use core::arch::asm;

/// Reads a field of the current VMCS.
///
/// A failing VMREAD means no VMCS is current on this processor, which the
/// exit path never allows, so the error is reported and zero returned.
pub fn vmread(field: u32) -> u64 {
    match unsafe { x86::bits64::vmx::vmread(field) } {
        Ok(value) => value,
        Err(e) => {
            log::error!("VMREAD of field {:#x} failed: {:?}", field, e);
            0
        }
    }
}

/// Writes a field of the current VMCS.
pub fn vmwrite<T: Into<u64>>(field: u32, val: T) {
    if let Err(e) = unsafe { x86::bits64::vmx::vmwrite(field, val.into()) } {
        log::error!("VMWRITE of field {:#x} failed: {:?}", field, e);
    }
}

/// Reads a byte from an I/O port.
pub fn inb(port: u16) -> u8 {
    let value: u8;
    unsafe { asm!("in al, dx", in("dx") port, out("al") value, options(nomem, nostack, preserves_flags)) };
    value
}

/// Writes a byte to an I/O port.
pub fn outb(port: u16, value: u8) {
    unsafe { asm!("out dx, al", in("dx") port, in("al") value, options(nomem, nostack, preserves_flags)) };
}
