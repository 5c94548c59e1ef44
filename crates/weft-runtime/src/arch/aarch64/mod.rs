//! aarch64 (AAPCS64) context switching

use super::EntryFn;
use std::arch::naked_asm;

/// Callee-saved state of a suspended context
///
/// `x[0..10]` are x19-x28; `fp`/`lr` are x29/x30; `d` holds d8-d15.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct SavedRegs {
    pub x: [u64; 10],
    pub fp: u64,
    pub lr: u64,
    pub sp: u64,
    pub d: [u64; 8],
}

/// Prepare `regs` so that switching to it calls `entry(arg)` on a fresh stack
///
/// # Safety
///
/// `stack_top` must be the high end of a writable stack region that stays
/// mapped for as long as the context can run.
#[inline]
pub unsafe fn init_context(regs: &mut SavedRegs, stack_top: *mut u8, entry: EntryFn, arg: usize) {
    let mut x = [0u64; 10];
    x[0] = entry as usize as u64; // x19
    x[1] = arg as u64; // x20
    *regs = SavedRegs {
        x,
        fp: 0,
        lr: context_entry_trampoline as usize as u64,
        sp: (stack_top as usize & !0xF) as u64,
        d: [0; 8],
    };
}

#[unsafe(naked)]
unsafe extern "C" fn context_entry_trampoline() {
    naked_asm!(
        "mov x0, x20",
        "blr x19",
        "brk #0x1",
    );
}

/// Save the current context into `from` and resume `to`
///
/// # Safety
///
/// `to` must hold a context produced by `init_context` or a previous
/// `switch_context`, whose stack is still mapped.
#[unsafe(naked)]
pub unsafe extern "C" fn switch_context(_from: *mut SavedRegs, _to: *const SavedRegs) {
    naked_asm!(
        // Save into `from` (x0)
        "stp x19, x20, [x0, #0x00]",
        "stp x21, x22, [x0, #0x10]",
        "stp x23, x24, [x0, #0x20]",
        "stp x25, x26, [x0, #0x30]",
        "stp x27, x28, [x0, #0x40]",
        "stp x29, x30, [x0, #0x50]",
        "mov x9, sp",
        "str x9, [x0, #0x60]",
        "stp d8, d9, [x0, #0x68]",
        "stp d10, d11, [x0, #0x78]",
        "stp d12, d13, [x0, #0x88]",
        "stp d14, d15, [x0, #0x98]",
        // Restore from `to` (x1)
        "ldp x19, x20, [x1, #0x00]",
        "ldp x21, x22, [x1, #0x10]",
        "ldp x23, x24, [x1, #0x20]",
        "ldp x25, x26, [x1, #0x30]",
        "ldp x27, x28, [x1, #0x40]",
        "ldp x29, x30, [x1, #0x50]",
        "ldr x9, [x1, #0x60]",
        "mov sp, x9",
        "ldp d8, d9, [x1, #0x68]",
        "ldp d10, d11, [x1, #0x78]",
        "ldp d12, d13, [x1, #0x88]",
        "ldp d14, d15, [x1, #0x98]",
        "ret",
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::{offset_of, size_of};

    #[test]
    fn test_layout_matches_asm_offsets() {
        assert_eq!(offset_of!(SavedRegs, fp), 0x50);
        assert_eq!(offset_of!(SavedRegs, sp), 0x60);
        assert_eq!(offset_of!(SavedRegs, d), 0x68);
        assert_eq!(size_of::<SavedRegs>(), 0xA8);
    }
}
