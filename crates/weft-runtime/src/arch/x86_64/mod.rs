//! x86_64 (System V) context switching

use super::EntryFn;
use std::arch::naked_asm;

/// MXCSR at process start: all exceptions masked, round to nearest
const MXCSR_DEFAULT: u32 = 0x1F80;
/// x87 control word at process start
const FPUCW_DEFAULT: u16 = 0x037F;

/// Callee-saved state of a suspended context
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct SavedRegs {
    pub rsp: u64,
    pub rip: u64,
    pub rbx: u64,
    pub rbp: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub mxcsr: u32,
    pub fpucw: u16,
    _pad: u16,
}

/// Prepare `regs` so that switching to it calls `entry(arg)` on a fresh stack
///
/// # Safety
///
/// `stack_top` must be the high end of a writable stack region that stays
/// mapped for as long as the context can run.
#[inline]
pub unsafe fn init_context(regs: &mut SavedRegs, stack_top: *mut u8, entry: EntryFn, arg: usize) {
    // The trampoline is entered by jmp with rsp 16-byte aligned; its call
    // pushes the return address, giving the ABI's entry alignment.
    let sp = stack_top as usize & !0xF;

    *regs = SavedRegs {
        rsp: sp as u64,
        rip: context_entry_trampoline as usize as u64,
        r12: entry as usize as u64,
        r13: arg as u64,
        mxcsr: MXCSR_DEFAULT,
        fpucw: FPUCW_DEFAULT,
        ..SavedRegs::default()
    };
}

#[unsafe(naked)]
unsafe extern "C" fn context_entry_trampoline() {
    naked_asm!(
        "mov rdi, r13",
        "call r12",
        "ud2",
    );
}

/// Save the current context into `from` and resume `to`
///
/// Returns when some later switch restores `from`.
///
/// # Safety
///
/// `to` must hold a context produced by `init_context` or a previous
/// `switch_context`, whose stack is still mapped.
#[unsafe(naked)]
pub unsafe extern "C" fn switch_context(_from: *mut SavedRegs, _to: *const SavedRegs) {
    naked_asm!(
        // Save into `from` (rdi)
        "mov [rdi + 0x00], rsp",
        "lea rax, [rip + 1f]",
        "mov [rdi + 0x08], rax",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], rbp",
        "mov [rdi + 0x20], r12",
        "mov [rdi + 0x28], r13",
        "mov [rdi + 0x30], r14",
        "mov [rdi + 0x38], r15",
        "stmxcsr [rdi + 0x40]",
        "fnstcw [rdi + 0x44]",
        // Restore from `to` (rsi)
        "mov rsp, [rsi + 0x00]",
        "mov rbx, [rsi + 0x10]",
        "mov rbp, [rsi + 0x18]",
        "mov r12, [rsi + 0x20]",
        "mov r13, [rsi + 0x28]",
        "mov r14, [rsi + 0x30]",
        "mov r15, [rsi + 0x38]",
        "ldmxcsr [rsi + 0x40]",
        "fldcw [rsi + 0x44]",
        "jmp qword ptr [rsi + 0x08]",
        "1:",
        "ret",
    );
}
