//! Architecture-specific context switching
//!
//! Each backend provides `SavedRegs` (the callee-saved state of a suspended
//! context), `init_context` (prepare a fresh stack to enter a function) and
//! `switch_context` (save the current context, restore another).

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        pub mod x86_64;
        pub use self::x86_64::{init_context, switch_context, SavedRegs};
    } else if #[cfg(target_arch = "aarch64")] {
        pub mod aarch64;
        pub use self::aarch64::{init_context, switch_context, SavedRegs};
    } else {
        compile_error!("weft supports only x86_64 and aarch64");
    }
}

/// Function a fresh context enters; it must never return
pub type EntryFn = unsafe extern "C" fn(arg: usize) -> !;
