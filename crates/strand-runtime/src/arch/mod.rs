//! Architecture-specific context switching
//!
//! Each supported architecture provides a `Context` holding the
//! callee-saved register set, a `context_switch` that saves into one and
//! restores from the other, and `init_context` to lay out a fresh
//! coroutine stack so that the first switch lands in the entry trampoline.

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        mod x86_64;
        pub use x86_64::{context_switch, init_context, Context};
    } else if #[cfg(target_arch = "aarch64")] {
        mod aarch64;
        pub use aarch64::{context_switch, init_context, Context};
    } else {
        compile_error!("strand: unsupported target architecture");
    }
}
