//! Thread-local runtime context
//!
//! Tracks, per OS thread: the scheduling ("main") register context, the
//! coroutine currently executing, the processor that owns this thread,
//! and whether the hook layer is active. Owning-thread assertions across
//! the runtime are built on these accessors.

use crate::arch::Context;
use crate::coroutine::Coroutine;
use crate::processor::Processor;

use std::cell::{Cell, RefCell, UnsafeCell};
use std::rc::Rc;
use std::sync::Arc;

thread_local! {
    /// The thread's scheduling context: where `swap_out` returns to.
    /// Constructed lazily on first access; represents the native stack,
    /// so it has no stack mapping or callback of its own.
    static MAIN_CTX: UnsafeCell<Context> = const { UnsafeCell::new(Context::new()) };

    /// Coroutine currently in EXEC on this thread.
    static CURRENT_CO: RefCell<Option<Rc<Coroutine>>> = const { RefCell::new(None) };

    /// Processor bound to this thread for the duration of its `run`.
    static CURRENT_PROC: RefCell<Option<Arc<Processor>>> = const { RefCell::new(None) };

    /// Whether blocking-looking ops should suspend instead of falling
    /// through to a plain blocking wait.
    static HOOK_ENABLED: Cell<bool> = const { Cell::new(false) };
}

/// Pointer to this thread's scheduling context.
///
/// Stable for the thread's lifetime once first accessed.
#[inline]
pub(crate) fn main_context() -> *mut Context {
    MAIN_CTX.with(|c| c.get())
}

#[inline]
pub(crate) fn set_current_coroutine(co: Rc<Coroutine>) {
    CURRENT_CO.with(|cell| *cell.borrow_mut() = Some(co));
}

#[inline]
pub(crate) fn clear_current_coroutine() {
    CURRENT_CO.with(|cell| *cell.borrow_mut() = None);
}

/// The coroutine currently executing on this thread, if any.
#[inline]
pub fn current_coroutine() -> Option<Rc<Coroutine>> {
    CURRENT_CO.with(|cell| cell.borrow().clone())
}

/// True when called from inside a coroutine.
#[inline]
pub fn is_in_coroutine() -> bool {
    CURRENT_CO.with(|cell| cell.borrow().is_some())
}

#[inline]
pub(crate) fn set_current_processor(proc: Arc<Processor>) {
    CURRENT_PROC.with(|cell| *cell.borrow_mut() = Some(proc));
}

#[inline]
pub(crate) fn clear_current_processor() {
    CURRENT_PROC.with(|cell| *cell.borrow_mut() = None);
}

/// The processor whose `run` loop owns this thread, if any.
#[inline]
pub fn current_processor() -> Option<Arc<Processor>> {
    CURRENT_PROC.with(|cell| cell.borrow().clone())
}

/// Enable or disable hooking for this thread.
#[inline]
pub fn set_hook_enabled(on: bool) {
    HOOK_ENABLED.with(|cell| cell.set(on));
}

/// Whether hooking is active on this thread.
#[inline]
pub fn is_hook_enabled() -> bool {
    HOOK_ENABLED.with(|cell| cell.get())
}
