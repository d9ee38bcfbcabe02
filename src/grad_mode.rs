//! Scoped switch for gradient tracking.
//!
//! While tracking is disabled, operations still compute their values but never
//! attach a graph node, so inference loops do not keep activations alive.
//! The flag is per thread: a graph under construction belongs to one thread.

use std::cell::Cell;

thread_local! {
    static GRAD_ENABLED: Cell<bool> = const { Cell::new(true) };
}

/// Whether operations on this thread currently record a computation graph.
pub fn is_grad_enabled() -> bool {
    GRAD_ENABLED.with(|enabled| enabled.get())
}

/// Set the tracking flag for this thread, returning the previous value.
pub fn set_grad_enabled(enabled: bool) -> bool {
    GRAD_ENABLED.with(|flag| flag.replace(enabled))
}

/// RAII guard that disables gradient tracking until dropped.
///
/// Guards nest: dropping one restores whatever was in effect when it was created,
/// including during unwinding.
#[must_use = "tracking is re-enabled as soon as the guard is dropped"]
pub struct NoGradGuard {
    previous: bool,
}

impl NoGradGuard {
    pub fn new() -> Self {
        NoGradGuard {
            previous: set_grad_enabled(false),
        }
    }
}

impl Default for NoGradGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for NoGradGuard {
    fn drop(&mut self) {
        set_grad_enabled(self.previous);
    }
}

/// RAII guard that enables gradient tracking until dropped, even inside a no-grad scope.
#[must_use = "the previous tracking state is restored as soon as the guard is dropped"]
pub struct EnableGradGuard {
    previous: bool,
}

impl EnableGradGuard {
    pub fn new() -> Self {
        EnableGradGuard {
            previous: set_grad_enabled(true),
        }
    }
}

impl Default for EnableGradGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for EnableGradGuard {
    fn drop(&mut self) {
        set_grad_enabled(self.previous);
    }
}

/// Run `f` with gradient tracking disabled.
pub fn no_grad<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    let _guard = NoGradGuard::new();
    f()
}

/// Run `f` with gradient tracking enabled.
pub fn enable_grad<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    let _guard = EnableGradGuard::new();
    f()
}
