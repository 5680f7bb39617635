//! Safepoint suspension around raw bundle initialization.
//!
//! Between reserving raw region memory and finishing the planting of a
//! bundle's cells, no collection may run: a scanner would see a
//! half-initialized cell. The window is bracketed by a scoped guard so
//! that re-enabling is the first thing that happens on *every* exit path,
//! the fatal one included: the guard's drop runs before any diagnostic
//! I/O can block.

/// Per-thread safepoint control supplied by the GC collaborator.
///
/// `disable_allocation`/`enable_allocation` are only engaged when bundles
/// are allocated from GC-managed memory; the default implementations are
/// no-ops.
pub trait SafepointSuspender: Send + Sync {
    /// Stop delivering safepoints to the current thread.
    fn disable_safepoints(&self);

    /// Resume delivering safepoints to the current thread.
    fn enable_safepoints(&self);

    /// Stop GC-triggering allocation on the current thread.
    fn disable_allocation(&self) {}

    /// Resume GC-triggering allocation on the current thread.
    fn enable_allocation(&self) {}
}

/// Suspender for single-threaded bootstrap and tests: no GC exists yet,
/// so there is nothing to suspend.
#[derive(Debug, Default)]
pub struct NopSuspender;

impl SafepointSuspender for NopSuspender {
    fn disable_safepoints(&self) {}
    fn enable_safepoints(&self) {}
}

/// Scoped suspension of safepoint delivery (and optionally allocation)
/// for the current thread.
///
/// Dropping the scope restores state in reverse acquisition order.
pub struct SuspendScope<'a> {
    suspender: &'a dyn SafepointSuspender,
    allocation_disabled: bool,
}

impl<'a> SuspendScope<'a> {
    /// Disable safepoints now; additionally disable allocation when the
    /// raw memory being initialized lives in the GC heap.
    pub fn enter(suspender: &'a dyn SafepointSuspender, disable_allocation: bool) -> Self {
        suspender.disable_safepoints();
        if disable_allocation {
            suspender.disable_allocation();
        }
        SuspendScope {
            suspender,
            allocation_disabled: disable_allocation,
        }
    }
}

impl Drop for SuspendScope<'_> {
    fn drop(&mut self) {
        if self.allocation_disabled {
            self.suspender.enable_allocation();
        }
        self.suspender.enable_safepoints();
    }
}

// =============================================================================
// Tests
// =============================================================================
