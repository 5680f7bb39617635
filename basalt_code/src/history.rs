//! Per-method compilation history.
//!
//! Every machine-code version ever produced for a logical method is kept,
//! in creation order; the current version is always the most recently
//! appended one. Nothing is ever removed; superseded versions stay
//! retrievable for stack walkers holding old return addresses. Append and
//! current-read are synchronized so "current" is never observed
//! mid-append.

use crate::method::CompiledMethod;
use parking_lot::RwLock;
use std::sync::Arc;

/// Append-only record of a logical method's compiled versions.
#[derive(Debug, Default)]
pub struct CompileHistory {
    versions: RwLock<Vec<Arc<CompiledMethod>>>,
}

impl CompileHistory {
    /// Create an empty history.
    pub fn new() -> Self {
        CompileHistory {
            versions: RwLock::new(Vec::new()),
        }
    }

    /// Append a freshly compiled version and make it current.
    pub fn add(&self, method: Arc<CompiledMethod>) {
        self.versions.write().push(method);
    }

    /// The current (most recent) version, or `None` if never compiled.
    pub fn current(&self) -> Option<Arc<CompiledMethod>> {
        self.versions.read().last().cloned()
    }

    /// The most recent version produced by `tier`, if any.
    pub fn current_for_tier(&self, tier: u8) -> Option<Arc<CompiledMethod>> {
        self.versions
            .read()
            .iter()
            .rev()
            .find(|m| m.tier() == tier)
            .cloned()
    }

    /// A historical version by append index.
    pub fn get(&self, index: usize) -> Option<Arc<CompiledMethod>> {
        self.versions.read().get(index).cloned()
    }

    /// Number of versions ever compiled.
    pub fn len(&self) -> usize {
        self.versions.read().len()
    }

    /// Whether the method has never been compiled.
    pub fn is_empty(&self) -> bool {
        self.versions.read().is_empty()
    }
}

// =============================================================================
// Tests
// =============================================================================
