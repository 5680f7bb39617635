//! The code cache: the single entry point other VM subsystems use.
//!
//! Constructed once at process start and threaded through everything that
//! needs it; there are no ambient globals. The cache wires the manager's
//! allocation to the per-method compile histories, answers address→method
//! queries for stack walkers and exception dispatch, and carries out the
//! forwarding protocol when a method is recompiled.

use crate::bundle::BundleLayout;
use crate::config::{CodeConfig, ConfigError};
use crate::history::CompileHistory;
use crate::manager::{CodeCell, CodeManager, PendingMethod, VisitError};
use crate::method::{CompiledMethod, MethodId};
use crate::safepoint::SafepointSuspender;
use dashmap::DashMap;
use std::sync::Arc;

/// Process-wide code cache.
#[derive(Debug)]
pub struct CodeCache {
    manager: CodeManager,
    histories: DashMap<MethodId, Arc<CompileHistory>>,
}

impl CodeCache {
    /// Create the cache: validates the configuration, binds both regions,
    /// and leaves the manager in bootstrap mode.
    pub fn new(
        config: CodeConfig,
        suspender: Arc<dyn SafepointSuspender>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let manager = CodeManager::new(config, suspender);
        manager.bind_runtime_region();
        Ok(CodeCache {
            manager,
            histories: DashMap::new(),
        })
    }

    /// Switch allocation from the boot region to the runtime region.
    pub fn finish_bootstrap(&self) {
        self.manager.finish_bootstrap();
    }

    /// The underlying manager.
    pub fn manager(&self) -> &CodeManager {
        &self.manager
    }

    /// Configured runtime-region capacity in bytes.
    pub fn runtime_region_size(&self) -> usize {
        self.manager.config().runtime_region_size
    }

    // =========================================================================
    // Allocation
    // =========================================================================

    /// Allocate, plant, and register one compiled method, recording it in
    /// the logical method's history as the new current version.
    pub fn allocate(
        &self,
        layout: &BundleLayout,
        pending: PendingMethod<'_>,
    ) -> Arc<CompiledMethod> {
        let id = pending.method;
        let method = self.manager.allocate(layout, pending);
        self.history_for(id).add(Arc::clone(&method));
        method
    }

    fn history_for(&self, id: MethodId) -> Arc<CompileHistory> {
        self.histories
            .entry(id)
            .or_insert_with(|| Arc::new(CompileHistory::new()))
            .clone()
    }

    // =========================================================================
    // Lookup
    // =========================================================================

    /// Whether some region owns `address`.
    pub fn contains(&self, address: usize) -> bool {
        self.manager.code_pointer_to_region(address).is_some()
    }

    /// The compiled method whose bundle contains `address`.
    ///
    /// A miss is meaningful, not an error: the address belongs to
    /// native or foreign code.
    pub fn code_pointer_to_method(&self, address: usize) -> Option<Arc<CompiledMethod>> {
        self.manager.code_pointer_to_method(address)
    }

    /// The current compiled version of a logical method, or `None` if it
    /// has never been compiled. Used by call linking to patch call sites.
    pub fn current_method(&self, id: MethodId) -> Option<Arc<CompiledMethod>> {
        self.histories.get(&id)?.current()
    }

    /// The current version produced by a given tier.
    pub fn current_method_for_tier(&self, id: MethodId, tier: u8) -> Option<Arc<CompiledMethod>> {
        self.histories.get(&id)?.current_for_tier(tier)
    }

    /// The full compile history of a logical method.
    pub fn history(&self, id: MethodId) -> Option<Arc<CompileHistory>> {
        self.histories.get(&id).map(|h| Arc::clone(&h))
    }

    // =========================================================================
    // Forwarding
    // =========================================================================

    /// Supersede `old` with `new`: set the forward pointer, then discard
    /// the old version.
    ///
    /// Discard does not reclaim anything: the old bundle's bytes stay
    /// valid memory forever, and callers resolving through it follow the
    /// forward pointer instead.
    pub fn update_method(&self, old: &Arc<CompiledMethod>, new: Arc<CompiledMethod>) {
        old.forward_to(new);
    }

    /// Whether `method` has been superseded, and by what.
    pub fn forwarding_target(&self, method: &Arc<CompiledMethod>) -> Option<Arc<CompiledMethod>> {
        method.forwarded_to()
    }

    /// Resolve a possibly superseded version to the one in effect.
    pub fn resolve(&self, method: &Arc<CompiledMethod>) -> Arc<CompiledMethod> {
        method.resolve()
    }

    // =========================================================================
    // Cell Walking
    // =========================================================================

    /// Walk every planted cell in the selected regions.
    pub fn visit_cells<F>(&self, visitor: &mut F, include_boot: bool) -> Result<(), VisitError>
    where
        F: FnMut(CodeCell),
    {
        self.manager.visit_cells(visitor, include_boot)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::BundleParts;
    use crate::method::{CatchTable, EntryPoints, StopTable};
    use crate::safepoint::NopSuspender;

    fn cache() -> CodeCache {
        CodeCache::new(CodeConfig::small(), Arc::new(NopSuspender)).unwrap()
    }

    fn compile(cache: &CodeCache, id: u64, tier: u8, code: &[u8]) -> Arc<CompiledMethod> {
        let parts = BundleParts {
            code,
            scalar_literals: &[],
            reference_literals: &[],
        };
        cache.allocate(
            &parts.layout(),
            PendingMethod {
                method: MethodId::new(id),
                tier,
                parts,
                entry_points: EntryPoints::uniform(0),
                frame_size: 16,
                stops: StopTable::empty(),
                catches: CatchTable::empty(),
            },
        )
    }

    #[test]
    fn test_rejects_invalid_config() {
        let config = CodeConfig {
            runtime_region_size: 1,
            ..Default::default()
        };
        assert!(CodeCache::new(config, Arc::new(NopSuspender)).is_err());
    }

    #[test]
    fn test_allocate_records_history() {
        let cache = cache();
        assert!(cache.current_method(MethodId::new(1)).is_none());

        let v1 = compile(&cache, 1, 1, &[0x90; 16]);
        assert_eq!(
            cache.current_method(MethodId::new(1)).unwrap().start(),
            v1.start()
        );

        let v2 = compile(&cache, 1, 2, &[0x90; 16]);
        let history = cache.history(MethodId::new(1)).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(cache.current_method(MethodId::new(1)).unwrap().start(), v2.start());
        assert_eq!(
            cache
                .current_method_for_tier(MethodId::new(1), 1)
                .unwrap()
                .start(),
            v1.start()
        );
    }

    #[test]
    fn test_contains_and_lookup() {
        let cache = cache();
        let method = compile(&cache, 2, 1, &[0xC3; 8]);

        assert!(cache.contains(method.start()));
        assert!(!cache.contains(0x10));
        let found = cache.code_pointer_to_method(method.code_start()).unwrap();
        assert_eq!(found.method(), MethodId::new(2));
    }

    #[test]
    fn test_update_method_forwards_and_resolves() {
        let cache = cache();
        let v1 = compile(&cache, 3, 1, &[0x90; 16]);
        let v2 = compile(&cache, 3, 2, &[0x90; 16]);

        cache.update_method(&v1, Arc::clone(&v2));

        // A call site still caching v1 resolves to v2.
        assert_eq!(cache.resolve(&v1).start(), v2.start());
        assert_eq!(
            cache.forwarding_target(&v1).unwrap().start(),
            v2.start()
        );
        assert!(cache.forwarding_target(&v2).is_none());

        // The old bundle's memory is still registered and dereferenceable.
        assert!(cache.code_pointer_to_method(v1.start()).is_some());
    }

    #[test]
    fn test_forwarding_chain_terminates_at_current() {
        let cache = cache();
        let v1 = compile(&cache, 4, 1, &[0x90; 16]);
        let v2 = compile(&cache, 4, 1, &[0x90; 16]);
        let v3 = compile(&cache, 4, 2, &[0x90; 16]);

        cache.update_method(&v1, Arc::clone(&v2));
        cache.update_method(&v2, Arc::clone(&v3));

        assert_eq!(cache.resolve(&v1).start(), v3.start());
        assert_eq!(
            cache.current_method(MethodId::new(4)).unwrap().start(),
            v3.start()
        );
    }

    #[test]
    fn test_histories_are_per_method() {
        let cache = cache();
        compile(&cache, 5, 1, &[0x90; 8]);
        compile(&cache, 6, 1, &[0x90; 8]);
        compile(&cache, 5, 1, &[0x90; 8]);

        assert_eq!(cache.history(MethodId::new(5)).unwrap().len(), 2);
        assert_eq!(cache.history(MethodId::new(6)).unwrap().len(), 1);
        assert!(cache.history(MethodId::new(7)).is_none());
    }
}
