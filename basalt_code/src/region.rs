//! Code regions: fixed spans of memory holding compiled-code bundles.
//!
//! A region is bound to its address range exactly once and then only ever
//! moves its allocation mark forward. There is no per-bundle free, no
//! compaction, no growth: a bundle's bytes are valid for the life of the
//! process. Allocation must be externally serialized (the `CodeManager`
//! holds the lock); lookups may run concurrently because the index writer
//! never overlaps a collector walk and the mark only advances.

use crate::bundle::{align_up, WORD_SIZE};
use crate::method::CompiledMethod;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

// =============================================================================
// Backing Memory
// =============================================================================

/// The raw address range a region owns.
#[derive(Debug)]
struct Backing {
    ptr: NonNull<u8>,
    size: usize,
}

impl Backing {
    /// Reserve `size` zeroed bytes from the OS.
    fn reserve(size: usize, description: &str) -> Self {
        let layout = match std::alloc::Layout::from_size_align(size, WORD_SIZE) {
            Ok(layout) => layout,
            Err(_) => panic!("invalid layout for code region '{}'", description),
        };
        // Safety: layout has non-zero size (validated by callers) and
        // word alignment.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        let Some(ptr) = NonNull::new(ptr) else {
            panic!(
                "failed to reserve {} bytes for code region '{}'",
                size, description
            );
        };
        Backing { ptr, size }
    }

    #[inline]
    fn start(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    #[inline]
    fn end(&self) -> usize {
        self.start() + self.size
    }
}

impl Drop for Backing {
    fn drop(&mut self) {
        // Safety: ptr/size describe the allocation made in `reserve`.
        unsafe {
            let layout = std::alloc::Layout::from_size_align_unchecked(self.size, WORD_SIZE);
            std::alloc::dealloc(self.ptr.as_ptr(), layout);
        }
    }
}

// Safety: the backing is plain memory; all mutation goes through the
// region's serialized allocation path.
unsafe impl Send for Backing {}
unsafe impl Sync for Backing {}

// =============================================================================
// CodeRegion
// =============================================================================

/// A fixed, contiguous span of memory holding compiled-code bundles.
#[derive(Debug)]
pub struct CodeRegion {
    description: &'static str,
    bounds: OnceLock<Backing>,
    /// Bump cursor: the next free address. Only ever moves forward.
    mark: AtomicUsize,
    /// Bundles keyed by start address, for nearest-address lookup.
    index: RwLock<BTreeMap<usize, Arc<CompiledMethod>>>,
}

impl CodeRegion {
    /// Create a region that will be bound later.
    pub fn unbound(description: &'static str) -> Self {
        CodeRegion {
            description,
            bounds: OnceLock::new(),
            mark: AtomicUsize::new(0),
            index: RwLock::new(BTreeMap::new()),
        }
    }

    /// Create a region bound immediately to `size` bytes.
    ///
    /// This is the boot region's constructor: its range is fixed before
    /// anything else runs.
    pub fn bound(description: &'static str, size: usize) -> Self {
        let region = CodeRegion::unbound(description);
        region.bind(size);
        region
    }

    /// Bind the region to an address range obtained from the OS and reset
    /// the allocation mark to its start. Callable at most once.
    pub fn bind(&self, size: usize) {
        assert!(size > 0 && size % WORD_SIZE == 0, "region size must be whole words");
        let backing = Backing::reserve(size, self.description);
        let start = backing.start();
        assert!(
            self.bounds.set(backing).is_ok(),
            "code region '{}' bound twice",
            self.description
        );
        self.mark.store(start, Ordering::Release);
    }

    fn backing(&self) -> &Backing {
        match self.bounds.get() {
            Some(backing) => backing,
            None => panic!("code region '{}' is not bound", self.description),
        }
    }

    /// The region label, for diagnostics.
    #[inline]
    pub fn description(&self) -> &'static str {
        self.description
    }

    /// Whether the region has been bound to an address range.
    #[inline]
    pub fn is_bound(&self) -> bool {
        self.bounds.get().is_some()
    }

    /// Base address.
    #[inline]
    pub fn start(&self) -> usize {
        self.backing().start()
    }

    /// Fixed capacity in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.backing().size
    }

    /// One past the last address.
    #[inline]
    pub fn end(&self) -> usize {
        self.backing().end()
    }

    /// Current allocation mark.
    #[inline]
    pub fn mark(&self) -> usize {
        self.mark.load(Ordering::Acquire)
    }

    /// Bytes still available.
    #[inline]
    pub fn available(&self) -> usize {
        self.end() - self.mark()
    }

    /// Check whether an address falls inside the region.
    #[inline]
    pub fn contains(&self, address: usize) -> bool {
        match self.bounds.get() {
            Some(backing) => address >= backing.start() && address < backing.end(),
            None => false,
        }
    }

    /// Bump-allocate `size` bytes (word-aligned), or `None` when the
    /// remaining capacity is insufficient (regions never grow).
    ///
    /// Callers serialize allocation; the CAS loop only defends the mark
    /// against concurrent readers.
    pub fn allocate(&self, size: usize, zeroed: bool) -> Option<usize> {
        let backing = self.backing();
        let size = align_up(size, WORD_SIZE);
        loop {
            let current = self.mark.load(Ordering::Relaxed);
            if size > backing.end() - current {
                return None;
            }
            if self
                .mark
                .compare_exchange_weak(
                    current,
                    current + size,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                if zeroed {
                    // Safety: [current, current+size) was just claimed
                    // from this region's backing and is not yet visible
                    // to any reader.
                    unsafe {
                        std::ptr::write_bytes(current as *mut u8, 0, size);
                    }
                }
                return Some(current);
            }
        }
    }

    /// Register a planted bundle in the address index.
    ///
    /// Must be called only after the bundle's bytes are fully
    /// initialized; from this point lookups can observe it.
    pub fn add(&self, method: Arc<CompiledMethod>) {
        assert!(
            method.start() >= self.start() && method.end() <= self.end(),
            "bundle {} outside region '{}'",
            method,
            self.description
        );
        let mut index = self.index.write();
        debug_assert!(
            index
                .range(..method.end())
                .next_back()
                .map_or(true, |(_, prev)| prev.end() <= method.start()),
            "bundle {} overlaps an existing bundle",
            method
        );
        index.insert(method.start(), method);
    }

    /// Find the bundle whose span contains `address`, or `None`.
    pub fn find(&self, address: usize) -> Option<Arc<CompiledMethod>> {
        let index = self.index.read();
        let (_, method) = index.range(..=address).next_back()?;
        if method.contains(address) {
            Some(Arc::clone(method))
        } else {
            None
        }
    }

    /// Number of registered bundles.
    pub fn method_count(&self) -> usize {
        self.index.read().len()
    }

    /// Snapshot of the registered bundles in address order.
    pub fn methods(&self) -> Vec<Arc<CompiledMethod>> {
        self.index.read().values().cloned().collect()
    }
}

// =============================================================================
// Tests
// =============================================================================
