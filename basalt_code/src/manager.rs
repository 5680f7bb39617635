//! The code manager: serialized bundle allocation and cell walking.
//!
//! One manager owns the boot and runtime regions. Allocation is a single
//! critical section: reserve raw memory from the target region, plant the
//! three array cells so the span reads as well-formed memory, then
//! register the bundle, in that order, under safepoint suspension, so a
//! concurrent collector can never observe a half-initialized cell.
//!
//! Capacity exhaustion is fatal. There is no eviction or compaction to
//! free space, so the only remedy is a larger region; the diagnostic
//! names the configuration knob and the process exits with a distinct
//! code.

use crate::bundle::{align_up, ArrayField, BundleLayout, BundleParts, CELL_HEADER_SIZE, WORD_SIZE};
use crate::config::CodeConfig;
use crate::method::{CatchTable, CompiledMethod, EntryPoints, MethodId, StopTable};
use crate::region::CodeRegion;
use crate::safepoint::{SafepointSuspender, SuspendScope};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

// =============================================================================
// Exit Codes
// =============================================================================

/// Process exit code for code-cache exhaustion.
///
/// Distinct from ordinary VM error exits so harnesses can tell "ran out
/// of code space" from "crashed".
pub const EXIT_CODE_CACHE_EXHAUSTED: u8 = 121;

// =============================================================================
// Pending Method
// =============================================================================

/// Everything the backend produced for one compilation, ready to be
/// placed into a region.
#[derive(Debug)]
pub struct PendingMethod<'a> {
    pub method: MethodId,
    pub tier: u8,
    pub parts: BundleParts<'a>,
    pub entry_points: EntryPoints,
    pub frame_size: u32,
    pub stops: StopTable,
    pub catches: CatchTable,
}

// =============================================================================
// Cell Visiting
// =============================================================================

/// One well-formed cell observed during a region walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodeCell {
    /// Address of the cell header.
    pub address: usize,
    /// Payload length recorded in the header.
    pub payload_length: usize,
}

/// A malformed cell encountered while walking a region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VisitError {
    pub region: &'static str,
    pub address: usize,
}

impl fmt::Display for VisitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "malformed cell at {:#x} in code region '{}'",
            self.address, self.region
        )
    }
}

impl std::error::Error for VisitError {}

// =============================================================================
// CodeManager
// =============================================================================

/// Owns the code regions and serializes bundle allocation.
pub struct CodeManager {
    config: CodeConfig,
    boot: CodeRegion,
    runtime: CodeRegion,
    /// While set, allocation targets the boot region.
    bootstrapping: AtomicBool,
    /// Serializes the reserve-plant-register sequence.
    alloc_lock: Mutex<()>,
    suspender: Arc<dyn SafepointSuspender>,
}

impl fmt::Debug for CodeManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodeManager")
            .field("boot", &self.boot)
            .field("runtime", &self.runtime)
            .field("bootstrapping", &self.bootstrapping)
            .finish_non_exhaustive()
    }
}

impl CodeManager {
    /// Create a manager: the boot region is bound immediately, the
    /// runtime region is created unbound.
    pub fn new(config: CodeConfig, suspender: Arc<dyn SafepointSuspender>) -> Self {
        let boot = CodeRegion::bound("boot code region", config.boot_region_size);
        let runtime = CodeRegion::unbound("runtime code region");
        CodeManager {
            config,
            boot,
            runtime,
            bootstrapping: AtomicBool::new(true),
            alloc_lock: Mutex::new(()),
            suspender,
        }
    }

    /// Bind the runtime region to its configured address range. Called
    /// once at startup.
    pub fn bind_runtime_region(&self) {
        self.runtime.bind(self.config.runtime_region_size);
    }

    /// Switch allocation from the boot region to the runtime region.
    pub fn finish_bootstrap(&self) {
        assert!(
            self.runtime.is_bound(),
            "runtime region must be bound before bootstrap ends"
        );
        self.bootstrapping.store(false, Ordering::Release);
    }

    /// Whether allocation still targets the boot region.
    pub fn is_bootstrapping(&self) -> bool {
        self.bootstrapping.load(Ordering::Acquire)
    }

    /// The boot region.
    pub fn boot_region(&self) -> &CodeRegion {
        &self.boot
    }

    /// The runtime region.
    pub fn runtime_region(&self) -> &CodeRegion {
        &self.runtime
    }

    /// The configuration this manager runs under.
    pub fn config(&self) -> &CodeConfig {
        &self.config
    }

    // =========================================================================
    // Allocation
    // =========================================================================

    /// Allocate and plant one compiled method's bundle.
    ///
    /// The sequence of region bump, cell planting, and index
    /// registration appears atomic to a concurrent collector: it runs
    /// under the allocation lock with safepoints suspended for the raw
    /// window. Exhaustion is fatal and does not return.
    pub fn allocate(&self, layout: &BundleLayout, pending: PendingMethod<'_>) -> Arc<CompiledMethod> {
        assert!(
            pending.parts.matches(layout),
            "bundle parts do not match the layout for {}",
            pending.method
        );
        let size = align_up(layout.bundle_size(), WORD_SIZE);

        let _lock = self.alloc_lock.lock();
        let region = if self.is_bootstrapping() {
            &self.boot
        } else {
            &self.runtime
        };

        // No collection may observe the bundle until planting finishes.
        let scope = SuspendScope::enter(&*self.suspender, self.config.allocate_in_heap);
        let start = match region.allocate(size, false) {
            Some(start) => start,
            None => {
                // Re-enable safepoints before any blocking I/O.
                drop(scope);
                self.exhausted(region, size);
            }
        };

        // Safety: [start, start+size) was just reserved from the region
        // and is invisible to lookups until `add` below.
        unsafe {
            plant_bundle(start, layout, &pending.parts);
        }
        drop(scope);

        if self.config.trace_allocations {
            eprintln!(
                "[code] {}: {} bytes at {:#x}..{:#x} for {}",
                region.description(),
                size,
                start,
                start + size,
                pending.method
            );
        }

        let method = Arc::new(CompiledMethod::new(
            pending.method,
            pending.tier,
            start,
            *layout,
            pending.entry_points,
            pending.frame_size,
            pending.stops,
            pending.catches,
        ));
        // Registration happens-after planting: any thread that finds the
        // bundle by address sees fully initialized memory.
        region.add(Arc::clone(&method));
        method
    }

    /// Report exhaustion and terminate. Never returns.
    fn exhausted(&self, region: &CodeRegion, requested: usize) -> ! {
        eprintln!(
            "FATAL: code region '{}' exhausted: {} bytes requested, {} available",
            region.description(),
            requested,
            region.available()
        );
        eprintln!(
            "increase CodeConfig::runtime_region_size (currently {} bytes) and restart",
            self.config.runtime_region_size
        );
        std::process::exit(EXIT_CODE_CACHE_EXHAUSTED as i32);
    }

    // =========================================================================
    // Lookup
    // =========================================================================

    /// The region containing `address`, if any.
    pub fn code_pointer_to_region(&self, address: usize) -> Option<&CodeRegion> {
        if self.boot.contains(address) {
            Some(&self.boot)
        } else if self.runtime.contains(address) {
            Some(&self.runtime)
        } else {
            None
        }
    }

    /// The compiled method whose bundle contains `address`, if any.
    pub fn code_pointer_to_method(&self, address: usize) -> Option<Arc<CompiledMethod>> {
        self.code_pointer_to_region(address)?.find(address)
    }

    // =========================================================================
    // Cell Walking
    // =========================================================================

    /// Walk every planted cell from region start to the current mark,
    /// calling `visitor` per cell.
    ///
    /// This is the hook a collector or heap verifier uses to treat code
    /// regions as scannable memory. Must not race an in-progress
    /// allocation; the safepoint protocol guarantees that.
    pub fn visit_cells<F>(&self, visitor: &mut F, include_boot: bool) -> Result<(), VisitError>
    where
        F: FnMut(CodeCell),
    {
        if include_boot {
            visit_region_cells(&self.boot, visitor)?;
        }
        if self.runtime.is_bound() {
            visit_region_cells(&self.runtime, visitor)?;
        }
        Ok(())
    }
}

/// Walk the committed span of one region cell by cell.
fn visit_region_cells<F>(region: &CodeRegion, visitor: &mut F) -> Result<(), VisitError>
where
    F: FnMut(CodeCell),
{
    let mark = region.mark();
    let mut address = region.start();
    while address < mark {
        // Safety: [start, mark) is committed region memory; every byte of
        // it was planted before the mark moved past it.
        let payload_length = unsafe { (address as *const u64).read() } as usize;
        let cell_size = CELL_HEADER_SIZE
            .checked_add(payload_length)
            .and_then(|s| s.checked_add(WORD_SIZE - 1))
            .map(|s| s & !(WORD_SIZE - 1));
        match cell_size {
            Some(cell_size) if cell_size <= mark - address => {
                visitor(CodeCell {
                    address,
                    payload_length,
                });
                address += cell_size;
            }
            _ => {
                return Err(VisitError {
                    region: region.description(),
                    address,
                });
            }
        }
    }
    Ok(())
}

// =============================================================================
// Bundle Planting
// =============================================================================

/// Stamp the three array cells into freshly reserved memory so a linear
/// scan sees three well-formed headers back-to-back.
///
/// # Safety
/// `start` must point at `layout.bundle_size()` reserved, unpublished
/// bytes.
unsafe fn plant_bundle(start: usize, layout: &BundleLayout, parts: &BundleParts<'_>) {
    // Safety: each cell lies inside the reserved span per the layout.
    unsafe {
        plant_cell(
            start + layout.cell_offset(ArrayField::ScalarLiterals),
            parts.scalar_literals,
        );
        let ref_cell = start + layout.cell_offset(ArrayField::ReferenceLiterals);
        (ref_cell as *mut u64).write((parts.reference_literals.len() * WORD_SIZE) as u64);
        let ref_elements = (ref_cell + CELL_HEADER_SIZE) as *mut u64;
        for (i, &word) in parts.reference_literals.iter().enumerate() {
            ref_elements.add(i).write(word);
        }
        plant_cell(start + layout.cell_offset(ArrayField::Code), parts.code);
    }
}

/// Write one length-prefixed byte cell.
///
/// # Safety
/// `address` must point at enough reserved bytes for the header and
/// payload.
unsafe fn plant_cell(address: usize, payload: &[u8]) {
    // Safety: per the caller's contract; region allocations are
    // word-aligned so the header write is aligned.
    unsafe {
        (address as *mut u64).write(payload.len() as u64);
        std::ptr::copy_nonoverlapping(
            payload.as_ptr(),
            (address + CELL_HEADER_SIZE) as *mut u8,
            payload.len(),
        );
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::safepoint::NopSuspender;

    fn manager() -> CodeManager {
        let manager = CodeManager::new(CodeConfig::small(), Arc::new(NopSuspender));
        manager.bind_runtime_region();
        manager
    }

    fn pending(method: u64, parts: BundleParts<'_>) -> PendingMethod<'_> {
        PendingMethod {
            method: MethodId::new(method),
            tier: 1,
            parts,
            entry_points: EntryPoints::uniform(0),
            frame_size: 16,
            stops: StopTable::empty(),
            catches: CatchTable::empty(),
        }
    }

    #[test]
    fn test_allocates_from_boot_then_runtime() {
        let manager = manager();
        let code = [0xC3u8; 16];
        let parts = BundleParts {
            code: &code,
            scalar_literals: &[],
            reference_literals: &[],
        };

        let in_boot = manager.allocate(&parts.layout(), pending(1, parts));
        assert!(manager.boot_region().contains(in_boot.start()));

        manager.finish_bootstrap();
        let in_runtime = manager.allocate(&parts.layout(), pending(2, parts));
        assert!(manager.runtime_region().contains(in_runtime.start()));
    }

    #[test]
    fn test_planted_bundle_reads_back() {
        let manager = manager();
        let code: Vec<u8> = (0..64u8).collect();
        let scalars = [0xAAu8; 12];
        let refs = [0xDEAD_0001u64, 0xDEAD_0002];
        let parts = BundleParts {
            code: &code,
            scalar_literals: &scalars,
            reference_literals: &refs,
        };
        let layout = parts.layout();
        let method = manager.allocate(&layout, pending(3, parts));

        // Safety: reading back memory the manager just planted.
        unsafe {
            let scalar_len = (method.start() as *const u64).read();
            assert_eq!(scalar_len, 12);
            let code_bytes =
                std::slice::from_raw_parts(method.code_start() as *const u8, method.code_length());
            assert_eq!(code_bytes, &code[..]);
            let ref_words = std::slice::from_raw_parts(
                method.reference_literals_start() as *const u64,
                method.reference_literal_count(),
            );
            assert_eq!(ref_words, &refs[..]);
        }
    }

    #[test]
    fn test_lookup_after_registration() {
        let manager = manager();
        let code = [0x90u8; 32];
        let parts = BundleParts {
            code: &code,
            scalar_literals: &[],
            reference_literals: &[],
        };
        let method = manager.allocate(&parts.layout(), pending(4, parts));

        assert!(manager.code_pointer_to_region(method.start()).is_some());
        let found = manager.code_pointer_to_method(method.code_start() + 5).unwrap();
        assert_eq!(found.start(), method.start());
        assert!(manager.code_pointer_to_method(method.end()).is_none());
    }

    #[test]
    fn test_visit_cells_sees_three_cells_per_bundle() {
        let manager = manager();
        let code = [0x90u8; 40];
        let refs = [7u64];
        let parts = BundleParts {
            code: &code,
            scalar_literals: &[1, 2, 3],
            reference_literals: &refs,
        };
        let layout = parts.layout();
        let method = manager.allocate(&layout, pending(5, parts));

        let mut cells = Vec::new();
        manager
            .visit_cells(&mut |cell| cells.push(cell), true)
            .expect("freshly planted bundles walk cleanly");

        assert_eq!(cells.len(), 3);
        assert_eq!(cells[0].address, method.start());
        assert_eq!(cells[0].payload_length, 3);
        assert_eq!(cells[1].payload_length, 8);
        assert_eq!(cells[2].payload_length, 40);
        // Cells are contiguous and cover the whole bundle.
        assert_eq!(
            cells[2].address + layout.cell_size(ArrayField::Code),
            method.end()
        );
    }

    #[test]
    fn test_visit_cells_covers_multiple_bundles() {
        let manager = manager();
        let code = [0x90u8; 24];
        let parts = BundleParts {
            code: &code,
            scalar_literals: &[],
            reference_literals: &[],
        };
        manager.allocate(&parts.layout(), pending(6, parts));
        manager.allocate(&parts.layout(), pending(7, parts));

        let mut count = 0;
        manager.visit_cells(&mut |_| count += 1, true).unwrap();
        assert_eq!(count, 6);
    }

    #[test]
    fn test_suspender_brackets_allocation() {
        use std::sync::atomic::AtomicUsize;

        #[derive(Default)]
        struct Recorder {
            disables: AtomicUsize,
            enables: AtomicUsize,
        }
        impl SafepointSuspender for Recorder {
            fn disable_safepoints(&self) {
                self.disables.fetch_add(1, Ordering::SeqCst);
            }
            fn enable_safepoints(&self) {
                self.enables.fetch_add(1, Ordering::SeqCst);
            }
        }

        let recorder = Arc::new(Recorder::default());
        let suspender: Arc<dyn SafepointSuspender> = Arc::clone(&recorder);
        let manager = CodeManager::new(CodeConfig::small(), suspender);
        let code = [0x90u8; 8];
        let parts = BundleParts {
            code: &code,
            scalar_literals: &[],
            reference_literals: &[],
        };
        manager.allocate(&parts.layout(), pending(8, parts));

        assert_eq!(recorder.disables.load(Ordering::SeqCst), 1);
        assert_eq!(recorder.enables.load(Ordering::SeqCst), 1);
    }
}
