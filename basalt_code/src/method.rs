//! Compiled methods.
//!
//! A `CompiledMethod` describes one machine-code version of a logical
//! method: where its bundle lives, how to enter it, and the metadata stack
//! walkers, exception dispatch, and the collector need to interpret its
//! frames. Once placed in a region the bundle is immutable; the single
//! mutable field is the write-once forward pointer set when the method is
//! superseded by a recompilation.

use crate::bundle::{ArrayField, BundleLayout};
use std::fmt;
use std::sync::{Arc, OnceLock};

// =============================================================================
// Method Identity
// =============================================================================

/// Identifier of a logical method, stable across recompilations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MethodId(u64);

impl MethodId {
    /// Create a method id from a raw value.
    #[inline]
    pub const fn new(raw: u64) -> Self {
        MethodId(raw)
    }

    /// Get the raw value.
    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for MethodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "m{}", self.0)
    }
}

// =============================================================================
// Entry Points
// =============================================================================

/// The calling conventions a bundle can be entered through.
///
/// Each kind names an offset into the code array: callers with different
/// linkage jump to different prologues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EntryKind {
    /// Entry used by virtual-dispatch table slots.
    VtableDispatch = 0,
    /// Entry used by baseline-compiled callers.
    Baseline = 1,
    /// Entry used by optimizing-compiled callers.
    Optimized = 2,
    /// Entry used by native/foreign callers.
    Native = 3,
}

impl EntryKind {
    /// Number of entry kinds.
    pub const COUNT: usize = 4;

    /// All entry kinds.
    pub const ALL: [EntryKind; EntryKind::COUNT] = [
        EntryKind::VtableDispatch,
        EntryKind::Baseline,
        EntryKind::Optimized,
        EntryKind::Native,
    ];

    #[inline]
    const fn index(self) -> usize {
        self as usize
    }
}

/// Per-entry-kind offsets into a bundle's code array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EntryPoints {
    offsets: [u32; EntryKind::COUNT],
}

impl EntryPoints {
    /// Create from explicit offsets, one per entry kind.
    pub const fn new(offsets: [u32; EntryKind::COUNT]) -> Self {
        EntryPoints { offsets }
    }

    /// All entry kinds share one prologue at `offset`.
    pub const fn uniform(offset: u32) -> Self {
        EntryPoints {
            offsets: [offset; EntryKind::COUNT],
        }
    }

    /// Code-relative offset for an entry kind.
    #[inline]
    pub const fn offset_of(&self, kind: EntryKind) -> u32 {
        self.offsets[kind.index()]
    }
}

// =============================================================================
// Stop Positions
// =============================================================================

/// High bit of a stop position: the call at this stop returns a
/// reference.
pub const REFERENCE_RETURN_FLAG: u32 = 0x8000_0000;

/// Bytes per register reference map (a 16-bit GPR bitmap).
pub const REGISTER_REFERENCE_MAP_SIZE: usize = 2;

/// Stop positions and their reference maps for one compiled method.
///
/// Positions are stored in three contiguous segments: direct calls,
/// indirect calls, safepoints. Reference maps follow the same order:
/// one frame map per stop, then one register map per safepoint.
#[derive(Debug, Default)]
pub struct StopTable {
    positions: Box<[u32]>,
    direct_call_count: u32,
    indirect_call_count: u32,
    safepoint_count: u32,
    /// Logical callee per direct call, used by call linking; empty when
    /// callees are unresolved.
    direct_callees: Box<[MethodId]>,
    reference_maps: Box<[u8]>,
    frame_reference_map_size: u32,
}

impl StopTable {
    /// Create a stop table.
    ///
    /// `positions` must hold the three segments back-to-back;
    /// `reference_maps` must be sized for one frame map per stop plus one
    /// register map per safepoint (or be empty when the method has no
    /// stops that need maps).
    pub fn new(
        positions: Vec<u32>,
        direct_call_count: u32,
        indirect_call_count: u32,
        safepoint_count: u32,
        reference_maps: Vec<u8>,
        frame_reference_map_size: u32,
    ) -> Self {
        assert_eq!(
            positions.len(),
            (direct_call_count + indirect_call_count + safepoint_count) as usize,
            "stop positions do not cover the three segments"
        );
        assert!(
            reference_maps.is_empty()
                || reference_maps.len()
                    == frame_reference_map_size as usize * positions.len()
                        + REGISTER_REFERENCE_MAP_SIZE * safepoint_count as usize,
            "reference maps are not sized for {} stops and {} safepoints",
            positions.len(),
            safepoint_count
        );
        StopTable {
            positions: positions.into_boxed_slice(),
            direct_call_count,
            indirect_call_count,
            safepoint_count,
            direct_callees: Box::default(),
            reference_maps: reference_maps.into_boxed_slice(),
            frame_reference_map_size,
        }
    }

    /// Attach the resolved callee of each direct call, in stop order.
    pub fn with_direct_callees(mut self, callees: Vec<MethodId>) -> Self {
        assert_eq!(
            callees.len() as u32, self.direct_call_count,
            "one callee per direct call"
        );
        self.direct_callees = callees.into_boxed_slice();
        self
    }

    /// A table with no stops.
    pub fn empty() -> Self {
        StopTable::default()
    }

    #[inline]
    fn len(&self) -> usize {
        self.positions.len()
    }

    #[inline]
    fn frame_maps_size(&self) -> usize {
        self.frame_reference_map_size as usize * self.len()
    }
}

// =============================================================================
// Catch Table
// =============================================================================

/// Exception dispatch ranges for one compiled method.
///
/// Range `n` covers code positions `[range_positions[n] ..
/// range_positions[n+1])` (the last range runs to the end of the code),
/// and dispatches to `block_positions[n]`; a block position of 0 marks a
/// range with no local handler.
#[derive(Debug, Default)]
pub struct CatchTable {
    range_positions: Box<[u32]>,
    block_positions: Box<[u32]>,
}

impl CatchTable {
    /// Create a catch table.
    pub fn new(range_positions: Vec<u32>, block_positions: Vec<u32>) -> Self {
        assert_eq!(
            range_positions.len(),
            block_positions.len(),
            "catch ranges and blocks must pair up"
        );
        debug_assert!(range_positions.windows(2).all(|w| w[0] < w[1]));
        CatchTable {
            range_positions: range_positions.into_boxed_slice(),
            block_positions: block_positions.into_boxed_slice(),
        }
    }

    /// A table with no handlers.
    pub fn empty() -> Self {
        CatchTable::default()
    }
}

// =============================================================================
// CompiledMethod
// =============================================================================

/// One machine-code version of a logical method, placed in a code region.
#[derive(Debug)]
pub struct CompiledMethod {
    method: MethodId,
    /// Compilation tier that produced this version (1 = baseline,
    /// 2 = optimized).
    tier: u8,
    /// Absolute start address of the bundle.
    start: usize,
    layout: BundleLayout,
    entry_points: EntryPoints,
    /// Activation frame size in bytes.
    frame_size: u32,
    stops: StopTable,
    catches: CatchTable,
    /// Set exactly once, when this version is superseded.
    forward: OnceLock<Arc<CompiledMethod>>,
}

impl CompiledMethod {
    /// Describe a bundle planted at `start` with the given layout.
    pub fn new(
        method: MethodId,
        tier: u8,
        start: usize,
        layout: BundleLayout,
        entry_points: EntryPoints,
        frame_size: u32,
        stops: StopTable,
        catches: CatchTable,
    ) -> Self {
        CompiledMethod {
            method,
            tier,
            start,
            layout,
            entry_points,
            frame_size,
            stops,
            catches,
            forward: OnceLock::new(),
        }
    }

    /// The logical method this bundle compiles.
    #[inline]
    pub fn method(&self) -> MethodId {
        self.method
    }

    /// The compilation tier.
    #[inline]
    pub fn tier(&self) -> u8 {
        self.tier
    }

    /// Bundle start address.
    #[inline]
    pub fn start(&self) -> usize {
        self.start
    }

    /// Total bundle size in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.layout.bundle_size()
    }

    /// One past the last bundle byte.
    #[inline]
    pub fn end(&self) -> usize {
        self.start + self.size()
    }

    /// Check whether an address falls inside the bundle.
    #[inline]
    pub fn contains(&self, address: usize) -> bool {
        address >= self.start && address < self.end()
    }

    /// The bundle layout.
    #[inline]
    pub fn layout(&self) -> &BundleLayout {
        &self.layout
    }

    /// Activation frame size in bytes.
    #[inline]
    pub fn frame_size(&self) -> u32 {
        self.frame_size
    }

    /// Address of the first machine-code byte.
    #[inline]
    pub fn code_start(&self) -> usize {
        self.start + self.layout.element_offset(ArrayField::Code)
    }

    /// Machine-code length in bytes.
    #[inline]
    pub fn code_length(&self) -> usize {
        self.layout.length(ArrayField::Code)
    }

    /// Address of the scalar-literal payload.
    #[inline]
    pub fn scalar_literals_start(&self) -> usize {
        self.start + self.layout.element_offset(ArrayField::ScalarLiterals)
    }

    /// Address of the reference-literal payload.
    #[inline]
    pub fn reference_literals_start(&self) -> usize {
        self.start + self.layout.element_offset(ArrayField::ReferenceLiterals)
    }

    /// Number of reference-literal words.
    #[inline]
    pub fn reference_literal_count(&self) -> usize {
        self.layout.length(ArrayField::ReferenceLiterals) / crate::bundle::WORD_SIZE
    }

    /// Absolute entry address for a calling convention.
    #[inline]
    pub fn entry_point(&self, kind: EntryKind) -> usize {
        self.code_start() + self.entry_points.offset_of(kind) as usize
    }

    // =========================================================================
    // Stop Positions
    // =========================================================================

    /// Total number of stop positions.
    #[inline]
    pub fn number_of_stop_positions(&self) -> usize {
        self.stops.len()
    }

    /// Number of direct-call stops.
    #[inline]
    pub fn number_of_direct_calls(&self) -> usize {
        self.stops.direct_call_count as usize
    }

    /// Number of indirect-call stops.
    #[inline]
    pub fn number_of_indirect_calls(&self) -> usize {
        self.stops.indirect_call_count as usize
    }

    /// Number of safepoint stops.
    #[inline]
    pub fn number_of_safepoints(&self) -> usize {
        self.stops.safepoint_count as usize
    }

    /// Code-relative position of a stop, flag bit stripped.
    #[inline]
    pub fn stop_position(&self, stop_index: usize) -> u32 {
        self.stops.positions[stop_index] & !REFERENCE_RETURN_FLAG
    }

    /// Whether the call at this stop returns a reference.
    #[inline]
    pub fn is_reference_call(&self, stop_index: usize) -> bool {
        (self.stops.positions[stop_index] & REFERENCE_RETURN_FLAG) != 0
    }

    /// Find the safepoint whose position matches `address` exactly.
    pub fn find_safepoint_index(&self, address: usize) -> Option<usize> {
        let position = address.checked_sub(self.code_start())? as u32;
        let first = self.number_of_direct_calls() + self.number_of_indirect_calls();
        (0..self.number_of_safepoints())
            .find(|&i| self.stop_position(first + i) == position)
    }

    /// Check whether `address` is a safepoint in this method.
    pub fn is_safepoint_at(&self, address: usize) -> bool {
        self.find_safepoint_index(address).is_some()
    }

    /// Find the stop governing `address`.
    ///
    /// A safepoint matches its position exactly. Calls are matched by the
    /// return address, which points one instruction past the stop, so the
    /// closest call position strictly below the target wins.
    pub fn find_closest_stop_index(&self, address: usize) -> Option<usize> {
        let position = address.checked_sub(self.code_start())? as u32;
        if position as usize > self.code_length() {
            return None;
        }

        let first_safepoint = self.number_of_direct_calls() + self.number_of_indirect_calls();
        for i in first_safepoint..self.number_of_stop_positions() {
            if self.stop_position(i) == position {
                return Some(i);
            }
        }

        let mut best: Option<usize> = None;
        for i in 0..first_safepoint {
            let stop = self.stop_position(i);
            if stop < position
                && best.map_or(true, |b| stop > self.stop_position(b))
            {
                best = Some(i);
            }
        }
        best
    }

    /// The resolved callee of a direct-call stop, if linking data was
    /// attached.
    pub fn direct_callee(&self, stop_index: usize) -> Option<MethodId> {
        self.stops.direct_callees.get(stop_index).copied()
    }

    /// Map a direct call site (by its return address) to its callee.
    ///
    /// Used by the trampoline subsystem to relink call sites once the
    /// callee is compiled.
    pub fn call_site_to_callee(&self, call_site: usize) -> Option<MethodId> {
        let offset = call_site.checked_sub(self.code_start())? as u32;
        (0..self.number_of_direct_calls())
            .find(|&i| self.stop_position(i) == offset)
            .and_then(|i| self.direct_callee(i))
    }

    /// Frame reference map bytes for a stop.
    pub fn frame_reference_map_for(&self, stop_index: usize) -> &[u8] {
        assert!(stop_index < self.stops.len(), "stop index out of range");
        let size = self.stops.frame_reference_map_size as usize;
        let offset = stop_index * size;
        &self.stops.reference_maps[offset..offset + size]
    }

    /// Register reference map for a safepoint, as a GPR bitmap.
    pub fn register_reference_map_for(&self, safepoint_index: usize) -> u16 {
        assert!(
            safepoint_index < self.number_of_safepoints(),
            "safepoint index out of range"
        );
        // Register maps sit after all the frame maps.
        let offset =
            self.stops.frame_maps_size() + REGISTER_REFERENCE_MAP_SIZE * safepoint_index;
        u16::from_le_bytes([
            self.stops.reference_maps[offset],
            self.stops.reference_maps[offset + 1],
        ])
    }

    // =========================================================================
    // Exception Dispatch
    // =========================================================================

    /// Map a throwing instruction address to its handler's address.
    ///
    /// Returns `None` when the covering range has no local handler and
    /// the exception must unwind to the caller.
    pub fn throw_address_to_catch_address(&self, throw_address: usize) -> Option<usize> {
        let ranges = &self.catches.range_positions;
        if ranges.is_empty() {
            return None;
        }
        let throw_offset = throw_address.checked_sub(self.code_start())? as u32;
        for i in (0..ranges.len()).rev() {
            if throw_offset >= ranges[i] {
                let block = self.catches.block_positions[i];
                if block == 0 {
                    return None;
                }
                return Some(self.code_start() + block as usize);
            }
        }
        None
    }

    // =========================================================================
    // Forwarding
    // =========================================================================

    /// Redirect this superseded version to its replacement.
    ///
    /// May be called exactly once per version; the bundle stays valid
    /// memory but every resolution through it now reaches `new`.
    pub fn forward_to(&self, new: Arc<CompiledMethod>) {
        assert_eq!(
            self.method, new.method,
            "forwarding across logical methods"
        );
        assert_ne!(self.start, new.start, "method forwarded to itself");
        assert!(
            self.forward.set(new).is_ok(),
            "compiled method forwarded twice"
        );
    }

    /// The replacement version, if this one has been superseded.
    pub fn forwarded_to(&self) -> Option<Arc<CompiledMethod>> {
        self.forward.get().cloned()
    }

    /// Whether this version has been superseded.
    #[inline]
    pub fn is_superseded(&self) -> bool {
        self.forward.get().is_some()
    }

    /// Follow forward pointers to the version currently in effect.
    ///
    /// Forwarding always points from an older bundle to a newer one, so
    /// the chain terminates; resolution is a bounded walk, not a search.
    pub fn resolve(self: &Arc<Self>) -> Arc<CompiledMethod> {
        let mut current = Arc::clone(self);
        while let Some(next) = current.forward.get().cloned() {
            current = next;
        }
        current
    }
}

impl fmt::Display for CompiledMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} tier{} [{:#x}..{:#x})",
            self.method,
            self.tier,
            self.start,
            self.end()
        )
    }
}

// =============================================================================
// Tests
// =============================================================================
