//! Stack frame layout for one compilation.
//!
//! The frame map collects area sizes while the method is being lowered
//! and turns abstract slot indices into byte offsets only after the
//! register allocator has fixed the spill count. Ordering is enforced by
//! a three-state spill counter:
//!
//! - `-2` (unset): outgoing-argument space may still be reserved
//! - `-1` (reserving): allocation has started handing out spill slots
//! - `n >= 0` (fixed): the frame has been finalized
//!
//! Violating the ordering is a backend bug and fails immediately.
//!
//! # Frame Layout (growing downward)
//! ```text
//! ┌───────────────────────────────┐ High addresses
//! │     Incoming Arguments        │ ← Caller-frame slots (RBP+16+)
//! ├───────────────────────────────┤
//! │     Return Address            │ ← Pushed by CALL (RBP+8)
//! ├───────────────────────────────┤
//! │     Saved RBP                 │ ← RBP points here
//! ├───────────────────────────────┤
//! │     Callee-Saved Registers    │
//! ├───────────────────────────────┤
//! │     Custom Area               │ ← Runtime-defined slots
//! ├───────────────────────────────┤
//! │     Monitors                  │ ← Lock word + object per monitor
//! ├───────────────────────────────┤
//! │     Stack Blocks              │ ← Fixed-size alloca area
//! ├───────────────────────────────┤
//! │     Spill Slots               │
//! ├───────────────────────────────┤
//! │     Alignment Padding         │
//! ├───────────────────────────────┤
//! │     Outgoing Arguments        │
//! └───────────────────────────────┘ ← RSP (16-byte aligned)
//! ```

use crate::operand::{Slot, SlotKind};
use crate::registers::GprSet;

/// Size of a single value slot in bytes.
pub const SLOT_SIZE: i32 = 8;

/// Size of one monitor: lock word plus object word.
pub const MONITOR_SIZE: i32 = 16;

/// Required frame alignment in bytes.
pub const FRAME_ALIGNMENT: i32 = 16;

/// Saved RBP plus return address, separating us from caller-frame slots.
const CALLER_FRAME_BIAS: i32 = 16;

const SPILLS_UNSET: i32 = -2;
const SPILLS_RESERVING: i32 = -1;
const FRAME_SIZE_UNSET: i32 = -1;

/// Stack frame layout under construction for one compiled method.
#[derive(Debug)]
pub struct FrameMap {
    monitor_count: u32,
    custom_area_size: i32,
    callee_save_size: i32,
    outgoing_size: i32,
    stack_blocks_size: i32,
    spill_slot_count: i32,
    frame_size: i32,
}

impl FrameMap {
    /// Create a frame map.
    ///
    /// The monitor count, the runtime's custom area, and the callee-saved
    /// register set are known up front and never change.
    pub fn new(monitor_count: u32, custom_area_size: i32, saved_regs: GprSet) -> Self {
        assert!(custom_area_size >= 0 && custom_area_size % SLOT_SIZE == 0);
        FrameMap {
            monitor_count,
            custom_area_size,
            callee_save_size: saved_regs.count() as i32 * SLOT_SIZE,
            outgoing_size: 0,
            stack_blocks_size: 0,
            spill_slot_count: SPILLS_UNSET,
            frame_size: FRAME_SIZE_UNSET,
        }
    }

    /// Grow the outgoing-argument area to hold at least `size` bytes.
    ///
    /// Legal only before spill-slot reservation begins.
    pub fn reserve_outgoing(&mut self, size: i32) {
        assert_eq!(
            self.spill_slot_count, SPILLS_UNSET,
            "outgoing arguments reserved after spill allocation started"
        );
        assert!(size >= 0);
        self.outgoing_size = self.outgoing_size.max(align_slot(size));
    }

    /// Reserve a block of frame memory (alloca), returning its byte offset
    /// within the stack-block area.
    pub fn reserve_stack_block(&mut self, size: i32) -> i32 {
        assert_eq!(
            self.frame_size, FRAME_SIZE_UNSET,
            "stack block reserved after frame finalization"
        );
        assert!(size > 0);
        let offset = self.stack_blocks_size;
        self.stack_blocks_size += align_slot(size);
        offset
    }

    /// Mark the start of spill-slot reservation by the register allocator.
    ///
    /// After this, `reserve_outgoing` is no longer legal.
    pub fn begin_spilling(&mut self) {
        assert_eq!(
            self.spill_slot_count, SPILLS_UNSET,
            "spill reservation started twice"
        );
        self.spill_slot_count = SPILLS_RESERVING;
    }

    /// Fix the spill-slot count and compute the final frame size.
    ///
    /// Callable exactly once, after `begin_spilling`.
    pub fn finalize_frame(&mut self, spill_slot_count: i32) {
        assert_eq!(
            self.spill_slot_count, SPILLS_RESERVING,
            "frame finalized out of order"
        );
        assert!(spill_slot_count >= 0);
        assert_eq!(self.frame_size, FRAME_SIZE_UNSET, "frame finalized twice");

        self.spill_slot_count = spill_slot_count;
        let content = self.outgoing_size
            + self.custom_area_size
            + spill_slot_count * SLOT_SIZE
            + self.monitor_count as i32 * MONITOR_SIZE
            + self.stack_blocks_size
            + self.callee_save_size;
        self.frame_size = align_frame(content);
    }

    /// Number of monitors in this frame.
    #[inline]
    pub fn monitor_count(&self) -> u32 {
        self.monitor_count
    }

    /// The finalized frame size in bytes.
    #[inline]
    pub fn frame_size(&self) -> i32 {
        assert!(self.frame_size != FRAME_SIZE_UNSET, "frame not finalized");
        self.frame_size
    }

    /// Whether the frame has been finalized.
    #[inline]
    pub fn is_finalized(&self) -> bool {
        self.frame_size != FRAME_SIZE_UNSET
    }

    // =========================================================================
    // Address Resolution
    // =========================================================================

    // Area low bounds, as negative offsets from the frame pointer.

    fn custom_area_low(&self) -> i32 {
        -(self.callee_save_size + self.custom_area_size)
    }

    fn monitor_area_low(&self) -> i32 {
        self.custom_area_low() - self.monitor_count as i32 * MONITOR_SIZE
    }

    fn stack_block_area_low(&self) -> i32 {
        self.monitor_area_low() - self.stack_blocks_size
    }

    fn spill_area_low(&self) -> i32 {
        self.stack_block_area_low() - self.spill_slot_count * SLOT_SIZE
    }

    /// Resolve an abstract slot to a frame-pointer-relative byte offset.
    ///
    /// Caller-frame slots resolve past the return address; current-frame
    /// slots resolve into the locally reserved area and require the frame
    /// to be finalized.
    pub fn address_of(&self, slot: Slot) -> i32 {
        match slot.kind() {
            SlotKind::CallerArg => CALLER_FRAME_BIAS + slot.index() as i32 * SLOT_SIZE,
            SlotKind::Spill => {
                assert!(self.is_finalized(), "spill address before finalization");
                assert!((slot.index() as i32) < self.spill_slot_count);
                self.spill_area_low() + slot.index() as i32 * SLOT_SIZE
            }
            SlotKind::Outgoing => {
                assert!(self.is_finalized(), "outgoing address before finalization");
                assert!(slot.index() as i32 * SLOT_SIZE < self.outgoing_size);
                -self.frame_size + slot.index() as i32 * SLOT_SIZE
            }
        }
    }

    /// Frame-pointer-relative offset of a monitor's lock word.
    pub fn monitor_address(&self, index: u32) -> i32 {
        assert!(index < self.monitor_count);
        self.monitor_area_low() + index as i32 * MONITOR_SIZE
    }

    /// Frame-pointer-relative offset of a monitor's object word.
    ///
    /// This is the slot a reference map marks when the monitor is held.
    pub fn monitor_object_address(&self, index: u32) -> i32 {
        self.monitor_address(index) + SLOT_SIZE
    }

    /// Frame-pointer-relative offset of a reserved stack block.
    pub fn stack_block_address(&self, block_offset: i32) -> i32 {
        assert!(block_offset >= 0 && block_offset < self.stack_blocks_size);
        self.stack_block_area_low() + block_offset
    }

    /// Convert a current-frame offset into a reference-map slot index.
    ///
    /// Slot 0 is the lowest word of the frame (at RSP once the prologue
    /// has run).
    pub fn slot_index_for_offset(&self, fp_offset: i32) -> u32 {
        let from_sp = fp_offset + self.frame_size();
        assert!(
            from_sp >= 0 && from_sp < self.frame_size(),
            "offset {} outside the frame",
            fp_offset
        );
        assert_eq!(from_sp % SLOT_SIZE, 0, "unaligned frame offset {}", fp_offset);
        (from_sp / SLOT_SIZE) as u32
    }

    /// Number of reference-map slots covering this frame.
    pub fn reference_slot_count(&self) -> u32 {
        (self.frame_size() / SLOT_SIZE) as u32
    }

    /// Bytes needed for one frame reference map.
    pub fn reference_map_size(&self) -> u32 {
        self.reference_slot_count().div_ceil(8)
    }
}

#[inline]
fn align_slot(size: i32) -> i32 {
    (size + SLOT_SIZE - 1) & !(SLOT_SIZE - 1)
}

#[inline]
fn align_frame(size: i32) -> i32 {
    (size + FRAME_ALIGNMENT - 1) & !(FRAME_ALIGNMENT - 1)
}

// =============================================================================
// Tests
// =============================================================================
