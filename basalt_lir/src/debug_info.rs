//! Debug and deopt metadata for stop positions.
//!
//! An instruction that can stop the thread (a call, a safepoint poll, an
//! implicit throw) carries a snapshot of the source-level frame state:
//! locals, operand stack, and held monitors, each entry a constant, a
//! register, a stack slot, or a virtual object whose fields are known
//! statically but not yet materialized. [`LirDebugInfo::init_debug_info`]
//! flattens that snapshot into the concrete reference maps the collector
//! consults if it interrupts the method at this instruction.

use crate::bitset::BitSet;
use crate::frame_map::FrameMap;
use crate::operand::{Constant, Slot};
use crate::registers::Gpr;

// =============================================================================
// Frame State
// =============================================================================

/// One entry of the source-level frame state at a stop.
#[derive(Debug, Clone)]
pub enum StateValue {
    /// A compile-time constant; nothing to mark.
    Constant(Constant),
    /// Value currently held in a machine register.
    Register { reg: Gpr, reference: bool },
    /// Value currently held in a stack slot.
    StackSlot { slot: Slot, reference: bool },
    /// Placeholder for the object word of a held monitor, resolved to a
    /// concrete frame address through the frame map.
    MonitorObject { index: u32 },
    /// An object whose fields are known statically but which has not been
    /// materialized; its reference fields must be marked wherever they
    /// currently live.
    VirtualObject { fields: Vec<StateValue> },
}

/// Source-level frame state captured at one stop position.
#[derive(Debug, Clone, Default)]
pub struct FrameState {
    pub locals: Vec<StateValue>,
    pub stack: Vec<StateValue>,
    /// Indices of monitors held at this point.
    pub monitors: Vec<u32>,
}

// =============================================================================
// LirDebugInfo
// =============================================================================

/// Debug/deopt metadata attached to one stop instruction.
#[derive(Debug, Clone)]
pub struct LirDebugInfo {
    /// Bytecode position this machine state corresponds to.
    pub bytecode_index: u32,
    /// The call at this stop returns a heap reference.
    pub reference_return: bool,
    /// The abstract frame state.
    pub state: FrameState,
}

impl LirDebugInfo {
    /// Create debug info for a stop at `bytecode_index`.
    pub fn new(bytecode_index: u32, state: FrameState) -> Self {
        LirDebugInfo {
            bytecode_index,
            reference_return: false,
            state,
        }
    }

    /// Mark the stop as a reference-returning call.
    pub fn with_reference_return(mut self) -> Self {
        self.reference_return = true;
        self
    }

    /// Translate the abstract frame state into concrete reference maps.
    ///
    /// Virtual objects are expanded recursively; monitor placeholders are
    /// resolved to frame offsets through `frame_map`. Requires a finalized
    /// frame.
    pub fn init_debug_info(&self, frame_map: &FrameMap) -> ReferenceMap {
        let mut map = ReferenceMap::new();
        for value in self.state.locals.iter().chain(self.state.stack.iter()) {
            record(value, frame_map, &mut map);
        }
        for &index in &self.state.monitors {
            map.mark_slot(frame_map.slot_index_for_offset(frame_map.monitor_object_address(index)));
        }
        map
    }
}

fn record(value: &StateValue, frame_map: &FrameMap, map: &mut ReferenceMap) {
    match value {
        StateValue::Constant(_) => {}
        StateValue::Register { reg, reference } => {
            if *reference {
                map.mark_register(*reg);
            }
        }
        StateValue::StackSlot { slot, reference } => {
            // Slots in the caller's frame belong to the caller's map.
            if *reference && !slot.in_caller_frame() {
                map.mark_slot(frame_map.slot_index_for_offset(frame_map.address_of(*slot)));
            }
        }
        StateValue::MonitorObject { index } => {
            map.mark_slot(frame_map.slot_index_for_offset(frame_map.monitor_object_address(*index)));
        }
        StateValue::VirtualObject { fields } => {
            for field in fields {
                record(field, frame_map, map);
            }
        }
    }
}

// =============================================================================
// Reference Map
// =============================================================================

/// Which registers and frame slots hold heap references at one stop.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReferenceMap {
    /// Register bitmap: bit N = register with encoding N.
    pub registers: u16,
    /// Frame-slot bitmap: bit N = slot N, counted up from RSP.
    pub frame_slots: BitSet,
}

impl ReferenceMap {
    /// Create an empty map.
    pub fn new() -> Self {
        ReferenceMap::default()
    }

    /// Mark a register as holding a reference.
    #[inline]
    pub fn mark_register(&mut self, reg: Gpr) {
        self.registers |= 1 << reg.encoding();
    }

    /// Mark a frame slot as holding a reference.
    #[inline]
    pub fn mark_slot(&mut self, slot_index: u32) {
        self.frame_slots.set(slot_index as usize);
    }

    /// Check whether a register is marked.
    #[inline]
    pub fn is_register_live(&self, reg: Gpr) -> bool {
        (self.registers & (1 << reg.encoding())) != 0
    }

    /// Check whether a frame slot is marked.
    #[inline]
    pub fn is_slot_live(&self, slot_index: u32) -> bool {
        self.frame_slots.get(slot_index as usize)
    }

    /// Serialize the frame-slot bitmap into `size` little-endian bytes.
    pub fn frame_slot_bytes(&self, size: usize) -> Vec<u8> {
        self.frame_slots.to_le_bytes(size)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registers::GprSet;

    /// One monitor, no custom area, 24 bytes outgoing, 2 spills.
    /// Frame: 24 out + 16 spills + 16 monitor = 56, aligned to 64.
    fn frame_map() -> FrameMap {
        let mut map = FrameMap::new(1, 0, GprSet::EMPTY);
        map.reserve_outgoing(24);
        map.begin_spilling();
        map.finalize_frame(2);
        map
    }

    #[test]
    fn test_registers_and_slots_marked() {
        let map = frame_map();
        let info = LirDebugInfo::new(
            10,
            FrameState {
                locals: vec![
                    StateValue::Register {
                        reg: Gpr::Rcx,
                        reference: true,
                    },
                    StateValue::Register {
                        reg: Gpr::Rdx,
                        reference: false,
                    },
                ],
                stack: vec![StateValue::StackSlot {
                    slot: Slot::spill(0),
                    reference: true,
                }],
                monitors: vec![],
            },
        );

        let refs = info.init_debug_info(&map);
        assert!(refs.is_register_live(Gpr::Rcx));
        assert!(!refs.is_register_live(Gpr::Rdx));

        // Spill 0 sits at fp-32 (16 monitor + 16 spills above it),
        // which is slot (64-32)/8 = 4 from RSP.
        assert_eq!(map.address_of(Slot::spill(0)), -32);
        assert!(refs.is_slot_live(4));
        assert_eq!(refs.frame_slots.cardinality(), 1);
    }

    #[test]
    fn test_caller_frame_slots_are_skipped() {
        let map = frame_map();
        let info = LirDebugInfo::new(
            0,
            FrameState {
                locals: vec![StateValue::StackSlot {
                    slot: Slot::caller_arg(0),
                    reference: true,
                }],
                stack: vec![],
                monitors: vec![],
            },
        );
        let refs = info.init_debug_info(&map);
        assert_eq!(refs.registers, 0);
        assert!(refs.frame_slots.is_empty());
    }

    #[test]
    fn test_virtual_object_expansion() {
        let map = frame_map();
        let nested = StateValue::VirtualObject {
            fields: vec![
                StateValue::Register {
                    reg: Gpr::R8,
                    reference: true,
                },
                StateValue::Constant(Constant::Word(3)),
            ],
        };
        let info = LirDebugInfo::new(
            0,
            FrameState {
                locals: vec![],
                stack: vec![StateValue::VirtualObject {
                    fields: vec![
                        nested,
                        StateValue::StackSlot {
                            slot: Slot::spill(1),
                            reference: true,
                        },
                    ],
                }],
                monitors: vec![],
            },
        );

        let refs = info.init_debug_info(&map);
        assert!(refs.is_register_live(Gpr::R8));
        // Spill 1 at fp-24 => slot 5.
        assert!(refs.is_slot_live(5));
    }

    #[test]
    fn test_monitor_resolution() {
        let map = frame_map();
        let info = LirDebugInfo::new(
            0,
            FrameState {
                locals: vec![],
                stack: vec![],
                monitors: vec![0],
            },
        );
        let refs = info.init_debug_info(&map);
        // Monitor area occupies fp-16..fp; the object word is at fp-8,
        // slot (64-8)/8 = 7.
        assert_eq!(map.monitor_object_address(0), -8);
        assert!(refs.is_slot_live(7));
    }

    #[test]
    fn test_frame_slot_bytes() {
        let map = frame_map();
        let info = LirDebugInfo::new(
            0,
            FrameState {
                locals: vec![],
                stack: vec![],
                monitors: vec![0],
            },
        );
        let refs = info.init_debug_info(&map);
        let bytes = refs.frame_slot_bytes(map.reference_map_size() as usize);
        assert_eq!(bytes, vec![0b1000_0000]);
    }
}
