//! Low-level IR backend for the Basalt VM.
//!
//! This crate owns the last mile of compilation:
//! - Linear IR: operands, instructions, blocks, and the per-method
//!   container with its two block orderings
//! - Frame layout via `FrameMap`, finalized once register allocation has
//!   fixed the spill count
//! - Machine-code emission through `LirAssembler`, with the
//!   architecture-specific encoder behind a narrow trait
//! - Debug/deopt metadata translation into GC reference maps
//!
//! The register allocator and the concrete instruction encoders are
//! collaborators, not residents: this crate defines the data structures
//! and protocols they must agree on.
#![deny(unsafe_op_in_unsafe_fn)]

pub mod asm;
pub mod assembler;
pub mod bitset;
pub mod block;
pub mod container;
pub mod debug_info;
pub mod frame_map;
pub mod instruction;
pub mod list;
pub mod operand;
pub mod registers;

pub use asm::{CodeBuffer, LabelId};
pub use assembler::{
    CompiledCode, EmitContext, EmitError, InstructionEncoder, LirAssembler, StopKind, StopRecord,
};
pub use bitset::BitSet;
pub use block::{BlockId, LirBlock};
pub use container::Lir;
pub use debug_info::{FrameState, LirDebugInfo, ReferenceMap, StateValue};
pub use frame_map::{FrameMap, FRAME_ALIGNMENT, MONITOR_SIZE, SLOT_SIZE};
pub use instruction::{AllocationAssignment, Condition, InstrId, LirInstruction, Opcode};
pub use list::LirList;
pub use operand::{Constant, Operand, Slot, SlotKind, VarId};
pub use registers::{CallingConvention, Gpr, GprSet};
