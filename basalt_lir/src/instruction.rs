//! LIR instructions.
//!
//! An instruction declares its operand arity at construction and keeps it
//! for life. Before register allocation, value operands are
//! `Operand::Variable`; allocation produces a *new* finalized instruction
//! through [`LirInstruction::map_operands`] instead of mutating operand
//! arrays in place, so a pass can always tell which form it is holding.

use crate::debug_info::LirDebugInfo;
use crate::operand::{Operand, VarId};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use std::fmt;

// =============================================================================
// Instruction Id
// =============================================================================

/// Numeric id assigned to an instruction when the block list is numbered.
///
/// Ids advance by 2 in numbering order; odd ids stay free for moves the
/// register allocator inserts between existing instructions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstrId(u32);

impl InstrId {
    /// The unassigned id.
    pub const INVALID: InstrId = InstrId(u32::MAX);

    /// Create from a raw value.
    #[inline]
    pub const fn new(raw: u32) -> Self {
        InstrId(raw)
    }

    /// Get the raw value.
    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Check if this id has been assigned.
    #[inline]
    pub const fn is_valid(self) -> bool {
        self.0 != u32::MAX
    }
}

// =============================================================================
// Opcodes and Conditions
// =============================================================================

/// LIR opcodes.
///
/// A representative subset: enough for moves, arithmetic, control flow,
/// calls, and safepoint polls. The full machine instruction set belongs to
/// the encoder behind the emission interface, not to the IR.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    /// Copy input 0 to the result.
    Move,
    Add,
    Sub,
    And,
    Or,
    Xor,
    /// Compare inputs 0 and 1, setting machine flags.
    Cmp,
    /// Unconditional jump to the target block.
    Jump,
    /// Conditional jump to the target block (condition from a prior Cmp).
    Branch,
    /// Call; input 0 is the callee (constant address or register).
    Call,
    /// Return; input 0 is the value, or illegal for void.
    Return,
    /// GC safepoint poll.
    SafepointPoll,
    Nop,
}

/// Branch conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Condition {
    Always,
    Equal,
    NotEqual,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
}

// =============================================================================
// LirInstruction
// =============================================================================

/// A single linear IR instruction.
#[derive(Debug)]
pub struct LirInstruction {
    opcode: Opcode,
    condition: Condition,
    result: Operand,
    inputs: SmallVec<[Operand; 2]>,
    temps: SmallVec<[Operand; 2]>,
    target: Option<crate::block::BlockId>,
    debug_info: Option<Box<LirDebugInfo>>,
    id: InstrId,
}

impl LirInstruction {
    /// Create an instruction with the given operand shape.
    pub fn new(
        opcode: Opcode,
        result: Operand,
        inputs: SmallVec<[Operand; 2]>,
        temps: SmallVec<[Operand; 2]>,
    ) -> Self {
        LirInstruction {
            opcode,
            condition: Condition::Always,
            result,
            inputs,
            temps,
            target: None,
            debug_info: None,
            id: InstrId::INVALID,
        }
    }

    /// Set the branch condition.
    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.condition = condition;
        self
    }

    /// Set the branch target block.
    pub fn with_target(mut self, target: crate::block::BlockId) -> Self {
        self.target = Some(target);
        self
    }

    /// Attach debug/deopt metadata for this instruction.
    pub fn with_debug_info(mut self, info: LirDebugInfo) -> Self {
        self.debug_info = Some(Box::new(info));
        self
    }

    /// Get the opcode.
    #[inline]
    pub fn opcode(&self) -> Opcode {
        self.opcode
    }

    /// Get the branch condition.
    #[inline]
    pub fn condition(&self) -> Condition {
        self.condition
    }

    /// Get the result operand.
    #[inline]
    pub fn result(&self) -> Operand {
        self.result
    }

    /// Get the input operands.
    #[inline]
    pub fn inputs(&self) -> &[Operand] {
        &self.inputs
    }

    /// Get the temp operands.
    #[inline]
    pub fn temps(&self) -> &[Operand] {
        &self.temps
    }

    /// Get the branch target, if any.
    #[inline]
    pub fn target(&self) -> Option<crate::block::BlockId> {
        self.target
    }

    /// Get the attached debug info, if any.
    #[inline]
    pub fn debug_info(&self) -> Option<&LirDebugInfo> {
        self.debug_info.as_deref()
    }

    /// Get the numbering id.
    #[inline]
    pub fn id(&self) -> InstrId {
        self.id
    }

    pub(crate) fn set_id(&mut self, id: InstrId) {
        self.id = id;
    }

    /// Check whether every value operand has a concrete location.
    pub fn is_finalized(&self) -> bool {
        !self.result.is_variable()
            && self.inputs.iter().all(|op| !op.is_variable())
            && self.temps.iter().all(|op| !op.is_variable())
    }

    /// Produce the post-allocation form of this instruction.
    ///
    /// Variables are replaced through `assignment`; every other operand
    /// passes through unchanged, and the operand arity is preserved.
    /// Ids and attached metadata carry over.
    pub fn map_operands(&self, assignment: &AllocationAssignment) -> LirInstruction {
        let map = |op: Operand| match op {
            Operand::Variable(v) => assignment.location_of(v),
            other => other,
        };
        let mapped = LirInstruction {
            opcode: self.opcode,
            condition: self.condition,
            result: map(self.result),
            inputs: self.inputs.iter().copied().map(map).collect(),
            temps: self.temps.iter().copied().map(map).collect(),
            target: self.target,
            debug_info: self.debug_info.clone(),
            id: self.id,
        };
        debug_assert_eq!(mapped.inputs.len(), self.inputs.len());
        debug_assert_eq!(mapped.temps.len(), self.temps.len());
        debug_assert!(mapped.is_finalized());
        mapped
    }
}

impl fmt::Display for LirInstruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.opcode)?;
        if self.condition != Condition::Always {
            write!(f, ".{:?}", self.condition)?;
        }
        if !self.result.is_illegal() {
            write!(f, " {} <-", self.result)?;
        }
        for input in &self.inputs {
            write!(f, " {}", input)?;
        }
        if let Some(target) = self.target {
            write!(f, " -> {}", target)?;
        }
        Ok(())
    }
}

// =============================================================================
// Allocation Assignment
// =============================================================================

/// The register allocator's output: a concrete location per variable.
///
/// Feeding this to [`LirInstruction::map_operands`] is the only way
/// variables get rewritten.
#[derive(Debug, Default)]
pub struct AllocationAssignment {
    locations: FxHashMap<VarId, Operand>,
}

impl AllocationAssignment {
    /// Create an empty assignment.
    pub fn new() -> Self {
        AllocationAssignment {
            locations: FxHashMap::default(),
        }
    }

    /// Record the location chosen for a variable.
    ///
    /// The location must be concrete (register or stack slot).
    pub fn assign(&mut self, var: VarId, location: Operand) {
        assert!(
            matches!(location, Operand::Register(_) | Operand::StackSlot(_)),
            "allocation must map {} to a register or stack slot, got {}",
            var,
            location
        );
        self.locations.insert(var, location);
    }

    /// Get the location of a variable.
    ///
    /// Every variable reaching operand finalization must have been
    /// assigned; a miss is an allocator bug.
    pub fn location_of(&self, var: VarId) -> Operand {
        match self.locations.get(&var) {
            Some(&location) => location,
            None => panic!("no allocation for {}", var),
        }
    }

    /// Number of assigned variables.
    pub fn len(&self) -> usize {
        self.locations.len()
    }

    /// Check if no variables are assigned.
    pub fn is_empty(&self) -> bool {
        self.locations.is_empty()
    }
}

// =============================================================================
// Tests
// =============================================================================
