//! Per-block instruction list builder.
//!
//! The middle end appends through the typed helpers below rather than
//! constructing instructions by hand; each helper fixes the operand shape
//! for its opcode. `finish` hands the ordered list to the owning block.

use crate::block::BlockId;
use crate::debug_info::LirDebugInfo;
use crate::instruction::{Condition, LirInstruction, Opcode};
use crate::operand::Operand;
use smallvec::smallvec;

/// An ordered list of LIR instructions under construction for one block.
#[derive(Debug, Default)]
pub struct LirList {
    operations: Vec<LirInstruction>,
}

impl LirList {
    /// Create an empty list.
    pub fn new() -> Self {
        LirList {
            operations: Vec::with_capacity(8),
        }
    }

    fn append(&mut self, op: LirInstruction) {
        self.operations.push(op);
    }

    /// Number of instructions appended so far.
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    /// Check if the list is empty.
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Get the instruction at `index`.
    pub fn at(&self, index: usize) -> &LirInstruction {
        &self.operations[index]
    }

    /// Consume the builder, yielding the ordered instructions.
    pub fn finish(self) -> Vec<LirInstruction> {
        self.operations
    }

    // =========================================================================
    // Append Helpers
    // =========================================================================

    /// Copy `src` into `dst`.
    pub fn move_op(&mut self, src: Operand, dst: Operand) {
        self.append(LirInstruction::new(
            Opcode::Move,
            dst,
            smallvec![src],
            smallvec![],
        ));
    }

    /// `result = left + right`.
    pub fn add(&mut self, left: Operand, right: Operand, result: Operand) {
        self.append(LirInstruction::new(
            Opcode::Add,
            result,
            smallvec![left, right],
            smallvec![],
        ));
    }

    /// `result = left - right`.
    pub fn sub(&mut self, left: Operand, right: Operand, result: Operand) {
        self.append(LirInstruction::new(
            Opcode::Sub,
            result,
            smallvec![left, right],
            smallvec![],
        ));
    }

    /// `result = left & right`.
    pub fn logical_and(&mut self, left: Operand, right: Operand, result: Operand) {
        self.append(LirInstruction::new(
            Opcode::And,
            result,
            smallvec![left, right],
            smallvec![],
        ));
    }

    /// `result = left | right`.
    pub fn logical_or(&mut self, left: Operand, right: Operand, result: Operand) {
        self.append(LirInstruction::new(
            Opcode::Or,
            result,
            smallvec![left, right],
            smallvec![],
        ));
    }

    /// `result = left ^ right`.
    pub fn logical_xor(&mut self, left: Operand, right: Operand, result: Operand) {
        self.append(LirInstruction::new(
            Opcode::Xor,
            result,
            smallvec![left, right],
            smallvec![],
        ));
    }

    /// Compare `left` and `right`, setting machine flags for a branch.
    pub fn cmp(&mut self, left: Operand, right: Operand) {
        self.append(LirInstruction::new(
            Opcode::Cmp,
            Operand::Illegal,
            smallvec![left, right],
            smallvec![],
        ));
    }

    /// Unconditional jump to `block`.
    pub fn jump(&mut self, block: BlockId) {
        self.append(
            LirInstruction::new(Opcode::Jump, Operand::Illegal, smallvec![], smallvec![])
                .with_target(block),
        );
    }

    /// Conditional branch to `block`.
    pub fn branch(&mut self, condition: Condition, block: BlockId) {
        self.append(
            LirInstruction::new(Opcode::Branch, Operand::Illegal, smallvec![], smallvec![])
                .with_condition(condition)
                .with_target(block),
        );
    }

    /// Call `callee`, leaving the value in `result`.
    ///
    /// Calls are stops: `info` captures the frame state the collector and
    /// deoptimizer need while the callee runs.
    pub fn call(&mut self, callee: Operand, result: Operand, info: LirDebugInfo) {
        self.append(
            LirInstruction::new(Opcode::Call, result, smallvec![callee], smallvec![])
                .with_debug_info(info),
        );
    }

    /// Return `value` (or `Operand::Illegal` for void).
    pub fn return_op(&mut self, value: Operand) {
        self.append(LirInstruction::new(
            Opcode::Return,
            Operand::Illegal,
            smallvec![value],
            smallvec![],
        ));
    }

    /// GC safepoint poll, with the frame state at this point.
    pub fn safepoint(&mut self, info: LirDebugInfo) {
        self.append(
            LirInstruction::new(
                Opcode::SafepointPoll,
                Operand::Illegal,
                smallvec![],
                smallvec![],
            )
            .with_debug_info(info),
        );
    }

    /// No-op.
    pub fn nop(&mut self) {
        self.append(LirInstruction::new(
            Opcode::Nop,
            Operand::Illegal,
            smallvec![],
            smallvec![],
        ));
    }
}

// =============================================================================
// Tests
// =============================================================================
