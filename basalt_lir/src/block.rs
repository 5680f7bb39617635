//! LIR basic blocks.
//!
//! A block carries its control-flow edges, its instruction list (assigned
//! exactly once, after the middle end finishes building it), and the four
//! liveness bitsets the register allocator consumes. The fixed-point
//! liveness computation itself happens upstream; this module only stores
//! its results and can check the dataflow equation they must satisfy.

use crate::bitset::BitSet;
use crate::instruction::{InstrId, LirInstruction};
use std::fmt;

// =============================================================================
// Block Id
// =============================================================================

/// Dense block index within one LIR container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(u32);

impl BlockId {
    /// Create a block id from a raw index.
    #[inline]
    pub const fn new(index: u32) -> Self {
        BlockId(index)
    }

    /// Get the raw index.
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "B{}", self.0)
    }
}

// =============================================================================
// LirBlock
// =============================================================================

/// A basic block of linear IR.
#[derive(Debug)]
pub struct LirBlock {
    id: BlockId,
    /// Loop nesting depth (0 = not in a loop).
    loop_depth: u32,
    /// Index of the innermost containing loop, if any.
    loop_index: Option<u32>,
    /// Align the block start when emitted (loop headers).
    align_entry: bool,
    pub(crate) predecessors: Vec<BlockId>,
    pub(crate) successors: Vec<BlockId>,
    instructions: Vec<LirInstruction>,
    live_in: BitSet,
    live_out: BitSet,
    live_gen: BitSet,
    live_kill: BitSet,
    first_instr_id: InstrId,
    last_instr_id: InstrId,
}

impl LirBlock {
    /// Create an empty block.
    pub fn new(id: BlockId) -> Self {
        LirBlock {
            id,
            loop_depth: 0,
            loop_index: None,
            align_entry: false,
            predecessors: Vec::new(),
            successors: Vec::new(),
            instructions: Vec::new(),
            live_in: BitSet::new(),
            live_out: BitSet::new(),
            live_gen: BitSet::new(),
            live_kill: BitSet::new(),
            first_instr_id: InstrId::INVALID,
            last_instr_id: InstrId::INVALID,
        }
    }

    /// Set loop nesting information.
    pub fn set_loop(&mut self, depth: u32, index: Option<u32>) {
        self.loop_depth = depth;
        self.loop_index = index;
    }

    /// Request alignment of the block start on emission.
    pub fn set_align_entry(&mut self, align: bool) {
        self.align_entry = align;
    }

    /// Get the block id.
    #[inline]
    pub fn id(&self) -> BlockId {
        self.id
    }

    /// Get the loop nesting depth.
    #[inline]
    pub fn loop_depth(&self) -> u32 {
        self.loop_depth
    }

    /// Get the innermost loop index.
    #[inline]
    pub fn loop_index(&self) -> Option<u32> {
        self.loop_index
    }

    /// Whether the block start should be aligned when emitted.
    #[inline]
    pub fn align_entry(&self) -> bool {
        self.align_entry
    }

    /// Get the predecessor blocks.
    #[inline]
    pub fn predecessors(&self) -> &[BlockId] {
        &self.predecessors
    }

    /// Get the successor blocks.
    #[inline]
    pub fn successors(&self) -> &[BlockId] {
        &self.successors
    }

    /// Assign the ordered instruction list. May be done only once.
    pub fn set_instructions(&mut self, instructions: Vec<LirInstruction>) {
        assert!(
            self.instructions.is_empty(),
            "{}: instruction list already assigned",
            self.id
        );
        self.instructions = instructions;
    }

    /// Get the instruction list.
    #[inline]
    pub fn instructions(&self) -> &[LirInstruction] {
        &self.instructions
    }

    pub(crate) fn instructions_mut(&mut self) -> &mut [LirInstruction] {
        &mut self.instructions
    }

    /// Replace every instruction with its post-allocation form.
    ///
    /// The list length never changes; see
    /// [`LirInstruction::map_operands`](crate::instruction::LirInstruction::map_operands).
    pub fn finalize_instructions(
        &mut self,
        assignment: &crate::instruction::AllocationAssignment,
    ) {
        let finalized: Vec<LirInstruction> = self
            .instructions
            .iter()
            .map(|instr| instr.map_operands(assignment))
            .collect();
        self.instructions = finalized;
    }

    /// Store the liveness sets computed by the upstream dataflow pass.
    pub fn set_live_sets(&mut self, gen: BitSet, kill: BitSet, live_in: BitSet, live_out: BitSet) {
        self.live_gen = gen;
        self.live_kill = kill;
        self.live_in = live_in;
        self.live_out = live_out;
    }

    /// Variables live on entry.
    #[inline]
    pub fn live_in(&self) -> &BitSet {
        &self.live_in
    }

    /// Variables live on exit.
    #[inline]
    pub fn live_out(&self) -> &BitSet {
        &self.live_out
    }

    /// Variables used before any definition in this block.
    #[inline]
    pub fn live_gen(&self) -> &BitSet {
        &self.live_gen
    }

    /// Variables defined in this block.
    #[inline]
    pub fn live_kill(&self) -> &BitSet {
        &self.live_kill
    }

    /// Check the dataflow equation `liveIn = liveGen ∪ (liveOut − liveKill)`.
    pub fn liveness_holds(&self) -> bool {
        self.live_in == self.live_gen.union(&self.live_out.difference(&self.live_kill))
    }

    pub(crate) fn set_instr_range(&mut self, first: InstrId, last: InstrId) {
        self.first_instr_id = first;
        self.last_instr_id = last;
    }

    /// Id of the first instruction, once numbered.
    #[inline]
    pub fn first_instr_id(&self) -> InstrId {
        self.first_instr_id
    }

    /// Id of the last instruction, once numbered.
    #[inline]
    pub fn last_instr_id(&self) -> InstrId {
        self.last_instr_id
    }

    /// Check whether a numbered instruction id falls in this block.
    pub fn covers_instr(&self, id: InstrId) -> bool {
        self.first_instr_id.is_valid() && self.first_instr_id <= id && id <= self.last_instr_id
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::list::LirList;
    use crate::operand::{Constant, Operand, VarId};

    fn block_with_ops() -> LirBlock {
        let mut block = LirBlock::new(BlockId::new(0));
        let mut list = LirList::new();
        list.move_op(
            Operand::Constant(Constant::Word(7)),
            Operand::Variable(VarId::new(0)),
        );
        list.return_op(Operand::Variable(VarId::new(0)));
        block.set_instructions(list.finish());
        block
    }

    #[test]
    fn test_instruction_assignment_is_once() {
        let block = block_with_ops();
        assert_eq!(block.instructions().len(), 2);
    }

    #[test]
    #[should_panic(expected = "already assigned")]
    fn test_double_assignment_panics() {
        let mut block = block_with_ops();
        block.set_instructions(Vec::new());
    }

    #[test]
    fn test_liveness_equation() {
        let mut block = LirBlock::new(BlockId::new(1));

        // gen = {0}, kill = {1}, out = {1, 2} => in must be {0, 2}
        let gen: BitSet = [0usize].into_iter().collect();
        let kill: BitSet = [1usize].into_iter().collect();
        let live_out: BitSet = [1usize, 2].into_iter().collect();
        let live_in: BitSet = [0usize, 2].into_iter().collect();

        block.set_live_sets(gen, kill, live_in, live_out);
        assert!(block.liveness_holds());

        // Perturb liveIn and the equation must fail.
        let bad_in: BitSet = [0usize, 1, 2].into_iter().collect();
        let gen: BitSet = [0usize].into_iter().collect();
        let kill: BitSet = [1usize].into_iter().collect();
        let live_out: BitSet = [1usize, 2].into_iter().collect();
        block.live_in = bad_in;
        block.live_gen = gen;
        block.live_kill = kill;
        block.live_out = live_out;
        assert!(!block.liveness_holds());
    }

    #[test]
    fn test_instr_range() {
        let mut block = block_with_ops();
        assert!(!block.first_instr_id().is_valid());

        block.set_instr_range(InstrId::new(4), InstrId::new(6));
        assert!(block.covers_instr(InstrId::new(4)));
        assert!(block.covers_instr(InstrId::new(6)));
        assert!(!block.covers_instr(InstrId::new(8)));
    }
}
