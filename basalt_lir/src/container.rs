//! The per-method LIR container.
//!
//! Holds the block set, the start block, and the two independent block
//! orderings: allocation order (for numbering and liveness) and emission
//! order (for code layout; loop rotation and hot/cold splitting may make
//! it differ). Construction is pure data assembly; the orderings come
//! from the upstream scheduler.

use crate::block::{BlockId, LirBlock};
use crate::instruction::InstrId;
use crate::operand::VarId;
use rustc_hash::FxHashMap;

/// The control-flow container of linear IR for one compilation.
#[derive(Debug)]
pub struct Lir {
    blocks: Vec<LirBlock>,
    start_block: BlockId,
    allocation_order: Vec<BlockId>,
    emission_order: Vec<BlockId>,
    value_blocks: FxHashMap<VarId, BlockId>,
}

impl Lir {
    /// Assemble a container from pre-built blocks and orderings.
    ///
    /// Both orderings must be permutations of the full block set and the
    /// start block must be part of it; violations are compiler bugs.
    pub fn new(
        blocks: Vec<LirBlock>,
        start_block: BlockId,
        allocation_order: Vec<BlockId>,
        emission_order: Vec<BlockId>,
        value_blocks: FxHashMap<VarId, BlockId>,
    ) -> Self {
        assert!(
            start_block.index() < blocks.len(),
            "start block {} out of range",
            start_block
        );
        assert!(
            Self::is_permutation(&allocation_order, blocks.len()),
            "allocation order is not a permutation of the block set"
        );
        assert!(
            Self::is_permutation(&emission_order, blocks.len()),
            "emission order is not a permutation of the block set"
        );
        Lir {
            blocks,
            start_block,
            allocation_order,
            emission_order,
            value_blocks,
        }
    }

    fn is_permutation(order: &[BlockId], num_blocks: usize) -> bool {
        if order.len() != num_blocks {
            return false;
        }
        let mut seen = vec![false; num_blocks];
        for &id in order {
            if id.index() >= num_blocks || seen[id.index()] {
                return false;
            }
            seen[id.index()] = true;
        }
        true
    }

    /// Wire a control-flow edge, keeping both sides consistent.
    ///
    /// Builder-stage helper used before the blocks move into the container.
    pub fn link(blocks: &mut [LirBlock], pred: BlockId, succ: BlockId) {
        blocks[pred.index()].successors.push(succ);
        blocks[succ.index()].predecessors.push(pred);
    }

    /// Number of blocks.
    #[inline]
    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// Get a block by id.
    #[inline]
    pub fn block(&self, id: BlockId) -> &LirBlock {
        &self.blocks[id.index()]
    }

    /// Get a block mutably.
    #[inline]
    pub fn block_mut(&mut self, id: BlockId) -> &mut LirBlock {
        &mut self.blocks[id.index()]
    }

    /// The method entry block.
    #[inline]
    pub fn start_block(&self) -> BlockId {
        self.start_block
    }

    /// Blocks in allocation (numbering) order.
    #[inline]
    pub fn allocation_order(&self) -> &[BlockId] {
        &self.allocation_order
    }

    /// Blocks in emission (code layout) order.
    #[inline]
    pub fn emission_order(&self) -> &[BlockId] {
        &self.emission_order
    }

    /// The block that defines a value, if known.
    #[inline]
    pub fn block_of(&self, value: VarId) -> Option<BlockId> {
        self.value_blocks.get(&value).copied()
    }

    /// Assign instruction ids in allocation order.
    ///
    /// Ids advance by 2; each block records its first/last id for
    /// range-based interval queries.
    pub fn number_instructions(&mut self) {
        let order = self.allocation_order.clone();
        let mut next = 0u32;
        for id in order {
            let block = &mut self.blocks[id.index()];
            let first = InstrId::new(next);
            for instr in block.instructions_mut() {
                instr.set_id(InstrId::new(next));
                next += 2;
            }
            let last = if next == first.raw() {
                InstrId::INVALID
            } else {
                InstrId::new(next - 2)
            };
            let first = if last.is_valid() { first } else { InstrId::INVALID };
            block.set_instr_range(first, last);
        }
    }

    /// Check predecessor/successor lists for mutual consistency.
    pub fn edges_consistent(&self) -> bool {
        for block in &self.blocks {
            for &succ in block.successors() {
                if !self.blocks[succ.index()]
                    .predecessors()
                    .contains(&block.id())
                {
                    return false;
                }
            }
            for &pred in block.predecessors() {
                if !self.blocks[pred.index()].successors().contains(&block.id()) {
                    return false;
                }
            }
        }
        true
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::list::LirList;
    use crate::operand::{Constant, Operand};

    fn three_blocks() -> Vec<LirBlock> {
        let mut blocks: Vec<LirBlock> = (0..3).map(|i| LirBlock::new(BlockId::new(i))).collect();
        Lir::link(&mut blocks, BlockId::new(0), BlockId::new(1));
        Lir::link(&mut blocks, BlockId::new(0), BlockId::new(2));
        Lir::link(&mut blocks, BlockId::new(1), BlockId::new(2));
        blocks
    }

    fn ids(raw: &[u32]) -> Vec<BlockId> {
        raw.iter().map(|&i| BlockId::new(i)).collect()
    }

    #[test]
    fn test_orders_may_differ() {
        let lir = Lir::new(
            three_blocks(),
            BlockId::new(0),
            ids(&[0, 1, 2]),
            ids(&[0, 2, 1]),
            FxHashMap::default(),
        );
        assert_eq!(lir.allocation_order()[1], BlockId::new(1));
        assert_eq!(lir.emission_order()[1], BlockId::new(2));
        assert!(lir.edges_consistent());
    }

    #[test]
    #[should_panic(expected = "not a permutation")]
    fn test_rejects_duplicate_in_order() {
        Lir::new(
            three_blocks(),
            BlockId::new(0),
            ids(&[0, 1, 1]),
            ids(&[0, 1, 2]),
            FxHashMap::default(),
        );
    }

    #[test]
    #[should_panic(expected = "not a permutation")]
    fn test_rejects_short_order() {
        Lir::new(
            three_blocks(),
            BlockId::new(0),
            ids(&[0, 1]),
            ids(&[0, 1, 2]),
            FxHashMap::default(),
        );
    }

    #[test]
    fn test_number_instructions() {
        let mut blocks = three_blocks();
        for block in blocks.iter_mut() {
            let mut list = LirList::new();
            list.nop();
            list.move_op(
                Operand::Constant(Constant::Word(0)),
                Operand::Register(crate::registers::Gpr::Rax),
            );
            block.set_instructions(list.finish());
        }
        let mut lir = Lir::new(
            blocks,
            BlockId::new(0),
            ids(&[0, 2, 1]),
            ids(&[0, 1, 2]),
            FxHashMap::default(),
        );
        lir.number_instructions();

        // Allocation order is B0, B2, B1; each block holds 2 instructions.
        let b0 = lir.block(BlockId::new(0));
        assert_eq!(b0.first_instr_id().raw(), 0);
        assert_eq!(b0.last_instr_id().raw(), 2);

        let b2 = lir.block(BlockId::new(2));
        assert_eq!(b2.first_instr_id().raw(), 4);
        assert_eq!(b2.last_instr_id().raw(), 6);

        let b1 = lir.block(BlockId::new(1));
        assert_eq!(b1.first_instr_id().raw(), 8);
        assert_eq!(b1.last_instr_id().raw(), 10);

        // Ids advance by 2 within a block.
        assert_eq!(b1.instructions()[0].id().raw(), 8);
        assert_eq!(b1.instructions()[1].id().raw(), 10);
    }
}
