//! Machine-code emission from LIR.
//!
//! The assembler walks blocks in emission order and hands each instruction
//! to an [`InstructionEncoder`], the narrow interface to the
//! architecture-specific encoder. Slow paths queued during main emission
//! are appended after the last block so the hot path stays contiguous.
//! Stop instructions (calls and safepoint polls carrying debug info) are
//! recorded with their code offset and concrete reference map.

use crate::asm::{CodeBuffer, LabelId};
use crate::block::BlockId;
use crate::container::Lir;
use crate::debug_info::ReferenceMap;
use crate::frame_map::FrameMap;
use crate::instruction::{LirInstruction, Opcode};
use std::fmt;

// =============================================================================
// Emission Errors
// =============================================================================

/// Errors surfaced by an encoder during emission.
#[derive(Debug)]
pub enum EmitError {
    /// The encoder has no encoding for this opcode.
    UnsupportedInstruction(Opcode),
    /// An instruction reached the encoder with unallocated operands.
    UnallocatedOperand(String),
    /// Encoder-specific failure.
    Encoder(String),
}

impl fmt::Display for EmitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EmitError::UnsupportedInstruction(op) => {
                write!(f, "no encoding for {:?}", op)
            }
            EmitError::UnallocatedOperand(instr) => {
                write!(f, "unallocated operand reached emission: {}", instr)
            }
            EmitError::Encoder(msg) => write!(f, "encoder error: {}", msg),
        }
    }
}

impl std::error::Error for EmitError {}

// =============================================================================
// Emission Context
// =============================================================================

/// Deferred slow-path code queued during main emission.
struct SlowPathStub {
    label: LabelId,
    emit: Box<dyn FnOnce(&mut CodeBuffer)>,
}

/// What an encoder sees while emitting one instruction.
pub struct EmitContext<'a> {
    /// The output buffer.
    pub buf: &'a mut CodeBuffer,
    block_labels: &'a [LabelId],
    stubs: &'a mut Vec<SlowPathStub>,
}

impl EmitContext<'_> {
    /// The label bound at the start of `block`.
    pub fn block_label(&self, block: BlockId) -> LabelId {
        self.block_labels[block.index()]
    }

    /// Queue out-of-line code, returning the label that will be bound at
    /// its start once the main pass has finished.
    pub fn defer_slow_path(&mut self, emit: impl FnOnce(&mut CodeBuffer) + 'static) -> LabelId {
        let label = self.buf.new_label();
        self.stubs.push(SlowPathStub {
            label,
            emit: Box::new(emit),
        });
        label
    }
}

/// The narrow interface to the architecture-specific instruction encoder.
pub trait InstructionEncoder {
    /// Emit the machine bytes for one instruction.
    fn encode(&mut self, instr: &LirInstruction, ctx: &mut EmitContext<'_>)
        -> Result<(), EmitError>;
}

// =============================================================================
// Stop Records
// =============================================================================

/// The kind of stop a recorded position represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopKind {
    DirectCall,
    IndirectCall,
    Safepoint,
}

/// One stop position with its GC metadata.
#[derive(Debug, Clone)]
pub struct StopRecord {
    /// Code offset just past the stop instruction (the return address for
    /// calls, the trap address for polls).
    pub offset: u32,
    pub kind: StopKind,
    /// The call at this stop returns a heap reference.
    pub reference_return: bool,
    /// Concrete reference map for this stop.
    pub ref_map: ReferenceMap,
}

/// The output of one emission pass.
#[derive(Debug)]
pub struct CompiledCode {
    /// Final machine bytes, slow paths included.
    pub code: Vec<u8>,
    /// Code offset of each block, indexed by block id.
    pub block_offsets: Vec<u32>,
    /// Stop positions in emission order.
    pub stops: Vec<StopRecord>,
}

impl CompiledCode {
    /// Stops of one kind, in emission order.
    pub fn stops_of_kind(&self, kind: StopKind) -> impl Iterator<Item = &StopRecord> {
        self.stops.iter().filter(move |stop| stop.kind == kind)
    }
}

// =============================================================================
// LirAssembler
// =============================================================================

/// Drives emission of one method's LIR into machine code.
pub struct LirAssembler<'a> {
    frame_map: &'a FrameMap,
}

impl<'a> LirAssembler<'a> {
    /// Create an assembler over a finalized frame.
    pub fn new(frame_map: &'a FrameMap) -> Self {
        assert!(frame_map.is_finalized(), "frame must be finalized before emission");
        LirAssembler { frame_map }
    }

    /// The frame map for this compilation.
    pub fn frame_map(&self) -> &FrameMap {
        self.frame_map
    }

    /// Emit every block in emission order, then queued slow paths.
    pub fn emit_code(
        &self,
        lir: &Lir,
        encoder: &mut dyn InstructionEncoder,
    ) -> Result<CompiledCode, EmitError> {
        let mut buf = CodeBuffer::new();
        let block_labels: Vec<LabelId> =
            (0..lir.num_blocks()).map(|_| buf.new_label()).collect();
        let mut block_offsets = vec![0u32; lir.num_blocks()];
        let mut stubs: Vec<SlowPathStub> = Vec::new();
        let mut stops: Vec<StopRecord> = Vec::new();

        for &block_id in lir.emission_order() {
            let block = lir.block(block_id);
            if block.align_entry() {
                buf.align_to(16, 0x90);
            }
            block_offsets[block_id.index()] = buf.pos() as u32;
            buf.bind(block_labels[block_id.index()]);

            for instr in block.instructions() {
                let mut ctx = EmitContext {
                    buf: &mut buf,
                    block_labels: &block_labels,
                    stubs: &mut stubs,
                };
                encoder.encode(instr, &mut ctx)?;

                if let (Some(info), Some(kind)) = (instr.debug_info(), stop_kind(instr)) {
                    stops.push(StopRecord {
                        offset: buf.pos() as u32,
                        kind,
                        reference_return: info.reference_return,
                        ref_map: info.init_debug_info(self.frame_map),
                    });
                }
            }
        }

        // Rare paths go after the hot code, in the order they were queued.
        for stub in stubs {
            buf.bind(stub.label);
            (stub.emit)(&mut buf);
        }

        Ok(CompiledCode {
            code: buf.finish(),
            block_offsets,
            stops,
        })
    }
}

/// Classify an instruction as a stop, if it is one.
fn stop_kind(instr: &LirInstruction) -> Option<StopKind> {
    match instr.opcode() {
        Opcode::Call => {
            let indirect = instr
                .inputs()
                .first()
                .is_some_and(|callee| callee.is_register());
            Some(if indirect {
                StopKind::IndirectCall
            } else {
                StopKind::DirectCall
            })
        }
        Opcode::SafepointPoll => Some(StopKind::Safepoint),
        _ => None,
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::LirBlock;
    use crate::debug_info::{FrameState, LirDebugInfo};
    use crate::list::LirList;
    use crate::operand::{Constant, Operand};
    use crate::registers::{Gpr, GprSet};
    use rustc_hash::FxHashMap;

    /// Fixed-width test encoder: one opcode byte, plus a rel32 for
    /// branches. Enough to observe layout decisions.
    struct TestEncoder;

    impl InstructionEncoder for TestEncoder {
        fn encode(
            &mut self,
            instr: &LirInstruction,
            ctx: &mut EmitContext<'_>,
        ) -> Result<(), EmitError> {
            match instr.opcode() {
                Opcode::Nop => ctx.buf.emit_u8(0x90),
                Opcode::Move => ctx.buf.emit_u8(0x01),
                Opcode::Cmp => ctx.buf.emit_u8(0x02),
                Opcode::Return => ctx.buf.emit_u8(0xC3),
                Opcode::Call => {
                    ctx.buf.emit_u8(0xE8);
                    ctx.buf.emit_u32(0);
                }
                Opcode::SafepointPoll => ctx.buf.emit_u8(0x85),
                Opcode::Jump | Opcode::Branch => {
                    let target = instr.target().expect("branch without target");
                    let label = ctx.block_label(target);
                    ctx.buf.emit_u8(0xE9);
                    ctx.buf.emit_disp32(label);
                }
                other => return Err(EmitError::UnsupportedInstruction(other)),
            }
            Ok(())
        }
    }

    fn finalized_frame() -> FrameMap {
        let mut map = FrameMap::new(0, 0, GprSet::EMPTY);
        map.begin_spilling();
        map.finalize_frame(0);
        map
    }

    fn two_block_lir(emission: &[u32]) -> Lir {
        let mut blocks: Vec<LirBlock> =
            (0..2).map(|i| LirBlock::new(BlockId::new(i))).collect();
        Lir::link(&mut blocks, BlockId::new(0), BlockId::new(1));

        let mut entry = LirList::new();
        entry.nop();
        entry.jump(BlockId::new(1));
        blocks[0].set_instructions(entry.finish());

        let mut exit = LirList::new();
        exit.return_op(Operand::Constant(Constant::Word(0)));
        blocks[1].set_instructions(exit.finish());

        let order: Vec<BlockId> = emission.iter().map(|&i| BlockId::new(i)).collect();
        Lir::new(
            blocks,
            BlockId::new(0),
            vec![BlockId::new(0), BlockId::new(1)],
            order,
            FxHashMap::default(),
        )
    }

    #[test]
    fn test_emission_order_controls_layout() {
        let frame = finalized_frame();
        let asm = LirAssembler::new(&frame);

        let natural = asm
            .emit_code(&two_block_lir(&[0, 1]), &mut TestEncoder)
            .unwrap();
        assert_eq!(natural.block_offsets, vec![0, 6]);

        // Rotated emission order places B1 first.
        let rotated = asm
            .emit_code(&two_block_lir(&[1, 0]), &mut TestEncoder)
            .unwrap();
        assert_eq!(rotated.block_offsets[1], 0);
        assert_eq!(rotated.block_offsets[0], 1);
    }

    #[test]
    fn test_branch_patched_across_blocks() {
        let frame = finalized_frame();
        let asm = LirAssembler::new(&frame);
        let code = asm
            .emit_code(&two_block_lir(&[0, 1]), &mut TestEncoder)
            .unwrap();

        // B0: nop (1) + jmp rel32 (5); B1 binds at 6, so disp = 0.
        assert_eq!(code.code[1], 0xE9);
        assert_eq!(&code.code[2..6], &0i32.to_le_bytes());
    }

    #[test]
    fn test_block_alignment() {
        let frame = finalized_frame();
        let asm = LirAssembler::new(&frame);
        let mut lir = two_block_lir(&[0, 1]);
        lir.block_mut(BlockId::new(1)).set_align_entry(true);
        let code = asm.emit_code(&lir, &mut TestEncoder).unwrap();
        assert_eq!(code.block_offsets[1] % 16, 0);
    }

    #[test]
    fn test_stop_records() {
        let frame = finalized_frame();
        let mut blocks = vec![LirBlock::new(BlockId::new(0))];
        let mut list = LirList::new();
        list.safepoint(LirDebugInfo::new(3, FrameState::default()));
        list.call(
            Operand::Constant(Constant::Word(0x1000)),
            Operand::Register(Gpr::Rax),
            LirDebugInfo::new(7, FrameState::default()).with_reference_return(),
        );
        list.call(
            Operand::Register(Gpr::Rcx),
            Operand::Register(Gpr::Rax),
            LirDebugInfo::new(9, FrameState::default()),
        );
        list.return_op(Operand::Register(Gpr::Rax));
        blocks[0].set_instructions(list.finish());

        let lir = Lir::new(
            blocks,
            BlockId::new(0),
            vec![BlockId::new(0)],
            vec![BlockId::new(0)],
            FxHashMap::default(),
        );
        let asm = LirAssembler::new(&frame);
        let code = asm.emit_code(&lir, &mut TestEncoder).unwrap();

        assert_eq!(code.stops.len(), 3);
        assert_eq!(code.stops[0].kind, StopKind::Safepoint);
        assert_eq!(code.stops[0].offset, 1);
        assert_eq!(code.stops[1].kind, StopKind::DirectCall);
        assert!(code.stops[1].reference_return);
        assert_eq!(code.stops[1].offset, 6);
        assert_eq!(code.stops[2].kind, StopKind::IndirectCall);
        assert_eq!(code.stops_of_kind(StopKind::DirectCall).count(), 1);
    }

    #[test]
    fn test_slow_paths_emitted_after_main_code() {
        /// Encoder that routes every call through a deferred stub.
        struct StubEncoder {
            stub_labels: Vec<LabelId>,
        }

        impl InstructionEncoder for StubEncoder {
            fn encode(
                &mut self,
                instr: &LirInstruction,
                ctx: &mut EmitContext<'_>,
            ) -> Result<(), EmitError> {
                match instr.opcode() {
                    Opcode::Call => {
                        let label = ctx.defer_slow_path(|buf| {
                            buf.emit_u8(0x0F);
                            buf.emit_u8(0x0B); // ud2 placeholder body
                        });
                        self.stub_labels.push(label);
                        ctx.buf.emit_u8(0xE8);
                        ctx.buf.emit_disp32(label);
                    }
                    Opcode::Return => ctx.buf.emit_u8(0xC3),
                    _ => ctx.buf.emit_u8(0x90),
                }
                Ok(())
            }
        }

        let frame = finalized_frame();
        let mut blocks = vec![LirBlock::new(BlockId::new(0))];
        let mut list = LirList::new();
        list.call(
            Operand::Constant(Constant::Word(1)),
            Operand::Illegal,
            LirDebugInfo::new(0, FrameState::default()),
        );
        list.return_op(Operand::Illegal);
        blocks[0].set_instructions(list.finish());

        let lir = Lir::new(
            blocks,
            BlockId::new(0),
            vec![BlockId::new(0)],
            vec![BlockId::new(0)],
            FxHashMap::default(),
        );
        let asm = LirAssembler::new(&frame);
        let mut encoder = StubEncoder {
            stub_labels: Vec::new(),
        };
        let code = asm.emit_code(&lir, &mut encoder).unwrap();

        // Main code: call (5) + ret (1) = 6 bytes; the stub body follows.
        assert_eq!(code.code.len(), 8);
        assert_eq!(code.code[5], 0xC3);
        assert_eq!(&code.code[6..8], &[0x0F, 0x0B]);
        // The call displacement points at the stub: 6 - 5 = 1.
        assert_eq!(&code.code[1..5], &1i32.to_le_bytes());
    }
}
