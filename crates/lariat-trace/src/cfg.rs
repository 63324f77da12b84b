//! In-memory control-flow graph, the reference [`IrSink`] implementation.

use crate::ir::{BlockId, Inst, IrSink, Temp, TempKind, Terminator};

#[derive(Clone, Debug)]
pub struct Block {
    pub insts: Vec<Inst>,
    pub term: Terminator,
}

/// A growable CFG that records everything the builder emits.
#[derive(Debug, Default)]
pub struct Cfg {
    blocks: Vec<Block>,
    temp_kinds: Vec<TempKind>,
    current: Option<BlockId>,
}

impl Cfg {
    pub fn new() -> Cfg {
        Cfg::default()
    }

    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id.0 as usize]
    }

    pub fn blocks(&self) -> impl Iterator<Item = (BlockId, &Block)> {
        self.blocks
            .iter()
            .enumerate()
            .map(|(i, b)| (BlockId(i as u32), b))
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn temp_kind(&self, temp: Temp) -> TempKind {
        self.temp_kinds[temp.0 as usize]
    }

    pub fn temp_count(&self) -> usize {
        self.temp_kinds.len()
    }

    fn current_block(&mut self) -> &mut Block {
        let id = self.current.expect("no current block");
        &mut self.blocks[id.0 as usize]
    }
}

impl IrSink for Cfg {
    fn new_temp(&mut self, kind: TempKind) -> Temp {
        let t = Temp(self.temp_kinds.len() as u32);
        self.temp_kinds.push(kind);
        t
    }

    fn create_block(&mut self) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(Block {
            insts: Vec::new(),
            term: Terminator::Pending,
        });
        id
    }

    fn set_current(&mut self, block: BlockId) {
        self.current = Some(block);
    }

    fn current(&self) -> BlockId {
        self.current.expect("no current block")
    }

    fn push(&mut self, inst: Inst) {
        let block = self.current_block();
        debug_assert!(
            matches!(block.term, Terminator::Pending),
            "pushing into a terminated block"
        );
        block.insts.push(inst);
    }

    fn terminate(&mut self, term: Terminator) {
        let block = self.current_block();
        debug_assert!(
            matches!(block.term, Terminator::Pending),
            "terminating a block twice"
        );
        block.term = term;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocks_accumulate_instructions_until_terminated() {
        let mut cfg = Cfg::new();
        let a = cfg.create_block();
        let b = cfg.create_block();
        cfg.set_current(a);
        let t = cfg.new_temp(TempKind::Int);
        cfg.push(Inst::Const { dst: t, value: 7 });
        cfg.terminate(Terminator::Jump(b));
        cfg.set_current(b);
        cfg.terminate(Terminator::Return(t));

        assert_eq!(cfg.block_count(), 2);
        assert_eq!(cfg.block(a).insts.len(), 1);
        assert_eq!(cfg.block(a).term, Terminator::Jump(b));
        assert_eq!(cfg.block(b).term, Terminator::Return(t));
        assert_eq!(cfg.temp_kind(t), TempKind::Int);
    }
}
