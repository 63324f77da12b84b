//! The trace builder: drives decoding, block memoization, and branch
//! resolution to a fixed point.
//!
//! Every guest instruction gets its own block, memoized by translation point
//! (pc plus register alias state), so revisiting a pc with the same laziness
//! reuses the block and loops close on themselves. Direct-branch targets are
//! queued for decoding; dynamic branches park in a second worklist and are
//! resolved against the branch profile once the direct work drains, which
//! may queue more direct work. Translation finishes when both lists are
//! empty.

use std::collections::{HashMap, VecDeque};

use lariat_x86::{decode, DecodedInst, RegAliasState, TraceKey};
use tracing::{debug, trace};

use crate::config::TraceConfig;
use crate::ir::{
    BlockId, BranchKind, CmpCond, Inst, IrSink, Src, Temp, TempKind, Terminator,
};
use crate::regs::RegBank;
use crate::traits::{BranchProfile, GuestImage, TraceCache};
use crate::TranslateError;

/// Sentinel next-pc stored when a trace exits through a bad instruction; the
/// dispatcher recognizes it and raises the guest fault.
pub const BAD_EXIT_PC: u32 = 0xEBAD_C0DE;

/// What a trace compilation produced.
#[derive(Clone, Copy, Debug)]
pub struct TraceSummary {
    /// First block to execute: fills, then the entry instruction.
    pub entry: BlockId,
    /// Shared exit block: spills, then returns the next guest pc.
    pub finish: BlockId,
    /// Guest instructions translated.
    pub instructions: usize,
}

/// A dynamic branch awaiting profile-driven resolution.
struct PendingDynamic {
    block: BlockId,
    pc: u32,
    target: Temp,
    kind: BranchKind,
    lazy: RegAliasState,
}

/// What [`TraceBuilder::emit_inst`] tells the driver loop.
pub(crate) enum Flow {
    /// Fall through to the next sequential instruction.
    Next,
    /// The instruction terminated its block itself.
    Done,
}

pub struct TraceBuilder<'a> {
    pub(crate) sink: &'a mut dyn IrSink,
    pub(crate) image: &'a dyn GuestImage,
    profile: &'a dyn BranchProfile,
    cache: &'a dyn TraceCache,
    config: TraceConfig,
    pub(crate) regs: RegBank,
    prologue: BlockId,
    finish: BlockId,
    ret_pc: Temp,
    block_map: HashMap<TraceKey, BlockId>,
    pending: VecDeque<TraceKey>,
    dynamics: VecDeque<PendingDynamic>,
    exits: HashMap<TraceKey, BlockId>,
    decoded: usize,
}

impl<'a> TraceBuilder<'a> {
    pub fn new(
        sink: &'a mut dyn IrSink,
        image: &'a dyn GuestImage,
        profile: &'a dyn BranchProfile,
        cache: &'a dyn TraceCache,
        config: TraceConfig,
    ) -> TraceBuilder<'a> {
        let regs = RegBank::new(sink);
        let prologue = sink.create_block();
        let finish = sink.create_block();
        let ret_pc = sink.new_temp(TempKind::Int);
        TraceBuilder {
            sink,
            image,
            profile,
            cache,
            config,
            regs,
            prologue,
            finish,
            ret_pc,
            block_map: HashMap::new(),
            pending: VecDeque::new(),
            dynamics: VecDeque::new(),
            exits: HashMap::new(),
            decoded: 0,
        }
    }

    /// Translate the trace rooted at `entry_pc`.
    pub fn build(mut self, entry_pc: u32) -> Result<TraceSummary, TranslateError> {
        debug!(entry_pc, "trace translation start");
        let entry_key = RegAliasState::default().key(entry_pc);
        let entry_block = self.sink.create_block();
        self.block_map.insert(entry_key, entry_block);
        self.pending.push_back(entry_key);

        // Alternate: drain direct work, then resolve one dynamic branch,
        // which may queue more direct work.
        loop {
            if let Some(key) = self.pending.pop_front() {
                self.translate_at(key)?;
            } else if let Some(d) = self.dynamics.pop_front() {
                self.resolve_dynamic(d)?;
            } else {
                break;
            }
        }

        self.sink.set_current(self.prologue);
        self.regs.emit_fills(&mut *self.sink);
        self.sink.terminate(Terminator::Jump(entry_block));

        self.sink.set_current(self.finish);
        self.regs.emit_spills(&mut *self.sink);
        self.sink.terminate(Terminator::Return(self.ret_pc));

        debug!(instructions = self.decoded, "trace translation done");
        Ok(TraceSummary {
            entry: self.prologue,
            finish: self.finish,
            instructions: self.decoded,
        })
    }

    fn translate_at(&mut self, key: TraceKey) -> Result<(), TranslateError> {
        let block = *self
            .block_map
            .get(&key)
            .ok_or(TranslateError::ResolutionInconsistency { pc: key.pc })?;
        self.sink.set_current(block);
        self.regs.lazy = key.state;

        let inst: DecodedInst = decode(self.image, key.pc);
        trace!(pc = format_args!("{:#x}", key.pc), %inst, "translate");
        self.decoded += 1;

        match self.emit_inst(&inst)? {
            Flow::Next => {
                let next_key = self.regs.lazy.key(inst.next_pc());
                let next = self.block_for(next_key);
                self.sink.terminate(Terminator::Jump(next));
            }
            Flow::Done => {}
        }
        Ok(())
    }

    /// Whether a branch to `pc` may grow the trace rather than exit.
    fn may_inline(&self, pc: u32) -> bool {
        !self.config.single_instruction
            && self.decoded < self.config.max_instructions
            && !self.cache.contains(pc)
    }

    /// The block for a translation point: an existing block, a new pending
    /// one, or a shared exit when growth is not allowed.
    pub(crate) fn block_for(&mut self, key: TraceKey) -> BlockId {
        if let Some(&b) = self.block_map.get(&key) {
            return b;
        }
        if self.may_inline(key.pc) {
            let b = self.sink.create_block();
            self.block_map.insert(key, b);
            self.pending.push_back(key);
            b
        } else {
            self.exit_to(key)
        }
    }

    /// Memoized trace exit to a known pc, leaving from the given alias
    /// state: resolve every register to its wide view, set the next pc, and
    /// fall into the shared finish block.
    pub(crate) fn exit_to(&mut self, key: TraceKey) -> BlockId {
        if let Some(&b) = self.exits.get(&key) {
            return b;
        }
        let saved_block = self.sink.current();
        let saved_lazy = self.regs.lazy;

        let b = self.sink.create_block();
        self.sink.set_current(b);
        self.regs.lazy = key.state;
        self.regs.resolve_all(&mut *self.sink);
        self.sink.push(Inst::Const {
            dst: self.ret_pc,
            value: key.pc as i32,
        });
        self.sink.terminate(Terminator::Jump(self.finish));

        self.regs.lazy = saved_lazy;
        self.sink.set_current(saved_block);
        self.exits.insert(key, b);
        b
    }

    /// Exit through a computed target in the current block: record the
    /// branch for the profile, resolve laziness, and leave.
    pub(crate) fn exit_via(&mut self, target: Temp, source: u32, kind: BranchKind) {
        self.sink.push(Inst::RecordBranch {
            source,
            target,
            kind,
        });
        self.regs.resolve_all(&mut *self.sink);
        self.sink.push(Inst::Move {
            dst: self.ret_pc,
            src: target,
        });
        self.sink.terminate(Terminator::Jump(self.finish));
    }

    /// Exit through a bad instruction: raise the deferred fault and leave
    /// with the sentinel pc.
    pub(crate) fn exit_bad(&mut self, pc: u32) {
        self.sink.push(Inst::RaiseBadInstruction { pc });
        self.regs.resolve_all(&mut *self.sink);
        self.sink.push(Inst::Const {
            dst: self.ret_pc,
            value: BAD_EXIT_PC as i32,
        });
        self.sink.terminate(Terminator::Jump(self.finish));
    }

    /// Exit for a guest divide fault at `pc`.
    pub(crate) fn exit_divide_fault(&mut self, pc: u32) -> BlockId {
        let saved_block = self.sink.current();
        let saved_lazy = self.regs.lazy;

        let b = self.sink.create_block();
        self.sink.set_current(b);
        self.sink.push(Inst::RaiseDivideError { pc });
        self.regs.resolve_all(&mut *self.sink);
        self.sink.push(Inst::Const {
            dst: self.ret_pc,
            value: pc as i32,
        });
        self.sink.terminate(Terminator::Jump(self.finish));

        self.regs.lazy = saved_lazy;
        self.sink.set_current(saved_block);
        b
    }

    /// Park a dynamic branch for later profile-driven resolution. Its block
    /// stays unterminated until then.
    pub(crate) fn defer_dynamic(&mut self, pc: u32, target: Temp, kind: BranchKind) {
        let d = PendingDynamic {
            block: self.sink.current(),
            pc,
            target,
            kind,
            lazy: self.regs.lazy,
        };
        self.dynamics.push_back(d);
    }

    /// Resolve a parked dynamic branch against the profile: a multi-target
    /// switch, degraded to a compare-and-branch for one known target, or a
    /// plain recorded exit for none.
    fn resolve_dynamic(&mut self, d: PendingDynamic) -> Result<(), TranslateError> {
        let targets = self.profile.targets(d.pc);
        debug!(
            pc = format_args!("{:#x}", d.pc),
            known = targets.len(),
            "resolve dynamic branch"
        );
        self.sink.set_current(d.block);
        self.regs.lazy = d.lazy;

        match targets.as_slice() {
            [] => {
                self.exit_via(d.target, d.pc, d.kind);
            }
            [only] => {
                let hit = self.sink.new_temp(TempKind::Int);
                self.sink.push(Inst::BoolCmp {
                    dst: hit,
                    cond: CmpCond::Eq,
                    lhs: d.target,
                    rhs: Src::Imm(*only as i32),
                });
                let taken = self.block_for(TraceKey {
                    pc: *only,
                    state: d.lazy,
                });
                let miss = self.dynamic_miss_block(&d);
                self.sink.set_current(d.block);
                self.sink.terminate(Terminator::Branch {
                    cond: hit,
                    likely: Some(true),
                    taken,
                    fallthrough: miss,
                });
            }
            many => {
                let mut cases = Vec::with_capacity(many.len());
                for t in many {
                    let b = self.block_for(TraceKey {
                        pc: *t,
                        state: d.lazy,
                    });
                    cases.push((*t, b));
                }
                let miss = self.dynamic_miss_block(&d);
                self.sink.set_current(d.block);
                self.sink.terminate(Terminator::Switch {
                    scrutinee: d.target,
                    cases,
                    default: miss,
                });
            }
        }
        Ok(())
    }

    /// The unpredicted side of a resolved dynamic branch: record where it
    /// actually went and exit.
    fn dynamic_miss_block(&mut self, d: &PendingDynamic) -> BlockId {
        let saved_lazy = self.regs.lazy;
        let b = self.sink.create_block();
        self.sink.set_current(b);
        self.regs.lazy = d.lazy;
        self.exit_via(d.target, d.pc, d.kind);
        self.regs.lazy = saved_lazy;
        b
    }

    pub(crate) fn temp(&mut self) -> Temp {
        self.sink.new_temp(TempKind::Int)
    }

    pub(crate) fn long_temp(&mut self) -> Temp {
        self.sink.new_temp(TempKind::Long)
    }

    pub(crate) fn const_temp(&mut self, value: i32) -> Temp {
        let t = self.temp();
        self.sink.push(Inst::Const { dst: t, value });
        t
    }
}
