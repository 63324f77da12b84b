//! The target-independent IR the trace builder emits.
//!
//! Temps are write-many virtual registers, not SSA values; the builder keeps
//! one temp per guest register view for the lifetime of a trace and rewrites
//! them freely. Sub-word loads sign-extend; stores truncate to their width.

use lariat_types::{Flag, Gpr, Seg, Width};
use lariat_x86::ControlReg;

/// A virtual register in the output program.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Temp(pub u32);

/// Width class of a temp.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TempKind {
    /// 32-bit integer.
    Int,
    /// 64-bit integer, used for widening multiply and divide.
    Long,
}

/// A basic block handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BlockId(pub u32);

/// A guest register slot in the architected register file, the target of
/// fills and spills.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ArchReg {
    Gpr(Gpr),
    Seg(Seg),
    Flag(Flag),
}

/// Second operand of a binary or compare instruction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Src {
    Temp(Temp),
    Imm(i32),
}

impl From<Temp> for Src {
    fn from(t: Temp) -> Src {
        Src::Temp(t)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    And,
    Or,
    Xor,
    Shl,
    /// Logical right shift.
    Shr,
    /// Arithmetic right shift.
    Sar,
    Mul,
    Div,
    Rem,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnOp {
    Not,
    Neg,
    SignExtend8,
    SignExtend16,
    /// Sign-extending int-to-long.
    IntToLong,
    /// Zero-extending int-to-long.
    IntToLongUnsigned,
    /// Truncating long-to-int.
    LongToInt,
    /// Upper 32 bits of a long.
    LongHigh,
}

/// Predicates for [`Inst::BoolCmp`]. The carry/overflow variants compute the
/// x86 flag outcome of an add or subtract of the two operands directly, so
/// flag temps never depend on a separate flags register.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CmpCond {
    Eq,
    Ne,
    LtSigned,
    /// Unsigned below; doubles as borrow-from-subtract.
    LtUnsigned,
    CarryFromAdd,
    OverflowFromAdd,
    OverflowFromSub,
}

/// Why control is leaving through a recorded branch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BranchKind {
    Jump,
    Call,
    Return,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Inst {
    Const { dst: Temp, value: i32 },
    Move { dst: Temp, src: Temp },
    Unary { dst: Temp, op: UnOp, src: Temp },
    Binary { dst: Temp, op: BinOp, lhs: Temp, rhs: Src },
    /// dst = 1 if the predicate holds, else 0.
    BoolCmp { dst: Temp, cond: CmpCond, lhs: Temp, rhs: Src },
    /// dst = on_true if cond is nonzero, else on_false.
    Select { dst: Temp, cond: Temp, on_true: Src, on_false: Src },
    /// Guest memory load; 8/16-bit results are sign-extended.
    Load { dst: Temp, addr: Temp, width: Width },
    /// Guest memory store; truncates to `width`.
    Store { addr: Temp, src: Temp, width: Width },
    /// Read a guest register from the architected file.
    Fill { dst: Temp, reg: ArchReg },
    /// Write a guest register back to the architected file.
    Spill { reg: ArchReg, src: Temp },
    ReadControl { dst: Temp, reg: ControlReg },
    WriteControl { reg: ControlReg, src: Temp },
    ReadTimestamp { lo: Temp, hi: Temp },
    /// dst = (hi << 32) | (lo as u32).
    MakeLong { dst: Temp, hi: Temp, lo: Temp },
    /// Trap into the host kernel proxy; register state is spilled around it.
    SystemCall { vector: u8, next_pc: u32 },
    /// Profiling hook: note that the branch at `source` went to `target`.
    RecordBranch { source: u32, target: Temp, kind: BranchKind },
    /// Guest illegal-instruction fault at `pc`.
    RaiseBadInstruction { pc: u32 },
    /// Guest divide fault at `pc`.
    RaiseDivideError { pc: u32 },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Terminator {
    /// Not yet terminated; only valid mid-construction.
    Pending,
    Jump(BlockId),
    Branch {
        cond: Temp,
        /// Static prediction, when one exists.
        likely: Option<bool>,
        taken: BlockId,
        fallthrough: BlockId,
    },
    Switch {
        scrutinee: Temp,
        cases: Vec<(u32, BlockId)>,
        default: BlockId,
    },
    /// Leave the trace; the temp holds the next guest pc.
    Return(Temp),
}

/// Where the trace builder writes its output. The backend owning the real
/// code generator implements this; [`crate::Cfg`] is the in-memory
/// implementation used for inspection and tests.
pub trait IrSink {
    fn new_temp(&mut self, kind: TempKind) -> Temp;
    fn create_block(&mut self) -> BlockId;
    fn set_current(&mut self, block: BlockId);
    fn current(&self) -> BlockId;
    fn push(&mut self, inst: Inst);
    /// Terminate `current`; a block is terminated exactly once.
    fn terminate(&mut self, term: Terminator);
}
