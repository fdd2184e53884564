//! The register-based instruction set the parser emits. The executing VM
//! is an external collaborator; this layer defines the op shapes, the
//! constant pool, and the prototype (`Chunk`) container it consumes.
//! Chunks serialize with serde so bundles can carry them as opaque blobs.

use ast::{BinOp, UnOp};
use serde::{Deserialize, Serialize};

/// Result-count marker meaning "all available results".
pub const MULTI: u8 = u8::MAX;

/// Register operand meaning "absent".
pub const NO_REG: u8 = u8::MAX;

/// Jump target placeholder; every emitted placeholder must be patched.
pub const NO_TARGET: u32 = u32::MAX;

#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub enum Op {
    Move { dst: u8, src: u8 },
    LoadK { dst: u8, k: u32 },
    LoadNil { dst: u8, n: u8 },
    LoadBool { dst: u8, value: bool },
    GetGlobal { dst: u8, name: u32 },
    SetGlobal { name: u32, src: u8 },
    GetUpval { dst: u8, upval: u8 },
    SetUpval { upval: u8, src: u8 },
    GetField { dst: u8, obj: u8, name: u32 },
    SetField { obj: u8, name: u32, src: u8 },
    GetIndex { dst: u8, obj: u8, idx: u8 },
    SetIndex { obj: u8, idx: u8, src: u8 },
    NewTable { dst: u8, hint: u16 },
    /// `obj[start, end]` with nil endpoints loaded into registers.
    Slice { dst: u8, obj: u8, start: u8, end: u8 },
    Arith { op: BinOp, dst: u8, lhs: u8, rhs: u8 },
    Unary { op: UnOp, dst: u8, src: u8 },
    /// Concatenate `n` consecutive registers beginning at `base`.
    Concat { dst: u8, base: u8, n: u8 },
    ToString { dst: u8, src: u8 },
    Jump { to: u32 },
    /// Jump to `to` when `src`'s truthiness equals `if_true`.
    TestJump { src: u8, if_true: bool, to: u32 },
    /// Method-call prep: loads `obj`'s method into `base` and `obj` itself
    /// into `base + 1`.
    SelfField { base: u8, obj: u8, name: u32 },
    Call { base: u8, nargs: u8, nresults: u8 },
    Closure { dst: u8, proto: u32 },
    Vararg { dst: u8, n: u8 },
    Return { base: u8, n: u8 },
    /// Open a protected frame. On error the VM stores false and the error
    /// (handler-transformed when `handler != NO_REG`) at `base`, `base+1`
    /// and transfers to `to`.
    Catch { base: u8, handler: u8, to: u32 },
    /// Close the protected frame opened by the matching Catch: stores true
    /// at `base` and moves `nresults` results from `src` to `base + 1`.
    EndCatch { base: u8, src: u8, nresults: u8 },
    ForPrep { base: u8, to: u32 },
    ForLoop { base: u8, to: u32 },
    GenForPrep { base: u8, to: u32 },
    GenForLoop { base: u8, nvars: u8, to: u32 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Const {
    Int(i64),
    Float(f64),
    Str(String),
    /// An `enum ... end` expression: an immutable ordered name set.
    Enum(Vec<String>),
}

impl Const {
    /// Pool-interning equality; floats compare by bit pattern so that
    /// 0.0 and -0.0 keep distinct slots.
    fn same(&self, other: &Const) -> bool {
        match (self, other) {
            (Const::Int(a), Const::Int(b)) => a == b,
            (Const::Float(a), Const::Float(b)) => a.to_bits() == b.to_bits(),
            (Const::Str(a), Const::Str(b)) => a == b,
            // Enum constants are never shared.
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpvalDesc {
    pub name: String,
    /// True when captured from the parent's register stack, false when
    /// re-captured from the parent's own upvalues.
    pub from_parent_reg: bool,
    pub index: u8,
}

/// One compiled function prototype.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub name: String,
    pub nparams: u8,
    pub is_vararg: bool,
    pub max_regs: u8,
    pub ops: Vec<Op>,
    /// Source line per op, parallel to `ops`.
    pub lines: Vec<u32>,
    pub consts: Vec<Const>,
    pub upvals: Vec<UpvalDesc>,
    pub protos: Vec<Chunk>,
}

impl Chunk {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            nparams: 0,
            is_vararg: false,
            max_regs: 0,
            ops: Vec::new(),
            lines: Vec::new(),
            consts: Vec::new(),
            upvals: Vec::new(),
            protos: Vec::new(),
        }
    }

    /// Append `op`, returning its pc.
    pub fn emit(&mut self, op: Op, line: u32) -> u32 {
        self.ops.push(op);
        self.lines.push(line);
        (self.ops.len() - 1) as u32
    }

    /// The pc the next emitted op will occupy.
    pub fn here(&self) -> u32 {
        self.ops.len() as u32
    }

    /// Intern `k`, returning its pool index.
    pub fn add_const(&mut self, k: Const) -> u32 {
        if let Some(found) = self.consts.iter().position(|have| have.same(&k)) {
            return found as u32;
        }
        self.consts.push(k);
        (self.consts.len() - 1) as u32
    }

    pub fn str_const(&mut self, s: &str) -> u32 {
        self.add_const(Const::Str(s.to_owned()))
    }

    /// Point the jump-shaped op at `pc` to `target`.
    pub fn patch_to(&mut self, pc: u32, target: u32) {
        match &mut self.ops[pc as usize] {
            Op::Jump { to }
            | Op::TestJump { to, .. }
            | Op::Catch { to, .. }
            | Op::ForPrep { to, .. }
            | Op::ForLoop { to, .. }
            | Op::GenForPrep { to, .. }
            | Op::GenForLoop { to, .. } => *to = target,
            other => unreachable!("op at {pc} is not a jump: {other:?}"),
        }
    }

    /// Adjust the result count of a multi-value op after the fact; callers
    /// that consume "all results" patch with `MULTI`.
    pub fn patch_results(&mut self, pc: u32, n: u8) {
        match &mut self.ops[pc as usize] {
            Op::Call { nresults, .. } => *nresults = n,
            Op::Vararg { n: count, .. } => *count = n,
            Op::EndCatch { nresults, .. } => *nresults = n,
            other => unreachable!("op at {pc} has no result count: {other:?}"),
        }
    }
}
