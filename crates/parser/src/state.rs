//! Compile-time state: the per-function stack frame of the parser and the
//! dynamic data shared across nested functions (active variables, pending
//! gotos, labels, and the group registry).

use crate::emit::Chunk;

/// Hard cap on VM registers per function.
pub const MAX_REGS: u8 = 200;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Attrib {
    None,
    Const,
    Close,
    Group,
}

impl Attrib {
    pub fn parse(name: &str) -> Option<Attrib> {
        Some(match name {
            "const" => Attrib::Const,
            "close" => Attrib::Close,
            "group" => Attrib::Group,
            _ => return None,
        })
    }

    /// Assignment to `const`, `close`, and group bindings is rejected
    /// (groups only through field-wise overwrite).
    pub fn readonly(self) -> bool {
        !matches!(self, Attrib::None)
    }
}

/// One active local variable.
#[derive(Debug, Copy, Clone)]
pub struct ActVar<'a> {
    pub name: &'a str,
    pub reg: u8,
    pub attrib: Attrib,
    /// Registry index when this binding is a `<group>`.
    pub group: Option<usize>,
}

/// A compile-time group: each field is an ordinary local register, found
/// here by name when a compound `g.x` reference resolves.
#[derive(Debug, Default)]
pub struct GroupDesc<'a> {
    pub fields: Vec<GroupField<'a>>,
}

#[derive(Debug, Copy, Clone)]
pub struct GroupField<'a> {
    pub name: &'a str,
    pub reg: u8,
    /// Sub-group registry index when this field is itself a group.
    pub group: Option<usize>,
}

impl<'a> GroupDesc<'a> {
    pub fn field(&self, name: &str) -> Option<GroupField<'a>> {
        self.fields.iter().copied().find(|f| f.name == name)
    }
}

/// A declared label, or a pending goto awaiting one.
#[derive(Debug, Copy, Clone)]
pub struct LabelDesc<'a> {
    pub name: &'a str,
    /// Label: the target pc. Goto: the pc of the unpatched jump.
    pub pc: u32,
    pub line: u32,
    /// Function-relative active-variable count at the declaration point.
    pub nactvar: usize,
}

/// Per-block bookkeeping; a stack within each FuncState.
#[derive(Debug)]
pub struct BlockCnt {
    pub first_label: usize,
    pub first_goto: usize,
    pub first_group: usize,
    /// Function-relative count of locals outside this block.
    pub nactvar: usize,
    /// Register watermark on entry.
    pub freereg: u8,
    pub is_loop: bool,
}

/// Dynamic data shared by all function states of one parse.
#[derive(Default)]
pub struct DynData<'a> {
    pub actvar: Vec<ActVar<'a>>,
    pub labels: Vec<LabelDesc<'a>>,
    pub gotos: Vec<LabelDesc<'a>>,
    pub groups: Vec<GroupDesc<'a>>,
}

/// Parse-time state of one function being compiled.
pub struct FuncState<'a> {
    pub chunk: Chunk,
    pub freereg: u8,
    /// Index of this function's first entry in DynData::actvar.
    pub first_local: usize,
    /// Index of this function's first label / goto in DynData.
    pub first_label: usize,
    pub first_goto: usize,
    pub blocks: Vec<BlockCnt>,
    /// Line of the `function` keyword, for diagnostics.
    pub line: u32,
    pub _marker: std::marker::PhantomData<&'a ()>,
}

impl<'a> FuncState<'a> {
    pub fn new(name: &str, line: u32, dyn_data: &DynData<'a>) -> Self {
        Self {
            chunk: Chunk::new(name),
            freereg: 0,
            first_local: dyn_data.actvar.len(),
            first_label: dyn_data.labels.len(),
            first_goto: dyn_data.gotos.len(),
            blocks: Vec::new(),
            line,
            _marker: std::marker::PhantomData,
        }
    }

    /// Count of this function's active locals.
    pub fn nactvar(&self, dyn_data: &DynData<'a>) -> usize {
        dyn_data.actvar.len() - self.first_local
    }

    /// Reserve `n` consecutive registers, returning the first.
    pub fn reserve(&mut self, n: u8) -> Result<u8, String> {
        let base = self.freereg;
        let next = base as usize + n as usize;
        if next > MAX_REGS as usize {
            return Err(format!(
                "function needs more than {MAX_REGS} registers"
            ));
        }
        self.freereg = next as u8;
        if self.freereg > self.chunk.max_regs {
            self.chunk.max_regs = self.freereg;
        }
        Ok(base)
    }

    /// Release all registers at and above `reg`.
    pub fn free_to(&mut self, reg: u8) {
        debug_assert!(reg <= self.freereg);
        self.freereg = reg;
    }
}
