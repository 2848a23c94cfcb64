//! Decompiler for CPython 2.x bytecode.
//!
//! The input is an in-memory [`CodeObject`]; the container format on disk is
//! out of scope. [`decompile`] reconstructs Python source through a symbolic
//! stack interpreter and a control-flow structuring pass, degrading to
//! partial per-block output when a unit cannot be fully structured.
//! [`disassemble`] renders an annotated instruction listing.

mod tables {
    include!(concat!(env!("OUT_DIR"), "/cpython_tables.rs"));
}

pub use tables::{CMP_OP, OpFmt, Opcode};

use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::rc::Rc;

use byteorder::{ByteOrder, LittleEndian};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DepycError {
    #[error("constant index {index} out of range (have {len})")]
    BadConstIndex { index: u16, len: usize },
    #[error("name index {index} out of range (have {len})")]
    BadNameIndex { index: u16, len: usize },
    #[error("local index {index} out of range (have {len})")]
    BadLocalIndex { index: u16, len: usize },
    #[error("cell/free index {index} out of range (have {len})")]
    BadCellIndex { index: u16, len: usize },
    #[error("comparison operator {index} out of range")]
    BadCompareOp { index: u16 },
    #[error("nesting depth limit {limit} exceeded")]
    NestingTooDeep { limit: usize },
}

pub const CO_OPTIMIZED: u32 = 0x01;
pub const CO_NEWLOCALS: u32 = 0x02;
pub const CO_VARARGS: u32 = 0x04;
pub const CO_VARKEYWORDS: u32 = 0x08;
pub const CO_NESTED: u32 = 0x10;
pub const CO_GENERATOR: u32 = 0x20;
pub const CO_NOFREE: u32 = 0x40;

/// A constant-pool entry. Renders with Python `repr` conventions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Const {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Tuple(Vec<Const>),
    Code(Rc<CodeObject>),
}

fn repr_str(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 || (c as u32) == 0x7f => {
                out.push_str(&format!("\\x{:02x}", c as u32));
            }
            c => out.push(c),
        }
    }
    out.push('\'');
    out
}

impl fmt::Display for Const {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Const::None => f.write_str("None"),
            Const::Bool(true) => f.write_str("True"),
            Const::Bool(false) => f.write_str("False"),
            Const::Int(i) => write!(f, "{i}"),
            Const::Float(x) => {
                if x.is_finite() && *x == x.trunc() {
                    write!(f, "{x:.1}")
                } else {
                    write!(f, "{x}")
                }
            }
            Const::Str(s) => f.write_str(&repr_str(s)),
            Const::Tuple(items) => {
                f.write_str("(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                if items.len() == 1 {
                    f.write_str(",")?;
                }
                f.write_str(")")
            }
            Const::Code(co) => write!(f, "<code object {}>", co.name),
        }
    }
}

/// One unit of decompilation, already parsed out of whatever container held
/// it. Nested functions and class bodies arrive as `Const::Code` constants.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CodeObject {
    pub name: String,
    pub argcount: u32,
    pub nlocals: u32,
    pub flags: u32,
    pub code: Vec<u8>,
    pub consts: Vec<Const>,
    pub names: Vec<String>,
    pub varnames: Vec<String>,
    pub freevars: Vec<String>,
    pub cellvars: Vec<String>,
}

impl CodeObject {
    fn const_at(&self, index: u16) -> Result<&Const, DepycError> {
        self.consts.get(index as usize).ok_or(DepycError::BadConstIndex {
            index,
            len: self.consts.len(),
        })
    }

    fn name_at(&self, index: u16) -> Result<&str, DepycError> {
        self.names
            .get(index as usize)
            .map(String::as_str)
            .ok_or(DepycError::BadNameIndex {
                index,
                len: self.names.len(),
            })
    }

    fn varname_at(&self, index: u16) -> Result<&str, DepycError> {
        self.varnames
            .get(index as usize)
            .map(String::as_str)
            .ok_or(DepycError::BadLocalIndex {
                index,
                len: self.varnames.len(),
            })
    }

    /// Cell variables first, then free variables, as LOAD_DEREF indexes them.
    fn cell_or_free_at(&self, index: u16) -> Result<&str, DepycError> {
        let i = index as usize;
        let found = if i < self.cellvars.len() {
            self.cellvars.get(i)
        } else {
            self.freevars.get(i - self.cellvars.len())
        };
        found.map(String::as_str).ok_or(DepycError::BadCellIndex {
            index,
            len: self.cellvars.len() + self.freevars.len(),
        })
    }

    fn find_code_const(&self, name: &str) -> Option<Rc<CodeObject>> {
        self.consts.iter().find_map(|c| match c {
            Const::Code(co) if co.name == name => Some(co.clone()),
            _ => None,
        })
    }
}

#[derive(Debug, Clone)]
pub struct DecompileOptions {
    /// Dump the CFG after every structuring pass via `log::debug!`.
    pub trace_passes: bool,
    /// Cap on structuring rewrites; `None` scales with the block count.
    pub rewrite_budget: Option<usize>,
    /// Recursion bound for nested functions and classes.
    pub max_depth: usize,
}

impl Default for DecompileOptions {
    fn default() -> Self {
        DecompileOptions {
            trace_passes: false,
            rewrite_budget: None,
            max_depth: 32,
        }
    }
}

/// A decoded instruction. `op` is `None` for an unknown opcode byte; `arg`
/// is `None` for operand-less opcodes and for a truncated trailing operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instr {
    pub offset: usize,
    pub op: Option<Opcode>,
    pub arg: Option<u16>,
    pub size: usize,
}

impl Instr {
    pub fn end(&self) -> usize {
        self.offset + self.size
    }

    pub fn target(&self) -> Option<usize> {
        let op = self.op?;
        let arg = self.arg? as usize;
        match op.fmt() {
            OpFmt::JREL => Some(self.offset + 3 + arg),
            OpFmt::JABS => Some(arg),
            _ => None,
        }
    }

    fn is(&self, op: Opcode) -> bool {
        self.op == Some(op)
    }
}

/// The fully decoded instruction sequence of one code object. Instructions
/// tile the byte string: sizes sum to the code length, offsets increase.
#[derive(Debug, Clone)]
pub struct InstrSeq {
    instrs: Vec<Instr>,
    index_by_offset: HashMap<usize, usize>,
}

impl InstrSeq {
    pub fn decode(code: &[u8]) -> InstrSeq {
        let mut instrs = Vec::new();
        let mut i = 0;
        while i < code.len() {
            let byte = code[i];
            let instr = match Opcode::from_byte(byte) {
                Some(op) if op.has_arg() => {
                    if i + 3 <= code.len() {
                        let arg = LittleEndian::read_u16(&code[i + 1..i + 3]);
                        Instr {
                            offset: i,
                            op: Some(op),
                            arg: Some(arg),
                            size: 3,
                        }
                    } else {
                        warn!("truncated operand for {} at offset {i}", op.mnemonic());
                        Instr {
                            offset: i,
                            op: Some(op),
                            arg: None,
                            size: code.len() - i,
                        }
                    }
                }
                Some(op) => Instr {
                    offset: i,
                    op: Some(op),
                    arg: None,
                    size: 1,
                },
                None => {
                    warn!("unknown opcode 0x{byte:02x} at offset {i}");
                    Instr {
                        offset: i,
                        op: None,
                        arg: None,
                        size: 1,
                    }
                }
            };
            i = instr.end();
            instrs.push(instr);
        }
        let index_by_offset = instrs.iter().enumerate().map(|(n, ins)| (ins.offset, n)).collect();
        InstrSeq {
            instrs,
            index_by_offset,
        }
    }

    pub fn instrs(&self) -> &[Instr] {
        &self.instrs
    }

    fn at(&self, offset: usize) -> Option<&Instr> {
        self.index_by_offset.get(&offset).map(|&i| &self.instrs[i])
    }

    /// Instructions in `[offset, offset + length)`; `length == 0` runs to the
    /// end of the code.
    fn range(&self, offset: usize, length: usize) -> &[Instr] {
        let start = self.instrs.partition_point(|i| i.offset < offset);
        let end = if length == 0 {
            self.instrs.len()
        } else {
            self.instrs.partition_point(|i| i.offset < offset + length)
        };
        &self.instrs[start..end.max(start)]
    }
}

/// One forwarding step for a conditional jump chain. Returns the new target
/// address and whether the remaining chain is polarity-flipped.
fn chain_hop(seq: &InstrSeq, ins: &Instr, negate: bool) -> Option<(usize, bool)> {
    let op = ins.op?;
    let target_addr = ins.target()?;
    let target = seq.at(target_addr)?;
    let after = seq.at(target.end());

    let false_like = (op == Opcode::JumpIfFalse) != negate;
    let (same, other) = if false_like {
        (Opcode::JumpIfFalse, Opcode::JumpIfTrue)
    } else {
        (Opcode::JumpIfTrue, Opcode::JumpIfFalse)
    };

    if target.is(same) {
        return Some((target.target()?, false));
    }
    if target.is(Opcode::UnaryNot) {
        if let Some(after) = after {
            if after.is(other) {
                return Some((after.target()?, true));
            }
            if after.is(same) {
                return Some((after.end(), true));
            }
        }
        return None;
    }
    if target.is(other) {
        return Some((target.end(), false));
    }
    None
}

/// Collapse chains of conditional jumps (possibly through UNARY_NOT) so each
/// conditional jump points at its final destination.
fn collapse_jump_chains(seq: &mut InstrSeq) {
    for i in 0..seq.instrs.len() {
        let ins = seq.instrs[i];
        if !(ins.is(Opcode::JumpIfFalse) || ins.is(Opcode::JumpIfTrue)) || ins.arg.is_none() {
            continue;
        }
        let mut cur = ins;
        let mut negate = false;
        while let Some((addr, neg)) = chain_hop(seq, &cur, negate) {
            let Some(rel) = addr.checked_sub(cur.offset + 3) else {
                break;
            };
            // A collapsed target past the operand range stays uncollapsed.
            let Ok(rel) = u16::try_from(rel) else {
                break;
            };
            cur.arg = Some(rel);
            negate = neg;
        }
        seq.instrs[i].arg = cur.arg;
    }
}

/// Classify absolute jumps against known loop headers: the innermost latch
/// per header becomes NOP, the rest become CONTINUE_LOOP. Anything else is
/// left alone and reported.
fn classify_absolute_jumps(seq: &mut InstrSeq) {
    let mut headers: HashMap<usize, bool> = HashMap::new();
    for ins in &seq.instrs {
        if ins.is(Opcode::ForIter) {
            headers.insert(ins.offset, false);
        } else if ins.is(Opcode::SetupLoop) {
            headers.insert(ins.end(), false);
        }
    }
    for i in (0..seq.instrs.len()).rev() {
        let ins = seq.instrs[i];
        if !ins.is(Opcode::JumpAbsolute) {
            continue;
        }
        let Some(arg) = ins.arg else { continue };
        let target = arg as usize;
        match headers.get_mut(&target) {
            Some(claimed) if ins.offset > target => {
                if !*claimed {
                    *claimed = true;
                    seq.instrs[i].op = Some(Opcode::Nop);
                    seq.instrs[i].arg = None;
                } else {
                    seq.instrs[i].op = Some(Opcode::ContinueLoop);
                }
            }
            _ => {
                warn!(
                    "unexpected absolute jump at offset {} to {target}",
                    ins.offset
                );
            }
        }
    }
}

fn normalize_jumps(seq: &mut InstrSeq) {
    collapse_jump_chains(seq);
    classify_absolute_jumps(seq);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryKind {
    Pos,
    Neg,
    Invert,
    Not,
    Convert,
}

impl UnaryKind {
    fn token(self) -> &'static str {
        match self {
            UnaryKind::Pos => "+",
            UnaryKind::Neg => "-",
            UnaryKind::Invert => "~",
            UnaryKind::Not => "not",
            UnaryKind::Convert => "`",
        }
    }

    fn precedence(self) -> u8 {
        match self {
            UnaryKind::Not => 3,
            UnaryKind::Convert => 14,
            _ => 11,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryKind {
    Or,
    And,
    BitOr,
    BitXor,
    BitAnd,
    Shl,
    Shr,
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Mod,
    Pow,
}

impl BinaryKind {
    fn token(self) -> &'static str {
        match self {
            BinaryKind::Or => "or",
            BinaryKind::And => "and",
            BinaryKind::BitOr => "|",
            BinaryKind::BitXor => "^",
            BinaryKind::BitAnd => "&",
            BinaryKind::Shl => "<<",
            BinaryKind::Shr => ">>",
            BinaryKind::Add => "+",
            BinaryKind::Sub => "-",
            BinaryKind::Mul => "*",
            BinaryKind::Div => "/",
            BinaryKind::FloorDiv => "//",
            BinaryKind::Mod => "%",
            BinaryKind::Pow => "**",
        }
    }

    fn precedence(self) -> u8 {
        match self {
            BinaryKind::Or => 1,
            BinaryKind::And => 2,
            BinaryKind::BitOr => 5,
            BinaryKind::BitXor => 6,
            BinaryKind::BitAnd => 7,
            BinaryKind::Shl | BinaryKind::Shr => 8,
            BinaryKind::Add | BinaryKind::Sub => 9,
            BinaryKind::Mul | BinaryKind::Div | BinaryKind::FloorDiv | BinaryKind::Mod => 10,
            BinaryKind::Pow => 12,
        }
    }
}

#[derive(Debug)]
pub struct FuncExpr {
    code: Rc<CodeObject>,
    defaults: Vec<Rc<Expr>>,
}

/// A reconstructed expression. Shared subtrees are `Rc` handles; a handle
/// whose strong count has dropped to one at POP_TOP is the last live use and
/// renders as a bare expression statement.
#[derive(Debug)]
pub enum Expr {
    Name(String),
    Literal(Const),
    Code(Rc<CodeObject>),
    Unary {
        kind: UnaryKind,
        operand: Rc<Expr>,
    },
    Binary {
        kind: BinaryKind,
        lhs: Rc<Expr>,
        rhs: Rc<Expr>,
    },
    Inplace {
        kind: BinaryKind,
        lhs: Rc<Expr>,
        rhs: Rc<Expr>,
    },
    Compare {
        op: &'static str,
        lhs: Rc<Expr>,
        rhs: Rc<Expr>,
    },
    Subscript {
        value: Rc<Expr>,
        index: Rc<Expr>,
    },
    Slice {
        value: Rc<Expr>,
        lower: Option<Rc<Expr>>,
        upper: Option<Rc<Expr>>,
    },
    BuiltSlice {
        start: Rc<Expr>,
        stop: Rc<Expr>,
        step: Option<Rc<Expr>>,
    },
    Attribute {
        value: Rc<Expr>,
        name: String,
    },
    Call {
        callee: String,
        args: Vec<String>,
    },
    Tuple(Vec<Rc<Expr>>),
    List(Vec<Rc<Expr>>),
    Map(RefCell<Vec<(Rc<Expr>, Rc<Expr>)>>),
    Iter(Rc<Expr>),
    Unpacked {
        seq: Rc<Expr>,
        index: usize,
    },
    Function(FuncExpr),
    Lambda {
        params: String,
        body: String,
    },
    Class {
        name: String,
        bases: Vec<String>,
    },
    Import {
        module: String,
        level: i64,
        froms: RefCell<Vec<(String, String)>>,
    },
    ImportFrom {
        import: Rc<Expr>,
        name: String,
    },
    Yielded(Rc<Expr>),
    Locals,
    ExceptionSlot(u8),
}

impl Expr {
    /// Operator precedence, `None` for data nodes that never take parens.
    fn precedence(&self) -> Option<u8> {
        match self {
            Expr::Binary { kind, .. } => Some(kind.precedence()),
            Expr::Unary { kind, .. } => Some(kind.precedence()),
            Expr::Compare { .. } => Some(4),
            Expr::Subscript { .. } | Expr::Slice { .. } | Expr::Attribute { .. } | Expr::Call { .. } => Some(13),
            _ => None,
        }
    }
}

/// Render `child` under an operator of precedence `parent`, parenthesizing
/// lower-precedence operator children.
fn sub(parent: u8, child: &Expr) -> String {
    match child.precedence() {
        Some(p) if parent > p => format!("({child})"),
        _ => child.to_string(),
    }
}

fn blank_if_none(e: &Expr) -> String {
    match e {
        Expr::Literal(Const::None) => String::new(),
        other => other.to_string(),
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Name(s) => f.write_str(s),
            Expr::Literal(c) => write!(f, "{c}"),
            Expr::Code(co) => write!(f, "<code object {}>", co.name),
            Expr::Unary { kind, operand } => match kind {
                UnaryKind::Not => {
                    let s = sub(kind.precedence(), operand);
                    if s.starts_with('(') {
                        write!(f, "not{s}")
                    } else {
                        write!(f, "not {s}")
                    }
                }
                UnaryKind::Convert => write!(f, "`{operand}`"),
                _ => write!(f, "{}{}", kind.token(), sub(kind.precedence(), operand)),
            },
            Expr::Binary { kind, lhs, rhs } => {
                let p = kind.precedence();
                write!(f, "{} {} {}", sub(p, lhs), kind.token(), sub(p, rhs))
            }
            Expr::Inplace { kind, lhs, rhs } => {
                write!(f, "{lhs} {}= {rhs}", kind.token())
            }
            Expr::Compare { op, lhs, rhs } => {
                write!(f, "{} {op} {}", sub(4, lhs), sub(4, rhs))
            }
            Expr::Subscript { value, index } => write!(f, "{}[{index}]", sub(13, value)),
            Expr::Slice { value, lower, upper } => {
                let lo = lower.as_ref().map(|e| e.to_string()).unwrap_or_default();
                let up = upper.as_ref().map(|e| e.to_string()).unwrap_or_default();
                write!(f, "{}[{lo}:{up}]", sub(13, value))
            }
            Expr::BuiltSlice { start, stop, step } => {
                write!(f, "{}:{}", blank_if_none(start), blank_if_none(stop))?;
                if let Some(step) = step {
                    write!(f, ":{step}")?;
                }
                Ok(())
            }
            Expr::Attribute { value, name } => write!(f, "{}.{name}", sub(13, value)),
            Expr::Call { callee, args } => write!(f, "{callee}({})", args.join(", ")),
            Expr::Tuple(items) => {
                f.write_str("(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                if items.len() == 1 {
                    f.write_str(",")?;
                }
                f.write_str(")")
            }
            Expr::List(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
            Expr::Map(pairs) => {
                f.write_str("{")?;
                for (i, (k, v)) in pairs.borrow().iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{k}: {v}")?;
                }
                f.write_str("}")
            }
            Expr::Iter(e) => write!(f, "{e}"),
            Expr::Unpacked { seq, index } => match &**seq {
                Expr::Tuple(items) if *index < items.len() => write!(f, "{}", items[*index]),
                Expr::Literal(Const::Tuple(items)) if *index < items.len() => {
                    write!(f, "{}", items[*index])
                }
                _ => write!(f, "{}[{index}]", sub(13, seq)),
            },
            Expr::Function(func) => f.write_str(&func.code.name),
            Expr::Lambda { params, body } => write!(f, "(lambda {params}: {body})"),
            Expr::Class { name, .. } => f.write_str(name),
            Expr::Import { module, .. } => f.write_str(module),
            Expr::ImportFrom { name, .. } => f.write_str(name),
            Expr::Yielded(e) => write!(f, "(yield {e})"),
            Expr::Locals => f.write_str("locals()"),
            Expr::ExceptionSlot(i) => write!(f, "<exception slot {i}>"),
        }
    }
}

const INDENT: &str = "    ";

/// Indent every non-empty line by `depth` levels.
fn indent_text(text: &str, depth: usize) -> String {
    let prefix = INDENT.repeat(depth);
    let mut out = String::with_capacity(text.len());
    for (i, line) in text.split('\n').enumerate() {
        if i > 0 {
            out.push('\n');
        }
        if !line.is_empty() {
            out.push_str(&prefix);
            out.push_str(line);
        }
    }
    out
}

fn pass_fill(code: &str) -> String {
    if code.is_empty() {
        "pass\n".to_string()
    } else {
        code.to_string()
    }
}

/// Turn a handler body into the tail of an `except ...` clause. A leading
/// `# as v` marker (from the exception-slot store) becomes the ` as v:`
/// binder; otherwise a bare `:` line is prepended. The body is indented one
/// level.
fn indent_except_text(text: &str) -> String {
    let filled = pass_fill(text);
    let mut lines: Vec<String> = filled.split('\n').map(str::to_string).collect();
    if let Some(rest) = lines[0].strip_prefix('#') {
        lines[0] = format!("{rest}:");
    } else {
        lines.insert(0, ":".to_string());
    }
    for line in lines.iter_mut().skip(1) {
        if !line.is_empty() {
            *line = format!("{INDENT}{line}");
        }
    }
    lines.join("\n")
}

/// Indent a for-loop body under its header (the first line). An empty body
/// becomes `pass`.
fn indent_for_text(text: &str) -> String {
    let mut lines: Vec<String> = text.split('\n').map(str::to_string).collect();
    if lines.len() == 2 && lines[1].is_empty() {
        lines[1] = "pass".to_string();
        lines.push(String::new());
    }
    for line in lines.iter_mut().skip(1) {
        if !line.is_empty() {
            *line = format!("{INDENT}{line}");
        }
    }
    lines.join("\n")
}

type NodeId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeKind {
    Fallthrough,
    True,
    False,
    Jump,
    Loop,
    AfterLoop,
    For,
    AfterFor,
    Try,
    Except,
    FinallyBody,
    FinallyBody2,
    Finally,
    AfterException,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Edge {
    from: NodeId,
    to: NodeId,
    kind: EdgeKind,
}

/// A typed reference from the block containing `from_offset` to the block
/// starting at `to`.
#[derive(Debug, Clone, Copy)]
struct BlockRef {
    to: usize,
    from_offset: usize,
    kind: EdgeKind,
}

#[derive(Debug)]
struct BlockRefs {
    start: usize,
    leaders: BTreeSet<usize>,
    refs: Vec<BlockRef>,
}

/// Collect block leaders and typed block references from jump and setup
/// instructions at `start` and beyond.
fn collect_block_refs(seq: &InstrSeq, start: usize) -> BlockRefs {
    let mut leaders = BTreeSet::new();
    leaders.insert(start);
    let mut refs = Vec::new();

    fn add_ref(
        leaders: &mut BTreeSet<usize>,
        refs: &mut Vec<BlockRef>,
        off: usize,
        from: usize,
        kind: EdgeKind,
    ) {
        leaders.insert(off);
        refs.push(BlockRef {
            to: off,
            from_offset: from,
            kind,
        });
    }

    for ins in seq.range(start, 0) {
        let Some(op) = ins.op else { continue };
        let from = ins.offset;
        match op {
            Opcode::JumpForward => {
                if let Some(t) = ins.target() {
                    leaders.insert(ins.end());
                    add_ref(&mut leaders, &mut refs, t, from, EdgeKind::Fallthrough);
                }
            }
            Opcode::JumpIfFalse => {
                if let Some(t) = ins.target() {
                    add_ref(&mut leaders, &mut refs, ins.end(), from, EdgeKind::True);
                    add_ref(&mut leaders, &mut refs, t, from, EdgeKind::False);
                }
            }
            Opcode::JumpIfTrue => {
                if let Some(t) = ins.target() {
                    add_ref(&mut leaders, &mut refs, ins.end(), from, EdgeKind::False);
                    add_ref(&mut leaders, &mut refs, t, from, EdgeKind::True);
                }
            }
            Opcode::JumpAbsolute => {
                if let Some(t) = ins.target() {
                    leaders.insert(ins.end());
                    add_ref(&mut leaders, &mut refs, t, from, EdgeKind::Jump);
                }
            }
            Opcode::SetupLoop => {
                if let Some(t) = ins.target() {
                    add_ref(&mut leaders, &mut refs, ins.end(), from, EdgeKind::Loop);
                    add_ref(&mut leaders, &mut refs, t, from, EdgeKind::AfterLoop);
                }
            }
            Opcode::ForIter => {
                if let Some(t) = ins.target() {
                    add_ref(&mut leaders, &mut refs, ins.end(), from, EdgeKind::For);
                    add_ref(&mut leaders, &mut refs, t, from, EdgeKind::AfterFor);
                }
            }
            Opcode::SetupExcept => {
                if let Some(t) = ins.target() {
                    add_ref(&mut leaders, &mut refs, ins.end(), from, EdgeKind::Try);
                    add_ref(&mut leaders, &mut refs, t, from, EdgeKind::Except);
                }
            }
            Opcode::SetupFinally => {
                if let Some(t) = ins.target() {
                    add_ref(&mut leaders, &mut refs, ins.end(), from, EdgeKind::FinallyBody);
                    add_ref(&mut leaders, &mut refs, t, from, EdgeKind::Finally);
                }
            }
            Opcode::EndFinally => {
                add_ref(&mut leaders, &mut refs, ins.end(), from, EdgeKind::AfterException);
            }
            _ => {}
        }
    }

    BlockRefs {
        start,
        leaders,
        refs,
    }
}

#[derive(Debug, Default)]
struct Node {
    offset: usize,
    length: usize,
    conditional: bool,
    loop_head: bool,
    for_loop: bool,
    except_head: bool,
    finally_head: bool,
    code: String,
    condition: Option<Rc<Expr>>,
    incoming: Vec<Edge>,
    outgoing: Vec<Edge>,
}

/// Arena control-flow graph. Merged or deleted nodes leave `None` slots;
/// outgoing edge lists are canonical and incoming lists are rebuilt from
/// them after every redirection.
struct Cfg {
    nodes: Vec<Option<Node>>,
    root: NodeId,
}

impl Cfg {
    fn from_block_refs(refs: &BlockRefs) -> Cfg {
        let leaders: Vec<usize> = refs.leaders.iter().copied().collect();
        let id_of: HashMap<usize, NodeId> =
            leaders.iter().enumerate().map(|(i, &off)| (off, i)).collect();

        let mut nodes: Vec<Option<Node>> = Vec::with_capacity(leaders.len());
        for (i, &off) in leaders.iter().enumerate() {
            let length = leaders.get(i + 1).map(|next| next - off).unwrap_or(0);
            nodes.push(Some(Node {
                offset: off,
                length,
                ..Node::default()
            }));
        }

        let root = id_of.get(&refs.start).copied().unwrap_or(0);
        let mut cfg = Cfg { nodes, root };

        for r in &refs.refs {
            let from_leader = refs
                .leaders
                .range(..=r.from_offset)
                .next_back()
                .copied()
                .unwrap_or(refs.start);
            let (Some(&from), Some(&to)) = (id_of.get(&from_leader), id_of.get(&r.to)) else {
                continue;
            };
            if let Some(n) = cfg.node_mut(from) {
                match r.kind {
                    EdgeKind::True | EdgeKind::False => n.conditional = true,
                    EdgeKind::Loop | EdgeKind::AfterLoop => n.loop_head = true,
                    EdgeKind::For | EdgeKind::AfterFor => n.for_loop = true,
                    EdgeKind::Try | EdgeKind::Except => n.except_head = true,
                    EdgeKind::Finally | EdgeKind::FinallyBody => n.finally_head = true,
                    _ => {}
                }
            }
            cfg.add_edge(from, to, r.kind);
        }

        // Blocks that end without an explicit exit fall through.
        for i in 0..cfg.nodes.len().saturating_sub(1) {
            let empty = cfg.node(i).map(|n| n.outgoing.is_empty()).unwrap_or(false);
            if empty {
                cfg.add_edge(i, i + 1, EdgeKind::Fallthrough);
            }
        }

        cfg
    }

    fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id).and_then(|n| n.as_ref())
    }

    fn node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(id).and_then(|n| n.as_mut())
    }

    fn is_live(&self, id: NodeId) -> bool {
        self.node(id).is_some()
    }

    fn live_count(&self) -> usize {
        self.nodes.iter().filter(|n| n.is_some()).count()
    }

    fn live_ids_by_offset(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = (0..self.nodes.len()).filter(|&i| self.is_live(i)).collect();
        ids.sort_by_key(|&i| self.node(i).map(|n| n.offset).unwrap_or(usize::MAX));
        ids
    }

    fn alloc(&mut self, node: Node) -> NodeId {
        self.nodes.push(Some(node));
        self.nodes.len() - 1
    }

    fn remove_node(&mut self, id: NodeId) {
        if id < self.nodes.len() {
            self.nodes[id] = None;
        }
    }

    fn add_edge(&mut self, from: NodeId, to: NodeId, kind: EdgeKind) {
        let e = Edge { from, to, kind };
        if let Some(n) = self.node_mut(from) {
            n.outgoing.push(e);
        }
        if let Some(n) = self.node_mut(to) {
            n.incoming.push(e);
        }
    }

    fn remove_edge(&mut self, from: NodeId, to: NodeId) {
        if let Some(n) = self.node_mut(from) {
            if let Some(i) = n.outgoing.iter().position(|e| e.to == to) {
                n.outgoing.remove(i);
            }
        }
        if let Some(n) = self.node_mut(to) {
            if let Some(i) = n.incoming.iter().position(|e| e.from == from) {
                n.incoming.remove(i);
            }
        }
    }

    fn set_edge_kind(&mut self, from: NodeId, to: NodeId, kind: EdgeKind) {
        if let Some(n) = self.node_mut(from) {
            if let Some(e) = n.outgoing.iter_mut().find(|e| e.to == to) {
                e.kind = kind;
            }
        }
        if let Some(n) = self.node_mut(to) {
            if let Some(e) = n.incoming.iter_mut().find(|e| e.from == from) {
                e.kind = kind;
            }
        }
    }

    fn rebuild_incoming(&mut self) {
        let mut edges: Vec<Edge> = Vec::new();
        for id in 0..self.nodes.len() {
            if let Some(n) = self.node(id) {
                edges.extend(n.outgoing.iter().copied());
            }
        }
        for slot in self.nodes.iter_mut().flatten() {
            slot.incoming.clear();
        }
        for e in edges {
            if let Some(n) = self.node_mut(e.to) {
                n.incoming.push(e);
            }
        }
    }

    /// Repoint every edge touching `old` at `new`. A redirected edge that
    /// would duplicate an existing edge of the same endpoints is dropped;
    /// the pre-existing edge keeps its kind.
    fn redirect(&mut self, old: NodeId, new: NodeId) {
        for id in 0..self.nodes.len() {
            let Some(n) = self.node_mut(id) else { continue };
            let before = std::mem::take(&mut n.outgoing);
            let mut kept: Vec<(Edge, bool)> = Vec::with_capacity(before.len());
            for e in before {
                let renamed = e.from == old || e.to == old;
                let e = Edge {
                    from: if e.from == old { new } else { e.from },
                    to: if e.to == old { new } else { e.to },
                    kind: e.kind,
                };
                if renamed && kept.iter().any(|(k, _)| k.to == e.to) {
                    continue;
                }
                kept.push((e, renamed));
            }
            // A pre-existing edge late in the list also suppresses an
            // earlier renamed duplicate.
            let mut out: Vec<Edge> = Vec::with_capacity(kept.len());
            for i in 0..kept.len() {
                let (e, renamed) = kept[i];
                if renamed
                    && kept
                        .iter()
                        .enumerate()
                        .any(|(j, (k, ren))| j != i && !ren && k.to == e.to)
                {
                    continue;
                }
                out.push(e);
            }
            if let Some(n) = self.node_mut(id) {
                n.outgoing = out;
            }
        }
        if self.root == old {
            self.root = new;
        }
        self.rebuild_incoming();
    }

    fn out_single(&self, id: NodeId) -> Option<Edge> {
        let n = self.node(id)?;
        if n.outgoing.len() == 1 {
            Some(n.outgoing[0])
        } else {
            None
        }
    }

    fn find_out(&self, id: NodeId, kind: EdgeKind) -> Option<Edge> {
        self.node(id)?.outgoing.iter().copied().find(|e| e.kind == kind)
    }

    fn true_false(&self, id: NodeId) -> (Option<Edge>, Option<Edge>) {
        (
            self.find_out(id, EdgeKind::True),
            self.find_out(id, EdgeKind::False),
        )
    }

    fn condition_of(&self, id: NodeId) -> Rc<Expr> {
        self.node(id)
            .and_then(|n| n.condition.clone())
            .unwrap_or_else(|| Rc::new(Expr::Name("<condition>".to_string())))
    }

    fn negate_condition(&mut self, id: NodeId) {
        let cond = self.condition_of(id);
        if let Some(n) = self.node_mut(id) {
            n.condition = Some(Rc::new(Expr::Unary {
                kind: UnaryKind::Not,
                operand: cond,
            }));
        }
    }

    /// Deterministic postorder over outgoing-edge order from the root.
    fn postorder(&self) -> Vec<NodeId> {
        let mut res = Vec::new();
        let mut visited = HashSet::new();
        let mut emitted = HashSet::new();
        let mut stack = vec![self.root];
        while let Some(&id) = stack.last() {
            if visited.contains(&id) {
                if emitted.insert(id) {
                    res.push(id);
                }
                stack.pop();
                continue;
            }
            visited.insert(id);
            if let Some(n) = self.node(id) {
                for e in &n.outgoing {
                    if !visited.contains(&e.to) && self.is_live(e.to) {
                        stack.push(e.to);
                    }
                }
            }
        }
        res
    }

    fn dump(&self) -> String {
        let mut s = String::new();
        for id in self.live_ids_by_offset() {
            let Some(n) = self.node(id) else { continue };
            s.push_str(&format!(
                "node {id} @0x{:08X} cond={} loop={} for={} except={} finally={}",
                n.offset, n.conditional, n.loop_head, n.for_loop, n.except_head, n.finally_head
            ));
            for e in &n.outgoing {
                s.push_str(&format!(" -> {}({:?})", e.to, e.kind));
            }
            s.push('\n');
        }
        s
    }
}

/// Remaining structuring rewrites before the pass gives up.
struct Budget {
    left: usize,
    exhausted: bool,
}

impl Budget {
    fn new(left: usize) -> Budget {
        Budget {
            left,
            exhausted: false,
        }
    }

    fn spend(&mut self) -> bool {
        if self.left == 0 {
            if !self.exhausted {
                warn!("structuring rewrite budget exhausted; leaving partial output");
                self.exhausted = true;
            }
            return false;
        }
        self.left -= 1;
        true
    }
}

impl Cfg {
    /// Fold `and`/`or` chains: a conditional node whose branch is itself a
    /// single-predecessor conditional sharing the other branch target merges
    /// into one conditional node with a combined condition.
    fn merge_short_circuits(&mut self, budget: &mut Budget) {
        loop {
            let mut changes = false;
            for id in self.postorder() {
                if !self.node(id).map(|n| n.conditional).unwrap_or(false) {
                    continue;
                }
                let (Some(te), Some(fe)) = self.true_false(id) else {
                    continue;
                };
                let (tn, fn_) = (te.to, fe.to);

                if self.node(tn).map(|n| n.conditional && n.incoming.len() == 1).unwrap_or(false) {
                    if let (Some(te2), Some(fe2)) = self.true_false(tn) {
                        if fe2.to == fn_ {
                            if !budget.spend() {
                                return;
                            }
                            self.merge_conditions(id, tn, 1);
                            changes = true;
                            continue;
                        }
                        if te2.to == fn_ {
                            if !budget.spend() {
                                return;
                            }
                            self.merge_conditions(id, tn, 2);
                            changes = true;
                            continue;
                        }
                    }
                }
                if self.node(fn_).map(|n| n.conditional && n.incoming.len() == 1).unwrap_or(false) {
                    if let (Some(te2), Some(fe2)) = self.true_false(fn_) {
                        if te2.to == tn {
                            if !budget.spend() {
                                return;
                            }
                            self.merge_conditions(id, fn_, 0);
                            changes = true;
                            continue;
                        }
                        if fe2.to == tn {
                            if !budget.spend() {
                                return;
                            }
                            self.merge_conditions(id, fn_, 3);
                            changes = true;
                        }
                    }
                }
            }
            if !changes {
                break;
            }
        }
    }

    /// Combine conditional `x` and its successor conditional `y` into one
    /// node. `how`: 0 = or, 1 = and, 2 = not-or, 3 = not-and.
    fn merge_conditions(&mut self, x: NodeId, y: NodeId, how: u8) {
        let xc = self.condition_of(x);
        let yc = self.condition_of(y);
        let not = |e: Rc<Expr>| {
            Rc::new(Expr::Unary {
                kind: UnaryKind::Not,
                operand: e,
            })
        };
        let cond = match how {
            0 => Expr::Binary {
                kind: BinaryKind::Or,
                lhs: xc,
                rhs: yc,
            },
            1 => Expr::Binary {
                kind: BinaryKind::And,
                lhs: xc,
                rhs: yc,
            },
            2 => Expr::Binary {
                kind: BinaryKind::Or,
                lhs: not(xc),
                rhs: yc,
            },
            _ => Expr::Binary {
                kind: BinaryKind::And,
                lhs: not(xc),
                rhs: yc,
            },
        };

        let (offset, length, code) = self
            .node(x)
            .map(|n| (n.offset, n.length, n.code.clone()))
            .unwrap_or_default();
        let outgoing = self.node(y).map(|n| n.outgoing.clone()).unwrap_or_default();

        let new = self.alloc(Node {
            offset,
            length,
            conditional: true,
            code,
            condition: Some(Rc::new(cond)),
            outgoing,
            ..Node::default()
        });
        if self.root == x {
            self.root = new;
        }
        self.remove_node(x);
        self.remove_node(y);
        self.redirect(x, new);
        self.redirect(y, new);
    }

    /// A loop header that is not a for-loop reads as a `while` condition,
    /// not as an `if`.
    fn preprocess_while_loops(&mut self) {
        for id in self.live_ids_by_offset() {
            let loops: Vec<Edge> = self
                .node(id)
                .map(|n| n.outgoing.iter().copied().filter(|e| e.kind == EdgeKind::Loop).collect())
                .unwrap_or_default();
            for e in loops {
                let is_for = self.node(e.to).map(|n| n.for_loop).unwrap_or(false);
                if !is_for {
                    if let Some(n) = self.node_mut(e.to) {
                        n.conditional = false;
                    }
                }
            }
        }
    }

    /// Fold the structured branches of `head` into it: `x` is the taken
    /// branch, `y` the optional else branch. An `EXC_MATCH` condition renders
    /// an `except` clause instead of `if`.
    fn merge_branches(&mut self, head: NodeId, x: NodeId, y: Option<NodeId>) {
        let xcode = pass_fill(&self.node(x).map(|n| n.code.clone()).unwrap_or_default());
        let head_code = self.node(head).map(|n| n.code.clone()).unwrap_or_default();
        let cond = self.condition_of(head);

        let exc_rhs = match &*cond {
            Expr::Compare { op: "EXC_MATCH", rhs, .. } => Some(rhs.clone()),
            _ => None,
        };

        let mut code = if let Some(rhs) = &exc_rhs {
            format!("{head_code}except {rhs}{}", indent_except_text(&xcode))
        } else {
            format!("{head_code}if {cond}:\n{}", indent_text(&xcode, 1))
        };
        if let Some(y) = y {
            let ycode = self.node(y).map(|n| n.code.clone()).unwrap_or_default();
            let y_conditional = self.node(y).map(|n| n.conditional).unwrap_or(false);
            if y_conditional {
                code.push_str(&ycode);
            } else if !ycode.is_empty() {
                code.push_str(&format!("else:\n{}", indent_text(&ycode, 1)));
            }
        }

        let outgoing = self.node(x).map(|n| n.outgoing.clone()).unwrap_or_default();
        if let Some(n) = self.node_mut(head) {
            n.code = code;
            n.conditional = false;
            n.condition = None;
            n.loop_head = false;
            n.for_loop = false;
            n.except_head = false;
            n.finally_head = false;
            n.outgoing = outgoing;
        }
        self.remove_node(x);
        if let Some(y) = y {
            self.remove_node(y);
        }
        self.redirect(x, head);
        if let Some(y) = y {
            self.redirect(y, head);
        }
    }

    fn structure_conditional(&mut self, id: NodeId) -> bool {
        let (Some(te), Some(fe)) = self.true_false(id) else {
            return false;
        };
        let (tn, fn_) = (te.to, fe.to);
        if tn == fn_ {
            return false;
        }

        if let Some(t_out) = self.out_single(tn) {
            if t_out.to == fn_ && t_out.kind != EdgeKind::AfterException {
                self.merge_branches(id, tn, None);
                return true;
            }
        }
        if let Some(f_out) = self.out_single(fn_) {
            if f_out.to == tn {
                self.negate_condition(id);
                self.merge_branches(id, fn_, None);
                return true;
            }
        }
        if let (Some(t_out), Some(f_out)) = (self.out_single(tn), self.out_single(fn_)) {
            if t_out.to == f_out.to
                && t_out.kind != EdgeKind::AfterException
                && f_out.kind != EdgeKind::AfterException
            {
                let t_off = self.node(tn).map(|n| n.offset).unwrap_or(0);
                let f_off = self.node(fn_).map(|n| n.offset).unwrap_or(0);
                if t_off < f_off {
                    self.merge_branches(id, tn, Some(fn_));
                } else {
                    self.negate_condition(id);
                    self.merge_branches(id, fn_, Some(tn));
                }
                return true;
            }
        }
        false
    }

    fn structure_loop(&mut self, id: NodeId) -> bool {
        let (Some(loop_e), Some(al_e)) = (
            self.find_out(id, EdgeKind::Loop),
            self.find_out(id, EdgeKind::AfterLoop),
        ) else {
            return false;
        };
        let header = loop_e.to;

        if let (Some(for_e), Some(af_e)) = (
            self.find_out(header, EdgeKind::For),
            self.find_out(header, EdgeKind::AfterFor),
        ) {
            // For loop: the body starts with the `for x in it:` header the
            // iterator store produced; a non-empty after-for block is the
            // loop's else clause.
            let body = for_e.to;
            let code = self.node(body).map(|n| n.code.clone()).unwrap_or_default();
            if let Some(n) = self.node_mut(body) {
                n.code = indent_for_text(&code);
            }
            let af_code = self.node(af_e.to).map(|n| n.code.clone()).unwrap_or_default();
            if !af_code.is_empty() {
                if let Some(n) = self.node_mut(af_e.to) {
                    n.code = format!("else:\n{}", indent_text(&af_code, 1));
                }
            }
            self.remove_edge(header, af_e.to);
            self.remove_edge(id, al_e.to);
            if let Some(n) = self.node_mut(id) {
                n.loop_head = false;
            }
            return true;
        }

        let (Some(te), Some(fe)) = self.true_false(header) else {
            return false;
        };
        let (tn, fn_) = (te.to, fe.to);
        let body_ok = self.out_single(tn).map(|e| e.to == fn_).unwrap_or(false);
        let exit_ok = self.out_single(fn_).map(|e| e.to == al_e.to).unwrap_or(false);
        if !body_ok || !exit_ok {
            return false;
        }

        let cond = self.condition_of(header);
        if let Some(n) = self.node_mut(header) {
            n.code = format!("while {cond}:\n");
            n.condition = None;
        }
        let body_code = pass_fill(&self.node(tn).map(|n| n.code.clone()).unwrap_or_default());
        if let Some(n) = self.node_mut(tn) {
            n.code = indent_text(&body_code, 1);
        }
        let else_code = self.node(fn_).map(|n| n.code.clone()).unwrap_or_default();
        if !else_code.is_empty() {
            if let Some(n) = self.node_mut(fn_) {
                n.code = format!("else:\n{}", indent_text(&else_code, 1));
            }
        }
        self.remove_edge(header, fn_);
        self.remove_edge(id, al_e.to);
        if let Some(n) = self.node_mut(id) {
            n.loop_head = false;
        }
        true
    }

    fn structure_except(&mut self, id: NodeId) -> bool {
        let (Some(try_e), Some(exc_e)) = (
            self.find_out(id, EdgeKind::Try),
            self.find_out(id, EdgeKind::Except),
        ) else {
            return false;
        };
        let t_body = try_e.to;
        let en = exc_e.to;
        let mut changes = false;

        // Walk to the end of the handler chain.
        let mut tn = en;
        let mut fn_ = en;
        loop {
            match self.true_false(fn_) {
                (Some(te), Some(fe)) => {
                    tn = te.to;
                    fn_ = fe.to;
                }
                _ => break,
            }
        }

        if tn != fn_ {
            // A dangling empty re-raise block after the last matched
            // handler: rewire its single predecessor straight to the join.
            let fn_simple = self.out_single(fn_).is_some()
                && self.node(fn_).map(|n| n.incoming.len() == 1 && n.code.is_empty()).unwrap_or(false);
            if let (Some(t_out), true) = (self.out_single(tn), fn_simple) {
                let pred = self.node(fn_).and_then(|n| n.incoming.first().map(|e| e.from));
                if let Some(pred) = pred {
                    self.remove_edge(pred, fn_);
                    self.add_edge(pred, t_out.to, EdgeKind::False);
                    changes = true;
                }
            }
        } else {
            let code = self.node(tn).map(|n| n.code.clone()).unwrap_or_default();
            if !code.starts_with("except") {
                if let Some(n) = self.node_mut(tn) {
                    n.code = format!("except:\n{}", indent_text(&pass_fill(&code), 1));
                }
                changes = true;
            }
        }

        let t_out = self.out_single(t_body);
        let t_is_ok = t_out
            .map(|e| {
                self.node(e.to)
                    .map(|n| n.incoming.iter().any(|i| i.kind == EdgeKind::AfterException))
                    .unwrap_or(false)
            })
            .unwrap_or(false);

        let elsen = match (self.out_single(tn), t_out) {
            (Some(tn_out), Some(t_out)) if tn_out.to == t_out.to => None,
            (_, Some(t_out)) => Some(t_out.to),
            _ => None,
        };
        let else_is_ok = match elsen {
            None => true,
            Some(el) => match (self.out_single(el), self.out_single(tn)) {
                (Some(a), Some(b)) => a.to == b.to,
                _ => false,
            },
        };

        if t_is_ok && else_is_ok {
            // An enclosing SETUP_FINALLY edge into this try/except means
            // the finally wrap happens after the except wrap.
            let asf_in: Vec<Edge> = self
                .node(id)
                .map(|n| {
                    n.incoming
                        .iter()
                        .copied()
                        .filter(|e| e.kind == EdgeKind::FinallyBody)
                        .collect()
                })
                .unwrap_or_default();
            for e in asf_in {
                self.set_edge_kind(e.from, e.to, EdgeKind::FinallyBody2);
            }

            match elsen {
                Some(el) => {
                    let en_to_else_join = match (self.out_single(en), self.out_single(el)) {
                        (Some(a), Some(b)) => a.to == b.to,
                        _ => false,
                    };
                    if en_to_else_join {
                        let t_code = self.node(t_body).map(|n| n.code.clone()).unwrap_or_default();
                        if let Some(n) = self.node_mut(t_body) {
                            n.code = format!("try:\n{}", indent_text(&pass_fill(&t_code), 1));
                        }
                        let el_code = self.node(el).map(|n| n.code.clone()).unwrap_or_default();
                        if let Some(n) = self.node_mut(el) {
                            n.code = format!("else:\n{}", indent_text(&el_code, 1));
                        }
                        let en_out = self.out_single(en).map(|e| e.to);
                        self.remove_edge(id, en);
                        if let Some(to) = en_out {
                            self.remove_edge(en, to);
                        }
                        self.remove_edge(t_body, el);
                        let dummy = self
                            .node(el)
                            .and_then(|n| n.incoming.first().map(|e| e.from));
                        if let Some(d) = dummy {
                            self.remove_edge(d, el);
                            let removable = d != en
                                && d != t_body
                                && self.node(d).map(|n| n.code.is_empty()).unwrap_or(false);
                            if removable {
                                self.remove_node(d);
                                self.rebuild_incoming();
                            }
                        }
                        self.add_edge(t_body, en, EdgeKind::Fallthrough);
                        self.add_edge(en, el, EdgeKind::Fallthrough);
                        if let Some(n) = self.node_mut(id) {
                            n.except_head = false;
                        }
                        changes = true;
                    }
                }
                None => {
                    let joined = match (self.out_single(en), t_out) {
                        (Some(a), Some(b)) => a.to == b.to,
                        _ => false,
                    };
                    if joined {
                        let latch = t_out.map(|e| e.to).unwrap_or(en);
                        let t_code = self.node(t_body).map(|n| n.code.clone()).unwrap_or_default();
                        if let Some(n) = self.node_mut(t_body) {
                            n.code = format!("try:\n{}", indent_text(&pass_fill(&t_code), 1));
                        }
                        self.remove_edge(id, en);
                        self.remove_edge(t_body, latch);
                        let ae = self
                            .node(latch)
                            .and_then(|n| n.incoming.iter().copied().find(|e| e.kind == EdgeKind::AfterException));
                        if let Some(ae) = ae {
                            self.remove_edge(ae.from, latch);
                            let removable = ae.from != en
                                && ae.from != t_body
                                && self.node(ae.from).map(|n| n.code.is_empty()).unwrap_or(false);
                            if removable {
                                self.remove_node(ae.from);
                                self.rebuild_incoming();
                            }
                        }
                        self.add_edge(t_body, en, EdgeKind::Fallthrough);
                        if let Some(n) = self.node_mut(id) {
                            n.except_head = false;
                        }
                        changes = true;
                    }
                }
            }
        }

        changes
    }

    fn structure_finally(&mut self, id: NodeId) -> bool {
        let Some(fin_e) = self.find_out(id, EdgeKind::Finally) else {
            return false;
        };
        let fin = fin_e.to;

        let (body_e, wrap_try) = match self.find_out(id, EdgeKind::FinallyBody) {
            Some(e) => (Some(e), true),
            None => (self.find_out(id, EdgeKind::FinallyBody2), false),
        };
        let Some(body_e) = body_e else {
            return false;
        };
        let body = body_e.to;

        let body_to_fin = self.out_single(body).map(|e| e.to == fin).unwrap_or(false);
        let fin_ae = self
            .out_single(fin)
            .filter(|e| e.kind == EdgeKind::AfterException);
        let (true, Some(ae)) = (body_to_fin, fin_ae) else {
            return false;
        };

        if wrap_try {
            let body_code = self.node(body).map(|n| n.code.clone()).unwrap_or_default();
            if let Some(n) = self.node_mut(body) {
                n.code = format!("try:\n{}", indent_text(&pass_fill(&body_code), 1));
            }
        }
        let fin_code = self.node(fin).map(|n| n.code.clone()).unwrap_or_default();
        if let Some(n) = self.node_mut(fin) {
            n.code = format!("finally:\n{}", indent_text(&pass_fill(&fin_code), 1));
        }
        self.remove_edge(id, fin);
        self.set_edge_kind(fin, ae.to, EdgeKind::Fallthrough);
        if let Some(n) = self.node_mut(id) {
            n.finally_head = false;
        }
        true
    }

    /// Concatenate straight-line chains: a node with one ordinary out-edge
    /// to a single-predecessor node absorbs it.
    fn simplify_consecutive(&mut self, budget: &mut Budget) -> bool {
        let mut changes = false;
        for id in self.live_ids_by_offset() {
            if !self.is_live(id) {
                continue;
            }
            let Some(e) = self.out_single(id) else { continue };
            if e.kind == EdgeKind::AfterException || e.to == id {
                continue;
            }
            let succ = e.to;
            if !self.is_live(succ) || self.node(succ).map(|n| n.incoming.len()).unwrap_or(0) != 1 {
                continue;
            }
            if !budget.spend() {
                return changes;
            }
            let Some(succ_node) = self.nodes.get_mut(succ).and_then(Option::take) else {
                continue;
            };
            if let Some(n) = self.node_mut(id) {
                n.code.push_str(&succ_node.code);
                n.outgoing = succ_node.outgoing;
                n.conditional = succ_node.conditional;
                n.condition = succ_node.condition;
                n.loop_head = succ_node.loop_head;
                n.for_loop = succ_node.for_loop;
                n.except_head = succ_node.except_head;
                n.finally_head = succ_node.finally_head;
            }
            self.redirect(succ, id);
            changes = true;
        }
        changes
    }

    /// Run the compound structuring passes to a fixed point.
    fn structure(&mut self, budget: &mut Budget, trace: bool) {
        loop {
            let mut changes = false;
            for id in self.postorder() {
                let Some(n) = self.node(id) else { continue };
                let (c, l, e, f) = (n.conditional, n.loop_head, n.except_head, n.finally_head);
                let did = if c {
                    self.structure_conditional(id)
                } else if l {
                    self.structure_loop(id)
                } else if e {
                    self.structure_except(id)
                } else if f {
                    self.structure_finally(id)
                } else {
                    false
                };
                if did {
                    changes = true;
                    if !budget.spend() {
                        return;
                    }
                }
            }
            changes |= self.simplify_consecutive(budget);
            if trace {
                debug!("after structuring pass:\n{}", self.dump());
            }
            if budget.exhausted || !changes {
                break;
            }
        }
    }
}

macro_rules! pop {
    ($stack:expr) => {
        match $stack.pop() {
            Some(v) => v,
            None => {
                warn!("value stack underflow");
                return Ok(String::new());
            }
        }
    };
}

macro_rules! want_arg {
    ($ins:expr) => {
        match $ins.arg {
            Some(a) => a,
            None => {
                warn!("missing operand at offset {}", $ins.offset);
                return Ok(String::new());
            }
        }
    };
}

/// True when the stack holds exactly `n` real values. Exception slots from an
/// enclosing SETUP_EXCEPT and live loop iterators do not count.
fn check_stack(stack: &[Rc<Expr>], n: usize) -> bool {
    stack
        .iter()
        .filter(|e| !matches!(&***e, Expr::ExceptionSlot(_) | Expr::Iter(_)))
        .count()
        == n
}

fn func_params(code: &CodeObject, defaults: &[Rc<Expr>]) -> String {
    let argc = code.argcount as usize;
    let ndef = defaults.len();
    let mut parts = Vec::with_capacity(argc + 2);
    for index in 0..argc {
        let name = code
            .varnames
            .get(index)
            .cloned()
            .unwrap_or_else(|| format!("arg{index}"));
        if argc - index <= ndef {
            parts.push(format!("{name}={}", defaults[argc - index - 1]));
        } else {
            parts.push(name);
        }
    }
    let mut extra = argc;
    if code.flags & CO_VARARGS != 0 {
        let name = code
            .varnames
            .get(extra)
            .cloned()
            .unwrap_or_else(|| "args".to_string());
        parts.push(format!("*{name}"));
        extra += 1;
    }
    if code.flags & CO_VARKEYWORDS != 0 {
        let name = code
            .varnames
            .get(extra)
            .cloned()
            .unwrap_or_else(|| "kwargs".to_string());
        parts.push(format!("**{name}"));
    }
    parts.join(", ")
}

/// Symbolic interpreter for one code object. Replays instructions against a
/// stack of expression handles and emits statement text per basic block.
struct Decompiler<'a> {
    co: &'a CodeObject,
    seq: InstrSeq,
    opts: DecompileOptions,
    depth: usize,
    postponed: Vec<(String, Rc<Expr>)>,
}

impl<'a> Decompiler<'a> {
    fn new(
        co: &'a CodeObject,
        opts: DecompileOptions,
        depth: usize,
    ) -> Result<Decompiler<'a>, DepycError> {
        if depth >= opts.max_depth {
            return Err(DepycError::NestingTooDeep {
                limit: opts.max_depth,
            });
        }
        let mut seq = InstrSeq::decode(&co.code);
        normalize_jumps(&mut seq);
        Ok(Decompiler {
            co,
            seq,
            opts,
            depth,
            postponed: Vec::new(),
        })
    }

    /// Decompile the whole unit starting at `start`. Returns unindented
    /// statement text; callers indent for their nesting level.
    fn decompile_unit(&mut self, start: usize) -> Result<String, DepycError> {
        let refs = collect_block_refs(&self.seq, start);
        let mut cfg = Cfg::from_block_refs(&refs);
        self.dfa_decompile(&mut cfg)?;
        if self.opts.trace_passes {
            debug!("initial CFG for {}:\n{}", self.co.name, cfg.dump());
        }

        let limit = self
            .opts
            .rewrite_budget
            .unwrap_or(64 + 16 * cfg.live_count());
        let mut budget = Budget::new(limit);
        cfg.merge_short_circuits(&mut budget);
        cfg.preprocess_while_loops();
        cfg.structure(&mut budget, self.opts.trace_passes);

        if cfg.live_count() == 1 {
            let id = cfg.live_ids_by_offset()[0];
            return Ok(cfg.node(id).map(|n| n.code.clone()).unwrap_or_default());
        }

        warn!(
            "could not fully structure {}; emitting per-block output",
            self.co.name
        );
        let mut out = String::new();
        for id in cfg.live_ids_by_offset() {
            let Some(n) = cfg.node(id) else { continue };
            if n.code.is_empty() {
                continue;
            }
            out.push_str(&format!(
                "#[unresolved block @ 0x{:08X}]\n{}\n",
                n.offset, n.code
            ));
        }
        Ok(out)
    }

    /// Flow the symbolic stack across the CFG. Successors pushed later are
    /// visited first, so a handler edge sees the stack as it was at the
    /// setup instruction, not after the protected body ran.
    fn dfa_decompile(&mut self, cfg: &mut Cfg) -> Result<(), DepycError> {
        let mut work: Vec<(NodeId, Vec<Rc<Expr>>)> = vec![(cfg.root, Vec::new())];
        let mut visited: HashSet<NodeId> = HashSet::new();
        while let Some((id, mut stack)) = work.pop() {
            if !visited.insert(id) {
                continue;
            }
            let Some((offset, length)) = cfg.node(id).map(|n| (n.offset, n.length)) else {
                continue;
            };
            let (code, condition) = self.run_block(offset, length, &mut stack)?;
            if let Some(n) = cfg.node_mut(id) {
                n.code = code;
                n.condition = condition;
            }
            let succs: Vec<NodeId> = cfg
                .node(id)
                .map(|n| n.outgoing.iter().map(|e| e.to).collect())
                .unwrap_or_default();
            for s in succs {
                if !visited.contains(&s) {
                    work.push((s, stack.clone()));
                }
            }
        }
        Ok(())
    }

    /// Execute the instructions of one block. A conditional jump terminates
    /// the block and reports the value under test; the value itself stays on
    /// the stack for the branch successors.
    fn run_block(
        &mut self,
        offset: usize,
        length: usize,
        stack: &mut Vec<Rc<Expr>>,
    ) -> Result<(String, Option<Rc<Expr>>), DepycError> {
        let instrs: Vec<Instr> = self.seq.range(offset, length).to_vec();
        let mut out = String::new();
        for (i, ins) in instrs.iter().enumerate() {
            let Some(op) = ins.op else {
                warn!("skipping unknown opcode byte at offset {}", ins.offset);
                continue;
            };
            if matches!(op, Opcode::JumpIfFalse | Opcode::JumpIfTrue) {
                return Ok((out, stack.last().cloned()));
            }
            let prev = if i > 0 { Some(&instrs[i - 1]) } else { None };
            let next = instrs.get(i + 1);
            out.push_str(&self.exec(op, ins, prev, next, stack)?);
        }
        Ok((out, None))
    }

    fn exec(
        &mut self,
        op: Opcode,
        ins: &Instr,
        prev: Option<&Instr>,
        next: Option<&Instr>,
        stack: &mut Vec<Rc<Expr>>,
    ) -> Result<String, DepycError> {
        match op {
            Opcode::Nop
            | Opcode::PopBlock
            | Opcode::EndFinally
            | Opcode::SetupLoop
            | Opcode::SetupFinally
            | Opcode::JumpForward
            | Opcode::JumpAbsolute
            | Opcode::JumpIfFalse
            | Opcode::JumpIfTrue => Ok(String::new()),

            Opcode::StopCode | Opcode::ListAppend | Opcode::WithCleanup | Opcode::ExtendedArg => {
                warn!(
                    "unsupported opcode {} at offset {}",
                    op.mnemonic(),
                    ins.offset
                );
                Ok(String::new())
            }

            Opcode::PopTop => {
                let v = pop!(stack);
                // A handle still shared by the stack of another block, a
                // block condition, or a DUP is not the last use of the
                // value and must not become a statement.
                if Rc::strong_count(&v) > 1 {
                    return Ok(String::new());
                }
                Ok(match &*v {
                    Expr::Import {
                        module,
                        level,
                        froms,
                    } => {
                        let froms = froms.borrow();
                        if froms.is_empty() {
                            format!("import {module}\n")
                        } else {
                            let dots = if *level > 0 {
                                ".".repeat(*level as usize)
                            } else {
                                String::new()
                            };
                            let items: Vec<String> = froms
                                .iter()
                                .map(|(name, alias)| {
                                    if name == alias {
                                        name.clone()
                                    } else {
                                        format!("{name} as {alias}")
                                    }
                                })
                                .collect();
                            format!("from {dots}{module} import {}\n", items.join(", "))
                        }
                    }
                    Expr::ExceptionSlot(_) | Expr::Compare { .. } | Expr::Yielded(_) => {
                        String::new()
                    }
                    other => format!("{other}\n"),
                })
            }

            Opcode::RotTwo => {
                let a = pop!(stack);
                let b = pop!(stack);
                stack.push(a);
                stack.push(b);
                Ok(String::new())
            }
            Opcode::RotThree => {
                let a = pop!(stack);
                let b = pop!(stack);
                let c = pop!(stack);
                stack.push(a);
                stack.push(c);
                stack.push(b);
                Ok(String::new())
            }
            Opcode::RotFour => {
                let a = pop!(stack);
                let b = pop!(stack);
                let c = pop!(stack);
                let d = pop!(stack);
                stack.push(a);
                stack.push(d);
                stack.push(c);
                stack.push(b);
                Ok(String::new())
            }
            Opcode::DupTop => {
                let v = pop!(stack);
                stack.push(v.clone());
                stack.push(v);
                Ok(String::new())
            }
            Opcode::DupTopx => {
                let n = want_arg!(ins) as usize;
                if stack.len() < n {
                    warn!("value stack underflow");
                    return Ok(String::new());
                }
                let tail: Vec<Rc<Expr>> = stack[stack.len() - n..].to_vec();
                stack.extend(tail);
                Ok(String::new())
            }

            Opcode::UnaryPositive
            | Opcode::UnaryNegative
            | Opcode::UnaryNot
            | Opcode::UnaryConvert
            | Opcode::UnaryInvert => {
                let kind = match op {
                    Opcode::UnaryPositive => UnaryKind::Pos,
                    Opcode::UnaryNegative => UnaryKind::Neg,
                    Opcode::UnaryNot => UnaryKind::Not,
                    Opcode::UnaryConvert => UnaryKind::Convert,
                    _ => UnaryKind::Invert,
                };
                let operand = pop!(stack);
                stack.push(Rc::new(Expr::Unary { kind, operand }));
                Ok(String::new())
            }

            Opcode::BinaryPower
            | Opcode::BinaryMultiply
            | Opcode::BinaryDivide
            | Opcode::BinaryModulo
            | Opcode::BinaryAdd
            | Opcode::BinarySubtract
            | Opcode::BinaryFloorDivide
            | Opcode::BinaryTrueDivide
            | Opcode::BinaryLshift
            | Opcode::BinaryRshift
            | Opcode::BinaryAnd
            | Opcode::BinaryXor
            | Opcode::BinaryOr => {
                let kind = match op {
                    Opcode::BinaryPower => BinaryKind::Pow,
                    Opcode::BinaryMultiply => BinaryKind::Mul,
                    Opcode::BinaryModulo => BinaryKind::Mod,
                    Opcode::BinaryAdd => BinaryKind::Add,
                    Opcode::BinarySubtract => BinaryKind::Sub,
                    Opcode::BinaryFloorDivide => BinaryKind::FloorDiv,
                    Opcode::BinaryLshift => BinaryKind::Shl,
                    Opcode::BinaryRshift => BinaryKind::Shr,
                    Opcode::BinaryAnd => BinaryKind::BitAnd,
                    Opcode::BinaryXor => BinaryKind::BitXor,
                    Opcode::BinaryOr => BinaryKind::BitOr,
                    _ => BinaryKind::Div,
                };
                let rhs = pop!(stack);
                let lhs = pop!(stack);
                let note = if op == Opcode::BinaryTrueDivide {
                    "# uses true division\n"
                } else {
                    ""
                };
                stack.push(Rc::new(Expr::Binary { kind, lhs, rhs }));
                Ok(note.to_string())
            }

            Opcode::BinarySubscr => {
                let index = pop!(stack);
                let value = pop!(stack);
                stack.push(Rc::new(Expr::Subscript { value, index }));
                Ok(String::new())
            }

            Opcode::InplaceFloorDivide
            | Opcode::InplaceTrueDivide
            | Opcode::InplaceAdd
            | Opcode::InplaceSubtract
            | Opcode::InplaceMultiply
            | Opcode::InplaceDivide
            | Opcode::InplaceModulo
            | Opcode::InplacePower
            | Opcode::InplaceLshift
            | Opcode::InplaceRshift
            | Opcode::InplaceAnd
            | Opcode::InplaceXor
            | Opcode::InplaceOr => {
                let kind = match op {
                    Opcode::InplaceFloorDivide => BinaryKind::FloorDiv,
                    Opcode::InplaceAdd => BinaryKind::Add,
                    Opcode::InplaceSubtract => BinaryKind::Sub,
                    Opcode::InplaceMultiply => BinaryKind::Mul,
                    Opcode::InplaceModulo => BinaryKind::Mod,
                    Opcode::InplacePower => BinaryKind::Pow,
                    Opcode::InplaceLshift => BinaryKind::Shl,
                    Opcode::InplaceRshift => BinaryKind::Shr,
                    Opcode::InplaceAnd => BinaryKind::BitAnd,
                    Opcode::InplaceXor => BinaryKind::BitXor,
                    Opcode::InplaceOr => BinaryKind::BitOr,
                    _ => BinaryKind::Div,
                };
                let rhs = pop!(stack);
                let lhs = pop!(stack);
                let note = if op == Opcode::InplaceTrueDivide {
                    "# uses true division\n"
                } else {
                    ""
                };
                stack.push(Rc::new(Expr::Inplace { kind, lhs, rhs }));
                Ok(note.to_string())
            }

            Opcode::Slice | Opcode::Slice1 | Opcode::Slice2 | Opcode::Slice3 => {
                let bits = op.byte() - Opcode::Slice.byte();
                let upper = if bits & 2 != 0 { Some(pop!(stack)) } else { None };
                let lower = if bits & 1 != 0 { Some(pop!(stack)) } else { None };
                let value = pop!(stack);
                stack.push(Rc::new(Expr::Slice {
                    value,
                    lower,
                    upper,
                }));
                Ok(String::new())
            }

            Opcode::StoreSlice
            | Opcode::StoreSlice1
            | Opcode::StoreSlice2
            | Opcode::StoreSlice3 => {
                let bits = op.byte() - Opcode::StoreSlice.byte();
                let upper = if bits & 2 != 0 { Some(pop!(stack)) } else { None };
                let lower = if bits & 1 != 0 { Some(pop!(stack)) } else { None };
                let obj = pop!(stack);
                let value = pop!(stack);
                let lo = lower.map(|e| e.to_string()).unwrap_or_default();
                let up = upper.map(|e| e.to_string()).unwrap_or_default();
                let empty = check_stack(stack, 0);
                self.store(format!("{}[{lo}:{up}]", sub(13, &obj)), value, empty)
            }

            Opcode::DeleteSlice
            | Opcode::DeleteSlice1
            | Opcode::DeleteSlice2
            | Opcode::DeleteSlice3 => {
                let bits = op.byte() - Opcode::DeleteSlice.byte();
                let upper = if bits & 2 != 0 { Some(pop!(stack)) } else { None };
                let lower = if bits & 1 != 0 { Some(pop!(stack)) } else { None };
                let obj = pop!(stack);
                let lo = lower.map(|e| e.to_string()).unwrap_or_default();
                let up = upper.map(|e| e.to_string()).unwrap_or_default();
                Ok(format!("del {}[{lo}:{up}]\n", sub(13, &obj)))
            }

            Opcode::StoreMap => {
                let key = pop!(stack);
                let value = pop!(stack);
                if let Some(map) = stack.last() {
                    if let Expr::Map(pairs) = &**map {
                        pairs.borrow_mut().push((key, value));
                        return Ok(String::new());
                    }
                }
                warn!("STORE_MAP without a map under construction");
                Ok(String::new())
            }

            Opcode::StoreSubscr => {
                let index = pop!(stack);
                let obj = pop!(stack);
                if let Expr::Map(pairs) = &*obj {
                    // Dict literal built with DUP_TOP/ROT_TWO; a copy of the
                    // map handle is still on the stack.
                    let value = pop!(stack);
                    pairs.borrow_mut().push((index, value));
                    return Ok(String::new());
                }
                let value = pop!(stack);
                let empty = check_stack(stack, 0);
                self.store(format!("{}[{index}]", sub(13, &obj)), value, empty)
            }
            Opcode::DeleteSubscr => {
                let index = pop!(stack);
                let obj = pop!(stack);
                Ok(format!("del {}[{index}]\n", sub(13, &obj)))
            }

            Opcode::GetIter => {
                let v = pop!(stack);
                stack.push(Rc::new(Expr::Iter(v)));
                Ok(String::new())
            }
            Opcode::ForIter => {
                // The iterator stays on the stack for the next round; the
                // pushed handle is what the loop-variable store consumes.
                let Some(it) = stack.last().cloned() else {
                    warn!("value stack underflow");
                    return Ok(String::new());
                };
                stack.push(Rc::new(Expr::Iter(it)));
                Ok(String::new())
            }

            Opcode::PrintExpr => {
                let v = pop!(stack);
                Ok(format!("{v}\n"))
            }
            Opcode::PrintItem => {
                let v = pop!(stack);
                if next.map(|n| n.is(Opcode::PrintNewline)).unwrap_or(false) {
                    Ok(format!("print {v}\n"))
                } else {
                    Ok(format!("print {v},\n"))
                }
            }
            Opcode::PrintNewline => {
                if prev.map(|p| p.is(Opcode::PrintItem)).unwrap_or(false) {
                    Ok(String::new())
                } else {
                    Ok("print\n".to_string())
                }
            }
            Opcode::PrintItemTo => {
                let stream = pop!(stack);
                let v = pop!(stack);
                if next.map(|n| n.is(Opcode::PrintNewlineTo)).unwrap_or(false) {
                    Ok(format!("print >>{stream}, {v}\n"))
                } else {
                    Ok(format!("print >>{stream}, {v},\n"))
                }
            }
            Opcode::PrintNewlineTo => {
                let stream = pop!(stack);
                if prev.map(|p| p.is(Opcode::PrintItemTo)).unwrap_or(false) {
                    Ok(String::new())
                } else {
                    Ok(format!("print >>{stream}\n"))
                }
            }

            Opcode::BreakLoop => Ok("break\n".to_string()),
            Opcode::ContinueLoop => Ok("continue\n".to_string()),

            Opcode::LoadLocals => {
                stack.push(Rc::new(Expr::Locals));
                Ok(String::new())
            }
            Opcode::ReturnValue => {
                let v = pop!(stack);
                if self.co.name == "<module>" {
                    return Ok(String::new());
                }
                Ok(match &*v {
                    Expr::Locals => String::new(),
                    Expr::Literal(Const::None) => String::new(),
                    other => format!("return {other}\n"),
                })
            }
            Opcode::ImportStar => {
                let v = pop!(stack);
                match &*v {
                    Expr::Import { module, level, .. } => {
                        let dots = if *level > 0 {
                            ".".repeat(*level as usize)
                        } else {
                            String::new()
                        };
                        Ok(format!("from {dots}{module} import *\n"))
                    }
                    other => Ok(format!("from {other} import *\n")),
                }
            }
            Opcode::ExecStmt => {
                let locals = pop!(stack);
                let globals = pop!(stack);
                let code = pop!(stack);
                if matches!(&*globals, Expr::Literal(Const::None)) {
                    Ok(format!("exec {code}\n"))
                } else if locals.to_string() == globals.to_string() {
                    Ok(format!("exec {code} in {globals}\n"))
                } else {
                    Ok(format!("exec {code} in {globals}, {locals}\n"))
                }
            }
            Opcode::YieldValue => {
                let v = pop!(stack);
                let out = format!("yield {v}\n");
                stack.push(Rc::new(Expr::Yielded(v)));
                Ok(out)
            }
            Opcode::BuildClass => {
                let _methods = pop!(stack);
                let bases_e = pop!(stack);
                let name_e = pop!(stack);
                let bases = match &*bases_e {
                    Expr::Tuple(items) => items.iter().map(|e| e.to_string()).collect(),
                    Expr::Literal(Const::Tuple(items)) => {
                        items.iter().map(|c| c.to_string()).collect()
                    }
                    other => vec![other.to_string()],
                };
                let name = match &*name_e {
                    Expr::Literal(Const::Str(s)) => s.clone(),
                    other => other.to_string(),
                };
                stack.push(Rc::new(Expr::Class { name, bases }));
                Ok(String::new())
            }

            Opcode::StoreName | Opcode::StoreFast | Opcode::StoreGlobal | Opcode::StoreDeref => {
                let arg = want_arg!(ins);
                let name = match op {
                    Opcode::StoreFast => self.co.varname_at(arg)?,
                    Opcode::StoreDeref => self.co.cell_or_free_at(arg)?,
                    _ => self.co.name_at(arg)?,
                }
                .to_string();
                let v = pop!(stack);
                let empty = check_stack(stack, 0);
                self.store(name, v, empty)
            }
            Opcode::StoreAttr => {
                let name = self.co.name_at(want_arg!(ins))?.to_string();
                let obj = pop!(stack);
                let v = pop!(stack);
                let empty = check_stack(stack, 0);
                self.store(format!("{}.{name}", sub(13, &obj)), v, empty)
            }

            Opcode::DeleteName | Opcode::DeleteFast | Opcode::DeleteGlobal => {
                let arg = want_arg!(ins);
                let name = match op {
                    Opcode::DeleteFast => self.co.varname_at(arg)?,
                    _ => self.co.name_at(arg)?,
                };
                Ok(format!("del {name}\n"))
            }
            Opcode::DeleteAttr => {
                let name = self.co.name_at(want_arg!(ins))?.to_string();
                let obj = pop!(stack);
                Ok(format!("del {}.{name}\n", sub(13, &obj)))
            }

            Opcode::UnpackSequence => {
                let n = want_arg!(ins) as usize;
                let seq = pop!(stack);
                for index in (0..n).rev() {
                    stack.push(Rc::new(Expr::Unpacked {
                        seq: seq.clone(),
                        index,
                    }));
                }
                Ok(String::new())
            }

            Opcode::LoadConst => {
                match self.co.const_at(want_arg!(ins))? {
                    Const::Code(nested) => stack.push(Rc::new(Expr::Code(nested.clone()))),
                    other => stack.push(Rc::new(Expr::Literal(other.clone()))),
                }
                Ok(String::new())
            }
            Opcode::LoadName | Opcode::LoadGlobal => {
                let name = self.co.name_at(want_arg!(ins))?.to_string();
                stack.push(Rc::new(Expr::Name(name)));
                Ok(String::new())
            }
            Opcode::LoadFast => {
                let name = self.co.varname_at(want_arg!(ins))?.to_string();
                stack.push(Rc::new(Expr::Name(name)));
                Ok(String::new())
            }
            Opcode::LoadDeref | Opcode::LoadClosure => {
                let name = self.co.cell_or_free_at(want_arg!(ins))?.to_string();
                stack.push(Rc::new(Expr::Name(name)));
                Ok(String::new())
            }

            Opcode::BuildTuple | Opcode::BuildList => {
                let n = want_arg!(ins) as usize;
                let mut items = Vec::with_capacity(n);
                for _ in 0..n {
                    items.insert(0, pop!(stack));
                }
                stack.push(Rc::new(if op == Opcode::BuildTuple {
                    Expr::Tuple(items)
                } else {
                    Expr::List(items)
                }));
                Ok(String::new())
            }
            Opcode::BuildMap => {
                stack.push(Rc::new(Expr::Map(RefCell::new(Vec::new()))));
                Ok(String::new())
            }

            Opcode::LoadAttr => {
                let name = self.co.name_at(want_arg!(ins))?.to_string();
                let v = pop!(stack);
                if matches!(&*v, Expr::Import { .. }) {
                    // `import a.b` loads the attribute chain after the
                    // import; the dotted module name already carries it.
                    stack.push(v);
                } else {
                    stack.push(Rc::new(Expr::Attribute { value: v, name }));
                }
                Ok(String::new())
            }
            Opcode::CompareOp => {
                let index = want_arg!(ins);
                let cmp = *CMP_OP
                    .get(index as usize)
                    .ok_or(DepycError::BadCompareOp { index })?;
                let rhs = pop!(stack);
                let lhs = pop!(stack);
                stack.push(Rc::new(Expr::Compare { op: cmp, lhs, rhs }));
                Ok(String::new())
            }
            Opcode::ImportName => {
                let module = self.co.name_at(want_arg!(ins))?.to_string();
                let _fromlist = pop!(stack);
                let level = match &*pop!(stack) {
                    Expr::Literal(Const::Int(i)) => *i,
                    _ => 0,
                };
                stack.push(Rc::new(Expr::Import {
                    module,
                    level,
                    froms: RefCell::new(Vec::new()),
                }));
                Ok(String::new())
            }
            Opcode::ImportFrom => {
                let name = self.co.name_at(want_arg!(ins))?.to_string();
                let Some(import) = stack.last().cloned() else {
                    warn!("value stack underflow");
                    return Ok(String::new());
                };
                stack.push(Rc::new(Expr::ImportFrom { import, name }));
                Ok(String::new())
            }

            Opcode::RaiseVarargs => {
                let n = want_arg!(ins) as usize;
                if n == 0 {
                    return Ok("raise\n".to_string());
                }
                let mut args = Vec::with_capacity(n);
                for _ in 0..n {
                    args.insert(0, pop!(stack).to_string());
                }
                Ok(format!("raise {}\n", args.join(", ")))
            }

            Opcode::CallFunction
            | Opcode::CallFunctionVar
            | Opcode::CallFunctionKw
            | Opcode::CallFunctionVarKw => {
                let a = want_arg!(ins);
                let npos = (a & 0xff) as usize;
                let nkw = ((a >> 8) & 0xff) as usize;
                let (has_var, has_kw) = match op {
                    Opcode::CallFunctionVar => (true, false),
                    Opcode::CallFunctionKw => (false, true),
                    Opcode::CallFunctionVarKw => (true, true),
                    _ => (false, false),
                };
                let kwargs = if has_kw { Some(pop!(stack)) } else { None };
                let star = if has_var { Some(pop!(stack)) } else { None };
                let mut args: Vec<String> = Vec::with_capacity(npos + nkw + 2);
                for _ in 0..nkw {
                    let value = pop!(stack);
                    let key = pop!(stack);
                    let key = match &*key {
                        Expr::Literal(Const::Str(s)) => s.clone(),
                        other => other.to_string(),
                    };
                    args.insert(0, format!("{key}={value}"));
                }
                for _ in 0..npos {
                    args.insert(0, pop!(stack).to_string());
                }
                if let Some(star) = star {
                    args.push(format!("*{star}"));
                }
                if let Some(kwargs) = kwargs {
                    args.push(format!("**{kwargs}"));
                }
                let callee = pop!(stack).to_string();
                stack.push(Rc::new(Expr::Call { callee, args }));
                Ok(String::new())
            }

            Opcode::MakeFunction | Opcode::MakeClosure => {
                let nd = want_arg!(ins) as usize;
                let code_e = pop!(stack);
                let Expr::Code(code) = &*code_e else {
                    warn!("MAKE_FUNCTION operand is not a code constant");
                    return Ok(String::new());
                };
                let code = code.clone();
                if op == Opcode::MakeClosure {
                    // The cells are either one BUILD_TUPLE or bare handles.
                    if stack.last().map(|e| matches!(&**e, Expr::Tuple(_))).unwrap_or(false) {
                        let _ = pop!(stack);
                    } else {
                        for _ in 0..code.freevars.len() {
                            let _ = pop!(stack);
                        }
                    }
                }
                let mut defaults = Vec::with_capacity(nd);
                for _ in 0..nd {
                    defaults.push(pop!(stack));
                }
                if code.name == "<lambda>" {
                    let params = func_params(&code, &defaults);
                    let body = self.lambda_body(&code);
                    stack.push(Rc::new(Expr::Lambda { params, body }));
                } else {
                    stack.push(Rc::new(Expr::Function(FuncExpr { code, defaults })));
                }
                Ok(String::new())
            }

            Opcode::BuildSlice => {
                let n = want_arg!(ins);
                let step = if n == 3 { Some(pop!(stack)) } else { None };
                let stop = pop!(stack);
                let start = pop!(stack);
                stack.push(Rc::new(Expr::BuiltSlice { start, stop, step }));
                Ok(String::new())
            }

            Opcode::SetupExcept => {
                // Traceback, value, type; the handler sees them on its stack.
                stack.push(Rc::new(Expr::ExceptionSlot(0)));
                stack.push(Rc::new(Expr::ExceptionSlot(1)));
                stack.push(Rc::new(Expr::ExceptionSlot(2)));
                Ok(String::new())
            }
        }
    }

    /// Emit an assignment of `value` to `lvalue`, or whatever statement the
    /// value's shape calls for. `empty` reports whether the stack had no real
    /// values left after the pop; a non-empty stack postpones the assignment
    /// so rotated multi-assignments come out as one tuple statement.
    fn store(
        &mut self,
        lvalue: String,
        value: Rc<Expr>,
        empty: bool,
    ) -> Result<String, DepycError> {
        match &*value {
            Expr::Function(func) => {
                let params = func_params(&func.code, &func.defaults);
                let body = self.decompile_nested(&func.code);
                Ok(format!("def {lvalue}({params}):\n{body}\n"))
            }
            Expr::Class { name, bases } => {
                let header = if bases.is_empty() {
                    format!("class {lvalue}:\n")
                } else {
                    format!("class {lvalue}({}):\n", bases.join(", "))
                };
                let body = match self.co.find_code_const(name) {
                    Some(co) => self.decompile_class_body(&co),
                    None => format!("{INDENT}pass\n"),
                };
                Ok(format!("{header}{body}\n"))
            }
            Expr::Import { module, .. } => {
                if module.split('.').next() == Some(lvalue.as_str()) {
                    Ok(format!("import {module}\n"))
                } else {
                    Ok(format!("import {module} as {lvalue}\n"))
                }
            }
            Expr::ImportFrom { import, name } => {
                if let Expr::Import { froms, .. } = &**import {
                    froms.borrow_mut().push((name.clone(), lvalue));
                }
                Ok(String::new())
            }
            Expr::Inplace { .. } => {
                let rendered = value.to_string();
                if rendered.starts_with(&format!("{lvalue} ")) {
                    Ok(format!("{rendered}\n"))
                } else {
                    // The in-place target does not match where the result
                    // lands; degrade to a plain assignment.
                    Ok(format!("{lvalue} = {rendered}\n"))
                }
            }
            Expr::Iter(it) => Ok(format!("for {lvalue} in {it}:\n")),
            Expr::ExceptionSlot(_) => Ok(format!("# as {lvalue}\n")),
            _ => {
                if !empty {
                    self.postponed.push((lvalue, value));
                    Ok(String::new())
                } else if !self.postponed.is_empty() {
                    self.postponed.push((lvalue, value));
                    let drained: Vec<(String, Rc<Expr>)> = self.postponed.drain(..).collect();
                    let lvs: Vec<&str> = drained.iter().map(|(l, _)| l.as_str()).collect();
                    let rvs: Vec<String> = drained.iter().map(|(_, v)| v.to_string()).collect();
                    Ok(format!("({}) = ({})\n", lvs.join(", "), rvs.join(", ")))
                } else {
                    Ok(format!("{lvalue} = {value}\n"))
                }
            }
        }
    }

    /// Body of a nested `def`, indented one level, with failures downgraded
    /// to a comment so one bad function does not sink the whole unit.
    fn decompile_nested(&self, co: &Rc<CodeObject>) -> String {
        match Decompiler::new(co, self.opts.clone(), self.depth + 1)
            .and_then(|mut d| d.decompile_unit(0))
        {
            Ok(body) => indent_text(&pass_fill(&body), 1),
            Err(e) => format!("{INDENT}# decompilation error: {e}\n"),
        }
    }

    /// Class bodies start past the `__module__ = __name__` prologue.
    fn decompile_class_body(&self, co: &Rc<CodeObject>) -> String {
        match Decompiler::new(co, self.opts.clone(), self.depth + 1)
            .and_then(|mut d| d.decompile_unit(6))
        {
            Ok(body) => indent_text(&pass_fill(&body), 1),
            Err(e) => format!("{INDENT}# decompilation error: {e}\n"),
        }
    }

    fn lambda_body(&self, co: &Rc<CodeObject>) -> String {
        match Decompiler::new(co, self.opts.clone(), self.depth + 1)
            .and_then(|mut d| d.decompile_unit(0))
        {
            Ok(body) => {
                let body = body.trim_end_matches('\n');
                body.strip_prefix("return ").unwrap_or(body).to_string()
            }
            Err(e) => {
                warn!("lambda body failed to decompile: {e}");
                "None".to_string()
            }
        }
    }
}

/// Decompile one code object to Python source with default options.
///
/// Bad indexes into the constant, name, or variable tables of `co` or one of
/// its nested code objects are the only fatal conditions; anything else
/// degrades to partial, commented output.
pub fn decompile(co: &CodeObject) -> Result<String, DepycError> {
    decompile_with_options(co, &DecompileOptions::default())
}

pub fn decompile_with_options(
    co: &CodeObject,
    opts: &DecompileOptions,
) -> Result<String, DepycError> {
    Decompiler::new(co, opts.clone(), 0)?.decompile_unit(0)
}

fn annotate(co: &CodeObject, op: Opcode, arg: u16, ins: &Instr) -> String {
    match op.fmt() {
        OpFmt::NONE | OpFmt::RAW => String::new(),
        OpFmt::CONST => match co.consts.get(arg as usize) {
            Some(c) => format!(" = {c}"),
            None => " = <invalid constant index>".to_string(),
        },
        OpFmt::NAME => match co.names.get(arg as usize) {
            Some(n) => format!(" = {n}"),
            None => " = <invalid name index>".to_string(),
        },
        OpFmt::LOCAL => match co.varnames.get(arg as usize) {
            Some(n) => format!(" = {n}"),
            None => " = <invalid local index>".to_string(),
        },
        OpFmt::FREE => match co.cell_or_free_at(arg) {
            Ok(n) => format!(" = {n}"),
            Err(_) => " = <invalid cell index>".to_string(),
        },
        OpFmt::CMP => match CMP_OP.get(arg as usize) {
            Some(t) => format!(" = {t}"),
            None => " = <invalid comparison>".to_string(),
        },
        OpFmt::JREL | OpFmt::JABS => ins
            .target()
            .map(|t| format!(" -> {t:08X}"))
            .unwrap_or_default(),
    }
}

fn disassemble_into(co: &CodeObject, out: &mut String) {
    out.push_str(&format!("# code object {}\n", co.name));
    let seq = InstrSeq::decode(&co.code);
    for ins in seq.instrs() {
        match ins.op {
            None => {
                out.push_str(&format!(
                    "{:08X}     {:02X} - <invalid opcode>\n",
                    ins.offset, co.code[ins.offset]
                ));
            }
            Some(op) => match ins.arg {
                Some(arg) => {
                    out.push_str(&format!(
                        "{:08X}     {:02X} - {:<20}{:04X}{}\n",
                        ins.offset,
                        op.byte(),
                        op.mnemonic(),
                        arg,
                        annotate(co, op, arg, ins)
                    ));
                }
                None if op.has_arg() => {
                    out.push_str(&format!(
                        "{:08X}     {:02X} - {:<20}<truncated operand>\n",
                        ins.offset,
                        op.byte(),
                        op.mnemonic()
                    ));
                }
                None => {
                    out.push_str(&format!(
                        "{:08X}     {:02X} - {}\n",
                        ins.offset,
                        op.byte(),
                        op.mnemonic()
                    ));
                }
            },
        }
    }
    out.push('\n');
    for c in &co.consts {
        if let Const::Code(nested) = c {
            disassemble_into(nested, out);
        }
    }
}

/// Render an annotated instruction listing for `co` and every nested code
/// object. Never fails: unknown bytes and bad indexes are marked inline.
pub fn disassemble(co: &CodeObject) -> String {
    let mut out = String::new();
    disassemble_into(co, &mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op0(code: &mut Vec<u8>, op: Opcode) {
        code.push(op.byte());
    }

    fn op1(code: &mut Vec<u8>, op: Opcode, arg: u16) {
        code.push(op.byte());
        code.extend_from_slice(&arg.to_le_bytes());
    }

    fn module_co(code: Vec<u8>, consts: Vec<Const>, names: &[&str]) -> CodeObject {
        CodeObject {
            name: "<module>".to_string(),
            code,
            consts,
            names: names.iter().map(|s| s.to_string()).collect(),
            ..CodeObject::default()
        }
    }

    /// LOAD_CONST of the None constant plus RETURN_VALUE, as every module
    /// body ends.
    fn module_tail(code: &mut Vec<u8>, none_index: u16) {
        op1(code, Opcode::LoadConst, none_index);
        op0(code, Opcode::ReturnValue);
    }

    #[test]
    fn decode_tiles_the_byte_string() {
        let mut code = Vec::new();
        op1(&mut code, Opcode::LoadConst, 0);
        op0(&mut code, Opcode::PopTop);
        code.push(0xff); // not an opcode
        code.push(Opcode::LoadConst.byte());
        code.push(0x01); // truncated operand
        let seq = InstrSeq::decode(&code);
        let total: usize = seq.instrs().iter().map(|i| i.size).sum();
        assert_eq!(total, code.len());
        assert_eq!(seq.instrs()[2].op, None);
        assert_eq!(seq.instrs()[3].op, Some(Opcode::LoadConst));
        assert_eq!(seq.instrs()[3].arg, None);
    }

    #[test]
    fn conditional_jump_chains_collapse() {
        let mut code = Vec::new();
        op1(&mut code, Opcode::LoadName, 0); // 0
        op1(&mut code, Opcode::JumpIfFalse, 0); // 3 -> 6
        op1(&mut code, Opcode::JumpIfFalse, 6); // 6 -> 15
        op0(&mut code, Opcode::PopTop); // 9
        op1(&mut code, Opcode::LoadName, 0); // 10
        op0(&mut code, Opcode::PopTop); // 13
        op0(&mut code, Opcode::Nop); // 14
        op1(&mut code, Opcode::LoadConst, 0); // 15
        op0(&mut code, Opcode::ReturnValue); // 18
        let mut seq = InstrSeq::decode(&code);
        normalize_jumps(&mut seq);
        // The first jump now lands directly on the second one's target.
        assert_eq!(seq.instrs()[1].arg, Some(9));
        assert_eq!(seq.instrs()[2].arg, Some(6));
    }

    #[test]
    fn jump_chain_collapse_keeps_targets_inside_operand_range() {
        let mut code = Vec::new();
        op1(&mut code, Opcode::JumpIfFalse, u16::MAX); // 0 -> 65538
        code.resize(65538, Opcode::Nop.byte());
        op1(&mut code, Opcode::JumpIfFalse, 10); // 65538 -> 65551
        code.resize(65560, Opcode::Nop.byte());
        let mut seq = InstrSeq::decode(&code);
        normalize_jumps(&mut seq);
        // The collapsed displacement would not fit the operand, so the
        // chain stays as decoded instead of wrapping around.
        assert_eq!(seq.instrs()[0].arg, Some(u16::MAX));
    }

    #[test]
    fn absolute_jumps_classify_against_loop_headers() {
        let mut code = Vec::new();
        op1(&mut code, Opcode::SetupLoop, 10); // 0 -> 13
        op0(&mut code, Opcode::Nop); // 3, loop header
        op1(&mut code, Opcode::JumpAbsolute, 3); // 4
        op1(&mut code, Opcode::JumpAbsolute, 3); // 7
        op0(&mut code, Opcode::PopBlock); // 10
        op1(&mut code, Opcode::LoadConst, 0); // 11... offsets past here unused
        let mut seq = InstrSeq::decode(&code);
        normalize_jumps(&mut seq);
        let at = |off: usize| seq.instrs().iter().find(|i| i.offset == off).unwrap().op;
        // The innermost latch becomes a NOP, the outer one a continue.
        assert_eq!(at(7), Some(Opcode::Nop));
        assert_eq!(at(4), Some(Opcode::ContinueLoop));
    }

    #[test]
    fn normalization_is_idempotent() {
        let mut code = Vec::new();
        op1(&mut code, Opcode::SetupLoop, 18); // 0 -> 21
        op1(&mut code, Opcode::LoadName, 0); // 3
        op1(&mut code, Opcode::JumpIfFalse, 0); // 6 -> 9
        op1(&mut code, Opcode::JumpIfFalse, 7); // 9 -> 19
        op0(&mut code, Opcode::PopTop); // 12
        op1(&mut code, Opcode::LoadConst, 0); // 13
        op1(&mut code, Opcode::JumpAbsolute, 3); // 16
        op0(&mut code, Opcode::PopTop); // 19
        op0(&mut code, Opcode::PopBlock); // 20
        module_tail(&mut code, 0); // 21
        let mut seq = InstrSeq::decode(&code);
        normalize_jumps(&mut seq);
        let once = seq.instrs().to_vec();
        normalize_jumps(&mut seq);
        assert_eq!(seq.instrs(), once.as_slice());
        // Offsets and sizes are never touched, only opcodes and operands.
        let fresh = InstrSeq::decode(&code);
        let offsets: Vec<usize> = fresh.instrs().iter().map(|i| i.offset).collect();
        assert_eq!(once.iter().map(|i| i.offset).collect::<Vec<_>>(), offsets);
    }

    #[test]
    fn const_repr() {
        assert_eq!(Const::Float(2.0).to_string(), "2.0");
        assert_eq!(Const::Str("a'b\n".to_string()).to_string(), "'a\\'b\\n'");
        assert_eq!(
            Const::Tuple(vec![Const::Int(1)]).to_string(),
            "(1,)"
        );
        assert_eq!(Const::Bool(true).to_string(), "True");
    }

    #[test]
    fn simple_assignment() {
        let mut code = Vec::new();
        op1(&mut code, Opcode::LoadConst, 0);
        op1(&mut code, Opcode::StoreName, 0);
        module_tail(&mut code, 1);
        let co = module_co(code, vec![Const::Int(1), Const::None], &["x"]);
        assert_eq!(decompile(&co).unwrap(), "x = 1\n");
    }

    #[test]
    fn binary_precedence_parenthesizes() {
        let mut code = Vec::new();
        op1(&mut code, Opcode::LoadName, 0);
        op1(&mut code, Opcode::LoadName, 1);
        op0(&mut code, Opcode::BinaryAdd);
        op1(&mut code, Opcode::LoadName, 2);
        op0(&mut code, Opcode::BinaryMultiply);
        op1(&mut code, Opcode::StoreName, 3);
        module_tail(&mut code, 0);
        let co = module_co(code, vec![Const::None], &["a", "b", "c", "x"]);
        assert_eq!(decompile(&co).unwrap(), "x = (a + b) * c\n");

        let mut code = Vec::new();
        op1(&mut code, Opcode::LoadName, 0);
        op1(&mut code, Opcode::LoadName, 1);
        op1(&mut code, Opcode::LoadName, 2);
        op0(&mut code, Opcode::BinaryMultiply);
        op0(&mut code, Opcode::BinaryAdd);
        op1(&mut code, Opcode::StoreName, 3);
        module_tail(&mut code, 0);
        let co = module_co(code, vec![Const::None], &["a", "b", "c", "x"]);
        assert_eq!(decompile(&co).unwrap(), "x = a + b * c\n");
    }

    #[test]
    fn rotated_stores_coalesce_into_tuple_assignment() {
        let mut code = Vec::new();
        op1(&mut code, Opcode::LoadConst, 0);
        op1(&mut code, Opcode::LoadConst, 1);
        op0(&mut code, Opcode::RotTwo);
        op1(&mut code, Opcode::StoreName, 0);
        op1(&mut code, Opcode::StoreName, 1);
        module_tail(&mut code, 2);
        let co = module_co(
            code,
            vec![Const::Int(1), Const::Int(2), Const::None],
            &["a", "b"],
        );
        assert_eq!(decompile(&co).unwrap(), "(a, b) = (1, 2)\n");
    }

    #[test]
    fn unpack_sequence_names_the_elements() {
        let mut code = Vec::new();
        op1(&mut code, Opcode::LoadName, 0);
        op1(&mut code, Opcode::UnpackSequence, 2);
        op1(&mut code, Opcode::StoreName, 1);
        op1(&mut code, Opcode::StoreName, 2);
        module_tail(&mut code, 0);
        let co = module_co(code, vec![Const::None], &["t", "a", "b"]);
        assert_eq!(decompile(&co).unwrap(), "(a, b) = (t[0], t[1])\n");
    }

    #[test]
    fn dup_then_double_pop_emits_one_statement() {
        let mut code = Vec::new();
        op1(&mut code, Opcode::LoadName, 0);
        op0(&mut code, Opcode::DupTop);
        op0(&mut code, Opcode::PopTop);
        op0(&mut code, Opcode::PopTop);
        module_tail(&mut code, 0);
        let co = module_co(code, vec![Const::None], &["a"]);
        assert_eq!(decompile(&co).unwrap(), "a\n");
    }

    #[test]
    fn stack_underflow_degrades_to_empty_output() {
        let mut code = Vec::new();
        op0(&mut code, Opcode::BinaryAdd);
        module_tail(&mut code, 0);
        let co = module_co(code, vec![Const::None], &[]);
        assert_eq!(decompile(&co).unwrap(), "");
    }

    #[test]
    fn if_else_structures() {
        let mut code = Vec::new();
        op1(&mut code, Opcode::LoadName, 0); // 0
        op1(&mut code, Opcode::JumpIfFalse, 10); // 3 -> 16
        op0(&mut code, Opcode::PopTop); // 6
        op1(&mut code, Opcode::LoadConst, 0); // 7
        op1(&mut code, Opcode::StoreName, 1); // 10
        op1(&mut code, Opcode::JumpForward, 7); // 13 -> 23
        op0(&mut code, Opcode::PopTop); // 16
        op1(&mut code, Opcode::LoadConst, 1); // 17
        op1(&mut code, Opcode::StoreName, 1); // 20
        module_tail(&mut code, 2); // 23
        let co = module_co(
            code,
            vec![Const::Int(1), Const::Int(2), Const::None],
            &["a", "x"],
        );
        assert_eq!(
            decompile(&co).unwrap(),
            "if a:\n    x = 1\nelse:\n    x = 2\n"
        );
    }

    #[test]
    fn if_without_else_drops_the_empty_branch() {
        let mut code = Vec::new();
        op1(&mut code, Opcode::LoadName, 0); // 0
        op1(&mut code, Opcode::JumpIfFalse, 10); // 3 -> 16
        op0(&mut code, Opcode::PopTop); // 6
        op1(&mut code, Opcode::LoadConst, 0); // 7
        op1(&mut code, Opcode::StoreName, 1); // 10
        op1(&mut code, Opcode::JumpForward, 1); // 13 -> 17
        op0(&mut code, Opcode::PopTop); // 16
        module_tail(&mut code, 1); // 17
        let co = module_co(code, vec![Const::Int(1), Const::None], &["a", "x"]);
        assert_eq!(decompile(&co).unwrap(), "if a:\n    x = 1\n");
    }

    #[test]
    fn short_circuit_and_merges_into_one_condition() {
        let mut code = Vec::new();
        op1(&mut code, Opcode::LoadName, 0); // 0
        op1(&mut code, Opcode::JumpIfFalse, 17); // 3 -> 23
        op0(&mut code, Opcode::PopTop); // 6
        op1(&mut code, Opcode::LoadName, 1); // 7
        op1(&mut code, Opcode::JumpIfFalse, 10); // 10 -> 23
        op0(&mut code, Opcode::PopTop); // 13
        op1(&mut code, Opcode::LoadConst, 0); // 14
        op1(&mut code, Opcode::StoreName, 2); // 17
        op1(&mut code, Opcode::JumpForward, 1); // 20 -> 24
        op0(&mut code, Opcode::PopTop); // 23
        module_tail(&mut code, 1); // 24
        let co = module_co(code, vec![Const::Int(1), Const::None], &["a", "b", "x"]);
        assert_eq!(decompile(&co).unwrap(), "if a and b:\n    x = 1\n");
    }

    #[test]
    fn while_loop_structures() {
        let mut code = Vec::new();
        op1(&mut code, Opcode::SetupLoop, 18); // 0 -> 21
        op1(&mut code, Opcode::LoadName, 0); // 3
        op1(&mut code, Opcode::JumpIfFalse, 10); // 6 -> 19
        op0(&mut code, Opcode::PopTop); // 9
        op1(&mut code, Opcode::LoadConst, 0); // 10
        op1(&mut code, Opcode::StoreName, 1); // 13
        op1(&mut code, Opcode::JumpAbsolute, 3); // 16
        op0(&mut code, Opcode::PopTop); // 19
        op0(&mut code, Opcode::PopBlock); // 20
        module_tail(&mut code, 1); // 21
        let co = module_co(code, vec![Const::Int(1), Const::None], &["a", "b"]);
        assert_eq!(decompile(&co).unwrap(), "while a:\n    b = 1\n");
    }

    #[test]
    fn while_loop_with_break_structures() {
        let mut code = Vec::new();
        op1(&mut code, Opcode::SetupLoop, 19); // 0 -> 22
        op1(&mut code, Opcode::LoadName, 0); // 3
        op1(&mut code, Opcode::JumpIfFalse, 11); // 6 -> 20
        op0(&mut code, Opcode::PopTop); // 9
        op1(&mut code, Opcode::LoadConst, 0); // 10
        op1(&mut code, Opcode::StoreName, 1); // 13
        op0(&mut code, Opcode::BreakLoop); // 16
        op1(&mut code, Opcode::JumpAbsolute, 3); // 17
        op0(&mut code, Opcode::PopTop); // 20
        op0(&mut code, Opcode::PopBlock); // 21
        module_tail(&mut code, 1); // 22
        let co = module_co(code, vec![Const::Int(1), Const::None], &["a", "x"]);
        assert_eq!(
            decompile(&co).unwrap(),
            "while a:\n    x = 1\n    break\n"
        );
    }

    #[test]
    fn for_loop_structures() {
        let mut code = Vec::new();
        op1(&mut code, Opcode::SetupLoop, 20); // 0 -> 23
        op1(&mut code, Opcode::LoadName, 0); // 3
        op0(&mut code, Opcode::GetIter); // 6
        op1(&mut code, Opcode::ForIter, 12); // 7 -> 22
        op1(&mut code, Opcode::StoreName, 1); // 10
        op1(&mut code, Opcode::LoadName, 1); // 13
        op1(&mut code, Opcode::StoreName, 2); // 16
        op1(&mut code, Opcode::JumpAbsolute, 7); // 19
        op0(&mut code, Opcode::PopBlock); // 22
        module_tail(&mut code, 0); // 23
        let co = module_co(code, vec![Const::None], &["x", "i", "y"]);
        assert_eq!(decompile(&co).unwrap(), "for i in x:\n    y = i\n");
    }

    #[test]
    fn for_loop_with_else_structures() {
        let mut code = Vec::new();
        op1(&mut code, Opcode::SetupLoop, 26); // 0 -> 29
        op1(&mut code, Opcode::LoadName, 0); // 3
        op0(&mut code, Opcode::GetIter); // 6
        op1(&mut code, Opcode::ForIter, 12); // 7 -> 22
        op1(&mut code, Opcode::StoreName, 1); // 10
        op1(&mut code, Opcode::LoadName, 1); // 13
        op1(&mut code, Opcode::StoreName, 2); // 16
        op1(&mut code, Opcode::JumpAbsolute, 7); // 19
        op0(&mut code, Opcode::PopBlock); // 22
        op1(&mut code, Opcode::LoadConst, 0); // 23
        op1(&mut code, Opcode::StoreName, 3); // 26
        module_tail(&mut code, 1); // 29
        let co = module_co(
            code,
            vec![Const::Int(1), Const::None],
            &["x", "i", "y", "z"],
        );
        assert_eq!(
            decompile(&co).unwrap(),
            "for i in x:\n    y = i\nelse:\n    z = 1\n"
        );
    }

    #[test]
    fn bare_except_structures() {
        let mut code = Vec::new();
        op1(&mut code, Opcode::SetupExcept, 10); // 0 -> 13
        op1(&mut code, Opcode::LoadConst, 0); // 3
        op1(&mut code, Opcode::StoreName, 0); // 6
        op0(&mut code, Opcode::PopBlock); // 9
        op1(&mut code, Opcode::JumpForward, 7); // 10 -> 20
        op0(&mut code, Opcode::PopTop); // 13
        op0(&mut code, Opcode::PopTop); // 14
        op0(&mut code, Opcode::PopTop); // 15
        op1(&mut code, Opcode::JumpForward, 1); // 16 -> 20
        op0(&mut code, Opcode::EndFinally); // 19
        module_tail(&mut code, 1); // 20
        let co = module_co(code, vec![Const::Int(1), Const::None], &["x"]);
        assert_eq!(
            decompile(&co).unwrap(),
            "try:\n    x = 1\nexcept:\n    pass\n"
        );
    }

    #[test]
    fn matched_except_names_the_exception() {
        let mut code = Vec::new();
        op1(&mut code, Opcode::SetupExcept, 10); // 0 -> 13
        op1(&mut code, Opcode::LoadConst, 0); // 3
        op1(&mut code, Opcode::StoreName, 0); // 6
        op0(&mut code, Opcode::PopBlock); // 9
        op1(&mut code, Opcode::JumpForward, 24); // 10 -> 37
        op0(&mut code, Opcode::DupTop); // 13
        op1(&mut code, Opcode::LoadName, 1); // 14
        op1(&mut code, Opcode::CompareOp, 10); // 17, exception match
        op1(&mut code, Opcode::JumpIfFalse, 12); // 20 -> 35
        op0(&mut code, Opcode::PopTop); // 23
        op0(&mut code, Opcode::PopTop); // 24
        op0(&mut code, Opcode::PopTop); // 25
        op1(&mut code, Opcode::LoadConst, 1); // 26
        op1(&mut code, Opcode::StoreName, 2); // 29
        op1(&mut code, Opcode::JumpForward, 2); // 32 -> 37
        op0(&mut code, Opcode::PopTop); // 35
        op0(&mut code, Opcode::EndFinally); // 36
        module_tail(&mut code, 2); // 37
        let co = module_co(
            code,
            vec![Const::Int(1), Const::Int(2), Const::None],
            &["x", "ValueError", "y"],
        );
        assert_eq!(
            decompile(&co).unwrap(),
            "try:\n    x = 1\nexcept ValueError:\n    y = 2\n"
        );
    }

    #[test]
    fn try_finally_structures() {
        let mut code = Vec::new();
        op1(&mut code, Opcode::SetupFinally, 10); // 0 -> 13
        op1(&mut code, Opcode::LoadConst, 0); // 3
        op1(&mut code, Opcode::StoreName, 0); // 6
        op0(&mut code, Opcode::PopBlock); // 9
        op1(&mut code, Opcode::LoadConst, 1); // 10
        op1(&mut code, Opcode::LoadConst, 2); // 13
        op1(&mut code, Opcode::StoreName, 1); // 16
        op0(&mut code, Opcode::EndFinally); // 19
        module_tail(&mut code, 1); // 20
        let co = module_co(
            code,
            vec![Const::Int(1), Const::None, Const::Int(2)],
            &["x", "y"],
        );
        assert_eq!(
            decompile(&co).unwrap(),
            "try:\n    x = 1\nfinally:\n    y = 2\n"
        );
    }

    #[test]
    fn try_except_finally_structures() {
        let mut code = Vec::new();
        op1(&mut code, Opcode::SetupFinally, 24); // 0 -> 27
        op1(&mut code, Opcode::SetupExcept, 10); // 3 -> 16
        op1(&mut code, Opcode::LoadConst, 0); // 6
        op1(&mut code, Opcode::StoreName, 0); // 9
        op0(&mut code, Opcode::PopBlock); // 12
        op1(&mut code, Opcode::JumpForward, 7); // 13 -> 23
        op0(&mut code, Opcode::PopTop); // 16
        op0(&mut code, Opcode::PopTop); // 17
        op0(&mut code, Opcode::PopTop); // 18
        op1(&mut code, Opcode::JumpForward, 1); // 19 -> 23
        op0(&mut code, Opcode::EndFinally); // 22
        op0(&mut code, Opcode::PopBlock); // 23
        op1(&mut code, Opcode::LoadConst, 1); // 24, stacked None
        op1(&mut code, Opcode::LoadConst, 2); // 27, finally body
        op1(&mut code, Opcode::StoreName, 1); // 30
        op0(&mut code, Opcode::EndFinally); // 33
        module_tail(&mut code, 1); // 34
        let co = module_co(
            code,
            vec![Const::Int(1), Const::None, Const::Int(2)],
            &["x", "y"],
        );
        assert_eq!(
            decompile(&co).unwrap(),
            "try:\n    x = 1\nexcept:\n    pass\nfinally:\n    y = 2\n"
        );
    }

    #[test]
    fn unstructurable_graph_falls_back_to_block_listing() {
        let mut code = Vec::new();
        op1(&mut code, Opcode::LoadName, 0); // 0
        op0(&mut code, Opcode::PopTop); // 3
        op1(&mut code, Opcode::JumpAbsolute, 0); // 4, no loop header
        module_tail(&mut code, 0); // 7
        let co = module_co(code, vec![Const::None], &["a"]);
        let out = decompile(&co).unwrap();
        assert!(out.contains("#[unresolved block"), "got: {out}");
        assert!(out.contains("a\n"), "got: {out}");
    }

    #[test]
    fn exhausted_rewrite_budget_degrades_to_block_listing() {
        let mut code = Vec::new();
        op1(&mut code, Opcode::LoadName, 0);
        op1(&mut code, Opcode::JumpIfFalse, 10);
        op0(&mut code, Opcode::PopTop);
        op1(&mut code, Opcode::LoadConst, 0);
        op1(&mut code, Opcode::StoreName, 1);
        op1(&mut code, Opcode::JumpForward, 7);
        op0(&mut code, Opcode::PopTop);
        op1(&mut code, Opcode::LoadConst, 1);
        op1(&mut code, Opcode::StoreName, 1);
        module_tail(&mut code, 2);
        let co = module_co(
            code,
            vec![Const::Int(1), Const::Int(2), Const::None],
            &["a", "x"],
        );
        let opts = DecompileOptions {
            rewrite_budget: Some(0),
            ..DecompileOptions::default()
        };
        let out = decompile_with_options(&co, &opts).unwrap();
        assert!(out.contains("#[unresolved block"), "got: {out}");
    }

    fn add_fn_co() -> CodeObject {
        let mut code = Vec::new();
        op1(&mut code, Opcode::LoadFast, 0);
        op1(&mut code, Opcode::LoadFast, 1);
        op0(&mut code, Opcode::BinaryAdd);
        op0(&mut code, Opcode::ReturnValue);
        CodeObject {
            name: "f".to_string(),
            argcount: 2,
            nlocals: 2,
            code,
            varnames: vec!["a".to_string(), "b".to_string()],
            ..CodeObject::default()
        }
    }

    #[test]
    fn function_definition_with_default() {
        let mut code = Vec::new();
        op1(&mut code, Opcode::LoadConst, 0); // default for b
        op1(&mut code, Opcode::LoadConst, 1); // code object
        op1(&mut code, Opcode::MakeFunction, 1);
        op1(&mut code, Opcode::StoreName, 0);
        module_tail(&mut code, 2);
        let co = module_co(
            code,
            vec![
                Const::Int(1),
                Const::Code(Rc::new(add_fn_co())),
                Const::None,
            ],
            &["f"],
        );
        assert_eq!(
            decompile(&co).unwrap(),
            "def f(a, b=1):\n    return a + b\n\n"
        );
    }

    #[test]
    fn lambda_renders_inline() {
        let mut body = Vec::new();
        op1(&mut body, Opcode::LoadFast, 0);
        op1(&mut body, Opcode::LoadConst, 0);
        op0(&mut body, Opcode::BinaryMultiply);
        op0(&mut body, Opcode::ReturnValue);
        let lambda = CodeObject {
            name: "<lambda>".to_string(),
            argcount: 1,
            nlocals: 1,
            code: body,
            consts: vec![Const::Int(2)],
            varnames: vec!["x".to_string()],
            ..CodeObject::default()
        };
        let mut code = Vec::new();
        op1(&mut code, Opcode::LoadConst, 0);
        op1(&mut code, Opcode::MakeFunction, 0);
        op1(&mut code, Opcode::StoreName, 0);
        module_tail(&mut code, 1);
        let co = module_co(
            code,
            vec![Const::Code(Rc::new(lambda)), Const::None],
            &["g"],
        );
        assert_eq!(decompile(&co).unwrap(), "g = (lambda x: x * 2)\n");
    }

    #[test]
    fn class_definition_with_base() {
        let mut body = Vec::new();
        op1(&mut body, Opcode::LoadName, 0); // __name__
        op1(&mut body, Opcode::StoreName, 1); // __module__
        op1(&mut body, Opcode::LoadConst, 0);
        op1(&mut body, Opcode::StoreName, 2); // x
        op0(&mut body, Opcode::LoadLocals);
        op0(&mut body, Opcode::ReturnValue);
        let class_body = CodeObject {
            name: "C".to_string(),
            code: body,
            consts: vec![Const::Int(1)],
            names: vec![
                "__name__".to_string(),
                "__module__".to_string(),
                "x".to_string(),
            ],
            ..CodeObject::default()
        };
        let mut code = Vec::new();
        op1(&mut code, Opcode::LoadConst, 0); // 'C'
        op1(&mut code, Opcode::LoadName, 0); // object
        op1(&mut code, Opcode::BuildTuple, 1);
        op1(&mut code, Opcode::LoadConst, 1); // class body code
        op1(&mut code, Opcode::MakeFunction, 0);
        op1(&mut code, Opcode::CallFunction, 0);
        op0(&mut code, Opcode::BuildClass);
        op1(&mut code, Opcode::StoreName, 1);
        module_tail(&mut code, 2);
        let co = module_co(
            code,
            vec![
                Const::Str("C".to_string()),
                Const::Code(Rc::new(class_body)),
                Const::None,
            ],
            &["object", "C"],
        );
        assert_eq!(
            decompile(&co).unwrap(),
            "class C(object):\n    x = 1\n\n"
        );
    }

    #[test]
    fn nesting_depth_limit_degrades_to_comment() {
        let mut leaf_code = Vec::new();
        module_tail(&mut leaf_code, 0);
        let mut co = CodeObject {
            name: "leaf".to_string(),
            code: leaf_code,
            consts: vec![Const::None],
            ..CodeObject::default()
        };
        for i in 0..40 {
            let mut code = Vec::new();
            op1(&mut code, Opcode::LoadConst, 0);
            op1(&mut code, Opcode::MakeFunction, 0);
            op1(&mut code, Opcode::StoreName, 0);
            module_tail(&mut code, 1);
            co = CodeObject {
                name: format!("f{i}"),
                code,
                consts: vec![Const::Code(Rc::new(co)), Const::None],
                names: vec!["g".to_string()],
                ..CodeObject::default()
            };
        }
        let out = decompile(&co).unwrap();
        assert!(out.contains("decompilation error"), "got: {out}");
    }

    #[test]
    fn plain_import() {
        let mut code = Vec::new();
        op1(&mut code, Opcode::LoadConst, 0); // level
        op1(&mut code, Opcode::LoadConst, 1); // fromlist
        op1(&mut code, Opcode::ImportName, 0);
        op1(&mut code, Opcode::StoreName, 0);
        module_tail(&mut code, 1);
        let co = module_co(code, vec![Const::Int(-1), Const::None], &["os"]);
        assert_eq!(decompile(&co).unwrap(), "import os\n");
    }

    #[test]
    fn from_import() {
        let mut code = Vec::new();
        op1(&mut code, Opcode::LoadConst, 0); // level
        op1(&mut code, Opcode::LoadConst, 1); // fromlist
        op1(&mut code, Opcode::ImportName, 0);
        op1(&mut code, Opcode::ImportFrom, 1);
        op1(&mut code, Opcode::StoreName, 1);
        op0(&mut code, Opcode::PopTop);
        module_tail(&mut code, 2);
        let co = module_co(
            code,
            vec![
                Const::Int(-1),
                Const::Tuple(vec![Const::Str("path".to_string())]),
                Const::None,
            ],
            &["os", "path"],
        );
        assert_eq!(decompile(&co).unwrap(), "from os import path\n");
    }

    #[test]
    fn print_statement() {
        let mut code = Vec::new();
        op1(&mut code, Opcode::LoadName, 0);
        op0(&mut code, Opcode::PrintItem);
        op0(&mut code, Opcode::PrintNewline);
        module_tail(&mut code, 0);
        let co = module_co(code, vec![Const::None], &["a"]);
        assert_eq!(decompile(&co).unwrap(), "print a\n");
    }

    #[test]
    fn call_with_keyword_argument() {
        let mut code = Vec::new();
        op1(&mut code, Opcode::LoadName, 0);
        op1(&mut code, Opcode::LoadConst, 0);
        op1(&mut code, Opcode::LoadConst, 1); // 'k'
        op1(&mut code, Opcode::LoadConst, 2);
        op1(&mut code, Opcode::CallFunction, 0x0101);
        op1(&mut code, Opcode::StoreName, 1);
        module_tail(&mut code, 3);
        let co = module_co(
            code,
            vec![
                Const::Int(1),
                Const::Str("k".to_string()),
                Const::Int(2),
                Const::None,
            ],
            &["f", "r"],
        );
        assert_eq!(decompile(&co).unwrap(), "r = f(1, k=2)\n");
    }

    #[test]
    fn output_is_deterministic() {
        let mut code = Vec::new();
        op1(&mut code, Opcode::LoadName, 0);
        op1(&mut code, Opcode::JumpIfFalse, 10);
        op0(&mut code, Opcode::PopTop);
        op1(&mut code, Opcode::LoadConst, 0);
        op1(&mut code, Opcode::StoreName, 1);
        op1(&mut code, Opcode::JumpForward, 7);
        op0(&mut code, Opcode::PopTop);
        op1(&mut code, Opcode::LoadConst, 1);
        op1(&mut code, Opcode::StoreName, 1);
        module_tail(&mut code, 2);
        let co = module_co(
            code,
            vec![Const::Int(1), Const::Int(2), Const::None],
            &["a", "x"],
        );
        let first = decompile(&co).unwrap();
        for _ in 0..4 {
            assert_eq!(decompile(&co).unwrap(), first);
        }
    }

    #[test]
    fn disassembly_lists_every_instruction() {
        let mut code = Vec::new();
        op1(&mut code, Opcode::LoadConst, 0);
        op1(&mut code, Opcode::MakeFunction, 0);
        op1(&mut code, Opcode::StoreName, 0);
        op1(&mut code, Opcode::JumpForward, 0);
        code.push(0xff);
        module_tail(&mut code, 1);
        let co = module_co(
            code,
            vec![Const::Code(Rc::new(add_fn_co())), Const::None],
            &["f"],
        );
        let out = disassemble(&co);
        assert!(out.contains("# code object <module>"), "got: {out}");
        assert!(out.contains("# code object f"), "got: {out}");
        assert!(out.contains("MAKE_FUNCTION"), "got: {out}");
        assert!(out.contains("STORE_NAME"), "got: {out}");
        assert!(out.contains(" = f"), "got: {out}");
        assert!(out.contains("-> 0000000C"), "got: {out}");
        assert!(out.contains("<invalid opcode>"), "got: {out}");
    }
}
