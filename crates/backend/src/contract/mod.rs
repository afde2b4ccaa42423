//! The immutable per-contract model: functions, storage variables, the two
//! bytecode bodies with their instruction-index maps and decoded source
//! maps, and the source text tables used for line/column translation.
//!
//! Everything here is built once by [`builder::ContractBuilder`] and never
//! mutated afterwards.

pub mod builder;

use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::types::Variable;

/// Marker sequence introducing the trailing compiler metadata
/// (`a165627a7a72305820…`, the swarm-hash envelope). Metadata is not
/// executable and not source-mapped, so bytecode scans and comparisons stop
/// here.
pub const METADATA_MARKER: &[u8] = &[0xa1, 0x65, 0x62, 0x7a, 0x7a, 0x72, 0x30, 0x58, 0x20];

/// Offset of the metadata marker in `code`, if present.
pub fn metadata_start(code: &[u8]) -> Option<usize> {
    if METADATA_MARKER.len() > code.len() {
        return None;
    }
    code.windows(METADATA_MARKER.len()).position(|w| w == METADATA_MARKER)
}

/// `code` with any trailing compiler metadata (and everything after it,
/// e.g. constructor arguments) cut off.
pub fn strip_metadata(code: &[u8]) -> &[u8] {
    &code[..metadata_start(code).unwrap_or(code.len())]
}

/// A byte span in one source file, as found in AST `src` attributes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SourceSpan {
    pub start: usize,
    pub length: usize,
    pub file: i64,
}

impl SourceSpan {
    pub fn contains(&self, offset: usize) -> bool {
        offset >= self.start && offset < self.start + self.length
    }
}

/// Function-entry/exit marker of a source-map record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum JumpKind {
    /// `i`: the instruction jumps into a function.
    In,
    /// `o`: the instruction returns out of a function.
    Out,
    #[default]
    Regular,
}

impl JumpKind {
    pub fn parse(s: &str) -> Self {
        match s {
            "i" => Self::In,
            "o" => Self::Out,
            _ => Self::Regular,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::In => "i",
            Self::Out => "o",
            Self::Regular => "-",
        }
    }
}

/// One decoded source-map record: the source span an instruction was
/// compiled from, plus its jump marker. `file_index == -1` means the
/// instruction has no source (compiler-generated code, or a program counter
/// outside the instruction map).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceFragment {
    pub start: usize,
    pub length: usize,
    pub file_index: i64,
    pub jump: JumpKind,
}

impl SourceFragment {
    /// The "no source" sentinel.
    pub const NONE: Self =
        Self { start: 0, length: 0, file_index: -1, jump: JumpKind::Regular };

    pub fn has_source(&self) -> bool {
        self.file_index >= 0
    }

    /// Same source span, ignoring the jump marker. The stepper uses this to
    /// decide whether two instructions belong to the same statement: the
    /// call instruction carries an `i`/`o` marker on the span of the
    /// surrounding expression.
    pub fn same_source(&self, other: &Self) -> bool {
        self.start == other.start &&
            self.length == other.length &&
            self.file_index == other.file_index
    }
}

/// One bytecode body (constructor/init or runtime) with its derived maps.
#[derive(Debug)]
pub struct BytecodeBody {
    pub code: Vec<u8>,
    /// Program counter to instruction index. PUSH immediates share the
    /// index of their opcode; program counters inside trailing metadata are
    /// absent.
    pub pc_to_idx: FxHashMap<usize, usize>,
    /// One record per instruction index.
    pub srcmap: Vec<SourceFragment>,
}

impl BytecodeBody {
    /// Instruction index for `pc`, or `None` if the program counter does
    /// not map to an instruction.
    pub fn instruction_index(&self, pc: usize) -> Option<usize> {
        self.pc_to_idx.get(&pc).copied()
    }

    /// Source fragment for `pc`; the no-source sentinel when the program
    /// counter has no instruction or no source-map record.
    pub fn fragment_at(&self, pc: usize) -> SourceFragment {
        self.instruction_index(pc)
            .and_then(|idx| self.srcmap.get(idx))
            .cloned()
            .unwrap_or(SourceFragment::NONE)
    }
}

/// The source files of one bundle: paths, line-split text, and per-file
/// byte offsets of each line start.
#[derive(Debug)]
pub struct SourceSet {
    pub paths: Vec<String>,
    /// Lines per file, without trailing newlines.
    pub texts: Vec<Vec<String>>,
    /// Byte offset of each line start, per file.
    pub line_offsets: Vec<Vec<usize>>,
}

impl SourceSet {
    pub fn new(paths: Vec<String>, texts: Vec<Vec<String>>) -> Self {
        let line_offsets = texts
            .iter()
            .map(|lines| {
                let mut offsets = Vec::with_capacity(lines.len());
                let mut pos = 0;
                for line in lines {
                    offsets.push(pos);
                    pos += line.len() + 1;
                }
                offsets
            })
            .collect();
        Self { paths, texts, line_offsets }
    }

    /// 0-based line number containing byte `offset` in file `file`.
    pub fn line_at(&self, file: usize, offset: usize) -> Option<usize> {
        let offsets = self.line_offsets.get(file)?;
        let lines = self.texts.get(file)?;
        if offsets.is_empty() {
            return None;
        }
        let idx = offsets.partition_point(|&o| o <= offset).saturating_sub(1);
        // The line owns its trailing newline byte.
        (offset >= offsets[idx] && offset < offsets[idx] + lines[idx].len() + 1).then_some(idx)
    }
}

/// A function with its parameter/local/return layout. Ordinals follow
/// declaration order; locals are collected recursively over the whole body
/// in first-encountered order, and the first declaration of a name wins.
#[derive(Debug)]
pub struct Function {
    pub name: String,
    pub src: SourceSpan,
    pub params: Vec<Variable>,
    /// Named return variables (ordinals count unnamed return slots too).
    pub returns: Vec<Variable>,
    pub locals: Vec<Variable>,
    /// Number of return slots, named or not.
    pub return_count: usize,
    params_by_name: FxHashMap<String, usize>,
    returns_by_name: FxHashMap<String, usize>,
    locals_by_name: FxHashMap<String, usize>,
}

impl Function {
    pub fn new(
        name: String,
        src: SourceSpan,
        params: Vec<Variable>,
        returns: Vec<Variable>,
        locals: Vec<Variable>,
        return_count: usize,
    ) -> Self {
        Self {
            params_by_name: index_by_name(&params),
            returns_by_name: index_by_name(&returns),
            locals_by_name: index_by_name(&locals),
            name,
            src,
            params,
            returns,
            locals,
            return_count,
        }
    }

    pub fn param(&self, name: &str) -> Option<&Variable> {
        self.params_by_name.get(name).map(|&i| &self.params[i])
    }

    pub fn local(&self, name: &str) -> Option<&Variable> {
        self.locals_by_name.get(name).map(|&i| &self.locals[i])
    }

    pub fn return_var(&self, name: &str) -> Option<&Variable> {
        self.returns_by_name.get(name).map(|&i| &self.returns[i])
    }
}

/// One loaded contract with both bytecode bodies and the storage layout.
#[derive(Debug)]
pub struct Contract {
    pub name: String,
    pub src: SourceSpan,
    pub functions: Vec<Function>,
    /// Storage variables in slot-assignment (inheritance) order.
    pub variables: Vec<Variable>,
    pub init: BytecodeBody,
    pub runtime: BytecodeBody,
    pub sources: Arc<SourceSet>,
    variables_by_name: FxHashMap<String, usize>,
}

impl Contract {
    pub(crate) fn assemble(
        name: String,
        src: SourceSpan,
        functions: Vec<Function>,
        variables: Vec<Variable>,
        init: BytecodeBody,
        runtime: BytecodeBody,
        sources: Arc<SourceSet>,
    ) -> Self {
        Self {
            variables_by_name: index_by_name(&variables),
            name,
            src,
            functions,
            variables,
            init,
            runtime,
            sources,
        }
    }

    pub fn storage_variable(&self, name: &str) -> Option<&Variable> {
        self.variables_by_name.get(name).map(|&i| &self.variables[i])
    }

    /// The function whose source span contains `offset`.
    pub fn function_at(&self, offset: usize) -> Option<&Function> {
        self.functions.iter().find(|f| f.src.contains(offset))
    }

    pub fn body(&self, is_init: bool) -> &BytecodeBody {
        if is_init {
            &self.init
        } else {
            &self.runtime
        }
    }
}

/// First declaration of a name wins; later duplicates are shadowed.
fn index_by_name(vars: &[Variable]) -> FxHashMap<String, usize> {
    let mut map = FxHashMap::default();
    for (i, var) in vars.iter().enumerate() {
        map.entry(var.name.clone()).or_insert(i);
    }
    map
}
