//! The trace-driven stepping state machine.
//!
//! A [`DebugSession`] owns the trace position, the frame-base stack (one
//! entry per function-call nesting level inside the current contract
//! invocation) and the contract-invocation stack (one entry per active
//! external call or create). All mutation funnels through [`DebugSession::advance`];
//! the higher-level scans (`step`, `next`, `stepout`, `continu`) are loops
//! over it and stop silently at end-of-trace.

use std::{fmt, sync::Arc};

use alloy_primitives::{Address, B256, U256};
use eyre::{ensure, eyre, Result};

use crate::{
    contract::{strip_metadata, Contract, Function, JumpKind, SourceFragment},
    trace::{ChainAccess, Trace, TraceStep},
};

/// One active contract invocation.
#[derive(Clone, Debug)]
pub struct ContractFrame {
    pub address: Address,
    pub contract: Arc<Contract>,
    /// True while constructor (init) code is executing.
    pub is_init: bool,
}

/// A source-line breakpoint: `path` matches by substring against the
/// loaded source file paths, `line` is 1-based.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Breakpoint {
    pub path: String,
    pub line: usize,
}

impl fmt::Display for Breakpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.path, self.line)
    }
}

/// How the debugged transaction entered the VM.
#[derive(Clone, Debug)]
pub enum TxEntry {
    /// A message call to a deployed contract. When `code` is `None` the
    /// deployed bytecode is fetched through the chain-access seam.
    Call { to: Address, code: Option<Vec<u8>> },
    /// A contract creation; `init_code` is the transaction input.
    Create { address: Address, init_code: Vec<u8> },
}

/// A window of source lines around the current position, ready for
/// display. `highlight` is the byte range of the active fragment within
/// the line, when it intersects it.
#[derive(Clone, Debug)]
pub struct SourceContext {
    pub address: Address,
    pub path: String,
    pub lines: Vec<ContextLine>,
    /// Index of the current line within `lines`.
    pub current: usize,
}

#[derive(Clone, Debug)]
pub struct ContextLine {
    /// 1-based line number.
    pub number: usize,
    pub text: String,
    pub highlight: Option<(usize, usize)>,
}

pub struct DebugSession {
    contracts: Vec<Arc<Contract>>,
    trace: Trace,
    chain: Box<dyn ChainAccess>,
    position: usize,
    bp_stack: Vec<i64>,
    contracts_stack: Vec<ContractFrame>,
    breakpoints: Vec<Breakpoint>,
}

impl DebugSession {
    pub fn new(
        contracts: Vec<Arc<Contract>>,
        trace: Trace,
        chain: Box<dyn ChainAccess>,
        entry: TxEntry,
    ) -> Result<Self> {
        let mut session = Self {
            contracts,
            trace,
            chain,
            position: 0,
            bp_stack: vec![-1],
            contracts_stack: Vec::new(),
            breakpoints: Vec::new(),
        };
        let frame = match entry {
            TxEntry::Call { to, code } => {
                let code = match code {
                    Some(code) => code,
                    None => session.chain.code_at(to)?,
                };
                ContractFrame {
                    address: to,
                    contract: session.find_by_runtime_code(&code)?,
                    is_init: false,
                }
            }
            TxEntry::Create { address, init_code } => ContractFrame {
                address,
                contract: session.find_by_init_code(&init_code)?,
                is_init: true,
            },
        };
        info!(address = %frame.address, contract = %frame.contract.name, init = frame.is_init,
            "debug session opened");
        session.contracts_stack.push(frame);
        Ok(session)
    }

    /// True once the trace is exhausted; every scan stops here and callers
    /// must check before inspecting the current position.
    pub fn is_ended(&self) -> bool {
        self.position >= self.trace.len()
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn current_step(&self) -> Result<&TraceStep> {
        self.trace.get(self.position).ok_or_else(|| eyre!("the trace has ended"))
    }

    pub fn current_frame(&self) -> Result<&ContractFrame> {
        self.contracts_stack.last().ok_or_else(|| eyre!("no active contract"))
    }

    /// Frame bases of the active function-call nesting levels; the last
    /// entry is the current frame's base.
    pub fn frame_bases(&self) -> &[i64] {
        &self.bp_stack
    }

    pub fn frame_base(&self) -> i64 {
        *self.bp_stack.last().unwrap_or(&-1)
    }

    pub fn breakpoints(&self) -> &[Breakpoint] {
        &self.breakpoints
    }

    /// Registers a breakpoint if `path` matches any loaded source file by
    /// substring. Returns the resolved breakpoint, or `None` when no
    /// source file matches.
    pub fn add_breakpoint(&mut self, path: &str, line: usize) -> Option<&Breakpoint> {
        let known = self
            .contracts
            .iter()
            .flat_map(|c| c.sources.paths.iter())
            .any(|p| p.contains(path));
        if !known {
            return None;
        }
        self.breakpoints.push(Breakpoint { path: path.to_string(), line });
        self.breakpoints.last()
    }

    pub fn remove_breakpoint(&mut self, index: usize) -> Option<Breakpoint> {
        (index < self.breakpoints.len()).then(|| self.breakpoints.remove(index))
    }

    /// Instruction index of the current program counter within the active
    /// bytecode body, if the counter maps to an instruction.
    pub fn current_instruction_index(&self) -> Option<usize> {
        let step = self.trace.get(self.position)?;
        let frame = self.contracts_stack.last()?;
        frame.contract.body(frame.is_init).instruction_index(step.pc)
    }

    /// Source fragment of the current instruction; the no-source sentinel
    /// when the trace has ended or the program counter has no instruction.
    pub fn current_fragment(&self) -> SourceFragment {
        match (self.trace.get(self.position), self.contracts_stack.last()) {
            (Some(step), Some(frame)) => frame.contract.body(frame.is_init).fragment_at(step.pc),
            _ => SourceFragment::NONE,
        }
    }

    pub fn current_source_path(&self) -> Option<&str> {
        let frag = self.current_fragment();
        if !frag.has_source() {
            return None;
        }
        let frame = self.contracts_stack.last()?;
        frame.contract.sources.paths.get(frag.file_index as usize).map(String::as_str)
    }

    /// 0-based line number of the current fragment's start.
    pub fn current_line(&self) -> Option<usize> {
        let frag = self.current_fragment();
        if !frag.has_source() {
            return None;
        }
        let frame = self.contracts_stack.last()?;
        frame.contract.sources.line_at(frag.file_index as usize, frag.start)
    }

    /// The function whose source span contains the current fragment.
    pub fn current_function(&self) -> Option<&Function> {
        let frag = self.current_fragment();
        if !frag.has_source() {
            return None;
        }
        self.contracts_stack.last()?.contract.function_at(frag.start)
    }

    /// Storage value for `slot`, preferring the trace's captured snapshot
    /// and falling back to the chain-access seam.
    pub fn get_storage(&self, slot: B256) -> Result<B256> {
        let step = self.current_step()?;
        if let Some(value) = step.storage_value(slot) {
            return Ok(value);
        }
        let address = self.current_frame()?.address;
        self.chain.storage_at(address, slot)
    }

    /// Moves one trace step forward, maintaining the frame-base stack
    /// (source-map jump markers) and the contract-invocation stack
    /// (call/create/halt opcodes) along the way.
    pub fn advance(&mut self) -> Result<()> {
        ensure!(!self.is_ended(), "the trace has ended");

        let frag = self.current_fragment();
        let step = self.trace.get(self.position).expect("position checked");
        let stack_height = step.stack_len() as i64;
        let op = step.op.clone();

        match frag.jump {
            // The word just below the pushed return area is the new
            // frame's base pointer.
            JumpKind::In => self.bp_stack.push(stack_height - 1),
            JumpKind::Out => {
                self.bp_stack.pop();
            }
            JumpKind::Regular => {}
        }

        match op.as_str() {
            "CALL" | "CALLCODE" | "DELEGATECALL" | "STATICCALL" => self.enter_call()?,
            "CREATE" | "CREATE2" => self.enter_create()?,
            "STOP" | "RETURN" => {
                if let Some(frame) = self.contracts_stack.pop() {
                    trace!(address = %frame.address, "leaving contract");
                    // Constructor execution never emits a matching `o`
                    // jump, so the frame entered at its `i` is still live.
                    if frame.is_init {
                        self.bp_stack.pop();
                    }
                }
            }
            _ => {}
        }

        self.position += 1;
        Ok(())
    }

    /// Advances to the next distinct, source-mapped fragment.
    pub fn step(&mut self) -> Result<()> {
        if self.is_ended() {
            return Ok(());
        }
        let start = self.current_fragment();
        while self.current_fragment().same_source(&start) || !self.current_fragment().has_source() {
            self.advance()?;
            if self.is_ended() {
                return Ok(());
            }
        }
        Ok(())
    }

    /// Like [`step`](Self::step), but steps over nested calls: keeps going
    /// until the frame-base depth is back at its starting value, and steps
    /// once more when landing exactly on a function-exit fragment.
    pub fn next(&mut self) -> Result<()> {
        let start_depth = self.bp_stack.len();
        loop {
            self.step()?;
            if self.is_ended() {
                return Ok(());
            }
            if self.bp_stack.len() == start_depth {
                if self.current_fragment().jump == JumpKind::Out {
                    self.step()?;
                }
                return Ok(());
            }
        }
    }

    /// Steps until the enclosing function has returned (frame-base depth
    /// exactly one less than at entry).
    pub fn stepout(&mut self) -> Result<()> {
        let start_depth = self.bp_stack.len();
        loop {
            self.step()?;
            if self.is_ended() {
                return Ok(());
            }
            if self.bp_stack.len() + 1 == start_depth {
                return Ok(());
            }
        }
    }

    /// Steps until a registered breakpoint's (file, line) matches, or the
    /// trace ends.
    pub fn continu(&mut self) -> Result<()> {
        loop {
            self.step()?;
            if self.is_ended() {
                return Ok(());
            }
            if self.at_breakpoint() {
                return Ok(());
            }
        }
    }

    fn at_breakpoint(&self) -> bool {
        let Some(path) = self.current_source_path() else { return false };
        let Some(line) = self.current_line() else { return false };
        self.breakpoints.iter().any(|bp| path.contains(&bp.path) && bp.line == line + 1)
    }

    fn enter_call(&mut self) -> Result<()> {
        let step = self.current_step()?;
        let callee = Address::from_word(step.stack_from_top(1)?);
        let code = self.chain.code_at(callee)?;
        let contract = self.find_by_runtime_code(&code)?;
        debug!(address = %callee, contract = %contract.name, "entering called contract");
        self.contracts_stack.push(ContractFrame { address: callee, contract, is_init: false });
        Ok(())
    }

    fn enter_create(&mut self) -> Result<()> {
        let step = self.current_step()?;
        let offset = word_to_usize(step.stack_from_top(1)?)?;
        let length = word_to_usize(step.stack_from_top(2)?)?;
        let memory = step.memory_bytes()?;
        let init_code = memory
            .get(offset..offset + length)
            .ok_or_else(|| eyre!("creation code is outside the recorded memory"))?
            .to_vec();
        let contract = self.find_by_init_code(&init_code)?;
        let address = self.scan_created_address()?;
        debug!(%address, contract = %contract.name, "entering created contract");
        self.contracts_stack.push(ContractFrame { address, contract, is_init: true });
        Ok(())
    }

    /// The created address only appears on the creator's stack after the
    /// constructor returns, so scan forward to the matching halt and read
    /// the following step's stack top.
    fn scan_created_address(&self) -> Result<Address> {
        let mut depth = 1i64;
        let mut i = self.position;
        loop {
            i += 1;
            let step = self
                .trace
                .get(i)
                .ok_or_else(|| eyre!("trace ended before the created contract returned"))?;
            match step.op.as_str() {
                "STOP" | "RETURN" => depth -= 1,
                "CALL" | "CALLCODE" | "DELEGATECALL" | "STATICCALL" | "CREATE" | "CREATE2" => {
                    depth += 1
                }
                _ => {}
            }
            if depth == 0 {
                break;
            }
        }
        let step = self
            .trace
            .get(i + 1)
            .ok_or_else(|| eyre!("trace ended before the created address was pushed"))?;
        Ok(Address::from_word(step.stack_from_top(0)?))
    }

    fn find_by_runtime_code(&self, code: &[u8]) -> Result<Arc<Contract>> {
        let stripped = strip_metadata(code);
        self.contracts
            .iter()
            .find(|c| strip_metadata(&c.runtime.code) == stripped)
            .cloned()
            .ok_or_else(|| eyre!("no loaded contract matches the deployed bytecode"))
    }

    fn find_by_init_code(&self, code: &[u8]) -> Result<Arc<Contract>> {
        let stripped = strip_metadata(code);
        self.contracts
            .iter()
            .find(|c| strip_metadata(&c.init.code) == stripped)
            .cloned()
            .ok_or_else(|| eyre!("no loaded contract matches the creation bytecode"))
    }

    /// Source lines around the current position, with the active fragment
    /// marked for highlighting.
    pub fn source_context(&self, around: usize) -> Option<SourceContext> {
        let frame = self.contracts_stack.last()?;
        let frag = self.current_fragment();
        if !frag.has_source() {
            return None;
        }
        let file = frag.file_index as usize;
        let sources = &frame.contract.sources;
        let lines = sources.texts.get(file)?;
        let offsets = sources.line_offsets.get(file)?;
        let path = sources.paths.get(file)?.clone();
        let line_num = self.current_line()?;

        let lo = line_num.saturating_sub(around);
        let hi = (line_num + around).min(lines.len().saturating_sub(1));
        let mut out = Vec::with_capacity(hi - lo + 1);
        let mut current = 0;
        for i in lo..=hi {
            let text = lines[i].clone();
            let len = text.len() as i64;
            let start = frag.start as i64 - offsets[i] as i64;
            let end = start + frag.length as i64;
            let highlight = if start >= 0 && end <= len {
                Some((start as usize, end as usize))
            } else if start >= 0 && start < len {
                Some((start as usize, len as usize))
            } else if end > 0 && end <= len {
                Some((0, end as usize))
            } else if start < 0 && end > len {
                Some((0, len as usize))
            } else {
                None
            };
            if i == line_num {
                current = out.len();
            }
            out.push(ContextLine { number: i + 1, text, highlight });
        }
        Some(SourceContext { address: frame.address, path, lines: out, current })
    }
}

fn word_to_usize(word: B256) -> Result<usize> {
    let value = U256::from_be_bytes(word.0);
    ensure!(value <= U256::from(usize::MAX), "value {value} does not fit a machine word");
    Ok(value.to::<usize>())
}
