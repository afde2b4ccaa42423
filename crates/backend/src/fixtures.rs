//! Shared test fixtures: synthetic contracts, source maps, trace steps and
//! a canned chain.
//!
//! Fixture source files are made of identical lines so that byte offsets
//! are a simple multiple of the line number, and fixture bytecode is one
//! single-byte instruction per source-map record, so `pc` equals the
//! instruction index.

use std::sync::Arc;

use alloy_primitives::{Address, B256, U256};
use eyre::{eyre, Result};
use rustc_hash::FxHashMap;

use crate::{
    contract::{builder, BytecodeBody, Contract, Function, SourceSet, SourceSpan},
    stepper::{DebugSession, TxEntry},
    trace::{ChainAccess, Trace, TraceStep},
    types::Variable,
};

/// Every fixture source line is this text; line `n` starts at byte
/// `n * LINE_STRIDE`.
pub(crate) const LINE_TEXT: &str = "balance += 1;";
pub(crate) const LINE_STRIDE: usize = LINE_TEXT.len() + 1;
const FILE_LINES: usize = 40;

pub(crate) const ENTRY_ADDRESS: Address = Address::repeat_byte(0xaa);

/// A regular source-map record pointing at line `line` (0-based).
pub(crate) fn frag_record(line: usize) -> String {
    format!("{}:{}:0:-", line * LINE_STRIDE, LINE_TEXT.len())
}

/// An empty record: inherits the whole previous record.
pub(crate) fn same_record() -> String {
    String::new()
}

/// A function-entry (`i`) record on line `line`.
pub(crate) fn in_record(line: usize) -> String {
    format!("{}:{}:0:i", line * LINE_STRIDE, LINE_TEXT.len())
}

/// A function-exit (`o`) record on line `line`.
pub(crate) fn out_record(line: usize) -> String {
    format!("{}:{}:0:o", line * LINE_STRIDE, LINE_TEXT.len())
}

/// A one-byte opcode unique to the fixture contract's name, so that two
/// fixture contracts never share bytecode. Stays outside the PUSH range.
fn opcode_tag(name: &str) -> u8 {
    let tag = name.bytes().fold(0x01u8, |acc, b| acc.wrapping_mul(31).wrapping_add(b));
    if (0x60..0x80).contains(&tag) {
        tag ^ 0x80
    } else {
        tag
    }
}

fn fixture_body(name: &str, srcmap: &str) -> BytecodeBody {
    let srcmap = builder::decode_srcmap(srcmap).expect("fixture source map");
    let mut code = vec![0x5b; srcmap.len().max(1)];
    code[0] = opcode_tag(name);
    BytecodeBody { pc_to_idx: builder::ops_mapping(&code), srcmap, code }
}

pub(crate) fn fixture_contract(srcmap: &str) -> Arc<Contract> {
    fixture_contract_named("Foo", srcmap)
}

pub(crate) fn fixture_contract_named(name: &str, srcmap: &str) -> Arc<Contract> {
    fixture_contract_full(name, srcmap, Vec::new(), Vec::new())
}

/// A contract named `name` with source file `<name>.sol`, the given
/// functions and storage variables, and identical init/runtime bodies
/// decoded from `srcmap`.
pub(crate) fn fixture_contract_full(
    name: &str,
    srcmap: &str,
    functions: Vec<Function>,
    variables: Vec<Variable>,
) -> Arc<Contract> {
    let sources = Arc::new(SourceSet::new(
        vec![format!("{name}.sol")],
        vec![vec![LINE_TEXT.to_string(); FILE_LINES]],
    ));
    let span = SourceSpan { start: 0, length: FILE_LINES * LINE_STRIDE, file: 0 };
    Arc::new(Contract::assemble(
        name.to_string(),
        span,
        functions,
        variables,
        fixture_body(name, srcmap),
        fixture_body(name, srcmap),
        sources,
    ))
}

/// A function spanning the whole fixture source file, so it encloses every
/// source-mapped fragment.
pub(crate) fn fixture_function(
    name: &str,
    params: Vec<Variable>,
    returns: Vec<Variable>,
    locals: Vec<Variable>,
    return_count: usize,
) -> Function {
    let span = SourceSpan { start: 0, length: FILE_LINES * LINE_STRIDE, file: 0 };
    Function::new(name.to_string(), span, params, returns, locals, return_count)
}

pub(crate) fn plain_step(pc: usize) -> TraceStep {
    TraceStep { pc, op: "JUMPDEST".to_string(), ..Default::default() }
}

pub(crate) fn step_with_stack(pc: usize, values: &[u64]) -> TraceStep {
    TraceStep {
        pc,
        op: "JUMPDEST".to_string(),
        stack: values.iter().map(|&v| word(v)).collect(),
        ..Default::default()
    }
}

/// A 32-byte word as the unprefixed hex string the tracer emits.
pub(crate) fn word(value: u64) -> String {
    hex::encode(B256::from(U256::from(value)))
}

pub(crate) fn addr_word(address: Address) -> String {
    hex::encode(address.into_word())
}

/// Right-pads `code` to whole 32-byte memory words.
pub(crate) fn pad_word(code: &[u8]) -> Vec<u8> {
    let mut out = code.to_vec();
    out.resize(code.len().div_ceil(32).max(1) * 32, 0);
    out
}

pub(crate) fn fixture_session(contract: Arc<Contract>, steps: Vec<TraceStep>) -> DebugSession {
    fixture_session_with_chain(vec![contract], steps, Box::new(TestChain::default()))
}

/// A session entered as a message call to the first contract.
pub(crate) fn fixture_session_with_chain(
    contracts: Vec<Arc<Contract>>,
    steps: Vec<TraceStep>,
    chain: Box<dyn ChainAccess>,
) -> DebugSession {
    let code = contracts[0].runtime.code.clone();
    DebugSession::new(
        contracts,
        Trace { steps },
        chain,
        TxEntry::Call { to: ENTRY_ADDRESS, code: Some(code) },
    )
    .expect("fixture session")
}

/// In-memory chain state for tests: canned code per address, canned
/// storage per slot (shared across addresses), zero for everything else.
#[derive(Debug, Default)]
pub(crate) struct TestChain {
    code: FxHashMap<Address, Vec<u8>>,
    storage: FxHashMap<B256, B256>,
}

impl TestChain {
    pub(crate) fn with_code(address: Address, code: Vec<u8>) -> Self {
        let mut chain = Self::default();
        chain.code.insert(address, code);
        chain
    }

    #[allow(dead_code)]
    pub(crate) fn with_storage(entries: impl IntoIterator<Item = (B256, B256)>) -> Self {
        let mut chain = Self::default();
        chain.storage.extend(entries);
        chain
    }
}

impl ChainAccess for TestChain {
    fn code_at(&self, address: Address) -> Result<Vec<u8>> {
        self.code.get(&address).cloned().ok_or_else(|| eyre!("no code recorded for {address}"))
    }

    fn storage_at(&self, _address: Address, slot: B256) -> Result<B256> {
        Ok(self.storage.get(&slot).copied().unwrap_or(B256::ZERO))
    }
}
