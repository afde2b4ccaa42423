//! The recorded execution trace (`debug_traceTransaction`-shaped struct
//! logs) and the chain-access seam for state the trace did not capture.

use std::collections::HashMap;

use alloy_primitives::{Address, B256};
use eyre::{eyre, Result};
use serde::Deserialize;

/// One instruction-level step of the recorded trace.
///
/// Stack and memory are 32-byte words as unprefixed hex strings, the stack
/// bottom-to-top, exactly as the tracer emits them. `storage`, when
/// present, is the tracer's snapshot of slots touched up to this step.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceStep {
    pub pc: usize,
    pub op: String,
    /// Immediate argument for push-like opcodes, when the tracer records it.
    #[serde(default)]
    pub arg: Option<String>,
    #[serde(default)]
    pub stack: Vec<String>,
    #[serde(default)]
    pub memory: Vec<String>,
    #[serde(default)]
    pub storage: Option<HashMap<String, String>>,
}

impl TraceStep {
    pub fn stack_len(&self) -> usize {
        self.stack.len()
    }

    /// Stack word at absolute index `idx` (0 = bottom).
    pub fn stack_word(&self, idx: usize) -> Result<B256> {
        let word = self
            .stack
            .get(idx)
            .ok_or_else(|| eyre!("stack index {idx} out of range (height {})", self.stack.len()))?;
        parse_word(word)
    }

    /// Stack word `n` positions below the top (0 = top).
    pub fn stack_from_top(&self, n: usize) -> Result<B256> {
        let len = self.stack.len();
        let idx = len
            .checked_sub(n + 1)
            .ok_or_else(|| eyre!("stack too short: want {} below top, height {len}", n))?;
        self.stack_word(idx)
    }

    /// The 32-byte memory word containing byte address `addr`. Memory is
    /// zero-extended, so a word past the recorded end reads as zero.
    pub fn memory_word(&self, addr: usize) -> Result<B256> {
        match self.memory.get(addr / 32) {
            Some(word) => parse_word(word),
            None => Ok(B256::ZERO),
        }
    }

    /// All recorded memory as one contiguous byte string.
    pub fn memory_bytes(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.memory.len() * 32);
        for word in &self.memory {
            out.extend_from_slice(
                &hex::decode(word).map_err(|e| eyre!("malformed memory word: {e}"))?,
            );
        }
        Ok(out)
    }

    /// Captured storage value for `key`, if this step's snapshot has it.
    pub fn storage_value(&self, key: B256) -> Option<B256> {
        let map = self.storage.as_ref()?;
        let encoded = hex::encode(key);
        map.get(&encoded)
            .or_else(|| map.get(encoded.trim_start_matches('0')))
            .and_then(|v| parse_word(v).ok())
    }
}

fn parse_word(hex_str: &str) -> Result<B256> {
    let raw = hex::decode(hex_str.trim_start_matches("0x"))
        .map_err(|e| eyre!("malformed trace word `{hex_str}`: {e}"))?;
    if raw.len() > 32 {
        return Err(eyre!("trace word `{hex_str}` is wider than 32 bytes"));
    }
    Ok(B256::left_padding_from(&raw))
}

/// The full recorded trace of one transaction.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct Trace {
    #[serde(rename = "structLogs")]
    pub steps: Vec<TraceStep>,
}

impl Trace {
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn get(&self, idx: usize) -> Option<&TraceStep> {
        self.steps.get(idx)
    }
}

/// Chain state the trace did not capture: deployed code for contracts
/// entered via calls, and point-in-time storage (the block prior to the
/// debugged transaction) for slots missing from the per-step snapshots.
pub trait ChainAccess {
    fn code_at(&self, address: Address) -> Result<Vec<u8>>;

    fn storage_at(&self, address: Address, slot: B256) -> Result<B256>;
}

/// No chain available: code lookups fail, uncaptured storage reads as the
/// zero word (the value of any never-written slot).
#[derive(Clone, Copy, Debug, Default)]
pub struct NoChain;

impl ChainAccess for NoChain {
    fn code_at(&self, address: Address) -> Result<Vec<u8>> {
        Err(eyre!("no chain access to fetch code of {address}"))
    }

    fn storage_at(&self, _address: Address, _slot: B256) -> Result<B256> {
        Ok(B256::ZERO)
    }
}
