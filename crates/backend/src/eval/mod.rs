//! The on-demand value evaluator.
//!
//! An expression is resolved against the current trace position: the base
//! name is looked up as a function parameter, local, named return value or
//! contract storage variable (in that order) and mapped to a VM location,
//! then the remaining bracket and dot accesses navigate the typed layout,
//! and the final location is decoded into a [`Value`].
//!
//! Parameters, locals and returns live at stack slots computed from the
//! active frame base; reference types on the stack hold a pointer into
//! memory or storage and are followed before navigation. Dynamic-array and
//! mapping elements in storage are addressed by keccak-256 anchoring.

pub mod expr;
pub mod value;

use alloy_primitives::{keccak256, Address, B256, I256, U256};

use crate::{
    error::EvalError,
    stepper::DebugSession,
    types::{DataLocation, ValueType, Variable, WORD_BITS},
};
use expr::{Expr, Literal};
use value::Value;

/// One navigation step of an expression: `[index]` or `.field`.
enum Access<'e> {
    Index(&'e Expr),
    Field(&'e str),
}

impl DebugSession {
    /// Parses `input` and evaluates it against the current trace position.
    ///
    /// All failures are recoverable: the session and the current position
    /// stay valid afterwards.
    pub fn evaluate(&self, input: &str) -> Result<Value, EvalError> {
        let expr = Expr::parse(input)?;
        self.eval_expr(&expr)
    }

    fn eval_expr(&self, expr: &Expr) -> Result<Value, EvalError> {
        let (base, path) = flatten(expr);
        match base {
            Expr::Name(name) => self.eval_name(name, &path),
            Expr::Literal(literal) if path.is_empty() => Ok(literal_value(literal)),
            _ => Err(EvalError::failed("a literal can not be indexed")),
        }
    }

    /// Resolution order: function parameter, local, named return value,
    /// then contract storage variable; first match wins.
    fn eval_name(&self, name: &str, path: &[Access<'_>]) -> Result<Value, EvalError> {
        if let Some(function) = self.current_function() {
            // Top-level execution has no recorded frame base; by the
            // calling convention the first parameter then sits at slot 2.
            let bp = match self.frame_base() {
                -1 => function.params.len() as i64 + 2,
                bp => bp,
            };
            if let Some(var) = function.param(name) {
                let slot = bp - function.params.len() as i64 + var.location;
                return self.eval_stack(var, slot, path);
            }
            if let Some(var) = function.local(name) {
                let slot = bp + var.location + function.return_count as i64;
                return self.eval_stack(var, slot, path);
            }
            if let Some(var) = function.return_var(name) {
                return self.eval_stack(var, bp + var.location, path);
            }
        }
        let frame = self.current_frame().map_err(eval_failed)?;
        match frame.contract.storage_variable(name) {
            Some(var) => {
                self.eval_storage(&var.ty, U256::from(var.location.max(0) as u64), var.offset, path)
            }
            None => Err(EvalError::failed(format!("unknown identifier `{name}`"))),
        }
    }

    fn eval_stack(
        &self,
        var: &Variable,
        slot: i64,
        path: &[Access<'_>],
    ) -> Result<Value, EvalError> {
        let step = self.current_step().map_err(eval_failed)?;
        if slot < 0 {
            return Err(EvalError::failed(format!("`{}` resolves below the stack", var.name)));
        }
        if slot as usize >= step.stack_len() {
            return Err(EvalError::VarNotYetInitialized);
        }
        let word = step.stack_word(slot as usize).map_err(eval_failed)?;
        if var.ty.is_elementary() {
            ensure_leaf(path)?;
            return Ok(decode_elementary(&var.ty, word.as_slice()));
        }
        // A reference type on the stack holds a pointer into memory or
        // storage.
        let pointer = U256::from_be_bytes(word.0);
        match var.data_location {
            DataLocation::Memory => self.eval_memory(&var.ty, to_usize(pointer)?, path),
            DataLocation::Storage => self.eval_storage(&var.ty, pointer, 0, path),
            DataLocation::None => {
                Err(EvalError::failed(format!("`{}` has no data location", var.name)))
            }
        }
    }

    /// Memory aggregates are flat word sequences: one word per element or
    /// field, a length word first for dynamic arrays, strings and bytes.
    fn eval_memory(
        &self,
        ty: &ValueType,
        addr: usize,
        path: &[Access<'_>],
    ) -> Result<Value, EvalError> {
        match ty {
            ValueType::Int(_) |
            ValueType::Uint(_) |
            ValueType::Bool |
            ValueType::Address |
            ValueType::FixedBytes(_) |
            ValueType::ContractRef => {
                ensure_leaf(path)?;
                Ok(decode_elementary(ty, self.memory_word(addr)?.as_slice()))
            }
            ValueType::String | ValueType::Bytes => {
                ensure_leaf(path)?;
                let length = to_usize(U256::from_be_bytes(self.memory_word(addr)?.0))?;
                let mut data = Vec::with_capacity(length);
                for i in 0..length.div_ceil(32) {
                    let word = self.memory_word(addr + (i + 1) * 32)?;
                    let take = (length - i * 32).min(32);
                    data.extend_from_slice(&word[..take]);
                }
                Ok(bytes_value(ty, data))
            }
            ValueType::FixedArray { elem, len, .. } => match path.split_first() {
                Some((Access::Index(index), rest)) => {
                    let idx = self.index_of(index, *len)?;
                    self.eval_memory_slot(elem, addr + idx * 32, rest)
                }
                Some((Access::Field(_), _)) => Err(not_a_struct()),
                None => {
                    let mut items = Vec::with_capacity(*len);
                    for i in 0..*len {
                        items.push(self.eval_memory_slot(elem, addr + i * 32, &[])?);
                    }
                    Ok(Value::Array(items))
                }
            },
            ValueType::Array(elem) => {
                let length = to_usize(U256::from_be_bytes(self.memory_word(addr)?.0))?;
                match path.split_first() {
                    Some((Access::Index(index), rest)) => {
                        let idx = self.index_of(index, length)?;
                        self.eval_memory_slot(elem, addr + (idx + 1) * 32, rest)
                    }
                    Some((Access::Field(_), _)) => Err(not_a_struct()),
                    None => {
                        let mut items = Vec::with_capacity(length);
                        for i in 0..length {
                            items.push(self.eval_memory_slot(elem, addr + (i + 1) * 32, &[])?);
                        }
                        Ok(Value::Array(items))
                    }
                }
            }
            ValueType::Struct(layout) => match path.split_first() {
                Some((Access::Field(name), rest)) => {
                    let (i, field) = layout.field(name).ok_or_else(|| {
                        EvalError::failed(format!("no field `{name}` on `{}`", layout.name))
                    })?;
                    self.eval_memory_slot(&field.ty, addr + i * 32, rest)
                }
                Some((Access::Index(_), _)) => Err(not_indexable()),
                None => {
                    let mut fields = Vec::with_capacity(layout.fields.len());
                    for (i, field) in layout.fields.iter().enumerate() {
                        let value = self.eval_memory_slot(&field.ty, addr + i * 32, &[])?;
                        fields.push((field.name.clone(), value));
                    }
                    Ok(Value::Struct(fields))
                }
            },
            ValueType::Map { .. } => Err(EvalError::failed("mappings live in storage only")),
        }
    }

    /// A word in a memory aggregate holds the value itself for elementary
    /// elements and a pointer to the element's own layout otherwise.
    fn eval_memory_slot(
        &self,
        ty: &ValueType,
        word_addr: usize,
        path: &[Access<'_>],
    ) -> Result<Value, EvalError> {
        if ty.is_elementary() {
            self.eval_memory(ty, word_addr, path)
        } else {
            let pointer = to_usize(U256::from_be_bytes(self.memory_word(word_addr)?.0))?;
            self.eval_memory(ty, pointer, path)
        }
    }

    fn eval_storage(
        &self,
        ty: &ValueType,
        slot: U256,
        offset: usize,
        path: &[Access<'_>],
    ) -> Result<Value, EvalError> {
        match ty {
            ValueType::Int(_) |
            ValueType::Uint(_) |
            ValueType::Bool |
            ValueType::Address |
            ValueType::FixedBytes(_) |
            ValueType::ContractRef => {
                ensure_leaf(path)?;
                Ok(decode_packed(ty, self.storage_word(slot)?, offset))
            }
            ValueType::String | ValueType::Bytes => {
                ensure_leaf(path)?;
                self.storage_bytes(ty, slot)
            }
            ValueType::FixedArray { elem, len, .. } => match path.split_first() {
                Some((Access::Index(index), rest)) => {
                    let idx = self.index_of(index, *len)?;
                    let (rel, off) = element_position(elem, idx);
                    self.eval_storage(elem, slot.wrapping_add(rel), off, rest)
                }
                Some((Access::Field(_), _)) => Err(not_a_struct()),
                None => {
                    let mut items = Vec::with_capacity(*len);
                    for i in 0..*len {
                        let (rel, off) = element_position(elem, i);
                        items.push(self.eval_storage(elem, slot.wrapping_add(rel), off, &[])?);
                    }
                    Ok(Value::Array(items))
                }
            },
            ValueType::Array(elem) => {
                let length = to_usize(U256::from_be_bytes(self.storage_word(slot)?.0))?;
                let base = U256::from_be_bytes(keccak256(B256::from(slot)).0);
                match path.split_first() {
                    Some((Access::Index(index), rest)) => {
                        let idx = self.index_of(index, length)?;
                        let (rel, off) = element_position(elem, idx);
                        self.eval_storage(elem, base.wrapping_add(rel), off, rest)
                    }
                    Some((Access::Field(_), _)) => Err(not_a_struct()),
                    None => {
                        let mut items = Vec::with_capacity(length);
                        for i in 0..length {
                            let (rel, off) = element_position(elem, i);
                            items.push(self.eval_storage(elem, base.wrapping_add(rel), off, &[])?);
                        }
                        Ok(Value::Array(items))
                    }
                }
            }
            ValueType::Map { key, value } => match path.split_first() {
                Some((Access::Index(index), rest)) => {
                    let mut preimage = self.encode_map_key(key, index)?;
                    preimage.extend_from_slice(&slot.to_be_bytes::<32>());
                    let entry = U256::from_be_bytes(keccak256(&preimage).0);
                    self.eval_storage(value, entry, 0, rest)
                }
                Some((Access::Field(_), _)) => {
                    Err(EvalError::failed("a mapping is indexed with `[key]`"))
                }
                None => Ok(Value::Mapping),
            },
            ValueType::Struct(layout) => match path.split_first() {
                Some((Access::Field(name), rest)) => {
                    let (_, field) = layout.field(name).ok_or_else(|| {
                        EvalError::failed(format!("no field `{name}` on `{}`", layout.name))
                    })?;
                    let slot = slot.wrapping_add(U256::from(field.location.max(0) as u64));
                    self.eval_storage(&field.ty, slot, field.offset, rest)
                }
                Some((Access::Index(_), _)) => Err(not_indexable()),
                None => {
                    let mut fields = Vec::with_capacity(layout.fields.len());
                    for field in &layout.fields {
                        let slot = slot.wrapping_add(U256::from(field.location.max(0) as u64));
                        let value = self.eval_storage(&field.ty, slot, field.offset, &[])?;
                        fields.push((field.name.clone(), value));
                    }
                    Ok(Value::Struct(fields))
                }
            },
        }
    }

    /// Strings and bytes in storage: content under 32 bytes is packed
    /// left-aligned into the slot itself with `2 * len` in the low byte;
    /// longer content sets the low bit, stores `2 * len + 1` in the slot
    /// and the data in consecutive words from `keccak256(slot)`.
    fn storage_bytes(&self, ty: &ValueType, slot: U256) -> Result<Value, EvalError> {
        let word = self.storage_word(slot)?;
        let marker = U256::from_be_bytes(word.0);
        let data = if marker.bit(0) {
            let length = to_usize((marker - U256::from(1u8)) >> 1)?;
            let base = U256::from_be_bytes(keccak256(B256::from(slot)).0);
            let mut data = Vec::with_capacity(length);
            for i in 0..length.div_ceil(32) {
                let word = self.storage_word(base.wrapping_add(U256::from(i as u64)))?;
                let take = (length - i * 32).min(32);
                data.extend_from_slice(&word[..take]);
            }
            data
        } else {
            let length = (word[31] / 2) as usize;
            word[..length.min(32)].to_vec()
        };
        Ok(bytes_value(ty, data))
    }

    /// Evaluates an index expression to an array position and bounds-checks
    /// it against the known length.
    fn index_of(&self, index: &Expr, length: usize) -> Result<usize, EvalError> {
        let idx = match self.eval_expr(index)? {
            Value::Uint(v) => to_usize(v)?,
            Value::Int(v) if !v.is_negative() => to_usize(v.unsigned_abs())?,
            Value::Bytes(raw) if raw.len() <= 32 => to_usize(U256::from_be_slice(&raw))?,
            _ => return Err(EvalError::failed("an array index must be an unsigned integer")),
        };
        if idx >= length {
            return Err(EvalError::failed(format!("index {idx} out of range (length {length})")));
        }
        Ok(idx)
    }

    /// Canonical key-byte encoding, directed by the declared key type.
    /// Every supported key type has exactly one encoding; anything else is
    /// rejected rather than guessed at.
    fn encode_map_key(&self, key_ty: &ValueType, index: &Expr) -> Result<Vec<u8>, EvalError> {
        if let Expr::Literal(literal) = index {
            return encode_literal_key(key_ty, literal);
        }
        encode_value_key(key_ty, &self.eval_expr(index)?)
    }

    fn storage_word(&self, slot: U256) -> Result<B256, EvalError> {
        self.get_storage(B256::from(slot)).map_err(eval_failed)
    }

    fn memory_word(&self, addr: usize) -> Result<B256, EvalError> {
        self.current_step().map_err(eval_failed)?.memory_word(addr).map_err(eval_failed)
    }
}

fn flatten(expr: &Expr) -> (&Expr, Vec<Access<'_>>) {
    let mut path = Vec::new();
    let mut base = expr;
    loop {
        match base {
            Expr::Field(inner, name) => {
                path.push(Access::Field(name));
                base = inner;
            }
            Expr::Index(inner, index) => {
                path.push(Access::Index(index));
                base = inner;
            }
            _ => break,
        }
    }
    path.reverse();
    (base, path)
}

fn literal_value(literal: &Literal) -> Value {
    match literal {
        Literal::Uint(v) => Value::Uint(*v),
        Literal::Hex(raw) => Value::Bytes(raw.clone()),
        Literal::Str(s) => Value::Str(s.clone()),
        Literal::Bool(v) => Value::Bool(*v),
    }
}

fn encode_literal_key(key_ty: &ValueType, literal: &Literal) -> Result<Vec<u8>, EvalError> {
    match (key_ty, literal) {
        (ValueType::String, Literal::Str(s)) => Ok(s.as_bytes().to_vec()),
        (ValueType::Int(_) | ValueType::Uint(_), Literal::Uint(v)) => {
            Ok(v.to_be_bytes::<32>().to_vec())
        }
        (ValueType::Int(_) | ValueType::Uint(_), Literal::Hex(raw)) => pad_key(raw),
        (ValueType::Address, Literal::Hex(raw)) if raw.len() == 20 => pad_key(raw),
        (ValueType::Bool, Literal::Bool(v)) => Ok(U256::from(*v as u8).to_be_bytes::<32>().to_vec()),
        (ValueType::Bytes, Literal::Hex(raw)) => Ok(raw.clone()),
        _ => Err(EvalError::failed("the key does not match the mapping's key type")),
    }
}

fn encode_value_key(key_ty: &ValueType, value: &Value) -> Result<Vec<u8>, EvalError> {
    match (key_ty, value) {
        (ValueType::String, Value::Str(s)) => Ok(s.as_bytes().to_vec()),
        (ValueType::Int(_) | ValueType::Uint(_), Value::Uint(v)) => {
            Ok(v.to_be_bytes::<32>().to_vec())
        }
        (ValueType::Int(_), Value::Int(v)) => Ok(v.to_be_bytes::<32>().to_vec()),
        (ValueType::Address, Value::Address(a)) => pad_key(a.as_slice()),
        (ValueType::Bool, Value::Bool(v)) => Ok(U256::from(*v as u8).to_be_bytes::<32>().to_vec()),
        (ValueType::Bytes, Value::Bytes(raw)) => Ok(raw.clone()),
        _ => Err(EvalError::failed("the key does not match the mapping's key type")),
    }
}

/// Left-zero-pads a short key into one 32-byte word.
fn pad_key(raw: &[u8]) -> Result<Vec<u8>, EvalError> {
    if raw.len() > 32 {
        return Err(EvalError::failed("the key is wider than 32 bytes"));
    }
    let mut out = vec![0u8; 32 - raw.len()];
    out.extend_from_slice(raw);
    Ok(out)
}

/// Slot-relative location and bit offset of array element `idx`: sub-word
/// elements pack several per slot, word-or-larger elements take whole
/// slots each.
fn element_position(elem: &ValueType, idx: usize) -> (U256, usize) {
    let bits = elem.bits();
    if bits < WORD_BITS {
        let per_slot = WORD_BITS / bits;
        (U256::from((idx / per_slot) as u64), (idx % per_slot) * bits)
    } else {
        (U256::from((idx * (bits / WORD_BITS)) as u64), 0)
    }
}

/// Decodes an elementary value from its big-endian bytes: a full word for
/// stack and memory reads, the extracted field for packed storage.
fn decode_elementary(ty: &ValueType, data: &[u8]) -> Value {
    match ty {
        ValueType::Int(_) => Value::Int(decode_int(data)),
        ValueType::Uint(_) => Value::Uint(U256::from_be_slice(data)),
        ValueType::Bool => Value::Bool(data.iter().any(|&b| b != 0)),
        ValueType::Address | ValueType::ContractRef => {
            Value::Address(Address::from_word(B256::left_padding_from(data)))
        }
        ValueType::FixedBytes(bits) => {
            let width = (bits / 8).min(data.len());
            Value::Bytes(data[..width].to_vec())
        }
        _ => Value::Bytes(data.to_vec()),
    }
}

fn decode_int(data: &[u8]) -> I256 {
    let negative = data.first().is_some_and(|b| b & 0x80 != 0);
    let mut word = [if negative { 0xff } else { 0 }; 32];
    word[32 - data.len()..].copy_from_slice(data);
    I256::from_raw(U256::from_be_bytes(word))
}

/// Extracts an elementary value packed at `offset` bits from the slot's
/// low end and decodes it at its declared width.
fn decode_packed(ty: &ValueType, word: B256, offset: usize) -> Value {
    let bits = ty.bits().min(WORD_BITS);
    let mut value = U256::from_be_bytes(word.0) >> offset;
    if bits < WORD_BITS {
        value &= (U256::from(1u8) << bits) - U256::from(1u8);
    }
    let bytes = value.to_be_bytes::<32>();
    decode_elementary(ty, &bytes[32 - bits / 8..])
}

fn bytes_value(ty: &ValueType, data: Vec<u8>) -> Value {
    match ty {
        ValueType::String => Value::Str(String::from_utf8_lossy(&data).into_owned()),
        _ => Value::Bytes(data),
    }
}

fn ensure_leaf(path: &[Access<'_>]) -> Result<(), EvalError> {
    if path.is_empty() {
        Ok(())
    } else {
        Err(EvalError::failed("the value can not be indexed further"))
    }
}

fn not_a_struct() -> EvalError {
    EvalError::failed("the value has no fields")
}

fn not_indexable() -> EvalError {
    EvalError::failed("a struct is accessed by field, not by index")
}

fn to_usize(value: U256) -> Result<usize, EvalError> {
    usize::try_from(value).map_err(|_| EvalError::failed("value does not fit a machine word"))
}

fn eval_failed(err: eyre::Report) -> EvalError {
    EvalError::EvalFailed(err.to_string())
}
