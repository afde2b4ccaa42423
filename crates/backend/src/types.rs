//! The value-type model shared by the layout builder and the evaluator.
//!
//! Every type has a storage size in bits. Sizes of elementary types are
//! fixed; struct and fixed-array sizes are derived by the storage packing
//! algorithm when the contract model is built and memoized in the type
//! itself, so the evaluator never recomputes a layout.

use std::sync::Arc;

/// A 256-bit VM word, in bits.
pub const WORD_BITS: usize = 256;

/// Where the bytes of a reference-typed variable live.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum DataLocation {
    /// Stack-only elementary value, or a parameter/local that has not been
    /// classified by the compiler's type descriptor.
    #[default]
    None,
    Memory,
    Storage,
}

/// A struct definition with its storage layout fully assigned: each field
/// carries a slot-relative location and bit offset, and the total size is
/// rounded up to whole slots.
#[derive(Debug, PartialEq, Eq)]
pub struct StructLayout {
    pub name: String,
    pub fields: Vec<Variable>,
    /// Total storage footprint in bits, a multiple of 256.
    pub size: usize,
}

impl StructLayout {
    pub fn field(&self, name: &str) -> Option<(usize, &Variable)> {
        self.fields.iter().enumerate().find(|(_, f)| f.name == name)
    }
}

/// The closed set of value types the debugger understands.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ValueType {
    /// Signed integer of the given bit width.
    Int(usize),
    /// Unsigned integer of the given bit width.
    Uint(usize),
    Bool,
    Address,
    /// `bytesN`, width in bits.
    FixedBytes(usize),
    Bytes,
    String,
    Struct(Arc<StructLayout>),
    FixedArray {
        elem: Box<ValueType>,
        len: usize,
        /// Total storage footprint in bits, a multiple of 256.
        size: usize,
    },
    Array(Box<ValueType>),
    Map {
        key: Box<ValueType>,
        value: Box<ValueType>,
    },
    /// A reference to another contract; decodes like an address.
    ContractRef,
}

impl ValueType {
    /// Storage size in bits. A multiple of 256 for everything but
    /// sub-word elementary types.
    pub fn bits(&self) -> usize {
        match self {
            Self::Int(bits) | Self::Uint(bits) | Self::FixedBytes(bits) => *bits,
            Self::Bool => 8,
            Self::Address | Self::ContractRef => 160,
            Self::Bytes | Self::String | Self::Array(_) | Self::Map { .. } => WORD_BITS,
            Self::Struct(layout) => layout.size,
            Self::FixedArray { size, .. } => *size,
        }
    }

    /// True for types that decode directly from a single word; reference
    /// types store a pointer or a composite layout instead.
    pub fn is_elementary(&self) -> bool {
        matches!(
            self,
            Self::Int(_) |
                Self::Uint(_) |
                Self::Bool |
                Self::Address |
                Self::FixedBytes(_) |
                Self::ContractRef
        )
    }
}

/// A named, typed slot in some location: a contract storage variable, a
/// struct field, or a function parameter/local/return value.
///
/// `location` is a storage slot index relative to the enclosing layout for
/// storage variables and struct fields, and a declaration ordinal for
/// function variables (the stepper turns ordinals into absolute stack slots
/// using the active frame base).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Variable {
    pub name: String,
    pub ty: ValueType,
    pub location: i64,
    /// Bit offset within the slot, 0..=255.
    pub offset: usize,
    pub data_location: DataLocation,
}

impl Variable {
    pub fn new(name: impl Into<String>, ty: ValueType) -> Self {
        Self { name: name.into(), ty, location: 0, offset: 0, data_location: DataLocation::None }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn elementary_sizes() {
        assert_eq!(ValueType::Uint(128).bits(), 128);
        assert_eq!(ValueType::Int(8).bits(), 8);
        assert_eq!(ValueType::Bool.bits(), 8);
        assert_eq!(ValueType::Address.bits(), 160);
        assert_eq!(ValueType::ContractRef.bits(), 160);
        assert_eq!(ValueType::FixedBytes(32 * 8).bits(), 256);
    }

    #[test]
    fn reference_types_occupy_one_word() {
        assert_eq!(ValueType::Bytes.bits(), 256);
        assert_eq!(ValueType::String.bits(), 256);
        assert_eq!(ValueType::Array(Box::new(ValueType::Uint(8))).bits(), 256);
        let map = ValueType::Map {
            key: Box::new(ValueType::Uint(256)),
            value: Box::new(ValueType::Bool),
        };
        assert_eq!(map.bits(), 256);
    }
}
