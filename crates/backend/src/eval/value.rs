//! Decoded values, rendered the way the REPL prints them.

use std::fmt;

use alloy_primitives::{Address, I256, U256};

/// The result of evaluating an expression against the current VM state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Value {
    Int(I256),
    Uint(U256),
    Bool(bool),
    Address(Address),
    Bytes(Vec<u8>),
    Str(String),
    Array(Vec<Value>),
    /// Struct fields in declaration order.
    Struct(Vec<(String, Value)>),
    /// Mappings cannot be enumerated from storage; only their entries can
    /// be evaluated.
    Mapping,
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Uint(v) => write!(f, "{v}"),
            Self::Bool(v) => write!(f, "{v}"),
            Self::Address(v) => write!(f, "0x{}", hex::encode(v)),
            Self::Bytes(v) => write!(f, "0x{}", hex::encode(v)),
            Self::Str(v) => f.write_str(v),
            Self::Array(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
            Self::Struct(fields) => {
                f.write_str("{")?;
                for (i, (name, value)) in fields.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{name}: {value}")?;
                }
                f.write_str("}")
            }
            Self::Mapping => f.write_str("<mapping>"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_formats() {
        assert_eq!(Value::Uint(U256::from(42)).to_string(), "42");
        assert_eq!(Value::Int(I256::unchecked_from(-7)).to_string(), "-7");
        assert_eq!(Value::Bool(true).to_string(), "true");
        assert_eq!(
            Value::Address(Address::repeat_byte(0xab)).to_string(),
            "0xabababababababababababababababababababab"
        );
        assert_eq!(Value::Bytes(vec![0xde, 0xad]).to_string(), "0xdead");
        assert_eq!(Value::Str("hi".to_string()).to_string(), "hi");
        assert_eq!(
            Value::Array(vec![Value::Uint(U256::from(1)), Value::Uint(U256::from(2))]).to_string(),
            "[1, 2]"
        );
        assert_eq!(
            Value::Struct(vec![
                ("a".to_string(), Value::Uint(U256::from(1))),
                ("b".to_string(), Value::Mapping),
            ])
            .to_string(),
            "{a: 1, b: <mapping>}"
        );
    }
}
