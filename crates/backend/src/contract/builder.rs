//! AST + bytecode + source map into the immutable contract model.
//!
//! The builder walks the linearized contract ASTs base-first (so inherited
//! storage variables take the lower slots), resolves compiler type
//! descriptors into [`ValueType`]s, assigns storage slots, and decodes the
//! per-instruction source maps and the pc-to-instruction-index table.

use std::sync::Arc;

use eyre::{bail, ensure, eyre, Result, WrapErr};
use rustc_hash::FxHashMap;

use crate::{
    artifact::{ast::AstNode, ContractEntry},
    contract::{
        metadata_start, BytecodeBody, Contract, Function, JumpKind, SourceFragment, SourceSet,
    },
    types::{DataLocation, StructLayout, ValueType, Variable, WORD_BITS},
};

pub struct ContractBuilder<'a> {
    name: String,
    /// Linearized contract definitions, base-first.
    asts: Vec<&'a AstNode>,
    sources: Arc<SourceSet>,
    struct_asts: FxHashMap<String, &'a AstNode>,
    structs: FxHashMap<String, Arc<StructLayout>>,
    /// Struct names currently being laid out, for cycle detection.
    resolving: Vec<String>,
}

impl<'a> ContractBuilder<'a> {
    pub fn new(name: &str, asts: Vec<&'a AstNode>, sources: Arc<SourceSet>) -> Self {
        Self {
            name: name.to_string(),
            asts,
            sources,
            struct_asts: FxHashMap::default(),
            structs: FxHashMap::default(),
            resolving: Vec::new(),
        }
    }

    pub fn build(mut self, entry: &ContractEntry) -> Result<Contract> {
        self.collect_struct_asts();

        // The most-derived definition carries the contract's own span.
        let src = self
            .asts
            .last()
            .ok_or_else(|| eyre!("contract `{}` has no AST", self.name))?
            .span()?;

        let mut functions = Vec::new();
        let mut variables = Vec::new();
        for ast in self.asts.clone() {
            for child in &ast.children {
                match child.name.as_str() {
                    "FunctionDefinition" => functions.push(self.parse_function(child)?),
                    "VariableDeclaration" if !child.attr_bool("constant") => {
                        variables.push(self.parse_variable(child)?)
                    }
                    _ => {}
                }
            }
        }
        assign_slots(&mut variables);

        let init = decode_body(&entry.bin, &entry.srcmap)
            .wrap_err_with(|| format!("bad init bytecode for `{}`", self.name))?;
        let runtime = decode_body(&entry.bin_runtime, &entry.srcmap_runtime)
            .wrap_err_with(|| format!("bad runtime bytecode for `{}`", self.name))?;

        Ok(Contract::assemble(self.name, src, functions, variables, init, runtime, self.sources))
    }

    fn collect_struct_asts(&mut self) {
        for ast in &self.asts {
            for child in &ast.children {
                if child.name == "StructDefinition" {
                    if let Some(name) = child.attr_str("name") {
                        self.struct_asts.insert(name.to_string(), child);
                    }
                }
            }
        }
    }

    fn parse_variable(&mut self, node: &AstNode) -> Result<Variable> {
        let name = node.attr_str("name").unwrap_or_default().to_string();
        let descriptor = node
            .attr_str("type")
            .ok_or_else(|| eyre!("variable `{name}` has no type descriptor"))?
            .to_string();
        let ty = self.parse_type(&descriptor)?;
        Ok(Variable { name, ty, location: 0, offset: 0, data_location: DataLocation::None })
    }

    /// A parameter, local, or return variable; the type descriptor's
    /// location keywords decide where a reference type's bytes live.
    fn parse_function_variable(&mut self, node: &AstNode) -> Result<Variable> {
        let descriptor = node.attr_str("type").unwrap_or_default();
        let data_location = if descriptor.contains("memory") {
            DataLocation::Memory
        } else if descriptor.contains("storage") {
            DataLocation::Storage
        } else {
            DataLocation::None
        };
        let mut var = self.parse_variable(node)?;
        var.data_location = data_location;
        Ok(var)
    }

    /// Parses a compiler type descriptor such as `uint128`,
    /// `struct Foo.Bar storage ref`, `mapping(string => uint256)` or
    /// `uint8[3][] memory` into a [`ValueType`].
    pub fn parse_type(&mut self, raw: &str) -> Result<ValueType> {
        let s = strip_location_suffix(raw.trim());

        match s {
            "bool" => return Ok(ValueType::Bool),
            "address" => return Ok(ValueType::Address),
            "string" => return Ok(ValueType::String),
            "bytes" => return Ok(ValueType::Bytes),
            _ => {}
        }
        if let Some(bits) = sized_suffix(s, "uint") {
            return Ok(ValueType::Uint(bits));
        }
        if let Some(bits) = sized_suffix(s, "int") {
            return Ok(ValueType::Int(bits));
        }
        if let Some(n) = sized_suffix(s, "bytes") {
            ensure!(n <= 32, "can not resolve type descriptor `{raw}`");
            return Ok(ValueType::FixedBytes(n * 8));
        }
        if let Some(qualified) = s.strip_prefix("struct ") {
            let name = qualified.rsplit('.').next().unwrap_or(qualified);
            return Ok(ValueType::Struct(self.resolve_struct(name)?));
        }
        if s.starts_with("contract ") {
            return Ok(ValueType::ContractRef);
        }
        if let Some(inner) = s.strip_prefix("mapping(").and_then(|r| r.strip_suffix(')')) {
            // Mapping keys are elementary, so the first ` => ` is the split.
            let (key, value) = inner
                .split_once(" => ")
                .ok_or_else(|| eyre!("can not resolve type descriptor `{raw}`"))?;
            return Ok(ValueType::Map {
                key: Box::new(self.parse_type(key)?),
                value: Box::new(self.parse_type(value)?),
            });
        }
        if let Some(open) = s.rfind('[') {
            if let Some(inner) = s[open..].strip_prefix('[').and_then(|r| r.strip_suffix(']')) {
                let elem = self.parse_type(&s[..open])?;
                if inner.is_empty() {
                    return Ok(ValueType::Array(Box::new(elem)));
                }
                let len: usize = inner
                    .parse()
                    .map_err(|_| eyre!("can not resolve type descriptor `{raw}`"))?;
                let size = fixed_array_size(&elem, len);
                return Ok(ValueType::FixedArray { elem: Box::new(elem), len, size });
            }
        }

        bail!("can not resolve type descriptor `{raw}`")
    }

    /// Resolves a struct reference by name, laying the struct out on first
    /// use. Forward and mutual references work; a struct that (transitively)
    /// contains itself has no finite layout and is rejected.
    fn resolve_struct(&mut self, name: &str) -> Result<Arc<StructLayout>> {
        if let Some(layout) = self.structs.get(name) {
            return Ok(Arc::clone(layout));
        }
        if self.resolving.iter().any(|n| n == name) {
            bail!("struct `{name}` recursively contains itself");
        }
        let ast = *self
            .struct_asts
            .get(name)
            .ok_or_else(|| eyre!("can not resolve type descriptor `struct {name}`"))?;

        self.resolving.push(name.to_string());
        let mut fields = Vec::new();
        for child in &ast.children {
            if child.name == "VariableDeclaration" {
                fields.push(self.parse_variable(child)?);
            }
        }
        self.resolving.pop();
        ensure!(!fields.is_empty(), "struct `{name}` has no fields");

        assign_slots(&mut fields);
        let last = fields.last().expect("at least one field");
        let size = (last.location as usize + (last.ty.bits() + WORD_BITS - 1) / WORD_BITS) *
            WORD_BITS;

        let layout = Arc::new(StructLayout { name: name.to_string(), fields, size });
        self.structs.insert(name.to_string(), Arc::clone(&layout));
        Ok(layout)
    }

    fn parse_function(&mut self, node: &AstNode) -> Result<Function> {
        let name = node.attr_str("name").unwrap_or_default().to_string();
        let src = node.span()?;

        let mut params = Vec::new();
        let mut returns = Vec::new();
        let mut locals = Vec::new();
        let mut return_count = 0;
        let mut params_parsed = false;

        for child in &node.children {
            match child.name.as_str() {
                "ParameterList" if !params_parsed => {
                    for decl in &child.children {
                        if decl.name == "VariableDeclaration" && has_name(decl) {
                            params.push(self.parse_function_variable(decl)?);
                        }
                    }
                    params_parsed = true;
                }
                "ParameterList" => {
                    // The second list is the return values; unnamed slots
                    // still count towards the stack layout.
                    return_count = child.children.len();
                    for (ordinal, decl) in child.children.iter().enumerate() {
                        if decl.name == "VariableDeclaration" && has_name(decl) {
                            let mut var = self.parse_function_variable(decl)?;
                            var.location = ordinal as i64;
                            returns.push(var);
                        }
                    }
                }
                "Block" => {
                    let mut decls = Vec::new();
                    child.walk(&mut |n| {
                        if n.name == "VariableDeclaration" {
                            decls.push(n);
                        }
                    });
                    for decl in decls {
                        locals.push(self.parse_function_variable(decl)?);
                    }
                }
                _ => {}
            }
        }

        for (ordinal, var) in params.iter_mut().enumerate() {
            var.location = ordinal as i64;
        }
        for (ordinal, var) in locals.iter_mut().enumerate() {
            var.location = ordinal as i64;
        }

        Ok(Function::new(name, src, params, returns, locals, return_count))
    }
}

fn has_name(node: &AstNode) -> bool {
    node.attr_str("name").is_some_and(|n| !n.is_empty())
}

/// Drops a trailing data-location annotation (` memory`, ` calldata`,
/// ` storage ref`, ` storage pointer`) from a type descriptor.
fn strip_location_suffix(s: &str) -> &str {
    if let Some(rest) = s.strip_suffix(" memory") {
        return rest;
    }
    if let Some(rest) = s.strip_suffix(" calldata") {
        return rest;
    }
    if let Some(pos) = s.find(" storage ") {
        return &s[..pos];
    }
    s.strip_suffix(" storage").unwrap_or(s)
}

fn sized_suffix(s: &str, prefix: &str) -> Option<usize> {
    s.strip_prefix(prefix)?.parse().ok()
}

/// Assigns storage slots and bit offsets in declaration order.
///
/// Structs and fixed arrays always start a fresh slot and occupy whole
/// slots; elementary values pack into the current slot while they fit.
pub(crate) fn assign_slots(vars: &mut [Variable]) {
    let mut slot: i64 = 0;
    let mut bits_consumed = 0usize;

    for var in vars {
        match var.ty {
            ValueType::Struct(_) | ValueType::FixedArray { .. } => {
                if bits_consumed > 0 {
                    slot += 1;
                    bits_consumed = 0;
                }
                var.location = slot;
                var.offset = 0;
                slot += (var.ty.bits() / WORD_BITS) as i64;
            }
            _ => {
                let size = var.ty.bits();
                if bits_consumed + size > WORD_BITS {
                    bits_consumed = 0;
                    slot += 1;
                }
                var.location = slot;
                var.offset = bits_consumed;
                bits_consumed += size;
            }
        }
    }
}

/// Storage footprint of a `T[len]` in bits: sub-word elements pack
/// several per slot, word-or-larger elements take whole slots each.
fn fixed_array_size(elem: &ValueType, len: usize) -> usize {
    let elem_bits = elem.bits();
    if elem_bits < WORD_BITS {
        let elems_per_slot = WORD_BITS / elem_bits;
        len.div_ceil(elems_per_slot) * WORD_BITS
    } else {
        len * (elem_bits / WORD_BITS) * WORD_BITS
    }
}

fn decode_body(bin: &str, srcmap: &str) -> Result<BytecodeBody> {
    let code = hex::decode(bin).wrap_err("bytecode is not valid hex")?;
    let pc_to_idx = ops_mapping(&code);
    let srcmap = decode_srcmap(srcmap)?;
    Ok(BytecodeBody { code, pc_to_idx, srcmap })
}

/// One scan over the bytecode: every opcode gets the next instruction
/// index, PUSH1..=PUSH32 immediates share the index of their opcode, and
/// the scan stops at the metadata marker.
pub(crate) fn ops_mapping(code: &[u8]) -> FxHashMap<usize, usize> {
    let mut map = FxHashMap::default();
    let end = metadata_start(code).unwrap_or(code.len());

    let mut pc = 0;
    let mut idx = 0;
    while pc < end {
        let op = code[pc];
        let immediates = if (0x60..0x80).contains(&op) { (op - 0x5f) as usize } else { 0 };
        for j in 0..=immediates {
            if pc + j < code.len() {
                map.insert(pc + j, idx);
            }
        }
        pc += 1 + immediates;
        idx += 1;
    }
    map
}

/// Decodes the semicolon-delimited, colon-field, delta-compressed source
/// map: a missing field inherits the previous record's value.
pub(crate) fn decode_srcmap(s: &str) -> Result<Vec<SourceFragment>> {
    if s.is_empty() {
        return Ok(Vec::new());
    }

    let mut out: Vec<SourceFragment> = Vec::new();
    for record in s.split(';') {
        let fields: Vec<&str> = record.split(':').collect();
        let field = |n: usize| fields.get(n).copied().filter(|f| !f.is_empty());
        let parse_num = |f: &str| {
            f.parse::<i64>().map_err(|_| eyre!("malformed source-map field `{f}`"))
        };

        let prev = out.last();
        let start = match (field(0), prev) {
            (Some(f), _) => parse_num(f)?.max(0) as usize,
            (None, Some(p)) => p.start,
            (None, None) => bail!("first source-map record must carry a start offset"),
        };
        let length = match (field(1), prev) {
            (Some(f), _) => parse_num(f)?.max(0) as usize,
            (None, Some(p)) => p.length,
            (None, None) => bail!("first source-map record must carry a length"),
        };
        let file_index = match (field(2), prev) {
            (Some(f), _) => parse_num(f)?,
            (None, Some(p)) => p.file_index,
            (None, None) => bail!("first source-map record must carry a file index"),
        };
        let jump = match (field(3), prev) {
            (Some(f), _) => JumpKind::parse(f),
            (None, Some(p)) => p.jump,
            (None, None) => JumpKind::Regular,
        };

        out.push(SourceFragment { start, length, file_index, jump });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builder_with_asts(asts: Vec<&AstNode>) -> ContractBuilder<'_> {
        ContractBuilder::new("Test", asts, Arc::new(SourceSet::new(Vec::new(), Vec::new())))
    }

    fn contract_ast(json: serde_json::Value) -> AstNode {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn two_uint128_share_a_slot() {
        let mut vars = vec![
            Variable::new("a", ValueType::Uint(128)),
            Variable::new("b", ValueType::Uint(128)),
            Variable::new("c", ValueType::Uint(128)),
        ];
        assign_slots(&mut vars);
        assert_eq!((vars[0].location, vars[0].offset), (0, 0));
        assert_eq!((vars[1].location, vars[1].offset), (0, 128));
        // The third no longer fits.
        assert_eq!((vars[2].location, vars[2].offset), (1, 0));
    }

    #[test]
    fn full_word_after_partial_slot_starts_fresh() {
        let mut vars = vec![
            Variable::new("flag", ValueType::Bool),
            Variable::new("x", ValueType::Uint(256)),
            Variable::new("y", ValueType::Uint(8)),
        ];
        assign_slots(&mut vars);
        assert_eq!((vars[0].location, vars[0].offset), (0, 0));
        assert_eq!((vars[1].location, vars[1].offset), (1, 0));
        assert_eq!((vars[2].location, vars[2].offset), (2, 0));
    }

    #[test]
    fn aggregates_flush_and_take_whole_slots() {
        let fixed = ValueType::FixedArray {
            elem: Box::new(ValueType::Uint(256)),
            len: 3,
            size: 3 * 256,
        };
        let mut vars = vec![
            Variable::new("small", ValueType::Uint(8)),
            Variable::new("arr", fixed),
            Variable::new("tail", ValueType::Uint(8)),
        ];
        assign_slots(&mut vars);
        assert_eq!((vars[0].location, vars[0].offset), (0, 0));
        assert_eq!((vars[1].location, vars[1].offset), (1, 0));
        assert_eq!((vars[2].location, vars[2].offset), (4, 0));
    }

    #[test]
    fn fixed_array_sizes() {
        // 32 uint8 per slot: 100 elements need 4 slots.
        assert_eq!(fixed_array_size(&ValueType::Uint(8), 100), 4 * 256);
        // Word-sized elements take one slot each.
        assert_eq!(fixed_array_size(&ValueType::Uint(256), 3), 3 * 256);
        // Sub-word but non-power-of-two: 256/160 = 1 address per slot.
        assert_eq!(fixed_array_size(&ValueType::Address, 2), 2 * 256);
    }

    #[test]
    fn elementary_type_descriptors() {
        let mut b = builder_with_asts(Vec::new());
        assert_eq!(b.parse_type("uint256").unwrap(), ValueType::Uint(256));
        assert_eq!(b.parse_type("int64").unwrap(), ValueType::Int(64));
        assert_eq!(b.parse_type("bool").unwrap(), ValueType::Bool);
        assert_eq!(b.parse_type("address").unwrap(), ValueType::Address);
        assert_eq!(b.parse_type("bytes4").unwrap(), ValueType::FixedBytes(32));
        assert_eq!(b.parse_type("bytes memory").unwrap(), ValueType::Bytes);
        assert_eq!(b.parse_type("string storage ref").unwrap(), ValueType::String);
        assert_eq!(b.parse_type("contract Token").unwrap(), ValueType::ContractRef);
    }

    #[test]
    fn composite_type_descriptors() {
        let mut b = builder_with_asts(Vec::new());
        assert_eq!(
            b.parse_type("uint8[3]").unwrap(),
            ValueType::FixedArray { elem: Box::new(ValueType::Uint(8)), len: 3, size: 256 }
        );
        assert_eq!(
            b.parse_type("uint256[] memory").unwrap(),
            ValueType::Array(Box::new(ValueType::Uint(256)))
        );
        // Suffix-last is the outermost dimension.
        assert_eq!(
            b.parse_type("uint256[2][3]").unwrap(),
            ValueType::FixedArray {
                elem: Box::new(ValueType::FixedArray {
                    elem: Box::new(ValueType::Uint(256)),
                    len: 2,
                    size: 512,
                }),
                len: 3,
                size: 3 * 512,
            }
        );
        assert_eq!(
            b.parse_type("mapping(string => mapping(address => uint256))").unwrap(),
            ValueType::Map {
                key: Box::new(ValueType::String),
                value: Box::new(ValueType::Map {
                    key: Box::new(ValueType::Address),
                    value: Box::new(ValueType::Uint(256)),
                }),
            }
        );
    }

    #[test]
    fn unknown_descriptor_is_fatal() {
        let mut b = builder_with_asts(Vec::new());
        assert!(b.parse_type("tuple(uint256,bool)").is_err());
        assert!(b.parse_type("bytes33").is_err());
        assert!(b.parse_type("struct Foo.Missing").is_err());
    }

    #[test]
    fn struct_layout_resolves_by_name_and_memoizes() {
        let ast = contract_ast(serde_json::json!({
            "name": "ContractDefinition",
            "src": "0:100:0",
            "attributes": { "name": "C" },
            "children": [
                {
                    "name": "StructDefinition",
                    "attributes": { "name": "Point" },
                    "children": [
                        { "name": "VariableDeclaration",
                          "attributes": { "name": "x", "type": "uint128" } },
                        { "name": "VariableDeclaration",
                          "attributes": { "name": "y", "type": "uint128" } },
                        { "name": "VariableDeclaration",
                          "attributes": { "name": "tag", "type": "uint256" } },
                    ]
                }
            ]
        }));
        let mut b = builder_with_asts(vec![&ast]);
        b.collect_struct_asts();

        let ValueType::Struct(layout) = b.parse_type("struct C.Point").unwrap() else {
            panic!("expected struct");
        };
        // x and y pack into slot 0, tag takes slot 1: two slots total.
        assert_eq!(layout.size, 2 * 256);
        assert_eq!(layout.field("y").unwrap().1.offset, 128);
        assert_eq!(layout.field("tag").unwrap().1.location, 1);

        // Second resolution returns the memoized layout.
        let ValueType::Struct(again) = b.parse_type("struct C.Point").unwrap() else {
            panic!("expected struct");
        };
        assert!(Arc::ptr_eq(&layout, &again));
    }

    #[test]
    fn recursive_struct_is_rejected() {
        let ast = contract_ast(serde_json::json!({
            "name": "ContractDefinition",
            "src": "0:10:0",
            "attributes": { "name": "C" },
            "children": [
                {
                    "name": "StructDefinition",
                    "attributes": { "name": "Node" },
                    "children": [
                        { "name": "VariableDeclaration",
                          "attributes": { "name": "next", "type": "struct C.Node" } },
                    ]
                }
            ]
        }));
        let mut b = builder_with_asts(vec![&ast]);
        b.collect_struct_asts();
        assert!(b.parse_type("struct C.Node").is_err());
    }

    #[test]
    fn function_locals_are_collected_recursively() {
        let ast = contract_ast(serde_json::json!({
            "name": "FunctionDefinition",
            "src": "10:80:0",
            "attributes": { "name": "f" },
            "children": [
                { "name": "ParameterList", "children": [
                    { "name": "VariableDeclaration",
                      "attributes": { "name": "a", "type": "uint256" } },
                    { "name": "VariableDeclaration",
                      "attributes": { "name": "b", "type": "uint256" } },
                ]},
                { "name": "ParameterList", "children": [
                    { "name": "VariableDeclaration",
                      "attributes": { "name": "", "type": "uint256" } },
                ]},
                { "name": "Block", "children": [
                    { "name": "VariableDeclaration",
                      "attributes": { "name": "x", "type": "uint256" } },
                    { "name": "IfStatement", "children": [
                        { "name": "Block", "children": [
                            { "name": "VariableDeclaration",
                              "attributes": { "name": "y", "type": "bool" } },
                        ]},
                    ]},
                    { "name": "VariableDeclaration",
                      "attributes": { "name": "z", "type": "uint256" } },
                ]},
            ]
        }));
        let mut b = builder_with_asts(Vec::new());
        let func = b.parse_function(&ast).unwrap();

        assert_eq!(func.params.len(), 2);
        assert_eq!(func.param("b").unwrap().location, 1);
        assert_eq!(func.return_count, 1);
        assert!(func.returns.is_empty());
        // Declaration order across nested blocks.
        let names: Vec<_> = func.locals.iter().map(|v| v.name.as_str()).collect();
        assert_eq!(names, ["x", "y", "z"]);
        assert_eq!(func.local("z").unwrap().location, 2);
    }

    #[test]
    fn srcmap_records_inherit_missing_fields() {
        let decoded = decode_srcmap("0:10:0:-;;5:2;:8:1:i;::0:o").unwrap();
        assert_eq!(decoded.len(), 5);
        assert_eq!(decoded[1], decoded[0]);
        assert_eq!(
            decoded[2],
            SourceFragment { start: 5, length: 2, file_index: 0, jump: JumpKind::Regular }
        );
        assert_eq!(
            decoded[3],
            SourceFragment { start: 5, length: 8, file_index: 1, jump: JumpKind::In }
        );
        assert_eq!(
            decoded[4],
            SourceFragment { start: 5, length: 8, file_index: 0, jump: JumpKind::Out }
        );
    }

    #[test]
    fn srcmap_first_record_must_be_complete() {
        assert!(decode_srcmap(";0:1:0").is_err());
        assert!(decode_srcmap(":1:0").is_err());
        assert!(decode_srcmap("0:1").is_err());
    }

    #[test]
    fn ops_mapping_groups_push_immediates() {
        // PUSH2 0xaabb; ADD; PUSH1 0x01; STOP
        let code = [0x61, 0xaa, 0xbb, 0x01, 0x60, 0x01, 0x00];
        let map = ops_mapping(&code);
        assert_eq!(map[&0], 0);
        assert_eq!(map[&1], 0);
        assert_eq!(map[&2], 0);
        assert_eq!(map[&3], 1);
        assert_eq!(map[&4], 2);
        assert_eq!(map[&5], 2);
        assert_eq!(map[&6], 3);
    }

    #[test]
    fn ops_mapping_stops_at_metadata() {
        let mut code = vec![0x60, 0x01, 0x00];
        code.extend_from_slice(crate::contract::METADATA_MARKER);
        code.push(0xff);
        let map = ops_mapping(&code);
        assert_eq!(map.len(), 3);
        assert!(!map.contains_key(&3));
    }
}
