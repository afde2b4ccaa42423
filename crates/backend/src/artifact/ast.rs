//! The legacy (solc 0.4/0.5) combined-json AST node shape.
//!
//! Every node is `{name, src, attributes, children}`; node-specific data
//! lives in the untyped `attributes` map, so accessors here pull out the
//! handful of attributes the model builder needs.

use eyre::{eyre, Result};
use serde::Deserialize;

use crate::contract::SourceSpan;

#[derive(Clone, Debug, Default, Deserialize)]
pub struct AstNode {
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub src: String,
    #[serde(default)]
    pub attributes: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub children: Vec<AstNode>,
}

impl AstNode {
    pub fn attr_str(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).and_then(|v| v.as_str())
    }

    pub fn attr_bool(&self, key: &str) -> bool {
        self.attributes.get(key).and_then(|v| v.as_bool()).unwrap_or(false)
    }

    /// The node's `src` attribute as `start:length:file`.
    pub fn span(&self) -> Result<SourceSpan> {
        let mut parts = self.src.split(':');
        let mut next = |what| {
            parts
                .next()
                .and_then(|p| p.parse::<i64>().ok())
                .ok_or_else(|| eyre!("malformed src attribute `{}`: missing {what}", self.src))
        };
        let start = next("start")?;
        let length = next("length")?;
        let file = next("file")?;
        Ok(SourceSpan { start: start.max(0) as usize, length: length.max(0) as usize, file })
    }

    /// Pre-order traversal over the node and all descendants, children in
    /// declaration order. Uses an explicit worklist rather than recursion.
    pub fn walk<'a>(&'a self, f: &mut impl FnMut(&'a AstNode)) {
        let mut work = vec![self];
        while let Some(node) = work.pop() {
            f(node);
            for child in node.children.iter().rev() {
                work.push(child);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn walk_is_preorder_in_declaration_order() {
        let node: AstNode = serde_json::from_value(serde_json::json!({
            "name": "Block",
            "children": [
                { "name": "A", "children": [{ "name": "A1" }, { "name": "A2" }] },
                { "name": "B" },
            ]
        }))
        .unwrap();

        let mut seen = Vec::new();
        node.walk(&mut |n| seen.push(n.name.clone()));
        assert_eq!(seen, ["Block", "A", "A1", "A2", "B"]);
    }

    #[test]
    fn span_parses_src_triple() {
        let node =
            AstNode { src: "12:34:0".to_string(), ..Default::default() };
        let span = node.span().unwrap();
        assert_eq!((span.start, span.length, span.file), (12, 34, 0));
    }
}
