//! Ingestion of solc `--combined-json ast,bin,bin-runtime,srcmap,srcmap-runtime`
//! bundles. Several bundles may be loaded; all resulting contracts are
//! pooled so that bytecode-based resolution during calls/creates can match
//! any of them.

pub mod ast;

use std::{collections::BTreeMap, path::Path, str::FromStr, sync::Arc};

use eyre::{eyre, Result, WrapErr};
use rustc_hash::FxHashMap;
use serde::Deserialize;

use crate::contract::{builder::ContractBuilder, Contract, SourceSet};
use ast::AstNode;

/// One parsed combined-json file.
#[derive(Debug, Deserialize)]
pub struct CombinedJson {
    #[serde(default)]
    pub version: String,
    #[serde(rename = "sourceList", default)]
    pub source_list: Vec<String>,
    /// Keyed by source path.
    #[serde(default)]
    pub sources: BTreeMap<String, SourceEntry>,
    /// Keyed by `path:ContractName`.
    #[serde(default)]
    pub contracts: BTreeMap<String, ContractEntry>,
}

#[derive(Debug, Deserialize)]
pub struct SourceEntry {
    #[serde(rename = "AST")]
    pub ast: AstNode,
}

#[derive(Debug, Default, Deserialize)]
pub struct ContractEntry {
    #[serde(default)]
    pub bin: String,
    #[serde(rename = "bin-runtime", default)]
    pub bin_runtime: String,
    #[serde(default)]
    pub srcmap: String,
    #[serde(rename = "srcmap-runtime", default)]
    pub srcmap_runtime: String,
}

/// The `major.minor.patch` prefix of solc's version string
/// (e.g. `0.4.25+commit.59dbf8f1.Linux.g++`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SolcVersion {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl SolcVersion {
    /// True for the compiler generations emitting the legacy AST shape this
    /// loader understands.
    pub fn is_legacy(&self) -> bool {
        self.major == 0 && (self.minor == 4 || self.minor == 5)
    }
}

impl FromStr for SolcVersion {
    type Err = eyre::Error;

    fn from_str(s: &str) -> Result<Self> {
        let numeric = s.split('+').next().unwrap_or_default();
        let mut parts = numeric.split('.');
        let mut next = || {
            parts
                .next()
                .and_then(|p| p.parse::<u64>().ok())
                .ok_or_else(|| eyre!("malformed compiler version string `{s}`"))
        };
        Ok(Self { major: next()?, minor: next()?, patch: next()? })
    }
}

impl CombinedJson {
    pub fn parse(json: &str) -> Result<Self> {
        serde_json::from_str(json).wrap_err("failed to parse combined-json bundle")
    }
}

/// Builds the contract pool from one or more bundles.
///
/// Source files referenced by each bundle's `sourceList` are read from disk,
/// resolved against `source_root` when given.
pub fn load_contracts(
    bundles: &[CombinedJson],
    source_root: Option<&Path>,
) -> Result<Vec<Arc<Contract>>> {
    let mut contracts = Vec::new();

    for bundle in bundles {
        let version: SolcVersion = bundle.version.parse()?;
        if !version.is_legacy() {
            warn!(
                version = %bundle.version,
                "compiler version is outside the supported 0.4.x/0.5.x range; \
                 the AST may not be in the legacy shape this loader expects"
            );
        }

        let sources = Arc::new(read_sources(&bundle.source_list, source_root)?);

        // Contract definitions from every source file, indexed by AST id and
        // by name so the linearization order can be resolved.
        let mut by_id = FxHashMap::default();
        let mut by_name = FxHashMap::default();
        for entry in bundle.sources.values() {
            for node in &entry.ast.children {
                if node.name == "ContractDefinition" {
                    if let Some(id) = node.id {
                        by_id.insert(id, node);
                    }
                    if let Some(name) = node.attr_str("name") {
                        by_name.insert(name.to_string(), node);
                    }
                }
            }
        }

        for (key, entry) in &bundle.contracts {
            if entry.bin.is_empty() {
                // Interfaces and abstract contracts have no code to debug.
                continue;
            }
            let name = key.rsplit(':').next().unwrap_or(key);
            let ast = by_name
                .get(name)
                .ok_or_else(|| eyre!("no ContractDefinition AST for contract `{name}`"))?;

            let linearized = ast
                .attributes
                .get("linearizedBaseContracts")
                .and_then(|v| v.as_array())
                .ok_or_else(|| eyre!("contract `{name}` has no linearizedBaseContracts"))?;
            // Most-derived first in the AST; reversed so that base contracts
            // get their storage slots assigned first.
            let mut asts = Vec::with_capacity(linearized.len());
            for id in linearized.iter().rev() {
                let id = id.as_u64().ok_or_else(|| eyre!("malformed contract id in `{name}`"))?;
                asts.push(
                    *by_id
                        .get(&id)
                        .ok_or_else(|| eyre!("unknown base contract id {id} for `{name}`"))?,
                );
            }

            debug!(contract = name, bases = asts.len(), "building contract model");
            let contract = ContractBuilder::new(name, asts, Arc::clone(&sources)).build(entry)?;
            contracts.push(Arc::new(contract));
        }
    }

    Ok(contracts)
}

fn read_sources(source_list: &[String], source_root: Option<&Path>) -> Result<SourceSet> {
    let mut texts = Vec::with_capacity(source_list.len());
    for path in source_list {
        let resolved = match source_root {
            Some(root) => root.join(path),
            None => path.into(),
        };
        let text = std::fs::read_to_string(&resolved)
            .wrap_err_with(|| format!("failed to read source file {}", resolved.display()))?;
        texts.push(text.split('\n').map(str::to_string).collect());
    }
    Ok(SourceSet::new(source_list.to_vec(), texts))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_parses_full_solc_string() {
        let v: SolcVersion = "0.4.25+commit.59dbf8f1.Linux.g++".parse().unwrap();
        assert_eq!(v, SolcVersion { major: 0, minor: 4, patch: 25 });
        assert!(v.is_legacy());

        let v: SolcVersion = "0.8.19".parse().unwrap();
        assert!(!v.is_legacy());
    }

    #[test]
    fn version_rejects_garbage() {
        assert!("".parse::<SolcVersion>().is_err());
        assert!("0.4".parse::<SolcVersion>().is_err());
        assert!("latest".parse::<SolcVersion>().is_err());
    }
}
