use std::{path::PathBuf, sync::Arc};

use alloy_primitives::Address;
use clap::Parser;
use eyre::{bail, eyre, Result, WrapErr};
use soldb_backend::{
    artifact::{self, CombinedJson},
    contract::Contract,
    DebugSession, NoChain, Trace, TxEntry,
};

/// soldb: a source-level debugger for EVM transaction traces.
#[derive(Parser, Debug)]
#[command(name = "soldb", version, next_display_order = None)]
pub struct SoldbArgs {
    /// solc combined-json bundles
    /// (`--combined-json ast,bin,bin-runtime,srcmap,srcmap-runtime`).
    #[arg(required = true, value_name = "BUNDLE")]
    pub bundles: Vec<PathBuf>,

    /// Recorded `debug_traceTransaction` output for the transaction.
    #[arg(long, value_name = "FILE")]
    pub trace: PathBuf,

    /// Debug a message call to the contract deployed at this address.
    #[arg(long, value_name = "ADDRESS", conflicts_with = "create")]
    pub to: Option<Address>,

    /// Debug the creation of the contract deployed at this address.
    #[arg(long, value_name = "ADDRESS")]
    pub create: Option<Address>,

    /// Name of the contract the transaction enters; defaults to the only
    /// loaded one.
    #[arg(long, value_name = "NAME")]
    pub contract: Option<String>,

    /// Directory the bundles' source paths are resolved against.
    #[arg(long, value_name = "DIR")]
    pub source_root: Option<PathBuf>,
}

impl SoldbArgs {
    pub fn build_session(&self) -> Result<DebugSession> {
        let mut bundles = Vec::with_capacity(self.bundles.len());
        for path in &self.bundles {
            let json = std::fs::read_to_string(path)
                .wrap_err_with(|| format!("failed to read bundle {}", path.display()))?;
            bundles.push(CombinedJson::parse(&json)?);
        }
        let contracts = artifact::load_contracts(&bundles, self.source_root.as_deref())?;
        info!(contracts = contracts.len(), "loaded contract pool");

        let json = std::fs::read_to_string(&self.trace)
            .wrap_err_with(|| format!("failed to read trace {}", self.trace.display()))?;
        let trace: Trace = serde_json::from_str(&json).wrap_err("failed to parse the trace file")?;

        let entry = match (self.to, self.create) {
            (Some(to), None) => {
                let contract = self.entry_contract(&contracts)?;
                TxEntry::Call { to, code: Some(contract.runtime.code.clone()) }
            }
            (None, Some(address)) => {
                let contract = self.entry_contract(&contracts)?;
                TxEntry::Create { address, init_code: contract.init.code.clone() }
            }
            _ => bail!("exactly one of --to and --create is required"),
        };

        DebugSession::new(contracts, trace, Box::new(NoChain), entry)
    }

    /// The contract the transaction enters: `--contract` by name, or the
    /// only loaded one.
    fn entry_contract<'a>(&self, contracts: &'a [Arc<Contract>]) -> Result<&'a Arc<Contract>> {
        match &self.contract {
            Some(name) => contracts
                .iter()
                .find(|c| c.name == *name)
                .ok_or_else(|| eyre!("no loaded contract is named `{name}`")),
            None if contracts.len() == 1 => Ok(&contracts[0]),
            None => bail!("several contracts are loaded; pick one with --contract"),
        }
    }
}
