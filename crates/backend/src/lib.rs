//! # soldb-backend
//!
//! soldb's core engine: it turns compiler output (AST, bytecode, source
//! maps) into an immutable typed layout model, replays a recorded
//! instruction-level trace while tracking call frames and the active
//! contract, and decodes high-level variable values out of the raw VM
//! state on demand.

#[macro_use]
extern crate tracing;

pub mod artifact;
pub mod contract;
mod error;
pub mod eval;
#[cfg(test)]
mod fixtures;
mod stepper;
pub mod trace;
pub mod types;

pub use error::EvalError;
pub use eval::{expr::Expr, value::Value};
pub use stepper::{Breakpoint, ContextLine, ContractFrame, DebugSession, SourceContext, TxEntry};
pub use trace::{ChainAccess, NoChain, Trace, TraceStep};
