use thiserror::Error;

/// Recoverable evaluation-time failures.
///
/// These are surfaced to the user as a short message; the session and the
/// current trace position stay valid and usable afterwards. Fatal load-time
/// conditions (unresolvable types, unmatched bytecode, malformed compiler
/// version strings) are reported through `eyre` instead and abort
/// construction.
#[derive(Debug, Error)]
pub enum EvalError {
    /// The expression text is not part of the supported grammar.
    #[error("failed to parse expression")]
    ParsingFailed,

    /// The expression is well-formed but cannot be resolved against the
    /// current contract and trace position.
    #[error("can not evaluate expression: {0}")]
    EvalFailed(String),

    /// The variable resolves to a stack slot at or beyond the current stack
    /// height, i.e. it is declared but has not been assigned yet.
    #[error("variable is not yet initialized")]
    VarNotYetInitialized,
}

impl EvalError {
    pub(crate) fn failed(msg: impl Into<String>) -> Self {
        Self::EvalFailed(msg.into())
    }
}
