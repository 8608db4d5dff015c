//! Shared error types for the analysis engine.

use thiserror::Error;

use super::descriptors::{ClassDescriptor, MethodDescriptor};

/// Checked failure of one analysis for one class or method.
///
/// An intentional skip (oversized method, synthetic code, unanalyzable
/// shape) is *not* an error; skips surface as `Ok(None)` from the cache so
/// callers branch on absence. Errors here are scoped to a single
/// `(kind, descriptor)` request and never cascade to sibling analyses.
#[derive(Debug, Error)]
pub enum AnalysisError {
    /// A referenced class could not be resolved by the class source.
    #[error("class not found: {descriptor}")]
    ClassNotFound { descriptor: ClassDescriptor },

    /// A method descriptor does not name a method of its class.
    #[error("method not found: {descriptor}")]
    MethodNotFound { descriptor: MethodDescriptor },

    /// The decoded input violates its own structure (bad branch target,
    /// constant-pool index out of range, malformed signature).
    #[error("invalid bytecode in {context}: {message}")]
    InvalidBytecode { context: String, message: String },

    /// A dataflow analysis failed to reach a fixed point within the
    /// configured iteration budget.
    #[error("dataflow did not converge after {iterations} iterations for {descriptor}")]
    Convergence {
        descriptor: MethodDescriptor,
        iterations: usize,
    },

    /// A dataflow fact was requested at a location the analysis never
    /// produced facts for.
    #[error("no dataflow fact at block {block} of {descriptor}")]
    MissingFact {
        descriptor: MethodDescriptor,
        block: usize,
    },

    /// No analysis engine is registered for the requested kind.
    #[error("no engine registered for analysis kind {kind}")]
    NoSuchEngine { kind: &'static str },

    /// Wrapped collaborator errors (class sources, external lookups).
    #[error(transparent)]
    External(#[from] anyhow::Error),
}

impl AnalysisError {
    pub fn invalid_bytecode(context: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidBytecode {
            context: context.into(),
            message: message.into(),
        }
    }

    /// True when the failure is a missing-class lookup, the one category
    /// that is reported through the cache's lookup-failure callback and
    /// then degraded rather than propagated.
    pub fn is_missing_class(&self) -> bool {
        matches!(self, Self::ClassNotFound { .. })
    }
}

pub type Result<T> = std::result::Result<T, AnalysisError>;
