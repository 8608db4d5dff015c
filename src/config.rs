//! Engine configuration.
//!
//! A plain value passed to the cache at construction. There is no file or
//! environment loading here; embedders that persist settings deserialize
//! this struct themselves.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Drop exception edges the type dataflow proves infeasible.
    pub prune_infeasible_exception_edges: bool,
    /// Drop fall-through edges after calls known to always throw.
    pub prune_unconditional_thrower_edges: bool,
    /// Methods with more instructions than this are skipped outright
    /// rather than aborted mid-analysis.
    pub max_method_instructions: usize,
    /// Upper bound on fixed-point passes before a dataflow run is treated
    /// as a checked failure.
    pub max_dataflow_iterations: usize,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            prune_infeasible_exception_edges: true,
            prune_unconditional_thrower_edges: true,
            max_method_instructions: 6000,
            max_dataflow_iterations: 100,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_enable_pruning() {
        let config = AnalysisConfig::default();
        assert!(config.prune_infeasible_exception_edges);
        assert!(config.prune_unconditional_thrower_edges);
        assert!(config.max_method_instructions > 0);
    }
}
