//! Bytecode static-analysis engine.
//!
//! bytelint inspects compiled method bodies — decoded instruction streams,
//! exception tables and constant pools supplied by a loader collaborator —
//! and derives the facts bug-pattern detectors consume: control-flow
//! graphs with a refinement pipeline, generic fixed-point dataflow
//! results, duplicate-`finally`-body maps and integral value-range
//! (redundant condition) reports.
//!
//! Everything is served through the [`cache::AnalysisCache`]: results are
//! memoized per `(descriptor, analysis kind)` and computed on demand by
//! registered engines.
//!
//! ```no_run
//! use std::sync::Arc;
//! use bytelint::cache::AnalysisCache;
//! use bytelint::config::AnalysisConfig;
//! use bytelint::core::{ClassDescriptor, ClassSource, MethodDescriptor};
//!
//! fn run(loader: Arc<dyn ClassSource>) -> bytelint::core::Result<()> {
//!     let cache = AnalysisCache::new(loader, AnalysisConfig::default());
//!     let method = MethodDescriptor::new(
//!         ClassDescriptor::new("com/example/Foo"),
//!         "bar",
//!         "(I)V",
//!         false,
//!     );
//!     if let Some(report) = cache.get_value_range(&method)? {
//!         for condition in report.redundant_conditions() {
//!             println!("{}: {}", condition.location.position, condition.condition);
//!         }
//!     }
//!     Ok(())
//! }
//! ```

pub mod analysis;
pub mod cache;
pub mod cfg;
pub mod config;
pub mod core;
pub mod dataflow;

pub use crate::analysis::{
    FinallyDuplicatesInfo, LongRangeSet, RedundantCondition, TypeDataflow, TypeRange,
    ValueRangeAnalysis,
};
pub use crate::cache::{
    AnalysisCache, ClassAnalysisKind, ClassContext, MethodAnalysisKind, RetainPolicy,
};
pub use crate::cfg::{BasicBlock, Cfg, EdgeKind, RefinementFlags};
pub use crate::config::AnalysisConfig;
pub use crate::core::{
    AnalysisError, ClassData, ClassDescriptor, ClassSource, MethodData, MethodDescriptor,
};
pub use crate::dataflow::{Dataflow, DataflowAnalysis, Direction};
