//! Analysis cache and factory registry.
//!
//! Results are memoized per `(descriptor, kind)`. A missing entry is
//! computed by the engine registered for the kind; engines are plain
//! functions of a descriptor plus whatever other cached analyses they pull
//! back out of the cache (dependencies are implicit call-backs, not
//! declared). `Ok(None)` is the memoized "intentionally skipped" answer —
//! callers branch on absence, they do not treat it as an error.
//!
//! Locks are never held across an engine invocation, so engines are free to
//! recurse into the cache. Purging runs under a single write guard and can
//! therefore never be observed half-done by a concurrent reader.

pub mod engines;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::analysis::finally::FinallyDuplicatesInfo;
use crate::analysis::types::TypeDataflow;
use crate::analysis::value_range::ValueRangeAnalysis;
use crate::cfg::Cfg;
use crate::config::AnalysisConfig;
use crate::core::descriptors::{ClassDescriptor, MethodDescriptor};
use crate::core::errors::{AnalysisError, Result};
use crate::core::method::{ClassData, ClassSource, MethodData};

pub use engines::ClassContext;

/// Per-class analysis kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClassAnalysisKind {
    ClassData,
    ClassContext,
}

impl ClassAnalysisKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::ClassData => "ClassData",
            Self::ClassContext => "ClassContext",
        }
    }
}

/// Per-method analysis kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MethodAnalysisKind {
    MethodData,
    Cfg,
    TypeDataflow,
    FinallyDuplicates,
    ValueRange,
}

impl MethodAnalysisKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::MethodData => "MethodData",
            Self::Cfg => "Cfg",
            Self::TypeDataflow => "TypeDataflow",
            Self::FinallyDuplicates => "FinallyDuplicates",
            Self::ValueRange => "ValueRange",
        }
    }
}

/// Kind-tagged class analysis result.
#[derive(Clone)]
pub enum ClassAnalysisValue {
    ClassData(Arc<ClassData>),
    ClassContext(Arc<ClassContext>),
}

impl ClassAnalysisValue {
    pub fn kind(&self) -> ClassAnalysisKind {
        match self {
            Self::ClassData(_) => ClassAnalysisKind::ClassData,
            Self::ClassContext(_) => ClassAnalysisKind::ClassContext,
        }
    }
}

/// Kind-tagged method analysis result.
#[derive(Clone)]
pub enum MethodAnalysisValue {
    MethodData(Arc<MethodData>),
    Cfg(Arc<Cfg>),
    TypeDataflow(Arc<TypeDataflow>),
    FinallyDuplicates(Arc<FinallyDuplicatesInfo>),
    ValueRange(Arc<ValueRangeAnalysis>),
}

impl MethodAnalysisValue {
    pub fn kind(&self) -> MethodAnalysisKind {
        match self {
            Self::MethodData(_) => MethodAnalysisKind::MethodData,
            Self::Cfg(_) => MethodAnalysisKind::Cfg,
            Self::TypeDataflow(_) => MethodAnalysisKind::TypeDataflow,
            Self::FinallyDuplicates(_) => MethodAnalysisKind::FinallyDuplicates,
            Self::ValueRange(_) => MethodAnalysisKind::ValueRange,
        }
    }
}

/// Whether a result survives purges.
///
/// Retained results back object-identity-sensitive comparisons downstream
/// (parsed class and method structures); recomputable ones are cheap to
/// rebuild and are dropped to save memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetainPolicy {
    Retain,
    Recompute,
}

/// One pluggable class-analysis computation.
pub trait ClassAnalysisEngine: Send + Sync {
    fn retain(&self) -> RetainPolicy {
        RetainPolicy::Recompute
    }

    fn analyze(
        &self,
        cache: &AnalysisCache,
        descriptor: &ClassDescriptor,
    ) -> Result<Option<ClassAnalysisValue>>;
}

/// One pluggable method-analysis computation.
pub trait MethodAnalysisEngine: Send + Sync {
    fn retain(&self) -> RetainPolicy {
        RetainPolicy::Recompute
    }

    fn analyze(
        &self,
        cache: &AnalysisCache,
        descriptor: &MethodDescriptor,
    ) -> Result<Option<MethodAnalysisValue>>;
}

type LookupFailureCallback = Box<dyn Fn(&ClassDescriptor, &AnalysisError) + Send + Sync>;

/// The memoization table plus its engine registry.
pub struct AnalysisCache {
    class_source: Arc<dyn ClassSource>,
    config: AnalysisConfig,
    class_engines: HashMap<ClassAnalysisKind, Box<dyn ClassAnalysisEngine>>,
    method_engines: HashMap<MethodAnalysisKind, Box<dyn MethodAnalysisEngine>>,
    #[allow(clippy::type_complexity)]
    class_entries: RwLock<HashMap<(ClassDescriptor, ClassAnalysisKind), Option<ClassAnalysisValue>>>,
    #[allow(clippy::type_complexity)]
    method_entries:
        RwLock<HashMap<(MethodDescriptor, MethodAnalysisKind), Option<MethodAnalysisValue>>>,
    lookup_failure: RwLock<LookupFailureCallback>,
}

impl AnalysisCache {
    /// Build a cache with the default engine registry. Engines are
    /// registered exactly once, here.
    pub fn new(class_source: Arc<dyn ClassSource>, config: AnalysisConfig) -> Self {
        Self {
            class_source,
            config,
            class_engines: engines::default_class_engines(),
            method_engines: engines::default_method_engines(),
            class_entries: RwLock::new(HashMap::new()),
            method_entries: RwLock::new(HashMap::new()),
            lookup_failure: RwLock::new(Box::new(|descriptor, error| {
                log::warn!("class lookup failed for {descriptor}: {error}");
            })),
        }
    }

    pub fn config(&self) -> &AnalysisConfig {
        &self.config
    }

    pub fn class_source(&self) -> &Arc<dyn ClassSource> {
        &self.class_source
    }

    /// Replace the missing-class callback (defaults to a `log::warn!`).
    pub fn set_lookup_failure_callback(
        &self,
        callback: impl Fn(&ClassDescriptor, &AnalysisError) + Send + Sync + 'static,
    ) {
        *self.lookup_failure.write() = Box::new(callback);
    }

    /// Report a missing-class lookup. The requesting analysis is expected
    /// to continue with degraded facts.
    pub fn report_lookup_failure(&self, descriptor: &ClassDescriptor, error: &AnalysisError) {
        (self.lookup_failure.read())(descriptor, error);
    }

    /// Cached or freshly computed class analysis.
    pub fn get_class_analysis(
        &self,
        kind: ClassAnalysisKind,
        descriptor: &ClassDescriptor,
    ) -> Result<Option<ClassAnalysisValue>> {
        if let Some(entry) = self
            .class_entries
            .read()
            .get(&(descriptor.clone(), kind))
        {
            return Ok(entry.clone());
        }

        let engine =
            self.class_engines
                .get(&kind)
                .ok_or(AnalysisError::NoSuchEngine { kind: kind.name() })?;
        log::debug!("computing {} for {descriptor}", kind.name());
        let value = engine.analyze(self, descriptor)?;
        debug_assert!(value.as_ref().map(|v| v.kind() == kind).unwrap_or(true));

        let mut entries = self.class_entries.write();
        let slot = entries
            .entry((descriptor.clone(), kind))
            .or_insert_with(|| value);
        Ok(slot.clone())
    }

    /// Cached or freshly computed method analysis.
    pub fn get_method_analysis(
        &self,
        kind: MethodAnalysisKind,
        descriptor: &MethodDescriptor,
    ) -> Result<Option<MethodAnalysisValue>> {
        if let Some(entry) = self
            .method_entries
            .read()
            .get(&(descriptor.clone(), kind))
        {
            return Ok(entry.clone());
        }

        let engine =
            self.method_engines
                .get(&kind)
                .ok_or(AnalysisError::NoSuchEngine { kind: kind.name() })?;
        log::debug!("computing {} for {descriptor}", kind.name());
        let value = engine.analyze(self, descriptor)?;
        debug_assert!(value.as_ref().map(|v| v.kind() == kind).unwrap_or(true));

        // An eager put or commit during the computation wins; keep it.
        let mut entries = self.method_entries.write();
        let slot = entries
            .entry((descriptor.clone(), kind))
            .or_insert_with(|| value);
        Ok(slot.clone())
    }

    /// Install a result before its computation completes, so recursive
    /// dependents observe the in-progress value.
    pub fn eagerly_put_method(&self, descriptor: &MethodDescriptor, value: MethodAnalysisValue) {
        let kind = value.kind();
        self.method_entries
            .write()
            .insert((descriptor.clone(), kind), Some(value));
    }

    /// Atomically install a (possibly mutated) CFG and, when its edge set
    /// changed, purge every non-retained analysis computed against the old
    /// graph shape. Single write guard: readers never observe the purge
    /// half-done.
    pub fn commit_cfg(
        &self,
        descriptor: &MethodDescriptor,
        cfg: Cfg,
        structural_change: bool,
    ) -> Arc<Cfg> {
        let cfg = Arc::new(cfg);
        let mut entries = self.method_entries.write();
        if structural_change {
            log::debug!("cfg changed for {descriptor}; purging dependent analyses");
            entries.retain(|(owner, kind), _| {
                owner != descriptor
                    || *kind == MethodAnalysisKind::Cfg
                    || self.is_retained(*kind)
            });
        }
        entries.insert(
            (descriptor.clone(), MethodAnalysisKind::Cfg),
            Some(MethodAnalysisValue::Cfg(Arc::clone(&cfg))),
        );
        cfg
    }

    /// Discard every non-retained cached result for one method.
    pub fn purge_method_analyses(&self, descriptor: &MethodDescriptor) {
        let mut entries = self.method_entries.write();
        entries.retain(|(owner, kind), _| owner != descriptor || self.is_retained(*kind));
    }

    /// Memory-pressure hook: drop everything the engines flag as cheap to
    /// recompute, for all classes and methods.
    pub fn purge_recomputable(&self) {
        self.class_entries.write().retain(|(_, kind), _| {
            self.class_engines
                .get(kind)
                .map(|e| e.retain() == RetainPolicy::Retain)
                .unwrap_or(false)
        });
        self.method_entries
            .write()
            .retain(|(_, kind), _| self.is_retained(*kind));
    }

    fn is_retained(&self, kind: MethodAnalysisKind) -> bool {
        self.method_engines
            .get(&kind)
            .map(|e| e.retain() == RetainPolicy::Retain)
            .unwrap_or(false)
    }

    // Typed accessors. A kind/value mismatch can only come from a buggy
    // engine and fails fast.

    pub fn get_class_data(&self, descriptor: &ClassDescriptor) -> Result<Option<Arc<ClassData>>> {
        Ok(self
            .get_class_analysis(ClassAnalysisKind::ClassData, descriptor)?
            .map(|value| match value {
                ClassAnalysisValue::ClassData(data) => data,
                other => panic!("ClassData slot held {:?}", other.kind()),
            }))
    }

    pub fn get_class_context(
        &self,
        descriptor: &ClassDescriptor,
    ) -> Result<Option<Arc<ClassContext>>> {
        Ok(self
            .get_class_analysis(ClassAnalysisKind::ClassContext, descriptor)?
            .map(|value| match value {
                ClassAnalysisValue::ClassContext(context) => context,
                other => panic!("ClassContext slot held {:?}", other.kind()),
            }))
    }

    pub fn get_method_data(
        &self,
        descriptor: &MethodDescriptor,
    ) -> Result<Option<Arc<MethodData>>> {
        Ok(self
            .get_method_analysis(MethodAnalysisKind::MethodData, descriptor)?
            .map(|value| match value {
                MethodAnalysisValue::MethodData(data) => data,
                other => panic!("MethodData slot held {:?}", other.kind()),
            }))
    }

    pub fn get_cfg(&self, descriptor: &MethodDescriptor) -> Result<Option<Arc<Cfg>>> {
        Ok(self
            .get_method_analysis(MethodAnalysisKind::Cfg, descriptor)?
            .map(|value| match value {
                MethodAnalysisValue::Cfg(cfg) => cfg,
                other => panic!("Cfg slot held {:?}", other.kind()),
            }))
    }

    pub fn get_type_dataflow(
        &self,
        descriptor: &MethodDescriptor,
    ) -> Result<Option<Arc<TypeDataflow>>> {
        Ok(self
            .get_method_analysis(MethodAnalysisKind::TypeDataflow, descriptor)?
            .map(|value| match value {
                MethodAnalysisValue::TypeDataflow(dataflow) => dataflow,
                other => panic!("TypeDataflow slot held {:?}", other.kind()),
            }))
    }

    pub fn get_finally_duplicates(
        &self,
        descriptor: &MethodDescriptor,
    ) -> Result<Option<Arc<FinallyDuplicatesInfo>>> {
        Ok(self
            .get_method_analysis(MethodAnalysisKind::FinallyDuplicates, descriptor)?
            .map(|value| match value {
                MethodAnalysisValue::FinallyDuplicates(info) => info,
                other => panic!("FinallyDuplicates slot held {:?}", other.kind()),
            }))
    }

    pub fn get_value_range(
        &self,
        descriptor: &MethodDescriptor,
    ) -> Result<Option<Arc<ValueRangeAnalysis>>> {
        Ok(self
            .get_method_analysis(MethodAnalysisKind::ValueRange, descriptor)?
            .map(|value| match value {
                MethodAnalysisValue::ValueRange(analysis) => analysis,
                other => panic!("ValueRange slot held {:?}", other.kind()),
            }))
    }

    /// Number of live method entries, retained and recomputable alike.
    pub fn method_entry_count(&self) -> usize {
        self.method_entries.read().len()
    }

    /// Number of live class entries.
    pub fn class_entry_count(&self) -> usize {
        self.class_entries.read().len()
    }
}
