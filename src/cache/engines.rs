//! Default analysis engines, one per kind.
//!
//! Engines are flat: free-standing units taking the cache handle
//! explicitly, pulling their dependencies back out of the cache instead of
//! declaring them.

use std::collections::HashMap;
use std::sync::Arc;

use crate::analysis::{finally, value_range};
use crate::analysis::types::TypeDataflow;
use crate::cfg::{builder, refine};
use crate::core::descriptors::{ClassDescriptor, MethodDescriptor};
use crate::core::errors::{AnalysisError, Result};
use crate::core::method::{ClassData, MethodData};

use super::{
    AnalysisCache, ClassAnalysisEngine, ClassAnalysisKind, ClassAnalysisValue,
    MethodAnalysisEngine, MethodAnalysisKind, MethodAnalysisValue, RetainPolicy,
};

/// Per-class aggregate: a method lookup index over the retained
/// `ClassData`. Cheap to recompute; the designated non-retained example.
pub struct ClassContext {
    class: Arc<ClassData>,
    method_index: HashMap<(String, String), usize>,
}

impl ClassContext {
    fn new(class: Arc<ClassData>) -> Self {
        let method_index = class
            .methods
            .iter()
            .enumerate()
            .map(|(i, m)| ((m.name.clone(), m.signature.clone()), i))
            .collect();
        Self {
            class,
            method_index,
        }
    }

    pub fn class(&self) -> &Arc<ClassData> {
        &self.class
    }

    pub fn method_data(&self, name: &str, signature: &str) -> Option<&Arc<MethodData>> {
        let index = self
            .method_index
            .get(&(name.to_string(), signature.to_string()))?;
        self.class.methods.get(*index)
    }

    /// Descriptors of every method in the class, in declaration order.
    pub fn method_descriptors(&self) -> Vec<MethodDescriptor> {
        self.class
            .methods
            .iter()
            .map(|m| {
                MethodDescriptor::new(
                    self.class.descriptor.clone(),
                    m.name.clone(),
                    m.signature.clone(),
                    m.access.is_static,
                )
            })
            .collect()
    }
}

pub(super) fn default_class_engines() -> HashMap<ClassAnalysisKind, Box<dyn ClassAnalysisEngine>> {
    let mut engines: HashMap<ClassAnalysisKind, Box<dyn ClassAnalysisEngine>> = HashMap::new();
    engines.insert(ClassAnalysisKind::ClassData, Box::new(ClassDataEngine));
    engines.insert(ClassAnalysisKind::ClassContext, Box::new(ClassContextEngine));
    engines
}

pub(super) fn default_method_engines() -> HashMap<MethodAnalysisKind, Box<dyn MethodAnalysisEngine>>
{
    let mut engines: HashMap<MethodAnalysisKind, Box<dyn MethodAnalysisEngine>> = HashMap::new();
    engines.insert(MethodAnalysisKind::MethodData, Box::new(MethodDataEngine));
    engines.insert(MethodAnalysisKind::Cfg, Box::new(CfgEngine));
    engines.insert(MethodAnalysisKind::TypeDataflow, Box::new(TypeDataflowEngine));
    engines.insert(
        MethodAnalysisKind::FinallyDuplicates,
        Box::new(FinallyDuplicatesEngine),
    );
    engines.insert(MethodAnalysisKind::ValueRange, Box::new(ValueRangeEngine));
    engines
}

/// Resolves a class through the loader. Retained: downstream comparisons
/// rely on object identity of the parsed structure.
struct ClassDataEngine;

impl ClassAnalysisEngine for ClassDataEngine {
    fn retain(&self) -> RetainPolicy {
        RetainPolicy::Retain
    }

    fn analyze(
        &self,
        cache: &AnalysisCache,
        descriptor: &ClassDescriptor,
    ) -> Result<Option<ClassAnalysisValue>> {
        match cache.class_source().load_class(descriptor) {
            Ok(class) => Ok(Some(ClassAnalysisValue::ClassData(class))),
            Err(error) => {
                if error.is_missing_class() {
                    cache.report_lookup_failure(descriptor, &error);
                }
                Err(error)
            }
        }
    }
}

struct ClassContextEngine;

impl ClassAnalysisEngine for ClassContextEngine {
    fn analyze(
        &self,
        cache: &AnalysisCache,
        descriptor: &ClassDescriptor,
    ) -> Result<Option<ClassAnalysisValue>> {
        let Some(class) = cache.get_class_data(descriptor)? else {
            return Ok(None);
        };
        Ok(Some(ClassAnalysisValue::ClassContext(Arc::new(
            ClassContext::new(class),
        ))))
    }
}

/// Resolves a method descriptor to its decoded body. Retained alongside
/// the class it came from.
struct MethodDataEngine;

impl MethodAnalysisEngine for MethodDataEngine {
    fn retain(&self) -> RetainPolicy {
        RetainPolicy::Retain
    }

    fn analyze(
        &self,
        cache: &AnalysisCache,
        descriptor: &MethodDescriptor,
    ) -> Result<Option<MethodAnalysisValue>> {
        let Some(class) = cache.get_class_data(descriptor.class())? else {
            return Ok(None);
        };
        let method = class
            .find_method(descriptor.name(), descriptor.signature())
            .ok_or_else(|| AnalysisError::MethodNotFound {
                descriptor: descriptor.clone(),
            })?;
        Ok(Some(MethodAnalysisValue::MethodData(Arc::clone(method))))
    }
}

/// Builds the raw CFG, caches it eagerly, runs the refinement pipeline and
/// commits the result.
struct CfgEngine;

impl MethodAnalysisEngine for CfgEngine {
    fn analyze(
        &self,
        cache: &AnalysisCache,
        descriptor: &MethodDescriptor,
    ) -> Result<Option<MethodAnalysisValue>> {
        let Some(method) = cache.get_method_data(descriptor)? else {
            return Ok(None);
        };
        if !method.has_code() {
            return Ok(None);
        }
        if method.instructions.len() > cache.config().max_method_instructions {
            log::debug!(
                "skipping oversized method {descriptor} ({} instructions)",
                method.instructions.len()
            );
            return Ok(None);
        }

        let raw = Arc::new(builder::build_cfg(Arc::clone(&method))?);
        // Cache before pruning: pruning may request dataflow results that
        // recursively request this same CFG.
        cache.eagerly_put_method(descriptor, MethodAnalysisValue::Cfg(Arc::clone(&raw)));

        let mut work = (*raw).clone();
        let structural_change = refine::refine_cfg(&mut work, cache, descriptor);
        let committed = cache.commit_cfg(descriptor, work, structural_change);
        Ok(Some(MethodAnalysisValue::Cfg(committed)))
    }
}

struct TypeDataflowEngine;

impl MethodAnalysisEngine for TypeDataflowEngine {
    fn analyze(
        &self,
        cache: &AnalysisCache,
        descriptor: &MethodDescriptor,
    ) -> Result<Option<MethodAnalysisValue>> {
        let Some(cfg) = cache.get_cfg(descriptor)? else {
            return Ok(None);
        };
        let dataflow = TypeDataflow::compute(cfg, descriptor, cache.config())?;
        Ok(Some(MethodAnalysisValue::TypeDataflow(Arc::new(dataflow))))
    }
}

struct FinallyDuplicatesEngine;

impl MethodAnalysisEngine for FinallyDuplicatesEngine {
    fn analyze(
        &self,
        cache: &AnalysisCache,
        descriptor: &MethodDescriptor,
    ) -> Result<Option<MethodAnalysisValue>> {
        let Some(method) = cache.get_method_data(descriptor)? else {
            return Ok(None);
        };
        let info = if method.has_code() {
            finally::analyze(&method)
        } else {
            finally::FinallyDuplicatesInfo::none()
        };
        Ok(Some(MethodAnalysisValue::FinallyDuplicates(Arc::new(info))))
    }
}

struct ValueRangeEngine;

impl MethodAnalysisEngine for ValueRangeEngine {
    fn analyze(
        &self,
        cache: &AnalysisCache,
        descriptor: &MethodDescriptor,
    ) -> Result<Option<MethodAnalysisValue>> {
        let Some(method) = cache.get_method_data(descriptor)? else {
            return Ok(None);
        };
        if method.access.is_native || method.access.is_abstract || method.access.is_synthetic {
            return Ok(None);
        }
        let Some(cfg) = cache.get_cfg(descriptor)? else {
            return Ok(None);
        };
        Ok(value_range::analyze(cache, descriptor, &cfg, &method)?
            .map(|analysis| MethodAnalysisValue::ValueRange(Arc::new(analysis))))
    }
}
