//! CFG refinement pipeline.
//!
//! Stages run at most once each (guarded by the stage flags) and only ever
//! remove edges. A failing stage is swallowed: it degrades to "no change"
//! for that stage without aborting CFG construction. When any stage changed
//! the edge set, blocks left unreachable are deleted and the caller commits
//! the mutation through the cache, purging analyses computed against the
//! old shape.

use std::sync::Arc;

use petgraph::stable_graph::NodeIndex;

use crate::cache::AnalysisCache;
use crate::core::descriptors::{ClassDescriptor, MethodDescriptor};
use crate::core::errors::Result;
use crate::core::insn::{CmpOp, Opcode};

use super::{Cfg, EdgeKind, RefinementFlags};

/// Exceptions any call or allocation may raise regardless of declarations.
const UNCHECKED_THROWN: [&str; 2] = ["java/lang/RuntimeException", "java/lang/Error"];

/// Run every pending pipeline stage on `cfg`. Returns whether the edge set
/// changed. Idempotent: a second invocation finds all stage flags set and
/// removes nothing.
pub fn refine_cfg(cfg: &mut Cfg, cache: &AnalysisCache, descriptor: &MethodDescriptor) -> bool {
    let config = cache.config();
    let mut changed = false;

    if cfg.mark_stage(RefinementFlags::ASSERTIONS_PRUNED) {
        let removed = prune_assertion_edges(cfg);
        if removed > 0 {
            log::debug!("{descriptor}: removed {removed} assertion-guarded edges");
            changed = true;
        }
    }

    if config.prune_infeasible_exception_edges
        && cfg.mark_stage(RefinementFlags::EXCEPTION_EDGES_PRUNED)
    {
        match prune_infeasible_exception_edges(cfg, cache, descriptor) {
            Ok(removed) => {
                if removed > 0 {
                    log::debug!("{descriptor}: removed {removed} infeasible exception edges");
                    changed = true;
                }
            }
            Err(error) => {
                log::warn!("{descriptor}: exception-edge pruning degraded to no change: {error}");
            }
        }
    }

    if config.prune_unconditional_thrower_edges
        && cfg.mark_stage(RefinementFlags::THROWERS_PRUNED)
    {
        let removed = prune_thrower_edges(cfg, cache);
        if removed > 0 {
            log::debug!("{descriptor}: removed {removed} edges after always-throwing calls");
            changed = true;
        }
    }

    if changed {
        cfg.prune_unreachable();
    }
    cfg.finish_refinement();
    changed
}

/// Remove the taken edge of conditionals guarded by the compiler-injected
/// `$assertionsDisabled` flag: a `GetStatic` of that exact field
/// immediately followed by the negated branch. Such branches are taken only
/// when assertions are disabled and are treated as permanently not taken.
fn prune_assertion_edges(cfg: &mut Cfg) -> usize {
    let method = Arc::clone(cfg.method());
    let cp = &method.constant_pool;

    let mut guarded_branches = Vec::new();
    for (i, insn) in method.instructions.iter().enumerate() {
        let Opcode::GetStatic { index } = insn.op else {
            continue;
        };
        let Some(next) = method.instructions.get(i + 1) else {
            continue;
        };
        if !matches!(next.op, Opcode::If { cond: CmpOp::Ne, .. }) {
            continue;
        }
        if let Some((_, name, signature)) = cp.field_ref(index) {
            if name == "$assertionsDisabled" && signature == "Z" {
                guarded_branches.push(i + 1);
            }
        }
    }
    if guarded_branches.is_empty() {
        return 0;
    }

    let mut doomed = Vec::new();
    for block in cfg.blocks().collect::<Vec<_>>() {
        let Some((_, last)) = cfg.block(block).range else {
            continue;
        };
        if !guarded_branches.contains(&last) {
            continue;
        }
        for (edge, _, kind) in cfg.outgoing(block) {
            if kind == EdgeKind::IfCmp {
                doomed.push(edge);
            }
        }
    }
    for edge in &doomed {
        cfg.remove_edge(*edge);
    }
    doomed.len()
}

/// What a block can throw, as far as the type dataflow can tell.
enum ThrownSet {
    /// Contains a throw of statically unknown type; nothing is provably
    /// infeasible.
    Unknown,
    Types(Vec<String>),
}

/// Remove exception edges whose source cannot throw anything the handler
/// catches. Requests the type dataflow through the cache, which sees the
/// eagerly cached unrefined graph.
fn prune_infeasible_exception_edges(
    cfg: &mut Cfg,
    cache: &AnalysisCache,
    descriptor: &MethodDescriptor,
) -> Result<usize> {
    if cfg
        .edges()
        .all(|e| cfg.edge_kind(e) != EdgeKind::ExceptionHandler)
    {
        return Ok(0);
    }
    let Some(type_dataflow) = cache.get_type_dataflow(descriptor)? else {
        return Ok(0);
    };
    let method = Arc::clone(cfg.method());

    let mut doomed = Vec::new();
    for edge in cfg.edges().collect::<Vec<_>>() {
        if cfg.edge_kind(edge) != EdgeKind::ExceptionHandler {
            continue;
        }
        let source = cfg.edge_source(edge);
        let handler = cfg.edge_target(edge);
        let Some(handler_pos) = cfg.first_instruction(handler).map(|i| i.pos) else {
            continue;
        };

        let catch_types: Vec<Option<&str>> = method
            .exception_table
            .iter()
            .filter(|e| e.handler_pc == handler_pos)
            .map(|e| e.catch_type.as_deref())
            .collect();
        // An any-catch handler is always feasible.
        if catch_types.iter().any(|c| c.is_none()) {
            continue;
        }

        let thrown = block_thrown_set(cfg, cache, &type_dataflow, source);
        let feasible = match &thrown {
            ThrownSet::Unknown => true,
            ThrownSet::Types(types) => types.iter().any(|thrown_type| {
                catch_types.iter().flatten().any(|catch_type| {
                    types_related(cache, thrown_type, catch_type)
                })
            }),
        };
        if !feasible {
            doomed.push(edge);
        }
    }
    for edge in &doomed {
        cfg.remove_edge(*edge);
    }
    Ok(doomed.len())
}

/// Either direction of the subtype relation keeps the edge alive: the
/// handler may catch a supertype of the thrown type, or a subtype of a
/// broadly typed throw. Hierarchy lookup failures are reported and treated
/// as related.
fn types_related(cache: &AnalysisCache, thrown: &str, catch: &str) -> bool {
    let source = cache.class_source();
    match source.is_subtype_of(thrown, catch) {
        Ok(true) => return true,
        Ok(false) => {}
        Err(error) => {
            cache.report_lookup_failure(&ClassDescriptor::new(catch.to_string()), &error);
            return true;
        }
    }
    match source.is_subtype_of(catch, thrown) {
        Ok(related) => related,
        Err(error) => {
            cache.report_lookup_failure(&ClassDescriptor::new(thrown.to_string()), &error);
            true
        }
    }
}

fn block_thrown_set(
    cfg: &Cfg,
    cache: &AnalysisCache,
    type_dataflow: &crate::analysis::types::TypeDataflow,
    block: NodeIndex,
) -> ThrownSet {
    let method = cfg.method();
    let Some((first, last)) = cfg.block(block).range else {
        return ThrownSet::Types(Vec::new());
    };

    let mut types = Vec::new();
    for index in first..=last {
        let insn = method.instructions.get(index).expect("range in bounds");
        match &insn.op {
            Opcode::InvokeStatic { index: cp_index }
            | Opcode::InvokeVirtual { index: cp_index }
            | Opcode::InvokeSpecial { index: cp_index } => {
                let Some((class, name, signature)) = method.constant_pool.method_ref(*cp_index)
                else {
                    return ThrownSet::Unknown;
                };
                types.extend(cache.class_source().declared_exceptions(class, name, signature));
                types.extend(UNCHECKED_THROWN.iter().map(|s| s.to_string()));
            }
            Opcode::New { .. } | Opcode::GetField { .. } | Opcode::GetStatic { .. } => {
                types.push("java/lang/Error".to_string());
            }
            Opcode::Throw => match type_dataflow.thrown_class(block, index) {
                Some(class) => types.push(class),
                None => return ThrownSet::Unknown,
            },
            _ => {}
        }
    }
    ThrownSet::Types(types)
}

/// Remove fall-through successors of calls statically known to always
/// throw.
fn prune_thrower_edges(cfg: &mut Cfg, cache: &AnalysisCache) -> usize {
    let method = Arc::clone(cfg.method());
    let source = cache.class_source();

    let mut doomed = Vec::new();
    for block in cfg.blocks().collect::<Vec<_>>() {
        let Some((_, last)) = cfg.block(block).range else {
            continue;
        };
        let insn = method.instructions.get(last).expect("range in bounds");
        let cp_index = match insn.op {
            Opcode::InvokeStatic { index }
            | Opcode::InvokeVirtual { index }
            | Opcode::InvokeSpecial { index } => index,
            _ => continue,
        };
        let Some((class, name, signature)) = method.constant_pool.method_ref(cp_index) else {
            continue;
        };
        if !source.always_throws(class, name, signature) {
            continue;
        }
        for (edge, _, kind) in cfg.outgoing(block) {
            if kind == EdgeKind::FallThrough {
                doomed.push(edge);
            }
        }
    }
    for edge in &doomed {
        cfg.remove_edge(*edge);
    }
    doomed.len()
}
