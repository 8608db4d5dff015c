//! Redundant integral-condition detection.
//!
//! Tracks parameters and write-once locals, records every decoded
//! comparison of a tracked variable against a constant, refines the
//! variable's value partition at each constant, and then replays the CFG
//! once per minimal sub-range to see which side of every comparison can
//! actually be reached. A comparison reached on only one side is dead code
//! on the other — unless a compiler-duplicated `finally` copy of the same
//! comparison disagrees, in which case the report is suppressed.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use petgraph::stable_graph::{EdgeIndex, NodeIndex};
use serde::Serialize;

use crate::cache::AnalysisCache;
use crate::cfg::{Cfg, EdgeKind};
use crate::core::descriptors::MethodDescriptor;
use crate::core::errors::Result;
use crate::core::insn::{CmpOp, Opcode};
use crate::core::method::MethodData;
use crate::core::sig;

use super::ranges::LongRangeSet;

/// Position of one instruction, with its block label for successor lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct InsnLocation {
    pub position: u32,
    pub block: usize,
}

/// One provably one-sided comparison.
#[derive(Debug, Clone, Serialize)]
pub struct RedundantCondition {
    /// The comparison instruction.
    pub location: InsnLocation,
    /// Condition of the side that can never execute, e.g. `x <= 5`.
    pub condition: String,
    /// Whether the dead successor lies outside every sub-range's reachable
    /// set (provably unreachable) rather than merely unproven.
    pub dead_code_unreachable: bool,
    pub dead_location: Option<InsnLocation>,
    pub live_location: Option<InsnLocation>,
    /// Primitive signature of the compared variable.
    pub signature: &'static str,
    /// The comparison is decided by the declared type alone.
    pub by_type: bool,
    /// The compared constant.
    pub number: i64,
    /// The constant sits on a type border or was already compared on the
    /// path leading here.
    pub border: bool,
}

/// Sorted redundant-condition report for one method.
#[derive(Debug, Clone, Serialize)]
pub struct ValueRangeAnalysis {
    redundant_conditions: Vec<RedundantCondition>,
}

impl ValueRangeAnalysis {
    pub fn redundant_conditions(&self) -> &[RedundantCondition] {
        &self.redundant_conditions
    }
}

/// One recorded conditional edge of a tracked variable.
#[derive(Debug)]
struct Branch {
    var_name: String,
    true_condition: String,
    false_condition: String,
    true_set: LongRangeSet,
    true_reached: LongRangeSet,
    false_reached: LongRangeSet,
    number: i64,
    /// Type borders plus constants compared on paths reaching this branch.
    numbers: HashSet<i64>,
}

impl Branch {
    fn new(
        var_name: &str,
        true_condition: String,
        false_condition: String,
        true_set: LongRangeSet,
        number: i64,
    ) -> Self {
        let mut numbers = HashSet::new();
        true_set.add_borders_to(&mut numbers);
        Self {
            var_name: var_name.to_string(),
            true_condition: fix_condition(true_condition),
            false_condition: fix_condition(false_condition),
            true_reached: true_set.empty(),
            false_reached: true_set.empty(),
            true_set,
            number,
            numbers,
        }
    }
}

/// Boolean conditions read better in positive form.
fn fix_condition(condition: String) -> String {
    match condition.as_str() {
        "!= true" => "== false".to_string(),
        "!= false" => "== true".to_string(),
        _ => condition,
    }
}

/// Per-variable tracking state.
#[derive(Debug)]
struct VariableData {
    /// Common refinement of every comparison boundary seen so far, over
    /// the variable's declared-type domain.
    split_set: LongRangeSet,
    /// Comparison edges recorded for this variable.
    edges: Vec<EdgeIndex>,
    /// Union of blocks visited by any sub-range replay.
    reachable_blocks: HashSet<usize>,
}

/// A comparison decoded from the instruction stream.
struct Condition {
    op: CmpOp,
    var: VarOperand,
    number: i64,
}

struct VarOperand {
    slot: u16,
    name: String,
    signature: String,
}

enum Operand {
    Var(VarOperand),
    Const(i64),
    /// A `LongCmp` producing the int consumed by a one-operand branch.
    LongCompare,
    /// Anything the decoder does not model.
    Opaque,
}

/// Backwards instruction iterator that crosses into a predecessor block
/// when it is the sole fall-through source, mirroring how straight-line
/// code is split only by intervening control flow.
struct BackIter<'a> {
    cfg: &'a Cfg,
    block: NodeIndex,
    next: Option<usize>,
}

impl<'a> BackIter<'a> {
    fn new(cfg: &'a Cfg, block: NodeIndex) -> Self {
        let next = cfg.block(block).range.map(|(_, last)| last);
        Self { cfg, block, next }
    }
}

impl Iterator for BackIter<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        let result = self.next?;
        let (first, _) = self.cfg.block(self.block).range?;
        if result == first {
            let incoming = self.cfg.incoming(self.block);
            match incoming.as_slice() {
                [(_, source, EdgeKind::FallThrough)]
                    if self.cfg.block(*source).range.is_some() =>
                {
                    self.block = *source;
                    self.next = result.checked_sub(1);
                }
                _ => self.next = None,
            }
        } else {
            self.next = Some(result - 1);
        }
        Some(result)
    }
}

/// Operand decoding context: the instruction stream plus everything that
/// names and types local slots.
struct Context<'a> {
    method: &'a MethodData,
    params: &'a HashMap<u16, (String, String)>,
}

impl Context<'_> {
    fn extract_condition(&self, iter: &mut BackIter<'_>) -> Option<Condition> {
        let index = iter.next()?;
        match self.method.instructions.get(index)?.op {
            Opcode::IfCmp { cond, .. } => self.extract_two_arg_condition(iter, cond, "I"),
            Opcode::If { cond, .. } => match self.extract_value(iter, "I")? {
                Operand::Var(var) => Some(Condition {
                    op: cond,
                    var,
                    number: 0,
                }),
                Operand::LongCompare => self.extract_two_arg_condition(iter, cond, "J"),
                _ => None,
            },
            _ => None,
        }
    }

    fn extract_two_arg_condition(
        &self,
        iter: &mut BackIter<'_>,
        mut op: CmpOp,
        def_signature: &str,
    ) -> Option<Condition> {
        let second = self.extract_value(iter, def_signature)?;
        if matches!(second, Operand::Opaque | Operand::LongCompare) {
            return None;
        }
        let first = self.extract_value(iter, def_signature)?;
        if matches!(first, Operand::Opaque | Operand::LongCompare) {
            return None;
        }
        let (var, number) = match (first, second) {
            (Operand::Var(var), Operand::Const(number)) => (var, number),
            (Operand::Const(number), Operand::Var(var)) => {
                // The variable was the right operand; flip so it reads as
                // the left one.
                op = op.flipped();
                (var, number)
            }
            _ => return None,
        };
        Some(Condition { op, var, number })
    }

    fn extract_value(&self, iter: &mut BackIter<'_>, def_signature: &str) -> Option<Operand> {
        let index = iter.next()?;
        let insn = self.method.instructions.get(index)?;
        match &insn.op {
            Opcode::Push { value, .. } => Some(Operand::Const(*value)),
            Opcode::LoadConst { index: cp_index } => self
                .method
                .constant_pool
                .get(*cp_index)
                .and_then(|constant| constant.integral_value())
                .map(Operand::Const)
                .or(Some(Operand::Opaque)),
            Opcode::LongCmp => Some(Operand::LongCompare),
            Opcode::Load { slot, .. } => {
                let (name, signature) = self.resolve_slot(*slot, insn.pos, def_signature);
                Some(Operand::Var(VarOperand {
                    slot: *slot,
                    name,
                    signature,
                }))
            }
            _ => Some(Operand::Opaque),
        }
    }

    /// Name and signature of a slot: debug table first, then the parameter
    /// map, then a synthesized name with the comparison's default width.
    fn resolve_slot(&self, slot: u16, pos: u32, def_signature: &str) -> (String, String) {
        if let Some(entry) = self
            .method
            .local_variables
            .as_ref()
            .and_then(|table| table.lookup(slot, pos))
        {
            return (entry.name.clone(), entry.signature.clone());
        }
        if let Some((name, signature)) = self.params.get(&slot) {
            return (name.clone(), signature.clone());
        }
        (format!("local${slot}"), def_signature.to_string())
    }
}

/// Slot-indexed parameter names and signatures; wide types occupy two
/// slots, instance methods reserve slot 0 for `this`.
fn parameter_types(descriptor: &MethodDescriptor) -> Result<HashMap<u16, (String, String)>> {
    let mut params = HashMap::new();
    let mut slot = 0u16;
    if !descriptor.is_static() {
        params.insert(
            slot,
            (
                "this".to_string(),
                format!("L{};", descriptor.class().class_name()),
            ),
        );
        slot += 1;
    }
    for (i, param) in sig::parse_method_params(descriptor.signature())?
        .into_iter()
        .enumerate()
    {
        let width = sig::slot_width(&param);
        params.insert(slot, (format!("arg{i}"), param));
        slot += width;
    }
    Ok(params)
}

struct Collected {
    variables: HashMap<u16, VariableData>,
    branches: HashMap<EdgeIndex, Branch>,
}

/// Walk every comparison edge and record branches for tracked variables.
fn collect_branches(
    cfg: &Cfg,
    method: &MethodData,
    descriptor: &MethodDescriptor,
) -> Result<Collected> {
    let params = parameter_types(descriptor)?;

    let mut write_counts: HashMap<u16, u32> = HashMap::new();
    for insn in method.instructions.iter() {
        if let Some(slot) = insn.op.written_slot() {
            *write_counts.entry(slot).or_default() += 1;
        }
    }

    let context = Context {
        method,
        params: &params,
    };

    let mut variables: HashMap<u16, VariableData> = HashMap::new();
    let mut branches: HashMap<EdgeIndex, Branch> = HashMap::new();

    for edge in cfg.edges().collect::<Vec<_>>() {
        if cfg.edge_kind(edge) != EdgeKind::IfCmp {
            continue;
        }
        let source = cfg.edge_source(edge);
        let Some(condition) = context.extract_condition(&mut BackIter::new(cfg, source)) else {
            continue;
        };

        // Only write-once variables are tracked: one store for a local,
        // none for a parameter (its definition point is method entry).
        let slot = condition.var.slot;
        let writes = write_counts.get(&slot).copied().unwrap_or(0);
        let write_budget = if params.contains_key(&slot) { 0 } else { 1 };
        if writes > write_budget {
            variables.remove(&slot);
            continue;
        }

        let data = match variables.entry(slot) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let Some(split_set) = LongRangeSet::full(&condition.var.signature) else {
                    continue;
                };
                entry.insert(VariableData {
                    split_set,
                    edges: Vec::new(),
                    reachable_blocks: HashSet::new(),
                })
            }
        };

        let number = condition.number;
        let rendered = convert_number(data.split_set.signature(), number);
        let name = &condition.var.name;
        let branch = match condition.op {
            CmpOp::Gt => Branch::new(
                name,
                format!("> {rendered}"),
                format!("<= {rendered}"),
                data.split_set.gt(number),
                number,
            ),
            CmpOp::Le => Branch::new(
                name,
                format!("<= {rendered}"),
                format!("> {rendered}"),
                data.split_set.le(number),
                number,
            ),
            CmpOp::Ge => Branch::new(
                name,
                format!(">= {rendered}"),
                format!("< {rendered}"),
                data.split_set.ge(number),
                number,
            ),
            CmpOp::Lt => Branch::new(
                name,
                format!("< {rendered}"),
                format!(">= {rendered}"),
                data.split_set.lt(number),
                number,
            ),
            CmpOp::Eq => Branch::new(
                name,
                format!("== {rendered}"),
                format!("!= {rendered}"),
                LongRangeSet::eq(&mut data.split_set, number),
                number,
            ),
            CmpOp::Ne => Branch::new(
                name,
                format!("!= {rendered}"),
                format!("== {rendered}"),
                LongRangeSet::ne(&mut data.split_set, number),
                number,
            ),
        };
        data.edges.push(edge);
        branches.insert(edge, branch);
    }

    Ok(Collected {
        variables,
        branches,
    })
}

/// Depth-first replay of the CFG for one sub-range of one variable.
///
/// Within one minimal sub-range a recorded branch is deterministic: the
/// sub-range either lies inside the branch's true set or misses it
/// entirely. The walk therefore leaves a branch block only through the
/// outcome's successor — the taken edge when the sub-range intersects the
/// true set, every other edge when it does not — updating the branch's
/// reach sets along the way.
fn walk_cfg(
    cfg: &Cfg,
    sub_range: &LongRangeSet,
    var_edges: &HashSet<EdgeIndex>,
    branches: &mut HashMap<EdgeIndex, Branch>,
    reached: &mut HashSet<usize>,
) {
    struct WalkState {
        numbers: HashSet<i64>,
        node: NodeIndex,
    }

    let mut stack = vec![WalkState {
        numbers: HashSet::new(),
        node: cfg.entry(),
    }];
    reached.insert(cfg.label(cfg.entry()));

    while let Some(state) = stack.pop() {
        let outgoing = cfg.outgoing(state.node);
        let recorded = outgoing
            .iter()
            .find(|(edge, _, _)| var_edges.contains(edge))
            .map(|&(edge, target, _)| (edge, target));

        if let Some((edge, target)) = recorded {
            let branch = branches.get_mut(&edge).expect("recorded edge has a branch");
            branch.numbers.extend(state.numbers.iter().copied());
            let mut numbers = state.numbers.clone();
            numbers.insert(branch.number);

            if branch.true_set.intersects(sub_range) {
                branch.true_reached.add(sub_range);
                if reached.insert(cfg.label(target)) {
                    stack.push(WalkState {
                        numbers,
                        node: target,
                    });
                }
            } else {
                branch.false_reached.add(sub_range);
                for (other, other_target, _) in outgoing {
                    if other == edge {
                        continue;
                    }
                    if reached.insert(cfg.label(other_target)) {
                        stack.push(WalkState {
                            numbers: numbers.clone(),
                            node: other_target,
                        });
                    }
                }
            }
            continue;
        }

        for (_, target, _) in outgoing {
            if reached.insert(cfg.label(target)) {
                stack.push(WalkState {
                    numbers: state.numbers.clone(),
                    node: target,
                });
            }
        }
    }
}

/// Byte windows guarded by the compiler's `$assertionsDisabled` pattern;
/// comparisons inside them belong to assertion plumbing, not user logic.
fn assertion_windows(method: &MethodData) -> Vec<(u32, u32)> {
    let mut windows = Vec::new();
    let instructions = &method.instructions;
    for (i, insn) in instructions.iter().enumerate() {
        let Opcode::GetStatic { index } = insn.op else {
            continue;
        };
        let Some(next) = instructions.get(i + 1) else {
            continue;
        };
        let Opcode::If {
            cond: CmpOp::Ne,
            target,
        } = next.op
        else {
            continue;
        };
        if let Some((_, name, signature)) = method.constant_pool.field_ref(index) {
            if name == "$assertionsDisabled" && signature == "Z" {
                windows.push((next.pos, target));
            }
        }
    }
    windows
}

/// Run the analysis for one method. `None` means nothing to report.
pub fn analyze(
    cache: &AnalysisCache,
    descriptor: &MethodDescriptor,
    cfg: &Arc<Cfg>,
    method: &Arc<MethodData>,
) -> Result<Option<ValueRangeAnalysis>> {
    let Collected {
        mut variables,
        mut branches,
    } = collect_branches(cfg, method, descriptor)?;

    // Replay each variable's partition. Redundancy needs at least two
    // comparisons of the same variable; single-branch variables skip the
    // walk and can never report.
    for data in variables.values_mut() {
        if data.edges.len() < 2 {
            continue;
        }
        let edge_set: HashSet<EdgeIndex> = data.edges.iter().copied().collect();
        for sub_range in data.split_set.sub_ranges().collect::<Vec<_>>() {
            let mut reached = HashSet::new();
            walk_cfg(cfg, &sub_range, &edge_set, &mut branches, &mut reached);
            data.reachable_blocks.extend(reached);
        }
    }

    let mut finally_info = None;
    let mut redundant = Vec::new();
    for data in variables.values() {
        for &edge in &data.edges {
            let branch = &branches[&edge];
            if branch.true_reached.is_empty() == branch.false_reached.is_empty() {
                continue;
            }

            // Reconcile against compiler-duplicated finally copies: if any
            // copy of this comparison lands on the other side, the
            // disagreement is an artifact of duplication, not dead code.
            if finally_info.is_none() {
                finally_info = cache.get_finally_duplicates(descriptor)?;
            }
            if let Some(info) = &finally_info {
                let duplicates = info.duplicate_edges(cfg, edge);
                if !duplicates.is_empty() {
                    let mut true_value = !branch.true_reached.is_empty();
                    let mut false_value = !branch.false_reached.is_empty();
                    for duplicate in duplicates {
                        if let Some(dup_branch) = branches.get(&duplicate) {
                            true_value |= !dup_branch.true_reached.is_empty();
                            false_value |= !dup_branch.false_reached.is_empty();
                        }
                    }
                    if true_value && false_value {
                        log::debug!(
                            "{descriptor}: suppressing report at {:?}; finally copies disagree",
                            cfg.last_instruction(cfg.edge_source(edge)).map(|i| i.pos)
                        );
                        continue;
                    }
                }
            }

            let source = cfg.edge_source(edge);
            let true_target = Some(cfg.edge_target(edge));
            let false_target = cfg.successor_with_kind(source, EdgeKind::FallThrough);
            let (condition, dead_target, live_target) = if branch.true_reached.is_empty() {
                (
                    format!("{} {}", branch.var_name, branch.true_condition),
                    true_target,
                    false_target,
                )
            } else {
                (
                    format!("{} {}", branch.var_name, branch.false_condition),
                    false_target,
                    true_target,
                )
            };

            let Some(location) = insn_location(cfg, source) else {
                continue;
            };
            let dead_code_unreachable = dead_target
                .map(|t| !data.reachable_blocks.contains(&cfg.label(t)))
                .unwrap_or(false);
            redundant.push(RedundantCondition {
                location,
                condition,
                dead_code_unreachable,
                dead_location: dead_target.and_then(|t| block_location(cfg, t)),
                live_location: live_target.and_then(|t| block_location(cfg, t)),
                signature: branch.true_set.signature(),
                by_type: branch.true_set.is_empty() || branch.true_set.is_full(),
                number: branch.number,
                border: branch.numbers.contains(&branch.number),
            });
        }
    }

    if redundant.is_empty() {
        return Ok(None);
    }

    let windows = assertion_windows(method);
    if !windows.is_empty() {
        redundant.retain(|condition| {
            !windows
                .iter()
                .any(|&(start, end)| condition.location.position >= start
                    && condition.location.position < end)
        });
    }
    redundant.sort_by_key(|condition| condition.location);
    Ok(Some(ValueRangeAnalysis {
        redundant_conditions: redundant,
    }))
}

fn insn_location(cfg: &Cfg, block: NodeIndex) -> Option<InsnLocation> {
    cfg.last_instruction(block).map(|insn| InsnLocation {
        position: insn.pos,
        block: cfg.label(block),
    })
}

fn block_location(cfg: &Cfg, block: NodeIndex) -> Option<InsnLocation> {
    cfg.first_instruction(block).map(|insn| InsnLocation {
        position: insn.pos,
        block: cfg.label(block),
    })
}

/// Human-readable rendering of a compared constant, by variable type.
fn convert_number(signature: &str, value: i64) -> String {
    match signature {
        "Z" => (if value == 0 { "false" } else { "true" }).to_string(),
        "C" => match value {
            0x0A => "'\\n'".to_string(),
            0x0D => "'\\r'".to_string(),
            0x08 => "'\\b'".to_string(),
            0x09 => "'\\t'".to_string(),
            0x27 => "'\\''".to_string(),
            0x5C => "'\\\\'".to_string(),
            32..=127 => format!("'{}'", value as u8 as char),
            _ => convert_plain(value),
        },
        "I" => {
            if (32..128).contains(&value) {
                format!("{value} ('{}')", value as u8 as char)
            } else {
                convert_plain(value)
            }
        }
        _ => convert_plain(value),
    }
}

fn convert_plain(value: i64) -> String {
    if value == i64::MIN {
        return "MIN_VALUE".to_string();
    }
    if value == i64::MAX {
        return "MAX_VALUE".to_string();
    }
    let suffix = if value > i64::from(i32::MAX) || value < i64::from(i32::MIN) {
        "L"
    } else {
        ""
    };
    if value > 128 {
        format!("{value}{suffix} (0x{value:X}{suffix})")
    } else {
        format!("{value}{suffix}")
    }
}
