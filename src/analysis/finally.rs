//! Duplicate-`finally`-body detection.
//!
//! Compilers emit a `finally` body once as an any-catch exception handler
//! and again inline along every normal exit of the protected region.
//! Analyses that reason per-edge double-count or misjudge reachability
//! unless they recognize these copies as the same code. This pass finds the
//! copies from the raw instruction list alone, independent of the CFG.
//!
//! The handler idiom checked for: a store of the incoming exception,
//! a straight-line body, a load of the same local and a rethrow. The body
//! window between store and rethrow is the canonical copy; candidate
//! windows elsewhere match if they are structurally equal up to a
//! consistent renaming of local slots (a mapping is established only by a
//! store) and up to branch targets that agree relatively or jump just past
//! the window.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use petgraph::stable_graph::EdgeIndex;

use crate::cfg::Cfg;
use crate::core::insn::{InstructionList, Opcode, ValueKind};
use crate::core::method::MethodData;

/// Immutable duplicate-window facts for one method. The empty value is the
/// sentinel for "no finally duplication here".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FinallyDuplicatesInfo {
    positions: Vec<u32>,
    /// One map per handler group: window start to exclusive window end.
    groups: Vec<BTreeMap<u32, u32>>,
}

impl FinallyDuplicatesInfo {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    /// Transitive closure of the positions that are copies of `pos`,
    /// excluding `pos` itself. Positions translate through every group's
    /// window offset until a fixed point; each pass can only add new
    /// positions, so the loop is bounded by the number of groups.
    pub fn duplicates_of(&self, pos: u32) -> BTreeSet<u32> {
        let mut current = BTreeSet::new();
        current.insert(pos);
        if self.groups.is_empty() {
            return BTreeSet::new();
        }
        loop {
            let mut changed = false;
            for group in &self.groups {
                for i in current.clone() {
                    let Some(offset) = self.offset_in_window(group, i) else {
                        continue;
                    };
                    for &window_start in group.keys() {
                        let number = self.insn_number(window_start) + offset;
                        let Some(&dup_pos) = self.positions.get(number) else {
                            continue;
                        };
                        if current.insert(dup_pos) {
                            changed = true;
                        }
                    }
                }
            }
            // Another pass can only matter when windows from distinct
            // groups overlap (nested try/finally).
            if !(changed && self.groups.len() > 1) {
                break;
            }
        }
        current.remove(&pos);
        current
    }

    /// Edges of the same kind whose source instruction is a copy of the
    /// given edge's source instruction.
    pub fn duplicate_edges(&self, cfg: &Cfg, edge: EdgeIndex) -> Vec<EdgeIndex> {
        let Some(last) = cfg.last_instruction(cfg.edge_source(edge)) else {
            return Vec::new();
        };
        let duplicates = self.duplicates_of(last.pos);
        if duplicates.is_empty() {
            return Vec::new();
        }
        let kind = cfg.edge_kind(edge);
        cfg.edges()
            .filter(|&other| {
                cfg.edge_kind(other) == kind
                    && cfg
                        .last_instruction(cfg.edge_source(other))
                        .map(|insn| duplicates.contains(&insn.pos))
                        .unwrap_or(false)
            })
            .collect()
    }

    /// Instruction-number offset of `pos` into its enclosing window of
    /// `group`, if any.
    fn offset_in_window(&self, group: &BTreeMap<u32, u32>, pos: u32) -> Option<usize> {
        let (&start, &end) = group.range(..=pos).next_back()?;
        if end <= pos {
            return None;
        }
        Some(self.insn_number(pos) - self.insn_number(start))
    }

    fn insn_number(&self, pos: u32) -> usize {
        self.positions.binary_search(&pos).unwrap_or_else(|i| i)
    }
}

/// Per-handler scratch state while scanning for duplicates.
struct TryBlock {
    catch_any_address: u32,
    incorrect: bool,
    /// Protected ranges of the handler (start to exclusive end).
    normal_blocks: BTreeMap<u32, u32>,
    /// Discovered duplicate windows, canonical copy included.
    duplicates: BTreeMap<u32, u32>,
}

impl TryBlock {
    fn new(catch_any_address: u32) -> Self {
        Self {
            catch_any_address,
            incorrect: false,
            normal_blocks: BTreeMap::new(),
            duplicates: BTreeMap::new(),
        }
    }

    fn update(
        &mut self,
        exception_targets: &BTreeSet<u32>,
        branch_targets: &BTreeSet<u32>,
        il: &InstructionList,
    ) {
        // The handler must start by storing the exception...
        let Some(handler_index) = il.index_of(self.catch_any_address) else {
            self.incorrect = true;
            return;
        };
        let Some(Opcode::Store {
            kind: ValueKind::Ref,
            slot,
        }) = il.get(handler_index).map(|i| i.op.clone())
        else {
            self.incorrect = true;
            return;
        };

        let Some(first_body) = il.get(handler_index + 1) else {
            self.incorrect = true;
            return;
        };
        let start = first_body.pos;

        // ...run a straight-line body, and end by rethrowing that local.
        let mut index = handler_index;
        let end;
        loop {
            index += 1;
            let Some(insn) = il.get(index) else {
                self.incorrect = true;
                return;
            };
            if matches!(insn.op, Opcode::Load { kind: ValueKind::Ref, slot: s } if s == slot) {
                if !matches!(il.get(index + 1).map(|i| &i.op), Some(Opcode::Throw)) {
                    self.incorrect = true;
                    return;
                }
                end = insn.pos;
                index += 1;
                break;
            }
        }

        self.duplicates.insert(start, end);
        let length = end - start;
        self.normal_blocks
            .insert(self.catch_any_address, self.catch_any_address);

        // Scan the gap before each protected range for inline copies.
        let ranges: Vec<(u32, u32)> = self
            .normal_blocks
            .iter()
            .map(|(&s, &e)| (s, e))
            .collect();
        let mut last_end: Option<u32> = None;
        for (range_start, range_end) in ranges {
            if let Some(gap_start) = last_end {
                if range_start > gap_start {
                    let mut candidate_start = gap_start;
                    let mut copy_end = equal_blocks(il, start, candidate_start, length);
                    if let Some(found) = copy_end.filter(|&e| e <= range_start) {
                        self.duplicates.insert(candidate_start, found);
                        let mut resume = found;
                        // Chase further copies reachable through branch or
                        // exception targets left in the gap.
                        loop {
                            let next_exception =
                                exception_targets.range(resume + 1..).next().copied();
                            let next_branch = branch_targets.range(resume + 1..).next().copied();
                            let new_key = match (next_exception, next_branch) {
                                (Some(a), Some(b)) => a.min(b),
                                (Some(a), None) => a,
                                (None, Some(b)) => b,
                                (None, None) => break,
                            };
                            if new_key > range_start {
                                break;
                            }
                            let Some(mut target_index) = il.index_of(new_key) else {
                                break;
                            };
                            if exception_targets.contains(&new_key) {
                                // skip the handler's own exception store
                                target_index += 1;
                            }
                            let Some(target) = il.get(target_index) else {
                                break;
                            };
                            candidate_start = target.pos;
                            copy_end = equal_blocks(il, start, candidate_start, length);
                            match copy_end.filter(|&e| e <= range_start) {
                                Some(found) => {
                                    self.duplicates.insert(candidate_start, found);
                                    resume = found;
                                }
                                None => resume = new_key,
                            }
                        }
                    }
                }
            }
            last_end = Some(range_end);
        }

        // The copy placed right after the rethrow, if the code continues.
        if let Some(after) = il.get(index + 1) {
            if let Some(found) = equal_blocks(il, start, after.pos, length) {
                self.duplicates.insert(after.pos, found);
            }
        }
    }
}

/// Structural window equality. Returns the exclusive end of the second
/// window when the `length` bytes starting at `start1` match the code at
/// `start2` under a consistent slot renaming; branch targets must agree at
/// the same relative instruction offset or jump just past the first
/// window's end.
fn equal_blocks(il: &InstructionList, start1: u32, start2: u32, length: u32) -> Option<u32> {
    if length == 0 {
        return None;
    }
    let mut i1 = il.index_of(start1)?;
    let mut i2 = il.index_of(start2)?;
    let start_num1 = il.insn_number(start1);
    let start_num2 = il.insn_number(start2);
    let mut slot_map: HashMap<u16, u16> = HashMap::new();

    loop {
        let insn1 = il.get(i1)?;
        let insn2 = il.get(i2)?;

        if insn1.op != insn2.op {
            let renamed_slots = match (&insn1.op, &insn2.op) {
                (
                    Opcode::Load { kind: k1, slot: s1 },
                    Opcode::Load { kind: k2, slot: s2 },
                ) if k1 == k2 => Some((*s1, *s2, false)),
                (
                    Opcode::Store { kind: k1, slot: s1 },
                    Opcode::Store { kind: k2, slot: s2 },
                ) if k1 == k2 => Some((*s1, *s2, true)),
                (
                    Opcode::Iinc { slot: s1, delta: d1 },
                    Opcode::Iinc { slot: s2, delta: d2 },
                ) if d1 == d2 => Some((*s1, *s2, false)),
                _ => None,
            };

            if let Some((slot1, slot2, is_store)) = renamed_slots {
                match slot_map.get(&slot1) {
                    None => {
                        // Only a store may introduce a renaming.
                        if !is_store {
                            return None;
                        }
                        slot_map.insert(slot1, slot2);
                    }
                    Some(&mapped) if mapped != slot2 => return None,
                    Some(_) => {}
                }
            } else {
                let targets = match (&insn1.op, &insn2.op) {
                    (
                        Opcode::If { cond: c1, target: t1 },
                        Opcode::If { cond: c2, target: t2 },
                    ) if c1 == c2 => Some((*t1, *t2)),
                    (
                        Opcode::IfCmp { cond: c1, target: t1 },
                        Opcode::IfCmp { cond: c2, target: t2 },
                    ) if c1 == c2 => Some((*t1, *t2)),
                    (Opcode::Goto { target: t1 }, Opcode::Goto { target: t2 }) => {
                        Some((*t1, *t2))
                    }
                    _ => None,
                };
                let Some((target1, target2)) = targets else {
                    return None;
                };
                let relative1 = il.insn_number(target1) as isize - start_num1 as isize;
                let relative2 = il.insn_number(target2) as isize - start_num2 as isize;
                if relative1 != relative2 && target1 != start1 + length {
                    return None;
                }
            }
        }

        if insn1.pos - start1 + il.byte_len(i1) >= length {
            return Some(insn2.pos + il.byte_len(i2));
        }
        i1 += 1;
        i2 += 1;
    }
}

/// Scan one method for duplicated finally bodies.
pub fn analyze(method: &MethodData) -> FinallyDuplicatesInfo {
    let il = &method.instructions;

    let mut exception_targets = BTreeSet::new();
    let mut finally_targets: Vec<TryBlock> = Vec::new();
    for entry in &method.exception_table {
        if entry.is_catch_any() {
            let index = finally_targets
                .iter()
                .position(|b| b.catch_any_address == entry.handler_pc)
                .unwrap_or_else(|| {
                    finally_targets.push(TryBlock::new(entry.handler_pc));
                    finally_targets.len() - 1
                });
            if entry.start_pc != entry.handler_pc {
                finally_targets[index]
                    .normal_blocks
                    .insert(entry.start_pc, entry.end_pc);
            }
        }
        exception_targets.insert(entry.handler_pc);
    }
    if finally_targets.is_empty() {
        return FinallyDuplicatesInfo::none();
    }

    let mut branch_targets = BTreeSet::new();
    for insn in il.iter() {
        if let Some(target) = insn.op.branch_target() {
            branch_targets.insert(target);
        }
    }

    let mut groups = Vec::new();
    for mut block in finally_targets {
        block.update(&exception_targets, &branch_targets, il);
        if !block.incorrect && block.duplicates.len() > 1 {
            groups.push(block.duplicates);
        } else if block.incorrect {
            log::debug!(
                "handler at {} in {} does not match the finally idiom",
                block.catch_any_address,
                method.name
            );
        }
    }
    if groups.is_empty() {
        return FinallyDuplicatesInfo::none();
    }
    FinallyDuplicatesInfo {
        positions: il.positions().to_vec(),
        groups,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::insn::{CmpOp, Instruction};

    fn list(ops: Vec<(u32, Opcode)>, code_len: u32) -> InstructionList {
        InstructionList::new(
            ops.into_iter()
                .map(|(pos, op)| Instruction { pos, op })
                .collect(),
            code_len,
        )
    }

    #[test]
    fn identical_windows_match() {
        let il = list(
            vec![
                (0, Opcode::Push { kind: ValueKind::Int, value: 1 }),
                (2, Opcode::Pop),
                (3, Opcode::Push { kind: ValueKind::Int, value: 1 }),
                (5, Opcode::Pop),
            ],
            6,
        );
        assert_eq!(equal_blocks(&il, 0, 3, 3), Some(6));
    }

    #[test]
    fn renaming_must_be_introduced_by_a_store() {
        // store establishes 1 -> 2, later load must honor it
        let il = list(
            vec![
                (0, Opcode::Store { kind: ValueKind::Int, slot: 1 }),
                (1, Opcode::Load { kind: ValueKind::Int, slot: 1 }),
                (2, Opcode::Store { kind: ValueKind::Int, slot: 2 }),
                (3, Opcode::Load { kind: ValueKind::Int, slot: 2 }),
            ],
            4,
        );
        assert_eq!(equal_blocks(&il, 0, 2, 2), Some(4));

        // a load of an unmapped differing slot aborts
        let il = list(
            vec![
                (0, Opcode::Load { kind: ValueKind::Int, slot: 1 }),
                (1, Opcode::Load { kind: ValueKind::Int, slot: 2 }),
            ],
            2,
        );
        assert_eq!(equal_blocks(&il, 0, 1, 1), None);
    }

    #[test]
    fn inconsistent_renaming_aborts() {
        let il = list(
            vec![
                (0, Opcode::Store { kind: ValueKind::Int, slot: 1 }),
                (1, Opcode::Load { kind: ValueKind::Int, slot: 1 }),
                (2, Opcode::Store { kind: ValueKind::Int, slot: 2 }),
                (3, Opcode::Load { kind: ValueKind::Int, slot: 3 }),
            ],
            4,
        );
        assert_eq!(equal_blocks(&il, 0, 2, 2), None);
    }

    #[test]
    fn load_store_class_mismatch_aborts() {
        let il = list(
            vec![
                (0, Opcode::Store { kind: ValueKind::Int, slot: 1 }),
                (1, Opcode::Store { kind: ValueKind::Long, slot: 2 }),
            ],
            2,
        );
        assert_eq!(equal_blocks(&il, 0, 1, 1), None);
    }

    #[test]
    fn branch_targets_compare_relatively() {
        // both windows branch one instruction ahead of their own start
        let il = list(
            vec![
                (0, Opcode::If { cond: CmpOp::Eq, target: 3 }),
                (3, Opcode::Nop),
                (4, Opcode::If { cond: CmpOp::Eq, target: 7 }),
                (7, Opcode::Nop),
            ],
            8,
        );
        assert_eq!(equal_blocks(&il, 0, 4, 4), Some(8));

        // differing relative targets abort unless the first jumps just
        // past its window
        let il = list(
            vec![
                (0, Opcode::If { cond: CmpOp::Eq, target: 3 }),
                (3, Opcode::Nop),
                (4, Opcode::If { cond: CmpOp::Eq, target: 3 }),
                (7, Opcode::Nop),
            ],
            8,
        );
        assert_eq!(equal_blocks(&il, 0, 4, 4), None);
    }

    #[test]
    fn no_finally_handlers_yields_sentinel() {
        let method = MethodData {
            name: "m".into(),
            signature: "()V".into(),
            access: Default::default(),
            instructions: list(vec![(0, Opcode::Return { kind: None })], 1),
            exception_table: vec![],
            local_variables: None,
            constant_pool: std::sync::Arc::new(Default::default()),
            max_stack: 1,
            max_locals: 1,
        };
        let info = analyze(&method);
        assert!(info.is_empty());
        assert!(info.duplicates_of(0).is_empty());
    }
}
