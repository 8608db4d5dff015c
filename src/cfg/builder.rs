//! Raw control-flow graph construction.
//!
//! Block boundaries fall at every branch target, at every instruction
//! following a branch or flow-ending instruction, and at the boundaries of
//! exception-protected ranges and handler entries.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use petgraph::stable_graph::NodeIndex;

use crate::core::errors::{AnalysisError, Result};
use crate::core::insn::Opcode;
use crate::core::method::MethodData;

use super::{Cfg, EdgeKind};

/// Build the unrefined graph for a method body.
pub fn build_cfg(method: Arc<MethodData>) -> Result<Cfg> {
    let insns = &method.instructions;
    if insns.is_empty() {
        let mut cfg = Cfg::new(Arc::clone(&method));
        let (entry, exit) = (cfg.entry(), cfg.exit());
        cfg.add_edge(entry, exit, EdgeKind::Start);
        return Ok(cfg);
    }

    let leaders = collect_leaders(&method)?;
    let mut cfg = Cfg::new(Arc::clone(&method));

    // Emit blocks over consecutive leader ranges.
    let leader_list: Vec<usize> = leaders.iter().copied().collect();
    let mut block_at: HashMap<usize, NodeIndex> = HashMap::new();
    let mut blocks = Vec::new();
    for (i, &first) in leader_list.iter().enumerate() {
        let last = leader_list
            .get(i + 1)
            .map(|&next| next - 1)
            .unwrap_or(insns.len() - 1);
        let node = cfg.add_block(first, last);
        block_at.insert(first, node);
        blocks.push((first, last, node));
    }

    let block_of_pos = |pos: u32| -> Result<NodeIndex> {
        let index = insns.index_of(pos).ok_or_else(|| {
            AnalysisError::invalid_bytecode(
                method.name.clone(),
                format!("branch or handler target {pos} is not an instruction start"),
            )
        })?;
        block_at.get(&index).copied().ok_or_else(|| {
            AnalysisError::invalid_bytecode(
                method.name.clone(),
                format!("target {pos} does not start a block"),
            )
        })
    };

    let entry = cfg.entry();
    let exit = cfg.exit();
    cfg.add_edge(entry, blocks[0].2, EdgeKind::Start);

    let mut pending = Vec::new();
    for (i, &(first, last, node)) in blocks.iter().enumerate() {
        let terminal = &insns.get(last).expect("block range in bounds").op;
        let next_block = blocks.get(i + 1).map(|b| b.2);

        match terminal {
            Opcode::If { target, .. } | Opcode::IfCmp { target, .. } => {
                if let Some(next) = next_block {
                    pending.push((node, next, EdgeKind::FallThrough));
                }
                pending.push((node, block_of_pos(*target)?, EdgeKind::IfCmp));
            }
            Opcode::Goto { target } => {
                pending.push((node, block_of_pos(*target)?, EdgeKind::Goto));
            }
            Opcode::Return { .. } => {
                pending.push((node, exit, EdgeKind::Return));
            }
            Opcode::Throw => {
                let pos = insns.get(last).expect("block range in bounds").pos;
                let caught_by_any = method
                    .exception_table
                    .iter()
                    .any(|e| e.is_catch_any() && e.covers(pos));
                if !caught_by_any {
                    pending.push((node, exit, EdgeKind::UnconditionalThrow));
                }
            }
            _ => {
                if let Some(next) = next_block {
                    pending.push((node, next, EdgeKind::FallThrough));
                }
            }
        }

        // Exception edges: a block that may raise, from within a protected
        // range, flows to that range's handler.
        let mut seen_handlers = HashSet::new();
        for index in first..=last {
            let insn = insns.get(index).expect("block range in bounds");
            if !insn.op.can_throw() {
                continue;
            }
            for entry in &method.exception_table {
                if entry.covers(insn.pos) && seen_handlers.insert(entry.handler_pc) {
                    pending.push((node, block_of_pos(entry.handler_pc)?, EdgeKind::ExceptionHandler));
                }
            }
        }
    }

    for (from, to, kind) in pending {
        cfg.add_edge(from, to, kind);
    }
    Ok(cfg)
}

fn collect_leaders(method: &MethodData) -> Result<BTreeSet<usize>> {
    let insns = &method.instructions;
    let mut leaders = BTreeSet::new();
    leaders.insert(0);

    let index_of = |pos: u32, what: &str| -> Result<usize> {
        insns.index_of(pos).ok_or_else(|| {
            AnalysisError::invalid_bytecode(
                method.name.clone(),
                format!("{what} {pos} is not an instruction start"),
            )
        })
    };

    for (i, insn) in insns.iter().enumerate() {
        if let Some(target) = insn.op.branch_target() {
            leaders.insert(index_of(target, "branch target")?);
        }
        if (insn.op.is_conditional_branch() || insn.op.ends_flow()) && i + 1 < insns.len() {
            leaders.insert(i + 1);
        }
    }

    for entry in &method.exception_table {
        leaders.insert(index_of(entry.handler_pc, "handler target")?);
        leaders.insert(index_of(entry.start_pc, "protected-range start")?);
        // The end of a protected range is exclusive; it opens a new block
        // when it lands on a real instruction.
        if let Some(index) = insns.index_of(entry.end_pc) {
            leaders.insert(index);
        }
    }

    Ok(leaders)
}
