//! Control-flow graph over decoded method bodies.
//!
//! Blocks partition the instruction stream into maximal straight-line runs;
//! edges are typed by how control transfers. The graph is built raw, cached
//! eagerly, then mutated in place by the refinement pipeline (`refine`)
//! before reaching its terminal refined state.

pub mod builder;
pub mod refine;

use std::collections::HashSet;
use std::sync::Arc;

use bitflags::bitflags;
use petgraph::stable_graph::{EdgeIndex, NodeIndex, StableDiGraph};
use petgraph::visit::EdgeRef;
use petgraph::Direction;

use crate::core::insn::Instruction;
use crate::core::method::MethodData;

bitflags! {
    /// Refinement pipeline state. Flags only ever turn on; a completed
    /// stage is never re-entered.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RefinementFlags: u8 {
        /// Construction or refinement is in progress.
        const BUSY = 1 << 0;
        const ASSERTIONS_PRUNED = 1 << 1;
        const EXCEPTION_EDGES_PRUNED = 1 << 2;
        const THROWERS_PRUNED = 1 << 3;
        /// Terminal state: the pipeline has completed.
        const REFINED = 1 << 4;
    }
}

/// How control transfers along an edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EdgeKind {
    /// Synthetic entry edge into the first real block.
    Start,
    /// Sequential flow, including the not-taken side of a conditional.
    FallThrough,
    /// Taken side of a conditional comparison.
    IfCmp,
    /// Unconditional jump.
    Goto,
    /// Return to the synthetic exit.
    Return,
    /// From a potentially-excepting block to a covering handler.
    ExceptionHandler,
    /// athrow with no covering any-handler, to the synthetic exit.
    UnconditionalThrow,
}

/// Maximal straight-line instruction run. Entry and exit blocks carry no
/// instruction range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicBlock {
    /// First and last instruction index (inclusive), `None` for the
    /// synthetic entry/exit blocks.
    pub range: Option<(usize, usize)>,
}

impl BasicBlock {
    fn synthetic() -> Self {
        Self { range: None }
    }
}

/// The control-flow graph of one method.
#[derive(Debug, Clone)]
pub struct Cfg {
    graph: StableDiGraph<BasicBlock, EdgeKind>,
    entry: NodeIndex,
    exit: NodeIndex,
    flags: RefinementFlags,
    method: Arc<MethodData>,
}

impl Cfg {
    pub(crate) fn new(method: Arc<MethodData>) -> Self {
        let mut graph = StableDiGraph::new();
        let entry = graph.add_node(BasicBlock::synthetic());
        let exit = graph.add_node(BasicBlock::synthetic());
        Self {
            graph,
            entry,
            exit,
            flags: RefinementFlags::BUSY,
            method,
        }
    }

    pub fn entry(&self) -> NodeIndex {
        self.entry
    }

    pub fn exit(&self) -> NodeIndex {
        self.exit
    }

    pub fn method(&self) -> &Arc<MethodData> {
        &self.method
    }

    pub fn flags(&self) -> RefinementFlags {
        self.flags
    }

    /// Record a completed pipeline stage. Returns false when the stage had
    /// already run, so callers can skip re-entry.
    pub(crate) fn mark_stage(&mut self, stage: RefinementFlags) -> bool {
        if self.flags.contains(stage) {
            return false;
        }
        self.flags.insert(stage);
        true
    }

    pub(crate) fn finish_refinement(&mut self) {
        self.flags.remove(RefinementFlags::BUSY);
        self.flags.insert(RefinementFlags::REFINED);
    }

    /// Stable numeric label of a block, used for reachability bitsets.
    pub fn label(&self, block: NodeIndex) -> usize {
        block.index()
    }

    pub fn block(&self, block: NodeIndex) -> &BasicBlock {
        &self.graph[block]
    }

    pub fn blocks(&self) -> impl Iterator<Item = NodeIndex> + '_ {
        self.graph.node_indices()
    }

    pub fn block_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edges(&self) -> impl Iterator<Item = EdgeIndex> + '_ {
        self.graph.edge_indices()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn edge_kind(&self, edge: EdgeIndex) -> EdgeKind {
        self.graph[edge]
    }

    pub fn edge_source(&self, edge: EdgeIndex) -> NodeIndex {
        self.graph
            .edge_endpoints(edge)
            .expect("edge not in graph")
            .0
    }

    pub fn edge_target(&self, edge: EdgeIndex) -> NodeIndex {
        self.graph
            .edge_endpoints(edge)
            .expect("edge not in graph")
            .1
    }

    /// Outgoing `(edge, target, kind)` triples of a block.
    pub fn outgoing(&self, block: NodeIndex) -> Vec<(EdgeIndex, NodeIndex, EdgeKind)> {
        self.graph
            .edges_directed(block, Direction::Outgoing)
            .map(|e| (e.id(), e.target(), *e.weight()))
            .collect()
    }

    /// Incoming `(edge, source, kind)` triples of a block.
    pub fn incoming(&self, block: NodeIndex) -> Vec<(EdgeIndex, NodeIndex, EdgeKind)> {
        self.graph
            .edges_directed(block, Direction::Incoming)
            .map(|e| (e.id(), e.source(), *e.weight()))
            .collect()
    }

    pub fn successor_with_kind(&self, block: NodeIndex, kind: EdgeKind) -> Option<NodeIndex> {
        self.graph
            .edges_directed(block, Direction::Outgoing)
            .find(|e| *e.weight() == kind)
            .map(|e| e.target())
    }

    /// First instruction of a block, if it has any.
    pub fn first_instruction(&self, block: NodeIndex) -> Option<&Instruction> {
        let (first, _) = self.graph[block].range?;
        self.method.instructions.get(first)
    }

    /// Last instruction of a block, if it has any.
    pub fn last_instruction(&self, block: NodeIndex) -> Option<&Instruction> {
        let (_, last) = self.graph[block].range?;
        self.method.instructions.get(last)
    }

    pub(crate) fn add_block(&mut self, first: usize, last: usize) -> NodeIndex {
        self.graph.add_node(BasicBlock {
            range: Some((first, last)),
        })
    }

    pub(crate) fn add_edge(&mut self, from: NodeIndex, to: NodeIndex, kind: EdgeKind) -> EdgeIndex {
        self.graph.add_edge(from, to, kind)
    }

    pub(crate) fn remove_edge(&mut self, edge: EdgeIndex) {
        self.graph.remove_edge(edge);
    }

    pub(crate) fn raw_graph(&self) -> &StableDiGraph<BasicBlock, EdgeKind> {
        &self.graph
    }

    /// Every block reachable from the entry along any edge.
    pub fn reachable_from_entry(&self) -> HashSet<NodeIndex> {
        let mut seen = HashSet::new();
        let mut stack = vec![self.entry];
        while let Some(node) = stack.pop() {
            if !seen.insert(node) {
                continue;
            }
            for edge in self.graph.edges_directed(node, Direction::Outgoing) {
                stack.push(edge.target());
            }
        }
        seen
    }

    /// Delete blocks no longer reachable from the entry. The synthetic
    /// exit survives regardless. Returns the number of removed blocks.
    pub(crate) fn prune_unreachable(&mut self) -> usize {
        let reachable = self.reachable_from_entry();
        let doomed: Vec<NodeIndex> = self
            .graph
            .node_indices()
            .filter(|n| *n != self.exit && !reachable.contains(n))
            .collect();
        for node in &doomed {
            self.graph.remove_node(*node);
        }
        doomed.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::insn::{InstructionList, Opcode};
    use crate::core::method::{ConstantPool, MethodAccess, MethodData};
    use crate::core::Instruction;

    fn empty_method() -> Arc<MethodData> {
        Arc::new(MethodData {
            name: "m".into(),
            signature: "()V".into(),
            access: MethodAccess {
                is_static: true,
                ..Default::default()
            },
            instructions: InstructionList::new(
                vec![Instruction {
                    pos: 0,
                    op: Opcode::Return { kind: None },
                }],
                1,
            ),
            exception_table: vec![],
            local_variables: None,
            constant_pool: Arc::new(ConstantPool::default()),
            max_stack: 1,
            max_locals: 1,
        })
    }

    #[test]
    fn stages_run_once() {
        let mut cfg = Cfg::new(empty_method());
        assert!(cfg.mark_stage(RefinementFlags::ASSERTIONS_PRUNED));
        assert!(!cfg.mark_stage(RefinementFlags::ASSERTIONS_PRUNED));
        assert!(cfg.flags().contains(RefinementFlags::ASSERTIONS_PRUNED));
    }

    #[test]
    fn finish_refinement_is_terminal() {
        let mut cfg = Cfg::new(empty_method());
        assert!(cfg.flags().contains(RefinementFlags::BUSY));
        cfg.finish_refinement();
        assert!(!cfg.flags().contains(RefinementFlags::BUSY));
        assert!(cfg.flags().contains(RefinementFlags::REFINED));
    }

    #[test]
    fn unreachable_blocks_are_swept() {
        let mut cfg = Cfg::new(empty_method());
        let a = cfg.add_block(0, 0);
        let orphan = cfg.add_block(0, 0);
        cfg.add_edge(cfg.entry(), a, EdgeKind::Start);
        cfg.add_edge(a, cfg.exit(), EdgeKind::Return);
        let dangling = cfg.add_edge(orphan, a, EdgeKind::Goto);

        assert_eq!(cfg.prune_unreachable(), 1);
        assert!(cfg.blocks().all(|n| n != orphan));
        // the dangling edge went with its source
        assert!(cfg.edges().all(|e| e != dangling));
    }

    #[test]
    fn kind_queries() {
        let mut cfg = Cfg::new(empty_method());
        let a = cfg.add_block(0, 0);
        cfg.add_edge(cfg.entry(), a, EdgeKind::Start);
        cfg.add_edge(a, cfg.exit(), EdgeKind::Return);
        assert_eq!(
            cfg.successor_with_kind(a, EdgeKind::Return),
            Some(cfg.exit())
        );
        assert_eq!(cfg.successor_with_kind(a, EdgeKind::Goto), None);
    }
}
