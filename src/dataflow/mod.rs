//! Generic fixed-point dataflow solver.
//!
//! Any per-method analysis instantiates [`Dataflow`] over a CFG with a
//! transfer function and a meet operator supplied through the
//! [`DataflowAnalysis`] trait. Termination relies on the analysis providing
//! a finite-height lattice and a monotone transfer; the solver additionally
//! enforces an iteration cap that turns non-convergence into a checked
//! failure.
//!
//! The "start" point of a block is its entry for forward analyses and its
//! exit for backward analyses; the "result" point is the other end. The
//! meet operator receives the edge being merged over, so edge-sensitive
//! analyses (exception-handler entries, branch facts) can specialize.

use std::collections::HashMap;

use petgraph::stable_graph::{EdgeIndex, NodeIndex};
use petgraph::visit::{DfsPostOrder, Reversed};

use crate::cfg::Cfg;
use crate::core::descriptors::MethodDescriptor;
use crate::core::errors::{AnalysisError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Backward,
}

/// Contract every dataflow analysis implements.
pub trait DataflowAnalysis {
    type Fact: Clone;

    fn direction(&self) -> Direction {
        Direction::Forward
    }

    /// Allocate a fresh fact in the top state.
    fn create_fact(&self) -> Self::Fact;

    /// Reset a fact to top (the identity of the meet).
    fn make_top(&self, fact: &mut Self::Fact);

    fn is_top(&self, fact: &Self::Fact) -> bool;

    /// Fact at the logical entry block before any instruction runs.
    fn init_entry_fact(&self, fact: &mut Self::Fact) -> Result<()>;

    fn same(&self, a: &Self::Fact, b: &Self::Fact) -> bool;

    /// Merge `fact`, arriving over `edge`, into `result`.
    fn meet_into(
        &self,
        fact: &Self::Fact,
        cfg: &Cfg,
        edge: EdgeIndex,
        result: &mut Self::Fact,
    ) -> Result<()>;

    /// Apply the whole block's transfer function to `fact` in place.
    fn transfer_block(&self, cfg: &Cfg, block: NodeIndex, fact: &mut Self::Fact) -> Result<()>;
}

/// Worklist executor producing per-block start and result facts.
pub struct Dataflow<A: DataflowAnalysis> {
    analysis: A,
    start_facts: HashMap<NodeIndex, A::Fact>,
    result_facts: HashMap<NodeIndex, A::Fact>,
    iterations: usize,
}

impl<A: DataflowAnalysis> Dataflow<A> {
    pub fn new(analysis: A) -> Self {
        Self {
            analysis,
            start_facts: HashMap::new(),
            result_facts: HashMap::new(),
            iterations: 0,
        }
    }

    pub fn analysis(&self) -> &A {
        &self.analysis
    }

    /// Passes executed before the facts stabilized.
    pub fn iterations(&self) -> usize {
        self.iterations
    }

    /// Fact at a block's start point (entry for forward analyses).
    pub fn start_fact(&self, block: NodeIndex) -> Option<&A::Fact> {
        self.start_facts.get(&block)
    }

    /// Fact at a block's result point (exit for forward analyses).
    pub fn result_fact(&self, block: NodeIndex) -> Option<&A::Fact> {
        self.result_facts.get(&block)
    }

    /// Iterate to a fixed point over `cfg`.
    pub fn execute(
        &mut self,
        cfg: &Cfg,
        descriptor: &MethodDescriptor,
        max_iterations: usize,
    ) -> Result<()> {
        let forward = self.analysis.direction() == Direction::Forward;
        let order = block_order(cfg, forward);
        let logical_entry = if forward { cfg.entry() } else { cfg.exit() };

        for &block in &order {
            let mut fact = self.analysis.create_fact();
            self.analysis.make_top(&mut fact);
            self.result_facts.insert(block, fact);
        }

        loop {
            let mut changed = false;
            for &block in &order {
                let mut start = self.analysis.create_fact();
                if block == logical_entry {
                    self.analysis.init_entry_fact(&mut start)?;
                } else {
                    self.analysis.make_top(&mut start);
                    let sources = if forward {
                        cfg.incoming(block)
                    } else {
                        cfg.outgoing(block)
                    };
                    for (edge, other, _) in sources {
                        if let Some(fact) = self.result_facts.get(&other) {
                            self.analysis.meet_into(fact, cfg, edge, &mut start)?;
                        }
                    }
                }

                let mut result = start.clone();
                self.start_facts.insert(block, start);
                self.analysis.transfer_block(cfg, block, &mut result)?;

                let previous = self
                    .result_facts
                    .get(&block)
                    .expect("result fact initialized");
                if !self.analysis.same(&result, previous) {
                    self.result_facts.insert(block, result);
                    changed = true;
                }
            }

            self.iterations += 1;
            if !changed {
                return Ok(());
            }
            if self.iterations >= max_iterations {
                return Err(AnalysisError::Convergence {
                    descriptor: descriptor.clone(),
                    iterations: self.iterations,
                });
            }
        }
    }
}

/// Reverse post order from the entry (forward) or from the exit over
/// reversed edges (backward). Blocks unreachable from the logical entry are
/// appended afterwards so they still receive facts.
pub fn block_order(cfg: &Cfg, forward: bool) -> Vec<NodeIndex> {
    let graph = cfg.raw_graph();
    let mut postorder = Vec::new();
    if forward {
        let mut dfs = DfsPostOrder::new(graph, cfg.entry());
        while let Some(node) = dfs.next(graph) {
            postorder.push(node);
        }
    } else {
        let reversed = Reversed(graph);
        let mut dfs = DfsPostOrder::new(reversed, cfg.exit());
        while let Some(node) = dfs.next(reversed) {
            postorder.push(node);
        }
    }
    postorder.reverse();

    let mut order = postorder;
    let seen: std::collections::HashSet<NodeIndex> = order.iter().copied().collect();
    for block in cfg.blocks() {
        if !seen.contains(&block) {
            order.push(block);
        }
    }
    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::builder::build_cfg;
    use crate::core::descriptors::ClassDescriptor;
    use crate::core::insn::{CmpOp, Instruction, InstructionList, Opcode, ValueKind};
    use crate::core::method::{ConstantPool, MethodAccess, MethodData};
    use std::sync::Arc;

    /// Toy forward analysis: counts the minimum number of blocks on any
    /// path from entry (a finite-height lattice under `min`).
    struct MinDepth;

    impl DataflowAnalysis for MinDepth {
        type Fact = Option<usize>;

        fn create_fact(&self) -> Self::Fact {
            None
        }

        fn make_top(&self, fact: &mut Self::Fact) {
            *fact = None;
        }

        fn is_top(&self, fact: &Self::Fact) -> bool {
            fact.is_none()
        }

        fn init_entry_fact(&self, fact: &mut Self::Fact) -> Result<()> {
            *fact = Some(0);
            Ok(())
        }

        fn same(&self, a: &Self::Fact, b: &Self::Fact) -> bool {
            a == b
        }

        fn meet_into(
            &self,
            fact: &Self::Fact,
            _cfg: &Cfg,
            _edge: EdgeIndex,
            result: &mut Self::Fact,
        ) -> Result<()> {
            *result = match (*fact, *result) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (Some(a), None) => Some(a),
                (None, other) => other,
            };
            Ok(())
        }

        fn transfer_block(
            &self,
            _cfg: &Cfg,
            _block: NodeIndex,
            fact: &mut Self::Fact,
        ) -> Result<()> {
            if let Some(v) = fact.as_mut() {
                *v += 1;
            }
            Ok(())
        }
    }

    fn diamond_cfg() -> Cfg {
        let ops = vec![
            (0, Opcode::Load { kind: ValueKind::Int, slot: 0 }),
            (1, Opcode::If { cond: CmpOp::Eq, target: 6 }),
            (4, Opcode::Goto { target: 7 }),
            (6, Opcode::Nop),
            (7, Opcode::Return { kind: None }),
        ];
        let method = Arc::new(MethodData {
            name: "m".into(),
            signature: "(I)V".into(),
            access: MethodAccess {
                is_static: true,
                ..Default::default()
            },
            instructions: InstructionList::new(
                ops.into_iter()
                    .map(|(pos, op)| Instruction { pos, op })
                    .collect(),
                8,
            ),
            exception_table: vec![],
            local_variables: None,
            constant_pool: Arc::new(ConstantPool::default()),
            max_stack: 2,
            max_locals: 1,
        });
        build_cfg(method).unwrap()
    }

    #[test]
    fn converges_on_a_diamond() {
        let cfg = diamond_cfg();
        let descriptor = MethodDescriptor::new(ClassDescriptor::new("T"), "m", "(I)V", true);
        let mut dataflow = Dataflow::new(MinDepth);
        dataflow.execute(&cfg, &descriptor, 100).unwrap();

        // entry, A, then the short arm and the join block precede the exit
        let at_exit = dataflow.start_fact(cfg.exit()).unwrap();
        assert_eq!(*at_exit, Some(4));
        assert!(dataflow.iterations() >= 1);
    }

    #[test]
    fn iteration_cap_is_a_checked_failure() {
        /// Never stabilizes: the transfer bumps a counter without bound.
        struct Diverging;
        impl DataflowAnalysis for Diverging {
            type Fact = usize;
            fn create_fact(&self) -> usize {
                0
            }
            fn make_top(&self, fact: &mut usize) {
                *fact = 0;
            }
            fn is_top(&self, fact: &usize) -> bool {
                *fact == 0
            }
            fn init_entry_fact(&self, fact: &mut usize) -> Result<()> {
                *fact = 1;
                Ok(())
            }
            fn same(&self, a: &usize, b: &usize) -> bool {
                a == b
            }
            fn meet_into(
                &self,
                fact: &usize,
                _cfg: &Cfg,
                _edge: EdgeIndex,
                result: &mut usize,
            ) -> Result<()> {
                *result = (*result).max(*fact);
                Ok(())
            }
            fn transfer_block(
                &self,
                _cfg: &Cfg,
                _block: NodeIndex,
                fact: &mut usize,
            ) -> Result<()> {
                *fact += 1;
                Ok(())
            }
        }

        let cfg = diamond_cfg();
        let descriptor = MethodDescriptor::new(ClassDescriptor::new("T"), "m", "(I)V", true);
        let mut dataflow = Dataflow::new(Diverging);
        let err = dataflow.execute(&cfg, &descriptor, 10).unwrap_err();
        assert!(matches!(err, AnalysisError::Convergence { .. }));
    }
}
