//! Abstract type frames over the operand stack and locals.
//!
//! A compact forward dataflow tracking the width class (and, for
//! references, the class when known) of every stack slot and local. Its one
//! in-tree consumer is exception-edge pruning, which asks for the type on
//! top of the stack at a `Throw` site; the lattice is finite by
//! construction (stack depth bounded by `max_stack`, reference types drawn
//! from the constant pool).

use std::sync::Arc;

use petgraph::stable_graph::{EdgeIndex, NodeIndex};

use crate::cfg::{Cfg, EdgeKind};
use crate::config::AnalysisConfig;
use crate::core::descriptors::MethodDescriptor;
use crate::core::errors::Result;
use crate::core::insn::{Opcode, ValueKind};
use crate::core::method::{ConstantPool, MethodData};
use crate::core::sig;
use crate::core::Constant;
use crate::dataflow::{Dataflow, DataflowAnalysis};

/// Abstract type of one slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeFact {
    /// Nothing known yet (identity of the merge).
    Top,
    Int,
    Long,
    Float,
    Double,
    Null,
    /// An object reference; `None` when the class is unknown.
    Reference(Option<String>),
    /// Irreconcilable merge.
    Conflict,
}

impl TypeFact {
    fn merge(&self, other: &TypeFact) -> TypeFact {
        use TypeFact::*;
        match (self, other) {
            (a, b) if a == b => a.clone(),
            (Top, x) | (x, Top) => x.clone(),
            (Null, Reference(c)) | (Reference(c), Null) => Reference(c.clone()),
            (Reference(_), Reference(_)) => Reference(None),
            _ => Conflict,
        }
    }

    fn for_value_kind(kind: ValueKind) -> TypeFact {
        match kind {
            ValueKind::Int => TypeFact::Int,
            ValueKind::Long => TypeFact::Long,
            ValueKind::Float => TypeFact::Float,
            ValueKind::Double => TypeFact::Double,
            ValueKind::Ref => TypeFact::Reference(None),
        }
    }

    fn for_signature(signature: &str) -> TypeFact {
        match signature.as_bytes().first() {
            Some(b'B' | b'C' | b'I' | b'S' | b'Z') => TypeFact::Int,
            Some(b'J') => TypeFact::Long,
            Some(b'F') => TypeFact::Float,
            Some(b'D') => TypeFact::Double,
            Some(b'[') => TypeFact::Reference(None),
            Some(b'L') => TypeFact::Reference(
                signature
                    .strip_prefix('L')
                    .and_then(|s| s.strip_suffix(';'))
                    .map(str::to_string),
            ),
            _ => TypeFact::Conflict,
        }
    }
}

/// Abstract frame of one program point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeFrame {
    /// Unvisited.
    Top,
    /// Irreconcilable merge (stack depth mismatch, simulation underflow).
    Bottom,
    Frame {
        locals: Vec<TypeFact>,
        stack: Vec<TypeFact>,
    },
}

impl TypeFrame {
    fn meet(&mut self, other: &TypeFrame) {
        let merged = match (&*self, other) {
            (TypeFrame::Top, x) => x.clone(),
            (x, TypeFrame::Top) => x.clone(),
            (TypeFrame::Bottom, _) | (_, TypeFrame::Bottom) => TypeFrame::Bottom,
            (
                TypeFrame::Frame { locals: l1, stack: s1 },
                TypeFrame::Frame { locals: l2, stack: s2 },
            ) => {
                if l1.len() != l2.len() || s1.len() != s2.len() {
                    TypeFrame::Bottom
                } else {
                    TypeFrame::Frame {
                        locals: l1.iter().zip(l2).map(|(a, b)| a.merge(b)).collect(),
                        stack: s1.iter().zip(s2).map(|(a, b)| a.merge(b)).collect(),
                    }
                }
            }
        };
        *self = merged;
    }

    /// Type on top of the operand stack, if this frame is valid.
    pub fn stack_top(&self) -> Option<&TypeFact> {
        match self {
            TypeFrame::Frame { stack, .. } => stack.last(),
            _ => None,
        }
    }
}

/// The dataflow analysis: one [`TypeFrame`] per program point.
pub struct TypeAnalysis {
    descriptor: MethodDescriptor,
    method: Arc<MethodData>,
}

impl TypeAnalysis {
    pub fn new(descriptor: MethodDescriptor, method: Arc<MethodData>) -> Self {
        Self { descriptor, method }
    }

    fn transfer_insn(&self, op: &Opcode, cp: &ConstantPool, frame: &mut TypeFrame) {
        let (locals, stack) = match frame {
            TypeFrame::Frame { locals, stack } => (locals, stack),
            _ => return,
        };

        fn pop(stack: &mut Vec<TypeFact>, underflow: &mut bool) -> TypeFact {
            stack.pop().unwrap_or_else(|| {
                *underflow = true;
                TypeFact::Conflict
            })
        }

        let mut underflow = false;
        match op {
            Opcode::Nop | Opcode::Goto { .. } | Opcode::Iinc { .. } => {}
            Opcode::Push { kind, .. } => stack.push(TypeFact::for_value_kind(*kind)),
            Opcode::LoadConst { index } => stack.push(match cp.get(*index) {
                Some(Constant::Int(_)) => TypeFact::Int,
                Some(Constant::Long(_)) => TypeFact::Long,
                Some(Constant::Float(_)) => TypeFact::Float,
                Some(Constant::Double(_)) => TypeFact::Double,
                Some(Constant::Str(_)) => TypeFact::Reference(Some("java/lang/String".into())),
                Some(Constant::Class { .. }) => {
                    TypeFact::Reference(Some("java/lang/Class".into()))
                }
                _ => TypeFact::Conflict,
            }),
            Opcode::Load { kind, slot } => {
                let fact = match kind {
                    ValueKind::Ref => locals
                        .get(usize::from(*slot))
                        .filter(|f| {
                            matches!(f, TypeFact::Reference(_) | TypeFact::Null)
                        })
                        .cloned()
                        .unwrap_or(TypeFact::Reference(None)),
                    other => TypeFact::for_value_kind(*other),
                };
                stack.push(fact);
            }
            Opcode::Store { kind, slot } => {
                let value = pop(stack, &mut underflow);
                let slot = usize::from(*slot);
                if slot < locals.len() {
                    locals[slot] = value;
                }
                if matches!(kind, ValueKind::Long | ValueKind::Double) && slot + 1 < locals.len() {
                    locals[slot + 1] = TypeFact::Top;
                }
            }
            Opcode::LongCmp => {
                pop(stack, &mut underflow);
                pop(stack, &mut underflow);
                stack.push(TypeFact::Int);
            }
            Opcode::If { .. } => {
                pop(stack, &mut underflow);
            }
            Opcode::IfCmp { .. } => {
                pop(stack, &mut underflow);
                pop(stack, &mut underflow);
            }
            Opcode::New { index } => stack.push(TypeFact::Reference(
                cp.class_name(*index).map(str::to_string),
            )),
            Opcode::Dup => {
                if let Some(top) = stack.last().cloned() {
                    stack.push(top);
                } else {
                    underflow = true;
                }
            }
            Opcode::Pop => {
                pop(stack, &mut underflow);
            }
            Opcode::GetStatic { index } => {
                stack.push(field_fact(cp, *index));
            }
            Opcode::GetField { index } => {
                pop(stack, &mut underflow);
                stack.push(field_fact(cp, *index));
            }
            Opcode::InvokeStatic { index }
            | Opcode::InvokeVirtual { index }
            | Opcode::InvokeSpecial { index } => {
                let receiver = !matches!(op, Opcode::InvokeStatic { .. });
                if let Some((_, _, signature)) = cp.method_ref(*index) {
                    let argc = sig::parse_method_params(signature)
                        .map(|p| p.len())
                        .unwrap_or(0);
                    for _ in 0..argc {
                        pop(stack, &mut underflow);
                    }
                    if receiver {
                        pop(stack, &mut underflow);
                    }
                    match sig::return_type(signature) {
                        Ok("V") | Err(_) => {}
                        Ok(ret) => stack.push(TypeFact::for_signature(ret)),
                    }
                } else {
                    underflow = true;
                }
            }
            Opcode::Return { kind } => {
                if kind.is_some() {
                    pop(stack, &mut underflow);
                }
                stack.clear();
            }
            Opcode::Throw => {
                pop(stack, &mut underflow);
                stack.clear();
            }
        }

        if underflow {
            *frame = TypeFrame::Bottom;
        }
    }
}

fn field_fact(cp: &ConstantPool, index: u16) -> TypeFact {
    cp.field_ref(index)
        .map(|(_, _, signature)| TypeFact::for_signature(signature))
        .unwrap_or(TypeFact::Conflict)
}

impl DataflowAnalysis for TypeAnalysis {
    type Fact = TypeFrame;

    fn create_fact(&self) -> TypeFrame {
        TypeFrame::Top
    }

    fn make_top(&self, fact: &mut TypeFrame) {
        *fact = TypeFrame::Top;
    }

    fn is_top(&self, fact: &TypeFrame) -> bool {
        matches!(fact, TypeFrame::Top)
    }

    fn init_entry_fact(&self, fact: &mut TypeFrame) -> Result<()> {
        let mut locals = vec![TypeFact::Top; usize::from(self.method.max_locals)];
        let mut slot = 0usize;
        if !self.descriptor.is_static() {
            if let Some(local) = locals.get_mut(slot) {
                *local =
                    TypeFact::Reference(Some(self.descriptor.class().class_name().to_string()));
            }
            slot += 1;
        }
        for param in sig::parse_method_params(self.descriptor.signature())? {
            if let Some(local) = locals.get_mut(slot) {
                *local = TypeFact::for_signature(&param);
            }
            slot += usize::from(sig::slot_width(&param));
        }
        *fact = TypeFrame::Frame {
            locals,
            stack: Vec::new(),
        };
        Ok(())
    }

    fn same(&self, a: &TypeFrame, b: &TypeFrame) -> bool {
        a == b
    }

    fn meet_into(
        &self,
        fact: &TypeFrame,
        cfg: &Cfg,
        edge: EdgeIndex,
        result: &mut TypeFrame,
    ) -> Result<()> {
        if cfg.edge_kind(edge) == EdgeKind::ExceptionHandler {
            // Locals survive into the handler; the stack is replaced by the
            // caught exception.
            let adjusted = match fact {
                TypeFrame::Frame { locals, .. } => TypeFrame::Frame {
                    locals: locals.clone(),
                    stack: vec![handler_exception_fact(cfg, edge)],
                },
                other => other.clone(),
            };
            result.meet(&adjusted);
        } else {
            result.meet(fact);
        }
        Ok(())
    }

    fn transfer_block(&self, cfg: &Cfg, block: NodeIndex, fact: &mut TypeFrame) -> Result<()> {
        let Some((first, last)) = cfg.block(block).range else {
            return Ok(());
        };
        let cp = &self.method.constant_pool;
        for index in first..=last {
            let insn = self.method.instructions.get(index).expect("range in bounds");
            self.transfer_insn(&insn.op, cp, fact);
        }
        Ok(())
    }
}

fn handler_exception_fact(cfg: &Cfg, edge: EdgeIndex) -> TypeFact {
    let handler = cfg.edge_target(edge);
    let Some(handler_pos) = cfg.first_instruction(handler).map(|i| i.pos) else {
        return TypeFact::Reference(None);
    };
    let mut catch_types = cfg
        .method()
        .exception_table
        .iter()
        .filter(|e| e.handler_pc == handler_pos)
        .map(|e| {
            e.catch_type
                .clone()
                .unwrap_or_else(|| "java/lang/Throwable".to_string())
        });
    match (catch_types.next(), catch_types.next()) {
        (Some(only), None) => TypeFact::Reference(Some(only)),
        _ => TypeFact::Reference(None),
    }
}

/// Executed type analysis of one method, with replay-based queries at
/// instruction granularity.
pub struct TypeDataflow {
    cfg: Arc<Cfg>,
    dataflow: Dataflow<TypeAnalysis>,
}

impl TypeDataflow {
    pub fn compute(
        cfg: Arc<Cfg>,
        descriptor: &MethodDescriptor,
        config: &AnalysisConfig,
    ) -> Result<Self> {
        let analysis = TypeAnalysis::new(descriptor.clone(), Arc::clone(cfg.method()));
        let mut dataflow = Dataflow::new(analysis);
        dataflow.execute(&cfg, descriptor, config.max_dataflow_iterations)?;
        Ok(Self { cfg, dataflow })
    }

    pub fn cfg(&self) -> &Arc<Cfg> {
        &self.cfg
    }

    /// Frame just before the instruction at `insn_index` of `block`.
    pub fn frame_before(&self, block: NodeIndex, insn_index: usize) -> Option<TypeFrame> {
        let (first, last) = self.cfg.block(block).range?;
        if insn_index < first || insn_index > last {
            return None;
        }
        let mut frame = self.dataflow.start_fact(block)?.clone();
        let analysis = self.dataflow.analysis();
        let cp = &self.cfg.method().constant_pool;
        for index in first..insn_index {
            let insn = self.cfg.method().instructions.get(index)?;
            analysis.transfer_insn(&insn.op, cp, &mut frame);
        }
        Some(frame)
    }

    /// Class of the value thrown by the `Throw` at `insn_index`, when the
    /// frame pins it down.
    pub fn thrown_class(&self, block: NodeIndex, insn_index: usize) -> Option<String> {
        match self.frame_before(block, insn_index)?.stack_top()? {
            TypeFact::Reference(Some(class)) => Some(class.clone()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_widens_mismatched_references() {
        let a = TypeFact::Reference(Some("java/io/IOException".into()));
        let b = TypeFact::Reference(Some("java/lang/RuntimeException".into()));
        assert_eq!(a.merge(&b), TypeFact::Reference(None));
        assert_eq!(a.merge(&a), a);
        assert_eq!(TypeFact::Null.merge(&a), a);
        assert_eq!(TypeFact::Top.merge(&a), a);
        assert_eq!(TypeFact::Int.merge(&a), TypeFact::Conflict);
    }

    #[test]
    fn merge_is_commutative_on_sample_points() {
        let points = [
            TypeFact::Top,
            TypeFact::Int,
            TypeFact::Null,
            TypeFact::Reference(None),
            TypeFact::Reference(Some("A".into())),
            TypeFact::Reference(Some("B".into())),
            TypeFact::Conflict,
        ];
        for a in &points {
            for b in &points {
                assert_eq!(a.merge(b), b.merge(a));
                assert_eq!(&a.merge(a), a);
            }
        }
    }

    #[test]
    fn frame_meet_detects_depth_mismatch() {
        let mut a = TypeFrame::Frame {
            locals: vec![TypeFact::Int],
            stack: vec![TypeFact::Int],
        };
        let b = TypeFrame::Frame {
            locals: vec![TypeFact::Int],
            stack: vec![],
        };
        a.meet(&b);
        assert_eq!(a, TypeFrame::Bottom);
    }

    #[test]
    fn signature_facts() {
        assert_eq!(TypeFact::for_signature("I"), TypeFact::Int);
        assert_eq!(TypeFact::for_signature("Z"), TypeFact::Int);
        assert_eq!(TypeFact::for_signature("J"), TypeFact::Long);
        assert_eq!(
            TypeFact::for_signature("Ljava/lang/String;"),
            TypeFact::Reference(Some("java/lang/String".into()))
        );
        assert_eq!(TypeFact::for_signature("[I"), TypeFact::Reference(None));
    }
}
