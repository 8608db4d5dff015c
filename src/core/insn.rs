//! Decoded instruction model.
//!
//! The external loader hands the engine a flat list of decoded instructions
//! with their byte offsets. The opcode set is closed over the instruction
//! forms the analyses inspect; branch targets are absolute byte offsets into
//! the same method.

use serde::{Deserialize, Serialize};

/// Width class of a value moved by a load/store/push.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueKind {
    Int,
    Long,
    Float,
    Double,
    Ref,
}

/// Comparison operator of a conditional branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Ge,
    Gt,
    Le,
}

impl CmpOp {
    /// Operator with the opposite outcome on the same operands.
    pub fn negated(self) -> Self {
        match self {
            Self::Eq => Self::Ne,
            Self::Ne => Self::Eq,
            Self::Lt => Self::Ge,
            Self::Ge => Self::Lt,
            Self::Gt => Self::Le,
            Self::Le => Self::Gt,
        }
    }

    /// Operator yielding the same outcome with operands swapped.
    pub fn flipped(self) -> Self {
        match self {
            Self::Lt => Self::Gt,
            Self::Gt => Self::Lt,
            Self::Le => Self::Ge,
            Self::Ge => Self::Le,
            other => other,
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Ge => ">=",
            Self::Gt => ">",
            Self::Le => "<=",
        }
    }
}

/// One decoded instruction form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Opcode {
    Nop,
    /// Immediate constant push (iconst/bipush/sipush and the long forms).
    Push { kind: ValueKind, value: i64 },
    /// Constant-pool load (ldc family); index into the decoded pool.
    LoadConst { index: u16 },
    Load { kind: ValueKind, slot: u16 },
    Store { kind: ValueKind, slot: u16 },
    /// In-place increment of an int local.
    Iinc { slot: u16, delta: i16 },
    /// Long comparison pushing -1/0/1.
    LongCmp,
    /// One-operand conditional branch, comparing against zero.
    If { cond: CmpOp, target: u32 },
    /// Two-operand int conditional branch.
    IfCmp { cond: CmpOp, target: u32 },
    Goto { target: u32 },
    New { index: u16 },
    Dup,
    Pop,
    GetStatic { index: u16 },
    GetField { index: u16 },
    InvokeStatic { index: u16 },
    InvokeVirtual { index: u16 },
    InvokeSpecial { index: u16 },
    /// Method return; `None` for void.
    Return { kind: Option<ValueKind> },
    /// athrow.
    Throw,
}

impl Opcode {
    /// Target of a branch instruction, if any.
    pub fn branch_target(&self) -> Option<u32> {
        match self {
            Self::If { target, .. } | Self::IfCmp { target, .. } | Self::Goto { target } => {
                Some(*target)
            }
            _ => None,
        }
    }

    pub fn is_conditional_branch(&self) -> bool {
        matches!(self, Self::If { .. } | Self::IfCmp { .. })
    }

    /// Ends a straight-line run unconditionally (no fall-through).
    pub fn ends_flow(&self) -> bool {
        matches!(self, Self::Goto { .. } | Self::Return { .. } | Self::Throw)
    }

    /// Slot written by this instruction, if it writes a local.
    pub fn written_slot(&self) -> Option<u16> {
        match self {
            Self::Store { slot, .. } | Self::Iinc { slot, .. } => Some(*slot),
            _ => None,
        }
    }

    /// Potentially excepting instruction: may raise at runtime and therefore
    /// participates in exception-handler edges.
    pub fn can_throw(&self) -> bool {
        matches!(
            self,
            Self::Throw
                | Self::New { .. }
                | Self::GetStatic { .. }
                | Self::GetField { .. }
                | Self::InvokeStatic { .. }
                | Self::InvokeVirtual { .. }
                | Self::InvokeSpecial { .. }
        )
    }
}

/// One instruction at its byte offset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instruction {
    pub pos: u32,
    pub op: Opcode,
}

/// The decoded instruction stream of one method, ordered by byte offset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstructionList {
    insns: Vec<Instruction>,
    positions: Vec<u32>,
    code_len: u32,
}

impl InstructionList {
    /// Build from decoded instructions. Instructions must already be sorted
    /// by position; `code_len` is the total byte length of the code array.
    pub fn new(insns: Vec<Instruction>, code_len: u32) -> Self {
        debug_assert!(insns.windows(2).all(|w| w[0].pos < w[1].pos));
        let positions = insns.iter().map(|i| i.pos).collect();
        Self {
            insns,
            positions,
            code_len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.insns.is_empty()
    }

    pub fn len(&self) -> usize {
        self.insns.len()
    }

    pub fn code_len(&self) -> u32 {
        self.code_len
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Instruction> {
        self.insns.iter()
    }

    pub fn get(&self, index: usize) -> Option<&Instruction> {
        self.insns.get(index)
    }

    /// Byte offsets of every instruction, in order.
    pub fn positions(&self) -> &[u32] {
        &self.positions
    }

    /// Exact index of the instruction starting at `pos`.
    pub fn index_of(&self, pos: u32) -> Option<usize> {
        self.positions.binary_search(&pos).ok()
    }

    /// Instruction starting at `pos`, if any.
    pub fn at(&self, pos: u32) -> Option<&Instruction> {
        self.index_of(pos).map(|i| &self.insns[i])
    }

    /// Ordinal of the instruction at `pos`; for offsets between
    /// instructions, the ordinal of the next one.
    pub fn insn_number(&self, pos: u32) -> usize {
        self.positions.binary_search(&pos).unwrap_or_else(|i| i)
    }

    /// Byte length of the instruction at `index`.
    pub fn byte_len(&self, index: usize) -> u32 {
        let start = self.positions[index];
        let end = self
            .positions
            .get(index + 1)
            .copied()
            .unwrap_or(self.code_len);
        end - start
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> InstructionList {
        InstructionList::new(
            vec![
                Instruction {
                    pos: 0,
                    op: Opcode::Load {
                        kind: ValueKind::Int,
                        slot: 1,
                    },
                },
                Instruction {
                    pos: 1,
                    op: Opcode::Push {
                        kind: ValueKind::Int,
                        value: 100,
                    },
                },
                Instruction {
                    pos: 3,
                    op: Opcode::IfCmp {
                        cond: CmpOp::Ne,
                        target: 9,
                    },
                },
                Instruction {
                    pos: 6,
                    op: Opcode::Return {
                        kind: Some(ValueKind::Int),
                    },
                },
                Instruction {
                    pos: 9,
                    op: Opcode::Return {
                        kind: Some(ValueKind::Int),
                    },
                },
            ],
            10,
        )
    }

    #[test]
    fn position_lookup() {
        let il = sample();
        assert_eq!(il.index_of(3), Some(2));
        assert_eq!(il.index_of(4), None);
        assert_eq!(il.insn_number(3), 2);
        assert_eq!(il.insn_number(4), 3);
    }

    #[test]
    fn byte_lengths_come_from_position_gaps() {
        let il = sample();
        assert_eq!(il.byte_len(0), 1);
        assert_eq!(il.byte_len(1), 2);
        assert_eq!(il.byte_len(2), 3);
        assert_eq!(il.byte_len(4), 1);
    }

    #[test]
    fn cmp_op_negation_and_flip() {
        assert_eq!(CmpOp::Gt.negated(), CmpOp::Le);
        assert_eq!(CmpOp::Ge.negated(), CmpOp::Lt);
        assert_eq!(CmpOp::Gt.flipped(), CmpOp::Lt);
        assert_eq!(CmpOp::Eq.flipped(), CmpOp::Eq);
    }
}
