//! Shared data model: descriptors, decoded input, errors.

pub mod descriptors;
pub mod errors;
pub mod insn;
pub mod method;
pub mod sig;

pub use descriptors::{ClassDescriptor, MethodDescriptor};
pub use errors::{AnalysisError, Result};
pub use insn::{CmpOp, Instruction, InstructionList, Opcode, ValueKind};
pub use method::{
    ClassData, ClassSource, Constant, ConstantPool, ExceptionTableEntry, LocalVariableEntry,
    LocalVariableTable, MethodAccess, MethodData,
};
