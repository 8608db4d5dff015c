//! Decoded class and method bodies as presented by the loader.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::descriptors::ClassDescriptor;
use super::errors::{AnalysisError, Result};
use super::insn::InstructionList;

/// One decoded constant-pool entry. Reference entries arrive fully
/// resolved; no index chains remain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Constant {
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Str(String),
    Class {
        name: String,
    },
    FieldRef {
        class: String,
        name: String,
        signature: String,
    },
    MethodRef {
        class: String,
        name: String,
        signature: String,
    },
}

impl Constant {
    /// Integral value of the constant, if it has one.
    pub fn integral_value(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(i64::from(*v)),
            Self::Long(v) => Some(*v),
            _ => None,
        }
    }
}

/// Decoded constant pool of one class.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConstantPool {
    entries: Vec<Constant>,
}

impl ConstantPool {
    pub fn new(entries: Vec<Constant>) -> Self {
        Self { entries }
    }

    pub fn get(&self, index: u16) -> Option<&Constant> {
        self.entries.get(usize::from(index))
    }

    pub fn field_ref(&self, index: u16) -> Option<(&str, &str, &str)> {
        match self.get(index)? {
            Constant::FieldRef {
                class,
                name,
                signature,
            } => Some((class, name, signature)),
            _ => None,
        }
    }

    pub fn method_ref(&self, index: u16) -> Option<(&str, &str, &str)> {
        match self.get(index)? {
            Constant::MethodRef {
                class,
                name,
                signature,
            } => Some((class, name, signature)),
            _ => None,
        }
    }

    pub fn class_name(&self, index: u16) -> Option<&str> {
        match self.get(index)? {
            Constant::Class { name } => Some(name),
            _ => None,
        }
    }
}

/// One exception-table row. `catch_type` of `None` is the "any" handler
/// the compiler emits for `finally`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionTableEntry {
    pub start_pc: u32,
    pub end_pc: u32,
    pub handler_pc: u32,
    pub catch_type: Option<String>,
}

impl ExceptionTableEntry {
    pub fn is_catch_any(&self) -> bool {
        self.catch_type.is_none()
    }

    pub fn covers(&self, pos: u32) -> bool {
        pos >= self.start_pc && pos < self.end_pc
    }
}

/// One local-variable-table row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalVariableEntry {
    pub name: String,
    pub signature: String,
    pub slot: u16,
    pub start_pc: u32,
    pub length: u32,
}

/// Optional debug table mapping slots to source names within a scope.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalVariableTable {
    entries: Vec<LocalVariableEntry>,
}

impl LocalVariableTable {
    pub fn new(entries: Vec<LocalVariableEntry>) -> Self {
        Self { entries }
    }

    /// Entry for `slot` whose scope contains `pos`.
    pub fn lookup(&self, slot: u16, pos: u32) -> Option<&LocalVariableEntry> {
        self.entries
            .iter()
            .find(|e| e.slot == slot && pos >= e.start_pc && pos < e.start_pc + e.length)
    }
}

/// Access flags the analyses branch on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodAccess {
    pub is_static: bool,
    pub is_synthetic: bool,
    pub is_native: bool,
    pub is_abstract: bool,
}

/// One decoded method body.
#[derive(Debug, Clone, PartialEq)]
pub struct MethodData {
    pub name: String,
    pub signature: String,
    pub access: MethodAccess,
    pub instructions: InstructionList,
    pub exception_table: Vec<ExceptionTableEntry>,
    pub local_variables: Option<LocalVariableTable>,
    pub constant_pool: Arc<ConstantPool>,
    pub max_stack: u16,
    pub max_locals: u16,
}

impl MethodData {
    /// Methods without a body (native/abstract) have nothing to analyze.
    pub fn has_code(&self) -> bool {
        !self.access.is_native && !self.access.is_abstract
    }
}

/// One decoded class: the unit the loader resolves.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassData {
    pub descriptor: ClassDescriptor,
    pub superclass: Option<String>,
    pub methods: Vec<Arc<MethodData>>,
    pub constant_pool: Arc<ConstantPool>,
}

impl ClassData {
    pub fn find_method(&self, name: &str, signature: &str) -> Option<&Arc<MethodData>> {
        self.methods
            .iter()
            .find(|m| m.name == name && m.signature == signature)
    }
}

/// The loader-facing interface: everything the engine needs from the
/// bytecode-loading collaborator. Hierarchy and thrower queries default to
/// conservative answers so minimal sources stay easy to implement.
pub trait ClassSource: Send + Sync {
    /// Resolve and decode a class. A missing class is
    /// `AnalysisError::ClassNotFound`, which callers report through the
    /// cache's lookup-failure callback and then degrade on.
    fn load_class(&self, descriptor: &ClassDescriptor) -> Result<Arc<ClassData>>;

    /// Whether `sub` is `sup` or a subtype of it (internal names). `Err`
    /// means the hierarchy could not be resolved.
    fn is_subtype_of(&self, sub: &str, sup: &str) -> Result<bool> {
        if sub == sup {
            return Ok(true);
        }
        Err(AnalysisError::ClassNotFound {
            descriptor: ClassDescriptor::new(sup.to_string()),
        })
    }

    /// Whether a call to this method is statically known to never return
    /// normally.
    fn always_throws(&self, _class: &str, _name: &str, _signature: &str) -> bool {
        false
    }

    /// Checked exceptions a call to this method may raise.
    fn declared_exceptions(&self, _class: &str, _name: &str, _signature: &str) -> Vec<String> {
        Vec::new()
    }
}
