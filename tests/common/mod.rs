//! Shared fixtures: hand-assembled method bodies and an in-memory class
//! source with a small exception hierarchy.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytelint::core::{
    AnalysisError, ClassData, ClassDescriptor, ClassSource, Constant, ConstantPool,
    ExceptionTableEntry, Instruction, InstructionList, LocalVariableEntry, LocalVariableTable,
    MethodAccess, MethodData, MethodDescriptor, Opcode,
};

/// Opt-in log output while debugging test runs: `RUST_LOG=debug`.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Builder for one decoded method body.
pub struct MethodFixture {
    name: String,
    signature: String,
    access: MethodAccess,
    ops: Vec<(u32, Opcode)>,
    code_len: Option<u32>,
    exception_table: Vec<ExceptionTableEntry>,
    local_variables: Vec<LocalVariableEntry>,
    constants: Vec<Constant>,
}

impl MethodFixture {
    pub fn new(name: &str, signature: &str) -> Self {
        Self {
            name: name.to_string(),
            signature: signature.to_string(),
            access: MethodAccess {
                is_static: true,
                ..Default::default()
            },
            ops: Vec::new(),
            code_len: None,
            exception_table: Vec::new(),
            local_variables: Vec::new(),
            constants: Vec::new(),
        }
    }

    pub fn instance(mut self) -> Self {
        self.access.is_static = false;
        self
    }

    pub fn synthetic(mut self) -> Self {
        self.access.is_synthetic = true;
        self
    }

    pub fn abstract_method(mut self) -> Self {
        self.access.is_abstract = true;
        self
    }

    pub fn ops(mut self, ops: Vec<(u32, Opcode)>) -> Self {
        self.ops = ops;
        self
    }

    pub fn code_len(mut self, code_len: u32) -> Self {
        self.code_len = Some(code_len);
        self
    }

    pub fn catch(mut self, start: u32, end: u32, handler: u32, catch_type: Option<&str>) -> Self {
        self.exception_table.push(ExceptionTableEntry {
            start_pc: start,
            end_pc: end,
            handler_pc: handler,
            catch_type: catch_type.map(str::to_string),
        });
        self
    }

    pub fn local_var(mut self, name: &str, signature: &str, slot: u16, start: u32, length: u32) -> Self {
        self.local_variables.push(LocalVariableEntry {
            name: name.to_string(),
            signature: signature.to_string(),
            slot,
            start_pc: start,
            length,
        });
        self
    }

    pub fn constants(mut self, constants: Vec<Constant>) -> Self {
        self.constants = constants;
        self
    }

    pub fn build(self) -> Arc<MethodData> {
        let code_len = self
            .code_len
            .unwrap_or_else(|| self.ops.last().map(|(pos, _)| pos + 1).unwrap_or(0));
        let local_variables = if self.local_variables.is_empty() {
            None
        } else {
            Some(LocalVariableTable::new(self.local_variables))
        };
        Arc::new(MethodData {
            name: self.name,
            signature: self.signature,
            access: self.access,
            instructions: InstructionList::new(
                self.ops
                    .into_iter()
                    .map(|(pos, op)| Instruction { pos, op })
                    .collect(),
                code_len,
            ),
            exception_table: self.exception_table,
            local_variables,
            constant_pool: Arc::new(ConstantPool::new(self.constants)),
            max_stack: 8,
            max_locals: 8,
        })
    }
}

/// Decoded class holding the given methods.
pub fn class_of(name: &str, methods: Vec<Arc<MethodData>>) -> Arc<ClassData> {
    let constant_pool = methods
        .first()
        .map(|m| Arc::clone(&m.constant_pool))
        .unwrap_or_default();
    Arc::new(ClassData {
        descriptor: ClassDescriptor::new(name.to_string()),
        superclass: Some("java/lang/Object".to_string()),
        methods,
        constant_pool,
    })
}

pub fn descriptor_of(class: &str, method: &MethodData) -> MethodDescriptor {
    MethodDescriptor::new(
        ClassDescriptor::new(class.to_string()),
        method.name.clone(),
        method.signature.clone(),
        method.access.is_static,
    )
}

/// `try { f(); if (x > 3) return 1; return 0; } finally { if (x > 3) log(); }`
///
/// The finally body appears three times: inline before each return and
/// canonically in the any-catch handler (store, body, load, rethrow).
/// Shared between the finally-duplicates and value-range suites.
pub fn duplicated_finally_method() -> Arc<MethodData> {
    use bytelint::core::{CmpOp, ValueKind};

    MethodFixture::new("withFinally", "(I)I")
        .ops(vec![
            (0, Opcode::InvokeStatic { index: 0 }),
            (3, Opcode::Load { kind: ValueKind::Int, slot: 0 }),
            (4, Opcode::Push { kind: ValueKind::Int, value: 3 }),
            (6, Opcode::IfCmp { cond: CmpOp::Le, target: 21 }),
            // inline copy #1, window [9, 18)
            (9, Opcode::Load { kind: ValueKind::Int, slot: 0 }),
            (10, Opcode::Push { kind: ValueKind::Int, value: 3 }),
            (12, Opcode::IfCmp { cond: CmpOp::Le, target: 18 }),
            (15, Opcode::InvokeStatic { index: 1 }),
            (18, Opcode::Push { kind: ValueKind::Int, value: 1 }),
            (20, Opcode::Return { kind: Some(ValueKind::Int) }),
            // inline copy #2, window [21, 30)
            (21, Opcode::Load { kind: ValueKind::Int, slot: 0 }),
            (22, Opcode::Push { kind: ValueKind::Int, value: 3 }),
            (24, Opcode::IfCmp { cond: CmpOp::Le, target: 30 }),
            (27, Opcode::InvokeStatic { index: 1 }),
            (30, Opcode::Push { kind: ValueKind::Int, value: 0 }),
            (32, Opcode::Return { kind: Some(ValueKind::Int) }),
            // any-catch handler: canonical copy, window [34, 43)
            (33, Opcode::Store { kind: ValueKind::Ref, slot: 1 }),
            (34, Opcode::Load { kind: ValueKind::Int, slot: 0 }),
            (35, Opcode::Push { kind: ValueKind::Int, value: 3 }),
            (37, Opcode::IfCmp { cond: CmpOp::Le, target: 43 }),
            (40, Opcode::InvokeStatic { index: 1 }),
            (43, Opcode::Load { kind: ValueKind::Ref, slot: 1 }),
            (44, Opcode::Throw),
        ])
        .catch(0, 9, 33, None)
        .local_var("x", "I", 0, 0, 45)
        .constants(vec![
            Constant::MethodRef {
                class: "com/example/A".into(),
                name: "f".into(),
                signature: "()V".into(),
            },
            Constant::MethodRef {
                class: "com/example/A".into(),
                name: "log".into(),
                signature: "()V".into(),
            },
        ])
        .build()
}

/// In-memory class source with a fixed exception hierarchy.
pub struct FixtureSource {
    classes: HashMap<String, Arc<ClassData>>,
    /// class -> direct superclass; `None` marks a hierarchy root.
    hierarchy: HashMap<String, Option<String>>,
    always_throwing: Vec<String>,
    declared_exceptions: HashMap<String, Vec<String>>,
    load_calls: AtomicUsize,
}

impl FixtureSource {
    pub fn new() -> Self {
        let mut hierarchy: HashMap<String, Option<String>> = HashMap::new();
        hierarchy.insert("java/lang/Object".into(), None);
        for (sub, sup) in [
            ("java/lang/Throwable", "java/lang/Object"),
            ("java/lang/Exception", "java/lang/Throwable"),
            ("java/lang/RuntimeException", "java/lang/Exception"),
            ("java/lang/IllegalStateException", "java/lang/RuntimeException"),
            ("java/lang/Error", "java/lang/Throwable"),
            ("java/lang/AssertionError", "java/lang/Error"),
            ("java/io/IOException", "java/lang/Exception"),
        ] {
            hierarchy.insert(sub.into(), Some(sup.into()));
        }
        Self {
            classes: HashMap::new(),
            hierarchy,
            always_throwing: Vec::new(),
            declared_exceptions: HashMap::new(),
            load_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_class(mut self, class: Arc<ClassData>) -> Self {
        self.classes
            .insert(class.descriptor.class_name().to_string(), class);
        self
    }

    pub fn with_always_throwing(mut self, method_name: &str) -> Self {
        self.always_throwing.push(method_name.to_string());
        self
    }

    pub fn with_declared_exceptions(mut self, method_name: &str, exceptions: &[&str]) -> Self {
        self.declared_exceptions.insert(
            method_name.to_string(),
            exceptions.iter().map(|s| s.to_string()).collect(),
        );
        self
    }

    pub fn load_calls(&self) -> usize {
        self.load_calls.load(Ordering::SeqCst)
    }
}

impl Default for FixtureSource {
    fn default() -> Self {
        Self::new()
    }
}

impl ClassSource for FixtureSource {
    fn load_class(
        &self,
        descriptor: &ClassDescriptor,
    ) -> Result<Arc<ClassData>, AnalysisError> {
        self.load_calls.fetch_add(1, Ordering::SeqCst);
        self.classes
            .get(descriptor.class_name())
            .cloned()
            .ok_or_else(|| AnalysisError::ClassNotFound {
                descriptor: descriptor.clone(),
            })
    }

    fn is_subtype_of(&self, sub: &str, sup: &str) -> Result<bool, AnalysisError> {
        if sub == sup {
            return Ok(true);
        }
        if !self.hierarchy.contains_key(sup) {
            return Err(AnalysisError::ClassNotFound {
                descriptor: ClassDescriptor::new(sup.to_string()),
            });
        }
        let mut current = Some(sub.to_string());
        while let Some(class) = current {
            if class == sup {
                return Ok(true);
            }
            match self.hierarchy.get(&class) {
                Some(parent) => current = parent.clone(),
                None => {
                    return Err(AnalysisError::ClassNotFound {
                        descriptor: ClassDescriptor::new(class),
                    })
                }
            }
        }
        Ok(false)
    }

    fn always_throws(&self, _class: &str, name: &str, _signature: &str) -> bool {
        self.always_throwing.iter().any(|m| m == name)
    }

    fn declared_exceptions(&self, _class: &str, name: &str, _signature: &str) -> Vec<String> {
        self.declared_exceptions
            .get(name)
            .cloned()
            .unwrap_or_default()
    }
}
