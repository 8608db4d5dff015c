//! Immutable identifiers for classes and methods.
//!
//! Descriptors are the cache keys used throughout the engine. They carry no
//! behavior beyond equality, ordering and hashing, and are cheap to clone
//! (interned string handles).

use std::fmt;
use std::sync::Arc;

/// Identifier for a class, holding its internal (slash-separated) name,
/// e.g. `java/lang/Object`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClassDescriptor {
    class_name: Arc<str>,
}

impl ClassDescriptor {
    pub fn new(class_name: impl Into<Arc<str>>) -> Self {
        Self {
            class_name: class_name.into(),
        }
    }

    /// Internal slash-separated name.
    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    /// Dot-separated source-level name.
    pub fn dotted_name(&self) -> String {
        self.class_name.replace('/', ".")
    }
}

impl fmt::Display for ClassDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.class_name)
    }
}

/// Identifier for a method within a class: name, JVM-style signature and
/// static/instance flag.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MethodDescriptor {
    class: ClassDescriptor,
    name: Arc<str>,
    signature: Arc<str>,
    is_static: bool,
}

impl MethodDescriptor {
    pub fn new(
        class: ClassDescriptor,
        name: impl Into<Arc<str>>,
        signature: impl Into<Arc<str>>,
        is_static: bool,
    ) -> Self {
        Self {
            class,
            name: name.into(),
            signature: signature.into(),
            is_static,
        }
    }

    pub fn class(&self) -> &ClassDescriptor {
        &self.class
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// JVM-style method signature, e.g. `(IJ)V`.
    pub fn signature(&self) -> &str {
        &self.signature
    }

    pub fn is_static(&self) -> bool {
        self.is_static
    }
}

impl fmt::Display for MethodDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}{}", self.class, self.name, self.signature)
    }
}
