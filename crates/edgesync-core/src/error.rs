//! Errors raised by the data model.

use crate::constraint::Constraint;

/// Errors that can occur while building or mutating the attribute tree.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ModelError {
    /// The attribute constraint does not allow this mutation path
    #[error("{operation} is not allowed on an attribute with constraint {constraint}")]
    ConstraintViolation {
        /// Constraint of the attribute
        constraint: Constraint,
        /// Mutation that was attempted
        operation: &'static str,
    },
    /// The attribute already holds a value
    #[error("attribute has already been initialized, an attribute can only be initialized once")]
    AlreadyInitialized,
    /// The owning node is registered, its structure is frozen
    #[error("{0}: the owning node is registered within an endpoint")]
    StructuralLock(&'static str),
    /// A set-once field was written a second time
    #[error("{0} can never be changed once set")]
    Modification(&'static str),
    /// A child with this name already exists in the container
    #[error("{kind} named \"{name}\" already exists")]
    DuplicateName {
        /// Kind of child (attribute, object, node)
        kind: &'static str,
        /// Conflicting name
        name: String,
    },
    /// The path does not resolve to an element of the tree
    #[error("path not found: {0}")]
    PathNotFound(String),
    /// A string could not be parsed into the attribute's type
    #[error("cannot parse \"{input}\" as {expected}")]
    Parse {
        /// Raw input
        input: String,
        /// Expected type name
        expected: String,
    },
    /// A value does not match the attribute's declared type
    #[error("type mismatch: expected {expected}, got {found}")]
    TypeMismatch {
        /// Declared type
        expected: String,
        /// Type of the offered value
        found: String,
    },
    /// The element was closed and can no longer be mutated
    #[error("element has been closed")]
    Closed,
}
