//! Set-once cells for identity fields.
//!
//! Names, parents, constraints and types are written exactly once. A second
//! write is a programming error and fails with [`ModelError::Modification`].

use crate::error::ModelError;

/// A field that transitions from `Unset` to `Set` exactly once.
///
/// `Cleared` is the terminal state of a detached element: the value is gone
/// and can never be set again.
#[derive(Debug, Clone, Default)]
pub enum SetOnce<T> {
    /// No value assigned yet
    #[default]
    Unset,
    /// Value assigned
    Set(T),
    /// Value removed on teardown
    Cleared,
}

impl<T> SetOnce<T> {
    /// Create a cell already holding `value`.
    #[must_use]
    pub fn new(value: T) -> Self {
        Self::Set(value)
    }

    /// Assign the value.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::Modification`] if the cell was ever set before.
    pub fn set(&mut self, field: &'static str, value: T) -> Result<(), ModelError> {
        match self {
            Self::Unset => {
                *self = Self::Set(value);
                Ok(())
            }
            Self::Set(_) | Self::Cleared => Err(ModelError::Modification(field)),
        }
    }

    /// Get the value if set.
    #[must_use]
    pub fn get(&self) -> Option<&T> {
        match self {
            Self::Set(value) => Some(value),
            Self::Unset | Self::Cleared => None,
        }
    }

    /// Whether a value was ever assigned.
    #[must_use]
    pub fn is_assigned(&self) -> bool {
        !matches!(self, Self::Unset)
    }

    /// Drop the value and move to the terminal state.
    pub fn clear(&mut self) {
        *self = Self::Cleared;
    }
}
