//! Write constraints.
//!
//! | path | allowed |
//! |------|---------|
//! | endpoint change | Status, Measure |
//! | endpoint initialization | all except Static, Parameter |
//! | static value | Static |
//! | cloud change | Parameter, SetPoint |

use crate::error::ModelError;
use serde::{Deserialize, Serialize};

/// Who may write an attribute, and when.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Constraint {
    /// Fixed description of the endpoint, set before registration
    Static,
    /// Configuration owned by the cloud, persisted by the endpoint
    Parameter,
    /// State reported by the endpoint
    Status,
    /// Target value owned by the cloud
    SetPoint,
    /// Measurement reported by the endpoint
    Measure,
}

impl Constraint {
    /// Check that the endpoint may change the value.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::ConstraintViolation`] unless Status or Measure.
    pub fn endpoint_will_change(self) -> Result<(), ModelError> {
        match self {
            Self::Status | Self::Measure => Ok(()),
            _ => Err(self.violation("set_value")),
        }
    }

    /// Check that the endpoint may seed the initial value.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::ConstraintViolation`] for Static and Parameter.
    pub fn endpoint_will_initialize(self) -> Result<(), ModelError> {
        match self {
            Self::Static | Self::Parameter => Err(self.violation("set_initial_value")),
            _ => Ok(()),
        }
    }

    /// Check that the endpoint may assign a static value.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::ConstraintViolation`] unless Static.
    pub fn endpoint_will_change_static(self) -> Result<(), ModelError> {
        match self {
            Self::Static => Ok(()),
            _ => Err(self.violation("set_static_value")),
        }
    }

    /// Check that the cloud may change the value.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::ConstraintViolation`] unless Parameter or SetPoint.
    pub fn cloud_will_change(self) -> Result<(), ModelError> {
        match self {
            Self::Parameter | Self::SetPoint => Ok(()),
            _ => Err(self.violation("set_value_from_cloud")),
        }
    }

    /// Whether values carry a timestamp on the wire.
    #[must_use]
    pub fn is_timestamped(self) -> bool {
        self != Self::Static
    }

    fn violation(self, operation: &'static str) -> ModelError {
        ModelError::ConstraintViolation {
            constraint: self,
            operation,
        }
    }
}

impl std::fmt::Display for Constraint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Static => "Static",
            Self::Parameter => "Parameter",
            Self::Status => "Status",
            Self::SetPoint => "SetPoint",
            Self::Measure => "Measure",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [Constraint; 5] = [
        Constraint::Static,
        Constraint::Parameter,
        Constraint::Status,
        Constraint::SetPoint,
        Constraint::Measure,
    ];

    #[test]
    fn endpoint_and_cloud_paths_are_disjoint() {
        for constraint in ALL {
            let endpoint = constraint.endpoint_will_change().is_ok();
            let cloud = constraint.cloud_will_change().is_ok();
            assert!(!(endpoint && cloud), "{constraint} writable from both sides");
        }
    }

    #[test]
    fn initialization_matrix() {
        let allowed: Vec<_> = ALL
            .into_iter()
            .filter(|c| c.endpoint_will_initialize().is_ok())
            .collect();
        assert_eq!(
            allowed,
            vec![Constraint::Status, Constraint::SetPoint, Constraint::Measure]
        );
    }

    #[test]
    fn only_static_accepts_static_values() {
        for constraint in ALL {
            assert_eq!(
                constraint.endpoint_will_change_static().is_ok(),
                constraint == Constraint::Static
            );
        }
    }
}
