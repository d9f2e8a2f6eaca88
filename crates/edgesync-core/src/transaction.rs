//! Transaction accumulator.

use indexmap::IndexMap;
use uuid::Uuid;

use crate::attribute::Attribute;
use crate::error::ModelError;
use crate::topic::TopicAddress;

/// Attributes changed while a transaction is open, keyed by attribute id.
///
/// Each attribute appears once; its value is read when the transaction is
/// committed.
#[derive(Debug, Clone, Default)]
pub struct Transaction {
    attributes: IndexMap<Uuid, (TopicAddress, Attribute)>,
}

impl Transaction {
    /// Create an empty transaction.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a changed attribute.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::PathNotFound`] if the attribute has no address.
    pub fn add(&mut self, attribute: &Attribute) -> Result<(), ModelError> {
        if !self.attributes.contains_key(&attribute.id()) {
            let address = attribute.address()?;
            self.attributes
                .insert(attribute.id(), (address, attribute.clone()));
        }
        Ok(())
    }

    /// Number of distinct attributes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.attributes.len()
    }

    /// Whether nothing was recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }

    /// Recorded attributes in first-change order.
    pub fn iter(&self) -> impl Iterator<Item = (&TopicAddress, &Attribute)> {
        self.attributes
            .values()
            .map(|(address, attribute)| (address, attribute))
    }

    /// Drop everything recorded.
    pub fn clear(&mut self) {
        self.attributes.clear();
    }
}
