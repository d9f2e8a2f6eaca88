//! Nodes: root objects registered into an endpoint.

use std::ops::Deref;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};

use crate::error::ModelError;
use crate::object::{ChangeSink, ObjectNode};

/// A root-level object carrying declared interface tags.
///
/// A node is unregistered (unsealed) until it is added to an endpoint. From
/// then on its subtree structure, interfaces and static values are frozen.
#[derive(Clone)]
pub struct Node {
    object: ObjectNode,
}

impl Node {
    /// Create an unregistered node.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            object: ObjectNode::build(Some(name.into()), true),
        }
    }

    /// Node name.
    #[must_use]
    pub fn name(&self) -> String {
        self.object.name().unwrap_or_default()
    }

    /// Underlying object.
    #[must_use]
    pub fn as_object(&self) -> &ObjectNode {
        &self.object
    }

    /// Declare an interface tag implemented by this node.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::StructuralLock`] once registered.
    pub fn declare_interface(&self, interface: impl Into<String>) -> Result<(), ModelError> {
        self.object.ensure_mutable("declare_interface")?;
        let interface = interface.into();
        let mut interfaces = self.object.inner.interfaces.write();
        if !interfaces.contains(&interface) {
            interfaces.push(interface);
        }
        Ok(())
    }

    /// Declared interface tags.
    #[must_use]
    pub fn interfaces(&self) -> Vec<String> {
        self.object.inner.interfaces.read().clone()
    }

    /// Whether this node has been sealed by registration.
    #[must_use]
    pub fn is_registered(&self) -> bool {
        self.object.inner.sealed.load(Ordering::Acquire)
    }

    /// Seal the node and link it to an endpoint.
    ///
    /// Called by the endpoint runtime when the node is added. A node can be
    /// registered once; a removed node cannot be registered again.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::Modification`] if the node was registered before
    /// and [`ModelError::Closed`] if it was closed.
    pub fn register(&self, endpoint_id: Arc<str>, sink: Weak<dyn ChangeSink>) -> Result<(), ModelError> {
        self.object.set_endpoint(endpoint_id, sink)
    }
}

impl Deref for Node {
    type Target = ObjectNode;

    fn deref(&self) -> &ObjectNode {
        &self.object
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name())
            .field("interfaces", &self.interfaces())
            .field("registered", &self.is_registered())
            .field("object", &self.object)
            .finish()
    }
}
