//! Topic addresses of tree elements.
//!
//! ```text
//! node      = {endpoint-id}/nodes/{node}
//! object    = {node-or-object}/objects/{object}
//! attribute = {object-or-node}/attributes/{attribute}
//! ```
//!
//! The address string is the element's identity. [`resolve`] walks the same
//! grammar backwards to find the element an inbound topic refers to.

use serde::{Deserialize, Serialize};

use crate::attribute::Attribute;
use crate::error::ModelError;
use crate::node::Node;
use crate::object::ObjectNode;

/// Canonical slash-delimited address of a tree element.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TopicAddress(String);

impl TopicAddress {
    /// Address of a node of the endpoint `endpoint_id`.
    #[must_use]
    pub fn node(endpoint_id: &str, node: &str) -> Self {
        Self(format!("{endpoint_id}/nodes/{node}"))
    }

    /// Address of child object `name`.
    #[must_use]
    pub fn object(&self, name: &str) -> Self {
        Self(format!("{}/objects/{name}", self.0))
    }

    /// Address of child attribute `name`.
    #[must_use]
    pub fn attribute(&self, name: &str) -> Self {
        Self(format!("{}/attributes/{name}", self.0))
    }

    /// Address as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TopicAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for TopicAddress {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// An element located by [`resolve`].
#[derive(Debug, Clone)]
pub enum Element {
    /// A registered node
    Node(Node),
    /// An object inside a node
    Object(ObjectNode),
    /// An attribute
    Attribute(Attribute),
}

impl Element {
    /// The attribute, if this element is one.
    #[must_use]
    pub fn into_attribute(self) -> Option<Attribute> {
        match self {
            Self::Attribute(attribute) => Some(attribute),
            Self::Node(_) | Self::Object(_) => None,
        }
    }
}

/// Locate the element addressed by `path` below the endpoint `endpoint_id`.
///
/// `lookup_node` maps a node name to the endpoint's registered node.
///
/// # Errors
///
/// Returns [`ModelError::PathNotFound`] unless `path` names exactly one
/// live element.
pub fn resolve<F>(endpoint_id: &str, path: &str, lookup_node: F) -> Result<Element, ModelError>
where
    F: FnOnce(&str) -> Option<Node>,
{
    let not_found = || ModelError::PathNotFound(path.to_string());
    let rest = path
        .strip_prefix(endpoint_id)
        .and_then(|rest| rest.strip_prefix('/'))
        .ok_or_else(not_found)?;
    let mut segments = rest.split('/');
    let node = match (segments.next(), segments.next()) {
        (Some("nodes"), Some(name)) => lookup_node(name).ok_or_else(not_found)?,
        _ => return Err(not_found()),
    };

    let mut element = Element::Node(node);
    while let Some(kind) = segments.next() {
        let name = segments.next().ok_or_else(not_found)?;
        let container: &ObjectNode = match &element {
            Element::Node(node) => node.as_object(),
            Element::Object(object) => object,
            Element::Attribute(_) => return Err(not_found()),
        };
        let next = match kind {
            "objects" => container.object(name).map(Element::Object),
            "attributes" => container.attribute(name).map(Element::Attribute),
            _ => None,
        };
        element = next.ok_or_else(not_found)?;
    }
    Ok(element)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constraint::Constraint;
    use crate::object::tests::null_sink;
    use crate::value::AttributeType;

    fn tree() -> (Node, Attribute) {
        let node = Node::new("N");
        let object = node.add_object("O").unwrap();
        let attr = object
            .add_attribute("A", Constraint::Measure, AttributeType::NUMBER)
            .unwrap();
        node.register("dev1".into(), null_sink()).unwrap();
        (node, attr)
    }

    #[test]
    fn address_is_canonical() {
        let (node, attr) = tree();
        assert_eq!(
            attr.address().unwrap().as_str(),
            "dev1/nodes/N/objects/O/attributes/A"
        );
        assert_eq!(node.address().unwrap().as_str(), "dev1/nodes/N");
    }

    #[test]
    fn resolve_round_trips_to_same_instance() {
        let (node, attr) = tree();
        let address = attr.address().unwrap();
        let found = resolve("dev1", address.as_str(), |name| {
            (name == "N").then(|| node.clone())
        })
        .unwrap()
        .into_attribute()
        .unwrap();
        assert!(found.ptr_eq(&attr));
    }

    #[test]
    fn resolve_rejects_malformed_paths() {
        let (node, _) = tree();
        for path in [
            "dev2/nodes/N/objects/O/attributes/A",
            "dev1/nodes/X/objects/O/attributes/A",
            "dev1/nodes/N/objects/O/attributes",
            "dev1/nodes/N/attributes/O",
            "dev1/nodes/N/objects/O/attributes/A/objects/B",
            "dev1/nodes/N/things/O",
            "dev1/N",
            "dev1",
        ] {
            let result = resolve("dev1", path, |name| (name == "N").then(|| node.clone()));
            assert!(
                matches!(result, Err(ModelError::PathNotFound(_))),
                "{path} resolved"
            );
        }
    }

    #[test]
    fn unregistered_elements_have_no_address() {
        let node = Node::new("N");
        let attr = node
            .add_attribute("A", Constraint::Status, AttributeType::BOOLEAN)
            .unwrap();
        assert!(matches!(attr.address(), Err(ModelError::PathNotFound(_))));
    }
}
