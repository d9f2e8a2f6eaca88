//! Objects: composites of attributes and nested objects.
//!
//! The structure of an object tree may only change while its root node is
//! unregistered. Children are exclusively owned: attaching an element sets its
//! name and parent exactly once, so elements can never move or be renamed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use indexmap::IndexMap;
use parking_lot::RwLock;

use crate::attribute::Attribute;
use crate::constraint::Constraint;
use crate::error::ModelError;
use crate::once::SetOnce;
use crate::topic::TopicAddress;
use crate::value::AttributeType;

/// Who caused an attribute change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeOrigin {
    /// Local application code
    Endpoint,
    /// The broker, optionally with a correlation id to acknowledge
    Cloud {
        /// Correlation id of the set request
        correlation_id: Option<String>,
    },
}

/// Receiver of attribute changes on registered nodes.
pub trait ChangeSink: Send + Sync {
    /// Called after an attribute of a registered node changed.
    fn attribute_changed(&self, attribute: &Attribute, origin: &ChangeOrigin);
}

#[derive(Clone)]
pub(crate) enum Container {
    Object(Weak<ObjectInner>),
    Endpoint {
        id: Arc<str>,
        sink: Weak<dyn ChangeSink>,
    },
}

#[derive(Default)]
struct Identity {
    name: SetOnce<String>,
    container: SetOnce<Container>,
    conforms: SetOnce<String>,
}

#[derive(Default)]
struct Children {
    attributes: IndexMap<String, Attribute>,
    objects: IndexMap<String, ObjectNode>,
}

pub(crate) struct ObjectInner {
    identity: RwLock<Identity>,
    children: RwLock<Children>,
    pub(crate) is_node: bool,
    pub(crate) interfaces: RwLock<Vec<String>>,
    pub(crate) sealed: AtomicBool,
    closed: AtomicBool,
}

/// Shared handle to an object. Clones refer to the same object.
#[derive(Clone)]
pub struct ObjectNode {
    pub(crate) inner: Arc<ObjectInner>,
}

impl Default for ObjectNode {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectNode {
    /// Create a detached, unnamed object.
    #[must_use]
    pub fn new() -> Self {
        Self::build(None, false)
    }

    pub(crate) fn build(name: Option<String>, is_node: bool) -> Self {
        let identity = Identity {
            name: name.map_or(SetOnce::Unset, SetOnce::new),
            ..Identity::default()
        };
        Self {
            inner: Arc::new(ObjectInner {
                identity: RwLock::new(identity),
                children: RwLock::new(Children::default()),
                is_node,
                interfaces: RwLock::new(Vec::new()),
                sealed: AtomicBool::new(false),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<ObjectInner>) -> Self {
        Self { inner }
    }

    /// Name within the parent, once attached.
    #[must_use]
    pub fn name(&self) -> Option<String> {
        self.inner.identity.read().name.get().cloned()
    }

    /// Conformance class, if declared.
    #[must_use]
    pub fn conformance(&self) -> Option<String> {
        self.inner.identity.read().conforms.get().cloned()
    }

    /// Whether the object has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Whether both handles refer to the same object.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Whether the root node of this tree is registered with an endpoint.
    #[must_use]
    pub fn is_registered(&self) -> bool {
        self.root().inner.sealed.load(Ordering::Acquire)
    }

    /// Declare the conformance class of this object.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::Modification`] if already declared and
    /// [`ModelError::StructuralLock`] once registered.
    pub fn declare_conformance(&self, conforms: impl Into<String>) -> Result<(), ModelError> {
        self.ensure_mutable("declare_conformance")?;
        self.inner
            .identity
            .write()
            .conforms
            .set("conforms", conforms.into())
    }

    /// Attribute child by name.
    #[must_use]
    pub fn attribute(&self, name: &str) -> Option<Attribute> {
        self.inner.children.read().attributes.get(name).cloned()
    }

    /// Object child by name.
    #[must_use]
    pub fn object(&self, name: &str) -> Option<ObjectNode> {
        self.inner.children.read().objects.get(name).cloned()
    }

    /// Attribute children in insertion order.
    #[must_use]
    pub fn attributes(&self) -> Vec<Attribute> {
        self.inner.children.read().attributes.values().cloned().collect()
    }

    /// Object children in insertion order.
    #[must_use]
    pub fn objects(&self) -> Vec<ObjectNode> {
        self.inner.children.read().objects.values().cloned().collect()
    }

    /// Create a new attribute and attach it under `name`.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::DuplicateName`] if the name is taken and
    /// [`ModelError::StructuralLock`] once registered.
    pub fn add_attribute(
        &self,
        name: impl Into<String>,
        constraint: Constraint,
        kind: AttributeType,
    ) -> Result<Attribute, ModelError> {
        let attribute = Attribute::new(constraint, kind);
        self.attach_attribute(name, &attribute)?;
        Ok(attribute)
    }

    /// Attach an existing, detached attribute under `name`.
    ///
    /// # Errors
    ///
    /// As [`ObjectNode::add_attribute`], plus [`ModelError::Modification`] if
    /// the attribute already belongs to an object.
    pub fn attach_attribute(
        &self,
        name: impl Into<String>,
        attribute: &Attribute,
    ) -> Result<(), ModelError> {
        let name = name.into();
        self.ensure_mutable("add_attribute")?;
        let mut children = self.inner.children.write();
        if children.attributes.contains_key(&name) {
            return Err(ModelError::DuplicateName {
                kind: "attribute",
                name,
            });
        }
        attribute.attach(name.clone(), Arc::downgrade(&self.inner))?;
        children.attributes.insert(name, attribute.clone());
        Ok(())
    }

    /// Create a new object and attach it under `name`.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::DuplicateName`] if the name is taken and
    /// [`ModelError::StructuralLock`] once registered.
    pub fn add_object(&self, name: impl Into<String>) -> Result<ObjectNode, ModelError> {
        let object = ObjectNode::new();
        self.attach_object(name, &object)?;
        Ok(object)
    }

    /// Attach an existing, detached object under `name`.
    ///
    /// # Errors
    ///
    /// As [`ObjectNode::add_object`], plus [`ModelError::Modification`] if the
    /// object already has a parent, is a node, or is an ancestor of `self`.
    pub fn attach_object(&self, name: impl Into<String>, object: &ObjectNode) -> Result<(), ModelError> {
        let name = name.into();
        self.ensure_mutable("add_object")?;
        if object.inner.is_node || self.root().ptr_eq(object) {
            return Err(ModelError::Modification("parent"));
        }
        if object.is_closed() {
            return Err(ModelError::Closed);
        }
        let mut children = self.inner.children.write();
        if children.objects.contains_key(&name) {
            return Err(ModelError::DuplicateName {
                kind: "object",
                name,
            });
        }
        {
            let mut identity = object.inner.identity.write();
            if identity.name.is_assigned() {
                return Err(ModelError::Modification("name"));
            }
            if identity.container.is_assigned() {
                return Err(ModelError::Modification("parent"));
            }
            identity.name.set("name", name.clone())?;
            identity
                .container
                .set("parent", Container::Object(Arc::downgrade(&self.inner)))?;
        }
        children.objects.insert(name, object.clone());
        Ok(())
    }

    /// Remove and close the attribute named `name`.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::PathNotFound`] if there is no such attribute and
    /// [`ModelError::StructuralLock`] once registered.
    pub fn remove_attribute(&self, name: &str) -> Result<Attribute, ModelError> {
        self.ensure_mutable("remove_attribute")?;
        let removed = self.inner.children.write().attributes.shift_remove(name);
        let attribute = removed.ok_or_else(|| ModelError::PathNotFound(name.to_string()))?;
        attribute.close();
        Ok(attribute)
    }

    /// Remove and close the object named `name`.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::PathNotFound`] if there is no such object and
    /// [`ModelError::StructuralLock`] once registered.
    pub fn remove_object(&self, name: &str) -> Result<ObjectNode, ModelError> {
        self.ensure_mutable("remove_object")?;
        let removed = self.inner.children.write().objects.shift_remove(name);
        let object = removed.ok_or_else(|| ModelError::PathNotFound(name.to_string()))?;
        object.close();
        Ok(object)
    }

    /// Resolve the topic address of this object.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::PathNotFound`] if the object is not part of a
    /// registered tree.
    pub fn address(&self) -> Result<TopicAddress, ModelError> {
        let (name, container) = {
            let identity = self.inner.identity.read();
            (identity.name.get().cloned(), identity.container.get().cloned())
        };
        let name = name.ok_or_else(|| ModelError::PathNotFound("<unnamed object>".into()))?;
        match container {
            Some(Container::Object(parent)) => {
                let parent = parent
                    .upgrade()
                    .ok_or_else(|| ModelError::PathNotFound(name.clone()))?;
                Ok(ObjectNode::from_inner(parent).address()?.object(&name))
            }
            Some(Container::Endpoint { id, .. }) => Ok(TopicAddress::node(&id, &name)),
            None => Err(ModelError::PathNotFound(name)),
        }
    }

    /// Close this object and its whole subtree.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let children = std::mem::take(&mut *self.inner.children.write());
        for attribute in children.attributes.values() {
            attribute.close();
        }
        for object in children.objects.values() {
            object.close();
        }
        self.inner.identity.write().container.clear();
    }

    pub(crate) fn attribute_changed(&self, attribute: &Attribute, origin: &ChangeOrigin) {
        let container = self.inner.identity.read().container.get().cloned();
        match container {
            Some(Container::Object(parent)) => {
                if let Some(parent) = parent.upgrade() {
                    ObjectNode::from_inner(parent).attribute_changed(attribute, origin);
                }
            }
            Some(Container::Endpoint { sink, .. }) => {
                if let Some(sink) = sink.upgrade() {
                    sink.attribute_changed(attribute, origin);
                }
            }
            None => {}
        }
    }

    pub(crate) fn set_endpoint(&self, id: Arc<str>, sink: Weak<dyn ChangeSink>) -> Result<(), ModelError> {
        if self.is_closed() {
            return Err(ModelError::Closed);
        }
        self.inner
            .identity
            .write()
            .container
            .set("parent", Container::Endpoint { id, sink })?;
        self.inner.sealed.store(true, Ordering::Release);
        Ok(())
    }

    pub(crate) fn ensure_mutable(&self, operation: &'static str) -> Result<(), ModelError> {
        if self.is_closed() {
            return Err(ModelError::Closed);
        }
        if self.is_registered() {
            return Err(ModelError::StructuralLock(operation));
        }
        Ok(())
    }

    fn root(&self) -> ObjectNode {
        let mut current = self.clone();
        loop {
            let parent = match current.inner.identity.read().container.get() {
                Some(Container::Object(parent)) => parent.upgrade(),
                _ => None,
            };
            match parent {
                Some(inner) => current = ObjectNode::from_inner(inner),
                None => return current,
            }
        }
    }
}

impl std::fmt::Debug for ObjectNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let children = self.inner.children.read();
        f.debug_struct("ObjectNode")
            .field("name", &self.name())
            .field("conforms", &self.conformance())
            .field("attributes", &children.attributes.keys().collect::<Vec<_>>())
            .field("objects", &children.objects.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::node::Node;
    use crate::value::Value;
    use parking_lot::Mutex;

    struct NullSink;

    impl ChangeSink for NullSink {
        fn attribute_changed(&self, _: &Attribute, _: &ChangeOrigin) {}
    }

    pub(crate) fn null_sink() -> Weak<dyn ChangeSink> {
        // Dangling on purpose: registration only needs the link.
        let sink: Arc<dyn ChangeSink> = Arc::new(NullSink);
        Arc::downgrade(&sink)
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<(String, ChangeOrigin)>>);

    impl ChangeSink for Recorder {
        fn attribute_changed(&self, attribute: &Attribute, origin: &ChangeOrigin) {
            let address = attribute.address().map(|a| a.to_string()).unwrap_or_default();
            self.0.lock().push((address, origin.clone()));
        }
    }

    #[test]
    fn duplicate_names_rejected_per_child_set() {
        let object = ObjectNode::new();
        let first = object
            .add_attribute("x", Constraint::Measure, AttributeType::NUMBER)
            .unwrap();
        first.set_value(1.0).unwrap();
        let err = object
            .add_attribute("x", Constraint::Status, AttributeType::STRING)
            .unwrap_err();
        assert_eq!(
            err,
            ModelError::DuplicateName {
                kind: "attribute",
                name: "x".into()
            }
        );
        assert!(object.attribute("x").unwrap().ptr_eq(&first));
        assert_eq!(first.value(), Some(Value::Number(1.0)));

        // Object set is independent of the attribute set.
        object.add_object("x").unwrap();
        assert!(matches!(
            object.add_object("x"),
            Err(ModelError::DuplicateName { kind: "object", .. })
        ));
    }

    #[test]
    fn elements_cannot_move() {
        let a = ObjectNode::new();
        let b = ObjectNode::new();
        let attr = a
            .add_attribute("t", Constraint::Measure, AttributeType::NUMBER)
            .unwrap();
        assert_eq!(
            b.attach_attribute("t", &attr),
            Err(ModelError::Modification("name"))
        );
        let child = a.add_object("c").unwrap();
        assert_eq!(
            b.attach_object("c", &child),
            Err(ModelError::Modification("name"))
        );
        assert!(b.attributes().is_empty() && b.objects().is_empty());
    }

    #[test]
    fn cycles_and_nodes_rejected() {
        let root = ObjectNode::new();
        let child = root.add_object("child").unwrap();
        assert_eq!(
            child.attach_object("loop", &root),
            Err(ModelError::Modification("parent"))
        );
        let node = Node::new("n");
        assert_eq!(
            root.attach_object("n", &node),
            Err(ModelError::Modification("parent"))
        );
    }

    #[test]
    fn insertion_order_preserved() {
        let object = ObjectNode::new();
        for name in ["z", "a", "m"] {
            object
                .add_attribute(name, Constraint::Status, AttributeType::BOOLEAN)
                .unwrap();
        }
        let names: Vec<_> = object.attributes().iter().filter_map(Attribute::name).collect();
        assert_eq!(names, ["z", "a", "m"]);
    }

    #[test]
    fn structure_locked_after_registration() {
        let node = Node::new("n");
        let object = node.add_object("o").unwrap();
        node.register("dev".into(), null_sink()).unwrap();
        assert_eq!(
            object
                .add_attribute("late", Constraint::Measure, AttributeType::NUMBER)
                .unwrap_err(),
            ModelError::StructuralLock("add_attribute")
        );
        assert_eq!(
            node.remove_object("o").unwrap_err(),
            ModelError::StructuralLock("remove_object")
        );
        assert_eq!(
            object.declare_conformance("Sensor").unwrap_err(),
            ModelError::StructuralLock("declare_conformance")
        );
    }

    #[test]
    fn changes_reach_the_sink_with_origin() {
        let node = Node::new("n1");
        let object = node.add_object("o1").unwrap();
        let temp = object
            .add_attribute("temp", Constraint::Measure, AttributeType::NUMBER)
            .unwrap();
        let target = object
            .add_attribute("target", Constraint::SetPoint, AttributeType::NUMBER)
            .unwrap();
        let recorder = Arc::new(Recorder::default());
        let sink: Arc<dyn ChangeSink> = recorder.clone();
        node.register("dev1".into(), Arc::downgrade(&sink)).unwrap();

        temp.set_value(21.5).unwrap();
        target
            .set_value_from_cloud(18.0, 10, Some("c-1".into()))
            .unwrap();

        let seen = recorder.0.lock().clone();
        assert_eq!(
            seen,
            vec![
                (
                    "dev1/nodes/n1/objects/o1/attributes/temp".to_string(),
                    ChangeOrigin::Endpoint
                ),
                (
                    "dev1/nodes/n1/objects/o1/attributes/target".to_string(),
                    ChangeOrigin::Cloud {
                        correlation_id: Some("c-1".into())
                    }
                ),
            ]
        );
    }

    #[test]
    fn removing_closes_subtree() {
        let root = ObjectNode::new();
        let child = root.add_object("child").unwrap();
        let attr = child
            .add_attribute("a", Constraint::Measure, AttributeType::NUMBER)
            .unwrap();
        let removed = root.remove_object("child").unwrap();
        assert!(removed.ptr_eq(&child));
        assert!(child.is_closed() && attr.is_closed());
        assert_eq!(attr.set_value(1.0), Err(ModelError::Closed));
        assert!(matches!(
            root.remove_object("child"),
            Err(ModelError::PathNotFound(_))
        ));
    }
}
