//! Attributes: typed, timestamped value cells.
//!
//! Every successful mutation is reported upward to the owning object (and from
//! there to the endpoint once the node is registered), then handed to the
//! attribute's listeners. The constraint check and the timestamp comparison
//! happen under the same lock as the write.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use uuid::Uuid;

use crate::clock;
use crate::constraint::Constraint;
use crate::error::ModelError;
use crate::object::{ChangeOrigin, ObjectInner, ObjectNode};
use crate::once::SetOnce;
use crate::topic::TopicAddress;
use crate::value::{AttributeType, Value};

/// Callback invoked with the attribute and its new value after every change.
pub type AttributeListener = Arc<dyn Fn(&Attribute, &Value) + Send + Sync>;

/// Handle returned by [`Attribute::add_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// A value together with the time it was set (milliseconds since epoch).
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    /// Current value
    pub value: Value,
    /// Timestamp of the change
    pub timestamp: i64,
}

#[derive(Default)]
struct Identity {
    name: SetOnce<String>,
    parent: SetOnce<Weak<ObjectInner>>,
}

#[derive(Default)]
struct State {
    sample: Option<Sample>,
    closed: bool,
}

struct AttributeInner {
    id: Uuid,
    constraint: Constraint,
    kind: AttributeType,
    identity: RwLock<Identity>,
    state: Mutex<State>,
    listeners: Mutex<Vec<(ListenerId, AttributeListener)>>,
    next_listener: AtomicU64,
}

/// Shared handle to an attribute. Clones refer to the same cell.
#[derive(Clone)]
pub struct Attribute {
    inner: Arc<AttributeInner>,
}

impl Attribute {
    /// Create a detached attribute.
    ///
    /// Constraint and type are fixed for the lifetime of the attribute; name
    /// and parent are assigned once when it is attached to an object.
    #[must_use]
    pub fn new(constraint: Constraint, kind: AttributeType) -> Self {
        Self {
            inner: Arc::new(AttributeInner {
                id: Uuid::new_v4(),
                constraint,
                kind,
                identity: RwLock::new(Identity::default()),
                state: Mutex::new(State::default()),
                listeners: Mutex::new(Vec::new()),
                next_listener: AtomicU64::new(0),
            }),
        }
    }

    /// Identity of this cell, stable for its lifetime.
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// Name within the parent object, once attached.
    #[must_use]
    pub fn name(&self) -> Option<String> {
        self.inner.identity.read().name.get().cloned()
    }

    /// Write constraint.
    #[must_use]
    pub fn constraint(&self) -> Constraint {
        self.inner.constraint
    }

    /// Declared value type.
    #[must_use]
    pub fn attribute_type(&self) -> AttributeType {
        self.inner.kind
    }

    /// Current value and timestamp, both or neither.
    #[must_use]
    pub fn sample(&self) -> Option<Sample> {
        self.inner.state.lock().sample.clone()
    }

    /// Current value.
    #[must_use]
    pub fn value(&self) -> Option<Value> {
        self.sample().map(|s| s.value)
    }

    /// Timestamp of the current value.
    #[must_use]
    pub fn timestamp(&self) -> Option<i64> {
        self.inner.state.lock().sample.as_ref().map(|s| s.timestamp)
    }

    /// Owning object, if attached and still alive.
    #[must_use]
    pub fn parent(&self) -> Option<ObjectNode> {
        self.inner
            .identity
            .read()
            .parent
            .get()
            .and_then(Weak::upgrade)
            .map(ObjectNode::from_inner)
    }

    /// Whether the owning node has been registered with an endpoint.
    #[must_use]
    pub fn is_registered(&self) -> bool {
        self.parent().is_some_and(|p| p.is_registered())
    }

    /// Whether the attribute has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    /// Whether both handles refer to the same attribute.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Resolve the topic address of this attribute.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::PathNotFound`] if the attribute is not attached
    /// to a registered node.
    pub fn address(&self) -> Result<TopicAddress, ModelError> {
        let name = self
            .name()
            .ok_or_else(|| ModelError::PathNotFound("<unnamed attribute>".into()))?;
        let parent = self
            .parent()
            .ok_or_else(|| ModelError::PathNotFound(name.clone()))?;
        Ok(parent.address()?.attribute(&name))
    }

    /// Set the value from the endpoint side, stamped with the current time.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::ConstraintViolation`] unless the constraint is
    /// Status or Measure, [`ModelError::TypeMismatch`] for a value of the
    /// wrong type and [`ModelError::Closed`] after teardown.
    pub fn set_value(&self, value: impl Into<Value>) -> Result<(), ModelError> {
        self.set_value_at(value, clock::tick())
    }

    /// Set the value from the endpoint side with an explicit timestamp.
    ///
    /// # Errors
    ///
    /// See [`Attribute::set_value`].
    pub fn set_value_at(&self, value: impl Into<Value>, timestamp: i64) -> Result<(), ModelError> {
        self.inner.constraint.endpoint_will_change()?;
        let value = value.into().coerce(self.inner.kind)?;
        {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Err(ModelError::Closed);
            }
            state.sample = Some(Sample {
                value: value.clone(),
                timestamp,
            });
        }
        self.notify(&ChangeOrigin::Endpoint, &value);
        Ok(())
    }

    /// Seed the value once, before the owning node is registered.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::AlreadyInitialized`] if a value is present,
    /// [`ModelError::ConstraintViolation`] for Static and Parameter attributes
    /// and [`ModelError::StructuralLock`] once the node is registered.
    pub fn set_initial_value(&self, value: impl Into<Value>) -> Result<(), ModelError> {
        let registered = self.is_registered();
        let value = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Err(ModelError::Closed);
            }
            if state.sample.is_some() {
                return Err(ModelError::AlreadyInitialized);
            }
            self.inner.constraint.endpoint_will_initialize()?;
            if registered {
                return Err(ModelError::StructuralLock("set_initial_value"));
            }
            let value = value.into().coerce(self.inner.kind)?;
            state.sample = Some(Sample {
                value: value.clone(),
                timestamp: clock::tick(),
            });
            value
        };
        self.notify(&ChangeOrigin::Endpoint, &value);
        Ok(())
    }

    /// Assign the value of a Static attribute.
    ///
    /// May be repeated while the owning node is unregistered.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::ConstraintViolation`] unless the constraint is
    /// Static and [`ModelError::StructuralLock`] once the node is registered.
    pub fn set_static_value(&self, value: impl Into<Value>) -> Result<(), ModelError> {
        self.inner.constraint.endpoint_will_change_static()?;
        if self.is_registered() {
            return Err(ModelError::StructuralLock("set_static_value"));
        }
        let value = value.into().coerce(self.inner.kind)?;
        {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Err(ModelError::Closed);
            }
            state.sample = Some(Sample {
                value: value.clone(),
                timestamp: clock::tick(),
            });
        }
        self.notify(&ChangeOrigin::Endpoint, &value);
        Ok(())
    }

    /// Apply a value received from the cloud.
    ///
    /// Last writer wins by timestamp: returns `Ok(false)` and leaves the value
    /// untouched when `timestamp` is not strictly newer than the current one.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::ConstraintViolation`] unless the constraint is
    /// Parameter or SetPoint.
    pub fn set_value_from_cloud(
        &self,
        value: impl Into<Value>,
        timestamp: i64,
        correlation_id: Option<String>,
    ) -> Result<bool, ModelError> {
        self.inner.constraint.cloud_will_change()?;
        let value = value.into().coerce(self.inner.kind)?;
        {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Err(ModelError::Closed);
            }
            if state
                .sample
                .as_ref()
                .is_some_and(|current| timestamp <= current.timestamp)
            {
                return Ok(false);
            }
            state.sample = Some(Sample {
                value: value.clone(),
                timestamp,
            });
        }
        self.notify(&ChangeOrigin::Cloud { correlation_id }, &value);
        Ok(true)
    }

    /// Parse `input` according to the declared type and set it from the
    /// endpoint side.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::Parse`] before any state changes on malformed
    /// input, otherwise as [`Attribute::set_value`].
    pub fn set_string_value(&self, input: &str) -> Result<(), ModelError> {
        let value = Value::parse(input, self.inner.kind)?;
        self.set_value(value)
    }

    /// Register a listener invoked after every successful change.
    pub fn add_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&Attribute, &Value) + Send + Sync + 'static,
    {
        let id = ListenerId(self.inner.next_listener.fetch_add(1, Ordering::Relaxed));
        self.inner.listeners.lock().push((id, Arc::new(listener)));
        id
    }

    /// Remove a listener. Returns whether it was registered.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.inner.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    pub(crate) fn attach(&self, name: String, parent: Weak<ObjectInner>) -> Result<(), ModelError> {
        if self.is_closed() {
            return Err(ModelError::Closed);
        }
        let mut identity = self.inner.identity.write();
        if identity.name.is_assigned() {
            return Err(ModelError::Modification("name"));
        }
        if identity.parent.is_assigned() {
            return Err(ModelError::Modification("parent"));
        }
        identity.name.set("name", name)?;
        identity.parent.set("parent", parent)
    }

    /// Detach from the parent and reject further mutation.
    pub fn close(&self) {
        {
            let mut state = self.inner.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
        }
        self.inner.identity.write().parent.clear();
        self.inner.listeners.lock().clear();
    }

    fn notify(&self, origin: &ChangeOrigin, value: &Value) {
        if let Some(parent) = self.parent() {
            parent.attribute_changed(self, origin);
        }
        let listeners: Vec<AttributeListener> = self
            .inner
            .listeners
            .lock()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in listeners {
            listener(self, value);
        }
    }
}

impl std::fmt::Debug for Attribute {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Attribute")
            .field("id", &self.inner.id)
            .field("name", &self.name())
            .field("constraint", &self.inner.constraint)
            .field("type", &self.inner.kind)
            .field("sample", &self.sample())
            .finish()
    }
}
