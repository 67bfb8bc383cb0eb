//! Actor Messages
//!
//! Messages travel between actors as [`Envelope`]s: a type tag plus a shared
//! `Arc` payload. Publishing to many subscribers clones the `Arc`, never the
//! payload.

use crate::error::{ActorError, Result};
use std::any::{Any, TypeId};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Anything that can be sent between actors
pub trait Message: Any + Send + Sync + 'static {}

impl<T: Any + Send + Sync + 'static> Message for T {}

/// Runtime tag identifying a message type
#[derive(Clone, Copy)]
pub struct MessageType {
    id: TypeId,
    name: &'static str,
}

impl MessageType {
    /// Tag for message type `M`
    pub fn of<M: Message>() -> Self {
        Self {
            id: TypeId::of::<M>(),
            name: std::any::type_name::<M>(),
        }
    }

    /// Fully qualified type name
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Type name without its module path
    pub fn short_name(&self) -> &'static str {
        self.name.rsplit("::").next().unwrap_or(self.name)
    }
}

impl PartialEq for MessageType {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for MessageType {}

impl Hash for MessageType {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageType({})", self.short_name())
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.short_name())
    }
}

/// A message in flight
#[derive(Clone)]
pub struct Envelope {
    message_type: MessageType,
    payload: Arc<dyn Any + Send + Sync>,
}

impl Envelope {
    pub fn new<M: Message>(message: M) -> Self {
        Self {
            message_type: MessageType::of::<M>(),
            payload: Arc::new(message),
        }
    }

    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    pub fn is<M: Message>(&self) -> bool {
        self.message_type == MessageType::of::<M>()
    }

    pub fn downcast_ref<M: Message>(&self) -> Option<&M> {
        self.payload.downcast_ref::<M>()
    }

    /// Borrow the payload as `M`, or report which type was actually carried
    pub fn payload<M: Message>(&self) -> Result<&M> {
        self.downcast_ref::<M>().ok_or(ActorError::PayloadMismatch {
            expected: std::any::type_name::<M>(),
            actual: self.message_type.name(),
        })
    }
}

impl fmt::Debug for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Envelope")
            .field("message_type", &self.message_type)
            .finish()
    }
}
