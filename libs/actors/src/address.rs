//! Direct Actor Addresses
//!
//! Every actor owns a single-consumer queue. Broadcast deliveries, replies,
//! group notifications and stop requests all land in this queue and are
//! processed one at a time by the actor's task. Stop requests are queued
//! behind deliveries that were enqueued earlier, so teardown never cancels
//! messages that were already dispatched.

use crate::group::DeregReason;
use crate::message::{Envelope, Message};
use crate::registry::ActorId;
use std::fmt;
use tokio::sync::mpsc;
use tracing::trace;

/// Item in an actor's queue
#[derive(Debug)]
pub(crate) enum Delivery {
    Message(Envelope),
    Stop(DeregReason),
}

/// Cloneable handle to an actor's queue
#[derive(Clone)]
pub struct Address {
    actor_id: ActorId,
    sender: mpsc::UnboundedSender<Delivery>,
}

impl Address {
    pub(crate) fn new(actor_id: ActorId) -> (Self, mpsc::UnboundedReceiver<Delivery>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { actor_id, sender }, receiver)
    }

    /// Actor this address belongs to
    pub fn id(&self) -> ActorId {
        self.actor_id
    }

    /// Send a message; returns `false` if the actor has already exited
    pub fn send<M: Message>(&self, message: M) -> bool {
        self.deliver(Envelope::new(message))
    }

    /// Enqueue an existing envelope
    pub fn deliver(&self, envelope: Envelope) -> bool {
        match self.sender.send(Delivery::Message(envelope)) {
            Ok(()) => true,
            Err(mpsc::error::SendError(delivery)) => {
                trace!(actor_id = %self.actor_id, ?delivery, "Dropping delivery to exited actor");
                false
            }
        }
    }

    pub(crate) fn request_stop(&self, reason: DeregReason) -> bool {
        self.sender.send(Delivery::Stop(reason)).is_ok()
    }

    /// Whether the actor's queue is still open
    pub fn is_alive(&self) -> bool {
        !self.sender.is_closed()
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Address")
            .field("actor_id", &self.actor_id)
            .field("alive", &self.is_alive())
            .finish()
    }
}

impl PartialEq for Address {
    fn eq(&self, other: &Self) -> bool {
        self.actor_id == other.actor_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_messages_precede_stop_request() {
        let (address, mut receiver) = Address::new(ActorId::new());

        assert!(address.send(1u32));
        assert!(address.request_stop(DeregReason::Normal));
        assert!(address.send(2u32));

        match receiver.recv().await.unwrap() {
            Delivery::Message(envelope) => assert_eq!(envelope.downcast_ref::<u32>(), Some(&1)),
            other => panic!("unexpected delivery: {:?}", other),
        }
        assert!(matches!(
            receiver.recv().await.unwrap(),
            Delivery::Stop(DeregReason::Normal)
        ));
    }

    #[tokio::test]
    async fn test_send_to_exited_actor() {
        let (address, receiver) = Address::new(ActorId::new());
        assert!(address.is_alive());

        drop(receiver);
        assert!(!address.is_alive());
        assert!(!address.send("late"));
    }
}
