//! Endpoint Lifecycle Events
//!
//! Liveness and state transitions flow from the Gossiper to interested
//! components through this bus. Delivery is single-threaded and in
//! subscriber-registration order. The Gossiper buffers events while it
//! holds its state locks and publishes after releasing them, so
//! subscribers may read gossip accessors but must not mutate gossip
//! state re-entrantly from a notification.

use std::sync::{Arc, RwLock};

use crate::endpoint::Endpoint;
use crate::state::{ApplicationKey, EndpointState, VersionedValue};

/// Receives endpoint lifecycle notifications. Every method has an empty
/// default, so a subscriber implements only what it cares about.
pub trait EndpointStateSubscriber: Send + Sync {
    /// A new endpoint joined the cluster view
    fn on_join(&self, _endpoint: &Endpoint, _state: &EndpointState) {}

    /// A local application state is about to change (local updates only)
    fn before_change(
        &self,
        _endpoint: &Endpoint,
        _state: &EndpointState,
        _key: ApplicationKey,
        _new_value: &VersionedValue,
    ) {
    }

    /// An application state changed
    fn on_change(&self, _endpoint: &Endpoint, _key: ApplicationKey, _value: &VersionedValue) {}

    /// An endpoint answered an echo and is confirmed alive
    fn on_alive(&self, _endpoint: &Endpoint, _state: &EndpointState) {}

    /// An endpoint was convicted by the failure detector
    fn on_dead(&self, _endpoint: &Endpoint, _state: &EndpointState) {}

    /// An endpoint was removed from gossip
    fn on_remove(&self, _endpoint: &Endpoint) {}

    /// An endpoint restarted with a newer generation
    fn on_restart(&self, _endpoint: &Endpoint, _state: &EndpointState) {}
}

/// A buffered notification, dispatched after the Gossiper drops its locks
#[derive(Debug, Clone)]
pub enum EndpointEvent {
    Join(Endpoint, EndpointState),
    BeforeChange(Endpoint, EndpointState, ApplicationKey, VersionedValue),
    Change(Endpoint, ApplicationKey, VersionedValue),
    Alive(Endpoint, EndpointState),
    Dead(Endpoint, EndpointState),
    Remove(Endpoint),
    Restart(Endpoint, EndpointState),
}

/// Owns the subscriber list and fans events out in registration order
#[derive(Default)]
pub struct EventBus {
    subscribers: RwLock<Vec<Arc<dyn EndpointStateSubscriber>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, subscriber: Arc<dyn EndpointStateSubscriber>) {
        self.subscribers.write().unwrap().push(subscriber);
    }

    pub fn publish(&self, event: &EndpointEvent) {
        let subscribers = self.subscribers.read().unwrap().clone();
        for subscriber in &subscribers {
            match event {
                EndpointEvent::Join(ep, state) => subscriber.on_join(ep, state),
                EndpointEvent::BeforeChange(ep, state, key, value) => {
                    subscriber.before_change(ep, state, *key, value)
                }
                EndpointEvent::Change(ep, key, value) => subscriber.on_change(ep, *key, value),
                EndpointEvent::Alive(ep, state) => subscriber.on_alive(ep, state),
                EndpointEvent::Dead(ep, state) => subscriber.on_dead(ep, state),
                EndpointEvent::Remove(ep) => subscriber.on_remove(ep),
                EndpointEvent::Restart(ep, state) => subscriber.on_restart(ep, state),
            }
        }
    }

    pub fn publish_all(&self, events: Vec<EndpointEvent>) {
        for event in &events {
            self.publish(event);
        }
    }
}
