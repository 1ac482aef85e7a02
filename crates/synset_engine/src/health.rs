//! Connection health tracking.

use crate::transport::ConnectionSignal;

/// Usability of the two transport connections.
///
/// Both sides start unusable. The publish side becomes usable on an
/// explicit `Ready` from the publish connection. The subscribe side only
/// becomes usable once a subscription to the set's channel is confirmed;
/// a bare `Ready` from the subscribe connection is not enough, since
/// messages cannot be trusted before the subscription is in place.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionHealth {
    publish_usable: bool,
    subscribe_usable: bool,
}

impl ConnectionHealth {
    /// Creates a tracker with both sides unusable.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if writes and broadcasts can be sent.
    pub fn publish_usable(&self) -> bool {
        self.publish_usable
    }

    /// Returns true if received broadcasts can be trusted.
    pub fn subscribe_usable(&self) -> bool {
        self.subscribe_usable
    }

    /// Records a signal from the publish connection.
    ///
    /// Returns true when the publish side went from unusable to usable.
    pub fn on_publisher(&mut self, signal: &ConnectionSignal) -> bool {
        let was_usable = self.publish_usable;
        self.publish_usable = !signal.is_degraded();
        !was_usable && self.publish_usable
    }

    /// Records a signal from the subscribe connection.
    pub fn on_subscriber(&mut self, signal: &ConnectionSignal) {
        if signal.is_degraded() {
            self.subscribe_usable = false;
        }
    }

    /// Records a confirmed subscription to the set's channel.
    pub fn on_subscribed(&mut self) {
        self.subscribe_usable = true;
    }
}
