//! Pure state-machine and reconnection logic for the device session
//!
//! Transport callbacks never touch the connection state directly: the
//! supervisor turns them into [`ConnectionEvent`]s and applies
//! [`HealthMonitor::determine_next_state`].

use super::connection::{BackoffPolicy, ConnectionState};
use std::time::Duration;
use tracing::{error, info, warn};

/// Events that drive connection state transitions
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// Caller asked for a connection
    ConnectRequested,
    /// ConnAck received from broker
    AuthenticatedAck,
    /// Network, protocol or authentication error
    TransportError(String),
    /// Broker initiated disconnect
    BrokerDisconnect,
    /// Backoff delay has elapsed
    DelayElapsed,
    /// Backoff exceeded its maximum
    BackoffExhausted,
    /// Current token reached its rotation threshold
    TokenStale,
    /// Token could not be issued
    CredentialFailure(String),
    /// External stop signal
    ShutdownRequested,
}

/// Decision result for a reconnection attempt
#[derive(Debug, Clone, PartialEq)]
pub enum ReconnectionDecision {
    /// Wait `delay` then reconnect
    Proceed { attempt: u32, delay: Duration },
    /// Stop retrying - backoff exhausted
    GiveUp { last_delay: Duration },
    /// Stop retrying - shutdown requested
    AbortShutdownRequested,
}

/// Pure state-machine and decision logic
pub struct HealthMonitor;

impl HealthMonitor {
    /// Determine the next state for an event (pure function).
    ///
    /// Returns `None` when the event is not valid in `current`; the caller
    /// keeps its state.
    pub fn determine_next_state(
        current: ConnectionState,
        event: &ConnectionEvent,
    ) -> Option<ConnectionState> {
        use ConnectionEvent as E;
        use ConnectionState as S;

        match (current, event) {
            (S::Terminated, _) => None,
            (_, E::ShutdownRequested) => Some(S::Terminated),
            (S::Disconnected, E::ConnectRequested) => Some(S::Connecting),
            (S::Connecting, E::AuthenticatedAck) => Some(S::Connected),
            (S::Connecting | S::Connected, E::TransportError(_) | E::BrokerDisconnect) => {
                Some(S::AwaitingBackoff)
            }
            (S::Connecting, E::CredentialFailure(_)) => Some(S::Terminated),
            (S::AwaitingBackoff, E::DelayElapsed) => Some(S::Connecting),
            (S::AwaitingBackoff, E::BackoffExhausted) => Some(S::Terminated),
            (S::Connected, E::TokenStale) => Some(S::Connecting),
            _ => None,
        }
    }

    /// Decide whether to wait and reconnect or give up (mutates the policy)
    pub fn decide_reconnection(
        policy: &mut BackoffPolicy,
        jitter: Duration,
        shutdown_requested: bool,
    ) -> ReconnectionDecision {
        if shutdown_requested {
            return ReconnectionDecision::AbortShutdownRequested;
        }

        match policy.next_delay(jitter) {
            Some(delay) => ReconnectionDecision::Proceed {
                attempt: policy.attempt(),
                delay,
            },
            None => ReconnectionDecision::GiveUp {
                last_delay: policy.current(),
            },
        }
    }

    /// Credential rotation predicate (pure function)
    pub fn should_rotate(token_age: Duration, rotation_threshold: Duration) -> bool {
        token_age >= rotation_threshold
    }

    /// Log connection state transition
    pub fn log_state_transition(from: ConnectionState, to: ConnectionState, event: &ConnectionEvent) {
        match (from, to) {
            (ConnectionState::Connecting, ConnectionState::Connected) => {
                info!("MQTT connection established");
            }
            (ConnectionState::Connected, ConnectionState::AwaitingBackoff) => {
                warn!("MQTT connection lost: {:?}", event);
            }
            (ConnectionState::Connecting, ConnectionState::AwaitingBackoff) => {
                warn!("MQTT connection attempt failed: {:?}", event);
            }
            (ConnectionState::Connected, ConnectionState::Connecting) => {
                info!("Rotating credentials with a controlled reconnect");
            }
            (_, ConnectionState::Terminated) => {
                if matches!(event, ConnectionEvent::ShutdownRequested) {
                    info!("MQTT session terminated by shutdown");
                } else {
                    error!("MQTT session terminated: {:?}", event);
                }
            }
            _ => {
                info!("MQTT connection state: {} -> {}", from, to);
            }
        }
    }
}
