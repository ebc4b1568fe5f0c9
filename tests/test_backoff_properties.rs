//! Property tests for reconnection backoff and the session state machine

use edge_telemetry::transport::mqtt::{
    BackoffPolicy, ConnectionEvent, ConnectionState, HealthMonitor, ReconnectionDecision,
};
use proptest::prelude::*;
use std::time::Duration;

fn any_event() -> impl Strategy<Value = ConnectionEvent> {
    prop_oneof![
        Just(ConnectionEvent::ConnectRequested),
        Just(ConnectionEvent::AuthenticatedAck),
        Just(ConnectionEvent::TransportError("reset".into())),
        Just(ConnectionEvent::BrokerDisconnect),
        Just(ConnectionEvent::DelayElapsed),
        Just(ConnectionEvent::BackoffExhausted),
        Just(ConnectionEvent::TokenStale),
        Just(ConnectionEvent::CredentialFailure("bad key".into())),
        Just(ConnectionEvent::ShutdownRequested),
    ]
}

/// Number of waits before giving up: doublings of min that stay <= max
fn expected_waits(min: u64, max: u64) -> usize {
    let mut current = min;
    let mut waits = 0;
    while current <= max {
        waits += 1;
        current *= 2;
    }
    waits
}

proptest! {
    #[test]
    fn delays_stay_within_bounds(
        min in 1u64..10,
        extra in 0u64..600,
        jitters in proptest::collection::vec(0u64..1000, 64),
    ) {
        let max = min + extra;
        let mut policy = BackoffPolicy::new(Duration::from_secs(min), Duration::from_secs(max));
        let mut waits = 0;

        for jitter in jitters {
            match HealthMonitor::decide_reconnection(&mut policy, Duration::from_millis(jitter), false) {
                ReconnectionDecision::Proceed { delay, .. } => {
                    prop_assert!(delay >= Duration::from_secs(min));
                    prop_assert!(delay <= Duration::from_secs(max));
                    waits += 1;
                }
                ReconnectionDecision::GiveUp { last_delay } => {
                    prop_assert!(last_delay > Duration::from_secs(max));
                    break;
                }
                ReconnectionDecision::AbortShutdownRequested => prop_assert!(false),
            }
        }

        prop_assert_eq!(waits, expected_waits(min, max));
    }

    #[test]
    fn reset_restores_minimum(min in 1u64..10, steps in 1usize..8) {
        let mut policy = BackoffPolicy::new(Duration::from_secs(min), Duration::from_secs(1024));
        for _ in 0..steps {
            policy.next_delay(Duration::ZERO);
        }
        policy.reset();
        prop_assert_eq!(policy.next_delay(Duration::ZERO), Some(Duration::from_secs(min)));
        prop_assert_eq!(policy.attempt(), 1);
    }

    #[test]
    fn terminated_is_absorbing(events in proptest::collection::vec(any_event(), 0..40)) {
        let mut state = ConnectionState::Disconnected;
        let mut terminated = false;

        for event in &events {
            if let Some(next) = HealthMonitor::determine_next_state(state, event) {
                prop_assert!(!terminated, "left Terminated via {:?}", event);
                state = next;
            }
            terminated |= state == ConnectionState::Terminated;
        }

        if events.contains(&ConnectionEvent::ShutdownRequested) {
            prop_assert_eq!(state, ConnectionState::Terminated);
        }
    }

    #[test]
    fn rotation_threshold_is_monotonic(threshold_secs in 1u64..3600, age_secs in 0u64..7200) {
        let threshold = Duration::from_secs(threshold_secs);
        let rotate = HealthMonitor::should_rotate(Duration::from_secs(age_secs), threshold);
        prop_assert_eq!(rotate, age_secs >= threshold_secs);
    }
}
