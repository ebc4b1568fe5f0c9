//! Connection manager behaviour against a scripted broker
//!
//! Timing tests run on paused tokio time, so backoff and rotation windows
//! elapse instantly while keeping their exact virtual durations.


use edge_telemetry::manager::ConnectionError;
use edge_telemetry::testing::{MockTransport, OpenOutcome};
use edge_telemetry::transport::mqtt::ConnectionState;
use rumqttc::QoS;
use std::time::Duration;
use test_helpers::*;

fn gaps_secs(times: &[tokio::time::Instant]) -> Vec<u64> {
    times
        .windows(2)
        .map(|pair| (pair[1] - pair[0]).as_secs())
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_gives_up_after_exhausting_backoff() {
    let mut h = start(MockTransport::unreachable(), test_settings());
    let mut handle = h.manager.handle();

    let result = handle.await_ready().await;

    assert!(matches!(
        result,
        Err(ConnectionError::GaveUp {
            attempts: 6,
            ..
        })
    ));
    assert_eq!(handle.state(), ConnectionState::Terminated);

    // Initial attempt plus one per backoff wait of 1, 2, 4, 8, 16, 32 seconds
    assert_eq!(h.broker.opens().await, 7);
    assert_eq!(gaps_secs(&h.broker.open_times().await), vec![1, 2, 4, 8, 16, 32]);

    // Terminated is final: no further attempts
    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(h.broker.opens().await, 7);
    h.manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_backoff_resets_after_successful_connect() {
    let mut h = start(
        MockTransport::with_script([
            OpenOutcome::RefuseOpen("down".into()),
            OpenOutcome::RefuseOpen("down".into()),
        ]),
        test_settings(),
    );
    let mut handle = h.manager.handle();

    ready_in_epoch(&mut handle, 1).await;
    h.broker.drop_connection("network reset");
    ready_in_epoch(&mut handle, 2).await;

    // 1s and 2s before the first success, then back to 1s
    assert_eq!(gaps_secs(&h.broker.open_times().await), vec![1, 2, 1]);
    h.manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_rejected_credentials_trigger_backoff() {
    let mut h = start(
        MockTransport::with_script([OpenOutcome::RejectAuth]),
        test_settings(),
    );
    let mut handle = h.manager.handle();

    ready_in_epoch(&mut handle, 1).await;

    assert_eq!(h.broker.opens().await, 2);
    assert_eq!(gaps_secs(&h.broker.open_times().await), vec![1]);
    h.manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_missing_connack_times_out_into_backoff() {
    let mut settings = test_settings();
    settings.connack_timeout = Duration::from_secs(5);
    let mut h = start(
        MockTransport::with_script([OpenOutcome::Silent, OpenOutcome::Silent]),
        settings,
    );
    let mut handle = h.manager.handle();

    ready_in_epoch(&mut handle, 1).await;

    // 5s ConnAck wait plus 1s backoff, then 5s plus 2s
    assert_eq!(gaps_secs(&h.broker.open_times().await), vec![6, 7]);
    assert_eq!(h.broker.closes().await, 2);
    h.manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_missing_connack_gives_up_when_backoff_exhausted() {
    let mut settings = test_settings();
    settings.connack_timeout = Duration::from_secs(5);
    settings.max_backoff = Duration::from_secs(2);
    let mut h = start(MockTransport::with_script(vec![OpenOutcome::Silent; 4]), settings);
    let mut handle = h.manager.handle();

    let result = handle.await_ready().await;

    assert!(matches!(
        result,
        Err(ConnectionError::GaveUp { attempts: 2, .. })
    ));
    assert_eq!(h.broker.opens().await, 3);
    assert!(!h.broker.is_session_open().await);
    h.manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_exactly_one_rotation_per_window() {
    let mut h = start(MockTransport::new(), test_settings());
    let mut handle = h.manager.handle();
    ready_in_epoch(&mut handle, 1).await;

    // 20 minute tokens rotate 60s before expiry: once within 30 minutes
    tokio::time::sleep(Duration::from_secs(30 * 60)).await;

    let opens = h.broker.open_times().await;
    assert_eq!(opens.len(), 2);
    assert_eq!(gaps_secs(&opens), vec![19 * 60]);
    assert_eq!(h.broker.closes().await, 1);
    assert_eq!(handle.epoch(), 2);
    assert_eq!(handle.state(), ConnectionState::Connected);

    // The rotated session re-subscribes
    let epochs: Vec<u64> = h.broker.subscriptions().await.iter().map(|s| s.2).collect();
    assert_eq!(epochs, vec![1, 1, 2, 2]);
    h.manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_subscribes_to_config_and_commands() {
    let mut h = start(MockTransport::new(), test_settings());
    let mut handle = h.manager.handle();
    ready_in_epoch(&mut handle, 1).await;

    assert_eq!(
        h.broker.subscriptions().await,
        vec![
            (CONFIG_TOPIC.to_string(), QoS::AtLeastOnce, 1),
            ("/devices/pump-7/commands/#".to_string(), QoS::AtMostOnce, 1),
        ]
    );
    h.manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_config_delta_updates_state_and_reports_snapshot() {
    let mut h = start(MockTransport::new(), test_settings());
    let mut handle = h.manager.handle();
    ready_in_epoch(&mut handle, 1).await;

    h.broker
        .inject_message(CONFIG_TOPIC, r#"{"enabled": false, "rate": 5}"#, QoS::AtLeastOnce);

    let broker = h.broker.clone();
    eventually(|| {
        let broker = broker.clone();
        async move { broker.published_on(STATE_TOPIC).await.len() == 1 }
    })
    .await;

    assert!(!h.store.is_enabled());
    let reported = &h.broker.published_on(STATE_TOPIC).await[0];
    assert_eq!(reported.qos, QoS::AtLeastOnce);
    let snapshot: serde_json::Value = serde_json::from_slice(&reported.payload).unwrap();
    assert_eq!(snapshot, serde_json::json!({"enabled": false, "rate": 5}));
    h.manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_malformed_config_is_discarded() {
    let mut h = start(MockTransport::new(), test_settings());
    let mut handle = h.manager.handle();
    ready_in_epoch(&mut handle, 1).await;
    let before = h.store.snapshot_json();

    h.broker.inject_message(CONFIG_TOPIC, "not json {", QoS::AtLeastOnce);
    h.broker.inject_message(CONFIG_TOPIC, "[1, 2]", QoS::AtLeastOnce);
    h.broker.inject_message(CONFIG_TOPIC, r#"{"marker": 1}"#, QoS::AtLeastOnce);

    let broker = h.broker.clone();
    eventually(|| {
        let broker = broker.clone();
        async move { !broker.published_on(STATE_TOPIC).await.is_empty() }
    })
    .await;

    // Only the valid delta was applied and reported; the session survived
    assert_eq!(h.broker.published_on(STATE_TOPIC).await.len(), 1);
    assert_ne!(h.store.snapshot_json(), before);
    assert!(h.store.is_enabled());
    assert_eq!(h.store.get("marker"), Some(serde_json::json!(1)));
    assert_eq!(handle.state(), ConnectionState::Connected);
    assert_eq!(h.broker.opens().await, 1);
    h.manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_commands_reach_handler() {
    let mut h = start(MockTransport::new(), test_settings());
    let mut handle = h.manager.handle();
    ready_in_epoch(&mut handle, 1).await;

    h.broker
        .inject_message("/devices/pump-7/commands/valve", "open", QoS::AtMostOnce);
    h.broker
        .inject_message("/devices/pump-7/commands", "reboot", QoS::AtMostOnce);

    let commands = h.commands.clone();
    eventually(|| {
        let done = commands.received().len() == 2;
        async move { done }
    })
    .await;

    assert_eq!(
        h.commands.received(),
        vec![
            (Some("valve".to_string()), b"open".to_vec()),
            (None, b"reboot".to_vec()),
        ]
    );
    h.manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_closes_session_and_terminates() {
    let mut h = start(MockTransport::new(), test_settings());
    let mut handle = h.manager.handle();
    ready_in_epoch(&mut handle, 1).await;
    assert!(h.broker.is_session_open().await);

    h.manager.shutdown().await;

    assert!(!h.broker.is_session_open().await);
    assert_eq!(h.broker.closes().await, 1);
    assert_eq!(handle.state(), ConnectionState::Terminated);
    assert_eq!(handle.await_ready().await.err(), Some(ConnectionError::Shutdown));
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_interrupts_backoff() {
    let mut h = start(MockTransport::unreachable(), test_settings());
    let handle = h.manager.handle();

    let broker = h.broker.clone();
    eventually(|| {
        let broker = broker.clone();
        async move { broker.opens().await >= 3 }
    })
    .await;

    let started = tokio::time::Instant::now();
    h.manager.shutdown().await;

    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(handle.termination(), Some(ConnectionError::Shutdown));
    assert!(h.broker.opens().await < 7);
}
