//! Channel open, cancellation and close-cascade behavior.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use remlink::config::EndpointConfig;
use remlink::error::Error;
use remlink::transport::ChannelOptions;
use remlink::Closeable;

mod common;

#[tokio::test]
async fn unknown_service_fails_future_and_leaves_connection_usable() {
    let remote = common::remote().build();
    let endpoint = common::endpoint_for(&remote);
    let connection = endpoint.connect(&common::builder()).await.unwrap();

    let err = connection
        .open_channel("missing", ChannelOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ServiceNotFound { service } if service == "missing"));

    // The same connection still opens channels for known services.
    let channel = connection
        .open_channel("echo", ChannelOptions::default())
        .await
        .unwrap();
    assert_eq!(channel.service(), "echo");
    assert!(!connection.is_closed());

    connection.close().await;
}

#[tokio::test]
async fn channel_limit_is_checked_without_waiting() {
    let remote = common::remote().build();
    let mut config = EndpointConfig::default();
    config.channels.max_per_connection = 1;
    let endpoint = common::endpoint_with_config(&remote, config);
    let connection = endpoint.connect(&common::builder()).await.unwrap();

    let held = connection
        .open_channel("echo", ChannelOptions::default())
        .await
        .unwrap();

    let err = connection
        .open_channel("echo", ChannelOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ChannelLimitExceeded { limit: 1 }));

    // Closing the held channel frees its multiplexer slot.
    held.close().await;
    connection
        .open_channel("echo", ChannelOptions::default())
        .await
        .unwrap();

    connection.close().await;
}

#[tokio::test]
async fn cancel_before_peer_response_retains_nothing() {
    let remote = common::remote().build();
    let endpoint = common::endpoint_for(&remote);
    let connection = endpoint.connect(&common::builder()).await.unwrap();

    remote.hold_opens();
    let pending = connection.open_channel("echo", ChannelOptions::default());
    pending.cancel();

    let err = pending.await.unwrap_err();
    assert!(matches!(err, Error::Cancelled));

    remote.release_opens();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(remote.active_channels(), 0);
    assert_eq!(connection.open_channel_count(), 0);

    connection.close().await;
}

#[tokio::test]
async fn cancel_after_acceptance_still_delivers_the_channel() {
    let remote = common::remote().build();
    let endpoint = common::endpoint_for(&remote);
    let connection = endpoint.connect(&common::builder()).await.unwrap();

    let pending = connection.open_channel("echo", ChannelOptions::default());
    // Let the open complete on the peer before cancelling.
    tokio::time::sleep(Duration::from_millis(20)).await;
    pending.cancel();

    let channel = pending.await.unwrap();
    assert_eq!(remote.active_channels(), 1);

    channel.close().await;
    assert_eq!(remote.active_channels(), 0);
    connection.close().await;
}

#[tokio::test]
async fn dropping_an_accepted_future_does_not_leak_the_channel() {
    let remote = common::remote().build();
    let endpoint = common::endpoint_for(&remote);
    let connection = endpoint.connect(&common::builder()).await.unwrap();

    let pending = connection.open_channel("echo", ChannelOptions::default());
    tokio::time::sleep(Duration::from_millis(20)).await;
    drop(pending);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(remote.active_channels(), 0);
    assert_eq!(connection.open_channel_count(), 0);

    connection.close().await;
}

#[tokio::test]
async fn close_cascades_to_channels_and_pending_opens() {
    let remote = common::remote().build();
    let endpoint = common::endpoint_for(&remote);
    let connection = endpoint.connect(&common::builder()).await.unwrap();

    let channel = connection
        .open_channel("echo", ChannelOptions::default())
        .await
        .unwrap();

    remote.hold_opens();
    let pending = connection.open_channel("echo", ChannelOptions::default());

    let listener_fired = Arc::new(AtomicU32::new(0));
    let fired = Arc::clone(&listener_fired);
    connection.on_close(Box::new(move || {
        fired.fetch_add(1, Ordering::SeqCst);
    }));

    connection.close().await;
    // The completion signal is already observable.
    connection.closed().await;

    assert!(connection.is_closed());
    assert!(channel.is_closed());
    assert_eq!(listener_fired.load(Ordering::SeqCst), 1);
    assert!(matches!(pending.await.unwrap_err(), Error::ConnectionClosed));
    assert_eq!(remote.active_channels(), 0);
    assert_eq!(endpoint.connection_count(), 0);

    // Closing again is a no-op, and late listeners fire immediately.
    connection.close().await;
    let late = Arc::new(AtomicU32::new(0));
    let fired = Arc::clone(&late);
    connection.on_close(Box::new(move || {
        fired.fetch_add(1, Ordering::SeqCst);
    }));
    assert_eq!(late.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn duplicated_handles_keep_the_session_open() {
    let remote = common::remote().build();
    let endpoint = common::endpoint_for(&remote);
    let connection = endpoint.connect(&common::builder()).await.unwrap();
    let duplicate = connection.duplicate();

    connection.close().await;
    // The session survives: the duplicate still opens channels.
    assert!(!duplicate.is_closed());
    duplicate
        .open_channel("echo", ChannelOptions::default())
        .await
        .unwrap();
    // The closed handle's operations fail even though the session lives.
    assert!(matches!(
        connection
            .open_channel("echo", ChannelOptions::default())
            .await
            .unwrap_err(),
        Error::ConnectionClosed
    ));

    duplicate.close().await;
    assert!(duplicate.is_closed());
    assert_eq!(endpoint.connection_count(), 0);
}

#[tokio::test]
async fn opens_complete_independently() {
    let remote = common::remote().service("slow").build();
    let endpoint = common::endpoint_for(&remote);
    let connection = endpoint.connect(&common::builder()).await.unwrap();

    // Hold the gate, queue two opens, then release: both resolve, in
    // whatever order the scheduler picks.
    remote.hold_opens();
    let first = connection.open_channel("echo", ChannelOptions::default());
    let second = connection.open_channel("slow", ChannelOptions::default());
    remote.release_opens();

    let (a, b) = tokio::join!(first, second);
    assert_eq!(a.unwrap().service(), "echo");
    assert_eq!(b.unwrap().service(), "slow");

    connection.close().await;
}

#[tokio::test]
async fn endpoint_close_cascades_to_connections() {
    let remote = common::remote().build();
    let endpoint = common::endpoint_for(&remote);
    let connection = endpoint.connect(&common::builder()).await.unwrap();
    let channel = connection
        .open_channel("echo", ChannelOptions::default())
        .await
        .unwrap();

    endpoint.close().await;

    assert!(endpoint.is_closed());
    assert!(channel.is_closed());
    assert!(matches!(
        connection
            .open_channel("echo", ChannelOptions::default())
            .await
            .unwrap_err(),
        Error::ConnectionClosed
    ));
    assert!(matches!(
        endpoint.connect(&common::builder()).await.unwrap_err(),
        Error::ConnectionClosed
    ));
}
