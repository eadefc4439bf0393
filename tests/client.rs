//! End-to-end tests against the in-process mock PLC.

mod support;

use std::time::{Duration, Instant};

use s7wire_client::codec::read_write::{Area, ItemAddress, WriteItem};
use s7wire_client::{Client, ClientBuilder, ConnectionState, S7Error};
use tokio_util::sync::CancellationToken;

use support::{alarm, MockOptions, MockPlc};

async fn open(plc: &MockPlc, builder: ClientBuilder) -> Client {
    builder.open(&plc.endpoint()).await.unwrap()
}

fn db(number: u16, length: u16) -> ItemAddress {
    ItemAddress::bytes(Area::DataBlock, number, 0, length)
}

#[tokio::test]
async fn test_open_negotiates_pdu_and_capacity() {
    let plc = MockPlc::start(MockOptions {
        pdu_size: 480,
        capacity: 3,
        ..Default::default()
    })
    .await;
    let client = open(&plc, Client::builder().max_jobs(10)).await;

    assert_eq!(client.state(), ConnectionState::Opened);
    assert_eq!(client.pdu_size(), Some(480));
    assert_eq!(client.capacity(), 3);
    assert_eq!(plc.connections(), 1);

    // Opening an open client is a no-op.
    client.open().await.unwrap();
    assert_eq!(plc.connections(), 1);
}

#[tokio::test]
async fn test_read_and_write() {
    let plc = MockPlc::start(MockOptions::default()).await;
    let client = open(&plc, Client::builder()).await;

    let values = client.read(vec![db(7, 3), db(9, 1)]).await.unwrap();
    assert_eq!(values.len(), 2);
    assert_eq!(&values[0][..], &[7, 7, 7]);
    assert_eq!(&values[1][..], &[9]);

    client
        .write(vec![
            WriteItem::bytes(Area::DataBlock, 1, 4, vec![1, 2, 3, 4]),
            WriteItem::bit(Area::Flags, 0, 10, 3, true),
        ])
        .await
        .unwrap();
    assert_eq!(plc.jobs_received(), 2);
    assert_eq!(client.pending_requests(), 0);
}

#[tokio::test]
async fn test_out_of_order_responses() {
    let plc = MockPlc::start(MockOptions {
        reverse_pairs: true,
        ..Default::default()
    })
    .await;
    let client = open(&plc, Client::builder()).await;

    let (first, second) = tokio::join!(client.read(vec![db(5, 2)]), client.read(vec![db(6, 2)]));
    assert_eq!(&first.unwrap()[0][..], &[5, 5]);
    assert_eq!(&second.unwrap()[0][..], &[6, 6]);
}

#[tokio::test]
async fn test_requests_in_flight_bounded_by_capacity() {
    let plc = MockPlc::start(MockOptions {
        capacity: 2,
        delay: Duration::from_millis(30),
        ..Default::default()
    })
    .await;
    let client = open(&plc, Client::builder()).await;

    let reads = (1..=8u16).map(|n| {
        let client = client.clone();
        tokio::spawn(async move { client.read(vec![db(n, 1)]).await })
    });
    let handles: Vec<_> = reads.collect();
    for (n, handle) in (1..=8u8).zip(handles) {
        let values = handle.await.unwrap().unwrap();
        assert_eq!(&values[0][..], &[n]);
    }

    assert_eq!(plc.jobs_received(), 8);
    assert!(plc.max_outstanding() <= 2, "{}", plc.max_outstanding());
}

#[tokio::test]
async fn test_unanswered_request_times_out() {
    let plc = MockPlc::start(MockOptions::default()).await;
    let client = open(
        &plc,
        Client::builder().request_timeout(Duration::from_millis(150)),
    )
    .await;
    plc.set_silent(true);

    let started = Instant::now();
    let result = client.read(vec![db(1, 1)]).await;
    assert!(matches!(result, Err(S7Error::ReadTimeout { .. })));
    assert!(started.elapsed() >= Duration::from_millis(150));
    assert_eq!(client.pending_requests(), 0);

    // The connection survives a timeout.
    plc.set_silent(false);
    assert!(client.read(vec![db(2, 1)]).await.is_ok());
    assert_eq!(client.state(), ConnectionState::Opened);
}

#[tokio::test]
async fn test_cancelled_request() {
    let plc = MockPlc::start(MockOptions::default()).await;
    let client = open(&plc, Client::builder()).await;
    plc.set_silent(true);

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        trigger.cancel();
    });

    let request = s7wire_client::codec::read_write::ReadRequest::new(vec![db(1, 1)]);
    let result = client
        .request_cancellable(&request, Duration::from_secs(5), &cancel)
        .await;
    assert!(matches!(result, Err(S7Error::Cancelled)));
    assert_eq!(client.pending_requests(), 0);
}

#[tokio::test]
async fn test_pending_alarms_in_several_data_units() {
    let alarms: Vec<_> = (1..=10).map(alarm).collect();
    let plc = MockPlc::start(MockOptions {
        fragment_size: 30,
        alarms: alarms.clone(),
        ..Default::default()
    })
    .await;
    let client = open(&plc, Client::builder()).await;

    assert_eq!(client.read_pending_alarms().await.unwrap(), alarms);
    // A second listing starts over.
    assert_eq!(client.read_pending_alarms().await.unwrap(), alarms);
}

#[tokio::test]
async fn test_no_pending_alarms() {
    let plc = MockPlc::start(MockOptions::default()).await;
    let client = open(&plc, Client::builder()).await;

    assert!(client.read_pending_alarms().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_alarm_subscription_receives_indications() {
    let plc = MockPlc::start(MockOptions::default()).await;
    let client = open(&plc, Client::builder()).await;

    let mut first = client.subscribe_alarms().await.unwrap();
    let mut second = client.subscribe_alarms().await.unwrap();

    plc.push_alarms(vec![alarm(3), alarm(4)]);
    for subscription in [&mut first, &mut second] {
        let indication = subscription
            .recv_timeout(Duration::from_secs(2))
            .await
            .unwrap()
            .unwrap();
        let ids: Vec<u16> = indication.alarms().iter().map(|a| a.id).collect();
        assert_eq!(ids, vec![3, 4]);
    }

    drop(second);
    plc.push_alarms(vec![alarm(5)]);
    let indication = first.recv().await.unwrap();
    assert_eq!(indication.alarms()[0].id, 5);

    client.disable_alarm_updates().await.unwrap();
}

#[tokio::test]
async fn test_alarm_updates_enabled_once_per_session() {
    let plc = MockPlc::start(MockOptions::default()).await;
    let client = open(
        &plc,
        Client::builder().reconnect_interval(Duration::from_millis(20)),
    )
    .await;

    let _first = client.subscribe_alarms().await.unwrap();
    let _second = client.subscribe_alarms().await.unwrap();
    assert_eq!(plc.alarm_update_requests(), 1);

    client.disable_alarm_updates().await.unwrap();
    let _third = client.subscribe_alarms().await.unwrap();
    assert_eq!(plc.alarm_update_requests(), 3);

    // A new session starts with updates disabled on the PLC.
    plc.drop_connection();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(
        client
            .wait_for_state(ConnectionState::Opened, Duration::from_secs(2))
            .await
    );
    let _fourth = client.subscribe_alarms().await.unwrap();
    assert_eq!(plc.alarm_update_requests(), 4);
}

#[tokio::test]
async fn test_disconnect_fails_requests_and_subscriptions() {
    let plc = MockPlc::start(MockOptions {
        capacity: 2,
        ..Default::default()
    })
    .await;
    let client = open(&plc, Client::builder().auto_reconnect(false)).await;
    let mut subscription = client.subscribe_alarms().await.unwrap();
    plc.set_silent(true);

    let reads: Vec<_> = (1..=3u16)
        .map(|n| {
            let client = client.clone();
            tokio::spawn(async move { client.read(vec![db(n, 1)]).await })
        })
        .collect();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(client.pending_requests(), 2);

    plc.drop_connection();

    for read in reads {
        assert!(matches!(read.await.unwrap(), Err(S7Error::NotConnected)));
    }
    assert!(matches!(
        subscription.recv().await,
        Err(S7Error::NotConnected)
    ));
    assert!(
        client
            .wait_for_state(ConnectionState::Closed, Duration::from_secs(2))
            .await
    );
    assert!(matches!(
        client.read(vec![db(1, 1)]).await,
        Err(S7Error::NotConnected)
    ));
}

#[tokio::test]
async fn test_reconnect_after_connection_drop() {
    let plc = MockPlc::start(MockOptions::default()).await;
    let client = open(
        &plc,
        Client::builder()
            .auto_reconnect(true)
            .reconnect_interval(Duration::from_millis(20)),
    )
    .await;
    let mut states = client.state_changes();

    plc.drop_connection();
    tokio::time::timeout(
        Duration::from_secs(2),
        states.wait_for(|state| *state == ConnectionState::Connecting),
    )
    .await
    .unwrap()
    .unwrap();
    assert!(
        client
            .wait_for_state(ConnectionState::Opened, Duration::from_secs(2))
            .await
    );

    assert_eq!(plc.connections(), 2);
    let values = client.read(vec![db(4, 1)]).await.unwrap();
    assert_eq!(&values[0][..], &[4]);
}

#[tokio::test]
async fn test_reopen_not_disturbed_by_earlier_reconnect_loop() {
    let plc = MockPlc::start(MockOptions {
        setup_delay: Duration::from_millis(150),
        ..Default::default()
    })
    .await;
    let client = open(
        &plc,
        Client::builder()
            .auto_reconnect(true)
            .reconnect_interval(Duration::from_millis(50)),
    )
    .await;

    plc.drop_connection();
    assert!(
        client
            .wait_for_state(ConnectionState::Connecting, Duration::from_secs(2))
            .await
    );

    // The reconnect loop wakes while this open is still in its setup.
    client.close();
    client.open().await.unwrap();
    assert_eq!(client.state(), ConnectionState::Opened);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(client.state(), ConnectionState::Opened);
    assert_eq!(plc.connections(), 2);
    assert!(client.read(vec![db(3, 1)]).await.is_ok());
}

#[tokio::test]
async fn test_close_stops_the_client() {
    let plc = MockPlc::start(MockOptions::default()).await;
    let client = open(
        &plc,
        Client::builder().reconnect_interval(Duration::from_millis(10)),
    )
    .await;

    client.close();
    assert_eq!(client.state(), ConnectionState::Closed);
    assert!(matches!(
        client.read(vec![db(1, 1)]).await,
        Err(S7Error::NotConnected)
    ));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(plc.connections(), 1);
    assert_eq!(client.state(), ConnectionState::Closed);

    // Closing twice is harmless, and the client can be opened again.
    client.close();
    client.open().await.unwrap();
    assert_eq!(plc.connections(), 2);
}

#[tokio::test]
async fn test_open_unreachable_endpoint() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let endpoint = listener.local_addr().unwrap().to_string();
    drop(listener);

    let client = Client::builder()
        .connect_timeout(Duration::from_millis(500))
        .open(&endpoint)
        .await;
    assert!(matches!(client, Err(S7Error::NotConnected)));
}

#[tokio::test]
async fn test_read_larger_than_pdu_is_rejected() {
    let plc = MockPlc::start(MockOptions {
        pdu_size: 240,
        ..Default::default()
    })
    .await;
    let client = open(&plc, Client::builder()).await;

    let result = client.read(vec![db(1, 1000)]).await;
    assert!(matches!(result, Err(S7Error::Protocol(_))));
    assert_eq!(plc.jobs_received(), 0);
}
