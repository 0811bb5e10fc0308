//! Pub/sub scenarios over loopback TCP.

use std::sync::Arc;
use std::time::Duration;

use tether_core::Endpoint;
use tether_dds::{DdsClient, DdsServer};
use tokio::sync::mpsc;

async fn start_server() -> (Arc<DdsServer>, String) {
    let server = Arc::new(DdsServer::bind_tcp("127.0.0.1:0").await.unwrap());
    let addr = server.local_addr().unwrap().to_string();
    let serve = server.clone();
    tokio::spawn(async move {
        let _ = serve.serve().await;
    });
    (server, addr)
}

async fn wait_until(mut cond: impl FnMut() -> bool, what: &str) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !cond() {
        assert!(tokio::time::Instant::now() < deadline, "timed out: {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn fan_out_excludes_publisher() {
    let (server, addr) = start_server().await;

    let a = DdsClient::new(Endpoint::tcp(addr.clone()));
    let b = DdsClient::new(Endpoint::tcp(addr.clone()));
    let c = DdsClient::new(Endpoint::tcp(addr));

    let (a_tx, mut a_rx) = mpsc::unbounded_channel::<String>();
    let (b_tx, mut b_rx) = mpsc::unbounded_channel::<String>();
    let (c_tx, mut c_rx) = mpsc::unbounded_channel::<String>();
    a.subscribe("t", move |data| {
        let _ = a_tx.send(data.to_string());
    });
    b.subscribe("t", move |data| {
        let _ = b_tx.send(data.to_string());
    });
    c.subscribe("t", move |data| {
        let _ = c_tx.send(data.to_string());
    });

    a.open();
    b.open();
    c.open();
    wait_until(|| server.subscriber_count("t") == 3, "all subscribers declared").await;

    a.publish("t", "x");

    // B and C each receive the sample from the server exactly once.
    for rx in [&mut b_rx, &mut c_rx] {
        let got = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("subscriber missed publish")
            .unwrap();
        assert_eq!(got, "x");
    }

    // A saw it exactly once, via local dispatch; no server echo follows.
    assert_eq!(a_rx.recv().await.unwrap(), "x");
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(a_rx.try_recv().is_err(), "publisher received its own publish from the server");
    assert!(b_rx.try_recv().is_err(), "subscriber received a duplicate");
    assert!(c_rx.try_recv().is_err(), "subscriber received a duplicate");

    a.close();
    b.close();
    c.close();
}

#[tokio::test]
async fn unsubscribe_by_id_resyncs_only_when_topic_empties() {
    let (server, addr) = start_server().await;

    let client = DdsClient::new(Endpoint::tcp(addr));
    let h1 = client.subscribe("t", |_| {});
    let h2 = client.subscribe("t", |_| {});
    client.open();
    wait_until(|| server.subscriber_count("t") == 1, "topic declared").await;

    // Removing one of two handlers keeps the topic and the server's view.
    assert!(client.unsubscribe(h1));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(client.topic_names(), ["t"]);
    assert_eq!(server.subscriber_count("t"), 1);

    // Removing the last handler drops the topic and reaches the server.
    assert!(client.unsubscribe(h2));
    wait_until(|| server.subscriber_count("t") == 0, "topic withdrawn").await;
    assert!(client.topic_names().is_empty());

    client.close();
}

#[tokio::test]
async fn session_close_reaps_server_topics() {
    let (server, addr) = start_server().await;

    let client = DdsClient::new(Endpoint::tcp(addr));
    client.subscribe("t", |_| {});
    client.open();
    wait_until(|| server.subscriber_count("t") == 1, "topic declared").await;

    client.close();
    wait_until(|| server.topic_names().is_empty(), "topics reaped after close").await;
}

#[tokio::test]
async fn reconnect_redeclares_topics() {
    let (server, addr) = start_server().await;

    let client = DdsClient::new(Endpoint::tcp(addr));
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    client.subscribe("t", move |data| {
        let _ = tx.send(data.to_string());
    });
    client.open();
    wait_until(|| server.subscriber_count("t") == 1, "topic declared").await;

    // Publish from a second client so the first receives via the server.
    let publisher = DdsClient::new(Endpoint::tcp(server.local_addr().unwrap().to_string()));
    publisher.open();
    wait_until(|| publisher.is_open(), "publisher connected").await;
    publisher.publish("t", "before");
    let got = tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("publish before reconnect lost")
        .unwrap();
    assert_eq!(got, "before");

    // Sever every session server-side by bouncing the subscriber's link:
    // closing only the subscriber's channel forces it through reconnect.
    let before_names = server.topic_names();
    assert_eq!(before_names, ["t"]);

    // The subscriber client reconnects on its own after its session drops.
    // Simulate a drop by closing and reopening the client.
    client.close();
    wait_until(|| server.subscriber_count("t") == 0, "subscriber reaped").await;
    // Give the old connect driver a moment to wind down before reopening.
    tokio::time::sleep(Duration::from_millis(100)).await;
    client.open();
    wait_until(|| server.subscriber_count("t") == 1, "topics re-declared after reconnect").await;

    publisher.publish("t", "after");
    let got = tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("publish after reconnect lost")
        .unwrap();
    assert_eq!(got, "after");

    client.close();
    publisher.close();
}
