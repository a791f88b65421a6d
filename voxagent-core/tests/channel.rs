mod common;

use std::time::Duration;

use futures::StreamExt;
use serde_json::json;

use common::{dead_url, MockBackend, TIMEOUT};
use voxagent_core::{
    protocol::{Envelope, MessageEnvelope, Role},
    Channel, ChannelState, VoxError,
};

fn assistant(n: usize) -> Envelope {
    Envelope::Message(MessageEnvelope {
        id: format!("m{n}"),
        role: Role::Assistant,
        content: format!("chunk {n}"),
    })
}

async fn recv(channel: &Channel) -> Option<Envelope> {
    tokio::time::timeout(TIMEOUT, channel.recv())
        .await
        .expect("recv in time")
        .expect("channel healthy")
}

#[tokio::test]
async fn inbound_frames_arrive_in_order_then_end_on_close() {
    let backend = MockBackend::start().await;
    let channel = Channel::open(backend.url());
    let conn = backend.accept().await;
    channel.ready().await.unwrap();

    for n in 0..50 {
        conn.send_envelope(&assistant(n));
    }
    conn.close();

    for n in 0..50 {
        let envelope = recv(&channel).await.expect("envelope before end");
        assert_eq!(envelope.id(), format!("m{n}"));
    }
    assert!(recv(&channel).await.is_none());
    assert_eq!(channel.state(), ChannelState::Closed);
}

#[tokio::test]
async fn sends_before_connect_are_written_in_call_order() {
    let backend = MockBackend::start().await;
    let channel = Channel::open(backend.url());

    let settings = Envelope::settings("user-1", serde_json::Map::new());
    let interrupt = Envelope::interrupt();
    let message = Envelope::user_message("hello");
    let expected = [
        settings.id().to_string(),
        interrupt.id().to_string(),
        message.id().to_string(),
    ];

    let sender = channel.clone();
    let sends = tokio::spawn(async move {
        let (a, b, c) = futures::join!(
            sender.send(&settings),
            sender.send(&interrupt),
            sender.send(&message)
        );
        a.and(b).and(c)
    });

    // The handshake cannot finish until the backend accepts.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(channel.state(), ChannelState::Connecting);

    let mut conn = backend.accept().await;
    sends.await.unwrap().expect("all sends written");

    for id in expected {
        assert_eq!(conn.recv_envelope().await.id(), id);
    }
}

#[tokio::test]
async fn clean_close_resolves_pending_pull_as_done() {
    let backend = MockBackend::start().await;
    let channel = Channel::open(backend.url());
    let conn = backend.accept().await;
    channel.ready().await.unwrap();

    let puller = channel.clone();
    let pending = tokio::spawn(async move { puller.recv().await });
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(channel.queue_depths(), (0, 1));

    conn.close();
    let outcome = tokio::time::timeout(TIMEOUT, pending).await.unwrap().unwrap();
    assert!(matches!(outcome, Ok(None)));
}

#[tokio::test]
async fn abrupt_disconnect_fails_pending_pull() {
    let backend = MockBackend::start().await;
    let channel = Channel::open(backend.url());
    let conn = backend.accept().await;
    channel.ready().await.unwrap();

    let puller = channel.clone();
    let pending = tokio::spawn(async move { puller.recv().await });
    tokio::time::sleep(Duration::from_millis(20)).await;

    conn.drop_connection();
    let outcome = tokio::time::timeout(TIMEOUT, pending).await.unwrap().unwrap();
    assert!(matches!(outcome, Err(VoxError::Channel(_))));
    assert!(matches!(channel.state(), ChannelState::Failed(_)));

    // Later sends report the transport failure.
    let err = channel.send(&Envelope::interrupt()).await.unwrap_err();
    assert!(err.is_channel_failure());
}

#[tokio::test]
async fn close_is_idempotent_and_rejects_later_sends() {
    let backend = MockBackend::start().await;
    let channel = Channel::open(backend.url());
    let mut conn = backend.accept().await;
    channel.ready().await.unwrap();

    channel.send(&Envelope::user_message("last words")).await.unwrap();
    channel.close().await;
    channel.close().await;

    assert_eq!(channel.state(), ChannelState::Closed);
    assert!(matches!(
        channel.send(&Envelope::interrupt()).await,
        Err(VoxError::ChannelNotOpen)
    ));
    assert!(channel.recv().await.unwrap().is_none());

    let frames = conn.closed().await;
    assert_eq!(frames.len(), 1);
    assert!(conn.client_sent_close());
}

#[tokio::test]
async fn undecodable_and_binary_frames_are_skipped() {
    let backend = MockBackend::start().await;
    let channel = Channel::open(backend.url());
    let conn = backend.accept().await;
    channel.ready().await.unwrap();

    conn.send_text("not json at all");
    conn.send_json(json!({"type": "bogus", "id": "x"}));
    conn.send_json(json!({"type": "message", "id": "ok", "role": "assistant", "content": "hi"}));

    let envelope = recv(&channel).await.unwrap();
    assert_eq!(envelope.id(), "ok");
    assert_eq!(channel.undecodable_frames(), 2);
}

#[tokio::test]
async fn incoming_stream_ends_after_clean_close() {
    let backend = MockBackend::start().await;
    let channel = Channel::open(backend.url());
    let conn = backend.accept().await;

    for n in 0..3 {
        conn.send_envelope(&assistant(n));
    }
    conn.close();

    let ids: Vec<String> = tokio::time::timeout(
        TIMEOUT,
        channel
            .incoming()
            .map(|item| item.expect("no transport error").id().to_string())
            .collect(),
    )
    .await
    .unwrap();
    assert_eq!(ids, ["m0", "m1", "m2"]);
}

#[tokio::test]
async fn connect_failure_is_reported_to_ready_and_send() {
    let channel = Channel::open(dead_url().await);

    let err = tokio::time::timeout(TIMEOUT, channel.ready())
        .await
        .unwrap()
        .unwrap_err();
    assert!(err.is_channel_failure());
    assert!(channel.send(&Envelope::interrupt()).await.is_err());
    assert!(channel.recv().await.is_err());
}

#[tokio::test]
async fn close_while_connecting_ends_without_connecting() {
    let backend = MockBackend::start().await;
    let channel = Channel::open(backend.url());

    tokio::time::timeout(TIMEOUT, channel.close()).await.unwrap();
    assert_eq!(channel.state(), ChannelState::Closed);
    assert!(matches!(channel.ready().await, Err(VoxError::ChannelNotOpen)));
}
