use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use presence_kiosk::cancellation::StopFlag;
use presence_kiosk::detect::Sex;
use presence_kiosk::status::server::StatusServer;
use presence_kiosk::status::{PresenceUpdate, StatusPublisher};
use serde_json::Value;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};

type Client = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

async fn start() -> (Arc<StatusPublisher>, StopFlag, String) {
    let publisher = Arc::new(StatusPublisher::new());
    let server = StatusServer::bind("127.0.0.1:0".parse().unwrap(), publisher.clone())
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    let stop = StopFlag::new();
    tokio::spawn(server.serve(stop.clone()));
    (publisher, stop, format!("ws://{addr}"))
}

fn text(raw: &str) -> Message {
    Message::Text(raw.to_owned().into())
}

async fn next_json(client: &mut Client) -> Value {
    let msg = tokio::time::timeout(Duration::from_secs(5), client.next())
        .await
        .expect("timed out waiting for message")
        .expect("stream ended")
        .expect("websocket error");
    match msg {
        Message::Text(text) => serde_json::from_str(text.as_str()).unwrap(),
        other => panic!("unexpected frame: {other:?}"),
    }
}

#[tokio::test]
async fn new_client_gets_status_immediately() {
    let (_publisher, stop, url) = start().await;
    let (mut client, _) = connect_async(url.as_str()).await.unwrap();

    let status = next_json(&mut client).await;
    assert_eq!(status["type"], "status_update");
    assert_eq!(status["user_present"], false);
    assert_eq!(status["user_count"], 0);
    assert!(status["distance"].is_null());
    assert!(status["timestamp"].is_f64());
    stop.stop();
}

#[tokio::test]
async fn request_reply_protocol() {
    let (_publisher, stop, url) = start().await;
    let (mut client, _) = connect_async(url.as_str()).await.unwrap();
    next_json(&mut client).await;

    client.send(text(r#"{"type":"ping"}"#)).await.unwrap();
    assert_eq!(next_json(&mut client).await["type"], "pong");

    client.send(text(r#"{"type":"get_status"}"#)).await.unwrap();
    assert_eq!(next_json(&mut client).await["type"], "status_update");

    client.send(text(r#"{"type":"subscribe"}"#)).await.unwrap();
    assert_eq!(
        next_json(&mut client).await["error"],
        "Unknown message type: subscribe"
    );

    client.send(text("{oops")).await.unwrap();
    assert_eq!(next_json(&mut client).await["error"], "Invalid JSON format");
    stop.stop();
}

#[tokio::test]
async fn binary_frames_are_read_as_text() {
    let (_publisher, stop, url) = start().await;
    let (mut client, _) = connect_async(url.as_str()).await.unwrap();
    next_json(&mut client).await;

    let ping = br#"{"type":"ping"}"#.to_vec();
    client.send(Message::Binary(ping.into())).await.unwrap();
    assert_eq!(next_json(&mut client).await["type"], "pong");

    client.send(Message::Binary(vec![0xff, 0xfe].into())).await.unwrap();
    assert_eq!(next_json(&mut client).await["error"], "Invalid JSON format");
    stop.stop();
}

#[tokio::test]
async fn published_updates_reach_every_client() {
    let (publisher, stop, url) = start().await;
    let (mut a, _) = connect_async(url.as_str()).await.unwrap();
    let (mut b, _) = connect_async(url.as_str()).await.unwrap();
    next_json(&mut a).await;
    next_json(&mut b).await;

    publisher.publish(PresenceUpdate {
        user_present: true,
        user_count: 2,
        distance_m: Some(0.75),
        sex: Some(Sex::Male),
        age_years: Some(42),
    });

    for client in [&mut a, &mut b] {
        let update = next_json(client).await;
        assert_eq!(update["type"], "status_update");
        assert_eq!(update["user_present"], true);
        assert_eq!(update["user_count"], 2);
        assert_eq!(update["gender"], "M");
        assert_eq!(update["age"], 42);
        assert!(update["last_detection_time"].is_f64());
    }
    stop.stop();
}

#[tokio::test]
async fn dropped_client_does_not_affect_others() {
    let (publisher, stop, url) = start().await;
    let (gone, _) = connect_async(url.as_str()).await.unwrap();
    let (mut stays, _) = connect_async(url.as_str()).await.unwrap();
    next_json(&mut stays).await;
    drop(gone);

    publisher.publish(PresenceUpdate {
        user_present: false,
        user_count: 0,
        distance_m: None,
        sex: None,
        age_years: None,
    });
    assert_eq!(next_json(&mut stays).await["user_present"], false);
    stop.stop();
}
