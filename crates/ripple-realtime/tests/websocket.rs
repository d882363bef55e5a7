//! End to end over a real WebSocket server.

use futures::{SinkExt, StreamExt};
use ripple_core::RealtimeConfig;
use ripple_realtime::{ChangeFilter, ChangeKind, LifecycleEvent, RealtimeClient, RealtimeEvent};
use serde_json::{Value, json};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

#[tokio::test]
async fn test_table_changes_over_websocket() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (frames_tx, mut frames) = mpsc::unbounded_channel::<Value>();
    let request_uri = Arc::new(Mutex::new(String::new()));

    let uri = request_uri.clone();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let record_uri = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            *uri.lock().unwrap() = req.uri().to_string();
            Ok(resp)
        };
        let mut ws = tokio_tungstenite::accept_hdr_async(stream, record_uri)
            .await
            .unwrap();

        // The subscription is announced first.
        let subscribe = ws.next().await.unwrap().unwrap();
        let subscribe: Value = serde_json::from_str(subscribe.to_text().unwrap()).unwrap();
        frames_tx.send(subscribe).unwrap();

        let change = json!({
            "topic": "orders",
            "ref": null,
            "type": "event",
            "event": "INSERT",
            "payload": {"table": "orders", "record": {"id": 9, "status": "open"}}
        });
        ws.send(Message::Text(change.to_string().into())).await.unwrap();

        while let Some(Ok(message)) = ws.next().await {
            if let Message::Text(text) = message {
                frames_tx.send(serde_json::from_str(text.as_str()).unwrap()).unwrap();
            }
        }
    });

    let client = RealtimeClient::new(RealtimeConfig {
        url: format!("ws://{}/realtime", addr),
        api_key: Some("anon-key".to_string()),
        heartbeat_interval_ms: 0,
        ..Default::default()
    });
    let orders = client.channel("orders").unwrap();

    let (events_tx, mut events) = mpsc::unbounded_channel();
    orders
        .on_table_changes("orders", ChangeFilter::Insert, Some("status=eq.open"), move |event| {
            let _ = events_tx.send(event.clone());
        })
        .unwrap();
    let (lifecycle_tx, mut lifecycle) = mpsc::unbounded_channel();
    orders.on_lifecycle(move |event| {
        let _ = lifecycle_tx.send(event.clone());
    });

    orders.connect().await.unwrap();

    let subscribe = tokio::time::timeout(Duration::from_secs(5), frames.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(subscribe["type"], "subscribe");
    assert_eq!(subscribe["event"], "table_changes");
    assert_eq!(subscribe["payload"]["table"], "orders");
    assert_eq!(request_uri.lock().unwrap().as_str(), "/realtime/orders?apikey=anon-key");

    let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(
        event,
        RealtimeEvent::TableChange { change: ChangeKind::Insert, ref record, .. } if record["id"] == 9
    ));

    orders.broadcast("ack", json!({"id": 9})).await.unwrap();
    let broadcast = tokio::time::timeout(Duration::from_secs(5), frames.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(broadcast["type"], "broadcast");
    assert_eq!(broadcast["event"], "ack");

    client.disconnect_all().await;
    assert!(!orders.is_connected());
    assert_eq!(lifecycle.recv().await, Some(LifecycleEvent::Connected));
    assert_eq!(
        lifecycle.recv().await,
        Some(LifecycleEvent::Disconnected {
            reason: "client disconnect".to_string()
        })
    );
}
