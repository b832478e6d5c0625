//! WebSocket listener: one task per connection.
//!
//! A `register` frame registers the peer, attaches its delivery channel and
//! is answered with a `register-ack` event. Any other frame is validated and
//! routed; frames addressed to the bus itself (heartbeats) stop here. Every
//! inbound frame counts as liveness for the registered peer.

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};

use super::{Bus, BUS_ID};
use crate::contract::taxonomy::events;
use crate::contract::{
    build_envelope, build_success_response, error_response_for, validate_frame, Envelope, EnvelopeOptions,
    MessageKind, Payload, Registration,
};
use crate::error::{CoreError, CoreResult};
use crate::logging::{log, obj, v_str, Domain, Level};

const WRITER_DRAIN: Duration = Duration::from_secs(1);

pub(crate) async fn run_listener(bus: Arc<Bus>, listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let bus = Arc::clone(&bus);
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        match accept_async(stream).await {
                            Ok(ws) => serve_connection(bus, ws, peer, shutdown).await,
                            Err(e) => log(
                                Level::Warn,
                                Domain::Bus,
                                "handshake_failed",
                                obj(&[("peer", v_str(&peer.to_string())), ("error", v_str(&e.to_string()))]),
                            ),
                        }
                    });
                }
                Err(e) => log(
                    Level::Warn,
                    Domain::Bus,
                    "accept_failed",
                    obj(&[("error", v_str(&e.to_string()))]),
                ),
            },
            _ = shutdown.changed() => break,
        }
    }
}

#[derive(Default)]
struct Session {
    component_id: Option<String>,
    forwarder: Option<JoinHandle<()>>,
}

impl Session {
    async fn release(&mut self) {
        if let Some(task) = self.forwarder.take() {
            task.abort();
            // wait until the delivery receiver is actually dropped
            let _ = task.await;
        }
    }
}

/// Pump bus deliveries for this peer into the socket writer.
fn spawn_forwarder(mut deliveries: mpsc::Receiver<Envelope>, out: mpsc::Sender<String>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(envelope) = deliveries.recv().await {
            let Ok(text) = serde_json::to_string(&envelope) else {
                continue;
            };
            if out.send(text).await.is_err() {
                break;
            }
        }
    })
}

async fn serve_connection(
    bus: Arc<Bus>,
    ws: WebSocketStream<TcpStream>,
    peer: SocketAddr,
    mut shutdown: watch::Receiver<bool>,
) {
    let (mut sink, mut stream) = ws.split();
    let (out_tx, mut out_rx) = mpsc::channel::<String>(bus.config().connection_capacity.max(1));
    let writer = tokio::spawn(async move {
        while let Some(text) = out_rx.recv().await {
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    log(Level::Debug, Domain::Bus, "connection_opened", obj(&[("peer", v_str(&peer.to_string()))]));
    let mut session = Session::default();
    loop {
        let frame = tokio::select! {
            frame = stream.next() => frame,
            _ = shutdown.changed() => None,
        };
        let Some(frame) = frame else {
            break;
        };
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(_) => continue,
            },
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };
        bus.note_received();
        if let Some(reply) = handle_frame(&bus, &text, &mut session, &out_tx).await {
            if out_tx.send(reply.to_string()).await.is_err() {
                break;
            }
        }
    }

    session.release().await;
    drop(out_tx);
    let _ = tokio::time::timeout(WRITER_DRAIN, writer).await;
    if let Some(id) = &session.component_id {
        bus.detach_closed(id);
    }
    log(
        Level::Debug,
        Domain::Bus,
        "connection_closed",
        obj(&[
            ("peer", v_str(&peer.to_string())),
            ("component_id", session.component_id.as_deref().map(v_str).unwrap_or(Value::Null)),
        ]),
    );
}

/// Returns the frame to send back, if any.
async fn handle_frame(bus: &Bus, text: &str, session: &mut Session, out: &mpsc::Sender<String>) -> Option<Value> {
    let raw: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => return Some(error_response_for(&CoreError::invalid("frame", e.to_string()))),
    };
    if let Some(id) = &session.component_id {
        let _ = bus.heartbeat(id);
    }
    match process_frame(bus, &raw, session, out).await {
        Ok(reply) => reply,
        Err(e) => Some(error_response_for(&e)),
    }
}

async fn process_frame(
    bus: &Bus,
    raw: &Value,
    session: &mut Session,
    out: &mpsc::Sender<String>,
) -> CoreResult<Option<Value>> {
    let kind = validate_frame(raw)?;

    if kind == MessageKind::Register {
        let registration: Registration = serde_json::from_value(raw["payload"].clone())
            .map_err(|e| CoreError::invalid("payload", e.to_string()))?;
        let id = bus.register(registration).await?;
        let deliveries = bus.attach(&id)?;
        session.release().await;
        session.forwarder = Some(spawn_forwarder(deliveries, out.clone()));
        session.component_id = Some(id.clone());

        let options = EnvelopeOptions {
            correlation_id: raw.get("id").and_then(Value::as_str).map(str::to_string),
            ..Default::default()
        };
        let ack = build_envelope(
            BUS_ID,
            &id,
            Payload::event(events::REGISTER_ACK, build_success_response(json!({ "componentId": id }), None)),
            options,
        );
        return Ok(Some(ack.to_value()));
    }

    let envelope: Envelope =
        serde_json::from_value(raw.clone()).map_err(|e| CoreError::invalid("envelope", e.to_string()))?;
    if envelope.to == BUS_ID {
        return Ok(None);
    }
    bus.route(&envelope).await?;
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BusConfig;
    use tokio_tungstenite::connect_async;

    async fn next_json<S>(ws: &mut S) -> Value
    where
        S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(2), ws.next())
                .await
                .expect("frame in time")
                .expect("stream open")
                .expect("frame ok");
            if let Message::Text(text) = msg {
                return serde_json::from_str(&text).unwrap();
            }
        }
    }

    #[tokio::test]
    async fn test_register_ack_and_routing_over_websocket() {
        let config = BusConfig {
            listen_addr: Some("127.0.0.1:0".parse().unwrap()),
            ..BusConfig::default()
        };
        let bus = Arc::new(Bus::new(config).unwrap());
        let addr = bus.start().await.unwrap().unwrap();

        let receiver = bus
            .register(Registration::new("executor", "trading").with_id("exec-1"))
            .await
            .unwrap();
        let mut inbox = bus.attach(&receiver).unwrap();

        let (mut ws, _) = connect_async(format!("ws://{}", addr)).await.unwrap();
        ws.send(Message::Text(
            json!({"id": "reg-1", "type": "register", "payload": {"name": "feed", "type": "data"}}).to_string(),
        ))
        .await
        .unwrap();
        let ack = next_json(&mut ws).await;
        assert_eq!(ack["type"], "event");
        assert_eq!(ack["payload"]["event"], "register-ack");
        assert_eq!(ack["correlationId"], "reg-1");
        let my_id = ack["payload"]["data"]["data"]["componentId"].as_str().unwrap().to_string();
        assert!(bus.is_registered(&my_id));

        // exec-1 heard about the join first
        let joined = inbox.recv().await.unwrap();
        assert_eq!(joined.payload.event_name(), Some("component-joined"));

        ws.send(Message::Text(
            json!({
                "id": "m-1", "from": my_id, "to": "exec-1", "type": "standard",
                "timestamp": crate::now_ms(), "payload": {"symbol": "BTCUSDT", "price": 45000}
            })
            .to_string(),
        ))
        .await
        .unwrap();
        let got = tokio::time::timeout(Duration::from_secs(2), inbox.recv()).await.unwrap().unwrap();
        assert_eq!(got.id, "m-1");
        assert_eq!(got.data().unwrap()["symbol"], "BTCUSDT");

        // bus -> socket direction
        bus.send(&my_id, "exec-1", Payload::Standard(json!({"ack": true})), EnvelopeOptions::default())
            .await
            .unwrap();
        let pushed = next_json(&mut ws).await;
        assert_eq!(pushed["from"], "exec-1");
        assert_eq!(pushed["payload"]["ack"], true);

        bus.shutdown().await;
    }

    #[tokio::test]
    async fn test_malformed_frames_get_error_responses() {
        let config = BusConfig {
            listen_addr: Some("127.0.0.1:0".parse().unwrap()),
            ..BusConfig::default()
        };
        let bus = Arc::new(Bus::new(config).unwrap());
        let addr = bus.start().await.unwrap().unwrap();
        let (mut ws, _) = connect_async(format!("ws://{}", addr)).await.unwrap();

        ws.send(Message::Text("{not json".into())).await.unwrap();
        let resp = next_json(&mut ws).await;
        assert_eq!(resp["success"], false);
        assert_eq!(resp["error"]["code"], "VALIDATION_ERROR");

        ws.send(Message::Text(json!({"type": "standard", "payload": {}}).to_string()))
            .await
            .unwrap();
        let resp = next_json(&mut ws).await;
        let fields: Vec<&str> = resp["error"]["details"]["violations"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|v| v["field"].as_str())
            .collect();
        for f in ["id", "from", "to", "timestamp"] {
            assert!(fields.contains(&f), "missing {} in {:?}", f, fields);
        }

        ws.send(Message::Text(
            json!({"id": "m", "from": "a", "to": "ghost", "type": "standard", "timestamp": 1, "payload": {}})
                .to_string(),
        ))
        .await
        .unwrap();
        let resp = next_json(&mut ws).await;
        assert_eq!(resp["error"]["code"], "COMPONENT_NOT_FOUND");

        bus.shutdown().await;
    }
}
