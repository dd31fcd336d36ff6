//! WebSocket front end for the hub: one hub session per socket.

use std::future::Future;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::Response,
    routing::get,
};
use futures::{sink::SinkExt, stream::StreamExt};
use tokio::net::TcpListener;
use tower_http::trace::{MakeSpan, TraceLayer};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::hub::{Hub, Outbound, Session};

/// Adds a unique request ID to each incoming request's span.
#[derive(Clone)]
struct RequestIdMakeSpan;

impl<B> MakeSpan<B> for RequestIdMakeSpan {
    fn make_span(&mut self, request: &axum::http::Request<B>) -> tracing::Span {
        let request_id = Uuid::new_v4().to_string();
        tracing::info_span!(
            "request",
            method = %request.method(),
            uri = %request.uri(),
            request_id = %request_id,
        )
    }
}

pub fn router(hub: Arc<Hub>) -> Router {
    Router::new()
        .route("/", get(websocket_handler))
        .route("/health", get(health_handler))
        .layer(TraceLayer::new_for_http().make_span_with(RequestIdMakeSpan))
        .with_state(hub)
}

/// Serve the hub on `listener` until `shutdown` resolves.
pub async fn serve(
    listener: TcpListener,
    hub: Arc<Hub>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    axum::serve(listener, router(hub))
        .with_graceful_shutdown(shutdown)
        .await
}

async fn websocket_handler(State(hub): State<Arc<Hub>>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, hub))
}

async fn health_handler(State(hub): State<Arc<Hub>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "sessions": hub.session_count(),
    }))
}

/// Pump one socket until either side goes away or the peer misbehaves.
pub async fn handle_socket(socket: WebSocket, hub: Arc<Hub>) {
    let Session {
        address,
        mut outbound,
    } = hub.attach();
    let (mut ws_sender, mut ws_receiver) = socket.split();

    loop {
        tokio::select! {
            out = outbound.recv() => {
                let frame = match out {
                    Some(Outbound::Message(msg)) => match msg.to_text() {
                        Ok(text) => Message::Text(text.into()),
                        Err(e) => {
                            warn!(address = %address, error = %e, "failed to serialize hub message");
                            continue;
                        }
                    },
                    Some(Outbound::Ping) => Message::Ping(Default::default()),
                    Some(Outbound::Close) | None => break,
                };
                if ws_sender.send(frame).await.is_err() {
                    break;
                }
            }
            incoming = ws_receiver.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if hub.handle_text(&address, text.as_str()).is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => hub.pong(&address),
                    Some(Ok(Message::Ping(_))) => {}
                    Some(Ok(Message::Binary(_))) => {
                        warn!(address = %address, "binary frame on signaling socket, closing");
                        break;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        debug!(address = %address, error = %e, "socket error");
                        break;
                    }
                }
            }
        }
    }

    hub.detach(&address);
    let _ = ws_sender.close().await;
    info!(address = %address, "signaling socket closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use mesh_protocol::{ClientMessage, IceConfiguration, ServerMessage};
    use std::time::Duration;
    use tokio::time::timeout;
    use tokio_tungstenite::tungstenite;
    use tower::ServiceExt;

    const TEST_TIMEOUT: Duration = Duration::from_secs(5);

    type Client = tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >;

    async fn start_hub() -> (std::net::SocketAddr, Arc<Hub>) {
        let hub = Arc::new(Hub::new(IceConfiguration::default()));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve(listener, hub.clone(), std::future::pending()));
        (addr, hub)
    }

    async fn connect(addr: std::net::SocketAddr) -> Client {
        let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/"))
            .await
            .unwrap();
        ws
    }

    async fn next_server_message(ws: &mut Client) -> Option<ServerMessage> {
        loop {
            let frame = timeout(TEST_TIMEOUT, ws.next()).await.ok()??.ok()?;
            match frame {
                tungstenite::Message::Text(text) => {
                    return Some(ServerMessage::parse(text.as_str()).unwrap());
                }
                tungstenite::Message::Close(_) => return None,
                _ => continue,
            }
        }
    }

    async fn send(ws: &mut Client, msg: &ClientMessage) {
        ws.send(tungstenite::Message::Text(msg.to_text().unwrap().into()))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn health_reports_sessions() {
        let hub = Arc::new(Hub::new(IceConfiguration::default()));
        let _session = hub.attach();
        let response = router(hub)
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn sockets_are_bound_in_order_and_relay() {
        let (addr, _hub) = start_hub().await;
        let mut a = connect(addr).await;
        let mut b = connect(addr).await;

        let Some(ServerMessage::Binding { address: a_addr, .. }) = next_server_message(&mut a).await
        else {
            panic!("expected binding for a");
        };
        let Some(ServerMessage::Binding { address: b_addr, .. }) = next_server_message(&mut b).await
        else {
            panic!("expected binding for b");
        };
        assert_eq!(a_addr, "0.0.0.1");
        assert_eq!(b_addr, "0.0.0.2");

        send(
            &mut a,
            &ClientMessage::Forward {
                from: None,
                to: b_addr.clone(),
                data: serde_json::json!({"type": "terminate"}),
            },
        )
        .await;

        match next_server_message(&mut b).await {
            Some(ServerMessage::Forward { from, data, .. }) => {
                assert_eq!(from, a_addr);
                assert_eq!(data["type"], "terminate");
            }
            other => panic!("expected forward, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn malformed_message_closes_socket_and_frees_address() {
        let (addr, hub) = start_hub().await;
        let mut a = connect(addr).await;
        assert!(matches!(
            next_server_message(&mut a).await,
            Some(ServerMessage::Binding { .. })
        ));
        assert_eq!(hub.session_count(), 1);

        a.send(tungstenite::Message::Text("{\"type\":\"nonsense\"}".into()))
            .await
            .unwrap();
        assert!(next_server_message(&mut a).await.is_none());

        timeout(TEST_TIMEOUT, async {
            while hub.session_count() != 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("session was not detached");
    }

    #[tokio::test]
    async fn register_and_lookup_over_socket() {
        let (addr, _hub) = start_hub().await;
        let mut a = connect(addr).await;
        let mut b = connect(addr).await;
        next_server_message(&mut a).await;
        next_server_message(&mut b).await;

        send(
            &mut a,
            &ClientMessage::Register {
                request_id: "r1".into(),
                hostname: "printer".into(),
            },
        )
        .await;
        assert!(matches!(
            next_server_message(&mut a).await,
            Some(ServerMessage::RegisterOk { .. })
        ));

        send(
            &mut b,
            &ClientMessage::Lookup {
                request_id: "l1".into(),
                hostname: "printer".into(),
            },
        )
        .await;
        match next_server_message(&mut b).await {
            Some(ServerMessage::LookupOk { addresses, .. }) => {
                assert_eq!(addresses, vec!["0.0.0.1".to_string()]);
            }
            other => panic!("expected lookup_ok, got {other:?}"),
        }
    }
}
